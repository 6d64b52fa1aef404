//! Component versions and their providers
//!
//! Feature support is decided by comparing the detected version of an
//! external component (bpftrace, the kernel) against per-feature minimums.
//! Versions have up to five numeric groups compared most-significant-first;
//! vendor builds append a build number and date without altering the
//! upstream triple.

use std::fmt;
use std::process::Command;
use std::sync::LazyLock;

use anyhow::{anyhow, Context};
use regex::Regex;

/// Version of an external component.
///
/// Ordering is derived, so fields compare in declaration order:
/// major, submajor, minor, then build number and build date.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub submajor: u32,
    pub minor: u32,

    pub build: u32,
    pub date: u32,
}

impl Version {
    pub const fn new(major: u32, submajor: u32, minor: u32) -> Self {
        Self {
            major,
            submajor,
            minor,
            build: 0,
            date: 0,
        }
    }

    /// Fills version components from regex captures in significance order.
    /// Missing trailing groups stay zero.
    pub fn from_captures(caps: &regex::Captures<'_>) -> anyhow::Result<Self> {
        let mut ver = Version::default();
        let slots: [&mut u32; 5] = [
            &mut ver.major,
            &mut ver.submajor,
            &mut ver.minor,
            &mut ver.build,
            &mut ver.date,
        ];
        for (i, slot) in slots.into_iter().enumerate() {
            match caps.get(i + 1) {
                Some(m) => {
                    *slot = m
                        .as_str()
                        .parse()
                        .with_context(|| format!("error parsing version component #{i}"))?;
                }
                None => break,
            }
        }
        Ok(ver)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.submajor, self.minor)?;
        if self.build > 0 {
            write!(f, "-{}", self.build)?;
            if self.date > 0 {
                write!(f, ".{:06}", self.date)?;
            }
        }
        Ok(())
    }
}

/// Source of a component version string.
///
/// The default implementations query the live component; when the operator
/// supplies an explicit version argument, the same `parse` is applied to it.
pub trait VersionProvider {
    /// Queries the component for its raw version text.
    fn get(&self) -> anyhow::Result<String>;

    /// Parses raw version text into a [`Version`].
    fn parse(&self, text: &str) -> anyhow::Result<Version>;

    /// Conservative fallback when the component cannot be queried.
    fn default_version(&self) -> Version;
}

static RE_BPFTRACE_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"bpftrace \D*(\d+)\.(\d+)\.(\d+)(?:-(\d+))?(?:\.(\d+))?").expect("bpftrace version regex")
});

/// Queries `bpftrace -V` on the local host.
#[derive(Debug, Clone)]
pub struct BpftraceVersionProvider {
    pub binary: String,
}

impl Default for BpftraceVersionProvider {
    fn default() -> Self {
        Self {
            binary: "bpftrace".to_string(),
        }
    }
}

impl VersionProvider for BpftraceVersionProvider {
    fn get(&self) -> anyhow::Result<String> {
        let out = Command::new(&self.binary)
            .arg("-V")
            .output()
            .with_context(|| format!("error running '{} -V'", self.binary))?;
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    fn parse(&self, text: &str) -> anyhow::Result<Version> {
        let caps = RE_BPFTRACE_VERSION
            .captures(text)
            .ok_or_else(|| anyhow!("cannot find bpftrace version in {:?}", text))?;
        Version::from_captures(&caps)
    }

    fn default_version(&self) -> Version {
        Version::new(0, 9, 2)
    }
}

static RE_KERNEL_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\.(\d+)\.(\d+)").expect("kernel version regex"));

/// Reads the running kernel release via `uname(2)`.
#[derive(Debug, Clone, Default)]
pub struct KernelVersionProvider;

impl VersionProvider for KernelVersionProvider {
    fn get(&self) -> anyhow::Result<String> {
        let uts = nix::sys::utsname::uname().context("uname failed")?;
        Ok(uts.release().to_string_lossy().into_owned())
    }

    fn parse(&self, text: &str) -> anyhow::Result<Version> {
        let caps = RE_KERNEL_VERSION.captures(text).ok_or_else(|| {
            anyhow!(
                "not enough numeric components in version {:?}, at least 3 are needed",
                text
            )
        })?;
        Version::from_captures(&caps)
    }

    fn default_version(&self) -> Version {
        Version::new(4, 14, 0)
    }
}
