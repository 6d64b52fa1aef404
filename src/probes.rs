//! Probe descriptors
//!
//! A probe is a named attachment point supplying the initial variable
//! bindings (raw positional arguments) everything else is cast from.

use std::error::Error as StdError;

use indexmap::IndexMap;

use crate::builder::Builder;
use crate::errors::{BuildError, ErrorLevel, Result, MSG_NOT_FOUND, MSG_NOT_SPECIFIED};
use crate::filter::ProcessedFilter;
use crate::program::{BlockId, Program};

/// Probe description registered into a [`Builder`].
#[derive(Debug, Clone, Default)]
pub struct Probe {
    /// Name of the probe in bpftrace format of "provider:name".
    pub name: String,

    /// Alias spellings accepted in requests.
    pub aliases: Vec<String>,

    /// Maps informal argument names to raw positional expressions
    /// such as `arg0`.
    pub args: IndexMap<String, String>,

    /// Explicit return probe name. When unset, `kprobe:` probes derive
    /// their `kretprobe:` counterpart.
    pub return_probe: Option<String>,

    /// Help string shown by probe listings.
    pub help: String,
}

impl Probe {
    pub fn is_tracepoint(&self) -> bool {
        self.name.starts_with("tracepoint:")
    }

    /// Name of the probe fired on return from this attachment point.
    pub fn return_probe_name(&self) -> Result<String> {
        if let Some(name) = &self.return_probe {
            return Ok(name.clone());
        }
        if let Some(func) = self.name.strip_prefix("kprobe:") {
            return Ok(format!("kretprobe:{func}"));
        }

        Err(BuildError::new(
            ErrorLevel::Probe,
            &self.name,
            "probe has no return counterpart",
        ))
    }
}

pub(crate) fn probe_build_error(
    probe_name: impl Into<String>,
    cause: impl Into<Box<dyn StdError + Send + Sync>>,
) -> BuildError {
    BuildError::with_cause(
        ErrorLevel::Probe,
        probe_name,
        "error building probe",
        cause,
    )
}

impl Builder {
    /// Adds a top-level block for the probe, wrapped into the supplied
    /// filters. Returns the probe block and the innermost filtered block.
    pub(crate) fn add_probe_block(
        &self,
        prog: &mut Program,
        probe_name: &str,
        is_return: bool,
        filters: &[Vec<ProcessedFilter>],
    ) -> Result<(BlockId, BlockId)> {
        if probe_name.is_empty() {
            return Err(BuildError::new(ErrorLevel::Probe, "", MSG_NOT_SPECIFIED));
        }

        let probe = self
            .probe(probe_name)
            .ok_or_else(|| BuildError::new(ErrorLevel::Probe, probe_name, MSG_NOT_FOUND))?;

        let preamble = if is_return {
            probe.return_probe_name()?
        } else {
            probe.name.clone()
        };

        let probe_block = prog.add_probe_block(preamble, Some(probe));
        let block = self.wrap_filters(prog, probe_block, filters)?;
        Ok((probe_block, block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_return_probe_name() {
        let probe = Probe {
            name: "kprobe:tcp_sendmsg".to_string(),
            ..Default::default()
        };
        assert_eq!(probe.return_probe_name().unwrap(), "kretprobe:tcp_sendmsg");

        let probe = Probe {
            name: "kprobe:tcp_sendmsg".to_string(),
            return_probe: Some("kprobe:tcp_sendmsg_locked".to_string()),
            ..Default::default()
        };
        assert_eq!(
            probe.return_probe_name().unwrap(),
            "kprobe:tcp_sendmsg_locked"
        );

        let probe = Probe {
            name: "tracepoint:skb:kfree_skb".to_string(),
            ..Default::default()
        };
        let err = probe.return_probe_name().unwrap_err();
        assert_eq!(err.level(), ErrorLevel::Probe);
    }
}
