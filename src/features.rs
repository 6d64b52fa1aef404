//! Feature gate
//!
//! External components (the kernel, bpftrace, vendor modules) gain
//! capabilities over time; generated scripts must only use what the host
//! supports. Features are registered once into an explicit
//! [`FeatureRegistry`] owned by the composition root, then a
//! [`FeatureComponentSpec`] turns a detected (or overridden) component
//! version plus an optional force-override string into a
//! [`FeatureFlagMask`] queried by all later code selection.

use anyhow::{anyhow, bail};
use indexmap::IndexMap;

use crate::version::{Version, VersionProvider};

/// Component a feature is implemented by. `External` is reserved for
/// commands built on top of the library which ship customized kernel
/// modules versioned separately from the kernel itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureComponent {
    Kernel,
    Bpftrace,
    External,
}

pub const FEATURE_COMPONENT_COUNT: usize = 3;

impl FeatureComponent {
    fn index(self) -> usize {
        match self {
            FeatureComponent::Kernel => 0,
            FeatureComponent::Bpftrace => 1,
            FeatureComponent::External => 2,
        }
    }
}

/// Static description of a feature: the component that provides it, the
/// name used in override masks, and the minimum version supporting it.
#[derive(Debug, Clone)]
pub struct FeatureDef {
    pub component: FeatureComponent,
    pub name: &'static str,
    pub help: &'static str,

    /// Commit which introduced the feature upstream, for documentation.
    pub commit: &'static str,
    pub min_version: Version,
}

/// Handle of a registered feature. Only minted by
/// [`FeatureRegistry::register`]; the bit position is assigned at
/// registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Feature {
    component: FeatureComponent,
    flag: u32,
}

impl Feature {
    pub fn component(self) -> FeatureComponent {
        self.component
    }
}

/// Registry of known features, built once before any build runs.
#[derive(Debug, Default)]
pub struct FeatureRegistry {
    components: [Vec<FeatureDef>; FEATURE_COMPONENT_COUNT],
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a feature and assigns its mask bit.
    ///
    /// # Panics
    /// Panics on a duplicate feature name within the component, or if the
    /// component runs out of mask bits.
    pub fn register(&mut self, def: FeatureDef) -> Feature {
        let component = def.component;
        let list = &mut self.components[component.index()];
        if list.iter().any(|known| known.name == def.name) {
            panic!("feature '{}' is already registered", def.name);
        }

        let flag = u32::try_from(list.len()).expect("feature count") + 1;
        assert!(flag < 128, "too many features registered for {component:?}");
        list.push(def);
        Feature { component, flag }
    }

    /// Known features of a component, in registration order.
    pub fn known(&self, component: FeatureComponent) -> &[FeatureDef] {
        &self.components[component.index()]
    }
}

/// Bitmask of supported features for one component.
#[derive(Debug, Clone, Copy)]
pub struct FeatureFlagMask {
    component: FeatureComponent,
    bits: u128,
}

impl FeatureFlagMask {
    /// Mask with every feature disabled; useful in tests and as a safe
    /// placeholder before detection runs.
    pub fn empty(component: FeatureComponent) -> Self {
        Self { component, bits: 0 }
    }

    /// Whether the feature is supported under this mask.
    ///
    /// # Panics
    /// Panics when asked about a feature of a different component: that is
    /// a wiring bug in the caller, not a runtime condition.
    pub fn supports(&self, feature: Feature) -> bool {
        assert!(
            feature.component == self.component,
            "feature mask of {:?} queried for a feature of {:?}",
            self.component,
            feature.component
        );
        self.bits & (1u128 << feature.flag) != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForcedState {
    Enable,
    Disable,
}

/// Binds a component to the provider used to detect its version.
pub struct FeatureComponentSpec {
    pub component: FeatureComponent,
    pub provider: Box<dyn VersionProvider>,
}

impl FeatureComponentSpec {
    /// Produces the feature mask for the current setup.
    ///
    /// The version comes from the provider unless `version_arg` is
    /// non-empty, in which case the provider parses the override text.
    /// `mask_arg` force-enables listed features (or force-disables when
    /// prefixed with `!`), skipping the version comparison; names that
    /// match no registered feature fail mask computation.
    pub fn process_features(
        &self,
        registry: &FeatureRegistry,
        version_arg: &str,
        mask_arg: &str,
    ) -> anyhow::Result<FeatureFlagMask> {
        let ver = self.get_version(version_arg)?;

        let mut forced = if mask_arg.is_empty() {
            IndexMap::new()
        } else {
            parse_mask_argument(mask_arg)?
        };

        let mut bits = 0u128;
        for (i, def) in registry.known(self.component).iter().enumerate() {
            let flag = i as u32 + 1;
            match forced.shift_remove(def.name) {
                Some(ForcedState::Enable) => {
                    bits |= 1u128 << flag;
                    continue;
                }
                Some(ForcedState::Disable) => continue,
                None => {}
            }

            if ver >= def.min_version {
                bits |= 1u128 << flag;
            }
        }

        if !forced.is_empty() {
            bail!(
                "unrecognized features specified in mask: {}",
                forced.keys().cloned().collect::<Vec<_>>().join(",")
            );
        }

        tracing::debug!(component = ?self.component, version = %ver, "computed feature mask");
        Ok(FeatureFlagMask {
            component: self.component,
            bits,
        })
    }

    fn get_version(&self, version_arg: &str) -> anyhow::Result<Version> {
        if !version_arg.is_empty() {
            return self.provider.parse(version_arg);
        }

        match self.provider.get() {
            Ok(text) => self.provider.parse(&text),
            Err(err) => {
                // The component may be absent on the build host; scripts can
                // still be composed against the conservative default.
                tracing::warn!(component = ?self.component, error = %err,
                    "version detection failed, falling back to default");
                Ok(self.provider.default_version())
            }
        }
    }
}

fn parse_mask_argument(mask_arg: &str) -> anyhow::Result<IndexMap<String, ForcedState>> {
    let mut state_map = IndexMap::new();
    for token in mask_arg.split(',') {
        let (name, state) = match token.strip_prefix('!') {
            Some(rest) => (rest, ForcedState::Disable),
            None => (token, ForcedState::Enable),
        };

        if state_map.insert(name.to_string(), state).is_some() {
            return Err(anyhow!(
                "cannot parse feature mask: feature {name:?} is already specified"
            ));
        }
    }
    Ok(state_map)
}

/// Features of the bpftrace language the builder itself gates on.
#[derive(Debug, Clone, Copy)]
pub struct CoreFeatures {
    /// Casts require a `struct ` keyword prefix since 0.9.4.
    pub struct_keyword: Feature,
    /// `bswap()` builtin for byte-order conversions.
    pub bswap: Feature,
    /// Builtin integer type conversions such as `(uint16)`.
    pub builtin_types: Feature,
}

impl CoreFeatures {
    pub fn register(registry: &mut FeatureRegistry) -> Self {
        Self {
            struct_keyword: registry.register(FeatureDef {
                component: FeatureComponent::Bpftrace,
                name: "struct",
                help: "Cast expressions accept the struct keyword",
                commit: "",
                min_version: Version::new(0, 9, 4),
            }),
            bswap: registry.register(FeatureDef {
                component: FeatureComponent::Bpftrace,
                name: "bswap",
                help: "Allows to use bswap in byte-swapping operations",
                commit: "1972e897da6ecb060a6e114e25dd1577e41dee47",
                min_version: Version::new(0, 15, 0),
            }),
            builtin_types: registry.register(FeatureDef {
                component: FeatureComponent::Bpftrace,
                name: "builtin_type",
                help: "Allows to use builtin type conversions",
                commit: "5dd033c7c76dbe2557a64c204b336e65712c1ce8",
                min_version: Version::new(0, 17, 0),
            }),
        }
    }
}
