//! Catalog registry
//!
//! The [`Builder`] is the central object of the library: it accumulates all
//! knowledge about probes, the objects accessible from them and their
//! fields, and then composes a trace program with one of its `build_*`
//! methods. Registration happens once at startup and is append-only;
//! violations there are programmer errors and panic. The catalog is
//! immutable during builds.

use indexmap::IndexMap;

use crate::fields::{FieldGroup, FieldRef};
use crate::object::Object;
use crate::probes::Probe;
use crate::program::{Expression, StructDef};
use crate::template::{CastFunction, CastFunctionMap};
use crate::features::{CoreFeatures, FeatureFlagMask};

/// One slot of the alias index: either a single binding, or the candidate
/// list of a weak alias shared by several groups.
#[derive(Debug, Clone)]
pub(crate) enum AliasEntry {
    Strong(FieldRef),
    Weak(Vec<FieldRef>),
}

/// Catalog of objects, fields, probes and globals a trace program is
/// composed from.
#[derive(Default)]
pub struct Builder {
    pub(crate) objects: IndexMap<String, Object>,

    pub(crate) field_groups: Vec<FieldGroup>,
    pub(crate) row_map: IndexMap<String, Vec<usize>>,
    pub(crate) object_fields: IndexMap<String, Vec<FieldRef>>,
    pub(crate) alias_map: IndexMap<String, AliasEntry>,

    probes: Vec<Probe>,
    probe_map: IndexMap<String, usize>,

    pub(crate) cast_functions: CastFunctionMap,
    pub(crate) global_vars: IndexMap<String, Expression>,
    pub(crate) struct_defs: IndexMap<String, StructDef>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered probes in registration order.
    pub fn probes(&self) -> &[Probe] {
        &self.probes
    }

    /// Registered objects in registration order.
    pub fn objects(&self) -> impl Iterator<Item = &Object> {
        self.objects.values()
    }

    /// Registered field groups in registration order.
    pub fn field_groups(&self) -> &[FieldGroup] {
        &self.field_groups
    }

    /// Looks a probe up by any of its spellings.
    pub fn probe(&self, name: &str) -> Option<&Probe> {
        self.probe_map.get(name).map(|idx| &self.probes[*idx])
    }

    pub fn object(&self, name: &str) -> Option<&Object> {
        self.objects.get(name)
    }

    /// Registers probes and their aliases, deriving `k:`/`kr:` short forms
    /// from `kprobe:`/`kretprobe:` names.
    ///
    /// # Panics
    /// Panics when any spelling is already registered.
    pub fn add_probes(&mut self, probes: Vec<Probe>) {
        for probe in probes {
            let mut names = probe.aliases.clone();
            names.push(probe.name.clone());
            if let Some(func) = probe.name.strip_prefix("kprobe:") {
                names.push(format!("k:{func}"));
            }
            if let Some(func) = probe.name.strip_prefix("kretprobe:") {
                names.push(format!("kr:{func}"));
            }

            let idx = self.probes.len();
            for name in names {
                if self.probe_map.contains_key(&name) {
                    panic!("probe '{name}' is already registered");
                }
                self.probe_map.insert(name, idx);
            }
            self.probes.push(probe);
        }
    }

    /// Registers field groups and indexes their aliases. A duplicate
    /// non-weak alias panics; a weak duplicate turns the slot into a
    /// candidate list resolved later from request context.
    pub fn add_field_groups(&mut self, groups: Vec<FieldGroup>) {
        for group in groups {
            let group_id = self.field_groups.len();

            for (field_id, field) in group.fields.iter().enumerate() {
                let fref = FieldRef {
                    group: group_id,
                    field: field_id,
                };
                self.object_fields
                    .entry(group.object.clone())
                    .or_default()
                    .push(fref);

                let Some(alias) = &field.alias else {
                    continue;
                };
                let alias_name = if group.field_alias_prefix.is_empty() {
                    alias.clone()
                } else {
                    format!("{}-{alias}", group.field_alias_prefix)
                };

                match self.alias_map.get_mut(&alias_name) {
                    None => {
                        self.alias_map.insert(alias_name, AliasEntry::Strong(fref));
                    }
                    Some(entry) => {
                        if !field.weak_alias {
                            panic!("field alias '{alias_name}' is already registered");
                        }
                        match entry {
                            AliasEntry::Strong(old) => {
                                *entry = AliasEntry::Weak(vec![*old, fref]);
                            }
                            AliasEntry::Weak(candidates) => candidates.push(fref),
                        }
                    }
                }
            }

            self.row_map
                .entry(group.row.clone())
                .or_default()
                .push(group_id);
            self.field_groups.push(group);
        }
    }

    /// Stamps multiple field rows from a base group which has everything
    /// but the fields filled in. See [`Builder::add_field_groups`].
    pub fn add_field_group_template(&mut self, base: &FieldGroup, rows: &[Vec<crate::fields::Field>]) {
        for row in rows {
            let group = FieldGroup {
                fields: row.clone(),
                ..base.clone()
            };
            self.add_field_groups(vec![group]);
        }
    }

    /// Registers object descriptions.
    ///
    /// # Panics
    /// Panics on duplicates, and on a sanity filter referring to the object
    /// itself (use a field-based sanity filter instead).
    pub fn add_objects(&mut self, objects: Vec<Object>) {
        for obj in objects {
            if let Some(sanity) = &obj.sanity_filter {
                if !sanity.object.is_empty() && sanity.object == obj.variable {
                    panic!(
                        "object '{}' uses sanity filter referring itself. \
                         Should be replaced with field-based sanity filter",
                        obj.variable
                    );
                }
            }
            if self.objects.contains_key(&obj.variable) {
                panic!("object '{}' is already registered", obj.variable);
            }

            self.objects.insert(obj.variable.clone(), obj);
        }
    }

    /// Merges extra cast recipes into already registered objects, new
    /// sources overriding duplicates.
    ///
    /// # Panics
    /// Panics when the target object is not registered.
    pub fn add_object_casts(&mut self, obj_casts: Vec<Object>) {
        for obj_cast in obj_casts {
            let Some(obj) = self.objects.get_mut(&obj_cast.variable) else {
                panic!("object '{}' is not registered", obj_cast.variable);
            };
            for (src, template) in obj_cast.casts {
                obj.casts.insert(src, template);
            }
        }
    }

    /// Registers a named zero-argument function accessible from cast
    /// templates. Re-registration replaces the previous function.
    pub fn add_cast_function(
        &mut self,
        name: impl Into<String>,
        f: impl Fn() -> anyhow::Result<String> + 'static,
    ) {
        self.cast_functions
            .insert(name.into(), std::rc::Rc::new(f) as CastFunction);
    }

    /// Initializes version-dependent codegen from the host bpftrace mask.
    /// Currently this wires the `StructKeyword` template function.
    pub fn set_features(&mut self, mask: &FeatureFlagMask, features: &CoreFeatures) {
        let keyword = if mask.supports(features.struct_keyword) {
            "struct "
        } else {
            ""
        };
        self.add_cast_function("StructKeyword", move || Ok(keyword.to_string()));
    }

    /// Registers globally available variables and the expressions fetching
    /// them.
    ///
    /// # Panics
    /// Panics on duplicate variable names.
    pub fn add_global_vars(&mut self, vars: impl IntoIterator<Item = (String, Expression)>) {
        for (name, expr) in vars {
            if self.global_vars.contains_key(&name) {
                panic!("global variable '{name}' is already registered");
            }
            self.global_vars.insert(name, expr);
        }
    }

    /// Registers a struct type definition text. Re-registering the same
    /// text is a no-op.
    ///
    /// # Panics
    /// Panics when the name is already registered with different text.
    pub fn add_struct_def(&mut self, type_name: &str, raw_text: &str) {
        if let Some(old) = self.struct_defs.get(type_name) {
            if old.raw_text() == raw_text {
                return;
            }
            panic!("struct definition '{type_name}' is already registered");
        }

        self.struct_defs
            .insert(type_name.to_string(), StructDef::new(type_name, raw_text));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::Field;
    use crate::filter::Filter;

    #[test]
    fn test_probe_short_forms() {
        let mut b = Builder::new();
        b.add_probes(vec![
            Probe {
                name: "kprobe:dev_queue_xmit".to_string(),
                aliases: vec!["xmit".to_string()],
                ..Default::default()
            },
            Probe {
                name: "kretprobe:tcp_sendmsg".to_string(),
                ..Default::default()
            },
        ]);

        assert!(b.probe("xmit").is_some());
        assert!(b.probe("kprobe:dev_queue_xmit").is_some());
        assert!(b.probe("k:dev_queue_xmit").is_some());
        assert!(b.probe("kr:tcp_sendmsg").is_some());
        assert!(b.probe("recv").is_none());
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_duplicate_probe_panics() {
        let mut b = Builder::new();
        let probe = Probe {
            name: "kprobe:ip_rcv".to_string(),
            ..Default::default()
        };
        b.add_probes(vec![probe.clone(), probe]);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_duplicate_object_panics() {
        let mut b = Builder::new();
        let obj = Object {
            variable: "$skb".to_string(),
            ..Default::default()
        };
        b.add_objects(vec![obj.clone(), obj]);
    }

    #[test]
    #[should_panic(expected = "sanity filter referring itself")]
    fn test_self_referencing_sanity_filter_panics() {
        let mut b = Builder::new();
        b.add_objects(vec![Object {
            variable: "$iph".to_string(),
            sanity_filter: Some(Filter::new("$iph", "protocol", "==", "6")),
            ..Default::default()
        }]);
    }

    #[test]
    #[should_panic(expected = "field alias 'src' is already registered")]
    fn test_duplicate_strong_alias_panics() {
        let mut b = Builder::new();
        let group = |obj: &str| FieldGroup {
            object: obj.to_string(),
            row: obj.trim_start_matches('$').to_string(),
            fields: vec![Field {
                alias: Some("src".to_string()),
                ..Field::named("saddr")
            }],
            ..Default::default()
        };
        b.add_field_groups(vec![group("$iph"), group("$ipv6h")]);
    }

    #[test]
    fn test_add_object_casts_merge() {
        let mut b = Builder::new();
        b.add_objects(vec![Object {
            variable: "$skb".to_string(),
            casts: IndexMap::from([("skb".to_string(), "{{ .Dst }} = {{ .Src }}".to_string())]),
            ..Default::default()
        }]);
        b.add_object_casts(vec![Object {
            variable: "$skb".to_string(),
            casts: IndexMap::from([
                ("skb".to_string(), "{{ .Dst }} = (sk_buff*) {{ .Src }}".to_string()),
                ("$pskb".to_string(), "{{ .Dst }} = *{{ .Src }}".to_string()),
            ]),
            ..Default::default()
        }]);

        let obj = b.object("$skb").unwrap();
        assert_eq!(obj.casts.len(), 2);
        assert_eq!(obj.casts["skb"], "{{ .Dst }} = (sk_buff*) {{ .Src }}");
    }

    #[test]
    #[should_panic(expected = "is not registered")]
    fn test_object_casts_unknown_object_panics() {
        let mut b = Builder::new();
        b.add_object_casts(vec![Object {
            variable: "$skb".to_string(),
            ..Default::default()
        }]);
    }

    #[test]
    fn test_struct_def_identical_reregistration() {
        let mut b = Builder::new();
        b.add_struct_def("tcphdr", "uint16 source;");
        b.add_struct_def("tcphdr", "uint16 source;");
        assert_eq!(b.struct_defs.len(), 1);
    }

    #[test]
    #[should_panic(expected = "struct definition 'tcphdr' is already registered")]
    fn test_struct_def_conflicting_reregistration() {
        let mut b = Builder::new();
        b.add_struct_def("tcphdr", "uint16 source;");
        b.add_struct_def("tcphdr", "uint16 dest;");
    }

    #[test]
    fn test_field_group_template() {
        let mut b = Builder::new();
        let base = FieldGroup {
            object: "$iph".to_string(),
            row: "ip".to_string(),
            ..Default::default()
        };
        b.add_field_group_template(
            &base,
            &[
                vec![Field::named("ttl")],
                vec![Field::named("protocol"), Field::named("saddr")],
            ],
        );

        assert_eq!(b.field_groups().len(), 2);
        assert_eq!(b.row_map["ip"].len(), 2);

        // Wrapped base groups prefix the row and aliases.
        let inner = base.wrap("$in_iph", "inner");
        assert_eq!(inner.row, "inner-ip");
        assert_eq!(inner.object, "$in_iph");
        assert_eq!(inner.field_alias_prefix, "inner");
    }

    #[test]
    fn test_wrapped_alias_prefix() {
        let mut b = Builder::new();
        let base = FieldGroup {
            object: "$iph".to_string(),
            row: "ip".to_string(),
            ..Default::default()
        };
        let fields = vec![vec![Field {
            alias: Some("src".to_string()),
            ..Field::named("saddr")
        }]];
        b.add_field_group_template(&base, &fields);
        b.add_field_group_template(&base.wrap("$in_iph", "inner"), &fields);

        assert!(b.alias_map.contains_key("src"));
        assert!(b.alias_map.contains_key("inner-src"));
    }

    #[test]
    #[should_panic(expected = "global variable 'tid' is already registered")]
    fn test_duplicate_global_panics() {
        let mut b = Builder::new();
        b.add_global_vars([("tid".to_string(), Expression::from("tid"))]);
        b.add_global_vars([("tid".to_string(), Expression::from("tid"))]);
    }
}
