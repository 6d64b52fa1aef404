//! Objects and cast resolution
//!
//! An object is a typed variable reachable within a probe: the packet
//! buffer, a header derived from it, the owning device. Objects declare how
//! they are inferred from other objects (cast recipes) and which guards must
//! hold before their contents can be trusted (sanity filters). The resolver
//! finds a minimal cast chain from what a scope already has (probe
//! arguments and previously materialized objects) to the requested object.

use indexmap::IndexMap;

use crate::builder::Builder;
use crate::errors::{BuildError, ErrorLevel, Result, MSG_NOT_FOUND};
use crate::filter::Filter;
use crate::program::{BlockId, Program, Statement};
use crate::template::CastTemplate;

/// Object description registered into a [`Builder`].
#[derive(Debug, Clone, Default)]
pub struct Object {
    /// Name of the variable used for this object.
    pub variable: String,

    /// Include files required for the type to be available in the script.
    pub header_files: Vec<String>,

    /// Names of registered struct definitions to embed.
    pub struct_defs: Vec<String>,

    /// Guard over another object's field which must hold before this
    /// object's contents are valid.
    pub sanity_filter: Option<Filter>,

    /// Maps source names this object is inferrable from to cast templates.
    /// Declaration order is the tie-break among equally short cast paths.
    pub casts: IndexMap<String, String>,
}

/// One hop of a resolved cast chain.
#[derive(Debug, Clone)]
struct ObjectCast {
    /// Source expression: a variable name or a raw probe argument.
    src: String,
    /// Registered object behind the source, when there is one.
    src_obj: Option<String>,
    /// Destination variable, always a registered object.
    dst: String,
    template: String,
}

impl Builder {
    /// Returns a block which has the object in its context: either an
    /// already-built scope that materializes it, or the given block extended
    /// with the casts (and sanity-filter scopes) needed to infer it.
    pub(crate) fn block_with_object(
        &self,
        prog: &mut Program,
        block: BlockId,
        obj_name: &str,
    ) -> Result<BlockId> {
        // Objectless fields live in the top-level block.
        if obj_name.is_empty() {
            return Ok(block);
        }

        // Special case for tracepoint: probes - allow to dump their args.
        if obj_name == "args" {
            let probe_name = prog.probe(block).map(|p| p.name.clone()).unwrap_or_default();
            if !probe_name.starts_with("tracepoint:") {
                return Err(BuildError::new(
                    ErrorLevel::Probe,
                    probe_name,
                    "probe is not a tracepoint, hence it cannot have args",
                ));
            }
            return Ok(block);
        }

        // Reuse a scope that already built the cast. This might reorder
        // print statements relative to the request, which is acceptable.
        if let Some(found) = prog.find_block_with_object(block, obj_name) {
            return Ok(found);
        }

        let obj = self
            .object(obj_name)
            .ok_or_else(|| BuildError::new(ErrorLevel::Object, obj_name, MSG_NOT_FOUND))?;

        let path = self.find_cast_path(prog, block, obj, &mut Vec::new())?;
        let path = match path {
            Some(path) if !path.is_empty() => path,
            _ => {
                return Err(BuildError::new(
                    ErrorLevel::Object,
                    obj_name,
                    "cannot be inferred from context",
                ))
            }
        };
        tracing::debug!(object = obj_name, hops = path.len(), "resolved cast path");

        // Walk the chain innermost-source first. Each destination's guards
        // wrap the scope before its cast lands, so everything nested below
        // inherits them through the block context.
        let mut block = block;
        let mut last_src = None;
        for cast in path.iter().rev() {
            let dst_obj = self
                .object(&cast.dst)
                .expect("cast destination is a registered object");

            if let Some(sanity) = &dst_obj.sanity_filter {
                block = self.wrap_object_sanity_filters(prog, block, sanity)?;
            }

            self.add_struct_defs_and_headers(prog, dst_obj)?;

            let stmt = self.build_cast_statement(cast).map_err(|err| {
                BuildError::with_cause(
                    ErrorLevel::Object,
                    obj_name,
                    format!(
                        "error in template for cast from '{}' to '{}'",
                        cast.src, cast.dst
                    ),
                    err,
                )
            })?;
            prog.add(block, stmt);

            // Avoid printing invalid data: wrap everything below into the
            // per-field sanity filters of the object just materialized.
            let sanity_filters = self.process_field_sanity_filters(&cast.dst);
            block = self
                .add_filter_block(prog, block, &sanity_filters)
                .map_err(|err| {
                    BuildError::with_cause(
                        ErrorLevel::Object,
                        obj_name,
                        "cannot build per-field sanity filters",
                        err,
                    )
                })?;

            // Register the variable in context only after its guards.
            prog.add_to_context(block, cast.dst.clone());
            last_src = cast.src_obj.clone();
        }

        if let Some(src_name) = last_src {
            if let Some(src_obj) = self.object(&src_name) {
                self.add_struct_defs_and_headers(prog, src_obj)?;
            }
        }

        Ok(block)
    }

    /// Wraps the block into an object-level sanity filter, materializing the
    /// referenced object first.
    fn wrap_object_sanity_filters(
        &self,
        prog: &mut Program,
        block: BlockId,
        filter: &Filter,
    ) -> Result<BlockId> {
        let block = self.block_with_object(prog, block, &filter.object)?;
        let chunk = self.process_filter(filter)?;
        self.add_filter_block(prog, block, &chunk)
    }

    fn add_struct_defs_and_headers(&self, prog: &mut Program, obj: &Object) -> Result<()> {
        for header_file in &obj.header_files {
            prog.add_header_file(header_file.clone());
        }
        for type_name in &obj.struct_defs {
            let def = self
                .struct_defs
                .get(type_name)
                .ok_or_else(|| BuildError::new(ErrorLevel::StructDef, type_name, MSG_NOT_FOUND))?;
            prog.add_struct_def(def.clone());
        }
        Ok(())
    }

    /// Renders a cast template into the statement converting source to
    /// destination.
    fn build_cast_statement(&self, cast: &ObjectCast) -> anyhow::Result<Statement> {
        let tmpl = CastTemplate::parse(&cast.template)?;
        let text = tmpl.render(&cast.src, &cast.dst, &self.cast_functions)?;
        Ok(Statement::text(text))
    }

    /// Searches for the shortest cast chain to `obj`. Sources directly bound
    /// from probe arguments or already present in the scope context win over
    /// sources needing further casts; among equals, declaration order of the
    /// cast table decides. Cycles are broken by the `visited` set.
    fn find_cast_path(
        &self,
        prog: &Program,
        block: BlockId,
        obj: &Object,
        visited: &mut Vec<String>,
    ) -> Result<Option<Vec<ObjectCast>>> {
        let probe_args = prog.probe(block).map(|p| &p.args);

        for (src, template) in &obj.casts {
            // The source is present in probe arguments (this replaces the
            // name with the raw argument expression).
            if let Some(arg) = probe_args.and_then(|args| args.get(src)) {
                return Ok(Some(vec![ObjectCast {
                    src: arg.clone(),
                    src_obj: Some(src.clone()),
                    dst: obj.variable.clone(),
                    template: template.clone(),
                }]));
            }

            // The source is already materialized in the scope.
            if prog.context_of(block).contains(src) {
                return Ok(Some(vec![ObjectCast {
                    src: src.clone(),
                    src_obj: Some(src.clone()),
                    dst: obj.variable.clone(),
                    template: template.clone(),
                }]));
            }
        }

        for (src, template) in &obj.casts {
            // Avoid looping in casts if we already tried this object.
            if visited.iter().any(|v| v == src) {
                continue;
            }

            let src_obj = self.object(src).ok_or_else(|| {
                BuildError::new(ErrorLevel::Object, src, "unexpected source in cast")
            })?;

            visited.push(src.clone());
            let tail = self
                .find_cast_path(prog, block, src_obj, visited)
                .map_err(|err| {
                    BuildError::with_cause(ErrorLevel::Object, &obj.variable, "cast error", err)
                })?;

            if let Some(mut tail) = tail {
                let mut path = vec![ObjectCast {
                    src: src.clone(),
                    src_obj: Some(src.clone()),
                    dst: obj.variable.clone(),
                    template: template.clone(),
                }];
                path.append(&mut tail);
                return Ok(Some(path));
            }

            visited.pop();
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::*;
    use crate::fields::{Field, FieldGroup};
    use crate::probes::Probe;

    const DEFAULT_CAST_TMPL: &str = "{{ .Dst }} = {{ .Src }}";

    fn objects_ab() -> Vec<Object> {
        vec![
            Object {
                variable: "a".to_string(),
                ..Default::default()
            },
            Object {
                variable: "$a".to_string(),
                casts: IndexMap::from([("a".to_string(), DEFAULT_CAST_TMPL.to_string())]),
                ..Default::default()
            },
            Object {
                variable: "$b".to_string(),
                casts: IndexMap::from([("$a".to_string(), DEFAULT_CAST_TMPL.to_string())]),
                ..Default::default()
            },
        ]
    }

    fn test_probe() -> Probe {
        Probe {
            args: IndexMap::from([
                ("a".to_string(), "arg0".to_string()),
                ("c".to_string(), "arg1".to_string()),
            ]),
            ..Default::default()
        }
    }

    #[test]
    fn test_cast_from_arg() {
        let mut b = Builder::new();
        b.add_objects(objects_ab());

        let mut prog = Program::new();
        let block = prog.add_probe_block("", Some(&test_probe()));
        let block2 = b.block_with_object(&mut prog, block, "$a").unwrap();

        assert_eq!(block2, block);
        assert_eq!(
            prog.statements(block2),
            &[Statement::text("$a = arg0")]
        );
    }

    #[test]
    fn test_cast_from_arg_twice() {
        let mut b = Builder::new();
        b.add_objects(objects_ab());

        let mut prog = Program::new();
        let block = prog.add_probe_block("", Some(&test_probe()));
        let block2 = b.block_with_object(&mut prog, block, "$b").unwrap();

        assert_eq!(block2, block);
        assert_eq!(
            prog.statements(block2),
            &[Statement::text("$a = arg0"), Statement::text("$b = $a")]
        );
    }

    #[test]
    fn test_cast_reuse_block() {
        let mut b = Builder::new();
        b.add_objects(objects_ab());

        let mut prog = Program::new();
        let block = prog.add_probe_block("", Some(&test_probe()));

        let block2 = b.block_with_object(&mut prog, block, "$a").unwrap();
        let block3 = b.block_with_object(&mut prog, block, "$a").unwrap();

        assert_eq!(block2, block);
        assert_eq!(block3, block);
        assert_eq!(
            prog.statements(block),
            &[Statement::text("$a = arg0")]
        );
    }

    #[test]
    fn test_cast_no_path() {
        let mut b = Builder::new();
        b.add_objects(objects_ab());

        let mut prog = Program::new();
        let block = prog.add_probe_block("", Some(&test_probe()));
        let err = b.block_with_object(&mut prog, block, "$c").unwrap_err();
        assert_eq!(err.level(), ErrorLevel::Object);
        assert_eq!(err.message(), MSG_NOT_FOUND);
    }

    #[test]
    fn test_cast_loop_fails() {
        let mut b = Builder::new();
        b.add_objects(vec![
            Object {
                variable: "$a".to_string(),
                casts: IndexMap::from([("$b".to_string(), DEFAULT_CAST_TMPL.to_string())]),
                ..Default::default()
            },
            Object {
                variable: "$b".to_string(),
                casts: IndexMap::from([("$a".to_string(), DEFAULT_CAST_TMPL.to_string())]),
                ..Default::default()
            },
        ]);

        let mut prog = Program::new();
        let block = prog.add_probe_block("", Some(&Probe::default()));
        let err = b.block_with_object(&mut prog, block, "$a").unwrap_err();
        assert_eq!(err.message(), "cannot be inferred from context");
    }

    #[test]
    fn test_cast_object_sanity_filter() {
        let mut b = Builder::new();
        b.add_objects(objects_ab());
        b.add_field_groups(vec![FieldGroup {
            object: "$a".to_string(),
            fields: vec![Field::named("a1")],
            ..Default::default()
        }]);
        b.add_objects(vec![Object {
            variable: "$c".to_string(),
            sanity_filter: Some(Filter::new("$a", "a1", "==", "1")),
            casts: IndexMap::from([("c".to_string(), DEFAULT_CAST_TMPL.to_string())]),
            ..Default::default()
        }]);
        let mut prog = Program::new();
        let block = prog.add_probe_block("", Some(&test_probe()));
        let block2 = b.block_with_object(&mut prog, block, "$c").unwrap();

        assert_ne!(block2, block);
        assert_eq!(
            prog.statements(block),
            &[Statement::text("$a = arg0"), Statement::Block(block2)]
        );
        assert_eq!(prog.preamble(block2), "if ($a->a1 == 1)");
        assert_eq!(
            prog.statements(block2),
            &[Statement::text("$c = arg1")]
        );
        assert!(prog.context_contains(block2, "$c"));
    }

    #[test]
    fn test_direct_source_preferred_over_chain() {
        // $x is castable from $b (needs a chain) and from the probe
        // argument a; the direct source must win even though it is
        // declared second.
        let mut b = Builder::new();
        b.add_objects(objects_ab());
        b.add_objects(vec![Object {
            variable: "$x".to_string(),
            casts: IndexMap::from([
                ("$b".to_string(), DEFAULT_CAST_TMPL.to_string()),
                ("a".to_string(), DEFAULT_CAST_TMPL.to_string()),
            ]),
            ..Default::default()
        }]);

        let mut prog = Program::new();
        let block = prog.add_probe_block("", Some(&test_probe()));
        let block2 = b.block_with_object(&mut prog, block, "$x").unwrap();

        assert_eq!(
            prog.statements(block2),
            &[Statement::text("$x = arg0")]
        );
    }

    #[test]
    fn test_args_requires_tracepoint() {
        let b = Builder::new();
        let mut prog = Program::new();

        let kprobe = Probe {
            name: "kprobe:ip_rcv".to_string(),
            ..Default::default()
        };
        let block = prog.add_probe_block(kprobe.name.clone(), Some(&kprobe));
        let err = b.block_with_object(&mut prog, block, "args").unwrap_err();
        assert_eq!(err.level(), ErrorLevel::Probe);

        let tracepoint = Probe {
            name: "tracepoint:skb:kfree_skb".to_string(),
            ..Default::default()
        };
        let block = prog.add_probe_block(tracepoint.name.clone(), Some(&tracepoint));
        let found = b.block_with_object(&mut prog, block, "args").unwrap();
        assert_eq!(found, block);
    }
}
