//! Field and field group model
//!
//! Fields are the extractable values of an object (or of the global scope):
//! each carries conversion, formatting and filtering metadata. A field group
//! binds an ordered field list to one object and one display row; groups
//! sharing a row name form that row's schema in registration order.

use std::fmt;
use std::rc::Rc;
use std::sync::LazyLock;

use regex::Regex;

use crate::builder::{AliasEntry, Builder};
use crate::errors::{BuildError, ErrorLevel, Result, MSG_NOT_FOUND, MSG_PARSE_ERROR};
use crate::filter::Filter;
use crate::probes::Probe;
use crate::program::{expr_field, BlockId, Expression, Program, Statement};

/// Setup statements plus the value expression produced by a converter.
pub type ConverterOutput = (Vec<Statement>, Expression);

/// Converts raw field access into a usable value: may emit setup statements
/// into the enclosing scope and returns the expression to embed.
pub type FieldConverter = Rc<dyn Fn(&str, &str) -> ConverterOutput>;

/// Rewrites a human-readable filter literal (per `(op, value)`) into the
/// form the generated condition compares against.
pub type FieldPreprocessor = Rc<dyn Fn(&str, &str) -> anyhow::Result<String>>;

/// Builds a custom filter condition from `(field expr, op, value)` when the
/// default `expr op value` form is not expressive enough.
pub type FilterOperator = Rc<dyn Fn(&Expression, &str, &str) -> anyhow::Result<Expression>>;

/// Contexts a converter applies in. A mask of zero means all contexts.
pub type ConverterMask = u8;

pub const CONVERTER_DUMP: ConverterMask = 1 << 0;
pub const CONVERTER_FILTER: ConverterMask = 1 << 1;
pub const CONVERTER_HIDDEN_KEY: ConverterMask = 1 << 2;
pub const CONVERTER_AGGREGATE_ARG: ConverterMask = 1 << 3;
pub const CONVERTER_ALL: ConverterMask =
    CONVERTER_DUMP | CONVERTER_FILTER | CONVERTER_HIDDEN_KEY | CONVERTER_AGGREGATE_ARG;

/// An extractable value on an object or in the global scope.
#[derive(Clone, Default)]
pub struct Field {
    /// Struct field name, raw argument name or global variable name.
    pub name: String,

    /// Alias usable in filters and keys without naming the object.
    pub alias: Option<String>,

    /// Weak aliases may be shared by several groups; the owning object is
    /// deduced from request context.
    pub weak_alias: bool,

    /// Label in dump output; defaults to the field name.
    pub fmt_key: Option<String>,

    /// printf conversion for dump output; defaults to `%d`.
    pub fmt_spec: Option<String>,

    pub converter: Option<FieldConverter>,
    pub converter_mask: ConverterMask,

    pub preprocessor: Option<FieldPreprocessor>,
    pub filter_operator: Option<FilterOperator>,

    /// Guard applied to this field's value when the owning object is
    /// materialized, rendered as a wrapping conditional.
    pub sanity_filter: Option<Filter>,

    pub help: String,
}

impl Field {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub(crate) fn converter_applies(&self, mask: ConverterMask) -> bool {
        let own = if self.converter_mask == 0 {
            CONVERTER_ALL
        } else {
            self.converter_mask
        };
        own & mask != 0
    }
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.name)
            .field("alias", &self.alias)
            .field("weak_alias", &self.weak_alias)
            .finish_non_exhaustive()
    }
}

/// Ordered fields of one object displayed under one row name.
#[derive(Debug, Clone, Default)]
pub struct FieldGroup {
    /// Object variable the fields belong to; empty for raw arguments and
    /// globals living at top scope.
    pub object: String,

    /// Row the fields are dumped under.
    pub row: String,

    /// Prefix applied to every alias of the group, to keep inner/outer
    /// protocol duplicates apart.
    pub field_alias_prefix: String,

    pub fields: Vec<Field>,
}

impl FieldGroup {
    /// Base-group variant: the same fields under a different object, with
    /// row and aliases prefixed to avoid collisions.
    pub fn wrap(&self, object: &str, prefix: &str) -> FieldGroup {
        FieldGroup {
            object: object.to_string(),
            row: format!("{prefix}-{}", self.row),
            field_alias_prefix: prefix.to_string(),
            fields: self.fields.clone(),
        }
    }
}

/// Index of one field within the builder's group list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FieldRef {
    pub group: usize,
    pub field: usize,
}

/// A name resolved to either a catalog field or a registered global.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ResolvedField {
    Field(FieldRef),
    Global(String),
}

/// Two-phase binding of a field reference: weak aliases stay unresolved,
/// carrying their candidate groups, until the build-object set is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FieldBinding {
    Resolved(ResolvedField),
    Weak {
        alias: String,
        candidates: Vec<FieldRef>,
    },
}

impl FieldBinding {
    pub(crate) fn resolved(&self) -> Option<&ResolvedField> {
        match self {
            FieldBinding::Resolved(r) => Some(r),
            FieldBinding::Weak { .. } => None,
        }
    }

    /// Name of the alias if the binding is still weak.
    pub(crate) fn weak_alias(&self) -> Option<&str> {
        match self {
            FieldBinding::Weak { alias, .. } => Some(alias),
            FieldBinding::Resolved(_) => None,
        }
    }
}

/// A requested map key with its binding.
#[derive(Debug, Clone)]
pub(crate) struct KeyRef {
    pub name: String,
    pub binding: FieldBinding,
}

// Keys and filter fields share one spelling: `$obj->field` for struct
// fields, a bare name for aliases and globals.
static RE_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:(\$[A-Za-z_][A-Za-z0-9_]*)\s*->\s*)?([A-Za-z0-9_.-]+)\s*$")
        .expect("field regex")
});

impl Builder {
    /// Looks a field up by object and name. With an empty object the name is
    /// tried against objectless fields, then the alias index, then globals.
    pub(crate) fn find_field(&self, object: &str, field: &str) -> Option<FieldBinding> {
        if let Some(refs) = self.object_fields.get(object) {
            let found = refs
                .iter()
                .find(|r| self.field_ref_field(**r).name == field);
            if let Some(fref) = found {
                return Some(FieldBinding::Resolved(ResolvedField::Field(*fref)));
            }
        }
        if !object.is_empty() {
            return None;
        }

        if let Some(entry) = self.alias_map.get(field) {
            return Some(match entry {
                AliasEntry::Strong(fref) => FieldBinding::Resolved(ResolvedField::Field(*fref)),
                AliasEntry::Weak(candidates) => FieldBinding::Weak {
                    alias: field.to_string(),
                    candidates: candidates.clone(),
                },
            });
        }

        if self.global_vars.contains_key(field) {
            return Some(FieldBinding::Resolved(ResolvedField::Global(
                field.to_string(),
            )));
        }

        None
    }

    pub(crate) fn field_ref_group(&self, r: FieldRef) -> &FieldGroup {
        &self.field_groups[r.group]
    }

    pub(crate) fn field_ref_field(&self, r: FieldRef) -> &Field {
        &self.field_groups[r.group].fields[r.field]
    }

    /// Object variable a resolved binding lives on; empty for globals and
    /// objectless fields.
    pub(crate) fn resolved_object(&self, resolved: &ResolvedField) -> &str {
        match resolved {
            ResolvedField::Field(fref) => &self.field_ref_group(*fref).object,
            ResolvedField::Global(_) => "",
        }
    }

    /// Raw access expression for a field before any conversion: struct field
    /// access, or for objectless names a probe argument, a registered global
    /// or the bare bpftrace builtin.
    fn base_field_expr(&self, object: &str, field_name: &str, probe: Option<&Probe>) -> Expression {
        if object.is_empty() {
            if let Some(arg) = probe.and_then(|p| p.args.get(field_name)) {
                return Expression::new(arg.clone());
            }
            if let Some(expr) = self.global_vars.get(field_name) {
                return expr.clone();
            }
            return Expression::new(field_name);
        }

        expr_field(object, field_name)
    }

    /// Generates the value expression for a resolved field, applying its
    /// converter when the context mask allows it.
    pub(crate) fn generate_field_expression(
        &self,
        resolved: &ResolvedField,
        probe: Option<&Probe>,
        mask: ConverterMask,
    ) -> ConverterOutput {
        let fref = match resolved {
            ResolvedField::Global(name) => {
                let expr = self
                    .global_vars
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| Expression::new(name.clone()));
                return (Vec::new(), expr);
            }
            ResolvedField::Field(fref) => *fref,
        };

        let group = self.field_ref_group(fref);
        let field = self.field_ref_field(fref);
        if let Some(conv) = &field.converter {
            if field.converter_applies(mask) {
                return conv(&group.object, &field.name);
            }
        }

        (
            Vec::new(),
            self.base_field_expr(&group.object, &field.name, probe),
        )
    }

    /// Parses and resolves requested map keys.
    pub(crate) fn prepare_keys<S: AsRef<str>>(&self, keys: &[S]) -> Result<Vec<KeyRef>> {
        let mut refs = Vec::with_capacity(keys.len());
        for key in keys {
            let key = key.as_ref();
            let caps = RE_FIELD
                .captures(key)
                .ok_or_else(|| BuildError::new(ErrorLevel::Field, key, MSG_PARSE_ERROR))?;
            let object = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            let field = &caps[2];

            let binding = self
                .find_field(object, field)
                .ok_or_else(|| BuildError::new(ErrorLevel::Field, key, MSG_NOT_FOUND))?;
            refs.push(KeyRef {
                name: key.to_string(),
                binding,
            });
        }
        Ok(refs)
    }

    /// Materializes the objects behind the keys and generates their value
    /// expressions, extending the scope as casts are added.
    pub(crate) fn get_block_with_keys(
        &self,
        prog: &mut Program,
        block: BlockId,
        keys: &[KeyRef],
        mask: ConverterMask,
    ) -> Result<(BlockId, Vec<Expression>)> {
        let mut block = block;
        let mut exprs = Vec::with_capacity(keys.len());

        for key in keys {
            let resolved = key.binding.resolved().ok_or_else(|| {
                BuildError::new(
                    ErrorLevel::Field,
                    &key.name,
                    "object cannot be deduced for weak alias from rows, filters and hints",
                )
            })?;

            let object = self.resolved_object(resolved).to_string();
            block = self.block_with_object(prog, block, &object)?;

            let probe = prog.probe(block).cloned();
            let (stmts, expr) = self.generate_field_expression(resolved, probe.as_ref(), mask);
            for stmt in stmts {
                prog.add(block, stmt);
            }
            exprs.push(expr);
        }

        Ok((block, exprs))
    }

    /// Print statements for one field group: converter setup lines followed
    /// by a printf of `key spec` pairs labeled with the row name.
    pub(crate) fn generate_print_statements(
        &self,
        group_id: usize,
        probe: Option<&Probe>,
    ) -> Vec<Statement> {
        let group = &self.field_groups[group_id];

        let mut stmts = Vec::new();
        let mut fmt = String::new();
        let mut args = Vec::new();

        for (field_id, field) in group.fields.iter().enumerate() {
            let resolved = ResolvedField::Field(FieldRef {
                group: group_id,
                field: field_id,
            });
            let (setup, expr) =
                self.generate_field_expression(&resolved, probe, CONVERTER_DUMP);
            stmts.extend(setup);

            if !fmt.is_empty() {
                fmt.push(' ');
            }
            fmt.push_str(field.fmt_key.as_deref().unwrap_or(&field.name));
            fmt.push(' ');
            fmt.push_str(field.fmt_spec.as_deref().unwrap_or("%d"));
            args.push(expr);
        }

        let label = if group.row.is_empty() {
            String::new()
        } else {
            format!("{}: ", group.row)
        };
        let stmt = if args.is_empty() {
            format!("printf(\"{label}{fmt}\\n\")")
        } else {
            format!(
                "printf(\"{label}{fmt}\\n\", {})",
                crate::program::expr_join(&args)
            )
        };
        stmts.push(Statement::text(stmt));
        stmts
    }
}
