//! Filters
//!
//! Filters restrict probe firings to interesting events. They arrive either
//! as structured values from front-end shortcuts or as raw text in a small
//! fixed grammar: `$obj->field op value` or `alias op value`, with
//! `|`-joined alternatives on the field side (OR across fields of one
//! object) and on the value side (OR across values). Separate filters are
//! AND-ed by nesting their scopes.

use std::sync::LazyLock;

use regex::Regex;

use crate::builder::Builder;
use crate::errors::{BuildError, ErrorLevel, Result, MSG_PARSE_ERROR};
use crate::fields::{FieldBinding, ResolvedField, CONVERTER_FILTER};
use crate::program::{expr_field, expr_join_op, BlockId, Expression, Program};

// Comparison operators accepted in raw filters. Same set as bpftrace.
const RE_FILTER_OP_GROUP: &str = "(==|!=|>=|<=|<|>)";

// Filter values support dotted and colon-separated notation for addresses,
// `|`-joined alternatives and optional quotes.
const RE_FILTER_VALUE_GROUP: &str = "(\"?[A-Za-z0-9.:|]*\"?)";

static RE_FILTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"^\s*(?:(\$[A-Za-z_][A-Za-z0-9_]*)\s*->\s*)?([A-Za-z0-9_.|-]+)\s*{RE_FILTER_OP_GROUP}\s*{RE_FILTER_VALUE_GROUP}\s*$"
    ))
    .expect("filter regex")
});

/// A single comparison over an object field, an alias or a global.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    /// Object variable; empty for aliases and globals.
    pub object: String,
    /// Field name; `|`-joined alternatives allowed.
    pub field: String,
    pub op: String,
    /// Literal value; `|`-joined alternatives allowed.
    pub value: String,
}

impl Filter {
    pub fn new(
        object: impl Into<String>,
        field: impl Into<String>,
        op: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            object: object.into(),
            field: field.into(),
            op: op.into(),
            value: value.into(),
        }
    }

    pub(crate) fn field_ident(&self) -> String {
        expr_field(&self.object, &self.field).to_string()
    }
}

/// Filters of one build request: raw text plus structured values.
#[derive(Debug, Clone, Default)]
pub struct FilterOptions {
    pub raw_filters: Vec<String>,
    pub filters: Vec<Filter>,
}

/// A filter with its field references resolved against the catalog. Weak
/// alias references stay unresolved until the build-object set is known.
#[derive(Debug, Clone)]
pub struct ProcessedFilter {
    pub(crate) filter: Filter,
    pub(crate) bindings: Vec<FieldBinding>,
}

impl ProcessedFilter {
    pub fn filter(&self) -> &Filter {
        &self.filter
    }
}

impl Builder {
    /// Resolves all request filters into ordered groups: AND across groups,
    /// OR across the field and value alternatives inside each filter.
    pub fn prepare_filters(&self, opt: &FilterOptions) -> Result<Vec<Vec<ProcessedFilter>>> {
        let mut filters = Vec::with_capacity(opt.filters.len() + opt.raw_filters.len());

        for filter in &opt.filters {
            filters.push(self.process_filter(filter)?);
        }
        for raw_filter in &opt.raw_filters {
            filters.push(self.parse_filter(raw_filter)?);
        }

        Ok(filters)
    }

    /// Parses one raw filter string against the fixed grammar.
    pub(crate) fn parse_filter(&self, raw_filter: &str) -> Result<Vec<ProcessedFilter>> {
        let caps = RE_FILTER
            .captures(raw_filter)
            .ok_or_else(|| BuildError::new(ErrorLevel::Filter, raw_filter, MSG_PARSE_ERROR))?;

        let filter = Filter {
            object: caps.get(1).map(|m| m.as_str()).unwrap_or("").to_string(),
            field: caps[2].to_string(),
            op: caps[3].to_string(),
            value: caps[4].to_string(),
        };
        self.process_filter(&filter)
    }

    /// Resolves a structured filter's field references.
    pub(crate) fn process_filter(&self, filter: &Filter) -> Result<Vec<ProcessedFilter>> {
        let mut bindings = Vec::new();
        let mut resolved_object: Option<&str> = None;
        let mut resolved_field: Option<&str> = None;

        for field_name in filter.field.split('|') {
            let binding = self.find_field(&filter.object, field_name).ok_or_else(|| {
                BuildError::new(
                    ErrorLevel::Filter,
                    filter.field_ident(),
                    "not found field used by filter",
                )
            })?;

            if let Some(ResolvedField::Field(fref)) = binding.resolved() {
                let object = self.field_ref_group(*fref).object.as_str();
                match resolved_object {
                    None => {
                        resolved_object = Some(object);
                        resolved_field = Some(self.field_ref_field(*fref).name.as_str());
                    }
                    Some(prev) if prev != object => {
                        return Err(BuildError::new(
                            ErrorLevel::Filter,
                            filter.field_ident(),
                            format!(
                                "fields of a multi-field filter must belong to one object: '{prev}' vs '{object}'"
                            ),
                        ));
                    }
                    Some(_) => {}
                }
            }
            bindings.push(binding);
        }

        let mut filter = filter.clone();
        if let Some(object) = resolved_object {
            filter.object = object.to_string();
        }
        if bindings.len() == 1 {
            if let Some(name) = resolved_field {
                filter.field = name.to_string();
            }
        }

        Ok(vec![ProcessedFilter { filter, bindings }])
    }

    /// Per-field sanity filters declared by fields of the object.
    pub(crate) fn process_field_sanity_filters(&self, obj: &str) -> Vec<ProcessedFilter> {
        let Some(refs) = self.object_fields.get(obj) else {
            return Vec::new();
        };

        let mut sanity_filters = Vec::new();
        for fref in refs {
            let field = self.field_ref_field(*fref);
            let Some(sanity) = &field.sanity_filter else {
                continue;
            };

            sanity_filters.push(ProcessedFilter {
                filter: Filter {
                    object: obj.to_string(),
                    field: field.name.clone(),
                    op: sanity.op.clone(),
                    value: sanity.value.clone(),
                },
                bindings: vec![FieldBinding::Resolved(ResolvedField::Field(*fref))],
            });
        }
        sanity_filters
    }

    /// Wraps the block into an `if` scope testing the filters: converter
    /// setup statements land in the enclosing scope, the OR-joined
    /// conditions form the preamble.
    pub(crate) fn add_filter_block(
        &self,
        prog: &mut Program,
        block: BlockId,
        filters: &[ProcessedFilter],
    ) -> Result<BlockId> {
        if filters.is_empty() {
            return Ok(block);
        }

        let probe = prog.probe(block).cloned();
        let mut conditions = Vec::with_capacity(filters.len());

        for pf in filters {
            let mut cond_exprs = Vec::new();

            for binding in &pf.bindings {
                let resolved = binding.resolved().ok_or_else(|| {
                    BuildError::new(
                        ErrorLevel::Filter,
                        pf.filter.field_ident(),
                        "object cannot be deduced for weak alias from rows, filters and hints",
                    )
                })?;

                let (setup, expr) =
                    self.generate_field_expression(resolved, probe.as_ref(), CONVERTER_FILTER);
                for stmt in setup {
                    prog.add(block, stmt);
                }

                let field = match resolved {
                    ResolvedField::Field(fref) => Some(self.field_ref_field(*fref)),
                    ResolvedField::Global(_) => None,
                };

                for value in pf.filter.value.split('|') {
                    let mut value = value.to_string();
                    if let Some(pre) = field.and_then(|f| f.preprocessor.as_ref()) {
                        value = pre(&pf.filter.op, &value).map_err(|err| {
                            BuildError::with_cause(
                                ErrorLevel::Filter,
                                pf.filter.field_ident(),
                                "error preprocessing value",
                                err,
                            )
                        })?;
                    }

                    let cond = match field.and_then(|f| f.filter_operator.as_ref()) {
                        Some(op) => op(&expr, &pf.filter.op, &value).map_err(|err| {
                            BuildError::with_cause(
                                ErrorLevel::Filter,
                                pf.filter.field_ident(),
                                "error in filter operator",
                                err,
                            )
                        })?,
                        None => Expression::new(format!("{expr} {} {value}", pf.filter.op)),
                    };
                    cond_exprs.push(cond);
                }
            }

            conditions.push(expr_join_op(&cond_exprs, "||"));
        }

        Ok(prog.add_if_block(block, &conditions))
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;
    use std::time::Duration;

    use super::*;
    use crate::fields::{Field, FieldGroup};

    fn test_builder() -> Builder {
        let mut b = Builder::new();
        b.add_field_groups(vec![FieldGroup {
            row: "task".to_string(),
            fields: vec![Field::named("pid")],
            ..Default::default()
        }]);
        b.add_field_groups(vec![FieldGroup {
            object: "$iph".to_string(),
            row: "ip".to_string(),
            fields: vec![
                Field::named("ttl"),
                Field {
                    alias: Some("src".to_string()),
                    preprocessor: Some(Rc::new(crate::field_helpers::fpp_pton_inet)),
                    ..Field::named("saddr")
                },
                Field {
                    alias: Some("dst".to_string()),
                    ..Field::named("daddr")
                },
            ],
            ..Default::default()
        }]);
        b
    }

    #[test]
    fn test_parse_simple_filter() {
        let b = test_builder();
        let f = b.parse_filter("$iph->ttl >= 50").unwrap();
        assert_eq!(f.len(), 1);
        assert_eq!(f[0].filter, Filter::new("$iph", "ttl", ">=", "50"));
    }

    #[test]
    fn test_parse_alias_filter() {
        let b = test_builder();
        let f = b.parse_filter("src == 127.0.0.1").unwrap();
        assert_eq!(f.len(), 1);
        assert_eq!(f[0].filter, Filter::new("$iph", "saddr", "==", "127.0.0.1"));

        // The preprocessor rewrites the literal before it is embedded.
        let mut prog = Program::new();
        let block = prog.add_interval_block(Duration::from_secs(1));
        let block2 = b.add_filter_block(&mut prog, block, &f).unwrap();

        let expected = format!("if ($iph->saddr == {:#x})", u32::from_ne_bytes([127, 0, 0, 1]));
        assert_eq!(prog.preamble(block2), expected);
    }

    #[test]
    fn test_parse_objectless_filter() {
        let b = test_builder();
        let f = b.parse_filter("pid == 100500").unwrap();
        assert_eq!(f.len(), 1);
        assert_eq!(f[0].filter, Filter::new("", "pid", "==", "100500"));
    }

    #[test]
    fn test_parse_error() {
        let b = test_builder();
        let err = b.parse_filter("ttl 50").unwrap_err();
        assert_eq!(err.level(), ErrorLevel::Filter);
        assert_eq!(err.message(), MSG_PARSE_ERROR);

        let err = b.parse_filter("$iph->ttl ~ 50").unwrap_err();
        assert_eq!(err.message(), MSG_PARSE_ERROR);
    }

    #[test]
    fn test_unknown_field() {
        let b = test_builder();
        let err = b.parse_filter("$iph->nexthdr == 6").unwrap_err();
        assert_eq!(err.level(), ErrorLevel::Filter);
        assert_eq!(err.message(), "not found field used by filter");
    }

    #[test]
    fn test_multi_field_or() {
        let b = test_builder();
        let f = b.parse_filter("src|dst == 10.0.0.1|10.0.0.2").unwrap();
        assert_eq!(f[0].bindings.len(), 2);
        assert_eq!(f[0].filter.object, "$iph");

        let mut prog = Program::new();
        let block = prog.add_interval_block(Duration::from_secs(1));
        let block2 = b.add_filter_block(&mut prog, block, &f).unwrap();

        let v1 = format!("{:#x}", u32::from_ne_bytes([10, 0, 0, 1]));
        let v2 = format!("{:#x}", u32::from_ne_bytes([10, 0, 0, 2]));
        assert_eq!(
            prog.preamble(block2),
            format!(
                "if ($iph->saddr == {v1} || $iph->saddr == {v2} || $iph->daddr == 10.0.0.1 || $iph->daddr == 10.0.0.2)"
            )
        );
    }

    #[test]
    fn test_cross_object_filter_fails() {
        let mut b = test_builder();
        b.add_field_groups(vec![FieldGroup {
            object: "$tcph".to_string(),
            row: "tcp".to_string(),
            fields: vec![Field {
                alias: Some("sport".to_string()),
                ..Field::named("source")
            }],
            ..Default::default()
        }]);

        let err = b.parse_filter("src|sport == 1").unwrap_err();
        assert_eq!(err.level(), ErrorLevel::Filter);
        assert!(err.message().contains("'$iph'"));
        assert!(err.message().contains("'$tcph'"));
    }

    #[test]
    fn test_custom_filter_operator() {
        let mut b = Builder::new();
        b.add_field_groups(vec![FieldGroup {
            object: "$tcph".to_string(),
            row: "tcp".to_string(),
            fields: vec![Field {
                alias: Some("tcp-flags".to_string()),
                filter_operator: Some(Rc::new(|expr, op, value| {
                    Ok(Expression::new(format!("({expr} & 0x17) {op} {value}")))
                })),
                ..Field::named("flags1")
            }],
            ..Default::default()
        }]);

        let f = b.parse_filter("tcp-flags == 0x2").unwrap();
        let mut prog = Program::new();
        let block = prog.add_interval_block(Duration::from_secs(1));
        let block2 = b.add_filter_block(&mut prog, block, &f).unwrap();
        assert_eq!(prog.preamble(block2), "if (($tcph->flags1 & 0x17) == 0x2)");
    }

    #[test]
    fn test_converter_setup_in_enclosing_scope() {
        let mut b = Builder::new();
        b.add_field_groups(vec![FieldGroup {
            object: "$tcph".to_string(),
            row: "tcp".to_string(),
            fields: vec![Field {
                converter: Some(crate::field_helpers::conv_ntohs()),
                ..Field::named("source")
            }],
            ..Default::default()
        }]);

        let f = b.parse_filter("$tcph->source == 20480").unwrap();
        let mut prog = Program::new();
        let block = prog.add_interval_block(Duration::from_secs(1));
        let block2 = b.add_filter_block(&mut prog, block, &f).unwrap();

        // Two setup statements then the nested if block.
        assert_eq!(prog.statements(block).len(), 3);
        assert_eq!(prog.preamble(block2), "if ($source == 20480)");
    }
}
