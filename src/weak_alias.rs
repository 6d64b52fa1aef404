//! Weak alias resolution
//!
//! Some aliases (`src`, `sport`, ...) are shared by several field groups:
//! the IPv4 and IPv6 headers both have a source address, TCP and UDP both
//! have ports. A weak reference is resolved by picking whichever candidate
//! group's object the request already implies through its other filters,
//! requested rows and protocol hints. Resolution runs exactly once, after
//! all context-implying information has been gathered.

use std::collections::HashSet;

use crate::builder::Builder;
use crate::errors::{BuildError, ErrorLevel, Result};
use crate::fields::{FieldBinding, KeyRef, ResolvedField};
use crate::filter::ProcessedFilter;

impl Builder {
    /// Set of object names this request will materialize, deduced from
    /// already-unambiguous filters, requested rows and hints (hint strings
    /// are row names).
    pub(crate) fn new_build_object_set(
        &self,
        filters: &[Vec<ProcessedFilter>],
        rows: &[String],
        hints: &[String],
    ) -> HashSet<String> {
        let mut set = HashSet::new();

        for chunk in filters {
            for pf in chunk {
                for binding in &pf.bindings {
                    if let Some(ResolvedField::Field(fref)) = binding.resolved() {
                        set.insert(self.field_ref_group(*fref).object.clone());
                    }
                }
            }
        }

        for row in rows.iter().chain(hints) {
            if let Some(group_ids) = self.row_map.get(row) {
                set.insert(self.field_groups[group_ids[0]].object.clone());
            }
        }

        set
    }

    /// Resolves weak references left in processed filters. Fails naming the
    /// ambiguous field when no candidate object is implied by the request.
    pub(crate) fn resolve_weak_filters(
        &self,
        filters: &mut [Vec<ProcessedFilter>],
        bo_set: &HashSet<String>,
    ) -> Result<()> {
        for chunk in filters.iter_mut() {
            for pf in chunk.iter_mut() {
                let mut resolved_object = None;
                for binding in &mut pf.bindings {
                    self.resolve_weak_binding(binding, ErrorLevel::Filter, bo_set)?;
                    if let Some(ResolvedField::Field(fref)) = binding.resolved() {
                        resolved_object = Some(self.field_ref_group(*fref).object.clone());
                    }
                }
                if let Some(object) = resolved_object {
                    if pf.bindings.len() == 1 {
                        if let Some(ResolvedField::Field(fref)) = pf.bindings[0].resolved() {
                            pf.filter.field = self.field_ref_field(*fref).name.clone();
                        }
                    }
                    pf.filter.object = object;
                }
            }
        }
        Ok(())
    }

    /// Resolves weak references left in prepared keys.
    pub(crate) fn resolve_weak_keys(
        &self,
        keys: &mut [KeyRef],
        bo_set: &HashSet<String>,
    ) -> Result<()> {
        for key in keys.iter_mut() {
            self.resolve_weak_binding(&mut key.binding, ErrorLevel::Field, bo_set)?;
        }
        Ok(())
    }

    fn resolve_weak_binding(
        &self,
        binding: &mut FieldBinding,
        level: ErrorLevel,
        bo_set: &HashSet<String>,
    ) -> Result<()> {
        let FieldBinding::Weak { alias, candidates } = binding else {
            return Ok(());
        };

        for fref in candidates.iter() {
            if bo_set.contains(&self.field_ref_group(*fref).object) {
                *binding = FieldBinding::Resolved(ResolvedField::Field(*fref));
                return Ok(());
            }
        }

        Err(BuildError::new(
            level,
            alias.clone(),
            "object cannot be deduced for weak alias from rows, filters and hints",
        ))
    }
}
