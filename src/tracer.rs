//! Trace builders
//!
//! `build_dump_trace` composes per-probe field dumps; `build_aggregate`
//! composes keyed aggregations dumped on an interval. Both share filter
//! preparation, weak alias resolution, the embedded timeout block and the
//! probe hit counters.

use std::collections::HashSet;
use std::time::Duration;

use crate::builder::Builder;
use crate::errors::{BuildError, ErrorLevel, Result, MSG_NOT_FOUND};
use crate::fields::{CONVERTER_AGGREGATE_ARG, CONVERTER_DUMP};
use crate::filter::{FilterOptions, ProcessedFilter};
use crate::probes::probe_build_error;
use crate::program::{
    expr_join, AggrFunc, BlockId, Expression, Program, Statement,
};
use crate::timeit::TIME_UNIT_MICROSECOND;

/// Timestamp flavor printed with each dumped event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimeMode {
    Elapsed,
    Nsecs,
    Delta,
    #[default]
    Time,
}

impl TimeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeMode::Elapsed => "elapsed",
            TimeMode::Nsecs => "nsecs",
            TimeMode::Delta => "delta",
            TimeMode::Time => "time",
        }
    }
}

/// Options shared between all build requests.
#[derive(Debug, Clone)]
pub struct CommonOptions {
    /// Execution timeout embedded into the generated script.
    pub timeout: Duration,

    /// Row names used for resolving weak aliases.
    pub hints: Vec<String>,

    /// Time unit for measured durations.
    pub time_unit: String,
}

impl Default for CommonOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            hints: Vec::new(),
            time_unit: TIME_UNIT_MICROSECOND.to_string(),
        }
    }
}

/// Options shared between tracer build requests.
#[derive(Debug, Clone, Default)]
pub struct TraceCommonOptions {
    pub common: CommonOptions,

    /// Context probes arm a per-key flag which gates the main probes, for
    /// tracing only events caused by some triggering call.
    pub context_probe_names: Vec<String>,
    pub context_filter_options: FilterOptions,
    /// Key mapping context probe firings to main probe firings.
    pub context_key: String,

    pub probe_names: Vec<String>,
    pub filter_options: FilterOptions,
}

/// Dump formatting options shared by dump-style requests.
#[derive(Debug, Clone, Default)]
pub struct CommonDumpOptions {
    /// Rows to print on each firing.
    pub field_group_rows: Vec<String>,

    pub time_mode: TimeMode,
    /// Dump the kernel stack on each probe.
    pub kstack: bool,
    /// Dump the userspace stack on each probe.
    pub ustack: bool,
}

/// Options for [`Builder::build_dump_trace`].
#[derive(Debug, Clone, Default)]
pub struct TraceDumpOptions {
    pub trace: TraceCommonOptions,
    pub dump: CommonDumpOptions,
}

/// Options for [`Builder::build_aggregate`].
#[derive(Debug, Clone)]
pub struct TraceAggregateOptions {
    pub trace: TraceCommonOptions,

    /// Aggregation function and its argument (unused for `count`).
    pub func: AggrFunc,
    pub arg: String,

    /// Keys of the aggregation map entry. The probe name is appended
    /// automatically when several probes are requested.
    pub keys: Vec<String>,

    /// Interval of aggregation map dumping.
    pub interval: Duration,
}

impl Builder {
    /// Builds a tracer where each requested probe prints the requested
    /// field rows, with a timestamp, when all filters pass.
    pub fn build_dump_trace(&self, opt: &TraceDumpOptions) -> Result<Program> {
        self.build_tracer_impl(&opt.trace, &opt.dump.field_group_rows, |b, prog, block, _| {
            b.add_dump_rows_statements(prog, block, &opt.dump)
        })
    }

    /// Builds a tracer aggregating a value (or counting firings) under the
    /// requested keys, dumped periodically.
    pub fn build_aggregate(&self, opt: &TraceAggregateOptions) -> Result<Program> {
        let multi_probe = opt.trace.probe_names.len() > 1;
        let mut prog = self.build_tracer_impl(&opt.trace, &[], |b, prog, block, bo_set| {
            let (aggr_block, aggr_expr) = b.generate_aggregate_expr(prog, block, opt.func, &opt.arg)?;

            let mut keys = b.prepare_keys(&opt.keys)?;
            b.resolve_weak_keys(&mut keys, bo_set)?;

            // Converted keys: the dumped map is read by humans.
            let (key_block, mut key_exprs) =
                b.get_block_with_keys(prog, aggr_block, &keys, CONVERTER_DUMP)?;

            if multi_probe {
                let probe_name = prog.probe(block).map(|p| p.name.clone()).unwrap_or_default();
                key_exprs.push(Expression::new(format!("\"{probe_name}\"")));
            }
            if key_exprs.is_empty() {
                prog.add_stmt(key_block, format!("@ = {aggr_expr}"));
            } else {
                prog.add_stmt(
                    key_block,
                    format!("@[{}] = {aggr_expr}", expr_join(&key_exprs)),
                );
            }
            Ok(())
        })?;

        prog.add_aggr_dump_block(opt.interval);
        Ok(prog)
    }

    /// Shared tracer scaffolding: filters, weak aliases, the timeout block,
    /// context probe plumbing and hit counters around a per-probe body.
    fn build_tracer_impl(
        &self,
        opt: &TraceCommonOptions,
        rows: &[String],
        mut body: impl FnMut(&Builder, &mut Program, BlockId, &HashSet<String>) -> Result<()>,
    ) -> Result<Program> {
        let mut filters = self.prepare_filters(&opt.filter_options)?;
        let bo_set = self.new_build_object_set(&filters, rows, &opt.common.hints);
        self.resolve_weak_filters(&mut filters, &bo_set)?;

        let mut prog = Program::new();
        prog.add_common_block(&opt.common);

        let use_context = !opt.context_probe_names.is_empty();
        let trace_flag = format!("@trace_flag[{}]", opt.context_key);

        if use_context {
            let mut context_filters = self.prepare_filters(&opt.context_filter_options)?;
            self.resolve_weak_filters(&mut context_filters, &bo_set)?;

            for probe_name in &opt.context_probe_names {
                self.build_tracer_probe(
                    &mut prog,
                    probe_name,
                    false,
                    &context_filters,
                    true,
                    |_, prog, block| {
                        prog.add_stmt(block, format!("{trace_flag} = 1"));
                        Ok(())
                    },
                )?;
                self.build_tracer_probe(&mut prog, probe_name, true, &[], false, |_, prog, block| {
                    prog.add_stmt(block, format!("delete({trace_flag})"));
                    Ok(())
                })?;
            }
        }

        for probe_name in &opt.probe_names {
            self.build_tracer_probe(&mut prog, probe_name, false, &filters, true, |b, prog, block| {
                let block = if use_context {
                    prog.add_if_block(block, &[Expression::new(trace_flag.clone())])
                } else {
                    block
                };
                body(b, prog, block, &bo_set)
            })?;
        }

        Ok(prog)
    }

    fn build_tracer_probe(
        &self,
        prog: &mut Program,
        probe_name: &str,
        is_return: bool,
        filters: &[Vec<ProcessedFilter>],
        count_hits: bool,
        mut body: impl FnMut(&Builder, &mut Program, BlockId) -> Result<()>,
    ) -> Result<()> {
        let (probe_block, block) = self.add_probe_block(prog, probe_name, is_return, filters)?;

        body(self, prog, block).map_err(|err| probe_build_error(probe_name, err))?;

        // Diagnostic counters of probe firings, printed on exit like any
        // other global map.
        if count_hits {
            prog.add_stmt(block, format!("@hits[\"{probe_name}:filtered\"] = count()"));
            prog.add_stmt(probe_block, format!("@hits[\"{probe_name}\"] = count()"));
        }
        Ok(())
    }

    /// Wraps the block into each filter group in turn; groups AND by
    /// nesting.
    pub(crate) fn wrap_filters(
        &self,
        prog: &mut Program,
        base_block: BlockId,
        filters: &[Vec<ProcessedFilter>],
    ) -> Result<BlockId> {
        let mut block = base_block;
        for chunk in filters {
            block = self.wrap_filter(prog, block, chunk)?;
        }
        Ok(block)
    }

    fn wrap_filter(
        &self,
        prog: &mut Program,
        block: BlockId,
        chunk: &[ProcessedFilter],
    ) -> Result<BlockId> {
        // All fields of one filter share an object, so materializing the
        // first binding's object is enough.
        let object = match chunk.first().and_then(|pf| pf.bindings.first()) {
            Some(binding) => {
                let resolved = binding.resolved().ok_or_else(|| {
                    BuildError::new(
                        ErrorLevel::Filter,
                        binding.weak_alias().unwrap_or_default(),
                        "object cannot be deduced for weak alias from rows, filters and hints",
                    )
                })?;
                self.resolved_object(resolved).to_string()
            }
            None => String::new(),
        };

        let block = self.block_with_object(prog, block, &object)?;
        self.add_filter_block(prog, block, chunk)
    }

    /// Appends print statements for the requested rows, materializing each
    /// row object and prefixing the first row with the timestamp.
    pub(crate) fn add_dump_rows_statements(
        &self,
        prog: &mut Program,
        block: BlockId,
        opt: &CommonDumpOptions,
    ) -> Result<()> {
        let probe_name = prog.probe(block).map(|p| p.name.clone()).unwrap_or_default();
        if opt.field_group_rows.is_empty() {
            return Err(BuildError::new(
                ErrorLevel::Probe,
                probe_name,
                "no rows are specified in dump options",
            ));
        }

        let mut obj_block = block;
        for (row_index, row) in opt.field_group_rows.iter().enumerate() {
            let group_ids = self
                .row_map
                .get(row)
                .ok_or_else(|| BuildError::new(ErrorLevel::Row, row, MSG_NOT_FOUND))?
                .clone();

            obj_block = block;
            for (group_index, group_id) in group_ids.iter().enumerate() {
                let object = self.field_groups[*group_id].object.clone();
                if !prog.context_contains(block, &object) {
                    obj_block = self.block_with_object(prog, block, &object)?;
                }

                // Defer all printing until sanity filters have passed.
                if row_index == 0 && group_index == 0 {
                    self.add_time_statements(prog, obj_block, opt.time_mode, &probe_name);
                }

                let probe = prog.probe(obj_block).cloned();
                for stmt in self.generate_print_statements(*group_id, probe.as_ref()) {
                    prog.add(obj_block, stmt);
                }
            }

            if row_index == opt.field_group_rows.len() - 1 {
                if opt.kstack {
                    add_stack_statement(prog, obj_block, "kstack");
                }
                if opt.ustack {
                    add_stack_statement(prog, obj_block, "ustack");
                }
            }
        }

        Ok(())
    }

    fn add_time_statements(
        &self,
        prog: &mut Program,
        block: BlockId,
        time_mode: TimeMode,
        probe_name: &str,
    ) {
        let (expr, fmt_spec, pre, post) = time_statements(time_mode);

        for stmt in pre {
            prog.add(block, stmt);
        }
        prog.add_stmt(block, format!("printf(\"{fmt_spec} - {probe_name}\\n\", {expr})"));
        for stmt in post {
            prog.add(block, stmt);
        }
    }

    /// Aggregated expression for the requested function; non-count
    /// functions resolve their argument like a key.
    fn generate_aggregate_expr(
        &self,
        prog: &mut Program,
        block: BlockId,
        func: AggrFunc,
        arg: &str,
    ) -> Result<(BlockId, Expression)> {
        if func == AggrFunc::Count {
            return Ok((block, Expression::new("count()")));
        }

        let keys = self.prepare_keys(&[arg])?;
        let (block, arg_exprs) =
            self.get_block_with_keys(prog, block, &keys, CONVERTER_AGGREGATE_ARG)?;
        Ok((
            block,
            Expression::new(format!("{func}({})", expr_join(&arg_exprs))),
        ))
    }
}

fn add_stack_statement(prog: &mut Program, block: BlockId, stack_var: &str) {
    prog.add_stmt(block, format!("printf(\"%s\\n\", {stack_var})"));
}

fn time_statements(
    time_mode: TimeMode,
) -> (Expression, &'static str, Vec<Statement>, Vec<Statement>) {
    match time_mode {
        TimeMode::Delta => (
            Expression::new("elapsed - @last_event"),
            "+%ld",
            Vec::new(),
            vec![Statement::text("@last_event = elapsed")],
        ),
        TimeMode::Time => (
            Expression::new("nsecs % 1000000000"),
            "%09ld",
            vec![Statement::text("time(\"%H:%M:%S.\")")],
            Vec::new(),
        ),
        TimeMode::Nsecs | TimeMode::Elapsed => (
            Expression::new(time_mode.as_str()),
            " %ld",
            Vec::new(),
            Vec::new(),
        ),
    }
}
