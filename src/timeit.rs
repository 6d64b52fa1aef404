//! Time measurement builders
//!
//! Latency questions ("how long between transmit and the ACK?") compile to
//! a pair of probes sharing a keyed timestamp map. Each top-level command is
//! sequenced from a small alphabet of composable helpers: convert the keys,
//! record a start timestamp, fetch and guard it, compute the delta, gate on
//! an event count, aggregate or dump. A helper may narrow the active block
//! to a new conditional child for everything chained after it.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::bail;

use crate::builder::Builder;
use crate::errors::Result;
use crate::fields::{KeyRef, CONVERTER_HIDDEN_KEY};
use crate::filter::{FilterOptions, ProcessedFilter};
use crate::probes::probe_build_error;
use crate::program::{expr_join, AggrFunc, BlockId, Expression, Program};
use crate::tracer::{CommonDumpOptions, CommonOptions};

pub const TIME_UNIT_SECOND: &str = "sec";
pub const TIME_UNIT_MILLISECOND: &str = "ms";
pub const TIME_UNIT_MICROSECOND: &str = "us";
pub const TIME_UNIT_NANOSECOND: &str = "ns";

fn time_unit_divisor(time_unit: &str) -> anyhow::Result<u64> {
    match time_unit {
        TIME_UNIT_SECOND => Ok(1_000_000_000),
        TIME_UNIT_MILLISECOND => Ok(1_000_000),
        TIME_UNIT_MICROSECOND => Ok(1_000),
        TIME_UNIT_NANOSECOND => Ok(1),
        _ => bail!("unknown divisor '{time_unit}'"),
    }
}

/// Specification of one timed probe: where to attach, what to filter, and
/// the keys correlating its firings with the paired probe.
#[derive(Debug, Clone, Default)]
pub struct TimeSpec {
    pub probe: String,
    pub filter_options: FilterOptions,

    /// Keys mapping requests between the probe pair.
    pub keys: Vec<String>,

    /// Extra hints for this probe's weak aliases.
    pub hints: Vec<String>,
}

/// Options shared between time measurement requests. When filters or keys
/// are omitted in `to_spec`, they are inherited from `from_spec`.
#[derive(Debug, Clone, Default)]
pub struct TimeCommonOptions {
    pub common: CommonOptions,

    /// Probe collecting the start timestamp.
    pub from_spec: TimeSpec,

    /// Probe computing the time delta.
    pub to_spec: TimeSpec,
}

/// Options for [`Builder::build_time_aggregate`].
#[derive(Debug, Clone)]
pub struct TimeAggregateOptions {
    pub time: TimeCommonOptions,

    /// Aggregation applied to measured deltas.
    pub func: AggrFunc,

    /// Interval between dumps of the aggregation.
    pub interval: Duration,

    /// Number of `to` probe firings before the delta is taken. Useful for
    /// longer handshakes where only every n-th event is of interest.
    pub to_event_count: u32,
}

/// Options for [`Builder::build_time_outlier_dump`].
#[derive(Debug, Clone)]
pub struct TimeOutlierDumpOptions {
    pub time: TimeCommonOptions,

    /// Dump events whose delta exceeds this threshold.
    pub outlier_threshold: Duration,

    /// Stop the tracer on the first outlier.
    pub exit: bool,

    pub dump: CommonDumpOptions,
}

/// Options for [`Builder::build_duplicate_event`].
#[derive(Debug, Clone)]
pub struct DuplicateEventOptions {
    pub common: CommonOptions,

    pub spec: TimeSpec,

    /// Stop the tracer on the first duplicate.
    pub exit: bool,

    pub dump: CommonDumpOptions,
}

/// Mutable state threaded through a probe's helper chain.
#[derive(Debug, Clone, Default)]
pub(crate) struct TimeProbeContext {
    filters: Vec<Vec<ProcessedFilter>>,
    probe_name: String,
    probe_block: Option<BlockId>,
    outer_block: Option<BlockId>,

    /// Active block; helpers narrow it as they add conditional scopes.
    block: Option<BlockId>,

    keys: Vec<KeyRef>,
    keys_exprs: Vec<Expression>,
}

impl TimeProbeContext {
    fn block(&self) -> BlockId {
        self.block.expect("probe block built before helpers run")
    }

    fn keys_expr(&self) -> Expression {
        expr_join(&self.keys_exprs)
    }
}

/// A composable piece of probe body construction. Helpers run left to
/// right; the first failing helper aborts the chain.
type TimeBuilderHelper = Box<dyn FnMut(&Builder, &mut Program, &mut TimeProbeContext) -> anyhow::Result<()>>;

fn combine_time_helpers(mut helpers: Vec<TimeBuilderHelper>) -> TimeBuilderHelper {
    Box::new(move |b, prog, ctx| {
        for helper in helpers.iter_mut() {
            helper(b, prog, ctx)?;
        }
        Ok(())
    })
}

/// Materializes the key objects and computes the key expressions shared by
/// the rest of the chain.
fn new_time_measure_prepare(conv_mask: u8) -> TimeBuilderHelper {
    Box::new(move |b, prog, ctx| {
        let (key_block, exprs) = b.get_block_with_keys(prog, ctx.block(), &ctx.keys, conv_mask)?;
        ctx.block = Some(key_block);
        ctx.keys_exprs = exprs;
        Ok(())
    })
}

fn time_measure_start_impl(
    _b: &Builder,
    prog: &mut Program,
    ctx: &mut TimeProbeContext,
) -> anyhow::Result<()> {
    prog.add_stmt(ctx.block(), format!("@start_time[{}] = nsecs", ctx.keys_expr()));
    Ok(())
}

fn new_time_measure_start(conv_mask: u8) -> TimeBuilderHelper {
    combine_time_helpers(vec![
        new_time_measure_prepare(conv_mask),
        Box::new(time_measure_start_impl),
    ])
}

fn time_measure_start_fetch_impl(
    _b: &Builder,
    prog: &mut Program,
    ctx: &mut TimeProbeContext,
) -> anyhow::Result<()> {
    prog.add_stmt(ctx.block(), format!("$st = @start_time[{}]", ctx.keys_expr()));
    ctx.block = Some(prog.add_if_block(ctx.block(), &[Expression::new("$st > 0")]));
    Ok(())
}

fn time_measure_delta_impl(
    _b: &Builder,
    prog: &mut Program,
    ctx: &mut TimeProbeContext,
) -> anyhow::Result<()> {
    prog.add_stmt(ctx.block(), "$dt = (nsecs - $st)");
    Ok(())
}

fn new_time_measure_delta(conv_mask: u8) -> TimeBuilderHelper {
    combine_time_helpers(vec![
        new_time_measure_prepare(conv_mask),
        Box::new(time_measure_start_fetch_impl),
        Box::new(time_measure_delta_impl),
    ])
}

/// Gates the rest of the chain until the keys fired `to_event_count` times.
fn new_event_counter(to_event_count: u32) -> TimeBuilderHelper {
    Box::new(move |_b, prog, ctx| {
        if to_event_count >= 2 {
            let keys = ctx.keys_expr();
            prog.add_stmt(ctx.block(), format!("@event_count[{keys}] += 1"));
            ctx.block = Some(prog.add_if_block(
                ctx.block(),
                &[Expression::new(format!(
                    "@event_count[{keys}] >= {to_event_count}"
                ))],
            ));
            prog.add_stmt(ctx.block(), format!("delete(@event_count[{keys}])"));
        }
        Ok(())
    })
}

fn new_aggregate_time_delta(func: AggrFunc, time_unit: String) -> TimeBuilderHelper {
    Box::new(move |_b, prog, ctx| {
        let divisor = time_unit_divisor(&time_unit)?;
        prog.add_stmt(ctx.block(), format!("@ = {func}($dt / {divisor})"));
        Ok(())
    })
}

fn new_outlier_condition(threshold: Duration) -> TimeBuilderHelper {
    Box::new(move |_b, prog, ctx| {
        ctx.block = Some(prog.add_if_block(
            ctx.block(),
            &[Expression::new(format!("$dt > {}", threshold.as_nanos()))],
        ));
        Ok(())
    })
}

/// Prints the measured delta and dumps the requested rows, optionally
/// stopping the tracer.
fn new_dumper(opt: &CommonOptions, dump_opt: &CommonDumpOptions, exit: bool) -> TimeBuilderHelper {
    let time_unit = opt.time_unit.clone();
    let dump_opt = dump_opt.clone();
    Box::new(move |b, prog, ctx| {
        let divisor = time_unit_divisor(&time_unit)?;
        prog.add_stmt(
            ctx.block(),
            format!("printf(\"TIME: %d {time_unit}\\n\", $dt / {divisor})"),
        );

        b.add_dump_rows_statements(prog, ctx.block(), &dump_opt)?;

        if exit {
            prog.add_stmt(ctx.block(), "exit()");
        }
        Ok(())
    })
}

/// Counts firings at the probe and filtered levels under an event label.
fn new_event_count(event: &'static str) -> TimeBuilderHelper {
    Box::new(move |_b, prog, ctx| {
        prog.add_stmt(ctx.block(), format!("@[\"{event}:filtered\"] = count()"));
        let probe_block = ctx.probe_block.expect("probe block built");
        prog.add_stmt(probe_block, format!("@[\"{event}\"] = count()"));
        Ok(())
    })
}

/// First firing records the start time, a repeated firing of the same keys
/// prints the duplicate and the time since the first one.
fn new_duplicate_event() -> TimeBuilderHelper {
    Box::new(|b, prog, ctx| {
        prog.add_stmt(ctx.block(), format!("$st = @start_time[{}]", ctx.keys_expr()));

        let outer_block = ctx.block();
        ctx.block = Some(prog.add_if_block(outer_block, &[Expression::new("$st == 0")]));
        time_measure_start_impl(b, prog, ctx)?;

        ctx.block = Some(prog.add_block(outer_block, "else"));
        prog.add_stmt(ctx.block(), "printf(\"DUPLICATE EVENT \")");
        time_measure_delta_impl(b, prog, ctx)
    })
}

/// Cleans the timing map entry so it does not leak between measurements.
fn new_aggr_cleanup(aggr_var: &'static str) -> TimeBuilderHelper {
    Box::new(move |_b, prog, ctx| {
        if ctx.keys_exprs.is_empty() {
            bail!("internal error: aggregate cleanup called before time measurement");
        }
        prog.add_stmt(
            ctx.block(),
            format!("delete({aggr_var}[{}])", ctx.keys_expr()),
        );
        Ok(())
    })
}

impl Builder {
    /// Default time mode: measures deltas between the probe pair, puts them
    /// into an aggregation and periodically dumps its contents.
    pub fn build_time_aggregate(&self, opt: &TimeAggregateOptions) -> Result<Program> {
        let mut prog = self.build_time_trace(
            &opt.time,
            &[],
            new_time_measure_start(CONVERTER_HIDDEN_KEY),
            combine_time_helpers(vec![
                new_event_counter(opt.to_event_count),
                new_time_measure_delta(CONVERTER_HIDDEN_KEY),
                new_aggregate_time_delta(opt.func, opt.time.common.time_unit.clone()),
                new_aggr_cleanup("@start_time"),
            ]),
        )?;

        let mut aggrs = vec!["@start_time"];
        if opt.to_event_count >= 2 {
            aggrs.push("@event_count");
        }

        prog.add_aggr_dump_block(opt.interval);
        prog.add_aggr_cleanup_block(&aggrs);
        Ok(prog)
    }

    /// Measures the delta like [`Builder::build_time_aggregate`], but dumps
    /// the objects revealing outliers instead of aggregating, e.g. the
    /// packet that caused a troublingly long handshake.
    pub fn build_time_outlier_dump(&self, opt: &TimeOutlierDumpOptions) -> Result<Program> {
        let mut prog = self.build_time_trace(
            &opt.time,
            &opt.dump.field_group_rows,
            new_time_measure_start(CONVERTER_HIDDEN_KEY),
            combine_time_helpers(vec![
                new_time_measure_delta(CONVERTER_HIDDEN_KEY),
                new_outlier_condition(opt.outlier_threshold),
                new_dumper(&opt.time.common, &opt.dump, opt.exit),
            ]),
        )?;

        prog.add_aggr_cleanup_block(&["@start_time"]);
        Ok(prog)
    }

    /// Counts how many times the from and to probes are hit. Useful when
    /// the timed probes reveal nothing because a filter is wrong.
    pub fn build_time_event_count(&self, opt: &TimeCommonOptions) -> Result<Program> {
        self.build_time_trace(opt, &[], new_event_count("from"), new_event_count("to"))
    }

    /// Attaches to a single probe but fires only when it hits the same set
    /// of keys a second time. Useful for tracking retransmits or measuring
    /// port reuse time.
    pub fn build_duplicate_event(&self, opt: &DuplicateEventOptions) -> Result<Program> {
        let mut prog = Program::new();
        prog.add_common_block(&opt.common);

        let builder = combine_time_helpers(vec![
            new_time_measure_prepare(CONVERTER_HIDDEN_KEY),
            new_duplicate_event(),
            new_dumper(&opt.common, &opt.dump, opt.exit),
        ]);

        self.build_time_probe(
            &mut prog,
            None,
            &opt.spec,
            &opt.dump.field_group_rows,
            &opt.common,
            builder,
        )
        .map_err(|err| probe_build_error(&opt.spec.probe, err))?;

        prog.add_aggr_cleanup_block(&["@start_time"]);
        Ok(prog)
    }

    fn build_time_trace(
        &self,
        opt: &TimeCommonOptions,
        rows: &[String],
        from_builder: TimeBuilderHelper,
        to_builder: TimeBuilderHelper,
    ) -> Result<Program> {
        let mut prog = Program::new();
        prog.add_common_block(&opt.common);

        let from_ctx = self
            .build_time_probe(&mut prog, None, &opt.from_spec, rows, &opt.common, from_builder)
            .map_err(|err| probe_build_error(format!("{} (from)", opt.from_spec.probe), err))?;

        self.build_time_probe(
            &mut prog,
            Some(&from_ctx),
            &opt.to_spec,
            rows,
            &opt.common,
            to_builder,
        )
        .map_err(|err| probe_build_error(format!("{} (to)", opt.to_spec.probe), err))?;

        Ok(prog)
    }

    /// Builds one timed probe. The `from` probe computes everything from
    /// scratch; the `to` probe reuses probe, keys and filters from the base
    /// context when its spec leaves them out.
    fn build_time_probe(
        &self,
        prog: &mut Program,
        ctx_base: Option<&TimeProbeContext>,
        spec: &TimeSpec,
        rows: &[String],
        opt: &CommonOptions,
        mut builder: TimeBuilderHelper,
    ) -> anyhow::Result<TimeProbeContext> {
        let mut ctx = TimeProbeContext {
            probe_name: spec.probe.clone(),
            ..Default::default()
        };

        let mut hints = opt.hints.clone();
        hints.extend(spec.hints.iter().cloned());

        let mut bo_set: Option<HashSet<String>> = None;

        let mut shared_filters = false;
        if !spec.filter_options.filters.is_empty() || !spec.filter_options.raw_filters.is_empty() {
            ctx.filters = self.prepare_filters(&spec.filter_options)?;
            let bo = bo_set
                .get_or_insert_with(|| self.new_build_object_set(&ctx.filters, rows, &hints));
            self.resolve_weak_filters(&mut ctx.filters, bo)?;
        } else if let Some(base) = ctx_base {
            ctx.filters = base.filters.clone();
            shared_filters = true;
        }

        let base_probe_matches = ctx_base
            .map(|base| base.probe_name == spec.probe && base.probe_block.is_some())
            .unwrap_or(false);
        if !base_probe_matches {
            let (probe_block, outer_block) =
                self.add_probe_block(prog, &spec.probe, false, &ctx.filters)?;
            ctx.probe_block = Some(probe_block);
            ctx.outer_block = Some(outer_block);
        } else {
            let base = ctx_base.expect("matching base context");
            ctx.probe_block = base.probe_block;
            if !shared_filters {
                let probe_block = base.probe_block.expect("base probe block");
                ctx.outer_block = Some(self.wrap_filters(prog, probe_block, &ctx.filters)?);
            } else {
                // Both the filters and the probe match, so the previous
                // probe's innermost block can be extended directly.
                ctx.outer_block = base.outer_block;
            }
        }
        ctx.block = ctx.outer_block;

        if !spec.keys.is_empty() {
            ctx.keys = self.prepare_keys(&spec.keys)?;
            let bo = bo_set
                .get_or_insert_with(|| self.new_build_object_set(&ctx.filters, rows, &hints));
            self.resolve_weak_keys(&mut ctx.keys, bo)?;
        } else if let Some(base) = ctx_base.filter(|base| !base.keys.is_empty()) {
            ctx.keys = base.keys.clone();
        } else {
            bail!("no keys supplied for time probe");
        }

        builder(self, prog, &mut ctx)?;
        Ok(ctx)
    }
}
