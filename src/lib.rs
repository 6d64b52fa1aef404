//! Trazar - declarative bpftrace script compiler
//!
//! This library composes runnable bpftrace source text from a declarative
//! catalog of kernel/network object types, fields and probe attach-points.
//! Collaborators register catalogs into a [`Builder`]; build requests name
//! probes, display rows, filters and grouping keys, and the engine resolves
//! how to obtain each named value from whichever probe context is active -
//! inserting required type casts, sanity-filter guards and byte-order
//! conversions - and renders syntactically valid, version-appropriate
//! source. The library never executes a trace: it is a pure, request-time
//! composer of source text.

pub mod builder;
pub mod errors;
pub mod features;
pub mod field_helpers;
pub mod fields;
pub mod filter;
pub mod object;
pub mod probes;
pub mod program;
pub mod template;
pub mod timeit;
pub mod tracer;
pub mod version;
pub mod weak_alias;

pub use builder::Builder;
pub use errors::{BuildError, ErrorLevel, MSG_NOT_FOUND, MSG_NOT_SPECIFIED, MSG_PARSE_ERROR};
pub use features::{
    CoreFeatures, Feature, FeatureComponent, FeatureComponentSpec, FeatureDef, FeatureFlagMask,
    FeatureRegistry,
};
pub use fields::{
    ConverterMask, ConverterOutput, Field, FieldConverter, FieldGroup, FieldPreprocessor,
    FilterOperator, CONVERTER_AGGREGATE_ARG, CONVERTER_ALL, CONVERTER_DUMP, CONVERTER_FILTER,
    CONVERTER_HIDDEN_KEY,
};
pub use filter::{Filter, FilterOptions, ProcessedFilter};
pub use object::Object;
pub use probes::Probe;
pub use program::{
    expr_field, expr_join, expr_join_op, AggrFunc, BlockId, Expression, Program, Statement,
};
pub use template::{CastFunction, CastFunctionMap, CastTemplate};
pub use timeit::{
    DuplicateEventOptions, TimeAggregateOptions, TimeCommonOptions, TimeOutlierDumpOptions,
    TimeSpec, TIME_UNIT_MICROSECOND, TIME_UNIT_MILLISECOND, TIME_UNIT_NANOSECOND,
    TIME_UNIT_SECOND,
};
pub use tracer::{
    CommonDumpOptions, CommonOptions, TimeMode, TraceAggregateOptions, TraceCommonOptions,
    TraceDumpOptions,
};
pub use version::{BpftraceVersionProvider, KernelVersionProvider, Version, VersionProvider};
