//! Leveled build errors
//!
//! Every failure during a build carries the catalog level it originated at
//! (probe, row, object, filter, field or struct definition) and the name of
//! the offending instance, optionally wrapping an inner cause. A few generic
//! messages are shared across levels so that front ends can pick a usage hint
//! from the `(level, message)` pair without parsing free text.
//!
//! Registration-time violations (duplicate names, self-referencing sanity
//! filters, unregistered-feature queries) are programmer errors and panic;
//! only build-time violations travel through `BuildError`.

use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

/// Generic message for lookups of unknown probes, rows, objects and fields.
pub const MSG_NOT_FOUND: &str = "not found";

/// Generic message for malformed filter or field text.
pub const MSG_PARSE_ERROR: &str = "parse error";

/// Generic message for a missing instance name (e.g. an empty probe name).
pub const MSG_NOT_SPECIFIED: &str = "instance name is not specified";

/// Catalog level an error originated at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorLevel {
    Probe,
    Row,
    Object,
    Filter,
    Field,
    StructDef,
}

impl fmt::Display for ErrorLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorLevel::Probe => "probe",
            ErrorLevel::Row => "row",
            ErrorLevel::Object => "object",
            ErrorLevel::Filter => "filter",
            ErrorLevel::Field => "field",
            ErrorLevel::StructDef => "structdef",
        };
        f.write_str(s)
    }
}

/// Error produced while building a trace program.
///
/// Errors chain: resolving an object may fail because a cast template inside
/// it failed, which may fail because a named function was missing. The chain
/// is exposed through [`std::error::Error::source`], so front ends can walk
/// it, print one line per level and downcast specific inner causes (for
/// example [`crate::field_helpers::InvalidIpv4Address`]).
#[derive(Debug, Error)]
#[error("error in {level} '{ident}': {message}")]
pub struct BuildError {
    level: ErrorLevel,
    ident: String,
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl BuildError {
    pub fn new(level: ErrorLevel, ident: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            ident: ident.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn with_cause(
        level: ErrorLevel,
        ident: impl Into<String>,
        message: impl Into<String>,
        cause: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Self {
            level,
            ident: ident.into(),
            message: message.into(),
            source: Some(cause.into()),
        }
    }

    pub fn level(&self) -> ErrorLevel {
        self.level
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Inner cause, if any. Same as [`std::error::Error::source`] but without
    /// going through the trait object.
    pub fn cause(&self) -> Option<&(dyn StdError + 'static)> {
        match &self.source {
            Some(source) => Some(source.as_ref()),
            None => None,
        }
    }
}

/// Result alias used throughout the builder.
pub type Result<T> = std::result::Result<T, BuildError>;
