//! Error types for the operator schema model
//!
//! Every failure in this crate is a construction-time error: the input is
//! authored configuration, so nothing here is recoverable. Each layer has its
//! own error enum and [`ModelError`] ties them together for the batch loader.

use thiserror::Error;

use crate::keys::DispatchKey;
use crate::native_function::Location;
use crate::operator_name::OperatorName;

/// Main error type for a batch load
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("{0}")]
    Record(#[from] RecordError),

    #[error("Group error: {0}")]
    Group(#[from] GroupError),

    #[error("Backend index error: {0}")]
    Backend(#[from] BackendError),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

// =============================================================================
// GRAMMAR / SCHEMA ERRORS
// =============================================================================

/// Errors raised while parsing schema text or checking schema invariants
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("unrecognized type {0}")]
    UnrecognizedType(String),

    #[error("unrecognized alias annotation {0}")]
    UnrecognizedAnnotation(String),

    #[error("unrecognized alias analysis form with Tensor: '{0}'")]
    InvalidAnnotatedType(String),

    #[error("invalid argument '{0}': expected '<type> <name>[=<default>]'")]
    InvalidArgument(String),

    #[error("invalid syntax: kwarg-only specifier * can only occur once in '{0}'")]
    DuplicateKwargOnlyMarker(String),

    #[error("non-mutable argument '{argument}' follows out arguments in '{arguments}'")]
    NonMutableAfterOut { argument: String, arguments: String },

    #[error("invalid operator name '{name}': {reason}")]
    InvalidOperatorName { name: String, reason: String },

    #[error("invalid function schema: {0}")]
    InvalidSchema(String),

    #[error("{what} does not round trip: {parsed} != {original}")]
    RoundTrip {
        what: &'static str,
        parsed: String,
        original: String,
    },

    #[error("{message}; schema: {schema}")]
    Invariant { schema: String, message: String },
}

impl SchemaError {
    pub(crate) fn invariant(schema: impl Into<String>, message: impl Into<String>) -> Self {
        SchemaError::Invariant {
            schema: schema.into(),
            message: message.into(),
        }
    }

    /// Compare a re-printed value against its source text
    pub(crate) fn check_round_trip(
        what: &'static str,
        parsed: String,
        original: &str,
    ) -> Result<(), SchemaError> {
        if parsed == original {
            Ok(())
        } else {
            Err(SchemaError::RoundTrip {
                what,
                parsed,
                original: original.to_string(),
            })
        }
    }
}

// =============================================================================
// RECORD ERRORS
// =============================================================================

/// Failure to build a native function record from one configuration entry
#[derive(Error, Debug)]
#[error("{loc}: {kind}")]
pub struct RecordError {
    pub loc: Location,
    pub kind: RecordErrorKind,
}

impl RecordError {
    pub fn new(loc: &Location, kind: impl Into<RecordErrorKind>) -> Self {
        Self {
            loc: loc.clone(),
            kind: kind.into(),
        }
    }
}

/// What went wrong inside a configuration entry
#[derive(Error, Debug)]
pub enum RecordErrorKind {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("malformed entry: {0}")]
    Malformed(#[from] serde_yaml::Error),

    #[error("leftover entries: {}", .0.join(", "))]
    LeftoverEntries(Vec<String>),

    #[error("illegal variant {0}")]
    IllegalVariant(String),

    #[error("illegal tag {0}")]
    IllegalTag(String),

    #[error("unknown dispatch key {0}")]
    UnknownDispatchKey(String),

    #[error("Dispatch key {key} of kernel {kernel} is not a supported dispatch key.")]
    UnsupportedDispatchKey { key: DispatchKey, kernel: String },

    #[error("invalid '{field}': {message}")]
    InvalidField {
        field: &'static str,
        message: String,
    },

    #[error("{0}")]
    Constraint(String),
}

// =============================================================================
// FAMILY ERRORS
// =============================================================================

/// Inconsistent function families
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GroupError {
    #[error("cannot group an empty set of functions")]
    Empty,

    #[error("function group for {0} has no functional variant")]
    MissingFunctional(String),

    #[error(
        "NativeFunctionsGroup constructed from two NativeFunctions that don't have matching signatures: {expected} != {found}"
    )]
    SignatureMismatch { expected: String, found: String },

    #[error("{name} is registered as a {expected} variant but its schema is {found}")]
    KindMismatch {
        name: String,
        expected: String,
        found: String,
    },

    #[error("{kind} variant registered twice for signature {signature}: {first} and {second}")]
    DuplicateKind {
        signature: String,
        kind: String,
        first: String,
        second: String,
    },

    #[error("structured group {name}: {message}")]
    Structured { name: String, message: String },

    #[error("{name} delegates to {delegate} but its actual delegate is {actual}")]
    WrongDelegate {
        name: String,
        delegate: String,
        actual: String,
    },

    #[error(
        "The codegen expects to be able to generate '{generated}'. To do so, it expects a line: 'autogen: {generated}'. Instead, it found 'autogen: {declared}'"
    )]
    AutogenMismatch { generated: String, declared: String },

    #[error("view group {name}: {message}")]
    View { name: String, message: String },
}

// =============================================================================
// BACKEND INDEX ERRORS
// =============================================================================

/// Conflicts while merging per-dispatch-key kernel tables
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("duplicate operator {op} for dispatch key {key}")]
    DuplicateOperator { op: OperatorName, key: DispatchKey },
}
