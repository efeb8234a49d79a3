//! Errors surfaced by the tuner.
//!
//! Configuration errors abort the API call that caused them. Device errors
//! raised while running a single configuration are caught by the engine and
//! turned into a failed result entry instead, so the tuning loop continues.
use std::io;

use failure::Fail;

#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "invalid kernel id: {}", _0)]
    InvalidKernelId(usize),
    #[fail(display = "parameter {} is already defined", _0)]
    DuplicateParameter(String),
    #[fail(display = "parameter {} has no values", _0)]
    EmptyParameter(String),
    #[fail(display = "unknown parameter: {}", _0)]
    UnknownParameter(String),
    #[fail(display = "no reference kernel was set")]
    MissingReference,
    #[fail(display = "mismatching global/local dimension counts: {} vs {}", _0, _1)]
    DimensionMismatch(usize, usize),
    #[fail(display = "modifier divides by zero through parameter {}", _0)]
    ZeroModifier(String),
    #[fail(display = "invalid iteration count {} for parameter {}", _1, _0)]
    InvalidIterationCount(String, usize),
    #[fail(display = "tolerance must be non-negative, got {}", _0)]
    InvalidTolerance(f64),
    #[fail(
        display = "parameter {} of the local memory predicate cannot be bound",
        _0
    )]
    InvalidLocalMemorySpec(String),
    #[fail(display = "no scalar argument of matching type at index {}", _0)]
    InvalidScalarIndex(usize),
    #[fail(display = "searcher is not initialized; call num_configurations first")]
    SearcherNotInitialized,
    #[fail(display = "device compilation failed: {}", _0)]
    CompileError(String),
    #[fail(display = "device error: {}", _0)]
    DeviceError(String),
    #[fail(
        display = "kernel requires {} bytes of local memory, above the device limit",
        _0
    )]
    LocalMemoryExceeded(usize),
    #[fail(display = "{}", _0)]
    Io(#[cause] io::Error),
    #[fail(display = "report serialization failed")]
    Json(#[cause] serde_json::Error),
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Error {
        Error::Io(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Error {
        Error::Json(error)
    }
}
