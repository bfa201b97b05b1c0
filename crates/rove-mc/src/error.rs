//! Errors of the search driver, replay and run configuration.

use rove_vm::VmError;
use thiserror::Error;

/// Fatal error while searching. Property violations are not errors; they
/// are reported in the [`SearchReport`](crate::search::SearchReport).
#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Vm(#[from] VmError),

    #[error("{feature} requires {requirement}")]
    Unsupported {
        feature: &'static str,
        requirement: &'static str,
    },
}

pub type SearchResult<T> = Result<T, SearchError>;

/// A trace that does not describe a path of the program.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Vm(#[from] VmError),

    #[error("trace diverges at step {step}: expected generator '{expected}', found '{found}'")]
    Mismatch {
        step: usize,
        expected: String,
        found: String,
    },

    #[error("trace step {step} picks choice {index} of generator '{id}', which has {total}")]
    IndexOutOfRange {
        step: usize,
        id: String,
        index: usize,
        total: usize,
    },

    #[error("trace ends at step {step} inside a chain of {needed} generators")]
    TooShort { step: usize, needed: usize },

    #[error("program ended after step {step}, but the trace has {len} steps")]
    TooLong { step: usize, len: usize },

    #[error("invalid trace file: {0}")]
    Format(#[from] serde_json::Error),
}

pub type ReplayResult<T> = Result<T, ReplayError>;

/// Bad run configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown option '{key}'")]
    UnknownKey { key: String },

    #[error("invalid value '{value}' for '{key}': expected {expected}")]
    InvalidValue {
        key: String,
        value: String,
        expected: &'static str,
    },

    #[error("line {line}: expected 'key = value', found '{text}'")]
    Syntax { line: usize, text: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
