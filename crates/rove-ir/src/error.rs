//! Metadata errors.

use thiserror::Error;

/// Error raised while registering classes or checking method bodies.
///
/// These are tool-internal: a program that triggers one cannot be explored.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetadataError {
    #[error("invalid descriptor '{descriptor}'")]
    InvalidDescriptor { descriptor: String },

    #[error("duplicate class '{name}'")]
    DuplicateClass { name: String },

    #[error("duplicate member '{member}' in class '{class}'")]
    DuplicateMember { class: String, member: String },

    #[error("class '{class}' extends unknown class '{superclass}'")]
    UnknownSuperclass { class: String, superclass: String },

    #[error("inheritance cycle through class '{class}'")]
    InheritanceCycle { class: String },

    #[error("entry point '{name}' not found")]
    MissingEntry { name: String },

    #[error("entry point '{name}' must be a static method taking no arguments")]
    InvalidEntry { name: String },

    #[error("malformed code in {method} at pc {pc}: {message}")]
    MalformedCode {
        method: String,
        pc: usize,
        message: String,
    },
}

pub type MetadataResult<T> = Result<T, MetadataError>;
