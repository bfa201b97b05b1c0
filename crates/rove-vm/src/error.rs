//! Tool-internal errors raised while executing a program.
//!
//! These are failures of the checker or of the program's metadata, never of
//! the program under test: faults of the program become exceptions.

use rove_ir::MetadataError;
use std::fmt;
use thiserror::Error;

/// Instruction a [`VmError`] was raised at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    /// `Class.method`, empty when unknown.
    pub method: String,
    pub pc: usize,
}

impl Location {
    pub fn new(method: impl Into<String>, pc: usize) -> Self {
        Self {
            method: method.into(),
            pc,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.method.is_empty()
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            write!(f, "<unknown>")
        } else {
            write!(f, "{}@{}", self.method, self.pc)
        }
    }
}

#[derive(Debug, Error)]
pub enum VmError {
    #[error("unresolved class '{name}' at {location}")]
    UnresolvedClass { name: String, location: Location },

    #[error("unresolved method '{name}' at {location}")]
    UnresolvedMethod { name: String, location: Location },

    #[error("unresolved field '{name}' at {location}")]
    UnresolvedField { name: String, location: Location },

    #[error("unsupported at {location}: {message}")]
    Unsupported { message: String, location: Location },

    #[error("malformed execution at {location}: {message}")]
    Malformed { message: String, location: Location },

    #[error("no native peer for '{name}' at {location}")]
    MissingNative { name: String, location: Location },

    #[error("program has no entry point")]
    NoEntryPoint,

    #[error("unknown perturbation target '{spec}'")]
    UnknownPerturbTarget { spec: String },

    #[error("invalid exception injection '{spec}': {reason}")]
    InvalidInjection { spec: String, reason: String },

    #[error("unknown injection target in '{spec}'")]
    UnknownInjectTarget { spec: String },

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

impl VmError {
    pub fn malformed(message: impl Into<String>) -> Self {
        VmError::Malformed {
            message: message.into(),
            location: Location::default(),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        VmError::Unsupported {
            message: message.into(),
            location: Location::default(),
        }
    }

    pub fn location(&self) -> Option<&Location> {
        match self {
            VmError::UnresolvedClass { location, .. }
            | VmError::UnresolvedMethod { location, .. }
            | VmError::UnresolvedField { location, .. }
            | VmError::Unsupported { location, .. }
            | VmError::Malformed { location, .. }
            | VmError::MissingNative { location, .. } => Some(location),
            _ => None,
        }
    }

    /// Fill in the location if the error was raised without one.
    pub fn at(mut self, loc: &Location) -> Self {
        match &mut self {
            VmError::UnresolvedClass { location, .. }
            | VmError::UnresolvedMethod { location, .. }
            | VmError::UnresolvedField { location, .. }
            | VmError::Unsupported { location, .. }
            | VmError::Malformed { location, .. }
            | VmError::MissingNative { location, .. }
                if location.is_unknown() =>
            {
                *location = loc.clone();
            }
            _ => {}
        }
        self
    }
}

pub type VmResult<T> = Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_is_filled_once() {
        let err = VmError::malformed("bad").at(&Location::new("A.m", 3));
        assert_eq!(err.to_string(), "malformed execution at A.m@3: bad");
        let err = err.at(&Location::new("B.n", 9));
        assert_eq!(err.location(), Some(&Location::new("A.m", 3)));
        assert!(VmError::NoEntryPoint.at(&Location::new("A.m", 0)).location().is_none());
    }
}
