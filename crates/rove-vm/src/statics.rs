//! Per-class static storage and initialization state.

use crate::monitor::Monitor;
use crate::thread::ThreadId;
use crate::value::Value;
use rove_ir::ClassDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InitState {
    Uninitialized,
    /// `<clinit>` is running on the given thread.
    InProgress(ThreadId),
    Initialized,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StaticArea {
    pub values: Vec<Value>,
    pub init: InitState,
    pub monitor: Monitor,
}

impl StaticArea {
    pub fn new(class: &ClassDescriptor) -> Self {
        Self {
            values: class
                .static_fields
                .iter()
                .map(|f| Value::default_for(&f.ty))
                .collect(),
            init: InitState::Uninitialized,
            monitor: Monitor::default(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.init == InitState::Initialized
    }
}
