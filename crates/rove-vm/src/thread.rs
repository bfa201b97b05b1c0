//! Simulated threads.

use crate::frame::StackFrame;
use crate::monitor::MonitorTarget;
use crate::value::ObjRef;
use rove_ir::ClassId;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u32);

impl ThreadId {
    pub const MAIN: ThreadId = ThreadId(0);

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadStatus {
    Runnable,
    /// Waiting to enter a monitor, for a class initializer, or for a join.
    Blocked,
    /// Inside `Object.wait()` and not yet notified.
    Waiting,
    Terminated,
}

/// Why a thread is not runnable, or which wait it is returning from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Blocker {
    Monitor(MonitorTarget),
    ClassInit(ClassId),
    Join(ThreadId),
    Wait {
        obj: ObjRef,
        saved_count: u32,
        notified: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThreadContext {
    pub id: ThreadId,
    pub status: ThreadStatus,
    pub frames: Vec<StackFrame>,
    /// The thread object `start()` was called on; `None` for the main thread.
    pub object: Option<ObjRef>,
    pub blocker: Option<Blocker>,
}

impl ThreadContext {
    pub fn new(id: ThreadId, object: Option<ObjRef>, frame: StackFrame) -> Self {
        Self {
            id,
            status: ThreadStatus::Runnable,
            frames: vec![frame],
            object,
            blocker: None,
        }
    }

    pub fn is_runnable(&self) -> bool {
        self.status == ThreadStatus::Runnable
    }

    pub fn is_alive(&self) -> bool {
        self.status != ThreadStatus::Terminated
    }

    pub fn top(&self) -> Option<&StackFrame> {
        self.frames.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut StackFrame> {
        self.frames.last_mut()
    }
}
