//! Monitor records attached to objects and classes.

use crate::thread::ThreadId;
use crate::value::ObjRef;
use rove_ir::ClassId;
use smallvec::SmallVec;
use std::fmt;

/// What a monitor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MonitorTarget {
    Object(ObjRef),
    /// Static synchronized methods lock the class.
    Class(ClassId),
}

impl fmt::Display for MonitorTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorTarget::Object(r) => write!(f, "{r}"),
            MonitorTarget::Class(c) => write!(f, "class#{}", c.0),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Monitor {
    pub owner: Option<ThreadId>,
    /// Recursion depth of the owner.
    pub count: u32,
    /// Threads blocked trying to enter, in arrival order.
    pub contenders: SmallVec<[ThreadId; 2]>,
    /// Threads in `wait()`, in arrival order.
    pub waiters: SmallVec<[ThreadId; 2]>,
}

impl Monitor {
    pub fn is_free(&self) -> bool {
        self.owner.is_none()
    }

    pub fn is_owned_by(&self, thread: ThreadId) -> bool {
        self.owner == Some(thread)
    }

    /// Take or re-enter the monitor. Caller checks it is free or already owned.
    pub fn enter(&mut self, thread: ThreadId) {
        debug_assert!(self.owner.is_none() || self.owner == Some(thread));
        self.owner = Some(thread);
        self.count += 1;
    }

    /// Leave once. Returns the contenders to wake when the monitor became free.
    pub fn exit(&mut self) -> SmallVec<[ThreadId; 2]> {
        self.count = self.count.saturating_sub(1);
        if self.count == 0 {
            self.owner = None;
            std::mem::take(&mut self.contenders)
        } else {
            SmallVec::new()
        }
    }

    /// Drop ownership entirely, returning the previous recursion count and
    /// the contenders to wake.
    pub fn release_all(&mut self) -> (u32, SmallVec<[ThreadId; 2]>) {
        let count = std::mem::take(&mut self.count);
        self.owner = None;
        (count, std::mem::take(&mut self.contenders))
    }

    pub fn add_contender(&mut self, thread: ThreadId) {
        if !self.contenders.contains(&thread) {
            self.contenders.push(thread);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recursive_enter_exit() {
        let mut m = Monitor::default();
        m.enter(ThreadId(1));
        m.enter(ThreadId(1));
        m.add_contender(ThreadId(2));
        assert!(m.exit().is_empty());
        assert!(m.is_owned_by(ThreadId(1)));
        assert_eq!(m.exit().as_slice(), &[ThreadId(2)]);
        assert!(m.is_free());
        assert!(m.contenders.is_empty());
    }

    #[test]
    fn test_release_all() {
        let mut m = Monitor::default();
        m.enter(ThreadId(0));
        m.enter(ThreadId(0));
        m.add_contender(ThreadId(3));
        m.add_contender(ThreadId(3));
        let (count, woken) = m.release_all();
        assert_eq!(count, 2);
        assert_eq!(woken.len(), 1);
        assert!(m.is_free());
    }
}
