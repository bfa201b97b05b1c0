//! The backtrackable part of the VM.
//!
//! Everything that differs between two program states lives in
//! [`KernelState`]. Cloning it shares structure with the original, which is
//! what makes snapshots cheap; comparing two kernels is exact.

use crate::heap::Heap;
use crate::monitor::{Monitor, MonitorTarget};
use crate::statics::{InitState, StaticArea};
use crate::thread::{Blocker, ThreadContext, ThreadId, ThreadStatus};
use crate::value::ObjRef;
use rove_ir::{ClassId, Program};
use std::sync::Arc;

/// Exception that escaped the outermost frame of a thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UncaughtException {
    pub thread: ThreadId,
    pub class: Arc<str>,
    pub detail: Option<Arc<str>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelState {
    pub heap: Heap,
    /// Indexed by `ClassId`.
    pub statics: im::Vector<Arc<StaticArea>>,
    /// Indexed by `ThreadId`; terminated threads stay in place.
    pub threads: Vec<Arc<ThreadContext>>,
    /// Thread that ran the last transition.
    pub exec_thread: Option<ThreadId>,
    pub uncaught: Option<UncaughtException>,
    /// Set by `Verify.ignoreIf(true)`: the state is pruned.
    pub ignored: bool,
}

impl KernelState {
    pub fn new(program: &Program) -> Self {
        let statics = program
            .classes()
            .map(|class| {
                let mut area = StaticArea::new(class);
                let needs_init = program
                    .superclass_chain(class.id)
                    .any(|c| program.class(c).class_initializer().is_some());
                if !needs_init {
                    area.init = InitState::Initialized;
                }
                Arc::new(area)
            })
            .collect();
        Self {
            heap: Heap::new(),
            statics,
            threads: Vec::new(),
            exec_thread: None,
            uncaught: None,
            ignored: false,
        }
    }

    pub fn thread(&self, id: ThreadId) -> &ThreadContext {
        &self.threads[id.index()]
    }

    pub fn thread_mut(&mut self, id: ThreadId) -> &mut ThreadContext {
        Arc::make_mut(&mut self.threads[id.index()])
    }

    pub fn add_thread(&mut self, thread: ThreadContext) {
        debug_assert_eq!(thread.id.index(), self.threads.len());
        self.threads.push(Arc::new(thread));
    }

    pub fn next_thread_id(&self) -> ThreadId {
        ThreadId(self.threads.len() as u32)
    }

    /// Runnable threads in id order.
    pub fn runnable_threads(&self) -> Vec<ThreadId> {
        self.threads
            .iter()
            .filter(|t| t.is_runnable())
            .map(|t| t.id)
            .collect()
    }

    pub fn live_threads(&self) -> usize {
        self.threads.iter().filter(|t| t.is_alive()).count()
    }

    /// Every thread has terminated.
    pub fn is_end_state(&self) -> bool {
        !self.threads.is_empty() && self.live_threads() == 0
    }

    /// Some thread is alive but none can run.
    pub fn is_deadlocked(&self) -> bool {
        self.live_threads() > 0 && !self.threads.iter().any(|t| t.is_runnable())
    }

    pub fn static_area(&self, class: ClassId) -> &StaticArea {
        &self.statics[class.index()]
    }

    pub fn static_area_mut(&mut self, class: ClassId) -> &mut StaticArea {
        Arc::make_mut(&mut self.statics[class.index()])
    }

    pub fn monitor(&self, target: MonitorTarget) -> Option<&Monitor> {
        match target {
            MonitorTarget::Object(r) => self.heap.get(r).map(|o| &o.monitor),
            MonitorTarget::Class(c) => self.statics.get(c.index()).map(|s| &s.monitor),
        }
    }

    pub fn monitor_mut(&mut self, target: MonitorTarget) -> Option<&mut Monitor> {
        match target {
            MonitorTarget::Object(r) => self.heap.get_mut(r).map(|o| &mut o.monitor),
            MonitorTarget::Class(c) => {
                if c.index() < self.statics.len() {
                    Some(&mut self.static_area_mut(c).monitor)
                } else {
                    None
                }
            }
        }
    }

    /// Make a blocked thread runnable again, keeping a pending wait record.
    pub fn wake(&mut self, id: ThreadId) {
        let t = self.thread_mut(id);
        if t.status == ThreadStatus::Terminated {
            return;
        }
        t.status = ThreadStatus::Runnable;
        if !matches!(t.blocker, Some(Blocker::Wait { notified: true, .. })) {
            t.blocker = None;
        }
    }

    /// Wake every thread blocked for the given reason.
    pub fn wake_blocked_on(&mut self, blocker: Blocker) -> usize {
        let ids: Vec<ThreadId> = self
            .threads
            .iter()
            .filter(|t| t.status == ThreadStatus::Blocked && t.blocker == Some(blocker))
            .map(|t| t.id)
            .collect();
        for &id in &ids {
            self.wake(id);
        }
        ids.len()
    }

    /// Roots of the object graph: thread stacks, thread objects, objects
    /// threads are waiting on, and static fields.
    pub fn roots(&self) -> Vec<ObjRef> {
        let mut roots = Vec::new();
        for t in &self.threads {
            roots.extend(t.object);
            for frame in &t.frames {
                roots.extend(frame.references());
                if let Some(MonitorTarget::Object(r)) = frame.lock {
                    roots.push(r);
                }
            }
            match t.blocker {
                Some(Blocker::Wait { obj, .. }) => roots.push(obj),
                Some(Blocker::Monitor(MonitorTarget::Object(r))) => roots.push(r),
                _ => {}
            }
        }
        for area in self.statics.iter() {
            roots.extend(area.values.iter().filter_map(|v| v.object()));
        }
        roots
    }

    pub fn collect_garbage(&mut self) -> usize {
        let roots = self.roots();
        self.heap.gc(roots)
    }

    /// Mark `r` and everything reachable from it as shared between threads.
    pub fn expose(&mut self, r: ObjRef) {
        for obj in self.heap.reachable([r]) {
            if self.is_shared(obj) {
                continue;
            }
            if let Some(o) = self.heap.get_mut(obj) {
                o.shared = true;
            }
        }
    }

    /// Whether accessing `r` may race with another thread.
    pub fn is_shared(&self, r: ObjRef) -> bool {
        self.heap.get(r).is_some_and(|o| o.shared)
    }
}
