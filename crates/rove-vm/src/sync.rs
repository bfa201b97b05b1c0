//! Monitors, class initialization and the thread lifecycle.
//!
//! Every operation here that can make a thread wait reports a scheduling
//! event; blocking events are mandatory choice points, so a blocked thread
//! never holds up the transition it was part of.

use crate::error::{VmError, VmResult};
use crate::frame::{FrameKind, StackFrame};
use crate::monitor::MonitorTarget;
use crate::native::NativeOutcome;
use crate::scheduler::SchedEvent;
use crate::statics::InitState;
use crate::thread::{Blocker, ThreadContext, ThreadId, ThreadStatus};
use crate::value::{ObjRef, Value};
use crate::vm::Vm;
use rove_ir::{prelude, ClassId, MethodSig, Type};
use smallvec::SmallVec;
use tracing::debug;

impl Vm {
    // === Monitors ===

    pub(crate) fn monitor_shared(&self, target: MonitorTarget) -> bool {
        match target {
            MonitorTarget::Object(r) => self.kernel.is_shared(r),
            MonitorTarget::Class(_) => self.kernel.live_threads() > 1,
        }
    }

    /// Enter `target` for `thread`. Returns `false` when the instruction has
    /// to be executed again later: a choice point was registered before
    /// entering a free monitor, or the monitor is held by another thread.
    pub(crate) fn acquire(
        &mut self,
        thread: ThreadId,
        target: MonitorTarget,
        first_step: bool,
    ) -> VmResult<bool> {
        let (owned, free) = self
            .kernel
            .monitor(target)
            .map(|m| (m.is_owned_by(thread), m.is_free()))
            .ok_or_else(|| VmError::malformed(format!("no monitor for {target}")))?;
        if free && !first_step {
            let shared = self.monitor_shared(target);
            if self.schedule(thread, SchedEvent::LockAcquire { shared }) {
                return Ok(false);
            }
        }
        if owned || free {
            if let Some(m) = self.kernel.monitor_mut(target) {
                m.enter(thread);
            }
            return Ok(true);
        }
        self.block_on_monitor(thread, target, Blocker::Monitor(target));
        Ok(false)
    }

    /// Park `thread` as a contender of a monitor held by someone else.
    fn block_on_monitor(&mut self, thread: ThreadId, target: MonitorTarget, blocker: Blocker) {
        if let Some(m) = self.kernel.monitor_mut(target) {
            m.add_contender(thread);
        }
        let t = self.kernel.thread_mut(thread);
        t.status = ThreadStatus::Blocked;
        t.blocker = Some(blocker);
        debug!(thread = %thread, monitor = %target, "blocked on monitor");
        self.schedule(thread, SchedEvent::LockBlocked);
    }

    /// Leave `target` once. Returns `None` when `thread` does not own it,
    /// otherwise whether contenders were woken.
    pub(crate) fn release(&mut self, thread: ThreadId, target: MonitorTarget) -> Option<bool> {
        let m = self.kernel.monitor_mut(target)?;
        if !m.is_owned_by(thread) {
            return None;
        }
        let woken = m.exit();
        Some(self.wake_all(&woken))
    }

    /// Release a monitor taken by a synchronized frame on return or unwind.
    pub(crate) fn unlock_frame(&mut self, thread: ThreadId, target: MonitorTarget) -> VmResult<()> {
        let did_unblock = self.release(thread, target).ok_or_else(|| {
            VmError::malformed(format!("thread {thread} does not own {target} on return"))
        })?;
        self.schedule(thread, SchedEvent::LockRelease { did_unblock });
        Ok(())
    }

    fn wake_all(&mut self, threads: &[ThreadId]) -> bool {
        for &t in threads {
            self.kernel.wake(t);
        }
        !threads.is_empty()
    }

    /// `Object.wait()`: give up the monitor until notified, then take it
    /// back with the same recursion count.
    pub(crate) fn wait(&mut self, thread: ThreadId, obj: ObjRef) -> VmResult<NativeOutcome> {
        let target = MonitorTarget::Object(obj);
        let blocker = self.kernel.thread(thread).blocker;
        if let Some(
            pending @ Blocker::Wait {
                obj: waited,
                saved_count,
                notified: true,
            },
        ) = blocker
        {
            if waited == obj {
                let free = self.kernel.monitor(target).is_some_and(|m| m.is_free());
                if !free {
                    self.block_on_monitor(thread, target, pending);
                    return Ok(NativeOutcome::Break);
                }
                if let Some(m) = self.kernel.monitor_mut(target) {
                    m.owner = Some(thread);
                    m.count = saved_count;
                }
                self.kernel.thread_mut(thread).blocker = None;
                return Ok(NativeOutcome::void());
            }
        }

        let Some(m) = self.kernel.monitor_mut(target) else {
            return Err(VmError::malformed(format!("no monitor for {target}")));
        };
        if !m.is_owned_by(thread) {
            return Ok(illegal_monitor_state("wait"));
        }
        let (saved_count, woken) = m.release_all();
        m.waiters.push(thread);
        self.wake_all(&woken);
        let t = self.kernel.thread_mut(thread);
        t.status = ThreadStatus::Waiting;
        t.blocker = Some(Blocker::Wait {
            obj,
            saved_count,
            notified: false,
        });
        debug!(thread = %thread, object = %obj, "waiting");
        self.schedule(thread, SchedEvent::Wait);
        Ok(NativeOutcome::Break)
    }

    /// `Object.notify()` / `notifyAll()`. Notified threads contend for the
    /// monitor once the notifier releases it. `notify` picks the thread that
    /// has waited longest.
    pub(crate) fn notify(
        &mut self,
        thread: ThreadId,
        obj: ObjRef,
        all: bool,
    ) -> VmResult<NativeOutcome> {
        let target = MonitorTarget::Object(obj);
        let Some(m) = self.kernel.monitor_mut(target) else {
            return Err(VmError::malformed(format!("no monitor for {target}")));
        };
        if !m.is_owned_by(thread) {
            return Ok(illegal_monitor_state(if all { "notifyAll" } else { "notify" }));
        }
        let notified: SmallVec<[ThreadId; 2]> = if all {
            std::mem::take(&mut m.waiters)
        } else if m.waiters.is_empty() {
            SmallVec::new()
        } else {
            std::iter::once(m.waiters.remove(0)).collect()
        };
        for &w in &notified {
            m.add_contender(w);
        }
        for &w in &notified {
            let t = self.kernel.thread_mut(w);
            t.status = ThreadStatus::Blocked;
            if let Some(Blocker::Wait { obj, saved_count, .. }) = t.blocker {
                t.blocker = Some(Blocker::Wait {
                    obj,
                    saved_count,
                    notified: true,
                });
            }
        }
        self.schedule(
            thread,
            SchedEvent::Notify {
                did_notify: !notified.is_empty(),
            },
        );
        Ok(NativeOutcome::void())
    }

    // === Threads ===

    /// `Thread.start()` on `obj`: create a thread running `obj.run()`.
    pub(crate) fn start_thread(&mut self, thread: ThreadId, obj: ObjRef) -> VmResult<NativeOutcome> {
        let object = self
            .kernel
            .heap
            .get(obj)
            .ok_or_else(|| VmError::malformed(format!("dangling thread object {obj}")))?;
        if object.thread.is_some() {
            return Ok(NativeOutcome::throw(
                prelude::ILLEGAL_THREAD_STATE_EXCEPTION,
                "thread already started",
            ));
        }
        let run_sig = MethodSig::new(Vec::new(), Type::Void);
        let run = self
            .program
            .find_method(object.class, "run", &run_sig)
            .ok_or_else(|| VmError::UnresolvedMethod {
                name: format!("{}.run()V", self.program.class(object.class).name),
                location: Default::default(),
            })?;
        let method = self.program.method(run);
        if method.is_synchronized() || method.is_native() {
            return Err(VmError::unsupported(format!(
                "{method} cannot be a thread entry point"
            )));
        }
        let frame = StackFrame::new(run, method.max_locals, FrameKind::Normal)
            .with_args(&[Value::Ref(obj)]);
        let id = self.kernel.next_thread_id();
        self.kernel
            .add_thread(ThreadContext::new(id, Some(obj), frame));
        if let Some(o) = self.kernel.heap.get_mut(obj) {
            o.thread = Some(id);
        }
        self.kernel.expose(obj);
        debug!(thread = %thread, started = %id, "thread started");
        self.schedule(thread, SchedEvent::ThreadStart);
        Ok(NativeOutcome::void())
    }

    /// `Thread.join()` on `obj`. Returns at once for threads never started.
    pub(crate) fn join(&mut self, thread: ThreadId, obj: ObjRef) -> VmResult<NativeOutcome> {
        let target = self.kernel.heap.get(obj).and_then(|o| o.thread);
        let Some(target) = target else {
            return Ok(NativeOutcome::void());
        };
        if !self.kernel.thread(target).is_alive() {
            return Ok(NativeOutcome::void());
        }
        let t = self.kernel.thread_mut(thread);
        t.status = ThreadStatus::Blocked;
        t.blocker = Some(Blocker::Join(target));
        self.schedule(thread, SchedEvent::Join);
        Ok(NativeOutcome::Break)
    }

    /// End `thread`: drop its frames, release every monitor it still owns
    /// and wake the threads joining it.
    pub(crate) fn terminate(&mut self, thread: ThreadId) {
        let t = self.kernel.thread_mut(thread);
        t.status = ThreadStatus::Terminated;
        t.frames.clear();
        t.blocker = None;

        let owned: Vec<ObjRef> = self
            .kernel
            .heap
            .iter()
            .filter(|(_, o)| o.monitor.is_owned_by(thread))
            .map(|(r, _)| r)
            .collect();
        let mut targets: Vec<MonitorTarget> = owned.into_iter().map(MonitorTarget::Object).collect();
        targets.extend(
            self.kernel
                .statics
                .iter()
                .enumerate()
                .filter(|(_, s)| s.monitor.is_owned_by(thread))
                .map(|(i, _)| MonitorTarget::Class(ClassId(i as u32))),
        );
        for target in targets {
            if let Some(m) = self.kernel.monitor_mut(target) {
                let (_, woken) = m.release_all();
                self.wake_all(&woken);
            }
        }
        let joiners = self.kernel.wake_blocked_on(Blocker::Join(thread));
        debug!(thread = %thread, joiners, "thread terminated");
        self.schedule(thread, SchedEvent::ThreadTerminate);
    }

    // === Class initialization ===

    /// Make sure `class` and its superclasses are initialized before
    /// `thread` touches them. Returns `false` when the current instruction
    /// must wait: initializer frames were pushed, or another thread is
    /// running an initializer.
    pub(crate) fn ensure_initialized(&mut self, thread: ThreadId, class: ClassId) -> VmResult<bool> {
        if self.kernel.static_area(class).is_initialized() {
            return Ok(true);
        }
        let program = std::sync::Arc::clone(&self.program);
        let mut pending = Vec::new();
        for c in program.superclass_chain(class) {
            match self.kernel.static_area(c).init {
                InitState::Initialized => {}
                InitState::InProgress(owner) if owner == thread => {}
                InitState::InProgress(_) => {
                    let t = self.kernel.thread_mut(thread);
                    t.status = ThreadStatus::Blocked;
                    t.blocker = Some(Blocker::ClassInit(c));
                    debug!(thread = %thread, class = %program.class(c).name, "blocked on class init");
                    self.schedule(thread, SchedEvent::ClassInitBlocked);
                    return Ok(false);
                }
                InitState::Uninitialized => pending.push(c),
            }
        }

        // A class without `<clinit>` is initialized once its superclasses
        // are, so it stays in progress while one of theirs runs.
        let mut super_running = false;
        for &c in pending.iter().rev() {
            let state = if program.class(c).class_initializer().is_some() {
                super_running = true;
                InitState::InProgress(thread)
            } else if super_running {
                InitState::InProgress(thread)
            } else {
                InitState::Initialized
            };
            self.kernel.static_area_mut(c).init = state;
        }

        // Subclass frames go first so the superclass initializer runs first.
        let mut pushed = false;
        for c in pending {
            if let Some(clinit) = program.class(c).class_initializer() {
                let frame = StackFrame::new(clinit.id, clinit.max_locals, FrameKind::ClassInit(c));
                self.kernel.thread_mut(thread).frames.push(frame);
                pushed = true;
            }
        }
        Ok(!pushed)
    }

    /// `<clinit>` of `class` returned or threw. Subclasses without an
    /// initializer of their own complete with it.
    pub(crate) fn finish_class_init(&mut self, class: ClassId) {
        self.kernel.static_area_mut(class).init = InitState::Initialized;
        self.kernel.wake_blocked_on(Blocker::ClassInit(class));

        let program = std::sync::Arc::clone(&self.program);
        loop {
            let ready: Vec<ClassId> = program
                .classes()
                .filter(|c| c.class_initializer().is_none())
                .map(|c| c.id)
                .filter(|&c| {
                    matches!(self.kernel.static_area(c).init, InitState::InProgress(_))
                        && program
                            .superclass_chain(c)
                            .skip(1)
                            .all(|s| self.kernel.static_area(s).is_initialized())
                })
                .collect();
            if ready.is_empty() {
                break;
            }
            for c in ready {
                debug!(class = %program.class(c).name, "initialized with superclass");
                self.kernel.static_area_mut(c).init = InitState::Initialized;
                self.kernel.wake_blocked_on(Blocker::ClassInit(c));
            }
        }
    }
}

fn illegal_monitor_state(op: &str) -> NativeOutcome {
    NativeOutcome::throw(
        prelude::ILLEGAL_MONITOR_STATE_EXCEPTION,
        format!("current thread is not owner ({op})"),
    )
}
