//! Where thread interleavings are explored.
//!
//! The interpreter reports every synchronization event and every access to
//! shared data as a [`SchedEvent`]. The active [`SyncPolicy`] rates it, and
//! the [`Scheduler`] turns relevant events into a thread choice generator
//! over the threads that can run at that point.

use crate::choice::{ChoiceDomain, ChoiceGenerator};
use crate::kernel::KernelState;
use crate::thread::ThreadId;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SchedulingRelevance {
    None,
    /// Worth a choice point when another thread could run instead.
    Optional,
    /// The current thread cannot continue; another thread has to be picked.
    Mandatory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedEvent {
    /// Start of the program.
    Root,
    /// Entering a free monitor.
    LockAcquire { shared: bool },
    /// Entering a monitor owned by another thread.
    LockBlocked,
    LockRelease { did_unblock: bool },
    ThreadStart,
    ThreadTerminate,
    /// Joining a thread that is still alive.
    Join,
    Wait,
    Notify { did_notify: bool },
    FieldAccess {
        shared: bool,
        is_write: bool,
        is_final: bool,
    },
    /// Another thread is running the class initializer.
    ClassInitBlocked,
    Yield,
    /// Explicit `Verify.breakTransition()`.
    Break,
    /// The transition ran for too many instructions.
    TransitionLimit,
    /// The thread spins in a loop that makes no progress.
    IdleLoop,
}

impl SchedEvent {
    /// Generator id for scheduling points raised by this event.
    pub fn cg_id(&self) -> &'static str {
        match self {
            SchedEvent::Root => "ROOT",
            SchedEvent::LockAcquire { .. } => "LOCK",
            SchedEvent::LockBlocked => "BLOCK",
            SchedEvent::LockRelease { .. } => "RELEASE",
            SchedEvent::ThreadStart => "START",
            SchedEvent::ThreadTerminate => "TERMINATE",
            SchedEvent::Join => "JOIN",
            SchedEvent::Wait => "WAIT",
            SchedEvent::Notify { .. } => "NOTIFY",
            SchedEvent::FieldAccess { is_write: true, .. } => "SHARED_FIELD_WRITE",
            SchedEvent::FieldAccess { .. } => "SHARED_FIELD_READ",
            SchedEvent::ClassInitBlocked => "CLINIT",
            SchedEvent::Yield => "YIELD",
            SchedEvent::Break => "BREAK",
            SchedEvent::TransitionLimit => "MAX_TRANSITION_LENGTH",
            SchedEvent::IdleLoop => "IDLE_YIELD",
        }
    }
}

/// Rates synchronization events.
pub trait SyncPolicy: fmt::Debug + Send + Sync {
    fn relevance(&self, event: &SchedEvent) -> SchedulingRelevance;
}

/// Events that stop the current thread, for every policy.
fn blocking_relevance(event: &SchedEvent) -> Option<SchedulingRelevance> {
    match event {
        SchedEvent::Root
        | SchedEvent::LockBlocked
        | SchedEvent::ThreadTerminate
        | SchedEvent::Join
        | SchedEvent::Wait
        | SchedEvent::ClassInitBlocked
        | SchedEvent::Break
        | SchedEvent::TransitionLimit
        | SchedEvent::IdleLoop => Some(SchedulingRelevance::Mandatory),
        _ => None,
    }
}

/// Interleave all runnable threads at every synchronization event and at
/// every access to shared, non-final data.
#[derive(Debug, Clone)]
pub struct AllRunnables {
    pub break_lock_release: bool,
    pub break_notify: bool,
    pub break_yield: bool,
}

impl Default for AllRunnables {
    fn default() -> Self {
        Self {
            break_lock_release: false,
            break_notify: false,
            break_yield: true,
        }
    }
}

impl SyncPolicy for AllRunnables {
    fn relevance(&self, event: &SchedEvent) -> SchedulingRelevance {
        if let Some(r) = blocking_relevance(event) {
            return r;
        }
        let relevant = match *event {
            SchedEvent::LockAcquire { shared } => shared,
            SchedEvent::LockRelease { did_unblock } => did_unblock && self.break_lock_release,
            SchedEvent::Notify { did_notify } => did_notify && self.break_notify,
            SchedEvent::Yield => self.break_yield,
            SchedEvent::ThreadStart => true,
            SchedEvent::FieldAccess {
                shared, is_final, ..
            } => shared && !is_final,
            _ => false,
        };
        if relevant {
            SchedulingRelevance::Optional
        } else {
            SchedulingRelevance::None
        }
    }
}

/// Only lock acquisition, thread start and blocking events are scheduling
/// points. Unsound for programs with unsynchronized data races.
#[derive(Debug, Clone, Default)]
pub struct Reduced;

impl SyncPolicy for Reduced {
    fn relevance(&self, event: &SchedEvent) -> SchedulingRelevance {
        if let Some(r) = blocking_relevance(event) {
            return r;
        }
        match event {
            SchedEvent::LockAcquire { shared: true } | SchedEvent::ThreadStart => {
                SchedulingRelevance::Optional
            }
            _ => SchedulingRelevance::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    policy: Arc<dyn SyncPolicy>,
    break_single_choice: bool,
}

impl Scheduler {
    pub fn new(policy: Arc<dyn SyncPolicy>, break_single_choice: bool) -> Self {
        Self {
            policy,
            break_single_choice,
        }
    }

    pub fn policy(&self) -> &dyn SyncPolicy {
        self.policy.as_ref()
    }

    pub fn relevance(&self, event: &SchedEvent) -> SchedulingRelevance {
        self.policy.relevance(event)
    }

    /// Thread generator for `event` raised by `current`, or `None` when the
    /// event is not a scheduling point in this state.
    pub fn choice_for(
        &self,
        event: &SchedEvent,
        kernel: &KernelState,
        current: ThreadId,
    ) -> Option<ChoiceGenerator> {
        let relevance = self.policy.relevance(event);
        if relevance == SchedulingRelevance::None {
            return None;
        }
        let runnable = kernel.runnable_threads();
        if runnable.is_empty() {
            return None;
        }
        if relevance == SchedulingRelevance::Optional
            && !self.break_single_choice
            && runnable == [current]
        {
            return None;
        }
        Some(
            ChoiceGenerator::new(
                event.cg_id(),
                ChoiceDomain::Threads(runnable.into()),
                current,
            )
            .with_relevance(relevance),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_runnables_rates_field_access() {
        let p = AllRunnables::default();
        let access = |shared, is_final| SchedEvent::FieldAccess {
            shared,
            is_write: true,
            is_final,
        };
        assert_eq!(p.relevance(&access(true, false)), SchedulingRelevance::Optional);
        assert_eq!(p.relevance(&access(false, false)), SchedulingRelevance::None);
        assert_eq!(p.relevance(&access(true, true)), SchedulingRelevance::None);
        assert_eq!(p.relevance(&SchedEvent::LockBlocked), SchedulingRelevance::Mandatory);
        assert_eq!(
            p.relevance(&SchedEvent::LockRelease { did_unblock: true }),
            SchedulingRelevance::None
        );
    }

    #[test]
    fn test_reduced_ignores_data() {
        let p = Reduced;
        assert_eq!(
            p.relevance(&SchedEvent::FieldAccess {
                shared: true,
                is_write: true,
                is_final: false
            }),
            SchedulingRelevance::None
        );
        assert_eq!(
            p.relevance(&SchedEvent::LockAcquire { shared: true }),
            SchedulingRelevance::Optional
        );
        assert_eq!(p.relevance(&SchedEvent::Join), SchedulingRelevance::Mandatory);
    }

    #[test]
    fn test_ids() {
        assert_eq!(SchedEvent::ThreadStart.cg_id(), "START");
        assert_eq!(
            SchedEvent::FieldAccess {
                shared: true,
                is_write: false,
                is_final: false
            }
            .cg_id(),
            "SHARED_FIELD_READ"
        );
    }
}
