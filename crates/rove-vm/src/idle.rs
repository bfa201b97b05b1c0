//! Loops that spin inside one transition without doing anything a search
//! could learn from.
//!
//! A loop is a backward jump to the same target in the same frame. Calls
//! and array stores inside its body clear it: such a loop is left to state
//! matching.

use crate::choice::{ChoiceDomain, ChoiceGenerator};
use crate::error::VmResult;
use crate::scheduler::{SchedEvent, SchedulingRelevance};
use crate::thread::ThreadId;
use crate::vm::Vm;
use rove_ir::{Insn, MethodId};
use tracing::warn;

/// What happens once a loop exceeds `idle_max_backjumps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdleAction {
    /// Log the loop and keep running.
    #[default]
    Warn,
    /// End the transition so state matching can cut the loop.
    Break,
    /// End the transition and let every runnable thread go next.
    Yield,
    /// Drop the state.
    Prune,
    /// Continue after the backward jump, leaving the loop.
    Jump,
}

impl IdleAction {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "warn" => Some(IdleAction::Warn),
            "break" => Some(IdleAction::Break),
            "yield" => Some(IdleAction::Yield),
            "prune" => Some(IdleAction::Prune),
            "jump" => Some(IdleAction::Jump),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            IdleAction::Warn => "warn",
            IdleAction::Break => "break",
            IdleAction::Yield => "yield",
            IdleAction::Prune => "prune",
            IdleAction::Jump => "jump",
        }
    }
}

/// Loop the running thread is in, reset at every transition.
#[derive(Debug, Clone, Default)]
pub(crate) struct IdleTracker {
    method: Option<MethodId>,
    depth: usize,
    start: usize,
    end: usize,
    back_jumps: usize,
    cleared: bool,
}

impl IdleTracker {
    fn in_body(&self, method: MethodId, depth: usize, pc: usize) -> bool {
        self.method == Some(method) && self.depth == depth && pc >= self.start && pc < self.end
    }
}

impl Vm {
    /// Account for `insn`, executed at `pc` of `method` in a frame at stack
    /// depth `depth`, which moved the pc to `next`.
    pub(crate) fn track_idle(
        &mut self,
        thread: ThreadId,
        insn: &Insn,
        method: MethodId,
        depth: usize,
        pc: usize,
        next: Option<usize>,
    ) -> VmResult<()> {
        let Some(target) = next.filter(|&t| t <= pc) else {
            if matches!(insn, Insn::Invoke(..) | Insn::ArrayStore(_))
                && self.idle.in_body(method, depth, pc)
            {
                self.idle.cleared = true;
            }
            return Ok(());
        };

        let t = &mut self.idle;
        if t.method != Some(method) || t.depth != depth || t.start != target {
            *t = IdleTracker {
                method: Some(method),
                depth,
                start: target,
                end: pc,
                ..IdleTracker::default()
            };
            return Ok(());
        }
        t.back_jumps += 1;
        if t.cleared || t.back_jumps <= self.config.idle_max_backjumps {
            return Ok(());
        }
        // one action per loop and transition
        t.cleared = true;

        let at = format!("{}@{pc}", self.program.method(method));
        let action = self.config.idle_action;
        warn!(thread = %thread, at = %at, action = action.name(), "idle loop");
        match action {
            IdleAction::Warn => {}
            IdleAction::Break => {
                let cg = ChoiceGenerator::new(
                    "IDLE_BREAK",
                    ChoiceDomain::Threads(vec![thread].into()),
                    thread,
                )
                .with_relevance(SchedulingRelevance::Mandatory);
                self.register(cg);
            }
            IdleAction::Yield => {
                self.schedule(thread, SchedEvent::IdleLoop);
            }
            IdleAction::Prune => self.kernel.ignored = true,
            IdleAction::Jump => {
                if pc + 1 < self.program.method(method).code.len() {
                    self.frame_mut(thread)?.pc = pc + 1;
                } else {
                    warn!(at = %at, "nothing after the loop, pruning");
                    self.kernel.ignored = true;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_names() {
        for action in [
            IdleAction::Warn,
            IdleAction::Break,
            IdleAction::Yield,
            IdleAction::Prune,
            IdleAction::Jump,
        ] {
            assert_eq!(IdleAction::from_name(action.name()), Some(action));
        }
        assert_eq!(IdleAction::from_name("PRUNE"), Some(IdleAction::Prune));
        assert_eq!(IdleAction::from_name("spin"), None);
    }

    #[test]
    fn test_body_excludes_the_jump_itself() {
        let m = |index| MethodId {
            class: rove_ir::ClassId(0),
            index,
        };
        let t = IdleTracker {
            method: Some(m(1)),
            depth: 1,
            start: 2,
            end: 6,
            ..IdleTracker::default()
        };
        assert!(t.in_body(m(1), 1, 2));
        assert!(!t.in_body(m(1), 1, 6));
        assert!(!t.in_body(m(1), 2, 3));
        assert!(!t.in_body(m(2), 1, 3));
    }
}
