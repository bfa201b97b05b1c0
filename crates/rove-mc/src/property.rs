//! Properties checked on every state.

use crate::listener::{Listener, StateEvent};
use crate::state::Fingerprint;
use crate::trace::ChoiceTrace;
use rove_ir::prelude::ASSERTION_ERROR;
use rove_vm::{ChoiceDomain, FieldAccess, ThreadStatus, Vm};
use serde::Serialize;
use std::fmt;

/// What a property reports about a bad state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropertyViolation {
    pub property: String,
    pub message: String,
}

impl PropertyViolation {
    pub fn new(property: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for PropertyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.property, self.message)
    }
}

/// A violation found by the search, with the path that reproduces it.
#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub property: String,
    pub message: String,
    pub trace: ChoiceTrace,
    /// Transitions from the initial state.
    pub depth: usize,
    /// Fingerprint of the exact image of the violating state.
    pub fingerprint: Fingerprint,
}

impl Violation {
    pub fn new(
        found: PropertyViolation,
        trace: ChoiceTrace,
        depth: usize,
        fingerprint: Fingerprint,
    ) -> Self {
        Self {
            property: found.property,
            message: found.message,
            trace,
            depth,
            fingerprint,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.property, self.message)
    }
}

/// No exception escapes a thread. An escaping `AssertionError` is reported
/// as an assertion failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoUncaughtExceptions;

impl NoUncaughtExceptions {
    pub const NAME: &'static str = "NoUncaughtExceptions";

    pub fn evaluate(vm: &Vm) -> Option<PropertyViolation> {
        let exc = vm.uncaught()?;
        let message = match (&*exc.class, exc.detail.as_deref()) {
            (ASSERTION_ERROR, Some(detail)) => {
                format!("assertion failed in thread {}: {detail}", exc.thread)
            }
            (ASSERTION_ERROR, None) => format!("assertion failed in thread {}", exc.thread),
            (class, Some(detail)) => {
                format!("uncaught {class} in thread {}: {detail}", exc.thread)
            }
            (class, None) => format!("uncaught {class} in thread {}", exc.thread),
        };
        Some(PropertyViolation::new(Self::NAME, message))
    }
}

impl Listener for NoUncaughtExceptions {
    fn check(&mut self, vm: &Vm) -> Option<PropertyViolation> {
        Self::evaluate(vm)
    }
}

/// Some live thread can always run.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotDeadlocked;

impl NotDeadlocked {
    pub const NAME: &'static str = "NotDeadlocked";

    pub fn evaluate(vm: &Vm) -> Option<PropertyViolation> {
        if !vm.is_deadlocked() {
            return None;
        }
        let blocked: Vec<String> = vm
            .kernel()
            .threads
            .iter()
            .filter(|t| t.is_alive())
            .map(|t| {
                let state = match t.status {
                    ThreadStatus::Waiting => "waiting",
                    _ => "blocked",
                };
                match vm.location(t.id) {
                    Some(loc) => format!("thread {} {state} at {loc}", t.id),
                    None => format!("thread {} {state}", t.id),
                }
            })
            .collect();
        Some(PropertyViolation::new(
            Self::NAME,
            format!("deadlock: {}", blocked.join(", ")),
        ))
    }
}

impl Listener for NotDeadlocked {
    fn check(&mut self, vm: &Vm) -> Option<PropertyViolation> {
        Self::evaluate(vm)
    }
}

/// No two threads that can both be scheduled next are about to touch the
/// same shared storage, at least one of them writing.
#[derive(Debug, Clone, Copy, Default)]
pub struct RaceDetector;

impl RaceDetector {
    pub const NAME: &'static str = "RaceDetector";

    pub fn evaluate(vm: &Vm) -> Option<PropertyViolation> {
        let candidates = vm.next_chain().iter().find_map(|cg| match &cg.domain {
            ChoiceDomain::Threads(threads) if threads.len() > 1 => Some(threads),
            _ => None,
        })?;
        let accesses: Vec<FieldAccess> = candidates
            .iter()
            .filter_map(|&t| vm.pending_access(t))
            .filter(|a| a.shared)
            .collect();
        for (i, a) in accesses.iter().enumerate() {
            for b in &accesses[i + 1..] {
                if a.site == b.site && (a.is_write || b.is_write) {
                    let message = format!(
                        "race on {}: {}, {}",
                        vm.describe_site(&a.site),
                        describe_access(vm, a),
                        describe_access(vm, b)
                    );
                    return Some(PropertyViolation::new(Self::NAME, message));
                }
            }
        }
        None
    }
}

fn describe_access(vm: &Vm, access: &FieldAccess) -> String {
    let verb = if access.is_write { "writes" } else { "reads" };
    match vm.location(access.thread) {
        Some(loc) => format!("thread {} {verb} at {loc}", access.thread),
        None => format!("thread {} {verb}", access.thread),
    }
}

impl Listener for RaceDetector {
    fn check(&mut self, vm: &Vm) -> Option<PropertyViolation> {
        Self::evaluate(vm)
    }
}

/// No state repeats on the current depth-first path. A cycle means the
/// program can run forever without making progress.
#[derive(Debug, Clone, Default)]
pub struct NoStateCycles {
    /// Fingerprints of the states on the path, indexed by depth.
    path: Vec<Fingerprint>,
    found: Option<PropertyViolation>,
}

impl NoStateCycles {
    pub const NAME: &'static str = "NoStateCycles";

    pub fn new() -> Self {
        Self::default()
    }
}

impl Listener for NoStateCycles {
    fn state_advanced(&mut self, _vm: &Vm, event: &StateEvent) {
        self.path.truncate(event.depth);
        if !event.is_new {
            if let Some(start) = self.path.iter().position(|&fp| fp == event.fingerprint) {
                let message = format!(
                    "state {} at depth {start} is reached again at depth {}",
                    event.fingerprint, event.depth
                );
                self.found = Some(PropertyViolation::new(Self::NAME, message));
            }
        }
        self.path.push(event.fingerprint);
    }

    fn check_state(&mut self, _vm: &Vm, _event: &StateEvent) -> Option<PropertyViolation> {
        self.found.take()
    }
}

/// Evaluate the stateless built-in properties, the optional ones only if
/// asked.
pub fn builtin_violation(
    vm: &Vm,
    check_deadlock: bool,
    check_races: bool,
) -> Option<PropertyViolation> {
    NoUncaughtExceptions::evaluate(vm)
        .or_else(|| check_deadlock.then(|| NotDeadlocked::evaluate(vm)).flatten())
        .or_else(|| check_races.then(|| RaceDetector::evaluate(vm)).flatten())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_display() {
        let found = PropertyViolation::new("P", "went wrong");
        assert_eq!(found.to_string(), "P: went wrong");
        let v = Violation::new(found, ChoiceTrace::new(), 3, Fingerprint::from_u64(1));
        assert_eq!(v.to_string(), "P: went wrong");
        assert_eq!(v.depth, 3);
    }

    #[test]
    fn test_cycle_found_only_on_current_path() {
        let program = rove_asm::parse(
            "class T\n  static method main()V\n    return\n  end\nend\nentry T.main\n",
        )
        .unwrap();
        let vm = Vm::new(std::sync::Arc::new(program), rove_vm::VmConfig::default()).unwrap();
        let event = |fp, depth, is_new| StateEvent {
            id: 0,
            fingerprint: Fingerprint::from_u64(fp),
            depth,
            is_new,
            is_end: false,
        };
        let mut cycles = NoStateCycles::new();
        for e in [event(1, 0, true), event(2, 1, true), event(3, 2, true)] {
            cycles.state_advanced(&vm, &e);
            assert!(cycles.check_state(&vm, &e).is_none());
        }
        // a sibling branch reaching state 3 again is a join, not a cycle
        let join = event(3, 2, false);
        cycles.state_advanced(&vm, &join);
        assert!(cycles.check_state(&vm, &join).is_none());

        let back = event(2, 3, false);
        cycles.state_advanced(&vm, &back);
        let found = cycles.check_state(&vm, &back).unwrap();
        assert_eq!(found.property, NoStateCycles::NAME);
        assert!(found.message.contains("depth 1"), "{}", found.message);
        assert!(cycles.check_state(&vm, &back).is_none());
    }

    #[test]
    fn test_violation_json() {
        let v = Violation::new(
            PropertyViolation::new("NotDeadlocked", "deadlock"),
            ChoiceTrace(vec![crate::trace::ChoiceStep::new("ROOT", 0)]),
            1,
            Fingerprint::from_u64(0xff),
        );
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["property"], "NotDeadlocked");
        assert_eq!(json["fingerprint"], "00000000000000ff");
        assert_eq!(json["trace"][0]["id"], "ROOT");
    }
}
