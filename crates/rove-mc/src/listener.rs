//! Listener bus: search and execution events, and user properties.
//!
//! Listeners are called in registration order. A listener that implements
//! [`Listener::check`] is a property: the search asks it about every state
//! it reaches and records a [`Violation`] for the first one that objects.

use crate::property::{PropertyViolation, Violation};
use crate::search::SearchReport;
use crate::state::Fingerprint;
use rove_ir::Insn;
use rove_vm::{ChoiceGenerator, ExecObserver, ThreadId, Vm};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// A state the search arrived at after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateEvent {
    pub id: usize,
    pub fingerprint: Fingerprint,
    pub depth: usize,
    /// Not visited before, or state matching is off.
    pub is_new: bool,
    /// No generator was registered: every thread ended, or none can run.
    pub is_end: bool,
}

pub trait Listener {
    fn search_started(&mut self, _vm: &Vm) {}

    fn instruction_executed(&mut self, _vm: &Vm, _thread: ThreadId, _insn: &Insn) {}

    fn choice_generator_registered(&mut self, _vm: &Vm, _cg: &ChoiceGenerator) {}

    fn choice_generator_advanced(&mut self, _vm: &Vm, _cg: &ChoiceGenerator) {}

    fn state_advanced(&mut self, _vm: &Vm, _event: &StateEvent) {}

    /// The search returned to the state at `depth` to take its next choice.
    fn state_backtracked(&mut self, _depth: usize) {}

    /// All threads terminated.
    fn end_state(&mut self, _vm: &Vm) {}

    fn property_violated(&mut self, _violation: &Violation) {}

    fn search_finished(&mut self, _report: &SearchReport) {}

    /// Property hook, evaluated on every state the search reaches.
    fn check(&mut self, _vm: &Vm) -> Option<PropertyViolation> {
        None
    }

    /// Property hook over the state graph, evaluated after the state was
    /// matched and [`Listener::state_advanced`] was delivered.
    fn check_state(&mut self, _vm: &Vm, _event: &StateEvent) -> Option<PropertyViolation> {
        None
    }
}

#[derive(Default)]
pub struct ListenerBus {
    listeners: Vec<Box<dyn Listener>>,
}

impl ListenerBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, listener: impl Listener + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn add_boxed(&mut self, listener: Box<dyn Listener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// First violation reported by a property, in registration order.
    pub fn check(&mut self, vm: &Vm) -> Option<PropertyViolation> {
        self.listeners.iter_mut().find_map(|l| l.check(vm))
    }

    pub fn check_state(&mut self, vm: &Vm, event: &StateEvent) -> Option<PropertyViolation> {
        self.listeners.iter_mut().find_map(|l| l.check_state(vm, event))
    }
}

impl Listener for ListenerBus {
    fn search_started(&mut self, vm: &Vm) {
        for l in &mut self.listeners {
            l.search_started(vm);
        }
    }

    fn instruction_executed(&mut self, vm: &Vm, thread: ThreadId, insn: &Insn) {
        for l in &mut self.listeners {
            l.instruction_executed(vm, thread, insn);
        }
    }

    fn choice_generator_registered(&mut self, vm: &Vm, cg: &ChoiceGenerator) {
        for l in &mut self.listeners {
            l.choice_generator_registered(vm, cg);
        }
    }

    fn choice_generator_advanced(&mut self, vm: &Vm, cg: &ChoiceGenerator) {
        for l in &mut self.listeners {
            l.choice_generator_advanced(vm, cg);
        }
    }

    fn state_advanced(&mut self, vm: &Vm, event: &StateEvent) {
        for l in &mut self.listeners {
            l.state_advanced(vm, event);
        }
    }

    fn state_backtracked(&mut self, depth: usize) {
        for l in &mut self.listeners {
            l.state_backtracked(depth);
        }
    }

    fn end_state(&mut self, vm: &Vm) {
        for l in &mut self.listeners {
            l.end_state(vm);
        }
    }

    fn property_violated(&mut self, violation: &Violation) {
        for l in &mut self.listeners {
            l.property_violated(violation);
        }
    }

    fn search_finished(&mut self, report: &SearchReport) {
        for l in &mut self.listeners {
            l.search_finished(report);
        }
    }

    fn check(&mut self, vm: &Vm) -> Option<PropertyViolation> {
        ListenerBus::check(self, vm)
    }

    fn check_state(&mut self, vm: &Vm, event: &StateEvent) -> Option<PropertyViolation> {
        ListenerBus::check_state(self, vm, event)
    }
}

impl ExecObserver for ListenerBus {
    fn instruction_executed(&mut self, vm: &Vm, thread: ThreadId, insn: &Insn) {
        Listener::instruction_executed(self, vm, thread, insn);
    }

    fn choice_generator_registered(&mut self, vm: &Vm, cg: &ChoiceGenerator) {
        Listener::choice_generator_registered(self, vm, cg);
    }
}

// === Utility listeners ===

/// Logs execution at `trace` level and choice points at `debug` level.
#[derive(Debug, Default)]
pub struct ExecTracker;

impl Listener for ExecTracker {
    fn instruction_executed(&mut self, _vm: &Vm, thread: ThreadId, insn: &Insn) {
        trace!(thread = %thread, insn = %insn, "executed");
    }

    fn choice_generator_registered(&mut self, vm: &Vm, cg: &ChoiceGenerator) {
        let at = cg
            .location
            .map(|loc| format!("{}@{}", vm.program().method(loc.method), loc.pc))
            .unwrap_or_default();
        debug!(cg = %cg, at = %at, "registered");
    }

    fn choice_generator_advanced(&mut self, _vm: &Vm, cg: &ChoiceGenerator) {
        trace!(cg = %cg, "advanced");
    }

    fn state_advanced(&mut self, _vm: &Vm, event: &StateEvent) {
        trace!(
            id = event.id,
            depth = event.depth,
            new = event.is_new,
            end = event.is_end,
            "state"
        );
    }

    fn state_backtracked(&mut self, depth: usize) {
        trace!(depth, "backtrack");
    }
}

/// One advanced generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChoiceRecord {
    pub id: String,
    pub index: usize,
    pub total: usize,
    pub thread: ThreadId,
}

/// Records every generator advance. Clones share the record.
#[derive(Debug, Clone, Default)]
pub struct ChoiceTracker {
    records: Arc<Mutex<Vec<ChoiceRecord>>>,
}

impl ChoiceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ChoiceRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Distinct generator ids, in first-seen order.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for r in self.records() {
            if !ids.contains(&r.id) {
                ids.push(r.id);
            }
        }
        ids
    }
}

impl Listener for ChoiceTracker {
    fn choice_generator_advanced(&mut self, _vm: &Vm, cg: &ChoiceGenerator) {
        let Some(index) = cg.choice_index() else {
            return;
        };
        if let Ok(mut records) = self.records.lock() {
            records.push(ChoiceRecord {
                id: cg.id.to_string(),
                index,
                total: cg.total(),
                thread: cg.thread,
            });
        }
    }
}

/// Counters updated by [`StateCounter`].
#[derive(Debug, Default)]
pub struct StateCounts {
    pub new_states: AtomicUsize,
    pub revisited: AtomicUsize,
    pub end_states: AtomicUsize,
    pub backtracks: AtomicUsize,
    pub max_depth: AtomicUsize,
}

/// Counts states as the search reports them. Clones share the counters.
#[derive(Debug, Clone, Default)]
pub struct StateCounter {
    counts: Arc<StateCounts>,
}

impl StateCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counts(&self) -> Arc<StateCounts> {
        Arc::clone(&self.counts)
    }

    pub fn new_states(&self) -> usize {
        self.counts.new_states.load(Ordering::Relaxed)
    }

    pub fn revisited(&self) -> usize {
        self.counts.revisited.load(Ordering::Relaxed)
    }

    pub fn end_states(&self) -> usize {
        self.counts.end_states.load(Ordering::Relaxed)
    }

    pub fn backtracks(&self) -> usize {
        self.counts.backtracks.load(Ordering::Relaxed)
    }

    pub fn max_depth(&self) -> usize {
        self.counts.max_depth.load(Ordering::Relaxed)
    }
}

impl Listener for StateCounter {
    fn state_advanced(&mut self, _vm: &Vm, event: &StateEvent) {
        let c = &self.counts;
        if event.is_new {
            c.new_states.fetch_add(1, Ordering::Relaxed);
        } else {
            c.revisited.fetch_add(1, Ordering::Relaxed);
        }
        c.max_depth.fetch_max(event.depth, Ordering::Relaxed);
    }

    fn state_backtracked(&mut self, _depth: usize) {
        self.counts.backtracks.fetch_add(1, Ordering::Relaxed);
    }

    fn end_state(&mut self, _vm: &Vm) {
        self.counts.end_states.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rove_vm::{ChoiceDomain, VmConfig};

    struct Named {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        objects: bool,
    }

    impl Listener for Named {
        fn state_backtracked(&mut self, _depth: usize) {
            self.log.lock().unwrap().push(self.name);
        }

        fn check(&mut self, _vm: &Vm) -> Option<PropertyViolation> {
            self.log.lock().unwrap().push(self.name);
            self.objects.then(|| PropertyViolation::new(self.name, "objected"))
        }
    }

    fn empty_vm() -> Vm {
        let program = rove_asm::parse(
            "class T\n  static method main()V\n    return\n  end\nend\nentry T.main\n",
        )
        .unwrap();
        Vm::new(Arc::new(program), VmConfig::default()).unwrap()
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = ListenerBus::new();
        for (name, objects) in [("a", false), ("b", true), ("c", true)] {
            bus.add(Named {
                name,
                log: Arc::clone(&log),
                objects,
            });
        }
        bus.state_backtracked(1);
        assert_eq!(*log.lock().unwrap(), ["a", "b", "c"]);

        log.lock().unwrap().clear();
        let vm = empty_vm();
        let found = bus.check(&vm).unwrap();
        assert_eq!(found.property, "b");
        // properties after the first objecting one are not asked
        assert_eq!(*log.lock().unwrap(), ["a", "b"]);
    }

    #[test]
    fn test_choice_tracker_shares_records() {
        let tracker = ChoiceTracker::new();
        let mut bus = ListenerBus::new();
        bus.add(tracker.clone());
        let vm = empty_vm();
        let mut cg = ChoiceGenerator::new("verifyGetBoolean", ChoiceDomain::Boolean, ThreadId::MAIN);
        cg.advance();
        bus.choice_generator_advanced(&vm, &cg);
        cg.advance();
        bus.choice_generator_advanced(&vm, &cg);
        let records = tracker.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].index, 1);
        assert_eq!(records[1].total, 2);
        assert_eq!(tracker.ids(), ["verifyGetBoolean"]);
    }

    #[test]
    fn test_state_counter() {
        let counter = StateCounter::new();
        let mut bus = ListenerBus::new();
        bus.add(counter.clone());
        let vm = empty_vm();
        let event = |depth, is_new| StateEvent {
            id: 0,
            fingerprint: Fingerprint::from_u64(0),
            depth,
            is_new,
            is_end: false,
        };
        bus.state_advanced(&vm, &event(1, true));
        bus.state_advanced(&vm, &event(3, false));
        bus.state_backtracked(1);
        bus.end_state(&vm);
        assert_eq!(counter.new_states(), 1);
        assert_eq!(counter.revisited(), 1);
        assert_eq!(counter.max_depth(), 3);
        assert_eq!(counter.backtracks(), 1);
        assert_eq!(counter.end_states(), 1);
    }
}
