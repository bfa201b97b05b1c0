//! The search driver.
//!
//! A depth-first search keeps a stack of states whose generator chains
//! still have choices left. Going forward restores the top state, advances
//! its chain and runs one transition; the state reached is checked, matched
//! against the visited states and, if new, pushed with the chain its
//! transition registered. A state without choices left is popped, which
//! backtracks to its parent. The search is done when the stack is empty.
//!
//! Breadth-first search runs the same steps over a queue instead of a
//! stack, and the parallel search expands a whole batch of queued states at
//! once (see [`crate::parallel`]).

use crate::error::{SearchError, SearchResult};
use crate::listener::{Listener, ListenerBus, StateEvent};
use crate::property::{
    NoStateCycles, NoUncaughtExceptions, NotDeadlocked, PropertyViolation, RaceDetector, Violation,
};
use crate::state::{SerializerKind, Snapshot, StateSerializer};
use crate::store::{StateStore, Visit};
use crate::trace::ChoiceTrace;
use memory_stats::memory_stats;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rove_ir::Program;
use rove_vm::{CgChain, KernelState, Vm, VmConfig};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Returns current process memory usage in MB, or None if unavailable.
pub(crate) fn current_memory_mb() -> Option<usize> {
    memory_stats().map(|stats| stats.physical_mem / (1024 * 1024))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchOrder {
    #[default]
    DepthFirst,
    BreadthFirst,
    /// Depth-first, visiting the choices of every generator in an order
    /// shuffled by a generator seeded with `seed`.
    RandomDepthFirst { seed: u64 },
}

impl SearchOrder {
    pub fn from_name(name: &str, seed: u64) -> Option<Self> {
        match name {
            "dfs" | "depth-first" => Some(SearchOrder::DepthFirst),
            "bfs" | "breadth-first" => Some(SearchOrder::BreadthFirst),
            "random" => Some(SearchOrder::RandomDepthFirst { seed }),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SearchOrder::DepthFirst => "dfs",
            SearchOrder::BreadthFirst => "bfs",
            SearchOrder::RandomDepthFirst { .. } => "random",
        }
    }
}

/// Lock-free progress counters shared between the search and the CLI.
pub struct ProgressCounters {
    pub states: AtomicUsize,
    pub depth: AtomicUsize,
    /// States waiting on the stack or in the queue.
    pub queue_len: AtomicUsize,
    /// Transitions executed.
    pub transitions: AtomicUsize,
}

impl Default for ProgressCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self {
            states: AtomicUsize::new(0),
            depth: AtomicUsize::new(0),
            queue_len: AtomicUsize::new(0),
            transitions: AtomicUsize::new(0),
        }
    }
}

/// Search configuration.
pub struct SearchConfig {
    pub order: SearchOrder,
    /// Skip states that were visited before.
    pub state_matching: bool,
    /// Search a visited state again when it is reached at a smaller depth.
    pub match_depth: bool,
    /// Keep searching after a violation instead of halting.
    pub multiple_errors: bool,
    /// Report states where live threads cannot run.
    pub check_deadlock: bool,
    /// Report states where two schedulable threads are about to access the
    /// same shared storage and one of them writes.
    pub check_races: bool,
    /// Report states that repeat on the current path. Depth-first only.
    pub check_cycles: bool,
    /// Maximum number of distinct states (0 = unlimited).
    pub max_states: usize,
    /// Maximum number of transitions on a path (0 = unlimited).
    pub max_depth: usize,
    /// Maximum time in seconds (0 = unlimited).
    pub max_time_secs: u64,
    /// Maximum memory usage in MB (0 = unlimited).
    pub memory_limit_mb: usize,
    pub serializer: SerializerKind,
    /// Keep the exact image of every visited state to detect fingerprint
    /// collisions.
    pub full_images: bool,
    /// Level-synchronous parallel breadth-first search.
    pub parallel: bool,
    /// Number of threads for parallel search (0 = use all available).
    pub num_threads: usize,
    pub progress: Option<Arc<ProgressCounters>>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            order: SearchOrder::default(),
            state_matching: true,
            match_depth: false,
            multiple_errors: false,
            check_deadlock: true,
            check_races: false,
            check_cycles: false,
            max_states: 0,
            max_depth: 0,
            max_time_secs: 0,
            memory_limit_mb: 0,
            serializer: SerializerKind::default(),
            full_images: false,
            parallel: false,
            num_threads: 0,
            progress: None,
        }
    }
}

impl Clone for SearchConfig {
    fn clone(&self) -> Self {
        Self {
            order: self.order,
            state_matching: self.state_matching,
            match_depth: self.match_depth,
            multiple_errors: self.multiple_errors,
            check_deadlock: self.check_deadlock,
            check_races: self.check_races,
            check_cycles: self.check_cycles,
            max_states: self.max_states,
            max_depth: self.max_depth,
            max_time_secs: self.max_time_secs,
            memory_limit_mb: self.memory_limit_mb,
            serializer: self.serializer,
            full_images: self.full_images,
            parallel: self.parallel,
            num_threads: self.num_threads,
            progress: self.progress.clone(),
        }
    }
}

impl fmt::Debug for SearchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchConfig")
            .field("order", &self.order)
            .field("state_matching", &self.state_matching)
            .field("match_depth", &self.match_depth)
            .field("multiple_errors", &self.multiple_errors)
            .field("check_deadlock", &self.check_deadlock)
            .field("check_races", &self.check_races)
            .field("check_cycles", &self.check_cycles)
            .field("max_states", &self.max_states)
            .field("max_depth", &self.max_depth)
            .field("max_time_secs", &self.max_time_secs)
            .field("memory_limit_mb", &self.memory_limit_mb)
            .field("serializer", &self.serializer)
            .field("full_images", &self.full_images)
            .field("parallel", &self.parallel)
            .field("num_threads", &self.num_threads)
            .finish_non_exhaustive()
    }
}

// === Report ===

/// Resource limit that ended a search early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Limit {
    States,
    Depth,
    Time,
    Memory,
    Cancelled,
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Limit::States => "state limit",
            Limit::Depth => "depth limit",
            Limit::Time => "time limit",
            Limit::Memory => "memory limit",
            Limit::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchStatus {
    /// Every reachable state was explored.
    Complete,
    /// Stopped at the first violation.
    Halted,
    Incomplete(Limit),
}

impl fmt::Display for SearchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchStatus::Complete => f.write_str("complete"),
            SearchStatus::Halted => f.write_str("halted at first violation"),
            SearchStatus::Incomplete(limit) => write!(f, "incomplete ({limit})"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SearchStats {
    /// Distinct states reached, the initial state included.
    pub states: usize,
    /// Transitions that led to an already visited state.
    pub revisited: usize,
    pub end_states: usize,
    pub transitions: usize,
    pub backtracks: usize,
    pub max_depth: usize,
    pub instructions: u64,
    pub collisions: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchReport {
    pub status: SearchStatus,
    pub violations: Vec<Violation>,
    pub stats: SearchStats,
}

impl SearchReport {
    pub fn is_complete(&self) -> bool {
        self.status == SearchStatus::Complete
    }

    pub fn has_violations(&self) -> bool {
        !self.violations.is_empty()
    }
}

// === Search ===

/// How a search loop ended.
pub(crate) enum Stop {
    Done,
    Halted,
    Limit(Limit),
}

/// What the search does with a state after checking it.
enum Step {
    Expand(Snapshot),
    Prune,
    Halt,
}

/// Counters of one run.
#[derive(Default)]
pub(crate) struct RunState {
    pub(crate) stats: SearchStats,
    pub(crate) violations: Vec<Violation>,
    /// Some path was cut at the depth limit.
    pub(crate) depth_limited: bool,
}

/// A state on the depth-first stack.
struct Frame {
    kernel: KernelState,
    chain: CgChain,
    /// Length of the trace leading to this state.
    path_len: usize,
}

/// A state waiting in the breadth-first queue.
#[derive(Clone)]
pub(crate) struct Node {
    pub(crate) kernel: KernelState,
    pub(crate) chain: CgChain,
    pub(crate) path: ChoiceTrace,
    pub(crate) depth: usize,
}

pub struct Search {
    pub(crate) program: Arc<Program>,
    pub(crate) vm_config: VmConfig,
    pub(crate) config: SearchConfig,
    pub(crate) bus: ListenerBus,
    pub(crate) store: StateStore,
    pub(crate) serializer: Box<dyn StateSerializer>,
    stop_flag: Option<Arc<AtomicBool>>,
    deadline: Option<Instant>,
}

impl Search {
    /// A search with the built-in properties registered.
    pub fn new(program: Arc<Program>, vm_config: VmConfig, config: SearchConfig) -> Self {
        let mut bus = ListenerBus::new();
        bus.add(NoUncaughtExceptions);
        if config.check_deadlock {
            bus.add(NotDeadlocked);
        }
        if config.check_races {
            bus.add(RaceDetector);
        }
        if config.check_cycles {
            bus.add(NoStateCycles::new());
        }
        Self {
            program,
            vm_config,
            store: StateStore::new(config.full_images, config.match_depth),
            serializer: config.serializer.build(),
            config,
            bus,
            stop_flag: None,
            deadline: None,
        }
    }

    /// Register a listener or property after the ones already registered.
    pub fn add_listener(&mut self, listener: impl Listener + 'static) {
        self.bus.add(listener);
    }

    pub fn add_boxed_listener(&mut self, listener: Box<dyn Listener>) {
        self.bus.add_boxed(listener);
    }

    /// Set an external stop flag; the search ends as `Cancelled` once it is set.
    pub fn set_stop_flag(&mut self, flag: Arc<AtomicBool>) {
        self.stop_flag = Some(flag);
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn run(&mut self) -> SearchResult<SearchReport> {
        if self.config.check_cycles {
            let depth_first = matches!(
                self.config.order,
                SearchOrder::DepthFirst | SearchOrder::RandomDepthFirst { .. }
            );
            if !depth_first || self.config.parallel {
                return Err(SearchError::Unsupported {
                    feature: "cycle detection",
                    requirement: "a sequential depth-first search",
                });
            }
            if !self.config.state_matching {
                return Err(SearchError::Unsupported {
                    feature: "cycle detection",
                    requirement: "state matching",
                });
            }
        }
        let start = Instant::now();
        self.deadline = (self.config.max_time_secs > 0)
            .then(|| start + Duration::from_secs(self.config.max_time_secs));
        info!(
            order = self.config.order.name(),
            policy = self.vm_config.policy.name(),
            serializer = self.serializer.name(),
            matching = self.config.state_matching,
            parallel = self.config.parallel,
            "starting search"
        );

        let mut vm = Vm::new(Arc::clone(&self.program), self.vm_config.clone())?;
        vm.initialize(&mut self.bus)?;
        self.bus.search_started(&vm);

        let mut run = RunState::default();
        let root = Snapshot::capture(&vm);
        let (key, image) = self.serializer.match_image(&root);
        self.store.visit(key, 0, || image);
        run.stats.states = 1;
        self.bus.state_advanced(
            &vm,
            &StateEvent {
                id: 0,
                fingerprint: key,
                depth: 0,
                is_new: true,
                is_end: root.pending.is_empty(),
            },
        );

        let stop = if self.config.parallel {
            self.configure_thread_pool();
            let node = Node {
                kernel: root.kernel,
                chain: root.pending,
                path: ChoiceTrace::new(),
                depth: 0,
            };
            self.run_parallel(&vm, node, &mut run)?
        } else {
            match self.config.order {
                SearchOrder::BreadthFirst => self.breadth_first(&mut vm, root, &mut run)?,
                SearchOrder::DepthFirst => self.depth_first(&mut vm, root, None, &mut run)?,
                SearchOrder::RandomDepthFirst { seed } => {
                    let rng = StdRng::seed_from_u64(seed);
                    self.depth_first(&mut vm, root, Some(rng), &mut run)?
                }
            }
        };
        if !self.config.parallel {
            run.stats.instructions = vm.instructions();
        }

        let status = match stop {
            Stop::Halted => SearchStatus::Halted,
            Stop::Limit(limit) => SearchStatus::Incomplete(limit),
            Stop::Done if run.depth_limited => SearchStatus::Incomplete(Limit::Depth),
            Stop::Done => SearchStatus::Complete,
        };
        run.stats.collisions = self.store.collisions();
        run.stats.elapsed_ms = start.elapsed().as_millis() as u64;
        let report = SearchReport {
            status,
            violations: run.violations,
            stats: run.stats,
        };
        info!(
            states = report.stats.states,
            transitions = report.stats.transitions,
            max_depth = report.stats.max_depth,
            violations = report.violations.len(),
            status = %report.status,
            "search complete"
        );
        self.bus.search_finished(&report);
        Ok(report)
    }

    fn configure_thread_pool(&self) {
        if self.config.num_threads > 0 {
            if let Err(e) = rayon::ThreadPoolBuilder::new()
                .num_threads(self.config.num_threads)
                .build_global()
            {
                debug!(error = %e, "thread pool already initialized");
            }
        }
    }

    fn depth_first(
        &mut self,
        vm: &mut Vm,
        root: Snapshot,
        mut rng: Option<StdRng>,
        run: &mut RunState,
    ) -> SearchResult<Stop> {
        let mut path = ChoiceTrace::new();
        let mut stack = vec![new_frame(root, 0, rng.as_mut())];

        loop {
            if let Some(limit) = self.limit_reached(run) {
                return Ok(Stop::Limit(limit));
            }
            let Some(top) = stack.last_mut() else {
                return Ok(Stop::Done);
            };
            if !top.chain.advance() {
                stack.pop();
                run.stats.backtracks += 1;
                self.bus.state_backtracked(stack.len());
                continue;
            }

            path.truncate(top.path_len);
            path.extend_from_chain(&top.chain);
            vm.restore_parts(top.kernel.clone(), top.chain.clone(), CgChain::new());
            for cg in top.chain.iter() {
                self.bus.choice_generator_advanced(vm, cg);
            }
            vm.execute_transition(&mut self.bus)?;

            let depth = stack.len();
            match self.process(vm, &path, depth, run) {
                Step::Expand(snapshot) => {
                    stack.push(new_frame(snapshot, path.len(), rng.as_mut()));
                }
                Step::Prune => {}
                Step::Halt => return Ok(Stop::Halted),
            }
            if let Some(p) = &self.config.progress {
                p.queue_len.store(stack.len(), Ordering::Relaxed);
            }
        }
    }

    fn breadth_first(
        &mut self,
        vm: &mut Vm,
        root: Snapshot,
        run: &mut RunState,
    ) -> SearchResult<Stop> {
        let mut queue = VecDeque::new();
        queue.push_back(Node {
            kernel: root.kernel,
            chain: root.pending,
            path: ChoiceTrace::new(),
            depth: 0,
        });

        while let Some(node) = queue.pop_front() {
            let mut chain = node.chain;
            while chain.advance() {
                if let Some(limit) = self.limit_reached(run) {
                    return Ok(Stop::Limit(limit));
                }
                vm.restore_parts(node.kernel.clone(), chain.clone(), CgChain::new());
                for cg in chain.iter() {
                    self.bus.choice_generator_advanced(vm, cg);
                }
                vm.execute_transition(&mut self.bus)?;

                let mut path = node.path.clone();
                path.extend_from_chain(&chain);
                match self.process(vm, &path, node.depth + 1, run) {
                    Step::Expand(snapshot) => queue.push_back(Node {
                        kernel: snapshot.kernel,
                        chain: snapshot.pending,
                        path,
                        depth: node.depth + 1,
                    }),
                    Step::Prune => {}
                    Step::Halt => return Ok(Stop::Halted),
                }
            }
            if let Some(p) = &self.config.progress {
                p.queue_len.store(queue.len(), Ordering::Relaxed);
            }
        }
        Ok(Stop::Done)
    }

    /// Check the state a transition reached and decide whether to expand it.
    fn process(&mut self, vm: &Vm, path: &ChoiceTrace, depth: usize, run: &mut RunState) -> Step {
        let snapshot = Snapshot::capture(vm);
        run.stats.transitions += 1;
        run.stats.max_depth = run.stats.max_depth.max(depth);
        if let Some(p) = &self.config.progress {
            p.transitions.fetch_add(1, Ordering::Relaxed);
            p.depth.fetch_max(depth, Ordering::Relaxed);
        }

        if let Some(found) = self.bus.check(vm) {
            return self.report(found, path, depth, &snapshot, run);
        }
        if vm.kernel().ignored {
            debug!(depth, "state ignored");
            return Step::Prune;
        }

        let (fingerprint, image) = self.serializer.match_image(&snapshot);
        let visit = if self.config.state_matching {
            let visit = self.store.visit(fingerprint, depth, || image);
            self.store.maybe_grow();
            visit
        } else {
            Visit::New(run.stats.states)
        };
        if visit.is_new() {
            run.stats.states += 1;
            if let Some(p) = &self.config.progress {
                p.states.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            run.stats.revisited += 1;
        }

        let is_end = snapshot.pending.is_empty();
        let event = StateEvent {
            id: visit.id(),
            fingerprint,
            depth,
            is_new: visit.is_new(),
            is_end,
        };
        self.bus.state_advanced(vm, &event);
        if let Some(found) = self.bus.check_state(vm, &event) {
            return self.report(found, path, depth, &snapshot, run);
        }
        if is_end {
            if vm.is_end_state() {
                run.stats.end_states += 1;
                self.bus.end_state(vm);
            }
            return Step::Prune;
        }
        if !visit.is_new() {
            return Step::Prune;
        }
        if self.config.max_depth > 0 && depth >= self.config.max_depth {
            run.depth_limited = true;
            return Step::Prune;
        }
        Step::Expand(snapshot)
    }

    fn report(
        &mut self,
        found: PropertyViolation,
        path: &ChoiceTrace,
        depth: usize,
        snapshot: &Snapshot,
        run: &mut RunState,
    ) -> Step {
        let violation = Violation::new(found, path.clone(), depth, snapshot.image_fingerprint());
        info!(
            property = %violation.property,
            depth,
            message = %violation.message,
            "property violated"
        );
        self.bus.property_violated(&violation);
        run.violations.push(violation);
        if self.config.multiple_errors {
            Step::Prune
        } else {
            Step::Halt
        }
    }

    /// Limits are checked between forward steps.
    pub(crate) fn limit_reached(&self, run: &RunState) -> Option<Limit> {
        if let Some(flag) = &self.stop_flag {
            if flag.load(Ordering::Relaxed) {
                info!("search cancelled");
                return Some(Limit::Cancelled);
            }
        }
        if self.config.max_states > 0 && run.stats.states >= self.config.max_states {
            info!(states = run.stats.states, "reached state limit");
            return Some(Limit::States);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            info!("reached time limit");
            return Some(Limit::Time);
        }
        // reading process memory is not free
        if self.config.memory_limit_mb > 0 && run.stats.transitions % 256 == 0 {
            if let Some(mem_mb) = current_memory_mb() {
                if mem_mb >= self.config.memory_limit_mb {
                    info!(
                        memory_mb = mem_mb,
                        limit_mb = self.config.memory_limit_mb,
                        "reached memory limit"
                    );
                    return Some(Limit::Memory);
                }
            }
        }
        None
    }
}

impl fmt::Debug for Search {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Search")
            .field("config", &self.config)
            .field("vm_config", &self.vm_config)
            .field("listeners", &self.bus.len())
            .field("states", &self.store.len())
            .finish_non_exhaustive()
    }
}

fn new_frame(snapshot: Snapshot, path_len: usize, rng: Option<&mut StdRng>) -> Frame {
    let mut chain = snapshot.pending;
    if let Some(rng) = rng {
        for cg in chain.iter_mut() {
            cg.randomize(rng);
        }
    }
    Frame {
        kernel: snapshot.kernel,
        chain,
        path_len,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_names() {
        assert_eq!(SearchOrder::from_name("dfs", 0), Some(SearchOrder::DepthFirst));
        assert_eq!(SearchOrder::from_name("bfs", 0), Some(SearchOrder::BreadthFirst));
        assert_eq!(
            SearchOrder::from_name("random", 9),
            Some(SearchOrder::RandomDepthFirst { seed: 9 })
        );
        assert_eq!(SearchOrder::from_name("best-first", 0), None);
        assert_eq!(SearchOrder::RandomDepthFirst { seed: 1 }.name(), "random");
    }

    #[test]
    fn test_default_config() {
        let config = SearchConfig::default();
        assert_eq!(config.order, SearchOrder::DepthFirst);
        assert!(config.state_matching);
        assert!(config.check_deadlock);
        assert!(!config.check_races);
        assert!(!config.check_cycles);
        assert!(!config.multiple_errors);
        assert_eq!(config.serializer, SerializerKind::Canonical);
        assert_eq!(config.max_states, 0);
    }

    #[test]
    fn test_status_display_and_json() {
        assert_eq!(SearchStatus::Complete.to_string(), "complete");
        assert_eq!(
            SearchStatus::Incomplete(Limit::Depth).to_string(),
            "incomplete (depth limit)"
        );
        let json = serde_json::to_value(SearchStatus::Incomplete(Limit::States)).unwrap();
        assert_eq!(json, serde_json::json!({ "incomplete": "states" }));
        assert_eq!(serde_json::to_value(SearchStatus::Halted).unwrap(), "halted");
    }
}
