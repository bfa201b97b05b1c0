//! Parallel breadth-first search.
//!
//! Queued states are expanded in batches. Every state of a batch is
//! expanded by a rayon worker on its own clone of the VM; the clones share
//! only the immutable program data and the concurrent [`StateStore`].
//! Listeners are not called from workers: only the built-in properties are
//! evaluated there, and the control thread reports violations after the
//! batch.

use crate::error::SearchResult;
use crate::listener::Listener;
use crate::property::{builtin_violation, Violation};
use crate::search::{Node, RunState, Search, SearchConfig, Stop};
use crate::state::{Snapshot, StateSerializer};
use crate::store::StateStore;
use rayon::prelude::*;
use rove_vm::{CgChain, Vm};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// What one worker found while expanding one state.
#[derive(Default)]
struct Expansion {
    successors: Vec<Node>,
    violations: Vec<Violation>,
    states: usize,
    revisited: usize,
    end_states: usize,
    transitions: usize,
    instructions: u64,
    max_depth: usize,
    depth_limited: bool,
}

impl Search {
    pub(crate) fn run_parallel(
        &mut self,
        base: &Vm,
        root: Node,
        run: &mut RunState,
    ) -> SearchResult<Stop> {
        let batch_size = if self.config.num_threads > 0 {
            self.config.num_threads * 256
        } else {
            rayon::current_num_threads() * 256
        };
        let found_violation = AtomicBool::new(false);
        let mut queue = VecDeque::from([root]);

        while !queue.is_empty() {
            if let Some(limit) = self.limit_reached(run) {
                return Ok(Stop::Limit(limit));
            }
            let batch: Vec<Node> = queue.drain(..queue.len().min(batch_size)).collect();
            debug!(batch = batch.len(), queued = queue.len(), "expanding batch");

            let store = &self.store;
            let serializer = self.serializer.as_ref();
            let config = &self.config;
            let results: Vec<SearchResult<Expansion>> = batch
                .par_iter()
                .map(|node| expand(base, node, store, serializer, config, &found_violation))
                .collect();

            for result in results {
                let expansion = result?;
                let stats = &mut run.stats;
                stats.states += expansion.states;
                stats.revisited += expansion.revisited;
                stats.end_states += expansion.end_states;
                stats.transitions += expansion.transitions;
                stats.instructions += expansion.instructions;
                stats.max_depth = stats.max_depth.max(expansion.max_depth);
                run.depth_limited |= expansion.depth_limited;
                for violation in expansion.violations {
                    self.bus.property_violated(&violation);
                    run.violations.push(violation);
                }
                queue.extend(expansion.successors);
            }
            if !run.violations.is_empty() && !self.config.multiple_errors {
                return Ok(Stop::Halted);
            }

            // no worker is running here
            self.store.maybe_grow();

            if let Some(p) = &self.config.progress {
                p.states.store(run.stats.states, Ordering::Relaxed);
                p.depth.store(run.stats.max_depth, Ordering::Relaxed);
                p.queue_len.store(queue.len(), Ordering::Relaxed);
                p.transitions.store(run.stats.transitions, Ordering::Relaxed);
            }
        }
        Ok(Stop::Done)
    }
}

/// Run every combination of `node`'s chain on a private VM.
fn expand(
    base: &Vm,
    node: &Node,
    store: &StateStore,
    serializer: &dyn StateSerializer,
    config: &SearchConfig,
    found_violation: &AtomicBool,
) -> SearchResult<Expansion> {
    let mut out = Expansion::default();
    if found_violation.load(Ordering::Relaxed) && !config.multiple_errors {
        return Ok(out);
    }
    let mut vm = base.clone();
    let start = vm.instructions();
    let depth = node.depth + 1;
    let mut chain = node.chain.clone();

    while chain.advance() {
        vm.restore_parts(node.kernel.clone(), chain.clone(), CgChain::new());
        vm.execute_transition(&mut ())?;
        out.transitions += 1;
        out.max_depth = out.max_depth.max(depth);

        let mut path = node.path.clone();
        path.extend_from_chain(&chain);
        let snapshot = Snapshot::capture(&vm);

        if let Some(found) = builtin_violation(&vm, config.check_deadlock, config.check_races) {
            found_violation.store(true, Ordering::Relaxed);
            out.violations.push(Violation::new(
                found,
                path,
                depth,
                snapshot.image_fingerprint(),
            ));
            if !config.multiple_errors {
                break;
            }
            continue;
        }
        if vm.kernel().ignored {
            continue;
        }

        let is_new = if config.state_matching {
            let (fingerprint, image) = serializer.match_image(&snapshot);
            store.visit(fingerprint, depth, || image).is_new()
        } else {
            true
        };
        if is_new {
            out.states += 1;
        } else {
            out.revisited += 1;
        }
        if snapshot.pending.is_empty() {
            if vm.is_end_state() {
                out.end_states += 1;
            }
            continue;
        }
        if !is_new {
            continue;
        }
        if config.max_depth > 0 && depth >= config.max_depth {
            out.depth_limited = true;
            continue;
        }
        out.successors.push(Node {
            kernel: snapshot.kernel,
            chain: snapshot.pending,
            path,
            depth,
        });
    }
    out.instructions = vm.instructions() - start;
    Ok(out)
}
