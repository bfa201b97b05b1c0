//! Choice traces and replay.
//!
//! A [`ChoiceTrace`] lists, in order, the `(generator id, domain index)`
//! pair of every generator taken on the path from the initial state. Since
//! generator enumeration is deterministic, following the same pairs from a
//! fresh VM reaches the same state.

use crate::error::{ReplayError, ReplayResult};
use crate::listener::{Listener, ListenerBus};
use crate::property::PropertyViolation;
use crate::state::{Fingerprint, Snapshot};
use rove_ir::Program;
use rove_vm::{CgChain, Vm, VmConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChoiceStep {
    pub id: String,
    pub index: usize,
}

impl ChoiceStep {
    pub fn new(id: impl Into<String>, index: usize) -> Self {
        Self {
            id: id.into(),
            index,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChoiceTrace(pub Vec<ChoiceStep>);

impl ChoiceTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Steps taken by the chain's current choices, parent first.
    pub fn extend_from_chain(&mut self, chain: &CgChain) {
        self.0.extend(
            chain
                .choices()
                .filter_map(|(id, index)| Some(ChoiceStep::new(id, index?))),
        );
    }

    pub fn steps(&self) -> &[ChoiceStep] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn truncate(&mut self, len: usize) {
        self.0.truncate(len);
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn from_json(text: &str) -> ReplayResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

impl fmt::Display for ChoiceTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}:{}", step.id, step.index)?;
        }
        Ok(())
    }
}

/// State reached by following a trace.
#[derive(Debug, Clone)]
pub struct ReplayReport {
    /// First violation reported by a property in the final state.
    pub violation: Option<PropertyViolation>,
    /// Exact image of the final state.
    pub image: Vec<u8>,
    pub fingerprint: Fingerprint,
    /// Transitions executed.
    pub steps: usize,
    /// Lines printed by the program on the path.
    pub output: Vec<String>,
}

/// Follow `trace` from the initial state of `program`.
///
/// Every generator a transition registers has to match the next trace
/// step by id, and the step's index has to be in its domain. The replay
/// stops when the trace is used up; the properties registered on
/// `listeners` are evaluated on the state reached.
pub fn replay(
    program: Arc<Program>,
    vm_config: VmConfig,
    trace: &ChoiceTrace,
    listeners: &mut ListenerBus,
) -> ReplayResult<ReplayReport> {
    let mut vm = Vm::new(program, vm_config)?;
    vm.initialize(listeners)?;
    let steps = trace.steps();
    let mut pos = 0;
    let mut transitions = 0;

    while pos < steps.len() {
        let mut chain = vm.next_chain().clone();
        if chain.is_empty() {
            return Err(ReplayError::TooLong {
                step: pos,
                len: steps.len(),
            });
        }
        if pos + chain.len() > steps.len() {
            return Err(ReplayError::TooShort {
                step: steps.len(),
                needed: chain.len(),
            });
        }
        let mut indices = Vec::with_capacity(chain.len());
        for (offset, cg) in chain.iter().enumerate() {
            let step = &steps[pos + offset];
            if *cg.id != *step.id {
                return Err(ReplayError::Mismatch {
                    step: pos + offset,
                    expected: step.id.clone(),
                    found: cg.id.to_string(),
                });
            }
            if step.index >= cg.total() {
                return Err(ReplayError::IndexOutOfRange {
                    step: pos + offset,
                    id: step.id.clone(),
                    index: step.index,
                    total: cg.total(),
                });
            }
            indices.push(step.index);
        }
        chain.select_all(&indices);
        for cg in chain.iter() {
            listeners.choice_generator_advanced(&vm, cg);
        }
        debug!(step = pos, trace = %chain_summary(&chain), "replaying");
        pos += chain.len();

        vm.set_current_chain(chain);
        vm.execute_transition(listeners)?;
        transitions += 1;
    }

    let snapshot = Snapshot::capture(&vm);
    let image = snapshot.to_bytes();
    let fingerprint = Fingerprint::of_bytes(&image);
    let violation = listeners.check(&vm);
    info!(
        steps = transitions,
        fingerprint = %fingerprint,
        violation = violation.is_some(),
        "replay complete"
    );
    Ok(ReplayReport {
        violation,
        image,
        fingerprint,
        steps: transitions,
        output: vm.take_output(),
    })
}

fn chain_summary(chain: &CgChain) -> String {
    let mut trace = ChoiceTrace::new();
    trace.extend_from_chain(chain);
    trace.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_format_is_a_list_of_pairs() {
        let trace = ChoiceTrace(vec![ChoiceStep::new("ROOT", 0), ChoiceStep::new("LOCK", 1)]);
        let json = serde_json::to_string(&trace).unwrap();
        assert_eq!(json, r#"[{"id":"ROOT","index":0},{"id":"LOCK","index":1}]"#);
        assert_eq!(ChoiceTrace::from_json(&trace.to_json()).unwrap(), trace);
        assert_eq!(trace.to_string(), "ROOT:0 LOCK:1");
    }

    #[test]
    fn test_bad_json_is_a_format_error() {
        let err = ChoiceTrace::from_json("{\"id\": 3}").unwrap_err();
        assert!(matches!(err, ReplayError::Format(_)));
    }
}
