use crate::idle::IdleAction;
use crate::scheduler::{AllRunnables, Reduced, Scheduler, SyncPolicy};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolicyKind {
    #[default]
    AllRunnables,
    Reduced,
}

impl PolicyKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "all" | "all-runnables" => Some(PolicyKind::AllRunnables),
            "reduced" => Some(PolicyKind::Reduced),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PolicyKind::AllRunnables => "all",
            PolicyKind::Reduced => "reduced",
        }
    }
}

/// Per-run interpreter settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    pub policy: PolicyKind,
    /// Create optional scheduling points even when only the current thread can run.
    pub break_single_choice: bool,
    pub break_lock_release: bool,
    pub break_notify: bool,
    pub break_yield: bool,
    /// Methods whose calls get perturbed arguments: `Class.method` or `Class.method(desc)`.
    pub perturb: Vec<String>,
    pub perturb_seed: u64,
    /// Collect unreachable objects after every transition.
    pub gc: bool,
    /// Instructions after which a transition is forcibly ended.
    pub max_transition_length: usize,
    /// Longest array a `newarray` may allocate before it throws `OutOfMemoryError`.
    pub max_array_length: usize,
    /// Exceptions thrown at chosen sites: `Exc[("detail")]@Class.method[(desc)][:pc]`.
    pub inject: Vec<String>,
    /// Backward jumps within one transition before a loop counts as idle. Zero disables.
    pub idle_max_backjumps: usize,
    pub idle_action: IdleAction,
}

impl Default for VmConfig {
    fn default() -> Self {
        let policy = AllRunnables::default();
        Self {
            policy: PolicyKind::default(),
            break_single_choice: false,
            break_lock_release: policy.break_lock_release,
            break_notify: policy.break_notify,
            break_yield: policy.break_yield,
            perturb: Vec::new(),
            perturb_seed: 5,
            gc: true,
            max_transition_length: 50_000,
            max_array_length: 1 << 20,
            inject: Vec::new(),
            idle_max_backjumps: 0,
            idle_action: IdleAction::default(),
        }
    }
}

impl VmConfig {
    pub fn scheduler(&self) -> Scheduler {
        let policy: Arc<dyn SyncPolicy> = match self.policy {
            PolicyKind::AllRunnables => Arc::new(AllRunnables {
                break_lock_release: self.break_lock_release,
                break_notify: self.break_notify,
                break_yield: self.break_yield,
            }),
            PolicyKind::Reduced => Arc::new(Reduced),
        };
        Scheduler::new(policy, self.break_single_choice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_names_roundtrip() {
        for kind in [PolicyKind::AllRunnables, PolicyKind::Reduced] {
            assert_eq!(PolicyKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(PolicyKind::from_name("all-runnables"), Some(PolicyKind::AllRunnables));
        assert_eq!(PolicyKind::from_name("fair"), None);
    }

    #[test]
    fn test_defaults() {
        let config = VmConfig::default();
        assert_eq!(config.policy, PolicyKind::AllRunnables);
        assert_eq!(config.perturb_seed, 5);
        assert!(config.gc);
        assert!(!config.break_single_choice);
        assert_eq!(config.max_array_length, 1 << 20);
        assert_eq!(config.idle_max_backjumps, 0);
        assert_eq!(config.idle_action, IdleAction::Warn);
    }
}
