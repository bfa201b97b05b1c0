//! Explicit-state model checker for rove programs: state storage, search
//! driver, listeners, properties and choice-trace replay.

pub mod config;
pub mod error;
pub mod fpset;
pub mod listener;
mod parallel;
pub mod property;
pub mod search;
pub mod state;
pub mod store;
pub mod trace;

pub use config::RunConfig;
pub use error::{
    ConfigError, ConfigResult, ReplayError, ReplayResult, SearchError, SearchResult,
};
pub use fpset::SeenSet;
pub use listener::{
    ChoiceRecord, ChoiceTracker, ExecTracker, Listener, ListenerBus, StateCounter, StateCounts,
    StateEvent,
};
pub use property::{
    builtin_violation, NoStateCycles, NoUncaughtExceptions, NotDeadlocked, PropertyViolation,
    RaceDetector, Violation,
};
pub use search::{
    Limit, ProgressCounters, Search, SearchConfig, SearchOrder, SearchReport, SearchStats,
    SearchStatus,
};
pub use state::{
    CanonicalSerializer, Fingerprint, HeapOrderSerializer, SerializerKind, Snapshot,
    StateSerializer,
};
pub use store::{StateInfo, StateStore, Visit};
pub use trace::{replay, ChoiceStep, ChoiceTrace, ReplayReport};
