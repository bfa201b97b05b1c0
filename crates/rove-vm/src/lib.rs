//! Backtrackable virtual machine for rove: interpreter, choice generators,
//! scheduler and native peers.

pub mod choice;
pub mod config;
pub mod error;
pub mod frame;
pub mod heap;
pub mod idle;
pub mod inject;
mod interp;
pub mod kernel;
pub mod monitor;
pub mod native;
mod peers;
pub mod perturb;
pub mod scheduler;
pub mod statics;
mod sync;
pub mod thread;
pub mod value;
pub mod vm;

pub use choice::{CgChain, CgLocation, Choice, ChoiceDomain, ChoiceGenerator};
pub use config::{PolicyKind, VmConfig};
pub use error::{Location, VmError, VmResult};
pub use frame::{FrameKind, StackFrame};
pub use heap::{Heap, HeapObject, ObjectData};
pub use idle::IdleAction;
pub use inject::{Injection, Injector};
pub use kernel::{KernelState, UncaughtException};
pub use monitor::{Monitor, MonitorTarget};
pub use native::{NativeEnv, NativeOutcome, NativePeer, NativeRegistry};
pub use perturb::{Perturbation, Perturbator};
pub use scheduler::{AllRunnables, Reduced, SchedEvent, Scheduler, SchedulingRelevance, SyncPolicy};
pub use statics::{InitState, StaticArea};
pub use thread::{Blocker, ThreadContext, ThreadId, ThreadStatus};
pub use value::{ObjRef, Value};
pub use vm::{AccessSite, ExecObserver, FieldAccess, Vm};
