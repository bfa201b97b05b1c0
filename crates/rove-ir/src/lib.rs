//! Class metadata and instruction set for the rove model checker.

pub mod check;
pub mod error;
pub mod insn;
pub mod prelude;
pub mod program;
pub mod types;

pub use check::{check_method, check_program};
pub use error::{MetadataError, MetadataResult};
pub use insn::{
    AccessTarget, ArithOp, Cond, Constant, FieldRef, Insn, InvokeKind, MethodRef, StackEffect,
};
pub use program::{
    ClassDef, ClassDescriptor, ClassId, FieldDef, FieldDescriptor, Handler, MethodDef,
    MethodDescriptor, MethodFlags, MethodId, Program, ProgramBuilder,
};
pub use types::{Kind, MethodSig, Type};
