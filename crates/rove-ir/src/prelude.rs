//! Built-in classes registered ahead of every program.
//!
//! Native methods here are bound to peers by the interpreter; the bodies
//! that do exist are trivial constructors and the default `Thread.run`.

use crate::insn::Insn;
use crate::program::{ClassDef, MethodDef};
use crate::types::{MethodSig, Type};

pub const OBJECT: &str = "Object";
pub const THREAD: &str = "Thread";
pub const VERIFY: &str = "Verify";
pub const CONSOLE: &str = "Console";
pub const THROWABLE: &str = "Throwable";
pub const ERROR: &str = "Error";
pub const EXCEPTION: &str = "Exception";
pub const RUNTIME_EXCEPTION: &str = "RuntimeException";
pub const ASSERTION_ERROR: &str = "AssertionError";
pub const OUT_OF_MEMORY_ERROR: &str = "OutOfMemoryError";
pub const ARITHMETIC_EXCEPTION: &str = "ArithmeticException";
pub const NULL_POINTER_EXCEPTION: &str = "NullPointerException";
pub const ARRAY_INDEX_EXCEPTION: &str = "ArrayIndexOutOfBoundsException";
pub const NEGATIVE_ARRAY_SIZE_EXCEPTION: &str = "NegativeArraySizeException";
pub const CLASS_CAST_EXCEPTION: &str = "ClassCastException";
pub const ILLEGAL_MONITOR_STATE_EXCEPTION: &str = "IllegalMonitorStateException";
pub const ILLEGAL_THREAD_STATE_EXCEPTION: &str = "IllegalThreadStateException";

fn sig(params: Vec<Type>, ret: Type) -> MethodSig {
    MethodSig::new(params, ret)
}

fn object_array() -> Type {
    Type::Array(Box::new(Type::Ref(OBJECT.into())))
}

fn empty_body(name: &str) -> MethodDef {
    MethodDef::new(name, sig(vec![], Type::Void), vec![Insn::Return(None)])
}

pub(crate) fn classes() -> Vec<ClassDef> {
    let mut classes = vec![
        ClassDef::new(OBJECT)
            .method(empty_body("<init>"))
            .method(MethodDef::native("wait", sig(vec![], Type::Void)))
            .method(MethodDef::native("notify", sig(vec![], Type::Void)))
            .method(MethodDef::native("notifyAll", sig(vec![], Type::Void))),
        ClassDef::new(THREAD)
            .method(empty_body("run"))
            .method(MethodDef::native("start", sig(vec![], Type::Void)))
            .method(MethodDef::native("join", sig(vec![], Type::Void)))
            .method(MethodDef::native("yield", sig(vec![], Type::Void)).with_static()),
        ClassDef::new(VERIFY)
            .method(MethodDef::native("getBoolean", sig(vec![], Type::Boolean)).with_static())
            .method(
                MethodDef::native("getInt", sig(vec![Type::Int, Type::Int], Type::Int))
                    .with_static(),
            )
            .method(
                MethodDef::native(
                    "getIntFromArray",
                    sig(vec![Type::Array(Box::new(Type::Int))], Type::Int),
                )
                .with_static(),
            )
            .method(
                MethodDef::native(
                    "getObjectFromArray",
                    sig(vec![object_array()], Type::Ref(OBJECT.into())),
                )
                .with_static(),
            )
            .method(
                MethodDef::native("assertTrue", sig(vec![Type::Boolean], Type::Void))
                    .with_static(),
            )
            .method(
                MethodDef::native("ignoreIf", sig(vec![Type::Boolean], Type::Void)).with_static(),
            )
            .method(MethodDef::native("breakTransition", sig(vec![], Type::Void)).with_static()),
        ClassDef::new(CONSOLE)
            .method(MethodDef::native("print", sig(vec![Type::Int], Type::Void)).with_static()),
        ClassDef::new(THROWABLE),
        ClassDef::new(ERROR).extends(THROWABLE),
        ClassDef::new(ASSERTION_ERROR).extends(ERROR),
        ClassDef::new(OUT_OF_MEMORY_ERROR).extends(ERROR),
        ClassDef::new(EXCEPTION).extends(THROWABLE),
        ClassDef::new(RUNTIME_EXCEPTION).extends(EXCEPTION),
    ];
    for name in [
        ARITHMETIC_EXCEPTION,
        NULL_POINTER_EXCEPTION,
        ARRAY_INDEX_EXCEPTION,
        NEGATIVE_ARRAY_SIZE_EXCEPTION,
        CLASS_CAST_EXCEPTION,
        ILLEGAL_MONITOR_STATE_EXCEPTION,
        ILLEGAL_THREAD_STATE_EXCEPTION,
    ] {
        classes.push(ClassDef::new(name).extends(RUNTIME_EXCEPTION));
    }
    classes
}
