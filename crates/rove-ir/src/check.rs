//! Static checks over method bodies.
//!
//! Every instruction must see the same operand-stack depth on every path that
//! reaches it, must not pop more slots than are present, and must only name
//! locals, branch targets, classes, fields and methods that exist.

use crate::error::{MetadataError, MetadataResult};
use crate::insn::{Cond, Insn, InvokeKind};
use crate::program::{MethodDescriptor, Program};
use std::collections::VecDeque;

/// Check every method body in the program.
pub fn check_program(program: &Program) -> MetadataResult<()> {
    for class in program.classes() {
        for method in &class.methods {
            check_method(program, method)?;
        }
    }
    Ok(())
}

/// Check one method, returning the operand-stack depth (in slots) on entry
/// to each reachable instruction; `None` marks unreachable code.
pub fn check_method(
    program: &Program,
    method: &MethodDescriptor,
) -> MetadataResult<Vec<Option<usize>>> {
    let code = &method.code;
    if method.is_native() || method.flags.is_abstract {
        if !code.is_empty() {
            return Err(malformed(method, 0, "native or abstract method has a body"));
        }
        return Ok(Vec::new());
    }
    if code.is_empty() {
        return Err(malformed(method, 0, "empty method body"));
    }
    if method.sig.arg_slots(method.is_static()) > method.max_locals {
        return Err(malformed(method, 0, "parameters exceed max_locals"));
    }

    for (pc, insn) in code.iter().enumerate() {
        check_operands(program, method, pc, insn)?;
    }
    for h in &method.handlers {
        if h.start >= h.end || h.end > code.len() || h.target >= code.len() {
            return Err(malformed(method, h.target, "handler range out of bounds"));
        }
        if let Some(class) = &h.class {
            if program.class_id(class).is_none() {
                return Err(malformed(
                    method,
                    h.target,
                    &format!("handler catches unknown class '{class}'"),
                ));
            }
        }
    }

    let mut depths: Vec<Option<usize>> = vec![None; code.len()];
    let mut work = VecDeque::new();
    enqueue(method, &mut depths, &mut work, 0, 0)?;

    while let Some(pc) = work.pop_front() {
        let depth = depths[pc].unwrap_or(0);
        let insn = &code[pc];
        let effect = insn
            .stack_effect(program)
            .ok_or_else(|| malformed(method, pc, &format!("unresolved operand in '{insn}'")))?;
        if depth < effect.pops {
            return Err(malformed(
                method,
                pc,
                &format!(
                    "stack underflow: '{insn}' pops {} with depth {depth}",
                    effect.pops
                ),
            ));
        }
        let after = depth - effect.pops + effect.pushes;

        for h in method.handlers.iter().filter(|h| h.covers(pc)) {
            enqueue(method, &mut depths, &mut work, h.target, 1)?;
        }
        if let Some(target) = insn.branch_target() {
            enqueue(method, &mut depths, &mut work, target, after)?;
        }
        if insn.falls_through() {
            if pc + 1 >= code.len() {
                return Err(malformed(method, pc, "control falls off the end of the code"));
            }
            enqueue(method, &mut depths, &mut work, pc + 1, after)?;
        }
    }
    Ok(depths)
}

fn enqueue(
    method: &MethodDescriptor,
    depths: &mut [Option<usize>],
    work: &mut VecDeque<usize>,
    pc: usize,
    depth: usize,
) -> MetadataResult<()> {
    match depths[pc] {
        Some(d) if d == depth => Ok(()),
        Some(d) => Err(malformed(
            method,
            pc,
            &format!("inconsistent stack depth: {d} vs {depth}"),
        )),
        None => {
            depths[pc] = Some(depth);
            work.push_back(pc);
            Ok(())
        }
    }
}

fn check_operands(
    program: &Program,
    method: &MethodDescriptor,
    pc: usize,
    insn: &Insn,
) -> MetadataResult<()> {
    let len = method.code.len();
    let err = |msg: String| Err(malformed(method, pc, &msg));
    match insn {
        Insn::Load(k, i) | Insn::Store(k, i) => {
            if *i as usize + k.width() > method.max_locals {
                return err(format!("local {i} out of range"));
            }
        }
        Insn::Inc(i, _) => {
            if *i as usize >= method.max_locals {
                return err(format!("local {i} out of range"));
            }
        }
        Insn::IfACmp(c, _) if !matches!(c, Cond::Eq | Cond::Ne) => {
            return err("reference comparison must be eq or ne".into());
        }
        Insn::New(c) | Insn::InstanceOf(c) | Insn::CheckCast(c) => {
            if program.class_id(c).is_none() {
                return err(format!("unknown class '{c}'"));
            }
        }
        Insn::GetField(f) | Insn::PutField(f) => {
            if program.lookup_instance_field(f).is_none() {
                return err(format!("unknown field '{f}'"));
            }
        }
        Insn::GetStatic(f) | Insn::PutStatic(f) => {
            if program.lookup_static_field(f).is_none() {
                return err(format!("unknown static field '{f}'"));
            }
        }
        Insn::Invoke(kind, r) => {
            let Some(id) = program.resolve_method(r) else {
                return err(format!("unknown method '{r}'"));
            };
            if program.method(id).is_static() != (*kind == InvokeKind::Static) {
                return err(format!("'{}' does not match method '{r}'", kind.name()));
            }
        }
        Insn::Return(k) => {
            if method.sig.ret.kind() != *k {
                return err(format!("'{insn}' in method returning {}", method.sig.ret));
            }
        }
        _ => {}
    }
    if let Some(target) = insn.branch_target() {
        if target >= len {
            return err(format!("branch target {target} out of range"));
        }
    }
    Ok(())
}

fn malformed(method: &MethodDescriptor, pc: usize, message: &str) -> MetadataError {
    MetadataError::MalformedCode {
        method: method.to_string(),
        pc,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::{ArithOp, Constant, FieldRef};
    use crate::program::{ClassDef, FieldDef, Handler, MethodDef, ProgramBuilder};
    use crate::types::{Kind, MethodSig, Type};

    fn program_with(code: Vec<Insn>, ret: &str) -> Program {
        let mut b = ProgramBuilder::new();
        b.add_class(
            ClassDef::new("T")
                .field(FieldDef::new("v", Type::Long))
                .method(
                    MethodDef::new("m", MethodSig::parse(&format!("(I){ret}")).unwrap(), code)
                        .with_static(),
                ),
        );
        b.build().unwrap()
    }

    fn method(p: &Program) -> &MethodDescriptor {
        let t = p.class_id("T").unwrap();
        p.method(p.methods_named(t, "m")[0])
    }

    #[test]
    fn test_depths_follow_stack_effects() {
        let p = program_with(
            vec![
                Insn::Load(Kind::Int, 0),
                Insn::Const(Constant::Int(1)),
                Insn::Arith(ArithOp::Add, Kind::Int),
                Insn::Return(Some(Kind::Int)),
            ],
            "I",
        );
        let depths = check_method(&p, method(&p)).unwrap();
        assert_eq!(depths, vec![Some(0), Some(1), Some(2), Some(1)]);
    }

    #[test]
    fn test_wide_values_take_two_slots() {
        let p = program_with(
            vec![
                Insn::Const(Constant::Null),
                Insn::GetField(FieldRef::new("T", "v")),
                Insn::Pop2,
                Insn::Return(None),
            ],
            "V",
        );
        let depths = check_method(&p, method(&p)).unwrap();
        assert_eq!(depths[2], Some(2));
    }

    #[test]
    fn test_underflow_rejected() {
        let p = program_with(vec![Insn::Pop, Insn::Return(None)], "V");
        let err = check_method(&p, method(&p)).unwrap_err();
        assert!(err.to_string().contains("stack underflow"), "{err}");
    }

    #[test]
    fn test_inconsistent_merge_rejected() {
        let p = program_with(
            vec![
                Insn::Load(Kind::Int, 0),
                Insn::If(Cond::Eq, 3),
                Insn::Const(Constant::Int(7)),
                Insn::Return(None),
            ],
            "V",
        );
        let err = check_method(&p, method(&p)).unwrap_err();
        assert!(err.to_string().contains("inconsistent"), "{err}");
    }

    #[test]
    fn test_fall_off_end_rejected() {
        let p = program_with(vec![Insn::Nop], "V");
        assert!(check_method(&p, method(&p)).is_err());
    }

    #[test]
    fn test_handler_entry_depth_is_one() {
        let mut b = ProgramBuilder::new();
        b.add_class(
            ClassDef::new("T").method(
                MethodDef::new(
                    "m",
                    MethodSig::parse("()V").unwrap(),
                    vec![
                        Insn::Const(Constant::Null),
                        Insn::Throw,
                        Insn::Pop,
                        Insn::Return(None),
                    ],
                )
                .with_static()
                .with_handler(Handler {
                    start: 0,
                    end: 2,
                    target: 2,
                    class: None,
                }),
            ),
        );
        let p = b.build().unwrap();
        let depths = check_method(&p, method(&p)).unwrap();
        assert_eq!(depths, vec![Some(0), Some(1), Some(1), Some(0)]);
    }

    #[test]
    fn test_prelude_is_well_formed() {
        let p = ProgramBuilder::new().build().unwrap();
        check_program(&p).unwrap();
    }
}
