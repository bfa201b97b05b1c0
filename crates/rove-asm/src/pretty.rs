//! Render a registered program back to assembly text.
//!
//! Output parses back into an equivalent program. Prelude classes are
//! omitted; branch targets and handler bounds become `L<pc>` labels.

use rove_ir::{ClassDescriptor, Constant, Insn, MethodDescriptor, Program};
use std::collections::BTreeSet;
use std::fmt::Write;

pub fn pretty_print(program: &Program) -> String {
    let mut out = String::new();
    for (i, class) in program.user_classes().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        print_class(program, class, &mut out);
    }
    if let Some(entry) = program.entry() {
        if !out.is_empty() {
            out.push('\n');
        }
        let _ = writeln!(out, "entry {}", program.method(entry));
    }
    out
}

fn print_class(program: &Program, class: &ClassDescriptor, out: &mut String) {
    let _ = write!(out, "class {}", class.name);
    if let Some(sup) = class.superclass {
        let sup = &program.class(sup).name;
        if &**sup != rove_ir::prelude::OBJECT {
            let _ = write!(out, " extends {sup}");
        }
    }
    out.push('\n');

    // Declaration order is not retained across instance and static fields.
    for field in class.fields.iter().chain(class.static_fields.iter()) {
        out.push_str("  ");
        if field.is_static {
            out.push_str("static ");
        }
        if field.is_final {
            out.push_str("final ");
        }
        let _ = writeln!(out, "field {}: {}", field.name, field.ty);
    }
    for method in &class.methods {
        print_method(method, out);
    }
    out.push_str("end\n");
}

fn print_method(method: &MethodDescriptor, out: &mut String) {
    out.push_str("  ");
    let flags = method.flags;
    for (set, word) in [
        (flags.is_static, "static "),
        (flags.is_synchronized, "synchronized "),
        (flags.is_native, "native "),
        (flags.is_abstract, "abstract "),
    ] {
        if set {
            out.push_str(word);
        }
    }
    let _ = write!(out, "method {}{}", method.name, method.sig);
    if flags.is_native || flags.is_abstract {
        out.push('\n');
        return;
    }
    let _ = writeln!(out, " locals {}", method.max_locals);

    let mut labels: BTreeSet<usize> = method
        .code
        .iter()
        .filter_map(Insn::branch_target)
        .collect();
    for h in &method.handlers {
        labels.extend([h.start, h.end, h.target]);
    }

    for (pc, insn) in method.code.iter().enumerate() {
        if labels.contains(&pc) {
            let _ = writeln!(out, "  L{pc}:");
        }
        let _ = writeln!(out, "    {}", render_insn(insn));
    }
    if labels.contains(&method.code.len()) {
        let _ = writeln!(out, "  L{}:", method.code.len());
    }
    for h in &method.handlers {
        let class = h.class.as_deref().unwrap_or("any");
        let _ = writeln!(
            out,
            "    catch {class} L{} L{} L{}",
            h.start, h.end, h.target
        );
    }
    out.push_str("  end\n");
}

/// Instruction with label operands instead of raw pcs.
fn render_insn(insn: &Insn) -> String {
    match insn {
        Insn::Const(Constant::Float(bits)) => {
            format!("fconst {}", float_literal(f64::from(f32::from_bits(*bits))))
        }
        Insn::Const(Constant::Double(bits)) => {
            format!("dconst {}", float_literal(f64::from_bits(*bits)))
        }
        Insn::NewArray(ty) => format!("newarray {}", ty.name()),
        _ => match insn.branch_target() {
            Some(t) => format!("{} L{t}", insn.mnemonic()),
            None => insn.to_string(),
        },
    }
}

fn float_literal(x: f64) -> String {
    if x.fract() == 0.0 && x.abs() < 1e15 {
        format!("{x:.1}")
    } else {
        format!("{x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse;

    const SOURCE: &str = r#"
class Buffer
  field items: int[]
  field count: int
  static final field CAPACITY: int

  synchronized method put(I)V
  wait:
    aload 0
    getfield Buffer.count
    iconst 2
    if_icmplt ready
    aload 0
    invokevirtual Object.wait()V
    goto wait
  ready:
    aload 0
    dup
    getfield Buffer.count
    iconst 1
    iadd
    putfield Buffer.count
    aload 0
    invokevirtual Object.notifyAll()V
    return
  end
end

class Main
  static method main()V
    fconst 1.5
    pop
    dconst -2
    pop2
    iconst 1
    iconst 0
  try:
    idiv
    pop
  after:
    return
  handler:
    pop
    return
    catch ArithmeticException try after handler
  end
end
"#;

    #[test]
    fn test_pretty_roundtrip() {
        let once = pretty_print(&parse(SOURCE).unwrap());
        let twice = pretty_print(&parse(&once).unwrap());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_pretty_uses_labels() {
        let text = pretty_print(&parse(SOURCE).unwrap());
        assert!(text.contains("  L0:\n"), "{text}");
        assert!(text.contains("goto L0"), "{text}");
        assert!(text.contains("catch ArithmeticException L6 L8 L9"), "{text}");
        assert!(text.contains("static final field CAPACITY: int"), "{text}");
        assert!(text.contains("dconst -2.0"), "{text}");
        assert!(text.contains("entry Main.main"), "{text}");
        assert!(!text.contains("class Object"), "{text}");
    }
}
