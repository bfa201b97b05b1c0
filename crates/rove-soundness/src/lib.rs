//! Program generators and helpers shared by the soundness tests.

use rove_ir::Program;
use rove_mc::{
    replay, ListenerBus, NoUncaughtExceptions, NotDeadlocked, ReplayReport, Search, SearchConfig,
    SearchReport, Violation,
};
use rove_vm::VmConfig;
use std::fmt::Write;
use std::sync::Arc;

pub fn compile(source: &str) -> Result<Arc<Program>, String> {
    let program = rove_asm::parse(source).map_err(|e| e.to_string())?;
    rove_ir::check_program(&program).map_err(|e| e.to_string())?;
    Ok(Arc::new(program))
}

pub fn check_source(
    source: &str,
    vm_config: VmConfig,
    config: SearchConfig,
) -> Result<SearchReport, String> {
    let program = compile(source)?;
    Search::new(program, vm_config, config)
        .run()
        .map_err(|e| e.to_string())
}

/// Replay the trace of `violation` with the built-in properties registered.
pub fn replay_violation(
    source: &str,
    vm_config: VmConfig,
    violation: &Violation,
) -> Result<ReplayReport, String> {
    let program = compile(source)?;
    let mut bus = ListenerBus::new();
    bus.add(NoUncaughtExceptions);
    bus.add(NotDeadlocked);
    replay(program, vm_config, &violation.trace, &mut bus).map_err(|e| e.to_string())
}

/// `workers` threads each add 1 to `Main.count` `increments` times, with or
/// without holding `Main.lock`. The main thread joins them and asserts the
/// final count.
pub fn counter_program(workers: usize, increments: usize, locked: bool) -> String {
    let mut src = String::new();
    src.push_str("class Main\n  static field count: int\n  static field lock: Object\n");
    let _ = writeln!(src, "  static method main()V locals {workers}");
    src.push_str(
        "    new Object\n    dup\n    invokespecial Object.<init>()V\n    putstatic Main.lock\n",
    );
    for i in 0..workers {
        let _ = writeln!(
            src,
            "    new Worker\n    dup\n    invokespecial Worker.<init>()V\n    astore {i}"
        );
    }
    for i in 0..workers {
        let _ = writeln!(src, "    aload {i}\n    invokevirtual Worker.start()V");
    }
    for i in 0..workers {
        let _ = writeln!(src, "    aload {i}\n    invokevirtual Worker.join()V");
    }
    let _ = writeln!(
        src,
        "    getstatic Main.count\n    iconst {}\n    if_icmpne lost\n    return\n  lost:\n    iconst 0\n    invokestatic Verify.assertTrue(Z)V\n    return\n  end\nend\n",
        workers * increments
    );

    src.push_str("class Worker extends Thread\n  method run()V locals 2\n");
    for _ in 0..increments {
        if locked {
            src.push_str("    getstatic Main.lock\n    dup\n    astore 1\n    monitorenter\n");
        }
        src.push_str("    getstatic Main.count\n    iconst 1\n    iadd\n    putstatic Main.count\n");
        if locked {
            src.push_str("    aload 1\n    monitorexit\n");
        }
    }
    src.push_str("    return\n  end\nend\n\nentry Main.main\n");
    src
}

/// One `Verify.getInt(lo, hi)` followed by `booleans` calls to
/// `Verify.getBoolean`, each result stored in its own static field.
pub fn choice_program(lo: i32, hi: i32, booleans: usize) -> String {
    let mut src = String::from("class T\n  static field v: int\n");
    for i in 0..booleans {
        let _ = writeln!(src, "  static field b{i}: int");
    }
    src.push_str("  static method main()V\n");
    let _ = writeln!(
        src,
        "    iconst {lo}\n    iconst {hi}\n    invokestatic Verify.getInt(II)I\n    putstatic T.v"
    );
    for i in 0..booleans {
        let _ = writeln!(src, "    invokestatic Verify.getBoolean()Z\n    putstatic T.b{i}");
    }
    src.push_str("    return\n  end\nend\n\nentry T.main\n");
    src
}

/// A static method taking one int, called once with `arg`; its result is
/// stored in `Main.result`.
pub fn single_int_call(arg: i32) -> String {
    format!(
        "class Calc
  static method scale(I)I
    iload 0
    ireturn
  end
end

class Main
  static field result: int
  static method main()V
    iconst {arg}
    invokestatic Calc.scale(I)I
    putstatic Main.result
    return
  end
end

entry Main.main
"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_programs_compile() {
        for workers in 1..=3 {
            for increments in 1..=2 {
                for locked in [false, true] {
                    let src = counter_program(workers, increments, locked);
                    compile(&src).unwrap_or_else(|e| panic!("{e}\n{src}"));
                }
            }
        }
        compile(&choice_program(-1, 2, 3)).unwrap();
        compile(&single_int_call(9)).unwrap();
    }
}
