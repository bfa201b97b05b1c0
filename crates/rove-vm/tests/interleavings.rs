use rove_ir::Program;
use rove_vm::{
    CgChain, ChoiceDomain, ChoiceGenerator, ExecObserver, SchedulingRelevance, Value, Vm,
    VmConfig, VmError,
};
use std::sync::Arc;

fn program(src: &str) -> Arc<Program> {
    Arc::new(rove_asm::parse(src).unwrap())
}

#[derive(Default)]
struct Recorder {
    cgs: Vec<ChoiceGenerator>,
}

impl ExecObserver for Recorder {
    fn choice_generator_registered(&mut self, _vm: &Vm, cg: &ChoiceGenerator) {
        self.cgs.push(cg.clone());
    }
}

/// Depth-first walk over every path, without state matching. Calls `leaf`
/// on each state that registers no further choices.
fn explore<T>(vm: &mut Vm, obs: &mut dyn ExecObserver, mut leaf: impl FnMut(&Vm) -> T) -> Vec<T> {
    vm.initialize(obs).unwrap();
    let mut stack = vec![(vm.kernel().clone(), vm.take_next_chain())];
    let mut leaves = Vec::new();
    while let Some((kernel, chain)) = stack.last_mut() {
        if !chain.advance() {
            stack.pop();
            continue;
        }
        vm.restore_parts(kernel.clone(), chain.clone(), CgChain::new());
        vm.execute_transition(obs).unwrap();
        let next = vm.take_next_chain();
        if next.is_empty() {
            leaves.push(leaf(vm));
        } else {
            stack.push((vm.kernel().clone(), next));
        }
        assert!(stack.len() < 200, "runaway path");
    }
    leaves
}

fn static_int(vm: &Vm, class: &str, field: &str) -> i32 {
    match vm.static_value(class, field) {
        Some(Value::Int(v)) => v,
        other => panic!("{class}.{field} is {other:?}"),
    }
}

const LOST_UPDATE: &str = r#"
class Main
  static field count: int
  static method main()V locals 2
    new Worker
    dup
    invokespecial Worker.<init>()V
    astore 0
    new Worker
    dup
    invokespecial Worker.<init>()V
    astore 1
    aload 0
    invokevirtual Worker.start()V
    aload 1
    invokevirtual Worker.start()V
    aload 0
    invokevirtual Worker.join()V
    aload 1
    invokevirtual Worker.join()V
    return
  end
end

class Worker extends Thread
  method run()V
    getstatic Main.count
    iconst 1
    iadd
    putstatic Main.count
    return
  end
end

entry Main.main
"#;

#[test]
fn test_lost_update_is_reachable() {
    let mut vm = Vm::new(program(LOST_UPDATE), VmConfig::default()).unwrap();
    let leaves = explore(&mut vm, &mut (), |vm| {
        assert!(vm.is_end_state());
        static_int(vm, "Main", "count")
    });
    assert!(leaves.contains(&1), "{leaves:?}");
    assert!(leaves.contains(&2), "{leaves:?}");
    assert!(leaves.iter().all(|&n| n == 1 || n == 2));
}

#[test]
fn test_reduced_policy_misses_the_race() {
    let config = VmConfig {
        policy: rove_vm::PolicyKind::Reduced,
        ..VmConfig::default()
    };
    let mut vm = Vm::new(program(LOST_UPDATE), config).unwrap();
    let leaves = explore(&mut vm, &mut (), |vm| static_int(vm, "Main", "count"));
    assert!(leaves.iter().all(|&n| n == 2), "{leaves:?}");
}

const PERTURBED: &str = r#"
class Calc
  static method scale(I)I
    iload 0
    ireturn
  end
end

class Main
  static field result: int
  static method main()V
    iconst 7
    invokestatic Calc.scale(I)I
    putstatic Main.result
    return
  end
end

entry Main.main
"#;

#[test]
fn test_perturbation_enumerates_argument_values() {
    let config = VmConfig {
        perturb: vec!["Calc.scale".to_string()],
        ..VmConfig::default()
    };
    let mut vm = Vm::new(program(PERTURBED), config).unwrap();
    let mut recorder = Recorder::default();
    let leaves = explore(&mut vm, &mut recorder, |vm| static_int(vm, "Main", "result"));

    let perturb: Vec<&ChoiceGenerator> = recorder
        .cgs
        .iter()
        .filter(|cg| &*cg.id == "perturb(Calc.scale(I)I)")
        .collect();
    assert_eq!(perturb.len(), 1);
    assert_eq!(perturb[0].total(), 3);
    assert!(perturb[0].relevance.is_none());

    assert_eq!(leaves.len(), 3);
    assert_eq!(leaves[1], 0);
    assert!((0..100).contains(&leaves[0]));
    assert!((-99..=0).contains(&leaves[2]));
}

const CONTENDED: &str = r#"
class Main
  static field lock: Object
  static method main()V locals 2
    new Object
    dup
    invokespecial Object.<init>()V
    putstatic Main.lock
    new Worker
    dup
    invokespecial Worker.<init>()V
    astore 0
    aload 0
    invokevirtual Worker.start()V
    getstatic Main.lock
    dup
    astore 1
    monitorenter
    getstatic Main.lock
    pop
    aload 1
    monitorexit
    aload 0
    invokevirtual Worker.join()V
    return
  end
end

class Worker extends Thread
  method run()V locals 2
    getstatic Main.lock
    dup
    astore 1
    monitorenter
    getstatic Main.lock
    pop
    aload 1
    monitorexit
    return
  end
end

entry Main.main
"#;

#[test]
fn test_blocked_thread_is_excluded_from_block_choice() {
    let mut vm = Vm::new(program(CONTENDED), VmConfig::default()).unwrap();
    let mut recorder = Recorder::default();
    let leaves = explore(&mut vm, &mut recorder, |vm| vm.is_end_state());
    assert!(leaves.iter().all(|&end| end));

    let blocks: Vec<&ChoiceGenerator> =
        recorder.cgs.iter().filter(|cg| &*cg.id == "BLOCK").collect();
    assert!(!blocks.is_empty());
    for cg in blocks {
        assert_eq!(cg.relevance, Some(SchedulingRelevance::Mandatory));
        let ChoiceDomain::Threads(threads) = &cg.domain else {
            panic!("BLOCK is not a thread choice");
        };
        assert!(!threads.contains(&cg.thread));
        assert!(!threads.is_empty());
    }
}

#[test]
fn test_thread_local_work_has_no_data_choices() {
    let src = r#"
class Box
  field v: int
end

class Main
  static field out: int
  static method main()V locals 1
    new Box
    dup
    invokespecial Box.<init>()V
    astore 0
    aload 0
    iconst 5
    putfield Box.v
    aload 0
    getfield Box.v
    putstatic Main.out
    return
  end
end

entry Main.main
"#;
    let mut vm = Vm::new(program(src), VmConfig::default()).unwrap();
    let mut recorder = Recorder::default();
    let leaves = explore(&mut vm, &mut recorder, |vm| static_int(vm, "Main", "out"));
    assert_eq!(leaves, vec![5]);
    let ids: Vec<&str> = recorder.cgs.iter().map(|cg| &*cg.id).collect();
    assert_eq!(ids, vec!["ROOT"]);
}

#[test]
fn test_perturbation_cascades_with_lock_choice() {
    let src = r#"
class Calc
  synchronized method scale(I)I
    iload 1
    ireturn
  end
end

class Main
  static field calc: Calc
  static field result: int
  static method main()V
    new Calc
    dup
    invokespecial Calc.<init>()V
    putstatic Main.calc
    getstatic Main.calc
    iconst 7
    invokevirtual Calc.scale(I)I
    putstatic Main.result
    return
  end
end

entry Main.main
"#;
    let config = VmConfig {
        perturb: vec!["Calc.scale(I)I".to_string()],
        break_single_choice: true,
        ..VmConfig::default()
    };
    let mut vm = Vm::new(program(src), config).unwrap();
    vm.initialize(&mut ()).unwrap();
    let mut root = vm.take_next_chain();
    assert!(root.advance());
    vm.set_current_chain(root);
    vm.execute_transition(&mut ()).unwrap();

    let chain = vm.next_chain().clone();
    let ids: Vec<&str> = chain.iter().map(|cg| &*cg.id).collect();
    assert_eq!(ids, vec!["perturb(Calc.scale(I)I)", "LOCK"]);

    let mut results = Vec::new();
    let kernel = vm.kernel().clone();
    let mut chain = vm.take_next_chain();
    while chain.advance() {
        vm.restore_parts(kernel.clone(), chain.clone(), CgChain::new());
        vm.execute_transition(&mut ()).unwrap();
        assert!(vm.is_end_state());
        results.push(static_int(&vm, "Main", "result"));
    }
    assert_eq!(results.len(), 3);
    assert_eq!(results[1], 0);
}

#[test]
fn test_uncaught_exception_terminates_thread() {
    let src = r#"
class T
  static method main()V
    iconst 1
    iconst 0
    idiv
    pop
    return
  end
end
entry T.main
"#;
    let mut vm = Vm::new(program(src), VmConfig::default()).unwrap();
    let leaves = explore(&mut vm, &mut (), |vm| {
        assert!(vm.is_end_state());
        vm.uncaught().cloned()
    });
    assert_eq!(leaves.len(), 1);
    let exc = leaves[0].as_ref().unwrap();
    assert_eq!(&*exc.class, "ArithmeticException");
    assert_eq!(exc.detail.as_deref(), Some("/ by zero"));
}

#[test]
fn test_handler_catches_vm_exception() {
    let src = r#"
class T
  static field caught: int
  static method main()V
  start:
    iconst 1
    iconst 0
    idiv
    pop
  stop:
    return
  handler:
    pop
    iconst 1
    putstatic T.caught
    return
    catch RuntimeException start stop handler
  end
end
entry T.main
"#;
    let mut vm = Vm::new(program(src), VmConfig::default()).unwrap();
    let leaves = explore(&mut vm, &mut (), |vm| {
        (vm.uncaught().is_none(), static_int(vm, "T", "caught"))
    });
    assert_eq!(leaves, vec![(true, 1)]);
}

#[test]
fn test_class_initializer_runs_before_first_access() {
    let src = r#"
class Config
  static field answer: int
  static method <clinit>()V
    iconst 42
    putstatic Config.answer
    return
  end
end

class T
  static field seen: int
  static method main()V
    getstatic Config.answer
    putstatic T.seen
    return
  end
end
entry T.main
"#;
    let mut vm = Vm::new(program(src), VmConfig::default()).unwrap();
    let leaves = explore(&mut vm, &mut (), |vm| static_int(vm, "T", "seen"));
    assert_eq!(leaves, vec![42]);
}

#[test]
fn test_subclass_without_initializer_waits_for_superclass() {
    let src = r#"
class Main
  static field created: int
  static method main()V locals 1
    new Worker
    dup
    invokespecial Worker.<init>()V
    astore 0
    aload 0
    invokevirtual Worker.start()V
    invokestatic Main.make()V
    aload 0
    invokevirtual Worker.join()V
    return
  end
  static method make()V
    new Sub
    dup
    invokespecial Sub.<init>()V
    pop
    iconst 1
    putstatic Main.created
    return
  end
end

class Base
  static field sawCreated: int
  static method <clinit>()V
    getstatic Main.created
    putstatic Base.sawCreated
    return
  end
end

class Sub extends Base
end

class Worker extends Thread
  method run()V
    invokestatic Main.make()V
    return
  end
end
entry Main.main
"#;
    let mut vm = Vm::new(program(src), VmConfig::default()).unwrap();
    let leaves = explore(&mut vm, &mut (), |vm| {
        assert!(vm.is_end_state());
        (
            static_int(vm, "Base", "sawCreated"),
            static_int(vm, "Main", "created"),
        )
    });
    assert!(!leaves.is_empty());
    assert!(leaves.iter().all(|&leaf| leaf == (0, 1)), "{leaves:?}");
}

#[test]
fn test_verify_get_int_branches() {
    let src = r#"
class T
  static field v: int
  static method main()V
    iconst 0
    iconst 2
    invokestatic Verify.getInt(II)I
    putstatic T.v
    return
  end
end
entry T.main
"#;
    let mut vm = Vm::new(program(src), VmConfig::default()).unwrap();
    let mut recorder = Recorder::default();
    let leaves = explore(&mut vm, &mut recorder, |vm| static_int(vm, "T", "v"));
    assert_eq!(leaves, vec![0, 1, 2]);
    assert!(recorder.cgs.iter().any(|cg| &*cg.id == "verifyGetInt(II)"));
}

#[test]
fn test_lock_order_inversion_deadlocks() {
    let src = r#"
class Main
  static field a: Object
  static field b: Object
  static method main()V locals 1
    new Object
    dup
    invokespecial Object.<init>()V
    putstatic Main.a
    new Object
    dup
    invokespecial Object.<init>()V
    putstatic Main.b
    new Worker
    dup
    invokespecial Worker.<init>()V
    astore 0
    aload 0
    invokevirtual Worker.start()V
    getstatic Main.a
    getstatic Main.b
    invokestatic Main.both(LObject;LObject;)V
    return
  end

  static method both(LObject;LObject;)V
    aload 0
    monitorenter
    aload 1
    monitorenter
    aload 1
    monitorexit
    aload 0
    monitorexit
    return
  end
end

class Worker extends Thread
  method run()V
    getstatic Main.b
    getstatic Main.a
    invokestatic Main.both(LObject;LObject;)V
    return
  end
end

entry Main.main
"#;
    let mut vm = Vm::new(program(src), VmConfig::default()).unwrap();
    let leaves = explore(&mut vm, &mut (), |vm| (vm.is_deadlocked(), vm.is_end_state()));
    assert!(leaves.contains(&(true, false)));
    assert!(leaves.contains(&(false, true)));
}

#[test]
fn test_wait_and_notify_hand_over_the_monitor() {
    let src = r#"
class Main
  static field lock: Object
  static field done: int
  static method main()V locals 2
    new Object
    dup
    invokespecial Object.<init>()V
    putstatic Main.lock
    getstatic Main.lock
    astore 1
    aload 1
    monitorenter
    new Worker
    dup
    invokespecial Worker.<init>()V
    astore 0
    aload 0
    invokevirtual Worker.start()V
    aload 1
    invokevirtual Object.wait()V
    aload 1
    monitorexit
    iconst 1
    putstatic Main.done
    return
  end
end

class Worker extends Thread
  method run()V locals 2
    getstatic Main.lock
    astore 1
    aload 1
    monitorenter
    aload 1
    invokevirtual Object.notify()V
    aload 1
    monitorexit
    return
  end
end

entry Main.main
"#;
    let mut vm = Vm::new(program(src), VmConfig::default()).unwrap();
    let leaves = explore(&mut vm, &mut (), |vm| {
        (vm.is_end_state(), vm.uncaught().is_none(), static_int(vm, "Main", "done"))
    });
    assert!(!leaves.is_empty());
    assert!(leaves.iter().all(|&leaf| leaf == (true, true, 1)), "{leaves:?}");
}

#[test]
fn test_missing_native_is_a_tool_error() {
    let src = r#"
class T
  static native method peek(I)I
  static method main()V
    iconst 1
    invokestatic T.peek(I)I
    pop
    return
  end
end
entry T.main
"#;
    let mut vm = Vm::new(program(src), VmConfig::default()).unwrap();
    vm.initialize(&mut ()).unwrap();
    let mut root = vm.take_next_chain();
    assert!(root.advance());
    vm.set_current_chain(root);
    let err = vm.execute_transition(&mut ()).unwrap_err();
    assert!(matches!(err, VmError::MissingNative { .. }), "{err}");
    let location = err.location().unwrap();
    assert_eq!(location.method, "T.main");
    assert_eq!(location.pc, 1);
}

#[test]
fn test_oversized_array_throws_out_of_memory() {
    let src = r#"
class T
  static method main()V
    iconst 4096
    newarray int
    pop
    return
  end
end
entry T.main
"#;
    let config = VmConfig {
        max_array_length: 1024,
        ..VmConfig::default()
    };
    let mut vm = Vm::new(program(src), config).unwrap();
    let leaves = explore(&mut vm, &mut (), |vm| vm.uncaught().cloned());
    let exc = leaves[0].as_ref().unwrap();
    assert_eq!(&*exc.class, "OutOfMemoryError");
    assert!(exc.detail.as_deref().unwrap().contains("4096"));

    let mut vm = Vm::new(program(src), VmConfig::default()).unwrap();
    let leaves = explore(&mut vm, &mut (), |vm| vm.uncaught().is_none());
    assert_eq!(leaves, vec![true]);
}

const SPIN: &str = r#"
class T
  static field after: int
  static method main()V
  spin:
    goto spin
    iconst 1
    putstatic T.after
    return
  end
end
entry T.main
"#;

fn idle(action: rove_vm::IdleAction) -> VmConfig {
    VmConfig {
        idle_max_backjumps: 8,
        idle_action: action,
        ..VmConfig::default()
    }
}

#[test]
fn test_idle_jump_leaves_spin_loop() {
    let mut vm = Vm::new(program(SPIN), idle(rove_vm::IdleAction::Jump)).unwrap();
    let leaves = explore(&mut vm, &mut (), |vm| {
        (vm.is_end_state(), static_int(vm, "T", "after"))
    });
    assert_eq!(leaves, vec![(true, 1)]);
}

#[test]
fn test_idle_prune_ignores_spinning_state() {
    let mut vm = Vm::new(program(SPIN), idle(rove_vm::IdleAction::Prune)).unwrap();
    let leaves = explore(&mut vm, &mut (), |vm| {
        (vm.kernel().ignored, vm.is_end_state())
    });
    assert_eq!(leaves, vec![(true, false)]);
}

#[test]
fn test_loop_with_calls_is_not_idle() {
    let src = r#"
class T
  static field n: int
  static method tick()V
    getstatic T.n
    iconst 1
    iadd
    putstatic T.n
    return
  end
  static method main()V
  top:
    invokestatic T.tick()V
    getstatic T.n
    iconst 20
    if_icmplt top
    return
  end
end
entry T.main
"#;
    let mut vm = Vm::new(program(src), idle(rove_vm::IdleAction::Prune)).unwrap();
    let leaves = explore(&mut vm, &mut (), |vm| {
        (vm.kernel().ignored, static_int(vm, "T", "n"))
    });
    assert_eq!(leaves, vec![(false, 20)]);
}

const GUARDED_STORE: &str = r#"
class Disk
  static field writes: int
  static method write()V
    getstatic Disk.writes
    iconst 1
    iadd
    putstatic Disk.writes
    return
  end
end

class T
  static field failed: int
  static method main()V
  start:
    invokestatic Disk.write()V
  stop:
    return
  handler:
    pop
    iconst 1
    putstatic T.failed
    return
    catch RuntimeException start stop handler
  end
end
entry T.main
"#;

#[test]
fn test_injected_call_failure_reaches_handler() {
    let config = VmConfig {
        inject: vec![r#"RuntimeException("disk gone")@Disk.write"#.to_string()],
        ..VmConfig::default()
    };
    let mut vm = Vm::new(program(GUARDED_STORE), config).unwrap();
    let leaves = explore(&mut vm, &mut (), |vm| {
        (
            vm.uncaught().is_none(),
            static_int(vm, "T", "failed"),
            static_int(vm, "Disk", "writes"),
        )
    });
    assert_eq!(leaves, vec![(true, 1, 0)]);
}

#[test]
fn test_injected_instruction_failure_escapes() {
    let config = VmConfig {
        inject: vec!["Error@Disk.write()V:3".to_string()],
        ..VmConfig::default()
    };
    let mut vm = Vm::new(program(GUARDED_STORE), config).unwrap();
    let leaves = explore(&mut vm, &mut (), |vm| {
        (
            vm.uncaught().map(|e| e.class.to_string()),
            static_int(vm, "Disk", "writes"),
        )
    });
    assert_eq!(leaves, vec![(Some("Error".to_string()), 0)]);
}

#[test]
fn test_unknown_injection_target_is_rejected() {
    let config = VmConfig {
        inject: vec!["Error@Disk.erase".to_string()],
        ..VmConfig::default()
    };
    let err = Vm::new(program(GUARDED_STORE), config).unwrap_err();
    assert!(matches!(err, VmError::UnknownInjectTarget { .. }), "{err}");
}
