//! Native peers of the built-in classes.

use crate::choice::{Choice, ChoiceDomain};
use crate::error::{VmError, VmResult};
use crate::native::{NativeEnv, NativeOutcome, NativeRegistry};
use crate::scheduler::SchedEvent;
use crate::value::{ObjRef, Value};
use rove_ir::prelude::{
    ASSERTION_ERROR, NULL_POINTER_EXCEPTION, RUNTIME_EXCEPTION,
};
use std::sync::Arc;
use tracing::debug;

pub(crate) fn register_builtins(registry: &mut NativeRegistry) {
    // === Thread ===
    registry.register("Thread.start()V", |env: &mut NativeEnv<'_>, args: &[Value]| {
        let obj = receiver(args)?;
        env.vm.start_thread(env.thread, obj)
    });
    registry.register("Thread.join()V", |env: &mut NativeEnv<'_>, args: &[Value]| {
        let obj = receiver(args)?;
        env.vm.join(env.thread, obj)
    });
    registry.register("Thread.yield()V", |env: &mut NativeEnv<'_>, _: &[Value]| {
        env.schedule(SchedEvent::Yield);
        Ok(NativeOutcome::void())
    });

    // === Object ===
    registry.register("Object.wait()V", |env: &mut NativeEnv<'_>, args: &[Value]| {
        let obj = receiver(args)?;
        env.vm.wait(env.thread, obj)
    });
    registry.register("Object.notify()V", |env: &mut NativeEnv<'_>, args: &[Value]| {
        let obj = receiver(args)?;
        env.vm.notify(env.thread, obj, false)
    });
    registry.register("Object.notifyAll()V", |env: &mut NativeEnv<'_>, args: &[Value]| {
        let obj = receiver(args)?;
        env.vm.notify(env.thread, obj, true)
    });

    // === Verify ===
    registry.register("Verify.getBoolean()Z", |env: &mut NativeEnv<'_>, _: &[Value]| {
        match env.data_choice("verifyGetBoolean", ChoiceDomain::Boolean) {
            Some(Choice::Bool(b)) => Ok(NativeOutcome::value(Value::bool(b))),
            Some(other) => Err(unexpected("verifyGetBoolean", &other)),
            None => Ok(NativeOutcome::Break),
        }
    });
    registry.register("Verify.getInt(II)I", |env: &mut NativeEnv<'_>, args: &[Value]| {
        let lo = int_arg(args, 0)?;
        let hi = int_arg(args, 1)?;
        if hi < lo {
            return Ok(NativeOutcome::throw(
                RUNTIME_EXCEPTION,
                format!("empty choice range [{lo}, {hi}]"),
            ));
        }
        let domain = ChoiceDomain::IntRange { lo, hi, step: 1 };
        int_choice(env, "verifyGetInt(II)", domain)
    });
    registry.register("Verify.getIntFromArray([I)I", |env: &mut NativeEnv<'_>, args: &[Value]| {
        let Some(arr) = reference_arg(args, 0)? else {
            return Ok(NativeOutcome::throw(NULL_POINTER_EXCEPTION, "choice set is null"));
        };
        let values: Arc<[i32]> = array_values(env, arr)?
            .iter()
            .filter_map(Value::as_int)
            .collect();
        if values.is_empty() {
            return Ok(NativeOutcome::throw(RUNTIME_EXCEPTION, "empty choice set"));
        }
        int_choice(env, "verifyGetIntSet([I)", ChoiceDomain::IntSet(values))
    });
    registry.register(
        "Verify.getObjectFromArray([LObject;)LObject;",
        |env: &mut NativeEnv<'_>, args: &[Value]| {
            let Some(arr) = reference_arg(args, 0)? else {
                return Ok(NativeOutcome::throw(NULL_POINTER_EXCEPTION, "choice set is null"));
            };
            // null elements are not candidates
            let objects: Arc<[ObjRef]> = array_values(env, arr)?
                .iter()
                .filter_map(Value::object)
                .collect();
            if objects.is_empty() {
                return Ok(NativeOutcome::throw(RUNTIME_EXCEPTION, "empty choice set"));
            }
            let id = "verifyGetObjectSet([LObject;)";
            match env.data_choice(id, ChoiceDomain::Objects(objects)) {
                Some(Choice::Object(r)) => Ok(NativeOutcome::value(Value::Ref(r))),
                Some(other) => Err(unexpected(id, &other)),
                None => Ok(NativeOutcome::Break),
            }
        },
    );
    registry.register("Verify.assertTrue(Z)V", |_: &mut NativeEnv<'_>, args: &[Value]| {
        if int_arg(args, 0)? != 0 {
            Ok(NativeOutcome::void())
        } else {
            Ok(NativeOutcome::throw(ASSERTION_ERROR, "assertion failed"))
        }
    });
    registry.register("Verify.ignoreIf(Z)V", |env: &mut NativeEnv<'_>, args: &[Value]| {
        if int_arg(args, 0)? != 0 {
            debug!(thread = %env.thread, "state ignored");
            env.kernel_mut().ignored = true;
        }
        Ok(NativeOutcome::void())
    });
    registry.register("Verify.breakTransition()V", |env: &mut NativeEnv<'_>, _: &[Value]| {
        env.schedule(SchedEvent::Break);
        Ok(NativeOutcome::void())
    });

    // === Console ===
    registry.register("Console.print(I)V", |env: &mut NativeEnv<'_>, args: &[Value]| {
        let v = int_arg(args, 0)?;
        env.print(v.to_string());
        Ok(NativeOutcome::void())
    });
}

fn int_choice(env: &mut NativeEnv<'_>, id: &str, domain: ChoiceDomain) -> VmResult<NativeOutcome> {
    match env.data_choice(id, domain) {
        Some(Choice::Int(v)) => Ok(NativeOutcome::value(Value::Int(v))),
        Some(other) => Err(unexpected(id, &other)),
        None => Ok(NativeOutcome::Break),
    }
}

fn array_values(env: &NativeEnv<'_>, arr: ObjRef) -> VmResult<Vec<Value>> {
    let obj = env
        .kernel()
        .heap
        .get(arr)
        .ok_or_else(|| VmError::malformed(format!("dangling reference {arr}")))?;
    if !obj.is_array() {
        return Err(VmError::malformed(format!("{arr} is not an array")));
    }
    Ok(obj.values().to_vec())
}

fn receiver(args: &[Value]) -> VmResult<ObjRef> {
    reference_arg(args, 0)?.ok_or_else(|| VmError::malformed("native call on null receiver"))
}

fn reference_arg(args: &[Value], i: usize) -> VmResult<Option<ObjRef>> {
    args.get(i)
        .and_then(Value::as_reference)
        .ok_or_else(|| VmError::malformed(format!("argument {i} is not a reference")))
}

fn int_arg(args: &[Value], i: usize) -> VmResult<i32> {
    args.get(i)
        .and_then(Value::as_int)
        .ok_or_else(|| VmError::malformed(format!("argument {i} is not an int")))
}

fn unexpected(id: &str, choice: &Choice) -> VmError {
    VmError::malformed(format!("choice {choice} does not fit generator {id}"))
}
