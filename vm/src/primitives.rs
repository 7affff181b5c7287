//! Native primitives.
//!
//! A primitive receives the process and a view of its arguments on the
//! stack (`args[0]` is the top of stack, i.e. the last argument pushed)
//! and returns a [`PrimitiveResult`]. It must not touch the
//! interpreter's working registers; suspension and retry are expressed
//! through the result sum.

use object::Value;

use crate::process::Process;

#[derive(Debug)]
pub enum PrimitiveResult {
    /// Ordinary completion.
    Ok(Value),
    /// Language-level failure; the payload is an error string that the
    /// interpreter throws through the try-frame chain.
    Failed(Value),
    /// An allocation failed; the interpreter scavenges and retries the
    /// primitive.
    AllocationFailed,
    /// Suspend the process for the given number of milliseconds.
    DeepSleep(i64),
}

pub type PrimitiveFn = fn(&mut Process, &[Value]) -> PrimitiveResult;

pub struct PrimitiveDesc {
    pub name: &'static str,
    pub arity: usize,
    pub run: PrimitiveFn,
}

pub const PRIMITIVE_DEEP_SLEEP: u16 = 0;
/// Handled inside the interpreter: clears the stack-overflow state while
/// unwinding from a stack-overflow throw.
pub const PRIMITIVE_RESET_STACK_LIMIT: u16 = 1;
pub const PRIMITIVE_BYTE_ARRAY_NEW: u16 = 2;
pub const PRIMITIVE_TASK_ID: u16 = 3;
pub const PRIMITIVE_NEUTER: u16 = 4;

static TABLE: &[PrimitiveDesc] = &[
    PrimitiveDesc { name: "deep_sleep", arity: 1, run: primitive_deep_sleep },
    PrimitiveDesc { name: "reset_stack_limit", arity: 0, run: primitive_intrinsic },
    PrimitiveDesc { name: "byte_array_new", arity: 1, run: primitive_byte_array_new },
    PrimitiveDesc { name: "task_id", arity: 0, run: primitive_task_id },
    PrimitiveDesc { name: "neuter", arity: 1, run: primitive_neuter },
];

pub fn table() -> &'static [PrimitiveDesc] {
    TABLE
}

fn primitive_deep_sleep(process: &mut Process, args: &[Value]) -> PrimitiveResult {
    match args[0].as_smi() {
        Some(ms) if ms >= 0 => PrimitiveResult::DeepSleep(ms),
        _ => PrimitiveResult::Failed(process.roots.wrong_type_error),
    }
}

fn primitive_intrinsic(_process: &mut Process, _args: &[Value]) -> PrimitiveResult {
    unreachable!("interpreter intrinsic")
}

fn primitive_byte_array_new(process: &mut Process, args: &[Value]) -> PrimitiveResult {
    let Some(length) = args[0].as_smi().filter(|&n| n >= 0) else {
        return PrimitiveResult::Failed(process.roots.wrong_type_error);
    };
    match process.allocate_byte_array(length as usize) {
        Some(value) => PrimitiveResult::Ok(value),
        None => PrimitiveResult::AllocationFailed,
    }
}

fn primitive_task_id(process: &mut Process, _args: &[Value]) -> PrimitiveResult {
    PrimitiveResult::Ok(Value::from_smi(process.current_task().id()))
}

fn primitive_neuter(process: &mut Process, args: &[Value]) -> PrimitiveResult {
    // SAFETY: tag checked before the downcast.
    let is_external = unsafe {
        object::is_byte_array(args[0])
            && args[0].as_obj::<object::ByteArray>().has_external_address()
    };
    if !is_external {
        return PrimitiveResult::Failed(process.roots.wrong_type_error);
    }
    let buffer = process.neuter_byte_array(args[0]);
    drop(buffer);
    PrimitiveResult::Ok(process.roots.null_object)
}
