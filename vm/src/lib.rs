//! The execution runtime: processes, the interpreter, primitives, the
//! scheduler, and object-graph snapshots.

mod compare;
mod interpreter;
mod primitives;
mod process;
mod scheduler;
mod snapshot;

pub use compare::{
    COMPARE_TO_BIAS, COMPARE_TO_MASK, COMPARE_TO_MINUS_1, COMPARE_TO_PLUS_1, COMPARE_TO_ZERO,
    COMPARISON_FAILED, CompareFlags, compare_numbers,
};
pub use interpreter::{
    FRAME_SIZE, Interpreter, LINK_REASON_SLOT, LINK_RESULT_SLOT, LINK_TARGET_SLOT,
    PreemptCause, Preempter, RunResult, UNCAUGHT_EXCEPTION_STATUS,
    UNWIND_REASON_WHEN_THROWING_EXCEPTION, fast_at,
};
pub use primitives::{
    PRIMITIVE_BYTE_ARRAY_NEW, PRIMITIVE_DEEP_SLEEP, PRIMITIVE_NEUTER,
    PRIMITIVE_RESET_STACK_LIMIT, PRIMITIVE_TASK_ID, PrimitiveDesc, PrimitiveFn, PrimitiveResult,
};
pub use process::{MutableBytes, Process, ProcessRoots};
pub use scheduler::Scheduler;
pub use snapshot::{read_snapshot, write_snapshot};
