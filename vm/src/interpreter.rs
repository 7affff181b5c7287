//! The bytecode interpreter.
//!
//! One interpreter drives one process at a time. While `run` executes,
//! the active task's stack lives in the working registers (`sp`, `base`,
//! `limit`, `try_sp`) and the Stack object carries the transferred-out
//! sentinel; every path that can allocate (and therefore scavenge) first
//! stores the stack back.
//!
//! A single atomic word, the watermark, serves both the stack-overflow
//! check and preemption: it normally holds the effective stack floor
//! (`limit` plus the overflow headroom), and `preempt` overwrites it with
//! a sentinel no real stack pointer can reach, so the one comparison on
//! the hot path trips for either reason.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use bytecode::{Method, Op, Program};
use object::{
    Array, ByteArray, OVERFLOW_HEADROOM, RAW_BYTE_TAG, STACK_MAX_LENGTH, Stack, StackRegisters,
    Str, TypeTag, Value, WORD_SIZE, to_block,
};

use crate::compare::{COMPARISON_FAILED, compare_numbers};
use crate::primitives::{self, PRIMITIVE_RESET_STACK_LIMIT, PrimitiveResult};
use crate::process::Process;

/// Words pushed onto the stack for every call: frame marker + return
/// bytecode pointer.
pub const FRAME_SIZE: usize = 2;

/// Try-frame link slots, relative to the link base.
pub const LINK_REASON_SLOT: usize = 1;
pub const LINK_TARGET_SLOT: usize = 2;
pub const LINK_RESULT_SLOT: usize = 3;
const LINK_FRAME_SIZE: usize = 4;

pub const UNWIND_REASON_WHEN_THROWING_EXCEPTION: i64 = -2;

/// Exit status of a task killed by an uncaught exception.
pub const UNCAUGHT_EXCEPTION_STATUS: i64 = -1;

/// Watermark sentinel: unreachable as any real stack pointer.
const PREEMPTION_MARKER: usize = usize::MAX;

/// Why `run` stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunResult {
    Preempted { cause: PreemptCause },
    Yielded,
    Terminated(i64),
    DeepSleep(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreemptCause {
    Requested,
    Watchdog,
}

/// The cross-thread preemption handle. Cloning is cheap; `preempt` is a
/// single lock-free store.
#[derive(Debug, Clone)]
pub struct Preempter(Arc<AtomicUsize>);

impl Preempter {
    pub fn preempt(&self) {
        self.0.store(PREEMPTION_MARKER, Ordering::Release);
    }
}

enum Overflow {
    /// Registers were fixed up; re-dispatch the current instruction.
    Resume,
    Suspend(RunResult),
}

pub struct Interpreter {
    process: *mut Process,
    // Working registers for the transferred-in stack.
    limit: *mut Value,
    base: *mut Value,
    try_sp: *mut Value,
    in_stack_overflow: bool,
    watermark: Arc<AtomicUsize>,
    watchdog_deadline: Option<Instant>,
}

// ── Raw stack and operand helpers ──────────────────────────────────

/// # Safety
///
/// The caller guarantees room below `sp` (checked at call sites by the
/// watermark comparison).
#[inline(always)]
unsafe fn push(sp: &mut *mut Value, value: Value) {
    // SAFETY: forwarded contract.
    unsafe {
        *sp = sp.sub(1);
        **sp = value;
    }
}

/// # Safety
///
/// The stack must hold at least one word above `sp`.
#[inline(always)]
unsafe fn pop(sp: &mut *mut Value) -> Value {
    // SAFETY: forwarded contract.
    unsafe {
        let value = **sp;
        *sp = sp.add(1);
        value
    }
}

/// # Safety
///
/// `bcp + offset` must be inside the bytecode region.
#[inline(always)]
unsafe fn read_u8(bcp: *const u8, offset: usize) -> u8 {
    // SAFETY: forwarded contract.
    unsafe { *bcp.add(offset) }
}

/// # Safety
///
/// `bcp + offset + 1` must be inside the bytecode region.
#[inline(always)]
unsafe fn read_u16(bcp: *const u8, offset: usize) -> u16 {
    // SAFETY: forwarded contract.
    unsafe { u16::from_le_bytes([*bcp.add(offset), *bcp.add(offset + 1)]) }
}

/// # Safety
///
/// `bcp + offset + 3` must be inside the bytecode region.
#[inline(always)]
unsafe fn read_u32(bcp: *const u8, offset: usize) -> u32 {
    // SAFETY: forwarded contract.
    unsafe {
        u32::from_le_bytes([
            *bcp.add(offset),
            *bcp.add(offset + 1),
            *bcp.add(offset + 2),
            *bcp.add(offset + 3),
        ])
    }
}

impl Interpreter {
    pub fn new() -> Self {
        Self {
            process: core::ptr::null_mut(),
            limit: core::ptr::null_mut(),
            base: core::ptr::null_mut(),
            try_sp: core::ptr::null_mut(),
            in_stack_overflow: false,
            watermark: Arc::new(AtomicUsize::new(0)),
            watchdog_deadline: None,
        }
    }

    /// A handle other threads use to request preemption.
    pub fn preempter(&self) -> Preempter {
        Preempter(self.watermark.clone())
    }

    pub fn set_watchdog_deadline(&mut self, deadline: Option<Instant>) {
        self.watchdog_deadline = deadline;
    }

    // ── Activation ─────────────────────────────────────────────────

    /// Make `process` the current process. The caller keeps the process
    /// alive and un-aliased until `deactivate`.
    pub fn activate(&mut self, process: &mut Process) {
        assert!(self.process.is_null(), "interpreter already active");
        self.process = process as *mut Process;
    }

    pub fn deactivate(&mut self) {
        self.process = core::ptr::null_mut();
    }

    #[inline(always)]
    fn process_mut(&mut self) -> &'static mut Process {
        debug_assert!(!self.process.is_null(), "no active process");
        // SAFETY: activate's contract keeps the process alive and
        // exclusively ours.
        unsafe { &mut *self.process }
    }

    /// Boot the current process: build the initial frame for the
    /// program's entry method.
    pub fn prepare_process(&mut self) {
        let entry = self.lookup_entry();
        let code = self.process_mut().roots.null_object;
        self.prepare_task(entry, code);
    }

    fn lookup_entry(&mut self) -> Method {
        self.process_mut().program.entry_method()
    }

    /// Seed a fresh task stack with `entry` and its captured code
    /// instance.
    pub fn prepare_task(&mut self, entry: Method, code: Value) {
        assert!(entry.is_valid());
        assert!(entry.arity() <= 1, "entry methods take at most the code instance");
        let process = self.process_mut();
        let task = process.current_task();
        // SAFETY: tasks are allocated with a stack attached.
        let stack = unsafe { task.stack() };
        assert!(stack.is_empty(), "task already prepared");
        if entry.arity() == 1 {
            stack.push_seed(code);
        }
        stack.push_seed(Value::from_raw(entry.entry() as u64));
        tracing::trace!(process = process.id, "task prepared");
    }

    // ── Stack transfer ─────────────────────────────────────────────

    /// Load the active task's stack into the working registers. Returns
    /// the stack pointer; the resume bytecode pointer (if one was stored)
    /// is the word on top.
    fn load_stack(&mut self) -> *mut Value {
        let process = self.process_mut();
        // SAFETY: prepared tasks always carry a stack.
        let stack = unsafe { process.current_task().stack() };
        let registers = stack.transfer_to_interpreter();
        self.limit = registers.limit;
        self.base = registers.base;
        self.try_sp = registers.try_sp;
        self.in_stack_overflow = registers.in_stack_overflow;
        self.publish_watermark();
        registers.sp
    }

    /// Store the working registers back into the Stack object, making
    /// every live pointer heap-resident. `bcp` is pushed first when the
    /// stack is being suspended (rather than stored for a scavenge).
    fn store_stack(&mut self, mut sp: *mut Value, bcp: Option<*const u8>) {
        if let Some(bcp) = bcp {
            // SAFETY: suspension points always have room for one word.
            unsafe { push(&mut sp, Value::from_raw(bcp as u64)) };
        }
        let registers = StackRegisters {
            limit: self.limit,
            base: self.base,
            sp,
            try_sp: self.try_sp,
            in_stack_overflow: self.in_stack_overflow,
        };
        let process = self.process_mut();
        // SAFETY: prepared tasks always carry a stack.
        let stack = unsafe { process.current_task().stack() };
        stack.transfer_from_interpreter(registers);
    }

    /// The effective stack floor: the limit plus the reserved headroom,
    /// or the bare limit while a stack-overflow throw is unwinding.
    fn normal_watermark(&self) -> usize {
        if self.in_stack_overflow {
            self.limit as usize
        } else {
            self.limit as usize + OVERFLOW_HEADROOM * WORD_SIZE
        }
    }

    /// Publish the stack floor without clobbering a pending preemption
    /// request.
    fn publish_watermark(&self) {
        let normal = self.normal_watermark();
        let mut current = self.watermark.load(Ordering::Relaxed);
        while current != PREEMPTION_MARKER {
            match self.watermark.compare_exchange_weak(
                current,
                normal,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Acknowledge a preemption request. A request that races with the
    /// suspension is satisfied by the return itself.
    fn clear_preemption(&self) {
        self.watermark.store(self.normal_watermark(), Ordering::Release);
    }

    /// Called while unwinding from a stack-overflow throw: clears the
    /// flag and restores the original effective limit.
    pub fn reset_stack_limit(&mut self) {
        self.in_stack_overflow = false;
        self.publish_watermark();
        tracing::trace!("stack limit reset");
    }

    // ── Garbage-collection support ─────────────────────────────────

    /// The single scavenge entry point from inside the main loop: stores
    /// the stack, collects (growing the heap when the previous attempt
    /// already failed), and returns the possibly-moved stack pointer.
    pub fn scavenge(&mut self, sp: *mut Value, malloc_failed: bool, attempts: i32) -> *mut Value {
        tracing::trace!(attempts, malloc_failed, "scavenge from interpreter");
        self.store_stack(sp, None);
        let process = self.process_mut();
        if malloc_failed || attempts >= 2 {
            process.heap.grow();
        }
        process.collect();
        self.load_stack()
    }

    /// Allocate with the scavenge-retry-grow protocol. `Err` means the
    /// allocation failed even on a grown heap.
    fn allocate_with_gc(
        &mut self,
        sp: &mut *mut Value,
        alloc: impl Fn(&mut Process) -> Option<Value>,
    ) -> Result<Value, ()> {
        for attempt in 1..=3 {
            if let Some(value) = alloc(self.process_mut()) {
                return Ok(value);
            }
            if attempt < 3 {
                *sp = self.scavenge(*sp, attempt >= 2, attempt);
            }
        }
        Err(())
    }

    // ── Unwinding ──────────────────────────────────────────────────

    /// Unwind to the innermost try frame: set the link slots, reset the
    /// stack pointer to the link base, and continue at the catch target.
    /// Without a handler the task dies with the exception as its result.
    fn unwind(
        &mut self,
        exception: Value,
        sp: &mut *mut Value,
        bcp: &mut *const u8,
    ) -> Result<(), RunResult> {
        debug_assert!(!exception.is_marked());
        if self.try_sp == self.base {
            let process = self.process_mut();
            process.current_task().set_result(exception);
            tracing::debug!(process = process.id, "uncaught exception");
            *sp = self.base;
            self.store_stack(*sp, Some(*bcp));
            return Err(RunResult::Terminated(UNCAUGHT_EXCEPTION_STATUS));
        }
        let link_base = self.try_sp;
        // SAFETY: the link frame was laid out by the link bytecode and
        // sits between sp and base.
        unsafe {
            *link_base.add(LINK_REASON_SLOT) =
                Value::from_smi(UNWIND_REASON_WHEN_THROWING_EXCEPTION);
            let target = (*link_base.add(LINK_TARGET_SLOT)).raw() as *const u8;
            *link_base.add(LINK_RESULT_SLOT) = exception;
            let enclosing = (*link_base).to_smi();
            self.try_sp = self.base.sub(enclosing as usize);
            *sp = link_base;
            *bcp = target;
        }
        Ok(())
    }

    /// The primitive-return path: a marked error pointer arrives here
    /// and is reified unmarked into the link frame.
    fn throw(
        &mut self,
        marked_error: Value,
        sp: &mut *mut Value,
        bcp: &mut *const u8,
    ) -> Result<(), RunResult> {
        assert!(marked_error.is_marked());
        self.unwind(marked_error.unmark(), sp, bcp)
    }

    // ── Stack overflow and preemption ──────────────────────────────

    /// The watermark comparison tripped: either a preemption request or
    /// a genuine shortage of `needed_slots` below `sp`.
    fn handle_stack_overflow(&mut self, sp: &mut *mut Value, bcp: &mut *const u8, needed_slots: usize) -> Overflow {
        if self.watermark.load(Ordering::Acquire) == PREEMPTION_MARKER {
            let cause = match self.watchdog_deadline {
                Some(deadline) if Instant::now() >= deadline => PreemptCause::Watchdog,
                _ => PreemptCause::Requested,
            };
            self.clear_preemption();
            self.store_stack(*sp, Some(*bcp));
            tracing::trace!(?cause, "preempted");
            return Overflow::Suspend(RunResult::Preempted { cause });
        }

        if self.in_stack_overflow {
            // The reserved headroom was not enough to run the throw.
            panic!("stack exhausted while handling a stack overflow");
        }

        let process = self.process_mut();
        // SAFETY: the stack is transferred in; base and sp bound it.
        let used = unsafe { self.base.offset_from(*sp) } as usize;
        let length = unsafe { process.current_task().stack() }.len();
        // Room for the pending call, the headroom, and the resume word.
        let required = used + needed_slots + FRAME_SIZE + OVERFLOW_HEADROOM + 1;
        let mut new_length = length;
        while new_length < required && new_length < STACK_MAX_LENGTH {
            new_length *= 2;
        }
        new_length = new_length.min(STACK_MAX_LENGTH);

        if new_length > length && new_length >= required {
            self.store_stack(*sp, Some(*bcp));
            match self.grow_stack(new_length) {
                Ok(()) => {
                    *sp = self.load_stack();
                    // SAFETY: the resume word is back on top.
                    unsafe {
                        *bcp = (**sp).raw() as *const u8;
                        *sp = sp.add(1);
                    }
                    tracing::trace!(new_length, "stack grown");
                    Overflow::Resume
                }
                Err(()) => {
                    *sp = self.load_stack();
                    // SAFETY: the resume word is back on top.
                    unsafe {
                        *bcp = (**sp).raw() as *const u8;
                        *sp = sp.add(1);
                    }
                    let error = self.process_mut().roots.out_of_memory_error.mark();
                    match self.throw(error, sp, bcp) {
                        Ok(()) => Overflow::Resume,
                        Err(result) => Overflow::Suspend(result),
                    }
                }
            }
        } else {
            // No room to grow: reserve the headroom and throw.
            self.in_stack_overflow = true;
            self.publish_watermark();
            tracing::trace!("stack overflow exception");
            let error = self.process_mut().roots.stack_overflow_error.mark();
            match self.throw(error, sp, bcp) {
                Ok(()) => Overflow::Resume,
                Err(result) => Overflow::Suspend(result),
            }
        }
    }

    /// Replace the (stored) stack with a larger copy.
    fn grow_stack(&mut self, new_length: usize) -> Result<(), ()> {
        for attempt in 1..=3 {
            let process = self.process_mut();
            if let Some(new_stack) = process.allocate_stack(new_length) {
                let task = process.current_task();
                // SAFETY: the old stack is heap-resident; the new one is
                // freshly allocated.
                unsafe {
                    let old: &mut Stack = task.stack();
                    let new: &mut Stack = new_stack.as_obj_mut();
                    old.copy_to(new, new_length);
                }
                task.set_stack(new_stack);
                return Ok(());
            }
            if attempt < 3 {
                if attempt >= 2 {
                    process.heap.grow();
                }
                process.collect();
            }
        }
        Err(())
    }

    // ── Main loop ──────────────────────────────────────────────────

    pub fn run(&mut self) -> RunResult {
        assert!(!self.process.is_null(), "no active process");
        let program: Arc<Program> = self.process_mut().program.clone();
        let frame_marker = program.frame_marker();

        let mut sp = self.load_stack();
        // SAFETY: a suspended stack carries its resume word on top.
        let mut bcp = unsafe { (*sp).raw() as *const u8 };
        sp = unsafe { sp.add(1) };

        loop {
            // One comparison serves both preemption and stack overflow.
            if (sp as usize) <= self.watermark.load(Ordering::Acquire) {
                match self.handle_stack_overflow(&mut sp, &mut bcp, 0) {
                    Overflow::Resume => continue,
                    Overflow::Suspend(result) => return result,
                }
            }

            // SAFETY: bcp stays inside the bytecode region; the builder
            // only emits valid opcodes and in-bounds operands.
            let op = unsafe { Op::from_u8_unchecked(*bcp) };
            match op {
                Op::LoadSmi => unsafe {
                    let value = read_u32(bcp, 1) as i32;
                    push(&mut sp, Value::from_smi(value as i64));
                    bcp = bcp.add(Op::LoadSmi.length());
                },
                Op::LoadNull => unsafe {
                    push(&mut sp, self.process_mut().roots.null_object);
                    bcp = bcp.add(Op::LoadNull.length());
                },
                Op::LoadTrue => unsafe {
                    push(&mut sp, self.process_mut().roots.true_object);
                    bcp = bcp.add(Op::LoadTrue.length());
                },
                Op::LoadFalse => unsafe {
                    push(&mut sp, self.process_mut().roots.false_object);
                    bcp = bcp.add(Op::LoadFalse.length());
                },
                Op::LoadLocal => unsafe {
                    let slot = read_u8(bcp, 1) as usize;
                    let value = *sp.add(slot);
                    push(&mut sp, value);
                    bcp = bcp.add(Op::LoadLocal.length());
                },
                Op::StoreLocal => unsafe {
                    let slot = read_u8(bcp, 1) as usize;
                    let value = pop(&mut sp);
                    *sp.add(slot) = value;
                    bcp = bcp.add(Op::StoreLocal.length());
                },
                Op::Pop => unsafe {
                    let count = read_u8(bcp, 1) as usize;
                    sp = sp.add(count);
                    debug_assert!(sp <= self.base);
                    bcp = bcp.add(Op::Pop.length());
                },
                Op::Dup => unsafe {
                    let top = *sp;
                    push(&mut sp, top);
                    bcp = bcp.add(Op::Dup.length());
                },
                Op::CallStatic => {
                    // SAFETY: the target operand is a method header offset.
                    let target = unsafe { read_u32(bcp, 1) };
                    let method = program.method_at(target);
                    let needed = FRAME_SIZE + method.max_height();
                    let prospective = sp as usize - needed * WORD_SIZE;
                    if prospective <= self.watermark.load(Ordering::Acquire) {
                        match self.handle_stack_overflow(&mut sp, &mut bcp, needed) {
                            Overflow::Resume => continue,
                            Overflow::Suspend(result) => return result,
                        }
                    }
                    // SAFETY: the overflow check reserved the frame.
                    unsafe {
                        let return_bcp = bcp.add(Op::CallStatic.length());
                        push(&mut sp, Value::from_raw(return_bcp as u64));
                        push(&mut sp, frame_marker);
                    }
                    bcp = method.entry();
                }
                Op::Return => unsafe {
                    let locals = read_u8(bcp, 1) as usize;
                    let arity = read_u8(bcp, 2) as usize;
                    let result = pop(&mut sp);
                    sp = sp.add(locals);
                    debug_assert_eq!((*sp).raw(), frame_marker.raw(), "frame slot mismatch");
                    let return_bcp = (*sp.add(1)).raw() as *const u8;
                    sp = sp.add(FRAME_SIZE + arity);
                    push(&mut sp, result);
                    bcp = return_bcp;
                },
                Op::Branch => unsafe {
                    let offset = i16::from_le_bytes([*bcp.add(1), *bcp.add(2)]) as isize;
                    bcp = bcp.add(Op::Branch.length()).offset(offset);
                },
                Op::BranchIfTrue | Op::BranchIfFalse => unsafe {
                    let offset = i16::from_le_bytes([*bcp.add(1), *bcp.add(2)]) as isize;
                    let value = pop(&mut sp);
                    let truthy = self.process_mut().is_true_value(value);
                    let taken = truthy == (op == Op::BranchIfTrue);
                    bcp = bcp.add(op.length());
                    if taken {
                        bcp = bcp.offset(offset);
                    }
                },
                Op::Add | Op::Sub => {
                    // SAFETY: operands were pushed by earlier bytecodes.
                    let (rhs, lhs) = unsafe { (pop(&mut sp), pop(&mut sp)) };
                    match self.arithmetic(op, lhs, rhs, &mut sp, &mut bcp) {
                        Ok(()) => {}
                        Err(result) => return result,
                    }
                }
                Op::CompareTo => unsafe {
                    let rhs = pop(&mut sp);
                    let lhs = pop(&mut sp);
                    let packed = compare_numbers(lhs, rhs);
                    push(&mut sp, Value::from_smi(packed));
                    bcp = bcp.add(Op::CompareTo.length());
                },
                Op::Eq => unsafe {
                    let rhs = pop(&mut sp);
                    let lhs = pop(&mut sp);
                    let packed = compare_numbers(lhs, rhs);
                    let equal = if packed == COMPARISON_FAILED {
                        lhs == rhs
                    } else {
                        packed & crate::compare::CompareFlags::EQUAL.bits() != 0
                    };
                    push(&mut sp, self.process_mut().boolean(equal));
                    bcp = bcp.add(Op::Eq.length());
                },
                Op::At => {
                    // SAFETY: operands were pushed by earlier bytecodes.
                    let (index, receiver) = unsafe { (pop(&mut sp), pop(&mut sp)) };
                    let mut value = Value::zero();
                    if fast_at(self.process_mut(), receiver, index, false, &mut value) {
                        // SAFETY: room freed by the two pops.
                        unsafe {
                            push(&mut sp, value);
                            bcp = bcp.add(Op::At.length());
                        }
                    } else {
                        let error = self.process_mut().roots.out_of_bounds_error.mark();
                        let mut next = unsafe { bcp.add(Op::At.length()) };
                        match self.throw(error, &mut sp, &mut next) {
                            Ok(()) => bcp = next,
                            Err(result) => return result,
                        }
                    }
                }
                Op::AtPut => {
                    // SAFETY: operands were pushed by earlier bytecodes.
                    let (stored, index, receiver) =
                        unsafe { (pop(&mut sp), pop(&mut sp), pop(&mut sp)) };
                    let mut value = stored;
                    if fast_at(self.process_mut(), receiver, index, true, &mut value) {
                        // SAFETY: room freed by the three pops.
                        unsafe {
                            push(&mut sp, stored);
                            bcp = bcp.add(Op::AtPut.length());
                        }
                    } else {
                        let error = self.process_mut().roots.out_of_bounds_error.mark();
                        let mut next = unsafe { bcp.add(Op::AtPut.length()) };
                        match self.throw(error, &mut sp, &mut next) {
                            Ok(()) => bcp = next,
                            Err(result) => return result,
                        }
                    }
                }
                Op::Link => unsafe {
                    let target = read_u32(bcp, 1);
                    let null = self.process_mut().roots.null_object;
                    push(&mut sp, null); // result slot
                    push(&mut sp, Value::from_raw(program.bcp(target) as u64));
                    push(&mut sp, Value::from_smi(0)); // reason slot
                    let enclosing = self.base.offset_from(self.try_sp);
                    push(&mut sp, Value::from_smi(enclosing as i64));
                    self.try_sp = sp;
                    bcp = bcp.add(Op::Link.length());
                },
                Op::Unlink => unsafe {
                    debug_assert_eq!(sp, self.try_sp, "unlink away from the link base");
                    let enclosing = (*sp).to_smi();
                    self.try_sp = self.base.sub(enclosing as usize);
                    sp = sp.add(LINK_FRAME_SIZE);
                    bcp = bcp.add(Op::Unlink.length());
                },
                Op::Throw => {
                    // SAFETY: the thrown value was pushed earlier.
                    let exception = unsafe { pop(&mut sp) };
                    let mut next = unsafe { bcp.add(Op::Throw.length()) };
                    match self.unwind(exception, &mut sp, &mut next) {
                        Ok(()) => bcp = next,
                        Err(result) => return result,
                    }
                }
                Op::PushBlock => unsafe {
                    let slot = read_u8(bcp, 1) as usize;
                    let block = to_block(self.base, sp.add(slot));
                    push(&mut sp, block);
                    bcp = bcp.add(Op::PushBlock.length());
                },
                Op::Primitive => {
                    let index = unsafe { read_u16(bcp, 1) };
                    if index == PRIMITIVE_RESET_STACK_LIMIT {
                        self.reset_stack_limit();
                        // SAFETY: intrinsic pushes its null result.
                        unsafe {
                            push(&mut sp, self.process_mut().roots.null_object);
                            bcp = bcp.add(Op::Primitive.length());
                        }
                        continue;
                    }
                    match self.invoke_primitive(index, &mut sp, &mut bcp) {
                        Ok(()) => {}
                        Err(result) => return result,
                    }
                }
                Op::Yield => {
                    let next = unsafe { bcp.add(Op::Yield.length()) };
                    self.store_stack(sp, Some(next));
                    tracing::trace!("yielded");
                    return RunResult::Yielded;
                }
                Op::Terminate => {
                    // SAFETY: the exit status was pushed earlier.
                    let value = unsafe { pop(&mut sp) };
                    let Some(status) = integer_value(value) else {
                        let error = self.process_mut().roots.wrong_type_error.mark();
                        let mut next = unsafe { bcp.add(Op::Terminate.length()) };
                        match self.throw(error, &mut sp, &mut next) {
                            Ok(()) => {
                                bcp = next;
                                continue;
                            }
                            Err(result) => return result,
                        }
                    };
                    let process = self.process_mut();
                    process.current_task().set_result(value);
                    let next = unsafe { bcp.add(Op::Terminate.length()) };
                    self.store_stack(sp, Some(next));
                    tracing::trace!(process = process.id, status, "terminated");
                    return RunResult::Terminated(status);
                }
            }
        }
    }

    fn arithmetic(
        &mut self,
        op: Op,
        lhs: Value,
        rhs: Value,
        sp: &mut *mut Value,
        bcp: &mut *const u8,
    ) -> Result<(), RunResult> {
        use crate::compare::{Number, extract};

        let advance = |bcp: &mut *const u8| {
            // SAFETY: advancing past a zero-operand instruction.
            *bcp = unsafe { bcp.add(op.length()) };
        };

        // Smi fast path: 63-bit operands cannot overflow i64.
        if let (Some(a), Some(b)) = (lhs.as_smi(), rhs.as_smi()) {
            let result = if op == Op::Add { a + b } else { a - b };
            let value = match Value::try_from_i64(result) {
                Ok(smi) => smi,
                Err(_) => match self.allocate_with_gc(sp, |p| p.allocate_large_integer(result)) {
                    Ok(value) => value,
                    Err(()) => return self.throw_oom(sp, bcp, op),
                },
            };
            // SAFETY: room freed by the two pops.
            unsafe { push(sp, value) };
            advance(bcp);
            return Ok(());
        }

        // SAFETY: heap operands point at live objects.
        let numbers = unsafe { (extract(lhs), extract(rhs)) };
        let (a, b) = match numbers {
            (Some(a), Some(b)) => (a, b),
            _ => {
                let error = self.process_mut().roots.wrong_type_error.mark();
                let mut next = *bcp;
                advance(&mut next);
                return match self.throw(error, sp, &mut next) {
                    Ok(()) => {
                        *bcp = next;
                        Ok(())
                    }
                    Err(result) => Err(result),
                };
            }
        };
        let value = match (a, b) {
            (Number::Int(a), Number::Int(b)) => {
                let result = if op == Op::Add { a.checked_add(b) } else { a.checked_sub(b) };
                match result {
                    Some(n) => match self.allocate_with_gc(sp, |p| p.allocate_integer(n)) {
                        Ok(value) => value,
                        Err(()) => return self.throw_oom(sp, bcp, op),
                    },
                    None => {
                        let error = self.process_mut().roots.integer_overflow_error.mark();
                        let mut next = *bcp;
                        advance(&mut next);
                        return match self.throw(error, sp, &mut next) {
                            Ok(()) => {
                                *bcp = next;
                                Ok(())
                            }
                            Err(result) => Err(result),
                        };
                    }
                }
            }
            (a, b) => {
                let (a, b) = (a.as_f64(), b.as_f64());
                let result = if op == Op::Add { a + b } else { a - b };
                match self.allocate_with_gc(sp, |p| p.allocate_double(result)) {
                    Ok(value) => value,
                    Err(()) => return self.throw_oom(sp, bcp, op),
                }
            }
        };
        // SAFETY: room freed by the two pops.
        unsafe { push(sp, value) };
        advance(bcp);
        Ok(())
    }

    fn throw_oom(
        &mut self,
        sp: &mut *mut Value,
        bcp: &mut *const u8,
        op: Op,
    ) -> Result<(), RunResult> {
        let error = self.process_mut().roots.out_of_memory_error.mark();
        let mut next = unsafe { bcp.add(op.length()) };
        match self.throw(error, sp, &mut next) {
            Ok(()) => {
                *bcp = next;
                Ok(())
            }
            Err(result) => Err(result),
        }
    }

    fn invoke_primitive(
        &mut self,
        index: u16,
        sp: &mut *mut Value,
        bcp: &mut *const u8,
    ) -> Result<(), RunResult> {
        let desc = &primitives::table()[index as usize];
        let mut attempts = 1;
        loop {
            // SAFETY: the compiler arranged `arity` arguments on top.
            let args = unsafe { core::slice::from_raw_parts(*sp, desc.arity) };
            let result = (desc.run)(self.process_mut(), args);
            match result {
                PrimitiveResult::Ok(value) => {
                    // SAFETY: dropping the arguments frees room.
                    unsafe {
                        *sp = sp.add(desc.arity);
                        push(sp, value);
                        *bcp = bcp.add(Op::Primitive.length());
                    }
                    return Ok(());
                }
                PrimitiveResult::Failed(error) => {
                    // The primitive-return path carries the error marked
                    // until it is reified into the link frame.
                    let marked = error.mark();
                    // SAFETY: dropping the arguments.
                    let mut next = unsafe {
                        *sp = sp.add(desc.arity);
                        bcp.add(Op::Primitive.length())
                    };
                    return match self.throw(marked, sp, &mut next) {
                        Ok(()) => {
                            *bcp = next;
                            Ok(())
                        }
                        Err(result) => Err(result),
                    };
                }
                PrimitiveResult::AllocationFailed => {
                    if attempts >= 3 {
                        return self.throw_oom(sp, bcp, Op::Primitive);
                    }
                    *sp = self.scavenge(*sp, attempts >= 2, attempts);
                    attempts += 1;
                }
                PrimitiveResult::DeepSleep(ms) => {
                    // SAFETY: dropping the arguments; the null resume
                    // value takes one freed slot.
                    let next = unsafe {
                        *sp = sp.add(desc.arity);
                        push(sp, self.process_mut().roots.null_object);
                        bcp.add(Op::Primitive.length())
                    };
                    self.store_stack(*sp, Some(next));
                    tracing::trace!(ms, "deep sleep");
                    return Err(RunResult::DeepSleep(ms));
                }
            }
        }
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

/// An integer payload (smi or large integer), if `value` holds one.
fn integer_value(value: Value) -> Option<i64> {
    if let Some(n) = value.as_smi() {
        return Some(n);
    }
    // SAFETY: heap values point at live objects.
    unsafe {
        if object::is_large_integer(value) {
            Some(value.as_obj::<object::LargeInteger>().value())
        } else {
            None
        }
    }
}

/// Short-circuit indexed load/store against arrays, byte arrays, and
/// strings. Returns `false` when the slow path must decide: slices,
/// copy-on-write receivers, out-of-range indexes, byte values outside
/// `0..=255`, string stores, and non-indexable receivers.
pub fn fast_at(
    _process: &mut Process,
    receiver: Value,
    index: Value,
    is_put: bool,
    value: &mut Value,
) -> bool {
    let Some(index) = index.as_smi() else { return false };
    if index < 0 || !receiver.is_heap_object() {
        return false;
    }
    let index = index as usize;
    // SAFETY: heap values point at live objects; reinterpretation is
    // guarded by the class tag.
    unsafe {
        match object::class_tag(receiver) {
            TypeTag::Array => {
                let array: &mut Array = receiver.as_obj_mut();
                if index >= array.len() {
                    return false;
                }
                if is_put {
                    array.at_put(index, *value);
                } else {
                    *value = array.at(index);
                }
                true
            }
            TypeTag::ByteArray => {
                let bytes: &mut ByteArray = receiver.as_obj_mut();
                if bytes.has_external_address() && bytes.external_tag() != RAW_BYTE_TAG {
                    return false;
                }
                if index >= bytes.len() {
                    return false;
                }
                if is_put {
                    let Some(byte) = value.as_smi().filter(|b| (0..=255).contains(b)) else {
                        return false;
                    };
                    bytes.bytes_mut()[index] = byte as u8;
                } else {
                    *value = Value::from_smi(bytes.bytes()[index] as i64);
                }
                true
            }
            TypeTag::String if !is_put => {
                let string: &Str = receiver.as_obj();
                if index >= string.len() {
                    return false;
                }
                *value = Value::from_smi(string.bytes()[index] as i64);
                true
            }
            _ => false,
        }
    }
}
