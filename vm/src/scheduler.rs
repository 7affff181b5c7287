//! A minimal cooperative scheduler: the caller of `run`.
//!
//! One interpreter, a round-robin ready queue, and a condition variable
//! for deep sleep. Preemption requests arrive from other threads through
//! the interpreter's [`Preempter`]; the scheduler itself stays
//! single-threaded.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytecode::Program;
use parking_lot::{Condvar, Mutex};

use crate::interpreter::{Interpreter, Preempter, PreemptCause, RunResult};
use crate::process::Process;

struct Entry {
    process: Box<Process>,
    prepared: bool,
}

pub struct Scheduler {
    interpreter: Interpreter,
    ready: VecDeque<Entry>,
    next_id: u64,
    /// Sleepers wait here so an external wake-up can cut a deep sleep
    /// short.
    wakeup: Arc<(Mutex<bool>, Condvar)>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            interpreter: Interpreter::new(),
            ready: VecDeque::new(),
            next_id: 1,
            wakeup: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    /// Queue a fresh process for the given program. Returns its id.
    pub fn spawn(&mut self, program: Arc<Program>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let process = Box::new(Process::new(id, program));
        self.ready.push_back(Entry { process, prepared: false });
        tracing::debug!(process = id, "spawned");
        id
    }

    pub fn preempter(&self) -> Preempter {
        self.interpreter.preempter()
    }

    /// Interrupt a deep sleep early.
    pub fn wake(&self) {
        let (lock, condvar) = &*self.wakeup;
        *lock.lock() = true;
        condvar.notify_all();
    }

    /// Run every queued process to completion. Returns `(id, status)`
    /// pairs in termination order.
    pub fn run(&mut self) -> Vec<(u64, i64)> {
        let mut exits = Vec::new();
        while let Some(mut entry) = self.ready.pop_front() {
            self.interpreter.activate(&mut entry.process);
            if !entry.prepared {
                self.interpreter.prepare_process();
                entry.prepared = true;
            }
            let result = self.interpreter.run();
            self.interpreter.deactivate();
            match result {
                RunResult::Yielded => {
                    self.ready.push_back(entry);
                }
                RunResult::Preempted { cause } => {
                    if cause == PreemptCause::Watchdog {
                        tracing::warn!(process = entry.process.id, "watchdog preemption");
                    }
                    self.ready.push_back(entry);
                }
                RunResult::DeepSleep(ms) => {
                    self.sleep(Duration::from_millis(ms as u64));
                    self.ready.push_back(entry);
                }
                RunResult::Terminated(status) => {
                    tracing::debug!(process = entry.process.id, status, "terminated");
                    exits.push((entry.process.id, status));
                }
            }
        }
        exits
    }

    fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let (lock, condvar) = &*self.wakeup;
        let mut woken = lock.lock();
        while !*woken && Instant::now() < deadline {
            if condvar.wait_until(&mut woken, deadline).timed_out() {
                break;
            }
        }
        *woken = false;
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytecode::{MethodKind, ProgramBuilder};

    fn counting_program(yields: i32, status: i32) -> Arc<Program> {
        let mut builder = ProgramBuilder::new();
        let entry = builder.begin_method(MethodKind::Normal, 0, 4);
        for _ in 0..yields {
            builder.yield_();
        }
        builder.terminate_with_smi(status);
        builder.end_method();
        builder.set_entry(entry);
        Arc::new(builder.finish())
    }

    #[test]
    fn round_robin_interleaves_yielding_processes() {
        let mut scheduler = Scheduler::new();
        let first = scheduler.spawn(counting_program(2, 10));
        let second = scheduler.spawn(counting_program(0, 20));
        let exits = scheduler.run();
        // The non-yielding process finishes first.
        assert_eq!(exits, vec![(second, 20), (first, 10)]);
    }

    #[test]
    fn deep_sleep_delays_but_completes() {
        let mut scheduler = Scheduler::new();
        let mut builder = ProgramBuilder::new();
        let entry = builder.begin_method(MethodKind::Normal, 0, 4);
        builder.load_smi(1);
        builder.primitive(crate::primitives::PRIMITIVE_DEEP_SLEEP);
        builder.pop(1);
        builder.terminate_with_smi(4);
        builder.end_method();
        builder.set_entry(entry);
        let id = scheduler.spawn(Arc::new(builder.finish()));
        let exits = scheduler.run();
        assert_eq!(exits, vec![(id, 4)]);
    }
}
