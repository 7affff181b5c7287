use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};

use bytecode::{MethodKind, Program, ProgramBuilder};
use vm::{Interpreter, Process, RunResult};

/// A loop that counts down from `n` with a compare and a backward
/// branch per iteration: the interpreter's hot path.
fn countdown_program(n: i32) -> Arc<Program> {
    let mut builder = ProgramBuilder::new();
    let entry = builder.begin_method(MethodKind::Normal, 0, 8);
    let top = builder.new_label();
    let done = builder.new_label();
    builder.load_smi(n);
    builder.bind(top);
    builder.dup();
    builder.load_smi(0);
    builder.eq();
    builder.branch_if_true(done);
    builder.load_smi(1);
    builder.sub();
    builder.branch(top);
    builder.bind(done);
    builder.terminate();
    builder.end_method();
    builder.set_entry(entry);
    Arc::new(builder.finish())
}

fn bench_countdown(c: &mut Criterion) {
    let program = countdown_program(10_000);
    c.bench_function("countdown_10k", |b| {
        b.iter(|| {
            let mut process = Box::new(Process::new(1, program.clone()));
            let mut interpreter = Interpreter::new();
            interpreter.activate(&mut process);
            interpreter.prepare_process();
            let result = interpreter.run();
            interpreter.deactivate();
            assert_eq!(result, RunResult::Terminated(0));
        })
    });
}

criterion_group!(benches, bench_countdown);
criterion_main!(benches);
