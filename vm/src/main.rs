use std::sync::Arc;

use clap::Parser;

use bytecode::{MethodKind, ProgramBuilder};
use vm::Scheduler;

#[derive(Parser, Debug)]
#[command(author, version, about = "mote virtual machine demo runner", long_about = None)]
struct Cli {
    /// Recursion depth for the demo workload
    #[arg(long, default_value_t = 500)]
    depth: i32,

    /// Number of cooperating processes
    #[arg(long, default_value_t = 2)]
    processes: u32,
}

/// sum(n): if n == 0 { 0 } else { n + sum(n - 1) }, yielding every call.
fn demo_program(depth: i32) -> Arc<bytecode::Program> {
    let mut builder = ProgramBuilder::new();

    let sum = builder.begin_method(MethodKind::Normal, 1, 8);
    let done = builder.new_label();
    builder.load_local(2);
    builder.load_smi(0);
    builder.eq();
    builder.branch_if_true(done);
    builder.load_local(2);
    builder.load_smi(1);
    builder.sub();
    builder.call_static(sum);
    builder.load_local(3);
    builder.add();
    builder.ret(0, 1);
    builder.bind(done);
    builder.load_smi(0);
    builder.ret(0, 1);
    builder.end_method();

    let entry = builder.begin_method(MethodKind::Normal, 0, 4);
    builder.yield_();
    builder.load_smi(depth);
    builder.call_static(sum);
    builder.terminate();
    builder.end_method();
    builder.set_entry(entry);
    Arc::new(builder.finish())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let program = demo_program(cli.depth);

    let mut scheduler = Scheduler::new();
    for _ in 0..cli.processes {
        scheduler.spawn(program.clone());
    }
    for (id, status) in scheduler.run() {
        println!("process {id} terminated with {status}");
    }
}
