//! Queue testbench driver.
//!
//! `quiesce-queue <num_readers> <num_writers>` spawns the requested
//! threads, lets each writer run its coin-flip workload while readers
//! fold the list, joins everything, and drains the queue so every cell
//! is reclaimed before exit.

use std::env;
use std::process::ExitCode;
use std::thread;

use log::info;

use quiesce_queue::{reader_thread, writer_thread, Harness};

fn usage(program: &str) -> ExitCode {
    println!("Format: {program} <num_readers> <num_writers>");
    ExitCode::SUCCESS
}

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let program = args
        .first()
        .map(String::as_str)
        .unwrap_or("quiesce-queue")
        .to_owned();

    if args.len() != 3 {
        return usage(&program);
    }
    let (Ok(num_readers), Ok(num_writers)) = (args[1].parse::<usize>(), args[2].parse::<usize>())
    else {
        return usage(&program);
    };

    let harness = Harness::new(num_writers, Harness::DEFAULT_OPS_PER_WRITER);

    let mut handles = Vec::with_capacity(num_readers + num_writers);
    for _ in 0..num_writers {
        let harness = harness.clone();
        handles.push(thread::spawn(move || {
            writer_thread(&harness);
        }));
    }
    for _ in 0..num_readers {
        let harness = harness.clone();
        handles.push(thread::spawn(move || {
            let folds = reader_thread(&harness);
            info!("reader performed {folds} folds");
        }));
    }

    for handle in handles {
        if handle.join().is_err() {
            eprintln!("a worker thread panicked");
            return ExitCode::FAILURE;
        }
    }

    let reclaimed = harness.drain();
    info!(
        "drained {reclaimed} cells; {} allocated, {} destroyed",
        harness.telemetry.allocated(),
        harness.telemetry.dropped()
    );

    ExitCode::SUCCESS
}
