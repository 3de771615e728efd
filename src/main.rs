//! Raclette
//!
//! AFL style coverage guided fuzzer. Mutated inputs run under an
//! instrumented runner; inputs uncovering new trace edges feed back
//! into the mutation queue, crashing inputs are kept for triage.

#![warn(missing_docs)]

mod backends;
mod cli;
mod config;
mod feedback;
mod fuzz;
mod input;
mod mangle;
mod shmem;

use std::path::Path;
use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use chrono::Local;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::backends::qemu::QemuBackend;
use crate::backends::valgrind::ValgrindBackend;
use crate::backends::Backend;
use crate::config::{BackendKind, Config};
use crate::fuzz::Fuzzer;
use crate::input::TestCase;

/// Stop flag raised by the interrupt handler, observed by the worker
static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_: i32) {
    STOP.store(true, Ordering::Relaxed);
}

fn install_interrupt_handler() -> Result<(), String> {
    let action = SigAction::new(
        SigHandler::Handler(on_interrupt),
        SaFlags::empty(),
        SigSet::empty(),
    );

    unsafe { sigaction(Signal::SIGINT, &action) }
        .map(|_| ())
        .map_err(|error| format!("Failed to install the interrupt handler: {}", error))
}

/// Load every usable seed from the input directory
fn load_seeds(config: &Config) -> Result<Vec<TestCase>, String> {
    let entries = input::input_get_entries(Path::new(&config.io_config.input_dir))?;

    let mut seeds = Vec::new();
    for entry in entries {
        match TestCase::load_from(&entry) {
            Ok(case) => seeds.push(case),
            Err(error) => eprintln!("Failed to read seed {:?}: {}", entry, error),
        }
    }

    if seeds.is_empty() {
        return Err(format!(
            "No usable seed inputs in {:?}",
            config.io_config.input_dir
        ));
    }
    Ok(seeds)
}

/// Launch the fuzzer
fn launch(config: Config) -> Result<(), String> {
    config.validate()?;

    let localtime = Local::now();
    println!("Start time: {}", localtime.format("%Y-%m-%d %H:%M:%S"));
    println!("Target: {}", config.exe_config.target);
    println!("Backend: {:?}", config.exe_config.backend);
    println!("Input: {}", config.io_config.input_dir);
    println!("Output: {}", config.io_config.output_dir);

    let seeds = load_seeds(&config)?;
    println!("Loaded {} seed inputs", seeds.len());

    let backend: Box<dyn Backend> = match config.exe_config.backend {
        BackendKind::Qemu => {
            Box::new(QemuBackend::new(&config).map_err(|error| format!("{}", error))?)
        }
        BackendKind::Valgrind => Box::new(ValgrindBackend::new(&config)),
    };

    install_interrupt_handler()?;

    let mut fuzzer = Fuzzer::new(backend, seeds, &config);
    let builder = thread::Builder::new().name("fuzz_worker".to_string());
    let worker = builder
        .spawn(move || fuzzer.run(&STOP))
        .map_err(|error| format!("Failed to spawn the fuzz worker: {}", error))?;

    match worker.join() {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(format!("{}", error)),
        Err(_) => Err(String::from("The fuzz worker panicked")),
    }
}

/// Main function
fn main() {
    // Get the program args as Vec<&str>
    let args: Vec<String> = std::env::args().collect();
    let args: Vec<&str> = args.iter().map(String::as_ref).collect();

    // Parse the command line
    match cli::CLI::parse(args) {
        Ok(config) => {
            if let Err(error) = launch(config) {
                eprintln!("{}", error);
                exit(1);
            }
        }
        Err(error) => {
            eprintln!("{}", error);
            exit(1);
        }
    }
}
