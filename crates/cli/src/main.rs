//! loxi CLI
//!
//! Runs a loxi source file, or starts a line-oriented REPL when no path is
//! given.

use std::io::Write;
use std::path::PathBuf;
use std::process;

use clap::Parser as ClapParser;
use loxi_core::InterpretError;
use loxi_runtime::{Config, Vm};

#[derive(ClapParser)]
#[command(name = "loxi")]
#[command(about = "loxi - a lox-family bytecode interpreter", long_about = None)]
struct Cli {
    /// Source file to run. Omit to start a REPL.
    input: Option<PathBuf>,

    /// Print each instruction before it executes.
    #[arg(long)]
    trace: bool,

    /// Print a line before and after each GC cycle.
    #[arg(long)]
    trace_gc: bool,
}

fn main() {
    let cli = Cli::parse();
    let config = Config {
        trace_execution: cli.trace,
        trace_gc: cli.trace_gc,
        ..Config::default()
    };

    match cli.input {
        Some(path) => run_file(&path, config),
        None => run_repl(config),
    }
}

fn run_file(path: &PathBuf, config: Config) {
    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: could not read {}: {}", path.display(), e);
            process::exit(74);
        }
    };

    let mut vm = Vm::new(config);
    match vm.interpret(&source) {
        Ok(()) => {}
        Err(InterpretError::Compile(errors)) => {
            for e in &errors {
                eprintln!("{e}");
            }
            process::exit(65);
        }
        Err(InterpretError::Runtime(e)) => {
            eprintln!("{e}");
            process::exit(70);
        }
    }
}

fn run_repl(config: Config) {
    let mut vm = Vm::new(config);
    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();
        let mut line = String::new();
        if stdin.read_line(&mut line).unwrap_or(0) == 0 {
            println!();
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        if let Err(e) = vm.interpret(&line) {
            eprintln!("{e}");
        }
    }
}
