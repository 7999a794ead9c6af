//! The bytecode VM: call frames, the fetch-decode-execute loop, the
//! mark-sweep collector's root set, and native functions.

pub mod config;
mod natives;
mod vm;

pub use config::Config;
pub use vm::Vm;

use loxi_core::InterpretError;

/// Compiles and runs `source` in a fresh VM. Matches the source's top-level
/// `interpret()` entry point; a REPL that wants globals to persist across
/// calls should hold onto a `Vm` and call `Vm::interpret` directly instead.
pub fn interpret(source: &str, config: Config) -> Result<(), InterpretError> {
    let mut vm = Vm::new(config);
    vm.interpret(source)
}
