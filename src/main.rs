// File: src/main.rs
//
// Entry point: dispatches to `run <path>` or an interactive REPL,
// exiting with the conventional sysexits.h-style codes the core spec
// requires of its host (0 success, 64 usage, 65 compile error, 70
// runtime error, 74 I/O error).

use clap::{Parser as ClapParser, Subcommand};
use loxvm::{builtins, compiler, config, repl, vm};
use std::path::PathBuf;
use std::process::ExitCode;
use vm::InterpretError;

#[derive(ClapParser)]
#[command(
    name = "lox",
    about = "loxvm - a bytecode compiler and virtual machine for the Lox language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a Lox script file
    Run {
        /// Path to the .lox source file
        path: PathBuf,

        /// Print each chunk's disassembly before running it
        #[arg(long)]
        disassemble: bool,
    },

    /// Launch the interactive REPL
    Repl,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = config::Config::load();
    colored::control::set_override(config.color);

    match cli.command {
        Some(Commands::Run { path, disassemble }) => run_file(&path, disassemble, &config),
        Some(Commands::Repl) | None => run_repl(config),
    }
}

fn run_file(path: &std::path::Path, disassemble: bool, config: &config::Config) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Can't read file '{}': {err}", path.display());
            return ExitCode::from(74);
        }
    };

    let mut vm = vm::Vm::new();
    vm.heap.stress_gc = config.gc_stress;
    builtins::install(&mut vm);

    let function_ref = match compiler::compile(&source, &mut vm.heap) {
        Ok(function_ref) => function_ref,
        Err(errors) => {
            for error in &errors {
                eprintln!("{error}");
            }
            return ExitCode::from(65);
        }
    };

    if disassemble {
        vm.disassemble_program(function_ref);
    }

    match vm.interpret_function(function_ref) {
        Ok(()) => ExitCode::from(0),
        Err(InterpretError::Compile(errors)) => {
            for error in &errors {
                eprintln!("{error}");
            }
            ExitCode::from(65)
        }
        Err(InterpretError::Runtime(error)) => {
            eprintln!("{error}");
            ExitCode::from(70)
        }
    }
}

fn run_repl(config: config::Config) -> ExitCode {
    match repl::Repl::new(config) {
        Ok(mut session) => match session.run() {
            Ok(()) => ExitCode::from(0),
            Err(err) => {
                eprintln!("REPL error: {err}");
                ExitCode::from(70)
            }
        },
        Err(err) => {
            eprintln!("Failed to start REPL: {err}");
            ExitCode::from(74)
        }
    }
}
