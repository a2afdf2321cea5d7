// File: src/main.rs
//
// Command-line runner for uGO scripts.
// Compiles and executes a script file; --timeout arms a watcher thread
// that aborts the VM cooperatively. Exit code 0 on success, 1 on any
// parse, compile, or runtime error, with the diagnostic on stderr.

use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use ugo::compiler::{compile_named, CompilerOptions};
use ugo::value::Value;
use ugo::vm::Vm;

#[derive(Parser)]
#[command(
    name = "ugo",
    about = "uGO: an embeddable Go-like scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    /// Path to the .ugo script
    file: PathBuf,

    /// Abort execution after this many seconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Disable the constant-folding optimizer
    #[arg(long)]
    no_optimize: bool,

    /// Print the compiled bytecode before running
    #[arg(long)]
    trace_compiler: bool,

    /// Print optimizer statistics
    #[arg(long)]
    trace_optimizer: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let source = match fs::read(&cli.file) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("error: cannot read {}: {}", cli.file.display(), err);
            return ExitCode::FAILURE;
        }
    };
    let file_name = cli.file.to_string_lossy().to_string();

    // Sibling scripts are importable by name.
    let module_path = cli
        .file
        .parent()
        .map(|dir| dir.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));

    let options = CompilerOptions {
        module_path: Some(module_path),
        no_optimize: cli.no_optimize,
        trace_compiler: cli.trace_compiler,
        trace_optimizer: cli.trace_optimizer,
        ..Default::default()
    };
    let bytecode = match compile_named(&source, &file_name, options) {
        Ok(bytecode) => bytecode,
        Err(err) => {
            eprintln!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    let mut vm = Vm::new(Arc::new(bytecode));
    if let Some(secs) = cli.timeout {
        let abort = vm.abort_handle();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(secs));
            abort.store(true, Ordering::Relaxed);
        });
    }

    match vm.run(Value::empty_map(), &[]) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", err);
            ExitCode::FAILURE
        }
    }
}
