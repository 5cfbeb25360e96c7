/// PocketLang CLI (pocket)
/// Runs a script, dumps its bytecode, or drops into the REPL.

use std::io::Write;
use std::path::PathBuf;

use clap::Parser as ClapParser;
use colored::Colorize;
use miette::{IntoDiagnostic, Result};
use pocketlang::{PkConfiguration, PkResult, PKVM};

// Generous stack for the worker thread — nested imports compile recursively.
const STACK_SIZE: usize = 16 * 1024 * 1024;

#[derive(ClapParser)]
#[command(
    name = "pocket",
    version = "0.1.0",
    about = "The PocketLang interpreter",
    long_about = "pocket — run PocketLang (.pk) scripts, or start a REPL when no script is given."
)]
struct Cli {
    /// Script to execute; omit to start the REPL
    script: Option<PathBuf>,

    /// Dump the compiled bytecode instead of executing
    #[arg(long)]
    dump: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let result = std::thread::Builder::new()
        .name("pocket-worker".into())
        .stack_size(STACK_SIZE)
        .spawn(move || std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| run(cli))))
        .expect("failed to spawn pocket worker thread")
        .join();

    match result {
        Ok(Ok(inner)) => inner,
        Ok(Err(panic_payload)) | Err(panic_payload) => {
            let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                format!("internal error (panic): {}", s)
            } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                format!("internal error (panic): {}", s)
            } else {
                "internal error: unexpected panic in the pocket runtime".to_string()
            };
            eprintln!("pocket crashed: {}", msg);
            Err(miette::miette!("{}", msg))
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.script {
        Some(path) => {
            let source = std::fs::read_to_string(&path)
                .map_err(|e| miette::miette!("Cannot read '{}': {}", path.display(), e))?;
            let path_str = path.to_string_lossy().into_owned();
            let mut vm = PKVM::new(PkConfiguration::default());

            if cli.dump {
                match vm.compile_source(&path_str, &source) {
                    Ok(module) => {
                        print!("{}", vm.dump_module(module));
                        std::io::stdout().flush().into_diagnostic()?;
                    }
                    Err(result) => std::process::exit(result.exit_code()),
                }
                return Ok(());
            }

            let result = vm.interpret(&path_str, &source);
            if result != PkResult::Success {
                std::process::exit(result.exit_code());
            }
            std::io::stdout().flush().into_diagnostic()?;
        }
        None => repl()?,
    }
    Ok(())
}

fn repl() -> Result<()> {
    println!(
        "{} {} — type a statement, Ctrl-D to exit",
        "pocket".green().bold(),
        env!("CARGO_PKG_VERSION")
    );

    let mut conf = PkConfiguration::default();
    conf.repl_mode = true;
    let mut vm = PKVM::new(conf);
    let module = vm.create_repl_module();

    let mut buffer = String::new();
    loop {
        let prompt = if buffer.is_empty() { ">>> " } else { "... " };
        print!("{}", prompt.cyan());
        std::io::stdout().flush().into_diagnostic()?;

        let mut line = String::new();
        match std::io::stdin().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => return Err(miette::miette!("cannot read input: {}", e)),
        }
        buffer.push_str(&line);

        match vm.interpret_repl(module, &buffer) {
            // Construct still open — keep the buffer, read another line.
            PkResult::UnexpectedEof => continue,
            _ => buffer.clear(),
        }
    }
    Ok(())
}
