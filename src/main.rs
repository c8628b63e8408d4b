//! JibJab native backend CLI
//!
//! Builds macOS/AArch64 executables from JibJab AST files, or runs them
//! through the reference interpreter.

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode};

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use jibjab::ast::Program;
use jibjab::interpreter::Interpreter;
use jibjab::{compile, compile_to_file, JibJabError};

#[derive(Parser)]
#[command(name = "jjc")]
#[command(version)]
#[command(about = "JibJab native compiler - AST to AArch64 Mach-O", long_about = None)]
struct Cli {
    /// Enable debug logging (overridden by JJC_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile an AST file to a native executable
    Build {
        /// Input AST (JSON)
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Output file path (default: input file stem)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Ad-hoc sign the executable with `codesign -s -`
        #[arg(long)]
        sign: bool,
    },

    /// Interpret an AST file with the reference interpreter
    Run {
        /// Input AST (JSON)
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Lower an AST file without writing an executable
    Check {
        /// Input AST (JSON)
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Build { file, output, sign } => cmd_build(file, output, sign),
        Commands::Run { file } => cmd_run(file),
        Commands::Check { file } => cmd_check(file),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { LevelFilter::DEBUG } else { LevelFilter::WARN };
    let filter = EnvFilter::builder()
        .with_default_directive(default.into())
        .with_env_var("JJC_LOG")
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn load_program(file: &Path) -> Option<Program> {
    let source = match fs::read_to_string(file) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}: could not read '{}': {}",
                "error".red().bold(), file.display(), e);
            return None;
        }
    };
    match Program::from_json(&source) {
        Ok(program) => Some(program),
        Err(e) => {
            print_error(&e, file);
            None
        }
    }
}

fn print_error(e: &JibJabError, file: &Path) {
    eprintln!("{}: {}", "error".red().bold(), e);
    match e {
        JibJabError::UnsupportedConstruct { .. } => {
            eprintln!("  {} '{}' uses a construct the native backend cannot lower",
                "note:".yellow(), file.display());
            eprintln!("  {} `jjc run` interprets the full language",
                "help:".cyan());
        }
        JibJabError::Internal { .. } => {
            eprintln!("  {} this is a bug in the backend", "note:".yellow());
        }
        _ => {}
    }
}

fn cmd_build(file: PathBuf, output: Option<PathBuf>, sign: bool) -> ExitCode {
    let Some(program) = load_program(&file) else {
        return ExitCode::FAILURE;
    };
    let output_path = output.unwrap_or_else(|| default_output(&file));

    if let Err(e) = compile_to_file(&program, &output_path) {
        print_error(&e, &file);
        return ExitCode::FAILURE;
    }

    if sign {
        if let Err(message) = codesign(&output_path) {
            eprintln!("{}: could not sign '{}': {}",
                "error".red().bold(), output_path.display(), message);
            let _ = fs::remove_file(&output_path);
            return ExitCode::FAILURE;
        }
    }

    println!("{} {} -> {}",
        "Compiled".green().bold(),
        file.display(),
        output_path.display());
    ExitCode::SUCCESS
}

fn default_output(file: &Path) -> PathBuf {
    match file.file_stem() {
        Some(stem) => file.with_file_name(stem),
        None => PathBuf::from("a.out"),
    }
}

fn codesign(path: &Path) -> Result<(), String> {
    let status = Command::new("codesign")
        .args(["-s", "-", "-f"])
        .arg(path)
        .status()
        .map_err(|e| e.to_string())?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("codesign exited with {}", status))
    }
}

fn cmd_run(file: PathBuf) -> ExitCode {
    let Some(program) = load_program(&file) else {
        return ExitCode::FAILURE;
    };

    let stdout = io::stdout();
    let mut interpreter = Interpreter::new(stdout.lock());
    match interpreter.run(&program) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            print_error(&e, &file);
            ExitCode::FAILURE
        }
    }
}

fn cmd_check(file: PathBuf) -> ExitCode {
    let Some(program) = load_program(&file) else {
        return ExitCode::FAILURE;
    };

    // Lower and lay out, but don't write output
    match compile(&program) {
        Ok(bytes) => {
            println!("{} {} ({} bytes)",
                "Checked".green().bold(),
                file.display(),
                bytes.len());
            ExitCode::SUCCESS
        }
        Err(e) => {
            print_error(&e, &file);
            ExitCode::FAILURE
        }
    }
}
