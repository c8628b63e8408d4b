//! # JibJab native backend
//!
//! Lowers a validated JibJab AST straight into a self-contained macOS/AArch64
//! Mach-O executable. No assembler or linker runs: the crate encodes every
//! instruction itself and writes the dyld metadata needed to bind `_printf`
//! and `_exit` from libSystem.
//!
//! ## Pipeline
//!
//! | Phase | Module | Output |
//! |-------|--------|--------|
//! | 1 | [`ast`] | `Program` from JSON |
//! | 2 | [`arm64::codegen`] | code, data pools, fixups |
//! | 3 | [`arm64::macho`] | executable bytes |
//!
//! The [`interpreter`] evaluates the same AST and prints the same text the
//! generated program would.

pub mod arm64;
pub mod ast;
pub mod interpreter;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use ast::Program;

/// Backend error types
#[derive(Error, Debug)]
pub enum JibJabError {
    /// The program uses a construct the native backend cannot lower
    #[error("unsupported construct: {construct}")]
    UnsupportedConstruct { construct: String },

    /// A fixed backend resource ran out
    #[error("resource exhausted: more than {limit} {resource}")]
    ResourceExhausted { resource: &'static str, limit: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid AST: {0}")]
    Ast(#[from] serde_json::Error),

    /// A backend invariant broke; always a bug in this crate
    #[error("internal error: {message}")]
    Internal { message: String },

    #[error("runtime error: {message}")]
    Runtime { message: String },
}

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, JibJabError>;

/// Compile a program to Mach-O executable bytes
pub fn compile(program: &Program) -> Result<Vec<u8>> {
    // Phase 1: Lower to machine code and data pools
    let image = arm64::CodegenSession::compile(program)?;

    // Phase 2: Lay out segments and resolve data references
    let bytes = arm64::MachOBuilder::new(image).build()?;
    debug!(size = bytes.len(), "compiled program");
    Ok(bytes)
}

/// Compile `program` and write the executable to `output`
///
/// The bytes go to a temporary file next to `output`, which is made
/// executable and then renamed into place. On any failure nothing is left
/// at `output`.
pub fn compile_to_file(program: &Program, output: &Path) -> Result<()> {
    let bytes = compile(program)?;
    let temp = temp_path(output);
    let result = write_executable(&temp, &bytes).and_then(|()| {
        fs::rename(&temp, output)?;
        Ok(())
    });
    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

fn temp_path(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "a.out".to_string());
    output.with_file_name(format!(".{}.{}.tmp", name, std::process::id()))
}

fn write_executable(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}
