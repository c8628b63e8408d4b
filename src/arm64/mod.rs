//! ARM64 (AArch64) Native Code Generation Backend
//!
//! Direct ARM64 machine code generation for macOS, without an assembler or
//! linker.
//!
//! ## Architecture
//!
//! ```text
//! Program → CodegenSession → MachineImage → MachOBuilder → Native Executable
//! ```
//!
//! ## Modules
//!
//! - `registers`: ARM64 register definitions and calling convention
//! - `encoding`: ARM64 instruction encoding (fixed 32-bit)
//! - `labels`: branch labels and their fixups
//! - `layout`: frame slots, variable shapes, enum tables
//! - `data`: interned string and double constants
//! - `codegen`: JibJab to ARM64 translation
//! - `macho`: Mach-O executable generation with dyld chained fixups

pub mod codegen;
pub mod data;
pub mod encoding;
pub mod labels;
pub mod layout;
pub mod macho;
pub mod registers;

pub use codegen::{CodegenSession, MachineImage};
pub use macho::MachOBuilder;
