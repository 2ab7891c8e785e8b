pub mod dwarf;
pub mod elf;
pub mod goinfo;

pub use dwarf::{ArgLocation, DwarfReader, LocationKind};
pub use elf::{ElfReader, SymbolInfo, SymbolMatchType};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BinaryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not an ELF file: {0}")]
    NotElf(PathBuf),

    #[error("object parsing error: {0}")]
    Object(#[from] object::Error),

    #[error("DWARF parsing error: {0}")]
    Dwarf(#[from] gimli::Error),

    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("no debug information found")]
    NoDebugInfo,

    #[error("corrupt binary: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, BinaryError>;
