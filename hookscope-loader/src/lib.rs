pub mod attacher;
pub mod aya_backend;
pub mod probe;
pub mod symaddr_map;
pub mod testing;

pub use attacher::{AttachOutcome, ProbeAttacher};
pub use aya_backend::AyaBackend;
pub use probe::{AttachType, Capability, KernelBackend, ProbeHandle, UProbeSpec};
pub use symaddr_map::SymAddrMapWriter;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("aya error: {0}")]
    Aya(#[from] aya::EbpfError),

    #[error("program error: {0}")]
    Program(#[from] aya::programs::ProgramError),

    #[error("program not found in eBPF object: {0}")]
    ProgramNotFound(String),

    #[error("map not found in eBPF object: {0}")]
    MapNotFound(String),

    #[error("attach failed for {probe_fn} at {binary}:{offset:#x}: {reason}")]
    AttachFailed {
        binary: PathBuf,
        offset: u64,
        probe_fn: String,
        reason: String,
    },

    /// Epilogue-based return probes are unsafe on runtimes that move
    /// stacks; only per-ret-instruction attachment is allowed there.
    #[error("refusing epilogue return probe on Go symbol {0}")]
    UnsafeReturnProbe(String),

    #[error("binary changed on disk: {0}")]
    BinaryChanged(PathBuf),

    #[error("map write failed for {map} pid {pid}: {source}")]
    MapWrite {
        map: &'static str,
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown probe handle: {0}")]
    UnknownHandle(u64),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LoaderError>;
