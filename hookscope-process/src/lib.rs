pub mod mountns;
pub mod procfs;
pub mod tracker;
pub mod upid;

pub use mountns::MountNsResolver;
pub use procfs::ProcFs;
pub use tracker::{ProcDelta, ProcTracker};
pub use upid::Upid;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    /// The procfs root itself was momentarily unreadable. Callers retry
    /// on the next pass; this is never fatal.
    #[error("transient procfs read failure: {0}")]
    Transient(#[source] std::io::Error),

    #[error("process not found: pid {0}")]
    ProcessNotFound(u32),

    /// The target pid lives in a different mount namespace and its view
    /// of the path could not be read through procfs.
    #[error("mount namespace differs for pid {pid}: cannot resolve {path}")]
    MountNsDiffers { pid: u32, path: PathBuf },

    #[error("malformed procfs entry {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProcessError>;
