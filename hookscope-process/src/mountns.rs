use crate::{ProcFs, ProcessError, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Resolves a path as seen by a target pid into a path the agent can
/// open.
///
/// Container processes see their own mount namespace; the agent reads
/// through `<proc>/<pid>/root/<path>`, which is valid for same-namespace
/// pids too. When the target's namespace differs and the bind-read
/// fails, the caller gets [`ProcessError::MountNsDiffers`] so it can
/// fall back to running a helper inside the target namespace.
#[derive(Debug)]
pub struct MountNsResolver {
    procfs: ProcFs,
    self_mnt_ns: Option<u64>,
}

impl MountNsResolver {
    pub fn new(procfs: ProcFs) -> Self {
        let self_mnt_ns = procfs.mount_ns_id(std::process::id()).ok();
        Self {
            procfs,
            self_mnt_ns,
        }
    }

    /// True when the pid shares the agent's mount namespace (in which
    /// case target paths are directly openable).
    pub fn same_namespace(&self, pid: u32) -> bool {
        match (self.self_mnt_ns, self.procfs.mount_ns_id(pid)) {
            (Some(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    /// Resolve `path` (as seen by `pid`) to a canonical path in the
    /// agent's view.
    pub fn resolve(&self, pid: u32, path: &Path) -> Result<PathBuf> {
        let rel = path.strip_prefix("/").unwrap_or(path);
        let bridged = self.procfs.pid_root(pid).join(rel);
        match bridged.canonicalize() {
            Ok(p) => {
                debug!("resolved {} for pid {} -> {}", path.display(), pid, p.display());
                Ok(p)
            }
            Err(e) => {
                // Same-namespace targets can still be resolved directly;
                // anything else is a namespace we cannot see into.
                if self.same_namespace(pid) {
                    return path.canonicalize().map_err(ProcessError::Io);
                }
                if e.kind() == std::io::ErrorKind::NotFound {
                    Err(ProcessError::MountNsDiffers {
                        pid,
                        path: path.to_path_buf(),
                    })
                } else {
                    Err(ProcessError::Io(e))
                }
            }
        }
    }
}
