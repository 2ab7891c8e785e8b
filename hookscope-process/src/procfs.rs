use crate::{ProcessError, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Access layer for the kernel's process directory.
///
/// The root is injectable so tests can point at a synthetic tree; the
/// layout underneath is the standard procfs one (`<root>/<pid>/stat`,
/// `exe`, `maps`, `ns/mnt`, `root/`).
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
    ns_per_tick: u64,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcFs {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        let hz = if hz > 0 { hz as u64 } else { 100 };
        Self {
            root: root.as_ref().to_path_buf(),
            ns_per_tick: 1_000_000_000 / hz,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The path prefix through which pid's mount-namespace view of the
    /// filesystem is reachable.
    pub fn pid_root(&self, pid: u32) -> PathBuf {
        self.root.join(pid.to_string()).join("root")
    }

    /// Enumerate live pids. Per-pid races (a process exiting mid-scan)
    /// are not errors; an unreadable procfs root is transient.
    pub fn list_pids(&self) -> Result<Vec<u32>> {
        let dir = fs::read_dir(&self.root).map_err(ProcessError::Transient)?;
        let mut pids = Vec::new();
        for entry in dir.flatten() {
            if let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() {
                pids.push(pid);
            }
        }
        Ok(pids)
    }

    /// Process start time in nanoseconds since boot, from field 22 of
    /// `<root>/<pid>/stat` (clock ticks).
    pub fn start_time_ns(&self, pid: u32) -> Result<u64> {
        let path = self.root.join(pid.to_string()).join("stat");
        let content = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProcessError::ProcessNotFound(pid)
            } else {
                ProcessError::Io(e)
            }
        })?;
        let ticks = parse_stat_start_time(&content).ok_or_else(|| ProcessError::Malformed {
            path: path.clone(),
            reason: "missing start_time field".to_string(),
        })?;
        Ok(ticks * self.ns_per_tick)
    }

    /// Executable path as seen by the target process (readlink of
    /// `<root>/<pid>/exe`). The link target is in the target's mount
    /// namespace; resolve through [`crate::MountNsResolver`] before
    /// opening it.
    pub fn exe_path(&self, pid: u32) -> Result<PathBuf> {
        let path = self.root.join(pid.to_string()).join("exe");
        fs::read_link(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProcessError::ProcessNotFound(pid)
            } else {
                ProcessError::Io(e)
            }
        })
    }

    /// Mount namespace identity of the pid, parsed from the
    /// `mnt:[4026531840]` style link target of `<root>/<pid>/ns/mnt`.
    pub fn mount_ns_id(&self, pid: u32) -> Result<u64> {
        let path = self.root.join(pid.to_string()).join("ns").join("mnt");
        let target = fs::read_link(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProcessError::ProcessNotFound(pid)
            } else {
                ProcessError::Io(e)
            }
        })?;
        let s = target.to_string_lossy();
        parse_ns_link(&s).ok_or_else(|| ProcessError::Malformed {
            path,
            reason: format!("unexpected ns link target '{s}'"),
        })
    }

    /// Unique file-backed mapping paths of the pid, as seen by the pid.
    /// Pseudo entries (`[stack]`, `[vdso]`, ...) are skipped and a
    /// trailing " (deleted)" marker is trimmed.
    pub fn map_paths(&self, pid: u32) -> Result<BTreeSet<String>> {
        let path = self.root.join(pid.to_string()).join("maps");
        let content = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProcessError::ProcessNotFound(pid)
            } else {
                ProcessError::Io(e)
            }
        })?;

        let mut paths = BTreeSet::new();
        for line in content.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 6 {
                continue;
            }
            let p = parts[5];
            if p.starts_with('[') {
                continue;
            }
            let trimmed = match p.find(" (deleted)") {
                Some(idx) => &p[..idx],
                None => p,
            };
            paths.insert(trimmed.to_string());
        }
        debug!("pid {} maps {} file-backed paths", pid, paths.len());
        Ok(paths)
    }
}

/// Extract the start_time field (22, in clock ticks) from a stat line.
/// The comm field may contain spaces and parentheses, so fields are
/// counted from the last ')'.
fn parse_stat_start_time(stat: &str) -> Option<u64> {
    let close = stat.rfind(')')?;
    let rest = stat[close + 1..].split_whitespace().collect::<Vec<_>>();
    // rest[0] is field 3 (state); start_time is field 22.
    rest.get(19)?.parse::<u64>().ok()
}

fn parse_ns_link(target: &str) -> Option<u64> {
    let inner = target.strip_prefix("mnt:[")?.strip_suffix(']')?;
    inner.parse::<u64>().ok()
}
