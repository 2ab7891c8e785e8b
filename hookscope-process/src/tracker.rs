use crate::{ProcFs, Result, Upid};
use std::collections::HashSet;
use tracing::debug;

/// Deltas between two consecutive views of the process table.
#[derive(Debug, Default, Clone)]
pub struct ProcDelta {
    pub new: HashSet<Upid>,
    pub deleted: HashSet<Upid>,
    pub retained: HashSet<Upid>,
}

/// Tracks the set of live processes and reports add/remove deltas.
///
/// Identity is the full UPID, so a recycled pid number shows up as the
/// old UPID in `deleted` and the new one in `new` within the same tick.
#[derive(Debug)]
pub struct ProcTracker {
    procfs: ProcFs,
    asid: u32,
    upids: HashSet<Upid>,
}

impl ProcTracker {
    pub fn new(procfs: ProcFs, asid: u32) -> Self {
        Self {
            procfs,
            asid,
            upids: HashSet::new(),
        }
    }

    pub fn asid(&self) -> u32 {
        self.asid
    }

    /// Current view of tracked UPIDs (as of the last `update`).
    pub fn upids(&self) -> &HashSet<Upid> {
        &self.upids
    }

    /// Read the current process table. Pids that vanish between the
    /// directory listing and the stat read are skipped silently.
    pub fn scan(&self) -> Result<HashSet<Upid>> {
        let mut snapshot = HashSet::new();
        for pid in self.procfs.list_pids()? {
            match self.procfs.start_time_ns(pid) {
                Ok(start_time_ns) => {
                    snapshot.insert(Upid::new(self.asid, pid, start_time_ns));
                }
                Err(e) => {
                    debug!("skipping pid {} during scan: {}", pid, e);
                }
            }
        }
        Ok(snapshot)
    }

    /// Replace the tracked view with `snapshot` and return the deltas.
    pub fn update(&mut self, snapshot: HashSet<Upid>) -> ProcDelta {
        let new: HashSet<Upid> = snapshot.difference(&self.upids).copied().collect();
        let deleted: HashSet<Upid> = self.upids.difference(&snapshot).copied().collect();
        let retained: HashSet<Upid> = snapshot.intersection(&self.upids).copied().collect();

        self.upids = snapshot;
        ProcDelta {
            new,
            deleted,
            retained,
        }
    }
}
