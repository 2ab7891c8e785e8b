use crate::probe::{Capability, KernelBackend};
use crate::Result;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Writer for the five per-capability symaddr maps.
///
/// Keeps a userspace shadow of the keys present in each kernel map.
/// Under pid churn most removals are for pids that never had a record;
/// the shadow set suppresses the kernel syscall for those, and keeps
/// the maps from filling with stale keys. Invariant: shadow keys ==
/// kernel keys, for every capability.
#[derive(Debug)]
pub struct SymAddrMapWriter {
    shadow: HashMap<Capability, HashSet<u32>>,
}

impl Default for SymAddrMapWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl SymAddrMapWriter {
    pub fn new() -> Self {
        let shadow = Capability::ALL
            .iter()
            .map(|c| (*c, HashSet::new()))
            .collect();
        Self { shadow }
    }

    /// Write (or overwrite) the record for `pid` in the capability map.
    pub fn put(
        &mut self,
        backend: &mut dyn KernelBackend,
        cap: Capability,
        pid: u32,
        value: &[u8],
    ) -> Result<()> {
        backend.map_update(cap, pid, value)?;
        self.shadow.get_mut(&cap).expect("known capability").insert(pid);
        debug!("symaddrs[{}] put pid {} ({} bytes)", cap, pid, value.len());
        Ok(())
    }

    /// Remove the record for `pid`, consulting the shadow set first so
    /// absent keys cost no syscall.
    pub fn remove(
        &mut self,
        backend: &mut dyn KernelBackend,
        cap: Capability,
        pid: u32,
    ) -> Result<()> {
        let keys = self.shadow.get_mut(&cap).expect("known capability");
        if !keys.contains(&pid) {
            return Ok(());
        }
        backend.map_delete(cap, pid)?;
        keys.remove(&pid);
        debug!("symaddrs[{}] removed pid {}", cap, pid);
        Ok(())
    }

    /// Remove `pid` from every capability map (pid exit path).
    pub fn remove_all(&mut self, backend: &mut dyn KernelBackend, pid: u32) {
        for cap in Capability::ALL {
            // Best effort: a failed kernel delete leaves the shadow key
            // in place so the delete is retried on the next removal.
            let _ = self.remove(backend, cap, pid);
        }
    }

    /// Live keys for a capability (shadow view).
    pub fn pids(&self, cap: Capability) -> &HashSet<u32> {
        self.shadow.get(&cap).expect("known capability")
    }
}
