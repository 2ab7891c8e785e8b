//! Recording fake of the kernel backend, used by unit tests here and by
//! the deployment scenario suite in the orchestrator crate.

use crate::probe::{Capability, KernelBackend, ProbeHandle, UProbeSpec};
use crate::{LoaderError, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// Ordered record of every call that reached the (fake) kernel. The
/// ordering is what publish-before-advertise assertions inspect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Attach { spec: UProbeSpec, handle: u64 },
    Detach { handle: u64 },
    MapUpdate { cap: Capability, pid: u32 },
    MapDelete { cap: Capability, pid: u32 },
}

#[derive(Debug, Default)]
pub struct FakeBackend {
    pub events: Vec<BackendEvent>,
    /// Live probes by handle.
    pub attached: BTreeMap<u64, UProbeSpec>,
    /// Kernel-map contents per capability.
    pub maps: HashMap<Capability, HashMap<u32, Vec<u8>>>,
    /// probe_fn values whose attach should fail.
    pub fail_attach: HashSet<String>,
    /// Capabilities whose map updates should fail (map-full simulation).
    pub fail_map_update: HashSet<Capability>,
    next_handle: u64,
}

impl FakeBackend {
    pub fn new() -> Self {
        let maps = Capability::ALL
            .iter()
            .map(|c| (*c, HashMap::new()))
            .collect();
        Self {
            maps,
            ..Default::default()
        }
    }

    /// Specs of currently attached probes, for set comparisons.
    pub fn attached_specs(&self) -> Vec<&UProbeSpec> {
        self.attached.values().collect()
    }

    pub fn attach_events(&self) -> impl Iterator<Item = &UProbeSpec> {
        self.events.iter().filter_map(|e| match e {
            BackendEvent::Attach { spec, .. } => Some(spec),
            _ => None,
        })
    }
}

/// Cloneable handle over a [`FakeBackend`]: one clone goes into the
/// manager as its kernel backend, the other stays with the test for
/// inspection and failure injection.
#[derive(Debug, Clone)]
pub struct SharedFakeBackend(Arc<Mutex<FakeBackend>>);

impl Default for SharedFakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedFakeBackend {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(FakeBackend::new())))
    }

    pub fn lock(&self) -> MutexGuard<'_, FakeBackend> {
        self.0.lock().expect("fake backend mutex")
    }
}

impl KernelBackend for SharedFakeBackend {
    fn attach_uprobe(&mut self, spec: &UProbeSpec) -> Result<ProbeHandle> {
        self.lock().attach_uprobe(spec)
    }

    fn detach_uprobe(&mut self, handle: ProbeHandle) -> Result<()> {
        self.lock().detach_uprobe(handle)
    }

    fn map_update(&mut self, cap: Capability, pid: u32, value: &[u8]) -> Result<()> {
        self.lock().map_update(cap, pid, value)
    }

    fn map_delete(&mut self, cap: Capability, pid: u32) -> Result<()> {
        self.lock().map_delete(cap, pid)
    }
}

impl KernelBackend for FakeBackend {
    fn attach_uprobe(&mut self, spec: &UProbeSpec) -> Result<ProbeHandle> {
        if self.fail_attach.contains(&spec.probe_fn) {
            return Err(LoaderError::AttachFailed {
                binary: spec.binary_path.clone(),
                offset: spec.address,
                probe_fn: spec.probe_fn.clone(),
                reason: "injected failure".to_string(),
            });
        }
        self.next_handle += 1;
        let handle = self.next_handle;
        self.attached.insert(handle, spec.clone());
        self.events.push(BackendEvent::Attach {
            spec: spec.clone(),
            handle,
        });
        Ok(ProbeHandle(handle))
    }

    fn detach_uprobe(&mut self, handle: ProbeHandle) -> Result<()> {
        if self.attached.remove(&handle.0).is_none() {
            return Err(LoaderError::UnknownHandle(handle.0));
        }
        self.events.push(BackendEvent::Detach { handle: handle.0 });
        Ok(())
    }

    fn map_update(&mut self, cap: Capability, pid: u32, value: &[u8]) -> Result<()> {
        if self.fail_map_update.contains(&cap) {
            return Err(LoaderError::MapWrite {
                map: cap.map_name(),
                pid,
                source: std::io::Error::from_raw_os_error(libc::E2BIG),
            });
        }
        self.maps
            .get_mut(&cap)
            .expect("known capability")
            .insert(pid, value.to_vec());
        self.events.push(BackendEvent::MapUpdate { cap, pid });
        Ok(())
    }

    fn map_delete(&mut self, cap: Capability, pid: u32) -> Result<()> {
        let removed = self
            .maps
            .get_mut(&cap)
            .expect("known capability")
            .remove(&pid);
        if removed.is_none() {
            return Err(LoaderError::MapWrite {
                map: cap.map_name(),
                pid,
                source: std::io::Error::from_raw_os_error(libc::ENOENT),
            });
        }
        self.events.push(BackendEvent::MapDelete { cap, pid });
        Ok(())
    }
}
