use crate::probe::{AttachType, KernelBackend, ProbeHandle, UProbeSpec};
use crate::{LoaderError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Identity of an attachment: one kernel probe exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProbeKey {
    pub binary: PathBuf,
    pub address: u64,
    pub probe_fn: String,
}

impl ProbeKey {
    fn of(spec: &UProbeSpec) -> Self {
        Self {
            binary: spec.binary_path.clone(),
            address: spec.address,
            probe_fn: spec.probe_fn.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Attached(ProbeHandle),
    AlreadyAttached,
}

/// Owns the set of live kernel probes and enforces attach idempotence.
///
/// Probes are scoped to binaries, not pids: many pids share one libssl,
/// and the probe outlives any single pid. Detach happens only when the
/// binary itself is evicted.
#[derive(Debug, Default)]
pub struct ProbeAttacher {
    attached: HashMap<ProbeKey, ProbeHandle>,
}

impl ProbeAttacher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `spec` unless an identical probe already exists.
    /// `target_is_go` gates the epilogue-return rejection.
    pub fn attach(
        &mut self,
        backend: &mut dyn KernelBackend,
        spec: &UProbeSpec,
        target_is_go: bool,
    ) -> Result<AttachOutcome> {
        if spec.attach_type == AttachType::Return && target_is_go {
            return Err(LoaderError::UnsafeReturnProbe(spec.symbol.clone()));
        }

        let key = ProbeKey::of(spec);
        if self.attached.contains_key(&key) {
            return Ok(AttachOutcome::AlreadyAttached);
        }

        let handle = backend.attach_uprobe(spec)?;
        debug!(
            "attached {} at {}:{:#x} ({})",
            spec.probe_fn,
            spec.binary_path.display(),
            spec.address,
            spec.attach_type.as_str()
        );
        self.attached.insert(key, handle);
        Ok(AttachOutcome::Attached(handle))
    }

    /// Detach every probe bound to `binary`. Individual detach failures
    /// are logged and do not stop the sweep.
    pub fn detach_binary(&mut self, backend: &mut dyn KernelBackend, binary: &Path) -> usize {
        let keys: Vec<ProbeKey> = self
            .attached
            .keys()
            .filter(|k| k.binary == binary)
            .cloned()
            .collect();
        let mut detached = 0;
        for key in keys {
            if let Some(handle) = self.attached.remove(&key) {
                match backend.detach_uprobe(handle) {
                    Ok(()) => detached += 1,
                    Err(e) => warn!(
                        "detach failed for {} at {:#x}: {}",
                        key.probe_fn, key.address, e
                    ),
                }
            }
        }
        detached
    }

    /// Detach everything (shutdown path).
    pub fn detach_all(&mut self, backend: &mut dyn KernelBackend) -> usize {
        let keys: Vec<ProbeKey> = self.attached.keys().cloned().collect();
        let mut detached = 0;
        for key in keys {
            if let Some(handle) = self.attached.remove(&key) {
                if backend.detach_uprobe(handle).is_ok() {
                    detached += 1;
                }
            }
        }
        detached
    }

    pub fn attached_count(&self) -> usize {
        self.attached.len()
    }

    pub fn attached_keys(&self) -> impl Iterator<Item = &ProbeKey> {
        self.attached.keys()
    }

    pub fn is_attached(&self, binary: &Path, address: u64, probe_fn: &str) -> bool {
        self.attached.contains_key(&ProbeKey {
            binary: binary.to_path_buf(),
            address,
            probe_fn: probe_fn.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;

    fn spec(offset: u64, attach_type: AttachType) -> UProbeSpec {
        UProbeSpec {
            binary_path: PathBuf::from("/usr/lib/x86_64-linux-gnu/libssl.so.1.1"),
            symbol: "SSL_write".to_string(),
            address: offset,
            attach_type,
            probe_fn: "probe_entry_SSL_write".to_string(),
        }
    }

    #[test]
    fn test_attach_is_idempotent() {
        let mut backend = FakeBackend::new();
        let mut attacher = ProbeAttacher::new();
        let s = spec(0x1000, AttachType::Entry);

        let first = attacher.attach(&mut backend, &s, false).unwrap();
        assert!(matches!(first, AttachOutcome::Attached(_)));
        let second = attacher.attach(&mut backend, &s, false).unwrap();
        assert_eq!(second, AttachOutcome::AlreadyAttached);

        assert_eq!(attacher.attached_count(), 1);
        assert_eq!(backend.attached.len(), 1);
    }

    #[test]
    fn test_rejects_epilogue_return_on_go() {
        let mut backend = FakeBackend::new();
        let mut attacher = ProbeAttacher::new();
        let s = spec(0x1000, AttachType::Return);

        let err = attacher.attach(&mut backend, &s, true).unwrap_err();
        assert!(matches!(err, LoaderError::UnsafeReturnProbe(_)));
        assert!(backend.attached.is_empty());

        // ReturnInsts is the sanctioned mechanism for Go.
        let ri = spec(0x1a2, AttachType::ReturnInsts);
        assert!(attacher.attach(&mut backend, &ri, true).is_ok());
    }

    #[test]
    fn test_detach_binary_scoped() {
        let mut backend = FakeBackend::new();
        let mut attacher = ProbeAttacher::new();
        attacher
            .attach(&mut backend, &spec(0x1000, AttachType::Entry), false)
            .unwrap();
        let mut other = spec(0x2000, AttachType::Entry);
        other.binary_path = PathBuf::from("/app/server");
        attacher.attach(&mut backend, &other, false).unwrap();

        let n = attacher.detach_binary(
            &mut backend,
            Path::new("/usr/lib/x86_64-linux-gnu/libssl.so.1.1"),
        );
        assert_eq!(n, 1);
        assert_eq!(attacher.attached_count(), 1);
        assert!(attacher.is_attached(Path::new("/app/server"), 0x2000, "probe_entry_SSL_write"));
    }
}
