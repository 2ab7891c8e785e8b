use crate::config::AgentConfig;
use crate::detector::app_kind_for;
use crate::rescan::{PassOutcome, RescanScheduler};
use crate::resolver::{BinaryIdentity, BinaryResolver, ResolutionRecord, ResolveError};
use crate::status::{ProbeInfo, StatusCode, StatusReporter};
use crate::SOURCE_CONNECTOR;
use crossbeam_queue::ArrayQueue;
use hookscope_loader::{
    AttachOutcome, Capability, KernelBackend, ProbeAttacher, SymAddrMapWriter, UProbeSpec,
};
use hookscope_process::{MountNsResolver, ProcFs, ProcTracker, Upid};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Passes a binary survives with zero referencing pids before its
/// probes are detached and its resolution evicted. Bridges short pod
/// restarts that reuse the same image.
const EVICTION_GRACE_PASSES: u64 = 2;

/// Capacity of the mmap notification queue. Overflow is harmless: the
/// periodic backoff schedule still rescans eventually.
const MMAP_QUEUE_CAPACITY: usize = 4096;

/// Orchestrates uprobe deployment across the node's processes.
///
/// Consumes process-table deltas, classifies and resolves each
/// process's binary, publishes per-pid symaddr records, and attaches
/// probes. One deployment pass runs at a time; concurrent `deploy`
/// calls coalesce on the latest requested view.
pub struct UProbeManager {
    cfg: AgentConfig,
    agent_upid: Upid,
    procfs: ProcFs,
    mountns: MountNsResolver,
    reporter: StatusReporter,
    mmap_events: ArrayQueue<Upid>,
    pending: Mutex<Option<HashSet<Upid>>>,
    inner: Mutex<Inner>,
    deploy_threads: AtomicUsize,
    shutting_down: AtomicBool,
}

struct Inner {
    backend: Box<dyn KernelBackend>,
    resolver: Box<dyn BinaryResolver>,
    attacher: ProbeAttacher,
    symaddr_maps: SymAddrMapWriter,
    scheduler: RescanScheduler,
    tracker: ProcTracker,
    binaries: BinaryCache,
    enable_http2: bool,
    disable_self_probing: bool,
}

impl std::fmt::Debug for UProbeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UProbeManager")
            .field("agent_upid", &self.agent_upid)
            .finish()
    }
}

impl UProbeManager {
    pub fn new(
        cfg: AgentConfig,
        agent_upid: Upid,
        procfs: ProcFs,
        backend: Box<dyn KernelBackend>,
        resolver: Box<dyn BinaryResolver>,
        reporter: StatusReporter,
    ) -> Self {
        let scheduler =
            RescanScheduler::new(cfg.rescan_backoff_factor, cfg.rescan_backoff_ceiling);
        let tracker = ProcTracker::new(procfs.clone(), agent_upid.asid);
        let mountns = MountNsResolver::new(procfs.clone());
        Self {
            cfg,
            agent_upid,
            procfs,
            mountns,
            reporter,
            mmap_events: ArrayQueue::new(MMAP_QUEUE_CAPACITY),
            pending: Mutex::new(None),
            inner: Mutex::new(Inner {
                backend,
                resolver,
                attacher: ProbeAttacher::new(),
                symaddr_maps: SymAddrMapWriter::new(),
                scheduler,
                tracker,
                binaries: BinaryCache::default(),
                enable_http2: false,
                disable_self_probing: true,
            }),
            deploy_threads: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Mandatory initialization before the first deployment pass.
    pub fn init(&self, enable_http2_tracing: bool, disable_self_probing: bool) {
        let mut inner = self.inner.lock().expect("manager mutex");
        inner.enable_http2 = enable_http2_tracing;
        inner.disable_self_probing = disable_self_probing;
        inner.scheduler.reset();
        info!(
            "uprobe manager initialized (http2={}, self_probing_disabled={})",
            enable_http2_tracing, disable_self_probing
        );
        self.reporter
            .source_status(SOURCE_CONNECTOR, StatusCode::Ok, "", "init");
    }

    /// Record an mmap event for a process. Lock-free and non-blocking;
    /// safe to call from the event-delivery context. A full queue drops
    /// the notification, which only delays the rescan.
    pub fn notify_mmap(&self, upid: Upid) {
        if !self.cfg.rescan_on_dlopen {
            return;
        }
        let _ = self.mmap_events.push(upid);
    }

    /// Run one deployment pass over the given view of live UPIDs.
    /// Serialized: at most one pass runs at a time, and calls that
    /// arrive during a pass coalesce on the latest view.
    pub fn deploy(&self, pids: HashSet<Upid>) {
        *self.pending.lock().expect("pending mutex") = Some(pids);
        let mut inner = self.inner.lock().expect("manager mutex");
        let view = match self.pending.lock().expect("pending mutex").take() {
            Some(v) => v,
            // A pass that finished just before we got the lock already
            // consumed this view.
            None => return,
        };
        self.run_pass(&mut inner, view);
    }

    /// Run `deploy` on a worker thread.
    pub fn run_deploy_thread(self: &Arc<Self>, pids: HashSet<Upid>) -> JoinHandle<()> {
        // Incremented before spawn so a slow scheduler can't make
        // threads_running() miss the thread.
        self.deploy_threads.fetch_add(1, Ordering::SeqCst);
        let manager = Arc::clone(self);
        std::thread::spawn(move || {
            manager.deploy(pids);
            manager.deploy_threads.fetch_sub(1, Ordering::SeqCst);
        })
    }

    pub fn threads_running(&self) -> bool {
        self.deploy_threads.load(Ordering::SeqCst) != 0
    }

    /// Stop deploying and detach every probe. In-flight resolution
    /// completes; pending attaches are skipped.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let mut inner = self.inner.lock().expect("manager mutex");
        let inner = &mut *inner;
        let detached = inner.attacher.detach_all(inner.backend.as_mut());
        info!("shutdown: detached {detached} probes");
        self.reporter
            .source_status(SOURCE_CONNECTOR, StatusCode::Ok, "", "shutdown");
    }

    // Observability hooks (tests, agent debug endpoints).

    pub fn rescan_multiplier(&self, upid: Upid) -> Option<u32> {
        self.inner.lock().expect("manager mutex").scheduler.multiplier(upid)
    }

    pub fn attached_probe_count(&self) -> usize {
        self.inner.lock().expect("manager mutex").attacher.attached_count()
    }

    /// Snapshot of attached probe identities (binary, offset, handler).
    pub fn attached_probes(&self) -> Vec<(PathBuf, u64, String)> {
        self.inner
            .lock()
            .expect("manager mutex")
            .attacher
            .attached_keys()
            .map(|k| (k.binary.clone(), k.address, k.probe_fn.clone()))
            .collect()
    }

    /// Snapshot of the shadow key set for a capability map.
    pub fn symaddr_pids(&self, cap: Capability) -> HashSet<u32> {
        self.inner
            .lock()
            .expect("manager mutex")
            .symaddr_maps
            .pids(cap)
            .clone()
    }

    fn run_pass(&self, inner: &mut Inner, view: HashSet<Upid>) {
        // Fold queued mmap notifications into the scheduler first so
        // dirty UPIDs are reconsidered in this very pass.
        while let Some(upid) = self.mmap_events.pop() {
            inner.scheduler.notify_mmap(upid);
        }

        let delta = inner.tracker.update(view);

        // Retract all state for exited pids before anything else in the
        // pass; a recycled pid number must never observe stale records.
        let prev_iteration = inner.scheduler.iteration();
        for upid in &delta.deleted {
            inner
                .symaddr_maps
                .remove_all(inner.backend.as_mut(), upid.pid);
            inner.scheduler.forget(*upid);
            inner.binaries.release_pid(upid.pid, prev_iteration);
        }

        inner.scheduler.begin_pass();

        let mut candidates: Vec<Upid> = delta
            .new
            .iter()
            .chain(delta.retained.iter())
            .copied()
            .collect();
        candidates.sort_unstable();

        let mut attached_total = 0usize;
        for upid in candidates {
            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }
            if inner.disable_self_probing && upid.pid == self.agent_upid.pid {
                continue;
            }
            if !inner.scheduler.eligible(upid) {
                continue;
            }
            let force = inner.scheduler.is_dirty(upid);
            let (outcome, newly_attached) = self.deploy_on_upid(inner, upid, force);
            inner.scheduler.on_pass(upid, outcome);
            attached_total += newly_attached;
        }

        // Binaries with no referencing pids past the grace window lose
        // their probes and cache entries.
        let evicted = inner
            .binaries
            .evict_ready(inner.scheduler.iteration(), EVICTION_GRACE_PASSES);
        if !evicted.is_empty() {
            self.detach_stale_targets(inner);
        }

        if attached_total > 0 {
            info!("deployment pass attached {attached_total} probes");
        }
    }

    fn deploy_on_upid(&self, inner: &mut Inner, upid: Upid, force: bool) -> (PassOutcome, usize) {
        let pid = upid.pid;
        let exe = match self.procfs.exe_path(pid) {
            Ok(p) => p,
            Err(e) => {
                debug!("exe path unavailable for {upid}: {e}");
                return (PassOutcome::TransientFailure, 0);
            }
        };
        let host_exe = match self.mountns.resolve(pid, &exe) {
            Ok(p) => p,
            Err(e) => {
                debug!("mount-ns resolution failed for {upid}: {e}");
                return (PassOutcome::TransientFailure, 0);
            }
        };

        let record = match self.lookup_or_resolve(inner, upid, &host_exe, force) {
            Resolved::Record(r) => r,
            Resolved::Excluded => return (PassOutcome::NoNewWork, 0),
            Resolved::Transient => return (PassOutcome::TransientFailure, 0),
        };
        inner.binaries.add_pid(&host_exe, pid);

        let mut newly_attached = 0usize;
        for cap in Capability::ALL {
            if !record.kinds.contains(app_kind_for(cap)) {
                continue;
            }
            if cap == Capability::GoHttp2 && !inner.enable_http2 {
                continue;
            }
            // A capability whose symaddrs did not resolve is degraded
            // for this binary; its probes would decode garbage.
            let bytes = match record.symaddrs.bytes(cap) {
                Some(b) => b,
                None => continue,
            };

            // Publish before advertise: the symaddr record must be
            // kernel-visible before any probe that reads it can fire.
            if let Err(e) = inner
                .symaddr_maps
                .put(inner.backend.as_mut(), cap, pid, &bytes)
            {
                warn!("symaddr publish failed for pid {pid} {cap}: {e}");
                self.reporter.source_status(
                    SOURCE_CONNECTOR,
                    StatusCode::ResourceUnavailable,
                    &e.to_string(),
                    cap.as_str(),
                );
                continue;
            }

            for probe in record.planned.iter().filter(|p| p.capability == cap) {
                // Go-ness gates return probes per target binary: a
                // dlopen'd libssl inside a Go process is still C code.
                let target_is_go = record.is_go && probe.target == record.exe;
                for &offset in &probe.offsets {
                    if self.shutting_down.load(Ordering::SeqCst) {
                        return (PassOutcome::TransientFailure, newly_attached);
                    }
                    let spec = UProbeSpec {
                        binary_path: probe.target.clone(),
                        symbol: probe.symbol.clone(),
                        address: offset,
                        attach_type: probe.attach_type,
                        probe_fn: probe.probe_fn.clone(),
                    };
                    let info = ProbeInfo {
                        binary: probe.target.display().to_string(),
                        symbol: probe.symbol.clone(),
                        address: offset,
                        pid,
                        attach_type: probe.attach_type.as_str(),
                        probe_fn: probe.probe_fn.clone(),
                    };
                    match inner
                        .attacher
                        .attach(inner.backend.as_mut(), &spec, target_is_go)
                    {
                        Ok(AttachOutcome::Attached(_)) => {
                            newly_attached += 1;
                            self.reporter.probe_status(
                                SOURCE_CONNECTOR,
                                &probe.probe_fn,
                                StatusCode::Ok,
                                "",
                                &info,
                            );
                        }
                        Ok(AttachOutcome::AlreadyAttached) => {}
                        Err(e) => {
                            // Template failures are independent; the
                            // siblings still deploy.
                            self.reporter.probe_status(
                                SOURCE_CONNECTOR,
                                &probe.probe_fn,
                                StatusCode::Internal,
                                &e.to_string(),
                                &info,
                            );
                        }
                    }
                }
            }
        }

        let outcome = if newly_attached > 0 {
            PassOutcome::NewWork
        } else {
            PassOutcome::NoNewWork
        };
        (outcome, newly_attached)
    }

    fn lookup_or_resolve(
        &self,
        inner: &mut Inner,
        upid: Upid,
        host_exe: &Path,
        force: bool,
    ) -> Resolved {
        // Known-unresolvable binaries stay excluded until the file on
        // disk changes identity.
        if let Some(bad) = inner.binaries.unresolvable_identity(host_exe) {
            match inner.resolver.identity(host_exe) {
                Ok(id) if id != bad => inner.binaries.clear_unresolvable(host_exe),
                _ => return Resolved::Excluded,
            }
        }

        if !force {
            if let Some(record) = inner.binaries.get(host_exe) {
                match inner.resolver.identity(host_exe) {
                    Ok(id) if id == record.identity => return Resolved::Record(record),
                    Ok(_) => {
                        warn!("{} changed on disk; re-resolving", host_exe.display());
                        self.evict_binary(inner, host_exe);
                    }
                    Err(_) => return Resolved::Transient,
                }
            }
        }

        let started = Instant::now();
        let budget = Duration::from_millis(self.cfg.probe_attach_timeout_ms);
        match inner.resolver.resolve(upid, host_exe) {
            Ok(record) => {
                if started.elapsed() > budget {
                    warn!(
                        "resolving {} took {:?}, over the {:?} budget",
                        host_exe.display(),
                        started.elapsed(),
                        budget
                    );
                }
                inner
                    .binaries
                    .insert(host_exe.to_path_buf(), record.clone());
                Resolved::Record(record)
            }
            Err(ResolveError::Transient(msg)) => {
                debug!("transient resolution failure for {}: {msg}", host_exe.display());
                Resolved::Transient
            }
            Err(ResolveError::Unresolvable(msg)) => {
                // One probe-status row per binary; after this the
                // binary is excluded until its identity changes.
                let info = ProbeInfo {
                    binary: host_exe.display().to_string(),
                    symbol: String::new(),
                    address: 0,
                    pid: upid.pid,
                    attach_type: "none",
                    probe_fn: String::new(),
                };
                self.reporter.probe_status(
                    SOURCE_CONNECTOR,
                    "binary_resolution",
                    StatusCode::Internal,
                    &msg,
                    &info,
                );
                let identity = inner
                    .resolver
                    .identity(host_exe)
                    .unwrap_or(BinaryIdentity { dev: 0, inode: 0 });
                inner
                    .binaries
                    .mark_unresolvable(host_exe.to_path_buf(), identity);
                Resolved::Excluded
            }
        }
    }

    fn evict_binary(&self, inner: &mut Inner, exe: &Path) {
        inner.binaries.remove(exe);
        self.detach_stale_targets(inner);
    }

    /// Detach probes whose target binary is no longer planned by any
    /// cached resolution (binaries in their grace window still count).
    fn detach_stale_targets(&self, inner: &mut Inner) {
        let live = inner.binaries.live_targets();
        let stale: HashSet<PathBuf> = inner
            .attacher
            .attached_keys()
            .map(|k| k.binary.clone())
            .filter(|b| !live.contains(b))
            .collect();
        for binary in stale {
            let n = inner
                .attacher
                .detach_binary(inner.backend.as_mut(), &binary);
            info!("evicted {}: detached {n} probes", binary.display());
        }
    }
}

enum Resolved {
    Record(Arc<ResolutionRecord>),
    /// Known bad or deliberately skipped; not an error.
    Excluded,
    Transient,
}

/// Interned per-binary resolutions with pid back-references for
/// eviction accounting. Pid→binary is a lookup at deploy time;
/// binary→pid exists only so the last exit starts the grace clock.
#[derive(Default)]
struct BinaryCache {
    entries: HashMap<PathBuf, CacheEntry>,
    unresolvable: HashMap<PathBuf, BinaryIdentity>,
}

struct CacheEntry {
    record: Arc<ResolutionRecord>,
    pids: HashSet<u32>,
    empty_since: Option<u64>,
}

impl BinaryCache {
    fn get(&self, path: &Path) -> Option<Arc<ResolutionRecord>> {
        self.entries.get(path).map(|e| e.record.clone())
    }

    fn insert(&mut self, path: PathBuf, record: Arc<ResolutionRecord>) {
        match self.entries.get_mut(&path) {
            Some(entry) => entry.record = record,
            None => {
                self.entries.insert(
                    path,
                    CacheEntry {
                        record,
                        pids: HashSet::new(),
                        empty_since: None,
                    },
                );
            }
        }
    }

    fn add_pid(&mut self, path: &Path, pid: u32) {
        if let Some(entry) = self.entries.get_mut(path) {
            entry.pids.insert(pid);
            entry.empty_since = None;
        }
    }

    fn release_pid(&mut self, pid: u32, iteration: u64) {
        for entry in self.entries.values_mut() {
            if entry.pids.remove(&pid) && entry.pids.is_empty() {
                entry.empty_since = Some(iteration);
            }
        }
    }

    fn remove(&mut self, path: &Path) {
        self.entries.remove(path);
    }

    fn evict_ready(&mut self, iteration: u64, grace: u64) -> Vec<PathBuf> {
        let ready: Vec<PathBuf> = self
            .entries
            .iter()
            .filter(|(_, e)| matches!(e.empty_since, Some(t) if iteration.saturating_sub(t) >= grace))
            .map(|(p, _)| p.clone())
            .collect();
        for path in &ready {
            self.entries.remove(path);
        }
        ready
    }

    fn live_targets(&self) -> HashSet<PathBuf> {
        self.entries
            .values()
            .flat_map(|e| e.record.planned.iter().map(|p| p.target.clone()))
            .collect()
    }

    fn unresolvable_identity(&self, path: &Path) -> Option<BinaryIdentity> {
        self.unresolvable.get(path).copied()
    }

    fn mark_unresolvable(&mut self, path: PathBuf, identity: BinaryIdentity) {
        self.unresolvable.insert(path, identity);
    }

    fn clear_unresolvable(&mut self, path: &Path) {
        self.unresolvable.remove(path);
    }
}
