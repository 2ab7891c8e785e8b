//! End-to-end deployment scenarios against a fake procfs tree, a fake
//! kernel backend, and canned binary resolutions.

use hookscope::detector::AppKind;
use hookscope::resolver::{
    BinaryIdentity, CapabilitySymAddrs, FakeResolver, PlannedProbe, ResolutionRecord,
};
use hookscope::symaddrs::{
    node_tlswrap_symaddrs_from_version, GoCommonSymAddrs, GoTlsSymAddrs, KernLoc, OpensslSymAddrs,
    LOC_REGISTERS, LOC_STACK,
};
use hookscope::templates::{node_tlswrap_tmpls, GO_RUNTIME_TMPLS, OPENSSL_UPROBES};
use hookscope::{AgentConfig, SemVer, StatusCode, StatusReporter, StatusStream, UProbeManager};
use hookscope_loader::testing::{BackendEvent, SharedFakeBackend};
use hookscope_loader::{AttachType, Capability};
use hookscope_process::{ProcFs, Upid};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const LIBSSL_PATH: &str = "/usr/lib/x86_64-linux-gnu/libssl.so.1.1";

struct Harness {
    manager: Arc<UProbeManager>,
    stream: StatusStream,
    backend: SharedFakeBackend,
    resolver: FakeResolver,
    root: tempfile::TempDir,
}

fn harness() -> Harness {
    harness_with(AgentConfig::with_ceiling(64), false)
}

fn harness_with(cfg: AgentConfig, enable_http2: bool) -> Harness {
    let root = tempfile::tempdir().expect("tempdir");
    let backend = SharedFakeBackend::new();
    let resolver = FakeResolver::new();
    let procfs = ProcFs::with_root(root.path());
    let agent_upid = Upid::new(1, 999_999, 1);
    let (reporter, stream) = StatusReporter::channel(agent_upid, 1024);
    let manager = Arc::new(UProbeManager::new(
        cfg,
        agent_upid,
        procfs,
        Box::new(backend.clone()),
        Box::new(resolver.clone()),
        reporter,
    ));
    manager.init(enable_http2, true);
    Harness {
        manager,
        stream,
        backend,
        resolver,
        root,
    }
}

impl Harness {
    /// Create a fake procfs entry for `pid` running `exe`, and return
    /// the canonical host path the manager will resolve the exe to.
    fn add_process(&self, pid: u32, exe: &str) -> PathBuf {
        let pid_dir = self.root.path().join(pid.to_string());
        fs::create_dir_all(pid_dir.join("ns")).expect("mkdir");
        let _ = std::os::unix::fs::symlink("mnt:[4026531840]", pid_dir.join("ns").join("mnt"));
        fs::write(
            pid_dir.join("stat"),
            format!(
                "{pid} (svc) S 1 1 1 0 -1 0 0 0 0 0 0 0 0 0 20 0 1 0 77 0 0 0 0 0 0 0 0 0 0 0 0 0 17 1 0 0 0 0 0"
            ),
        )
        .expect("stat");
        let _ = std::os::unix::fs::symlink(exe, pid_dir.join("exe"));

        let host = pid_dir.join("root").join(exe.trim_start_matches('/'));
        fs::create_dir_all(host.parent().expect("parent")).expect("mkdir root");
        fs::write(&host, b"\x7fELF").expect("exe file");
        host.canonicalize().expect("canonicalize")
    }

    fn deploy(&self, upids: &[Upid]) {
        self.manager.deploy(upids.iter().copied().collect());
    }

    fn attach_specs(&self) -> Vec<hookscope_loader::UProbeSpec> {
        self.backend.lock().attached.values().cloned().collect()
    }
}

fn sample_go_common() -> GoCommonSymAddrs {
    GoCommonSymAddrs {
        internal_syscall_conn: -1,
        tls_conn: 0x4000,
        net_tcp_conn: 0x4100,
        fd_sysfd_offset: 16,
        tls_conn_conn_offset: 0,
        syscall_conn_conn_offset: -1,
        g_goid_offset: 152,
        casgstatus_gp_loc: KernLoc {
            kind: LOC_REGISTERS,
            offset: 0,
        },
        casgstatus_newval_loc: KernLoc {
            kind: LOC_REGISTERS,
            offset: 1,
        },
    }
}

fn sample_go_tls() -> GoTlsSymAddrs {
    let stack = |offset| KernLoc {
        kind: LOC_STACK,
        offset,
    };
    GoTlsSymAddrs {
        write_c_loc: stack(8),
        write_b_loc: stack(16),
        write_retval0_loc: stack(40),
        write_retval1_loc: stack(48),
        read_c_loc: stack(8),
        read_b_loc: stack(16),
        read_retval0_loc: stack(40),
        read_retval1_loc: stack(48),
    }
}

fn empty_record(exe: &Path) -> ResolutionRecord {
    ResolutionRecord {
        exe: exe.to_path_buf(),
        identity: BinaryIdentity { dev: 1, inode: 100 },
        kinds: hookscope::AppKinds::new(),
        is_go: false,
        planned: vec![],
        symaddrs: CapabilitySymAddrs::default(),
    }
}

/// Record for a plain process with libssl mapped: the five OpenSSL
/// probes on the shared library.
fn openssl_record(exe: &Path) -> ResolutionRecord {
    let target = PathBuf::from(LIBSSL_PATH);
    let planned = OPENSSL_UPROBES
        .iter()
        .map(|t| PlannedProbe {
            capability: Capability::Openssl,
            target: target.clone(),
            symbol: t.symbol.to_string(),
            attach_type: t.attach_type,
            probe_fn: t.probe_fn.to_string(),
            offsets: vec![match t.symbol {
                "SSL_write" => 0x1000,
                "SSL_read" => 0x2000,
                _ => 0x3000,
            }],
        })
        .collect();
    ResolutionRecord {
        exe: exe.to_path_buf(),
        identity: BinaryIdentity { dev: 1, inode: 100 },
        kinds: [AppKind::OpensslDynlib].into_iter().collect(),
        is_go: false,
        planned,
        symaddrs: CapabilitySymAddrs {
            openssl: Some(OpensslSymAddrs {
                ssl_rbio_offset: 0x10,
                rbio_num_offset: 0x30,
            }),
            ..Default::default()
        },
    }
}

/// Go binary with crypto/tls: entry probes plus per-ret-instruction
/// return probes on (*Conn).Write (three rets) and (*Conn).Read.
fn go_tls_record(exe: &Path) -> ResolutionRecord {
    let mut planned = vec![PlannedProbe {
        capability: Capability::GoCommon,
        target: exe.to_path_buf(),
        symbol: "runtime.casgstatus".to_string(),
        attach_type: AttachType::Entry,
        probe_fn: GO_RUNTIME_TMPLS[0].probe_fn.to_string(),
        offsets: vec![0x5000],
    }];
    planned.extend([
        PlannedProbe {
            capability: Capability::GoTls,
            target: exe.to_path_buf(),
            symbol: "crypto/tls.(*Conn).Write".to_string(),
            attach_type: AttachType::Entry,
            probe_fn: "probe_entry_tls_conn_write".to_string(),
            offsets: vec![0x100],
        },
        PlannedProbe {
            capability: Capability::GoTls,
            target: exe.to_path_buf(),
            symbol: "crypto/tls.(*Conn).Write".to_string(),
            attach_type: AttachType::ReturnInsts,
            probe_fn: "probe_return_tls_conn_write".to_string(),
            offsets: vec![0x1a2, 0x1f4, 0x233],
        },
        PlannedProbe {
            capability: Capability::GoTls,
            target: exe.to_path_buf(),
            symbol: "crypto/tls.(*Conn).Read".to_string(),
            attach_type: AttachType::Entry,
            probe_fn: "probe_entry_tls_conn_read".to_string(),
            offsets: vec![0x300],
        },
        PlannedProbe {
            capability: Capability::GoTls,
            target: exe.to_path_buf(),
            symbol: "crypto/tls.(*Conn).Read".to_string(),
            attach_type: AttachType::ReturnInsts,
            probe_fn: "probe_return_tls_conn_read".to_string(),
            offsets: vec![0x3a2],
        },
    ]);
    ResolutionRecord {
        exe: exe.to_path_buf(),
        identity: BinaryIdentity { dev: 1, inode: 200 },
        kinds: [AppKind::GoRuntime, AppKind::GoTls].into_iter().collect(),
        is_go: true,
        planned,
        symaddrs: CapabilitySymAddrs {
            go_common: Some(sample_go_common()),
            go_tls: Some(sample_go_tls()),
            ..Default::default()
        },
    }
}

/// Node executable: the six TLSWrap member-function probes for the
/// given version's mangling.
fn node_record(exe: &Path, ver: SemVer) -> ResolutionRecord {
    let tmpls = node_tlswrap_tmpls(ver).expect("supported node version");
    let planned = tmpls
        .iter()
        .enumerate()
        .map(|(i, t)| PlannedProbe {
            capability: Capability::NodeTlsWrap,
            target: exe.to_path_buf(),
            symbol: t.symbol.to_string(),
            attach_type: t.attach_type,
            probe_fn: t.probe_fn.to_string(),
            offsets: vec![0x6000 + (i as u64 / 2) * 0x40],
        })
        .collect();
    ResolutionRecord {
        exe: exe.to_path_buf(),
        identity: BinaryIdentity { dev: 1, inode: 300 },
        kinds: [AppKind::NodejsStaticOpenssl].into_iter().collect(),
        is_go: false,
        planned,
        symaddrs: CapabilitySymAddrs {
            node_tlswrap: Some(
                node_tlswrap_symaddrs_from_version(ver).expect("version table entry"),
            ),
            ..Default::default()
        },
    }
}

//-----------------------------------------------------------------------------
// End-to-end scenarios
//-----------------------------------------------------------------------------

#[test]
fn test_openssl_dynlib_attach() {
    let h = harness();
    let exe = h.add_process(12345, "/app/service");
    h.resolver.put(openssl_record(&exe));
    let upid = Upid::new(1, 12345, 7_700_000);

    h.deploy(&[upid]);

    let rows = h.stream.drain_probe();
    let ok_tracepoints: HashSet<&str> = rows
        .iter()
        .filter(|r| r.status == StatusCode::Ok)
        .map(|r| r.tracepoint.as_str())
        .collect();
    let expected: HashSet<&str> = [
        "probe_entry_SSL_write",
        "probe_ret_SSL_write",
        "probe_entry_SSL_read",
        "probe_ret_SSL_read",
        "probe_ret_SSL_new",
    ]
    .into_iter()
    .collect();
    assert_eq!(ok_tracepoints, expected);

    // The openssl symaddr map carries the pid, both in the kernel view
    // and the shadow set.
    assert!(h.manager.symaddr_pids(Capability::Openssl).contains(&12345));
    assert!(h.backend.lock().maps[&Capability::Openssl].contains_key(&12345));

    // info_json carries the operator contract fields.
    let row = rows
        .iter()
        .find(|r| r.tracepoint == "probe_entry_SSL_write")
        .expect("row present");
    let info: serde_json::Value = serde_json::from_str(&row.info_json).expect("valid json");
    assert_eq!(info["binary"], LIBSSL_PATH);
    assert_eq!(info["pid"], 12345);
    assert_eq!(info["type"], "entry");
}

#[test]
fn test_uprobe_miss_emits_nothing() {
    let h = harness();
    let exe = h.add_process(2222, "/app/plain");
    h.resolver.put(empty_record(&exe));

    h.deploy(&[Upid::new(1, 2222, 50)]);

    assert!(h.stream.drain_probe().is_empty());
    let source_rows = h.stream.drain_source();
    assert_eq!(source_rows.len(), 1);
    assert_eq!(source_rows[0].status, StatusCode::Ok);
    assert_eq!(source_rows[0].context, "init");
    assert!(h.backend.lock().attached.is_empty());
}

#[test]
fn test_go_tls_per_ret_instruction_probes() {
    let h = harness();
    let exe = h.add_process(3333, "/app/server");
    h.resolver.put(go_tls_record(&exe));

    h.deploy(&[Upid::new(1, 3333, 60)]);

    let specs = h.attach_specs();
    let write_rets: Vec<_> = specs
        .iter()
        .filter(|s| s.probe_fn == "probe_return_tls_conn_write")
        .collect();
    assert_eq!(write_rets.len(), 3);
    let offsets: HashSet<u64> = write_rets.iter().map(|s| s.address).collect();
    assert_eq!(offsets, [0x1a2, 0x1f4, 0x233].into_iter().collect());
    assert!(write_rets
        .iter()
        .all(|s| s.attach_type == AttachType::ReturnInsts));

    let write_entries: Vec<_> = specs
        .iter()
        .filter(|s| s.probe_fn == "probe_entry_tls_conn_write")
        .collect();
    assert_eq!(write_entries.len(), 1);
    assert_eq!(write_entries[0].attach_type, AttachType::Entry);
}

#[test]
fn test_epilogue_return_rejected_on_go() {
    let h = harness();
    let exe = h.add_process(3434, "/app/badplan");
    let mut record = go_tls_record(&exe);
    record.planned = vec![PlannedProbe {
        capability: Capability::GoTls,
        target: exe.clone(),
        symbol: "crypto/tls.(*Conn).Write".to_string(),
        attach_type: AttachType::Return,
        probe_fn: "probe_bad_return".to_string(),
        offsets: vec![0x100],
    }];
    h.resolver.put(record);

    h.deploy(&[Upid::new(1, 3434, 61)]);

    assert!(h.backend.lock().attached.is_empty());
    let rows = h.stream.drain_probe();
    let row = rows
        .iter()
        .find(|r| r.tracepoint == "probe_bad_return")
        .expect("rejection row");
    assert_eq!(row.status, StatusCode::Internal);
    assert!(row.error_message.contains("refusing epilogue return probe"));
}

#[test]
fn test_node_version_split() {
    let h = harness();
    let exe12 = h.add_process(1212, "/usr/bin/node12");
    let exe15 = h.add_process(1515, "/usr/bin/node15");
    h.resolver.put(node_record(&exe12, SemVer::new(12, 3, 1)));
    h.resolver.put(node_record(&exe15, SemVer::new(15, 0, 0)));

    h.deploy(&[Upid::new(1, 1212, 10), Upid::new(1, 1515, 20)]);

    let specs = h.attach_specs();
    let on12: Vec<_> = specs.iter().filter(|s| s.binary_path == exe12).collect();
    let on15: Vec<_> = specs.iter().filter(|s| s.binary_path == exe15).collect();

    assert_eq!(on12.len(), 6);
    assert!(on12
        .iter()
        .all(|s| s.symbol.starts_with("_ZN4node7TLSWrap")));

    assert_eq!(on15.len(), 6);
    assert!(on15
        .iter()
        .all(|s| s.symbol.starts_with("_ZN4node6crypto7TLSWrap")));

    assert!(h.manager.symaddr_pids(Capability::NodeTlsWrap).contains(&1212));
    assert!(h.manager.symaddr_pids(Capability::NodeTlsWrap).contains(&1515));
}

#[test]
fn test_backoff_then_dlopen_rescan() {
    let h = harness();
    let exe = h.add_process(4242, "/app/latebind");
    h.resolver.put(empty_record(&exe));
    let upid = Upid::new(1, 4242, 99);

    // Pass 1: examined, nothing to do; multiplier doubles to 2.
    h.deploy(&[upid]);
    assert_eq!(h.manager.rescan_multiplier(upid), Some(2));

    // Pass 2: backed off (not examined). Pass 3: examined, still
    // nothing; multiplier doubles to 4.
    h.deploy(&[upid]);
    assert_eq!(h.manager.rescan_multiplier(upid), Some(2));
    h.deploy(&[upid]);
    assert_eq!(h.manager.rescan_multiplier(upid), Some(4));
    assert!(h.backend.lock().attached.is_empty());

    // dlopen of libssl: the mmap notification forces the next pass to
    // reconsider and re-resolve regardless of backoff.
    h.resolver.put(openssl_record(&exe));
    h.manager.notify_mmap(upid);
    h.deploy(&[upid]);

    assert_eq!(h.backend.lock().attached.len(), 5);
    assert!(h.manager.symaddr_pids(Capability::Openssl).contains(&4242));
    assert_eq!(h.manager.rescan_multiplier(upid), Some(1));
}

#[test]
fn test_faulty_source_connector_init() {
    let (reporter, stream) = StatusReporter::channel(Upid::new(1, 1, 1), 64);
    let mut registry = hookscope::SourceRegistry::new();
    registry.register("seq_gen", || Ok(()));
    registry.register("faulty_connector", || {
        anyhow::bail!("Initialization failed on purpose.")
    });
    registry.register("tls_tracer", || Ok(()));

    registry.init_all(&reporter);

    let rows = stream.drain_source();
    assert_eq!(rows.len(), 3);
    let faulty: Vec<_> = rows
        .iter()
        .filter(|r| r.status == StatusCode::Internal)
        .collect();
    assert_eq!(faulty.len(), 1);
    assert_eq!(faulty[0].source_connector, "faulty_connector");
    assert_eq!(faulty[0].error_message, "Initialization failed on purpose.");
    assert!(rows
        .iter()
        .filter(|r| r.source_connector != "faulty_connector")
        .all(|r| r.status == StatusCode::Ok));
}

//-----------------------------------------------------------------------------
// Invariants
//-----------------------------------------------------------------------------

#[test]
fn test_deploy_is_idempotent() {
    let h = harness();
    let exe = h.add_process(12345, "/app/service");
    h.resolver.put(openssl_record(&exe));
    let upid = Upid::new(1, 12345, 7);

    h.deploy(&[upid]);
    let first_probes: HashSet<_> = h.manager.attached_probes().into_iter().collect();
    let attach_events_after_first = h
        .backend
        .lock()
        .events
        .iter()
        .filter(|e| matches!(e, BackendEvent::Attach { .. }))
        .count();

    h.deploy(&[upid]);
    h.deploy(&[upid]);

    let final_probes: HashSet<_> = h.manager.attached_probes().into_iter().collect();
    assert_eq!(first_probes, final_probes);

    let backend = h.backend.lock();
    let attach_events = backend
        .events
        .iter()
        .filter(|e| matches!(e, BackendEvent::Attach { .. }))
        .count();
    assert_eq!(attach_events, attach_events_after_first);
    assert!(!backend
        .events
        .iter()
        .any(|e| matches!(e, BackendEvent::Detach { .. })));
}

#[test]
fn test_publish_before_advertise() {
    let h = harness();
    let exe = h.add_process(12345, "/app/service");
    h.resolver.put(openssl_record(&exe));

    h.deploy(&[Upid::new(1, 12345, 7)]);

    let backend = h.backend.lock();
    let publish_idx = backend
        .events
        .iter()
        .position(|e| {
            matches!(e, BackendEvent::MapUpdate { cap: Capability::Openssl, pid: 12345 })
        })
        .expect("symaddr publish happened");
    let first_attach_idx = backend
        .events
        .iter()
        .position(|e| matches!(e, BackendEvent::Attach { .. }))
        .expect("attach happened");
    assert!(
        publish_idx < first_attach_idx,
        "symaddr record must be kernel-visible before any probe attaches"
    );
}

#[test]
fn test_shadow_set_matches_kernel_maps() {
    let h = harness();
    let exe_a = h.add_process(100, "/app/a");
    let exe_b = h.add_process(200, "/app/b");
    h.resolver.put(openssl_record(&exe_a));
    let mut record_b = go_tls_record(&exe_b);
    record_b.identity = BinaryIdentity { dev: 1, inode: 999 };
    h.resolver.put(record_b);

    let ua = Upid::new(1, 100, 1);
    let ub = Upid::new(1, 200, 2);
    h.deploy(&[ua, ub]);

    // Drop one process; its keys must retract everywhere.
    h.deploy(&[ua]);

    let backend = h.backend.lock();
    for cap in Capability::ALL {
        let kernel: HashSet<u32> = backend.maps[&cap].keys().copied().collect();
        assert_eq!(
            kernel,
            h.manager.symaddr_pids(cap),
            "shadow set diverged for {cap}"
        );
    }
    assert!(!backend.maps[&Capability::GoTls].contains_key(&200));
}

#[test]
fn test_pid_reuse_retracts_before_recreating() {
    let h = harness();
    let exe = h.add_process(500, "/app/service");
    h.resolver.put(openssl_record(&exe));

    let old = Upid::new(1, 500, 1_000);
    let reused = Upid::new(1, 500, 9_000);

    h.deploy(&[old]);
    let marker = h.backend.lock().events.len();

    // Same pid number, new start time: the old UPID's state must be
    // retracted before the new UPID's state is created.
    h.deploy(&[reused]);

    let backend = h.backend.lock();
    let tail = &backend.events[marker..];
    let delete_idx = tail
        .iter()
        .position(|e| matches!(e, BackendEvent::MapDelete { pid: 500, .. }))
        .expect("old pid retracted");
    let update_idx = tail
        .iter()
        .position(|e| matches!(e, BackendEvent::MapUpdate { pid: 500, .. }))
        .expect("new pid published");
    assert!(delete_idx < update_idx);
}

#[test]
fn test_attach_failure_does_not_abort_siblings() {
    let h = harness();
    let exe = h.add_process(600, "/app/service");
    h.resolver.put(openssl_record(&exe));
    h.backend
        .lock()
        .fail_attach
        .insert("probe_entry_SSL_write".to_string());

    h.deploy(&[Upid::new(1, 600, 5)]);

    assert_eq!(h.backend.lock().attached.len(), 4);
    let rows = h.stream.drain_probe();
    let failed: Vec<_> = rows
        .iter()
        .filter(|r| r.status == StatusCode::Internal)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].tracepoint, "probe_entry_SSL_write");
    assert_eq!(
        rows.iter().filter(|r| r.status == StatusCode::Ok).count(),
        4
    );
}

#[test]
fn test_map_write_failure_degrades_capability_only() {
    let h = harness();
    let exe = h.add_process(700, "/app/mixed");
    let mut record = go_tls_record(&exe);
    // Also speaks TLS through a mapped libssl.
    let openssl = openssl_record(&exe);
    record.planned.extend(openssl.planned);
    record.symaddrs.openssl = openssl.symaddrs.openssl;
    let mut kinds: Vec<AppKind> = record.kinds.iter().collect();
    kinds.push(AppKind::OpensslDynlib);
    record.kinds = kinds.into_iter().collect();
    h.resolver.put(record);

    h.backend
        .lock()
        .fail_map_update
        .insert(Capability::Openssl);

    h.deploy(&[Upid::new(1, 700, 5)]);

    let backend = h.backend.lock();
    // The openssl capability degraded: no SSL probes, no map entry.
    assert!(!backend
        .attached
        .values()
        .any(|s| s.probe_fn.contains("SSL")));
    assert!(backend.maps[&Capability::Openssl].is_empty());
    // Go capabilities were unaffected.
    assert!(backend
        .attached
        .values()
        .any(|s| s.probe_fn == "probe_entry_tls_conn_write"));
    drop(backend);

    let source_rows = h.stream.drain_source();
    assert!(source_rows
        .iter()
        .any(|r| r.status == StatusCode::ResourceUnavailable && r.context == "openssl"));
}

#[test]
fn test_binary_change_evicts_and_reattaches() {
    let h = harness();
    let exe = h.add_process(800, "/app/service");
    h.resolver.put(openssl_record(&exe));
    let upid = Upid::new(1, 800, 5);

    h.deploy(&[upid]);
    assert_eq!(h.backend.lock().attached.len(), 5);

    // The binary is replaced on disk (new inode), with new offsets.
    let mut replacement = openssl_record(&exe);
    replacement.identity = BinaryIdentity { dev: 1, inode: 101 };
    for probe in &mut replacement.planned {
        for off in &mut probe.offsets {
            *off += 0x10;
        }
    }
    h.resolver.put(replacement);

    h.deploy(&[upid]);

    let backend = h.backend.lock();
    let detaches = backend
        .events
        .iter()
        .filter(|e| matches!(e, BackendEvent::Detach { .. }))
        .count();
    assert_eq!(detaches, 5, "stale probes detached");
    assert_eq!(backend.attached.len(), 5, "fresh probes attached");
    assert!(backend.attached.values().all(|s| s.address >= 0x1010));
}

#[test]
fn test_unresolvable_binary_reports_once() {
    let h = harness();
    h.add_process(900, "/app/broken");
    // Nothing canned in the resolver: resolution is Unresolvable.
    let upid = Upid::new(1, 900, 5);

    h.deploy(&[upid]);
    h.deploy(&[upid]);
    h.deploy(&[upid]);

    let rows = h.stream.drain_probe();
    let resolution_errors: Vec<_> = rows
        .iter()
        .filter(|r| r.tracepoint == "binary_resolution")
        .collect();
    assert_eq!(resolution_errors.len(), 1, "one status row per binary");
    assert_eq!(resolution_errors[0].status, StatusCode::Internal);
}

#[test]
fn test_self_probing_skipped() {
    let h = harness();
    // The agent's own pid needs no procfs entry; it is skipped before
    // any read happens.
    h.deploy(&[Upid::new(1, 999_999, 1)]);
    assert!(h.backend.lock().events.is_empty());
    assert!(h.stream.drain_probe().is_empty());
}

#[test]
fn test_deploy_thread_counter() {
    let h = harness();
    let exe = h.add_process(12345, "/app/service");
    h.resolver.put(openssl_record(&exe));

    let handle = h
        .manager
        .run_deploy_thread([Upid::new(1, 12345, 7)].into_iter().collect());
    handle.join().expect("deploy thread");

    assert!(!h.manager.threads_running());
    assert_eq!(h.manager.attached_probe_count(), 5);
}

#[test]
fn test_shutdown_detaches_everything() {
    let h = harness();
    let exe = h.add_process(12345, "/app/service");
    h.resolver.put(openssl_record(&exe));
    h.deploy(&[Upid::new(1, 12345, 7)]);
    assert_eq!(h.manager.attached_probe_count(), 5);

    h.manager.shutdown();

    assert_eq!(h.manager.attached_probe_count(), 0);
    assert!(h.backend.lock().attached.is_empty());
}

#[test]
fn test_pid_exit_keeps_probes_but_clears_maps() {
    let h = harness();
    let exe = h.add_process(12345, "/app/service");
    h.resolver.put(openssl_record(&exe));
    let upid = Upid::new(1, 12345, 7);

    h.deploy(&[upid]);
    // Process exits; probes stay (the binary may come back) but the
    // pid's symaddr records are gone immediately.
    h.deploy(&[]);

    assert_eq!(h.manager.attached_probe_count(), 5);
    assert!(h.manager.symaddr_pids(Capability::Openssl).is_empty());

    // Two more empty passes pass the grace window; eviction detaches.
    h.deploy(&[]);
    h.deploy(&[]);
    assert_eq!(h.manager.attached_probe_count(), 0);
}
