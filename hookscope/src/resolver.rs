use crate::detector::{self, AppKind, AppKinds, Detection, ElfSummary, NODE_SYMBOL_PREFIX};
use crate::semver::SemVer;
use crate::symaddrs::{
    go_common_symaddrs, go_http2_symaddrs, go_tls_symaddrs, node_tlswrap_symaddrs,
    openssl_symaddrs, GoCommonSymAddrs, GoHttp2SymAddrs, GoTlsSymAddrs, NodeTlsWrapSymAddrs,
    OpensslSymAddrs,
};
use crate::templates::{
    node_tlswrap_tmpls, UProbeTmpl, GO_HTTP2_TMPLS, GO_RUNTIME_TMPLS, GO_TLS_TMPLS,
    OPENSSL_UPROBES,
};
use hookscope_binary::{BinaryError, DwarfReader, ElfReader};
use hookscope_loader::{AttachType, Capability};
use hookscope_process::{MountNsResolver, ProcFs, ProcessError, Upid};
use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Filesystem identity of a binary; a changed identity means the file
/// was replaced and every cached resolution for it is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryIdentity {
    pub dev: u64,
    pub inode: u64,
}

/// One resolved attachment plan: a handler bound to a symbol at one or
/// more concrete file offsets in a target binary. ReturnInsts plans
/// carry one offset per ret instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedProbe {
    pub capability: Capability,
    pub target: PathBuf,
    pub symbol: String,
    pub attach_type: AttachType,
    pub probe_fn: String,
    pub offsets: Vec<u64>,
}

/// Resolved symaddr records, one slot per capability. A `None` slot
/// means the capability degraded during resolution and must not be
/// deployed for this binary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilitySymAddrs {
    pub openssl: Option<OpensslSymAddrs>,
    pub go_common: Option<GoCommonSymAddrs>,
    pub go_http2: Option<GoHttp2SymAddrs>,
    pub go_tls: Option<GoTlsSymAddrs>,
    pub node_tlswrap: Option<NodeTlsWrapSymAddrs>,
}

impl CapabilitySymAddrs {
    /// Byte view of the record for a capability, ready for the kernel
    /// map. `None` when the capability is absent for this binary.
    pub fn bytes(&self, cap: Capability) -> Option<Vec<u8>> {
        match cap {
            Capability::Openssl => self.openssl.map(|r| bytemuck::bytes_of(&r).to_vec()),
            Capability::GoCommon => self.go_common.map(|r| bytemuck::bytes_of(&r).to_vec()),
            Capability::GoHttp2 => self.go_http2.map(|r| bytemuck::bytes_of(&r).to_vec()),
            Capability::GoTls => self.go_tls.map(|r| bytemuck::bytes_of(&r).to_vec()),
            Capability::NodeTlsWrap => self.node_tlswrap.map(|r| bytemuck::bytes_of(&r).to_vec()),
        }
    }
}

/// Everything the orchestrator needs to deploy on one binary.
/// Immutable once built; shared by every pid running the binary.
#[derive(Debug, Clone)]
pub struct ResolutionRecord {
    pub exe: PathBuf,
    pub identity: BinaryIdentity,
    pub kinds: AppKinds,
    pub is_go: bool,
    pub planned: Vec<PlannedProbe>,
    pub symaddrs: CapabilitySymAddrs,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    /// Momentary failure (binary vanished mid-read, procfs race).
    /// Retried on the next pass without status noise.
    #[error("transient resolution failure: {0}")]
    Transient(String),

    /// The binary cannot be resolved as-is (not ELF, mandatory symbols
    /// missing). Excluded from future passes until its identity
    /// changes.
    #[error("unresolvable binary: {0}")]
    Unresolvable(String),
}

pub type ResolveResult<T> = std::result::Result<T, ResolveError>;

/// Resolution seam between the orchestrator and the ELF/DWARF stack.
pub trait BinaryResolver: Send {
    fn identity(&self, path: &Path) -> ResolveResult<BinaryIdentity>;
    fn resolve(&self, upid: Upid, exe: &Path) -> ResolveResult<Arc<ResolutionRecord>>;
}

/// Production resolver: reads the target's mapped libraries through
/// procfs, classifies the binary, and resolves offsets with the
/// ELF/DWARF readers.
#[derive(Debug)]
pub struct HostResolver {
    procfs: ProcFs,
    mountns: MountNsResolver,
    enable_http2: bool,
}

impl HostResolver {
    pub fn new(procfs: ProcFs, enable_http2: bool) -> Self {
        let mountns = MountNsResolver::new(procfs.clone());
        Self {
            procfs,
            mountns,
            enable_http2,
        }
    }

    fn detect(&self, upid: Upid, exe: &Path, elf: &ElfReader) -> ResolveResult<Detection> {
        let summary = ElfSummary {
            is_go: elf.is_go_binary(),
            go_version: elf.go_version(),
            has_node_symbols: elf.has_symbol_prefix(NODE_SYMBOL_PREFIX),
            has_http2_symbols: elf.has_go_package("golang.org/x/net/http2.")
                || elf.has_go_package("net/http.(*http2Framer)"),
            has_go_tls_symbols: elf.has_go_package("crypto/tls.(*Conn)"),
        };

        let mapped: Vec<String> = self
            .procfs
            .map_paths(upid.pid)
            .map_err(|e| match e {
                ProcessError::ProcessNotFound(_) => {
                    ResolveError::Transient(format!("pid {} exited", upid.pid))
                }
                other => ResolveError::Transient(other.to_string()),
            })?
            .into_iter()
            .collect();

        let node_version = if summary.has_node_symbols {
            node_version_of(exe)
        } else {
            None
        };

        Ok(detector::detect(&summary, &mapped, node_version))
    }

    fn plan_openssl(
        &self,
        upid: Upid,
        libssl_path: &str,
        record: &mut RecordBuilder,
    ) -> ResolveResult<()> {
        let host_libssl = self
            .mountns
            .resolve(upid.pid, Path::new(libssl_path))
            .map_err(|e| ResolveError::Transient(e.to_string()))?;

        let lib_elf = open_elf(&host_libssl)?;
        record.symaddrs.openssl = match openssl_symaddrs(libssl_path) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("openssl symaddrs failed for {libssl_path}: {e}");
                return Ok(());
            }
        };
        record.plan_templates(
            Capability::Openssl,
            &host_libssl,
            &lib_elf,
            &OPENSSL_UPROBES,
        );
        Ok(())
    }

    fn plan_node(&self, exe: &Path, elf: &ElfReader, ver: SemVer, record: &mut RecordBuilder) {
        let tmpls = match node_tlswrap_tmpls(ver) {
            Some(t) => t,
            None => {
                warn!("node {ver} predates the supported TLSWrap layouts");
                return;
            }
        };
        // Debug builds of node carry DWARF; release builds fall back to
        // the per-version offset table.
        let dwarf = DwarfReader::open(exe).ok();
        record.symaddrs.node_tlswrap = match node_tlswrap_symaddrs(dwarf.as_ref(), ver) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("node tlswrap symaddrs failed: {e}");
                return;
            }
        };
        // The statically linked OpenSSL inside the node executable gets
        // the same SSL_* probes as a dynamic libssl would.
        record.plan_templates(Capability::NodeTlsWrap, exe, elf, &OPENSSL_UPROBES);
        record.plan_templates(Capability::NodeTlsWrap, exe, elf, tmpls.as_slice());
    }

    fn plan_go(
        &self,
        exe: &Path,
        elf: &ElfReader,
        detection: &Detection,
        record: &mut RecordBuilder,
    ) {
        // The DWARF reader is memory-hungry; only Go binaries reach it,
        // and stripped ones degrade to no Go capabilities at all.
        let dwarf = match DwarfReader::open(exe) {
            Ok(d) => d,
            Err(BinaryError::NoDebugInfo) => {
                info!("{} has no debug info; skipping Go probes", exe.display());
                return;
            }
            Err(e) => {
                warn!("DWARF open failed for {}: {e}", exe.display());
                return;
            }
        };

        match go_common_symaddrs(elf, &dwarf) {
            Ok(s) => {
                record.symaddrs.go_common = Some(s);
                record.plan_templates(Capability::GoCommon, exe, elf, &GO_RUNTIME_TMPLS);
            }
            Err(e) => {
                debug!("{}: go common symaddrs unavailable: {e}", exe.display());
                // Without the common symaddrs (TCPConn, Sysfd) no Go
                // capability can decode anything.
                return;
            }
        }

        if detection.kinds.contains(AppKind::GoTls) {
            match go_tls_symaddrs(&dwarf, detection.go_version) {
                Ok(s) => {
                    record.symaddrs.go_tls = Some(s);
                    record.plan_templates(Capability::GoTls, exe, elf, &GO_TLS_TMPLS);
                }
                Err(e) => debug!("{}: go tls symaddrs unavailable: {e}", exe.display()),
            }
        }

        if self.enable_http2 && detection.kinds.contains(AppKind::GoHttp2) {
            match go_http2_symaddrs(elf, &dwarf) {
                Ok(s) => {
                    record.symaddrs.go_http2 = Some(s);
                    record.plan_templates(Capability::GoHttp2, exe, elf, &GO_HTTP2_TMPLS);
                }
                Err(e) => debug!("{}: go http2 symaddrs unavailable: {e}", exe.display()),
            }
        }
    }
}

impl BinaryResolver for HostResolver {
    fn identity(&self, path: &Path) -> ResolveResult<BinaryIdentity> {
        let meta = std::fs::metadata(path)
            .map_err(|e| ResolveError::Transient(format!("{}: {e}", path.display())))?;
        Ok(BinaryIdentity {
            dev: meta.dev(),
            inode: meta.ino(),
        })
    }

    fn resolve(&self, upid: Upid, exe: &Path) -> ResolveResult<Arc<ResolutionRecord>> {
        let identity = self.identity(exe)?;
        let elf = open_elf(exe)?;
        let detection = self.detect(upid, exe, &elf)?;

        let mut builder = RecordBuilder::default();
        if let (true, Some(libssl)) = (
            detection.kinds.contains(AppKind::OpensslDynlib),
            detection.libssl_path.as_deref(),
        ) {
            self.plan_openssl(upid, libssl, &mut builder)?;
        }
        if detection.kinds.contains(AppKind::NodejsStaticOpenssl) {
            if let Some(ver) = detection.node_version {
                self.plan_node(exe, &elf, ver, &mut builder);
            }
        }
        if detection.kinds.contains(AppKind::GoRuntime) {
            self.plan_go(exe, &elf, &detection, &mut builder);
        }

        for rejection in &detection.rejections {
            debug!(
                "{}: {} not detected: {}",
                exe.display(),
                rejection.kind.as_str(),
                rejection.reason
            );
        }

        Ok(Arc::new(ResolutionRecord {
            exe: exe.to_path_buf(),
            identity,
            kinds: detection.kinds,
            is_go: detection.go_version.is_some() || elf.is_go_binary(),
            planned: builder.planned,
            symaddrs: builder.symaddrs,
        }))
    }
}

#[derive(Debug, Default)]
struct RecordBuilder {
    planned: Vec<PlannedProbe>,
    symaddrs: CapabilitySymAddrs,
}

impl RecordBuilder {
    /// Resolve a template group against a binary: every matching
    /// symbol yields one plan, with ReturnInsts templates fanning out
    /// to every ret instruction.
    fn plan_templates(
        &mut self,
        capability: Capability,
        target: &Path,
        elf: &ElfReader,
        tmpls: &[UProbeTmpl],
    ) {
        for tmpl in tmpls {
            for sym in elf.list_symbols(tmpl.symbol, tmpl.match_type) {
                let offsets = match tmpl.attach_type {
                    AttachType::Entry | AttachType::Return => match elf.entry_offset(sym) {
                        Ok(off) => vec![off],
                        Err(e) => {
                            warn!("entry offset failed for {}: {e}", sym.name);
                            continue;
                        }
                    },
                    AttachType::ReturnInsts => match elf.ret_inst_offsets(sym) {
                        Ok(offs) => offs,
                        Err(e) => {
                            warn!("ret scan failed for {}: {e}", sym.name);
                            continue;
                        }
                    },
                };
                self.planned.push(PlannedProbe {
                    capability,
                    target: target.to_path_buf(),
                    symbol: sym.name.clone(),
                    attach_type: tmpl.attach_type,
                    probe_fn: tmpl.probe_fn.to_string(),
                    offsets,
                });
            }
        }
    }
}

fn open_elf(path: &Path) -> ResolveResult<ElfReader> {
    ElfReader::open(path).map_err(|e| match e {
        BinaryError::Io(err) => ResolveError::Transient(format!("{}: {err}", path.display())),
        other => ResolveError::Unresolvable(format!("{}: {other}", path.display())),
    })
}

/// Ask the node binary itself; the version is not recoverable from the
/// stripped executable.
fn node_version_of(exe: &Path) -> Option<SemVer> {
    let output = Command::new(exe).arg("--version").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    SemVer::parse(stdout.trim())
}

/// Test resolver with canned records, shared mutably with the test so
/// scenarios can change what a binary resolves to mid-flight
/// (simulating dlopen).
#[derive(Debug, Default, Clone)]
pub struct FakeResolver {
    pub records: Arc<std::sync::Mutex<HashMap<PathBuf, Arc<ResolutionRecord>>>>,
}

impl FakeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, record: ResolutionRecord) {
        self.records
            .lock()
            .unwrap()
            .insert(record.exe.clone(), Arc::new(record));
    }
}

impl BinaryResolver for FakeResolver {
    fn identity(&self, path: &Path) -> ResolveResult<BinaryIdentity> {
        self.records
            .lock()
            .unwrap()
            .get(path)
            .map(|r| r.identity)
            .ok_or_else(|| ResolveError::Transient(format!("{} not canned", path.display())))
    }

    fn resolve(&self, _upid: Upid, exe: &Path) -> ResolveResult<Arc<ResolutionRecord>> {
        self.records
            .lock()
            .unwrap()
            .get(exe)
            .cloned()
            .ok_or_else(|| ResolveError::Unresolvable(format!("{} not canned", exe.display())))
    }
}
