use crate::Result;
use std::path::PathBuf;

/// How a probe binds to its symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachType {
    /// Fire on function entry.
    Entry,
    /// Fire on return via the kernel's epilogue mechanism. Unsafe for
    /// Go targets, whose runtime relocates stacks.
    Return,
    /// Fire on return by planting an entry-style probe at every ret
    /// instruction inside the function body.
    ReturnInsts,
}

impl AttachType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachType::Entry => "entry",
            AttachType::Return => "return",
            AttachType::ReturnInsts => "return_insts",
        }
    }
}

/// A fully resolved attachment request: a file offset in a binary plus
/// the kernel-side handler to run there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UProbeSpec {
    pub binary_path: PathBuf,
    pub symbol: String,
    /// File offset of the attach point.
    pub address: u64,
    pub attach_type: AttachType,
    /// Name of the eBPF program in the loaded object.
    pub probe_fn: String,
}

/// Opaque kernel probe handle, valid until detached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeHandle(pub u64);

/// A tracing capability, each with its own symaddr map and record
/// layout. A layout change bumps the map-name suffix so stale kernel
/// objects fail loudly at init instead of misreading records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    Openssl,
    GoCommon,
    GoHttp2,
    GoTls,
    NodeTlsWrap,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::Openssl,
        Capability::GoCommon,
        Capability::GoHttp2,
        Capability::GoTls,
        Capability::NodeTlsWrap,
    ];

    pub fn map_name(&self) -> &'static str {
        match self {
            Capability::Openssl => "openssl_symaddrs_map",
            Capability::GoCommon => "go_common_symaddrs_map",
            Capability::GoHttp2 => "go_http2_symaddrs_map",
            Capability::GoTls => "go_tls_symaddrs_map",
            Capability::NodeTlsWrap => "node_tlswrap_symaddrs_map",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Openssl => "openssl",
            Capability::GoCommon => "go_common",
            Capability::GoHttp2 => "go_http2",
            Capability::GoTls => "go_tls",
            Capability::NodeTlsWrap => "node_tlswrap",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kernel surface the manager drives: uprobe attach/detach and
/// element-level access to the per-capability symaddr maps. Exactly one
/// writer (the orchestrator) holds it at a time.
pub trait KernelBackend: Send {
    fn attach_uprobe(&mut self, spec: &UProbeSpec) -> Result<ProbeHandle>;
    fn detach_uprobe(&mut self, handle: ProbeHandle) -> Result<()>;
    fn map_update(&mut self, cap: Capability, pid: u32, value: &[u8]) -> Result<()>;
    fn map_delete(&mut self, cap: Capability, pid: u32) -> Result<()>;
}
