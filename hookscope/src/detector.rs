use crate::semver::SemVer;
use hookscope_loader::Capability;
use std::collections::BTreeSet;
use std::path::Path;

/// A runtime trait of a process that selects a probe-template group.
/// One binary may carry several at once (a Go binary with both
/// crypto/tls and an http2 transport is the common case).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AppKind {
    OpensslDynlib,
    NodejsStaticOpenssl,
    GoRuntime,
    GoHttp2,
    GoTls,
}

impl AppKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppKind::OpensslDynlib => "openssl-dynlib",
            AppKind::NodejsStaticOpenssl => "nodejs-static-openssl",
            AppKind::GoRuntime => "go-runtime",
            AppKind::GoHttp2 => "go-http2",
            AppKind::GoTls => "go-tls",
        }
    }

    pub fn capability(&self) -> Capability {
        match self {
            AppKind::OpensslDynlib => Capability::Openssl,
            AppKind::NodejsStaticOpenssl => Capability::NodeTlsWrap,
            AppKind::GoRuntime => Capability::GoCommon,
            AppKind::GoHttp2 => Capability::GoHttp2,
            AppKind::GoTls => Capability::GoTls,
        }
    }
}

pub fn app_kind_for(cap: Capability) -> AppKind {
    match cap {
        Capability::Openssl => AppKind::OpensslDynlib,
        Capability::NodeTlsWrap => AppKind::NodejsStaticOpenssl,
        Capability::GoCommon => AppKind::GoRuntime,
        Capability::GoHttp2 => AppKind::GoHttp2,
        Capability::GoTls => AppKind::GoTls,
    }
}

/// Set of detected kinds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppKinds(BTreeSet<AppKind>);

impl AppKinds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: AppKind) {
        self.0.insert(kind);
    }

    pub fn contains(&self, kind: AppKind) -> bool {
        self.0.contains(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = AppKind> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<AppKind> for AppKinds {
    fn from_iter<T: IntoIterator<Item = AppKind>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// What the classifier needs to know about a binary, precomputed from
/// the ELF reader so the rules themselves stay pure and testable.
#[derive(Debug, Clone, Default)]
pub struct ElfSummary {
    pub is_go: bool,
    pub go_version: Option<String>,
    pub has_node_symbols: bool,
    pub has_http2_symbols: bool,
    pub has_go_tls_symbols: bool,
}

/// Why a kind was considered and not emitted.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub kind: AppKind,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct Detection {
    pub kinds: AppKinds,
    pub node_version: Option<SemVer>,
    pub go_version: Option<SemVer>,
    /// Path (in the target's namespace) of the mapped libssl, when
    /// OpensslDynlib was detected.
    pub libssl_path: Option<String>,
    pub rejections: Vec<Rejection>,
}

/// Node's C++ symbols all live under this mangling prefix.
pub const NODE_SYMBOL_PREFIX: &str = "_ZN4node";

const LIBSSL_BASENAME_PREFIX: &str = "libssl.so";

/// Deterministic classification. Rules are applied in order and are
/// independent; each negative outcome for a considered kind is
/// recorded rather than thrown.
pub fn detect(
    summary: &ElfSummary,
    mapped_lib_paths: &[String],
    node_version: Option<SemVer>,
) -> Detection {
    let mut out = Detection::default();

    // Rule 1: OpenSSL as a dynamic library in the target's namespace.
    match mapped_lib_paths.iter().find(|p| is_libssl_path(p)) {
        Some(path) => {
            out.kinds.insert(AppKind::OpensslDynlib);
            out.libssl_path = Some(path.clone());
        }
        None => out.rejections.push(Rejection {
            kind: AppKind::OpensslDynlib,
            reason: "no libssl mapping".to_string(),
        }),
    }

    // Rule 2: Node.js with statically linked OpenSSL.
    if summary.has_node_symbols {
        match node_version {
            Some(ver) => {
                out.kinds.insert(AppKind::NodejsStaticOpenssl);
                out.node_version = Some(ver);
            }
            None => out.rejections.push(Rejection {
                kind: AppKind::NodejsStaticOpenssl,
                reason: "node symbols present but version undetermined".to_string(),
            }),
        }
    }

    // Rule 3: Go runtime, plus the http2/tls refinements.
    if summary.is_go {
        out.kinds.insert(AppKind::GoRuntime);
        out.go_version = summary.go_version.as_deref().and_then(SemVer::parse);

        if summary.has_http2_symbols {
            out.kinds.insert(AppKind::GoHttp2);
        } else {
            out.rejections.push(Rejection {
                kind: AppKind::GoHttp2,
                reason: "no http2 transport symbols".to_string(),
            });
        }
        if summary.has_go_tls_symbols {
            out.kinds.insert(AppKind::GoTls);
        } else {
            out.rejections.push(Rejection {
                kind: AppKind::GoTls,
                reason: "no crypto/tls symbols".to_string(),
            });
        }
    }

    out
}

fn is_libssl_path(path: &str) -> bool {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().starts_with(LIBSSL_BASENAME_PREFIX))
        .unwrap_or(false)
}

/// The OpenSSL "fix" sub-version (1.1.<fix>) selects the rbio→num
/// offset. The realpath sometimes carries the full version
/// (libssl.so.1.1.0k); the bare soname does not, in which case 1.1.1
/// is assumed, it being the only line still commonly deployed.
pub fn openssl_fix_version(libssl_path: &str) -> u32 {
    let name = Path::new(libssl_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if let Some(rest) = name.strip_prefix("libssl.so.") {
        let parts: Vec<&str> = rest.split('.').collect();
        if parts.len() >= 3 {
            if let Some(fix) = parse_leading_digits(parts[2]) {
                return fix.min(1);
            }
        }
    }
    1
}

fn parse_leading_digits(s: &str) -> Option<u32> {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}
