//! Probe-template tables, one group per capability.
//!
//! Symbols are matched by predicate rather than pinned full names:
//! suffix matching tolerates Go vendor-directory prefixes (the gRPC
//! transport is routinely vendored), and prefix matching tolerates
//! C++ mangling of argument lists that changed across Node releases.

use crate::semver::{floor, SemVer};
use hookscope_binary::SymbolMatchType;
use hookscope_loader::AttachType;

/// Abstract description of one attachment, before symbol resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UProbeTmpl {
    pub symbol: &'static str,
    pub match_type: SymbolMatchType,
    pub probe_fn: &'static str,
    pub attach_type: AttachType,
}

/// OpenSSL dynamic-library group. SSL_new's return probe binds the SSL
/// object to its underlying socket fd.
pub const OPENSSL_UPROBES: [UProbeTmpl; 5] = [
    UProbeTmpl {
        symbol: "SSL_write",
        match_type: SymbolMatchType::Exact,
        probe_fn: "probe_entry_SSL_write",
        attach_type: AttachType::Entry,
    },
    UProbeTmpl {
        symbol: "SSL_write",
        match_type: SymbolMatchType::Exact,
        probe_fn: "probe_ret_SSL_write",
        attach_type: AttachType::Return,
    },
    UProbeTmpl {
        symbol: "SSL_read",
        match_type: SymbolMatchType::Exact,
        probe_fn: "probe_entry_SSL_read",
        attach_type: AttachType::Entry,
    },
    UProbeTmpl {
        symbol: "SSL_read",
        match_type: SymbolMatchType::Exact,
        probe_fn: "probe_ret_SSL_read",
        attach_type: AttachType::Return,
    },
    UProbeTmpl {
        symbol: "SSL_new",
        match_type: SymbolMatchType::Exact,
        probe_fn: "probe_ret_SSL_new",
        attach_type: AttachType::Return,
    },
];

/// General Go runtime group: goroutine lifecycle tracking.
pub const GO_RUNTIME_TMPLS: [UProbeTmpl; 1] = [UProbeTmpl {
    symbol: "runtime.casgstatus",
    match_type: SymbolMatchType::Suffix,
    probe_fn: "probe_runtime_casgstatus",
    attach_type: AttachType::Entry,
}];

/// Go HTTP2 group: the gRPC transport, x/net/http2, net/http's
/// embedded http2, and the hpack header encoder.
pub const GO_HTTP2_TMPLS: [UProbeTmpl; 10] = [
    UProbeTmpl {
        symbol: "google.golang.org/grpc/internal/transport.(*http2Client).operateHeaders",
        match_type: SymbolMatchType::Suffix,
        probe_fn: "probe_http2_client_operate_headers",
        attach_type: AttachType::Entry,
    },
    UProbeTmpl {
        symbol: "google.golang.org/grpc/internal/transport.(*http2Server).operateHeaders",
        match_type: SymbolMatchType::Suffix,
        probe_fn: "probe_http2_server_operate_headers",
        attach_type: AttachType::Entry,
    },
    UProbeTmpl {
        symbol: "google.golang.org/grpc/internal/transport.(*loopyWriter).writeHeader",
        match_type: SymbolMatchType::Suffix,
        probe_fn: "probe_loopy_writer_write_header",
        attach_type: AttachType::Entry,
    },
    UProbeTmpl {
        symbol: "golang.org/x/net/http2.(*Framer).WriteDataPadded",
        match_type: SymbolMatchType::Suffix,
        probe_fn: "probe_http2_framer_write_data",
        attach_type: AttachType::Entry,
    },
    UProbeTmpl {
        symbol: "golang.org/x/net/http2.(*Framer).checkFrameOrder",
        match_type: SymbolMatchType::Suffix,
        probe_fn: "probe_http2_framer_check_frame_order",
        attach_type: AttachType::Entry,
    },
    UProbeTmpl {
        symbol: "net/http.(*http2Framer).WriteDataPadded",
        match_type: SymbolMatchType::Suffix,
        probe_fn: "probe_http_http2framer_write_data",
        attach_type: AttachType::Entry,
    },
    UProbeTmpl {
        symbol: "net/http.(*http2Framer).checkFrameOrder",
        match_type: SymbolMatchType::Suffix,
        probe_fn: "probe_http_http2framer_check_frame_order",
        attach_type: AttachType::Entry,
    },
    UProbeTmpl {
        symbol: "net/http.(*http2writeResHeaders).writeFrame",
        match_type: SymbolMatchType::Suffix,
        probe_fn: "probe_http_http2writeResHeaders_write_frame",
        attach_type: AttachType::Entry,
    },
    UProbeTmpl {
        symbol: "golang.org/x/net/http2/hpack.(*Encoder).WriteField",
        match_type: SymbolMatchType::Suffix,
        probe_fn: "probe_hpack_header_encoder",
        attach_type: AttachType::Entry,
    },
    UProbeTmpl {
        symbol: "net/http.(*http2serverConn).processHeaders",
        match_type: SymbolMatchType::Suffix,
        probe_fn: "probe_http_http2serverConn_processHeaders",
        attach_type: AttachType::Entry,
    },
];

/// Go crypto/tls group. Returns are traced per ret instruction; the Go
/// runtime reuses stacks, which makes epilogue uretprobes unsafe.
pub const GO_TLS_TMPLS: [UProbeTmpl; 4] = [
    UProbeTmpl {
        symbol: "crypto/tls.(*Conn).Write",
        match_type: SymbolMatchType::Suffix,
        probe_fn: "probe_entry_tls_conn_write",
        attach_type: AttachType::Entry,
    },
    UProbeTmpl {
        symbol: "crypto/tls.(*Conn).Write",
        match_type: SymbolMatchType::Suffix,
        probe_fn: "probe_return_tls_conn_write",
        attach_type: AttachType::ReturnInsts,
    },
    UProbeTmpl {
        symbol: "crypto/tls.(*Conn).Read",
        match_type: SymbolMatchType::Suffix,
        probe_fn: "probe_entry_tls_conn_read",
        attach_type: AttachType::Entry,
    },
    UProbeTmpl {
        symbol: "crypto/tls.(*Conn).Read",
        match_type: SymbolMatchType::Suffix,
        probe_fn: "probe_return_tls_conn_read",
        attach_type: AttachType::ReturnInsts,
    },
];

/// Node TLSWrap member functions, pre-15.0 mangling (`node::TLSWrap`).
pub const NODE_TLSWRAP_TMPLS_V12_3_1: [UProbeTmpl; 6] = node_tlswrap_group(
    "_ZN4node7TLSWrapC2E",
    "_ZN4node7TLSWrap7ClearInE",
    "_ZN4node7TLSWrap8ClearOutE",
);

/// Node TLSWrap member functions, 15.0+ mangling
/// (`node::crypto::TLSWrap`).
pub const NODE_TLSWRAP_TMPLS_V15_0_0: [UProbeTmpl; 6] = node_tlswrap_group(
    "_ZN4node6crypto7TLSWrapC2E",
    "_ZN4node6crypto7TLSWrap7ClearInE",
    "_ZN4node6crypto7TLSWrap8ClearOutE",
);

const fn node_tlswrap_group(
    ctor: &'static str,
    clear_in: &'static str,
    clear_out: &'static str,
) -> [UProbeTmpl; 6] {
    [
        UProbeTmpl {
            symbol: ctor,
            match_type: SymbolMatchType::Prefix,
            probe_fn: "probe_entry_TLSWrap_memfn",
            attach_type: AttachType::Entry,
        },
        UProbeTmpl {
            symbol: ctor,
            match_type: SymbolMatchType::Prefix,
            probe_fn: "probe_ret_TLSWrap_memfn",
            attach_type: AttachType::Return,
        },
        UProbeTmpl {
            symbol: clear_in,
            match_type: SymbolMatchType::Prefix,
            probe_fn: "probe_entry_TLSWrap_memfn",
            attach_type: AttachType::Entry,
        },
        UProbeTmpl {
            symbol: clear_in,
            match_type: SymbolMatchType::Prefix,
            probe_fn: "probe_ret_TLSWrap_memfn",
            attach_type: AttachType::Return,
        },
        UProbeTmpl {
            symbol: clear_out,
            match_type: SymbolMatchType::Prefix,
            probe_fn: "probe_entry_TLSWrap_memfn",
            attach_type: AttachType::Entry,
        },
        UProbeTmpl {
            symbol: clear_out,
            match_type: SymbolMatchType::Prefix,
            probe_fn: "probe_ret_TLSWrap_memfn",
            attach_type: AttachType::Return,
        },
    ]
}

/// Select the TLSWrap group for a Node version. Versions older than
/// 12.3.1 are unsupported.
pub fn node_tlswrap_tmpls(ver: SemVer) -> Option<&'static [UProbeTmpl; 6]> {
    const TABLE: [(SemVer, &[UProbeTmpl; 6]); 2] = [
        (SemVer::new(12, 3, 1), &NODE_TLSWRAP_TMPLS_V12_3_1),
        (SemVer::new(15, 0, 0), &NODE_TLSWRAP_TMPLS_V15_0_0),
    ];
    floor(&TABLE, ver).copied()
}
