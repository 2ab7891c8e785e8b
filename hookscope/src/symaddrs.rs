//! Per-pid symbol-address records and their resolution.
//!
//! Each capability has one fixed-layout record, published into that
//! capability's kernel map keyed by pid. The kernel-side handlers use
//! these to decode arguments at runtime; the layouts here and in the
//! handler code must match byte for byte, which is why every struct is
//! `#[repr(C)]` with fields sized so no padding exists.

use crate::detector::openssl_fix_version;
use crate::semver::{floor, SemVer};
use anyhow::{bail, Result};
use bytemuck::{Pod, Zeroable};
use hookscope_binary::{ArgLocation, DwarfReader, ElfReader, LocationKind, SymbolMatchType};
use std::collections::HashMap;
use tracing::debug;

pub const LOC_INVALID: i32 = 0;
pub const LOC_STACK: i32 = 1;
pub const LOC_REGISTERS: i32 = 2;

/// Argument position as consumed by the kernel handler.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct KernLoc {
    pub kind: i32,
    pub offset: i32,
}

impl KernLoc {
    pub const INVALID: KernLoc = KernLoc {
        kind: LOC_INVALID,
        offset: -1,
    };

    pub fn is_valid(&self) -> bool {
        self.kind != LOC_INVALID && self.offset >= 0
    }
}

/// DWARF frame bases are 8 bytes above the SP the probe observes.
const SP_OFFSET: i64 = 8;

fn kern_loc(args: &HashMap<String, ArgLocation>, name: &str) -> KernLoc {
    match args.get(name) {
        Some(a) => match a.kind {
            LocationKind::Stack => KernLoc {
                kind: LOC_STACK,
                offset: (a.offset + SP_OFFSET) as i32,
            },
            LocationKind::Register => KernLoc {
                kind: LOC_REGISTERS,
                offset: a.offset as i32,
            },
            LocationKind::Invalid => KernLoc::INVALID,
        },
        None => KernLoc::INVALID,
    }
}

//-----------------------------------------------------------------------------
// Record layouts
//-----------------------------------------------------------------------------

/// OpenSSL: offsets to reach the socket fd from an SSL object
/// (ssl_st.rbio, then bio_st.num).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct OpensslSymAddrs {
    pub ssl_rbio_offset: i32,
    pub rbio_num_offset: i32,
}

/// Shared Go offsets: conn interface itabs, the FD chain down to
/// Sysfd, goroutine id, and runtime.casgstatus argument positions.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct GoCommonSymAddrs {
    pub internal_syscall_conn: i64,
    pub tls_conn: i64,
    pub net_tcp_conn: i64,
    pub fd_sysfd_offset: i64,
    pub tls_conn_conn_offset: i64,
    pub syscall_conn_conn_offset: i64,
    pub g_goid_offset: i64,
    pub casgstatus_gp_loc: KernLoc,
    pub casgstatus_newval_loc: KernLoc,
}

/// Go crypto/tls argument and return-value positions for
/// (*Conn).Read and (*Conn).Write.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct GoTlsSymAddrs {
    pub write_c_loc: KernLoc,
    pub write_b_loc: KernLoc,
    pub write_retval0_loc: KernLoc,
    pub write_retval1_loc: KernLoc,
    pub read_c_loc: KernLoc,
    pub read_b_loc: KernLoc,
    pub read_retval0_loc: KernLoc,
    pub read_retval1_loc: KernLoc,
}

/// Go HTTP2 offsets across the gRPC transport, x/net/http2, net/http's
/// embedded http2, and hpack.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct GoHttp2SymAddrs {
    // Interface itabs.
    pub http_http2buffered_writer: i64,
    pub transport_buf_writer: i64,

    // Struct member offsets.
    pub header_field_name_offset: i64,
    pub header_field_value_offset: i64,
    pub http2_server_conn_offset: i64,
    pub http2_client_conn_offset: i64,
    pub loopy_writer_framer_offset: i64,
    pub framer_w_offset: i64,
    pub meta_headers_frame_headers_frame_offset: i64,
    pub meta_headers_frame_fields_offset: i64,
    pub headers_frame_frame_header_offset: i64,
    pub frame_header_type_offset: i64,
    pub frame_header_flags_offset: i64,
    pub frame_header_stream_id_offset: i64,
    pub data_frame_data_offset: i64,
    pub buf_writer_conn_offset: i64,
    pub http2server_conn_conn_offset: i64,
    pub http2server_conn_hpack_encoder_offset: i64,
    pub http2headers_frame_http2frame_header_offset: i64,
    pub http2frame_header_type_offset: i64,
    pub http2frame_header_flags_offset: i64,
    pub http2frame_header_stream_id_offset: i64,
    pub http2data_frame_data_offset: i64,
    pub http2write_res_headers_stream_id_offset: i64,
    pub http2write_res_headers_end_stream_offset: i64,
    pub http2meta_headers_frame_http2headers_frame_offset: i64,
    pub http2meta_headers_frame_fields_offset: i64,
    pub http2framer_w_offset: i64,
    pub http2buffered_writer_w_offset: i64,

    // Argument positions.
    pub http2framer_write_data_padded_f_loc: KernLoc,
    pub http2framer_write_data_padded_stream_id_loc: KernLoc,
    pub http2framer_write_data_padded_end_stream_loc: KernLoc,
    pub http2framer_write_data_padded_data_ptr_loc: KernLoc,
    pub http2framer_write_data_padded_data_len_loc: KernLoc,
    pub http2_write_data_padded_f_loc: KernLoc,
    pub http2_write_data_padded_stream_id_loc: KernLoc,
    pub http2_write_data_padded_end_stream_loc: KernLoc,
    pub http2_write_data_padded_data_ptr_loc: KernLoc,
    pub http2_write_data_padded_data_len_loc: KernLoc,
    pub http2framer_check_frame_order_fr_loc: KernLoc,
    pub http2framer_check_frame_order_f_loc: KernLoc,
    pub http2_check_frame_order_fr_loc: KernLoc,
    pub http2_check_frame_order_f_loc: KernLoc,
    pub write_frame_w_loc: KernLoc,
    pub write_frame_ctx_loc: KernLoc,
    pub write_field_e_loc: KernLoc,
    pub write_field_f_name_loc: KernLoc,
    pub write_field_f_value_loc: KernLoc,
    pub process_headers_sc_loc: KernLoc,
    pub process_headers_f_loc: KernLoc,
    pub http2_server_operate_headers_t_loc: KernLoc,
    pub http2_server_operate_headers_frame_loc: KernLoc,
    pub http2_client_operate_headers_t_loc: KernLoc,
    pub http2_client_operate_headers_frame_loc: KernLoc,
    pub write_header_l_loc: KernLoc,
    pub write_header_stream_id_loc: KernLoc,
    pub write_header_end_stream_loc: KernLoc,
    pub write_header_hf_ptr_loc: KernLoc,
    pub write_header_hf_len_loc: KernLoc,
}

/// Node: chain of offsets from a TLSWrap object down to the libuv fd.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct NodeTlsWrapSymAddrs {
    pub tlswrap_stream_listener_offset: i32,
    pub stream_listener_stream_offset: i32,
    pub stream_base_stream_resource_offset: i32,
    pub libuv_stream_wrap_stream_base_offset: i32,
    pub libuv_stream_wrap_stream_offset: i32,
    pub uv_stream_s_io_watcher_offset: i32,
    pub uv_io_s_fd_offset: i32,
}

//-----------------------------------------------------------------------------
// Resolution
//-----------------------------------------------------------------------------

/// A Go slice argument is (ptr, len, cap); the len word sits 8 bytes
/// past the data pointer. Stable enough to hard-code.
const GO_ARRAY_PTR_OFFSET: i32 = 0;
const GO_ARRAY_LEN_OFFSET: i32 = 8;

fn plus(loc: KernLoc, delta: i32) -> KernLoc {
    if loc.kind == LOC_INVALID {
        return loc;
    }
    KernLoc {
        kind: loc.kind,
        offset: loc.offset + delta,
    }
}

/// Offset of rbio in ssl_st; stable across 1.1.0–1.1.1.
const SSL_RBIO_OFFSET: i32 = 0x10;
/// Offset of num in bio_st, which moved between 1.1.0 and 1.1.1.
const OPENSSL_1_1_0_RBIO_NUM_OFFSET: i32 = 0x28;
const OPENSSL_1_1_1_RBIO_NUM_OFFSET: i32 = 0x30;

pub fn openssl_symaddrs(libssl_path: &str) -> Result<OpensslSymAddrs> {
    let rbio_num_offset = match openssl_fix_version(libssl_path) {
        0 => OPENSSL_1_1_0_RBIO_NUM_OFFSET,
        1 => OPENSSL_1_1_1_RBIO_NUM_OFFSET,
        v => bail!("unsupported OpenSSL fix version 1.1.{v}"),
    };
    Ok(OpensslSymAddrs {
        ssl_rbio_offset: SSL_RBIO_OFFSET,
        rbio_num_offset,
    })
}

/// Infer the vendor-directory prefix under which gRPC's dependencies
/// were built, by sampling symbols whose canonical suffix is known.
pub fn infer_http2_vendor_prefix(elf: &ElfReader) -> String {
    const SAMPLE_SYMBOLS: [&str; 3] = [
        "google.golang.org/grpc/internal/transport.(*http2Client).operateHeaders",
        "golang.org/x/net/http2/hpack.HeaderField.String",
        "golang.org/x/net/http2.(*Framer).WriteHeaders",
    ];
    for sample in SAMPLE_SYMBOLS {
        let matches = elf.list_symbols(sample, SymbolMatchType::Suffix);
        if matches.len() == 1 {
            let name = &matches[0].name;
            let prefix = &name[..name.len() - sample.len()];
            if !prefix.is_empty() {
                debug!("inferred vendor prefix: {prefix}");
            }
            return prefix.to_string();
        }
    }
    String::new()
}

fn sym_or_neg1(elf: &ElfReader, name: &str) -> i64 {
    elf.symbol_address(name).map(|v| v as i64).unwrap_or(-1)
}

fn member_or_neg1(dwarf: &DwarfReader, type_name: &str, member: &str) -> i64 {
    dwarf
        .struct_member_offset(type_name, member)
        .map(|v| v as i64)
        .unwrap_or(-1)
}

fn args_of(dwarf: &DwarfReader, function: &str) -> HashMap<String, ArgLocation> {
    dwarf.function_arg_locations(function).unwrap_or_default()
}

pub fn go_common_symaddrs(elf: &ElfReader, dwarf: &DwarfReader) -> Result<GoCommonSymAddrs> {
    let vendor_prefix = infer_http2_vendor_prefix(elf);

    let internal_syscall_conn = sym_or_neg1(
        elf,
        &format!(
            "go.itab.*{vendor_prefix}google.golang.org/grpc/credentials/internal.syscallConn,net.Conn"
        ),
    );
    let tls_conn = sym_or_neg1(elf, "go.itab.*crypto/tls.Conn,net.Conn");
    let net_tcp_conn = sym_or_neg1(elf, "go.itab.*net.TCPConn,net.Conn");

    // TCPConn is the last layer of the nested conn interfaces and
    // carries the fd; without it every probe is blind.
    if net_tcp_conn == -1 {
        bail!("TCPConn itab not found");
    }

    let fd_sysfd_offset = member_or_neg1(dwarf, "internal/poll.FD", "Sysfd");
    let tls_conn_conn_offset = member_or_neg1(dwarf, "crypto/tls.Conn", "conn");
    let syscall_conn_conn_offset = member_or_neg1(
        dwarf,
        &format!("{vendor_prefix}google.golang.org/grpc/credentials/internal.syscallConn"),
        "conn",
    );
    let g_goid_offset = member_or_neg1(dwarf, "runtime.g", "goid");

    let casgstatus_args = args_of(dwarf, "runtime.casgstatus");
    let casgstatus_gp_loc = kern_loc(&casgstatus_args, "gp");
    let casgstatus_newval_loc = kern_loc(&casgstatus_args, "newval");

    if fd_sysfd_offset == -1 {
        bail!("internal/poll.FD Sysfd offset not found");
    }
    if !casgstatus_gp_loc.is_valid() || !casgstatus_newval_loc.is_valid() {
        bail!("runtime.casgstatus argument locations not found");
    }

    Ok(GoCommonSymAddrs {
        internal_syscall_conn,
        tls_conn,
        net_tcp_conn,
        fd_sysfd_offset,
        tls_conn_conn_offset,
        syscall_conn_conn_offset,
        g_goid_offset,
        casgstatus_gp_loc,
        casgstatus_newval_loc,
    })
}

/// Return-value slots were renamed from `~r1`/`~r2` to `~r0`/`~r1` in
/// the Go 1.18 DWARF output.
const GO_ZERO_INDEX_RETVAL_VERSION: SemVer = SemVer::new(1, 18, 0);

pub fn go_tls_symaddrs(dwarf: &DwarfReader, go_version: Option<SemVer>) -> Result<GoTlsSymAddrs> {
    let (retval0, retval1) = match go_version {
        Some(v) if v >= GO_ZERO_INDEX_RETVAL_VERSION => ("~r0", "~r1"),
        _ => ("~r1", "~r2"),
    };

    let write_args = args_of(dwarf, "crypto/tls.(*Conn).Write");
    let read_args = args_of(dwarf, "crypto/tls.(*Conn).Read");

    let symaddrs = GoTlsSymAddrs {
        write_c_loc: kern_loc(&write_args, "c"),
        write_b_loc: kern_loc(&write_args, "b"),
        write_retval0_loc: kern_loc(&write_args, retval0),
        write_retval1_loc: kern_loc(&write_args, retval1),
        read_c_loc: kern_loc(&read_args, "c"),
        read_b_loc: kern_loc(&read_args, "b"),
        read_retval0_loc: kern_loc(&read_args, retval0),
        read_retval1_loc: kern_loc(&read_args, retval1),
    };

    if !symaddrs.write_b_loc.is_valid() || !symaddrs.read_b_loc.is_valid() {
        bail!("crypto/tls Conn Read/Write arguments not found");
    }
    Ok(symaddrs)
}

pub fn go_http2_symaddrs(elf: &ElfReader, dwarf: &DwarfReader) -> Result<GoHttp2SymAddrs> {
    let vp = infer_http2_vendor_prefix(elf);
    let vendored = |s: &str| format!("{vp}{s}");

    let write_data = args_of(dwarf, &vendored("golang.org/x/net/http2.(*Framer).WriteDataPadded"));
    let http_write_data = args_of(dwarf, "net/http.(*http2Framer).WriteDataPadded");
    let check_order = args_of(dwarf, &vendored("golang.org/x/net/http2.(*Framer).checkFrameOrder"));
    let http_check_order = args_of(dwarf, "net/http.(*http2Framer).checkFrameOrder");
    let write_frame = args_of(dwarf, "net/http.(*http2writeResHeaders).writeFrame");
    let write_field = args_of(
        dwarf,
        &vendored("golang.org/x/net/http2/hpack.(*Encoder).WriteField"),
    );
    let process_headers = args_of(dwarf, "net/http.(*http2serverConn).processHeaders");
    let server_operate = args_of(
        dwarf,
        &vendored("google.golang.org/grpc/internal/transport.(*http2Server).operateHeaders"),
    );
    let client_operate = args_of(
        dwarf,
        &vendored("google.golang.org/grpc/internal/transport.(*http2Client).operateHeaders"),
    );
    let write_header = args_of(
        dwarf,
        &vendored("google.golang.org/grpc/internal/transport.(*loopyWriter).writeHeader"),
    );

    Ok(GoHttp2SymAddrs {
        http_http2buffered_writer: sym_or_neg1(
            elf,
            "go.itab.*net/http.http2bufferedWriter,io.Writer",
        ),
        transport_buf_writer: sym_or_neg1(
            elf,
            &format!(
                "go.itab.*{vp}google.golang.org/grpc/internal/transport.bufWriter,io.Writer"
            ),
        ),

        header_field_name_offset: member_or_neg1(
            dwarf,
            &vendored("golang.org/x/net/http2/hpack.HeaderField"),
            "Name",
        ),
        header_field_value_offset: member_or_neg1(
            dwarf,
            &vendored("golang.org/x/net/http2/hpack.HeaderField"),
            "Value",
        ),
        http2_server_conn_offset: member_or_neg1(
            dwarf,
            &vendored("google.golang.org/grpc/internal/transport.http2Server"),
            "conn",
        ),
        http2_client_conn_offset: member_or_neg1(
            dwarf,
            &vendored("google.golang.org/grpc/internal/transport.http2Client"),
            "conn",
        ),
        loopy_writer_framer_offset: member_or_neg1(
            dwarf,
            &vendored("google.golang.org/grpc/internal/transport.loopyWriter"),
            "framer",
        ),
        framer_w_offset: member_or_neg1(dwarf, &vendored("golang.org/x/net/http2.Framer"), "w"),
        meta_headers_frame_headers_frame_offset: member_or_neg1(
            dwarf,
            &vendored("golang.org/x/net/http2.MetaHeadersFrame"),
            "HeadersFrame",
        ),
        meta_headers_frame_fields_offset: member_or_neg1(
            dwarf,
            &vendored("golang.org/x/net/http2.MetaHeadersFrame"),
            "Fields",
        ),
        headers_frame_frame_header_offset: member_or_neg1(
            dwarf,
            &vendored("golang.org/x/net/http2.HeadersFrame"),
            "FrameHeader",
        ),
        frame_header_type_offset: member_or_neg1(
            dwarf,
            &vendored("golang.org/x/net/http2.FrameHeader"),
            "Type",
        ),
        frame_header_flags_offset: member_or_neg1(
            dwarf,
            &vendored("golang.org/x/net/http2.FrameHeader"),
            "Flags",
        ),
        frame_header_stream_id_offset: member_or_neg1(
            dwarf,
            &vendored("golang.org/x/net/http2.FrameHeader"),
            "StreamID",
        ),
        data_frame_data_offset: member_or_neg1(
            dwarf,
            &vendored("golang.org/x/net/http2.DataFrame"),
            "data",
        ),
        buf_writer_conn_offset: member_or_neg1(
            dwarf,
            &vendored("google.golang.org/grpc/internal/transport.bufWriter"),
            "conn",
        ),
        http2server_conn_conn_offset: member_or_neg1(dwarf, "net/http.http2serverConn", "conn"),
        http2server_conn_hpack_encoder_offset: member_or_neg1(
            dwarf,
            "net/http.http2serverConn",
            "hpackEncoder",
        ),
        http2headers_frame_http2frame_header_offset: member_or_neg1(
            dwarf,
            "net/http.http2HeadersFrame",
            "http2FrameHeader",
        ),
        http2frame_header_type_offset: member_or_neg1(dwarf, "net/http.http2FrameHeader", "Type"),
        http2frame_header_flags_offset: member_or_neg1(
            dwarf,
            "net/http.http2FrameHeader",
            "Flags",
        ),
        http2frame_header_stream_id_offset: member_or_neg1(
            dwarf,
            "net/http.http2FrameHeader",
            "StreamID",
        ),
        http2data_frame_data_offset: member_or_neg1(dwarf, "net/http.http2DataFrame", "data"),
        http2write_res_headers_stream_id_offset: member_or_neg1(
            dwarf,
            "net/http.http2writeResHeaders",
            "streamID",
        ),
        http2write_res_headers_end_stream_offset: member_or_neg1(
            dwarf,
            "net/http.http2writeResHeaders",
            "endStream",
        ),
        http2meta_headers_frame_http2headers_frame_offset: member_or_neg1(
            dwarf,
            "net/http.http2MetaHeadersFrame",
            "http2HeadersFrame",
        ),
        http2meta_headers_frame_fields_offset: member_or_neg1(
            dwarf,
            "net/http.http2MetaHeadersFrame",
            "Fields",
        ),
        http2framer_w_offset: member_or_neg1(dwarf, "net/http.http2Framer", "w"),
        http2buffered_writer_w_offset: member_or_neg1(
            dwarf,
            "net/http.http2bufferedWriter",
            "w",
        ),

        http2framer_write_data_padded_f_loc: kern_loc(&http_write_data, "f"),
        http2framer_write_data_padded_stream_id_loc: kern_loc(&http_write_data, "streamID"),
        http2framer_write_data_padded_end_stream_loc: kern_loc(&http_write_data, "endStream"),
        http2framer_write_data_padded_data_ptr_loc: plus(
            kern_loc(&http_write_data, "data"),
            GO_ARRAY_PTR_OFFSET,
        ),
        http2framer_write_data_padded_data_len_loc: plus(
            kern_loc(&http_write_data, "data"),
            GO_ARRAY_LEN_OFFSET,
        ),
        http2_write_data_padded_f_loc: kern_loc(&write_data, "f"),
        http2_write_data_padded_stream_id_loc: kern_loc(&write_data, "streamID"),
        http2_write_data_padded_end_stream_loc: kern_loc(&write_data, "endStream"),
        http2_write_data_padded_data_ptr_loc: plus(
            kern_loc(&write_data, "data"),
            GO_ARRAY_PTR_OFFSET,
        ),
        http2_write_data_padded_data_len_loc: plus(
            kern_loc(&write_data, "data"),
            GO_ARRAY_LEN_OFFSET,
        ),
        http2framer_check_frame_order_fr_loc: kern_loc(&http_check_order, "fr"),
        http2framer_check_frame_order_f_loc: kern_loc(&http_check_order, "f"),
        http2_check_frame_order_fr_loc: kern_loc(&check_order, "fr"),
        http2_check_frame_order_f_loc: kern_loc(&check_order, "f"),
        write_frame_w_loc: kern_loc(&write_frame, "w"),
        write_frame_ctx_loc: kern_loc(&write_frame, "ctx"),
        write_field_e_loc: kern_loc(&write_field, "e"),
        write_field_f_name_loc: plus(kern_loc(&write_field, "f"), 0),
        write_field_f_value_loc: plus(kern_loc(&write_field, "f"), 16),
        process_headers_sc_loc: kern_loc(&process_headers, "sc"),
        process_headers_f_loc: kern_loc(&process_headers, "f"),
        http2_server_operate_headers_t_loc: kern_loc(&server_operate, "t"),
        http2_server_operate_headers_frame_loc: kern_loc(&server_operate, "frame"),
        http2_client_operate_headers_t_loc: kern_loc(&client_operate, "t"),
        http2_client_operate_headers_frame_loc: kern_loc(&client_operate, "frame"),
        write_header_l_loc: kern_loc(&write_header, "l"),
        write_header_stream_id_loc: kern_loc(&write_header, "streamID"),
        write_header_end_stream_loc: kern_loc(&write_header, "endStream"),
        write_header_hf_ptr_loc: plus(kern_loc(&write_header, "hf"), GO_ARRAY_PTR_OFFSET),
        write_header_hf_len_loc: plus(kern_loc(&write_header, "hf"), GO_ARRAY_LEN_OFFSET),
    })
}

//-----------------------------------------------------------------------------
// Node TLSWrap offsets
//-----------------------------------------------------------------------------

const NODE_SYMADDRS_V12_3_1: NodeTlsWrapSymAddrs = NodeTlsWrapSymAddrs {
    tlswrap_stream_listener_offset: 0x0130,
    stream_listener_stream_offset: 0x08,
    stream_base_stream_resource_offset: 0x00,
    libuv_stream_wrap_stream_base_offset: 0x50,
    libuv_stream_wrap_stream_offset: 0x90,
    uv_stream_s_io_watcher_offset: 0x88,
    uv_io_s_fd_offset: 0x30,
};

const NODE_SYMADDRS_V12_16_2: NodeTlsWrapSymAddrs = NodeTlsWrapSymAddrs {
    tlswrap_stream_listener_offset: 0x138,
    stream_listener_stream_offset: 0x08,
    stream_base_stream_resource_offset: 0x00,
    libuv_stream_wrap_stream_base_offset: 0x58,
    libuv_stream_wrap_stream_offset: 0x98,
    uv_stream_s_io_watcher_offset: 0x88,
    uv_io_s_fd_offset: 0x30,
};

const NODE_SYMADDRS_V13_0_0: NodeTlsWrapSymAddrs = NodeTlsWrapSymAddrs {
    tlswrap_stream_listener_offset: 0x130,
    stream_listener_stream_offset: 0x8,
    stream_base_stream_resource_offset: 0x00,
    libuv_stream_wrap_stream_base_offset: 0x50,
    libuv_stream_wrap_stream_offset: 0x90,
    uv_stream_s_io_watcher_offset: 0x88,
    uv_io_s_fd_offset: 0x30,
};

const NODE_SYMADDRS_V13_2_0: NodeTlsWrapSymAddrs = NodeTlsWrapSymAddrs {
    tlswrap_stream_listener_offset: 0x138,
    stream_listener_stream_offset: 0x08,
    stream_base_stream_resource_offset: 0x00,
    libuv_stream_wrap_stream_base_offset: 0x58,
    libuv_stream_wrap_stream_offset: 0x98,
    uv_stream_s_io_watcher_offset: 0x88,
    uv_io_s_fd_offset: 0x30,
};

const NODE_SYMADDRS_V13_10_1: NodeTlsWrapSymAddrs = NodeTlsWrapSymAddrs {
    tlswrap_stream_listener_offset: 0x140,
    stream_listener_stream_offset: 0x8,
    stream_base_stream_resource_offset: 0x00,
    libuv_stream_wrap_stream_base_offset: 0x60,
    libuv_stream_wrap_stream_offset: 0xa0,
    uv_stream_s_io_watcher_offset: 0x88,
    uv_io_s_fd_offset: 0x30,
};

const NODE_SYMADDRS_V14_5_0: NodeTlsWrapSymAddrs = NodeTlsWrapSymAddrs {
    tlswrap_stream_listener_offset: 0x138,
    stream_listener_stream_offset: 0x08,
    stream_base_stream_resource_offset: 0x00,
    libuv_stream_wrap_stream_base_offset: 0x58,
    libuv_stream_wrap_stream_offset: 0x98,
    uv_stream_s_io_watcher_offset: 0x88,
    uv_io_s_fd_offset: 0x30,
};

// Verified on 15.0 through 16.9; newer lines keep the layout so far.
const NODE_SYMADDRS_V15_0_0: NodeTlsWrapSymAddrs = NodeTlsWrapSymAddrs {
    tlswrap_stream_listener_offset: 0x78,
    stream_listener_stream_offset: 0x08,
    stream_base_stream_resource_offset: 0x00,
    libuv_stream_wrap_stream_base_offset: 0x58,
    libuv_stream_wrap_stream_offset: 0x98,
    uv_stream_s_io_watcher_offset: 0x88,
    uv_io_s_fd_offset: 0x30,
};

const NODE_VERSION_SYMADDRS: [(SemVer, NodeTlsWrapSymAddrs); 7] = [
    (SemVer::new(12, 3, 1), NODE_SYMADDRS_V12_3_1),
    (SemVer::new(12, 16, 2), NODE_SYMADDRS_V12_16_2),
    (SemVer::new(13, 0, 0), NODE_SYMADDRS_V13_0_0),
    (SemVer::new(13, 2, 0), NODE_SYMADDRS_V13_2_0),
    (SemVer::new(13, 10, 1), NODE_SYMADDRS_V13_10_1),
    (SemVer::new(14, 5, 0), NODE_SYMADDRS_V14_5_0),
    (SemVer::new(15, 0, 0), NODE_SYMADDRS_V15_0_0),
];

pub fn node_tlswrap_symaddrs_from_version(ver: SemVer) -> Result<NodeTlsWrapSymAddrs> {
    match floor(&NODE_VERSION_SYMADDRS, ver) {
        Some(symaddrs) => Ok(*symaddrs),
        None => bail!("no symbol offsets for node version {ver}; minimum is 12.3.1"),
    }
}

pub fn node_tlswrap_symaddrs_from_dwarf(dwarf: &DwarfReader) -> Result<NodeTlsWrapSymAddrs> {
    Ok(NodeTlsWrapSymAddrs {
        tlswrap_stream_listener_offset: dwarf.class_parent_offset("TLSWrap", "StreamListener")?
            as i32,
        stream_listener_stream_offset: dwarf.class_member_offset("StreamListener", "stream_")?
            as i32,
        stream_base_stream_resource_offset: dwarf
            .class_parent_offset("StreamBase", "StreamResource")?
            as i32,
        libuv_stream_wrap_stream_base_offset: dwarf
            .class_parent_offset("LibuvStreamWrap", "StreamBase")?
            as i32,
        libuv_stream_wrap_stream_offset: dwarf.class_member_offset("LibuvStreamWrap", "stream_")?
            as i32,
        uv_stream_s_io_watcher_offset: dwarf.struct_member_offset("uv_stream_s", "io_watcher")?
            as i32,
        uv_io_s_fd_offset: dwarf.struct_member_offset("uv__io_s", "fd")? as i32,
    })
}

/// DWARF when available (debug builds of node), version table
/// otherwise. Node's debug info is huge, so the common path is the
/// table.
pub fn node_tlswrap_symaddrs(
    dwarf: Option<&DwarfReader>,
    ver: SemVer,
) -> Result<NodeTlsWrapSymAddrs> {
    if let Some(dwarf) = dwarf {
        if let Ok(symaddrs) = node_tlswrap_symaddrs_from_dwarf(dwarf) {
            return Ok(symaddrs);
        }
    }
    node_tlswrap_symaddrs_from_version(ver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn test_layouts_are_fixed() {
        assert_eq!(size_of::<KernLoc>(), 8);
        assert_eq!(size_of::<OpensslSymAddrs>(), 8);
        assert_eq!(size_of::<GoCommonSymAddrs>(), 72);
        assert_eq!(size_of::<GoTlsSymAddrs>(), 64);
        assert_eq!(size_of::<NodeTlsWrapSymAddrs>(), 28);
        // 2 itabs + 27 member offsets, then 30 argument locations.
        assert_eq!(size_of::<GoHttp2SymAddrs>(), 29 * 8 + 30 * 8);
    }

    #[test]
    fn test_openssl_symaddrs_by_fix_version() {
        let v110 = openssl_symaddrs("/usr/lib/libssl.so.1.1.0k").unwrap();
        assert_eq!(v110.ssl_rbio_offset, 0x10);
        assert_eq!(v110.rbio_num_offset, 0x28);

        let v111 = openssl_symaddrs("/usr/lib/x86_64-linux-gnu/libssl.so.1.1").unwrap();
        assert_eq!(v111.rbio_num_offset, 0x30);
    }

    #[test]
    fn test_node_version_table_floor() {
        let v12 = node_tlswrap_symaddrs_from_version(SemVer::new(12, 3, 1)).unwrap();
        assert_eq!(v12.tlswrap_stream_listener_offset, 0x130);

        // 12.20 floors to the 12.16.2 entry.
        let v12_20 = node_tlswrap_symaddrs_from_version(SemVer::new(12, 20, 0)).unwrap();
        assert_eq!(v12_20.tlswrap_stream_listener_offset, 0x138);

        let v15 = node_tlswrap_symaddrs_from_version(SemVer::new(15, 0, 0)).unwrap();
        assert_eq!(v15.tlswrap_stream_listener_offset, 0x78);

        let v16 = node_tlswrap_symaddrs_from_version(SemVer::new(16, 9, 0)).unwrap();
        assert_eq!(v16, v15);

        assert!(node_tlswrap_symaddrs_from_version(SemVer::new(11, 0, 0)).is_err());
    }

    #[test]
    fn test_kern_loc_sp_correction() {
        let mut args = HashMap::new();
        args.insert(
            "b".to_string(),
            ArgLocation {
                kind: LocationKind::Stack,
                offset: 16,
            },
        );
        args.insert(
            "c".to_string(),
            ArgLocation {
                kind: LocationKind::Register,
                offset: 3,
            },
        );

        let b = kern_loc(&args, "b");
        assert_eq!(b.kind, LOC_STACK);
        assert_eq!(b.offset, 24); // 16 + SP correction

        let c = kern_loc(&args, "c");
        assert_eq!(c.kind, LOC_REGISTERS);
        assert_eq!(c.offset, 3);

        assert_eq!(kern_loc(&args, "missing"), KernLoc::INVALID);
    }

    #[test]
    fn test_plus_preserves_invalid() {
        assert_eq!(plus(KernLoc::INVALID, 8), KernLoc::INVALID);
        let loc = KernLoc {
            kind: LOC_STACK,
            offset: 8,
        };
        assert_eq!(plus(loc, 8).offset, 16);
    }
}
