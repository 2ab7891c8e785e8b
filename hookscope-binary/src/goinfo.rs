//! Go toolchain detection for stripped-of-DWARF-or-not Go binaries.
//!
//! The `.go.buildinfo` section carries the toolchain version in one of
//! two layouts: pointer-based (pre-1.18) where offset 16 holds the
//! virtual address of a Go string header, and inline (1.18+) where a
//! varint-length-prefixed string sits at offset 32.

use crate::elf::ElfReader;
use tracing::debug;

const BUILDINFO_SECTION: &str = ".go.buildinfo";
const BUILDINFO_MAGIC: &[u8] = b"\xff Go buildinf:";
const FLAG_INLINE_STRINGS: u8 = 0x2;

impl ElfReader {
    /// True when the binary was produced by the Go toolchain.
    pub fn is_go_binary(&self) -> bool {
        self.has_section(BUILDINFO_SECTION) || self.has_section(".gopclntab")
    }

    /// Go toolchain version string, e.g. `go1.18.3`.
    pub fn go_version(&self) -> Option<String> {
        let (_, data) = self.section(BUILDINFO_SECTION)?;
        if data.len() < 32 || !data.starts_with(BUILDINFO_MAGIC) {
            return None;
        }
        let ptr_size = data[14] as usize;
        let flags = data[15];

        if flags & FLAG_INLINE_STRINGS != 0 {
            if let Some(v) = parse_inline_version(&data[32..]) {
                return Some(v);
            }
        } else if let Some(v) = self.read_pointer_version(data, ptr_size) {
            return Some(v);
        }

        // Last resort: the version string is in the section either way.
        let v = scan_go_version_string(data);
        if v.is_none() {
            debug!("go buildinfo present but version not recoverable");
        }
        v
    }

    /// True when any symbol mentions the package path. A containment
    /// check rather than a prefix one, because vendored copies carry a
    /// vendor-directory prefix ahead of the canonical import path.
    pub fn has_go_package(&self, package: &str) -> bool {
        self.list_symbols("", crate::SymbolMatchType::Prefix)
            .iter()
            .any(|s| s.name.contains(package))
    }

    fn read_pointer_version(&self, data: &[u8], ptr_size: usize) -> Option<String> {
        if ptr_size != 4 && ptr_size != 8 {
            return None;
        }
        let str_hdr_vaddr = read_uint(data.get(16..16 + ptr_size)?, ptr_size)?;
        let hdr_off = self.vaddr_to_file_offset(str_hdr_vaddr).ok()? as usize;
        let hdr = self.raw_data().get(hdr_off..hdr_off + 2 * ptr_size)?;
        let str_vaddr = read_uint(&hdr[..ptr_size], ptr_size)?;
        let str_len = read_uint(&hdr[ptr_size..], ptr_size)? as usize;
        if str_len == 0 || str_len > 64 {
            return None;
        }
        let str_off = self.vaddr_to_file_offset(str_vaddr).ok()? as usize;
        let bytes = self.raw_data().get(str_off..str_off + str_len)?;
        String::from_utf8(bytes.to_vec()).ok()
    }
}

/// Varint-length-prefixed string (Go 1.18+ inline layout).
fn parse_inline_version(data: &[u8]) -> Option<String> {
    let (len, consumed) = read_uvarint(data)?;
    let len = len as usize;
    if len == 0 || len > 64 {
        return None;
    }
    let bytes = data.get(consumed..consumed + len)?;
    String::from_utf8(bytes.to_vec()).ok()
}

/// Unsigned LEB128, as encoding/binary.Uvarint.
fn read_uvarint(data: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, b) in data.iter().enumerate().take(10) {
        value |= u64::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

fn read_uint(data: &[u8], size: usize) -> Option<u64> {
    match size {
        4 => Some(u32::from_le_bytes(data.get(..4)?.try_into().ok()?) as u64),
        8 => Some(u64::from_le_bytes(data.get(..8)?.try_into().ok()?)),
        _ => None,
    }
}

/// Scan raw section bytes for a `go1.x[.y]` run.
fn scan_go_version_string(data: &[u8]) -> Option<String> {
    let needle = b"go1.";
    let start = data
        .windows(needle.len())
        .position(|w| w == needle)?;
    let tail = &data[start..];
    let end = tail
        .iter()
        .position(|&b| !(b.is_ascii_alphanumeric() || b == b'.'))
        .unwrap_or(tail.len());
    let s = std::str::from_utf8(&tail[..end]).ok()?;
    if s.len() > 4 {
        Some(s.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_uvarint() {
        assert_eq!(read_uvarint(&[0x08, 0xaa]), Some((8, 1)));
        assert_eq!(read_uvarint(&[0x80, 0x01]), Some((128, 2)));
        assert_eq!(read_uvarint(&[]), None);
    }

    #[test]
    fn test_parse_inline_version() {
        let mut data = vec![0x08u8];
        data.extend_from_slice(b"go1.21.3");
        data.extend_from_slice(b"\x00garbage");
        assert_eq!(parse_inline_version(&data), Some("go1.21.3".to_string()));
    }

    #[test]
    fn test_parse_inline_version_truncated() {
        let data = [0x20u8, b'g', b'o'];
        assert_eq!(parse_inline_version(&data), None);
    }

    #[test]
    fn test_scan_go_version_string() {
        let mut data = vec![0u8; 17];
        data.extend_from_slice(b"go1.18.3");
        data.push(0);
        assert_eq!(scan_go_version_string(&data), Some("go1.18.3".to_string()));
        assert_eq!(scan_go_version_string(b"no version here"), None);
    }
}
