use crate::{BinaryError, Result};
use object::{Object, ObjectSection, ObjectSymbol, SymbolKind};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// How a probe template's symbol predicate matches candidate symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolMatchType {
    Exact,
    Prefix,
    Suffix,
}

pub fn symbol_matches(name: &str, pattern: &str, match_type: SymbolMatchType) -> bool {
    match match_type {
        SymbolMatchType::Exact => name == pattern,
        SymbolMatchType::Prefix => name.starts_with(pattern),
        SymbolMatchType::Suffix => name.ends_with(pattern),
    }
}

/// A function symbol with its virtual address and extent.
#[derive(Debug, Clone)]
pub struct SymbolInfo {
    pub name: String,
    pub address: u64,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct SectionInfo {
    name: String,
    vaddr: u64,
    file_offset: u64,
    size: u64,
}

/// Reads ELF symbols and sections from a binary on disk.
///
/// Everything is extracted into owned tables at open time; the raw file
/// bytes are retained for instruction-level scans. All offsets handed
/// out for probe attachment are *file* offsets, translated from symbol
/// virtual addresses through the section table.
#[derive(Debug)]
pub struct ElfReader {
    path: PathBuf,
    data: Vec<u8>,
    symbols: Vec<SymbolInfo>,
    name_index: HashMap<String, usize>,
    sections: Vec<SectionInfo>,
}

impl ElfReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = std::fs::read(&path)?;
        if data.len() < 4 || &data[0..4] != b"\x7fELF" {
            return Err(BinaryError::NotElf(path));
        }
        let object_file = object::File::parse(&*data)
            .map_err(|e| BinaryError::Corrupt(format!("{}: {e}", path.display())))?;

        let mut symbols = Vec::new();
        let mut name_index = HashMap::new();
        // Dynamic symbols first: a library's exported SSL_read is what
        // probes bind to, and the dynamic entry carries the right extent.
        for sym in object_file.dynamic_symbols().chain(object_file.symbols()) {
            if sym.kind() != SymbolKind::Text && sym.kind() != SymbolKind::Data {
                continue;
            }
            let name = match sym.name() {
                Ok(n) if !n.is_empty() => n,
                _ => continue,
            };
            if !name_index.contains_key(name) {
                name_index.insert(name.to_string(), symbols.len());
                symbols.push(SymbolInfo {
                    name: name.to_string(),
                    address: sym.address(),
                    size: sym.size(),
                });
            }
        }

        let mut sections = Vec::new();
        for section in object_file.sections() {
            let name = match section.name() {
                Ok(n) => n.to_string(),
                Err(_) => continue,
            };
            if let Some((file_offset, size)) = section.file_range() {
                sections.push(SectionInfo {
                    name,
                    vaddr: section.address(),
                    file_offset,
                    size,
                });
            }
        }

        info!(
            "loaded {} symbols, {} sections from {}",
            symbols.len(),
            sections.len(),
            path.display()
        );
        Ok(Self {
            path,
            data,
            symbols,
            name_index,
            sections,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn raw_data(&self) -> &[u8] {
        &self.data
    }

    /// All symbols matching the predicate, in symbol-table order.
    pub fn list_symbols(&self, pattern: &str, match_type: SymbolMatchType) -> Vec<&SymbolInfo> {
        match match_type {
            SymbolMatchType::Exact => self
                .name_index
                .get(pattern)
                .map(|&i| vec![&self.symbols[i]])
                .unwrap_or_default(),
            _ => self
                .symbols
                .iter()
                .filter(|s| symbol_matches(&s.name, pattern, match_type))
                .collect(),
        }
    }

    /// Virtual address of a symbol by exact name (data symbols such as
    /// Go itabs included).
    pub fn symbol_address(&self, name: &str) -> Option<u64> {
        self.name_index.get(name).map(|&i| self.symbols[i].address)
    }

    pub fn has_symbol_prefix(&self, prefix: &str) -> bool {
        self.symbols.iter().any(|s| s.name.starts_with(prefix))
    }

    pub(crate) fn section(&self, name: &str) -> Option<(&SectionInfo, &[u8])> {
        let sec = self.sections.iter().find(|s| s.name == name)?;
        let start = sec.file_offset as usize;
        let end = start.checked_add(sec.size as usize)?;
        let bytes = self.data.get(start..end)?;
        Some((sec, bytes))
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.sections.iter().any(|s| s.name == name)
    }

    /// Translate a virtual address into a file offset via the section
    /// table.
    pub fn vaddr_to_file_offset(&self, vaddr: u64) -> Result<u64> {
        for sec in &self.sections {
            if vaddr >= sec.vaddr && vaddr < sec.vaddr + sec.size {
                return Ok(sec.file_offset + (vaddr - sec.vaddr));
            }
        }
        Err(BinaryError::Corrupt(format!(
            "vaddr {vaddr:#x} not covered by any section in {}",
            self.path.display()
        )))
    }

    /// File offset of a symbol's entry point (uprobe attach point).
    pub fn entry_offset(&self, sym: &SymbolInfo) -> Result<u64> {
        self.vaddr_to_file_offset(sym.address)
    }

    pub(crate) fn function_bytes(&self, sym: &SymbolInfo) -> Result<&[u8]> {
        let start = self.vaddr_to_file_offset(sym.address)? as usize;
        let end = start
            .checked_add(sym.size as usize)
            .filter(|&e| e <= self.data.len())
            .ok_or_else(|| {
                BinaryError::Corrupt(format!(
                    "symbol {} extent out of bounds in {}",
                    sym.name,
                    self.path.display()
                ))
            })?;
        Ok(&self.data[start..end])
    }

    /// File offsets of every return instruction inside the symbol's
    /// byte range. Used instead of epilogue-based uretprobes where the
    /// target runtime moves stacks (Go).
    pub fn ret_inst_offsets(&self, sym: &SymbolInfo) -> Result<Vec<u64>> {
        let base = self.vaddr_to_file_offset(sym.address)?;
        let code = self.function_bytes(sym)?;
        let offsets: Vec<u64> = scan_ret_offsets(code).iter().map(|o| base + o).collect();
        debug!(
            "{}: {} ret instructions in {}",
            self.path.display(),
            offsets.len(),
            sym.name
        );
        if offsets.is_empty() {
            return Err(BinaryError::SymbolNotFound(format!(
                "no return instructions in {}",
                sym.name
            )));
        }
        Ok(offsets)
    }
}

/// Offsets (relative to the start of `code`) of x86-64 return opcodes:
/// `ret` (0xc3) and `ret imm16` (0xc2).
pub fn scan_ret_offsets(code: &[u8]) -> Vec<u64> {
    let mut offsets = Vec::new();
    for (i, b) in code.iter().enumerate() {
        if *b == 0xc3 || *b == 0xc2 {
            offsets.push(i as u64);
        }
    }
    offsets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_matches() {
        assert!(symbol_matches("SSL_write", "SSL_write", SymbolMatchType::Exact));
        assert!(!symbol_matches("SSL_write_ex", "SSL_write", SymbolMatchType::Exact));
        assert!(symbol_matches(
            "_ZN4node7TLSWrapC2EPNS_11EnvironmentE",
            "_ZN4node7TLSWrapC2E",
            SymbolMatchType::Prefix
        ));
        assert!(symbol_matches(
            "go.example.com/vendor/crypto/tls.(*Conn).Write",
            "crypto/tls.(*Conn).Write",
            SymbolMatchType::Suffix
        ));
        assert!(!symbol_matches(
            "crypto/tls.(*Conn).Write",
            "crypto/tls.(*Conn).Read",
            SymbolMatchType::Suffix
        ));
    }

    #[test]
    fn test_scan_ret_offsets() {
        // push rbp; mov rbp,rsp; ret; nop; ret imm16
        let code = [0x55, 0x48, 0x89, 0xe5, 0xc3, 0x90, 0xc2, 0x08, 0x00];
        assert_eq!(scan_ret_offsets(&code), vec![4, 6]);
    }

    #[test]
    fn test_scan_ret_offsets_none() {
        let code = [0x55, 0x48, 0x89, 0xe5, 0x90];
        assert!(scan_ret_offsets(&code).is_empty());
    }

    #[test]
    fn test_open_rejects_non_elf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_elf");
        std::fs::write(&path, b"#!/bin/sh\necho hi\n").unwrap();
        assert!(matches!(
            ElfReader::open(&path),
            Err(BinaryError::NotElf(_))
        ));
    }

    #[test]
    fn test_open_self_and_lookup() {
        // The test runner itself is a convenient real ELF binary.
        let exe = std::env::current_exe().unwrap();
        let reader = ElfReader::open(&exe).unwrap();
        assert!(!reader.symbols.is_empty());
        assert!(reader.has_section(".text"));

        // main exists in every Rust test binary; its entry offset must
        // be translatable to a file offset.
        let mains = reader.list_symbols("main", SymbolMatchType::Exact);
        if let Some(main_sym) = mains.first() {
            assert!(reader.entry_offset(main_sym).is_ok());
        }
    }
}
