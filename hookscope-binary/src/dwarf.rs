use crate::{BinaryError, Result};
use gimli::{Dwarf, EndianSlice, LittleEndian, Reader};
use object::{Object, ObjectSection};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

type Slice = EndianSlice<'static, LittleEndian>;

/// Where a function argument lives at function entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationKind {
    Stack,
    Register,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgLocation {
    pub kind: LocationKind,
    pub offset: i64,
}

impl ArgLocation {
    pub const INVALID: ArgLocation = ArgLocation {
        kind: LocationKind::Invalid,
        offset: -1,
    };
}

/// Reads struct layouts and argument locations from DWARF.
///
/// Probes cannot chase types at runtime; everything the kernel handler
/// needs is resolved here to flat byte offsets and entry-point argument
/// locations, then shipped through the symaddr maps.
pub struct DwarfReader {
    dwarf: Dwarf<Slice>,
    // Backing store for the 'static section slices below.
    _data: Box<[u8]>,
}

impl std::fmt::Debug for DwarfReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DwarfReader{..}")
    }
}

impl DwarfReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?.into_boxed_slice();
        let object_file = object::File::parse(&*data)
            .map_err(|e| BinaryError::Corrupt(format!("{}: {e}", path.display())))?;

        let has_debug_info = object_file
            .section_by_name(".debug_info")
            .and_then(|s| s.data().ok().map(|d| !d.is_empty()))
            .unwrap_or(false);
        if !has_debug_info {
            return Err(BinaryError::NoDebugInfo);
        }

        let load_section = |id: gimli::SectionId| -> std::result::Result<Slice, gimli::Error> {
            let section_data = object_file
                .section_by_name(id.name())
                .and_then(|s| s.data().ok())
                .unwrap_or(&[]);
            // SAFETY: the file bytes are kept alive in self._data for
            // the lifetime of the reader.
            let static_data =
                unsafe { std::slice::from_raw_parts(section_data.as_ptr(), section_data.len()) };
            Ok(EndianSlice::new(static_data, LittleEndian))
        };
        let dwarf = Dwarf::load(load_section)?;

        info!("loaded DWARF from {}", path.display());
        Ok(Self { dwarf, _data: data })
    }

    /// Byte offset of `member` within the struct named `type_name`.
    pub fn struct_member_offset(&self, type_name: &str, member: &str) -> Result<u64> {
        self.member_offset_impl(gimli::DW_TAG_structure_type, type_name, member)
    }

    /// Byte offset of `member` within the class named `type_name`.
    pub fn class_member_offset(&self, type_name: &str, member: &str) -> Result<u64> {
        self.member_offset_impl(gimli::DW_TAG_class_type, type_name, member)
    }

    /// Byte offset of the `parent` base-class subobject within `class`.
    pub fn class_parent_offset(&self, class: &str, parent: &str) -> Result<u64> {
        let mut units = self.dwarf.units();
        while let Some(header) = units.next()? {
            let unit = self.dwarf.unit(header)?;
            let mut entries = unit.entries();
            while let Some((_, entry)) = entries.next_dfs()? {
                if entry.tag() != gimli::DW_TAG_class_type
                    && entry.tag() != gimli::DW_TAG_structure_type
                {
                    continue;
                }
                if self.entry_name(&unit, entry).as_deref() != Some(class) {
                    continue;
                }
                let mut tree = unit.entries_tree(Some(entry.offset()))?;
                let root = tree.root()?;
                let mut children = root.children();
                while let Some(child) = children.next()? {
                    let child_entry = child.entry();
                    if child_entry.tag() != gimli::DW_TAG_inheritance {
                        continue;
                    }
                    if self.referenced_type_name(&unit, child_entry).as_deref() != Some(parent) {
                        continue;
                    }
                    if let Some(off) = member_location(child_entry)? {
                        return Ok(off);
                    }
                }
            }
        }
        Err(BinaryError::SymbolNotFound(format!(
            "parent {parent} of class {class}"
        )))
    }

    /// Entry-point locations of a function's formal parameters (and Go
    /// `~rN` return slots), keyed by parameter name.
    pub fn function_arg_locations(&self, function: &str) -> Result<HashMap<String, ArgLocation>> {
        let mut units = self.dwarf.units();
        while let Some(header) = units.next()? {
            let unit = self.dwarf.unit(header)?;
            let mut entries = unit.entries();
            while let Some((_, entry)) = entries.next_dfs()? {
                if entry.tag() != gimli::DW_TAG_subprogram {
                    continue;
                }
                let matches = self.entry_name(&unit, entry).as_deref() == Some(function)
                    || self.linkage_name(&unit, entry).as_deref() == Some(function);
                if !matches {
                    continue;
                }

                let mut args = HashMap::new();
                let mut tree = unit.entries_tree(Some(entry.offset()))?;
                let root = tree.root()?;
                let mut children = root.children();
                while let Some(child) = children.next()? {
                    let child_entry = child.entry();
                    if child_entry.tag() != gimli::DW_TAG_formal_parameter {
                        continue;
                    }
                    let name = match self.entry_name(&unit, child_entry) {
                        Some(n) => n,
                        None => continue,
                    };
                    let loc = self.parameter_location(&unit, child_entry)?;
                    args.insert(name, loc);
                }
                debug!("{}: {} parameter locations", function, args.len());
                return Ok(args);
            }
        }
        Err(BinaryError::SymbolNotFound(function.to_string()))
    }

    fn member_offset_impl(
        &self,
        tag: gimli::DwTag,
        type_name: &str,
        member: &str,
    ) -> Result<u64> {
        let mut units = self.dwarf.units();
        while let Some(header) = units.next()? {
            let unit = self.dwarf.unit(header)?;
            let mut entries = unit.entries();
            while let Some((_, entry)) = entries.next_dfs()? {
                if entry.tag() != tag {
                    continue;
                }
                if self.entry_name(&unit, entry).as_deref() != Some(type_name) {
                    continue;
                }
                let mut tree = unit.entries_tree(Some(entry.offset()))?;
                let root = tree.root()?;
                let mut children = root.children();
                while let Some(child) = children.next()? {
                    let child_entry = child.entry();
                    if child_entry.tag() != gimli::DW_TAG_member {
                        continue;
                    }
                    if self.entry_name(&unit, child_entry).as_deref() != Some(member) {
                        continue;
                    }
                    if let Some(off) = member_location(child_entry)? {
                        return Ok(off);
                    }
                }
            }
        }
        Err(BinaryError::SymbolNotFound(format!(
            "{type_name}.{member}"
        )))
    }

    fn entry_name(
        &self,
        unit: &gimli::Unit<Slice>,
        entry: &gimli::DebuggingInformationEntry<Slice>,
    ) -> Option<String> {
        let attr = entry.attr_value(gimli::DW_AT_name).ok()??;
        let s = self.dwarf.attr_string(unit, attr).ok()?;
        Some(s.to_string_lossy().into_owned())
    }

    fn linkage_name(
        &self,
        unit: &gimli::Unit<Slice>,
        entry: &gimli::DebuggingInformationEntry<Slice>,
    ) -> Option<String> {
        let attr = entry.attr_value(gimli::DW_AT_linkage_name).ok()??;
        let s = self.dwarf.attr_string(unit, attr).ok()?;
        Some(s.to_string_lossy().into_owned())
    }

    fn referenced_type_name(
        &self,
        unit: &gimli::Unit<Slice>,
        entry: &gimli::DebuggingInformationEntry<Slice>,
    ) -> Option<String> {
        match entry.attr_value(gimli::DW_AT_type).ok()?? {
            gimli::AttributeValue::UnitRef(offset) => {
                let referenced = unit.entry(offset).ok()?;
                self.entry_name(unit, &referenced)
            }
            _ => None,
        }
    }

    fn parameter_location(
        &self,
        unit: &gimli::Unit<Slice>,
        entry: &gimli::DebuggingInformationEntry<Slice>,
    ) -> Result<ArgLocation> {
        let attr = match entry.attr_value(gimli::DW_AT_location)? {
            Some(a) => a,
            None => return Ok(ArgLocation::INVALID),
        };
        match attr {
            gimli::AttributeValue::Exprloc(expr) => Ok(parse_simple_location(expr.0)),
            gimli::AttributeValue::LocationListsRef(offset) => {
                // Entry-point semantics: the first range of a location
                // list covers the function prologue.
                let mut locations = self.dwarf.locations(unit, offset)?;
                if let Some(entry) = locations.next()? {
                    Ok(parse_simple_location(entry.data.0))
                } else {
                    Ok(ArgLocation::INVALID)
                }
            }
            _ => Ok(ArgLocation::INVALID),
        }
    }
}

/// Decode the small subset of DWARF location expressions that describe
/// entry-point argument positions: `DW_OP_fbreg`, `DW_OP_regN`,
/// `DW_OP_regx`, `DW_OP_bregN`, `DW_OP_call_frame_cfa`.
fn parse_simple_location(expr: Slice) -> ArgLocation {
    let mut r = expr;
    let op = match r.read_u8() {
        Ok(op) => op,
        Err(_) => return ArgLocation::INVALID,
    };
    match op {
        // DW_OP_fbreg
        0x91 => match r.read_sleb128() {
            Ok(off) => ArgLocation {
                kind: LocationKind::Stack,
                offset: off,
            },
            Err(_) => ArgLocation::INVALID,
        },
        // DW_OP_reg0..=DW_OP_reg31
        0x50..=0x6f => ArgLocation {
            kind: LocationKind::Register,
            offset: i64::from(op - 0x50),
        },
        // DW_OP_regx
        0x90 => match r.read_uleb128() {
            Ok(reg) => ArgLocation {
                kind: LocationKind::Register,
                offset: reg as i64,
            },
            Err(_) => ArgLocation::INVALID,
        },
        // DW_OP_breg0..=DW_OP_breg31
        0x70..=0x8f => match r.read_sleb128() {
            Ok(off) => ArgLocation {
                kind: LocationKind::Stack,
                offset: off,
            },
            Err(_) => ArgLocation::INVALID,
        },
        // DW_OP_call_frame_cfa
        0x9c => ArgLocation {
            kind: LocationKind::Stack,
            offset: 0,
        },
        _ => ArgLocation::INVALID,
    }
}

fn member_location(
    entry: &gimli::DebuggingInformationEntry<Slice>,
) -> Result<Option<u64>> {
    match entry.attr_value(gimli::DW_AT_data_member_location)? {
        Some(gimli::AttributeValue::Udata(v)) => Ok(Some(v)),
        Some(gimli::AttributeValue::Sdata(v)) if v >= 0 => Ok(Some(v as u64)),
        Some(gimli::AttributeValue::Exprloc(expr)) => {
            // DW_OP_plus_uconst <offset> is the classic encoding.
            let mut r = expr.0;
            match r.read_u8() {
                Ok(0x23) => Ok(r.read_uleb128().ok()),
                _ => Ok(None),
            }
        }
        _ => Ok(None),
    }
}
