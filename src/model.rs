//! Data model for the object file under test.
//!
//! This is the validator's view of the host-parsed object: the section table
//! with per-section relocations, the symbol table, and the chain of
//! compilation units with the references each one makes into other debug
//! sections. Everything here is built once by the loader and immutable during
//! the checking passes (relocation cursors excepted).

use crate::messages::Where;
use crate::reloc::RelocationData;

/// Tag for the debug sections the checker knows about.
///
/// `LocExpr` is not a real section; it tags the frames of a containment path
/// that point inside a location expression.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SectionId {
    Info,
    Abbrev,
    Aranges,
    Line,
    Loc,
    Ranges,
    Str,
    LocExpr,
}

impl SectionId {
    pub fn name(self) -> &'static str {
        match self {
            SectionId::Info => ".debug_info",
            SectionId::Abbrev => ".debug_abbrev",
            SectionId::Aranges => ".debug_aranges",
            SectionId::Line => ".debug_line",
            SectionId::Loc => ".debug_loc",
            SectionId::Ranges => ".debug_ranges",
            SectionId::Str => ".debug_str",
            SectionId::LocExpr => "location expression",
        }
    }

    /// Inverse of `name`, for real sections only.
    pub fn from_section_name(name: &str) -> Option<SectionId> {
        match name {
            ".debug_info" => Some(SectionId::Info),
            ".debug_abbrev" => Some(SectionId::Abbrev),
            ".debug_aranges" => Some(SectionId::Aranges),
            ".debug_line" => Some(SectionId::Line),
            ".debug_loc" => Some(SectionId::Loc),
            ".debug_ranges" => Some(SectionId::Ranges),
            ".debug_str" => Some(SectionId::Str),
            _ => None,
        }
    }
}

/// One section of the object file.
///
/// `data` is absent when the section carries no bytes in the file (stripped
/// debug info, `SHT_NOBITS`).
#[derive(Clone, Debug, Default)]
pub struct Section {
    pub name: String,
    pub addr: u64,
    pub size: u64,
    pub flags: u64,
    pub addralign: u64,
    pub data: Option<Vec<u8>>,
    pub id: Option<SectionId>,
    pub rel: RelocationData,
}

/// File kind as far as relocation handling cares: relocatable objects carry
/// relocations the checker must reconcile; linked files do not.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FileKind {
    Relocatable,
    Executable,
}

/// Architecture of the file, for the simple-relocation-type tables.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Machine {
    I386,
    X86_64,
    Other,
}

/// A symbol as far as relocation application cares: its value and its
/// defining section. Two relocations resolve "against the same section" when
/// their symbols' `section` indices agree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub value: u64,
    pub section: Option<usize>,
}

/// The host-parsed object file.
#[derive(Clone, Debug)]
pub struct ElfFile {
    pub endian: gimli::RunTimeEndian,
    pub addr_64: bool,
    pub kind: FileKind,
    pub machine: Machine,
    pub sections: Vec<Section>,
    pub symbols: Vec<Symbol>,
}

impl ElfFile {
    /// Index of the debug section tagged `id`, if the file has one.
    pub fn debug_section(&self, id: SectionId) -> Option<usize> {
        self.sections.iter().position(|s| s.id == Some(id))
    }

    pub fn symbol(&self, index: usize) -> Option<&Symbol> {
        self.symbols.get(index)
    }
}

/// A reference into some debug section, attested by a DIE attribute.
#[derive(Clone, Debug)]
pub struct Ref {
    pub addr: u64,
    /// Where the referencing attribute lives.
    pub who: Where,
}

/// Parsed header of a compilation unit.
#[derive(Copy, Clone, Debug)]
pub struct CuHead {
    /// Offset of the unit within `.debug_info`.
    pub offset: u64,
    pub version: u16,
    /// Address size on the target machine, in bytes (4 or 8).
    pub address_size: u8,
    /// Offset size of this unit's format, in bytes (4 or 8).
    pub offset_size: u8,
    pub abbrev_offset: u64,
    /// Unit size including the initial length field.
    pub total_size: u64,
}

/// One compilation unit and the references it makes.
#[derive(Clone, Debug)]
pub struct Cu {
    pub head: CuHead,
    /// `DW_AT_low_pc` of the CU DIE; seeds the base address of location and
    /// range list walks. Absent when the CU has no code.
    pub low_pc: Option<u64>,
    /// Offsets within `.debug_info` where this unit's DIEs begin.
    pub die_addrs: Vec<u64>,
    /// DIE references, possibly into other units.
    pub die_refs: Vec<Ref>,
    /// References into `.debug_loc`.
    pub loc_refs: Vec<Ref>,
    /// References into `.debug_ranges`.
    pub range_refs: Vec<Ref>,
    /// References into `.debug_line`. Collected for the line pass, which
    /// lives outside this crate.
    pub line_refs: Vec<Ref>,
}

impl Cu {
    pub fn new(head: CuHead) -> Self {
        Self {
            head,
            low_pc: None,
            die_addrs: Vec::new(),
            die_refs: Vec::new(),
            loc_refs: Vec::new(),
            range_refs: Vec::new(),
            line_refs: Vec::new(),
        }
    }
}
