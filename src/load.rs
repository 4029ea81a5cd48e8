//! Host side: turns an `object::File` into the checker's data model.
//!
//! The container is parsed by `object` (sections, flags, relocations,
//! symbols) and the `.debug_info` tree is walked with gimli, only to gather
//! what the structural passes need: unit heads, the root `DW_AT_low_pc`, DIE
//! start offsets, and every reference a DIE attribute makes into another
//! debug section. No byte of `.debug_loc`/`.debug_ranges` is interpreted
//! here; that is the checker's own job.

use crate::messages::{Messages, Where};
use crate::model::{Cu, CuHead, ElfFile, FileKind, Machine, Ref, Section, SectionId, Symbol};
use crate::reloc::{RelocEntry, RelocationData};
use crate::FileError;

use object::{Object, ObjectSection, ObjectSymbol, RelocationFlags, RelocationTarget, SectionFlags};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

// Internal type abbreviations
type RtArcReader = gimli::EndianReader<gimli::RunTimeEndian, Arc<[u8]>>;

/// Attributes whose section-offset form points into `.debug_loc`.
fn is_location_attrib(name: gimli::DwAt) -> bool {
    use gimli::constants as dw;
    matches!(
        name,
        dw::DW_AT_location
            | dw::DW_AT_string_length
            | dw::DW_AT_return_addr
            | dw::DW_AT_data_member_location
            | dw::DW_AT_frame_base
            | dw::DW_AT_segment
            | dw::DW_AT_static_link
            | dw::DW_AT_use_location
            | dw::DW_AT_vtable_elem_location
    )
}

fn load_sections(object: &object::File) -> Result<(Vec<Section>, BTreeMap<usize, usize>), FileError> {
    let mut sections = Vec::new();
    let mut index_map = BTreeMap::new();

    for sec in object.sections() {
        let name = sec.name().unwrap_or("").to_string();
        let flags = match sec.flags() {
            SectionFlags::Elf { sh_flags } => sh_flags,
            _ => 0,
        };
        // Data is considered missing when the file carries no bytes for a
        // section that claims some (stripped info, SHT_NOBITS).
        let data = sec
            .uncompressed_data()
            .ok()
            .map(|c| c.into_owned())
            .filter(|d| !d.is_empty() || sec.size() == 0);

        let rel_entries: Vec<RelocEntry> = sec
            .relocations()
            .filter_map(|(offset, r)| {
                let rtype = match r.flags() {
                    RelocationFlags::Elf { r_type } => r_type,
                    _ => return None,
                };
                let symbol_index = match r.target() {
                    RelocationTarget::Symbol(s) => s.0,
                    _ => return None,
                };
                Some(RelocEntry { offset, rtype, symbol_index, addend: r.addend() })
            })
            .collect();

        index_map.insert(sec.index().0, sections.len());
        sections.push(Section {
            id: SectionId::from_section_name(&name),
            name,
            addr: sec.address(),
            size: sec.size(),
            flags,
            addralign: sec.align(),
            data,
            rel: RelocationData::new(rel_entries),
        });
    }

    Ok((sections, index_map))
}

fn load_symbols(object: &object::File, index_map: &BTreeMap<usize, usize>) -> Vec<Symbol> {
    let top = object.symbols().map(|s| s.index().0).max();
    let mut symbols = vec![
        Symbol { name: String::new(), value: 0, section: None };
        top.map(|t| t + 1).unwrap_or(0)
    ];
    for sym in object.symbols() {
        symbols[sym.index().0] = Symbol {
            name: sym.name().unwrap_or("").to_string(),
            value: sym.address(),
            section: sym.section_index().and_then(|i| index_map.get(&i.0).copied()),
        };
    }
    symbols
}

/// Walks one unit's DIEs, recording starts and outgoing references.
fn load_unit_refs(unit: &gimli::Unit<RtArcReader>, cu: &mut Cu) -> Result<(), FileError> {
    use gimli::constants as dw;
    use gimli::{AttributeValue, UnitSectionOffset};

    let mut entries = unit.entries();
    let mut root = true;
    while let Some(()) = entries.next_entry()? {
        // Null entries close sibling chains; they carry nothing of interest.
        let Some(entry) = entries.current() else {
            continue;
        };

        let die_off = match entry.offset().to_unit_section_offset(unit) {
            UnitSectionOffset::DebugInfoOffset(o) => o.0 as u64,
            UnitSectionOffset::DebugTypesOffset(_) => continue,
        };
        cu.die_addrs.push(die_off);
        let who = Where::new(SectionId::Info).with_addr(die_off);

        let mut attrs = entry.attrs();
        while let Some(attr) = attrs.next()? {
            match attr.name() {
                dw::DW_AT_low_pc if root => {
                    if let AttributeValue::Addr(a) = attr.value() {
                        cu.low_pc = Some(a);
                    }
                }
                dw::DW_AT_ranges => {
                    if let AttributeValue::RangeListsRef(o) = attr.value() {
                        cu.range_refs.push(Ref { addr: o.0 as u64, who: who.clone() });
                    }
                }
                dw::DW_AT_stmt_list => {
                    if let AttributeValue::DebugLineRef(o) = attr.value() {
                        cu.line_refs.push(Ref { addr: o.0 as u64, who: who.clone() });
                    }
                }
                name if is_location_attrib(name) => {
                    if let AttributeValue::LocationListsRef(o) = attr.value() {
                        cu.loc_refs.push(Ref { addr: o.0 as u64, who: who.clone() });
                    }
                }
                _ => {}
            }

            // DIE references, whatever the attribute.
            match attr.value() {
                AttributeValue::UnitRef(uo) => {
                    if let UnitSectionOffset::DebugInfoOffset(o) =
                        uo.to_unit_section_offset(unit)
                    {
                        cu.die_refs.push(Ref { addr: o.0 as u64, who: who.clone() });
                    }
                }
                AttributeValue::DebugInfoRef(o) => {
                    cu.die_refs.push(Ref { addr: o.0 as u64, who: who.clone() });
                }
                _ => {}
            }
        }
        root = false;
    }
    Ok(())
}

/// Parses the object into the checker's view of it: the section/symbol model
/// plus one `Cu` per compilation unit.
pub fn load_file(
    object: &object::File,
    messages: &mut Messages,
) -> Result<(ElfFile, Vec<Cu>), FileError> {
    let endian = if object.is_little_endian() {
        gimli::RunTimeEndian::Little
    } else {
        gimli::RunTimeEndian::Big
    };

    let (sections, index_map) = load_sections(object)?;
    let symbols = load_symbols(object, &index_map);

    let file = ElfFile {
        endian,
        addr_64: object.is_64(),
        kind: match object.kind() {
            object::ObjectKind::Relocatable => FileKind::Relocatable,
            _ => FileKind::Executable,
        },
        machine: match object.architecture() {
            object::Architecture::I386 => Machine::I386,
            object::Architecture::X86_64 => Machine::X86_64,
            _ => Machine::Other,
        },
        sections,
        symbols,
    };

    let load_section = |id: gimli::SectionId| -> Result<RtArcReader, FileError> {
        let cow = object
            .section_by_name(id.name())
            .map(|sect| sect.uncompressed_data())
            .transpose()?
            .unwrap_or_default();
        Ok(gimli::EndianReader::new(Arc::from(cow), endian))
    };
    let dwarf = gimli::Dwarf::load(load_section)?;

    let mut cus = Vec::new();
    let mut iter = dwarf.units();
    while let Some(header) = iter.next()? {
        let offset = match header.offset() {
            gimli::UnitSectionOffset::DebugInfoOffset(o) => o.0 as u64,
            gimli::UnitSectionOffset::DebugTypesOffset(_) => continue,
        };
        let encoding = header.encoding();
        let head = CuHead {
            offset,
            version: encoding.version,
            address_size: encoding.address_size,
            offset_size: encoding.format.word_size(),
            abbrev_offset: header.debug_abbrev_offset().0 as u64,
            total_size: header.length_including_self() as u64,
        };
        let unit = dwarf.unit(header)?;

        let mut cu = Cu::new(head);
        load_unit_refs(&unit, &mut cu)?;
        debug!(
            offset,
            dies = cu.die_addrs.len(),
            loc_refs = cu.loc_refs.len(),
            range_refs = cu.range_refs.len(),
            "unit loaded"
        );
        cus.push(cu);
    }

    // The later passes take the first unit's address size for the whole
    // file; units disagreeing with it get flagged here.
    if let Some(first) = cus.first() {
        let expected = first.head.address_size;
        for cu in &cus {
            if cu.head.address_size != expected {
                messages.error(
                    &Where::new(SectionId::Info).with_addr(cu.head.offset),
                    format!(
                        "address size {} differs from the first unit's {}",
                        cu.head.address_size, expected
                    ),
                );
            }
        }
    }

    Ok((file, cus))
}
