//! Relocation reconciliation.
//!
//! A relocatable object patches its debug sections at link time. For every
//! datum the checker reads it must therefore also decide whether a relocation
//! applies there, substitute the relocated value, and afterwards complain
//! about relocations that nothing consumed. The per-section entries are kept
//! sorted by offset and walked with a monotone cursor.

use crate::messages::{Categories, Messages, Where};
use crate::model::{ElfFile, FileKind, Machine, SectionId, Symbol};

/// One relocation entry of a section.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RelocEntry {
    pub offset: u64,
    /// Raw ELF relocation type (`r_type`).
    pub rtype: u32,
    pub symbol_index: usize,
    pub addend: i64,
}

/// What the relocated datum is expected to be.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RelocTarget {
    /// An ordinary value; any symbol will do.
    Value,
    /// A code or data address; the symbol should live in an allocated
    /// section.
    Address,
    /// An offset into `.debug_info`.
    SecInfo,
}

/// How to treat relocations the cursor passes over on its way to an offset.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SkipPolicy {
    /// Passed-over entries indicate misordered or stale references; report
    /// each one.
    Mismatched,
    /// Passed-over entries belong to bytes known to be unreferenced; skip
    /// silently.
    Unref,
    /// Accept anything silently.
    Ok,
}

/// A section's relocations plus the cursor of the current checking pass.
#[derive(Clone, Debug, Default)]
pub struct RelocationData {
    entries: Vec<RelocEntry>,
    index: usize,
}

impl RelocationData {
    /// Takes ownership of the entries, sorting them by offset.
    pub fn new(mut entries: Vec<RelocEntry>) -> Self {
        entries.sort_by_key(|r| r.offset);
        Self { entries, index: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resets the cursor for a fresh pass.
    pub fn rewind(&mut self) {
        self.index = 0;
    }

    /// Advances to `min_off`, handling passed-over entries per `policy`, and
    /// consumes and returns the entry at exactly `min_off` if there is one.
    pub fn next(
        &mut self,
        min_off: u64,
        policy: SkipPolicy,
        wh: &Where,
        messages: &mut Messages,
    ) -> Option<RelocEntry> {
        while let Some(rel) = self.entries.get(self.index) {
            if rel.offset < min_off {
                if policy == SkipPolicy::Mismatched {
                    messages.message(
                        Categories::RELOC | Categories::ERROR,
                        wh,
                        format!(
                            "relocation at {:#x} relocates bytes that no datum covers",
                            rel.offset
                        ),
                    );
                }
                self.index += 1;
                continue;
            }
            if rel.offset == min_off {
                self.index += 1;
                return Some(*rel);
            }
            return None;
        }
        None
    }

    /// Shorthand for fast-forwarding the cursor without consuming an entry.
    pub fn skip_to(&mut self, min_off: u64, policy: SkipPolicy, wh: &Where, messages: &mut Messages) {
        while let Some(rel) = self.entries.get(self.index) {
            if rel.offset >= min_off {
                break;
            }
            if policy == SkipPolicy::Mismatched {
                messages.message(
                    Categories::RELOC | Categories::ERROR,
                    wh,
                    format!(
                        "relocation at {:#x} relocates bytes that no datum covers",
                        rel.offset
                    ),
                );
            }
            self.index += 1;
        }
    }

    /// Reports every entry the pass never consumed. Call after a section's
    /// checks are done.
    pub fn skip_rest(&mut self, section: SectionId, messages: &mut Messages) {
        let wh = Where::new(section);
        while let Some(rel) = self.entries.get(self.index) {
            messages.message(
                Categories::RELOC | Categories::ERROR,
                &wh,
                format!(
                    "relocation at {:#x} refers to bytes that were never validated",
                    rel.offset
                ),
            );
            self.index += 1;
        }
    }
}

/// Width in bytes of the "simple" relocation types per machine, i.e. those
/// that plainly store `symbol + addend` into a 4- or 8-byte field. Everything
/// else is unsuitable for debug section data.
fn simple_reloc_width(machine: Machine, rtype: u32) -> Option<u8> {
    use object::elf;
    match machine {
        Machine::I386 => match rtype {
            elf::R_386_32 => Some(4),
            _ => None,
        },
        Machine::X86_64 => match rtype {
            elf::R_X86_64_32 | elf::R_X86_64_32S => Some(4),
            elf::R_X86_64_64 => Some(8),
            _ => None,
        },
        Machine::Other => None,
    }
}

/// Applies one relocation to `value`.
///
/// Checks that the relocation type stores a plain `width`-byte value, that
/// the symbol exists, and that it is plausible for `target`; then substitutes
/// `symbol.value + addend`. Returns the symbol so that range-pair checks can
/// compare begin and end. Diagnoses, but still substitutes, implausible
/// symbols; returns `None` only when the relocation is unusable.
pub fn relocate_one<'f>(
    file: &'f ElfFile,
    rel: &RelocEntry,
    width: u8,
    value: &mut u64,
    target: RelocTarget,
    wh: &Where,
    messages: &mut Messages,
) -> Option<&'f Symbol> {
    if file.kind != FileKind::Relocatable {
        messages.message(
            Categories::RELOC | Categories::IMPACT_2,
            wh,
            format!("relocation at {:#x} in a non-relocatable file", rel.offset),
        );
    }

    let Some(found_width) = simple_reloc_width(file.machine, rel.rtype) else {
        messages.message(
            Categories::RELOC | Categories::ERROR,
            wh,
            format!("relocation type {} is not usable for debug data", rel.rtype),
        );
        return None;
    };
    if found_width != width {
        messages.message(
            Categories::RELOC | Categories::ERROR,
            wh,
            format!(
                "{}-byte relocation applied to a {}-byte datum at {:#x}",
                found_width, width, rel.offset
            ),
        );
        return None;
    }

    let Some(symbol) = file.symbol(rel.symbol_index) else {
        messages.message(
            Categories::RELOC | Categories::ERROR,
            wh,
            format!("relocation at {:#x} names symbol {}, which does not exist", rel.offset, rel.symbol_index),
        );
        return None;
    };

    match target {
        RelocTarget::Value => {}
        RelocTarget::Address => {
            let allocated = symbol
                .section
                .and_then(|i| file.sections.get(i))
                .map(|s| s.flags & u64::from(object::elf::SHF_ALLOC) != 0)
                .unwrap_or(false);
            if !allocated {
                messages.message(
                    Categories::RELOC | Categories::IMPACT_2,
                    wh,
                    format!(
                        "relocation at {:#x} should yield an address, but its symbol is not in an allocated section",
                        rel.offset
                    ),
                );
            }
        }
        RelocTarget::SecInfo => {
            let is_info = symbol
                .section
                .and_then(|i| file.sections.get(i))
                .map(|s| s.id == Some(SectionId::Info))
                .unwrap_or(false);
            if !is_info {
                messages.message(
                    Categories::RELOC | Categories::ERROR,
                    wh,
                    format!(
                        "relocation at {:#x} should resolve against .debug_info, but its symbol does not",
                        rel.offset
                    ),
                );
            }
        }
    }

    *value = symbol.value.wrapping_add(rel.addend as u64);
    Some(symbol)
}

/// Begin and end of a range pair must relocate against the same section.
pub fn check_range_relocations(
    cat: Categories,
    wh: &Where,
    begin_symbol: Option<&Symbol>,
    end_symbol: Option<&Symbol>,
    what: &str,
    messages: &mut Messages,
) {
    let (Some(begin), Some(end)) = (begin_symbol, end_symbol) else {
        return;
    };
    if begin.section != end.section {
        messages.message(
            cat | Categories::RELOC | Categories::ERROR,
            wh,
            format!("{} are relocated against different sections", what),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Section;
    use gimli::RunTimeEndian;

    fn test_file() -> ElfFile {
        ElfFile {
            endian: RunTimeEndian::Little,
            addr_64: false,
            kind: FileKind::Relocatable,
            machine: Machine::I386,
            sections: vec![
                Section {
                    name: ".text".into(),
                    size: 0x100,
                    flags: u64::from(object::elf::SHF_ALLOC | object::elf::SHF_EXECINSTR),
                    ..Default::default()
                },
                Section {
                    name: ".debug_info".into(),
                    size: 0x40,
                    id: Some(SectionId::Info),
                    ..Default::default()
                },
            ],
            symbols: vec![
                Symbol { name: "text_sym".into(), value: 0x1000, section: Some(0) },
                Symbol { name: "info_sym".into(), value: 0, section: Some(1) },
            ],
        }
    }

    #[test]
    fn cursor_consumes_in_order() {
        let mut rel = RelocationData::new(vec![
            RelocEntry { offset: 8, rtype: object::elf::R_386_32, symbol_index: 0, addend: 0 },
            RelocEntry { offset: 0, rtype: object::elf::R_386_32, symbol_index: 0, addend: 0 },
        ]);
        let mut messages = Messages::new();
        let wh = Where::new(SectionId::Ranges);
        assert_eq!(rel.next(0, SkipPolicy::Mismatched, &wh, &mut messages).map(|r| r.offset), Some(0));
        // Nothing at offset 4; the entry at 8 stays put.
        assert_eq!(rel.next(4, SkipPolicy::Mismatched, &wh, &mut messages), None);
        assert_eq!(rel.next(8, SkipPolicy::Mismatched, &wh, &mut messages).map(|r| r.offset), Some(8));
        assert!(messages.diagnostics().is_empty());
    }

    #[test]
    fn mismatched_skips_are_reported() {
        let mut rel = RelocationData::new(vec![RelocEntry {
            offset: 2,
            rtype: object::elf::R_386_32,
            symbol_index: 0,
            addend: 0,
        }]);
        let mut messages = Messages::new();
        let wh = Where::new(SectionId::Ranges);
        assert_eq!(rel.next(4, SkipPolicy::Mismatched, &wh, &mut messages), None);
        assert_eq!(messages.error_count(), 1);

        let mut rel = RelocationData::new(vec![RelocEntry {
            offset: 2,
            rtype: object::elf::R_386_32,
            symbol_index: 0,
            addend: 0,
        }]);
        let mut messages = Messages::new();
        assert_eq!(rel.next(4, SkipPolicy::Unref, &wh, &mut messages), None);
        assert!(messages.diagnostics().is_empty());
    }

    #[test]
    fn skip_rest_reports_leftovers() {
        let mut rel = RelocationData::new(vec![
            RelocEntry { offset: 0, rtype: 0, symbol_index: 0, addend: 0 },
            RelocEntry { offset: 4, rtype: 0, symbol_index: 0, addend: 0 },
        ]);
        let mut messages = Messages::new();
        rel.skip_rest(SectionId::Loc, &mut messages);
        assert_eq!(messages.error_count(), 2);
    }

    #[test]
    fn relocate_substitutes_symbol_plus_addend() {
        let file = test_file();
        let mut messages = Messages::new();
        let wh = Where::new(SectionId::Ranges);
        let rel = RelocEntry { offset: 0, rtype: object::elf::R_386_32, symbol_index: 0, addend: 0x20 };
        let mut value = 0u64;
        let sym = relocate_one(&file, &rel, 4, &mut value, RelocTarget::Value, &wh, &mut messages);
        assert_eq!(value, 0x1020);
        assert_eq!(sym.map(|s| s.name.as_str()), Some("text_sym"));
        assert!(messages.diagnostics().is_empty());
    }

    #[test]
    fn relocate_rejects_width_mismatch() {
        let file = test_file();
        let mut messages = Messages::new();
        let wh = Where::new(SectionId::Ranges);
        let rel = RelocEntry { offset: 0, rtype: object::elf::R_386_32, symbol_index: 0, addend: 0 };
        let mut value = 7u64;
        let sym = relocate_one(&file, &rel, 8, &mut value, RelocTarget::Value, &wh, &mut messages);
        assert!(sym.is_none());
        assert_eq!(value, 7);
        assert_eq!(messages.error_count(), 1);
    }

    #[test]
    fn sec_info_target_wants_info_symbol() {
        let file = test_file();
        let mut messages = Messages::new();
        let wh = Where::new(SectionId::Loc);
        let rel = RelocEntry { offset: 0, rtype: object::elf::R_386_32, symbol_index: 0, addend: 0 };
        let mut value = 0u64;
        relocate_one(&file, &rel, 4, &mut value, RelocTarget::SecInfo, &wh, &mut messages);
        assert_eq!(messages.error_count(), 1);

        let mut messages = Messages::new();
        let rel = RelocEntry { offset: 0, rtype: object::elf::R_386_32, symbol_index: 1, addend: 0 };
        relocate_one(&file, &rel, 4, &mut value, RelocTarget::SecInfo, &wh, &mut messages);
        assert!(messages.diagnostics().is_empty());
    }

    #[test]
    fn differing_sections_for_range_pair() {
        let file = test_file();
        let mut messages = Messages::new();
        let wh = Where::new(SectionId::Ranges);
        check_range_relocations(
            Categories::RANGES,
            &wh,
            Some(&file.symbols[0]),
            Some(&file.symbols[1]),
            "begin and end address",
            &mut messages,
        );
        assert_eq!(messages.error_count(), 1);
    }
}
