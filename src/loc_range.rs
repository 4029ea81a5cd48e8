//! Structural checking of `.debug_loc` and `.debug_ranges`.
//!
//! Both sections share one shape: lists of address pairs, terminated by
//! `(0, 0)`, with an escape pair selecting a new base address, and (for
//! `.debug_loc`) a length-prefixed location expression after each payload
//! pair. The checker walks every list that some DIE references, reconciles
//! relocations along the way, and accumulates byte coverage of the section so
//! that overlapping lists and unreferenced bytes can be reported afterwards.

use crate::coverage::{necessary_alignment, Coverage};
use crate::expr::check_location_expression;
use crate::messages::{Categories, Messages, Where};
use crate::model::{Cu, ElfFile, FileKind, Ref, SectionId};
use crate::reloc::{check_range_relocations, relocate_one, RelocTarget, SkipPolicy};

use tracing::debug;

/// Per-section coverage for the range→section analysis.
#[derive(Clone, Debug)]
struct SectionCoverage {
    /// Index into the file's section table.
    sec: usize,
    cov: Coverage,
    /// True once any range landed in this section.
    hit: bool,
    /// Report every range landing here; the section is allocated but not
    /// executable.
    warn: bool,
}

/// Coverage of every allocated section, fed from `.debug_ranges` payloads.
#[derive(Clone, Debug)]
pub struct CoverageMap {
    scos: Vec<SectionCoverage>,
    allow_overlap: bool,
}

impl CoverageMap {
    /// Builds the map over sections matching `mask`; those matching only
    /// `warn_mask` are tracked but flagged.
    pub fn new(file: &ElfFile, mask: u64, warn_mask: u64, allow_overlap: bool) -> Self {
        let scos = file
            .sections
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                let normal = s.flags & mask == mask;
                let warn = s.flags & warn_mask == warn_mask;
                (normal || warn).then(|| SectionCoverage {
                    sec: i,
                    cov: Coverage::new(),
                    hit: false,
                    warn: !normal,
                })
            })
            .collect();
        Self { scos, allow_overlap }
    }

    /// Projects one payload range `[address, address+length)` into every
    /// section it touches.
    fn add(
        &mut self,
        file: &ElfFile,
        address: u64,
        length: u64,
        wh: &Where,
        cat: Categories,
        messages: &mut Messages,
    ) {
        let mut found = false;
        let mut crosses_boundary = false;
        let mut overlap = false;
        let end = address + length;

        // How much of this range falls into mapped sections at all; whatever
        // is left uncovered falls nowhere and is reported.
        let mut range_cov = Coverage::new();

        for sco in &mut self.scos {
            let shdr = &file.sections[sco.sec];
            let s_end = shdr.addr + shdr.size;
            if end <= shdr.addr || address >= s_end {
                continue;
            }

            if found && !crosses_boundary {
                messages.message(
                    cat | Categories::IMPACT_2,
                    wh,
                    format!("the range [{:#x}, {:#x}) crosses section boundaries", address, end),
                );
                crosses_boundary = true;
            }
            found = true;

            if length == 0 {
                // Empty range: no coverage, and no further section can
                // contain it either.
                break;
            }

            let cov_begin = address.saturating_sub(shdr.addr);
            let cov_end = if end < s_end { end - shdr.addr } else { shdr.size };
            let cov_len = cov_end - cov_begin;
            let r_cov_begin = shdr.addr.saturating_sub(address);

            if !overlap && !self.allow_overlap && sco.cov.is_overlap(cov_begin, cov_len) {
                messages.message(
                    cat | Categories::IMPACT_2 | Categories::ERROR,
                    wh,
                    format!("the range [{:#x}, {:#x}) overlaps with another one", address, end),
                );
                overlap = true;
            }

            if sco.warn {
                messages.message(
                    cat | Categories::IMPACT_2,
                    wh,
                    format!(
                        "the range [{:#x}, {:#x}) covers section {}",
                        address, end, shdr.name
                    ),
                );
            }

            let _ = sco.cov.add(cov_begin, cov_len);
            sco.hit = true;
            let _ = range_cov.add(r_cov_begin, cov_len);
        }

        if !found {
            messages.error(
                wh,
                format!("couldn't find a section that the range [{:#x}, {:#x}) covers", address, end),
            );
        } else if length > 0 {
            range_cov.find_holes(0, length, |h_start, h_len| {
                messages.error(
                    wh,
                    format!(
                        "portion [{:#x}, {:#x}) of the range [{:#x}, {:#x}) doesn't fall into any ALLOC section",
                        address + h_start,
                        address + h_start + h_len,
                        address,
                        end
                    ),
                );
                true
            });
        }
    }

    /// Reports addresses of mapped sections that no range covered. Sections
    /// that were never hit are only held to this when they are executable and
    /// expected to carry code described by debug info.
    fn report_holes(&self, file: &ElfFile, sec_id: SectionId, cat: Categories, messages: &mut Messages) {
        let wh = Where::new(sec_id);
        for sco in &self.scos {
            let sec = &file.sections[sco.sec];
            let exec = sec.flags & u64::from(object::elf::SHF_EXECINSTR) != 0;
            if !sco.hit && (!exec || matches!(sec.name.as_str(), ".init" | ".fini" | ".plt")) {
                continue;
            }
            // For relocatable files the addresses are mangled by layout;
            // print section-relative ones.
            let base = if file.kind == FileKind::Relocatable { 0 } else { sec.addr };
            sco.cov.find_holes(0, sec.size, |begin, len| {
                let end = begin + len;
                if let Some(data) = &sec.data {
                    let zeroes = data
                        .get(begin as usize..end as usize)
                        .map(|b| b.iter().all(|&x| x == 0))
                        .unwrap_or(false);
                    if zeroes {
                        return true;
                    }
                } else if necessary_alignment(base + begin, len, sec.addralign) {
                    return true;
                }
                messages.message(
                    cat | Categories::ACC_SUBOPTIMAL | Categories::IMPACT_4,
                    &wh,
                    format!(
                        "addresses [{:#x}, {:#x}) of section {} are not covered",
                        begin + base,
                        end + base,
                        sec.name
                    ),
                );
                true
            });
        }
    }
}

/// State of one pass over `.debug_loc` or `.debug_ranges`.
struct LocRangePass<'a> {
    file: &'a ElfFile,
    sec_id: SectionId,
    cat: Categories,
    contains_locations: bool,
    /// Byte coverage of the section itself, for overlap and hole discovery.
    coverage: Coverage,
    coverage_map: Option<CoverageMap>,
    /// Accumulates `[base+begin, base+end)` of every healthy payload range.
    pc_coverage: Option<&'a mut Coverage>,
    rel: crate::reloc::RelocationData,
}

impl LocRangePass<'_> {
    /// Walks the list starting at `addr`. Returns false when the list is
    /// structurally unusable; recoverable findings are reported and the walk
    /// carries on to catch cascading issues in one pass.
    fn check_ref(
        &mut self,
        parent: &crate::readctx::ReadCtx<'_>,
        cu: &Cu,
        addr: u64,
        who: &Where,
        messages: &mut Messages,
    ) -> bool {
        let mut ctx = *parent;
        if ctx.skip(addr).is_err() {
            messages.error(
                who,
                format!(
                    "invalid reference outside the section {:#x}, size only {:#x}",
                    addr,
                    parent.size()
                ),
            );
            return false;
        }

        let mut retval = true;

        if self.coverage.is_covered(addr, 1) {
            messages.error(
                who,
                format!("reference to {:#x} points into another location or range list", addr),
            );
            retval = false;
        }

        let address_size = cu.head.address_size;
        let is_64 = address_size == 8;
        let asz = u64::from(address_size);
        let escape: u64 = if is_64 { u64::MAX } else { u64::from(u32::MAX) };

        let mut overlap = false;
        let mut base: Option<u64> = cu.low_pc;

        while !ctx.eof() {
            let entry_off = ctx.offset();
            let wh = Where::nested(self.sec_id, who).with_addr(entry_off);

            // Begin address.
            let begin_off = ctx.offset();
            if !overlap && self.coverage.is_overlap(begin_off, asz) {
                messages.error(&wh, "range definitions overlap");
                retval = false;
                overlap = true;
            }
            let mut begin_addr = match ctx.read_offset(is_64) {
                Ok(v) => v,
                Err(_) => {
                    messages.error(&wh, "can't read address range beginning");
                    return false;
                }
            };
            let mut begin_relocated = false;
            let mut begin_symbol = None;
            if let Some(r) = self.rel.next(begin_off, SkipPolicy::Mismatched, &wh, messages) {
                begin_relocated = true;
                begin_symbol = relocate_one(
                    self.file,
                    &r,
                    address_size,
                    &mut begin_addr,
                    RelocTarget::Value,
                    &wh,
                    messages,
                );
            }

            // End address.
            let end_off = ctx.offset();
            if !overlap && self.coverage.is_overlap(end_off, asz) {
                messages.error(&wh, "range definitions overlap");
                retval = false;
                overlap = true;
            }
            let mut end_addr = match ctx.read_offset(is_64) {
                Ok(v) => v,
                Err(_) => {
                    messages.error(&wh, "can't read address range ending");
                    return false;
                }
            };
            let mut end_relocated = false;
            if let Some(r) = self.rel.next(end_off, SkipPolicy::Mismatched, &wh, messages) {
                end_relocated = true;
                let end_symbol = relocate_one(
                    self.file,
                    &r,
                    address_size,
                    &mut end_addr,
                    RelocTarget::Value,
                    &wh,
                    messages,
                );
                if begin_addr != escape {
                    if !begin_relocated {
                        messages.message(
                            self.cat | Categories::IMPACT_2 | Categories::RELOC,
                            &wh,
                            "end of address range is relocated, but the beginning wasn't",
                        );
                    } else {
                        check_range_relocations(
                            self.cat,
                            &wh,
                            begin_symbol,
                            end_symbol,
                            "begin and end address",
                            messages,
                        );
                    }
                }
            } else if begin_relocated {
                messages.message(
                    self.cat | Categories::IMPACT_2 | Categories::RELOC,
                    &wh,
                    "end of address range is not relocated, but the beginning was",
                );
            }

            let mut done = false;
            if begin_addr == 0 && end_addr == 0 && !begin_relocated && !end_relocated {
                done = true;
            } else if begin_addr != escape {
                if base.is_none() {
                    messages.error(
                        &wh,
                        format!(
                            "address range with no base address set: [{:#x}, {:#x})",
                            begin_addr, end_addr
                        ),
                    );
                    // Not something that derails the rest of the entry.
                }

                if end_addr < begin_addr {
                    messages.message(
                        self.cat | Categories::ERROR,
                        &wh,
                        format!("has negative range [{:#x}, {:#x})", begin_addr, end_addr),
                    );
                } else if begin_addr == end_addr {
                    // An entry whose beginning and ending addresses are equal
                    // has no effect.
                    messages.message(
                        self.cat | Categories::ACC_BLOAT | Categories::IMPACT_3,
                        &wh,
                        "entry covers no range",
                    );
                } else if retval {
                    if let Some(b) = base {
                        let address = b.wrapping_add(begin_addr);
                        let length = end_addr - begin_addr;
                        if let Some(map) = &mut self.coverage_map {
                            map.add(self.file, address, length, &wh, self.cat, messages);
                        }
                        if let Some(pc) = self.pc_coverage.as_deref_mut() {
                            let _ = pc.add(address, length);
                        }
                    }
                }

                if self.contains_locations {
                    // Location expression length.
                    if !overlap && self.coverage.is_overlap(ctx.offset(), 2) {
                        messages.error(&wh, "range definitions overlap");
                        retval = false;
                        overlap = true;
                    }
                    let len = match ctx.read_2ubyte() {
                        Ok(l) => l,
                        Err(_) => {
                            messages.error(&wh, "can't read length of location expression");
                            return false;
                        }
                    };

                    // The expression itself.
                    let expr_start = ctx.offset();
                    if !check_location_expression(
                        self.file,
                        &ctx,
                        &cu.head,
                        &mut self.rel,
                        usize::from(len),
                        &wh,
                        messages,
                    ) {
                        return false;
                    }
                    if !overlap
                        && len > 0
                        && self.coverage.is_overlap(expr_start, u64::from(len))
                    {
                        messages.error(&wh, "range definitions overlap");
                        retval = false;
                        overlap = true;
                    }
                    if ctx.skip(u64::from(len)).is_err() {
                        messages.error(&wh, "not enough data for location expression");
                        return false;
                    }
                }
            } else {
                // Base address selector.
                if base == Some(end_addr) {
                    messages.message(
                        self.cat | Categories::ACC_BLOAT | Categories::IMPACT_3,
                        &wh,
                        format!(
                            "base address selection doesn't change base address ({:#x})",
                            end_addr
                        ),
                    );
                } else {
                    base = Some(end_addr);
                }
            }

            let entry_len = ctx.offset() - entry_off;
            if entry_len > 0 {
                let _ = self.coverage.add(entry_off, entry_len);
            }
            if done {
                break;
            }
        }

        retval
    }
}

/// Reports unreferenced bytes of the section once all lists are walked.
/// All-zero holes that look like alignment padding are tolerated.
fn report_section_holes(
    sec_id: SectionId,
    cat: Categories,
    data: &[u8],
    align: u64,
    coverage: &Coverage,
    messages: &mut Messages,
) {
    let wh = Where::new(sec_id);
    coverage.find_holes(0, data.len() as u64, |start, len| {
        let end = start + len;
        let all_zeroes = data[start as usize..end as usize].iter().all(|&b| b == 0);
        if all_zeroes {
            if !(align > 1 && end % align == 0 && start % 4 != 0 && len < align) {
                messages.message(
                    cat | Categories::ACC_BLOAT | Categories::IMPACT_1,
                    &wh,
                    format!("[{:#x}, {:#x}): unnecessary padding with zero bytes", start, end),
                );
            }
        } else {
            messages.message(
                cat | Categories::ACC_BLOAT | Categories::IMPACT_1,
                &wh,
                format!("[{:#x}, {:#x}): unreferenced non-zero bytes", start, end),
            );
        }
        true
    });
}

/// Checks the structure of `.debug_loc` or `.debug_ranges` (whichever
/// `sec_index` names) against every reference the CU chain makes into it.
///
/// `pc_coverage`, when given, accumulates the program addresses that healthy
/// payload ranges cover. `range_coverage` additionally projects
/// `.debug_ranges` payloads onto the allocated sections of the file.
pub fn check_loc_or_range_structural(
    file: &mut ElfFile,
    sec_index: usize,
    cus: &[Cu],
    mut pc_coverage: Option<&mut Coverage>,
    range_coverage: bool,
    messages: &mut Messages,
) -> bool {
    let Some(sec_id) = file.sections[sec_index].id else {
        return false;
    };
    debug_assert!(sec_id == SectionId::Loc || sec_id == SectionId::Ranges);
    let cat = if sec_id == SectionId::Loc {
        Categories::LOC
    } else {
        Categories::RANGES
    };

    if file.sections[sec_index].data.is_none() {
        messages.error(
            &Where::new(sec_id),
            "section data is missing, skipping check",
        );
        return false;
    }

    let mut rel = std::mem::take(&mut file.sections[sec_index].rel);
    rel.rewind();

    let retval = {
        let file = &*file;
        let sec = &file.sections[sec_index];
        let data = sec.data.as_deref().unwrap_or(&[]);
        let ctx = crate::readctx::ReadCtx::new(data, file.endian);

        // The range→section analysis applies to .debug_ranges only.
        let coverage_map = (range_coverage && sec_id == SectionId::Ranges).then(|| {
            CoverageMap::new(
                file,
                u64::from(object::elf::SHF_EXECINSTR | object::elf::SHF_ALLOC),
                u64::from(object::elf::SHF_ALLOC),
                sec_id == SectionId::Loc,
            )
        });

        let mut pass = LocRangePass {
            file,
            sec_id,
            cat,
            contains_locations: sec_id == SectionId::Loc,
            coverage: Coverage::new(),
            coverage_map,
            pc_coverage: pc_coverage.as_deref_mut(),
            rel,
        };

        // Relocation checking assumes the references are walked in
        // monotonically increasing order, which single CUs do not guarantee.
        // Merge all references into one sorted sequence and collapse
        // duplicates.
        let mut refs: Vec<(&Ref, &Cu)> = cus
            .iter()
            .flat_map(|cu| {
                let rec = if sec_id == SectionId::Loc { &cu.loc_refs } else { &cu.range_refs };
                rec.iter().map(move |r| (r, cu))
            })
            .collect();
        refs.sort_by_key(|(r, _)| r.addr);
        debug!(section = sec_id.name(), refs = refs.len(), "checking list references");

        let mut retval = true;
        let mut last_off = None;
        let wh_sec = Where::new(sec_id);
        for (r, cu) in refs {
            if last_off == Some(r.addr) {
                continue;
            }
            pass.rel.skip_to(r.addr, SkipPolicy::Unref, &wh_sec, messages);
            if !pass.check_ref(&ctx, cu, r.addr, &r.who, messages) {
                retval = false;
            }
            last_off = Some(r.addr);
        }

        if retval {
            pass.rel.skip_rest(sec_id, messages);

            // All CUs are expected to agree on the address size; take the
            // first one's for the padding heuristic.
            let align = cus.first().map(|cu| u64::from(cu.head.address_size)).unwrap_or(1);
            report_section_holes(sec_id, cat, data, align, &pass.coverage, messages);

            if let Some(map) = &pass.coverage_map {
                map.report_holes(file, sec_id, cat, messages);
            }
        }

        rel = pass.rel;
        retval
    };

    file.sections[sec_index].rel = rel;
    retval
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CuHead, Machine, Section};
    use crate::reloc::{RelocEntry, RelocationData};
    use gimli::RunTimeEndian;

    fn entry32(begin: u32, end: u32) -> Vec<u8> {
        let mut v = begin.to_le_bytes().to_vec();
        v.extend_from_slice(&end.to_le_bytes());
        v
    }

    fn head32() -> CuHead {
        CuHead {
            offset: 0,
            version: 4,
            address_size: 4,
            offset_size: 4,
            abbrev_offset: 0,
            total_size: 0x40,
        }
    }

    fn cu_with_refs(low_pc: Option<u64>, offsets: &[u64], loc: bool) -> Cu {
        let mut cu = Cu::new(head32());
        cu.low_pc = low_pc;
        for (i, &addr) in offsets.iter().enumerate() {
            let who = Where::new(SectionId::Info).with_addr(0x30 + 0x10 * i as u64);
            let r = Ref { addr, who };
            if loc {
                cu.loc_refs.push(r);
            } else {
                cu.range_refs.push(r);
            }
        }
        cu
    }

    fn debug_section(id: SectionId, data: Vec<u8>) -> Section {
        Section {
            name: id.name().into(),
            size: data.len() as u64,
            data: Some(data),
            id: Some(id),
            addralign: 1,
            ..Default::default()
        }
    }

    fn file_of(sections: Vec<Section>) -> ElfFile {
        ElfFile {
            endian: RunTimeEndian::Little,
            addr_64: false,
            kind: FileKind::Relocatable,
            machine: Machine::I386,
            sections,
            symbols: Vec::new(),
        }
    }

    fn run(
        file: &mut ElfFile,
        cus: &[Cu],
        range_coverage: bool,
    ) -> (Messages, Coverage, bool) {
        let mut messages = Messages::new();
        let mut pc = Coverage::new();
        let ok = check_loc_or_range_structural(
            file,
            0,
            cus,
            Some(&mut pc),
            range_coverage,
            &mut messages,
        );
        (messages, pc, ok)
    }

    fn texts(messages: &Messages) -> Vec<String> {
        messages.diagnostics().iter().map(|d| d.text.clone()).collect()
    }

    #[test]
    fn simple_range_list() {
        // (0x1000, 0x2000), base selector to 0x4000, terminator. With
        // low_pc = 0x1000 the payload covers [0x2000, 0x3000).
        let mut data = entry32(0x1000, 0x2000);
        data.extend(entry32(0xffff_ffff, 0x4000));
        data.extend(entry32(0, 0));
        let mut file = file_of(vec![debug_section(SectionId::Ranges, data)]);
        let cus = [cu_with_refs(Some(0x1000), &[0], false)];

        let (messages, pc, ok) = run(&mut file, &cus, false);
        assert!(ok);
        assert!(messages.diagnostics().is_empty(), "{:?}", texts(&messages));
        assert_eq!(pc.iter().collect::<Vec<_>>(), vec![(0x2000, 0x3000)]);
    }

    #[test]
    fn negative_range() {
        let mut data = entry32(0xff, 0);
        data.extend_from_slice(&[0, 0, 0, 0]);
        let mut file = file_of(vec![debug_section(SectionId::Ranges, data)]);
        let cus = [cu_with_refs(Some(0), &[0], false)];

        let (messages, pc, ok) = run(&mut file, &cus, false);
        // The stray half-entry at the tail also fails to parse.
        assert!(!ok);
        assert!(texts(&messages).iter().any(|t| t.contains("has negative range")));
        assert!(pc.is_empty());
    }

    #[test]
    fn reference_into_another_list() {
        // One list spanning bytes 0..24; a second CU points into its middle.
        let mut data = entry32(1, 2);
        data.extend(entry32(3, 4));
        data.extend(entry32(0, 0));
        data.resize(80, 0);
        let mut file = file_of(vec![debug_section(SectionId::Ranges, data)]);
        let cus = [
            cu_with_refs(Some(0x1000), &[0], false),
            cu_with_refs(Some(0x1000), &[8], false),
        ];

        let (messages, _, ok) = run(&mut file, &cus, false);
        assert!(!ok);
        assert!(texts(&messages)
            .iter()
            .any(|t| t.contains("points into another location or range list")));
        assert!(texts(&messages).iter().any(|t| t.contains("range definitions overlap")));
    }

    #[test]
    fn empty_range_is_bloat_and_contributes_nothing() {
        let mut data = entry32(0x10, 0x10);
        data.extend(entry32(0, 0));
        let mut file = file_of(vec![debug_section(SectionId::Ranges, data)]);
        let cus = [cu_with_refs(Some(0x1000), &[0], false)];

        let (messages, pc, ok) = run(&mut file, &cus, false);
        assert!(ok);
        assert_eq!(messages.error_count(), 0);
        assert!(texts(&messages).iter().any(|t| t.contains("covers no range")));
        assert!(pc.is_empty());
    }

    #[test]
    fn base_selector_that_changes_nothing() {
        let mut data = entry32(0xffff_ffff, 0x1000);
        data.extend(entry32(0, 0));
        let mut file = file_of(vec![debug_section(SectionId::Ranges, data)]);
        let cus = [cu_with_refs(Some(0x1000), &[0], false)];

        let (messages, _, ok) = run(&mut file, &cus, false);
        assert!(ok);
        assert_eq!(messages.error_count(), 0);
        assert!(texts(&messages)
            .iter()
            .any(|t| t.contains("doesn't change base address")));
    }

    #[test]
    fn payload_without_base_address() {
        let mut data = entry32(1, 2);
        data.extend(entry32(0, 0));
        let mut file = file_of(vec![debug_section(SectionId::Ranges, data)]);
        let cus = [cu_with_refs(None, &[0], false)];

        let (messages, pc, ok) = run(&mut file, &cus, false);
        assert!(ok);
        assert!(texts(&messages)
            .iter()
            .any(|t| t.contains("no base address set")));
        assert!(pc.is_empty());
    }

    #[test]
    fn relocated_zero_pair_is_not_a_terminator() {
        let mut data = entry32(0, 0);
        data.extend(entry32(0, 0));
        let mut file = file_of(vec![debug_section(SectionId::Ranges, data)]);
        file.sections.push(Section {
            name: ".text".into(),
            size: 0x100,
            flags: u64::from(object::elf::SHF_ALLOC | object::elf::SHF_EXECINSTR),
            ..Default::default()
        });
        file.symbols.push(crate::model::Symbol {
            name: "begin".into(),
            value: 0,
            section: Some(1),
        });
        file.sections[0].rel = RelocationData::new(vec![RelocEntry {
            offset: 0,
            rtype: object::elf::R_386_32,
            symbol_index: 0,
            addend: 0,
        }]);
        let cus = [cu_with_refs(Some(0), &[0], false)];

        let (messages, _, ok) = run(&mut file, &cus, false);
        assert!(ok);
        assert_eq!(messages.error_count(), 0);
        let t = texts(&messages);
        assert!(t.iter().any(|m| m.contains("is not relocated, but the beginning was")));
        assert!(t.iter().any(|m| m.contains("covers no range")));
    }

    #[test]
    fn range_pair_relocated_against_different_sections() {
        let mut data = entry32(0, 4);
        data.extend(entry32(0, 0));
        let mut file = file_of(vec![debug_section(SectionId::Ranges, data)]);
        file.sections.push(Section {
            name: ".text".into(),
            size: 0x100,
            flags: u64::from(object::elf::SHF_ALLOC | object::elf::SHF_EXECINSTR),
            ..Default::default()
        });
        file.sections.push(Section {
            name: ".text.cold".into(),
            size: 0x100,
            flags: u64::from(object::elf::SHF_ALLOC | object::elf::SHF_EXECINSTR),
            ..Default::default()
        });
        file.symbols.push(crate::model::Symbol { name: "a".into(), value: 0, section: Some(1) });
        file.symbols.push(crate::model::Symbol { name: "b".into(), value: 4, section: Some(2) });
        file.sections[0].rel = RelocationData::new(vec![
            RelocEntry { offset: 0, rtype: object::elf::R_386_32, symbol_index: 0, addend: 0 },
            RelocEntry { offset: 4, rtype: object::elf::R_386_32, symbol_index: 1, addend: 0 },
        ]);
        let cus = [cu_with_refs(Some(0), &[0], false)];

        let (messages, _, _) = run(&mut file, &cus, false);
        assert!(texts(&messages)
            .iter()
            .any(|t| t.contains("relocated against different sections")));
    }

    #[test]
    fn unreferenced_tail_is_reported() {
        let mut data = entry32(1, 2);
        data.extend(entry32(0, 0));
        data.resize(32, 0);
        data[20] = 0xab;
        let mut file = file_of(vec![debug_section(SectionId::Ranges, data.clone())]);
        let cus = [cu_with_refs(Some(0), &[0], false)];
        let (messages, _, _) = run(&mut file, &cus, false);
        assert!(texts(&messages)
            .iter()
            .any(|t| t.contains("unreferenced non-zero bytes")));

        // All-zero tail reads as padding instead.
        data[20] = 0;
        let mut file = file_of(vec![debug_section(SectionId::Ranges, data)]);
        let (messages, _, _) = run(&mut file, &cus, false);
        assert!(texts(&messages)
            .iter()
            .any(|t| t.contains("unnecessary padding with zero bytes")));
    }

    #[test]
    fn loc_list_with_expression() {
        // (1, 2) with a one-opcode expression, then a terminator.
        let mut data = entry32(1, 2);
        data.extend_from_slice(&1u16.to_le_bytes());
        data.push(0x96); // DW_OP_nop
        data.extend(entry32(0, 0));
        let mut file = file_of(vec![debug_section(SectionId::Loc, data)]);
        let cus = [cu_with_refs(Some(0x1000), &[0], true)];

        let (messages, _, ok) = run(&mut file, &cus, false);
        assert!(ok);
        assert!(messages.diagnostics().is_empty(), "{:?}", texts(&messages));
    }

    #[test]
    fn loc_expression_with_escaping_branch() {
        let mut data = entry32(1, 2);
        data.extend_from_slice(&5u16.to_le_bytes());
        data.extend_from_slice(&[0x96, 0x96, 0x2f, 0xff, 0x7f]); // skip 0x7fff
        data.extend(entry32(0, 0));
        let mut file = file_of(vec![debug_section(SectionId::Loc, data)]);
        let cus = [cu_with_refs(Some(0x1000), &[0], true)];

        let (messages, _, ok) = run(&mut file, &cus, false);
        assert!(ok);
        assert_eq!(messages.error_count(), 1);
        assert!(texts(&messages)
            .iter()
            .any(|t| t.contains("branches out of location expression")));
    }

    #[test]
    fn range_to_section_coverage() {
        let mut data = entry32(0x1000, 0x1080);
        data.extend(entry32(0x2000, 0x2010));
        data.extend(entry32(0x1ff0, 0x2010));
        data.extend(entry32(0x5000, 0x5010));
        data.extend(entry32(0, 0));
        let mut sections = vec![debug_section(SectionId::Ranges, data)];
        sections.push(Section {
            name: ".text".into(),
            addr: 0x1000,
            size: 0x1000,
            flags: u64::from(object::elf::SHF_ALLOC | object::elf::SHF_EXECINSTR),
            data: Some(vec![0; 0x1000]),
            addralign: 16,
            ..Default::default()
        });
        sections.push(Section {
            name: ".data".into(),
            addr: 0x2000,
            size: 0x100,
            flags: u64::from(object::elf::SHF_ALLOC),
            data: Some(vec![0; 0x100]),
            addralign: 8,
            ..Default::default()
        });
        let mut file = file_of(sections);
        let cus = [cu_with_refs(Some(0), &[0], false)];

        let (messages, pc, ok) = run(&mut file, &cus, true);
        assert!(ok);
        let t = texts(&messages);
        assert_eq!(
            t.iter().filter(|m| m.contains("covers section .data")).count(),
            2
        );
        assert!(t.iter().any(|m| m.contains("crosses section boundaries")));
        assert!(t.iter().any(|m| m.contains("overlaps with another one")));
        assert!(t.iter().any(|m| m.contains("couldn't find a section")));
        // Uncovered section tails are all zero bytes, so no hole findings.
        assert!(!t.iter().any(|m| m.contains("are not covered")));
        assert_eq!(
            pc.iter().collect::<Vec<_>>(),
            vec![(0x1000, 0x1080), (0x1ff0, 0x2010), (0x5000, 0x5010)]
        );
    }

    #[test]
    fn reference_past_the_section() {
        let mut file = file_of(vec![debug_section(SectionId::Ranges, vec![0; 8])]);
        let cus = [cu_with_refs(Some(0), &[0x100], false)];
        let (messages, _, ok) = run(&mut file, &cus, false);
        assert!(!ok);
        assert!(texts(&messages)
            .iter()
            .any(|t| t.contains("invalid reference outside the section")));
    }
}
