//! Cross-CU DIE reference resolution.
//!
//! Every DIE reference must land on an offset where a DIE actually begins,
//! possibly in a different unit. The DIE starts of all units are gathered
//! into one shared index first, a write-heavy and embarrassingly parallel
//! step that populates the concurrent table from per-CU slices. Every
//! reference is then resolved against it.

use crate::dynhash::DynHash;
use crate::messages::Messages;
use crate::model::Cu;

use tracing::debug;

/// Threads used to build the index. The table tolerates any number; past a
/// handful the per-thread slices get too small to matter.
const INDEX_THREADS: usize = 8;

/// Builds the global DIE-start index and resolves every `die_ref` against
/// it. Returns false when any reference dangles.
pub fn check_die_references(cus: &[Cu], messages: &mut Messages) -> bool {
    let total: usize = cus.iter().map(|cu| cu.die_addrs.len()).sum();
    let index = match DynHash::with_capacity(total.max(16)) {
        Ok(index) => index,
        Err(e) => {
            messages.error(
                &crate::messages::Where::new(crate::model::SectionId::Info),
                format!("can't build DIE index: {}", e),
            );
            return false;
        }
    };

    let chunk = cus.len().div_ceil(INDEX_THREADS).max(1);
    std::thread::scope(|s| {
        let index = &index;
        for chunk_cus in cus.chunks(chunk) {
            s.spawn(move || {
                for cu in chunk_cus {
                    for &addr in &cu.die_addrs {
                        index.insert(addr, addr);
                    }
                }
            });
        }
    });
    debug!(dies = total, "DIE index built");

    let mut retval = true;
    for cu in cus {
        for r in &cu.die_refs {
            if index.find(r.addr, r.addr).is_none() {
                messages.error(
                    &r.who,
                    format!("unresolved reference to DIE at {:#x}", r.addr),
                );
                retval = false;
            }
        }
    }
    retval
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Where;
    use crate::model::{CuHead, Ref, SectionId};

    fn cu_at(offset: u64, die_addrs: Vec<u64>, die_refs: Vec<u64>) -> Cu {
        let mut cu = Cu::new(CuHead {
            offset,
            version: 4,
            address_size: 4,
            offset_size: 4,
            abbrev_offset: 0,
            total_size: 0x40,
        });
        cu.die_addrs = die_addrs;
        cu.die_refs = die_refs
            .into_iter()
            .map(|addr| Ref {
                addr,
                who: Where::new(SectionId::Info).with_addr(offset),
            })
            .collect();
        cu
    }

    #[test]
    fn references_between_units_resolve() {
        let cus = vec![
            cu_at(0, vec![0xb, 0x20, 0x31], vec![0x4b]),
            cu_at(0x40, vec![0x4b, 0x60], vec![0x20, 0x4b]),
        ];
        let mut messages = Messages::new();
        assert!(check_die_references(&cus, &mut messages));
        assert!(messages.diagnostics().is_empty());
    }

    #[test]
    fn dangling_reference_is_an_error() {
        let cus = vec![
            cu_at(0, vec![0xb, 0x20], vec![0x999]),
            cu_at(0x40, vec![0x4b], vec![]),
        ];
        let mut messages = Messages::new();
        assert!(!check_die_references(&cus, &mut messages));
        assert_eq!(messages.error_count(), 1);
        assert!(messages.diagnostics()[0].text.contains("0x999"));
    }

    #[test]
    fn many_units_index_in_parallel() {
        let cus: Vec<Cu> = (0..64)
            .map(|i| {
                let base = i * 0x100;
                cu_at(
                    base,
                    (0..32).map(|d| base + 2 * d).collect(),
                    // Every unit points at its successor's first DIE.
                    vec![(base + 0x100) % (64 * 0x100)],
                )
            })
            .collect();
        let mut messages = Messages::new();
        assert!(check_die_references(&cus, &mut messages));
        assert!(messages.diagnostics().is_empty());
    }
}
