//! Pedantic structural checking of DWARF debug information.
//!
//! This crate judges the well-formedness of the debug sections embedded in
//! an object file (malformed byte streams, inconsistent cross-section
//! references, overlapping or dangling ranges, unreferenced padding,
//! mis-applied relocations) and reports categorized diagnostics. It does
//! not interpret debug information for any consumer; a clean bill of health
//! only means the bytes hold together.
//!
//! The interesting passes live in [`loc_range`] (the `.debug_loc` /
//! `.debug_ranges` walker) and [`expr`] (location-expression decoding), with
//! [`coverage`], [`readctx`] and [`reloc`] underneath them. [`dynhash`] is
//! the concurrent index used by the cross-CU reference pass in [`dies`].

pub mod coverage;
pub mod dies;
pub mod dynhash;
pub mod expr;
pub mod loc_range;
pub mod messages;
pub mod model;
pub mod readctx;
pub mod reloc;

mod load;

pub use crate::messages::{
    Categories, Diagnostic, MessageCriteria, MessageTerm, Messages, Severity, Where,
};
pub use crate::model::{Cu, CuHead, ElfFile, FileKind, Machine, Section, SectionId, Symbol};

use crate::coverage::Coverage;
use thiserror::Error;
use tracing::debug;

#[derive(Clone, Debug, Error)]
pub enum FileError {
    #[error("object file format parsing error")]
    Obj(#[from] object::Error),
    #[error("DWARF failed to parse")]
    Dwarf(#[from] gimli::Error),
}

/// Knobs of a checking run.
#[derive(Copy, Clone, Debug, Default)]
pub struct CheckOptions {
    /// Also project `.debug_ranges` payloads onto the allocated sections and
    /// report what they miss.
    pub range_coverage: bool,
}

/// One checking run over one object file.
///
/// Owns the diagnostic sink; every pass reports into it and the host decides
/// afterwards what to do with the findings.
#[derive(Debug, Default)]
pub struct Linter {
    options: CheckOptions,
    messages: Messages,
}

impl Linter {
    pub fn new(options: CheckOptions) -> Self {
        Self { options, messages: Messages::new() }
    }

    /// Supplies pre-built filtering criteria, e.g. from CLI switches.
    pub fn with_messages(options: CheckOptions, messages: Messages) -> Self {
        Self { options, messages }
    }

    /// Parses `object` and runs every pass. `Err` means the container or the
    /// `.debug_info` tree could not be parsed at all; findings about the
    /// debug data itself land in the sink instead.
    pub fn check_object(&mut self, object: &object::File) -> Result<bool, FileError> {
        let (mut file, cus) = load::load_file(object, &mut self.messages)?;
        Ok(self.check_loaded(&mut file, &cus))
    }

    /// Runs every pass over an already-built model. Returns true when no
    /// pass found the input structurally unusable (individual findings may
    /// still have been reported).
    pub fn check_loaded(&mut self, file: &mut ElfFile, cus: &[Cu]) -> bool {
        let mut retval = true;

        // .debug_ranges, accumulating program-address coverage.
        let mut pc_coverage = Coverage::new();
        if let Some(sec) = file.debug_section(SectionId::Ranges) {
            debug!(section = ".debug_ranges", "checking");
            if !loc_range::check_loc_or_range_structural(
                file,
                sec,
                cus,
                Some(&mut pc_coverage),
                self.options.range_coverage,
                &mut self.messages,
            ) {
                retval = false;
            }
        }

        // .debug_loc, including embedded location expressions.
        if let Some(sec) = file.debug_section(SectionId::Loc) {
            debug!(section = ".debug_loc", "checking");
            if !loc_range::check_loc_or_range_structural(
                file,
                sec,
                cus,
                None,
                false,
                &mut self.messages,
            ) {
                retval = false;
            }
        }

        // Cross-CU DIE references, resolved through the concurrent index.
        if !cus.is_empty() {
            debug!(units = cus.len(), "resolving DIE references");
            if !dies::check_die_references(cus, &mut self.messages) {
                retval = false;
            }
        }

        retval
    }

    pub fn messages(&self) -> &Messages {
        &self.messages
    }

    pub fn into_messages(self) -> Messages {
        self.messages
    }
}
