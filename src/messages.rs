//! Diagnostic routing and filtering.
//!
//! Checks never print anything themselves. They hand every finding to a
//! [`Messages`] sink, which classifies it against two user-configurable
//! criteria: one deciding whether the finding is reported at all, and one
//! deciding whether it is promoted to an error. The sink keeps the findings
//! in emission order, so a rerun over unchanged input produces an identical
//! sequence.

use crate::model::SectionId;
use indexmap::IndexMap;
use std::fmt;

/// Bit set classifying a diagnostic: which section family it concerns, and
/// accent bits describing its severity and impact.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Categories(pub u32);

impl Categories {
    pub const NONE: Categories = Categories(0);

    pub const LEB128: Categories = Categories(1 << 0);
    pub const LOC: Categories = Categories(1 << 1);
    pub const RANGES: Categories = Categories(1 << 2);
    pub const ARANGES: Categories = Categories(1 << 3);
    pub const ABBREV: Categories = Categories(1 << 4);
    pub const INFO: Categories = Categories(1 << 5);
    pub const LINE: Categories = Categories(1 << 6);
    pub const RELOC: Categories = Categories(1 << 7);
    pub const ELF: Categories = Categories(1 << 8);

    // Accents.
    pub const ERROR: Categories = Categories(1 << 16);
    pub const ACC_BLOAT: Categories = Categories(1 << 17);
    pub const ACC_SUBOPTIMAL: Categories = Categories(1 << 18);
    pub const IMPACT_1: Categories = Categories(1 << 19);
    pub const IMPACT_2: Categories = Categories(1 << 20);
    pub const IMPACT_3: Categories = Categories(1 << 21);
    pub const IMPACT_4: Categories = Categories(1 << 22);

    pub fn contains(self, other: Categories) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Categories) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Registry of category names, in declaration order. Used by CLI filter
    /// parsing and by `Display`.
    pub fn registry() -> IndexMap<&'static str, Categories> {
        IndexMap::from([
            ("leb128", Self::LEB128),
            ("loc", Self::LOC),
            ("ranges", Self::RANGES),
            ("aranges", Self::ARANGES),
            ("abbrev", Self::ABBREV),
            ("info", Self::INFO),
            ("line", Self::LINE),
            ("reloc", Self::RELOC),
            ("elf", Self::ELF),
            ("error", Self::ERROR),
            ("bloat", Self::ACC_BLOAT),
            ("suboptimal", Self::ACC_SUBOPTIMAL),
            ("impact1", Self::IMPACT_1),
            ("impact2", Self::IMPACT_2),
            ("impact3", Self::IMPACT_3),
            ("impact4", Self::IMPACT_4),
        ])
    }

    /// Looks a category up by its registry name.
    pub fn by_name(name: &str) -> Option<Categories> {
        Self::registry().get(name).copied()
    }
}

impl std::ops::BitOr for Categories {
    type Output = Categories;
    fn bitor(self, rhs: Categories) -> Categories {
        Categories(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Categories {
    fn bitor_assign(&mut self, rhs: Categories) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Categories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, bit) in Categories::registry() {
            if self.contains(bit) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        if first {
            write!(f, "none")?;
        }
        Ok(())
    }
}

/// One conjunction of a filtering criterion: a category matches when it has
/// all `positive` bits and none of the `negative` bits.
///
/// Invariant: `positive` and `negative` are disjoint.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MessageTerm {
    pub positive: Categories,
    pub negative: Categories,
}

impl MessageTerm {
    pub fn new(positive: Categories, negative: Categories) -> Self {
        debug_assert!(!positive.intersects(negative));
        Self { positive, negative }
    }

    pub fn accepts(&self, cat: Categories) -> bool {
        cat.contains(self.positive) && !cat.intersects(self.negative)
    }
}

impl fmt::Display for MessageTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        let mut got = false;
        for (name, bit) in Categories::registry() {
            if self.positive.contains(bit) {
                if got {
                    write!(f, " & ")?;
                }
                write!(f, "{}", name)?;
                got = true;
            } else if self.negative.contains(bit) {
                if got {
                    write!(f, " & ")?;
                }
                write!(f, "~{}", name)?;
                got = true;
            }
        }
        if !got {
            write!(f, "1")?;
        }
        write!(f, ")")
    }
}

/// A disjunction of terms. A category is accepted when any term accepts it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageCriteria {
    terms: Vec<MessageTerm>,
}

impl MessageCriteria {
    /// Criterion accepting every category.
    pub fn accept_all() -> Self {
        Self { terms: vec![MessageTerm::new(Categories::NONE, Categories::NONE)] }
    }

    /// Criterion accepting nothing.
    pub fn accept_none() -> Self {
        Self { terms: vec![] }
    }

    pub fn accepts(&self, cat: Categories) -> bool {
        self.terms.iter().any(|t| t.accepts(cat))
    }

    /// Widens the criterion: also accept whatever `term` accepts.
    pub fn or_term(&mut self, term: MessageTerm) {
        self.terms.push(term);
    }

    /// Narrows the criterion: additionally require `term` of every existing
    /// conjunction. Terms that become contradictory are dropped.
    pub fn and_term(&mut self, term: MessageTerm) {
        self.terms.retain_mut(|t| {
            t.positive |= term.positive;
            t.negative |= term.negative;
            !t.positive.intersects(t.negative)
        });
    }

    /// De Morgan expansion of `!term`: `!(a & b & ~c)` is `~a | ~b | c`.
    pub fn negate(term: MessageTerm) -> Self {
        let mut ret = Self::accept_none();
        for (_, bit) in Categories::registry() {
            if term.positive.contains(bit) {
                ret.or_term(MessageTerm::new(Categories::NONE, bit));
            } else if term.negative.contains(bit) {
                ret.or_term(MessageTerm::new(bit, Categories::NONE));
            }
        }
        ret
    }

    /// Distributes `self & rhs` over the terms of both criteria.
    pub fn multiply(&mut self, rhs: &MessageCriteria) {
        let mut ret = Self::accept_none();
        for t1 in &self.terms {
            for t2 in &rhs.terms {
                let positive = t1.positive | t2.positive;
                let negative = t1.negative | t2.negative;
                if positive.intersects(negative) {
                    continue;
                }
                ret.or_term(MessageTerm { positive, negative });
            }
        }
        *self = ret;
    }

    /// Rejects everything that `term` accepts.
    pub fn and_not(&mut self, term: MessageTerm) {
        let neg = Self::negate(term);
        self.multiply(&neg);
    }
}

impl fmt::Display for MessageCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, t) in self.terms.iter().enumerate() {
            if i > 0 {
                write!(f, " | ")?;
            }
            write!(f, "{}", t)?;
        }
        Ok(())
    }
}

/// Containment path of a diagnostic: a frame per nesting level, innermost
/// first, each naming a section and an offset within it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Where {
    pub section: SectionId,
    pub addr: Option<u64>,
    pub outer: Option<Box<Where>>,
}

impl Where {
    pub fn new(section: SectionId) -> Self {
        Self { section, addr: None, outer: None }
    }

    /// New innermost frame on top of `outer`.
    pub fn nested(section: SectionId, outer: &Where) -> Self {
        Self { section, addr: None, outer: Some(Box::new(outer.clone())) }
    }

    pub fn with_addr(mut self, addr: u64) -> Self {
        self.addr = Some(addr);
        self
    }

    /// Re-points this frame at a new offset, keeping the outer chain.
    pub fn reset_addr(&mut self, addr: u64) {
        self.addr = Some(addr);
    }
}

impl fmt::Display for Where {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.section.name())?;
        if let Some(addr) = self.addr {
            write!(f, " [{:#x}]", addr)?;
        }
        if let Some(outer) = &self.outer {
            write!(f, " (referenced from {})", outer)?;
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// One recorded finding.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub severity: Severity,
    pub category: Categories,
    pub location: Where,
    pub text: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.severity, self.location, self.text)
    }
}

/// Ordered diagnostic sink with category filtering.
#[derive(Clone, Debug)]
pub struct Messages {
    warning_criteria: MessageCriteria,
    error_criteria: MessageCriteria,
    diagnostics: Vec<Diagnostic>,
    error_count: usize,
}

impl Default for Messages {
    fn default() -> Self {
        Self::new()
    }
}

impl Messages {
    /// Default configuration: report everything, promote findings carrying
    /// the `error` accent.
    pub fn new() -> Self {
        let mut error_criteria = MessageCriteria::accept_none();
        error_criteria.or_term(MessageTerm::new(Categories::ERROR, Categories::NONE));
        Self {
            warning_criteria: MessageCriteria::accept_all(),
            error_criteria,
            diagnostics: Vec::new(),
            error_count: 0,
        }
    }

    pub fn with_criteria(warning: MessageCriteria, error: MessageCriteria) -> Self {
        Self {
            warning_criteria: warning,
            error_criteria: error,
            diagnostics: Vec::new(),
            error_count: 0,
        }
    }

    pub fn warning_criteria_mut(&mut self) -> &mut MessageCriteria {
        &mut self.warning_criteria
    }

    pub fn error_criteria_mut(&mut self) -> &mut MessageCriteria {
        &mut self.error_criteria
    }

    /// Unconditional structural error. Not subject to filtering.
    pub fn error(&mut self, location: &Where, text: impl Into<String>) {
        self.push(Severity::Error, Categories::NONE, location, text.into());
    }

    /// Categorized finding. Dropped, reported as a warning, or promoted to an
    /// error depending on the two criteria.
    pub fn message(&mut self, category: Categories, location: &Where, text: impl Into<String>) {
        if !self.warning_criteria.accepts(category) {
            return;
        }
        let severity = if self.error_criteria.accepts(category) {
            Severity::Error
        } else {
            Severity::Warning
        };
        self.push(severity, category, location, text.into());
    }

    fn push(&mut self, severity: Severity, category: Categories, location: &Where, text: String) {
        if severity == Severity::Error {
            self.error_count += 1;
        }
        self.diagnostics.push(Diagnostic {
            severity,
            category,
            location: location.clone(),
            text,
        });
    }

    pub fn error_count(&self) -> usize {
        self.error_count
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn term_accepts_positive_and_rejects_negative() {
        let t = MessageTerm::new(Categories::LOC, Categories::ACC_BLOAT);
        assert!(t.accepts(Categories::LOC | Categories::IMPACT_3));
        assert!(!t.accepts(Categories::LOC | Categories::ACC_BLOAT));
        assert!(!t.accepts(Categories::RANGES));
    }

    #[test]
    fn default_criteria_promote_error_accent() {
        let mut m = Messages::new();
        let wh = Where::new(SectionId::Ranges).with_addr(0x10);
        m.message(Categories::RANGES | Categories::ERROR, &wh, "negative range");
        m.message(Categories::RANGES | Categories::ACC_BLOAT, &wh, "covers no range");
        assert_eq!(m.error_count(), 1);
        assert_eq!(m.diagnostics().len(), 2);
        assert_eq!(m.diagnostics()[0].severity, Severity::Error);
        assert_eq!(m.diagnostics()[1].severity, Severity::Warning);
    }

    #[test]
    fn and_not_suppresses_category() {
        let mut m = Messages::new();
        m.warning_criteria_mut()
            .and_not(MessageTerm::new(Categories::ACC_BLOAT, Categories::NONE));
        let wh = Where::new(SectionId::Loc);
        m.message(Categories::LOC | Categories::ACC_BLOAT, &wh, "dropped");
        m.message(Categories::LOC, &wh, "kept");
        assert_eq!(m.diagnostics().len(), 1);
        assert_eq!(m.diagnostics()[0].text, "kept");
    }

    #[test]
    fn and_term_drops_contradictions() {
        let mut c = MessageCriteria::accept_all();
        c.and_term(MessageTerm::new(Categories::LOC, Categories::NONE));
        assert!(c.accepts(Categories::LOC));
        assert!(!c.accepts(Categories::RANGES));
        c.and_term(MessageTerm::new(Categories::NONE, Categories::LOC));
        assert!(!c.accepts(Categories::LOC));
    }

    #[test]
    fn where_formats_chain() {
        let outer = Where::new(SectionId::Info).with_addr(0x30);
        let inner = Where::nested(SectionId::Ranges, &outer).with_addr(0xc);
        assert_eq!(
            inner.to_string(),
            ".debug_ranges [0xc] (referenced from .debug_info [0x30])"
        );
    }

    #[test]
    fn unconditional_errors_bypass_filtering() {
        let mut m = Messages::with_criteria(
            MessageCriteria::accept_none(),
            MessageCriteria::accept_none(),
        );
        let wh = Where::new(SectionId::Loc);
        m.error(&wh, "truncated entry");
        m.message(Categories::LOC, &wh, "filtered");
        assert_eq!(m.error_count(), 1);
        assert_eq!(m.diagnostics().len(), 1);
    }
}
