//! Labels: named, attributed points inside a block.

use std::fmt;

use bitflags::bitflags;

use crate::Result;

bitflags! {
    /// Roles a label can play.
    ///
    /// A label carries a bitmask of roles. Contradictory combinations (code and data at the
    /// same offset without an intervening block split) are rejected at creation; unrelated
    /// roles at the same offset merge.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LabelAttributes: u16 {
        /// The label marks an instruction entry point.
        const CODE = 1 << 0;
        /// The label marks data.
        const DATA = 1 << 1;
        /// Start of the debuggable range of a function.
        const DEBUG_START = 1 << 2;
        /// End of the debuggable range of a function.
        const DEBUG_END = 1 << 3;
        /// Start of a lexical scope.
        const SCOPE_START = 1 << 4;
        /// End of a lexical scope.
        const SCOPE_END = 1 << 5;
        /// The label marks a jump table: a run of absolute pointers to code.
        const JUMP_TABLE = 1 << 6;
        /// The label marks a case table: a run of byte indices into a jump table.
        const CASE_TABLE = 1 << 7;
        /// The label marks a call site.
        const CALL_SITE = 1 << 8;
        /// The label was produced by a public symbol.
        const PUBLIC_SYMBOL = 1 << 9;
    }
}

impl LabelAttributes {
    /// Whether this combination of roles is internally consistent.
    ///
    /// A label must carry at least one role; code excludes the data-flavored roles; jump and
    /// case tables are data by definition and must say so.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if self.is_empty() {
            return false;
        }
        if self.contains(Self::CODE)
            && self.intersects(Self::DATA | Self::JUMP_TABLE | Self::CASE_TABLE)
        {
            return false;
        }
        if self.intersects(Self::JUMP_TABLE | Self::CASE_TABLE) && !self.contains(Self::DATA) {
            return false;
        }
        true
    }
}

/// A named point inside a block at some offset.
///
/// Labels come from private and public symbols during decomposition and from transforms that
/// mark the code they emit. Two labels at the same offset merge: names concatenate with a
/// separator, attribute masks OR together (and the union must remain valid).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    name: String,
    attributes: LabelAttributes,
}

impl Label {
    /// Creates a new label, rejecting contradictory role combinations.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if `attributes` is empty or inconsistent.
    pub fn new(name: impl Into<String>, attributes: LabelAttributes) -> Result<Self> {
        if !attributes.is_valid() {
            return Err(invariant_error!(
                "invalid label attribute combination: {:?}",
                attributes
            ));
        }
        Ok(Self {
            name: name.into(),
            attributes,
        })
    }

    /// The label's name. Diagnostic only; empty names are permitted.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The roles this label plays.
    #[must_use]
    pub fn attributes(&self) -> LabelAttributes {
        self.attributes
    }

    /// Whether the label carries the given role.
    #[must_use]
    pub fn has_attributes(&self, attributes: LabelAttributes) -> bool {
        self.attributes.contains(attributes)
    }

    /// Merges `other` into this label.
    ///
    /// Names concatenate with `", "` (an empty side contributes nothing), attribute masks OR
    /// together.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if the combined attribute mask is contradictory.
    pub fn merge(&mut self, other: &Label) -> Result<()> {
        let combined = self.attributes | other.attributes;
        if !combined.is_valid() {
            return Err(invariant_error!(
                "conflicting label attributes at merge: {:?} | {:?}",
                self.attributes,
                other.attributes
            ));
        }

        if self.name.is_empty() {
            self.name = other.name.clone();
        } else if !other.name.is_empty() && self.name != other.name {
            self.name.push_str(", ");
            self.name.push_str(&other.name);
        }
        self.attributes = combined;
        Ok(())
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.name, self.attributes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_and_data_conflict() {
        assert!(Label::new("l", LabelAttributes::CODE | LabelAttributes::DATA).is_err());
        assert!(Label::new("l", LabelAttributes::empty()).is_err());
        assert!(Label::new("l", LabelAttributes::CODE).is_ok());
    }

    #[test]
    fn tables_are_data() {
        assert!(Label::new("t", LabelAttributes::JUMP_TABLE).is_err());
        assert!(Label::new("t", LabelAttributes::JUMP_TABLE | LabelAttributes::DATA).is_ok());
        assert!(Label::new("t", LabelAttributes::CASE_TABLE | LabelAttributes::DATA).is_ok());
    }

    #[test]
    fn merge_concatenates_names_and_ors_attributes() {
        let mut a = Label::new("entry", LabelAttributes::CODE).unwrap();
        let b = Label::new("_start", LabelAttributes::CODE | LabelAttributes::DEBUG_START)
            .unwrap();
        a.merge(&b).unwrap();
        assert_eq!(a.name(), "entry, _start");
        assert!(a.has_attributes(LabelAttributes::CODE | LabelAttributes::DEBUG_START));
    }

    #[test]
    fn merge_rejects_conflicts() {
        let mut a = Label::new("a", LabelAttributes::CODE).unwrap();
        let b = Label::new("b", LabelAttributes::DATA).unwrap();
        assert!(a.merge(&b).is_err());
        // The failed merge left the label unchanged.
        assert_eq!(a.name(), "a");
        assert_eq!(a.attributes(), LabelAttributes::CODE);
    }

    #[test]
    fn merge_with_empty_name() {
        let mut a = Label::new("", LabelAttributes::DATA).unwrap();
        let b = Label::new("table", LabelAttributes::DATA | LabelAttributes::JUMP_TABLE)
            .unwrap();
        a.merge(&b).unwrap();
        assert_eq!(a.name(), "table");
    }
}
