//! The fixup map: what the debug database knows about constants embedded in the image.
//!
//! Each fixup names a source RVA, the kind and size of the value encoded there, and the RVA
//! it semantically refers to. The map is populated from the debug database's FIXUP stream,
//! optionally translated through a legacy address-translation table (when the input module
//! was itself already rewritten once), and validated against the image's relocation table
//! before decomposition trusts it.

use std::collections::BTreeMap;

use bitflags::bitflags;

use crate::address::{AddressTranslationTable, RelativeAddress};
use crate::graph::ReferenceType;
use crate::input::{DebugFixupEntry, RelocationSet};
use crate::Result;

bitflags! {
    /// Auxiliary properties of a fixup.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FixupFlags: u8 {
        /// The fixup's target is code.
        const REFERS_TO_CODE = 1 << 0;
        /// The fixup itself lives in data.
        const IS_DATA = 1 << 1;
        /// The encoded value is an offset rather than a full pointer.
        const IS_OFFSET = 1 << 2;
    }
}

/// One fixup record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fixup {
    /// The kind of value encoded at the source location.
    pub kind: ReferenceType,
    /// The RVA the encoded value semantically refers to.
    pub base: RelativeAddress,
    /// Auxiliary properties.
    pub flags: FixupFlags,
    /// Whether decomposition has consumed this fixup as a reference.
    pub visited: bool,
}

impl Fixup {
    /// The slot size of this fixup in bytes. Debug streams only record 4-byte slots.
    #[must_use]
    pub fn size(&self) -> u8 {
        4
    }

    /// Whether the fixup's target is code.
    #[must_use]
    pub fn refers_to_code(&self) -> bool {
        self.flags.contains(FixupFlags::REFERS_TO_CODE)
    }
}

/// A map from source RVAs to fixups.
#[derive(Debug, Clone, Default)]
pub struct FixupMap {
    map: BTreeMap<RelativeAddress, Fixup>,
}

impl FixupMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    /// Populates a map from debug-stream entries.
    ///
    /// When `legacy` is present the input module was rewritten before and its debug
    /// database still speaks the pre-rewrite address space; every location and base is
    /// translated through the table first. Entries whose addresses do not translate are an
    /// input inconsistency.
    ///
    /// # Errors
    ///
    /// Returns an input inconsistency for duplicate source RVAs or untranslatable entries.
    pub fn from_debug_entries(
        entries: &[DebugFixupEntry],
        legacy: Option<&AddressTranslationTable>,
    ) -> Result<Self> {
        let mut map = BTreeMap::new();
        for entry in entries {
            let (location, base) = match legacy {
                Some(table) => {
                    let location = table.translate(entry.location).ok_or_else(|| {
                        inconsistency_error!(
                            "fixup location {} does not translate through the legacy table",
                            entry.location
                        )
                    })?;
                    let base = table.translate(entry.base).ok_or_else(|| {
                        inconsistency_error!(
                            "fixup base {} does not translate through the legacy table",
                            entry.base
                        )
                    })?;
                    (location, base)
                }
                None => (entry.location, entry.base),
            };

            let fixup = Fixup {
                kind: entry.kind,
                base,
                flags: entry.flags,
                visited: false,
            };
            if map.insert(location, fixup).is_some() {
                return Err(inconsistency_error!("duplicate fixup at {}", location));
            }
        }
        Ok(Self { map })
    }

    /// Validates the map against the image's own relocation table.
    ///
    /// Every relocation entry must be matched by an absolute fixup at the same RVA; a
    /// relocation without a fixup, or one whose fixup disagrees on the kind, means the
    /// debug database does not describe this image.
    ///
    /// # Errors
    ///
    /// Returns an input inconsistency on the first mismatch.
    pub fn validate_against_relocations(&self, relocations: &RelocationSet) -> Result<()> {
        for rva in relocations.iter() {
            match self.map.get(&rva) {
                None => {
                    return Err(inconsistency_error!("relocation at {} has no fixup", rva));
                }
                Some(fixup) if fixup.kind != ReferenceType::Absolute => {
                    return Err(inconsistency_error!(
                        "relocation at {} disagrees with fixup kind {}",
                        rva,
                        fixup.kind
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// The fixup at `location`, if any.
    #[must_use]
    pub fn get(&self, location: RelativeAddress) -> Option<&Fixup> {
        self.map.get(&location)
    }

    /// Marks the fixup at `location` as consumed. Returns whether it existed.
    pub fn mark_visited(&mut self, location: RelativeAddress) -> bool {
        match self.map.get_mut(&location) {
            Some(fixup) => {
                fixup.visited = true;
                true
            }
            None => false,
        }
    }

    /// Iterates all fixups in source order.
    pub fn iter(&self) -> impl Iterator<Item = (RelativeAddress, &Fixup)> {
        self.map.iter().map(|(rva, f)| (*rva, f))
    }

    /// Iterates the fixups decomposition has not consumed, in source order.
    pub fn unvisited(&self) -> impl Iterator<Item = (RelativeAddress, &Fixup)> {
        self.iter().filter(|(_, f)| !f.visited)
    }

    /// The number of fixups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{TranslationEntry, INVALID_TARGET_RVA};

    fn rva(value: u32) -> RelativeAddress {
        RelativeAddress::new(value)
    }

    fn entry(location: u32, base: u32, kind: ReferenceType) -> DebugFixupEntry {
        DebugFixupEntry {
            location: rva(location),
            base: rva(base),
            kind,
            flags: FixupFlags::empty(),
        }
    }

    #[test]
    fn populate_and_query() {
        let map = FixupMap::from_debug_entries(
            &[
                entry(0x1004, 0x2000, ReferenceType::Absolute),
                entry(0x1010, 0x1800, ReferenceType::PcRelative),
            ],
            None,
        )
        .unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(rva(0x1004)).unwrap().base, rva(0x2000));
        assert!(map.get(rva(0x1005)).is_none());
    }

    #[test]
    fn duplicate_locations_are_inconsistent() {
        let result = FixupMap::from_debug_entries(
            &[
                entry(0x1004, 0x2000, ReferenceType::Absolute),
                entry(0x1004, 0x2004, ReferenceType::Absolute),
            ],
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn legacy_translation_applies_to_both_sides() {
        let table = AddressTranslationTable::from_entries(vec![
            TranslationEntry {
                rva: rva(0x1000),
                rva_to: rva(0x5000),
            },
            TranslationEntry {
                rva: rva(0x3000),
                rva_to: INVALID_TARGET_RVA,
            },
        ]);
        let map = FixupMap::from_debug_entries(
            &[entry(0x1004, 0x2000, ReferenceType::Absolute)],
            Some(&table),
        )
        .unwrap();
        assert_eq!(map.get(rva(0x5004)).unwrap().base, rva(0x6000));

        // Addresses falling into the sentinel range do not translate.
        let result = FixupMap::from_debug_entries(
            &[entry(0x3004, 0x2000, ReferenceType::Absolute)],
            Some(&table),
        );
        assert!(result.is_err());
    }

    #[test]
    fn relocation_without_fixup_is_fatal() {
        let map = FixupMap::from_debug_entries(
            &[entry(0x1004, 0x2000, ReferenceType::Absolute)],
            None,
        )
        .unwrap();

        let mut relocations = RelocationSet::new();
        relocations.insert(rva(0x1004));
        assert!(map.validate_against_relocations(&relocations).is_ok());

        relocations.insert(rva(0x1008));
        assert!(map.validate_against_relocations(&relocations).is_err());
    }

    #[test]
    fn relocation_kind_mismatch_is_fatal() {
        let map = FixupMap::from_debug_entries(
            &[entry(0x1004, 0x2000, ReferenceType::PcRelative)],
            None,
        )
        .unwrap();
        let mut relocations = RelocationSet::new();
        relocations.insert(rva(0x1004));
        assert!(map.validate_against_relocations(&relocations).is_err());
    }

    #[test]
    fn visited_tracking() {
        let mut map = FixupMap::from_debug_entries(
            &[
                entry(0x1004, 0x2000, ReferenceType::Absolute),
                entry(0x1010, 0x1800, ReferenceType::PcRelative),
            ],
            None,
        )
        .unwrap();
        assert!(map.mark_visited(rva(0x1004)));
        assert!(!map.mark_visited(rva(0x9999)));
        let unvisited: Vec<_> = map.unvisited().map(|(rva, _)| rva).collect();
        assert_eq!(unvisited, vec![rva(0x1010)]);
    }
}
