//! The decomposition input contract.
//!
//! The core does not parse PE files or debug databases. An external producer - typically a
//! goblin-based PE reader paired with a debug-stream reader - hands decomposition the plain
//! data in this module, once per input module. Symbols arrive as slices the consumer pulls
//! from, in any order but typically most-informative first.

use bitflags::bitflags;

use crate::address::{
    AbsoluteAddress, AddressRange, AddressTranslationTable, FileOffsetAddress, RelativeAddress,
};
use crate::fixup::FixupFlags;
use crate::graph::ReferenceType;

/// One section of the input module.
///
/// `data` borrows from the mapped input image and may be shorter than `virtual_size`; the
/// uninitialized tail is implicitly zero. The mapped image must outlive every block that
/// borrows from it.
#[derive(Debug, Clone)]
pub struct SectionInfo<'a> {
    /// The section name, e.g. `.text`.
    pub name: String,
    /// `IMAGE_SCN_*` characteristics from [`goblin::pe::section_table`].
    pub characteristics: u32,
    /// The RVA the section is mapped at.
    pub virtual_address: RelativeAddress,
    /// The section's extent in the mapped image.
    pub virtual_size: u32,
    /// Where the section's initialized bytes sit in the file on disk.
    pub file_offset: FileOffsetAddress,
    /// The initialized bytes of the section.
    pub data: &'a [u8],
}

impl<'a> SectionInfo<'a> {
    /// Builds a section description from a goblin section header and its body.
    #[must_use]
    pub fn from_section_table(section: &goblin::pe::section_table::SectionTable, data: &'a [u8]) -> Self {
        Self {
            name: section.name().unwrap_or("<invalid>").to_string(),
            characteristics: section.characteristics,
            virtual_address: RelativeAddress::new(section.virtual_address),
            virtual_size: section.virtual_size,
            file_offset: FileOffsetAddress::new(section.pointer_to_raw_data),
            data,
        }
    }

    /// The RVA range the section covers.
    #[must_use]
    pub fn range(&self) -> AddressRange<RelativeAddress> {
        AddressRange::new(self.virtual_address, self.virtual_size)
    }

    /// Whether the section contains executable code.
    #[must_use]
    pub fn contains_code(&self) -> bool {
        self.characteristics & goblin::pe::section_table::IMAGE_SCN_CNT_CODE != 0
    }

    /// The initialized bytes backing `[rva, rva + size)`, if the range is fully
    /// initialized.
    #[must_use]
    pub fn initialized_slice(&self, rva: RelativeAddress, size: u32) -> Option<&'a [u8]> {
        if !self.range().contains_range(&AddressRange::new(rva, size)) {
            return None;
        }
        let start = (rva - self.virtual_address) as usize;
        self.data.get(start..start + size as usize)
    }
}

/// One linker section contribution: the unit blocks are initially created from.
#[derive(Debug, Clone)]
pub struct SectionContribution {
    /// The RVA the contribution starts at.
    pub rva: RelativeAddress,
    /// The contribution's extent.
    pub size: u32,
    /// The compiland (object file) that contributed it.
    pub compiland: String,
    /// Whether the contribution holds code.
    pub is_code: bool,
    /// Whether the compiland is on the supported-compiler whitelist.
    pub supported_compiler: bool,
}

bitflags! {
    /// Attribute hints a symbol carries about its function.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SymbolAttributes: u8 {
        /// The function does not return to its caller.
        const NON_RETURN = 1 << 0;
        /// The function contains inline assembly.
        const HAS_INLINE_ASSEMBLY = 1 << 1;
        /// The function uses structured or C++ exception handling.
        const HAS_EXCEPTION_HANDLING = 1 << 2;
    }
}

/// What kind of program element a symbol describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// A function with a private symbol.
    Function,
    /// A single-instruction jump thunk.
    Thunk,
    /// A data symbol.
    Data,
    /// A bare code label (debug start/end, scope markers resolve to this kind too).
    Label,
    /// A public symbol; contributes a label to whatever block covers its RVA.
    Public,
    /// A bracketed initializer run that must remain contiguous.
    CoffGroup,
}

/// One symbol record from the debug database.
#[derive(Debug, Clone)]
pub struct SymbolRecord {
    /// The RVA the symbol points at.
    pub rva: RelativeAddress,
    /// The extent of the symbol, zero for point symbols.
    pub size: u32,
    /// The symbol's name.
    pub name: String,
    /// What the symbol describes.
    pub kind: SymbolKind,
    /// Function-level attribute hints.
    pub attributes: SymbolAttributes,
}

/// One entry of the debug database's FIXUP stream.
#[derive(Debug, Clone, Copy)]
pub struct DebugFixupEntry {
    /// The RVA of the encoded value.
    pub location: RelativeAddress,
    /// The RVA the value semantically refers to.
    pub base: RelativeAddress,
    /// The kind of value encoded.
    pub kind: ReferenceType,
    /// Auxiliary properties.
    pub flags: FixupFlags,
}

/// The image's own relocation table: the set of RVAs the loader patches.
#[derive(Debug, Clone, Default)]
pub struct RelocationSet {
    rvas: std::collections::BTreeSet<RelativeAddress>,
}

impl RelocationSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a relocated RVA.
    pub fn insert(&mut self, rva: RelativeAddress) -> bool {
        self.rvas.insert(rva)
    }

    /// Whether `rva` is relocated.
    #[must_use]
    pub fn contains(&self, rva: RelativeAddress) -> bool {
        self.rvas.contains(&rva)
    }

    /// Iterates relocated RVAs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = RelativeAddress> + '_ {
        self.rvas.iter().copied()
    }

    /// The number of relocation entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rvas.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rvas.is_empty()
    }
}

impl FromIterator<RelativeAddress> for RelocationSet {
    fn from_iter<T: IntoIterator<Item = RelativeAddress>>(iter: T) -> Self {
        Self {
            rvas: iter.into_iter().collect(),
        }
    }
}

/// Everything the external producers hand the decomposer for one module.
#[derive(Debug, Default)]
pub struct ModuleInput<'a> {
    /// The image base the module was linked at.
    pub image_base: AbsoluteAddress,
    /// The section table with section bodies.
    pub sections: Vec<SectionInfo<'a>>,
    /// Linker section contributions, in any order.
    pub contributions: Vec<SectionContribution>,
    /// Symbols, typically most-informative first (functions before publics).
    pub symbols: Vec<SymbolRecord>,
    /// The debug database's FIXUP stream.
    pub fixups: Vec<DebugFixupEntry>,
    /// The image's relocation table.
    pub relocations: RelocationSet,
    /// Present when the input module was already rewritten once: translates the debug
    /// database's address space onto the input image.
    pub legacy_translation: Option<AddressTranslationTable>,
}

impl<'a> ModuleInput<'a> {
    /// The section covering `rva`, if any.
    #[must_use]
    pub fn section_containing(&self, rva: RelativeAddress) -> Option<&SectionInfo<'a>> {
        self.sections.iter().find(|s| s.range().contains(rva))
    }

    /// Reads the 32-bit little-endian value encoded at `rva`.
    #[must_use]
    pub fn read_u32(&self, rva: RelativeAddress) -> Option<u32> {
        let section = self.section_containing(rva)?;
        let bytes = section.initialized_slice(rva, 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use goblin::pe::section_table::IMAGE_SCN_CNT_CODE;

    fn rva(value: u32) -> RelativeAddress {
        RelativeAddress::new(value)
    }

    #[test]
    fn initialized_slice_respects_data_length() {
        let data = [1u8, 2, 3, 4];
        let section = SectionInfo {
            name: ".text".to_string(),
            characteristics: IMAGE_SCN_CNT_CODE,
            virtual_address: rva(0x1000),
            virtual_size: 0x100,
            file_offset: FileOffsetAddress::new(0x400),
            data: &data,
        };
        assert_eq!(section.initialized_slice(rva(0x1000), 4), Some(&data[..]));
        // Inside the virtual extent but past the initialized bytes.
        assert_eq!(section.initialized_slice(rva(0x1004), 4), None);
        // Outside the virtual extent entirely.
        assert_eq!(section.initialized_slice(rva(0x2000), 4), None);
    }

    #[test]
    fn read_u32_is_little_endian() {
        let data = [0x78u8, 0x56, 0x34, 0x12];
        let input = ModuleInput {
            sections: vec![SectionInfo {
                name: ".rdata".to_string(),
                characteristics: 0,
                virtual_address: rva(0x2000),
                virtual_size: 4,
                file_offset: FileOffsetAddress::new(0x800),
                data: &data,
            }],
            ..Default::default()
        };
        assert_eq!(input.read_u32(rva(0x2000)), Some(0x1234_5678));
        assert_eq!(input.read_u32(rva(0x2001)), None);
    }
}
