//! The block: a typed, sized, optionally data-backed region of the image.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::graph::{
    BlockAttributes, Label, Reference, SectionId, SourceRanges,
};
use crate::Result;

/// Identifier of a block inside a block graph.
///
/// Ids are assigned monotonically and never reused within one graph instance, so an id held
/// across mutations stays valid until its block is removed and can never silently rebind to
/// a different block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(u32);

impl BlockId {
    /// Builds a block id from its raw value.
    #[must_use]
    pub const fn from_raw(value: u32) -> Self {
        Self(value)
    }

    /// The raw value of this id.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b#{}", self.0)
    }
}

/// Whether a block holds instructions or data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    /// The block holds executable code.
    Code,
    /// The block holds data (including read-only directory structures).
    Data,
}

/// A contiguous addressable region of the image.
///
/// A block has a semantic extent (`size`) and an optional data buffer that may be shorter
/// than the extent; trailing bytes are implicitly zero. The buffer either borrows from the
/// mapped input image or is owned by the block; the first mutable access clones a borrowed
/// buffer into an owned one.
///
/// Reference bookkeeping (the outgoing map and the incoming referrer set) is mutated only
/// through [`crate::graph::BlockGraph`] so that both sides always stay consistent.
#[derive(Debug, Clone)]
pub struct Block<'a> {
    id: BlockId,
    block_type: BlockType,
    size: u32,
    data: Cow<'a, [u8]>,
    alignment: u32,
    alignment_offset: i32,
    padding_before: u32,
    section: Option<SectionId>,
    attributes: BlockAttributes,
    name: String,
    compiland_name: Option<String>,
    labels: BTreeMap<u32, Label>,
    pub(super) references: BTreeMap<u32, Reference>,
    pub(super) referrers: BTreeSet<(BlockId, u32)>,
    source_ranges: SourceRanges,
}

impl<'a> Block<'a> {
    pub(super) fn new(id: BlockId, block_type: BlockType, size: u32, name: String) -> Self {
        Self {
            id,
            block_type,
            size,
            data: Cow::Borrowed(&[]),
            alignment: 1,
            alignment_offset: 0,
            padding_before: 0,
            section: None,
            attributes: BlockAttributes::empty(),
            name,
            compiland_name: None,
            labels: BTreeMap::new(),
            references: BTreeMap::new(),
            referrers: BTreeSet::new(),
            source_ranges: SourceRanges::new(),
        }
    }

    /// The block's stable id.
    #[must_use]
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Whether the block holds code or data.
    #[must_use]
    pub fn block_type(&self) -> BlockType {
        self.block_type
    }

    /// The semantic extent of the block in bytes.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    pub(super) fn set_size(&mut self, size: u32) {
        self.size = size;
    }

    /// The block's data buffer. May be shorter than [`size`](Self::size); the remaining
    /// bytes are implicitly zero.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whether the block owns its data buffer (as opposed to borrowing from the mapped
    /// input image).
    #[must_use]
    pub fn owns_data(&self) -> bool {
        matches!(self.data, Cow::Owned(_))
    }

    /// Replaces the block's data buffer.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if the buffer is longer than the block's extent.
    pub fn set_data(&mut self, data: Cow<'a, [u8]>) -> Result<()> {
        if data.len() > self.size as usize {
            return Err(invariant_error!(
                "data buffer of {} bytes exceeds extent of {} ({} bytes)",
                data.len(),
                self.id,
                self.size
            ));
        }
        self.data = data;
        Ok(())
    }

    /// Mutable access to the data buffer.
    ///
    /// A borrowed buffer is cloned into an owned one on the first call; afterwards the block
    /// owns its data.
    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        self.data.to_mut()
    }

    /// Reads `size` bytes at `offset` from the data buffer.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if the requested range extends past the buffer.
    pub fn data_slice(&self, offset: u32, size: u32) -> Result<&[u8]> {
        let start = offset as usize;
        let end = start + size as usize;
        self.data.get(start..end).ok_or(crate::Error::OutOfBounds)
    }

    /// The block's alignment requirement, a power of two.
    #[must_use]
    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    /// Sets the alignment requirement.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation unless `alignment` is a power of two.
    pub fn set_alignment(&mut self, alignment: u32) -> Result<()> {
        if !alignment.is_power_of_two() {
            return Err(invariant_error!("alignment {} is not a power of two", alignment));
        }
        self.alignment = alignment;
        Ok(())
    }

    /// Offset into the block that the alignment applies to.
    ///
    /// Usually zero; non-zero when a leading header must end, rather than start, on an
    /// aligned address.
    #[must_use]
    pub fn alignment_offset(&self) -> i32 {
        self.alignment_offset
    }

    /// Sets the alignment offset.
    pub fn set_alignment_offset(&mut self, alignment_offset: i32) {
        self.alignment_offset = alignment_offset;
    }

    /// Minimum number of padding bytes the layout must keep before this block.
    #[must_use]
    pub fn padding_before(&self) -> u32 {
        self.padding_before
    }

    /// Sets the leading padding requirement.
    pub fn set_padding_before(&mut self, padding_before: u32) {
        self.padding_before = padding_before;
    }

    /// The section the block belongs to, if any.
    #[must_use]
    pub fn section(&self) -> Option<SectionId> {
        self.section
    }

    /// Assigns the block to a section (or to none).
    pub fn set_section(&mut self, section: Option<SectionId>) {
        self.section = section;
    }

    /// The block's attribute set.
    #[must_use]
    pub fn attributes(&self) -> BlockAttributes {
        self.attributes
    }

    /// Whether the block carries all of the given attributes.
    #[must_use]
    pub fn has_attributes(&self, attributes: BlockAttributes) -> bool {
        self.attributes.contains(attributes)
    }

    /// Adds attributes to the block.
    pub fn set_attributes(&mut self, attributes: BlockAttributes) {
        self.attributes |= attributes;
    }

    /// Removes attributes from the block.
    pub fn clear_attributes(&mut self, attributes: BlockAttributes) {
        self.attributes &= !attributes;
    }

    /// The block's name. Diagnostic only.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the block.
    ///
    /// Initial names come from the section contribution or the PE parser; the first
    /// user-assigned label at offset zero supersedes them, since symbols are processed
    /// most-informative first.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// The compiland (object file) the block came from, if known. Diagnostic only.
    #[must_use]
    pub fn compiland_name(&self) -> Option<&str> {
        self.compiland_name.as_deref()
    }

    /// Records the originating compiland.
    pub fn set_compiland_name(&mut self, compiland_name: impl Into<String>) {
        self.compiland_name = Some(compiland_name.into());
    }

    /// The block's labels, keyed by offset.
    #[must_use]
    pub fn labels(&self) -> &BTreeMap<u32, Label> {
        &self.labels
    }

    /// The label at `offset`, if any.
    #[must_use]
    pub fn label_at(&self, offset: u32) -> Option<&Label> {
        self.labels.get(&offset)
    }

    /// Sets or merges a label at `offset`.
    ///
    /// A label may sit at `offset == size`: debug-end labels legitimately fall one byte past
    /// a block's end. Returns `true` if no label existed at the offset before.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if the offset lies past the permitted range or the
    /// merge produces a contradictory attribute mask.
    pub fn set_label(&mut self, offset: u32, label: Label) -> Result<bool> {
        if offset > self.size {
            return Err(invariant_error!(
                "label '{}' at offset {:#x} outside {} of size {:#x}",
                label.name(),
                offset,
                self.id,
                self.size
            ));
        }

        match self.labels.get_mut(&offset) {
            Some(existing) => {
                existing.merge(&label)?;
                Ok(false)
            }
            None => {
                if offset == 0 && !label.name().is_empty() {
                    // Most-informative-name-wins: the first label at the head of the block
                    // names the block.
                    if self.has_attributes(BlockAttributes::SECTION_CONTRIBUTION)
                        && self.labels.is_empty()
                    {
                        self.name = label.name().to_string();
                    }
                }
                self.labels.insert(offset, label);
                Ok(true)
            }
        }
    }

    /// Removes the label at `offset`, returning it if present.
    pub fn remove_label(&mut self, offset: u32) -> Option<Label> {
        self.labels.remove(&offset)
    }

    /// The block's outgoing references, keyed by source offset.
    #[must_use]
    pub fn references(&self) -> &BTreeMap<u32, Reference> {
        &self.references
    }

    /// The outgoing reference at `offset`, if any.
    #[must_use]
    pub fn reference_at(&self, offset: u32) -> Option<&Reference> {
        self.references.get(&offset)
    }

    /// The `(block, offset)` pairs that reference this block.
    #[must_use]
    pub fn referrers(&self) -> &BTreeSet<(BlockId, u32)> {
        &self.referrers
    }

    /// The block's source-range history.
    #[must_use]
    pub fn source_ranges(&self) -> &SourceRanges {
        &self.source_ranges
    }

    /// Mutable access to the source-range history.
    pub fn source_ranges_mut(&mut self) -> &mut SourceRanges {
        &mut self.source_ranges
    }
}

impl fmt::Display for Block<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}, {:#x} bytes)", self.id, self.name, self.size)
    }
}
