//! Image layout: assigning RVAs to ordered blocks.

use rustc_hash::FxHashMap;

use crate::address::{AddressRange, RelativeAddress};
use crate::graph::{Block, BlockGraph, BlockId, SectionId};
use crate::Result;

/// One section of the output image: its identity plus the ordered blocks inside it.
#[derive(Debug, Clone)]
pub struct SectionLayout {
    /// The section's id in the block graph.
    pub id: SectionId,
    /// The section's name.
    pub name: String,
    /// The section's `IMAGE_SCN_*` characteristics.
    pub characteristics: u32,
    /// The RVA the section starts at.
    pub base: RelativeAddress,
    /// The section's virtual size.
    pub size: u32,
    /// The blocks of the section with their assigned RVAs, in layout order.
    pub blocks: Vec<(RelativeAddress, BlockId)>,
}

impl SectionLayout {
    /// The RVA range the section covers.
    #[must_use]
    pub fn range(&self) -> AddressRange<RelativeAddress> {
        AddressRange::new(self.base, self.size)
    }
}

/// An ordered section table with a contiguous ordered block sequence per section.
///
/// A layout is derived from a block graph; it is an address assignment, never a second
/// source of truth for block contents.
#[derive(Debug, Clone, Default)]
pub struct ImageLayout {
    /// The sections in output order.
    pub sections: Vec<SectionLayout>,
    by_block: FxHashMap<BlockId, RelativeAddress>,
}

impl ImageLayout {
    /// The RVA assigned to `block`, if it was laid out.
    #[must_use]
    pub fn rva_of(&self, block: BlockId) -> Option<RelativeAddress> {
        self.by_block.get(&block).copied()
    }

    /// The first RVA past the end of the last section.
    #[must_use]
    pub fn extent(&self) -> RelativeAddress {
        self.sections
            .last()
            .map_or(RelativeAddress::ZERO, |s| s.range().end())
    }
}

/// Chooses the order of blocks inside each section.
pub trait BlockOrderer {
    /// Returns a permutation of `blocks` to lay out, in order.
    fn order_section(
        &self,
        graph: &BlockGraph<'_>,
        section: SectionId,
        blocks: Vec<BlockId>,
    ) -> Vec<BlockId>;
}

/// Keeps blocks in id order, which reproduces the decomposition order.
#[derive(Debug, Default)]
pub struct OriginalOrderer;

impl BlockOrderer for OriginalOrderer {
    fn order_section(
        &self,
        _graph: &BlockGraph<'_>,
        _section: SectionId,
        blocks: Vec<BlockId>,
    ) -> Vec<BlockId> {
        blocks
    }
}

/// Assigns RVAs to every block, section by section.
#[derive(Debug, Clone)]
pub struct LayoutBuilder {
    /// Alignment of each section start. PE requires the section alignment of the optional
    /// header; 0x1000 matches the common page-aligned layout.
    pub section_alignment: u32,
    /// The RVA of the first section.
    pub start: RelativeAddress,
}

impl Default for LayoutBuilder {
    fn default() -> Self {
        Self {
            section_alignment: 0x1000,
            start: RelativeAddress::new(0x1000),
        }
    }
}

impl LayoutBuilder {
    /// Creates a builder with the default page-aligned geometry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a layout for `graph`, ordering each section's blocks through `orderer`.
    ///
    /// Sections are laid out in insertion order; inside a section each block receives its
    /// leading padding and alignment before its RVA is assigned. Blocks without a section
    /// (PE-parsed header structures) are not laid out here; the image writer places them.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if the orderer does not return a permutation of the
    /// section's blocks.
    pub fn build(
        &self,
        graph: &BlockGraph<'_>,
        orderer: &dyn BlockOrderer,
    ) -> Result<ImageLayout> {
        let mut layout = ImageLayout::default();
        let mut cursor = self.start;

        for (section_id, section) in graph.sections() {
            let members: Vec<BlockId> = graph
                .blocks()
                .filter(|b| b.section() == Some(section_id))
                .map(Block::id)
                .collect();
            let ordered = orderer.order_section(graph, section_id, members.clone());

            let mut check: Vec<BlockId> = ordered.clone();
            check.sort_unstable();
            let mut expected = members;
            expected.sort_unstable();
            if check != expected {
                return Err(invariant_error!(
                    "orderer did not return a permutation of section {}",
                    section_id
                ));
            }

            cursor = cursor.align_up(self.section_alignment);
            let base = cursor;
            let mut blocks = Vec::with_capacity(ordered.len());
            for id in ordered {
                let block = graph.block(id).expect("member enumerated above");
                cursor += block.padding_before();
                cursor = cursor.align_up(block.alignment());
                blocks.push((cursor, id));
                layout.by_block.insert(id, cursor);
                cursor += block.size();
            }

            layout.sections.push(SectionLayout {
                id: section_id,
                name: section.name().to_string(),
                characteristics: section.characteristics(),
                base,
                size: (cursor - base) as u32,
                blocks,
            });
        }

        Ok(layout)
    }
}
