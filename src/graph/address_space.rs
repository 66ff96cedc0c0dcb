//! An RVA-keyed view over a block graph.
//!
//! During decomposition every block occupies a range of the original image; this view keeps
//! the bidirectional association between RVAs and blocks and hosts the mutators that need
//! it, most prominently [`merge_intersecting_blocks`](ImageAddressSpace::merge_intersecting_blocks).

use std::borrow::Cow;
use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::address::{AddressRange, RelativeAddress};
use crate::graph::{Block, BlockAttributes, BlockGraph, BlockId, BlockType, Reference};
use crate::Result;

/// A block graph paired with an assignment of blocks to original-image RVAs.
///
/// Blocks added through the view occupy non-overlapping address ranges. The view owns the
/// graph; mutations that do not involve addresses go through [`graph_mut`](Self::graph_mut).
#[derive(Debug, Default)]
pub struct ImageAddressSpace<'a> {
    graph: BlockGraph<'a>,
    // RVA -> (extent, block). Keys are starts of non-overlapping ranges.
    ranges: BTreeMap<RelativeAddress, (u32, BlockId)>,
    by_block: FxHashMap<BlockId, RelativeAddress>,
}

impl<'a> ImageAddressSpace<'a> {
    /// Creates an empty address space with an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            graph: BlockGraph::new(),
            ranges: BTreeMap::new(),
            by_block: FxHashMap::default(),
        }
    }

    /// The underlying graph.
    #[must_use]
    pub fn graph(&self) -> &BlockGraph<'a> {
        &self.graph
    }

    /// Mutable access to the underlying graph.
    ///
    /// Address-neutral mutations (references, labels, attributes) are safe here; size
    /// changes must go through the address-space mutators instead.
    pub fn graph_mut(&mut self) -> &mut BlockGraph<'a> {
        &mut self.graph
    }

    /// Consumes the view, returning the graph. The address assignment is discarded; the
    /// blocks keep their histories through their source ranges.
    #[must_use]
    pub fn into_graph(self) -> BlockGraph<'a> {
        self.graph
    }

    /// Adds a block covering `[address, address + size)`.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if the range overlaps an existing block.
    pub fn insert_block(
        &mut self,
        address: RelativeAddress,
        size: u32,
        block_type: BlockType,
        name: impl Into<String>,
    ) -> Result<BlockId> {
        let range = AddressRange::new(address, size);
        if let Some(existing) = self.first_intersecting(&range) {
            return Err(invariant_error!(
                "range {} overlaps existing block {}",
                range,
                existing
            ));
        }

        let id = self.graph.add_block(block_type, size, name);
        self.ranges.insert(address, (size, id));
        self.by_block.insert(id, address);
        Ok(id)
    }

    /// The RVA a block was assigned, if it came through this view.
    #[must_use]
    pub fn address_of(&self, id: BlockId) -> Option<RelativeAddress> {
        self.by_block.get(&id).copied()
    }

    /// Finds the block covering `address`, together with the offset of `address` inside it.
    #[must_use]
    pub fn resolve(&self, address: RelativeAddress) -> Option<(BlockId, u32)> {
        let (start, (size, id)) = self.ranges.range(..=address).next_back()?;
        let offset = address.value() - start.value();
        (offset < *size).then_some((*id, offset))
    }

    /// Finds the block covering `address`.
    #[must_use]
    pub fn get_block_by_address(&self, address: RelativeAddress) -> Option<&Block<'a>> {
        let (id, _) = self.resolve(address)?;
        self.graph.block(id)
    }

    /// The blocks whose extents meet `range`, in address order.
    #[must_use]
    pub fn get_intersecting_blocks(&self, range: AddressRange<RelativeAddress>) -> Vec<BlockId> {
        let mut result = Vec::new();
        // The candidate starting before `range` may still reach into it.
        let scan_from = self
            .ranges
            .range(..range.start())
            .next_back()
            .map_or(range.start(), |(start, _)| *start);
        for (start, (size, id)) in self.ranges.range(scan_from..) {
            if *start >= range.end() {
                break;
            }
            if AddressRange::new(*start, *size).intersects(&range) {
                result.push(*id);
            }
        }
        result
    }

    fn first_intersecting(&self, range: &AddressRange<RelativeAddress>) -> Option<BlockId> {
        self.get_intersecting_blocks(*range).first().copied()
    }

    /// Uncovered subranges of `range`, in address order.
    #[must_use]
    pub fn gaps_in(&self, range: AddressRange<RelativeAddress>) -> Vec<AddressRange<RelativeAddress>> {
        let mut gaps = Vec::new();
        let mut cursor = range.start();
        for id in self.get_intersecting_blocks(range) {
            let start = self.by_block[&id];
            let size = self.graph.block(id).map_or(0, Block::size);
            if start > cursor {
                gaps.push(AddressRange::new(cursor, (start - cursor) as u32));
            }
            cursor = cursor.max(start + size);
        }
        if cursor < range.end() {
            gaps.push(AddressRange::new(cursor, (range.end() - cursor) as u32));
        }
        gaps
    }

    /// Collapses every block whose extent meets `range` into a single block.
    ///
    /// The merged block spans from the lowest to the highest intersecting extent. Data is
    /// concatenated at the member offsets with interior gaps zero-extended, labels are
    /// lifted and merged, outgoing references are pushed through (references between
    /// members become self-references), inbound referrers are retargeted, and source-range
    /// histories are preserved at the members' new offsets.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if no block intersects `range`, the members disagree
    /// on their section, or a member is protected.
    pub fn merge_intersecting_blocks(
        &mut self,
        range: AddressRange<RelativeAddress>,
    ) -> Result<BlockId> {
        let members = self.get_intersecting_blocks(range);
        let Some(&first) = members.first() else {
            return Err(invariant_error!("no blocks intersect {}", range));
        };
        if members.len() == 1 {
            return Ok(first);
        }

        // Validate up front so the mutations below cannot leave a half-merged graph.
        let section = self.graph.block(first).expect("member exists").section();
        for &id in &members {
            let block = self.graph.block(id).expect("member exists");
            if block.section() != section {
                return Err(invariant_error!(
                    "cannot merge across sections: {} disagrees with {}",
                    id,
                    first
                ));
            }
            if block.has_attributes(BlockAttributes::PE_PARSED) {
                return Err(invariant_error!("cannot merge protected block {}", id));
            }
        }

        let span_start = self.by_block[&first];
        let span_end = members
            .iter()
            .map(|id| self.by_block[id] + self.graph.block(*id).expect("member exists").size())
            .max()
            .expect("members is non-empty");
        let span_size = (span_end - span_start) as u32;

        let merged_type = if members.iter().any(|id| {
            self.graph.block(*id).expect("member exists").block_type() == BlockType::Code
        }) {
            BlockType::Code
        } else {
            BlockType::Data
        };

        // Per-member offset inside the merged block.
        let member_offsets: FxHashMap<BlockId, u32> = members
            .iter()
            .map(|id| (*id, (self.by_block[id] - span_start) as u32))
            .collect();

        let first_block = self.graph.block(first).expect("member exists");
        let merged_name = first_block.name().to_string();
        let merged_alignment = first_block.alignment();
        let merged_id = self.graph.add_block(merged_type, span_size, merged_name);

        // Assemble data, attributes, labels and source ranges.
        let mut data: Vec<u8> = Vec::new();
        let mut attributes = BlockAttributes::empty();
        let mut pending_labels = Vec::new();
        for &id in &members {
            let block = self.graph.block(id).expect("member exists");
            let member_offset = member_offsets[&id];

            attributes |= block.attributes();
            if !block.data().is_empty() {
                let end = member_offset as usize + block.data().len();
                if data.len() < end {
                    data.resize(end, 0);
                }
                data[member_offset as usize..end].copy_from_slice(block.data());
            }
            for (offset, label) in block.labels() {
                pending_labels.push((member_offset + offset, label.clone()));
            }
        }

        let mut merged_ranges = crate::graph::SourceRanges::new();
        let mut covered = 0;
        for &id in &members {
            let block = self.graph.block(id).expect("member exists");
            let member_offset = member_offsets[&id];
            if member_offset > covered {
                // An interior gap between members keeps its identity mapping.
                merged_ranges.push(
                    covered,
                    member_offset - covered,
                    Some(span_start + covered),
                );
            }
            merged_ranges.append_shifted(block.source_ranges(), member_offset);
            covered = member_offset + block.size();
        }
        if covered < span_size {
            merged_ranges.push(covered, span_size - covered, Some(span_start + covered));
        }

        {
            let merged = self.graph.block_mut(merged_id).expect("just added");
            merged.set_section(section);
            merged.set_attributes(attributes);
            let _ = merged.set_alignment(merged_alignment);
            merged.set_data(Cow::Owned(data))?;
            *merged.source_ranges_mut() = merged_ranges;
            for (offset, label) in pending_labels {
                merged.set_label(offset, label)?;
            }
        }

        // Push outgoing references through to the merged block.
        let mut pending_out: Vec<(u32, Reference)> = Vec::new();
        for &id in &members {
            let offsets: Vec<u32> = self
                .graph
                .block(id)
                .expect("member exists")
                .references()
                .keys()
                .copied()
                .collect();
            let member_offset = member_offsets[&id];
            for offset in offsets {
                let reference = self
                    .graph
                    .remove_reference(id, offset)?
                    .expect("offset just enumerated");
                let rewritten = match member_offsets.get(&reference.target()) {
                    #[allow(clippy::cast_possible_wrap)]
                    Some(&target_offset) => {
                        reference.retargeted(merged_id, target_offset as i32)
                    }
                    None => reference,
                };
                pending_out.push((member_offset + offset, rewritten));
            }
        }

        // Retarget inbound referrers; after the loop above only external ones remain.
        for &id in &members {
            let member_offset = member_offsets[&id];
            let size = self.graph.block(id).expect("member exists").size();
            self.graph
                .transfer_references(id, 0, merged_id, member_offset, size)?;
        }

        for &id in &members {
            self.graph.remove_block(id)?;
            let start = self.by_block.remove(&id).expect("member was mapped");
            self.ranges.remove(&start);
        }

        for (offset, reference) in pending_out {
            self.graph.set_reference(merged_id, offset, reference)?;
        }

        self.ranges.insert(span_start, (span_size, merged_id));
        self.by_block.insert(merged_id, span_start);
        Ok(merged_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Label, LabelAttributes, ReferenceType};

    fn rva(value: u32) -> RelativeAddress {
        RelativeAddress::new(value)
    }

    #[test]
    fn insert_rejects_overlap() {
        let mut space = ImageAddressSpace::new();
        space
            .insert_block(rva(0x100), 0x40, BlockType::Code, "x")
            .unwrap();
        assert!(space
            .insert_block(rva(0x13f), 0x10, BlockType::Code, "y")
            .is_err());
        assert!(space
            .insert_block(rva(0x140), 0x10, BlockType::Code, "y")
            .is_ok());
    }

    #[test]
    fn resolve_finds_covering_block() {
        let mut space = ImageAddressSpace::new();
        let x = space
            .insert_block(rva(0x100), 0x40, BlockType::Code, "x")
            .unwrap();
        assert_eq!(space.resolve(rva(0x100)), Some((x, 0)));
        assert_eq!(space.resolve(rva(0x13f)), Some((x, 0x3f)));
        assert_eq!(space.resolve(rva(0x140)), None);
        assert_eq!(space.resolve(rva(0xff)), None);
    }

    #[test]
    fn gaps_are_reported_in_order() {
        let mut space = ImageAddressSpace::new();
        space
            .insert_block(rva(0x110), 0x10, BlockType::Data, "a")
            .unwrap();
        space
            .insert_block(rva(0x130), 0x10, BlockType::Data, "b")
            .unwrap();
        let gaps = space.gaps_in(AddressRange::new(rva(0x100), 0x50));
        assert_eq!(
            gaps,
            vec![
                AddressRange::new(rva(0x100), 0x10),
                AddressRange::new(rva(0x120), 0x10),
                AddressRange::new(rva(0x140), 0x10),
            ]
        );
    }

    /// Blocks X and Y abut; Z references Y+0x10. After merging the covering range, Z's
    /// reference lands on the merged block at the member-shifted offset.
    #[test]
    fn merge_retargets_external_references() {
        let mut space = ImageAddressSpace::new();
        let x = space
            .insert_block(rva(0x100), 0x40, BlockType::Code, "x")
            .unwrap();
        let y = space
            .insert_block(rva(0x140), 0x40, BlockType::Code, "y")
            .unwrap();
        let z = space
            .insert_block(rva(0x200), 0x20, BlockType::Code, "z")
            .unwrap();
        space
            .graph_mut()
            .set_reference(z, 8, Reference::direct(ReferenceType::Absolute, 4, y, 0x10))
            .unwrap();

        let merged = space
            .merge_intersecting_blocks(AddressRange::new(rva(0x100), 0x80))
            .unwrap();
        assert_ne!(merged, x);
        assert_ne!(merged, y);

        let w = space.graph().block(merged).unwrap();
        assert_eq!(w.size(), 0x80);
        let r = space.graph().reference_of(z, 8).unwrap();
        assert_eq!(r.target(), merged);
        assert_eq!(r.offset(), 0x50);
        assert_eq!(r.base(), 0x50);
        assert!(space.graph().block(x).is_none());
        assert!(space.graph().block(y).is_none());
    }

    #[test]
    fn merge_zero_extends_short_data() {
        let mut space = ImageAddressSpace::new();
        let x = space
            .insert_block(rva(0x100), 0x10, BlockType::Data, "x")
            .unwrap();
        let y = space
            .insert_block(rva(0x110), 0x10, BlockType::Data, "y")
            .unwrap();
        space
            .graph_mut()
            .block_mut(x)
            .unwrap()
            .set_data(Cow::Owned(vec![0xaa; 0x10]))
            .unwrap();
        // The later block's buffer is shorter than its extent.
        space
            .graph_mut()
            .block_mut(y)
            .unwrap()
            .set_data(Cow::Owned(vec![0xbb; 4]))
            .unwrap();

        let merged = space
            .merge_intersecting_blocks(AddressRange::new(rva(0x100), 0x20))
            .unwrap();
        let block = space.graph().block(merged).unwrap();
        assert_eq!(block.data().len(), 0x14);
        assert_eq!(&block.data()[0x10..], &[0xbb; 4]);
    }

    #[test]
    fn merge_internalizes_member_references() {
        let mut space = ImageAddressSpace::new();
        let x = space
            .insert_block(rva(0x100), 0x10, BlockType::Code, "x")
            .unwrap();
        let y = space
            .insert_block(rva(0x110), 0x10, BlockType::Code, "y")
            .unwrap();
        space
            .graph_mut()
            .set_reference(x, 0, Reference::direct(ReferenceType::PcRelative, 4, y, 4))
            .unwrap();

        let merged = space
            .merge_intersecting_blocks(AddressRange::new(rva(0x100), 0x20))
            .unwrap();
        let block = space.graph().block(merged).unwrap();
        let r = block.reference_at(0).unwrap();
        assert_eq!(r.target(), merged);
        assert_eq!(r.base(), 0x14);
        assert!(block.referrers().contains(&(merged, 0)));
    }

    #[test]
    fn merge_preserves_labels_and_source_ranges() {
        let mut space = ImageAddressSpace::new();
        let x = space
            .insert_block(rva(0x100), 0x10, BlockType::Code, "x")
            .unwrap();
        let y = space
            .insert_block(rva(0x110), 0x10, BlockType::Code, "y")
            .unwrap();
        for (id, start) in [(x, 0x100u32), (y, 0x110u32)] {
            let block = space.graph_mut().block_mut(id).unwrap();
            *block.source_ranges_mut() =
                crate::graph::SourceRanges::identity(rva(start), 0x10);
        }
        space
            .graph_mut()
            .block_mut(y)
            .unwrap()
            .set_label(4, Label::new("inner", LabelAttributes::CODE).unwrap())
            .unwrap();

        let merged = space
            .merge_intersecting_blocks(AddressRange::new(rva(0x100), 0x20))
            .unwrap();
        let block = space.graph().block(merged).unwrap();
        assert!(block.label_at(0x14).is_some());
        assert!(block.source_ranges().is_cover_of(0x20));
        assert_eq!(block.source_ranges().map_offset(0x14), Some(rva(0x114)));
    }
}
