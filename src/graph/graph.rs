//! The block graph: flat stable-id storage for blocks and their references.

use std::collections::BTreeMap;

use crate::graph::{
    Block, BlockAttributes, BlockId, BlockType, Reference, Section, SectionId,
};
use crate::Result;

/// A directed multigraph of blocks connected by typed references.
///
/// The graph exclusively owns all blocks and their metadata. Blocks are stored flat and
/// addressed by stable id; no raw pointers survive across mutations, every access goes
/// through the graph. The outgoing reference map of a source block and the referrer set of
/// its target are updated together by every mutator, so the two sides can never disagree.
///
/// Iteration order is deterministic everywhere it is observable: blocks iterate in id order,
/// labels and references in offset order, sections in insertion order.
#[derive(Debug, Default, Clone)]
pub struct BlockGraph<'a> {
    sections: BTreeMap<SectionId, Section>,
    next_section_id: u32,
    blocks: BTreeMap<BlockId, Block<'a>>,
    next_block_id: u32,
}

impl<'a> BlockGraph<'a> {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sections: BTreeMap::new(),
            next_section_id: 0,
            blocks: BTreeMap::new(),
            next_block_id: 1,
        }
    }

    // ---------------------------------------------------------------------------------
    // Sections
    // ---------------------------------------------------------------------------------

    /// Adds a section, returning its id.
    pub fn add_section(&mut self, name: &str, characteristics: u32) -> SectionId {
        let id = SectionId::from_raw(self.next_section_id);
        self.next_section_id += 1;
        self.sections.insert(id, Section::new(name, characteristics));
        id
    }

    /// Finds a section by name, or adds it. Characteristics of an existing section are
    /// extended with `characteristics`.
    pub fn find_or_add_section(&mut self, name: &str, characteristics: u32) -> SectionId {
        let found = self
            .sections
            .iter()
            .find(|(_, s)| s.name() == name)
            .map(|(id, _)| *id);
        match found {
            Some(id) => {
                let section = self.sections.get_mut(&id).expect("section just found");
                let merged = section.characteristics() | characteristics;
                *section = Section::new(name, merged);
                id
            }
            None => self.add_section(name, characteristics),
        }
    }

    /// Removes a section.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if the section does not exist or a live block still
    /// belongs to it.
    pub fn remove_section(&mut self, id: SectionId) -> Result<()> {
        if !self.sections.contains_key(&id) {
            return Err(invariant_error!("no such section: {}", id));
        }
        if self.blocks.values().any(|b| b.section() == Some(id)) {
            return Err(invariant_error!("section {} still has live blocks", id));
        }
        self.sections.remove(&id);
        Ok(())
    }

    /// Removes every section no live block belongs to. Returns how many were removed.
    pub fn sweep_dead_sections(&mut self) -> usize {
        let live: Vec<SectionId> = self
            .sections
            .keys()
            .copied()
            .filter(|id| self.blocks.values().any(|b| b.section() == Some(*id)))
            .collect();
        let before = self.sections.len();
        self.sections.retain(|id, _| live.contains(id));
        before - self.sections.len()
    }

    /// The section with the given id, if present.
    #[must_use]
    pub fn section(&self, id: SectionId) -> Option<&Section> {
        self.sections.get(&id)
    }

    /// Iterates sections in insertion order.
    pub fn sections(&self) -> impl Iterator<Item = (SectionId, &Section)> {
        self.sections.iter().map(|(id, s)| (*id, s))
    }

    /// The number of sections.
    #[must_use]
    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    // ---------------------------------------------------------------------------------
    // Blocks
    // ---------------------------------------------------------------------------------

    /// Adds a block and returns its id.
    pub fn add_block(
        &mut self,
        block_type: BlockType,
        size: u32,
        name: impl Into<String>,
    ) -> BlockId {
        let id = BlockId::from_raw(self.next_block_id);
        self.next_block_id += 1;
        self.blocks
            .insert(id, Block::new(id, block_type, size, name.into()));
        id
    }

    /// Removes a block.
    ///
    /// The block's own outgoing references are detached from their targets. Removal fails
    /// while any other block still refers to this one, and for blocks the PE parser
    /// produced (those are load-bearing image structure).
    ///
    /// # Errors
    ///
    /// Returns an invariant violation on a missing block, live referrers, or a protected
    /// block; the graph is unchanged in every failure case.
    pub fn remove_block(&mut self, id: BlockId) -> Result<()> {
        let block = self
            .blocks
            .get(&id)
            .ok_or_else(|| invariant_error!("no such block: {}", id))?;

        if block.has_attributes(BlockAttributes::PE_PARSED) {
            return Err(invariant_error!("{} is PE-parsed and may not be removed", id));
        }
        let externals = block
            .referrers
            .iter()
            .filter(|(referrer, _)| *referrer != id)
            .count();
        if externals != 0 {
            return Err(invariant_error!(
                "{} still has {} referrers and may not be removed",
                id,
                externals
            ));
        }

        let outgoing: Vec<(u32, BlockId)> = block
            .references
            .iter()
            .map(|(offset, r)| (*offset, r.target()))
            .collect();
        for (offset, target) in outgoing {
            if let Some(target_block) = self.blocks.get_mut(&target) {
                target_block.referrers.remove(&(id, offset));
            }
        }

        self.blocks.remove(&id);
        Ok(())
    }

    /// The block with the given id, if present.
    #[must_use]
    pub fn block(&self, id: BlockId) -> Option<&Block<'a>> {
        self.blocks.get(&id)
    }

    /// Mutable access to a block's non-reference state (labels, data, attributes, source
    /// ranges). References are mutated through the graph only.
    #[must_use]
    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut Block<'a>> {
        self.blocks.get_mut(&id)
    }

    /// Iterates blocks in id order.
    pub fn blocks(&self) -> impl Iterator<Item = &Block<'a>> {
        self.blocks.values()
    }

    /// The ids of all blocks, in id order.
    #[must_use]
    pub fn block_ids(&self) -> Vec<BlockId> {
        self.blocks.keys().copied().collect()
    }

    /// The number of blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    // ---------------------------------------------------------------------------------
    // References
    // ---------------------------------------------------------------------------------

    /// Sets the outgoing reference of `source` at `offset`, replacing any existing one.
    ///
    /// Both sides are updated atomically: validation happens before any mutation, so a
    /// failed call leaves the graph unchanged. Returns `true` if a reference was replaced.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if either block is missing, the (type, size)
    /// combination is not a legal row, the slot extends past the source's extent, or the
    /// base lies outside the target's extent.
    pub fn set_reference(
        &mut self,
        source: BlockId,
        offset: u32,
        reference: Reference,
    ) -> Result<bool> {
        if !reference.is_valid() {
            return Err(invariant_error!(
                "illegal reference type/size: {}/{}",
                reference.ref_type(),
                reference.size()
            ));
        }

        let source_size = self
            .blocks
            .get(&source)
            .ok_or_else(|| invariant_error!("no such source block: {}", source))?
            .size();
        if offset + u32::from(reference.size()) > source_size {
            return Err(invariant_error!(
                "reference slot [{:#x}, {:#x}) outside {} of size {:#x}",
                offset,
                offset + u32::from(reference.size()),
                source,
                source_size
            ));
        }

        let target_size = self
            .blocks
            .get(&reference.target())
            .ok_or_else(|| invariant_error!("no such target block: {}", reference.target()))?
            .size();
        if reference.base() < 0 || reference.base() as u32 >= target_size.max(1) {
            return Err(invariant_error!(
                "reference base {:#x} outside target {} of size {:#x}",
                reference.base(),
                reference.target(),
                target_size
            ));
        }

        // Validation is complete; the mutations below cannot fail.
        let old = {
            let source_block = self.blocks.get_mut(&source).expect("source just checked");
            source_block.references.insert(offset, reference)
        };
        if let Some(old) = old {
            let old_target = self
                .blocks
                .get_mut(&old.target())
                .expect("old target tracked by referrer set");
            old_target.referrers.remove(&(source, offset));
        }
        let target_block = self
            .blocks
            .get_mut(&reference.target())
            .expect("target just checked");
        target_block.referrers.insert((source, offset));

        Ok(old.is_some())
    }

    /// Removes the outgoing reference of `source` at `offset`, returning it if present.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if `source` does not exist.
    pub fn remove_reference(&mut self, source: BlockId, offset: u32) -> Result<Option<Reference>> {
        let source_block = self
            .blocks
            .get_mut(&source)
            .ok_or_else(|| invariant_error!("no such block: {}", source))?;
        let removed = source_block.references.remove(&offset);
        if let Some(removed) = &removed {
            let target = self
                .blocks
                .get_mut(&removed.target())
                .expect("target tracked by referrer set");
            target.referrers.remove(&(source, offset));
        }
        Ok(removed)
    }

    /// The reference `referrer` holds at `offset`, if any.
    #[must_use]
    pub fn reference_of(&self, referrer: BlockId, offset: u32) -> Option<Reference> {
        self.blocks
            .get(&referrer)
            .and_then(|b| b.references.get(&offset).copied())
    }

    /// Moves the outgoing reference of `source` from one slot offset to another.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if no reference exists at `from_offset`, a
    /// different reference already sits at `to_offset`, or the new slot runs off the
    /// block; the graph is unchanged on failure.
    pub fn move_reference(
        &mut self,
        source: BlockId,
        from_offset: u32,
        to_offset: u32,
    ) -> Result<()> {
        if from_offset == to_offset {
            return Ok(());
        }
        let source_block = self
            .blocks
            .get(&source)
            .ok_or_else(|| invariant_error!("no such block: {}", source))?;
        let reference = *source_block
            .references
            .get(&from_offset)
            .ok_or_else(|| invariant_error!("{} has no reference at {:#x}", source, from_offset))?;
        if source_block.references.contains_key(&to_offset) {
            return Err(invariant_error!(
                "{} already has a reference at {:#x}",
                source,
                to_offset
            ));
        }
        if to_offset + u32::from(reference.size()) > source_block.size() {
            return Err(invariant_error!(
                "moved slot [{:#x}, {:#x}) outside {}",
                to_offset,
                to_offset + u32::from(reference.size()),
                source
            ));
        }

        self.remove_reference(source, from_offset)?;
        self.set_reference(source, to_offset, reference)?;
        Ok(())
    }

    /// Retargets every reference pointing into the window `[from_offset, from_offset +
    /// size)` of `from` onto `to`, shifting uniformly so that `from_offset` maps to
    /// `to_offset`.
    ///
    /// All candidate rewrites are validated before the first one is applied.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if either block is missing or any shifted base would
    /// fall outside `to`'s extent; the graph is unchanged on failure.
    pub fn transfer_references(
        &mut self,
        from: BlockId,
        from_offset: u32,
        to: BlockId,
        to_offset: u32,
        size: u32,
    ) -> Result<()> {
        let from_block = self
            .blocks
            .get(&from)
            .ok_or_else(|| invariant_error!("no such block: {}", from))?;
        let to_size = self
            .blocks
            .get(&to)
            .ok_or_else(|| invariant_error!("no such block: {}", to))?
            .size();

        let shift = i64::from(to_offset) - i64::from(from_offset);
        let window = i64::from(from_offset)..i64::from(from_offset) + i64::from(size);

        let mut rewrites: Vec<(BlockId, u32, Reference)> = Vec::new();
        for &(referrer, offset) in &from_block.referrers {
            let reference = self
                .blocks
                .get(&referrer)
                .and_then(|b| b.references.get(&offset))
                .copied()
                .ok_or_else(|| {
                    invariant_error!("referrer ({}, {:#x}) has no reference", referrer, offset)
                })?;
            if reference.target() != from || !window.contains(&i64::from(reference.base())) {
                continue;
            }

            let new_base = i64::from(reference.base()) + shift;
            if new_base < 0 || new_base >= i64::from(to_size) {
                return Err(invariant_error!(
                    "transferred base {:#x} outside {} of size {:#x}",
                    new_base,
                    to,
                    to_size
                ));
            }
            #[allow(clippy::cast_possible_truncation)]
            let rewritten = reference.retargeted(to, shift as i32);
            rewrites.push((referrer, offset, rewritten));
        }

        for (referrer, offset, rewritten) in rewrites {
            self.set_reference(referrer, offset, rewritten)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Label, LabelAttributes, ReferenceType};

    fn graph_with_two_blocks() -> (BlockGraph<'static>, BlockId, BlockId) {
        let mut graph = BlockGraph::new();
        let a = graph.add_block(BlockType::Code, 0x40, "a");
        let b = graph.add_block(BlockType::Code, 0x20, "b");
        (graph, a, b)
    }

    #[test]
    fn ids_are_monotone_and_never_reused() {
        let (mut graph, a, b) = graph_with_two_blocks();
        assert!(a < b);
        graph.remove_block(b).unwrap();
        let c = graph.add_block(BlockType::Data, 4, "c");
        assert!(c > b);
    }

    #[test]
    fn set_reference_updates_both_sides() {
        let (mut graph, a, b) = graph_with_two_blocks();
        let r = Reference::direct(ReferenceType::PcRelative, 4, b, 0x10);
        assert!(!graph.set_reference(a, 4, r).unwrap());

        assert_eq!(graph.block(a).unwrap().references().len(), 1);
        assert!(graph.block(b).unwrap().referrers().contains(&(a, 4)));
    }

    #[test]
    fn replacing_a_reference_detaches_the_old_target() {
        let (mut graph, a, b) = graph_with_two_blocks();
        let c = graph.add_block(BlockType::Data, 8, "c");
        graph
            .set_reference(a, 4, Reference::direct(ReferenceType::Absolute, 4, b, 0))
            .unwrap();
        let replaced = graph
            .set_reference(a, 4, Reference::direct(ReferenceType::Absolute, 4, c, 0))
            .unwrap();
        assert!(replaced);
        assert!(graph.block(b).unwrap().referrers().is_empty());
        assert!(graph.block(c).unwrap().referrers().contains(&(a, 4)));
    }

    #[test]
    fn reference_bounds_are_validated() {
        let (mut graph, a, b) = graph_with_two_blocks();
        // Slot hangs off the end of the source.
        let r = Reference::direct(ReferenceType::Absolute, 4, b, 0);
        assert!(graph.set_reference(a, 0x3d, r).is_err());
        // Base outside the target extent.
        let r = Reference::direct(ReferenceType::Absolute, 4, b, 0x20);
        assert!(graph.set_reference(a, 0, r).is_err());
        // A failed insert left no trace on either side.
        assert!(graph.block(a).unwrap().references().is_empty());
        assert!(graph.block(b).unwrap().referrers().is_empty());
    }

    #[test]
    fn invalid_type_size_combination_is_rejected() {
        let (mut graph, a, b) = graph_with_two_blocks();
        let r = Reference::direct(ReferenceType::Absolute, 1, b, 0);
        assert!(graph.set_reference(a, 0, r).is_err());
    }

    #[test]
    fn remove_block_refuses_while_referred_to() {
        let (mut graph, a, b) = graph_with_two_blocks();
        graph
            .set_reference(a, 0, Reference::direct(ReferenceType::Absolute, 4, b, 0))
            .unwrap();
        assert!(graph.remove_block(b).is_err());

        graph.remove_reference(a, 0).unwrap();
        graph.remove_block(b).unwrap();
        assert_eq!(graph.block_count(), 1);
    }

    #[test]
    fn remove_block_detaches_outgoing_references() {
        let (mut graph, a, b) = graph_with_two_blocks();
        graph
            .set_reference(a, 0, Reference::direct(ReferenceType::Absolute, 4, b, 0))
            .unwrap();
        graph.remove_block(a).unwrap();
        assert!(graph.block(b).unwrap().referrers().is_empty());
    }

    #[test]
    fn pe_parsed_blocks_are_protected() {
        let mut graph = BlockGraph::new();
        let a = graph.add_block(BlockType::Data, 0x100, "headers");
        graph
            .block_mut(a)
            .unwrap()
            .set_attributes(BlockAttributes::PE_PARSED);
        assert!(graph.remove_block(a).is_err());
    }

    #[test]
    fn transfer_references_shifts_the_window() {
        let (mut graph, a, b) = graph_with_two_blocks();
        let c = graph.add_block(BlockType::Code, 0x80, "c");
        graph
            .set_reference(a, 0, Reference::direct(ReferenceType::PcRelative, 4, b, 0x10))
            .unwrap();
        graph
            .set_reference(a, 8, Reference::direct(ReferenceType::PcRelative, 4, b, 0x1c))
            .unwrap();

        graph.transfer_references(b, 0x10, c, 0x50, 0x10).unwrap();

        let r0 = graph.reference_of(a, 0).unwrap();
        assert_eq!(r0.target(), c);
        assert_eq!(r0.base(), 0x50);
        let r8 = graph.reference_of(a, 8).unwrap();
        assert_eq!(r8.target(), c);
        assert_eq!(r8.base(), 0x5c);
        assert!(graph.block(b).unwrap().referrers().is_empty());
        assert_eq!(graph.block(c).unwrap().referrers().len(), 2);
    }

    #[test]
    fn move_reference_keeps_both_sides_consistent() {
        let (mut graph, a, b) = graph_with_two_blocks();
        graph
            .set_reference(a, 0, Reference::direct(ReferenceType::Absolute, 4, b, 0))
            .unwrap();
        graph.move_reference(a, 0, 8).unwrap();

        assert!(graph.reference_of(a, 0).is_none());
        assert_eq!(graph.reference_of(a, 8).unwrap().target(), b);
        let referrers = graph.block(b).unwrap().referrers();
        assert!(referrers.contains(&(a, 8)));
        assert!(!referrers.contains(&(a, 0)));

        // Moving onto an occupied slot or off the end fails without side effects.
        graph
            .set_reference(a, 0, Reference::direct(ReferenceType::Absolute, 4, b, 4))
            .unwrap();
        assert!(graph.move_reference(a, 0, 8).is_err());
        assert!(graph.move_reference(a, 0, 0x3d).is_err());
        assert_eq!(graph.reference_of(a, 0).unwrap().base(), 4);
    }

    #[test]
    fn transfer_references_ignores_bases_outside_the_window() {
        let (mut graph, a, b) = graph_with_two_blocks();
        let c = graph.add_block(BlockType::Code, 0x80, "c");
        graph
            .set_reference(a, 0, Reference::direct(ReferenceType::PcRelative, 4, b, 4))
            .unwrap();
        graph.transfer_references(b, 0x10, c, 0, 0x10).unwrap();
        assert_eq!(graph.reference_of(a, 0).unwrap().target(), b);
    }

    #[test]
    fn find_or_add_section_merges_characteristics() {
        let mut graph = BlockGraph::new();
        let a = graph.add_section(".text", 0x1);
        let b = graph.find_or_add_section(".text", 0x2);
        assert_eq!(a, b);
        assert_eq!(graph.section(a).unwrap().characteristics(), 0x3);
        assert_eq!(graph.section_count(), 1);
    }

    #[test]
    fn sweep_removes_only_dead_sections() {
        let mut graph = BlockGraph::new();
        let text = graph.add_section(".text", 0);
        let _rdata = graph.add_section(".rdata", 0);
        let a = graph.add_block(BlockType::Code, 4, "a");
        graph.block_mut(a).unwrap().set_section(Some(text));

        assert_eq!(graph.sweep_dead_sections(), 1);
        assert!(graph.section(text).is_some());
        assert_eq!(graph.section_count(), 1);
    }

    #[test]
    fn label_at_block_head_renames_contribution_blocks() {
        let mut graph = BlockGraph::new();
        let a = graph.add_block(BlockType::Code, 0x10, "contribution");
        let block = graph.block_mut(a).unwrap();
        block.set_attributes(BlockAttributes::SECTION_CONTRIBUTION);
        block
            .set_label(0, Label::new("my_function", LabelAttributes::CODE).unwrap())
            .unwrap();
        assert_eq!(graph.block(a).unwrap().name(), "my_function");
    }
}
