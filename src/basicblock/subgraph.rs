//! The basic-block subgraph: the decomposed view of one or more blocks.

use std::collections::BTreeMap;

use rustc_hash::FxHashSet;

use crate::basicblock::{BasicBlock, BasicBlockContent, BasicBlockId, BasicBlockTarget};
use crate::graph::{BlockAttributes, BlockId, SectionId};
use crate::Result;

/// Describes one block the builder will emit from a subgraph.
///
/// The decomposer produces a single description reproducing the original block; transforms
/// may add descriptions to split a function, or reorder `basic_block_order` to re-lay the
/// original one out.
#[derive(Debug, Clone)]
pub struct BlockDescription {
    /// The emitted block's name.
    pub name: String,
    /// The originating compiland, if known.
    pub compiland: Option<String>,
    /// The section the emitted block belongs to.
    pub section: Option<SectionId>,
    /// The emitted block's alignment, a power of two.
    pub alignment: u32,
    /// Minimum alignment of each basic block inside the emitted block; 1 disables
    /// inter-basic-block padding.
    pub basic_block_alignment: u32,
    /// Attributes the emitted block carries.
    pub attributes: BlockAttributes,
    /// The basic blocks to emit, in order.
    pub basic_block_order: Vec<BasicBlockId>,
}

/// A subgraph of basic blocks plus the descriptions of the blocks to build from them.
///
/// The subgraph exclusively owns its basic blocks until a block builder consumes them into
/// a host graph.
#[derive(Debug, Clone, Default)]
pub struct BasicBlockSubgraph {
    original_block: Option<BlockId>,
    basic_blocks: BTreeMap<BasicBlockId, BasicBlock>,
    next_id: u32,
    descriptions: Vec<BlockDescription>,
}

impl BasicBlockSubgraph {
    /// Creates an empty subgraph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The block this subgraph was decomposed from, if any.
    #[must_use]
    pub fn original_block(&self) -> Option<BlockId> {
        self.original_block
    }

    /// Records the block this subgraph was decomposed from.
    pub fn set_original_block(&mut self, block: BlockId) {
        self.original_block = Some(block);
    }

    /// Adds a basic block and returns its id.
    ///
    /// `offset` is the position the block occupied inside the decomposed block, or `None`
    /// for freshly synthesized blocks.
    pub fn add_basic_block(
        &mut self,
        name: impl Into<String>,
        offset: Option<u32>,
        content: BasicBlockContent,
    ) -> BasicBlockId {
        let id = BasicBlockId(self.next_id);
        self.next_id += 1;
        self.basic_blocks.insert(
            id,
            BasicBlock {
                id,
                name: name.into(),
                offset,
                labels: BTreeMap::new(),
                content,
            },
        );
        id
    }

    /// The basic block with the given id.
    #[must_use]
    pub fn basic_block(&self, id: BasicBlockId) -> Option<&BasicBlock> {
        self.basic_blocks.get(&id)
    }

    /// Mutable access to a basic block.
    #[must_use]
    pub fn basic_block_mut(&mut self, id: BasicBlockId) -> Option<&mut BasicBlock> {
        self.basic_blocks.get_mut(&id)
    }

    /// Iterates basic blocks in id order.
    pub fn basic_blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.basic_blocks.values()
    }

    /// The number of basic blocks.
    #[must_use]
    pub fn basic_block_count(&self) -> usize {
        self.basic_blocks.len()
    }

    /// The basic block whose original offset is `offset`, if any.
    #[must_use]
    pub fn basic_block_at(&self, offset: u32) -> Option<&BasicBlock> {
        self.basic_blocks
            .values()
            .find(|bb| bb.offset() == Some(offset))
    }

    /// Adds a block description.
    pub fn add_description(&mut self, description: BlockDescription) {
        self.descriptions.push(description);
    }

    /// The block descriptions.
    #[must_use]
    pub fn descriptions(&self) -> &[BlockDescription] {
        &self.descriptions
    }

    /// Mutable access to the block descriptions.
    pub fn descriptions_mut(&mut self) -> &mut Vec<BlockDescription> {
        &mut self.descriptions
    }

    /// Removes every basic block and description, leaving an empty subgraph.
    ///
    /// The block builder calls this after transferring ownership of the emitted state into
    /// the host graph.
    pub(crate) fn clear(&mut self) {
        self.basic_blocks.clear();
        self.descriptions.clear();
        self.original_block = None;
    }

    /// Validates the subgraph's structure.
    ///
    /// Checks that every described basic block exists, that no basic block appears in more
    /// than one description, that successor shapes obey the shape rules, and that every
    /// internal reference points at a basic block of this subgraph.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation on the first defect found.
    pub fn validate(&self) -> Result<()> {
        let mut described: FxHashSet<BasicBlockId> = FxHashSet::default();
        for description in &self.descriptions {
            for &id in &description.basic_block_order {
                if !self.basic_blocks.contains_key(&id) {
                    return Err(invariant_error!(
                        "description '{}' lists unknown {}",
                        description.name,
                        id
                    ));
                }
                if !described.insert(id) {
                    return Err(invariant_error!("{} appears in two descriptions", id));
                }
            }
            if !description.alignment.is_power_of_two()
                || !description.basic_block_alignment.is_power_of_two()
            {
                return Err(invariant_error!(
                    "description '{}' has a non-power-of-two alignment",
                    description.name
                ));
            }
        }

        for bb in self.basic_blocks.values() {
            let BasicBlockContent::Code(code) = bb.content() else {
                continue;
            };
            code.validate_successors()?;

            let internal_targets = code
                .successors
                .iter()
                .map(|s| s.target)
                .chain(
                    code.instructions
                        .iter()
                        .flat_map(|i| i.references().values().map(|r| r.target)),
                );
            for target in internal_targets {
                if let BasicBlockTarget::BasicBlock(id) = target {
                    if !self.basic_blocks.contains_key(&id) {
                        return Err(invariant_error!(
                            "{} references unknown {} in the same subgraph",
                            bb.id(),
                            id
                        ));
                    }
                }
            }
        }

        Ok(())
    }
}
