//! Basic blocks: code, data, and end placeholders.

use std::collections::BTreeMap;
use std::fmt;

use crate::address::{AddressRange, RelativeAddress};
use crate::basicblock::{
    BasicBlockId, BasicBlockReference, BasicBlockTarget, Instruction, SuccessorCondition,
};
use crate::graph::Label;
use crate::Result;

/// An edge leaving a basic code block.
///
/// A successor stands in for the branch instruction that originally ended the basic block
/// (or for plain fall-through); the block builder re-synthesizes the branch when the
/// subgraph is assembled back into blocks.
#[derive(Debug, Clone)]
pub struct Successor {
    /// When this edge is taken.
    pub condition: SuccessorCondition,
    /// Where it leads.
    pub target: BasicBlockTarget,
    /// Position inside the target, relative to its start. Zero except for mid-block
    /// references into opaque foreign blocks.
    pub base: i32,
    /// Whether the builder may try the short branch encoding first.
    pub prefer_short: bool,
    /// Where the original branch's bytes came from, if the successor replaces one.
    pub source_range: Option<AddressRange<RelativeAddress>>,
}

impl Successor {
    /// Creates a successor taken under `condition`, aimed at the start of `target`.
    #[must_use]
    pub fn new(condition: SuccessorCondition, target: BasicBlockTarget) -> Self {
        Self {
            condition,
            target,
            base: 0,
            prefer_short: true,
            source_range: None,
        }
    }
}

impl fmt::Display for Successor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.condition, self.target)
    }
}

/// The instruction list and successors of a basic code block.
#[derive(Debug, Clone, Default)]
pub struct BasicCodeBlock {
    /// The straight-line instructions, in order. Flow-altering trailing branches are
    /// represented as successors instead.
    pub instructions: Vec<Instruction>,
    /// Zero, one, or two outgoing edges; see [`validate_successors`](Self::validate_successors).
    pub successors: Vec<Successor>,
}

impl BasicCodeBlock {
    /// Checks the successor shape rules.
    ///
    /// Valid shapes: no successors (the block ends in an unconditional terminator), one
    /// successor taken always, or two successors whose conditions are exact inverses.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation for any other shape.
    pub fn validate_successors(&self) -> Result<()> {
        match self.successors.as_slice() {
            [] => Ok(()),
            [only] => {
                if only.condition == SuccessorCondition::Always {
                    Ok(())
                } else {
                    Err(invariant_error!(
                        "single successor must be unconditional, got {}",
                        only.condition
                    ))
                }
            }
            [taken, not_taken] => {
                if taken.condition.inverse() == Some(not_taken.condition) {
                    Ok(())
                } else {
                    Err(invariant_error!(
                        "successor conditions {} and {} are not inverses",
                        taken.condition,
                        not_taken.condition
                    ))
                }
            }
            more => Err(invariant_error!("{} successors on one basic block", more.len())),
        }
    }

    /// The summed length of the instruction list in bytes, excluding successors.
    #[must_use]
    pub fn instructions_len(&self) -> u32 {
        self.instructions.iter().map(Instruction::len).sum()
    }
}

/// The byte buffer and reference slots of a basic data block.
#[derive(Debug, Clone, Default)]
pub struct BasicDataBlock {
    /// The data bytes.
    pub data: Vec<u8>,
    /// Reference slots, keyed by offset into the buffer.
    pub references: BTreeMap<u32, BasicBlockReference>,
    /// Where the bytes came from in the original image, if anywhere.
    pub source_range: Option<AddressRange<RelativeAddress>>,
}

/// The content of a basic block.
///
/// A tagged variant rather than an inheritance hierarchy: shared state (id, name, offset,
/// labels) lives in [`BasicBlock`], capabilities are reached through the `as_*` accessors.
#[derive(Debug, Clone)]
pub enum BasicBlockContent {
    /// Straight-line code with successors.
    Code(BasicCodeBlock),
    /// Data (lookup tables, jump tables, case tables, padding runs).
    Data(BasicDataBlock),
    /// A zero-sized placeholder carrying labels and referrers that would otherwise land
    /// one byte past the end of the enclosing block.
    End,
}

/// One basic block of a subgraph.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub(super) id: BasicBlockId,
    pub(super) name: String,
    pub(super) offset: Option<u32>,
    pub(super) labels: BTreeMap<u32, Label>,
    pub(super) content: BasicBlockContent,
}

impl BasicBlock {
    /// The basic block's id inside its subgraph.
    #[must_use]
    pub fn id(&self) -> BasicBlockId {
        self.id
    }

    /// The basic block's diagnostic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The offset this basic block occupied in the decomposed block, if it came from one.
    /// Synthesized blocks have no offset until the builder lays them out.
    #[must_use]
    pub fn offset(&self) -> Option<u32> {
        self.offset
    }

    /// Labels carried by this basic block, keyed by offset relative to its start.
    #[must_use]
    pub fn labels(&self) -> &BTreeMap<u32, Label> {
        &self.labels
    }

    /// Sets or merges a label at an offset relative to the basic block's start.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if merging produces a contradictory attribute mask.
    pub fn set_label(&mut self, offset: u32, label: Label) -> Result<bool> {
        match self.labels.get_mut(&offset) {
            Some(existing) => {
                existing.merge(&label)?;
                Ok(false)
            }
            None => {
                self.labels.insert(offset, label);
                Ok(true)
            }
        }
    }

    /// The content variant.
    #[must_use]
    pub fn content(&self) -> &BasicBlockContent {
        &self.content
    }

    /// Whether this is a basic code block.
    #[must_use]
    pub fn is_code(&self) -> bool {
        matches!(self.content, BasicBlockContent::Code(_))
    }

    /// Whether this is a basic data block.
    #[must_use]
    pub fn is_data(&self) -> bool {
        matches!(self.content, BasicBlockContent::Data(_))
    }

    /// Whether this is a basic end block.
    #[must_use]
    pub fn is_end(&self) -> bool {
        matches!(self.content, BasicBlockContent::End)
    }

    /// The code content, if this is a code block.
    #[must_use]
    pub fn as_code(&self) -> Option<&BasicCodeBlock> {
        match &self.content {
            BasicBlockContent::Code(code) => Some(code),
            _ => None,
        }
    }

    /// Mutable code content, if this is a code block.
    #[must_use]
    pub fn as_code_mut(&mut self) -> Option<&mut BasicCodeBlock> {
        match &mut self.content {
            BasicBlockContent::Code(code) => Some(code),
            _ => None,
        }
    }

    /// The data content, if this is a data block.
    #[must_use]
    pub fn as_data(&self) -> Option<&BasicDataBlock> {
        match &self.content {
            BasicBlockContent::Data(data) => Some(data),
            _ => None,
        }
    }

    /// Mutable data content, if this is a data block.
    #[must_use]
    pub fn as_data_mut(&mut self) -> Option<&mut BasicDataBlock> {
        match &mut self.content {
            BasicBlockContent::Data(data) => Some(data),
            _ => None,
        }
    }
}

impl fmt::Display for BasicBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.id, self.name)
    }
}
