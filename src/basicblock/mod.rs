//! Basic-block decomposition, assembly and reassembly.
//!
//! This module is the machinery that lets transforms edit code at basic-block
//! granularity:
//!
//! - [`BasicBlockDecomposer`] takes a code block deemed safe by the transform policy and
//!   produces a [`BasicBlockSubgraph`]: basic code and data blocks, typed successors, and
//!   a [`BlockDescription`] that reproduces the original when rebuilt.
//! - [`BasicBlockAssembler`] emits new instructions into a basic block's instruction list
//!   through the external x86 encoder, attaching `(type, size)` reference contracts per
//!   opcode.
//! - [`BlockBuilder`] consolidates a subgraph back into host-graph blocks, iterating
//!   short/long branch encodings to a fixed point and retargeting every inbound referrer.
//!
//! # Example
//!
//! ```rust,no_run
//! use peweave::basicblock::{
//!     BasicBlockAssembler, BasicBlockDecomposer, BlockBuilder, Register,
//! };
//! use peweave::graph::{BlockGraph, BlockId};
//!
//! # fn instrument(graph: &mut BlockGraph<'_>, block: BlockId) -> peweave::Result<()> {
//! let mut subgraph = BasicBlockDecomposer::new(graph, block).decompose()?;
//! let head = subgraph.basic_blocks().next().unwrap().id();
//! let code = subgraph.basic_block_mut(head).unwrap().as_code_mut().unwrap();
//! let mut asm = BasicBlockAssembler::new(code, 0);
//! asm.push_reg(Register::EAX)?;
//! asm.pop_reg(Register::EAX)?;
//! BlockBuilder::new(graph).build(&mut subgraph)?;
//! # Ok(())
//! # }
//! ```

mod assembler;
mod basic_block;
mod builder;
mod condition;
mod decomposer;
mod instruction;
mod reference;
mod subgraph;

pub use assembler::{BasicBlockAssembler, Immediate, Memory, Register};
pub use basic_block::{
    BasicBlock, BasicBlockContent, BasicCodeBlock, BasicDataBlock, Successor,
};
pub use builder::BlockBuilder;
pub use condition::SuccessorCondition;
pub use decomposer::BasicBlockDecomposer;
pub use instruction::Instruction;
pub use reference::{BasicBlockId, BasicBlockReference, BasicBlockTarget, UntypedReference};
pub use subgraph::{BasicBlockSubgraph, BlockDescription};
