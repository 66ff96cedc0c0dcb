//! The block graph: the core data model of the rewriter.
//!
//! A module decomposes into a directed multigraph of [`Block`]s - typed, sized, optionally
//! data-backed regions of the image - connected by typed [`Reference`]s. Blocks carry
//! [`Label`]s, [`BlockAttributes`], a [`SourceRanges`] history relating their bytes back to
//! the original image, and belong to [`Section`]s.
//!
//! # Key Types
//! - [`BlockGraph`] - owns all blocks and keeps reference bookkeeping consistent
//! - [`Block`] - one addressable region with labels, references out, referrers in
//! - [`Reference`] - a typed `(type, size, target, offset, base)` edge
//! - [`ImageAddressSpace`] - an RVA-keyed view used during decomposition
//!
//! # Consistency
//!
//! Every mutator preserves the structural invariants: outgoing references and referrer sets
//! agree at all times, reference slots stay inside their source block, bases stay inside
//! their target block, and source-range histories cover their block exactly.
//!
//! # Example
//!
//! ```rust
//! use peweave::graph::{BlockGraph, BlockType, Reference, ReferenceType};
//!
//! let mut graph = BlockGraph::new();
//! let caller = graph.add_block(BlockType::Code, 0x20, "caller");
//! let callee = graph.add_block(BlockType::Code, 0x10, "callee");
//! graph.set_reference(
//!     caller,
//!     1,
//!     Reference::direct(ReferenceType::PcRelative, 4, callee, 0),
//! )?;
//! assert!(graph.block(callee).unwrap().referrers().contains(&(caller, 1)));
//! # Ok::<(), peweave::Error>(())
//! ```

mod address_space;
mod attributes;
mod block;
pub mod dot;
#[allow(clippy::module_inception)]
mod graph;
mod label;
mod reference;
mod section;
mod source_range;

pub use address_space::ImageAddressSpace;
pub use attributes::BlockAttributes;
pub use block::{Block, BlockId, BlockType};
pub use graph::BlockGraph;
pub use label::{Label, LabelAttributes};
pub use reference::{Reference, ReferenceType};
pub use section::{Section, SectionId};
pub use source_range::{SourceRangePair, SourceRanges};
