//! # peweave Prelude
//!
//! Convenient re-exports of the types a transform author or pipeline host touches most.
//!
//! ```rust
//! use peweave::prelude::*;
//! ```

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all peweave operations
pub use crate::Error;

/// The result type used throughout peweave
pub use crate::Result;

// ================================================================================================
// Addresses
// ================================================================================================

/// Address primitives and ranges
pub use crate::address::{
    AbsoluteAddress, AddressRange, AddressRangeMap, AddressTranslationTable, FileOffsetAddress,
    RelativeAddress,
};

// ================================================================================================
// The Block Graph
// ================================================================================================

/// The core data model
pub use crate::graph::{
    Block, BlockAttributes, BlockGraph, BlockId, BlockType, ImageAddressSpace, Label,
    LabelAttributes, Reference, ReferenceType, Section, SectionId, SourceRanges,
};

// ================================================================================================
// Decomposition Inputs
// ================================================================================================

/// The external-producer contract and the fixup map
pub use crate::fixup::{Fixup, FixupFlags, FixupMap};
pub use crate::input::{
    DebugFixupEntry, ModuleInput, RelocationSet, SectionContribution, SectionInfo, SymbolKind,
    SymbolRecord,
};

/// The image decomposer
pub use crate::decomposer::{decompose_module, ImageDecomposer};

// ================================================================================================
// Basic-Block Machinery
// ================================================================================================

/// Decompose, assemble, rebuild
pub use crate::basicblock::{
    BasicBlockAssembler, BasicBlockDecomposer, BasicBlockSubgraph, BlockBuilder,
    BlockDescription, Register, SuccessorCondition, UntypedReference,
};

// ================================================================================================
// Policy and Pipeline
// ================================================================================================

/// The transform policy
pub use crate::policy::{DefaultRedecompositionPolicy, RedecompositionPolicy};

/// Orchestration and outputs
pub use crate::relink::{
    apply_basic_block_transform, BasicBlockSubgraphTransform, BlockGraphTransform, BlockOrderer,
    ImageLayout, LayoutBuilder, OriginalOrderer, RelinkOutput, RelinkPipeline,
    TranslationTables,
};
