//! The relink pipeline: decompose, transform, order, lay out, derive outputs.
//!
//! The pipeline is fixed and linear. Each phase borrows its inputs and produces a new
//! owned output; a failing phase aborts the run and earlier phases' outputs are dropped
//! unchanged. There is no retry and no internal concurrency.

use log::{debug, info};
use uguid::Guid;

use crate::address::{AddressRange, RelativeAddress};
use crate::basicblock::{BasicBlockDecomposer, BlockBuilder};
use crate::decomposer::decompose_module;
use crate::graph::{Block, BlockGraph, BlockId, BlockType};
use crate::input::ModuleInput;
use crate::policy::{DefaultRedecompositionPolicy, RedecompositionPolicy};
use crate::relink::{
    build_relocation_table, build_translation_tables, BlockOrderer, ImageLayout, LayoutBuilder,
    OriginalOrderer, TranslationTables,
};
use crate::{Error, Result};

/// A transform over the whole block graph.
///
/// Transforms are clients of the core: they may add, remove, and rewrite blocks, and may
/// use [`apply_basic_block_transform`] for basic-block-level edits. A transform that
/// returns an error aborts the pipeline.
pub trait BlockGraphTransform {
    /// The transform's name, for diagnostics.
    fn name(&self) -> &'static str;

    /// Mutates the graph.
    ///
    /// # Errors
    ///
    /// Any error aborts the pipeline run.
    fn transform(
        &mut self,
        graph: &mut BlockGraph<'_>,
        policy: &dyn RedecompositionPolicy,
    ) -> Result<()>;
}

/// A transform over one decomposed block.
pub trait BasicBlockSubgraphTransform {
    /// The transform's name, for diagnostics.
    fn name(&self) -> &'static str;

    /// Mutates the subgraph before it is rebuilt.
    ///
    /// # Errors
    ///
    /// Any error abandons the subgraph; the host graph is left unchanged.
    fn transform(&mut self, subgraph: &mut crate::basicblock::BasicBlockSubgraph) -> Result<()>;
}

/// Decomposes `block`, applies `transform`, and rebuilds the result into the graph.
///
/// The policy is consulted first; an unsafe block yields [`Error::PolicyRefused`], which
/// is a per-block non-success the caller may treat as skippable.
///
/// # Errors
///
/// Returns `PolicyRefused` for unsafe blocks, or whatever the decomposer, transform, or
/// builder reports. The graph is unchanged unless the build committed.
pub fn apply_basic_block_transform(
    transform: &mut dyn BasicBlockSubgraphTransform,
    policy: &dyn RedecompositionPolicy,
    graph: &mut BlockGraph<'_>,
    block: BlockId,
) -> Result<Vec<BlockId>> {
    if !policy.block_is_safe_to_decompose(graph, block) {
        return Err(Error::PolicyRefused {
            block,
            reason: format!("refused by policy for transform '{}'", transform.name()),
        });
    }

    let mut subgraph = BasicBlockDecomposer::new(graph, block).decompose()?;
    transform.transform(&mut subgraph)?;
    subgraph.validate()?;
    let new_ids = BlockBuilder::new(graph).build(&mut subgraph)?;
    policy.invalidate(block);
    debug!(
        "transform '{}' rebuilt {} into {} block(s)",
        transform.name(),
        block,
        new_ids.len()
    );
    Ok(new_ids)
}

/// Everything the image and debug writers need to stamp the output module.
#[derive(Debug)]
pub struct RelinkOutput<'a> {
    /// The transformed block graph; the image writer serializes block bytes from it.
    pub graph: BlockGraph<'a>,
    /// The final address assignment.
    pub layout: ImageLayout,
    /// Relocation RVAs: one per absolute reference, sorted, nothing else.
    pub relocations: Vec<RelativeAddress>,
    /// Both address-translation directions for the debug writer.
    pub tables: TranslationTables,
    /// How many original ranges were duplicated into several new locations.
    pub duplicated_source_ranges: usize,
    /// The replacement build guid for the output debug database.
    pub build_guid: Guid,
}

/// The fixed high-level pipeline.
pub struct RelinkPipeline {
    transforms: Vec<Box<dyn BlockGraphTransform>>,
    orderer: Box<dyn BlockOrderer>,
    policy: Box<dyn RedecompositionPolicy>,
    layout_builder: LayoutBuilder,
    build_guid: Guid,
}

impl RelinkPipeline {
    /// Creates a pipeline with the default policy, orderer and layout geometry.
    ///
    /// `build_guid` becomes the output debug database's identity; hosts generate a fresh
    /// one per relink.
    #[must_use]
    pub fn new(build_guid: Guid) -> Self {
        Self {
            transforms: Vec::new(),
            orderer: Box::new(OriginalOrderer),
            policy: Box::new(DefaultRedecompositionPolicy::new()),
            layout_builder: LayoutBuilder::new(),
            build_guid,
        }
    }

    /// Appends a transform. Transforms run in insertion order.
    pub fn add_transform(&mut self, transform: Box<dyn BlockGraphTransform>) -> &mut Self {
        self.transforms.push(transform);
        self
    }

    /// Replaces the block orderer.
    pub fn set_orderer(&mut self, orderer: Box<dyn BlockOrderer>) -> &mut Self {
        self.orderer = orderer;
        self
    }

    /// Replaces the transform policy.
    pub fn set_policy(&mut self, policy: Box<dyn RedecompositionPolicy>) -> &mut Self {
        self.policy = policy;
        self
    }

    /// Replaces the layout geometry.
    pub fn set_layout_builder(&mut self, layout_builder: LayoutBuilder) -> &mut Self {
        self.layout_builder = layout_builder;
        self
    }

    /// Runs the pipeline over one module.
    ///
    /// Phases: decompose the inputs into a block graph, audit every code block's
    /// decomposability, run the transforms, order and lay out, then derive the image
    /// writer's relocation table and the debug writer's translation tables.
    ///
    /// # Errors
    ///
    /// The first failing phase aborts the run.
    pub fn run<'a>(&mut self, input: &ModuleInput<'a>) -> Result<RelinkOutput<'a>> {
        let space = decompose_module(input)?;
        let mut graph = space.into_graph();
        info!(
            "decomposed module into {} blocks in {} sections",
            graph.block_count(),
            graph.section_count()
        );

        Self::audit_code_blocks(&mut graph);

        for transform in &mut self.transforms {
            debug!("running transform '{}'", transform.name());
            transform.transform(&mut graph, self.policy.as_ref())?;
        }

        let layout = self.layout_builder.build(&graph, self.orderer.as_ref())?;

        let original_extent = Self::original_extent(input);
        let (tables, duplicated_source_ranges) =
            build_translation_tables(&graph, &layout, original_extent);
        let relocations = build_relocation_table(&graph, &layout);

        Ok(RelinkOutput {
            graph,
            layout,
            relocations,
            tables,
            duplicated_source_ranges,
            build_guid: self.build_guid,
        })
    }

    /// Tags every code block whose disassembly is anomalous, so the policy classifies it
    /// conservatively before any transform asks.
    fn audit_code_blocks(graph: &mut BlockGraph<'_>) {
        let candidates: Vec<BlockId> = graph
            .blocks()
            .filter(|b| {
                b.block_type() == BlockType::Code
                    && !b.attributes().intersects(
                        crate::graph::BlockAttributes::GAP
                            | crate::graph::BlockAttributes::PADDING,
                    )
            })
            .map(Block::id)
            .collect();
        for id in candidates {
            let anomalies = BasicBlockDecomposer::new(graph, id).audit();
            if !anomalies.is_empty() {
                debug!("audit tagged {} with {:?}", id, anomalies);
                if let Some(block) = graph.block_mut(id) {
                    block.set_attributes(anomalies);
                }
            }
        }
    }

    /// The RVA extent of the original image, from its section table.
    fn original_extent(input: &ModuleInput<'_>) -> AddressRange<RelativeAddress> {
        let end = input
            .sections
            .iter()
            .map(|s| s.range().end())
            .max()
            .unwrap_or(RelativeAddress::ZERO);
        AddressRange::new(RelativeAddress::ZERO, end.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basicblock::{BasicBlockAssembler, BasicBlockSubgraph, Register};
    use crate::graph::BlockAttributes;

    struct Prologue;

    impl BasicBlockSubgraphTransform for Prologue {
        fn name(&self) -> &'static str {
            "prologue"
        }

        fn transform(&mut self, subgraph: &mut BasicBlockSubgraph) -> Result<()> {
            let head = subgraph
                .basic_block_at(0)
                .ok_or_else(|| Error::Error("no head".to_string()))?
                .id();
            let code = subgraph
                .basic_block_mut(head)
                .and_then(|bb| bb.as_code_mut())
                .ok_or_else(|| Error::Error("head is not code".to_string()))?;
            let mut asm = BasicBlockAssembler::new(code, 0);
            asm.push_reg(Register::EAX)?;
            asm.pop_reg(Register::EAX)?;
            Ok(())
        }
    }

    fn seeded_graph() -> (BlockGraph<'static>, BlockId) {
        use crate::graph::{Label, LabelAttributes};
        let mut graph = BlockGraph::new();
        let id = graph.add_block(BlockType::Code, 5, "func");
        let block = graph.block_mut(id).unwrap();
        block
            .set_data(std::borrow::Cow::Owned(vec![0x74, 0x02, 0x33, 0xc0, 0xc3]))
            .unwrap();
        *block.source_ranges_mut() =
            crate::graph::SourceRanges::identity(RelativeAddress::new(0x1000), 5);
        block
            .set_label(0, Label::new("func", LabelAttributes::CODE).unwrap())
            .unwrap();
        (graph, id)
    }

    #[test]
    fn basic_block_transform_round_trip() {
        let (mut graph, id) = seeded_graph();
        let policy = DefaultRedecompositionPolicy::new();
        let new_ids =
            apply_basic_block_transform(&mut Prologue, &policy, &mut graph, id).unwrap();
        let rebuilt = graph.block(new_ids[0]).unwrap();
        assert_eq!(rebuilt.data(), &[0x50, 0x58, 0x74, 0x02, 0x33, 0xc0, 0xc3]);
    }

    #[test]
    fn policy_refusal_is_a_non_success_not_a_crash() {
        let (mut graph, id) = seeded_graph();
        graph
            .block_mut(id)
            .unwrap()
            .set_attributes(BlockAttributes::ERRORED_DISASSEMBLY);
        let policy = DefaultRedecompositionPolicy::new();
        let result = apply_basic_block_transform(&mut Prologue, &policy, &mut graph, id);
        assert!(matches!(result, Err(Error::PolicyRefused { block, .. }) if block == id));
        // The graph is untouched.
        assert_eq!(graph.block(id).unwrap().data(), &[0x74, 0x02, 0x33, 0xc0, 0xc3]);
    }
}
