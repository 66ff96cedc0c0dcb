//! Round-trip laws: for any block the policy deems safe, rebuilding its unmodified
//! decomposition reproduces it - identical bytes, identical labels, equivalent outgoing
//! references, identity provenance - and decomposing the rebuilt block again yields the
//! same basic-block structure.

use std::borrow::Cow;

use peweave::address::RelativeAddress;
use peweave::basicblock::{BasicBlockDecomposer, BasicBlockSubgraph, BlockBuilder};
use peweave::graph::{
    BlockGraph, BlockId, BlockType, Label, LabelAttributes, Reference, ReferenceType,
    SourceRanges,
};
use peweave::policy::{DefaultRedecompositionPolicy, RedecompositionPolicy};

/// A small but structurally rich function:
///
/// ```text
/// 0x00  55                 push ebp
/// 0x01  8b ec              mov ebp, esp
/// 0x03  e8 <rel32>         call helper        (block-level pc-relative reference)
/// 0x08  85 c0              test eax, eax
/// 0x0a  74 03              je +3 -> 0x0f
/// 0x0c  33 c0              xor eax, eax
/// 0x0e  5d                 pop ebp
/// 0x0f  c3                 ret
/// ```
const FUNC: [u8; 16] = [
    0x55, 0x8b, 0xec, 0xe8, 0x00, 0x00, 0x00, 0x00, 0x85, 0xc0, 0x74, 0x03, 0x33, 0xc0,
    0x5d, 0xc3,
];

fn rva(value: u32) -> RelativeAddress {
    RelativeAddress::new(value)
}

fn seed(graph: &mut BlockGraph<'static>) -> (BlockId, BlockId) {
    let helper = graph.add_block(BlockType::Code, 0x10, "helper");
    {
        let block = graph.block_mut(helper).unwrap();
        block.set_data(Cow::Owned(vec![0xc3; 0x10])).unwrap();
        block
            .set_label(0, Label::new("helper", LabelAttributes::CODE).unwrap())
            .unwrap();
    }

    let func = graph.add_block(BlockType::Code, FUNC.len() as u32, "func");
    {
        let block = graph.block_mut(func).unwrap();
        block.set_data(Cow::Owned(FUNC.to_vec())).unwrap();
        *block.source_ranges_mut() = SourceRanges::identity(rva(0x1000), FUNC.len() as u32);
        block
            .set_label(0, Label::new("func", LabelAttributes::CODE).unwrap())
            .unwrap();
    }
    // The call's displacement slot references helper.
    graph
        .set_reference(
            func,
            4,
            Reference::direct(ReferenceType::PcRelative, 4, helper, 0),
        )
        .unwrap();
    (func, helper)
}

fn decompose(graph: &BlockGraph<'static>, id: BlockId) -> BasicBlockSubgraph {
    BasicBlockDecomposer::new(graph, id).decompose().unwrap()
}

#[test]
fn rebuild_of_an_unmodified_decomposition_is_the_identity() {
    let mut graph = BlockGraph::new();
    let (func, helper) = seed(&mut graph);
    let policy = DefaultRedecompositionPolicy::new();
    assert!(policy.block_is_safe_to_decompose(&graph, func));

    let mut subgraph = decompose(&graph, func);
    let new_ids = BlockBuilder::new(&mut graph).build(&mut subgraph).unwrap();
    assert_eq!(new_ids.len(), 1);
    let rebuilt = graph.block(new_ids[0]).unwrap();

    // Identical bytes at identical offsets.
    assert_eq!(rebuilt.size(), FUNC.len() as u32);
    assert_eq!(rebuilt.data(), &FUNC);

    // Identical label set.
    assert_eq!(rebuilt.labels().len(), 1);
    assert!(rebuilt
        .label_at(0)
        .is_some_and(|l| l.name() == "func" && l.has_attributes(LabelAttributes::CODE)));

    // The call still references helper from the same slot.
    let call = rebuilt.reference_at(4).unwrap();
    assert_eq!(call.target(), helper);
    assert_eq!(call.ref_type(), ReferenceType::PcRelative);
    assert_eq!(call.size(), 4);
    assert!(graph
        .block(helper)
        .unwrap()
        .referrers()
        .contains(&(new_ids[0], 4)));

    // The provenance is the identity over the whole block.
    let ranges = rebuilt.source_ranges();
    assert!(ranges.is_cover_of(FUNC.len() as u32));
    for offset in 0..FUNC.len() as u32 {
        assert_eq!(ranges.map_offset(offset), Some(rva(0x1000 + offset)));
    }
}

#[test]
fn redecomposing_a_rebuild_preserves_structure() {
    let mut graph = BlockGraph::new();
    let (func, _) = seed(&mut graph);

    let before = decompose(&graph, func);
    let shapes_before = shapes(&before);

    let mut subgraph = decompose(&graph, func);
    let new_ids = BlockBuilder::new(&mut graph).build(&mut subgraph).unwrap();

    // The rebuilt block carries our attribute, so it is unconditionally decomposable.
    let policy = DefaultRedecompositionPolicy::new();
    assert!(policy.block_is_safe_to_decompose(&graph, new_ids[0]));

    let after = decompose(&graph, new_ids[0]);
    assert_eq!(shapes_before, shapes(&after));
}

/// A structural fingerprint: per basic code block, the instruction bytes and the
/// successor conditions, in order.
fn shapes(subgraph: &BasicBlockSubgraph) -> Vec<(Vec<Vec<u8>>, Vec<String>)> {
    subgraph
        .basic_blocks()
        .filter_map(|bb| bb.as_code())
        .map(|code| {
            (
                code.instructions
                    .iter()
                    .map(|i| i.data().to_vec())
                    .collect(),
                code.successors
                    .iter()
                    .map(|s| s.condition.to_string())
                    .collect(),
            )
        })
        .collect()
}

#[test]
fn repeated_round_trips_are_stable() {
    let mut graph = BlockGraph::new();
    let (func, _) = seed(&mut graph);

    let mut current = func;
    for _ in 0..3 {
        let mut subgraph = decompose(&graph, current);
        let new_ids = BlockBuilder::new(&mut graph).build(&mut subgraph).unwrap();
        current = new_ids[0];
        assert_eq!(graph.block(current).unwrap().data(), &FUNC);
    }
}
