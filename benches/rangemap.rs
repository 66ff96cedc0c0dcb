//! Micro-benchmarks for the address-range map and the basic-block round trip.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};

use peweave::address::{AddressRange, AddressRangeMap, RelativeAddress};
use peweave::basicblock::{BasicBlockDecomposer, BlockBuilder};
use peweave::graph::{BlockGraph, BlockType, Label, LabelAttributes, SourceRanges};

fn range(start: u32, size: u32) -> AddressRange<RelativeAddress> {
    AddressRange::new(RelativeAddress::new(start), size)
}

fn bench_range_map(c: &mut Criterion) {
    c.bench_function("range_map_insert_4k_pairs", |b| {
        b.iter(|| {
            let mut map = AddressRangeMap::new();
            for i in 0..4096u32 {
                // Alternate shifts so pairs do not all merge away.
                let shift = if i % 2 == 0 { 0x10_0000 } else { 0x20_0000 };
                map.insert(range(i * 16, 16), range(i * 16 + shift, 16));
            }
            map
        });
    });

    let mut map = AddressRangeMap::new();
    for i in 0..4096u32 {
        let shift = if i % 2 == 0 { 0x10_0000 } else { 0x20_0000 };
        map.insert(range(i * 16, 16), range(i * 16 + shift, 16));
    }
    c.bench_function("range_map_inverse_4k_pairs", |b| {
        b.iter(|| map.compute_inverse());
    });
}

fn bench_round_trip(c: &mut Criterion) {
    // je +2; xor eax, eax; ret - repeated to a few hundred bytes of branchy code.
    let mut bytes = Vec::new();
    for _ in 0..64 {
        bytes.extend_from_slice(&[0x74, 0x02, 0x33, 0xc0, 0x90]);
    }
    bytes.push(0xc3);

    let build_graph = || {
        let mut graph = BlockGraph::new();
        #[allow(clippy::cast_possible_truncation)]
        let id = graph.add_block(BlockType::Code, bytes.len() as u32, "bench");
        let block = graph.block_mut(id).unwrap();
        block
            .set_data(std::borrow::Cow::Owned(bytes.clone()))
            .unwrap();
        *block.source_ranges_mut() =
            SourceRanges::identity(RelativeAddress::new(0x1000), bytes.len() as u32);
        block
            .set_label(0, Label::new("bench", LabelAttributes::CODE).unwrap())
            .unwrap();
        (graph, id)
    };

    c.bench_function("decompose_branchy_block", |b| {
        let (graph, id) = build_graph();
        b.iter(|| BasicBlockDecomposer::new(&graph, id).decompose().unwrap());
    });

    c.bench_function("decompose_and_rebuild", |b| {
        b.iter_batched(
            build_graph,
            |(mut graph, id)| {
                let mut subgraph =
                    BasicBlockDecomposer::new(&graph, id).decompose().unwrap();
                BlockBuilder::new(&mut graph).build(&mut subgraph).unwrap();
                graph
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_range_map, bench_round_trip);
criterion_main!(benches);
