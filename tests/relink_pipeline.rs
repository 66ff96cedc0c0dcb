//! End-to-end: a parsed module goes through decomposition, a basic-block-level
//! instrumentation transform, layout, and translation-table derivation, with the section
//! bytes borrowed from a memory-mapped file the way a real host feeds the pipeline.

use std::io::Write as _;

use goblin::pe::section_table::{IMAGE_SCN_CNT_CODE, IMAGE_SCN_CNT_INITIALIZED_DATA};
use peweave::address::{AbsoluteAddress, FileOffsetAddress, RelativeAddress};
use peweave::basicblock::{BasicBlockAssembler, BasicBlockSubgraph, Register};
use peweave::fixup::FixupFlags;
use peweave::graph::{Block, BlockAttributes, BlockGraph, BlockId, ReferenceType};
use peweave::input::{
    DebugFixupEntry, ModuleInput, SectionContribution, SectionInfo, SymbolAttributes,
    SymbolKind, SymbolRecord,
};
use peweave::policy::RedecompositionPolicy;
use peweave::prelude::*;
use uguid::guid;

const IMAGE_BASE: u32 = 0x0040_0000;

fn rva(value: u32) -> RelativeAddress {
    RelativeAddress::new(value)
}

/// .text holds `alpha` (a call to `beta`, then ret) and `beta` (xor/ret), padded with
/// int3; .rdata holds one pointer to `beta`.
fn text_bytes() -> Vec<u8> {
    let mut text = vec![0x90u8; 0x18];
    text[0x00] = 0x55; // push ebp
    text[0x08] = 0xe8; // call beta
    let disp = 0x1010i32 - 0x100d;
    text[0x09..0x0d].copy_from_slice(&disp.to_le_bytes());
    text[0x0d] = 0xc3; // ret
    text[0x0e] = 0xcc; // alignment padding inside alpha's contribution
    text[0x0f] = 0xcc;
    text[0x10] = 0x33; // beta: xor eax, eax
    text[0x11] = 0xc0;
    text[0x12] = 0xc3; // ret
    for byte in &mut text[0x13..0x18] {
        *byte = 0xcc;
    }
    text
}

fn rdata_bytes() -> Vec<u8> {
    let mut rdata = vec![0u8; 8];
    rdata[..4].copy_from_slice(&(IMAGE_BASE + 0x1010).to_le_bytes());
    rdata
}

fn module_input<'a>(text: &'a [u8], rdata: &'a [u8]) -> ModuleInput<'a> {
    ModuleInput {
        image_base: AbsoluteAddress::new(IMAGE_BASE),
        sections: vec![
            SectionInfo {
                name: ".text".to_string(),
                characteristics: IMAGE_SCN_CNT_CODE,
                virtual_address: rva(0x1000),
                virtual_size: 0x18,
                file_offset: FileOffsetAddress::new(0x400),
                data: text,
            },
            SectionInfo {
                name: ".rdata".to_string(),
                characteristics: IMAGE_SCN_CNT_INITIALIZED_DATA,
                virtual_address: rva(0x2000),
                virtual_size: 8,
                file_offset: FileOffsetAddress::new(0x600),
                data: rdata,
            },
        ],
        contributions: vec![
            SectionContribution {
                rva: rva(0x1000),
                size: 0x10,
                compiland: "alpha.obj".to_string(),
                is_code: true,
                supported_compiler: true,
            },
            SectionContribution {
                rva: rva(0x1010),
                size: 3,
                compiland: "beta.obj".to_string(),
                is_code: true,
                supported_compiler: true,
            },
            SectionContribution {
                rva: rva(0x2000),
                size: 8,
                compiland: "alpha.obj".to_string(),
                is_code: false,
                supported_compiler: true,
            },
        ],
        symbols: vec![
            SymbolRecord {
                rva: rva(0x1000),
                size: 0x10,
                name: "alpha".to_string(),
                kind: SymbolKind::Function,
                attributes: SymbolAttributes::empty(),
            },
            SymbolRecord {
                rva: rva(0x1010),
                size: 3,
                name: "beta".to_string(),
                kind: SymbolKind::Function,
                attributes: SymbolAttributes::empty(),
            },
        ],
        fixups: vec![
            DebugFixupEntry {
                location: rva(0x1009),
                base: rva(0x1010),
                kind: ReferenceType::PcRelative,
                flags: FixupFlags::REFERS_TO_CODE,
            },
            DebugFixupEntry {
                location: rva(0x2000),
                base: rva(0x1010),
                kind: ReferenceType::Absolute,
                flags: FixupFlags::REFERS_TO_CODE | FixupFlags::IS_DATA,
            },
        ],
        relocations: [rva(0x2000)].into_iter().collect(),
        legacy_translation: None,
    }
}

/// Splices a `push eax; pop eax` prologue into every safe function.
struct InstrumentEntryPoints;

impl BasicBlockSubgraphTransform for InstrumentEntryPoints {
    fn name(&self) -> &'static str {
        "instrument-entry-points"
    }

    fn transform(&mut self, subgraph: &mut BasicBlockSubgraph) -> peweave::Result<()> {
        let head = subgraph
            .basic_block_at(0)
            .expect("decomposed blocks start at offset zero")
            .id();
        let code = subgraph
            .basic_block_mut(head)
            .and_then(|bb| bb.as_code_mut())
            .expect("function heads are code");
        let mut asm = BasicBlockAssembler::new(code, 0);
        asm.push_reg(Register::EAX)?;
        asm.pop_reg(Register::EAX)?;
        Ok(())
    }
}

struct InstrumentTransform;

impl BlockGraphTransform for InstrumentTransform {
    fn name(&self) -> &'static str {
        "instrument"
    }

    fn transform(
        &mut self,
        graph: &mut BlockGraph<'_>,
        policy: &dyn RedecompositionPolicy,
    ) -> peweave::Result<()> {
        let candidates: Vec<BlockId> = graph
            .blocks()
            .filter(|b| policy.block_is_safe_to_decompose(graph, b.id()))
            .map(Block::id)
            .collect();
        for block in candidates {
            apply_basic_block_transform(&mut InstrumentEntryPoints, policy, graph, block)?;
        }
        Ok(())
    }
}

#[test]
fn relink_produces_consistent_outputs() {
    let text = text_bytes();
    let rdata = rdata_bytes();
    let input = module_input(&text, &rdata);

    let mut pipeline = RelinkPipeline::new(guid!("0b5c1e9a-4d6f-4a3b-8c2d-1e0f9a8b7c6d"));
    pipeline.add_transform(Box::new(InstrumentTransform));
    let output = pipeline.run(&input).unwrap();

    assert_eq!(output.layout.sections.len(), 2);
    assert_eq!(
        output.build_guid,
        guid!("0b5c1e9a-4d6f-4a3b-8c2d-1e0f9a8b7c6d")
    );

    // Both functions were rebuilt with the two-byte prologue.
    let instrumented: Vec<&Block<'_>> = output
        .graph
        .blocks()
        .filter(|b| b.has_attributes(BlockAttributes::BUILT_BY_PEWEAVE))
        .collect();
    assert_eq!(instrumented.len(), 2);
    for block in &instrumented {
        assert_eq!(&block.data()[..2], &[0x50, 0x58]);
    }

    let alpha = instrumented
        .iter()
        .find(|b| b.name() == "alpha")
        .expect("alpha was rebuilt");
    let alpha_rva = output.layout.rva_of(alpha.id()).unwrap();

    // The prologue bytes are synthetic; the first original byte follows them.
    assert_eq!(output.tables.new_to_old.translate(alpha_rva), None);
    assert_eq!(
        output.tables.new_to_old.translate(alpha_rva + 2),
        Some(rva(0x1000))
    );
    // And the original entry point maps onto the relocated, shifted one.
    assert_eq!(
        output.tables.old_to_new.translate(rva(0x1000)),
        Some(alpha_rva + 2)
    );
    assert_eq!(output.duplicated_source_ranges, 0);

    // Exactly one absolute reference survives: the .rdata pointer to beta.
    assert_eq!(output.relocations.len(), 1);
    let pointer_block = output
        .graph
        .blocks()
        .find(|b| b.name() == "alpha.obj" && b.references().len() == 1)
        .expect("the pointer block survived untouched");
    assert_eq!(
        output.relocations[0],
        output.layout.rva_of(pointer_block.id()).unwrap()
    );
    let pointer = pointer_block.reference_at(0).unwrap();
    let beta = instrumented
        .iter()
        .find(|b| b.name() == "beta")
        .expect("beta was rebuilt");
    assert_eq!(pointer.target(), beta.id());
}

#[test]
fn pipeline_works_over_memory_mapped_section_bytes() {
    // Hosts map the input module and hand out borrowed slices; blocks borrow from the
    // mapping until a transform needs to mutate them.
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let text = text_bytes();
    let rdata = rdata_bytes();
    file.write_all(&text).unwrap();
    file.write_all(&rdata).unwrap();
    file.flush().unwrap();

    let mapping = unsafe { memmap2::Mmap::map(file.as_file()).unwrap() };
    let input = module_input(&mapping[..text.len()], &mapping[text.len()..]);

    let space = decompose_module(&input).unwrap();
    let (alpha, _) = space.resolve(rva(0x1000)).unwrap();
    let block = space.graph().block(alpha).unwrap();
    // Contribution blocks borrow the mapped bytes rather than copying them.
    assert!(!block.owns_data());
    assert_eq!(block.data(), &text[..0x10]);

    let mut pipeline = RelinkPipeline::new(guid!("00000000-0000-0000-0000-000000000001"));
    pipeline.add_transform(Box::new(InstrumentTransform));
    let output = pipeline.run(&input).unwrap();
    assert_eq!(output.layout.sections.len(), 2);
}
