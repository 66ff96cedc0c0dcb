//! Decomposes one code block into a basic-block subgraph.
//!
//! The decomposer walks the block's bytes with the external x86 decoder, discovers basic
//! block boundaries from the block's labels and references, converts trailing tables into
//! basic data blocks, and records everything in a [`BasicBlockSubgraph`] that, rebuilt
//! unchanged, reproduces the original block byte for byte.

use std::collections::{BTreeMap, BTreeSet};

use iced_x86::{Decoder, DecoderOptions, FlowControl};
use log::debug;

use crate::address::AddressRange;
use crate::basicblock::{
    BasicBlockContent, BasicBlockId, BasicBlockReference, BasicBlockSubgraph, BasicBlockTarget,
    BasicCodeBlock, BasicDataBlock, BlockDescription, Instruction, Successor, SuccessorCondition,
};
use crate::graph::{Block, BlockAttributes, BlockGraph, BlockId, BlockType, Reference};
use crate::utils::VisitedMap;
use crate::{Error, Result};

/// Where one basic block sits inside the original block.
#[derive(Debug, Clone, Copy)]
struct Region {
    start: u32,
    end: u32,
    id: BasicBlockId,
}

/// Decomposes a single code block into basic blocks.
pub struct BasicBlockDecomposer<'g, 'a> {
    graph: &'g BlockGraph<'a>,
    block_id: BlockId,
}

impl<'g, 'a> BasicBlockDecomposer<'g, 'a> {
    /// Creates a decomposer for `block_id` inside `graph`.
    #[must_use]
    pub fn new(graph: &'g BlockGraph<'a>, block_id: BlockId) -> Self {
        Self { graph, block_id }
    }

    /// Runs a strict decomposition.
    ///
    /// Any disassembly anomaly - an undecodable byte, a walk that runs off the block, a
    /// starting point inside an instruction, an uninvertible branch - is an error; callers
    /// are expected to have asked the transform policy first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disassembly`] on anomalies and invariant violations on malformed
    /// block state.
    pub fn decompose(&self) -> Result<BasicBlockSubgraph> {
        let (subgraph, anomalies) = self.run(true)?;
        debug_assert!(anomalies.is_empty());
        Ok(subgraph)
    }

    /// Runs a lenient decomposition purely to classify the block.
    ///
    /// Returns the anomaly attributes an eventual strict decomposition would trip over:
    /// `ERRORED_DISASSEMBLY`, `DISASSEMBLED_PAST_END`, `INCOMPLETE_DISASSEMBLY`, or empty
    /// for a block that decomposes cleanly. The caller applies them to the host block.
    #[must_use]
    pub fn audit(&self) -> BlockAttributes {
        match self.run(false) {
            Ok((_, anomalies)) => anomalies,
            Err(_) => BlockAttributes::ERRORED_DISASSEMBLY,
        }
    }

    fn block(&self) -> Result<&'g Block<'a>> {
        let block = self
            .graph
            .block(self.block_id)
            .ok_or_else(|| invariant_error!("no such block: {}", self.block_id))?;
        if block.block_type() != BlockType::Code {
            return Err(invariant_error!("{} is not a code block", self.block_id));
        }
        Ok(block)
    }

    fn run(&self, strict: bool) -> Result<(BasicBlockSubgraph, BlockAttributes)> {
        let block = self.block()?;
        let mut anomalies = BlockAttributes::empty();

        // The code region ends where the first data label begins.
        let code_end = block
            .labels()
            .iter()
            .find(|(_, label)| label.has_attributes(crate::graph::LabelAttributes::DATA))
            .map_or(block.size(), |(offset, _)| *offset);
        if block.data().len() < code_end as usize {
            return Err(invariant_error!(
                "{} has only {:#x} initialized bytes below its code end {:#x}",
                self.block_id,
                block.data().len(),
                code_end
            ));
        }

        let starting_points = self.collect_starting_points(block, code_end)?;
        let has_eh = block.has_attributes(BlockAttributes::HAS_EXCEPTION_HANDLING);

        // Linear walk over the code region.
        let data = &block.data()[..code_end as usize];
        let mut decoder = Decoder::with_ip(32, data, 0, DecoderOptions::NONE);
        let mut instructions: BTreeMap<u32, Instruction> = BTreeMap::new();
        let mut padding_runs: Vec<(u32, u32)> = Vec::new();
        let mut visited = VisitedMap::new(code_end as usize);
        let mut offset = 0u32;

        while offset < code_end {
            if data[offset as usize] == 0xcc && !has_eh {
                // An int3 run outside an exception-using function is padding. The run is
                // clamped at the next starting point so a table target never lands inside.
                let mut end = offset;
                while end < code_end
                    && data[end as usize] == 0xcc
                    && !(end > offset && starting_points.contains(&end))
                {
                    end += 1;
                }
                padding_runs.push((offset, end));
                visited.set_range(offset as usize, true, (end - offset) as usize);
                offset = end;
                decoder
                    .set_position(offset as usize)
                    .map_err(Error::Codec)?;
                decoder.set_ip(u64::from(offset));
                continue;
            }

            let repr = decoder.decode();
            if repr.is_invalid() {
                if strict {
                    return Err(Error::Disassembly(format!(
                        "undecodable byte at {}+{:#x}",
                        self.block_id, offset
                    )));
                }
                anomalies |= BlockAttributes::ERRORED_DISASSEMBLY;
                break;
            }

            #[allow(clippy::cast_possible_truncation)]
            let len = repr.len() as u32;
            if offset + len > code_end {
                if strict {
                    return Err(Error::Disassembly(format!(
                        "instruction at {}+{:#x} runs past the code region",
                        self.block_id, offset
                    )));
                }
                anomalies |= BlockAttributes::DISASSEMBLED_PAST_END;
                break;
            }

            let source_range = block
                .source_ranges()
                .map_offset(offset)
                .map(|rva| AddressRange::new(rva, len));
            let bytes = data[offset as usize..(offset + len) as usize].to_vec();
            instructions.insert(offset, Instruction::new(repr, bytes, source_range));
            visited.set_range(offset as usize, true, len as usize);
            offset += len;
        }

        // Branches inside the block carry no fixup, so their targets only surface during
        // the walk itself; fold them into the starting points now.
        let mut starting_points = starting_points;
        for instruction in instructions.values() {
            if !matches!(
                instruction.flow_control(),
                FlowControl::ConditionalBranch | FlowControl::UnconditionalBranch
            ) {
                continue;
            }
            if !matches!(
                instruction.repr().op0_kind(),
                iced_x86::OpKind::NearBranch16
                    | iced_x86::OpKind::NearBranch32
                    | iced_x86::OpKind::NearBranch64
            ) {
                continue;
            }
            #[allow(clippy::cast_possible_truncation)]
            let target = instruction.repr().near_branch_target() as u32;
            if target < code_end {
                starting_points.insert(target);
            }
        }

        // Every starting point must sit on an instruction boundary (or padding). A point
        // inside a decoded instruction means the disassembly contradicts the reference
        // graph; a point the walk never reached means a computed target stayed unresolved.
        for &point in &starting_points {
            if point < code_end
                && !instructions.contains_key(&point)
                && !padding_runs.iter().any(|&(s, _)| s == point)
            {
                if strict {
                    return Err(Error::Disassembly(format!(
                        "branch target {}+{:#x} is not an instruction boundary",
                        self.block_id, point
                    )));
                }
                anomalies |= if visited.get(point as usize) {
                    BlockAttributes::ERRORED_DISASSEMBLY
                } else {
                    BlockAttributes::INCOMPLETE_DISASSEMBLY
                };
            }
        }

        // A final instruction that flows off the end of the block is suspect.
        if let Some((last_offset, last)) = instructions.iter().next_back() {
            let ends_at_code_end = last_offset + last.len() == code_end;
            let flows_off = matches!(
                last.flow_control(),
                FlowControl::Next | FlowControl::Call | FlowControl::IndirectCall
            ) && !self.calls_non_returning(block, *last_offset, last);
            if ends_at_code_end && flows_off && code_end == block.size() {
                if strict {
                    return Err(Error::Disassembly(format!(
                        "{} ends without a flow terminator",
                        self.block_id
                    )));
                }
                anomalies |= BlockAttributes::DISASSEMBLED_PAST_END;
            }
        }

        if strict && !anomalies.is_empty() {
            return Err(Error::Disassembly(format!(
                "{} is not cleanly decomposable: {:?}",
                self.block_id, anomalies
            )));
        }

        let subgraph = self.build_subgraph(
            block,
            code_end,
            &starting_points,
            &instructions,
            &padding_runs,
            anomalies,
        )?;
        Ok((subgraph, anomalies))
    }

    /// Collects every offset a basic block must start at.
    fn collect_starting_points(&self, block: &Block<'a>, code_end: u32) -> Result<BTreeSet<u32>> {
        let mut points = BTreeSet::new();
        points.insert(0);

        for (&offset, label) in block.labels() {
            if label.has_attributes(crate::graph::LabelAttributes::CODE) && offset < code_end {
                points.insert(offset);
            }
        }

        // Branch targets inside the block: our own pc-relative branches, jump-table
        // entries (absolute self-references sourced from the trailing data region), and
        // inbound pc-relative references.
        for (&offset, reference) in block.references() {
            if reference.target() != self.block_id {
                continue;
            }
            let base = u32::try_from(reference.base())
                .map_err(|_| invariant_error!("negative self-reference base in {}", self.block_id))?;
            let is_code_target = base < code_end;
            match reference.ref_type() {
                crate::graph::ReferenceType::PcRelative if is_code_target => {
                    points.insert(base);
                }
                crate::graph::ReferenceType::Absolute
                    if is_code_target && offset >= code_end =>
                {
                    points.insert(base);
                }
                _ => {}
            }
        }

        for &(referrer, offset) in block.referrers() {
            if referrer == self.block_id {
                continue;
            }
            let Some(reference) = self.graph.reference_of(referrer, offset) else {
                continue;
            };
            if reference.ref_type() == crate::graph::ReferenceType::PcRelative {
                if let Ok(base) = u32::try_from(reference.base()) {
                    if base < code_end {
                        points.insert(base);
                    }
                }
            }
        }

        Ok(points)
    }

    /// Whether the call instruction at `offset` targets a known non-returning function.
    ///
    /// The classification is heuristic and advisory: it covers only targets already marked
    /// `NON_RETURN_FUNCTION`, so transforms must not rely on it being complete.
    fn calls_non_returning(&self, block: &Block<'a>, offset: u32, instruction: &Instruction) -> bool {
        if !instruction.is_call() {
            return false;
        }
        block
            .references()
            .range(offset..offset + instruction.len())
            .map(|(_, r)| r.target())
            .any(|target| {
                self.graph
                    .block(target)
                    .is_some_and(|b| b.has_attributes(BlockAttributes::NON_RETURN_FUNCTION))
            })
    }

    #[allow(clippy::too_many_lines)]
    fn build_subgraph(
        &self,
        block: &Block<'a>,
        code_end: u32,
        starting_points: &BTreeSet<u32>,
        instructions: &BTreeMap<u32, Instruction>,
        padding_runs: &[(u32, u32)],
        anomalies: BlockAttributes,
    ) -> Result<BasicBlockSubgraph> {
        let mut subgraph = BasicBlockSubgraph::new();
        subgraph.set_original_block(self.block_id);

        // Boundaries: starting points, the byte after every flow-altering instruction,
        // padding run edges, the code/data seam, and every data label.
        let mut boundaries: BTreeSet<u32> = starting_points.clone();
        for (&offset, instruction) in instructions {
            let terminates = match instruction.flow_control() {
                FlowControl::Next => false,
                FlowControl::Call | FlowControl::IndirectCall => {
                    self.calls_non_returning(block, offset, instruction)
                }
                _ => true,
            };
            if terminates {
                boundaries.insert(offset + instruction.len());
            }
        }
        for &(start, end) in padding_runs {
            boundaries.insert(start);
            boundaries.insert(end);
        }
        boundaries.insert(code_end);
        for (&offset, label) in block.labels() {
            if label.has_attributes(crate::graph::LabelAttributes::DATA) {
                boundaries.insert(offset);
            }
        }
        boundaries.insert(block.size());
        boundaries.retain(|&b| b <= block.size());

        // Carve regions and create the basic blocks in offset order.
        let mut regions: Vec<Region> = Vec::new();
        let edges: Vec<u32> = boundaries.iter().copied().collect();
        for window in edges.windows(2) {
            let (start, end) = (window[0], window[1]);
            let id = if start >= code_end {
                let data_start = start as usize;
                let data_end = (end as usize).min(block.data().len());
                let bytes = block
                    .data()
                    .get(data_start..data_end)
                    .map_or_else(Vec::new, <[u8]>::to_vec);
                let mut padded = bytes;
                padded.resize((end - start) as usize, 0);
                let source_range = block
                    .source_ranges()
                    .map_offset(start)
                    .map(|rva| AddressRange::new(rva, end - start));
                subgraph.add_basic_block(
                    format!("{}+{:#x}(data)", block.name(), start),
                    Some(start),
                    BasicBlockContent::Data(BasicDataBlock {
                        data: padded,
                        references: BTreeMap::new(),
                        source_range,
                    }),
                )
            } else if padding_runs.iter().any(|&(s, _)| s == start) {
                let bytes = block.data()[start as usize..end as usize].to_vec();
                let source_range = block
                    .source_ranges()
                    .map_offset(start)
                    .map(|rva| AddressRange::new(rva, end - start));
                subgraph.add_basic_block(
                    format!("{}+{:#x}(padding)", block.name(), start),
                    Some(start),
                    BasicBlockContent::Data(BasicDataBlock {
                        data: bytes,
                        references: BTreeMap::new(),
                        source_range,
                    }),
                )
            } else {
                subgraph.add_basic_block(
                    format!("{}+{:#x}", block.name(), start),
                    Some(start),
                    BasicBlockContent::Code(BasicCodeBlock::default()),
                )
            };
            regions.push(Region { start, end, id });
        }

        // The end block hosts labels one byte past the block.
        let end_block = if block.labels().contains_key(&block.size()) {
            Some(subgraph.add_basic_block(
                format!("{}(end)", block.name()),
                Some(block.size()),
                BasicBlockContent::End,
            ))
        } else {
            None
        };

        // Lift labels onto their basic blocks.
        for (&offset, label) in block.labels() {
            let target = if offset == block.size() {
                end_block.map(|id| (id, block.size()))
            } else {
                regions
                    .iter()
                    .find(|r| offset >= r.start && offset < r.end)
                    .map(|r| (r.id, r.start))
            };
            let Some((id, region_start)) = target else {
                continue;
            };
            subgraph
                .basic_block_mut(id)
                .expect("region blocks exist")
                .set_label(offset - region_start, label.clone())?;
        }

        // Distribute the block's references: onto instructions in code regions, onto the
        // buffer in data regions.
        let convert = |reference: &Reference| -> Result<BasicBlockReference> {
            if reference.target() != self.block_id {
                return Ok(BasicBlockReference {
                    ref_type: reference.ref_type(),
                    size: reference.size(),
                    target: BasicBlockTarget::Block(reference.target()),
                    offset: reference.offset(),
                    base: reference.base(),
                });
            }
            let base = u32::try_from(reference.base())
                .map_err(|_| invariant_error!("negative self-reference base"))?;
            let region = regions
                .iter()
                .find(|r| base >= r.start && base < r.end)
                .ok_or_else(|| {
                    invariant_error!("self-reference base {:#x} maps to no basic block", base)
                })?;
            #[allow(clippy::cast_possible_wrap)]
            Ok(BasicBlockReference {
                ref_type: reference.ref_type(),
                size: reference.size(),
                target: BasicBlockTarget::BasicBlock(region.id),
                offset: reference.offset() - region.start as i32,
                base: (base - region.start) as i32,
            })
        };

        for (&ref_offset, reference) in block.references() {
            let converted = convert(reference)?;
            let region = regions
                .iter()
                .find(|r| ref_offset >= r.start && ref_offset < r.end)
                .ok_or_else(|| {
                    invariant_error!("reference at {:#x} maps to no basic block", ref_offset)
                })?;
            let bb = subgraph
                .basic_block_mut(region.id)
                .expect("region blocks exist");
            match &mut bb.content {
                BasicBlockContent::Data(data) => {
                    data.references.insert(ref_offset - region.start, converted);
                }
                BasicBlockContent::Code(_) => {
                    // Slot assignment happens when instructions are moved in below.
                }
                BasicBlockContent::End => {
                    return Err(invariant_error!("reference inside an end block"));
                }
            }
        }

        // Move instructions into their regions and wire successors.
        let code_regions: Vec<Region> = regions.iter().copied().filter(|r| r.start < code_end).collect();
        for region in &code_regions {
            if padding_runs.iter().any(|&(s, _)| s == region.start) {
                continue;
            }

            let mut members: Vec<(u32, Instruction)> = instructions
                .range(region.start..region.end)
                .map(|(o, i)| (*o, i.clone()))
                .collect();

            // Attach the block-level references that land inside each instruction.
            for (instr_offset, instruction) in &mut members {
                for (&ref_offset, reference) in block
                    .references()
                    .range(*instr_offset..*instr_offset + instruction.len())
                {
                    let slot = u8::try_from(ref_offset - *instr_offset)
                        .map_err(|_| invariant_error!("reference slot offset overflows"))?;
                    instruction.set_reference(slot, convert(reference)?)?;
                }
            }

            let mut successors: Vec<Successor> = Vec::new();
            let next_region = regions
                .iter()
                .find(|r| r.start == region.end && r.start < code_end);

            let branch_target = |instruction: &Instruction| -> Result<(BasicBlockTarget, i32)> {
                if let Some(reference) = instruction.references().values().next() {
                    return Ok((reference.target, reference.base));
                }
                // Intra-block branches carry no fixup; recover the target from the
                // decoded displacement.
                #[allow(clippy::cast_possible_truncation)]
                let target = instruction.repr().near_branch_target() as u32;
                let region = code_regions
                    .iter()
                    .find(|r| r.start == target)
                    .ok_or_else(|| {
                        Error::Disassembly(format!(
                            "branch target {:#x} is not a basic block head",
                            target
                        ))
                    })?;
                Ok((BasicBlockTarget::BasicBlock(region.id), 0))
            };

            let last = members.last().map(|(o, i)| (*o, i.flow_control(), i.len()));
            match last {
                Some((_, FlowControl::ConditionalBranch, len)) => {
                    let (_, branch) = members.pop().expect("member just inspected");
                    let condition = SuccessorCondition::from_condition_code(
                        branch.repr().condition_code(),
                    )
                    .ok_or_else(|| {
                        Error::Disassembly(format!(
                            "uninvertible conditional branch {} in {}",
                            branch, self.block_id
                        ))
                    })?;
                    let inverse = condition.inverse().expect("conditional has an inverse");
                    let (target, base) = branch_target(&branch)?;
                    let mut taken = Successor::new(condition, target);
                    taken.base = base;
                    taken.prefer_short = len == 2;
                    taken.source_range = branch.source_range();
                    let next = next_region.ok_or_else(|| {
                        Error::Disassembly(format!(
                            "conditional branch at the end of {} has no fall-through",
                            self.block_id
                        ))
                    })?;
                    let not_taken =
                        Successor::new(inverse, BasicBlockTarget::BasicBlock(next.id));
                    successors.push(taken);
                    successors.push(not_taken);
                }
                Some((_, FlowControl::UnconditionalBranch, len)) => {
                    let (_, branch) = members.pop().expect("member just inspected");
                    let (target, base) = branch_target(&branch)?;
                    let mut successor = Successor::new(SuccessorCondition::Always, target);
                    successor.base = base;
                    successor.prefer_short = len == 2;
                    successor.source_range = branch.source_range();
                    successors.push(successor);
                }
                Some((offset, FlowControl::Call | FlowControl::IndirectCall, len)) => {
                    let terminal = members
                        .last()
                        .is_some_and(|(o, i)| self.calls_non_returning(block, *o, i));
                    if !terminal {
                        // A call followed by padding or the block end is suspicious but
                        // only advisory; fall through like any straight-line tail.
                        if offset + len == code_end {
                            debug!(
                                "call at {}+{:#x} is the last instruction; suspected non-return",
                                self.block_id, offset
                            );
                        }
                        if let Some(next) = next_region {
                            successors.push(Successor::new(
                                SuccessorCondition::Always,
                                BasicBlockTarget::BasicBlock(next.id),
                            ));
                        }
                    }
                }
                Some((_, FlowControl::Next, _)) => {
                    if let Some(next) = next_region {
                        successors.push(Successor::new(
                            SuccessorCondition::Always,
                            BasicBlockTarget::BasicBlock(next.id),
                        ));
                    }
                }
                // Return, interrupt, indirect branch, exception: terminators with no
                // modeled successors. Jump-table dispatch is data-driven through the
                // table's references.
                Some(_) | None => {}
            }

            let bb = subgraph
                .basic_block_mut(region.id)
                .expect("region blocks exist");
            let code = bb.as_code_mut().expect("region below code_end is code");
            code.instructions = members.into_iter().map(|(_, i)| i).collect();
            code.successors = successors;
        }

        let description = BlockDescription {
            name: block.name().to_string(),
            compiland: block.compiland_name().map(str::to_string),
            section: block.section(),
            alignment: block.alignment(),
            basic_block_alignment: 1,
            attributes: block.attributes() | anomalies,
            basic_block_order: regions
                .iter()
                .map(|r| r.id)
                .chain(end_block)
                .collect(),
        };
        subgraph.add_description(description);
        subgraph.validate()?;
        Ok(subgraph)
    }
}
