//! The block builder: consolidates a basic-block subgraph back into host-graph blocks.
//!
//! The builder is the inverse of the decomposer. For every block description it lays the
//! basic blocks out in order, iterates short/long branch encodings to a fixed point,
//! emits the bytes through the external encoder, lifts labels, converts every reference
//! onto the new block, retargets all inbound referrers of the original block, and finally
//! removes the original. All fallible validation happens before the first graph mutation,
//! so a failed build leaves the host graph unchanged.

use std::borrow::Cow;
use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::basicblock::{
    BasicBlock, BasicBlockContent, BasicBlockId, BasicBlockReference, BasicBlockSubgraph,
    BasicBlockTarget, BasicCodeBlock, BlockDescription, Successor, SuccessorCondition,
};
use crate::graph::{
    BlockAttributes, BlockGraph, BlockId, BlockType, Reference, ReferenceType, SourceRanges,
};
use crate::{Error, Result};

/// How one successor is realized in the emitted bytes.
#[derive(Debug, Clone, Copy)]
enum PlannedBranch {
    /// The target directly follows; no bytes are emitted.
    Elided,
    /// A branch to a basic block inside the same description.
    Internal {
        condition: SuccessorCondition,
        target: BasicBlockId,
        short: bool,
    },
    /// A branch leaving the description; always the long encoding.
    External {
        condition: SuccessorCondition,
        target: BasicBlockTarget,
        base: i32,
    },
}

impl PlannedBranch {
    fn len(&self) -> u32 {
        match self {
            PlannedBranch::Elided => 0,
            PlannedBranch::Internal {
                condition, short, ..
            } => condition.branch_len(*short),
            PlannedBranch::External { condition, .. } => condition.branch_len(false),
        }
    }
}

/// The computed layout of one description.
#[derive(Debug)]
struct DescriptionPlan {
    size: u32,
    offsets: BTreeMap<BasicBlockId, u32>,
    branches: FxHashMap<BasicBlockId, Vec<PlannedBranch>>,
}

/// One basic block's span inside the original block, for referrer retargeting.
#[derive(Debug, Clone, Copy)]
struct OldSpan {
    start: u32,
    end: u32,
    bb: BasicBlockId,
}

/// Merges basic-block subgraphs back into a block graph.
pub struct BlockBuilder<'g, 'a> {
    graph: &'g mut BlockGraph<'a>,
}

impl<'g, 'a> BlockBuilder<'g, 'a> {
    /// Creates a builder over the host graph.
    pub fn new(graph: &'g mut BlockGraph<'a>) -> Self {
        Self { graph }
    }

    /// Builds every description of `subgraph` into the host graph.
    ///
    /// On success the subgraph is emptied (ownership of its content has transferred into
    /// the graph), the original block is removed, and the ids of the new blocks are
    /// returned in description order.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation or disassembly error if the subgraph is malformed
    /// or an inbound referrer cannot be retargeted; the host graph is unchanged.
    pub fn build(&mut self, subgraph: &mut BasicBlockSubgraph) -> Result<Vec<BlockId>> {
        subgraph.validate()?;

        let plans: Vec<DescriptionPlan> = subgraph
            .descriptions()
            .iter()
            .map(|d| Self::plan_description(subgraph, d))
            .collect::<Result<_>>()?;

        // Where each basic block ends up: (description index, offset).
        let mut placement: FxHashMap<BasicBlockId, (usize, u32)> = FxHashMap::default();
        for (index, plan) in plans.iter().enumerate() {
            for (&bb, &offset) in &plan.offsets {
                placement.insert(bb, (index, offset));
            }
        }

        // Map inbound referrers through the old-offset spans before touching the graph.
        let retargets = self.plan_referrer_retargeting(subgraph, &placement, &plans)?;

        // Create the new blocks first so cross-description references can resolve.
        let mut new_ids: Vec<BlockId> = Vec::with_capacity(plans.len());
        for (description, plan) in subgraph.descriptions().iter().zip(&plans) {
            let block_type = if description
                .basic_block_order
                .iter()
                .any(|id| subgraph.basic_block(*id).is_some_and(BasicBlock::is_code))
            {
                BlockType::Code
            } else {
                BlockType::Data
            };
            let id = self.graph.add_block(block_type, plan.size, &description.name);
            let block = self.graph.block_mut(id).expect("just added");
            block.set_section(description.section);
            block.set_attributes(description.attributes | BlockAttributes::BUILT_BY_PEWEAVE);
            block.set_alignment(description.alignment)?;
            if let Some(compiland) = &description.compiland {
                block.set_compiland_name(compiland.clone());
            }
            new_ids.push(id);
        }

        let result = self.fill_blocks(subgraph, &plans, &placement, &new_ids);
        if let Err(error) = result {
            for id in new_ids {
                let _ = self.graph.remove_block(id);
            }
            return Err(error);
        }

        for (referrer, offset, reference) in retargets {
            let (desc_index, new_base, new_offset) = reference;
            let rewritten = self
                .graph
                .reference_of(referrer, offset)
                .ok_or_else(|| invariant_error!("referrer vanished during build"))?;
            let target = new_ids[desc_index];
            self.graph.set_reference(
                referrer,
                offset,
                Reference::indirect(
                    rewritten.ref_type(),
                    rewritten.size(),
                    target,
                    new_offset,
                    new_base,
                ),
            )?;
        }

        if let Some(original) = subgraph.original_block() {
            self.graph.remove_block(original)?;
        }
        subgraph.clear();
        Ok(new_ids)
    }

    /// Lays one description out, iterating branch encodings to a fixed point.
    ///
    /// Each iteration may only lengthen branches, and lengths are bounded by the long
    /// encodings, so termination is guaranteed.
    fn plan_description(
        subgraph: &BasicBlockSubgraph,
        description: &BlockDescription,
    ) -> Result<DescriptionPlan> {
        let order = &description.basic_block_order;

        let mut branches: FxHashMap<BasicBlockId, Vec<PlannedBranch>> = FxHashMap::default();
        for (position, &id) in order.iter().enumerate() {
            let bb = subgraph
                .basic_block(id)
                .ok_or_else(|| invariant_error!("description lists unknown {}", id))?;
            let Some(code) = bb.as_code() else {
                continue;
            };
            let next = order.get(position + 1).copied();
            branches.insert(id, Self::plan_successors(code, next, order)?);
        }

        let content_len = |id: BasicBlockId| -> u32 {
            match subgraph.basic_block(id).map(BasicBlock::content) {
                Some(BasicBlockContent::Code(code)) => code.instructions_len(),
                #[allow(clippy::cast_possible_truncation)]
                Some(BasicBlockContent::Data(data)) => data.data.len() as u32,
                Some(BasicBlockContent::End) | None => 0,
            }
        };

        // Fixed point: assume preferred encodings, promote every short branch whose
        // displacement cannot fit, and recompute until stable.
        loop {
            let mut offsets: BTreeMap<BasicBlockId, u32> = BTreeMap::new();
            let mut cursor = 0u32;
            for &id in order {
                if description.basic_block_alignment > 1 {
                    cursor = crate::address::RelativeAddress::new(cursor)
                        .align_up(description.basic_block_alignment)
                        .value();
                }
                offsets.insert(id, cursor);
                cursor += content_len(id);
                if let Some(planned) = branches.get(&id) {
                    cursor += planned.iter().map(PlannedBranch::len).sum::<u32>();
                }
            }

            let mut changed = false;
            for &id in order {
                let Some(planned) = branches.get(&id) else {
                    continue;
                };
                let mut branch_offset = offsets[&id] + content_len(id);
                let mut promoted: Vec<PlannedBranch> = Vec::with_capacity(planned.len());
                for branch in planned {
                    let len = branch.len();
                    if let PlannedBranch::Internal {
                        condition,
                        target,
                        short: true,
                    } = branch
                    {
                        let target_offset = offsets[target];
                        let displacement =
                            i64::from(target_offset) - i64::from(branch_offset + len);
                        if !(-127..=127).contains(&displacement) {
                            promoted.push(PlannedBranch::Internal {
                                condition: *condition,
                                target: *target,
                                short: false,
                            });
                            changed = true;
                            branch_offset += len;
                            continue;
                        }
                    }
                    promoted.push(*branch);
                    branch_offset += len;
                }
                branches.insert(id, promoted);
            }

            if !changed {
                return Ok(DescriptionPlan {
                    size: cursor,
                    offsets,
                    branches,
                });
            }
        }
    }

    /// Realizes a basic block's successors as planned branches.
    fn plan_successors(
        code: &BasicCodeBlock,
        next: Option<BasicBlockId>,
        order: &[BasicBlockId],
    ) -> Result<Vec<PlannedBranch>> {
        let plan_one = |successor: &Successor, condition: SuccessorCondition| -> PlannedBranch {
            match successor.target {
                BasicBlockTarget::BasicBlock(id) if order.contains(&id) => {
                    if condition == SuccessorCondition::Always && next == Some(id) {
                        PlannedBranch::Elided
                    } else {
                        PlannedBranch::Internal {
                            condition,
                            target: id,
                            short: successor.prefer_short,
                        }
                    }
                }
                target => PlannedBranch::External {
                    condition,
                    target,
                    base: successor.base,
                },
            }
        };

        match code.successors.as_slice() {
            [] => Ok(Vec::new()),
            [only] => Ok(vec![plan_one(only, SuccessorCondition::Always)]),
            [taken, not_taken] => {
                // The conditional branch goes to the first target; the second target gets
                // a trailing unconditional jump unless it directly follows.
                let first = plan_one(taken, taken.condition);
                let second = plan_one(not_taken, SuccessorCondition::Always);
                Ok(vec![first, second])
            }
            more => Err(invariant_error!("{} successors on one basic block", more.len())),
        }
    }

    /// Original-offset spans of the subgraph's basic blocks, in offset order.
    fn old_spans(&self, subgraph: &BasicBlockSubgraph) -> Vec<OldSpan> {
        let original_size = subgraph
            .original_block()
            .and_then(|id| self.graph.block(id))
            .map_or(0, |b| b.size());

        let mut spans: Vec<OldSpan> = subgraph
            .basic_blocks()
            .filter_map(|bb| bb.offset().map(|start| (start, bb.id())))
            .map(|(start, bb)| OldSpan {
                start,
                end: original_size,
                bb,
            })
            .collect();
        spans.sort_by_key(|s| s.start);
        for index in 0..spans.len().saturating_sub(1) {
            spans[index].end = spans[index + 1].start;
        }
        spans
    }

    /// Maps every inbound referrer of the original block through the layout.
    ///
    /// Returns `(referrer, referrer offset, (description index, new base, new offset))`
    /// triples, fully validated.
    #[allow(clippy::type_complexity)]
    fn plan_referrer_retargeting(
        &self,
        subgraph: &BasicBlockSubgraph,
        placement: &FxHashMap<BasicBlockId, (usize, u32)>,
        plans: &[DescriptionPlan],
    ) -> Result<Vec<(BlockId, u32, (usize, i32, i32))>> {
        let Some(original) = subgraph.original_block() else {
            return Ok(Vec::new());
        };
        let original_block = self
            .graph
            .block(original)
            .ok_or_else(|| invariant_error!("original block {} is gone", original))?;

        let spans = self.old_spans(subgraph);
        let map_offset = |old: i32| -> Result<(usize, i32)> {
            let old_u = u32::try_from(old)
                .map_err(|_| invariant_error!("negative referrer offset {:#x}", old))?;
            let span = spans
                .iter()
                .find(|s| old_u >= s.start && old_u < s.end.max(s.start + 1))
                .ok_or_else(|| {
                    invariant_error!("offset {:#x} maps to no basic block", old)
                })?;
            let (desc, new_start) = placement.get(&span.bb).ok_or_else(|| {
                Error::Disassembly(format!(
                    "{} is not listed in any block description",
                    span.bb
                ))
            })?;
            #[allow(clippy::cast_possible_wrap)]
            Ok((*desc, *new_start as i32 + (old - span.start as i32)))
        };

        let mut retargets = Vec::new();
        for &(referrer, offset) in original_block.referrers() {
            if referrer == original {
                continue;
            }
            let reference = self
                .graph
                .reference_of(referrer, offset)
                .ok_or_else(|| invariant_error!("dangling referrer ({}, {})", referrer, offset))?;
            let (desc, new_base) = map_offset(reference.base())?;
            if new_base < 0 || new_base as u32 >= plans[desc].size {
                return Err(invariant_error!(
                    "retargeted base {:#x} falls outside the rebuilt block",
                    new_base
                ));
            }
            let (_, new_offset) = map_offset(reference.offset()).unwrap_or((desc, new_base));
            retargets.push((referrer, offset, (desc, new_base, new_offset)));
        }
        Ok(retargets)
    }

    /// Emits bytes, labels, source ranges and references into the freshly created blocks.
    fn fill_blocks(
        &mut self,
        subgraph: &BasicBlockSubgraph,
        plans: &[DescriptionPlan],
        placement: &FxHashMap<BasicBlockId, (usize, u32)>,
        new_ids: &[BlockId],
    ) -> Result<()> {
        let convert = |reference: &BasicBlockReference| -> Result<Reference> {
            match reference.target {
                BasicBlockTarget::Block(block) => Ok(Reference::indirect(
                    reference.ref_type,
                    reference.size,
                    block,
                    reference.offset,
                    reference.base,
                )),
                BasicBlockTarget::BasicBlock(bb) => {
                    let (desc, new_start) = placement.get(&bb).ok_or_else(|| {
                        Error::Disassembly(format!(
                            "{} is not listed in any block description",
                            bb
                        ))
                    })?;
                    #[allow(clippy::cast_possible_wrap)]
                    Ok(Reference::indirect(
                        reference.ref_type,
                        reference.size,
                        new_ids[*desc],
                        reference.offset + *new_start as i32,
                        reference.base + *new_start as i32,
                    ))
                }
            }
        };

        for ((description, plan), &new_id) in
            subgraph.descriptions().iter().zip(plans).zip(new_ids)
        {
            let mut bytes: Vec<u8> = Vec::with_capacity(plan.size as usize);
            let mut ranges = SourceRanges::new();
            let mut pending_labels: Vec<(u32, crate::graph::Label)> = Vec::new();
            let mut pending_refs: Vec<(u32, Reference)> = Vec::new();

            for &bb_id in &description.basic_block_order {
                let bb = subgraph.basic_block(bb_id).expect("validated above");
                let target_offset = plan.offsets[&bb_id];

                // Alignment padding between basic blocks; the filler bytes are synthetic.
                #[allow(clippy::cast_possible_truncation)]
                let before_padding = bytes.len() as u32;
                while (bytes.len() as u32) < target_offset {
                    bytes.push(0xcc);
                }
                if target_offset > before_padding {
                    ranges.push(before_padding, target_offset - before_padding, None);
                }
                #[allow(clippy::cast_possible_truncation)]
                let mut cursor = bytes.len() as u32;
                if cursor > target_offset {
                    return Err(invariant_error!(
                        "layout drift at {}: cursor {:#x} past planned {:#x}",
                        bb_id,
                        cursor,
                        target_offset
                    ));
                }

                for (&offset, label) in bb.labels() {
                    pending_labels.push((cursor + offset, label.clone()));
                }

                match bb.content() {
                    BasicBlockContent::Code(code) => {
                        for instruction in &code.instructions {
                            for (&slot, reference) in instruction.references() {
                                pending_refs.push((
                                    cursor + u32::from(slot),
                                    convert(reference)?,
                                ));
                            }
                            ranges.push(
                                cursor,
                                instruction.len(),
                                instruction.source_range().map(|r| r.start()),
                            );
                            bytes.extend_from_slice(instruction.data());
                            cursor += instruction.len();
                        }

                        let planned = plan
                            .branches
                            .get(&bb_id)
                            .map_or(&[][..], Vec::as_slice);
                        for (branch, successor) in planned.iter().zip(&code.successors) {
                            let emitted = self.emit_branch(
                                branch,
                                successor,
                                cursor,
                                plan,
                                new_id,
                                new_ids,
                                placement,
                            )?;
                            let Some((branch_bytes, reference_slot, reference)) = emitted
                            else {
                                continue;
                            };
                            #[allow(clippy::cast_possible_truncation)]
                            let len = branch_bytes.len() as u32;
                            let provenance = successor
                                .source_range
                                .filter(|r| r.size() == len)
                                .map(|r| r.start());
                            ranges.push(cursor, len, provenance);
                            pending_refs.push((cursor + reference_slot, reference));
                            bytes.extend_from_slice(&branch_bytes);
                            cursor += len;
                        }
                    }
                    BasicBlockContent::Data(data) => {
                        for (&offset, reference) in &data.references {
                            pending_refs.push((cursor + offset, convert(reference)?));
                        }
                        #[allow(clippy::cast_possible_truncation)]
                        ranges.push(
                            cursor,
                            data.data.len() as u32,
                            data.source_range
                                .filter(|r| r.size() as usize == data.data.len())
                                .map(|r| r.start()),
                        );
                        bytes.extend_from_slice(&data.data);
                        #[allow(clippy::cast_possible_truncation)]
                        {
                            cursor += data.data.len() as u32;
                        }
                    }
                    BasicBlockContent::End => {}
                }
            }

            // Trailing alignment padding, if the plan rounded the size up.
            while (bytes.len() as u32) < plan.size {
                bytes.push(0xcc);
            }
            #[allow(clippy::cast_possible_truncation)]
            if ranges.pairs().last().map_or(0, |p| p.dst_end()) < plan.size {
                let covered = ranges.pairs().last().map_or(0, |p| p.dst_end());
                ranges.push(covered, plan.size - covered, None);
            }

            let block = self.graph.block_mut(new_id).expect("created by build");
            block.set_data(Cow::Owned(bytes))?;
            *block.source_ranges_mut() = ranges;
            for (offset, label) in pending_labels {
                block.set_label(offset, label)?;
            }
            for (offset, reference) in pending_refs {
                self.graph.set_reference(new_id, offset, reference)?;
            }
        }
        Ok(())
    }

    /// Encodes one planned branch. Returns the bytes, the displacement slot offset, and
    /// the reference to register, or `None` for an elided branch.
    #[allow(clippy::too_many_arguments)]
    fn emit_branch(
        &self,
        branch: &PlannedBranch,
        successor: &Successor,
        cursor: u32,
        plan: &DescriptionPlan,
        new_id: BlockId,
        new_ids: &[BlockId],
        placement: &FxHashMap<BasicBlockId, (usize, u32)>,
    ) -> Result<Option<(Vec<u8>, u32, Reference)>> {
        let (condition, short, target_block, target_offset) = match branch {
            PlannedBranch::Elided => return Ok(None),
            PlannedBranch::Internal {
                condition,
                target,
                short,
            } => (*condition, *short, new_id, i64::from(plan.offsets[target])),
            PlannedBranch::External {
                condition,
                target,
                base,
            } => {
                let (block, offset) = match target {
                    BasicBlockTarget::Block(block) => (*block, i64::from(*base)),
                    BasicBlockTarget::BasicBlock(bb) => {
                        let (desc, new_start) = placement.get(bb).ok_or_else(|| {
                            Error::Disassembly(format!("{} is in no description", bb))
                        })?;
                        (new_ids[*desc], i64::from(*new_start) + i64::from(*base))
                    }
                };
                (*condition, false, block, offset)
            }
        };

        let len = condition.branch_len(short);
        let code = condition.branch_code(short);
        let is_internal = target_block == new_id;

        // Internal displacements are final; external slots hold a placeholder until the
        // image writer serializes the reference.
        let encode_target = if is_internal {
            u64::try_from(target_offset)
                .map_err(|_| invariant_error!("negative branch target"))?
        } else {
            u64::from(cursor + len)
        };
        let mut encoder = iced_x86::Encoder::new(32);
        let instruction = iced_x86::Instruction::with_branch(code, encode_target)?;
        encoder.encode(&instruction, u64::from(cursor))?;
        let branch_bytes = encoder.take_buffer();
        if branch_bytes.len() != len as usize {
            return Err(invariant_error!(
                "encoder produced {} bytes for a {}-byte branch",
                branch_bytes.len(),
                len
            ));
        }

        let slot = condition.displacement_offset(short);
        let size = if short { 1 } else { 4 };
        #[allow(clippy::cast_possible_truncation)]
        let reference = Reference::indirect(
            ReferenceType::PcRelative,
            size,
            target_block,
            target_offset as i32,
            if is_internal {
                target_offset as i32
            } else {
                successor.base
            },
        );
        Ok(Some((branch_bytes, slot, reference)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basicblock::{BasicBlockAssembler, BasicBlockDecomposer, BasicDataBlock, Register};
    use crate::graph::{Label, LabelAttributes};

    fn rva(value: u32) -> crate::address::RelativeAddress {
        crate::address::RelativeAddress::new(value)
    }

    /// `je +2; xor eax, eax; ret`
    const JZ_XOR_RET: [u8; 5] = [0x74, 0x02, 0x33, 0xc0, 0xc3];

    fn seed_code_block<'a>(graph: &mut BlockGraph<'a>, bytes: &[u8]) -> BlockId {
        #[allow(clippy::cast_possible_truncation)]
        let id = graph.add_block(BlockType::Code, bytes.len() as u32, "func");
        let block = graph.block_mut(id).unwrap();
        block.set_data(Cow::Owned(bytes.to_vec())).unwrap();
        *block.source_ranges_mut() =
            SourceRanges::identity(rva(0x1000), bytes.len() as u32);
        block
            .set_label(0, Label::new("func", LabelAttributes::CODE).unwrap())
            .unwrap();
        id
    }

    #[test]
    fn rebuild_reproduces_the_original_bytes() {
        let mut graph = BlockGraph::new();
        let id = seed_code_block(&mut graph, &JZ_XOR_RET);

        let mut subgraph = BasicBlockDecomposer::new(&graph, id).decompose().unwrap();
        let new_ids = BlockBuilder::new(&mut graph).build(&mut subgraph).unwrap();
        assert_eq!(new_ids.len(), 1);
        assert_eq!(subgraph.basic_block_count(), 0);

        let rebuilt = graph.block(new_ids[0]).unwrap();
        assert_eq!(rebuilt.size(), 5);
        assert_eq!(rebuilt.data(), &JZ_XOR_RET);
        assert!(rebuilt.label_at(0).is_some());
        assert!(rebuilt.has_attributes(BlockAttributes::BUILT_BY_PEWEAVE));
        // The identity rebuild preserves the provenance of every original byte.
        assert!(rebuilt.source_ranges().is_cover_of(5));
        assert_eq!(rebuilt.source_ranges().map_offset(0), Some(rva(0x1000)));
        assert_eq!(rebuilt.source_ranges().map_offset(4), Some(rva(0x1004)));
        // The old block is gone.
        assert!(graph.block(id).is_none());
    }

    /// Splice `push eax; pop eax` ahead of the first basic block. The
    /// rebuilt block grows to 7 bytes, the conditional displacement is recomputed, and
    /// the inbound referrer lands on the rebuilt block's offset 0.
    #[test]
    fn instrumented_rebuild_recomputes_displacements_and_referrers() {
        let mut graph = BlockGraph::new();
        let id = seed_code_block(&mut graph, &JZ_XOR_RET);
        let caller = graph.add_block(BlockType::Code, 0x10, "caller");
        graph
            .set_reference(
                caller,
                2,
                Reference::direct(ReferenceType::PcRelative, 4, id, 0),
            )
            .unwrap();

        let mut subgraph = BasicBlockDecomposer::new(&graph, id).decompose().unwrap();
        let head = subgraph.basic_block_at(0).unwrap().id();
        let code = subgraph
            .basic_block_mut(head)
            .unwrap()
            .as_code_mut()
            .unwrap();
        let mut asm = BasicBlockAssembler::new(code, 0);
        asm.push_reg(Register::EAX).unwrap();
        asm.pop_reg(Register::EAX).unwrap();

        let new_ids = BlockBuilder::new(&mut graph).build(&mut subgraph).unwrap();
        let rebuilt = graph.block(new_ids[0]).unwrap();
        assert_eq!(rebuilt.size(), 7);
        assert_eq!(rebuilt.data(), &[0x50, 0x58, 0x74, 0x02, 0x33, 0xc0, 0xc3]);

        // The caller's reference moved onto the new block at offset 0.
        let reference = graph.reference_of(caller, 2).unwrap();
        assert_eq!(reference.target(), new_ids[0]);
        assert_eq!(reference.base(), 0);

        // The spliced bytes are synthetic; the copied ones keep their provenance.
        let rebuilt = graph.block(new_ids[0]).unwrap();
        assert!(rebuilt.source_ranges().is_cover_of(7));
        assert_eq!(rebuilt.source_ranges().map_offset(0), None);
        assert_eq!(rebuilt.source_ranges().map_offset(2), Some(rva(0x1000)));
        assert_eq!(rebuilt.source_ranges().map_offset(6), Some(rva(0x1004)));
    }

    fn subgraph_with_padding(pad: usize) -> (BlockGraph<'static>, BasicBlockSubgraph) {
        let graph = BlockGraph::new();
        let mut subgraph = BasicBlockSubgraph::new();

        let far = subgraph.add_basic_block("far", None, {
            let mut code = BasicCodeBlock::default();
            let mut asm = BasicBlockAssembler::new(&mut code, 0);
            asm.ret().unwrap();
            BasicBlockContent::Code(code)
        });
        let pad_bb = subgraph.add_basic_block(
            "pad",
            None,
            BasicBlockContent::Data(BasicDataBlock {
                data: vec![0x90; pad],
                references: BTreeMap::new(),
                source_range: None,
            }),
        );
        let head = subgraph.add_basic_block("head", None, {
            let mut code = BasicCodeBlock::default();
            code.successors.push(Successor::new(
                SuccessorCondition::Equal,
                BasicBlockTarget::BasicBlock(far),
            ));
            code.successors.push(Successor::new(
                SuccessorCondition::NotEqual,
                BasicBlockTarget::BasicBlock(pad_bb),
            ));
            BasicBlockContent::Code(code)
        });

        subgraph.add_description(BlockDescription {
            name: "promoted".to_string(),
            compiland: None,
            section: None,
            alignment: 1,
            basic_block_alignment: 1,
            attributes: BlockAttributes::empty(),
            basic_block_order: vec![head, pad_bb, far],
        });
        (graph, subgraph)
    }

    /// A conditional branch over 150 bytes cannot stay short. The first
    /// iteration assumes the 2-byte form, the displacement lands out of range, and the
    /// builder promotes to the 6-byte long form.
    #[test]
    fn short_branch_promotes_to_long_over_long_distances() {
        let (mut graph, mut subgraph) = subgraph_with_padding(150);
        let new_ids = BlockBuilder::new(&mut graph).build(&mut subgraph).unwrap();
        let block = graph.block(new_ids[0]).unwrap();
        // 6-byte jcc + 150 bytes padding + 1-byte ret.
        assert_eq!(block.size(), 157);
        assert_eq!(&block.data()[..2], &[0x0f, 0x84]);
        let displacement =
            i32::from_le_bytes(block.data()[2..6].try_into().unwrap());
        assert_eq!(displacement, 150);
    }

    /// A displacement of +127 keeps the short form; +128 promotes.
    #[test]
    fn promotion_boundary_is_plus_127() {
        let (mut graph, mut subgraph) = subgraph_with_padding(127);
        let new_ids = BlockBuilder::new(&mut graph).build(&mut subgraph).unwrap();
        let block = graph.block(new_ids[0]).unwrap();
        // Short jcc: displacement from its end (offset 2) to the ret at 129.
        assert_eq!(block.data()[0], 0x74);
        assert_eq!(block.data()[1], 127);
        assert_eq!(block.size(), 130);

        let (mut graph, mut subgraph) = subgraph_with_padding(128);
        let new_ids = BlockBuilder::new(&mut graph).build(&mut subgraph).unwrap();
        let block = graph.block(new_ids[0]).unwrap();
        // One byte further and the short form no longer reaches.
        assert_eq!(&block.data()[..2], &[0x0f, 0x84]);
    }

    #[test]
    fn external_successors_use_the_long_form_with_a_reference() {
        let mut graph = BlockGraph::new();
        let callee = graph.add_block(BlockType::Code, 0x10, "callee");

        let mut subgraph = BasicBlockSubgraph::new();
        let head = subgraph.add_basic_block("head", None, {
            let mut code = BasicCodeBlock::default();
            code.successors.push(Successor::new(
                SuccessorCondition::Always,
                BasicBlockTarget::Block(callee),
            ));
            BasicBlockContent::Code(code)
        });
        subgraph.add_description(BlockDescription {
            name: "tail-call".to_string(),
            compiland: None,
            section: None,
            alignment: 1,
            basic_block_alignment: 1,
            attributes: BlockAttributes::empty(),
            basic_block_order: vec![head],
        });

        let new_ids = BlockBuilder::new(&mut graph).build(&mut subgraph).unwrap();
        let block = graph.block(new_ids[0]).unwrap();
        assert_eq!(block.size(), 5);
        assert_eq!(block.data()[0], 0xe9);
        let reference = block.reference_at(1).unwrap();
        assert_eq!(reference.target(), callee);
        assert_eq!(reference.ref_type(), ReferenceType::PcRelative);
        assert_eq!(reference.size(), 4);
        assert!(graph.block(callee).unwrap().referrers().contains(&(new_ids[0], 1)));
    }

    #[test]
    fn failed_build_leaves_the_graph_unchanged() {
        let mut graph = BlockGraph::new();
        let id = seed_code_block(&mut graph, &JZ_XOR_RET);

        let mut subgraph = BasicBlockDecomposer::new(&graph, id).decompose().unwrap();
        // Sabotage: describe a basic block that does not exist.
        subgraph.descriptions_mut()[0]
            .basic_block_order
            .push(BasicBlockId::from_raw(999));

        let before = graph.block_count();
        assert!(BlockBuilder::new(&mut graph).build(&mut subgraph).is_err());
        assert_eq!(graph.block_count(), before);
        assert!(graph.block(id).is_some());
    }
}
