//! The image decomposer: from parsed module inputs to a populated block graph.
//!
//! Decomposition runs once per input module. Blocks are created from linker section
//! contributions, ranges no contribution covers become gap blocks, every fixup becomes a
//! typed reference (consulting the encoded bytes to recover the precise target), and
//! symbols contribute labels and block attributes. The decomposer finishes with the
//! consistency checks that make the rest of the pipeline trustworthy: relocation/fixup
//! cross-validation up front and fixup-coverage checking at the end.

use std::borrow::Cow;

use log::{debug, warn};

use crate::address::RelativeAddress;
use crate::fixup::FixupMap;
use crate::graph::{
    Block, BlockAttributes, BlockId, BlockType, ImageAddressSpace, Label, LabelAttributes,
    Reference, ReferenceType,
};
use crate::input::{ModuleInput, SectionInfo, SymbolAttributes, SymbolKind};
use crate::Result;

/// A stateful decomposer instance that builds the address space step by step.
pub struct ImageDecomposer<'a, 'i> {
    input: &'i ModuleInput<'a>,
    fixups: FixupMap,
    space: ImageAddressSpace<'a>,
}

impl<'a, 'i> ImageDecomposer<'a, 'i> {
    /// Creates a decomposer over one module's inputs.
    ///
    /// The fixup map is populated (translating through the legacy address-translation
    /// table when the module was rewritten before) and cross-checked against the image's
    /// relocation table immediately.
    ///
    /// # Errors
    ///
    /// Returns an input inconsistency if the fixup stream and the relocation table do not
    /// describe the same image.
    pub fn new(input: &'i ModuleInput<'a>) -> Result<Self> {
        let fixups = FixupMap::from_debug_entries(&input.fixups, input.legacy_translation.as_ref())?;
        fixups.validate_against_relocations(&input.relocations)?;
        Ok(Self {
            input,
            fixups,
            space: ImageAddressSpace::new(),
        })
    }

    /// Runs the full decomposition, consuming the decomposer.
    ///
    /// # Errors
    ///
    /// Returns an input inconsistency when the module inputs disagree with each other, or
    /// an invariant violation if the producers handed overlapping contributions.
    pub fn decompose(mut self) -> Result<ImageAddressSpace<'a>> {
        self.create_sections();
        self.create_blocks_from_contributions()?;
        self.create_gap_blocks()?;
        self.create_references_from_fixups()?;
        self.apply_symbols()?;
        self.label_jump_tables()?;
        self.tag_thunks();
        self.check_fixup_coverage()?;
        self.retag_padding_blocks();
        Ok(self.space)
    }

    fn create_sections(&mut self) {
        for section in &self.input.sections {
            self.space
                .graph_mut()
                .add_section(&section.name, section.characteristics);
        }
    }

    fn section_id_for(&self, rva: RelativeAddress) -> Option<crate::graph::SectionId> {
        self.input
            .sections
            .iter()
            .position(|s| s.range().contains(rva))
            .and_then(|index| {
                self.space
                    .graph()
                    .sections()
                    .nth(index)
                    .map(|(id, _)| id)
            })
    }

    /// The initialized bytes backing `[rva, rva + size)`, clipped to what the section
    /// actually carries on disk.
    fn initialized_bytes(section: &SectionInfo<'a>, rva: RelativeAddress, size: u32) -> &'a [u8] {
        let start = (rva - section.virtual_address) as usize;
        let end = (start + size as usize).min(section.data.len());
        section.data.get(start.min(section.data.len())..end).unwrap_or(&[])
    }

    fn create_blocks_from_contributions(&mut self) -> Result<()> {
        for contribution in &self.input.contributions {
            let section = self
                .input
                .sections
                .iter()
                .find(|s| s.range().contains(contribution.rva))
                .ok_or_else(|| {
                    inconsistency_error!(
                        "contribution at {} lies outside every section",
                        contribution.rva
                    )
                })?;

            let block_type = if contribution.is_code && section.contains_code() {
                BlockType::Code
            } else {
                BlockType::Data
            };
            let id = self.space.insert_block(
                contribution.rva,
                contribution.size,
                block_type,
                contribution.compiland.clone(),
            )?;

            let section_id = self.section_id_for(contribution.rva);
            let data = Self::initialized_bytes(section, contribution.rva, contribution.size);
            let block = self.space.graph_mut().block_mut(id).expect("just added");
            block.set_section(section_id);
            block.set_compiland_name(contribution.compiland.clone());
            block.set_attributes(BlockAttributes::SECTION_CONTRIBUTION);
            if !contribution.supported_compiler {
                block.set_attributes(BlockAttributes::BUILT_BY_UNSUPPORTED_COMPILER);
            }
            block.set_data(Cow::Borrowed(data))?;
            *block.source_ranges_mut() =
                crate::graph::SourceRanges::identity(contribution.rva, contribution.size);
        }
        Ok(())
    }

    fn create_gap_blocks(&mut self) -> Result<()> {
        for (index, section) in self.input.sections.iter().enumerate() {
            let gaps = self.space.gaps_in(section.range());
            for gap in gaps {
                let block_type = if section.contains_code() {
                    BlockType::Code
                } else {
                    BlockType::Data
                };
                let id = self.space.insert_block(
                    gap.start(),
                    gap.size(),
                    block_type,
                    format!("gap@{}", gap.start()),
                )?;
                let section_id = self
                    .space
                    .graph()
                    .sections()
                    .nth(index)
                    .map(|(id, _)| id);
                let data = Self::initialized_bytes(section, gap.start(), gap.size());
                let block = self.space.graph_mut().block_mut(id).expect("just added");
                block.set_section(section_id);
                block.set_attributes(BlockAttributes::GAP);
                block.set_data(Cow::Borrowed(data))?;
                *block.source_ranges_mut() =
                    crate::graph::SourceRanges::identity(gap.start(), gap.size());
            }
        }
        Ok(())
    }

    /// Recovers the RVA actually encoded at a fixup location.
    fn encoded_target(
        &self,
        location: RelativeAddress,
        kind: ReferenceType,
    ) -> Result<RelativeAddress> {
        let imm = self.input.read_u32(location).ok_or_else(|| {
            inconsistency_error!("fixup at {} has no initialized bytes to consult", location)
        })?;

        let rva = match kind {
            ReferenceType::PcRelative => {
                // Displacement is taken from the end of the 4-byte slot.
                (location + 4).checked_offset(i64::from(imm as i32))
            }
            ReferenceType::Absolute => {
                let base = self.input.image_base.value();
                imm.checked_sub(base).map(RelativeAddress::new)
            }
            ReferenceType::Relative => Some(RelativeAddress::new(imm)),
            ReferenceType::SectionRelative => {
                // The encoded value is an offset into the section holding the target.
                self.input
                    .section_containing(location)
                    .map(|s| s.virtual_address + imm)
            }
            ReferenceType::FileOffset => self.input.sections.iter().find_map(|s| {
                let delta = i64::from(imm) - i64::from(s.file_offset.value());
                (delta >= 0 && (delta as u64) < u64::from(s.virtual_size))
                    .then(|| s.virtual_address + delta as u32)
            }),
        };

        rva.ok_or_else(|| {
            inconsistency_error!(
                "encoded value {:#x} at {} does not resolve to an RVA",
                imm,
                location
            )
        })
    }

    fn create_references_from_fixups(&mut self) -> Result<()> {
        let fixup_entries: Vec<(RelativeAddress, ReferenceType, RelativeAddress)> = self
            .fixups
            .iter()
            .map(|(location, f)| (location, f.kind, f.base))
            .collect();

        for (location, kind, base_rva) in fixup_entries {
            let Some((source, source_offset)) = self.space.resolve(location) else {
                return Err(inconsistency_error!(
                    "fixup at {} lies outside every block",
                    location
                ));
            };
            let Some((target, base_offset)) = self.space.resolve(base_rva) else {
                return Err(inconsistency_error!(
                    "fixup base {} lies outside every block",
                    base_rva
                ));
            };

            let encoded_rva = self.encoded_target(location, kind)?;
            let target_start = self
                .space
                .address_of(target)
                .expect("target came from resolve");
            let offset = encoded_rva - target_start;
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            let reference = Reference::indirect(
                kind,
                4,
                target,
                offset as i32,
                base_offset as i32,
            );
            self.space
                .graph_mut()
                .set_reference(source, source_offset, reference)?;
            self.fixups.mark_visited(location);
        }
        Ok(())
    }

    fn apply_symbols(&mut self) -> Result<()> {
        let symbols = self.input.symbols.clone();
        for symbol in &symbols {
            let Some((id, offset)) = self.space.resolve(symbol.rva) else {
                return Err(inconsistency_error!(
                    "symbol '{}' at {} lies outside every block",
                    symbol.name,
                    symbol.rva
                ));
            };

            let is_code = self
                .space
                .graph()
                .block(id)
                .is_some_and(|b| b.block_type() == BlockType::Code);
            let attributes = match symbol.kind {
                SymbolKind::Function | SymbolKind::Thunk | SymbolKind::Label => {
                    LabelAttributes::CODE
                }
                SymbolKind::Data | SymbolKind::CoffGroup => LabelAttributes::DATA,
                SymbolKind::Public => {
                    let kind = if is_code {
                        LabelAttributes::CODE
                    } else {
                        LabelAttributes::DATA
                    };
                    kind | LabelAttributes::PUBLIC_SYMBOL
                }
            };

            let block = self
                .space
                .graph_mut()
                .block_mut(id)
                .expect("id came from resolve");
            block.set_label(offset, Label::new(symbol.name.clone(), attributes)?)?;

            match symbol.kind {
                SymbolKind::Function => {
                    if symbol.attributes.contains(SymbolAttributes::NON_RETURN) {
                        block.set_attributes(BlockAttributes::NON_RETURN_FUNCTION);
                    }
                    if symbol
                        .attributes
                        .contains(SymbolAttributes::HAS_INLINE_ASSEMBLY)
                    {
                        block.set_attributes(BlockAttributes::HAS_INLINE_ASSEMBLY);
                    }
                    if symbol
                        .attributes
                        .contains(SymbolAttributes::HAS_EXCEPTION_HANDLING)
                    {
                        block.set_attributes(BlockAttributes::HAS_EXCEPTION_HANDLING);
                    }
                }
                SymbolKind::Thunk => block.set_attributes(BlockAttributes::THUNK),
                SymbolKind::CoffGroup => block.set_attributes(BlockAttributes::COFF_GROUP),
                _ => {}
            }
        }
        Ok(())
    }

    /// Labels runs of absolute self-references inside code blocks as jump tables.
    ///
    /// Recognized compilers emit switch jump tables inside the function that uses them;
    /// the debug database carries no symbol for them, but every entry shows up as an
    /// absolute fixup whose source and target live in the same block.
    fn label_jump_tables(&mut self) -> Result<()> {
        let code_blocks: Vec<BlockId> = self
            .space
            .graph()
            .blocks()
            .filter(|b| b.block_type() == BlockType::Code)
            .map(Block::id)
            .collect();

        for id in code_blocks {
            let block = self.space.graph().block(id).expect("id just enumerated");
            let entry_offsets: Vec<u32> = block
                .references()
                .iter()
                .filter(|(_, r)| {
                    r.ref_type() == ReferenceType::Absolute && r.target() == id
                })
                .map(|(offset, _)| *offset)
                .collect();

            // Only the head of each 4-byte-spaced run gets the label.
            let mut run_starts = Vec::new();
            for (index, offset) in entry_offsets.iter().enumerate() {
                if index == 0 || entry_offsets[index - 1] + 4 != *offset {
                    run_starts.push(*offset);
                }
            }

            let block = self
                .space
                .graph_mut()
                .block_mut(id)
                .expect("id just enumerated");
            for offset in run_starts {
                if block.label_at(offset).is_none() {
                    debug!("jump table inferred at {}+{:#x}", id, offset);
                    block.set_label(
                        offset,
                        Label::new(
                            "jump-table",
                            LabelAttributes::DATA | LabelAttributes::JUMP_TABLE,
                        )?,
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Tags single-instruction jump thunks the debug database did not name as such.
    ///
    /// Import and incremental-link thunks are one `jmp rel32` or `jmp [mem]` with exactly
    /// one outgoing reference.
    fn tag_thunks(&mut self) {
        let candidates: Vec<BlockId> = self
            .space
            .graph()
            .blocks()
            .filter(|b| {
                b.block_type() == BlockType::Code
                    && b.references().len() == 1
                    && match b.data() {
                        [0xe9, ..] => b.size() == 5,
                        [0xff, 0x25, ..] => b.size() == 6,
                        _ => false,
                    }
            })
            .map(Block::id)
            .collect();
        for id in candidates {
            self.space
                .graph_mut()
                .block_mut(id)
                .expect("id just enumerated")
                .set_attributes(BlockAttributes::THUNK);
        }
    }

    /// Verifies that decomposition consumed every fixup.
    ///
    /// An unvisited fixup is a fatal inconsistency unless it is pc-relative and falls
    /// inside a code block, which corresponds to orphaned unreachable code.
    fn check_fixup_coverage(&self) -> Result<()> {
        for (rva, fixup) in self.fixups.unvisited() {
            let in_code = self
                .space
                .resolve(rva)
                .and_then(|(id, _)| self.space.graph().block(id))
                .is_some_and(|b| b.block_type() == BlockType::Code);
            if in_code && fixup.kind == ReferenceType::PcRelative {
                warn!("unreferenced pc-relative fixup at {}: orphaned code", rva);
                continue;
            }
            return Err(inconsistency_error!("fixup at {} was never consumed", rva));
        }
        Ok(())
    }

    /// Retags gap blocks that are plainly inter-function padding.
    ///
    /// A gap block with no labels, no references in or out, whose bytes are a single
    /// repeated filler value (0x00 or 0xcc) is padding, not unclassified content.
    fn retag_padding_blocks(&mut self) {
        let candidates: Vec<BlockId> = self
            .space
            .graph()
            .blocks()
            .filter(|b| {
                b.has_attributes(BlockAttributes::GAP)
                    && b.labels().is_empty()
                    && b.references().is_empty()
                    && b.referrers().is_empty()
                    && (b.data().is_empty()
                        || b.data().iter().all(|&byte| byte == 0x00)
                        || b.data().iter().all(|&byte| byte == 0xcc))
            })
            .map(Block::id)
            .collect();

        for id in candidates {
            let block = self
                .space
                .graph_mut()
                .block_mut(id)
                .expect("id just enumerated");
            block.clear_attributes(BlockAttributes::GAP);
            block.set_attributes(BlockAttributes::PADDING);
        }
    }
}

/// Decomposes one module into an RVA-addressed block graph.
///
/// This is the convenience entry point wrapping [`ImageDecomposer`].
///
/// # Errors
///
/// Returns an input inconsistency when the module inputs disagree with each other.
pub fn decompose_module<'a>(input: &ModuleInput<'a>) -> Result<ImageAddressSpace<'a>> {
    ImageDecomposer::new(input)?.decompose()
}
