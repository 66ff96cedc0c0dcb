//! An assembly surface that emits instructions into a basic block's instruction list.
//!
//! The assembler drives the external x86 encoder. Callers pass typed operands whose
//! immediates and displacements may carry an *untyped* reference; per opcode the assembler
//! attaches the correct `(type, size)` contract and records the reference at the slot
//! offset the encoder reports, so the image writer can later serialize the slot.
//!
//! # Example
//!
//! ```rust
//! use peweave::basicblock::{BasicBlockAssembler, BasicCodeBlock, Register};
//!
//! let mut code = BasicCodeBlock::default();
//! let mut asm = BasicBlockAssembler::new(&mut code, 0);
//! asm.push_reg(Register::EAX)?;
//! asm.pop_reg(Register::EAX)?;
//! assert_eq!(code.instructions.len(), 2);
//! # Ok::<(), peweave::Error>(())
//! ```

use iced_x86::{Code, Encoder, MemoryOperand};
pub use iced_x86::Register;

use crate::address::{AddressRange, RelativeAddress};
use crate::basicblock::{BasicCodeBlock, Instruction, UntypedReference};
use crate::graph::ReferenceType;
use crate::Result;

/// An immediate operand, optionally backed by an untyped reference.
#[derive(Debug, Clone, Copy)]
pub struct Immediate {
    value: i64,
    reference: Option<UntypedReference>,
}

impl Immediate {
    /// A plain immediate value.
    #[must_use]
    pub fn new(value: i64) -> Self {
        Self {
            value,
            reference: None,
        }
    }

    /// An immediate that refers to a block or basic block; the encoded value is a
    /// placeholder until the image writer serializes the reference.
    #[must_use]
    pub fn reference(reference: UntypedReference) -> Self {
        Self {
            value: 0,
            reference: Some(reference),
        }
    }

    /// Whether the value survives a sign-extending 8-bit encoding.
    fn fits_i8(&self) -> bool {
        i64::from(self.value as i8) == self.value
    }
}

/// A memory operand: base, index, scale, displacement.
///
/// The displacement may carry an untyped reference, in which case it is always encoded as
/// a full 4-byte slot.
#[derive(Debug, Clone, Copy)]
pub struct Memory {
    base: Register,
    index: Register,
    scale: u32,
    displacement: i64,
    reference: Option<UntypedReference>,
}

impl Memory {
    /// `[base]`
    #[must_use]
    pub fn base(base: Register) -> Self {
        Self {
            base,
            index: Register::None,
            scale: 1,
            displacement: 0,
            reference: None,
        }
    }

    /// `[base + displacement]`
    #[must_use]
    pub fn base_displ(base: Register, displacement: i64) -> Self {
        Self {
            base,
            index: Register::None,
            scale: 1,
            displacement,
            reference: None,
        }
    }

    /// `[base + index * scale]`
    #[must_use]
    pub fn base_index_scale(base: Register, index: Register, scale: u32) -> Self {
        Self {
            base,
            index,
            scale,
            displacement: 0,
            reference: None,
        }
    }

    /// `[displacement]`, where the displacement names a block or basic block.
    #[must_use]
    pub fn reference(reference: UntypedReference) -> Self {
        Self {
            base: Register::None,
            index: Register::None,
            scale: 1,
            displacement: 0,
            reference: Some(reference),
        }
    }

    /// `[index * scale + displacement]` with the displacement naming a jump table.
    #[must_use]
    pub fn index_scale_reference(index: Register, scale: u32, reference: UntypedReference) -> Self {
        Self {
            base: Register::None,
            index,
            scale,
            displacement: 0,
            reference: Some(reference),
        }
    }

    fn to_operand(self) -> MemoryOperand {
        let displ_size = if self.reference.is_some() || self.base == Register::None {
            4
        } else if self.displacement == 0 {
            0
        } else if i64::from(self.displacement as i8) == self.displacement {
            1
        } else {
            4
        };
        MemoryOperand::new(
            self.base,
            self.index,
            self.scale,
            self.displacement,
            displ_size,
            false,
            Register::None,
        )
    }
}

/// Appends or inserts instructions into a [`BasicCodeBlock`].
pub struct BasicBlockAssembler<'s> {
    code: &'s mut BasicCodeBlock,
    index: usize,
    source_range: Option<AddressRange<RelativeAddress>>,
}

impl<'s> BasicBlockAssembler<'s> {
    /// Creates an assembler inserting at `index` of the instruction list.
    ///
    /// An index past the end appends.
    #[must_use]
    pub fn new(code: &'s mut BasicCodeBlock, index: usize) -> Self {
        let index = index.min(code.instructions.len());
        Self {
            code,
            index,
            source_range: None,
        }
    }

    /// Stamps subsequently emitted instructions with a provenance range.
    ///
    /// Freshly synthesized instructions normally carry none, which marks their bytes as
    /// synthetic in the rebuilt block's source ranges.
    pub fn set_source_range(&mut self, source_range: Option<AddressRange<RelativeAddress>>) {
        self.source_range = source_range;
    }

    /// The insertion index of the next emitted instruction.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    // -------------------------------------------------------------------------------
    // Core emission
    // -------------------------------------------------------------------------------

    /// Encodes `instr` and inserts it, attaching up to one immediate-slot and one
    /// displacement-slot reference.
    fn emit(
        &mut self,
        instr: iced_x86::Instruction,
        imm_ref: Option<(UntypedReference, ReferenceType, u8)>,
        mem_ref: Option<UntypedReference>,
    ) -> Result<()> {
        let mut encoder = Encoder::new(32);
        encoder.encode(&instr, 0)?;
        let offsets = encoder.get_constant_offsets();
        let bytes = encoder.take_buffer();

        let mut instruction = Instruction::new(instr, bytes, self.source_range);

        if let Some((reference, ref_type, size)) = imm_ref {
            // Branch displacements and plain immediates are both reported by the encoder;
            // for near branches the slot is the trailing bytes of the instruction.
            let slot = if offsets.has_immediate() {
                offsets.immediate_offset()
            } else {
                instruction.data().len() - usize::from(size)
            };
            let slot = u8::try_from(slot)
                .map_err(|_| invariant_error!("immediate slot offset overflows"))?;
            instruction.set_reference(slot, reference.typed(ref_type, size))?;
        }

        if let Some(reference) = mem_ref {
            if !offsets.has_displacement() {
                return Err(invariant_error!(
                    "operand carries a reference but the encoding has no displacement"
                ));
            }
            let slot = u8::try_from(offsets.displacement_offset())
                .map_err(|_| invariant_error!("displacement slot offset overflows"))?;
            instruction.set_reference(slot, reference.typed(ReferenceType::Absolute, 4))?;
        }

        self.code.instructions.insert(self.index, instruction);
        self.index += 1;
        Ok(())
    }

    // -------------------------------------------------------------------------------
    // Stack
    // -------------------------------------------------------------------------------

    /// `push r32`
    pub fn push_reg(&mut self, register: Register) -> Result<()> {
        self.emit(
            iced_x86::Instruction::with1(Code::Push_r32, register)?,
            None,
            None,
        )
    }

    /// `push imm`
    ///
    /// An 8-bit-extensible immediate is encoded as one byte unless it carries a
    /// reference; referenced immediates always use the 4-byte form.
    pub fn push_imm(&mut self, immediate: Immediate) -> Result<()> {
        if immediate.reference.is_none() && immediate.fits_i8() {
            return self.emit(
                iced_x86::Instruction::with1(Code::Pushd_imm8, immediate.value as i32)?,
                None,
                None,
            );
        }
        let imm_ref = immediate
            .reference
            .map(|r| (r, ReferenceType::Absolute, 4));
        self.emit(
            iced_x86::Instruction::with1(Code::Pushd_imm32, immediate.value as i32)?,
            imm_ref,
            None,
        )
    }

    /// `pop r32`
    pub fn pop_reg(&mut self, register: Register) -> Result<()> {
        self.emit(
            iced_x86::Instruction::with1(Code::Pop_r32, register)?,
            None,
            None,
        )
    }

    // -------------------------------------------------------------------------------
    // Moves
    // -------------------------------------------------------------------------------

    /// `mov r32, r32`
    pub fn mov_reg_reg(&mut self, dst: Register, src: Register) -> Result<()> {
        self.emit(
            iced_x86::Instruction::with2(Code::Mov_r32_rm32, dst, src)?,
            None,
            None,
        )
    }

    /// `mov r32, [mem]`
    pub fn mov_reg_mem(&mut self, dst: Register, src: Memory) -> Result<()> {
        self.emit(
            iced_x86::Instruction::with2(Code::Mov_r32_rm32, dst, src.to_operand())?,
            None,
            src.reference,
        )
    }

    /// `mov [mem], r32`
    pub fn mov_mem_reg(&mut self, dst: Memory, src: Register) -> Result<()> {
        self.emit(
            iced_x86::Instruction::with2(Code::Mov_rm32_r32, dst.to_operand(), src)?,
            None,
            dst.reference,
        )
    }

    /// `mov r32, imm32`
    pub fn mov_reg_imm(&mut self, dst: Register, immediate: Immediate) -> Result<()> {
        let imm_ref = immediate
            .reference
            .map(|r| (r, ReferenceType::Absolute, 4));
        self.emit(
            iced_x86::Instruction::with2(Code::Mov_r32_imm32, dst, immediate.value as i32)?,
            imm_ref,
            None,
        )
    }

    /// `lea r32, [mem]`
    pub fn lea(&mut self, dst: Register, src: Memory) -> Result<()> {
        self.emit(
            iced_x86::Instruction::with2(Code::Lea_r32_m, dst, src.to_operand())?,
            None,
            src.reference,
        )
    }

    // -------------------------------------------------------------------------------
    // Control flow
    // -------------------------------------------------------------------------------

    /// `call rel32`
    ///
    /// The immediate must carry a reference; the backing slot is pc-relative, 4 bytes.
    pub fn call(&mut self, target: Immediate) -> Result<()> {
        let reference = target.reference.ok_or_else(|| {
            invariant_error!("a direct call needs a referenced target")
        })?;
        self.emit(
            iced_x86::Instruction::with_branch(Code::Call_rel32_32, 0)?,
            Some((reference, ReferenceType::PcRelative, 4)),
            None,
        )
    }

    /// `call [mem]`
    pub fn call_mem(&mut self, target: Memory) -> Result<()> {
        self.emit(
            iced_x86::Instruction::with1(Code::Call_rm32, target.to_operand())?,
            None,
            target.reference,
        )
    }

    /// `jmp rel32`
    ///
    /// The immediate must carry a reference; the backing slot is pc-relative, 4 bytes.
    pub fn jmp(&mut self, target: Immediate) -> Result<()> {
        let reference = target.reference.ok_or_else(|| {
            invariant_error!("a direct jump needs a referenced target")
        })?;
        self.emit(
            iced_x86::Instruction::with_branch(Code::Jmp_rel32_32, 0)?,
            Some((reference, ReferenceType::PcRelative, 4)),
            None,
        )
    }

    /// `jmp [mem]` - the dispatch form used with jump tables.
    pub fn jmp_mem(&mut self, target: Memory) -> Result<()> {
        self.emit(
            iced_x86::Instruction::with1(Code::Jmp_rm32, target.to_operand())?,
            None,
            target.reference,
        )
    }

    /// `ret`
    pub fn ret(&mut self) -> Result<()> {
        self.emit(iced_x86::Instruction::with(Code::Retnd), None, None)
    }

    /// `ret imm16`
    pub fn ret_n(&mut self, bytes: u16) -> Result<()> {
        self.emit(
            iced_x86::Instruction::with1(Code::Retnd_imm16, i32::from(bytes))?,
            None,
            None,
        )
    }

    /// `int3`
    pub fn int3(&mut self) -> Result<()> {
        self.emit(iced_x86::Instruction::with(Code::Int3), None, None)
    }

    /// `nop`
    pub fn nop(&mut self) -> Result<()> {
        self.emit(iced_x86::Instruction::with(Code::Nopd), None, None)
    }

    // -------------------------------------------------------------------------------
    // Arithmetic and logic
    // -------------------------------------------------------------------------------

    /// `xor r32, r32`
    pub fn xor_reg_reg(&mut self, dst: Register, src: Register) -> Result<()> {
        self.emit(
            iced_x86::Instruction::with2(Code::Xor_r32_rm32, dst, src)?,
            None,
            None,
        )
    }

    /// `test r32, r32`
    pub fn test_reg_reg(&mut self, left: Register, right: Register) -> Result<()> {
        self.emit(
            iced_x86::Instruction::with2(Code::Test_rm32_r32, left, right)?,
            None,
            None,
        )
    }

    /// `cmp r32, r32`
    pub fn cmp_reg_reg(&mut self, left: Register, right: Register) -> Result<()> {
        self.emit(
            iced_x86::Instruction::with2(Code::Cmp_r32_rm32, left, right)?,
            None,
            None,
        )
    }

    /// `cmp r32, imm`
    ///
    /// 8-bit immediates must not carry references; a referenced immediate forces the
    /// 4-byte form.
    pub fn cmp_reg_imm(&mut self, left: Register, immediate: Immediate) -> Result<()> {
        self.alu_reg_imm(Code::Cmp_rm32_imm8, Code::Cmp_rm32_imm32, left, immediate)
    }

    /// `add r32, imm`
    pub fn add_reg_imm(&mut self, dst: Register, immediate: Immediate) -> Result<()> {
        self.alu_reg_imm(Code::Add_rm32_imm8, Code::Add_rm32_imm32, dst, immediate)
    }

    /// `sub r32, imm`
    pub fn sub_reg_imm(&mut self, dst: Register, immediate: Immediate) -> Result<()> {
        self.alu_reg_imm(Code::Sub_rm32_imm8, Code::Sub_rm32_imm32, dst, immediate)
    }

    fn alu_reg_imm(
        &mut self,
        imm8: Code,
        imm32: Code,
        register: Register,
        immediate: Immediate,
    ) -> Result<()> {
        if immediate.reference.is_none() && immediate.fits_i8() {
            return self.emit(
                iced_x86::Instruction::with2(imm8, register, immediate.value as i32)?,
                None,
                None,
            );
        }
        let imm_ref = immediate
            .reference
            .map(|r| (r, ReferenceType::Absolute, 4));
        self.emit(
            iced_x86::Instruction::with2(imm32, register, immediate.value as i32)?,
            imm_ref,
            None,
        )
    }
}
