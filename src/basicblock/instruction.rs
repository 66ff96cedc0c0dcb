//! A single decoded or assembled instruction inside a basic code block.

use std::collections::BTreeMap;
use std::fmt;

use iced_x86::FlowControl;

use crate::address::{AddressRange, RelativeAddress};
use crate::basicblock::BasicBlockReference;
use crate::Result;

/// One instruction: its bytes, per-operand reference slots, and provenance.
///
/// The decoded representation from the external codec is kept alongside the raw bytes so
/// the decomposer and builder can classify flow without re-decoding. Reference slots are
/// keyed by the byte offset inside the instruction where the immediate or displacement
/// begins, exactly as the codec reports it.
#[derive(Debug, Clone)]
pub struct Instruction {
    repr: iced_x86::Instruction,
    data: Vec<u8>,
    references: BTreeMap<u8, BasicBlockReference>,
    source_range: Option<AddressRange<RelativeAddress>>,
}

impl Instruction {
    /// Wraps a decoded instruction and its bytes.
    #[must_use]
    pub fn new(
        repr: iced_x86::Instruction,
        data: Vec<u8>,
        source_range: Option<AddressRange<RelativeAddress>>,
    ) -> Self {
        debug_assert_eq!(repr.len(), data.len());
        Self {
            repr,
            data,
            references: BTreeMap::new(),
            source_range,
        }
    }

    /// The decoded representation.
    #[must_use]
    pub fn repr(&self) -> &iced_x86::Instruction {
        &self.repr
    }

    /// The instruction's bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The instruction's length in bytes.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    /// Whether the instruction is empty (it never is; present for API symmetry).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The reference slots, keyed by byte offset inside the instruction.
    #[must_use]
    pub fn references(&self) -> &BTreeMap<u8, BasicBlockReference> {
        &self.references
    }

    /// Attaches a reference at the given slot offset.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if the slot extends past the instruction or the
    /// reference's `(type, size)` contract is illegal.
    pub fn set_reference(&mut self, slot: u8, reference: BasicBlockReference) -> Result<()> {
        if !reference.is_valid() {
            return Err(invariant_error!(
                "illegal reference type/size: {}/{}",
                reference.ref_type,
                reference.size
            ));
        }
        if usize::from(slot) + usize::from(reference.size) > self.data.len() {
            return Err(invariant_error!(
                "reference slot at {} overruns a {}-byte instruction",
                slot,
                self.data.len()
            ));
        }
        self.references.insert(slot, reference);
        Ok(())
    }

    /// Where the instruction's bytes came from in the original image.
    #[must_use]
    pub fn source_range(&self) -> Option<AddressRange<RelativeAddress>> {
        self.source_range
    }

    /// Stamps the instruction's provenance.
    pub fn set_source_range(&mut self, source_range: Option<AddressRange<RelativeAddress>>) {
        self.source_range = source_range;
    }

    /// How the instruction affects control flow, per the codec.
    #[must_use]
    pub fn flow_control(&self) -> FlowControl {
        self.repr.flow_control()
    }

    /// Whether the instruction is a call (direct or indirect).
    #[must_use]
    pub fn is_call(&self) -> bool {
        matches!(
            self.flow_control(),
            FlowControl::Call | FlowControl::IndirectCall
        )
    }

    /// Whether the instruction returns from the function.
    #[must_use]
    pub fn is_return(&self) -> bool {
        self.flow_control() == FlowControl::Return
    }

    /// Whether the instruction is an `int3` breakpoint.
    #[must_use]
    pub fn is_int3(&self) -> bool {
        self.repr.code() == iced_x86::Code::Int3
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.repr)
    }
}
