//! Block attribute flags.

use bitflags::bitflags;

bitflags! {
    /// Properties of a block, set during decomposition and by transforms.
    ///
    /// Attributes are append-only as a contract: new values may be added, existing values
    /// never acquire new meanings. Several of them gate basic-block decomposition, see
    /// [`crate::policy::RedecompositionPolicy`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlockAttributes: u16 {
        /// Filler inserted to cover a range the decomposer could not classify.
        const GAP = 1 << 0;
        /// Interior padding between compiler-emitted regions (int3 runs or zeroes).
        const PADDING = 1 << 1;
        /// Block originated from one linker section contribution.
        const SECTION_CONTRIBUTION = 1 << 2;
        /// Block was produced by the PE header parser; such blocks may not be deleted.
        const PE_PARSED = 1 << 3;
        /// Block was emitted by a transform of this system; always safe to decompose again.
        const BUILT_BY_PEWEAVE = 1 << 4;
        /// Compiland is not on the supported-compiler whitelist; treat conservatively.
        const BUILT_BY_UNSUPPORTED_COMPILER = 1 << 5;
        /// Compiland-level hint that this function contains inline assembly.
        const HAS_INLINE_ASSEMBLY = 1 << 6;
        /// Function uses structured or C++ exception handling.
        const HAS_EXCEPTION_HANDLING = 1 << 7;
        /// Function does not return to its caller.
        const NON_RETURN_FUNCTION = 1 << 8;
        /// Disassembly appeared to fall out of the block; suspect.
        const DISASSEMBLED_PAST_END = 1 << 9;
        /// One or more computed branch targets could not be resolved.
        const INCOMPLETE_DISASSEMBLY = 1 << 10;
        /// Disassembly violated expectations; not safe to basic-block decompose.
        const ERRORED_DISASSEMBLY = 1 << 11;
        /// Single-instruction jump thunk.
        const THUNK = 1 << 12;
        /// Bracketed initializer run; must remain contiguous.
        const COFF_GROUP = 1 << 13;
    }
}

impl BlockAttributes {
    /// Attributes that disqualify a block from basic-block decomposition outright.
    #[must_use]
    pub fn unsafe_for_decomposition() -> Self {
        Self::GAP
            | Self::PADDING
            | Self::BUILT_BY_UNSUPPORTED_COMPILER
            | Self::ERRORED_DISASSEMBLY
            | Self::HAS_EXCEPTION_HANDLING
            | Self::DISASSEMBLED_PAST_END
    }
}
