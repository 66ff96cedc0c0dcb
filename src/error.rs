use thiserror::Error;

use crate::graph::BlockId;

macro_rules! invariant_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::InvariantViolation {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::InvariantViolation {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! inconsistency_error {
    ($msg:expr) => {
        crate::Error::InputInconsistency($msg.to_string())
    };

    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::InputInconsistency(format!($fmt, $($arg)*))
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The variants follow the failure taxonomy of the rewriter core: structural invariant
/// violations are fatal and leave the affected container unchanged, input inconsistencies are
/// fatal at decomposition time, policy refusals are per-transform non-success results that the
/// orchestrator propagates, and disassembly anomalies surface only in strict mode (otherwise
/// they tag the affected block and the pipeline continues).
#[derive(Error, Debug)]
pub enum Error {
    /// A structural invariant of the block graph or a basic-block subgraph was violated.
    ///
    /// Reference out of target bounds, overlapping blocks, label-attribute conflicts,
    /// inconsistent referrer bookkeeping and similar defects all surface here. The operation
    /// that detected the violation has not modified its container. The error carries the
    /// source location where the violation was detected for debugging purposes.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of the violated invariant
    /// * `file` - Source file where the violation was detected
    /// * `line` - Source line where the violation was detected
    #[error("Invariant violation - {file}:{line}: {message}")]
    InvariantViolation {
        /// The message to be printed for the violation
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// The inputs handed to the decomposer disagree with each other.
    ///
    /// A relocation without a matching fixup, a fixup disagreeing with the bytes actually
    /// encoded in the image, or a symbol pointing outside every section all indicate that the
    /// module and its debug database do not describe the same image. Fatal at decomposition.
    #[error("Inconsistent decomposition inputs: {0}")]
    InputInconsistency(String),

    /// An out of bound access was attempted on block or section data.
    ///
    /// This is a safety check that prevents reads beyond a data buffer's extent while
    /// recovering encoded reference values or slicing section bodies.
    #[error("Out of bound read would have occurred!")]
    OutOfBounds,

    /// A transform asked for a basic-block decomposition the policy refused.
    ///
    /// This is the per-block non-success result of the transform policy; it is not a global
    /// fatal error. The orchestrator propagates it to the transform that requested the
    /// decomposition, which may skip the block or abort the pipeline.
    #[error("Policy refused to decompose {block}: {reason}")]
    PolicyRefused {
        /// The block the policy refused to classify as safe
        block: BlockId,
        /// Why the block is not safe to decompose
        reason: String,
    },

    /// Disassembly of a code block violated expectations in strict mode.
    ///
    /// In lenient mode the same conditions tag the block with `ERRORED_DISASSEMBLY`,
    /// `DISASSEMBLED_PAST_END` or `INCOMPLETE_DISASSEMBLY` instead and the pipeline continues.
    #[error("Disassembly error: {0}")]
    Disassembly(String),

    /// The external instruction encoder or decoder reported a failure.
    ///
    /// The x86 codec is an external service; any failure to encode an instruction the
    /// assembler or block builder produced is surfaced unchanged.
    #[error("{0}")]
    Codec(#[from] iced_x86::IcedError),

    /// File I/O error.
    ///
    /// Wraps standard I/O errors that can occur while a host maps or reads the input module
    /// on behalf of the core.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),
}
