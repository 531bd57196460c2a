use thiserror::Error;

macro_rules! bad_code {
    // Position-only version
    ($pos:expr, $msg:expr) => {
        crate::Error::BadCode {
            message: format!($msg),
            pos: $pos,
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($pos:expr, $fmt:expr, $($arg:tt)*) => {
        crate::Error::BadCode {
            message: format!($fmt, $($arg)*),
            pos: $pos,
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The variants follow the failure taxonomy of the weaving pipeline: everything except
/// [`Error::Internal`] is fatal only to the method being analyzed — the driver leaves such a
/// method byte-identical to its input and continues. [`Error::Internal`] indicates an
/// analysis-ordering bug inside the pipeline itself and is surfaced to the caller.
///
/// # Error Categories
///
/// ## Bytecode Errors
/// - [`Error::BadCode`] - Malformed or unanalyzable bytecode, with the offending position
/// - [`Error::FlowConstruction`] - Control-flow graph construction failure
/// - [`Error::Encode`] - Instruction re-encoding failure after weaving
///
/// ## Analysis Errors
/// - [`Error::Verification`] - Type-assignability or slot-invariant violation
/// - [`Error::Frame`] - Operand stack / local slot misuse inside a frame
/// - [`Error::Lookup`] - A symbolic constant-pool reference did not resolve
///
/// ## Weaving Errors
/// - [`Error::PolicyViolation`] - A staging request that has no safe rewrite
/// - [`Error::Internal`] - Internal consistency violation (pipeline bug)
#[derive(Error, Debug)]
pub enum Error {
    /// The method body is damaged or uses constructs the analyses cannot model.
    ///
    /// Carries the byte offset of the offending instruction together with the
    /// source location where the problem was detected.
    #[error("Bad code at {pos}: {message} ({file}:{line})")]
    BadCode {
        /// Description of the malformation.
        message: String,
        /// Byte offset of the offending instruction within the method body.
        pos: u32,
        /// Source file where the error was detected.
        file: &'static str,
        /// Line number where the error was detected.
        line: u32,
    },

    /// Control-flow graph construction failed.
    ///
    /// Raised for malformed exception tables, branches out of range, and code
    /// that can fall off the end of the method.
    #[error("Control flow construction failed: {0}")]
    FlowConstruction(String),

    /// A type-assignability or two-word-slot invariant was violated during analysis.
    ///
    /// The type analysis doubles as a lightweight bytecode verifier; any
    /// instruction consuming a slot whose inferred type is not assignable to the
    /// expected operand type raises this error.
    #[error("Verification failed at {pos}: {message}")]
    Verification {
        /// Description of the violated invariant.
        message: String,
        /// Byte offset of the offending instruction.
        pos: u32,
    },

    /// An operand stack or local variable slot was accessed incorrectly.
    ///
    /// Raised by [`crate::analysis::Frame`](crate::analysis::Frame) for stack
    /// underflow/overflow and for single-slot access to one half of a two-word value.
    #[error("Frame error: {0}")]
    Frame(String),

    /// A symbolic reference could not be resolved against the constant pool.
    #[error("Unresolved reference: {0}")]
    Lookup(String),

    /// A staging annotation requests a rewrite that cannot be performed safely.
    ///
    /// The canonical case is a staged field write on a receiver that has not yet
    /// been initialized; the object-construction rules leave no legal splice
    /// point for the deferred write.
    #[error("Staging policy violation at {pos}: {message}")]
    PolicyViolation {
        /// Description of the violation.
        message: String,
        /// Byte offset of the offending instruction.
        pos: u32,
    },

    /// Re-encoding the woven instruction stream failed.
    #[error("Encoding failed: {0}")]
    Encode(String),

    /// An internal consistency check failed.
    ///
    /// Unlike every other variant this is not a property of the input method: it
    /// means two analysis phases disagreed about their shared protocol (for
    /// example a materialize plan and an adjust plan registered for the same
    /// stack slot). Callers should treat it as a bug report, not skip the method.
    #[error("Internal consistency violation: {0}")]
    Internal(String),
}

impl Error {
    /// Returns `true` if this error is fatal only to the current method.
    ///
    /// Method-level errors leave the method unwoven; [`Error::Internal`] is the
    /// single process-visible variant.
    #[must_use]
    pub fn is_method_level(&self) -> bool {
        !matches!(self, Error::Internal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_code_macro_records_position() {
        let err = bad_code!(42, "unexpected opcode {:#04x}", 0xba);
        match err {
            Error::BadCode { pos, message, .. } => {
                assert_eq!(pos, 42);
                assert!(message.contains("0xba"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn internal_is_not_method_level() {
        assert!(!Error::Internal("conflicting plans".into()).is_method_level());
        assert!(Error::Frame("underflow".into()).is_method_level());
    }
}
