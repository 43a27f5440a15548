//! Error types for the entropy coding core.

use thiserror::Error;

/// Error variants surfaced at the session boundary.
///
/// Decode-side failures are reported as values; encoder-side contract
/// violations (oversized raw bits, allotment over-runs) are programming
/// errors and abort via assertions instead.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The reader ran past the end of the input. Recoverable only for the
    /// resumable ICC reader; fatal everywhere else.
    #[error("not enough bytes")]
    NotEnoughBytes,

    /// A serialized histogram is invalid: frequencies do not sum to the
    /// table size, a symbol index is out of range, or the distribution
    /// code itself is malformed.
    #[error("malformed histogram: {0}")]
    MalformedHistogram(&'static str),

    /// Context map inversion produced an out-of-range histogram index, or
    /// the histogram count exceeds the alphabet cap.
    #[error("bad context map: {0}")]
    BadContextMap(&'static str),

    /// The ANS state did not match the canonical constant after the last
    /// symbol was consumed.
    #[error("ANS final state mismatch")]
    AnsFinalStateMismatch,

    /// An ICC profile declared a size beyond the hard cap, or predictor
    /// parameters are out of range.
    #[error("ICC limit exceeded: {0}")]
    IccLimitExceeded(&'static str),

    /// The ICC command or data stream does not match the declared sizes at
    /// termination, or a command is unknown.
    #[error("inconsistent ICC stream: {0}")]
    IccInconsistent(&'static str),

    /// A decode-side buffer would grow past the session's memory budget.
    #[error("memory budget exceeded: requested {requested} bytes, {remaining} remaining")]
    MemoryLimitExceeded {
        /// Bytes the allocation asked for.
        requested: usize,
        /// Bytes left under the cap.
        remaining: usize,
    },

    /// The input to the Lehmer coder is not a permutation, or a factorial
    /// digit is out of range for its position.
    #[error("invalid permutation: {0}")]
    InvalidPermutation(&'static str),

    /// Byte-alignment padding contained non-zero bits.
    #[error("non-zero padding bits")]
    NonZeroPadding,
}

/// A specialized Result type for entropy coding operations.
pub type Result<T> = std::result::Result<T, Error>;
