use thiserror::Error;

macro_rules! invariant_error {
    // Single string version
    ($msg:expr) => {
        $crate::Error::InvariantViolation {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::InvariantViolation {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

pub(crate) use invariant_error;

/// Distinct failure modes of jump-table recovery.
///
/// Each mode is reported separately so the host can distinguish a table that
/// is genuinely too large from one whose pointer computation never
/// simplified to constants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JumpTableError {
    /// The number of enumerated cases exceeded the configured cap.
    #[error("Jump table exceeded maximum of {0} cases")]
    TooManyCases(usize),

    /// The branch target never simplified to a constant for some case value.
    #[error("Jump table target not constant after simplification")]
    NotConstant,

    /// The table load fell outside any read-only region of the image.
    #[error("Jump table load outside read-only memory")]
    LoadOutsideReadonly,

    /// No switch variable could be identified in the pointer slice.
    #[error("Could not isolate a switch variable for the indirect branch")]
    NoSwitchVariable,
}

/// Which configured per-function limit was breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    /// Maximum number of instructions lifted for one function.
    Instructions,
    /// Maximum number of heritage passes.
    HeritagePasses,
    /// Maximum action-pipeline iterations.
    PipelineIterations,
    /// Maximum control-flow structuring iterations.
    StructuringIterations,
    /// Maximum rule-pool fixed-point sweeps.
    RuleIterations,
}

impl std::fmt::Display for Limit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Limit::Instructions => "instruction count",
            Limit::HeritagePasses => "heritage passes",
            Limit::PipelineIterations => "pipeline iterations",
            Limit::StructuringIterations => "structuring iterations",
            Limit::RuleIterations => "rule-pool iterations",
        };
        f.write_str(name)
    }
}

/// The generic Error type, which provides coverage for all errors this library
/// can potentially return.
///
/// Variants split into two recovery classes. Fatal-per-function errors
/// ([`Error::InvariantViolation`], [`Error::HeritageOverrun`],
/// [`Error::RestartExhausted`], [`Error::BadData`]) abort analysis of the
/// current function but leave the process healthy; the driver records the
/// error class and moves on. Recoverable errors surface as warning comments
/// collected on the function and analysis continues.
///
/// # Examples
///
/// ```rust,ignore
/// use relift::{Error, Program};
///
/// match program.decompile_at(entry) {
///     Ok(result) => println!("recovered {}", result.name()),
///     Err(Error::BadData { address }) => {
///         eprintln!("function flowed into bad data at {address}");
///     }
///     Err(e) => eprintln!("analysis failed: {e}"),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The translator could not decode an instruction at an address.
    ///
    /// Flow is truncated at the failing address; the reachable body keeps
    /// being analyzed and the function is marked as containing unimplemented
    /// or bad instructions.
    #[error("Unable to decode instruction at 0x{address:x}")]
    LiftError {
        /// Offset of the undecodable instruction
        address: u64,
    },

    /// The IR store detected a reader-list or output-binding inconsistency.
    ///
    /// This indicates a transformation broke the data-flow graph contract.
    /// The error includes the source location where the violation was
    /// detected for debugging purposes.
    ///
    /// # Fields
    ///
    /// * `message` - Description of the violated invariant
    /// * `file` - Source file where the violation was detected
    /// * `line` - Source line where the violation was detected
    #[error("Invariant violation - {file}:{line}: {message}")]
    InvariantViolation {
        /// The message to be printed for the violation
        message: String,
        /// The source file in which this error occurred
        file: &'static str,
        /// The source line in which this error occurred
        line: u32,
    },

    /// SSA refinement would have to split a storage range below one byte.
    #[error("Cannot refine access of {size} bytes at offset 0x{offset:x} below byte granularity")]
    HeritageOverrun {
        /// Offset of the unalignable access
        offset: u64,
        /// Size of the access in bytes
        size: u64,
    },

    /// A rule-pool fixed-point sweep exceeded its iteration cap.
    ///
    /// The pipeline stops and whatever state exists is emitted with a
    /// warning; this is the enforcement mechanism for oscillating rule sets.
    #[error("Rule pool did not reach a fixed point within {0} sweeps")]
    RuleNontermination(usize),

    /// The maximum number of pipeline restarts was reached.
    #[error("Analysis restarted {0} times without converging")]
    RestartExhausted(usize),

    /// Function control flow reached data that is not code.
    #[error("Flow into bad data at 0x{address:x}")]
    BadData {
        /// Offset of the bad data
        address: u64,
    },

    /// A configurable per-function resource limit was breached.
    #[error("Exceeded limit on {limit}: {value}")]
    LimitExceeded {
        /// Which limit was breached
        limit: Limit,
        /// The configured bound that was exceeded
        value: usize,
    },

    /// Jump-table recovery failed; the BRANCHIND stays unresolved.
    #[error("{0}")]
    JumpTable(#[from] JumpTableError),

    /// Architecture or option configuration was malformed at startup.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// File I/O error at the persistence boundary.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// Serialization error while saving or restoring function state.
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// Returns `true` if this error aborts analysis of the current function.
    ///
    /// Non-fatal classes become warning comments instead.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvariantViolation { .. }
                | Error::HeritageOverrun { .. }
                | Error::RestartExhausted(_)
                | Error::BadData { .. }
                | Error::LimitExceeded { .. }
                | Error::ConfigError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(invariant_error!("reader list desync").is_fatal());
        assert!(Error::RestartExhausted(5).is_fatal());
        assert!(Error::BadData { address: 0x1000 }.is_fatal());
        assert!(!Error::JumpTable(JumpTableError::NotConstant).is_fatal());
        assert!(!Error::RuleNontermination(100).is_fatal());
    }

    #[test]
    fn test_invariant_macro_formats() {
        let err = invariant_error!("slot {} of op {} empty", 2, 7);
        match err {
            Error::InvariantViolation { message, .. } => {
                assert_eq!(message, "slot 2 of op 7 empty");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_jump_table_error_display() {
        let err = JumpTableError::TooManyCases(1024);
        assert!(err.to_string().contains("1024"));
    }
}
