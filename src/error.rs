use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ir::BlockKind;

/// Book-level failure raised before any chapter is processed.
#[derive(Debug, Error)]
pub enum SegmentationError {
    #[error("invalid epub package: {0}")]
    Package(String),
    #[error("missing entry in package: {0}")]
    MissingEntry(String),
    #[error("malformed document {name}: {detail}")]
    Document { name: String, detail: String },
    #[error("chapter ordinal {found} out of sequence (expected {expected})")]
    Ordinal { expected: u32, found: u32 },
    #[error("chapter {ordinal}: block index {found} out of sequence (expected {expected})")]
    BlockIndex {
        ordinal: u32,
        expected: usize,
        found: usize,
    },
    #[error("book has no translatable chapters")]
    Empty,
}

/// Failure of an external AI call.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum InvokeError {
    #[error("service error: {0}")]
    Service(String),
    #[error("service timed out after {0:?}")]
    Timeout(Duration),
    #[error("content policy rejection: {0}")]
    ContentPolicy(String),
    #[error("malformed service output: {0}")]
    Malformed(String),
    /// The service refused the request itself (auth, unknown model, oversized input).
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl InvokeError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Service(_) | Self::Timeout(_))
    }

    /// Repeating the same request cannot succeed.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStage {
    Translation,
    Edit,
}

impl fmt::Display for ValidationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Translation => f.write_str("translation"),
            Self::Edit => f.write_str("edit"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum MismatchReason {
    Count,
    Order { found: usize },
    Kind { expected: BlockKind, found: BlockKind },
    Emptied,
    Contaminated { marker: String },
}

/// Structural disagreement between a source block sequence and a candidate.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error(
    "{stage} mismatch: expected {expected_count} blocks, got {actual_count} ({})",
    describe(.first_diverging_index, .reason)
)]
pub struct MismatchError {
    pub stage: ValidationStage,
    pub expected_count: usize,
    pub actual_count: usize,
    pub first_diverging_index: Option<usize>,
    pub reason: MismatchReason,
}

fn describe(index: &Option<usize>, reason: &MismatchReason) -> String {
    let at = index.map(|i| format!(" at block {i}")).unwrap_or_default();
    match reason {
        MismatchReason::Count => format!("block count differs{at}"),
        MismatchReason::Order { found } => format!("out of order{at}, found block {found}"),
        MismatchReason::Kind { expected, found } => {
            format!("kind {found} where {expected} was expected{at}")
        }
        MismatchReason::Emptied => format!("non-empty block became empty{at}"),
        MismatchReason::Contaminated { marker } => format!("leaked `{marker}`{at}"),
    }
}

impl MismatchError {
    /// Instruction text handed back to the translator on the next attempt.
    #[must_use]
    pub fn feedback(&self) -> String {
        let mut out = format!(
            "The previous answer was rejected: {self}.\nReturn exactly {} blocks, one per input block, in the same order.",
            self.expected_count
        );
        if let Some(i) = self.first_diverging_index {
            out.push_str(&format!(
                "\nCheck block {i} in particular; do not merge, split, drop or leave it empty."
            ));
        }
        out
    }
}

/// The snapshot a chapter worked against is no longer current.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("snapshot version {used} is stale (current is {current})")]
pub struct ConflictError {
    pub used: u64,
    pub current: u64,
}

/// Entries committed after a draft's snapshot that the draft could not have honoured.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("draft predates committed entries used by this chapter: {}", .terms.join(", "))]
pub struct StaleDraft {
    pub terms: Vec<String>,
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("corrupt checkpoint {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("checkpoint {path} belongs to book {found}, not {expected}")]
    ForeignBook {
        path: PathBuf,
        expected: String,
        found: String,
    },
    #[error("checkpoint io on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encode checkpoint: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Why one attempt at a chapter ended in `Failed`.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum FailureReason {
    #[error(transparent)]
    Invoke(#[from] InvokeError),
    #[error(transparent)]
    Mismatch(#[from] MismatchError),
    #[error("gave up after {retries} snapshot conflicts: {last}")]
    ConflictsExhausted { retries: u32, last: String },
    #[error("checkpoint write failed: {0}")]
    Checkpoint(String),
    #[error("cancelled")]
    Cancelled,
}

impl FailureReason {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Invoke(e) => e.is_transient(),
            Self::Checkpoint(_) => true,
            _ => false,
        }
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Invoke(e) => e.is_fatal(),
            Self::Cancelled => true,
            _ => false,
        }
    }
}
