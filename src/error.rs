//! Error taxonomy for the orchestration engine.
//!
//! Two layers of errors exist:
//!
//! - [`ExpandError`] covers target ingestion: a single bad line rejects the
//!   whole batch before any state is created.
//! - [`ControlError`] covers every control-surface operation. Callers
//!   projecting this onto a transport can map [`ControlError::Input`] to a
//!   bad-request, the not-found variants to a missing-resource response and
//!   [`ControlError::InvalidState`] to a conflict.
//!
//! Per-host scanner failures are deliberately *not* errors at this level;
//! they are recorded as `ok = false` outcomes and the chunk keeps going.

use thiserror::Error;
use uuid::Uuid;

use crate::chunk::ChunkStatus;

/// Rejection reasons produced while expanding raw target lines.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpandError {
    /// A range line `A-B` where `B` precedes `A`.
    #[error("range end precedes range start in `{line}`")]
    InvalidRange { line: String },

    /// A single line would expand past the configured address limit.
    #[error("`{line}` expands to {count} addresses, above the limit of {max}")]
    ExpansionTooLarge {
        line: String,
        count: u128,
        max: usize,
    },

    /// A line that is neither an address, a CIDR block, a range, nor a
    /// plausible hostname.
    #[error("cannot parse `{line}` as an address, CIDR block, range or hostname")]
    MalformedLine { line: String },
}

/// Errors surfaced by the control surface.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Malformed caller input. No state was changed.
    #[error("invalid input: {0}")]
    Input(String),

    /// The referenced chunk does not exist.
    #[error("unknown chunk {0}")]
    UnknownChunk(Uuid),

    /// The chunk exists but no artifact was recorded for the address.
    #[error("no scan result for {address} in chunk {chunk_id}")]
    MissingResult { chunk_id: Uuid, address: String },

    /// The requested operation is not legal from the chunk's current
    /// status. No mutation happened.
    #[error("chunk {id} is {status}, {operation} is not allowed")]
    InvalidState {
        id: Uuid,
        status: ChunkStatus,
        operation: &'static str,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ControlError {
    /// True for the variants a transport layer should answer with a
    /// missing-resource status.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ControlError::UnknownChunk(_) | ControlError::MissingResult { .. }
        )
    }
}

impl From<ExpandError> for ControlError {
    fn from(err: ExpandError) -> Self {
        ControlError::Input(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_errors_render_the_offending_line() {
        let err = ExpandError::InvalidRange {
            line: "10.0.0.9-10.0.0.1".to_string(),
        };
        assert!(err.to_string().contains("10.0.0.9-10.0.0.1"));

        let err = ExpandError::ExpansionTooLarge {
            line: "10.0.0.0/8".to_string(),
            count: 16_777_214,
            max: 65_536,
        };
        assert!(err.to_string().contains("16777214"));
    }

    #[test]
    fn expand_errors_convert_to_input_errors() {
        let err: ControlError = ExpandError::MalformedLine {
            line: "???".to_string(),
        }
        .into();
        assert!(matches!(err, ControlError::Input(_)));
        assert!(!err.is_not_found());
    }

    #[test]
    fn not_found_classification() {
        assert!(ControlError::UnknownChunk(Uuid::new_v4()).is_not_found());
        assert!(
            ControlError::MissingResult {
                chunk_id: Uuid::new_v4(),
                address: "10.0.0.1".to_string(),
            }
            .is_not_found()
        );
        assert!(!ControlError::Input("nope".to_string()).is_not_found());
    }
}
