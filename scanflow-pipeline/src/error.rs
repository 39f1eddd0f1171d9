//! Error types for scanflow-pipeline
//!
//! Every failure a stage can produce falls into one of five classes, and
//! each class maps to exactly one broker disposition.

use crate::broker::{Disposition, TransportError};
use scanflow_common::CodecError;
use thiserror::Error;

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Broker unreachable or channel closed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Bytes could not be decoded into an envelope
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// A known message type is missing fields or has ill-typed ones
    #[error("Validation error for {message_type}: {reason}")]
    Validation {
        message_type: String,
        reason: String,
    },

    /// A collaborator (OCR, embedding, storage) failed for one document
    #[error("Domain error for {file_path}: {reason}")]
    Domain { file_path: String, reason: String },

    /// Wiring problem: cycle, unknown manager, missing collaborator
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl PipelineError {
    pub fn domain(file_path: impl Into<String>, reason: impl ToString) -> Self {
        Self::Domain {
            file_path: file_path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// What to do with the broker delivery that produced this error
    ///
    /// Validation errors normally never get here because the router turns
    /// them into feedback requests; if one does, the message is useless to
    /// retry.
    pub fn disposition(&self) -> Disposition {
        match self {
            PipelineError::Transport(_) => Disposition::Requeue,
            PipelineError::Malformed(_) => Disposition::Reject,
            PipelineError::Validation { .. } => Disposition::Ack,
            PipelineError::Domain { .. } => Disposition::Ack,
            PipelineError::Configuration(_) => Disposition::Reject,
        }
    }
}

impl From<CodecError> for PipelineError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Malformed(reason) => PipelineError::Malformed(reason),
            CodecError::Payload {
                message_type,
                reason,
            } => PipelineError::Validation {
                message_type,
                reason,
            },
            CodecError::InvalidEnvelope(reason) => PipelineError::Configuration(reason),
        }
    }
}

impl From<scanflow_common::Error> for PipelineError {
    fn from(err: scanflow_common::Error) -> Self {
        PipelineError::Configuration(err.to_string())
    }
}
