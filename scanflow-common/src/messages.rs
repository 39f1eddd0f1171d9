//! Message types exchanged between pipeline stages
//!
//! Each message type has a constant name, a list of fields that must be
//! present (and non-null) before a handler is invoked, and a typed payload
//! for the `data` object.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const OCR_REQUEST: &str = "OCR_REQUEST";
pub const OCR_COMPLETED: &str = "OCR_COMPLETED";
pub const OCR_FAILED: &str = "OCR_FAILED";
pub const PREDICT_DOCUMENT_TYPE: &str = "PREDICT_DOCUMENT_TYPE";
pub const PREDICT_DOCUMENT_TYPE_RESULT: &str = "PREDICT_DOCUMENT_TYPE_RESULT";
pub const UI_FEEDBACK_REQUEST: &str = "UI_FEEDBACK_REQUEST";
pub const SAVE_FEEDBACK: &str = "SAVE_FEEDBACK";
pub const TRAINING_SAMPLE: &str = "TRAINING_SAMPLE";
pub const START_TRAINING: &str = "START_TRAINING";
pub const TRAINING_COMPLETED: &str = "TRAINING_COMPLETED";
pub const TRAINING_FAILED: &str = "TRAINING_FAILED";
pub const REQUEST_FEEDBACK: &str = "REQUEST_FEEDBACK";

/// Fields that must be present in `data` for a message type
///
/// Unknown types have no requirements; the router decides what to do with
/// them before this is consulted.
pub fn required_fields(message_type: &str) -> &'static [&'static str] {
    match message_type {
        OCR_REQUEST => &["file_path"],
        OCR_COMPLETED => &["file_path", "extracted_text"],
        OCR_FAILED => &["file_path", "error_message"],
        PREDICT_DOCUMENT_TYPE => &["text", "file_path"],
        PREDICT_DOCUMENT_TYPE_RESULT => &["file_path", "document_type", "is_rule_based"],
        UI_FEEDBACK_REQUEST => &["file_path", "predicted_type"],
        SAVE_FEEDBACK => &["file_path", "doc_type"],
        TRAINING_SAMPLE => &["file_path", "doc_type", "timestamp"],
        START_TRAINING => &["sample_count"],
        TRAINING_COMPLETED => &[],
        TRAINING_FAILED => &["error_message"],
        REQUEST_FEEDBACK => &["original_message", "error_reason"],
        _ => &[],
    }
}

/// Typed `data` object of a message
pub trait Payload: Serialize + DeserializeOwned {
    const MESSAGE_TYPE: &'static str;
}

macro_rules! payload {
    ($ty:ty, $name:expr) => {
        impl Payload for $ty {
            const MESSAGE_TYPE: &'static str = $name;
        }
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrRequest {
    pub file_path: String,
}
payload!(OcrRequest, OCR_REQUEST);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrCompleted {
    pub file_path: String,
    pub extracted_text: String,
}
payload!(OcrCompleted, OCR_COMPLETED);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrFailed {
    pub file_path: String,
    pub error_message: String,
}
payload!(OcrFailed, OCR_FAILED);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictDocumentType {
    pub text: String,
    pub file_path: String,
}
payload!(PredictDocumentType, PREDICT_DOCUMENT_TYPE);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictDocumentTypeResult {
    pub file_path: String,
    pub document_type: String,
    pub is_rule_based: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}
payload!(PredictDocumentTypeResult, PREDICT_DOCUMENT_TYPE_RESULT);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiFeedbackRequest {
    pub file_path: String,
    pub predicted_type: String,
    /// Types the user may pick from, when storage knows them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_types: Option<Vec<String>>,
}
payload!(UiFeedbackRequest, UI_FEEDBACK_REQUEST);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveFeedback {
    pub file_path: String,
    pub doc_type: String,
}
payload!(SaveFeedback, SAVE_FEEDBACK);

/// A user correction forwarded to the training collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSample {
    pub file_path: String,
    pub doc_type: String,
    pub timestamp: DateTime<Utc>,
}
payload!(TrainingSample, TRAINING_SAMPLE);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartTraining {
    pub sample_count: usize,
    pub requested_at: DateTime<Utc>,
}
payload!(StartTraining, START_TRAINING);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingCompleted {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training_metrics: Option<Value>,
}
payload!(TrainingCompleted, TRAINING_COMPLETED);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingFailed {
    pub error_message: String,
}
payload!(TrainingFailed, TRAINING_FAILED);

/// Emitted when a message could not be routed to a handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFeedback {
    /// The offending envelope as JSON (or the raw body as a string when it
    /// could not be decoded)
    pub original_message: Value,
    pub error_reason: String,
    pub timestamp: DateTime<Utc>,
}
payload!(RequestFeedback, REQUEST_FEEDBACK);
