//! Domain records passed between stages and collaborators

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a document under processing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub file_path: String,
    pub extracted_text: Option<String>,
    pub document_type: Option<String>,
}

impl DocumentRef {
    pub fn new(file_path: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            extracted_text: None,
            document_type: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.extracted_text = Some(text.into());
        self
    }

    pub fn with_document_type(mut self, document_type: impl Into<String>) -> Self {
        self.document_type = Some(document_type.into());
        self
    }
}

/// Outcome of classifying one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub document_type: String,
    pub is_rule_based: bool,
    /// Cosine similarity of the winning reference vector (ML path only)
    pub confidence: Option<f32>,
}

impl PredictionResult {
    pub fn rule_based(document_type: impl Into<String>) -> Self {
        Self {
            document_type: document_type.into(),
            is_rule_based: true,
            confidence: None,
        }
    }

    pub fn from_model(document_type: impl Into<String>, similarity: f32) -> Self {
        Self {
            document_type: document_type.into(),
            is_rule_based: false,
            confidence: Some(similarity),
        }
    }
}

/// A human correction of a predicted type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub file_path: String,
    pub doc_type: String,
    pub timestamp: DateTime<Utc>,
}
