//! Logical queue names and their physical (broker-side) names
//!
//! Every stage addresses queues by logical name. A deployment prefix such as
//! `dev_` is prepended when talking to the broker so that several
//! environments can share one broker without crossing streams.

pub const OCR_REQUESTS: &str = "ocr_requests";
pub const OCR_RESULTS: &str = "ocr_results";
pub const PREDICTION_REQUESTS: &str = "prediction_requests";
pub const PREDICTION_RESULTS: &str = "prediction_results";
pub const UI_FEEDBACK_REQUESTS: &str = "ui_feedback_requests";
pub const FEEDBACK_QUEUE: &str = "feedback_queue";
pub const EVENTS: &str = "events";
pub const AI_TRAINING_QUEUE: &str = "ai_training_queue";
pub const DATABASE_PACKAGING: &str = "database_packaging";
pub const TEMP_FILE_QUEUE: &str = "temp_file_queue";

/// All queues declared at startup, in declaration order
pub const ALL_QUEUES: [&str; 10] = [
    OCR_REQUESTS,
    OCR_RESULTS,
    PREDICTION_REQUESTS,
    PREDICTION_RESULTS,
    UI_FEEDBACK_REQUESTS,
    FEEDBACK_QUEUE,
    EVENTS,
    AI_TRAINING_QUEUE,
    DATABASE_PACKAGING,
    TEMP_FILE_QUEUE,
];

/// Returns true when `name` is one of the known logical queue names
pub fn is_known(name: &str) -> bool {
    ALL_QUEUES.contains(&name)
}

/// Maps logical queue names to physical names
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueNames {
    prefix: String,
}

impl QueueNames {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Physical name for a logical queue
    pub fn physical(&self, logical: &str) -> String {
        format!("{}{}", self.prefix, logical)
    }

    /// Physical names of every known queue
    pub fn all(&self) -> Vec<String> {
        ALL_QUEUES.iter().map(|q| self.physical(q)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_applied() {
        let names = QueueNames::new("dev_");
        assert_eq!(names.physical(PREDICTION_REQUESTS), "dev_prediction_requests");
        assert_eq!(QueueNames::default().physical(EVENTS), "events");
    }

    #[test]
    fn test_all_queues_unique() {
        let all = QueueNames::new("x_").all();
        assert_eq!(all.len(), 10);
        let unique: std::collections::HashSet<_> = all.iter().collect();
        assert_eq!(unique.len(), all.len());
        assert!(all.iter().all(|q| q.starts_with("x_")));
    }

    #[test]
    fn test_is_known() {
        assert!(is_known("feedback_queue"));
        assert!(!is_known("dev_feedback_queue"));
    }
}
