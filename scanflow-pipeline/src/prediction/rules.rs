//! Ordered keyword rules
//!
//! Case-insensitive substring matching; the first rule whose keyword occurs
//! in the text decides the type.

use scanflow_common::config::KeywordRuleConfig;

pub const UNKNOWN_DOCUMENT_TYPE: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordRules {
    /// (lowercased keyword, document type), in priority order
    rules: Vec<(String, String)>,
}

impl Default for KeywordRules {
    fn default() -> Self {
        Self::from_config(&[
            KeywordRuleConfig {
                keyword: "invoice".to_string(),
                document_type: "Invoice".to_string(),
            },
            KeywordRuleConfig {
                keyword: "report".to_string(),
                document_type: "Report".to_string(),
            },
        ])
    }
}

impl KeywordRules {
    pub fn from_config(rules: &[KeywordRuleConfig]) -> Self {
        Self {
            rules: rules
                .iter()
                .map(|r| (r.keyword.to_lowercase(), r.document_type.clone()))
                .collect(),
        }
    }

    pub fn classify(&self, text: &str) -> &str {
        let text = text.to_lowercase();
        self.rules
            .iter()
            .find(|(keyword, _)| text.contains(keyword.as_str()))
            .map(|(_, document_type)| document_type.as_str())
            .unwrap_or(UNKNOWN_DOCUMENT_TYPE)
    }

    /// Types the rules can produce, in rule order without duplicates
    pub fn document_types(&self) -> Vec<String> {
        let mut types: Vec<String> = Vec::new();
        for (_, document_type) in &self.rules {
            if !types.contains(document_type) {
                types.push(document_type.clone());
            }
        }
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rules() {
        let rules = KeywordRules::default();
        assert_eq!(rules.classify("Please pay this INVOICE by Friday"), "Invoice");
        assert_eq!(rules.classify("Quarterly Report 2024"), "Report");
        assert_eq!(rules.classify("Dear Sir or Madam"), UNKNOWN_DOCUMENT_TYPE);
        assert_eq!(rules.classify(""), UNKNOWN_DOCUMENT_TYPE);
    }

    #[test]
    fn test_first_match_wins() {
        let rules = KeywordRules::default();
        assert_eq!(rules.classify("report attached to invoice"), "Invoice");
    }

    #[test]
    fn test_document_types_deduplicated() {
        let rules = KeywordRules::from_config(&[
            KeywordRuleConfig {
                keyword: "Bill".to_string(),
                document_type: "Invoice".to_string(),
            },
            KeywordRuleConfig {
                keyword: "invoice".to_string(),
                document_type: "Invoice".to_string(),
            },
        ]);
        assert_eq!(rules.document_types(), vec!["Invoice".to_string()]);
        assert_eq!(rules.classify("BILL of lading"), "Invoice");
    }
}
