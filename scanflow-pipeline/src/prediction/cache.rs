//! Reference vector cache
//!
//! Persisted as a JSON object `{ "<document type>": [f32, ...] }`. Entry
//! order is the file order and decides ties between equally similar types.

use super::similarity::cosine_similarity;
use serde_json::{Map, Value};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in embedding cache: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid embedding cache: {0}")]
    Invalid(String),
}

impl CacheError {
    /// True when the cache file does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Document type label to reference vector, in insertion order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbeddingCache {
    entries: Vec<(String, Vec<f32>)>,
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; a replaced label keeps its original position
    pub fn insert(&mut self, label: impl Into<String>, vector: Vec<f32>) {
        let label = label.into();
        match self.entries.iter_mut().find(|(l, _)| *l == label) {
            Some(entry) => entry.1 = vector,
            None => self.entries.push((label, vector)),
        }
    }

    pub fn get(&self, label: &str) -> Option<&[f32]> {
        self.entries
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, v)| v.as_slice())
    }

    pub fn labels(&self) -> Vec<String> {
        self.entries.iter().map(|(l, _)| l.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Label with the highest cosine similarity to `query`
    ///
    /// Empty vectors and vectors of a different dimension are skipped. Ties
    /// keep the earlier entry.
    pub fn best_match(&self, query: &[f32]) -> Option<(&str, f32)> {
        let mut best: Option<(&str, f32)> = None;
        for (label, vector) in &self.entries {
            if vector.is_empty() || vector.len() != query.len() {
                continue;
            }
            let score = cosine_similarity(query, vector);
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((label.as_str(), score)),
            }
        }
        best
    }

    pub fn from_json_str(content: &str) -> Result<Self, CacheError> {
        let object: Map<String, Value> = serde_json::from_str(content)?;
        let mut cache = Self::new();
        for (label, value) in object {
            let vector: Vec<f32> = serde_json::from_value(value).map_err(|e| {
                CacheError::Invalid(format!("vector for '{}' is not a list of numbers: {}", label, e))
            })?;
            cache.insert(label, vector);
        }
        Ok(cache)
    }

    pub fn to_json_string(&self) -> String {
        let mut object = Map::new();
        for (label, vector) in &self.entries {
            let values = vector.iter().map(|x| Value::from(*x as f64)).collect();
            object.insert(label.clone(), Value::Array(values));
        }
        Value::Object(object).to_string()
    }

    pub async fn load(path: &Path) -> Result<Self, CacheError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| CacheError::Io {
                path: path.display().to_string(),
                source,
            })?;
        Self::from_json_str(&content)
    }

    /// Write the cache, replacing any existing file in one rename
    pub async fn save(&self, path: &Path) -> Result<(), CacheError> {
        let io_error = |source| CacheError::Io {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, self.to_json_string())
            .await
            .map_err(io_error)?;
        tokio::fs::rename(&tmp, path).await.map_err(io_error)?;
        Ok(())
    }
}
