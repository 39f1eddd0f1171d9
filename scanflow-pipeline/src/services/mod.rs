//! External collaborators the stages call into

pub mod embedding_client;
pub mod ocr_engine;

pub use embedding_client::{EmbeddingError, EmbeddingProvider, HttpEmbeddingClient};
pub use ocr_engine::{OcrEngine, OcrError, TesseractOcr};
