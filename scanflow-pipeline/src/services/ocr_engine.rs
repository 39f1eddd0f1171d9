//! OCR collaborator
//!
//! Text extraction runs the `tesseract` command-line tool:
//! `tesseract <file> stdout -l <lang> [--tessdata-dir <dir>]`.

use async_trait::async_trait;
use scanflow_common::config::OcrConfig;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Failed to run OCR command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("OCR exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
}

#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn extract(&self, file_path: &Path) -> Result<String, OcrError>;
}

pub struct TesseractOcr {
    command: String,
    language: String,
    tessdata_dir: Option<PathBuf>,
}

impl TesseractOcr {
    pub fn new(config: &OcrConfig) -> Self {
        Self {
            command: config.tesseract_cmd.clone(),
            language: config.language.clone(),
            tessdata_dir: config.tessdata_dir.clone(),
        }
    }
}

#[async_trait]
impl OcrEngine for TesseractOcr {
    async fn extract(&self, file_path: &Path) -> Result<String, OcrError> {
        if !file_path.exists() {
            return Err(OcrError::FileNotFound(file_path.display().to_string()));
        }

        let mut command = Command::new(&self.command);
        command
            .arg(file_path)
            .arg("stdout")
            .arg("-l")
            .arg(&self.language);
        if let Some(dir) = &self.tessdata_dir {
            command.arg("--tessdata-dir").arg(dir);
        }

        debug!(file = %file_path.display(), command = %self.command, "Running OCR");
        let output = command.kill_on_drop(true).output().await?;

        if !output.status.success() {
            return Err(OcrError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file() {
        let ocr = TesseractOcr::new(&OcrConfig::default());
        let err = ocr.extract(Path::new("/no/such/scan.png")).await.unwrap_err();
        assert!(matches!(err, OcrError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn test_missing_command() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("scan.png");
        std::fs::write(&file, b"not really an image").unwrap();

        let ocr = TesseractOcr::new(&OcrConfig {
            tesseract_cmd: "scanflow-no-such-ocr-binary".to_string(),
            ..Default::default()
        });
        assert!(matches!(ocr.extract(&file).await, Err(OcrError::Spawn(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_line_shape() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("scan.png");
        std::fs::write(&file, b"x").unwrap();

        // echo prints its arguments, standing in for tesseract
        let ocr = TesseractOcr::new(&OcrConfig {
            tesseract_cmd: "echo".to_string(),
            language: "deu".to_string(),
            tessdata_dir: Some(PathBuf::from("/opt/tessdata")),
        });
        let text = ocr.extract(&file).await.unwrap();
        assert!(text.ends_with("stdout -l deu --tessdata-dir /opt/tessdata"));
        assert!(text.starts_with(&file.display().to_string()));
    }
}
