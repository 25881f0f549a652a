use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while preparing data, training or translating.
#[derive(Error, Debug)]
pub enum TranslateError {
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("torch error: {0}")]
    Tch(#[from] tch::TchError),
    #[error("serde error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corpus {} contains no sentences", .0.display())]
    EmptyCorpus(PathBuf),
    #[error("parallel corpus is misaligned: {english} english vs {chinese} chinese sentences")]
    MisalignedCorpus { english: usize, chinese: usize },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("checkpoint file missing: {}", .0.display())]
    MissingCheckpoint(PathBuf),
}

impl TranslateError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TranslateError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, TranslateError>;
