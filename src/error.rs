use std::path::PathBuf;

use crate::config::ConfigError;
use crate::core::traits::sandbox::SandboxError;

#[derive(Debug, thiserror::Error)]
pub enum EvaluatorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("invalid seed data: {0}")]
    Seed(String),
}

impl EvaluatorError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EvaluatorError::Io {
            path: path.into(),
            source,
        }
    }
}
