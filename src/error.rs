use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the decoder and scorer boundary.
///
/// Per-item degeneracy (zero valid timesteps, a beam that empties) is not an
/// error: it shows up as an empty result for that batch item.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("label spec is not valid UTF-8: {0}")]
    LabelSpec(#[from] std::str::Utf8Error),

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("failed to load language model from {}: {source:#}", path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("batch decode timed out after {completed} of {total} items")]
    Timeout { completed: usize, total: usize },
}

impl DecodeError {
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub(crate) fn load(path: impl Into<PathBuf>, source: anyhow::Error) -> Self {
        Self::Load {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, DecodeError>;
