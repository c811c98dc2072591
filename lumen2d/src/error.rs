use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the lighting subsystem.
///
/// Per-frame capacity overflows are never errors; they degrade by dropping
/// the farthest lights or the excess occluders.
#[derive(Debug, Error)]
pub enum LightingError {
    #[error("light mask atlas is {width}px wide, exceeding the maximum texture size of {max}px")]
    MaskAtlasTooWide { width: u32, max: u32 },

    #[error("failed to read lighting config {path}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid lighting config")]
    ConfigParse(#[from] serde_json::Error),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, LightingError>;
