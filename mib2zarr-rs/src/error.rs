use std::path::PathBuf;
use std::process::ExitStatus;

/// Errors raised while converting a single raw file.
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("both zip archiving (zzip) and zip-backed container (zstore) output were requested")]
    ConflictingOutputModes,

    #[error("{} already exists. Skipping file. Pass --overwrite to convert it again", .path.display())]
    DestinationExists { path: PathBuf },

    #[error("chunk sizes must be positive, got ({nav}, {sig})")]
    InvalidChunks { nav: u64, sig: u64 },

    #[error("invalid shape for {}: {reason}", .path.display())]
    InvalidShape { path: PathBuf, reason: String },

    #[error("unsupported file format: {}", .path.display())]
    UnsupportedFormat { path: PathBuf },

    #[error("failed to load {}", .path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("archiver `{program}` exited with {status} while zipping {}", .source_path.display())]
    Archiver {
        program: String,
        status: ExitStatus,
        source_path: PathBuf,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConvertError {
    /// Configuration errors are raised before any conversion work starts.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ConvertError::ConflictingOutputModes
                | ConvertError::DestinationExists { .. }
                | ConvertError::InvalidChunks { .. }
                | ConvertError::InvalidShape { .. }
        )
    }

    /// The message followed by every underlying cause.
    pub fn report(&self) -> String {
        let mut out = self.to_string();
        let mut cause = std::error::Error::source(self);
        while let Some(e) = cause {
            out.push_str(": ");
            out.push_str(&e.to_string());
            cause = e.source();
        }
        out
    }

    pub(crate) fn load(path: impl Into<PathBuf>, source: impl Into<anyhow::Error>) -> Self {
        ConvertError::Load {
            path: path.into(),
            source: source.into(),
        }
    }
}
