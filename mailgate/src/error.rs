use std::{io, path::PathBuf};

use mailgate_queue::PublishError;
use thiserror::Error;

/// Reasons a certificate notification could not be turned into an email.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid certificate notification: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Publish(#[from] PublishError),
}
