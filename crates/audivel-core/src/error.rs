//! Error types for the public operations of the two controllers and for the
//! remote conversion capability.

use thiserror::Error;

/// Why `JobController::submit` refused a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// The source cannot be resolved to a readable file or a fetchable URL.
    #[error("Invalid source: {0}")]
    InvalidSource(String),

    /// A job is already submitting or in progress on this controller.
    #[error("A conversion is already running")]
    AlreadyRunning,

    /// The conversion service has no API credentials.
    #[error("Missing API credentials")]
    MissingCredentials,
}

/// Errors reported by a `RemoteConversionClient`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Network or server trouble; the call may succeed if retried.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The service answered with an error payload.
    #[error("Service error: {0}")]
    Rejected(String),
}

impl ClientError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Transport(_))
    }
}

impl From<anyhow::Error> for ClientError {
    fn from(e: anyhow::Error) -> Self {
        ClientError::Transport(format!("{:#}", e))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlaybackError {
    /// Media metadata could not be resolved.
    #[error("Could not load audio: {0}")]
    LoadFailed(String),

    /// Seek requested while the duration is still unknown.
    #[error("Cannot seek before the audio duration is known")]
    InvalidSeekTarget,

    #[error("Playback rate must be positive, got {0}")]
    InvalidRate(f64),

    /// `load` called while another load is still resolving.
    #[error("Audio is already loading")]
    Busy,

    /// The media engine rejected a command.
    #[error("Media engine error: {0}")]
    Engine(String),
}

impl From<anyhow::Error> for PlaybackError {
    fn from(e: anyhow::Error) -> Self {
        PlaybackError::Engine(format!("{:#}", e))
    }
}
