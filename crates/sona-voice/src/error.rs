//! Error types for the voice conversation core.

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in the voice conversation core.
///
/// Every variant is terminal for the current conversation attempt: nothing is
/// retried automatically, and the lifecycle manager funnels all of them
/// through the same teardown path. Retry is a fresh `start()`.
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Session open failed: {0}")]
    SessionOpenFailed(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Malformed audio data: {0}")]
    MalformedAudioData(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}
