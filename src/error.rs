use std::io;

use thiserror::Error;

/// Failures surfaced by the capture, annotation and streaming pipeline.
///
/// Control-plane operations return these as values; none of them are fatal to
/// the process.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Camera could not be opened or stopped delivering frames.
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),
    /// Detector model is missing or failed to initialise.
    #[error("detection model unavailable: {0}")]
    ModelUnavailable(String),
    /// A frame could not be converted to its transport encoding.
    #[error("frame encoding failed: {0}")]
    EncodingFailure(String),
    /// Operation is not valid in the current session state.
    #[error("invalid session state: {0}")]
    InvalidStateTransition(&'static str),
    /// A viewer went away or stopped reading.
    #[error("client disconnected: {0}")]
    ClientDisconnected(#[source] io::Error),
}

impl StreamError {
    pub fn device(err: impl std::fmt::Display) -> Self {
        StreamError::DeviceUnavailable(err.to_string())
    }

    pub fn model(err: impl std::fmt::Display) -> Self {
        StreamError::ModelUnavailable(err.to_string())
    }
}

pub type StreamResult<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_failure() {
        assert_eq!(
            StreamError::device("no /dev/video0").to_string(),
            "camera unavailable: no /dev/video0"
        );
        assert_eq!(
            StreamError::InvalidStateTransition("camera is not running").to_string(),
            "invalid session state: camera is not running"
        );
        let err = StreamError::ClientDisconnected(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "pipe",
        ));
        assert!(err.to_string().starts_with("client disconnected"));
    }
}
