//! Error taxonomy for the dream pipeline.
//!
//! Only [`DreamError::Config`] is fatal, and only at startup. Everything a
//! single frame can go wrong with (backend failures, undecodable images) is
//! recorded against that frame's sequence number and the session carries on.

use std::time::Duration;

use thiserror::Error;

/// Convenience alias used across the library.
pub type DreamResult<T> = Result<T, DreamError>;

/// Classification of a failed Generation Backend call.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Connection refused, reset, DNS failure and similar.
    #[error("network error: {0}")]
    Network(String),

    /// The call did not complete in time (includes cold starts that overrun).
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The remote side answered with an error.
    #[error("remote error (status {status}): {message}")]
    Remote {
        /// HTTP-like status code reported by the backend
        status: u16,
        /// Body or message returned with the error
        message: String,
    },

    /// The backend answered successfully but the payload was unusable.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    /// Whether the failure is likely to go away on its own.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) => true,
            Self::Remote { status, .. } => *status == 429 || *status >= 500,
            Self::InvalidResponse(_) => false,
        }
    }
}

/// Errors surfaced by the evolver, renderer, queue and configuration layer.
#[derive(Debug, Error)]
pub enum DreamError {
    /// Bad startup parameters. Fails fast, never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// Theme key outside the known journey set.
    #[error("unknown journey '{0}' (choose from: abstract, nature, cosmic, liquid, custom)")]
    InvalidTheme(String),

    /// A single backend attempt failed; the queue retries these once.
    #[error("generation attempt failed: {0}")]
    GenerationTransient(#[from] BackendError),

    /// A frame could not be produced after retrying.
    #[error("generation failed for frame #{sequence} after {attempts} attempts: {reason}")]
    GenerationFailed {
        /// Sequence number that was skipped
        sequence: u64,
        /// How many backend calls were made for it
        attempts: u32,
        /// Last failure reported
        reason: String,
    },

    /// The backend returned bytes that are not a decodable image.
    #[error("unsupported image: {0}")]
    UnsupportedImage(String),

    /// `take()` after `stop()`.
    #[error("prefetch queue stopped")]
    QueueStopped,

    /// The bounded wait in `take()` ran out before a frame arrived.
    #[error("no frame ready after {0:?}")]
    TakeTimeout(Duration),

    /// Glue errors (I/O, terminal, serialization).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DreamError {
    /// Build a [`DreamError::Config`] from any message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Build a [`DreamError::UnsupportedImage`] from any message.
    pub fn unsupported_image(msg: impl Into<String>) -> Self {
        Self::UnsupportedImage(msg.into())
    }

    /// Whether this error describes a single lost frame rather than the end
    /// of the session.
    #[must_use]
    pub fn is_frame_level(&self) -> bool {
        matches!(
            self,
            Self::GenerationTransient(_)
                | Self::GenerationFailed { .. }
                | Self::UnsupportedImage(_)
                | Self::InvalidTheme(_)
                | Self::TakeTimeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_transient_classification() {
        assert!(BackendError::Network("reset".into()).is_transient());
        assert!(BackendError::Timeout(Duration::from_secs(5)).is_transient());
        assert!(
            BackendError::Remote {
                status: 503,
                message: "cold start".into()
            }
            .is_transient()
        );
        assert!(
            !BackendError::Remote {
                status: 400,
                message: "bad prompt".into()
            }
            .is_transient()
        );
        assert!(!BackendError::InvalidResponse("empty body".into()).is_transient());
    }

    #[test]
    fn test_generation_failed_message_names_sequence() {
        let err = DreamError::GenerationFailed {
            sequence: 7,
            attempts: 2,
            reason: "network error: reset".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("#7"));
        assert!(msg.contains("2 attempts"));
    }

    #[test]
    fn test_frame_level_errors_are_not_fatal() {
        assert!(DreamError::unsupported_image("garbage").is_frame_level());
        assert!(DreamError::InvalidTheme("jungle".into()).is_frame_level());
        assert!(!DreamError::config("capacity must be positive").is_frame_level());
        assert!(!DreamError::QueueStopped.is_frame_level());
    }

    #[test]
    fn test_backend_error_converts_to_transient() {
        let err: DreamError = BackendError::Network("refused".into()).into();
        assert!(matches!(err, DreamError::GenerationTransient(_)));
    }
}
