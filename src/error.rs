//! Error types for the in-flight chunk array.

use std::sync::Arc;

use thiserror::Error as ThisError;

/// The main error type for the engine and its transforms.
#[derive(Debug, Clone, ThisError)]
pub enum Error {
    /// `write`/`writev` was called after the engine was ended
    #[error("Write after end")]
    WriteAfterEnd,

    /// `end` was called more than once
    #[error("End called multiple times")]
    EndCalledTwice,

    /// The engine configuration was rejected at construction
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A transform or error handler failed with a user error
    #[error("Transform error: {0}")]
    Transform(Arc<dyn std::error::Error + Send + Sync>),

    /// A transform asked for its item to be abandoned without producing a value
    #[error("Transform aborted the chunk")]
    Aborted,

    /// A transform panicked while processing a chunk
    #[error("Transform panicked: {0}")]
    Panicked(String),

    /// A chunk reached a stage expecting a different input type
    #[error("Chunk type mismatch: expected {expected}")]
    ChunkType { expected: &'static str },

    /// `write` was called outside of a tokio runtime
    #[error("No tokio runtime available to process chunks")]
    NoRuntime,

    /// A channel was closed unexpectedly
    #[error("Channel was closed unexpectedly")]
    ChannelClosed,

    /// A custom error with a message
    #[error("{0}")]
    Custom(String),
}

// Convenience constructors
impl Error {
    /// Create a transform error from any error type
    pub fn transform<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Error::Transform(Arc::new(error))
    }

    /// Abort the current chunk silently.
    ///
    /// Unlike [`Outcome::Dropped`](crate::transform::Outcome::Dropped) this is an
    /// exceptional path: the rest of the chain, including any error handlers, is
    /// skipped and nothing is reported to the fault handler.
    pub fn abort() -> Self {
        Error::Aborted
    }

    /// Create a custom error with a message
    pub fn custom<S: Into<String>>(message: S) -> Self {
        Error::Custom(message.into())
    }

    /// Whether this error is the silent abort marker
    pub fn is_abort(&self) -> bool {
        matches!(self, Error::Aborted)
    }
}

// Common conversions
impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::ChannelClosed
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for Error {
    fn from(e: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Error::Transform(Arc::from(e))
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Custom(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Custom(s.to_string())
    }
}

/// Convenience type alias for Results in this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Helper trait for converting foreign errors into transform errors
pub trait IntoError<T> {
    fn into_transform_error(self) -> Result<T>;
}

impl<T, E> IntoError<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn into_transform_error(self) -> Result<T> {
        self.map_err(Error::transform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Error::WriteAfterEnd.to_string(), "Write after end");
        assert_eq!(Error::EndCalledTwice.to_string(), "End called multiple times");
        assert_eq!(Error::custom("boom").to_string(), "boom");
    }

    #[test]
    fn test_into_transform_error() {
        let parsed: Result<i32> = "x1".parse::<i32>().into_transform_error();
        assert!(matches!(parsed, Err(Error::Transform(_))));
        assert!(Error::abort().is_abort());
        assert!(!Error::ChannelClosed.is_abort());
    }
}
