//! Error types for the timepitch crate.

use std::fmt;

/// Errors that can occur on the fallible surfaces of the crate.
///
/// Misuse of the streaming state machine (for example calling `study` after
/// processing has begun) is not an error in this sense: it is logged through
/// the `log` facade and ignored, matching the behaviour expected of a
/// real-time audio library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StretchError {
    /// Invalid time ratio or pitch scale.
    InvalidRatio(String),
    /// A study artifact could not be parsed or does not match this stretcher.
    InvalidArtifact(String),
    /// I/O error.
    IoError(String),
}

impl fmt::Display for StretchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StretchError::InvalidRatio(msg) => write!(f, "invalid ratio: {}", msg),
            StretchError::InvalidArtifact(msg) => write!(f, "invalid study artifact: {}", msg),
            StretchError::IoError(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for StretchError {}

impl From<std::io::Error> for StretchError {
    fn from(err: std::io::Error) -> Self {
        StretchError::IoError(err.to_string())
    }
}
