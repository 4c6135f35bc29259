//! Error types and result aliases shared across Sluice crates.
//!
//! Engine-level failures live in `sluice_flow::error` and wrap this type.

/// The result type used throughout Sluice primitives.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when working with Sluice primitives.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },
}

impl Error {
    /// Creates a new invalid identifier error.
    #[must_use]
    pub fn invalid_id(message: impl Into<String>) -> Self {
        Self::InvalidId {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_id_display() {
        let err = Error::invalid_id("invalid consumer ID 'x': bad length");
        let msg = err.to_string();
        assert!(msg.starts_with("invalid identifier"));
        assert!(msg.contains("consumer ID"));
    }
}
