//! Error types for vz-bridge

use thiserror::Error;

use crate::feature::Feature;

/// Result type alias using vz-bridge Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in vz-bridge operations
#[derive(Error, Debug)]
pub enum Error {
    /// The private extension point is absent on the running framework.
    ///
    /// Expected in production; callers fall back to public-only behavior.
    #[error("{feature} is not supported: {reason}")]
    UnsupportedOperation {
        /// Feature that was requested
        feature: Feature,
        /// What the probe or the receiver object was missing
        reason: String,
    },

    /// Caller passed a malformed value
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation attempted on a configuration in the wrong lifecycle state
    #[error("Precondition violated: {0}")]
    PreconditionViolated(String),

    /// A second attachment was refused under `ReattachPolicy::Reject`
    #[error("{0} is already attached to this configuration")]
    AlreadyAttached(Feature),

    /// The framework rejected a configuration or failed to construct an object
    #[error("Framework error: {0}")]
    Framework(String),

    /// Host settings errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn unsupported(feature: Feature, reason: impl Into<String>) -> Self {
        Error::UnsupportedOperation {
            feature,
            reason: reason.into(),
        }
    }

    /// Whether this error only means the capability is absent.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::UnsupportedOperation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_message_names_feature() {
        let err = Error::unsupported(Feature::DebugStubAttachment, "class missing");
        assert!(err.is_unsupported());
        assert_eq!(
            err.to_string(),
            "debug stub attachment is not supported: class missing"
        );
    }

    #[test]
    fn other_variants_are_not_unsupported() {
        assert!(!Error::InvalidArgument("x".into()).is_unsupported());
        assert!(!Error::AlreadyAttached(Feature::DebugStubAttachment).is_unsupported());
    }
}
