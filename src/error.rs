//! Error types for pagesync

use thiserror::Error;

/// Result type for pagesync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for pagesync
#[derive(Debug, Error)]
pub enum Error {
    /// The bridge could not run a script at all
    #[error("Script error: {0}")]
    Script(String),

    /// A wait probe failed or returned something unexpected
    #[error("Probe '{probe}' failed: {message}")]
    Probe { probe: String, message: String },

    /// Installing a capability script failed
    #[error("Injection of {capability} failed: {message}")]
    Injection { capability: String, message: String },

    /// Frame/iframe not found
    #[error("Frame not found: {0}")]
    FrameNotFound(String),

    /// The scripted action itself failed
    #[error("Action '{description}' failed: {message}")]
    Action {
        description: String,
        message: String,
    },

    /// A bounded wait ran out (only raised in strict mode)
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The caller cancelled the wait
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Decode error (e.g., base64)
    #[error("Decode error: {0}")]
    Decode(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Retry exhausted
    #[error("Retry exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },
}

impl Error {
    /// Create a probe error
    pub fn probe(probe: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Probe {
            probe: probe.into(),
            message: message.into(),
        }
    }

    /// Create an injection error
    pub fn injection(capability: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Injection {
            capability: capability.into(),
            message: message.into(),
        }
    }

    /// Create an action error
    pub fn action(description: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Action {
            description: description.into(),
            message: message.into(),
        }
    }

    /// Check if this is a soft-timeout escalation
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// Check if the page context went away underneath a script
    ///
    /// Navigation destroys the execution context; drivers report it with a
    /// handful of well-known messages.
    pub fn is_context_lost(&self) -> bool {
        let message = match self {
            Error::Script(m) => m,
            Error::Probe { message, .. } => message,
            Error::Injection { message, .. } => message,
            _ => return false,
        };
        message.contains("Cannot find context")
            || message.contains("Execution context was destroyed")
            || message.contains("stale element")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_error_display() {
        let err = Error::probe("network", "window.isCallingAjax is not a function");
        assert_eq!(
            err.to_string(),
            "Probe 'network' failed: window.isCallingAjax is not a function"
        );
    }

    #[test]
    fn test_context_lost_detection() {
        assert!(Error::Script("Execution context was destroyed".into()).is_context_lost());
        assert!(Error::probe("dom", "Cannot find context with specified id").is_context_lost());
        assert!(!Error::Timeout("page load".into()).is_context_lost());
    }
}
