//! Error types and result aliases for Vestibule.
//!
//! Failures surface as explicit result values; the hot path never logs and
//! scripts never raise — every defensive branch inside the data plane has a
//! defined fallback, so the variants here describe client-side failures.

/// The result type used throughout Vestibule.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in admission operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The backing store could not be reached, or a command timed out.
    ///
    /// Not retried inside the core; callers typically fail open (admit) or
    /// serve a cached waiting page.
    #[error("transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An embedded server-side script could not be read at registration time.
    #[error("script missing: {script}")]
    ScriptMissing {
        /// Name of the script that could not be loaded.
        script: String,
    },

    /// The synchronization keys for a prefix are absent and could not be
    /// re-seeded, so the queue/store state cannot be trusted.
    #[error("prefix not initialized: {prefix}")]
    Uninitialized {
        /// The key prefix that is missing its sync keys.
        prefix: String,
    },

    /// An invalid session identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// A store-capacity value could not be parsed as an integer ≥ -1.
    #[error("store capacity out of range: {0}")]
    CapacityOutOfRange(String),

    /// A queue-enabled value was something other than 0 or 1.
    #[error("queue enabled flag out of range: {0}")]
    EnabledOutOfRange(String),

    /// A payload on the events channel did not match the event taxonomy.
    #[error("unknown admission event: {0}")]
    UnknownEvent(String),

    /// A server-side script returned a value outside its contract.
    #[error("unexpected reply from \"{script}\": {message}")]
    UnexpectedReply {
        /// Name of the script that replied.
        script: String,
        /// Description of the malformed value.
        message: String,
    },
}

impl Error {
    /// Creates a new transport error with the given message.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new transport error with a source cause.
    #[must_use]
    pub fn transport_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new unexpected-reply error for the named script.
    #[must_use]
    pub fn unexpected_reply(script: &str, message: impl Into<String>) -> Self {
        Self::UnexpectedReply {
            script: script.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn transport_display() {
        let err = Error::transport("connection refused");
        assert!(err.to_string().contains("transport error"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn transport_with_source_keeps_cause() {
        let source = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let err = Error::transport_with_source("pool acquire failed", source);
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn unexpected_reply_display() {
        let err = Error::unexpected_reply("id_position", "status 7");
        assert!(err.to_string().contains("id_position"));
        assert!(err.to_string().contains("status 7"));
    }

    #[test]
    fn capacity_display() {
        let err = Error::CapacityOutOfRange("-2".into());
        assert!(err.to_string().contains("-2"));
    }
}
