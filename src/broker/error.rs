//! Errors surfaced by the connection broker.
//!
//! Only two failures ever reach a caller. Cache problems and close errors
//! are absorbed inside the broker and never show up here.

// Rust guideline compliant 2026-02

use std::io;

/// Failure to obtain the daemon gate or its connection.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The gate is held by someone else.
    ///
    /// Returned both for an immediate non-blocking refusal and for a blocking
    /// wait that ran out of time. Callers should not tell the two apart; the
    /// expected reaction is to show cached data.
    #[error("daemon connection is busy (held by {})", holder.as_deref().unwrap_or("unknown"))]
    Busy {
        /// Holder observed at the moment of refusal, for diagnostics only.
        holder: Option<String>,
    },

    /// The gate was obtained but connecting to the daemon failed.
    ///
    /// The gate has already been released when this reaches the caller.
    #[error("cannot reach daemon at {target}: {source}")]
    ConnectionFailed {
        /// `host:port` that was dialed.
        target: String,
        /// Underlying transport error.
        #[source]
        source: io::Error,
    },
}

impl BrokerError {
    /// Returns `true` for [`BrokerError::Busy`].
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }

    /// Returns `true` for [`BrokerError::ConnectionFailed`].
    pub fn is_connection_failed(&self) -> bool {
        matches!(self, Self::ConnectionFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_message_names_holder() {
        let err = BrokerError::Busy {
            holder: Some("web-ui".to_string()),
        };
        assert!(err.is_busy());
        assert!(!err.is_connection_failed());
        assert_eq!(err.to_string(), "daemon connection is busy (held by web-ui)");
    }

    #[test]
    fn test_busy_message_without_holder() {
        let err = BrokerError::Busy { holder: None };
        assert_eq!(err.to_string(), "daemon connection is busy (held by unknown)");
    }

    #[test]
    fn test_connection_failed_keeps_source() {
        let err = BrokerError::ConnectionFailed {
            target: "127.0.0.1:4403".to_string(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert!(err.is_connection_failed());
        assert!(err.to_string().contains("127.0.0.1:4403"));
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("refused"));
    }
}
