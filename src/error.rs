//! Failure classification for calls against the remote catalog.
//!
//! Every call returns a `RemoteError` carrying its kind, so call sites can
//! decide whether to re-issue the request without inspecting messages.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Connection reset by peer.
    Transient,
    /// Any other transport failure (DNS, timeout, TLS).
    Transport,
    /// HTTP 429.
    RateLimited,
    /// Non-2xx with a decodable service error body.
    Remote,
    /// Malformed or absent response body.
    Decode,
    /// Well-formed but semantically empty result.
    Domain,
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("transport error: {message}")]
    Transient { message: String },

    #[error("ListenBrainz rate limit hit")]
    RateLimited,

    #[error("ListenBrainz HTTP Error. Code: {code}, Error: {message}")]
    Remote { code: i64, message: String },

    #[error("failed to decode response: {message}")]
    Decode { message: String },

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("{0}")]
    Domain(String),
}

impl RemoteError {
    pub fn kind(&self) -> RemoteErrorKind {
        match self {
            RemoteError::Transient { .. } => RemoteErrorKind::Transient,
            RemoteError::RateLimited => RemoteErrorKind::RateLimited,
            RemoteError::Remote { .. } => RemoteErrorKind::Remote,
            RemoteError::Decode { .. } => RemoteErrorKind::Decode,
            RemoteError::Transport { .. } => RemoteErrorKind::Transport,
            RemoteError::Domain(_) => RemoteErrorKind::Domain,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), RemoteErrorKind::Transient | RemoteErrorKind::RateLimited)
    }

    /// Classify a transport-level failure. Only a reset connection is worth retrying.
    ///
    /// reqwest hides the io error that names the reset several sources down,
    /// so the whole source chain is searched.
    pub fn from_transport<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let message = format!("{:#}", anyhow::Error::from(err));
        if message.to_ascii_lowercase().contains("connection reset by peer") {
            RemoteError::Transient { message }
        } else {
            RemoteError::Transport { message }
        }
    }

    pub fn decode(err: impl std::fmt::Display) -> Self {
        RemoteError::Decode { message: err.to_string() }
    }
}

/// Join several item failures into one error, one line per item.
pub fn join_errors(errors: Vec<anyhow::Error>) -> Option<anyhow::Error> {
    if errors.is_empty() {
        return None;
    }
    let joined = errors
        .iter()
        .map(|e| format!("{:#}", e))
        .collect::<Vec<_>>()
        .join("\n");
    Some(anyhow::anyhow!(joined))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_reset_and_rate_limit_are_retryable() {
        assert!(RemoteError::Transient { message: "reset".into() }.is_retryable());
        assert!(RemoteError::RateLimited.is_retryable());
        assert!(!RemoteError::Remote { code: 404, message: "nope".into() }.is_retryable());
        assert!(!RemoteError::decode("eof").is_retryable());
        assert!(!RemoteError::Domain("empty".into()).is_retryable());
    }

    #[derive(Debug, Error)]
    #[error("error sending request")]
    struct SendFailed(#[source] std::io::Error);

    #[test]
    fn reset_deep_in_the_source_chain_is_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "Connection reset by peer (os error 104)");
        let err = RemoteError::from_transport(SendFailed(io));
        assert_eq!(err.kind(), RemoteErrorKind::Transient);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("error sending request: Connection reset by peer"), "{}", err);
    }

    #[test]
    fn other_transport_failures_are_fatal() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "operation timed out");
        let err = RemoteError::from_transport(SendFailed(io));
        assert_eq!(err.kind(), RemoteErrorKind::Transport);
        assert!(!err.is_retryable());
    }

    #[test]
    fn joined_errors_keep_every_message() {
        let e = join_errors(vec![anyhow::anyhow!("first"), anyhow::anyhow!("second")]).unwrap();
        assert_eq!(e.to_string(), "first\nsecond");
        assert!(join_errors(Vec::new()).is_none());
    }
}
