use std::time::Duration;

use thiserror::Error;

/// An error that happens when fetching a payload from the proxy.
///
/// The error is shared between all callers waiting on the same fetch, hence it is [`Clone`] and
/// carries its details as strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// No response arrived within the timeout of the endpoint class.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// The proxy answered with a non-success status code.
    #[error("unexpected status code: {0}")]
    HttpError(u16),
    /// The request failed on the transport level, like connection loss or DNS resolution.
    #[error("network error: {0}")]
    NetworkError(String),
    /// The fetch was cancelled through its cancellation token.
    ///
    /// This is the result of a caller superseding its own request and is no user-facing error.
    #[error("cancelled")]
    Cancelled,
    /// The fetch task went away without producing a result, for example because the runtime is
    /// shutting down.
    #[error("aborted")]
    Aborted,
    /// The response could not be decoded into the payload of the endpoint.
    #[error("malformed payload: {0}")]
    Malformed(String),
    /// The proxy answered, but reported that its upstream request failed.
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl FetchError {
    /// Whether this error is the result of a cancellation, which callers treat as a no-op.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// A short, stable name of the error kind for metrics tags.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::HttpError(_) => "http",
            Self::NetworkError(_) => "network",
            Self::Cancelled => "cancelled",
            Self::Aborted => "aborted",
            Self::Malformed(_) => "malformed",
            Self::Upstream(_) => "upstream",
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::HttpError(status.as_u16());
        }
        if err.is_decode() {
            return Self::Malformed(err.to_string());
        }
        Self::NetworkError(err.to_string())
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_cancelled_is_cancelled() {
        struct TestCase {
            input: FetchError,
            expected: bool,
        }

        let tests = vec![
            TestCase {
                input: FetchError::Cancelled,
                expected: true,
            },
            TestCase {
                input: FetchError::Aborted,
                expected: false,
            },
            TestCase {
                input: FetchError::Timeout(Duration::from_secs(8)),
                expected: false,
            },
            TestCase {
                input: FetchError::HttpError(503),
                expected: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            assert_eq!(test.input.is_cancelled(), test.expected, "TC{index} failed");
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(
            FetchError::Timeout(Duration::from_secs(8)).to_string(),
            "request timed out after 8s"
        );
        assert_eq!(
            FetchError::HttpError(502).to_string(),
            "unexpected status code: 502"
        );
    }

    #[test]
    fn test_from_json_error() {
        let err = serde_json::from_str::<u32>("not json").unwrap_err();
        assert!(matches!(FetchError::from(err), FetchError::Malformed(_)));
    }
}
