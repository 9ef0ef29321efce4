//! Error types shared across the relay.

use thiserror::Error;

/// Failure inside a backend invoker.
///
/// The `Display` form is what travels to the UI as the `error` field of a
/// stream update, so the sentinel variants render as their bare codes and
/// the client-side reducer expands them into guidance text.
#[derive(Error, Debug)]
pub enum InvokeError {
    /// Missing or rejected credentials for the selected backend.
    #[error("UNAUTHORIZED")]
    Unauthorized,

    /// The provider interposed a security check before the API.
    #[error("CLOUDFLARE")]
    SecurityCheck,

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("stream decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    /// Error body returned by a provider API, passed through verbatim.
    #[error("{0}")]
    Api(String),

    /// No registered invoker predicate matched the session's configuration.
    #[error("no configured backend matches model '{0}'")]
    UnsupportedModel(String),

    #[error(transparent)]
    Channel(#[from] ChannelClosed),
}

/// The real channel is gone: the consumer disconnected mid-stream.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("channel closed")]
pub struct ChannelClosed;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_errors_display_as_bare_codes() {
        assert_eq!(InvokeError::Unauthorized.to_string(), "UNAUTHORIZED");
        assert_eq!(InvokeError::SecurityCheck.to_string(), "CLOUDFLARE");
    }

    #[test]
    fn unsupported_model_names_the_model() {
        let err = InvokeError::UnsupportedModel("gpt-9".to_string());
        assert!(err.to_string().contains("gpt-9"));
    }
}
