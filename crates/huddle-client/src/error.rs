use thiserror::Error;

use huddle_feed::SourceError;
use huddle_types::api::RestErrorBody;

/// Failures while setting up a client. Request-level failures are reported
/// as [`SourceError`] through the feed seams.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("missing environment variable {0}")]
    MissingVar(&'static str),

    #[error("invalid backend url: {0}")]
    Url(#[from] url::ParseError),

    #[error("unsupported backend url scheme: {0}")]
    Scheme(String),

    #[error("http client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("realtime connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
}

pub(crate) fn transport(e: reqwest::Error) -> SourceError {
    if e.is_decode() {
        SourceError::Decode(e.to_string())
    } else {
        SourceError::Remote(e.to_string())
    }
}

/// Map a non-success response to a [`SourceError`].
pub(crate) fn rejected(status: u16, body: &str) -> SourceError {
    if status == 401 {
        return SourceError::Unauthenticated;
    }

    let parsed: RestErrorBody = serde_json::from_str(body).unwrap_or_default();
    let Some(mut message) = parsed.message else {
        return SourceError::Rejected {
            status,
            message: body.chars().take(200).collect(),
        };
    };
    if let Some(code) = parsed.code {
        message = format!("{} ({})", message, code);
    }
    if let Some(hint) = parsed.hint.filter(|h| !h.is_empty()) {
        message = format!("{}, hint: {}", message, hint);
    }
    SourceError::Rejected { status, message }
}
