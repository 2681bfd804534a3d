//! Error types for the provider adapters.
//!
//! Error text ends up in logs and in the registry's `last_error`, so
//! anything derived from a request URL or response body is redacted first.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

const REDACTED: &str = "[REDACTED]";

/// `name=value` pairs whose value is a credential.
static SECRET_PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(api[_-]?key|client[_-]?secret|access[_-]?token|token)=([^&\s]+)")
        .expect("invalid secret parameter pattern")
});

/// Failures talking to the source or sink provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider answered with a non-2xx status.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Connection, DNS, TLS or timeout failure before a status was received.
    #[error("transport error: {0}")]
    Transport(String),

    /// A response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Neither a static token nor a complete client-credentials setup is configured.
    #[error("sink credentials not configured: set a static token or auth_url, client_id and client_secret")]
    MissingCredentials,

    /// A 2xx response lacked a required field.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl ProviderError {
    /// Transport status code, when the provider sent one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }
}

impl From<ureq::Error> for ProviderError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(status, response) => ProviderError::Http {
                status,
                body: redact_secrets(&response.into_string().unwrap_or_default()).into_owned(),
            },
            ureq::Error::Transport(transport) => {
                ProviderError::Transport(describe_transport(&transport))
            }
        }
    }
}

/// Transport failure text naming the request path only, never its query.
fn describe_transport(transport: &ureq::Transport) -> String {
    let mut text = transport.kind().to_string();
    if let Some(detail) = transport.message() {
        text = format!("{text}: {detail}");
    }
    if let Some(url) = transport.url() {
        text = format!("{}: {text}", url.path());
    }
    redact_secrets(&text).into_owned()
}

/// Replace credential values in `key=value` pairs.
pub(crate) fn redact_secrets(text: &str) -> Cow<'_, str> {
    SECRET_PARAM.replace_all(text, format!("${{1}}={REDACTED}").as_str())
}
