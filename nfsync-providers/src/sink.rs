//! Sink provider: credential handling and the two-step document upload.

use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use nfsync_core::config::SinkSettings;

use crate::credential::{Credential, CredentialCache};
use crate::error::ProviderError;

/// Token lifetime assumed when the authorization server omits `expires_in`.
pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 300;

/// Longest token lifetime or expiry margin honoured, in seconds.
pub const MAX_TOKEN_LIFETIME_SECS: i64 = 86_400;

/// Writable location returned by the upload-target request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub url: String,
}

/// Document delivery contract used by the dispatcher.
pub trait SinkClient: Send + Sync {
    /// Current bearer token, refreshed if the cached one has expired.
    fn credential(&self) -> Result<String, ProviderError>;

    /// Forget `rejected` after the sink answered 401 for it.
    fn invalidate_credential(&self, rejected: &str);

    /// True when the token is configured statically and cannot be refreshed.
    fn uses_static_token(&self) -> bool;

    /// Ask the sink for a location to write a payload of `size` bytes.
    fn request_upload_target(&self, token: &str, size: usize)
        -> Result<UploadTarget, ProviderError>;

    /// Write the raw payload to a previously obtained target.
    fn write_payload(&self, target: &UploadTarget, payload: &[u8]) -> Result<(), ProviderError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageResponse {
    url: Option<String>,
    upload_url: Option<String>,
    presigned_url: Option<String>,
}

impl StorageResponse {
    fn into_url(self) -> Option<String> {
        self.url
            .or(self.upload_url)
            .or(self.presigned_url)
            .filter(|u| !u.is_empty())
    }
}

/// Sink provider client over HTTP.
pub struct NfStockClient {
    settings: SinkSettings,
    agent: ureq::Agent,
    auth_agent: ureq::Agent,
    cache: CredentialCache,
}

impl NfStockClient {
    pub fn new(settings: SinkSettings) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build();
        let auth_agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(settings.auth_timeout_secs))
            .build();
        Self {
            settings,
            agent,
            auth_agent,
            cache: CredentialCache::new(),
        }
    }

    fn static_token(&self) -> Option<&str> {
        self.settings
            .api_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    fn exchange_client_credentials(&self) -> Result<Credential, ProviderError> {
        let (Some(auth_url), Some(client_id), Some(client_secret)) = (
            self.settings.auth_url.as_deref(),
            self.settings.client_id.as_deref(),
            self.settings.client_secret.as_deref(),
        ) else {
            return Err(ProviderError::MissingCredentials);
        };

        tracing::info!("requesting sink access token");
        let response = self.auth_agent.post(auth_url).send_form(&[
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ])?;
        let grant: TokenResponse = response
            .into_json()
            .map_err(|e| ProviderError::Decode(format!("token response: {e}")))?;
        let token = grant
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ProviderError::MalformedResponse("token response lacks access_token".into()))?;

        let lifetime = bounded_seconds(grant.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS));
        let margin = bounded_seconds(
            i64::try_from(self.settings.token_margin_secs).unwrap_or(MAX_TOKEN_LIFETIME_SECS),
        );
        let credential = Credential::from_grant(token, lifetime, margin, Utc::now());
        tracing::debug!("sink token valid until {}", credential.expires_at());
        Ok(credential)
    }
}

/// `secs` clamped to `0..=MAX_TOKEN_LIFETIME_SECS`.
fn bounded_seconds(secs: i64) -> chrono::Duration {
    chrono::Duration::seconds(secs.clamp(0, MAX_TOKEN_LIFETIME_SECS))
}

impl SinkClient for NfStockClient {
    fn credential(&self) -> Result<String, ProviderError> {
        if let Some(token) = self.static_token() {
            return Ok(token.to_owned());
        }
        self.cache.get_or_refresh(|| self.exchange_client_credentials())
    }

    fn invalidate_credential(&self, rejected: &str) {
        if self.static_token().is_some() {
            return;
        }
        if self.cache.invalidate(rejected) {
            tracing::debug!("cached sink token invalidated");
        }
    }

    fn uses_static_token(&self) -> bool {
        self.static_token().is_some()
    }

    fn request_upload_target(
        &self,
        token: &str,
        size: usize,
    ) -> Result<UploadTarget, ProviderError> {
        let url = format!("{}/storage", self.settings.base_url.trim_end_matches('/'));
        let response = self
            .agent
            .post(&url)
            .set("Authorization", &format!("Bearer {token}"))
            .send_json(json!({
                "size": size,
                "extension": self.settings.extension,
            }))?;
        let body: StorageResponse = response
            .into_json()
            .map_err(|e| ProviderError::Decode(format!("storage response: {e}")))?;
        body.into_url()
            .map(|url| UploadTarget { url })
            .ok_or_else(|| ProviderError::MalformedResponse("storage response lacks an upload URL".into()))
    }

    fn write_payload(&self, target: &UploadTarget, payload: &[u8]) -> Result<(), ProviderError> {
        self.agent
            .put(&target.url)
            .set("Content-Type", "application/xml")
            .send_bytes(payload)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_url_falls_back_across_field_names() {
        let r: StorageResponse = serde_json::from_str(r#"{"uploadUrl":"https://u"}"#).unwrap();
        assert_eq!(r.into_url().as_deref(), Some("https://u"));
        let r: StorageResponse = serde_json::from_str(r#"{"presignedUrl":"https://p"}"#).unwrap();
        assert_eq!(r.into_url().as_deref(), Some("https://p"));
        let r: StorageResponse =
            serde_json::from_str(r#"{"url":"https://a","uploadUrl":"https://b"}"#).unwrap();
        assert_eq!(r.into_url().as_deref(), Some("https://a"));
        let r: StorageResponse = serde_json::from_str(r#"{"id":7}"#).unwrap();
        assert!(r.into_url().is_none());
    }

    #[test]
    fn token_lifetimes_are_bounded() {
        assert_eq!(bounded_seconds(i64::MAX), chrono::Duration::seconds(MAX_TOKEN_LIFETIME_SECS));
        assert_eq!(bounded_seconds(-5), chrono::Duration::zero());
        assert_eq!(bounded_seconds(300), chrono::Duration::seconds(300));
    }

    #[test]
    fn static_token_short_circuits_exchange() {
        let client = NfStockClient::new(SinkSettings {
            api_token: Some("  static-token ".into()),
            ..SinkSettings::default()
        });
        assert!(client.uses_static_token());
        assert_eq!(client.credential().unwrap(), "static-token");
        client.invalidate_credential("static-token");
        assert_eq!(client.credential().unwrap(), "static-token");
    }

    #[test]
    fn missing_oauth_settings_is_reported() {
        let client = NfStockClient::new(SinkSettings {
            auth_url: Some("https://auth.invalid/token".into()),
            client_id: None,
            ..SinkSettings::default()
        });
        assert!(!client.uses_static_token());
        assert!(matches!(
            client.credential(),
            Err(ProviderError::MissingCredentials)
        ));
    }

    #[test]
    fn blank_static_token_is_ignored() {
        let client = NfStockClient::new(SinkSettings {
            api_token: Some("   ".into()),
            ..SinkSettings::default()
        });
        assert!(!client.uses_static_token());
    }
}
