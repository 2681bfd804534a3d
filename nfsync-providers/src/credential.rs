//! Sink access credentials and their cache.
//!
//! [`CredentialCache::get_or_refresh`] holds the cache lock across the token
//! exchange: when several upload workers find the cache empty at once, one
//! performs the exchange and the rest reuse its result.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};

use crate::error::ProviderError;

/// A bearer token with its effective expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// Token granted at `now` for `lifetime`, expiring `margin` early.
    ///
    /// An expiry that cannot be represented collapses to `now`, which makes
    /// the credential immediately stale rather than panicking.
    pub fn from_grant(
        token: impl Into<String>,
        lifetime: Duration,
        margin: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let expires_at = lifetime
            .checked_sub(&margin)
            .and_then(|effective| now.checked_add_signed(effective))
            .unwrap_or(now);
        Self::new(token, expires_at)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Single-slot credential cache.
#[derive(Debug, Default)]
pub struct CredentialCache {
    slot: Mutex<Option<Credential>>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached token if still valid, otherwise the token from `refresh`.
    pub fn get_or_refresh(
        &self,
        refresh: impl FnOnce() -> Result<Credential, ProviderError>,
    ) -> Result<String, ProviderError> {
        let mut slot = self.lock();
        if let Some(cached) = slot.as_ref().filter(|c| c.is_valid(Utc::now())) {
            return Ok(cached.token.clone());
        }
        let fresh = refresh()?;
        let token = fresh.token.clone();
        *slot = Some(fresh);
        Ok(token)
    }

    /// Drop the cached credential if it is still the `rejected` token.
    ///
    /// Returns whether anything was cleared. A worker reporting a 401 for a
    /// token another worker already replaced leaves the newer one in place.
    pub fn invalidate(&self, rejected: &str) -> bool {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|c| c.token == rejected) {
            *slot = None;
            true
        } else {
            false
        }
    }

    pub fn cached(&self) -> Option<Credential> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Credential>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
