//! Settings loading.
//!
//! Layering: built-in defaults → `<data_dir>/config.yaml` (optional) →
//! `NFSYNC_*` environment variables. Every section is `#[serde(default)]`,
//! so a config file only needs the keys it overrides.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{io_err, StoreError};
use crate::paths::config_path;

/// Largest page the source provider accepts.
pub const MAX_SOURCE_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub schedule: ScheduleSettings,
    pub source: SourceSettings,
    pub sink: SinkSettings,
    pub dispatch: DispatchSettings,
    pub engine: EngineSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    pub lookback_days: u64,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 4 * 60 * 60,
            lookback_days: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub base_url: String,
    pub api_key: String,
    pub page_size: usize,
    pub timeout_secs: u64,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.sieg.com".to_string(),
            api_key: String::new(),
            page_size: MAX_SOURCE_PAGE_SIZE,
            timeout_secs: 120,
        }
    }
}

impl SourceSettings {
    /// Configured page size clamped to `1..=MAX_SOURCE_PAGE_SIZE`.
    pub fn effective_page_size(&self) -> usize {
        self.page_size.clamp(1, MAX_SOURCE_PAGE_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkSettings {
    pub base_url: String,
    /// Static bearer token. When set, the OAuth exchange is never used.
    pub api_token: Option<String>,
    pub auth_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub timeout_secs: u64,
    pub auth_timeout_secs: u64,
    /// Subtracted from the provider-reported token lifetime.
    pub token_margin_secs: u64,
    pub extension: String,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            base_url: "https://ms-importacao-service-nfstock.alterdatasoftware.com.br".to_string(),
            api_token: None,
            auth_url: None,
            client_id: None,
            client_secret: None,
            timeout_secs: 60,
            auth_timeout_secs: 15,
            token_margin_secs: 30,
            extension: ".xml".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_unit_ms: u64,
    /// Persist the ledger after this many successful uploads.
    pub flush_every: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            concurrency: 5,
            max_attempts: 3,
            backoff_unit_ms: 1000,
            flush_every: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Identifiers with this many consecutive failures are skipped.
    pub failure_threshold: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
        }
    }
}

impl Settings {
    /// Load `<data_dir>/config.yaml` and apply the process environment.
    pub fn load(data_dir: &Path) -> Result<Self, StoreError> {
        let mut settings = Self::load_file(&config_path(data_dir))?;
        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Parse a YAML config file; a missing file yields the defaults.
    pub fn load_file(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&contents).map_err(|e| StoreError::Parse {
            path: PathBuf::from(path),
            source: e,
        })
    }

    /// Overlay `NFSYNC_*` variables read through `lookup`.
    ///
    /// Unparseable numeric values are ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("NFSYNC_SOURCE_BASE_URL") {
            self.source.base_url = v;
        }
        if let Some(v) = get("NFSYNC_SOURCE_API_KEY") {
            self.source.api_key = v;
        }
        if let Some(v) = get("NFSYNC_SINK_BASE_URL") {
            self.sink.base_url = v;
        }
        if let Some(v) = get("NFSYNC_SINK_API_TOKEN") {
            self.sink.api_token = Some(v);
        }
        if let Some(v) = get("NFSYNC_SINK_AUTH_URL") {
            self.sink.auth_url = Some(v);
        }
        if let Some(v) = get("NFSYNC_SINK_CLIENT_ID") {
            self.sink.client_id = Some(v);
        }
        if let Some(v) = get("NFSYNC_SINK_CLIENT_SECRET") {
            self.sink.client_secret = Some(v);
        }

        if let Some(v) = get("NFSYNC_SOURCE_PAGE_SIZE") {
            match v.parse::<usize>() {
                Ok(n) => self.source.page_size = n,
                Err(err) => tracing::warn!("invalid NFSYNC_SOURCE_PAGE_SIZE, ignoring: {err}"),
            }
        }
        if let Some(v) = get("NFSYNC_CONCURRENCY") {
            match v.parse::<usize>() {
                Ok(n) => self.dispatch.concurrency = n.max(1),
                Err(err) => tracing::warn!("invalid NFSYNC_CONCURRENCY, ignoring: {err}"),
            }
        }
        if let Some(v) = get("NFSYNC_SCHEDULE_INTERVAL_SECS") {
            match v.parse::<u64>() {
                Ok(n) => self.schedule.interval_secs = n,
                Err(err) => {
                    tracing::warn!("invalid NFSYNC_SCHEDULE_INTERVAL_SECS, ignoring: {err}")
                }
            }
        }
    }
}
