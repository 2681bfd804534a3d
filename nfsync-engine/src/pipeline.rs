//! Shared engine wiring used by the CLI and the daemon.

use std::path::Path;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};

use nfsync_core::config::ScheduleSettings;
use nfsync_core::{DateRange, IdentifierRegistry, LedgerStore, RunStatusStore, Settings, StoreError};
use nfsync_providers::{NfStockClient, SiegClient, SinkClient, SourceClient};

use crate::dispatcher::{DispatchOptions, UploadDispatcher};
use crate::engine::{Engine, RunRequest};

/// Build an engine over the stores in `data_dir` with the given providers.
pub fn build_engine_with(
    data_dir: &Path,
    settings: &Settings,
    source: Arc<dyn SourceClient>,
    sink: Arc<dyn SinkClient>,
) -> Engine {
    let dispatcher = UploadDispatcher::new(
        LedgerStore::at(data_dir),
        sink,
        DispatchOptions::from(&settings.dispatch),
    );
    Engine::new(
        IdentifierRegistry::at(data_dir),
        RunStatusStore::at(data_dir),
        source,
        dispatcher,
    )
    .with_concurrency(settings.dispatch.concurrency)
    .with_failure_threshold(settings.engine.failure_threshold)
}

/// Build an engine talking to the configured HTTP providers.
pub fn build_engine(data_dir: &Path, settings: &Settings) -> Engine {
    if settings.source.api_key.trim().is_empty() {
        tracing::warn!("source api_key is not configured; counts will fail");
    }
    build_engine_with(
        data_dir,
        settings,
        Arc::new(SiegClient::new(settings.source.clone())),
        Arc::new(NfStockClient::new(settings.sink.clone())),
    )
}

/// Load settings from `data_dir` and build the HTTP-backed engine.
pub fn load_engine(data_dir: &Path) -> Result<(Settings, Engine), StoreError> {
    let settings = Settings::load(data_dir)?;
    let engine = build_engine(data_dir, &settings);
    Ok((settings, engine))
}

/// Window covered by a scheduled run ending on `today`.
pub fn scheduled_range(schedule: &ScheduleSettings, today: NaiveDate) -> DateRange {
    DateRange::trailing(today, schedule.lookback_days)
}

/// Request covering every registered identifier over the scheduled window.
pub fn scheduled_request(
    registry: &IdentifierRegistry,
    schedule: &ScheduleSettings,
) -> Result<RunRequest, StoreError> {
    let identifiers = registry
        .list_all()?
        .into_iter()
        .map(|record| record.id.to_string())
        .collect();
    let range = scheduled_range(schedule, Utc::now().date_naive());
    Ok(RunRequest::new(identifiers, range))
}
