//! Synchronization engine: one run over a set of identifiers and a date
//! range.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use nfsync_core::types::normalize_digits;
use nfsync_core::{
    CheckResult, DateRange, IdentifierRecord, IdentifierRegistry, RunStatus, RunStatusStore,
    RunSummary, TaxId,
};
use nfsync_providers::SourceClient;

use crate::dispatcher::UploadDispatcher;
use crate::error::SyncError;
use crate::state::{ProcessingState, RunPermit, SharedState};

/// Identifiers with at least this many consecutive failures are skipped.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Parameters of one run. Both fields are required.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub identifiers: Option<Vec<String>>,
    pub range: Option<DateRange>,
}

impl RunRequest {
    pub fn new(identifiers: Vec<String>, range: DateRange) -> Self {
        Self {
            identifiers: Some(identifiers),
            range: Some(range),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.identifiers.is_some() && self.range.is_some()
    }
}

/// What a finished run reports back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub summary: RunSummary,
    /// Identifiers that were skipped for repeated failures or ended in error.
    pub identifiers_in_error: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(RunReport),
    AlreadyRunning,
    MissingParameters,
    NoValidIdentifiers,
}

/// Per-identifier contribution to the run summary.
#[derive(Debug, Default)]
struct IdentifierTally {
    found: u64,
    sent: u64,
    failed: u64,
    skipped: u64,
}

pub struct Engine {
    registry: IdentifierRegistry,
    status: RunStatusStore,
    source: Arc<dyn SourceClient>,
    dispatcher: UploadDispatcher,
    concurrency: usize,
    failure_threshold: u32,
    state: SharedState,
}

impl Engine {
    pub fn new(
        registry: IdentifierRegistry,
        status: RunStatusStore,
        source: Arc<dyn SourceClient>,
        dispatcher: UploadDispatcher,
    ) -> Self {
        Self {
            registry,
            status,
            source,
            dispatcher,
            concurrency: 1,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            state: SharedState::new(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Identifiers with at least this many consecutive failures are skipped.
    /// Clamped to 1 so a healthy identifier is never skipped.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn registry(&self) -> &IdentifierRegistry {
        &self.registry
    }

    pub fn status_store(&self) -> &RunStatusStore {
        &self.status
    }

    pub fn dispatcher(&self) -> &UploadDispatcher {
        &self.dispatcher
    }

    pub fn shared_state(&self) -> &SharedState {
        &self.state
    }

    pub fn processing_state(&self) -> ProcessingState {
        self.state.snapshot()
    }

    /// Claim the run slot without starting anything.
    pub fn try_begin(&self) -> Option<RunPermit> {
        self.state.try_acquire()
    }

    /// Run to completion on the calling thread, unless a run is active.
    pub fn run(&self, request: RunRequest) -> Result<RunOutcome, SyncError> {
        let Some(permit) = self.try_begin() else {
            tracing::info!("a run is already in progress; ignoring new request");
            return Ok(RunOutcome::AlreadyRunning);
        };
        self.execute(permit, request)
    }

    /// Run with a permit obtained from [`Engine::try_begin`].
    ///
    /// Only a registry read before identifiers are resolved can make this
    /// return an error; per-identifier failures are recorded and counted.
    pub fn execute(&self, permit: RunPermit, request: RunRequest) -> Result<RunOutcome, SyncError> {
        let _permit = permit;
        let (Some(raw_ids), Some(range)) = (request.identifiers, request.range) else {
            tracing::info!("run requested without identifiers or date range; ignoring");
            return Ok(RunOutcome::MissingParameters);
        };

        self.state.update(|s| {
            s.progress = 0;
            s.current_identifier = None;
            s.status_message = "Starting sync run...".to_string();
        });
        tracing::info!(
            "starting sync run for {} identifier(s), {} to {}",
            raw_ids.len(),
            range.start,
            range.end
        );

        let records = match self.resolve(&raw_ids) {
            Ok(records) => records,
            Err(err) => {
                tracing::error!("run aborted, registry unreadable: {err}");
                self.state.set_message(format!("Run aborted: {err}"));
                return Err(err.into());
            }
        };
        if records.is_empty() {
            tracing::info!("none of the requested identifiers are registered; finishing");
            self.state.set_message("Idle. No valid identifiers selected.");
            return Ok(RunOutcome::NoValidIdentifiers);
        }

        let total = records.len();
        let mut report = RunReport::default();
        for (index, record) in records.iter().enumerate() {
            let id = &record.id;
            self.state.update(|s| {
                s.current_identifier = Some(id.to_string());
                s.status_message = format!("Processing {id} ({}/{total})", index + 1);
            });

            if record.consecutive_failures >= self.failure_threshold {
                tracing::warn!(
                    "skipping {id}: {} consecutive failure(s)",
                    record.consecutive_failures
                );
                report.summary.skipped += record.last_found();
                report.identifiers_in_error += 1;
            } else {
                match self.process_identifier(id, &range) {
                    Ok(tally) => {
                        report.summary.found += tally.found;
                        report.summary.sent += tally.sent;
                        report.summary.failed += tally.failed;
                        report.summary.skipped += tally.skipped;
                    }
                    Err(err) => {
                        tracing::error!("processing {id} failed: {err}");
                        self.record_failure(id, &err.to_string());
                        self.state
                            .set_message(format!("Error processing {id}: {err}"));
                        report.identifiers_in_error += 1;
                    }
                }
                report.summary.processed_identifiers += 1;
            }

            let progress = progress_percent(index + 1, total);
            self.state.update(|s| s.progress = progress);
        }

        let status = RunStatus {
            last_run_at: Some(Utc::now()),
            summary: Some(report.summary),
        };
        if let Err(err) = self.status.save(&status) {
            tracing::error!("failed to save run status: {err}");
        }

        let summary = &report.summary;
        tracing::info!(
            "run finished: found={} sent={} failed={} skipped={} identifiers={}",
            summary.found,
            summary.sent,
            summary.failed,
            summary.skipped,
            summary.processed_identifiers
        );
        self.state.set_message(if report.identifiers_in_error > 0 {
            format!(
                "Finished with {} identifier(s) in error.",
                report.identifiers_in_error
            )
        } else {
            "Finished successfully.".to_string()
        });
        Ok(RunOutcome::Completed(report))
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    /// Registered records for `raw_ids`, in input order, each at most once.
    fn resolve(&self, raw_ids: &[String]) -> Result<Vec<IdentifierRecord>, nfsync_core::StoreError> {
        let registered = self.registry.list_all()?;
        let mut seen = HashSet::new();
        let mut resolved = Vec::new();
        for raw in raw_ids {
            let normalized = normalize_digits(raw);
            if !seen.insert(normalized.clone()) {
                continue;
            }
            match registered.iter().find(|r| r.id.as_str() == normalized) {
                Some(record) => resolved.push(record.clone()),
                None => tracing::debug!("identifier {raw:?} is not registered; ignoring"),
            }
        }
        Ok(resolved)
    }

    fn process_identifier(&self, id: &TaxId, range: &DateRange) -> Result<IdentifierTally, SyncError> {
        tracing::info!("processing {id}");
        self.state
            .set_message(format!("Counting documents for {id}..."));

        let counted = self.source.count(id, range)?;
        self.state
            .set_message(format!("Found {counted} document(s) for {id}."));
        if counted == 0 {
            tracing::info!("no documents for {id} in range");
            self.registry
                .record_success(id, Utc::now(), CheckResult { found: 0 })?;
            return Ok(IdentifierTally::default());
        }

        self.state
            .set_message(format!("Downloading {counted} document(s) for {id}..."));
        let documents = self.source.fetch(id, range, counted);
        let fetched = documents.len() as u64;
        self.registry
            .record_success(id, Utc::now(), CheckResult { found: fetched })?;
        self.state.set_message(format!(
            "Downloaded {fetched} of {counted} document(s) for {id}; sending..."
        ));

        let outcome = self.dispatcher.dispatch(documents, self.concurrency)?;
        tracing::info!(
            "{id} done: counted={counted} fetched={fetched} sent={} failed={} skipped={}",
            outcome.sent,
            outcome.failed,
            outcome.skipped
        );
        self.state.set_message(format!(
            "Finished sending for {id}: {} sent, {} failed.",
            outcome.sent, outcome.failed
        ));

        Ok(IdentifierTally {
            found: counted,
            sent: outcome.sent,
            failed: outcome.failed,
            skipped: outcome.skipped + counted.saturating_sub(fetched),
        })
    }

    fn record_failure(&self, id: &TaxId, message: &str) {
        if let Err(err) = self.registry.record_error(id, message) {
            tracing::error!("failed to record error for {id}: {err}");
        }
        if let Err(err) = self.registry.increment_failure_count(id) {
            tracing::error!("failed to increment failure count for {id}: {err}");
        }
    }
}

fn progress_percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((done as f64 / total as f64) * 100.0).round().clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_rounds_to_nearest_percent() {
        assert_eq!(progress_percent(1, 3), 33);
        assert_eq!(progress_percent(2, 3), 67);
        assert_eq!(progress_percent(3, 3), 100);
        assert_eq!(progress_percent(0, 0), 0);
    }

    #[test]
    fn request_completeness() {
        assert!(!RunRequest::default().is_complete());
        let range = DateRange::parse("2024-01-01", "2024-01-02").unwrap();
        assert!(RunRequest::new(vec![], range).is_complete());
    }
}
