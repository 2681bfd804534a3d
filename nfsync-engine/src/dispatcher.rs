//! Upload dispatcher: ledger-gated, bounded-concurrency delivery of one
//! identifier's document batch to the sink.
//!
//! Workers pull from a shared index cursor, so every pending document is
//! claimed by exactly one worker. The in-memory ledger copy and the
//! success counter live behind one mutex; the ledger is persisted every
//! `flush_every` successes and once more when all workers have finished.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use nfsync_core::config::DispatchSettings;
use nfsync_core::{LedgerSet, LedgerStore};
use nfsync_providers::{Document, ProviderError, SinkClient};

use crate::error::SyncError;

/// Counts returned by one [`UploadDispatcher::dispatch`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub sent: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// Retry and flush tuning for a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOptions {
    pub max_attempts: u32,
    /// Backoff before attempt `n + 1` is `n * backoff_unit`.
    pub backoff_unit: Duration,
    pub flush_every: usize,
}

impl DispatchOptions {
    /// Pause after failed attempt `attempt` (1-based): `attempt * backoff_unit`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff_unit.saturating_mul(attempt)
    }
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self::from(&DispatchSettings::default())
    }
}

impl From<&DispatchSettings> for DispatchOptions {
    fn from(settings: &DispatchSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            backoff_unit: Duration::from_millis(settings.backoff_unit_ms),
            flush_every: settings.flush_every.max(1),
        }
    }
}

/// Ledger copy and successes since the last flush, updated as one unit.
struct FlushState {
    keys: LedgerSet,
    since_flush: usize,
}

pub struct UploadDispatcher {
    ledger: LedgerStore,
    sink: Arc<dyn SinkClient>,
    options: DispatchOptions,
}

impl UploadDispatcher {
    pub fn new(ledger: LedgerStore, sink: Arc<dyn SinkClient>, options: DispatchOptions) -> Self {
        Self {
            ledger,
            sink,
            options,
        }
    }

    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    /// Upload every document not yet in the ledger using up to
    /// `concurrency` workers.
    ///
    /// Only a ledger read failure is returned as an error; upload failures
    /// are counted in [`DispatchOutcome::failed`] and ledger write failures
    /// are logged.
    pub fn dispatch(
        &self,
        documents: Vec<Document>,
        concurrency: usize,
    ) -> Result<DispatchOutcome, SyncError> {
        if documents.is_empty() {
            return Ok(DispatchOutcome::default());
        }

        let keys = self.ledger.load()?;
        let (pending, skipped) = partition(documents, &keys);
        if skipped > 0 {
            tracing::info!("{skipped} document(s) skipped: unsendable or already uploaded");
        }
        if pending.is_empty() {
            return Ok(DispatchOutcome {
                skipped,
                ..DispatchOutcome::default()
            });
        }

        let workers = concurrency.max(1).min(pending.len());
        tracing::info!(
            "uploading {} document(s) with {workers} worker(s)",
            pending.len()
        );

        let cursor = AtomicUsize::new(0);
        let sent = AtomicU64::new(0);
        let failed = AtomicU64::new(0);
        let state = Mutex::new(FlushState {
            keys,
            since_flush: 0,
        });

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let index = cursor.fetch_add(1, Ordering::SeqCst);
                    let Some((key, document)) = pending.get(index) else {
                        break;
                    };
                    match self.upload(key, document) {
                        Ok(()) => {
                            sent.fetch_add(1, Ordering::SeqCst);
                            self.mark_sent(&state, key);
                        }
                        Err(err) => {
                            failed.fetch_add(1, Ordering::SeqCst);
                            tracing::error!("giving up on document {key}: {err}");
                        }
                    }
                });
            }
        });

        let state = state.into_inner().unwrap_or_else(PoisonError::into_inner);
        self.persist(&state.keys);

        let outcome = DispatchOutcome {
            sent: sent.into_inner(),
            failed: failed.into_inner(),
            skipped,
        };
        tracing::info!(
            "dispatch finished: {} sent, {} failed, {} skipped",
            outcome.sent,
            outcome.failed,
            outcome.skipped
        );
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Per-document upload
    // -----------------------------------------------------------------------

    /// Attempt the upload up to `max_attempts` times with linear backoff.
    fn upload(&self, key: &str, document: &Document) -> Result<(), ProviderError> {
        let max_attempts = self.options.max_attempts;
        let mut attempt = 1;
        loop {
            let token = match self.sink.credential() {
                Ok(token) => token,
                Err(err) => {
                    tracing::warn!("credential for {key} unavailable (attempt {attempt}/{max_attempts}): {err}");
                    self.retry_or_fail(attempt, err)?;
                    attempt += 1;
                    continue;
                }
            };

            let result = self
                .sink
                .request_upload_target(&token, document.payload.len())
                .and_then(|target| self.sink.write_payload(&target, &document.payload));

            match result {
                Ok(()) => {
                    tracing::debug!("document {key} uploaded on attempt {attempt}");
                    return Ok(());
                }
                Err(err) if err.is_unauthorized() => {
                    self.sink.invalidate_credential(&token);
                    if self.sink.uses_static_token() {
                        tracing::warn!(
                            "sink rejected the configured static token for {key} (attempt {attempt}/{max_attempts}); it cannot be refreshed"
                        );
                    } else {
                        tracing::warn!("sink token rejected for {key} (attempt {attempt}/{max_attempts}), refreshing");
                    }
                    self.retry_or_fail(attempt, err)?;
                }
                Err(err) => {
                    tracing::warn!("upload of {key} failed (attempt {attempt}/{max_attempts}): {err}");
                    self.retry_or_fail(attempt, err)?;
                }
            }
            attempt += 1;
        }
    }

    /// Sleep before the next attempt, or hand `err` back once the attempt
    /// limit is reached.
    fn retry_or_fail(&self, attempt: u32, err: ProviderError) -> Result<(), ProviderError> {
        if attempt >= self.options.max_attempts {
            return Err(err);
        }
        let delay = self.options.backoff_for(attempt);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Ledger bookkeeping
    // -----------------------------------------------------------------------

    fn mark_sent(&self, state: &Mutex<FlushState>, key: &str) {
        let mut state = lock(state);
        state.keys.insert(key.to_owned());
        state.since_flush += 1;
        if state.since_flush >= self.options.flush_every {
            self.persist(&state.keys);
            state.since_flush = 0;
        }
    }

    fn persist(&self, keys: &LedgerSet) {
        match self.ledger.save(keys) {
            Ok(()) => tracing::debug!("ledger saved ({} key(s))", keys.len()),
            Err(err) => tracing::error!("failed to save ledger: {err}"),
        }
    }
}

/// Split a batch into documents to upload (with their keys) and a count of
/// skipped ones: keyless, empty, already in the ledger, or repeated within
/// the batch.
fn partition(documents: Vec<Document>, ledger: &LedgerSet) -> (Vec<(String, Document)>, u64) {
    let mut seen = HashSet::new();
    let mut pending = Vec::with_capacity(documents.len());
    let mut skipped = 0;
    for document in documents {
        if !document.is_sendable() {
            skipped += 1;
            continue;
        }
        let Some(key) = document.key.clone() else {
            skipped += 1;
            continue;
        };
        if ledger.contains(&key) || !seen.insert(key.clone()) {
            skipped += 1;
            continue;
        }
        pending.push((key, document));
    }
    (pending, skipped)
}

fn lock(state: &Mutex<FlushState>) -> MutexGuard<'_, FlushState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(key: Option<&str>, payload: &str) -> Document {
        Document {
            key: key.map(str::to_owned),
            payload: payload.as_bytes().to_vec(),
        }
    }

    #[test]
    fn partition_skips_unsendable_known_and_repeated() {
        let ledger: LedgerSet = ["known".to_string()].into_iter().collect();
        let docs = vec![
            doc(Some("a"), "<a/>"),
            doc(None, "<b/>"),
            doc(Some("c"), "  "),
            doc(Some("known"), "<k/>"),
            doc(Some("a"), "<a/>"),
            doc(Some("d"), "<d/>"),
        ];
        let (pending, skipped) = partition(docs, &ledger);
        let keys: Vec<&str> = pending.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "d"]);
        assert_eq!(skipped, 4);
    }

    #[test]
    fn backoff_grows_linearly_with_the_attempt() {
        let options = DispatchOptions {
            max_attempts: 5,
            backoff_unit: Duration::from_millis(250),
            flush_every: 10,
        };
        assert_eq!(options.backoff_for(1), Duration::from_millis(250));
        assert_eq!(options.backoff_for(2), Duration::from_millis(500));
        assert_eq!(options.backoff_for(4), Duration::from_secs(1));
        assert_eq!(
            DispatchOptions {
                backoff_unit: Duration::MAX,
                ..options
            }
            .backoff_for(3),
            Duration::MAX
        );
    }

    #[test]
    fn options_clamp_degenerate_settings() {
        let options = DispatchOptions::from(&DispatchSettings {
            concurrency: 0,
            max_attempts: 0,
            backoff_unit_ms: 0,
            flush_every: 0,
        });
        assert_eq!(options.max_attempts, 1);
        assert_eq!(options.flush_every, 1);
        assert!(options.backoff_unit.is_zero());
    }
}
