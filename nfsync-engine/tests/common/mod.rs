//! In-memory provider doubles shared by the engine integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use nfsync_core::config::Settings;
use nfsync_core::{DateRange, LedgerStore, TaxId};
use nfsync_engine::pipeline::build_engine_with;
use nfsync_engine::Engine;
use nfsync_providers::{Document, ProviderError, SinkClient, SourceClient, UploadTarget};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A keyed document whose payload names its key.
pub fn doc(key: &str) -> Document {
    Document {
        key: Some(key.to_string()),
        payload: format!("<nfe>{key}</nfe>").into_bytes(),
    }
}

pub fn range() -> DateRange {
    DateRange::parse("2024-01-01", "2024-01-31").expect("range")
}

/// Settings with no backoff so retry tests run instantly.
pub fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.dispatch.backoff_unit_ms = 0;
    settings.dispatch.concurrency = 4;
    settings
}

pub fn engine_in(dir: &Path, source: Arc<FakeSource>, sink: Arc<FakeSink>) -> Engine {
    build_engine_with(dir, &fast_settings(), source, sink)
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// Scripted source: per-identifier count and documents. The count may
/// exceed the documents available, which models partially failed pages.
#[derive(Default)]
pub struct FakeSource {
    counts: HashMap<String, Result<u64, u16>>,
    documents: HashMap<String, Vec<Document>>,
    pub count_calls: Mutex<Vec<String>>,
    pub page_calls: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: &str, count: u64, documents: Vec<Document>) -> Self {
        self.counts.insert(id.to_string(), Ok(count));
        self.documents.insert(id.to_string(), documents);
        self
    }

    pub fn failing(mut self, id: &str, status: u16) -> Self {
        self.counts.insert(id.to_string(), Err(status));
        self
    }

    pub fn counted(&self) -> Vec<String> {
        self.count_calls.lock().unwrap().clone()
    }
}

impl SourceClient for FakeSource {
    fn count(&self, id: &TaxId, _: &DateRange) -> Result<u64, ProviderError> {
        self.count_calls.lock().unwrap().push(id.to_string());
        match self.counts.get(id.as_str()) {
            Some(Ok(n)) => Ok(*n),
            Some(Err(status)) => Err(ProviderError::Http {
                status: *status,
                body: "source unavailable".into(),
            }),
            None => Ok(0),
        }
    }

    fn fetch_page(
        &self,
        id: &TaxId,
        _: &DateRange,
        skip: u64,
        take: u64,
    ) -> Result<Vec<Document>, ProviderError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        let all = self.documents.get(id.as_str()).cloned().unwrap_or_default();
        Ok(all
            .into_iter()
            .skip(skip as usize)
            .take(take as usize)
            .collect())
    }

    fn page_size(&self) -> u64 {
        10
    }
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// Scripted sink. Each upload attempt pops the next step from `script`;
/// an empty script means success. Writes are counted per payload.
#[derive(Default)]
pub struct FakeSink {
    script: Mutex<VecDeque<Option<u16>>>,
    static_token: bool,
    pub credential_calls: AtomicUsize,
    pub invalidations: Mutex<Vec<String>>,
    writes: Mutex<HashMap<String, usize>>,
    watched_ledger: Option<LedgerStore>,
    ledger_sizes: Mutex<Vec<usize>>,
}

impl FakeSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next attempts with the given statuses, in order.
    pub fn failing_with(statuses: &[u16]) -> Self {
        let sink = Self::default();
        sink.script
            .lock()
            .unwrap()
            .extend(statuses.iter().copied().map(Some));
        sink
    }

    pub fn with_static_token(mut self) -> Self {
        self.static_token = true;
        self
    }

    /// Record the on-disk ledger size at every payload write.
    pub fn watching_ledger(mut self, ledger: LedgerStore) -> Self {
        self.watched_ledger = Some(ledger);
        self
    }

    pub fn ledger_sizes(&self) -> Vec<usize> {
        self.ledger_sizes.lock().unwrap().clone()
    }

    pub fn credential_calls(&self) -> usize {
        self.credential_calls.load(Ordering::SeqCst)
    }

    pub fn total_writes(&self) -> usize {
        self.writes.lock().unwrap().values().sum()
    }

    pub fn writes_for(&self, key: &str) -> usize {
        let payload = String::from_utf8(doc(key).payload).unwrap();
        self.writes
            .lock()
            .unwrap()
            .get(&payload)
            .copied()
            .unwrap_or(0)
    }

    pub fn write_counts(&self) -> HashMap<String, usize> {
        self.writes.lock().unwrap().clone()
    }
}

impl SinkClient for FakeSink {
    fn credential(&self) -> Result<String, ProviderError> {
        let n = self.credential_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("token-{n}"))
    }

    fn invalidate_credential(&self, rejected: &str) {
        self.invalidations.lock().unwrap().push(rejected.to_string());
    }

    fn uses_static_token(&self) -> bool {
        self.static_token
    }

    fn request_upload_target(
        &self,
        _token: &str,
        size: usize,
    ) -> Result<UploadTarget, ProviderError> {
        if let Some(Some(status)) = self.script.lock().unwrap().pop_front() {
            return Err(ProviderError::Http {
                status,
                body: "scripted failure".into(),
            });
        }
        Ok(UploadTarget {
            url: format!("memory://{size}"),
        })
    }

    fn write_payload(&self, _: &UploadTarget, payload: &[u8]) -> Result<(), ProviderError> {
        if let Some(ledger) = &self.watched_ledger {
            let size = ledger.load().map(|keys| keys.len()).unwrap_or(0);
            self.ledger_sizes.lock().unwrap().push(size);
        }
        let key = String::from_utf8_lossy(payload).into_owned();
        *self.writes.lock().unwrap().entry(key).or_insert(0) += 1;
        Ok(())
    }
}
