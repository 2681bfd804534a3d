//! Source provider: counts and downloads documents for an identifier.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use nfsync_core::config::SourceSettings;
use nfsync_core::{DateRange, TaxId};

use crate::document::{decode_page, Document};
use crate::error::ProviderError;

/// Document retrieval contract used by the engine.
///
/// Implementations supply [`count`](SourceClient::count) and
/// [`fetch_page`](SourceClient::fetch_page); the paging loop in
/// [`fetch`](SourceClient::fetch) is shared.
pub trait SourceClient: Send + Sync {
    /// Total documents across every supported subtype in `range`.
    fn count(&self, id: &TaxId, range: &DateRange) -> Result<u64, ProviderError>;

    /// One page of documents starting at offset `skip`.
    fn fetch_page(
        &self,
        id: &TaxId,
        range: &DateRange,
        skip: u64,
        take: u64,
    ) -> Result<Vec<Document>, ProviderError>;

    /// Page size used by [`fetch`](SourceClient::fetch).
    fn page_size(&self) -> u64 {
        50
    }

    /// Download up to `total` documents page by page.
    ///
    /// A failed page is logged and contributes no documents; it never aborts
    /// the remaining pages.
    fn fetch(&self, id: &TaxId, range: &DateRange, total: u64) -> Vec<Document> {
        let page_size = self.page_size().max(1);
        let pages = total.div_ceil(page_size);
        let mut documents = Vec::new();
        if pages > 0 {
            tracing::info!("downloading {total} document(s) for {id} in {pages} page(s)");
        }

        for page in 0..pages {
            let skip = page * page_size;
            let take = page_size.min(total - skip);
            tracing::debug!(
                "fetching page {}/{pages} for {id} (take={take}, skip={skip})",
                page + 1
            );
            match self.fetch_page(id, range, skip, take) {
                Ok(batch) => {
                    tracing::debug!("page {} returned {} document(s)", page + 1, batch.len());
                    documents.extend(batch);
                }
                Err(err) => {
                    tracing::warn!("page {}/{pages} for {id} failed: {err}", page + 1);
                }
            }
        }
        documents
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Per-subtype totals returned by the count endpoint.
#[derive(Debug, Default, Deserialize)]
struct CountResponse {
    #[serde(rename = "NFe", default)]
    nfe: Option<u64>,
    #[serde(rename = "NFCe", default)]
    nfce: Option<u64>,
    #[serde(rename = "CTe", default)]
    cte: Option<u64>,
    #[serde(rename = "CFe", default)]
    cfe: Option<u64>,
    #[serde(rename = "NFSe", default)]
    nfse: Option<u64>,
}

impl CountResponse {
    fn total(&self) -> u64 {
        [self.nfe, self.nfce, self.cte, self.cfe, self.nfse]
            .into_iter()
            .map(|n| n.unwrap_or(0))
            .sum()
    }
}

/// Source provider client over HTTP.
pub struct SiegClient {
    settings: SourceSettings,
    agent: ureq::Agent,
}

impl SiegClient {
    pub fn new(settings: SourceSettings) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build();
        Self { settings, agent }
    }

    fn post(&self, path: &str, payload: Value) -> Result<String, ProviderError> {
        let url = format!("{}{path}", self.settings.base_url.trim_end_matches('/'));
        tracing::debug!("source POST {path}");
        let response = self
            .agent
            .post(&url)
            .query("api_key", &self.settings.api_key)
            .set("Content-Type", "application/json")
            .send_json(payload)?;
        response
            .into_string()
            .map_err(|e| ProviderError::Transport(format!("reading {path} response: {e}")))
    }
}

impl SourceClient for SiegClient {
    fn count(&self, id: &TaxId, range: &DateRange) -> Result<u64, ProviderError> {
        let (start, end) = instants(range);
        let body = self.post(
            "/ContarXmls",
            json!({
                "CnpjDest": id.as_str(),
                "DataEmissaoInicio": start,
                "DataEmissaoFim": end,
                "DataUploadInicio": start,
                "DataUploadFim": end,
            }),
        )?;
        let counts: CountResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::Decode(format!("count response: {e}")))?;
        let total = counts.total();
        tracing::info!("count for {id}: {total} document(s) in range");
        Ok(total)
    }

    fn fetch_page(
        &self,
        id: &TaxId,
        range: &DateRange,
        skip: u64,
        take: u64,
    ) -> Result<Vec<Document>, ProviderError> {
        let (start, end) = instants(range);
        let body = self.post(
            "/BaixarXmls",
            json!({
                "XmlType": 1,
                "Take": take,
                "Skip": skip,
                "DataEmissaoInicio": start,
                "DataEmissaoFim": end,
                "CnpjDest": id.as_str(),
                "Downloadevent": false,
            }),
        )?;
        decode_page(&body)
    }

    fn page_size(&self) -> u64 {
        self.settings.effective_page_size() as u64
    }
}

/// ISO-8601 range bounds with millisecond precision.
fn instants(range: &DateRange) -> (String, String) {
    (
        iso_millis(range.start_instant()),
        iso_millis(range.end_instant()),
    )
}

fn iso_millis(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
