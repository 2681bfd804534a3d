//! Domain types shared by the stores, the engine and the outer surfaces.
//!
//! All persisted types are serializable via serde; field names are
//! `snake_case` on disk and on the daemon socket.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Days, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A normalized taxpayer identifier: 11 digits (CPF) or 14 digits (CNPJ).
///
/// Construct with [`TaxId::parse`]; formatting characters such as `.`, `/`
/// and `-` are stripped before validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaxId(String);

impl TaxId {
    /// Normalize `raw` to its digits and validate the length.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let digits = normalize_digits(raw);
        match digits.len() {
            11 | 14 => Ok(Self(digits)),
            _ => Err(ValidationError::InvalidTaxId {
                raw: raw.to_owned(),
            }),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaxId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Keep only ASCII digits.
pub fn normalize_digits(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

// ---------------------------------------------------------------------------
// Identifier registry records
// ---------------------------------------------------------------------------

/// Outcome of the last successful check of an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CheckResult {
    /// Documents found in the queried window.
    pub found: u64,
}

/// Sync state of one taxpayer identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierRecord {
    pub id: TaxId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_result: Option<CheckResult>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl IdentifierRecord {
    pub fn new(id: TaxId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at: now,
            updated_at: now,
            last_checked_at: None,
            last_result: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }

    /// Last known document count, `0` if the identifier was never checked.
    pub fn last_found(&self) -> u64 {
        self.last_result.map(|r| r.found).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Aggregate counters of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RunSummary {
    pub found: u64,
    pub sent: u64,
    pub failed: u64,
    pub skipped: u64,
    pub processed_identifiers: u64,
}

/// The durable record of the most recent run. Overwritten wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RunStatus {
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub summary: Option<RunSummary>,
}

// ---------------------------------------------------------------------------
// Date range
// ---------------------------------------------------------------------------

/// An inclusive range of calendar dates (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, ValidationError> {
        if start > end {
            return Err(ValidationError::InvalidDateRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Parse two `YYYY-MM-DD` strings.
    pub fn parse(start: &str, end: &str) -> Result<Self, ValidationError> {
        Self::new(parse_date(start)?, parse_date(end)?)
    }

    /// The `days` days before `today` through `today`.
    pub fn trailing(today: NaiveDate, days: u64) -> Self {
        let start = today.checked_sub_days(Days::new(days)).unwrap_or(today);
        Self { start, end: today }
    }

    /// Start of the first day.
    pub fn start_instant(&self) -> DateTime<Utc> {
        Utc.from_utc_datetime(&self.start.and_time(NaiveTime::MIN))
    }

    /// Last millisecond of the final day; the end date is inclusive.
    pub fn end_instant(&self) -> DateTime<Utc> {
        let end_of_day =
            NaiveTime::from_hms_milli_opt(23, 59, 59, 999).unwrap_or(NaiveTime::MIN);
        Utc.from_utc_datetime(&self.end.and_time(end_of_day))
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate, ValidationError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| ValidationError::InvalidDate {
        raw: raw.to_owned(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
