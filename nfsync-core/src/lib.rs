//! nfsync core library — domain types, durable stores, configuration.
//!
//! - [`types`] — newtypes and domain structs
//! - [`error`] — [`StoreError`], [`ValidationError`]
//! - [`registry`] — identifier registry
//! - [`ledger`] — uploaded-document ledger
//! - [`status_store`] — last run status
//! - [`config`] — [`Settings`]

pub mod config;
pub mod error;
pub mod ledger;
pub mod paths;
pub mod persist;
pub mod registry;
pub mod status_store;
pub mod types;

pub use config::Settings;
pub use error::{StoreError, ValidationError};
pub use ledger::{LedgerSet, LedgerStore};
pub use registry::IdentifierRegistry;
pub use status_store::RunStatusStore;
pub use types::{
    CheckResult, DateRange, IdentifierRecord, RunStatus, RunSummary, TaxId,
};
