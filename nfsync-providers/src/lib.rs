//! Source and sink provider adapters.
//!
//! The engine only sees the [`SourceClient`] and [`SinkClient`] traits; the
//! HTTP clients here are the production implementations.

pub mod credential;
pub mod document;
pub mod error;
pub mod sink;
pub mod source;

pub use credential::{Credential, CredentialCache};
pub use document::{decode_page, extract_key, Document};
pub use error::ProviderError;
pub use sink::{NfStockClient, SinkClient, UploadTarget};
pub use source::{SiegClient, SourceClient};
