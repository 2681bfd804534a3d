//! Fetched documents, key extraction and page decoding.

use std::sync::LazyLock;

use base64::Engine;
use regex::Regex;
use serde_json::Value;

use crate::error::ProviderError;

const BASE64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// 44-digit access key, either as `<chNFe>` (authorized envelope) or in the
/// `Id` attribute of `<infNFe>`.
static DOCUMENT_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<chNFe>(\d{44})</chNFe>|<infNFe\s+Id="NFe(\d{44})""#)
        .expect("invalid document key pattern")
});

/// One retrieved document. Not persisted on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Natural key used for de-duplication; `None` if none was found.
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

impl Document {
    /// Wrap a decoded XML document, extracting its key.
    pub fn from_xml(xml: String) -> Self {
        let key = extract_key(&xml);
        Self {
            key,
            payload: xml.into_bytes(),
        }
    }

    /// A document without a key or with an empty payload can never be sent.
    pub fn is_sendable(&self) -> bool {
        self.key.as_deref().is_some_and(|k| !k.is_empty())
            && !self.payload.iter().all(u8::is_ascii_whitespace)
    }
}

/// First document key in `xml`.
pub fn extract_key(xml: &str) -> Option<String> {
    let captures = DOCUMENT_KEY.captures(xml)?;
    captures
        .get(1)
        .or_else(|| captures.get(2))
        .map(|m| m.as_str().to_owned())
}

/// Decode one page body from the source provider.
///
/// The body is a JSON array of base64 strings, or a JSON string that itself
/// holds such an array. Items that fail to decode are dropped with a warning;
/// a body of any other shape is an error for the whole page.
pub fn decode_page(body: &str) -> Result<Vec<Document>, ProviderError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| ProviderError::Decode(format!("page is not JSON: {e}")))?;
    let value = match value {
        Value::String(inner) => serde_json::from_str(&inner)
            .map_err(|e| ProviderError::Decode(format!("page string is not a JSON array: {e}")))?,
        other => other,
    };
    let Value::Array(items) = value else {
        return Err(ProviderError::Decode("page is not an array".to_string()));
    };

    let mut documents = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        let Some(encoded) = item.as_str() else {
            tracing::warn!("page item {index} is not a string, skipping");
            continue;
        };
        match decode_item(encoded) {
            Ok(Some(xml)) => {
                let document = Document::from_xml(xml);
                tracing::debug!("decoded document {:?}", document.key);
                documents.push(document);
            }
            Ok(None) => {}
            Err(err) => tracing::warn!("page item {index} could not be decoded: {err}"),
        }
    }
    Ok(documents)
}

fn decode_item(encoded: &str) -> Result<Option<String>, ProviderError> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| ProviderError::Decode(format!("invalid base64: {e}")))?;
    let xml = String::from_utf8(bytes)
        .map_err(|e| ProviderError::Decode(format!("payload is not UTF-8: {e}")))?;
    Ok(if xml.is_empty() { None } else { Some(xml) })
}
