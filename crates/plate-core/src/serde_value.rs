use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{ApplyError, Document, Editor};

pub const SCHEMA: &str = "manos-plate";
pub const FORMAT_VERSION: u32 = 1;

fn schema() -> String {
    SCHEMA.to_string()
}

fn format_version() -> u32 {
    FORMAT_VERSION
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("malformed document json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown schema {0:?}")]
    UnknownSchema(String),
    #[error("format version {found} is newer than {supported}")]
    TooNew { found: u32, supported: u32 },
    #[error(transparent)]
    Apply(#[from] ApplyError),
}

/// Versioned envelope for exchanging documents as JSON. Missing envelope
/// fields read as the current schema and version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentValue {
    #[serde(default = "schema")]
    pub schema: String,
    #[serde(default = "format_version")]
    pub version: u32,
    pub document: Document,
}

impl DocumentValue {
    pub fn from_document(document: Document) -> Self {
        Self {
            schema: schema(),
            version: format_version(),
            document,
        }
    }

    pub fn into_document(self) -> Document {
        self.document
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parses without checking the envelope.
    pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Parses and rejects envelopes this build cannot read.
    pub fn decode(s: &str) -> Result<Self, ExchangeError> {
        let value = Self::from_json_str(s)?;
        value.check()?;
        Ok(value)
    }

    pub fn check(&self) -> Result<(), ExchangeError> {
        if self.schema != SCHEMA {
            return Err(ExchangeError::UnknownSchema(self.schema.clone()));
        }
        if self.version > FORMAT_VERSION {
            return Err(ExchangeError::TooNew {
                found: self.version,
                supported: FORMAT_VERSION,
            });
        }
        Ok(())
    }
}

impl Editor {
    pub fn export_value(&self) -> DocumentValue {
        DocumentValue::from_document(self.doc().clone())
    }

    /// Loads a document produced elsewhere and normalizes it. History is
    /// dropped; returns the number of corrections the tree needed.
    pub fn import_value(&mut self, value: DocumentValue) -> Result<usize, ExchangeError> {
        value.check()?;
        let corrections = self.replace_document(value.into_document())?;
        if corrections > 0 {
            tracing::debug!(target: "plate::normalize", corrections, "imported document repaired");
        }
        Ok(corrections)
    }
}
