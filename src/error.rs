//! Error types shared by every solrcl module.
//!
//! Fatal failures travel as `SolrError`. Per-document problems that must not
//! abort a batch (malformed markup documents, version conflicts) are reported
//! as `DocumentWarning`s alongside the primary result instead.

use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SolrError>;

#[derive(Error, Debug)]
pub enum SolrError {
    /// Unknown field, multiplicity violation, type-check failure, missing id.
    #[error("Document error: {0}")]
    Document(String),

    #[error("Field {0} is not set")]
    FieldNotSet(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Missing required field: {0}")]
    MissingRequiredField(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Response error ({status}): {message}")]
    Response { message: String, status: u16 },

    #[error("Wrong response format: {0}")]
    ResponseFormat(String),

    /// Unbalanced or invalid markup. Ends the whole stream.
    #[error("Markup error: {0}")]
    Xml(String),

    #[error("Replication error: {0}")]
    Replication(String),

    #[error("Upload error: {0}")]
    Upload(String),
}

impl SolrError {
    pub fn document(message: impl Into<String>) -> Self {
        SolrError::Document(message.into())
    }

    pub fn response(message: impl Into<String>, status: u16) -> Self {
        SolrError::Response {
            message: message.into(),
            status,
        }
    }

    /// HTTP-like status carried by response errors.
    pub fn status(&self) -> Option<u16> {
        match self {
            SolrError::Response { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for SolrError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => SolrError::response(format!("HTTP request error: {}", e), status.as_u16()),
            None if e.is_decode() => SolrError::ResponseFormat(e.to_string()),
            // connect, timeout, body and builder failures never reached a response
            None => SolrError::Network(e.to_string()),
        }
    }
}

impl From<quick_xml::Error> for SolrError {
    fn from(e: quick_xml::Error) -> Self {
        SolrError::Xml(e.to_string())
    }
}

/// A document that was skipped without failing the surrounding batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocumentWarning {
    pub id: Option<String>,
    pub message: String,
}

impl DocumentWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            id: None,
            message: message.into(),
        }
    }

    pub fn for_doc(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

impl fmt::Display for DocumentWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "document {}: {}", id, self.message),
            None => f.write_str(&self.message),
        }
    }
}
