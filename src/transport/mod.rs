//! Request transport
//!
//! Everything solrcl sends to a server goes through the `Transport` trait:
//! one JSON request/response exchange, optionally carrying a text or
//! streamed body. `HttpTransport` talks to a real server over HTTP and
//! `SimulatedSolr` answers in memory for tests.

pub mod http;
pub mod simulated;

pub use http::HttpTransport;
pub use simulated::SimulatedSolr;

use std::io;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use serde_json::Value;

use crate::error::{Result, SolrError};

/// Query parameters in request order. Keys may repeat.
pub type Params = Vec<(String, String)>;

/// Body chunks of a streamed upload.
pub type FragmentStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + Sync>>;

pub const XML_CONTENT_TYPE: &str = "text/xml; charset=utf-8";

pub enum RequestBody {
    Text(String),
    Stream(FragmentStream),
}

/// A request body together with its content type.
pub struct Upload {
    pub body: RequestBody,
    pub content_type: String,
}

impl Upload {
    pub fn text(body: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            body: RequestBody::Text(body.into()),
            content_type: content_type.into(),
        }
    }

    pub fn xml(body: impl Into<String>) -> Self {
        Self::text(body, XML_CONTENT_TYPE)
    }

    pub fn stream(stream: FragmentStream, content_type: impl Into<String>) -> Self {
        Self {
            body: RequestBody::Stream(stream),
            content_type: content_type.into(),
        }
    }
}

impl std::fmt::Debug for Upload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let body = match &self.body {
            RequestBody::Text(t) => format!("{} bytes", t.len()),
            RequestBody::Stream(_) => "stream".to_string(),
        };
        f.debug_struct("Upload")
            .field("body", &body)
            .field("content_type", &self.content_type)
            .finish()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one request. `resource` is relative to `/solr/` unless it
    /// starts with `/`. A request without upload is a GET, otherwise a POST.
    async fn request(&self, resource: &str, params: Params, upload: Option<Upload>) -> Result<Value>;

    /// `host:port` style label used in log lines.
    fn endpoint(&self) -> String;
}

/// Build a parameter list from borrowed pairs.
pub fn params(pairs: &[(&str, &str)]) -> Params {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn resource_path(resource: &str) -> String {
    if resource.starts_with('/') {
        resource.to_string()
    } else {
        format!("/solr/{}", resource)
    }
}

/// Add `wt=json` unless the caller chose a writer.
pub fn with_json_writer(mut params: Params) -> Params {
    if !params.iter().any(|(k, _)| k == "wt") {
        params.push(("wt".to_string(), "json".to_string()));
    }
    params
}

/// Classify a decoded JSON response.
pub fn check_response(response: Value, http_status: u16) -> Result<Value> {
    let header = match response.get("responseHeader") {
        Some(header) => header,
        None => {
            let error = response
                .get("error")
                .ok_or_else(|| format_error("missing key responseHeader", &response))?;
            let code = error
                .get("code")
                .and_then(Value::as_u64)
                .and_then(|c| u16::try_from(c).ok())
                .unwrap_or(http_status);
            let msg = error
                .get("msg")
                .and_then(Value::as_str)
                .ok_or_else(|| format_error("missing key msg", &response))?;
            let trace = error.get("trace").and_then(Value::as_str).unwrap_or("");
            return Err(SolrError::response(
                format!("Error in SOLR response: {} {} {}", code, msg, trace)
                    .trim_end()
                    .to_string(),
                code,
            ));
        }
    };

    let status = header
        .get("status")
        .and_then(Value::as_i64)
        .ok_or_else(|| format_error("missing key status", &response))?;
    if status == 0 {
        return Ok(response);
    }

    let msg = response
        .get("error")
        .and_then(|e| e.get("msg"))
        .and_then(Value::as_str)
        .ok_or_else(|| format_error("missing key error", &response))?;
    let code = u16::try_from(status).unwrap_or(http_status);
    Err(SolrError::response(
        format!("Error in SOLR response: {} {}", status, msg),
        code,
    ))
}

/// Classify a response whose body is not JSON.
pub fn check_non_json(http_status: u16, content_type: Option<&str>) -> SolrError {
    if http_status >= 400 {
        SolrError::response(format!("HTTP request error: status {}", http_status), http_status)
    } else {
        SolrError::response(
            format!(
                "Unsupported response content type {}",
                content_type.unwrap_or("(none)")
            ),
            http_status,
        )
    }
}

/// Server versions reported by `admin/info/system`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerInfo {
    pub solr_version: String,
    pub lucene_version: String,
}

impl ServerInfo {
    pub async fn fetch(transport: &dyn Transport) -> Result<Self> {
        let data = transport
            .request("/solr/admin/info/system", Vec::new(), None)
            .await?;
        let version = |key: &str| {
            data.get("lucene")
                .and_then(|l| l.get(key))
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| format_error(&format!("missing key {}", key), &data))
        };
        Ok(Self {
            solr_version: version("solr-spec-version")?,
            lucene_version: version("lucene-spec-version")?,
        })
    }
}

fn format_error(message: &str, value: &Value) -> SolrError {
    SolrError::ResponseFormat(format!("{} - {}", message, value))
}
