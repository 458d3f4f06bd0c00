//! HTTP transport over reqwest.

use std::fmt;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Body, Client};
use serde_json::Value;

use super::{check_non_json, check_response, resource_path, with_json_writer, Params, RequestBody, Transport, Upload};
use crate::config::ConnectionConfig;
use crate::error::{Result, SolrError};

/// Talks to one server at `http://domain:port`.
pub struct HttpTransport {
    client: Client,
    domain: String,
    port: u16,
}

impl HttpTransport {
    pub fn new(config: &ConnectionConfig) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.request_timeout() {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| SolrError::Network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            domain: config.domain.clone(),
            port: config.port,
        })
    }

    pub fn url(&self, resource: &str) -> String {
        format!("http://{}:{}{}", self.domain, self.port, resource_path(resource))
    }
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("domain", &self.domain)
            .field("port", &self.port)
            .finish()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, resource: &str, params: Params, upload: Option<Upload>) -> Result<Value> {
        let url = self.url(resource);
        let params = with_json_writer(params);
        log::debug!("[{}] Requesting: {} {:?}", self.endpoint(), url, params);

        let request = match upload {
            None => self.client.get(&url).query(&params),
            Some(upload) => {
                let body = match upload.body {
                    RequestBody::Text(text) => Body::from(text),
                    RequestBody::Stream(stream) => Body::wrap_stream(stream),
                };
                self.client
                    .post(&url)
                    .query(&params)
                    .header(CONTENT_TYPE, upload.content_type)
                    .body(body)
            }
        };

        let response = request.send().await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let is_json = content_type
            .as_deref()
            .map_or(false, |ct| ct.starts_with("application/json"));
        if !is_json {
            return Err(check_non_json(status, content_type.as_deref()));
        }

        let bytes = response.bytes().await?;
        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| SolrError::response(format!("Error in parsing json: {}", e), status))?;
        check_response(value, status)
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.domain, self.port)
    }
}
