//! REST data source for Airtable-style table APIs
//!
//! `GET {base}/records` returns `{"records": [...], "offset": "..."}`; the
//! offset is passed back until the upstream stops returning one.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{DataSource, Record};
use crate::config::SourceConfig;
use crate::{Error, Result};

/// One page of a list response
#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    records: Vec<Record>,
    #[serde(default)]
    offset: Option<String>,
}

/// HTTP data source
pub struct HttpDataSource {
    client: Client,
    base_url: String,
    max_pages: u32,
}

impl HttpDataSource {
    /// Build a client from source configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the base URL is empty, the API key is
    /// not a valid header value, or the HTTP client cannot be built.
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(Error::Config("source.base_url is not set".to_string()));
        }

        let mut headers = HeaderMap::new();
        if let Some(key) = config.api_key.as_deref().filter(|k| !k.is_empty()) {
            let mut value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| Error::Config(format!("Invalid API key: {e}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.request_timeout.min(Duration::from_secs(10)))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            max_pages: config.max_pages.max(1),
        })
    }

    /// Base URL requests are sent to
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> Result<Response> {
        let response = request.send().await.map_err(|e| classify_transport(&e, what))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        // Truncate to avoid logging whole upstream payloads
        let detail: String = body.chars().take(200).collect();
        Err(classify_status(status, what, &detail))
    }
}

/// Map a non-success status onto the error taxonomy
fn classify_status(status: StatusCode, what: &str, detail: &str) -> Error {
    let message = format!("{what}: upstream returned {status}: {detail}");
    match status {
        StatusCode::NOT_FOUND => Error::NotFound(what.to_string()),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => Error::Transient(message),
        s if s.is_server_error() => Error::Transient(message),
        _ => Error::Permanent(message),
    }
}

fn classify_transport(error: &reqwest::Error, what: &str) -> Error {
    if error.is_timeout() {
        Error::Timeout(format!("{what}: {error}"))
    } else if error.is_connect() || error.is_request() {
        Error::Transient(format!("{what}: {error}"))
    } else {
        Error::Permanent(format!("{what}: {error}"))
    }
}

#[async_trait]
impl DataSource for HttpDataSource {
    async fn fetch_all(&self) -> Result<Vec<Record>> {
        let url = format!("{}/records", self.base_url);
        let mut records = Vec::new();
        let mut offset: Option<String> = None;

        for page_no in 0..self.max_pages {
            let mut request = self.client.get(&url);
            if let Some(o) = offset.as_deref() {
                request = request.query(&[("offset", o)]);
            }

            let page: Page = self
                .send(request, "list records")
                .await?
                .json()
                .await
                .map_err(|e| Error::Permanent(format!("list records: malformed page: {e}")))?;

            debug!(page = page_no, records = page.records.len(), "Fetched page");
            records.extend(page.records);

            match page.offset {
                Some(next) if !next.is_empty() => offset = Some(next),
                _ => return Ok(records),
            }
        }

        warn!(
            max_pages = self.max_pages,
            records = records.len(),
            "Stopped paging at max_pages; directory may be truncated"
        );
        Ok(records)
    }

    async fn fetch_one(&self, id: &str) -> Result<Record> {
        if id.is_empty() || id.contains('/') {
            return Err(Error::NotFound(id.to_string()));
        }
        let url = format!("{}/records/{id}", self.base_url);
        self.send(self.client.get(&url), &format!("record {id}"))
            .await?
            .json()
            .await
            .map_err(|e| Error::Permanent(format!("record {id}: malformed body: {e}")))
    }
}
