//! Byte transport for asset downloads
//!
//! The store only needs "GET a URL, give me a stream of chunks". Keeping
//! that behind a trait lets tests count requests and inject failures.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};

use crate::common::{Error, Result};

/// Stream of body chunks
pub type ByteStream =
    Pin<Box<dyn Stream<Item = std::result::Result<Vec<u8>, TransportError>> + Send>>;

/// A failed GET, tagged with whether trying again may help
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    pub transient: bool,
}

impl TransportError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

/// Response body with its advertised length
pub struct Download {
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Start a GET request for `url`
    async fn get(&self, url: &str) -> std::result::Result<Download, TransportError>;
}

/// HTTP(S) transport backed by reqwest
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("functest/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

fn classify(err: &reqwest::Error) -> TransportError {
    let transient = err.is_timeout() || err.is_connect() || err.is_request() || err.is_body();
    TransportError {
        message: err.to_string(),
        transient,
    }
}

/// Server errors and throttling are worth another attempt, the rest are not
fn status_is_transient(status: reqwest::StatusCode) -> bool {
    status.is_server_error()
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str) -> std::result::Result<Download, TransportError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError {
                message: format!("HTTP status {}", status),
                transient: status_is_transient(status),
            });
        }

        let content_length = response.content_length();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(|e| classify(&e)));

        Ok(Download {
            content_length,
            body: Box::pin(body),
        })
    }
}
