//! Network transfer capability and its HTTP implementation.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use time::OffsetDateTime;
use time::macros::format_description;
use tracing::debug;

/// Why a transfer failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchErrorKind {
    NotFound,
    InvalidUrl,
    /// Could not reach the remote.
    Connection,
    /// The transfer started but did not complete.
    Aborted,
    /// Conditional request answered with 304.
    NotModified,
    QuotaExceeded,
    InvalidResponse,
    /// Any other non-success status.
    Http(u16),
}

impl FetchErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::InvalidUrl => "invalid_url",
            Self::Connection => "connection_error",
            Self::Aborted => "aborted",
            Self::NotModified => "not_modified",
            Self::QuotaExceeded => "quota_exceeded",
            Self::InvalidResponse => "invalid_response",
            Self::Http(_) => "http_error",
        }
    }
}

/// A failed transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub url: String,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, url: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.kind.as_str(), self.url, self.message)
    }
}

impl std::error::Error for FetchError {}

/// Body of a successful transfer.
pub type FetchStream = Pin<Box<dyn Stream<Item = Result<Bytes, FetchError>> + Send>>;

/// Request for one remote file.
#[derive(Clone, Debug)]
pub struct FetchRequest {
    pub url: String,
    /// Only send the body if the remote changed after this time.
    pub if_modified_since: Option<OffsetDateTime>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            if_modified_since: None,
        }
    }
}

/// A transfer that has started.
pub struct FetchResponse {
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub body: FetchStream,
}

impl fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchResponse")
            .field("content_length", &self.content_length)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Fetches remote files by URL.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    /// Start transferring a file.
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError>;

    /// Size of a remote file without downloading it, when the remote reports one.
    async fn remote_size(&self, url: &str) -> Result<Option<u64>, FetchError>;
}

/// `Fetcher` over HTTP(S).
#[derive(Clone, Default)]
pub struct HttpFetcher {
    http: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn parse_url(url: &str) -> Result<reqwest::Url, FetchError> {
        reqwest::Url::parse(url)
            .map_err(|e| FetchError::new(FetchErrorKind::InvalidUrl, url, e.to_string()))
    }

    fn check_status(url: &str, status: reqwest::StatusCode) -> Result<(), FetchError> {
        if status.is_success() {
            return Ok(());
        }
        let kind = match status.as_u16() {
            304 => FetchErrorKind::NotModified,
            404 | 410 => FetchErrorKind::NotFound,
            507 => FetchErrorKind::QuotaExceeded,
            code if code < 400 => FetchErrorKind::InvalidResponse,
            code => FetchErrorKind::Http(code),
        };
        Err(FetchError::new(kind, url, format!("status {status}")))
    }
}

fn transport_error(url: &str, e: reqwest::Error) -> FetchError {
    let kind = if e.is_builder() {
        FetchErrorKind::InvalidUrl
    } else if e.is_connect() || e.is_timeout() {
        FetchErrorKind::Connection
    } else if e.is_body() || e.is_decode() {
        FetchErrorKind::Aborted
    } else {
        FetchErrorKind::Connection
    };
    FetchError::new(kind, url, e.to_string())
}

/// Format a timestamp as an HTTP-date (RFC 9110 IMF-fixdate).
pub fn http_date(at: OffsetDateTime) -> String {
    let format = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    at.to_offset(time::UtcOffset::UTC)
        .format(&format)
        .unwrap_or_default()
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        let url = Self::parse_url(&request.url)?;
        let mut builder = self.http.get(url);
        if let Some(since) = request.if_modified_since {
            builder = builder.header(reqwest::header::IF_MODIFIED_SINCE, http_date(since));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| transport_error(&request.url, e))?;
        Self::check_status(&request.url, response.status())?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_length = response.content_length();
        debug!(url = %request.url, ?content_length, "transfer started");

        let url = request.url;
        let body = response.bytes_stream().map(move |chunk| {
            chunk.map_err(|e| FetchError::new(FetchErrorKind::Aborted, url.clone(), e.to_string()))
        });

        Ok(FetchResponse {
            content_length,
            content_type,
            body: Box::pin(body),
        })
    }

    async fn remote_size(&self, url: &str) -> Result<Option<u64>, FetchError> {
        let parsed = Self::parse_url(url)?;
        let response = self
            .http
            .head(parsed)
            .send()
            .await
            .map_err(|e| transport_error(url, e))?;
        Self::check_status(url, response.status())?;

        Ok(response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok()))
    }
}
