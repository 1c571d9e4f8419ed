//! In-memory `Fetcher` for engine tests.

use async_trait::async_trait;
use bytes::Bytes;
use larder_engine::{FetchError, FetchErrorKind, FetchRequest, FetchResponse, Fetcher};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::watch;

#[derive(Clone)]
enum Remote {
    Body(Bytes),
    Fail(FetchErrorKind),
}

/// Serves registered URLs from memory and records every request.
#[allow(dead_code)]
pub struct MockFetcher {
    remotes: Mutex<HashMap<String, Remote>>,
    unchanged: Mutex<Vec<String>>,
    requests: Mutex<Vec<FetchRequest>>,
    size_lookups: Mutex<Vec<String>>,
    gate: watch::Sender<bool>,
}

#[allow(dead_code)]
impl MockFetcher {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            remotes: Mutex::new(HashMap::new()),
            unchanged: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            size_lookups: Mutex::new(Vec::new()),
            gate,
        }
    }

    /// Serve `body` for `url`.
    pub fn serve(&self, url: &str, body: impl Into<Bytes>) {
        self.remotes
            .lock()
            .unwrap()
            .insert(url.to_string(), Remote::Body(body.into()));
    }

    /// Fail every request for `url`.
    pub fn fail(&self, url: &str, kind: FetchErrorKind) {
        self.remotes
            .lock()
            .unwrap()
            .insert(url.to_string(), Remote::Fail(kind));
    }

    /// Answer conditional requests for `url` with not modified.
    pub fn unchanged(&self, url: &str) {
        self.unchanged.lock().unwrap().push(url.to_string());
    }

    /// Hold all transfers until `open` is called.
    pub fn close(&self) {
        self.gate.send_replace(false);
    }

    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    /// Requests made for `url`.
    pub fn requests_for(&self, url: &str) -> Vec<FetchRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url == url)
            .cloned()
            .collect()
    }

    pub fn fetch_count(&self, url: &str) -> usize {
        self.requests_for(url).len()
    }

    pub fn total_fetches(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// URLs requested in order.
    pub fn fetched_urls(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.url.clone())
            .collect()
    }

    pub fn size_lookups(&self) -> usize {
        self.size_lookups.lock().unwrap().len()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        self.requests.lock().unwrap().push(request.clone());

        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        let conditional = request.if_modified_since.is_some()
            && self.unchanged.lock().unwrap().contains(&request.url);
        if conditional {
            return Err(FetchError::new(
                FetchErrorKind::NotModified,
                &request.url,
                "not modified",
            ));
        }

        let remote = self.remotes.lock().unwrap().get(&request.url).cloned();
        match remote {
            Some(Remote::Body(body)) => {
                let chunks: Vec<Result<Bytes, FetchError>> = body
                    .chunks(1024)
                    .map(|c| Ok(Bytes::copy_from_slice(c)))
                    .collect();
                Ok(FetchResponse {
                    content_length: Some(body.len() as u64),
                    content_type: None,
                    body: Box::pin(futures::stream::iter(chunks)),
                })
            }
            Some(Remote::Fail(kind)) => Err(FetchError::new(kind, &request.url, "mock failure")),
            None => Err(FetchError::new(
                FetchErrorKind::NotFound,
                &request.url,
                "no such file",
            )),
        }
    }

    async fn remote_size(&self, url: &str) -> Result<Option<u64>, FetchError> {
        self.size_lookups.lock().unwrap().push(url.to_string());
        match self.remotes.lock().unwrap().get(url) {
            Some(Remote::Body(body)) => Ok(Some(body.len() as u64)),
            Some(Remote::Fail(kind)) => Err(FetchError::new(*kind, url, "mock failure")),
            None => Ok(None),
        }
    }
}
