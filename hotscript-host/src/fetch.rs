//! Network fetch collaborator
//!
//! Used for the blacklist, update manifests and script downloads.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;

/// Errors fetching a resource
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("No resource at {0}")]
    NotFound(String),
}

/// Fetches text resources
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn get_text(&self, url: &str) -> Result<String, FetchError>;
}

/// HTTP(S) fetcher backed by reqwest
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    timeout: Duration,
    user_agent: String,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            user_agent: format!("hotscript/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    // Built per request: callers run on short-lived runtimes and pooled
    // connections must not outlive the runtime that opened them.
    fn client(&self) -> Result<reqwest::Client, FetchError> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent.clone())
            .build()
            .map_err(FetchError::Client)
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let response = self
            .client()?
            .get(url)
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        response.text().await.map_err(|source| FetchError::Request {
            url: url.to_string(),
            source,
        })
    }
}

/// In-memory fetcher for offline hosts and tests
#[derive(Debug, Default)]
pub struct StaticFetcher {
    resources: RwLock<HashMap<String, String>>,
    requests: Mutex<Vec<String>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, url: impl Into<String>, body: impl Into<String>) -> Self {
        self.insert(url, body);
        self
    }

    pub fn insert(&self, url: impl Into<String>, body: impl Into<String>) {
        self.resources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.into(), body.into());
    }

    pub fn remove(&self, url: &str) {
        self.resources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(url);
    }

    /// Every URL requested so far, in order
    pub fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(url.to_string());
        self.resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(url.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_fetcher() {
        let fetcher = StaticFetcher::new().with("https://a.example/list.csv", "Foo.Bar,1");

        assert_eq!(
            fetcher.get_text("https://a.example/list.csv").await.unwrap(),
            "Foo.Bar,1"
        );
        assert!(matches!(
            fetcher.get_text("https://a.example/missing").await,
            Err(FetchError::NotFound(_))
        ));
        assert_eq!(fetcher.requests().len(), 2);
    }

    #[test]
    fn test_http_client_builds() {
        let fetcher = HttpFetcher::default().with_user_agent("test-agent");
        assert!(fetcher.client().is_ok());
    }
}
