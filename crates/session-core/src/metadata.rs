//! Cancellable metadata acquisition. The fetcher wraps a user-supplied
//! async function with cancellation plumbing, kind-based error dispatch,
//! and a one-shot token cache.

use crate::error::MetadataErrorKind;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Connection parameters resolved by a successful metadata fetch.
///
/// `Deserialize` is derived because a typical `fetch_connection_metadata`
/// implementation is an HTTP call whose JSON response body is exactly this
/// shape; callers can `serde_json::from_slice` straight into it instead of
/// hand-rolling field extraction.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConnectionMetadata {
    /// The endpoint the transport should connect to.
    pub url: String,
    /// The credential to present to that endpoint.
    pub token: String,
}

type FetchFuture =
    Pin<Box<dyn Future<Output = std::result::Result<ConnectionMetadata, MetadataErrorKind>> + Send>>;

/// A user-supplied metadata-fetch function, racing cooperatively against a
/// [`CancellationToken`] it receives each call.
pub type FetchFn = Arc<dyn Fn(CancellationToken) -> FetchFuture + Send + Sync>;

/// Wraps a [`FetchFn`] with cancellation plumbing and a one-token cache.
pub struct MetadataFetcher {
    fetch_fn: FetchFn,
    cached: Option<ConnectionMetadata>,
    /// `true` iff the current `cached` value has not yet been spent on a
    /// reuse attempt; a cached value may be reused exactly once.
    available: bool,
}

impl MetadataFetcher {
    /// Wrap a user fetch function.
    pub fn new(fetch_fn: FetchFn) -> Self {
        Self {
            fetch_fn,
            cached: None,
            available: false,
        }
    }

    /// Resolve connection metadata, racing the user function against
    /// `cancel`. Spends the cache if one is available, otherwise invokes
    /// the user function and (on success) refreshes the cache for a future
    /// reuse opportunity.
    pub async fn fetch(
        &mut self,
        cancel: CancellationToken,
    ) -> std::result::Result<ConnectionMetadata, MetadataErrorKind> {
        if self.available {
            if let Some(cached) = self.cached.clone() {
                self.available = false;
                return Ok(cached);
            }
        }

        let fetch = (self.fetch_fn)(cancel.clone());
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(MetadataErrorKind::Aborted),
            result = fetch => {
                match result {
                    Ok(meta) => {
                        self.cached = Some(meta.clone());
                        self.available = true;
                        Ok(meta)
                    }
                    Err(kind) => Err(kind),
                }
            }
        }
    }

    /// Discard the cache after a reused token led to a failed `connected`.
    pub fn invalidate_cache(&mut self) {
        self.cached = None;
        self.available = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_fetcher(
        calls: Arc<AtomicU32>,
        result: std::result::Result<ConnectionMetadata, MetadataErrorKind>,
    ) -> MetadataFetcher {
        MetadataFetcher::new(Arc::new(move |_token| {
            calls.fetch_add(1, Ordering::SeqCst);
            let result = result.clone();
            Box::pin(async move { result })
        }))
    }

    #[tokio::test]
    async fn reuses_cache_exactly_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let meta = ConnectionMetadata {
            url: "wss://example".into(),
            token: "tok".into(),
        };
        let mut fetcher = counting_fetcher(calls.clone(), Ok(meta.clone()));

        let first = fetcher.fetch(CancellationToken::new()).await.unwrap();
        assert_eq!(first.token, "tok");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let second = fetcher.fetch(CancellationToken::new()).await.unwrap();
        assert_eq!(second.token, "tok");
        assert_eq!(calls.load(Ordering::SeqCst), 1, "second fetch should be served from cache");

        let _third = fetcher.fetch(CancellationToken::new()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2, "cache spent after one reuse");
    }

    #[tokio::test]
    async fn invalidate_forces_fresh_fetch() {
        let calls = Arc::new(AtomicU32::new(0));
        let meta = ConnectionMetadata {
            url: "wss://example".into(),
            token: "tok".into(),
        };
        let mut fetcher = counting_fetcher(calls.clone(), Ok(meta));

        fetcher.fetch(CancellationToken::new()).await.unwrap();
        fetcher.invalidate_cache();
        fetcher.fetch(CancellationToken::new()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn parses_from_a_json_metadata_response_body() {
        let body = r#"{"url": "wss://example/session", "token": "abc123"}"#;
        let meta: ConnectionMetadata = serde_json::from_str(body).unwrap();
        assert_eq!(meta.url, "wss://example/session");
        assert_eq!(meta.token, "abc123");
    }

    #[tokio::test]
    async fn cancellation_yields_aborted() {
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();
        let calls_clone = calls.clone();
        let fetcher_fn: FetchFn = Arc::new(move |_token| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(std::future::pending())
        });
        let mut fetcher = MetadataFetcher::new(fetcher_fn);

        token.cancel();
        let result = fetcher.fetch(token).await;
        assert!(matches!(result, Err(MetadataErrorKind::Aborted)));
    }
}
