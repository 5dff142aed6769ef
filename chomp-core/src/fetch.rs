//! Generic HTTP fetch helpers shared by the HTTP API and static scraper
//! ingester families (spec.md §4.6-§4.7). `fetch_text` is a direct port of
//! `examples/original_source/src/collectors/http_api.py::fetch_json`
//! (treat a non-2xx response as an empty body rather than an error, since
//! the caller already falls back to cache on an empty/unparsable result).
//!
//! [`PagedFetcher`] generalizes the read-ahead pagination loop from this
//! crate's own prior life as a single-endpoint Chron client: instead of one
//! hardcoded host, any closure that turns a cursor into the next page works,
//! which is what both a paginated HTTP API ingester and `evm_logger`'s
//! block-range catch-up need.

use std::future::Future;
use std::pin::Pin;

use futures::{stream, Stream, StreamExt};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("error building request")]
    Build(#[source] reqwest::Error),
    #[error("error executing request")]
    Execute(#[source] reqwest::Error),
    #[error("server returned an error status")]
    Status(#[source] reqwest::Error),
    #[error("error reading response body")]
    Body(#[source] reqwest::Error),
    #[error("background fetch task exited abnormally")]
    JoinFailure(#[source] tokio::task::JoinError),
}

/// GETs `url` and returns the body text, or `Ok(String::new())` on a non-2xx
/// status -- callers treat an empty body as a cache-miss-that-stays-missed,
/// not a hard failure (matches the original `fetch_json`).
pub async fn fetch_text(client: &reqwest::Client, url: &str) -> Result<String, FetchError> {
    let response = client.get(url).send().await.map_err(FetchError::Execute)?;
    if !response.status().is_success() {
        return Ok(String::new());
    }
    response.text().await.map_err(FetchError::Body)
}

type PageFuture<P> = Pin<Box<dyn Future<Output = Result<(Vec<P>, Option<String>), FetchError>> + Send>>;

/// Drives a cursor-paginated endpoint with one page prefetched ahead of the
/// consumer, so the caller never blocks on network latency between pages it
/// has already started requesting.
pub struct PagedFetcher<P, F> {
    next_page_fn: F,
    _marker: std::marker::PhantomData<P>,
}

impl<P, F> PagedFetcher<P, F>
where
    P: Send + 'static,
    F: Fn(Option<String>) -> PageFuture<P> + Clone + Send + 'static,
{
    pub fn new(next_page_fn: F) -> Self {
        Self {
            next_page_fn,
            _marker: std::marker::PhantomData,
        }
    }

    /// Streams items across all pages, starting from `cursor` (`None` for
    /// the first page).
    pub fn items(self, cursor: Option<String>) -> impl Stream<Item = Result<P, FetchError>> {
        self.pages(cursor).flat_map(|page| match page {
            Ok(items) => stream::iter(items.into_iter().map(Ok)).left_stream(),
            Err(e) => stream::once(async { Err(e) }).right_stream(),
        })
    }

    fn pages(self, cursor: Option<String>) -> impl Stream<Item = Result<Vec<P>, FetchError>> {
        let next_page_fn = self.next_page_fn;
        let first_fn = next_page_fn.clone();
        let first = tokio::spawn(async move { first_fn(cursor).await });

        stream::unfold(Some((first, next_page_fn)), move |state| async move {
            let Some((pending, next_page_fn)) = state else {
                return None;
            };

            let result = match pending.await {
                Ok(inner) => inner,
                Err(err) => return Some((Err(FetchError::JoinFailure(err)), None)),
            };

            match result {
                Ok((items, next_cursor)) => match next_cursor {
                    Some(cursor) => {
                        let fn_for_next = next_page_fn.clone();
                        let pending_next = tokio::spawn(async move { fn_for_next(Some(cursor)).await });
                        Some((Ok(items), Some((pending_next, next_page_fn))))
                    }
                    None => Some((Ok(items), None)),
                },
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn paged_fetcher_drains_all_pages() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_for_fn = calls.clone();
        let fetcher: PagedFetcher<i32, _> = PagedFetcher::new(move |cursor: Option<String>| {
            let calls = calls_for_fn.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                match cursor.as_deref() {
                    None => Ok((vec![1, 2], Some("p2".to_string()))),
                    Some("p2") => Ok((vec![3], None)),
                    _ => Ok((vec![], None)),
                }
            }) as PageFuture<i32>
        });

        let items: Vec<i32> = fetcher.items(None).map(|r| r.unwrap()).collect().await;
        assert_eq!(items, vec![1, 2, 3]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
