use std::collections::VecDeque;
use std::future::Future;

use crate::error::MedStoreError;

/// Lazy iterator over a cursor-paginated remote listing.
///
/// Wraps an async fetch function `(page_size, cursor) -> (entries,
/// next_cursor)` and yields one entry at a time, fetching a new page only
/// when the buffered one is exhausted. An absent (or empty) next cursor ends
/// the sequence; so does an empty page, even when the server still returned
/// a cursor. With a `limit`, no page beyond the limit is ever requested.
///
/// Iteration is not restartable; a fresh iterator starts again from a null
/// cursor.
pub struct PaginationIterator<T, F, Fut>
where
    F: FnMut(usize, Option<String>) -> Fut,
    Fut: Future<Output = Result<(Vec<T>, Option<String>), MedStoreError>>,
{
    fetch: F,
    page_size: usize,
    limit: Option<usize>,
    cursor: Option<String>,
    buffer: VecDeque<T>,
    yielded: usize,
    done: bool,
}

impl<T, F, Fut> PaginationIterator<T, F, Fut>
where
    F: FnMut(usize, Option<String>) -> Fut,
    Fut: Future<Output = Result<(Vec<T>, Option<String>), MedStoreError>>,
{
    pub fn new(fetch: F, page_size: usize) -> Self {
        PaginationIterator {
            fetch,
            page_size: page_size.max(1),
            limit: None,
            cursor: None,
            buffer: VecDeque::new(),
            yielded: 0,
            done: false,
        }
    }

    /// Cap the total number of entries yielded.
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// Number of entries yielded so far.
    pub fn total(&self) -> usize {
        self.yielded
    }

    pub async fn next_entry(&mut self) -> Result<Option<T>, MedStoreError> {
        loop {
            if self.limit.is_some_and(|limit| self.yielded >= limit) {
                return Ok(None);
            }
            if let Some(entry) = self.buffer.pop_front() {
                self.yielded += 1;
                return Ok(Some(entry));
            }
            if self.done {
                return Ok(None);
            }
            self.fetch_page().await?;
        }
    }

    async fn fetch_page(&mut self) -> Result<(), MedStoreError> {
        let want = match self.limit {
            Some(limit) => self.page_size.min(limit - self.yielded),
            None => self.page_size,
        };
        let (mut entries, next_cursor) = (self.fetch)(want, self.cursor.take()).await?;
        // A page with no entries ends the stream even when the server still
        // handed back a cursor.
        if entries.is_empty() {
            self.done = true;
            return Ok(());
        }
        entries.truncate(want);
        self.cursor = next_cursor.filter(|cursor| !cursor.is_empty());
        if self.cursor.is_none() {
            self.done = true;
        }
        self.buffer.extend(entries);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    /// Fetcher over a fixed data set, counting how often it is called.
    fn pages_fetcher(
        total: usize,
        calls: Arc<AtomicUsize>,
    ) -> impl FnMut(
        usize,
        Option<String>,
    ) -> std::future::Ready<Result<(Vec<usize>, Option<String>), MedStoreError>> {
        move |first, cursor| {
            calls.fetch_add(1, Ordering::SeqCst);
            let start: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
            let end = (start + first).min(total);
            let entries = (start..end).collect::<Vec<_>>();
            let next = (end < total).then(|| end.to_string());
            std::future::ready(Ok((entries, next)))
        }
    }

    #[tokio::test]
    async fn yields_all_entries_in_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut it = PaginationIterator::new(pages_fetcher(10, calls.clone()), 4);
        let mut seen = Vec::new();
        while let Some(entry) = it.next_entry().await.unwrap() {
            seen.push(entry);
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        // ceil(10 / 4) pages, never more
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(it.total(), 10);
    }

    #[tokio::test]
    async fn limit_stops_fetching_early() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut it =
            PaginationIterator::new(pages_fetcher(100, calls.clone()), 4).with_limit(Some(4));
        let mut seen = Vec::new();
        while let Some(entry) = it.next_entry().await.unwrap() {
            seen.push(entry);
        }
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn limit_truncates_mid_page() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut it =
            PaginationIterator::new(pages_fetcher(10, calls.clone()), 4).with_limit(Some(6));
        let mut seen = Vec::new();
        while let Some(entry) = it.next_entry().await.unwrap() {
            seen.push(entry);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_page_with_cursor_terminates() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut it = PaginationIterator::new(
            move |_first, _cursor| {
                counter.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Ok((Vec::<usize>::new(), Some("more".to_string()))))
            },
            4,
        );
        assert!(it.next_entry().await.unwrap().is_none());
        assert!(it.next_entry().await.unwrap().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn propagates_fetch_errors() {
        let mut it = PaginationIterator::new(
            |_first, _cursor: Option<String>| {
                std::future::ready(Err::<(Vec<usize>, Option<String>), _>(
                    MedStoreError::Precondition("boom".into()),
                ))
            },
            4,
        );
        assert!(it.next_entry().await.is_err());
    }
}
