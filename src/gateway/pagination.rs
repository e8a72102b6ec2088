use std::future::Future;

use futures::{Stream, TryStreamExt};

use crate::error::GatewayError;

/// Where the next page starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    Offset(u64),
    Token(String),
}

impl Cursor {
    /// Offset to request; a token cursor on an offset endpoint restarts at 0.
    pub fn offset(&self) -> u64 {
        match self {
            Cursor::Offset(o) => *o,
            Cursor::Token(_) => 0,
        }
    }

    /// Continuation token, `None` for the first page.
    pub fn token(&self) -> Option<&str> {
        match self {
            Cursor::Token(t) => Some(t),
            Cursor::Offset(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Total item count reported by the service, when it reports one.
    pub total: Option<u64>,
    pub next: Option<Cursor>,
}

impl<T> Page<T> {
    /// Offset-paginated page: the next offset is derived from where this page started.
    pub fn at_offset(items: Vec<T>, offset: u64, total: Option<u64>) -> Self {
        let next = Some(Cursor::Offset(offset + items.len() as u64));
        Self { items, total, next }
    }
}

struct PageState<F> {
    fetch: F,
    cursor: Option<Cursor>,
    seen: u64,
}

/// Lazily walk a paginated endpoint starting at `start`.
///
/// Continues while fewer than `total` items were seen and the page carried a continuation.
/// An empty page always ends the walk, so a misreported total cannot loop forever.
/// The stream can only be restarted from the beginning.
pub fn paginate<T, F, Fut>(
    start: Cursor,
    fetch: F,
) -> impl Stream<Item = Result<Vec<T>, GatewayError>>
where
    F: FnMut(Cursor) -> Fut,
    Fut: Future<Output = Result<Page<T>, GatewayError>>,
{
    let state = PageState {
        fetch,
        cursor: Some(start),
        seen: 0,
    };
    futures::stream::try_unfold(state, |mut st| async move {
        let Some(cursor) = st.cursor.take() else {
            return Ok(None);
        };
        let page = (st.fetch)(cursor).await?;
        st.seen += page.items.len() as u64;
        let more = match page.total {
            Some(total) => st.seen < total,
            None => true,
        };
        if more && !page.items.is_empty() {
            st.cursor = page.next;
        }
        Ok(Some((page.items, st)))
    })
}

/// Drain every page into one vector.
pub async fn collect_paginated<T, F, Fut>(start: Cursor, fetch: F) -> Result<Vec<T>, GatewayError>
where
    F: FnMut(Cursor) -> Fut,
    Fut: Future<Output = Result<Page<T>, GatewayError>>,
{
    paginate(start, fetch).try_concat().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn offset_pages(
        data: Vec<u32>,
        page_size: usize,
        calls: Arc<AtomicUsize>,
    ) -> impl FnMut(Cursor) -> futures::future::Ready<Result<Page<u32>, GatewayError>> {
        move |cursor| {
            calls.fetch_add(1, Ordering::SeqCst);
            let offset = match cursor {
                Cursor::Offset(o) => o as usize,
                Cursor::Token(_) => unreachable!("offset endpoint"),
            };
            let end = (offset + page_size).min(data.len());
            let items = data.get(offset..end).unwrap_or_default().to_vec();
            futures::future::ready(Ok(Page::at_offset(
                items,
                offset as u64,
                Some(data.len() as u64),
            )))
        }
    }

    #[tokio::test]
    async fn stops_once_total_is_reached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let all = collect_paginated(
            Cursor::Offset(0),
            offset_pages((1..=5).collect(), 2, calls.clone()),
        )
        .await
        .unwrap();
        assert_eq!(all, vec![1, 2, 3, 4, 5]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exact_multiple_does_not_fetch_an_extra_page() {
        let calls = Arc::new(AtomicUsize::new(0));
        let all = collect_paginated(
            Cursor::Offset(0),
            offset_pages((1..=4).collect(), 2, calls.clone()),
        )
        .await
        .unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn token_cursor_ends_without_continuation() {
        let pages = vec![
            Page {
                items: vec!["a", "b"],
                total: None,
                next: Some(Cursor::Token("t1".into())),
            },
            Page {
                items: vec!["c"],
                total: None,
                next: None,
            },
        ];
        let mut iter = pages.into_iter();
        let all = collect_paginated(Cursor::Token(String::new()), move |_| {
            let page = iter.next().ok_or_else(|| GatewayError::Endpoint("over-fetched".into()));
            async move { page }
        })
        .await
        .unwrap();
        assert_eq!(all, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn errors_surface_from_the_failing_page() {
        let mut n = 0;
        let res = collect_paginated(Cursor::Offset(0), move |cursor| {
            n += 1;
            let out = if n == 1 {
                Ok(Page::at_offset(vec![1u8], 0, Some(3)))
            } else {
                Err(GatewayError::Endpoint(format!("boom at {cursor:?}")))
            };
            async move { out }
        })
        .await;
        assert!(matches!(res, Err(GatewayError::Endpoint(_))));
    }
}
