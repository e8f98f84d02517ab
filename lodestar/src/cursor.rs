//! Lazy paginated cursor
//!
//! A [`Cursor`] pulls pages from a [`PageSource`] on demand. The server hands
//! back an opaque page state with every non-final page; the cursor sends it
//! back verbatim to get the next one.
//!
//! ```text
//! Init -> Fetching -> Active -> Exhausted
//!            ^          |
//!            +----------+   (buffer drained, page state present)
//! any state -> Closed
//! ```

use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::Stream;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Query parameters of a `find`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub filter: Option<Value>,
    pub sort: Option<Value>,
    pub projection: Option<Value>,
    pub skip: Option<u64>,
    /// Maximum number of documents the cursor yields
    pub limit: Option<u64>,
    pub include_similarity: bool,
}

impl FindOptions {
    /// `find` payload for the given page state
    pub fn to_payload(&self, page_state: Option<&str>) -> Value {
        let mut payload = Map::new();
        if let Some(filter) = &self.filter {
            payload.insert("filter".to_string(), filter.clone());
        }
        if let Some(sort) = &self.sort {
            payload.insert("sort".to_string(), sort.clone());
        }
        if let Some(projection) = &self.projection {
            payload.insert("projection".to_string(), projection.clone());
        }

        let mut options = Map::new();
        if let Some(skip) = self.skip {
            options.insert("skip".to_string(), Value::from(skip));
        }
        if let Some(limit) = self.limit {
            options.insert("limit".to_string(), Value::from(limit));
        }
        if self.include_similarity {
            options.insert("includeSimilarity".to_string(), Value::Bool(true));
        }
        if let Some(state) = page_state {
            options.insert("pageState".to_string(), Value::String(state.to_string()));
        }
        if !options.is_empty() {
            payload.insert("options".to_string(), Value::Object(options));
        }
        Value::Object(payload)
    }

    /// Options for fetching the single document at `offset`
    fn single_at(&self, offset: u64) -> Self {
        Self {
            filter: self.filter.clone(),
            sort: self.sort.clone(),
            projection: self.projection.clone(),
            skip: Some(offset),
            limit: Some(1),
            include_similarity: self.include_similarity,
        }
    }
}

/// One page of results
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub results: Vec<T>,
    /// State for the next page; `None` on the last page
    pub page_state: Option<String>,
}

impl<T> Page<T> {
    pub fn new(results: Vec<T>, page_state: Option<String>) -> Self {
        Self {
            results,
            page_state,
        }
    }

    pub fn size(&self) -> usize {
        self.results.len()
    }
}

/// Fetches one page for a query
#[async_trait]
pub trait PageSource<T: Send>: Send + Sync {
    async fn fetch_page(&self, options: &FindOptions, page_state: Option<&str>) -> Result<Page<T>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Init,
    Fetching,
    Active,
    Exhausted,
    Closed,
}

/// Single-consumer iterator over a paged query
pub struct Cursor<T: Send> {
    source: Arc<dyn PageSource<T>>,
    options: FindOptions,
    buffer: VecDeque<T>,
    page_state: Option<String>,
    state: CursorState,
    consumed: u64,
}

impl<T: Send> fmt::Debug for Cursor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("options", &self.options)
            .field("state", &self.state)
            .field("buffered", &self.buffer.len())
            .field("consumed", &self.consumed)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Cursor<T> {
    pub fn new(source: Arc<dyn PageSource<T>>, options: FindOptions) -> Self {
        Self {
            source,
            options,
            buffer: VecDeque::new(),
            page_state: None,
            state: CursorState::Init,
            consumed: 0,
        }
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn options(&self) -> &FindOptions {
        &self.options
    }

    /// Items handed out so far
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Items fetched but not yet handed out
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Next item, fetching a page when the buffer is empty.
    ///
    /// Returns `Ok(None)` once the cursor is exhausted or closed.
    pub async fn next(&mut self) -> Result<Option<T>> {
        loop {
            if matches!(self.state, CursorState::Exhausted | CursorState::Closed) {
                return Ok(None);
            }
            if self.options.limit.is_some_and(|limit| self.consumed >= limit) {
                self.buffer.clear();
                self.state = CursorState::Exhausted;
                return Ok(None);
            }
            if let Some(item) = self.buffer.pop_front() {
                self.consumed += 1;
                return Ok(Some(item));
            }
            if self.state == CursorState::Active && self.page_state.is_none() {
                self.state = CursorState::Exhausted;
                return Ok(None);
            }
            self.fetch().await?;
        }
    }

    async fn fetch(&mut self) -> Result<()> {
        let previous = self.state;
        let sent = self.page_state.take();
        self.state = CursorState::Fetching;

        let page = match self.source.fetch_page(&self.options, sent.as_deref()).await {
            Ok(page) => page,
            Err(e) => {
                self.page_state = sent;
                self.state = previous;
                return Err(e);
            }
        };

        if sent.is_some() && page.page_state == sent {
            self.state = CursorState::Closed;
            return Err(Error::FaultyResponse(
                "server returned the page state it was given".to_string(),
            ));
        }

        self.page_state = page.page_state;
        self.buffer.extend(page.results);
        self.state = if self.buffer.is_empty() && self.page_state.is_none() {
            CursorState::Exhausted
        } else {
            CursorState::Active
        };
        Ok(())
    }

    /// Fetch the item at `offset` of the query without touching the cursor
    pub async fn get_item(&self, offset: u64) -> Result<Option<T>> {
        let page = self
            .source
            .fetch_page(&self.options.single_at(offset), None)
            .await?;
        Ok(page.results.into_iter().next())
    }

    /// First item of the query
    pub async fn first(&self) -> Result<Option<T>> {
        self.get_item(0).await
    }

    /// Drain every item. Only valid on a cursor that has not started.
    pub async fn all(&mut self) -> Result<Vec<T>> {
        if self.state != CursorState::Init {
            return Err(Error::CursorState(format!(
                "all() needs a fresh cursor, current state is {:?}",
                self.state
            )));
        }
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }

    /// Stop iterating and release buffered items
    pub fn close(&mut self) {
        self.buffer.clear();
        self.page_state = None;
        self.state = CursorState::Closed;
    }

    /// Consume the cursor as a stream of items
    pub fn into_stream(self) -> impl Stream<Item = Result<T>> {
        let mut cursor = self;
        async_stream::try_stream! {
            while let Some(item) = cursor.next().await? {
                yield item;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Serves fixed pages keyed by page state ("" for the first page)
    struct FixedPages {
        pages: Vec<(Option<&'static str>, Vec<u32>, Option<&'static str>)>,
        calls: Mutex<Vec<(FindOptions, Option<String>)>>,
    }

    impl FixedPages {
        fn new(pages: Vec<(Option<&'static str>, Vec<u32>, Option<&'static str>)>) -> Arc<Self> {
            Arc::new(Self {
                pages,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl PageSource<u32> for FixedPages {
        async fn fetch_page(&self, options: &FindOptions, page_state: Option<&str>) -> Result<Page<u32>> {
            self.calls
                .lock()
                .push((options.clone(), page_state.map(String::from)));
            if let Some(skip) = options.skip {
                let all: Vec<u32> = self.pages.iter().flat_map(|(_, r, _)| r.clone()).collect();
                return Ok(Page::new(all.into_iter().skip(skip as usize).take(1).collect(), None));
            }
            let (_, results, next) = self
                .pages
                .iter()
                .find(|(state, _, _)| *state == page_state)
                .ok_or_else(|| Error::FaultyResponse("unknown page".to_string()))?;
            Ok(Page::new(results.clone(), next.map(String::from)))
        }
    }

    fn three_pages() -> Arc<FixedPages> {
        FixedPages::new(vec![
            (None, vec![1, 2], Some("p2")),
            (Some("p2"), vec![3, 4], Some("p3")),
            (Some("p3"), vec![5], None),
        ])
    }

    #[test]
    fn test_find_payload() {
        let options = FindOptions {
            filter: Some(json!({"status": "active"})),
            sort: Some(json!({"$vector": [0.1, 0.2]})),
            limit: Some(10),
            include_similarity: true,
            ..Default::default()
        };
        assert_eq!(
            options.to_payload(Some("abc")),
            json!({
                "filter": {"status": "active"},
                "sort": {"$vector": [0.1, 0.2]},
                "options": {"limit": 10, "includeSimilarity": true, "pageState": "abc"}
            })
        );
        assert_eq!(FindOptions::default().to_payload(None), json!({}));
    }

    #[tokio::test]
    async fn test_iterates_all_pages_then_stops() {
        let source = three_pages();
        let mut cursor = Cursor::new(source.clone(), FindOptions::default());
        assert_eq!(cursor.state(), CursorState::Init);

        let mut seen = Vec::new();
        while let Some(item) = cursor.next().await.unwrap() {
            assert_eq!(cursor.state(), CursorState::Active);
            seen.push(item);
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        assert_eq!(cursor.state(), CursorState::Exhausted);
        assert_eq!(source.call_count(), 3);

        assert!(cursor.next().await.unwrap().is_none());
        assert_eq!(source.call_count(), 3);
    }

    #[tokio::test]
    async fn test_page_state_sent_back_verbatim() {
        let source = three_pages();
        let mut cursor = Cursor::new(source.clone(), FindOptions::default());
        cursor.all().await.unwrap();

        let states: Vec<Option<String>> = source.calls.lock().iter().map(|(_, s)| s.clone()).collect();
        assert_eq!(states, vec![None, Some("p2".to_string()), Some("p3".to_string())]);
    }

    #[tokio::test]
    async fn test_all_only_from_init() {
        let mut cursor = Cursor::new(three_pages(), FindOptions::default());
        assert_eq!(cursor.all().await.unwrap(), vec![1, 2, 3, 4, 5]);

        let err = cursor.all().await.unwrap_err();
        assert!(matches!(err, Error::CursorState(_)));

        let mut started = Cursor::new(three_pages(), FindOptions::default());
        started.next().await.unwrap();
        assert!(started.all().await.is_err());
    }

    #[tokio::test]
    async fn test_empty_result_exhausts_immediately() {
        let mut cursor = Cursor::new(FixedPages::new(vec![(None, vec![], None)]), FindOptions::default());
        assert!(cursor.next().await.unwrap().is_none());
        assert_eq!(cursor.state(), CursorState::Exhausted);
    }

    #[tokio::test]
    async fn test_empty_page_with_state_continues() {
        let source = FixedPages::new(vec![(None, vec![], Some("p2")), (Some("p2"), vec![7], None)]);
        let mut cursor = Cursor::new(source, FindOptions::default());
        assert_eq!(cursor.next().await.unwrap(), Some(7));
        assert!(cursor.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_repeated_page_state_is_faulty() {
        let source = FixedPages::new(vec![(None, vec![1], Some("loop")), (Some("loop"), vec![2], Some("loop"))]);
        let mut cursor = Cursor::new(source, FindOptions::default());
        assert_eq!(cursor.next().await.unwrap(), Some(1));
        let err = cursor.next().await.unwrap_err();
        assert!(matches!(err, Error::FaultyResponse(_)));
        assert_eq!(cursor.state(), CursorState::Closed);
    }

    #[tokio::test]
    async fn test_limit_caps_consumption() {
        let options = FindOptions {
            limit: Some(3),
            ..Default::default()
        };
        let mut cursor = Cursor::new(three_pages(), options);
        assert_eq!(cursor.all().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(cursor.buffered(), 0);
    }

    #[tokio::test]
    async fn test_close_stops_iteration() {
        let mut cursor = Cursor::new(three_pages(), FindOptions::default());
        cursor.next().await.unwrap();
        assert_eq!(cursor.buffered(), 1);

        cursor.close();
        assert_eq!(cursor.state(), CursorState::Closed);
        assert_eq!(cursor.buffered(), 0);
        assert!(cursor.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_item_is_independent() {
        let source = three_pages();
        let options = FindOptions {
            filter: Some(json!({"a": 1})),
            include_similarity: true,
            ..Default::default()
        };
        let cursor = Cursor::new(source.clone(), options);

        assert_eq!(cursor.get_item(3).await.unwrap(), Some(4));
        assert_eq!(cursor.first().await.unwrap(), Some(1));
        assert_eq!(cursor.state(), CursorState::Init);

        let (sent, state) = source.calls.lock()[0].clone();
        assert_eq!(sent.skip, Some(3));
        assert_eq!(sent.limit, Some(1));
        assert!(sent.include_similarity);
        assert_eq!(sent.filter, Some(json!({"a": 1})));
        assert!(state.is_none());
    }

    #[tokio::test]
    async fn test_into_stream() {
        let cursor = Cursor::new(three_pages(), FindOptions::default());
        let items: Vec<u32> = cursor.into_stream().try_collect().await.unwrap();
        assert_eq!(items, vec![1, 2, 3, 4, 5]);
    }
}
