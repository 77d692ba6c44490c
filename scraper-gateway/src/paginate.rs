//! Bounded lazy iteration over externally-paginated results. The driver
//! owns its cursor, dedupe set, and page buffer; callers pull one item at
//! a time and the upstream is only asked for another page when the buffer
//! runs dry.

use crate::error::ScrapeError;
use futures::future::BoxFuture;
use futures::Stream;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};

#[derive(Debug, Default)]
pub struct Page {
    pub items: Vec<Value>,
    pub next_cursor: Option<String>,
}

pub type PageFetcher =
    Box<dyn FnMut(Option<String>) -> BoxFuture<'static, Result<Page, ScrapeError>> + Send>;

pub struct PageDriver {
    fetch: PageFetcher,
    max_items: usize,
    emitted: usize,
    cursor: Option<String>,
    buffer: VecDeque<Value>,
    seen_ids: HashSet<String>,
    exhausted: bool,
}

impl PageDriver {
    pub fn new(fetch: PageFetcher, max_items: usize) -> Self {
        Self {
            fetch,
            max_items: max_items.max(1),
            emitted: 0,
            cursor: None,
            buffer: VecDeque::new(),
            seen_ids: HashSet::new(),
            exhausted: false,
        }
    }

    /// Next item in upstream order, or `None` once `max_items` have been
    /// yielded or the cursor chain ends. Duplicate ids are skipped without
    /// counting against the bound.
    pub async fn next_item(&mut self) -> Result<Option<Value>, ScrapeError> {
        loop {
            if self.emitted >= self.max_items {
                return Ok(None);
            }
            if let Some(item) = self.buffer.pop_front() {
                if let Some(id) = item_id(&item) {
                    if !self.seen_ids.insert(id) {
                        continue;
                    }
                }
                self.emitted += 1;
                return Ok(Some(item));
            }
            if self.exhausted {
                return Ok(None);
            }
            let page = (self.fetch)(self.cursor.clone()).await?;
            match page.next_cursor {
                // A cursor that stopped moving means the upstream is done;
                // fetching it again would loop forever.
                Some(next) if Some(&next) == self.cursor.as_ref() => self.exhausted = true,
                Some(next) => self.cursor = Some(next),
                None => self.exhausted = true,
            }
            if page.items.is_empty() && self.exhausted {
                return Ok(None);
            }
            self.buffer.extend(page.items);
        }
    }

    pub async fn collect(mut self) -> Result<Vec<Value>, ScrapeError> {
        let mut items = Vec::new();
        while let Some(item) = self.next_item().await? {
            items.push(item);
        }
        Ok(items)
    }

    /// Bridge into a `Stream` for line-delimited response bodies.
    pub fn into_stream(self) -> impl Stream<Item = Result<Value, ScrapeError>> + Send {
        futures::stream::unfold(self, |mut driver| async move {
            match driver.next_item().await {
                Ok(Some(item)) => Some((Ok(item), driver)),
                Ok(None) => None,
                Err(err) => Some((Err(err), driver)),
            }
        })
    }
}

/// Identity for dedupe: upstream objects carry their id under one of a few
/// well-known keys depending on the endpoint generation.
pub fn item_id(item: &Value) -> Option<String> {
    for key in ["rest_id", "id_str", "id"] {
        match item.get(key) {
            Some(Value::String(s)) => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}
