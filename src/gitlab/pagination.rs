//! Cursor pagination over GitLab connections.
//!
//! GraphQL connections can nest: a page of projects carries the first page of
//! each project's pipelines, each pipeline the first page of its jobs, and so
//! on. [`flatten_nested`] walks the outer collection page by page and, when an
//! inline inner page reports more data, drains the remainder with a narrower
//! query scoped to that one parent instead of re-paginating the outer
//! collection.

use std::future::Future;
use std::hash::Hash;
use std::marker::PhantomData;

use futures::stream::{self, Stream, TryStreamExt};
use indexmap::IndexMap;
use serde::Deserialize;

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub end_cursor: Option<String>,
    #[serde(default)]
    pub has_next_page: bool,
}

/// GraphQL connection as it appears in responses.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection<T> {
    #[serde(default = "Vec::new")]
    pub nodes: Vec<Option<T>>,
    #[serde(default)]
    pub page_info: PageInfo,
}

impl<T> Default for Connection<T> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            page_info: PageInfo::default(),
        }
    }
}

/// One page of a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page_info: PageInfo,
}

impl<T> Page<T> {
    /// A page with no continuation.
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            page_info: PageInfo::default(),
        }
    }

    pub fn with_next(items: Vec<T>, cursor: impl Into<String>) -> Self {
        Self {
            items,
            page_info: PageInfo {
                end_cursor: Some(cursor.into()),
                has_next_page: true,
            },
        }
    }

    /// Cursor of the next page, if there is one to fetch.
    ///
    /// A page claiming more data without a cursor is treated as the last one
    /// to avoid looping on the same page forever.
    pub fn next_cursor(&self) -> Option<String> {
        if self.page_info.has_next_page {
            self.page_info.end_cursor.clone()
        } else {
            None
        }
    }
}

impl<T> From<Connection<T>> for Page<T> {
    fn from(connection: Connection<T>) -> Self {
        Self {
            items: connection.nodes.into_iter().flatten().collect(),
            page_info: connection.page_info,
        }
    }
}

impl<T> From<Option<Connection<T>>> for Page<T> {
    fn from(connection: Option<Connection<T>>) -> Self {
        connection.map(Page::from).unwrap_or_else(|| Page::last(Vec::new()))
    }
}

/// Lazy, resumable walk over a cursor-paginated collection.
///
/// A failed fetch leaves the cursor where it was, so calling
/// [`Paginator::next_page`] again retries the same page.
pub struct Paginator<T, F> {
    fetch: F,
    cursor: Option<String>,
    done: bool,
    _item: PhantomData<fn() -> T>,
}

impl<T, F, Fut> Paginator<T, F>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>>>,
{
    pub fn new(fetch: F) -> Self {
        Self::resume(fetch, None)
    }

    /// Starts from a cursor obtained earlier.
    pub fn resume(fetch: F, cursor: Option<String>) -> Self {
        Self {
            fetch,
            cursor,
            done: false,
            _item: PhantomData,
        }
    }

    pub async fn next_page(&mut self) -> Result<Option<Vec<T>>> {
        if self.done {
            return Ok(None);
        }

        let page = (self.fetch)(self.cursor.clone()).await?;

        match page.next_cursor() {
            Some(cursor) => self.cursor = Some(cursor),
            None => self.done = true,
        }

        Ok(Some(page.items))
    }

    pub async fn collect_all(self) -> Result<Vec<T>> {
        self.into_item_stream().try_collect().await
    }

    /// Pages as a stream.
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<T>>> {
        stream::try_unfold(self, |mut paginator| async move {
            Ok(paginator
                .next_page()
                .await?
                .map(|items| (items, paginator)))
        })
    }

    /// Individual items as a stream.
    pub fn into_item_stream(self) -> impl Stream<Item = Result<T>> {
        self.into_stream()
            .map_ok(|items| stream::iter(items.into_iter().map(Ok::<T, SyncError>)))
            .try_flatten()
    }
}

/// An outer element carrying the first page of an inner collection.
pub trait HasInner {
    type Inner;

    /// Moves the inline inner page out of the element.
    fn take_inner(&mut self) -> Page<Self::Inner>;
}

/// An outer element with its inner collection fully drained.
#[derive(Debug, Clone, PartialEq)]
pub struct Nested<O, I> {
    pub parent: O,
    pub inner: Vec<I>,
}

/// Returns the items of `first` plus every remaining page fetched through
/// `fetch_rest`, starting at `first`'s cursor.
pub async fn drain_inner<I, F, Fut>(first: Page<I>, fetch_rest: F) -> Result<Vec<I>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<I>>>,
{
    let cursor = first.next_cursor();
    let mut items = first.items;

    let Some(cursor) = cursor else {
        return Ok(items);
    };

    let mut rest = Paginator::resume(fetch_rest, Some(cursor));
    while let Some(page) = rest.next_page().await? {
        items.extend(page);
    }
    Ok(items)
}

/// Walks an outer collection and drains each element's inner collection.
///
/// Outer pages are fetched exactly once. For each element, inline inner items
/// are kept and, if the inline page has a continuation, the rest is fetched
/// with `fetch_inner` scoped to that element before moving on. Results keep
/// outer-then-inner order.
pub async fn flatten_nested<O, FO, FutO, FI, FutI>(
    fetch_outer: FO,
    mut fetch_inner: FI,
) -> Result<Vec<Nested<O, O::Inner>>>
where
    O: HasInner,
    FO: FnMut(Option<String>) -> FutO,
    FutO: Future<Output = Result<Page<O>>>,
    FI: FnMut(&O, Option<String>) -> FutI,
    FutI: Future<Output = Result<Page<O::Inner>>>,
{
    let mut outer = Paginator::new(fetch_outer);
    let mut nested = Vec::new();

    while let Some(page) = outer.next_page().await? {
        for mut parent in page {
            let first = parent.take_inner();
            let inner = drain_inner(first, |cursor| fetch_inner(&parent, cursor)).await?;
            nested.push(Nested { parent, inner });
        }
    }

    Ok(nested)
}

/// Outcome of merging partial records into base records.
#[derive(Debug)]
pub struct MergeOutcome<K, B> {
    pub records: Vec<B>,
    /// Keys of partial records whose base record never showed up
    pub orphans: Vec<K>,
}

/// Merges partial records, fetched with a different field set, into base
/// records sharing the same primary key.
///
/// Partials without a matching base record are not merged; their keys are
/// returned in [`MergeOutcome::orphans`] so the caller can report them.
pub fn merge_partials<K, B, P>(
    base: Vec<B>,
    partials: impl IntoIterator<Item = P>,
    base_key: impl Fn(&B) -> K,
    partial_key: impl Fn(&P) -> K,
    mut merge: impl FnMut(&mut B, P),
) -> MergeOutcome<K, B>
where
    K: Hash + Eq,
{
    let mut lookup: IndexMap<K, B> = base.into_iter().map(|b| (base_key(&b), b)).collect();
    let mut orphans = Vec::new();

    for partial in partials {
        let key = partial_key(&partial);
        match lookup.get_mut(&key) {
            Some(record) => merge(record, partial),
            None => orphans.push(key),
        }
    }

    MergeOutcome {
        records: lookup.into_values().collect(),
        orphans,
    }
}
