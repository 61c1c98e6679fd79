//! Continuation-token pagination.
//!
//! Browse responses carry opaque continuation tokens. [`PaginatedFetcher`]
//! turns those into an exhaustive, deduplicated entity stream: issue the seed
//! request, normalize, then follow continuations strictly sequentially (a
//! continuation is never issued before the prior response resolves, which
//! keeps cursor validity intact) until the stream is exhausted.
//!
//! The resulting stream is one-shot: it is not restartable mid-way, and a
//! fresh fetch always begins from the seed. Callers doing incremental
//! "load more" hold on to the last [`Cursor`] and call
//! [`PaginatedFetcher::fetch_page`] themselves.

use crate::client::InnerTubeClient;
use crate::error::ApiError;
use crate::models::{Cursor, Entity, StreamKind};
use crate::normalize::{self, Extraction};
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use tokio_stream::{Stream, StreamExt};

/// One page of normalized results plus the cursor to the next one, if any.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub entities: Vec<Entity>,
    pub cursor: Option<Cursor>,
}

/// Drives [`InnerTubeClient`] and [`crate::normalize`] across repeated calls
/// following continuation cursors.
#[derive(Debug, Clone)]
pub struct PaginatedFetcher {
    client: InnerTubeClient,
}

impl PaginatedFetcher {
    pub fn new(client: InnerTubeClient) -> Self {
        Self { client }
    }

    /// Fetches a single page: the seed request when `cursor` is `None`, a
    /// continuation otherwise.
    pub async fn fetch_page(
        &self,
        stream: &StreamKind,
        cursor: Option<&Cursor>,
    ) -> Result<Page, ApiError> {
        let response = match cursor {
            None => self.client.browse(&stream.browse_id()).await?,
            Some(cursor) => self.client.browse_continuation(&cursor.token).await?,
        };

        let Extraction {
            entities,
            continuation,
        } = normalize::extract_all(&response);

        tracing::debug!(
            stream = ?stream,
            entities = entities.len(),
            has_continuation = continuation.is_some(),
            "fetched page"
        );

        Ok(Page {
            entities,
            cursor: continuation.map(|token| Cursor {
                token,
                stream: stream.clone(),
            }),
        })
    }

    /// Lazily walks the whole stream, yielding entities one by one across
    /// page boundaries. Cross-page duplicates are filtered by a running id
    /// set for the duration of this one fetch.
    pub fn entities(&self, stream: StreamKind) -> PagedEntities<'_> {
        PagedEntities::new(move |cursor| {
            let stream = stream.clone();
            Box::pin(async move { self.fetch_page(&stream, cursor.as_ref()).await })
                as PageFuture<'_>
        })
    }

    /// Collects [`Self::entities`] into an ordered, finite sequence.
    pub async fn fetch_all(&self, stream: StreamKind) -> Result<Vec<Entity>, ApiError> {
        let entities = self.entities(stream);
        let mut entities = std::pin::pin!(entities);
        let mut all = Vec::new();
        while let Some(entity) = entities.next().await {
            all.push(entity?);
        }
        Ok(all)
    }
}

type PageFuture<'a> = Pin<Box<dyn Future<Output = Result<Page, ApiError>> + Send + 'a>>;

enum WalkState {
    /// The seed request has not been issued yet.
    Seed,
    /// More results exist starting at this cursor.
    Continue(Cursor),
    /// Terminal, either by null cursor or by the zero-new-entities rule.
    Exhausted,
}

/// A lazy, finite, one-shot stream of deduplicated entities.
///
/// Generic over the page fetcher so the walk logic is testable without a
/// network; [`PaginatedFetcher::entities`] supplies the real one.
pub struct PagedEntities<'a> {
    fetch: Box<dyn FnMut(Option<Cursor>) -> PageFuture<'a> + Send + 'a>,
    buffered: VecDeque<Entity>,
    pending: Option<PageFuture<'a>>,
    state: WalkState,
    prev_token: Option<String>,
    seen: HashSet<String>,
}

impl<'a> PagedEntities<'a> {
    pub fn new<F>(fetch: F) -> Self
    where
        F: FnMut(Option<Cursor>) -> PageFuture<'a> + Send + 'a,
    {
        Self {
            fetch: Box::new(fetch),
            buffered: VecDeque::new(),
            pending: None,
            state: WalkState::Seed,
            prev_token: None,
            seen: HashSet::new(),
        }
    }

    /// Applies one fetched page: buffers new entities and decides whether the
    /// walk continues.
    fn absorb(&mut self, page: Page) {
        let mut new_entities = 0;
        for entity in page.entities {
            if self.seen.insert(entity.id().to_string()) {
                self.buffered.push_back(entity);
                new_entities += 1;
            }
        }

        self.state = match page.cursor {
            // Explicitly null cursor: exhausted.
            None => WalkState::Exhausted,
            Some(cursor) => {
                let token_unchanged = self.prev_token.as_deref() == Some(cursor.token.as_str());
                if new_entities == 0 && token_unchanged {
                    // A page with nothing new and no new cursor is the
                    // backend's way of saying "done" without saying so.
                    WalkState::Exhausted
                } else {
                    self.prev_token = Some(cursor.token.clone());
                    WalkState::Continue(cursor)
                }
            }
        };
    }
}

impl Stream for PagedEntities<'_> {
    type Item = Result<Entity, ApiError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(entity) = self.buffered.pop_front() {
                return Poll::Ready(Some(Ok(entity)));
            }

            if self.pending.is_none() {
                let cursor = match &self.state {
                    WalkState::Seed => None,
                    WalkState::Continue(cursor) => Some(cursor.clone()),
                    WalkState::Exhausted => return Poll::Ready(None),
                };
                self.pending = Some((self.fetch)(cursor));
            }

            let polled = self
                .pending
                .as_mut()
                .expect("just installed")
                .as_mut()
                .poll(cx);
            match polled {
                Poll::Ready(Ok(page)) => {
                    self.pending = None;
                    self.absorb(page);
                    // Loop back around to yield from the refilled buffer, or
                    // to issue the next continuation.
                }
                Poll::Ready(Err(error)) => {
                    self.pending = None;
                    self.state = WalkState::Exhausted;
                    return Poll::Ready(Some(Err(error)));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
