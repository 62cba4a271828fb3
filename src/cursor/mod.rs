// ============================================================================
// Async Cursor
// ============================================================================
//
// Pull-based state machine over a `BatchFetcher`:
//
//   Unstarted ──advance──> Fetching ──batch──> Buffered ──drained──> Fetching
//                              │                   │
//                              └── id == 0 ──> Exhausted <── id == 0 ─┘
//
// A failed fetch leaves the cursor in `Fetching`; the next `advance` retries
// the same request. `Exhausted` never contacts the store again.
//
// ============================================================================

pub mod fetcher;

pub use fetcher::{BatchFetcher, CursorSource};

use crate::core::{CursorId, DbError, Result, SessionId};
use crate::session::ClientSession;
use bson::Document;
use futures::Stream;
use log::debug;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Unstarted,
    Fetching,
    Buffered,
    Exhausted,
}

impl std::fmt::Display for CursorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CursorState::Unstarted => write!(f, "UNSTARTED"),
            CursorState::Fetching => write!(f, "FETCHING"),
            CursorState::Buffered => write!(f, "BUFFERED"),
            CursorState::Exhausted => write!(f, "EXHAUSTED"),
        }
    }
}

/// Lazily-fetched, finite, non-restartable sequence of documents.
///
/// # Examples
///
/// ```
/// # use docmotor::{Client, bson::doc};
/// # #[tokio::main]
/// # async fn main() -> docmotor::Result<()> {
/// let client = Client::in_memory();
/// let coll = client.database("app").collection("items");
/// coll.insert_many(vec![doc! { "_id": 1 }, doc! { "_id": 2 }]).await?;
///
/// let mut cursor = coll.find(doc! {}).sort(doc! { "_id": 1 }).batch_size(1);
/// while cursor.advance().await? {
///     println!("{:?}", cursor.current());
/// }
/// assert!(cursor.to_list(None).await?.is_empty());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Cursor {
    fetcher: BatchFetcher,
    source: CursorSource,
    batch_size: Option<u32>,
    session: Option<SessionId>,
    state: CursorState,
    cursor_id: Option<CursorId>,
    buffer: VecDeque<Document>,
    current: Option<Document>,
    /// Builder misuse recorded while chaining; reported by the next advance
    deferred_error: Option<DbError>,
}

impl Cursor {
    pub(crate) fn new(fetcher: BatchFetcher, source: CursorSource) -> Self {
        Self {
            fetcher,
            source,
            batch_size: None,
            session: None,
            state: CursorState::Unstarted,
            cursor_id: None,
            buffer: VecDeque::new(),
            current: None,
            deferred_error: None,
        }
    }

    fn defer(&mut self, err: DbError) {
        if self.deferred_error.is_none() {
            self.deferred_error = Some(err);
        }
    }

    fn find_spec_mut(&mut self, option: &str) -> Option<&mut crate::storage::FindSpec> {
        if self.state != CursorState::Unstarted {
            self.defer(DbError::invalid_operation(
                "cannot set options after executing query",
            ));
            return None;
        }
        if let CursorSource::Aggregate(_) | CursorSource::ListIndexes = self.source {
            let msg = format!("{} is not supported on {} cursors", option, self.source.command_name());
            self.defer(DbError::InvalidOperation(msg));
            return None;
        }
        match &mut self.source {
            CursorSource::Find(spec) => Some(spec),
            _ => None,
        }
    }

    /// Order results by `{ field: 1 | -1 }`
    pub fn sort(mut self, spec: Document) -> Self {
        if let Some(find) = self.find_spec_mut("sort") {
            find.sort = Some(spec);
        }
        self
    }

    pub fn skip(mut self, n: u64) -> Self {
        if let Some(find) = self.find_spec_mut("skip") {
            find.skip = Some(n);
        }
        self
    }

    /// Return at most `n` documents in total (0 means no limit)
    pub fn limit(mut self, n: u64) -> Self {
        if let Some(find) = self.find_spec_mut("limit") {
            find.limit = Some(n);
        }
        self
    }

    /// Number of documents per fetch. May change between fetches.
    pub fn batch_size(mut self, n: u32) -> Self {
        self.batch_size = Some(n);
        self
    }

    /// Run the query inside `session`, which must be bound and not ended.
    ///
    /// Only the session id is kept. Ending the session before the first
    /// fetch is not noticed here; the store decides what an unknown id
    /// means (the in-memory store runs the query outside any session).
    pub fn session(mut self, session: &ClientSession) -> Self {
        if self.state != CursorState::Unstarted {
            self.defer(DbError::invalid_operation(
                "cannot set options after executing query",
            ));
            return self;
        }
        match session.active_id() {
            Ok(id) => self.session = Some(id),
            Err(err) => self.defer(err),
        }
        self
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Server cursor id of the last batch; `None` before the first fetch
    pub fn id(&self) -> Option<CursorId> {
        self.cursor_id
    }

    pub fn is_exhausted(&self) -> bool {
        self.state == CursorState::Exhausted
    }

    /// Documents already fetched and not yet yielded
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn server_closed(&self) -> bool {
        self.cursor_id == Some(0)
    }

    fn after_drain(&self) -> CursorState {
        if self.server_closed() {
            CursorState::Exhausted
        } else {
            CursorState::Fetching
        }
    }

    /// Move to the next document, fetching a batch when the buffer is empty.
    ///
    /// Returns `true` when `current()` holds a document.
    pub async fn advance(&mut self) -> Result<bool> {
        if let Some(err) = self.deferred_error.take() {
            return Err(err);
        }
        self.current = None;

        loop {
            match self.state {
                CursorState::Exhausted => return Ok(false),
                CursorState::Unstarted => self.state = CursorState::Fetching,
                CursorState::Buffered => match self.buffer.pop_front() {
                    Some(doc) => {
                        self.current = Some(doc);
                        if self.buffer.is_empty() {
                            self.state = self.after_drain();
                        }
                        return Ok(true);
                    }
                    None => self.state = self.after_drain(),
                },
                CursorState::Fetching => {
                    let batch = match self.cursor_id {
                        None => {
                            self.fetcher
                                .fetch(&self.source, self.batch_size, self.session)
                                .await?
                        }
                        Some(id) => {
                            self.fetcher
                                .fetch_more(id, self.batch_size, self.session)
                                .await?
                        }
                    };
                    debug!(
                        "{} on {}: {} document(s), cursor id {}",
                        if self.cursor_id.is_none() { self.source.command_name() } else { "getMore" },
                        self.fetcher.namespace(),
                        batch.len(),
                        batch.cursor_id
                    );

                    self.cursor_id = Some(batch.cursor_id);
                    self.buffer = batch.documents;
                    self.state = if !self.buffer.is_empty() {
                        CursorState::Buffered
                    } else {
                        self.after_drain()
                    };
                }
            }
        }
    }

    /// The document produced by the last successful `advance`
    pub fn current(&self) -> Option<&Document> {
        self.current.as_ref()
    }

    /// Advance and take the current document
    pub async fn try_next(&mut self) -> Result<Option<Document>> {
        if self.advance().await? {
            Ok(self.current.take())
        } else {
            Ok(None)
        }
    }

    /// Drain up to `limit` documents (all remaining when `None`).
    ///
    /// An exhausted cursor returns an empty list without contacting the store.
    pub async fn to_list(&mut self, limit: Option<usize>) -> Result<Vec<Document>> {
        let mut docs = Vec::new();
        if self.is_exhausted() {
            return Ok(docs);
        }

        while limit.is_none_or(|max| docs.len() < max) {
            match self.try_next().await? {
                Some(doc) => docs.push(doc),
                None => break,
            }
        }
        Ok(docs)
    }

    /// Consume the cursor as a `Stream` of documents
    pub fn into_stream(self) -> impl Stream<Item = Result<Document>> + Send {
        futures::stream::try_unfold(self, |mut cursor| async move {
            Ok::<_, DbError>(cursor.try_next().await?.map(|doc| (doc, cursor)))
        })
    }

    fn live_server_cursor(&self) -> Option<CursorId> {
        match (self.state, self.cursor_id) {
            (CursorState::Exhausted, _) => None,
            (_, Some(id)) if id != 0 => Some(id),
            _ => None,
        }
    }

    /// Release the server cursor and mark this cursor exhausted
    pub async fn close(&mut self) -> Result<()> {
        let live = self.live_server_cursor();
        self.state = CursorState::Exhausted;
        self.buffer.clear();
        self.current = None;

        if let Some(id) = live {
            self.fetcher.kill(id).await?;
            self.cursor_id = Some(0);
        }
        Ok(())
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        let Some(id) = self.live_server_cursor() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let fetcher = self.fetcher.clone();
            handle.spawn(async move {
                if let Err(e) = fetcher.kill(id).await {
                    debug!("failed to kill cursor {} on drop: {}", id, e);
                }
            });
        }
    }
}
