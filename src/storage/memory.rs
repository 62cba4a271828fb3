// ============================================================================
// In-Memory Document Store
// ============================================================================
//
// Reference `DocumentStore` backing tests and embedded use:
// - server-side cursors with batch/get-more semantics
// - logical sessions with buffered transactional writes
// - a logical clock for cluster/operation time
// - fail points and command counters for fault injection
//
// ============================================================================

use super::engine::{DocumentStore, FindSpec};
use super::failpoint::FailPoints;
use super::query;
use crate::core::{Batch, ClusterTime, CursorId, DbError, Namespace, Result, SessionId};
use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{Bson, Document, doc};
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use tokio::sync::{Mutex, RwLock};

/// Size of a first batch when the caller does not ask for one
pub const DEFAULT_FIRST_BATCH_SIZE: u32 = 101;

#[derive(Debug, Clone, Default)]
struct CollectionData {
    docs: Vec<Document>,
    indexes: Vec<Document>,
}

impl CollectionData {
    fn new() -> Self {
        Self {
            docs: Vec::new(),
            indexes: vec![doc! { "v": 2, "key": { "_id": 1 }, "name": "_id_" }],
        }
    }
}

struct ServerCursor {
    ns: Namespace,
    remaining: VecDeque<Document>,
}

#[derive(Debug, Clone)]
enum PendingWrite {
    Insert(Namespace, Document),
    Delete(Namespace, Document),
}

#[derive(Default)]
struct ServerSession {
    /// `Some` while a transaction is in progress
    transaction: Option<Vec<PendingWrite>>,
}

pub struct InMemoryStore {
    collections: RwLock<HashMap<Namespace, CollectionData>>,
    cursors: Mutex<HashMap<CursorId, ServerCursor>>,
    sessions: Mutex<HashMap<SessionId, ServerSession>>,
    next_cursor_id: AtomicI64,
    clock: AtomicU32,
    fail_points: FailPoints,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            next_cursor_id: AtomicI64::new(1),
            clock: AtomicU32::new(1),
            fail_points: FailPoints::new(),
        }
    }

    /// Fail the next `times` invocations of `command` with a remote error
    pub fn fail_command(&self, command: &str, times: u32) {
        self.fail_points.arm(command, times);
    }

    /// Fail the next `times` invocations of `command` against `ns` only
    pub fn fail_command_on(&self, command: &str, ns: &Namespace, times: u32) {
        self.fail_points.arm_on(command, &ns.to_string(), times);
    }

    /// How many times `command` has been issued (failed attempts included)
    pub fn command_count(&self, command: &str) -> u64 {
        self.fail_points.count(command)
    }

    pub fn reset_command_counts(&self) {
        self.fail_points.reset_counts();
    }

    /// Number of server cursors still open
    pub async fn open_cursor_count(&self) -> usize {
        self.cursors.lock().await.len()
    }

    /// Number of logical sessions the store is tracking
    pub async fn active_session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    fn enter(&self, command: &str) -> Result<()> {
        self.fail_points.check(command)
    }

    fn enter_on(&self, command: &str, ns: &Namespace) -> Result<()> {
        self.fail_points.check_on(command, &ns.to_string())
    }

    fn now(&self) -> bson::Timestamp {
        bson::Timestamp {
            time: chrono::Utc::now().timestamp() as u32,
            increment: self.clock.load(Ordering::SeqCst),
        }
    }

    fn tick(&self) {
        self.clock.fetch_add(1, Ordering::SeqCst);
    }

    /// Documents of `ns` as seen by `session`: committed data with the
    /// session's in-flight transactional writes applied in order.
    async fn visible_docs(&self, ns: &Namespace, session: Option<SessionId>) -> Result<Vec<Document>> {
        let mut docs = {
            let collections = self.collections.read().await;
            collections.get(ns).map(|c| c.docs.clone()).unwrap_or_default()
        };

        if let Some(id) = session {
            let sessions = self.sessions.lock().await;
            if let Some(pending) = sessions.get(&id).and_then(|s| s.transaction.as_ref()) {
                for write in pending {
                    match write {
                        PendingWrite::Insert(target, doc) if target == ns => docs.push(doc.clone()),
                        PendingWrite::Delete(target, filter) if target == ns => {
                            let mut kept = Vec::with_capacity(docs.len());
                            for doc in docs {
                                if !query::matches(filter, &doc)? {
                                    kept.push(doc);
                                }
                            }
                            docs = kept;
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(docs)
    }

    /// Turn a fully-evaluated result set into a first batch, parking the rest
    /// behind a server cursor when needed.
    async fn open_cursor(&self, ns: &Namespace, results: Vec<Document>, batch_size: Option<u32>) -> Batch {
        let mut remaining: VecDeque<Document> = results.into();
        let take = batch_size.unwrap_or(DEFAULT_FIRST_BATCH_SIZE) as usize;
        let first: VecDeque<Document> = remaining.drain(..take.min(remaining.len())).collect();

        if remaining.is_empty() {
            return Batch::new(0, first);
        }

        let cursor_id = self.next_cursor_id.fetch_add(1, Ordering::SeqCst);
        self.cursors.lock().await.insert(
            cursor_id,
            ServerCursor {
                ns: ns.clone(),
                remaining,
            },
        );
        debug!("opened cursor {} on {}", cursor_id, ns);
        Batch::new(cursor_id, first)
    }

    async fn require_session(&self, session: SessionId, command: &str) -> Result<()> {
        if self.sessions.lock().await.contains_key(&session) {
            Ok(())
        } else {
            Err(DbError::remote(command, format!("unknown session {}", session)))
        }
    }

    async fn in_transaction(&self, session: Option<SessionId>) -> bool {
        let Some(id) = session else {
            return false;
        };
        let sessions = self.sessions.lock().await;
        sessions.get(&id).is_some_and(|s| s.transaction.is_some())
    }

    /// Queue `write` on the session's transaction, or hand it back when the
    /// session has none and the write must apply immediately.
    async fn buffer_write(&self, session: Option<SessionId>, write: PendingWrite) -> Option<PendingWrite> {
        let Some(id) = session else {
            return Some(write);
        };
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(&id).and_then(|s| s.transaction.as_mut()) {
            Some(pending) => {
                pending.push(write);
                None
            }
            None => Some(write),
        }
    }

    async fn apply(&self, write: PendingWrite) -> Result<u64> {
        let mut collections = self.collections.write().await;
        match write {
            PendingWrite::Insert(ns, doc) => {
                let data = collections.entry(ns).or_insert_with(CollectionData::new);
                data.docs.push(doc);
                Ok(1)
            }
            PendingWrite::Delete(ns, filter) => {
                let Some(data) = collections.get_mut(&ns) else {
                    return Ok(0);
                };
                let before = data.docs.len();
                let mut kept = Vec::with_capacity(before);
                for doc in &data.docs {
                    if !query::matches(&filter, doc)? {
                        kept.push(doc.clone());
                    }
                }
                data.docs = kept;
                Ok((before - data.docs.len()) as u64)
            }
        }
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn find(&self, ns: &Namespace, spec: FindSpec, session: Option<SessionId>) -> Result<Batch> {
        self.enter_on("find", ns)?;

        let mut results = Vec::new();
        for doc in self.visible_docs(ns, session).await? {
            if query::matches(&spec.filter, &doc)? {
                results.push(doc);
            }
        }
        if let Some(sort) = &spec.sort {
            query::sort_documents(&mut results, sort)?;
        }
        let skip = spec.skip.unwrap_or(0) as usize;
        let results: Vec<Document> = match spec.limit {
            Some(limit) if limit > 0 => results.into_iter().skip(skip).take(limit as usize).collect(),
            _ => results.into_iter().skip(skip).collect(),
        };

        Ok(self.open_cursor(ns, results, spec.batch_size).await)
    }

    async fn aggregate(
        &self,
        ns: &Namespace,
        pipeline: Vec<Document>,
        batch_size: Option<u32>,
        session: Option<SessionId>,
    ) -> Result<Batch> {
        self.enter_on("aggregate", ns)?;
        let input = self.visible_docs(ns, session).await?;
        let results = query::run_pipeline(input, &pipeline)?;
        Ok(self.open_cursor(ns, results, batch_size).await)
    }

    async fn list_indexes(
        &self,
        ns: &Namespace,
        batch_size: Option<u32>,
        _session: Option<SessionId>,
    ) -> Result<Batch> {
        self.enter("listIndexes")?;
        let indexes = {
            let collections = self.collections.read().await;
            collections.get(ns).map(|c| c.indexes.clone()).unwrap_or_default()
        };
        Ok(self.open_cursor(ns, indexes, batch_size).await)
    }

    async fn get_more(
        &self,
        ns: &Namespace,
        cursor_id: CursorId,
        batch_size: Option<u32>,
        _session: Option<SessionId>,
    ) -> Result<Batch> {
        self.enter_on("getMore", ns)?;

        let mut cursors = self.cursors.lock().await;
        let cursor = cursors
            .get_mut(&cursor_id)
            .filter(|c| &c.ns == ns)
            .ok_or_else(|| DbError::remote("getMore", format!("cursor id {} not found", cursor_id)))?;

        let take = match batch_size {
            Some(n) if n > 0 => (n as usize).min(cursor.remaining.len()),
            _ => cursor.remaining.len(),
        };
        let docs: VecDeque<Document> = cursor.remaining.drain(..take).collect();

        if cursor.remaining.is_empty() {
            cursors.remove(&cursor_id);
            debug!("cursor {} on {} exhausted", cursor_id, ns);
            return Ok(Batch::new(0, docs));
        }
        Ok(Batch::new(cursor_id, docs))
    }

    async fn kill_cursor(&self, ns: &Namespace, cursor_id: CursorId) -> Result<()> {
        self.enter("killCursors")?;
        let mut cursors = self.cursors.lock().await;
        if cursors.get(&cursor_id).is_some_and(|c| &c.ns == ns) {
            cursors.remove(&cursor_id);
            debug!("killed cursor {} on {}", cursor_id, ns);
        }
        Ok(())
    }

    async fn insert_many(
        &self,
        ns: &Namespace,
        docs: Vec<Document>,
        session: Option<SessionId>,
    ) -> Result<Vec<Bson>> {
        self.enter_on("insert", ns)?;

        let existing = self.visible_docs(ns, session).await?;
        let mut ids: Vec<Bson> = existing.iter().filter_map(|d| d.get("_id").cloned()).collect();
        let mut prepared = Vec::with_capacity(docs.len());

        for mut doc in docs {
            let id = match doc.get("_id") {
                Some(id) => id.clone(),
                None => {
                    let id = Bson::ObjectId(ObjectId::new());
                    let mut with_id = doc! { "_id": id.clone() };
                    with_id.extend(doc);
                    doc = with_id;
                    id
                }
            };
            if ids.iter().any(|other| query::compare_bson(other, &id) == std::cmp::Ordering::Equal) {
                return Err(DbError::remote(
                    "insert",
                    format!("E11000 duplicate key error collection: {} dup key: {{ _id: {} }}", ns, id),
                ));
            }
            ids.push(id);
            prepared.push(doc);
        }

        let mut inserted = Vec::with_capacity(prepared.len());
        for doc in prepared {
            let id = doc.get("_id").cloned().unwrap_or(Bson::Null);
            if let Some(write) = self.buffer_write(session, PendingWrite::Insert(ns.clone(), doc)).await {
                self.apply(write).await?;
            }
            inserted.push(id);
        }
        self.tick();
        Ok(inserted)
    }

    async fn delete_many(&self, ns: &Namespace, filter: Document, session: Option<SessionId>) -> Result<u64> {
        self.enter_on("delete", ns)?;

        let deleted = if self.in_transaction(session).await {
            let mut count = 0;
            for doc in self.visible_docs(ns, session).await? {
                if query::matches(&filter, &doc)? {
                    count += 1;
                }
            }
            if let Some(write) = self.buffer_write(session, PendingWrite::Delete(ns.clone(), filter)).await {
                self.apply(write).await?;
            }
            count
        } else {
            self.apply(PendingWrite::Delete(ns.clone(), filter)).await?
        };

        self.tick();
        Ok(deleted)
    }

    async fn create_index(&self, ns: &Namespace, keys: Document) -> Result<String> {
        self.enter("createIndexes")?;
        if keys.is_empty() {
            return Err(DbError::remote("createIndexes", "index keys cannot be empty"));
        }

        let name = query::index_name(&keys);
        let mut collections = self.collections.write().await;
        let data = collections.entry(ns.clone()).or_insert_with(CollectionData::new);
        if !data.indexes.iter().any(|ix| ix.get_str("name").is_ok_and(|n| n == name)) {
            data.indexes.push(doc! { "v": 2, "key": keys, "name": name.clone() });
        }
        self.tick();
        Ok(name)
    }

    async fn drop_collection(&self, ns: &Namespace) -> Result<()> {
        self.enter("drop")?;
        self.collections.write().await.remove(ns);
        self.cursors.lock().await.retain(|_, c| &c.ns != ns);
        self.tick();
        Ok(())
    }

    async fn start_session(&self) -> Result<(SessionId, ClusterTime)> {
        self.enter("startSession")?;
        let id = SessionId::new();
        self.sessions.lock().await.insert(id, ServerSession::default());
        debug!("started session {}", id);
        Ok((id, ClusterTime::from_timestamp(self.now())))
    }

    async fn end_session(&self, session: SessionId) -> Result<()> {
        self.enter("endSessions")?;
        if let Some(state) = self.sessions.lock().await.remove(&session) {
            if state.transaction.is_some() {
                debug!("session {} ended with an open transaction; discarding its writes", session);
            }
        }
        Ok(())
    }

    async fn start_transaction(&self, session: SessionId) -> Result<()> {
        self.enter("startTransaction")?;
        let mut sessions = self.sessions.lock().await;
        let state = sessions
            .get_mut(&session)
            .ok_or_else(|| DbError::remote("startTransaction", format!("unknown session {}", session)))?;
        if state.transaction.is_some() {
            return Err(DbError::remote("startTransaction", "transaction already in progress"));
        }
        state.transaction = Some(Vec::new());
        Ok(())
    }

    async fn commit_transaction(&self, session: SessionId) -> Result<()> {
        self.enter("commitTransaction")?;
        self.require_session(session, "commitTransaction").await?;

        let pending = {
            let mut sessions = self.sessions.lock().await;
            sessions.get_mut(&session).and_then(|s| s.transaction.take())
        };
        let pending = pending.ok_or_else(|| DbError::remote("commitTransaction", "no transaction started"))?;

        let writes = pending.len();
        for write in pending {
            self.apply(write).await?;
        }
        self.tick();
        debug!("session {} committed {} write(s)", session, writes);
        Ok(())
    }

    async fn abort_transaction(&self, session: SessionId) -> Result<()> {
        self.enter("abortTransaction")?;
        self.require_session(session, "abortTransaction").await?;

        let mut sessions = self.sessions.lock().await;
        let pending = sessions.get_mut(&session).and_then(|s| s.transaction.take());
        match pending {
            Some(writes) => {
                debug!("session {} aborted, discarding {} write(s)", session, writes.len());
                Ok(())
            }
            None => Err(DbError::remote("abortTransaction", "no transaction started")),
        }
    }

    async fn cluster_time(&self) -> Result<ClusterTime> {
        self.enter("clusterTime")?;
        Ok(ClusterTime::from_timestamp(self.now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns() -> Namespace {
        Namespace::new("test", "items")
    }

    async fn seeded(n: i32) -> InMemoryStore {
        let store = InMemoryStore::new();
        let docs: Vec<Document> = (0..n).map(|i| doc! { "_id": i }).collect();
        if n > 0 {
            store.insert_many(&ns(), docs, None).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_find_in_batches() {
        let store = seeded(10).await;
        let spec = FindSpec {
            sort: Some(doc! { "_id": 1 }),
            batch_size: Some(3),
            ..Default::default()
        };

        let first = store.find(&ns(), spec, None).await.unwrap();
        assert_eq!(first.len(), 3);
        assert!(!first.is_last());

        let mut sizes = vec![first.len()];
        let mut cursor_id = first.cursor_id;
        while cursor_id != 0 {
            let batch = store.get_more(&ns(), cursor_id, Some(3), None).await.unwrap();
            sizes.push(batch.len());
            cursor_id = batch.cursor_id;
        }

        assert_eq!(sizes, vec![3, 3, 3, 1]);
        assert_eq!(store.open_cursor_count().await, 0);
    }

    #[tokio::test]
    async fn test_exact_multiple_closes_on_last_batch() {
        let store = seeded(6).await;
        let spec = FindSpec {
            batch_size: Some(3),
            ..Default::default()
        };
        let first = store.find(&ns(), spec, None).await.unwrap();
        let second = store.get_more(&ns(), first.cursor_id, Some(3), None).await.unwrap();
        assert_eq!(second.len(), 3);
        assert!(second.is_last());
    }

    #[tokio::test]
    async fn test_empty_collection_returns_closed_cursor() {
        let store = InMemoryStore::new();
        let batch = store.find(&ns(), FindSpec::default(), None).await.unwrap();
        assert!(batch.is_empty());
        assert!(batch.is_last());
    }

    #[tokio::test]
    async fn test_get_more_unknown_cursor() {
        let store = InMemoryStore::new();
        let err = store.get_more(&ns(), 99, None, None).await.unwrap_err();
        assert!(err.is_remote());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let store = seeded(2).await;
        let err = store
            .insert_many(&ns(), vec![doc! { "_id": 1 }], None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("E11000"));
    }

    #[tokio::test]
    async fn test_generated_id_comes_first() {
        let store = InMemoryStore::new();
        let ids = store
            .insert_many(&ns(), vec![doc! { "x": 1 }], None)
            .await
            .unwrap();
        assert!(matches!(ids[0], Bson::ObjectId(_)));

        let batch = store.find(&ns(), FindSpec::default(), None).await.unwrap();
        let doc = &batch.documents[0];
        assert_eq!(doc.keys().next().map(String::as_str), Some("_id"));
    }

    #[tokio::test]
    async fn test_list_indexes_of_new_collection() {
        let store = InMemoryStore::new();
        assert_eq!(store.create_index(&ns(), doc! { "x": 1 }).await.unwrap(), "x_1");
        assert_eq!(store.create_index(&ns(), doc! { "x": 1 }).await.unwrap(), "x_1");

        let batch = store.list_indexes(&ns(), None, None).await.unwrap();
        let names: Vec<&str> = batch
            .documents
            .iter()
            .map(|d| d.get_str("name").unwrap())
            .collect();
        assert_eq!(names, vec!["_id_", "x_1"]);
    }

    #[tokio::test]
    async fn test_transaction_writes_buffered_until_commit() {
        let store = seeded(1).await;
        let (session, _) = store.start_session().await.unwrap();
        store.start_transaction(session).await.unwrap();

        store
            .insert_many(&ns(), vec![doc! { "_id": 10 }], Some(session))
            .await
            .unwrap();
        assert_eq!(
            store.delete_many(&ns(), doc! { "_id": 0 }, Some(session)).await.unwrap(),
            1
        );

        // Outside the session nothing has changed yet
        let outside = store.find(&ns(), FindSpec::default(), None).await.unwrap();
        assert_eq!(outside.documents, VecDeque::from(vec![doc! { "_id": 0 }]));

        // Inside the session the writes are visible
        let inside = store.find(&ns(), FindSpec::default(), Some(session)).await.unwrap();
        assert_eq!(inside.documents, VecDeque::from(vec![doc! { "_id": 10 }]));

        store.commit_transaction(session).await.unwrap();
        let after = store.find(&ns(), FindSpec::default(), None).await.unwrap();
        assert_eq!(after.documents, VecDeque::from(vec![doc! { "_id": 10 }]));
    }

    #[tokio::test]
    async fn test_abort_discards_writes() {
        let store = InMemoryStore::new();
        let (session, _) = store.start_session().await.unwrap();
        store.start_transaction(session).await.unwrap();
        store
            .insert_many(&ns(), vec![doc! { "_id": 1 }], Some(session))
            .await
            .unwrap();
        store.abort_transaction(session).await.unwrap();

        let batch = store.find(&ns(), FindSpec::default(), None).await.unwrap();
        assert!(batch.is_empty());
        assert!(store.abort_transaction(session).await.is_err());
    }

    #[tokio::test]
    async fn test_writes_advance_cluster_time() {
        let store = InMemoryStore::new();
        let before = store.cluster_time().await.unwrap().operation_time;
        store.insert_many(&ns(), vec![doc! { "_id": 1 }], None).await.unwrap();
        let after = store.cluster_time().await.unwrap().operation_time;
        assert!(after.increment > before.increment);
    }

    #[tokio::test]
    async fn test_fail_point_counts_attempt() {
        let store = seeded(1).await;
        store.fail_command("find", 1);
        assert!(store.find(&ns(), FindSpec::default(), None).await.is_err());
        assert!(store.find(&ns(), FindSpec::default(), None).await.is_ok());
        assert_eq!(store.command_count("find"), 2);
    }
}
