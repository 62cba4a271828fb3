use crate::core::{Batch, ClusterTime, CursorId, Namespace, Result, SessionId};
use async_trait::async_trait;
use bson::{Bson, Document};

/// A find request as the store receives it
#[derive(Debug, Clone, Default)]
pub struct FindSpec {
    pub filter: Document,
    pub sort: Option<Document>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    pub batch_size: Option<u32>,
}

/// Remote document store - the external collaborator behind every handle.
///
/// Every method is a suspension point. Methods taking a `SessionId` run
/// inside that logical session; when the session has a transaction in
/// progress, writes are held by the store until commit.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Run a query and return its first batch
    async fn find(
        &self,
        ns: &Namespace,
        spec: FindSpec,
        session: Option<SessionId>,
    ) -> Result<Batch>;

    /// Run an aggregation pipeline and return its first batch
    async fn aggregate(
        &self,
        ns: &Namespace,
        pipeline: Vec<Document>,
        batch_size: Option<u32>,
        session: Option<SessionId>,
    ) -> Result<Batch>;

    /// List the index descriptions of a collection as a cursor
    async fn list_indexes(
        &self,
        ns: &Namespace,
        batch_size: Option<u32>,
        session: Option<SessionId>,
    ) -> Result<Batch>;

    /// Continue a server cursor
    async fn get_more(
        &self,
        ns: &Namespace,
        cursor_id: CursorId,
        batch_size: Option<u32>,
        session: Option<SessionId>,
    ) -> Result<Batch>;

    /// Release a server cursor before it is exhausted
    async fn kill_cursor(&self, ns: &Namespace, cursor_id: CursorId) -> Result<()>;

    /// Insert documents, returning their `_id`s in order
    async fn insert_many(
        &self,
        ns: &Namespace,
        docs: Vec<Document>,
        session: Option<SessionId>,
    ) -> Result<Vec<Bson>>;

    /// Delete every document matching `filter`, returning the count
    async fn delete_many(
        &self,
        ns: &Namespace,
        filter: Document,
        session: Option<SessionId>,
    ) -> Result<u64>;

    /// Create an index, returning its name
    async fn create_index(&self, ns: &Namespace, keys: Document) -> Result<String>;

    async fn drop_collection(&self, ns: &Namespace) -> Result<()>;

    /// Handshake: allocate a logical session
    async fn start_session(&self) -> Result<(SessionId, ClusterTime)>;

    async fn end_session(&self, session: SessionId) -> Result<()>;

    async fn start_transaction(&self, session: SessionId) -> Result<()>;

    async fn commit_transaction(&self, session: SessionId) -> Result<()>;

    async fn abort_transaction(&self, session: SessionId) -> Result<()>;

    /// Current logical clock, used to advance session cluster/operation time
    async fn cluster_time(&self) -> Result<ClusterTime>;
}
