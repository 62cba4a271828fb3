use crate::Client;
use crate::core::deadline::bounded;
use crate::core::{DbError, Namespace, Result, SessionId};
use crate::cursor::{BatchFetcher, Cursor, CursorSource};
use crate::result::{DeleteResult, InsertManyResult, InsertOneResult};
use crate::session::ClientSession;
use crate::storage::FindSpec;
use bson::Document;
use log::debug;

/// Handle to one collection. Creating one performs no I/O.
#[derive(Clone, Debug)]
pub struct Collection {
    client: Client,
    ns: Namespace,
}

impl Collection {
    pub(crate) fn new(client: Client, ns: Namespace) -> Self {
        Self { client, ns }
    }

    pub fn name(&self) -> &str {
        &self.ns.coll
    }

    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn cursor(&self, source: CursorSource) -> Cursor {
        Cursor::new(BatchFetcher::new(self.client.clone(), self.ns.clone()), source)
    }

    /// Cursor over documents matching `filter`. Nothing is sent until the
    /// cursor is first advanced.
    pub fn find(&self, filter: Document) -> Cursor {
        self.cursor(CursorSource::Find(FindSpec {
            filter,
            ..FindSpec::default()
        }))
    }

    /// First document matching `filter`, if any
    pub async fn find_one(&self, filter: Document) -> Result<Option<Document>> {
        let mut cursor = self.find(filter).limit(1).batch_size(1);
        let doc = cursor.try_next().await?;
        cursor.close().await?;
        Ok(doc)
    }

    /// Cursor over the output of an aggregation pipeline
    pub fn aggregate(&self, pipeline: impl IntoIterator<Item = Document>) -> Cursor {
        self.cursor(CursorSource::Aggregate(pipeline.into_iter().collect()))
    }

    /// Cursor over the collection's index descriptions
    pub fn list_indexes(&self) -> Cursor {
        self.cursor(CursorSource::ListIndexes)
    }

    async fn insert(&self, docs: Vec<Document>, session: Option<SessionId>) -> Result<InsertManyResult> {
        if docs.is_empty() {
            return Err(DbError::invalid_operation("documents must be a non-empty list"));
        }
        let inserted_ids = bounded(
            "insert",
            self.client.config().operation_timeout,
            self.client.store().insert_many(&self.ns, docs, session),
        )
        .await?;
        debug!("inserted {} document(s) into {}", inserted_ids.len(), self.ns);
        Ok(InsertManyResult { inserted_ids })
    }

    async fn delete(&self, filter: Document, session: Option<SessionId>) -> Result<DeleteResult> {
        let deleted_count = bounded(
            "delete",
            self.client.config().operation_timeout,
            self.client.store().delete_many(&self.ns, filter, session),
        )
        .await?;
        debug!("deleted {} document(s) from {}", deleted_count, self.ns);
        Ok(DeleteResult { deleted_count })
    }

    pub async fn insert_one(&self, doc: Document) -> Result<InsertOneResult> {
        let mut result = self.insert(vec![doc], None).await?;
        let inserted_id = result
            .inserted_ids
            .pop()
            .ok_or_else(|| DbError::remote("insert", "store returned no inserted id"))?;
        Ok(InsertOneResult { inserted_id })
    }

    /// Insert documents in order. Documents without an `_id` get a
    /// generated `ObjectId`.
    pub async fn insert_many(&self, docs: Vec<Document>) -> Result<InsertManyResult> {
        self.insert(docs, None).await
    }

    /// Insert inside `session`; held back until commit when the session
    /// has a transaction in progress
    pub async fn insert_many_with_session(
        &self,
        docs: Vec<Document>,
        session: &mut ClientSession,
    ) -> Result<InsertManyResult> {
        let id = session.active_id()?;
        let result = self.insert(docs, Some(id)).await?;
        session.operation_completed().await?;
        Ok(result)
    }

    pub async fn delete_many(&self, filter: Document) -> Result<DeleteResult> {
        self.delete(filter, None).await
    }

    pub async fn delete_many_with_session(
        &self,
        filter: Document,
        session: &mut ClientSession,
    ) -> Result<DeleteResult> {
        let id = session.active_id()?;
        let result = self.delete(filter, Some(id)).await?;
        session.operation_completed().await?;
        Ok(result)
    }

    /// Create an index on `keys` (`{ field: 1 | -1, .. }`), returning its name.
    /// Creating an existing index is a no-op.
    pub async fn create_index(&self, keys: Document) -> Result<String> {
        bounded(
            "createIndexes",
            self.client.config().operation_timeout,
            self.client.store().create_index(&self.ns, keys),
        )
        .await
    }

    /// Drop the collection with its documents and indexes
    pub async fn drop(&self) -> Result<()> {
        bounded(
            "drop",
            self.client.config().operation_timeout,
            self.client.store().drop_collection(&self.ns),
        )
        .await
    }
}
