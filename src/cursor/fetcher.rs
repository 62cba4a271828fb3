// ============================================================================
// Batch Fetcher
// ============================================================================

use crate::Client;
use crate::core::deadline::bounded;
use crate::core::{Batch, CursorId, Namespace, Result, SessionId};
use crate::storage::FindSpec;
use bson::Document;

/// What a cursor was opened on
#[derive(Debug, Clone)]
pub enum CursorSource {
    Find(FindSpec),
    Aggregate(Vec<Document>),
    ListIndexes,
}

impl CursorSource {
    pub fn command_name(&self) -> &'static str {
        match self {
            CursorSource::Find(_) => "find",
            CursorSource::Aggregate(_) => "aggregate",
            CursorSource::ListIndexes => "listIndexes",
        }
    }
}

/// Issues the initial query and the follow-up get-more requests for one
/// namespace.
#[derive(Clone, Debug)]
pub struct BatchFetcher {
    client: Client,
    ns: Namespace,
}

impl BatchFetcher {
    pub fn new(client: Client, ns: Namespace) -> Self {
        Self { client, ns }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }

    /// Run the query described by `source` and return its first batch
    pub async fn fetch(
        &self,
        source: &CursorSource,
        batch_size: Option<u32>,
        session: Option<SessionId>,
    ) -> Result<Batch> {
        let store = self.client.store();
        let limit = self.client.config().operation_timeout;
        let batch_size = batch_size.or(self.client.config().default_batch_size);

        match source {
            CursorSource::Find(spec) => {
                let spec = FindSpec {
                    batch_size,
                    ..spec.clone()
                };
                bounded("find", limit, store.find(&self.ns, spec, session)).await
            }
            CursorSource::Aggregate(pipeline) => {
                bounded(
                    "aggregate",
                    limit,
                    store.aggregate(&self.ns, pipeline.clone(), batch_size, session),
                )
                .await
            }
            CursorSource::ListIndexes => {
                bounded(
                    "listIndexes",
                    limit,
                    store.list_indexes(&self.ns, batch_size, session),
                )
                .await
            }
        }
    }

    /// Continue the server cursor `cursor_id`
    pub async fn fetch_more(
        &self,
        cursor_id: CursorId,
        batch_size: Option<u32>,
        session: Option<SessionId>,
    ) -> Result<Batch> {
        let batch_size = batch_size.or(self.client.config().default_batch_size);
        bounded(
            "getMore",
            self.client.config().operation_timeout,
            self.client
                .store()
                .get_more(&self.ns, cursor_id, batch_size, session),
        )
        .await
    }

    pub async fn kill(&self, cursor_id: CursorId) -> Result<()> {
        bounded(
            "killCursors",
            self.client.config().operation_timeout,
            self.client.store().kill_cursor(&self.ns, cursor_id),
        )
        .await
    }
}
