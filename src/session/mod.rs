// ============================================================================
// Client Session
// ============================================================================
//
// A logical session bound to a store-issued id. Lifecycle:
//
//   Unbound ──bind──> Bound ──end_session──> Ended
//      │                                      ▲
//      └────────────── end_session ───────────┘
//
// Properties are readable only once the session is bound. Ending a session
// aborts any transaction still in progress; it never commits implicitly.
//
// ============================================================================

use crate::Client;
use crate::core::deadline::bounded;
use crate::core::{ClusterTime, DbError, Result, SessionId};
use crate::transaction::{Transaction, TransactionOptions, TransactionState};
use bson::{Document, Timestamp};
use futures::future::BoxFuture;
use log::{debug, warn};
use serde::Deserialize;
use std::future::IntoFuture;

/// Options fixed for the lifetime of a session
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SessionOptions {
    /// Read your own writes across operations of this session
    #[serde(default)]
    pub causal_consistency: Option<bool>,

    /// Applied to `start_transaction` calls that pass no options
    #[serde(default)]
    pub default_transaction_options: Option<TransactionOptions>,
}

impl SessionOptions {
    pub fn causal_consistency(mut self, enabled: bool) -> Self {
        self.causal_consistency = Some(enabled);
        self
    }

    pub fn default_transaction_options(mut self, options: TransactionOptions) -> Self {
        self.default_transaction_options = Some(options);
        self
    }
}

#[derive(Debug, Clone)]
struct SessionInfo {
    id: SessionId,
    lsid: Document,
    cluster_time: Document,
    operation_time: Timestamp,
}

#[derive(Debug, Clone)]
enum SessionState {
    /// Created by the client, no handshake with the store yet
    Unbound,
    Bound(SessionInfo),
    /// Terminal. Holds the last-known values when the session was ever bound.
    Ended(Option<SessionInfo>),
}

/// Future returned by the bodies of session and transaction scopes
pub type SessionBody<'s, T> = BoxFuture<'s, Result<T>>;

#[derive(Debug)]
pub struct ClientSession {
    client: Client,
    options: SessionOptions,
    state: SessionState,
    transaction: Option<Transaction>,
    txn_number: u64,
}

impl ClientSession {
    pub(crate) fn new(client: Client, options: SessionOptions) -> Self {
        Self {
            client,
            options,
            state: SessionState::Unbound,
            transaction: None,
            txn_number: 0,
        }
    }

    /// The client that started this session
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Perform the handshake that assigns the session id.
    ///
    /// Idempotent: binding an already bound (or ended) session is a no-op
    /// and returns the same instance.
    pub async fn bind(&mut self) -> Result<&mut Self> {
        if let SessionState::Unbound = self.state {
            let (id, time) = bounded(
                "startSession",
                self.client.config().operation_timeout,
                self.client.store().start_session(),
            )
            .await?;
            debug!("bound session {}", id);
            self.state = SessionState::Bound(SessionInfo {
                id,
                lsid: id.to_document(),
                cluster_time: time.cluster_time,
                operation_time: time.operation_time,
            });
        }
        Ok(self)
    }

    fn info(&self) -> Result<&SessionInfo> {
        match &self.state {
            SessionState::Bound(info) | SessionState::Ended(Some(info)) => Ok(info),
            SessionState::Unbound => Err(DbError::invalid_operation(
                "session has not been started; await it before use",
            )),
            SessionState::Ended(None) => Err(DbError::invalid_operation(
                "session ended before it was started",
            )),
        }
    }

    /// Id of a bound, live session, for running operations in it
    pub(crate) fn active_id(&self) -> Result<SessionId> {
        match &self.state {
            SessionState::Bound(info) => Ok(info.id),
            SessionState::Unbound => Err(DbError::invalid_operation(
                "session has not been started; await it before use",
            )),
            SessionState::Ended(_) => Err(DbError::invalid_operation("cannot use ended session")),
        }
    }

    pub fn options(&self) -> Result<&SessionOptions> {
        self.info()?;
        Ok(&self.options)
    }

    /// The `lsid` document identifying this session to the store
    pub fn session_id(&self) -> Result<&Document> {
        Ok(&self.info()?.lsid)
    }

    pub fn cluster_time(&self) -> Result<&Document> {
        Ok(&self.info()?.cluster_time)
    }

    pub fn operation_time(&self) -> Result<Timestamp> {
        Ok(self.info()?.operation_time)
    }

    pub fn has_ended(&self) -> Result<bool> {
        match &self.state {
            SessionState::Unbound => Err(DbError::invalid_operation(
                "session has not been started; await it before use",
            )),
            SessionState::Bound(_) => Ok(false),
            SessionState::Ended(_) => Ok(true),
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction_state().is_active()
    }

    /// The current or most recent transaction of this session
    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.transaction
            .as_ref()
            .map_or(TransactionState::None, Transaction::state)
    }

    /// Move the session's cluster time forward; older values are ignored
    pub fn advance_cluster_time(&mut self, cluster_time: &Document) -> Result<()> {
        let SessionState::Bound(info) = &mut self.state else {
            return Err(DbError::invalid_operation("cluster time can only advance on a live session"));
        };
        let incoming = cluster_time.get_timestamp("clusterTime").map_err(|_| {
            DbError::invalid_operation("cluster time must contain a 'clusterTime' timestamp")
        })?;
        let newer = match info.cluster_time.get_timestamp("clusterTime") {
            Ok(current) => (incoming.time, incoming.increment) > (current.time, current.increment),
            Err(_) => true,
        };
        if newer {
            info.cluster_time = cluster_time.clone();
        }
        Ok(())
    }

    /// Move the session's operation time forward; older values are ignored
    pub fn advance_operation_time(&mut self, operation_time: Timestamp) -> Result<()> {
        let SessionState::Bound(info) = &mut self.state else {
            return Err(DbError::invalid_operation("operation time can only advance on a live session"));
        };
        if (operation_time.time, operation_time.increment)
            > (info.operation_time.time, info.operation_time.increment)
        {
            info.operation_time = operation_time;
        }
        Ok(())
    }

    async fn observe_store_time(&mut self) -> Result<()> {
        let ClusterTime {
            cluster_time,
            operation_time,
        } = self.client.store().cluster_time().await?;
        self.advance_cluster_time(&cluster_time)?;
        self.advance_operation_time(operation_time)
    }

    /// Bookkeeping after an operation ran inside this session
    pub(crate) async fn operation_completed(&mut self) -> Result<()> {
        if let Some(txn) = self.transaction.as_mut().filter(|t| t.state().is_active()) {
            txn.record_operation()?;
        }
        self.observe_store_time().await
    }

    /// Start a transaction. The session must be bound, live, and have no
    /// transaction in progress.
    pub async fn start_transaction(&mut self, options: Option<TransactionOptions>) -> Result<()> {
        let id = self.active_id()?;
        if self.in_transaction() {
            return Err(DbError::invalid_operation("transaction already in progress"));
        }

        bounded(
            "startTransaction",
            self.client.config().operation_timeout,
            self.client.store().start_transaction(id),
        )
        .await?;

        self.txn_number += 1;
        let options = options
            .or_else(|| self.options.default_transaction_options.clone())
            .unwrap_or_default();
        self.transaction = Some(Transaction::new(self.txn_number, options));
        debug!("session {} started transaction {}", id, self.txn_number);
        Ok(())
    }

    fn active_transaction(&mut self) -> Result<&mut Transaction> {
        self.transaction
            .as_mut()
            .filter(|t| t.state().is_active())
            .ok_or_else(|| DbError::invalid_operation("no transaction started"))
    }

    /// Commit the transaction in progress. On failure the transaction stays
    /// in progress so the caller may retry the commit or abort.
    pub async fn commit_transaction(&mut self) -> Result<()> {
        let id = self.active_id()?;
        let max_commit_time = self.active_transaction()?.options().max_commit_time;
        let limit = max_commit_time.or(self.client.config().operation_timeout);

        bounded(
            "commitTransaction",
            limit,
            self.client.store().commit_transaction(id),
        )
        .await?;

        let txn = self.active_transaction()?;
        txn.commit()?;
        debug!("session {} committed transaction {}", id, txn.number());

        // The commit is durable; a stale clock must not report it as failed
        if let Err(e) = self.observe_store_time().await {
            warn!("session {} could not refresh cluster time after commit: {}", id, e);
        }
        Ok(())
    }

    /// Abort the transaction in progress. The transaction is marked aborted
    /// locally even when the store call fails; the failure is still returned.
    pub async fn abort_transaction(&mut self) -> Result<()> {
        let id = self.active_id()?;
        let txn = self.active_transaction()?;
        txn.abort()?;
        debug!("session {} aborted transaction {}", id, txn.number());

        bounded(
            "abortTransaction",
            self.client.config().operation_timeout,
            self.client.store().abort_transaction(id),
        )
        .await
    }

    /// End the session, aborting any transaction in progress first.
    ///
    /// Safe to call more than once; `has_ended` is true afterwards even when
    /// the store reports an error.
    pub async fn end_session(&mut self) -> Result<()> {
        let info = match &self.state {
            SessionState::Ended(_) => return Ok(()),
            SessionState::Unbound => None,
            SessionState::Bound(info) => Some(info.clone()),
        };
        let Some(info) = info else {
            self.state = SessionState::Ended(None);
            return Ok(());
        };

        let aborted = if self.in_transaction() {
            self.abort_transaction().await
        } else {
            Ok(())
        };

        self.state = SessionState::Ended(Some(info.clone()));
        debug!("ended session {}", info.id);

        let ended = bounded(
            "endSessions",
            self.client.config().operation_timeout,
            self.client.store().end_session(info.id),
        )
        .await;
        aborted.and(ended)
    }

    /// Run `body` inside a transaction that is aborted unless the body
    /// commits it.
    ///
    /// Leaving the scope with the transaction still in progress - normally
    /// or with an error - aborts it. Call `commit_transaction` inside the
    /// body to keep its writes.
    pub async fn transaction_scope<T, F>(
        &mut self,
        options: Option<TransactionOptions>,
        body: F,
    ) -> Result<T>
    where
        F: for<'s> FnOnce(&'s mut ClientSession) -> SessionBody<'s, T>,
    {
        self.start_transaction(options).await?;
        let outcome = body(&mut *self).await;

        if self.in_transaction() {
            let aborted = self.abort_transaction().await;
            return match outcome {
                Ok(value) => aborted.map(|()| value),
                Err(err) => Err(err),
            };
        }
        outcome
    }

    /// Run `body` inside a transaction, committing when it returns `Ok` and
    /// aborting when it returns `Err`. No retries.
    pub async fn with_transaction<T, F>(
        &mut self,
        options: Option<TransactionOptions>,
        body: F,
    ) -> Result<T>
    where
        F: for<'s> FnOnce(&'s mut ClientSession) -> SessionBody<'s, T>,
    {
        self.start_transaction(options).await?;
        match body(&mut *self).await {
            Ok(value) => {
                if self.in_transaction() {
                    self.commit_transaction().await?;
                }
                Ok(value)
            }
            Err(err) => {
                if self.in_transaction() {
                    if let Err(abort_err) = self.abort_transaction().await {
                        debug!("abort after failed transaction body also failed: {}", abort_err);
                    }
                }
                Err(err)
            }
        }
    }

    /// Bind the session, run `body`, and end the session on every exit path
    pub async fn scoped<T, F>(&mut self, body: F) -> Result<T>
    where
        F: for<'s> FnOnce(&'s mut ClientSession) -> SessionBody<'s, T>,
    {
        let outcome = match self.bind().await {
            Ok(session) => body(session).await,
            Err(err) => Err(err),
        };
        let ended = self.end_session().await;
        match outcome {
            Ok(value) => ended.map(|()| value),
            Err(err) => Err(err),
        }
    }
}

/// `(&mut session).await` binds the session and yields the same instance
impl<'a> IntoFuture for &'a mut ClientSession {
    type Output = Result<&'a mut ClientSession>;
    type IntoFuture = BoxFuture<'a, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.bind())
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        let SessionState::Bound(info) = &self.state else {
            return;
        };
        warn!("session {} dropped without end_session", info.id);

        let id = info.id;
        let in_transaction = self.in_transaction();
        let store = self.client.store_handle();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if in_transaction {
                    if let Err(e) = store.abort_transaction(id).await {
                        debug!("failed to abort transaction of dropped session {}: {}", id, e);
                    }
                }
                if let Err(e) = store.end_session(id).await {
                    debug!("failed to end dropped session {}: {}", id, e);
                }
            });
        }
    }
}
