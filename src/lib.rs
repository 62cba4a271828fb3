// ============================================================================
// docmotor Library
// ============================================================================

pub mod config;
pub mod core;
pub mod cursor;
pub mod facade;
pub mod gridfs;
pub mod result;
pub mod session;
pub mod storage;
pub mod transaction;

pub use bson;

// Re-export main types for convenience
pub use config::ClientConfig;
pub use core::{DbError, Namespace, Result};
pub use cursor::{Cursor, CursorState};
pub use facade::{Collection, Database};
pub use gridfs::{
    ChunkSink, GridFsBucket, GridFsBucketOptions, GridFsUploadOptions, GridIn, GridOut,
    GridOutCursor, WriterSink,
};
pub use result::{DeleteResult, InsertManyResult, InsertOneResult};
pub use session::{ClientSession, SessionBody, SessionOptions};
pub use storage::{DocumentStore, InMemoryStore};
pub use transaction::{Transaction, TransactionOptions, TransactionState};

use std::sync::Arc;

// ============================================================================
// Client
// ============================================================================

struct ClientInner {
    store: Arc<dyn DocumentStore>,
    config: ClientConfig,
}

/// Handle to a document store.
///
/// Cheap to clone; clones share the store and the configuration.
///
/// # Examples
///
/// ```
/// use docmotor::{Client, bson::doc};
///
/// # #[tokio::main]
/// # async fn main() -> docmotor::Result<()> {
/// let client = Client::in_memory();
/// let users = client.database("app").collection("users");
///
/// users.insert_many(vec![doc! { "name": "Alice" }, doc! { "name": "Bob" }]).await?;
/// let found = users.find(doc! { "name": "Bob" }).to_list(None).await?;
/// assert_eq!(found.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Wrap a store with the default configuration
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                store,
                config: ClientConfig::default(),
            }),
        }
    }

    /// Wrap a store with a custom configuration
    ///
    /// # Examples
    ///
    /// ```
    /// # use docmotor::{Client, ClientConfig, InMemoryStore};
    /// # use std::sync::Arc;
    /// # fn main() -> docmotor::Result<()> {
    /// let config = ClientConfig::new()
    ///     .default_database("media")
    ///     .default_batch_size(50);
    ///
    /// let client = Client::with_config(Arc::new(InMemoryStore::new()), config)?;
    /// assert_eq!(client.default_database().name(), "media");
    /// # Ok(())
    /// # }
    /// ```
    pub fn with_config(store: Arc<dyn DocumentStore>, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ClientInner { store, config }),
        })
    }

    /// Configure from a `mongodb://` connection string
    ///
    /// # Examples
    ///
    /// ```
    /// # use docmotor::{Client, InMemoryStore};
    /// # use std::sync::Arc;
    /// # fn main() -> docmotor::Result<()> {
    /// let client = Client::with_url(
    ///     Arc::new(InMemoryStore::new()),
    ///     "mongodb://localhost:27017/media?chunkSize=1024",
    /// )?;
    /// assert_eq!(client.config().chunk_size_bytes, 1024);
    /// # Ok(())
    /// # }
    /// ```
    pub fn with_url(store: Arc<dyn DocumentStore>, url: &str) -> Result<Self> {
        Self::with_config(store, ClientConfig::from_url(url)?)
    }

    /// Client over a fresh `InMemoryStore`
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStore::new()))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub(crate) fn store(&self) -> &dyn DocumentStore {
        self.inner.store.as_ref()
    }

    /// Owned store handle for work that outlives a borrow of the client
    pub(crate) fn store_handle(&self) -> Arc<dyn DocumentStore> {
        Arc::clone(&self.inner.store)
    }

    pub fn database(&self, name: &str) -> Database {
        Database::new(self.clone(), name)
    }

    /// The database named by `ClientConfig::default_database`
    pub fn default_database(&self) -> Database {
        self.database(&self.inner.config.default_database)
    }

    /// Create an unbound session. No I/O happens until it is bound with
    /// `(&mut session).await` or `bind()`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use docmotor::Client;
    /// # #[tokio::main]
    /// # async fn main() -> docmotor::Result<()> {
    /// let client = Client::in_memory();
    /// let mut session = client.start_session(None);
    /// assert!(session.session_id().is_err());
    ///
    /// (&mut session).await?;
    /// assert!(session.session_id().is_ok());
    /// session.end_session().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn start_session(&self, options: Option<SessionOptions>) -> ClientSession {
        let mut options = options.unwrap_or_default();
        if options.causal_consistency.is_none() {
            options.causal_consistency = Some(self.inner.config.causal_consistency);
        }
        ClientSession::new(self.clone(), options)
    }

    /// Run `body` in a new session that is bound before and ended after it,
    /// whatever the outcome
    ///
    /// # Examples
    ///
    /// ```
    /// # use docmotor::{Client, bson::doc};
    /// # #[tokio::main]
    /// # async fn main() -> docmotor::Result<()> {
    /// let client = Client::in_memory();
    /// let coll = client.database("app").collection("events");
    ///
    /// let inserted = client
    ///     .with_session(None, move |session| {
    ///         Box::pin(async move {
    ///             let result = coll
    ///                 .insert_many_with_session(vec![doc! { "kind": "login" }], session)
    ///                 .await?;
    ///             Ok(result.inserted_count())
    ///         })
    ///     })
    ///     .await?;
    /// assert_eq!(inserted, 1);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_session<T, F>(&self, options: Option<SessionOptions>, body: F) -> Result<T>
    where
        F: for<'s> FnOnce(&'s mut ClientSession) -> SessionBody<'s, T>,
    {
        let mut session = self.start_session(options);
        session.scoped(body).await
    }
}

impl PartialEq for Client {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_identity() {
        let client = Client::in_memory();
        let other = client.clone();
        assert_eq!(client, other);
        assert_ne!(client, Client::in_memory());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryStore::new());
        let config = ClientConfig::new().chunk_size_bytes(0);
        assert!(Client::with_config(store, config).is_err());
    }

    #[tokio::test]
    async fn test_session_inherits_causal_consistency() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryStore::new());
        let client =
            Client::with_config(store, ClientConfig::new().causal_consistency(false)).unwrap();

        let mut session = client.start_session(None);
        session.bind().await.unwrap();
        assert_eq!(session.options().unwrap().causal_consistency, Some(false));
        assert_eq!(session.client(), &client);
        session.end_session().await.unwrap();
    }
}
