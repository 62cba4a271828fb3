// ============================================================================
// GridFS
// ============================================================================
//
// Files are split into fixed-size chunks stored in `<bucket>.chunks` as
// `{ _id, files_id, n, data }`. A file's metadata document in
// `<bucket>.files` records `{ _id, length, chunkSize, uploadDate, filename }`
// and is written only when an upload is closed, so readers never see a file
// whose chunks are incomplete.
//
// ============================================================================

pub mod download;
pub mod upload;

pub use download::{ChunkSink, GridOut, GridOutCursor, WriterSink};
pub use upload::GridIn;

use crate::core::{DbError, Result};
use crate::cursor::Cursor;
use crate::facade::{Collection, Database};
use bson::oid::ObjectId;
use bson::spec::BinarySubtype;
use bson::{Binary, Bson, Document, doc};
use futures::future::BoxFuture;
use log::{debug, warn};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::OnceCell;

/// Chunk size used when neither the bucket nor the upload sets one
pub const DEFAULT_CHUNK_SIZE_BYTES: u32 = 255 * 1024;

pub const DEFAULT_BUCKET_NAME: &str = "fs";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GridFsBucketOptions {
    pub bucket_name: Option<String>,
    pub chunk_size_bytes: Option<u32>,
}

impl GridFsBucketOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bucket_name(mut self, name: &str) -> Self {
        self.bucket_name = Some(name.to_string());
        self
    }

    pub fn chunk_size_bytes(mut self, size: u32) -> Self {
        self.chunk_size_bytes = Some(size);
        self
    }
}

/// Per-upload overrides
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GridFsUploadOptions {
    pub chunk_size_bytes: Option<u32>,
    /// Stored under `metadata` in the files document
    pub metadata: Option<Document>,
}

impl GridFsUploadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunk_size_bytes(mut self, size: u32) -> Self {
        self.chunk_size_bytes = Some(size);
        self
    }

    pub fn metadata(mut self, metadata: Document) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A named GridFS bucket in one database.
///
/// # Examples
///
/// ```
/// # use docmotor::Client;
/// # #[tokio::main]
/// # async fn main() -> docmotor::Result<()> {
/// let bucket = Client::in_memory().database("media").gridfs_bucket(None);
///
/// let id = bucket.upload_from_stream("hello.txt", b"hello world", None).await?;
/// assert_eq!(bucket.download_to_vec(id).await?, b"hello world");
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct GridFsBucket {
    db: Database,
    bucket_name: String,
    chunk_size_bytes: u32,
    files: Collection,
    chunks: Collection,
    indexes: Arc<OnceCell<()>>,
}

impl GridFsBucket {
    pub(crate) fn new(db: Database, options: GridFsBucketOptions) -> Self {
        let bucket_name = options
            .bucket_name
            .unwrap_or_else(|| DEFAULT_BUCKET_NAME.to_string());
        let chunk_size_bytes = options
            .chunk_size_bytes
            .unwrap_or(db.client().config().chunk_size_bytes);
        let files = db.collection(&format!("{}.files", bucket_name));
        let chunks = db.collection(&format!("{}.chunks", bucket_name));

        Self {
            db,
            bucket_name,
            chunk_size_bytes,
            files,
            chunks,
            indexes: Arc::new(OnceCell::new()),
        }
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket_name
    }

    pub fn chunk_size_bytes(&self) -> u32 {
        self.chunk_size_bytes
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// The `<bucket>.files` collection
    pub fn files(&self) -> &Collection {
        &self.files
    }

    /// The `<bucket>.chunks` collection
    pub fn chunks(&self) -> &Collection {
        &self.chunks
    }

    // ------------------------------------------------------------------------
    // Chunk primitives
    // ------------------------------------------------------------------------

    async fn ensure_indexes(&self) -> Result<()> {
        self.indexes
            .get_or_try_init(|| async {
                self.files
                    .create_index(doc! { "filename": 1, "uploadDate": 1 })
                    .await?;
                self.chunks
                    .create_index(doc! { "files_id": 1, "n": 1 })
                    .await?;
                Ok::<_, DbError>(())
            })
            .await?;
        Ok(())
    }

    pub(crate) async fn put_chunk(&self, files_id: &Bson, n: u32, data: &[u8]) -> Result<()> {
        self.ensure_indexes().await?;
        let chunk = doc! {
            "_id": ObjectId::new(),
            "files_id": files_id.clone(),
            "n": n as i32,
            "data": Binary { subtype: BinarySubtype::Generic, bytes: data.to_vec() },
        };
        self.chunks.insert_many(vec![chunk]).await?;
        Ok(())
    }

    pub(crate) async fn put_file_document(&self, file: Document) -> Result<()> {
        self.ensure_indexes().await?;
        self.files.insert_many(vec![file]).await?;
        Ok(())
    }

    /// Chunks of one file in `n` order
    pub(crate) fn get_chunks_by_file_id(&self, files_id: &Bson) -> Cursor {
        self.chunks
            .find(doc! { "files_id": files_id.clone() })
            .sort(doc! { "n": 1 })
    }

    /// Whether a files document or any chunk already carries `id`
    pub(crate) async fn file_id_in_use(&self, id: &Bson) -> Result<bool> {
        if self.files.find_one(doc! { "_id": id.clone() }).await?.is_some() {
            return Ok(true);
        }
        let chunk = self
            .chunks
            .find_one(doc! { "files_id": id.clone() })
            .await?;
        Ok(chunk.is_some())
    }

    pub(crate) async fn delete_chunks(&self, files_id: &Bson) -> Result<u64> {
        let result = self
            .chunks
            .delete_many(doc! { "files_id": files_id.clone() })
            .await?;
        Ok(result.deleted_count)
    }

    // ------------------------------------------------------------------------
    // Upload
    // ------------------------------------------------------------------------

    /// Open a write stream for a new file with a generated `ObjectId`
    pub fn open_upload_stream(&self, filename: &str, options: Option<GridFsUploadOptions>) -> GridIn {
        self.open_upload_stream_with_id(ObjectId::new(), filename, options)
    }

    /// Open a write stream for a new file with a caller-chosen id
    pub fn open_upload_stream_with_id(
        &self,
        id: impl Into<Bson>,
        filename: &str,
        options: Option<GridFsUploadOptions>,
    ) -> GridIn {
        let options = options.unwrap_or_default();
        let chunk_size = options.chunk_size_bytes.unwrap_or(self.chunk_size_bytes);
        GridIn::new(self.clone(), id.into(), filename, chunk_size, options.metadata)
    }

    /// Run `body` against a fresh upload stream. The file is closed when the
    /// body returns `Ok` and aborted (its chunks deleted) when it returns
    /// `Err`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use docmotor::Client;
    /// # #[tokio::main]
    /// # async fn main() -> docmotor::Result<()> {
    /// let bucket = Client::in_memory().database("media").gridfs_bucket(None);
    ///
    /// let id = bucket
    ///     .upload_scope(Some("report".into()), "report.csv", None, |file| {
    ///         Box::pin(async move {
    ///             file.write(b"a,b\n").await?;
    ///             file.write(b"1,2\n").await?;
    ///             Ok(file.id().clone())
    ///         })
    ///     })
    ///     .await?;
    /// assert_eq!(bucket.download_to_vec(id).await?, b"a,b\n1,2\n");
    /// # Ok(())
    /// # }
    /// ```
    pub async fn upload_scope<T, F>(
        &self,
        id: Option<Bson>,
        filename: &str,
        options: Option<GridFsUploadOptions>,
        body: F,
    ) -> Result<T>
    where
        F: for<'g> FnOnce(&'g mut GridIn) -> BoxFuture<'g, Result<T>>,
    {
        let id = id.unwrap_or_else(|| Bson::ObjectId(ObjectId::new()));
        let mut file = self.open_upload_stream_with_id(id, filename, options);

        let written = body(&mut file).await;
        let value = match written {
            Ok(value) => value,
            Err(err) => return Err(abort_after(&mut file, err).await),
        };
        match file.close().await {
            Ok(()) => Ok(value),
            Err(err) => Err(abort_after(&mut file, err).await),
        }
    }

    /// Store `source` as a new file, returning its generated id
    pub async fn upload_from_stream(
        &self,
        filename: &str,
        source: &[u8],
        options: Option<GridFsUploadOptions>,
    ) -> Result<Bson> {
        let id = Bson::ObjectId(ObjectId::new());
        self.upload_from_stream_with_id(id.clone(), filename, source, options)
            .await?;
        Ok(id)
    }

    pub async fn upload_from_stream_with_id(
        &self,
        id: impl Into<Bson>,
        filename: &str,
        source: &[u8],
        options: Option<GridFsUploadOptions>,
    ) -> Result<()> {
        let mut file = self.open_upload_stream_with_id(id, filename, options);
        let written = file.write(source).await;
        finish_upload(file, written).await
    }

    /// Store everything `reader` yields as a new file, returning its id
    pub async fn upload_from_reader<R>(
        &self,
        filename: &str,
        mut reader: R,
        options: Option<GridFsUploadOptions>,
    ) -> Result<Bson>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut file = self.open_upload_stream(filename, options);
        let id = file.id().clone();
        let mut buf = vec![0u8; file.chunk_size() as usize];

        let written = async {
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    return Ok::<(), DbError>(());
                }
                file.write(&buf[..n]).await?;
            }
        }
        .await;

        finish_upload(file, written).await?;
        Ok(id)
    }

    // ------------------------------------------------------------------------
    // Download
    // ------------------------------------------------------------------------

    /// Open a read stream for the file `id`.
    ///
    /// Fails with `FileNotFound` when no files document has that id.
    pub async fn open_download_stream(&self, id: impl Into<Bson>) -> Result<GridOut> {
        let id = id.into();
        let file = self
            .files
            .find_one(doc! { "_id": id.clone() })
            .await?
            .ok_or_else(|| DbError::FileNotFound(id.to_string()))?;
        GridOut::new(self.clone(), file)
    }

    /// Read the whole file `id` into memory
    pub async fn download_to_vec(&self, id: impl Into<Bson>) -> Result<Vec<u8>> {
        self.open_download_stream(id).await?.read_to_end().await
    }

    /// Cursor over the files whose documents match `filter`
    ///
    /// # Examples
    ///
    /// ```
    /// # use docmotor::{Client, bson::doc};
    /// # #[tokio::main]
    /// # async fn main() -> docmotor::Result<()> {
    /// let bucket = Client::in_memory().database("media").gridfs_bucket(None);
    /// bucket.upload_from_stream("a.txt", b"aaa", None).await?;
    /// bucket.upload_from_stream("b.txt", b"bb", None).await?;
    ///
    /// let mut files = bucket.find(doc! { "length": { "$lt": 3 } });
    /// while let Some(file) = files.try_next().await? {
    ///     assert_eq!(file.filename(), Some("b.txt"));
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn find(&self, filter: Document) -> GridOutCursor {
        GridOutCursor::new(self.clone(), self.files.find(filter))
    }

    /// Delete a file and its chunks.
    ///
    /// Chunks are removed even when the files document is already gone; the
    /// call then fails with `FileNotFound`.
    pub async fn delete(&self, id: impl Into<Bson>) -> Result<()> {
        let id = id.into();
        let files_deleted = self
            .files
            .delete_many(doc! { "_id": id.clone() })
            .await?
            .deleted_count;
        let chunks_deleted = self.delete_chunks(&id).await?;
        debug!(
            "deleted file {} from bucket {} ({} chunk(s))",
            id, self.bucket_name, chunks_deleted
        );

        if files_deleted == 0 {
            return Err(DbError::FileNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Drop both collections of the bucket
    pub async fn drop(&self) -> Result<()> {
        self.files.drop().await?;
        self.chunks.drop().await
    }
}

/// Close `file` when the writes succeeded. A failed write or close aborts it.
async fn finish_upload(mut file: GridIn, written: Result<()>) -> Result<()> {
    if let Err(err) = written {
        return Err(abort_after(&mut file, err).await);
    }
    match file.close().await {
        Ok(()) => Ok(()),
        Err(err) => Err(abort_after(&mut file, err).await),
    }
}

/// Abort `file` after `err` and hand `err` back; abort failures are logged
async fn abort_after(file: &mut GridIn, err: DbError) -> DbError {
    if let Err(abort_err) = file.abort().await {
        warn!("failed to abort upload {}: {}", file.id(), abort_err);
    }
    err
}
