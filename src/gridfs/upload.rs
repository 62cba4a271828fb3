use super::GridFsBucket;
use crate::core::{DbError, Result};
use bson::{Bson, DateTime, Document, doc};
use log::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadState {
    Open,
    Closed,
    Aborted,
}

/// Write stream for one GridFS file.
///
/// Bytes are buffered and flushed to the chunks collection one full chunk
/// at a time. `close` writes the trailing partial chunk and then the files
/// document; `abort` deletes every chunk written so far.
///
/// A failed `write` leaves the stream open with its unflushed bytes still
/// buffered; the usual recovery is `abort`.
#[derive(Debug)]
pub struct GridIn {
    bucket: GridFsBucket,
    id: Bson,
    filename: String,
    chunk_size: u32,
    metadata: Option<Document>,
    buffer: Vec<u8>,
    /// Number of the next chunk to flush
    chunk_number: u32,
    /// Bytes already flushed
    flushed: u64,
    /// The id was checked free; chunks under it belong to this upload
    claimed: bool,
    state: UploadState,
}

impl GridIn {
    pub(crate) fn new(
        bucket: GridFsBucket,
        id: Bson,
        filename: &str,
        chunk_size: u32,
        metadata: Option<Document>,
    ) -> Self {
        Self {
            bucket,
            id,
            filename: filename.to_string(),
            chunk_size,
            metadata,
            buffer: Vec::new(),
            chunk_number: 0,
            flushed: 0,
            claimed: false,
            state: UploadState::Open,
        }
    }

    pub fn id(&self) -> &Bson {
        &self.id
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Bytes written so far, flushed or not
    pub fn length(&self) -> u64 {
        self.flushed + self.buffer.len() as u64
    }

    pub fn is_closed(&self) -> bool {
        self.state == UploadState::Closed
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            UploadState::Open => Ok(()),
            UploadState::Closed => Err(DbError::invalid_operation("cannot write to a closed file")),
            UploadState::Aborted => Err(DbError::invalid_operation("cannot write to an aborted file")),
        }
    }

    /// Fail with `FileExists` when another file or upload already uses our id.
    /// Checked once, before the first byte reaches the store.
    async fn claim_id(&mut self) -> Result<()> {
        if self.claimed {
            return Ok(());
        }
        if self.bucket.file_id_in_use(&self.id).await? {
            return Err(DbError::FileExists(self.id.to_string()));
        }
        self.claimed = true;
        Ok(())
    }

    async fn flush_chunk(&mut self) -> Result<()> {
        self.claim_id().await?;
        self.bucket
            .put_chunk(&self.id, self.chunk_number, &self.buffer)
            .await?;
        self.chunk_number += 1;
        self.flushed += self.buffer.len() as u64;
        self.buffer.clear();
        Ok(())
    }

    /// Append `data`, flushing every chunk that fills up
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if self.chunk_size == 0 {
            return Err(DbError::invalid_operation("chunk size must be > 0"));
        }

        let chunk_size = self.chunk_size as usize;
        let mut rest = data;
        while !rest.is_empty() {
            if self.buffer.len() == chunk_size {
                self.flush_chunk().await?;
            }
            let take = (chunk_size - self.buffer.len()).min(rest.len());
            self.buffer.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
        }
        if self.buffer.len() == chunk_size {
            self.flush_chunk().await?;
        }
        Ok(())
    }

    /// Flush the last partial chunk and publish the files document.
    /// Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        match self.state {
            UploadState::Closed => return Ok(()),
            UploadState::Aborted => {
                return Err(DbError::invalid_operation("cannot close an aborted file"));
            }
            UploadState::Open => {}
        }

        self.claim_id().await?;
        if !self.buffer.is_empty() {
            self.flush_chunk().await?;
        }

        let mut file = doc! {
            "_id": self.id.clone(),
            "length": self.flushed as i64,
            "chunkSize": self.chunk_size as i32,
            "uploadDate": DateTime::now(),
            "filename": self.filename.clone(),
        };
        if let Some(metadata) = &self.metadata {
            file.insert("metadata", metadata.clone());
        }
        self.bucket.put_file_document(file).await?;

        self.state = UploadState::Closed;
        debug!(
            "closed upload {} ({} bytes in {} chunk(s))",
            self.id, self.flushed, self.chunk_number
        );
        Ok(())
    }

    /// Discard the upload, deleting any chunks it already wrote. Chunks of
    /// another file with the same id are never touched.
    /// Aborting twice is a no-op; aborting a closed file is an error.
    pub async fn abort(&mut self) -> Result<()> {
        match self.state {
            UploadState::Aborted => return Ok(()),
            UploadState::Closed => {
                return Err(DbError::invalid_operation("cannot abort a closed file"));
            }
            UploadState::Open => {}
        }

        self.state = UploadState::Aborted;
        self.buffer.clear();
        if !self.claimed {
            debug!("aborted upload {} before any chunk was written", self.id);
            return Ok(());
        }
        let deleted = self.bucket.delete_chunks(&self.id).await?;
        debug!("aborted upload {} ({} chunk(s) removed)", self.id, deleted);
        Ok(())
    }
}

impl Drop for GridIn {
    fn drop(&mut self) {
        if self.state == UploadState::Open && self.length() > 0 {
            warn!(
                "upload {} dropped before close; {} chunk(s) left without a files document",
                self.id, self.chunk_number
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::Client;
    use crate::gridfs::{GridFsBucketOptions, GridFsUploadOptions};
    use bson::doc;

    fn bucket(chunk_size: u32) -> crate::GridFsBucket {
        Client::in_memory()
            .database("media")
            .gridfs_bucket(Some(GridFsBucketOptions::new().chunk_size_bytes(chunk_size)))
    }

    #[tokio::test]
    async fn test_full_chunks_flush_on_write() {
        let bucket = bucket(4);
        let mut file = bucket.open_upload_stream("f", None);

        file.write(b"abcdefghij").await.unwrap();
        let chunks = bucket.chunks().find(doc! {}).to_list(None).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(file.length(), 10);

        file.close().await.unwrap();
        let chunks = bucket.chunks().find(doc! {}).to_list(None).await.unwrap();
        assert_eq!(chunks.len(), 3);
    }

    #[tokio::test]
    async fn test_files_document_written_on_close() {
        let bucket = bucket(4);
        let mut file = bucket.open_upload_stream_with_id(
            1,
            "one.bin",
            Some(GridFsUploadOptions::new().metadata(doc! { "owner": "alice" })),
        );
        file.write(b"12345").await.unwrap();
        assert!(bucket.files().find_one(doc! { "_id": 1 }).await.unwrap().is_none());

        file.close().await.unwrap();
        let stored = bucket.files().find_one(doc! { "_id": 1 }).await.unwrap().unwrap();
        assert_eq!(stored.get_i64("length").unwrap(), 5);
        assert_eq!(stored.get_i32("chunkSize").unwrap(), 4);
        assert_eq!(stored.get_str("filename").unwrap(), "one.bin");
        assert_eq!(stored.get_document("metadata").unwrap(), &doc! { "owner": "alice" });
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let bucket = bucket(4);
        let mut file = bucket.open_upload_stream("f", None);
        file.close().await.unwrap();
        file.close().await.unwrap();

        assert!(file.write(b"x").await.unwrap_err().is_invalid_operation());
        assert!(file.abort().await.unwrap_err().is_invalid_operation());
    }

    #[tokio::test]
    async fn test_abort_removes_chunks() {
        let bucket = bucket(2);
        let mut file = bucket.open_upload_stream("f", None);
        file.write(b"abcdef").await.unwrap();
        file.abort().await.unwrap();
        file.abort().await.unwrap();

        assert!(bucket.chunks().find(doc! {}).to_list(None).await.unwrap().is_empty());
        assert!(bucket.files().find(doc! {}).to_list(None).await.unwrap().is_empty());
        assert!(file.close().await.unwrap_err().is_invalid_operation());
    }

    #[tokio::test]
    async fn test_taken_id_fails_before_writing_chunks() {
        let bucket = bucket(4);
        bucket.upload_from_stream_with_id(1, "orig", b"original", None).await.unwrap();

        let mut file = bucket.open_upload_stream_with_id(1, "copy", None);
        let err = file.write(b"clobber!").await.unwrap_err();
        assert!(matches!(err, crate::DbError::FileExists(_)));
        file.abort().await.unwrap();

        let chunks = bucket.chunks().find(doc! { "files_id": 1 }).to_list(None).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(bucket.download_to_vec(1).await.unwrap(), b"original");
    }

    #[tokio::test]
    async fn test_taken_id_fails_on_empty_close() {
        let bucket = bucket(4);
        bucket.upload_from_stream_with_id(2, "orig", b"abc", None).await.unwrap();

        let mut file = bucket.open_upload_stream_with_id(2, "empty", None);
        assert!(matches!(file.close().await.unwrap_err(), crate::DbError::FileExists(_)));
        assert!(!file.is_closed());
    }

    #[tokio::test]
    async fn test_zero_chunk_size_rejected() {
        let bucket = bucket(4);
        let mut file = bucket.open_upload_stream(
            "f",
            Some(GridFsUploadOptions::new().chunk_size_bytes(0)),
        );
        assert!(file.write(b"x").await.unwrap_err().is_invalid_operation());
        file.abort().await.unwrap();
    }
}
