use super::GridFsBucket;
use crate::core::{DbError, Result};
use crate::cursor::Cursor;
use crate::storage::query::as_i64;
use async_trait::async_trait;
use bson::{Bson, Document};
use futures::Stream;
use log::debug;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Destination for `GridOut::stream_to_handler`
#[async_trait]
pub trait ChunkSink: Send {
    /// Receive the next chunk, in file order
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Called once after the last chunk
    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ChunkSink for Vec<u8> {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.extend_from_slice(data);
        Ok(())
    }
}

/// Adapts any tokio `AsyncWrite` into a `ChunkSink`
///
/// # Examples
///
/// ```
/// # use docmotor::{Client, WriterSink};
/// # #[tokio::main]
/// # async fn main() -> docmotor::Result<()> {
/// let bucket = Client::in_memory().database("media").gridfs_bucket(None);
/// let id = bucket.upload_from_stream("log.txt", b"line\n", None).await?;
///
/// let mut sink = WriterSink(Vec::new());
/// bucket.open_download_stream(id).await?.stream_to_handler(&mut sink).await?;
/// assert_eq!(sink.0, b"line\n");
/// # Ok(())
/// # }
/// ```
pub struct WriterSink<W>(pub W);

#[async_trait]
impl<W> ChunkSink for WriterSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.0.write_all(data).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.0.flush().await?;
        Ok(())
    }
}

/// Read stream for one GridFS file.
///
/// Chunks are fetched lazily, in order, and checked against the files
/// document: a missing, out-of-order, or wrongly-sized chunk fails the read
/// with `CorruptFile`. A `GridOut` is read once; open a new one to re-read.
#[derive(Debug)]
pub struct GridOut {
    bucket: GridFsBucket,
    id: Bson,
    length: u64,
    chunk_size: u32,
    filename: Option<String>,
    upload_date: Option<bson::DateTime>,
    metadata: Option<Document>,
    chunks: Option<Cursor>,
    next_n: u32,
    position: u64,
    finished: bool,
}

impl GridOut {
    pub(crate) fn new(bucket: GridFsBucket, file: Document) -> Result<Self> {
        let id = file
            .get("_id")
            .cloned()
            .ok_or_else(|| DbError::Serialization("files document has no _id".to_string()))?;
        let corrupt = |reason: &str| DbError::CorruptFile {
            file_id: id.to_string(),
            reason: reason.to_string(),
        };

        let length = file
            .get("length")
            .and_then(as_i64)
            .filter(|len| *len >= 0)
            .ok_or_else(|| corrupt("missing or invalid length"))?;
        let chunk_size = file
            .get("chunkSize")
            .and_then(as_i64)
            .filter(|size| *size > 0 && *size <= i64::from(u32::MAX))
            .ok_or_else(|| corrupt("missing or invalid chunkSize"))?;

        Ok(Self {
            length: length as u64,
            chunk_size: chunk_size as u32,
            filename: file.get_str("filename").ok().map(str::to_string),
            upload_date: file.get_datetime("uploadDate").ok().copied(),
            metadata: file.get_document("metadata").ok().cloned(),
            bucket,
            id,
            chunks: None,
            next_n: 0,
            position: 0,
            finished: false,
        })
    }

    pub fn id(&self) -> &Bson {
        &self.id
    }

    /// Total file size in bytes
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn upload_date(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.upload_date.map(|date| date.to_chrono())
    }

    pub fn metadata(&self) -> Option<&Document> {
        self.metadata.as_ref()
    }

    /// Bytes read so far
    pub fn position(&self) -> u64 {
        self.position
    }

    fn expected_chunks(&self) -> u64 {
        self.length.div_ceil(u64::from(self.chunk_size))
    }

    fn corrupt(&self, reason: String) -> DbError {
        DbError::CorruptFile {
            file_id: self.id.to_string(),
            reason,
        }
    }

    /// After the last expected chunk, make sure the store holds no more
    async fn finish(&mut self) -> Result<()> {
        if let Some(mut cursor) = self.chunks.take() {
            let extra = cursor.try_next().await?;
            cursor.close().await?;
            if let Some(chunk) = extra {
                let n = chunk.get("n").and_then(as_i64).unwrap_or(-1);
                return Err(self.corrupt(format!("extra chunk n={}", n)));
            }
        }
        self.finished = true;
        Ok(())
    }

    /// Next chunk of file data, or `None` once all `length` bytes were read
    pub async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }
        if u64::from(self.next_n) >= self.expected_chunks() {
            self.finish().await?;
            return Ok(None);
        }

        let id = self.id.clone();
        let cursor = self
            .chunks
            .get_or_insert_with(|| self.bucket.get_chunks_by_file_id(&id));
        let chunk = cursor
            .try_next()
            .await?
            .ok_or_else(|| self.corrupt(format!("missing chunk n={}", self.next_n)))?;

        let n = chunk.get("n").and_then(as_i64);
        if n != Some(i64::from(self.next_n)) {
            return Err(self.corrupt(format!(
                "expected chunk n={} but found n={}",
                self.next_n,
                n.map_or_else(|| "?".to_string(), |n| n.to_string())
            )));
        }

        let data = match chunk.get("data") {
            Some(Bson::Binary(binary)) => binary.bytes.clone(),
            _ => return Err(self.corrupt(format!("chunk n={} has no binary data", self.next_n))),
        };

        let is_last = u64::from(self.next_n) + 1 == self.expected_chunks();
        let expected_len = if is_last {
            self.length - u64::from(self.next_n) * u64::from(self.chunk_size)
        } else {
            u64::from(self.chunk_size)
        };
        if data.len() as u64 != expected_len {
            return Err(self.corrupt(format!(
                "chunk n={} has {} bytes, expected {}",
                self.next_n,
                data.len(),
                expected_len
            )));
        }

        self.next_n += 1;
        self.position += data.len() as u64;
        Ok(Some(data))
    }

    /// Consume the stream as a `Stream` of chunks
    pub fn chunks(self) -> impl Stream<Item = Result<Vec<u8>>> + Send {
        futures::stream::try_unfold(self, |mut file| async move {
            Ok::<_, DbError>(file.read_chunk().await?.map(|chunk| (chunk, file)))
        })
    }

    /// Read every remaining byte
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        // The declared length is untrusted until the chunks back it up
        let remaining = self.length - self.position;
        let mut data = Vec::with_capacity(remaining.min(u64::from(self.chunk_size)) as usize);
        while let Some(chunk) = self.read_chunk().await? {
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    /// Feed every remaining chunk to `sink` in order, then flush it.
    /// Returns the number of bytes delivered.
    pub async fn stream_to_handler<S>(&mut self, sink: &mut S) -> Result<u64>
    where
        S: ChunkSink + ?Sized,
    {
        let mut written = 0u64;
        while let Some(chunk) = self.read_chunk().await? {
            sink.write(&chunk).await?;
            written += chunk.len() as u64;
        }
        sink.flush().await?;
        debug!("streamed {} bytes of file {}", written, self.id);
        Ok(written)
    }
}

/// Cursor over files documents, yielding a `GridOut` per file
#[derive(Debug)]
pub struct GridOutCursor {
    bucket: GridFsBucket,
    cursor: Cursor,
}

impl GridOutCursor {
    pub(crate) fn new(bucket: GridFsBucket, cursor: Cursor) -> Self {
        Self { bucket, cursor }
    }

    pub fn sort(mut self, spec: Document) -> Self {
        self.cursor = self.cursor.sort(spec);
        self
    }

    pub fn skip(mut self, n: u64) -> Self {
        self.cursor = self.cursor.skip(n);
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.cursor = self.cursor.limit(n);
        self
    }

    pub fn batch_size(mut self, n: u32) -> Self {
        self.cursor = self.cursor.batch_size(n);
        self
    }

    /// The underlying cursor over files documents
    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub async fn try_next(&mut self) -> Result<Option<GridOut>> {
        match self.cursor.try_next().await? {
            Some(file) => Ok(Some(GridOut::new(self.bucket.clone(), file)?)),
            None => Ok(None),
        }
    }

    pub async fn to_list(&mut self, limit: Option<usize>) -> Result<Vec<GridOut>> {
        self.cursor
            .to_list(limit)
            .await?
            .into_iter()
            .map(|file| GridOut::new(self.bucket.clone(), file))
            .collect()
    }

    pub async fn close(&mut self) -> Result<()> {
        self.cursor.close().await
    }
}
