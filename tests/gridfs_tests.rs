/// GridFS tests
///
/// Upload/download round trips, push-mode downloads, file lookup, and
/// error-path cleanup.
/// Run with: cargo test --test gridfs_tests
use async_trait::async_trait;
use docmotor::bson::{Bson, doc};
use docmotor::{
    ChunkSink, Client, DbError, GridFsBucket, GridFsBucketOptions, GridFsUploadOptions,
    InMemoryStore, Result,
};
use std::sync::Arc;
use std::time::Duration;

fn bucket_with_chunk_size(chunk_size: u32) -> GridFsBucket {
    Client::in_memory()
        .database("media")
        .gridfs_bucket(Some(GridFsBucketOptions::new().chunk_size_bytes(chunk_size)))
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn test_round_trip_lengths() {
    let c = 16usize;
    for len in [0, 1, c - 1, c, c + 1, 10 * c] {
        let bucket = bucket_with_chunk_size(c as u32);
        let data = payload(len);

        let id = bucket.upload_from_stream("file.bin", &data, None).await.unwrap();
        let mut file = bucket.open_download_stream(id.clone()).await.unwrap();
        assert_eq!(file.length(), len as u64);
        assert_eq!(file.read_to_end().await.unwrap(), data, "len = {}", len);

        let chunks = bucket
            .chunks()
            .find(doc! { "files_id": id })
            .to_list(None)
            .await
            .unwrap();
        assert_eq!(chunks.len(), len.div_ceil(c), "len = {}", len);
    }
}

#[tokio::test]
async fn test_round_trip_default_chunk_size() {
    let bucket = Client::in_memory().database("media").gridfs_bucket(None);
    let data = payload(600 * 1024);

    let id = bucket.upload_from_stream("big.bin", &data, None).await.unwrap();
    let file = bucket.open_download_stream(id.clone()).await.unwrap();
    assert_eq!(file.chunk_size(), 255 * 1024);
    assert_eq!(bucket.download_to_vec(id).await.unwrap(), data);
}

#[tokio::test]
async fn test_one_byte_chunks() {
    let bucket = Client::in_memory().database("media").gridfs_bucket(None);
    bucket
        .upload_from_stream_with_id(
            1,
            "filename",
            b"data",
            Some(GridFsUploadOptions::new().chunk_size_bytes(1)),
        )
        .await
        .unwrap();

    let mut file = bucket.open_download_stream(1).await.unwrap();
    let mut chunks = Vec::new();
    while let Some(chunk) = file.read_chunk().await.unwrap() {
        chunks.push(chunk);
    }
    assert_eq!(chunks, vec![b"d".to_vec(), b"a".to_vec(), b"t".to_vec(), b"a".to_vec()]);
}

#[tokio::test]
async fn test_many_small_writes() {
    let bucket = bucket_with_chunk_size(5);
    let mut file = bucket.open_upload_stream("pieces", None);
    for piece in [&b"ab"[..], b"cde", b"", b"fghijkl", b"m"] {
        file.write(piece).await.unwrap();
    }
    file.close().await.unwrap();

    assert_eq!(
        bucket.download_to_vec(file.id().clone()).await.unwrap(),
        b"abcdefghijklm"
    );
}

/// Collects chunks, yielding to the scheduler on every write
struct SlowSink {
    received: Vec<Vec<u8>>,
    flushed: bool,
}

#[async_trait]
impl ChunkSink for SlowSink {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.received.push(data.to_vec());
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.flushed = true;
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_stream_to_handler() {
    let bucket = bucket_with_chunk_size(64);
    let data = payload(1000);
    let id = bucket.upload_from_stream("stream.bin", &data, None).await.unwrap();

    let mut sink = SlowSink {
        received: Vec::new(),
        flushed: false,
    };
    let mut file = bucket.open_download_stream(id).await.unwrap();
    let written = file.stream_to_handler(&mut sink).await.unwrap();

    assert_eq!(written, 1000);
    assert!(sink.flushed);
    assert_eq!(sink.received.len(), 16);
    assert_eq!(sink.received.concat(), data);
}

struct FailingSink;

#[async_trait]
impl ChunkSink for FailingSink {
    async fn write(&mut self, _data: &[u8]) -> Result<()> {
        Err(DbError::IoError("disk full".to_string()))
    }
}

#[tokio::test]
async fn test_sink_error_propagates() {
    let bucket = bucket_with_chunk_size(4);
    let id = bucket.upload_from_stream("f", b"abcdef", None).await.unwrap();

    let mut file = bucket.open_download_stream(id).await.unwrap();
    let err = file.stream_to_handler(&mut FailingSink).await.unwrap_err();
    assert!(matches!(err, DbError::IoError(_)));
}

#[tokio::test]
async fn test_find_files() {
    let bucket = bucket_with_chunk_size(8);
    for (i, name) in ["a.txt", "b.txt", "c.txt"].iter().enumerate() {
        bucket
            .upload_from_stream_with_id(i as i32, name, name.as_bytes(), None)
            .await
            .unwrap();
    }

    let mut cursor = bucket.find(doc! { "_id": 1 });
    let mut file = cursor.try_next().await.unwrap().unwrap();
    assert_eq!(file.filename(), Some("b.txt"));
    assert_eq!(file.read_to_end().await.unwrap(), b"b.txt");
    assert!(cursor.try_next().await.unwrap().is_none());

    let all = bucket
        .find(doc! {})
        .sort(doc! { "filename": -1 })
        .batch_size(1)
        .to_list(None)
        .await
        .unwrap();
    let names: Vec<_> = all.iter().map(|f| f.filename().unwrap().to_string()).collect();
    assert_eq!(names, vec!["c.txt", "b.txt", "a.txt"]);
}

#[tokio::test]
async fn test_find_in_batches() {
    let store = Arc::new(InMemoryStore::new());
    let bucket = Client::new(store.clone()).database("media").gridfs_bucket(None);
    for i in 0..7 {
        bucket
            .upload_from_stream(&format!("file-{}", i), b"x", None)
            .await
            .unwrap();
    }
    store.reset_command_counts();

    let mut cursor = bucket.find(doc! {}).batch_size(3);
    let mut found = 0;
    while let Some(file) = cursor.try_next().await.unwrap() {
        assert_eq!(file.length(), 1);
        found += 1;
    }
    assert_eq!(found, 7);
    assert_eq!(store.command_count("getMore"), 2);
}

#[tokio::test]
async fn test_missing_file() {
    let bucket = bucket_with_chunk_size(8);
    let err = bucket.open_download_stream("missing").await.unwrap_err();
    assert!(matches!(err, DbError::FileNotFound(_)));

    let err = bucket.download_to_vec(Bson::Int32(42)).await.unwrap_err();
    assert!(matches!(err, DbError::FileNotFound(_)));
}

#[tokio::test]
async fn test_delete_removes_file_and_chunks() {
    let bucket = bucket_with_chunk_size(2);
    let id = bucket.upload_from_stream("f", b"abcdef", None).await.unwrap();

    bucket.delete(id.clone()).await.unwrap();
    assert!(matches!(
        bucket.open_download_stream(id.clone()).await.unwrap_err(),
        DbError::FileNotFound(_)
    ));
    assert!(bucket.chunks().find(doc! {}).to_list(None).await.unwrap().is_empty());
    assert!(matches!(bucket.delete(id).await.unwrap_err(), DbError::FileNotFound(_)));
}

#[tokio::test]
async fn test_failed_scope_aborts_upload() {
    let bucket = bucket_with_chunk_size(4);

    let result: Result<()> = bucket
        .upload_scope(Some(Bson::Int32(9)), "partial.bin", None, |file| {
            Box::pin(async move {
                file.write(b"0123456789").await?;
                Err(DbError::invalid_operation("producer failed"))
            })
        })
        .await;

    assert!(result.unwrap_err().is_invalid_operation());
    assert!(bucket.chunks().find(doc! {}).to_list(None).await.unwrap().is_empty());
    assert!(matches!(
        bucket.open_download_stream(9).await.unwrap_err(),
        DbError::FileNotFound(_)
    ));
}

#[tokio::test]
async fn test_scope_closes_on_success() {
    let bucket = bucket_with_chunk_size(4);

    let length = bucket
        .upload_scope(Some(Bson::Int32(3)), "ok.bin", None, |file| {
            Box::pin(async move {
                file.write(b"hello ").await?;
                file.write(b"world").await?;
                Ok(file.length())
            })
        })
        .await
        .unwrap();

    assert_eq!(length, 11);
    assert_eq!(bucket.download_to_vec(3).await.unwrap(), b"hello world");
}

#[tokio::test]
async fn test_chunk_write_failure_surfaces() {
    let store = Arc::new(InMemoryStore::new());
    let bucket = Client::new(store.clone())
        .database("media")
        .gridfs_bucket(Some(GridFsBucketOptions::new().chunk_size_bytes(2)));

    // Warm up the index creation so the next insert is a chunk write
    bucket.upload_from_stream("warm", b"x", None).await.unwrap();

    store.fail_command("insert", 1);
    let err = bucket
        .upload_from_stream_with_id(5, "f", b"abcd", None)
        .await
        .unwrap_err();
    assert!(err.is_remote());
    assert!(
        bucket
            .chunks()
            .find(doc! { "files_id": 5 })
            .to_list(None)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_reused_id_leaves_existing_file_intact() {
    let bucket = bucket_with_chunk_size(4);
    bucket
        .upload_from_stream_with_id(1, "orig", b"original", None)
        .await
        .unwrap();

    let err = bucket
        .upload_from_stream_with_id(1, "copy", b"clobber!", None)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::FileExists(_)));

    let chunks = bucket.chunks().find(doc! {}).to_list(None).await.unwrap();
    assert_eq!(chunks.len(), 2);
    assert_eq!(bucket.download_to_vec(1).await.unwrap(), b"original");
}

#[tokio::test]
async fn test_reused_id_in_scope_keeps_existing_chunks() {
    let bucket = bucket_with_chunk_size(4);
    bucket.upload_from_stream_with_id(7, "orig", b"abcdef", None).await.unwrap();

    let result: Result<()> = bucket
        .upload_scope(Some(Bson::Int32(7)), "copy", None, |file| {
            Box::pin(async move { file.write(b"0123456789").await })
        })
        .await;

    assert!(matches!(result.unwrap_err(), DbError::FileExists(_)));
    assert_eq!(bucket.download_to_vec(7).await.unwrap(), b"abcdef");
}

#[tokio::test]
async fn test_failed_files_insert_removes_chunks() {
    let store = Arc::new(InMemoryStore::new());
    let bucket = Client::new(store.clone())
        .database("media")
        .gridfs_bucket(Some(GridFsBucketOptions::new().chunk_size_bytes(2)));

    store.fail_command_on("insert", bucket.files().namespace(), 1);
    let err = bucket
        .upload_from_stream_with_id(5, "f", b"abcde", None)
        .await
        .unwrap_err();
    assert!(err.is_remote());
    assert!(bucket.chunks().find(doc! {}).to_list(None).await.unwrap().is_empty());
    assert!(bucket.files().find(doc! {}).to_list(None).await.unwrap().is_empty());

    // the id is free again
    bucket.upload_from_stream_with_id(5, "f", b"abcde", None).await.unwrap();
    assert_eq!(bucket.download_to_vec(5).await.unwrap(), b"abcde");
}

#[tokio::test]
async fn test_failed_close_in_scope_removes_chunks() {
    let store = Arc::new(InMemoryStore::new());
    let bucket = Client::new(store.clone())
        .database("media")
        .gridfs_bucket(Some(GridFsBucketOptions::new().chunk_size_bytes(2)));

    store.fail_command_on("insert", bucket.files().namespace(), 1);
    let result = bucket
        .upload_scope(None, "f", None, |file| {
            Box::pin(async move { file.write(b"abc").await })
        })
        .await;

    assert!(result.unwrap_err().is_remote());
    assert!(bucket.chunks().find(doc! {}).to_list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_huge_declared_length_reports_corruption() {
    let bucket = bucket_with_chunk_size(4);
    bucket
        .files()
        .insert_one(doc! { "_id": 9, "length": i64::MAX, "chunkSize": 4, "filename": "bad" })
        .await
        .unwrap();

    let err = bucket.download_to_vec(9).await.unwrap_err();
    assert!(matches!(err, DbError::CorruptFile { .. }));
}
