use bson::spec::BinarySubtype;
use bson::{Binary, Document, doc};
use std::collections::VecDeque;
use std::fmt;

/// Server-side cursor identifier. Zero means the server holds no more results.
pub type CursorId = i64;

/// Fully-qualified collection name (`database.collection`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

/// One page of results plus its continuation token.
///
/// An empty batch with a non-zero `cursor_id` means "more data, fetch again";
/// an empty batch with a zero `cursor_id` means the result set is exhausted.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub cursor_id: CursorId,
    pub documents: VecDeque<Document>,
}

impl Batch {
    pub fn new(cursor_id: CursorId, documents: impl Into<VecDeque<Document>>) -> Self {
        Self {
            cursor_id,
            documents: documents.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn is_last(&self) -> bool {
        self.cursor_id == 0
    }
}

/// Logical session identifier issued by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        SessionId(uuid::Uuid::new_v4())
    }

    /// The `lsid` document form: `{ id: <UUID binary> }`
    pub fn to_document(&self) -> Document {
        let id = Binary {
            subtype: BinarySubtype::Uuid,
            bytes: self.0.as_bytes().to_vec(),
        };
        doc! { "id": id }
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lsid_{}", self.0)
    }
}

/// Reply to a session handshake or a session-bound operation: the store's
/// logical clock at the time the operation completed.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterTime {
    pub cluster_time: Document,
    pub operation_time: bson::Timestamp,
}

impl ClusterTime {
    pub fn from_timestamp(ts: bson::Timestamp) -> Self {
        Self {
            cluster_time: doc! { "clusterTime": ts },
            operation_time: ts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_display() {
        assert_eq!(Namespace::new("app", "fs.files").to_string(), "app.fs.files");
    }

    #[test]
    fn test_session_id_document() {
        let id = SessionId::new();
        let lsid = id.to_document();
        match lsid.get("id") {
            Some(bson::Bson::Binary(bin)) => {
                assert_eq!(bin.subtype, BinarySubtype::Uuid);
                assert_eq!(bin.bytes, id.0.as_bytes().to_vec());
            }
            other => panic!("unexpected lsid field: {:?}", other),
        }
    }

    #[test]
    fn test_last_batch() {
        assert!(Batch::new(0, Vec::<Document>::new()).is_last());
        assert!(!Batch::new(42, Vec::<Document>::new()).is_last());
    }
}
