pub mod deadline;
pub mod error;
pub mod types;

pub use error::{DbError, Result};
pub use types::{Batch, ClusterTime, CursorId, Namespace, SessionId};
