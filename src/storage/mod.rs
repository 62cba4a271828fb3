pub mod engine;
pub mod failpoint;
pub mod memory;
pub mod query;

pub use engine::{DocumentStore, FindSpec};
pub use memory::InMemoryStore;
