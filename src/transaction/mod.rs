// ============================================================================
// Transaction State
// ============================================================================
//
// Client-side bookkeeping of a multi-document transaction bound to a session:
// - State Pattern: lifecycle None -> InProgress -> Committed/Aborted
// - The store owns the writes; this side only enforces legal transitions
//
// ============================================================================

pub mod state;

pub use state::{Transaction, TransactionOptions, TransactionState};
