//! tx: transactions over the object heap.
//!
//! - events.rs:  persistent event codec (Malloc / Deallocate / BeforeWrite / Outcome)
//! - store.rs:   TransactionStore (append-only log of events)
//! - manager.rs: current transaction, commit, rollback, recovery
//! - heap.rs:    TransactionalHeap + TxHandle

pub mod events;
pub mod heap;
pub mod manager;
pub mod store;

pub use events::Event;
pub use heap::{TransactionalHeap, TxHandle};
pub use manager::{RecoveryReport, TransactionManager};
pub use store::TransactionStore;
