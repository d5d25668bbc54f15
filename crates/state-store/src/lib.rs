//! Durable key-value state store contract.
//!
//! The saga engine persists execution records and per-entity version and
//! lock markers through [`StateStore`]. Writes may carry an etag or ask for
//! first-write-wins semantics, which is what optimistic updates build on.

pub mod error;
pub mod memory;
pub mod store;

pub use error::{Result, StateStoreError};
pub use memory::InMemoryStateStore;
pub use store::{
    Concurrency, Consistency, DeleteOptions, ETag, SaveOptions, StateEntry, StateStore,
    StateStoreExt,
};
