//! Atomic, checksummed persistence for workflow run state.

pub mod store;

pub use store::{StateLock, StateStore};
