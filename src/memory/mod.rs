//! Core memory engine: types, store, search cascade, and consolidation.

pub mod consolidate;
pub mod search;
pub mod store;
pub mod types;

pub use store::{ItemFilter, MemoryStore};
