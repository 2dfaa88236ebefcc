//! External-store integration.
//!
//! ## Contents
//! - [`SynTestStore`], [`StoreRef`] — the key-value / pub-sub store contract
//! - [`MemoryStore`] — in-process reference implementation (tests, demos)
//! - [`ExtStorageHandler`] — broadcaster subscriber that persists results and
//!   periodically writes the agent's status snapshot

mod handler;
mod memory;
mod store;

pub use handler::ExtStorageHandler;
pub use memory::MemoryStore;
pub use store::{StoreRef, SynTestStore, VersionMap};
