//! Plugin contract and per-plugin supervision.
//!
//! ## Contents
//! - [`SynTestPlugin`], [`PluginRef`] — the async contract a synthetic test
//!   implements
//! - [`PluginFn`] — closure-backed plugin for tests and demos
//! - [`PluginRegistry`] — plugin-name → factory lookup used by the reconciler
//! - [`ResultEmitter`] — binds a plugin-id to the broadcaster
//! - [`PluginSupervisor`] — runs one plugin under its restart policy

mod plugin;
mod supervisor;

pub use plugin::{PluginFn, PluginRef, PluginRegistry, ResultEmitter, SynTestPlugin};
pub use supervisor::PluginSupervisor;
