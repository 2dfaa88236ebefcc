//! # Per-plugin state snapshots and the process-wide state map.

mod map;
mod plugin;

pub use map::StateMap;
pub use plugin::{PluginState, PluginStatus};
