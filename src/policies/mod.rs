//! Policies for supervising plugin execution:
//!  - [`backoff`] for delays between restarts;
//!  - [`RestartPolicy`] for restart decisions.
//!
//! ## Overview
//! - [`backoff`] — compute the delay before the next run: exponential growth
//!   with a hard cap, a positive floor, and a reset after long stable runs.
//! - [`restart`] — decide whether a plugin is restarted: *always / never /
//!   on error*, parsed leniently from config strings.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use synagent::policies::{backoff, RestartPolicy};
//!
//! // A plugin that keeps failing under policy Always backs off
//! // 10s, 20s, 40s, ... capped at 5 minutes.
//! let policy = RestartPolicy::parse("Always");
//! assert_eq!(policy, RestartPolicy::Always);
//!
//! let delays: Vec<Duration> = (0..6i64).map(backoff::restart_delay).collect();
//! assert_eq!(delays[0], Duration::from_secs(10));
//! assert_eq!(delays[1], Duration::from_secs(20));
//! assert_eq!(delays[5], Duration::from_secs(300));
//! ```

pub mod backoff;
mod restart;

pub use restart::RestartPolicy;
