//! Command-driven chat session runtime.
//!
//! One tokio task owns navigation, the active room's timeline and its live subscription.
//! Frontends talk to it only through [`ChatRuntimeHandle`]: commands in, events out.

mod runtime;
mod session;

pub use runtime::{ChatRuntimeHandle, RuntimeConfig, spawn_runtime};
