//! # Shared Store
//!
//! The one place coordination state lives: cached results, concurrency slots and rate
//! window counters. Every process in a fleet that points at the same backend sees the
//! same state, which is what makes the limits fleet-wide.
//!
//! Backends implement [`SharedStore`]; consumers hold a [`StoreProvider`], which dispatches
//! to the configured backend without dynamic dispatch.
//!
//! - **Redis**: the production backend; multi-key updates run as Lua scripts
//! - **Memory**: single-process backend for tests and local development

pub mod errors;
pub mod provider;
pub mod providers;
pub mod traits;

pub use errors::{StoreError, StoreResult};
pub use provider::StoreProvider;
pub use providers::{MemoryStore, RedisStore};
pub use traits::{KeyPattern, RateDecision, SharedStore, SlotToken};
