#![allow(clippy::doc_markdown)] // Allow technical terms like Redis, Lua in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # API Toolkit
//!
//! Fleet-wide guards for API client call sites.
//!
//! ## Overview
//!
//! A call site wrapped in a [`CallGuard`] gets three independent behaviors, all coordinated
//! through one shared store so they hold across every process and machine using it:
//!
//! - **Response caching** keyed by a deterministic call fingerprint, with a TTL or kept
//!   until explicitly invalidated
//! - **Admission control** bounding in-flight concurrency and calls per fixed window
//! - **Outcome classification** turning results into accept, retry (with delay) or ignore
//!
//! ## Module Organization
//!
//! - [`fingerprint`] - Canonical call signatures and their digests
//! - [`store`] - Shared store contract with Redis and in-memory backends
//! - [`cache`] - Cache coordinator
//! - [`admission`] - Concurrency and rate limiters
//! - [`classifier`] - Retry and ignore policies
//! - [`guard`] - The call wrapper, suspendable and blocking
//! - [`config`] - Configuration loading and the per-site surface
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust
//! use api_toolkit::{ApiResponse, CacheTtl, CallGuard, CallSignature, GuardConfig, StoreProvider};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(StoreProvider::memory());
//! let guard = CallGuard::new(
//!     GuardConfig::new("github").ttl(CacheTtl::seconds(60)).concurrency_limit(4),
//!     store,
//! )?;
//!
//! let signature = CallSignature::new("GET", "https://api.github.com/repos/rust-lang/rust");
//! let outcome = guard
//!     .call(&signature, || async {
//!         Ok::<_, std::io::Error>(ApiResponse::new(200, "{}".to_string()))
//!     })
//!     .await
//!     .map_err(|e| e.to_string())?;
//!
//! assert_eq!(outcome.value().map(|r| r.status), Some(200));
//! # Ok(())
//! # }
//! # tokio::runtime::Runtime::new().unwrap().block_on(example()).unwrap();
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test                          # Unit and integration tests (in-memory store)
//! cargo test --features test-services # Also run against Redis at REDIS_URL
//! ```

pub mod admission;
pub mod cache;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod guard;
pub mod logging;
pub mod store;

pub use admission::{AdmissionScope, AdmissionState, AdmissionTicket, ConcurrencyLimiter, RateLimiter};
pub use cache::{CacheCoordinator, CacheEntry, CacheTtl};
pub use classifier::{
    ApiResponse, Decision, HasStatus, IgnorePolicy, OutcomeClassifier, RetryPolicy,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigManager, ToolkitConfig};
pub use error::{CallError, ToolkitError, ToolkitResult};
pub use fingerprint::{CallSignature, Fingerprint, FingerprintBuilder, SignatureField};
pub use guard::{BlockingCallGuard, CallGuard, GuardConfig, Outcome};
pub use logging::init_structured_logging;
pub use store::{KeyPattern, MemoryStore, RedisStore, SharedStore, StoreProvider};
