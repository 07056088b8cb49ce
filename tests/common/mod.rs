//! Shared helpers for integration tests

#![allow(dead_code)]

use api_toolkit::{ApiResponse, ManualClock, StoreProvider};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// A fixed point in time at the start of a minute, so 60s windows line up with it
pub const T0_MS: u64 = 1_700_000_040_000;

pub type Response = ApiResponse<String>;

/// In-memory store on a manual clock starting at [`T0_MS`]
pub fn manual_store() -> (Arc<StoreProvider>, ManualClock) {
    let clock = ManualClock::new(T0_MS);
    let store = StoreProvider::memory_with_clock(Arc::new(clock.clone()));
    (Arc::new(store), clock)
}

/// Counts invocations of a fake endpoint
#[derive(Debug, Default)]
pub struct FakeEndpoint {
    calls: AtomicU32,
}

impl FakeEndpoint {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn respond(&self, status: u16) -> Result<Response, String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ApiResponse::new(status, format!("response {n}")))
    }

    pub fn fail(&self, message: &str) -> Result<Response, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(message.to_string())
    }
}

pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
