//! Blocking entry point
//!
//! Runs the same guard logic for synchronous callers by driving it on a runtime owned by
//! the adapter. One adapter can be shared by any number of threads; each `call` blocks
//! only its own thread, whether it is waiting for admission, a retry delay or the call.
//!
//! `call` must not be used from inside an async context; use [`CallGuard::call`] there.

use super::{CallGuard, GuardConfig, Outcome};
use crate::classifier::HasStatus;
use crate::config::ToolkitConfig;
use crate::error::{CallError, ToolkitError, ToolkitResult};
use crate::fingerprint::{CallSignature, SignatureField};
use crate::store::{RedisStore, StoreProvider};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};
use tracing::info;

/// Synchronous counterpart of [`CallGuard`]
#[derive(Debug)]
pub struct BlockingCallGuard {
    runtime: Runtime,
    guard: CallGuard,
}

impl BlockingCallGuard {
    /// Connect to the configured store on the adapter's own runtime and bind `config`
    ///
    /// A Redis connection belongs to the runtime it was opened on, so the store is created
    /// here rather than passed in.
    pub fn connect(config: GuardConfig, toolkit: &ToolkitConfig) -> ToolkitResult<Self> {
        let runtime = build_runtime()?;
        let store = runtime.block_on(StoreProvider::from_config(&toolkit.store))?;
        let guard = CallGuard::with_settings(
            config,
            Arc::new(store),
            &toolkit.admission,
            &toolkit.cache,
        )?;
        Ok(Self::assemble(runtime, guard))
    }

    /// Open a store on a client the caller already configured (TLS, sentinel routing and
    /// the like) and bind `config`
    ///
    /// Connection timeout and retry settings still come from `toolkit.store.redis`.
    pub fn with_redis_client(
        config: GuardConfig,
        client: redis::Client,
        toolkit: &ToolkitConfig,
    ) -> ToolkitResult<Self> {
        let runtime = build_runtime()?;
        let store = runtime.block_on(RedisStore::from_client(client, &toolkit.store.redis))?;
        let guard = CallGuard::with_settings(
            config,
            Arc::new(StoreProvider::from(store)),
            &toolkit.admission,
            &toolkit.cache,
        )?;
        Ok(Self::assemble(runtime, guard))
    }

    /// Connect and bind the site `name` of a loaded configuration
    pub fn for_site(name: &str, toolkit: &ToolkitConfig) -> ToolkitResult<Self> {
        let runtime = build_runtime()?;
        let store = runtime.block_on(StoreProvider::from_config(&toolkit.store))?;
        let guard = CallGuard::for_site(name, toolkit, Arc::new(store))?;
        Ok(Self::assemble(runtime, guard))
    }

    /// Wrap an existing guard
    ///
    /// Suited to in-memory stores; a Redis store must outlive the runtime it was opened on.
    pub fn from_guard(guard: CallGuard) -> ToolkitResult<Self> {
        Ok(Self::assemble(build_runtime()?, guard))
    }

    fn assemble(runtime: Runtime, guard: CallGuard) -> Self {
        info!(namespace = %guard.config().namespace(), "Blocking call guard ready");
        Self { runtime, guard }
    }

    pub fn guard(&self) -> &CallGuard {
        &self.guard
    }

    /// Run `call` under the guard, blocking the current thread
    pub fn call<T, E, F>(
        &self,
        signature: &CallSignature,
        mut call: F,
    ) -> Result<Outcome<T, E>, CallError<T, E>>
    where
        T: HasStatus + Serialize + DeserializeOwned,
        E: 'static,
        F: FnMut() -> Result<T, E>,
    {
        self.runtime
            .block_on(self.guard.call(signature, || std::future::ready(call())))
    }

    pub fn invalidate(&self, signature: &CallSignature) -> ToolkitResult<u64> {
        self.runtime.block_on(self.guard.invalidate(signature))
    }

    pub fn invalidate_matching(
        &self,
        sample: &CallSignature,
        fields: &[SignatureField],
    ) -> ToolkitResult<u64> {
        self.runtime
            .block_on(self.guard.invalidate_matching(sample, fields))
    }

    pub fn clear_prefix(&self) -> ToolkitResult<u64> {
        self.runtime.block_on(self.guard.clear_prefix())
    }
}

fn build_runtime() -> ToolkitResult<Runtime> {
    Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("api-toolkit-blocking")
        .enable_all()
        .build()
        .map_err(|e| ToolkitError::Runtime(format!("Failed to build runtime: {}", e)))
}
