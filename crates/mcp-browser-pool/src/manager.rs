//! High-level browser context management on top of [`BrowserPool`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use mcp_browser_core::config::Config;
use mcp_browser_core::{BrowserError, ErrorKind, Result, RetryPolicy};

use crate::instance::{ContextData, ContextId, InstanceId};
use crate::lifecycle::InstanceLifecycle;
use crate::metrics;
use crate::pool::{BrowserPool, InstanceSnapshot};

/// Identifies a context handed out by [`BrowserManager::create_context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextHandle {
    pub instance_id: InstanceId,
    pub context_id: ContextId,
}

/// Creates, looks up, and closes browser contexts, retrying transient
/// failures and reporting terminal ones as `CONTEXT_CREATION_FAILED`.
pub struct BrowserManager {
    pool: BrowserPool,
    retry: RetryPolicy,
    initialized: Mutex<bool>,
}

impl BrowserManager {
    pub fn new(max_instances: usize, idle_timeout: Duration) -> Self {
        Self::with_pool(
            BrowserPool::new(max_instances, idle_timeout),
            RetryPolicy::default(),
        )
    }

    pub fn from_config(config: &Config) -> Self {
        Self::with_pool(
            BrowserPool::from_config(&config.pool_config()),
            RetryPolicy::from(&config.retry_config()),
        )
    }

    pub fn from_config_with_lifecycle(
        config: &Config,
        lifecycle: Arc<dyn InstanceLifecycle>,
    ) -> Self {
        Self::with_pool(
            BrowserPool::with_lifecycle(&config.pool_config(), lifecycle),
            RetryPolicy::from(&config.retry_config()),
        )
    }

    pub fn with_pool(pool: BrowserPool, retry: RetryPolicy) -> Self {
        info!("BrowserManager initialized");
        Self {
            pool,
            retry,
            initialized: Mutex::new(false),
        }
    }

    pub fn pool(&self) -> &BrowserPool {
        &self.pool
    }

    pub async fn is_initialized(&self) -> bool {
        *self.initialized.lock().await
    }

    /// Start the pool. Repeated calls are no-ops.
    pub async fn initialize(&self) {
        let mut initialized = self.initialized.lock().await;
        if !*initialized {
            self.pool.start().await;
            *initialized = true;
            info!("BrowserManager started");
        }
    }

    /// Stop the pool and destroy its instances. Repeated calls are no-ops.
    pub async fn shutdown(&self) {
        let mut initialized = self.initialized.lock().await;
        if *initialized {
            self.pool.stop().await;
            *initialized = false;
            info!("BrowserManager stopped");
        }
    }

    /// Allocate an instance and open a context on it for `owner_id`.
    ///
    /// Intermediate failures are retried according to their original kind;
    /// only the final failure is relabelled `CONTEXT_CREATION_FAILED`.
    pub async fn create_context(&self, owner_id: &str) -> Result<ContextHandle> {
        self.retry
            .execute(|| self.try_create_context(owner_id))
            .await
            .map_err(|err| {
                error!(
                    owner_id,
                    code = %err.kind(),
                    "Failed to create browser context: {}",
                    err.message()
                );
                metrics::record_context_failure(err.kind().name());
                let mut wrapped = BrowserError::new(
                    ErrorKind::ContextCreationFailed,
                    format!("Failed to create browser context: {}", err.message()),
                )
                .with_detail("cause_code", err.kind().name());
                if let Some(attempts) = err.details().and_then(|d| d.get("attempts")) {
                    wrapped = wrapped.with_detail("attempts", attempts.clone());
                }
                wrapped.with_cause(err)
            })
    }

    async fn try_create_context(&self, owner_id: &str) -> Result<ContextHandle> {
        let instance_id = self.pool.acquire().await?;
        let data = json!({
            "owner_id": owner_id,
            "created_at": chrono::Utc::now().to_rfc3339(),
        });

        match self.pool.create_context(instance_id, data).await {
            Ok(context_id) => {
                info!(%context_id, %instance_id, owner_id, "Created browser context");
                Ok(ContextHandle {
                    instance_id,
                    context_id,
                })
            }
            Err(err) => {
                self.pool.release(instance_id).await;
                Err(err)
            }
        }
    }

    /// Data stored for a context, or `None` if it no longer exists.
    pub async fn get_context(
        &self,
        instance_id: InstanceId,
        context_id: ContextId,
    ) -> Option<ContextData> {
        let data = self.pool.get_context_data(instance_id, context_id).await;
        if data.is_none() {
            warn!(%context_id, %instance_id, "Browser context not found");
        }
        data
    }

    /// Close a context and release its instance back to the pool.
    pub async fn close_context(&self, instance_id: InstanceId, context_id: ContextId) {
        self.pool.close_context(instance_id, context_id).await;
        self.pool.release(instance_id).await;
        info!(%context_id, %instance_id, "Closed browser context");
    }

    pub async fn list_instances(&self) -> Vec<InstanceSnapshot> {
        self.pool.list_instances().await
    }
}
