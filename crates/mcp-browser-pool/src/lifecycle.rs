//! Hooks for the side effects of creating and destroying instances.
//!
//! The pool itself only does bookkeeping. Launching or killing an actual
//! browser process happens in an [`InstanceLifecycle`] implementation, which
//! the pool always calls with its lock released.

use std::collections::HashMap;

use async_trait::async_trait;

use mcp_browser_core::Result;

use crate::instance::{ContextData, ContextId, InstanceId};

/// Why an instance was destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    /// Free and context-free for longer than the idle timeout.
    Idle,
    /// Swept by [`BrowserPool::stop`](crate::BrowserPool::stop).
    Shutdown,
}

impl DestroyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Shutdown => "shutdown",
        }
    }
}

#[async_trait]
pub trait InstanceLifecycle: Send + Sync {
    /// Bring up the resource behind a newly registered instance.
    ///
    /// On error the instance is dropped from the pool and the error is
    /// returned from `acquire`; implementations should report launch
    /// problems as `BROWSER_LAUNCH_FAILED` or a retryable kind.
    async fn on_created(&self, _instance_id: InstanceId) -> Result<()> {
        Ok(())
    }

    /// Tear down an instance that has already left the pool. `contexts`
    /// holds any contexts it still owned; they were not closed first.
    async fn on_destroyed(
        &self,
        _instance_id: InstanceId,
        _contexts: HashMap<ContextId, ContextData>,
        _reason: DestroyReason,
    ) {
    }
}

/// Bookkeeping only; no external resources.
pub struct NoopLifecycle;

impl InstanceLifecycle for NoopLifecycle {}
