//! Browser instance pool and context management.
//!
//! [`BrowserPool`] keeps a bounded set of browser instances and reclaims idle
//! ones in the background; [`BrowserManager`] layers retries and error
//! classification on top for callers that just want a context.

pub mod instance;
pub mod lifecycle;
pub mod manager;
pub mod metrics;
pub mod pool;

pub use instance::{ContextData, ContextId, InstanceId};
pub use lifecycle::{DestroyReason, InstanceLifecycle, NoopLifecycle};
pub use manager::{BrowserManager, ContextHandle};
pub use pool::{BrowserPool, InstanceSnapshot};
