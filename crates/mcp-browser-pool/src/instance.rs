//! Pooled browser instances and the contexts they host.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{info, warn};

/// Data stored alongside a browser context.
pub type ContextData = Value;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(uuid::Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Display::fmt(&self.0, f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                uuid::Uuid::parse_str(s).map(Self)
            }
        }
    };
}

opaque_id!(
    /// Handle to a pooled browser instance.
    InstanceId
);

opaque_id!(
    /// Handle to a browser context within an instance.
    ContextId
);

/// One pooled browser instance with its contexts.
#[derive(Debug)]
pub struct BrowserInstance {
    id: InstanceId,
    contexts: HashMap<ContextId, ContextData>,
    in_use: bool,
    launching: bool,
    last_used: Instant,
}

impl BrowserInstance {
    /// A freshly created instance starts out allocated.
    pub fn new(id: InstanceId) -> Self {
        Self {
            id,
            contexts: HashMap::new(),
            in_use: true,
            launching: false,
            last_used: Instant::now(),
        }
    }

    /// An allocated instance whose launch hook has not finished yet.
    pub fn launching(id: InstanceId) -> Self {
        Self {
            launching: true,
            ..Self::new(id)
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn in_use(&self) -> bool {
        self.in_use
    }

    pub fn is_launching(&self) -> bool {
        self.launching
    }

    pub fn mark_launched(&mut self) {
        self.launching = false;
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn context(&self, context_id: &ContextId) -> Option<&ContextData> {
        self.contexts.get(context_id)
    }

    pub fn add_context(&mut self, context_id: ContextId, data: ContextData) {
        self.contexts.insert(context_id, data);
        self.touch();
        info!(
            instance_id = %self.id,
            context_id = %context_id,
            "Added context to browser instance"
        );
    }

    pub fn remove_context(&mut self, context_id: &ContextId) -> Option<ContextData> {
        let removed = self.contexts.remove(context_id);
        if removed.is_some() {
            self.touch();
            info!(
                instance_id = %self.id,
                context_id = %context_id,
                "Removed context from browser instance"
            );
        } else {
            warn!(
                instance_id = %self.id,
                context_id = %context_id,
                "Attempted to remove non-existent context"
            );
        }
        removed
    }

    pub fn mark_used(&mut self) {
        self.in_use = true;
        self.touch();
    }

    pub fn mark_free(&mut self) {
        self.in_use = false;
        self.touch();
    }

    /// Free, context-free, and idle for longer than `idle_timeout` as of `now`.
    pub fn is_reclaimable(&self, now: Instant, idle_timeout: Duration) -> bool {
        !self.in_use
            && self.contexts.is_empty()
            && now.saturating_duration_since(self.last_used) > idle_timeout
    }

    /// Consume the instance, handing back whatever contexts it still held.
    pub fn into_contexts(self) -> HashMap<ContextId, ContextData> {
        self.contexts
    }

    fn touch(&mut self) {
        let now = Instant::now();
        if now > self.last_used {
            self.last_used = now;
        }
    }
}
