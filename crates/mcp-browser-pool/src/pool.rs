//! Browser pool: a bounded set of reusable browser instances.
//!
//! All pool state sits behind one async mutex. Every operation is a single
//! critical section, and lifecycle hooks run only after the lock is
//! released. A background task sweeps idle instances on a fixed interval
//! between [`BrowserPool::start`] and [`BrowserPool::stop`].

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mcp_browser_core::config::PoolConfig;
use mcp_browser_core::{BrowserError, ErrorKind, Result};

use crate::instance::{BrowserInstance, ContextData, ContextId, InstanceId};
use crate::lifecycle::{DestroyReason, InstanceLifecycle, NoopLifecycle};
use crate::metrics;

const MIN_RECLAIM_INTERVAL: Duration = Duration::from_millis(10);

/// A pool of browser instances, created on demand up to a fixed capacity.
pub struct BrowserPool {
    inner: Arc<PoolInner>,
    reaper: Mutex<Option<Reaper>>,
}

struct PoolInner {
    /// Insertion-ordered; `acquire` reuses the first free instance.
    instances: Mutex<IndexMap<InstanceId, BrowserInstance>>,
    max_instances: usize,
    idle_timeout: Duration,
    reclaim_interval: Duration,
    lifecycle: Arc<dyn InstanceLifecycle>,
    epoch: Instant,
}

struct Reaper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Point-in-time view of one instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceSnapshot {
    pub instance_id: InstanceId,
    pub in_use: bool,
    /// Seconds since the pool was created.
    pub last_used: f64,
    pub context_count: usize,
}

impl BrowserPool {
    /// Create a pool that sweeps every 60 seconds and has no lifecycle hooks.
    pub fn new(max_instances: usize, idle_timeout: Duration) -> Self {
        Self::build(
            max_instances,
            idle_timeout,
            Duration::from_secs(60),
            Arc::new(NoopLifecycle),
        )
    }

    /// Create a pool from config, with no lifecycle hooks.
    pub fn from_config(config: &PoolConfig) -> Self {
        Self::with_lifecycle(config, Arc::new(NoopLifecycle))
    }

    /// Create a pool from config that calls `lifecycle` as instances come and go.
    pub fn with_lifecycle(config: &PoolConfig, lifecycle: Arc<dyn InstanceLifecycle>) -> Self {
        Self::build(
            config.max_instances,
            config.idle_timeout(),
            config.reclaim_interval(),
            lifecycle,
        )
    }

    fn build(
        max_instances: usize,
        idle_timeout: Duration,
        reclaim_interval: Duration,
        lifecycle: Arc<dyn InstanceLifecycle>,
    ) -> Self {
        info!(
            max_instances,
            idle_timeout_secs = idle_timeout.as_secs_f64(),
            reclaim_interval_secs = reclaim_interval.as_secs_f64(),
            "Initialized BrowserPool"
        );
        Self {
            inner: Arc::new(PoolInner {
                instances: Mutex::new(IndexMap::new()),
                max_instances,
                idle_timeout,
                reclaim_interval: reclaim_interval.max(MIN_RECLAIM_INTERVAL),
                lifecycle,
                epoch: Instant::now(),
            }),
            reaper: Mutex::new(None),
        }
    }

    /// Capacity: the most instances that may exist at once.
    pub fn max_instances(&self) -> usize {
        self.inner.max_instances
    }

    /// How long a free, context-free instance survives before reclamation.
    pub fn idle_timeout(&self) -> Duration {
        self.inner.idle_timeout
    }

    /// Whether the background sweep is running.
    pub async fn is_running(&self) -> bool {
        self.reaper.lock().await.is_some()
    }

    /// Start the idle-reclamation task. No-op if already running.
    pub async fn start(&self) {
        let mut reaper = self.reaper.lock().await;
        if reaper.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let inner = self.inner.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { inner.run_reclaimer(token).await });

        *reaper = Some(Reaper { cancel, handle });
        info!("Started BrowserPool cleanup task");
    }

    /// Stop the reclamation task, wait for it to finish, then destroy every
    /// remaining instance whether or not it is in use.
    ///
    /// Instances still launching are only removed; the `acquire` that is
    /// launching them tears them down once the launch hook returns.
    pub async fn stop(&self) {
        let reaper = self.reaper.lock().await.take();
        if let Some(Reaper { cancel, handle }) = reaper {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(%e, "BrowserPool cleanup task ended abnormally");
            }
        }

        let remaining: Vec<BrowserInstance> = {
            let mut instances = self.inner.instances.lock().await;
            let drained: Vec<_> = instances.drain(..).map(|(_, instance)| instance).collect();
            report_size(&instances);
            drained
        };
        let (launching, remaining): (Vec<_>, Vec<_>) =
            remaining.into_iter().partition(BrowserInstance::is_launching);
        for instance in &launching {
            debug!(instance_id = %instance.id(), "Removed browser instance that is still launching");
        }
        metrics::record_instances_destroyed(DestroyReason::Shutdown.as_str(), remaining.len());
        for instance in remaining {
            self.inner.destroy(instance, DestroyReason::Shutdown).await;
        }

        info!("BrowserPool stopped and all instances cleaned up");
    }

    /// Hand out a free instance, creating one if under capacity.
    ///
    /// Fails immediately with `RESOURCE_EXHAUSTED` when every instance is
    /// busy and the pool is full.
    pub async fn acquire(&self) -> Result<InstanceId> {
        let instance_id = {
            let mut instances = self.inner.instances.lock().await;

            if let Some(instance) = instances.values_mut().find(|i| !i.in_use()) {
                instance.mark_used();
                let instance_id = instance.id();
                info!(%instance_id, "Reusing existing browser instance");
                report_size(&instances);
                return Ok(instance_id);
            }

            if instances.len() >= self.inner.max_instances {
                warn!(
                    max_instances = self.inner.max_instances,
                    "No available browser instances and at capacity"
                );
                metrics::record_exhausted();
                return Err(BrowserError::new(
                    ErrorKind::ResourceExhausted,
                    "No available browser instances and at capacity",
                )
                .with_detail("max_instances", self.inner.max_instances));
            }

            let instance_id = InstanceId::new();
            instances.insert(instance_id, BrowserInstance::launching(instance_id));
            info!(%instance_id, "Created new browser instance");
            report_size(&instances);
            instance_id
        };

        if let Err(err) = self.inner.lifecycle.on_created(instance_id).await {
            {
                let mut instances = self.inner.instances.lock().await;
                instances.shift_remove(&instance_id);
                report_size(&instances);
            }
            warn!(%instance_id, code = %err.kind(), "Browser instance failed to start: {}", err.message());
            return Err(err);
        }

        let still_pooled = match self.inner.instances.lock().await.get_mut(&instance_id) {
            Some(instance) => {
                instance.mark_launched();
                true
            }
            None => false,
        };
        if !still_pooled {
            warn!(%instance_id, "Browser pool stopped while instance was launching");
            self.inner
                .destroy(BrowserInstance::new(instance_id), DestroyReason::Shutdown)
                .await;
            metrics::record_instances_destroyed(DestroyReason::Shutdown.as_str(), 1);
            return Err(BrowserError::new(
                ErrorKind::ResourceNotFound,
                format!("Browser instance {instance_id} was removed while launching"),
            )
            .with_detail("instance_id", instance_id.to_string()));
        }

        metrics::record_instance_created();
        Ok(instance_id)
    }

    /// Return an instance to the pool. Unknown ids are ignored.
    pub async fn release(&self, instance_id: InstanceId) {
        let mut instances = self.inner.instances.lock().await;
        match instances.get_mut(&instance_id) {
            Some(instance) => {
                instance.mark_free();
                info!(%instance_id, "Released browser instance back to pool");
                report_size(&instances);
            }
            None => warn!(%instance_id, "Attempted to release non-existent browser instance"),
        }
    }

    /// Create a context on an instance.
    pub async fn create_context(
        &self,
        instance_id: InstanceId,
        data: ContextData,
    ) -> Result<ContextId> {
        let mut instances = self.inner.instances.lock().await;
        let Some(instance) = instances.get_mut(&instance_id) else {
            warn!(%instance_id, "Attempted to create context in non-existent browser instance");
            return Err(BrowserError::new(
                ErrorKind::ResourceNotFound,
                format!("Browser instance {instance_id} does not exist"),
            )
            .with_detail("instance_id", instance_id.to_string()));
        };

        let context_id = ContextId::new();
        instance.add_context(context_id, data);
        Ok(context_id)
    }

    /// Close a context. Unknown instance or context ids are ignored.
    pub async fn close_context(&self, instance_id: InstanceId, context_id: ContextId) {
        let mut instances = self.inner.instances.lock().await;
        match instances.get_mut(&instance_id) {
            Some(instance) => {
                instance.remove_context(&context_id);
            }
            None => warn!(
                %instance_id,
                %context_id,
                "Attempted to close context in non-existent browser instance"
            ),
        }
    }

    /// Data stored for a context, or `None` if either id is unknown.
    pub async fn get_context_data(
        &self,
        instance_id: InstanceId,
        context_id: ContextId,
    ) -> Option<ContextData> {
        let instances = self.inner.instances.lock().await;
        instances
            .get(&instance_id)
            .and_then(|instance| instance.context(&context_id))
            .cloned()
    }

    /// Snapshot of every instance, in creation order.
    pub async fn list_instances(&self) -> Vec<InstanceSnapshot> {
        let instances = self.inner.instances.lock().await;
        instances
            .values()
            .map(|instance| InstanceSnapshot {
                instance_id: instance.id(),
                in_use: instance.in_use(),
                last_used: instance
                    .last_used()
                    .saturating_duration_since(self.inner.epoch)
                    .as_secs_f64(),
                context_count: instance.context_count(),
            })
            .collect()
    }

    /// Number of instances currently in the pool, busy or free.
    pub async fn instance_count(&self) -> usize {
        self.inner.instances.lock().await.len()
    }

    /// Run one reclamation sweep now. Returns how many instances were destroyed.
    pub async fn reclaim_idle(&self) -> usize {
        self.inner.reclaim_idle().await
    }
}

impl PoolInner {
    async fn run_reclaimer(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.reclaim_interval,
            self.reclaim_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Browser pool cleanup task cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    self.reclaim_idle().await;
                }
            }
        }
    }

    async fn reclaim_idle(&self) -> usize {
        let reclaimed: Vec<BrowserInstance> = {
            let mut instances = self.instances.lock().await;
            let now = Instant::now();
            let expired: Vec<InstanceId> = instances
                .values()
                .filter(|instance| instance.is_reclaimable(now, self.idle_timeout))
                .map(BrowserInstance::id)
                .collect();
            let removed: Vec<_> = expired
                .iter()
                .filter_map(|id| instances.shift_remove(id))
                .collect();
            report_size(&instances);
            removed
        };

        let count = reclaimed.len();
        metrics::record_instances_destroyed(DestroyReason::Idle.as_str(), count);
        for instance in reclaimed {
            info!(instance_id = %instance.id(), "Cleaning up idle browser instance");
            self.destroy(instance, DestroyReason::Idle).await;
        }
        debug!(reclaimed = count, "Browser pool sweep finished");
        count
    }

    async fn destroy(&self, instance: BrowserInstance, reason: DestroyReason) {
        let instance_id = instance.id();
        let contexts = instance.into_contexts();
        info!(%instance_id, ?reason, open_contexts = contexts.len(), "Closing browser instance");
        self.lifecycle
            .on_destroyed(instance_id, contexts, reason)
            .await;
    }
}

fn report_size(instances: &IndexMap<InstanceId, BrowserInstance>) {
    let in_use = instances.values().filter(|i| i.in_use()).count();
    metrics::record_pool_size(instances.len(), in_use);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    fn pool(max_instances: usize) -> BrowserPool {
        BrowserPool::new(max_instances, Duration::from_secs(300))
    }

    #[derive(Default)]
    struct Recorder {
        destroyed: std::sync::Mutex<Vec<(InstanceId, usize, DestroyReason)>>,
        failures_left: AtomicU32,
        launch_delay: Duration,
    }

    #[async_trait]
    impl InstanceLifecycle for Recorder {
        async fn on_created(&self, _instance_id: InstanceId) -> Result<()> {
            if !self.launch_delay.is_zero() {
                tokio::time::sleep(self.launch_delay).await;
            }
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(BrowserError::new(
                    ErrorKind::BrowserLaunchFailed,
                    "chrome exited with status 1",
                ));
            }
            Ok(())
        }

        async fn on_destroyed(
            &self,
            instance_id: InstanceId,
            contexts: HashMap<ContextId, ContextData>,
            reason: DestroyReason,
        ) {
            self.destroyed
                .lock()
                .unwrap()
                .push((instance_id, contexts.len(), reason));
        }
    }

    fn recorded_pool(config: PoolConfig) -> (BrowserPool, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let pool = BrowserPool::with_lifecycle(&config, recorder.clone());
        (pool, recorder)
    }

    #[tokio::test]
    async fn test_acquire_exhausts_at_capacity() {
        for n in 1..=4 {
            let pool = pool(n);
            let acquired =
                futures::future::join_all((0..n).map(|_| pool.acquire())).await;
            let ids: std::collections::HashSet<_> =
                acquired.into_iter().map(|r| r.unwrap()).collect();
            assert_eq!(ids.len(), n, "every acquirer gets its own instance");

            let err = pool.acquire().await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
            assert_eq!(err.http_status(), 429);
            assert_eq!(pool.instance_count().await, n);
        }
    }

    #[tokio::test]
    async fn test_release_then_acquire_reuses() {
        let pool = pool(3);
        let id = pool.acquire().await.unwrap();
        pool.release(id).await;
        assert_eq!(pool.acquire().await.unwrap(), id);
        assert_eq!(pool.instance_count().await, 1);
    }

    #[tokio::test]
    async fn test_reuse_takes_first_free_in_creation_order() {
        let pool = pool(3);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        pool.release(c).await;
        pool.release(a).await;
        assert_eq!(pool.acquire().await.unwrap(), a);
        assert_eq!(pool.acquire().await.unwrap(), c);
        assert!(pool.acquire().await.is_err());

        let order: Vec<_> = pool
            .list_instances()
            .await
            .into_iter()
            .map(|s| s.instance_id)
            .collect();
        assert_eq!(order, vec![a, b, c]);
    }

    #[tokio::test]
    async fn test_release_unknown_is_noop() {
        let pool = pool(1);
        pool.release(InstanceId::new()).await;
        assert_eq!(pool.instance_count().await, 0);
    }

    #[tokio::test]
    async fn test_context_lifecycle() {
        let pool = pool(3);
        let instance_id = pool.acquire().await.unwrap();
        let context_id = pool
            .create_context(instance_id, json!({"test": "data"}))
            .await
            .unwrap();

        assert_eq!(
            pool.get_context_data(instance_id, context_id).await,
            Some(json!({"test": "data"}))
        );
        let snapshot = pool.list_instances().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].context_count, 1);
        assert!(snapshot[0].in_use);

        pool.close_context(instance_id, context_id).await;
        assert_eq!(pool.get_context_data(instance_id, context_id).await, None);
        assert_eq!(pool.list_instances().await[0].context_count, 0);
    }

    #[tokio::test]
    async fn test_create_context_unknown_instance() {
        let pool = pool(2);
        let known = pool.acquire().await.unwrap();
        let before = pool.list_instances().await;

        let missing = InstanceId::new();
        let err = pool.create_context(missing, json!({})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceNotFound);
        assert_eq!(err.http_status(), 404);
        assert!(err.message().contains(&missing.to_string()));

        assert_eq!(pool.list_instances().await, before);
        assert_eq!(before[0].instance_id, known);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_soft() {
        let pool = pool(1);
        let instance_id = pool.acquire().await.unwrap();
        pool.close_context(InstanceId::new(), ContextId::new()).await;
        pool.close_context(instance_id, ContextId::new()).await;
        assert_eq!(pool.get_context_data(InstanceId::new(), ContextId::new()).await, None);
        assert_eq!(pool.get_context_data(instance_id, ContextId::new()).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reclaim_idle_threshold() {
        let pool = pool(3);
        let stale = pool.acquire().await.unwrap();
        let fresh = pool.acquire().await.unwrap();
        pool.release(stale).await;

        tokio::time::advance(Duration::from_secs(200)).await;
        pool.release(fresh).await;
        tokio::time::advance(Duration::from_secs(101)).await;

        // stale: free for 301s, fresh: free for 101s
        assert_eq!(pool.reclaim_idle().await, 1);
        let remaining: Vec<_> = pool
            .list_instances()
            .await
            .into_iter()
            .map(|s| s.instance_id)
            .collect();
        assert_eq!(remaining, vec![fresh]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_use_never_reclaimed() {
        let pool = pool(1);
        let id = pool.acquire().await.unwrap();
        tokio::time::advance(Duration::from_secs(10 * 24 * 3600)).await;
        assert_eq!(pool.reclaim_idle().await, 0);
        assert_eq!(pool.list_instances().await[0].instance_id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_instance_with_contexts_not_reclaimed() {
        let pool = pool(1);
        let id = pool.acquire().await.unwrap();
        let ctx = pool.create_context(id, json!({})).await.unwrap();
        pool.release(id).await;
        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(pool.reclaim_idle().await, 0);

        pool.close_context(id, ctx).await;
        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(pool.reclaim_idle().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_reclaims() {
        let (pool, recorder) = recorded_pool(PoolConfig {
            max_instances: 2,
            idle_timeout_secs: 30.0,
            reclaim_interval_secs: 60.0,
        });
        pool.start().await;
        let busy = pool.acquire().await.unwrap();
        let idle = pool.acquire().await.unwrap();
        pool.release(idle).await;

        tokio::time::sleep(Duration::from_secs(61)).await;

        let snapshot = pool.list_instances().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].instance_id, busy);
        assert_eq!(
            recorder.destroyed.lock().unwrap().as_slice(),
            &[(idle, 0, DestroyReason::Idle)]
        );

        pool.stop().await;
    }

    #[tokio::test]
    async fn test_stop_destroys_everything() {
        let (pool, recorder) = recorded_pool(PoolConfig::default());
        pool.start().await;
        let busy = pool.acquire().await.unwrap();
        pool.create_context(busy, json!({"a": 1})).await.unwrap();

        pool.stop().await;
        assert!(!pool.is_running().await);
        assert_eq!(pool.instance_count().await, 0);
        assert_eq!(
            recorder.destroyed.lock().unwrap().as_slice(),
            &[(busy, 1, DestroyReason::Shutdown)]
        );
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_without_start() {
        let pool = pool(1);
        pool.stop().await;

        pool.start().await;
        pool.start().await;
        assert!(pool.is_running().await);
        pool.stop().await;
        assert!(!pool.is_running().await);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_launch_failure_frees_slot() {
        let (pool, recorder) = recorded_pool(PoolConfig {
            max_instances: 1,
            ..Default::default()
        });
        recorder.failures_left.store(1, Ordering::SeqCst);

        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BrowserLaunchFailed);
        assert_eq!(pool.instance_count().await, 0);

        assert!(pool.acquire().await.is_ok());
        assert_eq!(pool.instance_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_launch_tears_down_once() {
        let recorder = Arc::new(Recorder {
            launch_delay: Duration::from_millis(100),
            ..Default::default()
        });
        let pool = Arc::new(BrowserPool::with_lifecycle(
            &PoolConfig::default(),
            recorder.clone(),
        ));
        pool.start().await;

        let pending = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await }
        });
        while pool.instance_count().await == 0 {
            tokio::task::yield_now().await;
        }

        pool.stop().await;
        assert!(recorder.destroyed.lock().unwrap().is_empty(), "launch still in flight");

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceNotFound);
        assert_eq!(pool.instance_count().await, 0);

        let destroyed = recorder.destroyed.lock().unwrap();
        assert_eq!(destroyed.len(), 1);
        assert_eq!(destroyed[0].1, 0);
        assert_eq!(destroyed[0].2, DestroyReason::Shutdown);
        assert!(err.message().contains(&destroyed[0].0.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_launched_instance_survives_slow_hook() {
        let recorder = Arc::new(Recorder {
            launch_delay: Duration::from_millis(100),
            ..Default::default()
        });
        let pool = BrowserPool::with_lifecycle(&PoolConfig::default(), recorder.clone());

        let id = pool.acquire().await.unwrap();
        pool.create_context(id, json!({})).await.unwrap();
        assert!(recorder.destroyed.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_serializes() {
        let pool = pool(1);
        tokio::time::advance(Duration::from_secs(2)).await;
        let id = pool.acquire().await.unwrap();

        let json = serde_json::to_value(pool.list_instances().await).unwrap();
        assert_eq!(json[0]["instance_id"], id.to_string());
        assert_eq!(json[0]["in_use"], true);
        assert_eq!(json[0]["last_used"], 2.0);
        assert_eq!(json[0]["context_count"], 0);
    }
}
