//! Agent pool: construct once, check out, return, evict when idle.
//!
//! Live instances per type (idle + checked out + under construction) never
//! exceed `max_agents_per_type`. The pool never waits on behalf of a caller:
//! when a type is exhausted `get_agent` fails with `PoolError::Exhausted` and
//! the caller decides whether to wait on `released()`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agents::{Agent, AgentFactory};
use crate::config::PoolConfig;
use crate::error::PoolError;

/// Checkout token for a pooled agent. Give it back with
/// [`AgentPool::return_agent`]; it cannot be cloned, so it cannot be
/// returned twice.
pub struct AgentHandle {
    id: Uuid,
    agent_type: String,
    agent: Arc<dyn Agent>,
}

impl AgentHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    pub fn agent(&self) -> &Arc<dyn Agent> {
        &self.agent
    }
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("id", &self.id)
            .field("agent_type", &self.agent_type)
            .finish()
    }
}

struct PoolEntry {
    id: Uuid,
    agent: Arc<dyn Agent>,
    last_used_at: Instant,
}

#[derive(Default)]
struct TypePool {
    idle: VecDeque<PoolEntry>,
    in_use: HashMap<Uuid, PoolEntry>,
    constructing: usize,
}

impl TypePool {
    fn live(&self) -> usize {
        self.idle.len() + self.in_use.len() + self.constructing
    }
}

#[derive(Default)]
struct PoolState {
    types: HashMap<String, TypePool>,
    shut_down: bool,
    requests_served: u64,
    cold_starts: u64,
    total_init_time: Duration,
}

/// Per-type instance counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TypeStats {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
}

/// Pool instrumentation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub total_agents: usize,
    pub active_agents: usize,
    pub idle_agents: usize,
    pub requests_served: u64,
    /// Running average over cold constructions.
    pub avg_init_time: Duration,
    pub agents_by_type: HashMap<String, TypeStats>,
}

/// Pool of reusable agent instances keyed by agent type.
pub struct AgentPool {
    config: PoolConfig,
    factories: RwLock<HashMap<String, Arc<dyn AgentFactory>>>,
    state: Mutex<PoolState>,
    released: Notify,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

/// Reserved construction slot; gives the slot back if construction is
/// abandoned before `complete`.
struct ConstructionSlot<'a> {
    pool: &'a AgentPool,
    agent_type: String,
    armed: bool,
}

impl ConstructionSlot<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ConstructionSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.pool.lock_state();
            if let Some(tp) = state.types.get_mut(&self.agent_type) {
                tp.constructing = tp.constructing.saturating_sub(1);
            }
            drop(state);
            self.pool.released.notify_waiters();
        }
    }
}

impl AgentPool {
    /// Empty pool. Register factories before checking agents out.
    pub fn new(config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            factories: RwLock::new(HashMap::new()),
            state: Mutex::new(PoolState::default()),
            released: Notify::new(),
            health_task: Mutex::new(None),
        })
    }

    /// Limits and timings this pool was built with.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    // Pool bookkeeping never panics while holding the lock, so a poisoned
    // lock still holds consistent state.
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register (or replace) the factory for an agent type.
    pub fn register_factory(&self, agent_type: impl Into<String>, factory: Arc<dyn AgentFactory>) {
        let agent_type = agent_type.into();
        self.factories
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(agent_type.clone(), factory);
        debug!(agent_type = %agent_type, "Registered agent factory");
    }

    /// True if a factory exists for `agent_type`.
    pub fn is_registered(&self, agent_type: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(agent_type)
    }

    /// Registered agent types, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    fn factory(&self, agent_type: &str) -> Result<Arc<dyn AgentFactory>, PoolError> {
        self.factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent_type)
            .cloned()
            .ok_or_else(|| PoolError::TypeNotRegistered {
                agent_type: agent_type.to_string(),
            })
    }

    /// Notified whenever an instance or construction slot frees up.
    pub fn released(&self) -> &Notify {
        &self.released
    }

    /// True once `shutdown` has run.
    pub fn is_shut_down(&self) -> bool {
        self.lock_state().shut_down
    }

    /// Check out an agent of `agent_type`, reusing an idle instance when
    /// possible and constructing one when under the per-type limit.
    pub async fn get_agent(&self, agent_type: &str) -> Result<AgentHandle, PoolError> {
        let factory = self.factory(agent_type)?;

        {
            let mut state = self.lock_state();
            if state.shut_down {
                return Err(PoolError::ShutDown);
            }

            let max = self.config.max_agents_per_type;
            let tp = state.types.entry(agent_type.to_string()).or_default();

            // Most recently used first, so older instances age out.
            if let Some(mut entry) = tp.idle.pop_back() {
                let handle = AgentHandle {
                    id: entry.id,
                    agent_type: agent_type.to_string(),
                    agent: Arc::clone(&entry.agent),
                };
                entry.last_used_at = Instant::now();
                tp.in_use.insert(entry.id, entry);
                state.requests_served += 1;
                debug!(agent_type, agent_id = %handle.id, "Reused pooled agent");
                return Ok(handle);
            }

            if tp.live() >= max {
                return Err(PoolError::Exhausted {
                    agent_type: agent_type.to_string(),
                    max,
                });
            }
            tp.constructing += 1;
        }

        let mut slot = ConstructionSlot {
            pool: self,
            agent_type: agent_type.to_string(),
            armed: true,
        };
        let started = Instant::now();
        let agent = self.construct(agent_type, factory.as_ref()).await?;
        let init_time = started.elapsed();

        let id = Uuid::new_v4();
        let shut_down = {
            let mut state = self.lock_state();
            slot.disarm();
            let shut_down = state.shut_down;
            let tp = state.types.entry(agent_type.to_string()).or_default();
            tp.constructing = tp.constructing.saturating_sub(1);

            if !shut_down {
                tp.in_use.insert(
                    id,
                    PoolEntry {
                        id,
                        agent: Arc::clone(&agent),
                        last_used_at: Instant::now(),
                    },
                );
                state.requests_served += 1;
                state.cold_starts += 1;
                state.total_init_time += init_time;
            }
            shut_down
        };

        if shut_down {
            agent.shutdown().await;
            return Err(PoolError::ShutDown);
        }

        info!(
            agent_type,
            agent_id = %id,
            init_ms = init_time.as_millis() as u64,
            "Constructed new agent"
        );

        Ok(AgentHandle {
            id,
            agent_type: agent_type.to_string(),
            agent,
        })
    }

    async fn construct(
        &self,
        agent_type: &str,
        factory: &dyn AgentFactory,
    ) -> Result<Arc<dyn Agent>, PoolError> {
        let agent = factory
            .create()
            .await
            .map_err(|e| PoolError::InitFailed {
                agent_type: agent_type.to_string(),
                reason: e.to_string(),
            })?;
        agent
            .initialize()
            .await
            .map_err(|e| PoolError::InitFailed {
                agent_type: agent_type.to_string(),
                reason: e.to_string(),
            })?;
        Ok(agent)
    }

    /// Give a checked-out agent back to the pool.
    pub async fn return_agent(&self, handle: AgentHandle) {
        let mut orphan = false;
        {
            let mut state = self.lock_state();
            let shut_down = state.shut_down;
            match state.types.get_mut(&handle.agent_type) {
                Some(tp) => match tp.in_use.remove(&handle.id) {
                    Some(mut entry) if !shut_down => {
                        entry.last_used_at = Instant::now();
                        tp.idle.push_back(entry);
                    }
                    Some(_) => orphan = true,
                    None => {
                        warn!(
                            agent_type = %handle.agent_type,
                            agent_id = %handle.id,
                            "Returned agent is not checked out"
                        );
                    }
                },
                None => orphan = true,
            }
        }

        if orphan {
            handle.agent.shutdown().await;
        }
        debug!(agent_type = %handle.agent_type, agent_id = %handle.id, "Agent returned");
        self.released.notify_waiters();
    }

    /// Destroy a checked-out agent instead of returning it (its state can't
    /// be trusted) and free its slot.
    pub async fn discard_agent(&self, handle: AgentHandle) {
        {
            let mut state = self.lock_state();
            if let Some(tp) = state.types.get_mut(&handle.agent_type) {
                tp.in_use.remove(&handle.id);
            }
        }
        warn!(agent_type = %handle.agent_type, agent_id = %handle.id, "Discarding agent");
        handle.agent.shutdown().await;
        self.released.notify_waiters();
    }

    /// Construct up to `count` idle instances of `agent_type`, capped by the
    /// per-type limit. Returns how many were built.
    pub async fn pre_warm(&self, agent_type: &str, count: usize) -> Result<usize, PoolError> {
        let factory = self.factory(agent_type)?;

        let reserved = {
            let mut state = self.lock_state();
            if state.shut_down {
                return Err(PoolError::ShutDown);
            }
            let max = self.config.max_agents_per_type;
            let tp = state.types.entry(agent_type.to_string()).or_default();
            let reserved = count.min(max.saturating_sub(tp.live()));
            tp.constructing += reserved;
            reserved
        };
        if reserved == 0 {
            return Ok(0);
        }

        let builds = (0..reserved).map(|_| {
            let factory = Arc::clone(&factory);
            async move {
                let started = Instant::now();
                let result = self.construct(agent_type, factory.as_ref()).await;
                (result, started.elapsed())
            }
        });
        let results = join_all(builds).await;

        let mut built = 0;
        let mut late = Vec::new();
        let mut first_error = None;
        {
            let mut state = self.lock_state();
            let shut_down = state.shut_down;
            for (result, init_time) in results {
                let tp = state.types.entry(agent_type.to_string()).or_default();
                tp.constructing = tp.constructing.saturating_sub(1);
                match result {
                    Ok(agent) if !shut_down => {
                        let id = Uuid::new_v4();
                        tp.idle.push_back(PoolEntry {
                            id,
                            agent,
                            last_used_at: Instant::now(),
                        });
                        state.cold_starts += 1;
                        state.total_init_time += init_time;
                        built += 1;
                    }
                    Ok(agent) => late.push(agent),
                    Err(e) => {
                        warn!(agent_type, error = %e, "Pre-warm construction failed");
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        for agent in late {
            agent.shutdown().await;
        }
        self.released.notify_waiters();

        if built == 0
            && let Some(e) = first_error
        {
            return Err(e);
        }
        info!(agent_type, built, "Pre-warmed agents");
        Ok(built)
    }

    /// Pre-warm `warm_agents_per_type` instances for every registered type.
    pub async fn initialize_pools(&self) -> usize {
        let count = self.config.warm_agents_per_type;
        let mut total = 0;
        for agent_type in self.registered_types() {
            match self.pre_warm(&agent_type, count).await {
                Ok(built) => total += built,
                Err(e) => warn!(agent_type = %agent_type, error = %e, "Failed to pre-warm pool"),
            }
        }
        total
    }

    /// Destroy idle instances unused for longer than `idle_timeout`.
    /// Checked-out instances are never touched. Returns how many were evicted.
    pub async fn perform_health_check(&self) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let evicted: Vec<(String, Arc<dyn Agent>)> = {
            let mut state = self.lock_state();
            let mut evicted = Vec::new();
            for (agent_type, tp) in state.types.iter_mut() {
                let mut kept = VecDeque::with_capacity(tp.idle.len());
                for entry in tp.idle.drain(..) {
                    if entry.last_used_at.elapsed() > idle_timeout {
                        evicted.push((agent_type.clone(), entry.agent));
                    } else {
                        kept.push_back(entry);
                    }
                }
                tp.idle = kept;
            }
            evicted
        };

        let count = evicted.len();
        if count > 0 {
            join_all(evicted.iter().map(|(_, agent)| agent.shutdown())).await;
            for (agent_type, _) in &evicted {
                debug!(agent_type = %agent_type, "Evicted idle agent");
            }
            info!(count, "Evicted idle agents");
            self.released.notify_waiters();
        }
        count
    }

    /// Run `perform_health_check` every `health_check_interval` until the
    /// pool is shut down or dropped.
    pub fn start_health_check(self: &Arc<Self>) {
        let mut guard = self.health_task.lock().unwrap_or_else(|e| e.into_inner());
        if guard.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let pool: Weak<Self> = Arc::downgrade(self);
        let period = self.config.health_check_interval;
        *guard = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                if pool.is_shut_down() {
                    break;
                }
                pool.perform_health_check().await;
            }
        }));
    }

    /// Instance counts per type plus request and construction totals.
    pub fn stats(&self) -> PoolStats {
        let state = self.lock_state();
        let mut stats = PoolStats {
            requests_served: state.requests_served,
            avg_init_time: average(state.total_init_time, state.cold_starts),
            ..Default::default()
        };

        for (agent_type, tp) in &state.types {
            let type_stats = TypeStats {
                total: tp.idle.len() + tp.in_use.len(),
                active: tp.in_use.len(),
                idle: tp.idle.len(),
            };
            stats.total_agents += type_stats.total;
            stats.active_agents += type_stats.active;
            stats.idle_agents += type_stats.idle;
            stats.agents_by_type.insert(agent_type.clone(), type_stats);
        }
        stats
    }

    /// Stop the health check and destroy every instance, idle or checked out.
    pub async fn shutdown(&self) {
        if let Some(handle) = self
            .health_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }

        let agents: Vec<Arc<dyn Agent>> = {
            let mut state = self.lock_state();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            let mut agents = Vec::new();
            for tp in state.types.values_mut() {
                agents.extend(tp.idle.drain(..).map(|e| e.agent));
                agents.extend(tp.in_use.drain().map(|(_, e)| e.agent));
            }
            agents
        };

        let count = agents.len();
        join_all(agents.iter().map(|agent| agent.shutdown())).await;
        self.released.notify_waiters();
        info!(destroyed = count, "Agent pool shut down");
    }
}

fn average(total: Duration, count: u64) -> Duration {
    match u32::try_from(count) {
        Ok(0) => Duration::ZERO,
        Ok(n) => total / n,
        Err(_) => Duration::from_secs_f64(total.as_secs_f64() / count as f64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentContext;
    use crate::error::WorkerError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        created: AtomicUsize,
        initialized: AtomicUsize,
        destroyed: AtomicUsize,
    }

    struct CountingAgent {
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl Agent for CountingAgent {
        async fn initialize(&self) -> Result<(), WorkerError> {
            self.counters.initialized.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn execute(
            &self,
            payload: serde_json::Value,
            _ctx: &AgentContext,
        ) -> Result<serde_json::Value, WorkerError> {
            Ok(payload)
        }

        async fn shutdown(&self) {
            self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingFactory {
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl AgentFactory for CountingFactory {
        async fn create(&self) -> Result<Arc<dyn Agent>, WorkerError> {
            self.counters.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(CountingAgent {
                counters: Arc::clone(&self.counters),
            }))
        }
    }

    struct FailingFactory;

    #[async_trait]
    impl AgentFactory for FailingFactory {
        async fn create(&self) -> Result<Arc<dyn Agent>, WorkerError> {
            Err(WorkerError::transient("model server unreachable"))
        }
    }

    fn pool_with(max: usize, idle_timeout: Duration) -> (Arc<AgentPool>, Arc<Counters>) {
        let pool = AgentPool::new(PoolConfig {
            max_agents_per_type: max,
            idle_timeout,
            ..PoolConfig::default()
        });
        let counters = Arc::new(Counters::default());
        pool.register_factory(
            "X",
            Arc::new(CountingFactory {
                counters: Arc::clone(&counters),
            }),
        );
        (pool, counters)
    }

    #[tokio::test]
    async fn unknown_type_is_rejected() {
        let (pool, _) = pool_with(1, Duration::from_secs(60));
        let err = pool.get_agent("nope").await.unwrap_err();
        assert_eq!(
            err,
            PoolError::TypeNotRegistered {
                agent_type: "nope".into()
            }
        );
    }

    #[tokio::test]
    async fn second_holder_never_gets_the_same_instance() {
        let (pool, _) = pool_with(1, Duration::from_secs(60));
        let first = pool.get_agent("X").await.unwrap();

        let err = pool.get_agent("X").await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { max: 1, .. }));

        let first_id = first.id();
        pool.return_agent(first).await;
        let second = pool.get_agent("X").await.unwrap();
        assert_eq!(second.id(), first_id);
        assert!(pool.get_agent("X").await.is_err());
        pool.return_agent(second).await;
    }

    #[tokio::test]
    async fn reuse_cycles_construct_once() {
        let (pool, counters) = pool_with(1, Duration::from_secs(60));
        for _ in 0..10 {
            let handle = pool.get_agent("X").await.unwrap();
            assert_eq!(pool.stats().active_agents, 1);
            pool.return_agent(handle).await;
        }

        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
        assert_eq!(counters.initialized.load(Ordering::SeqCst), 1);
        let stats = pool.stats();
        assert_eq!(stats.requests_served, 10);
        assert_eq!(stats.idle_agents, 1);
        assert_eq!(stats.active_agents, 0);
        assert_eq!(stats.agents_by_type["X"].total, 1);
    }

    #[tokio::test]
    async fn concurrent_checkouts_are_distinct() {
        let (pool, counters) = pool_with(3, Duration::from_secs(60));
        let results = join_all((0..5).map(|_| pool.get_agent("X"))).await;

        let handles: Vec<AgentHandle> = results.into_iter().filter_map(Result::ok).collect();
        assert_eq!(handles.len(), 3);
        let mut ids: Vec<Uuid> = handles.iter().map(|h| h.id()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert_eq!(counters.created.load(Ordering::SeqCst), 3);

        for handle in handles {
            pool.return_agent(handle).await;
        }
    }

    #[tokio::test]
    async fn idle_agents_evicted_in_use_kept() {
        let (pool, counters) = pool_with(2, Duration::from_millis(50));
        let held = pool.get_agent("X").await.unwrap();
        let idle = pool.get_agent("X").await.unwrap();
        pool.return_agent(idle).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.perform_health_check().await, 1);
        assert_eq!(counters.destroyed.load(Ordering::SeqCst), 1);

        let stats = pool.stats();
        assert_eq!(stats.active_agents, 1);
        assert_eq!(stats.idle_agents, 0);

        // The held instance is still valid and can be returned.
        pool.return_agent(held).await;
        assert_eq!(pool.stats().idle_agents, 1);
        assert_eq!(pool.perform_health_check().await, 0);
    }

    #[tokio::test]
    async fn pre_warm_respects_limit() {
        let (pool, counters) = pool_with(2, Duration::from_secs(60));
        assert_eq!(pool.pre_warm("X", 5).await.unwrap(), 2);
        assert_eq!(pool.pre_warm("X", 1).await.unwrap(), 0);
        assert_eq!(counters.created.load(Ordering::SeqCst), 2);

        let stats = pool.stats();
        assert_eq!(stats.idle_agents, 2);
        assert!(stats.requests_served == 0);

        // Warm instances are served without constructing.
        let handle = pool.get_agent("X").await.unwrap();
        assert_eq!(counters.created.load(Ordering::SeqCst), 2);
        pool.return_agent(handle).await;
    }

    #[tokio::test]
    async fn initialize_pools_warms_every_type() {
        let (pool, _) = pool_with(3, Duration::from_secs(60));
        let other = Arc::new(Counters::default());
        pool.register_factory(
            "Y",
            Arc::new(CountingFactory {
                counters: Arc::clone(&other),
            }),
        );

        assert_eq!(pool.initialize_pools().await, 2);
        assert_eq!(pool.stats().agents_by_type["Y"].idle, 1);
    }

    #[tokio::test]
    async fn failed_construction_frees_the_slot() {
        let pool = AgentPool::new(PoolConfig {
            max_agents_per_type: 1,
            ..PoolConfig::default()
        });
        pool.register_factory("broken", Arc::new(FailingFactory));

        for _ in 0..3 {
            let err = pool.get_agent("broken").await.unwrap_err();
            assert!(matches!(err, PoolError::InitFailed { .. }));
        }
        assert_eq!(pool.stats().total_agents, 0);
    }

    #[tokio::test]
    async fn discard_frees_the_slot() {
        let (pool, counters) = pool_with(1, Duration::from_secs(60));
        let handle = pool.get_agent("X").await.unwrap();
        pool.discard_agent(handle).await;
        assert_eq!(counters.destroyed.load(Ordering::SeqCst), 1);

        let handle = pool.get_agent("X").await.unwrap();
        assert_eq!(counters.created.load(Ordering::SeqCst), 2);
        pool.return_agent(handle).await;
    }

    #[tokio::test]
    async fn shutdown_destroys_idle_and_in_use() {
        let (pool, counters) = pool_with(3, Duration::from_secs(60));
        pool.start_health_check();
        let held = pool.get_agent("X").await.unwrap();
        let idle = pool.get_agent("X").await.unwrap();
        pool.return_agent(idle).await;

        pool.shutdown().await;
        assert_eq!(counters.destroyed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().total_agents, 0);
        assert_eq!(pool.get_agent("X").await.unwrap_err(), PoolError::ShutDown);

        // Returning after shutdown doesn't resurrect the instance.
        pool.return_agent(held).await;
        assert_eq!(pool.stats().total_agents, 0);
    }

    #[tokio::test]
    async fn avg_init_time_tracks_cold_starts() {
        let (pool, _) = pool_with(2, Duration::from_secs(60));
        assert_eq!(pool.stats().avg_init_time, Duration::ZERO);
        let a = pool.get_agent("X").await.unwrap();
        let b = pool.get_agent("X").await.unwrap();
        pool.return_agent(a).await;
        pool.return_agent(b).await;
        assert!(pool.stats().avg_init_time < Duration::from_secs(1));
    }

    #[test]
    fn average_survives_counts_beyond_u32() {
        assert_eq!(average(Duration::from_secs(10), 0), Duration::ZERO);
        assert_eq!(average(Duration::from_secs(10), 4), Duration::from_millis(2500));
        let huge = 1u64 << 33;
        assert_eq!(average(Duration::from_secs(huge), huge), Duration::from_secs(1));
    }

    #[test]
    fn pool_futures_are_send() {
        fn assert_send<T: Send>(_: &T) {}
        let (pool, _) = pool_with(1, Duration::from_secs(60));
        assert_send(&pool.get_agent("X"));
        assert_send(&pool.pre_warm("X", 1));
        assert_send(&pool.perform_health_check());
        assert_send(&pool.shutdown());
    }

    #[tokio::test]
    async fn health_ticker_evicts_idle_agents() {
        let pool = AgentPool::new(PoolConfig {
            max_agents_per_type: 2,
            health_check_interval: Duration::from_millis(20),
            idle_timeout: Duration::from_millis(30),
            ..PoolConfig::default()
        });
        let counters = Arc::new(Counters::default());
        pool.register_factory(
            "X",
            Arc::new(CountingFactory {
                counters: Arc::clone(&counters),
            }),
        );

        let held = pool.get_agent("X").await.unwrap();
        let idle = pool.get_agent("X").await.unwrap();
        pool.return_agent(idle).await;
        pool.start_health_check();

        let evicted = tokio::time::timeout(Duration::from_secs(2), async {
            while pool.stats().idle_agents > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(evicted.is_ok(), "idle agent was never evicted by the ticker");
        assert_eq!(counters.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().active_agents, 1);

        pool.return_agent(held).await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_during_construction_destroys_the_new_agent() {
        struct SlowFactory {
            counters: Arc<Counters>,
            gate: Arc<tokio::sync::Notify>,
        }

        #[async_trait]
        impl AgentFactory for SlowFactory {
            async fn create(&self) -> Result<Arc<dyn Agent>, WorkerError> {
                self.gate.notified().await;
                self.counters.created.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(CountingAgent {
                    counters: Arc::clone(&self.counters),
                }))
            }
        }

        let pool = AgentPool::new(PoolConfig::default());
        let counters = Arc::new(Counters::default());
        let gate = Arc::new(tokio::sync::Notify::new());
        pool.register_factory(
            "X",
            Arc::new(SlowFactory {
                counters: Arc::clone(&counters),
                gate: Arc::clone(&gate),
            }),
        );

        let checkout = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.get_agent("X").await.map(|h| h.id()) }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.shutdown().await;
        gate.notify_one();

        let result = checkout.await.unwrap();
        assert_eq!(result.unwrap_err(), PoolError::ShutDown);
        assert_eq!(counters.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().total_agents, 0);
    }
}
