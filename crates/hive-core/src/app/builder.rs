//! Wiring: `HiveBuilder` assembles the scheduler, its workers and their
//! collaborators; `Hive::start` spawns them.
//!
//! Startup is fail-fast: an invalid config or an expected task kind without
//! an executor stops `build()` before anything runs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info};

use crate::app::context::HiveContext;
use crate::app::recorder::EventRecorder;
use crate::app::registry::ExecutorRegistry;
use crate::app::scheduler::Queen;
use crate::app::status::StatusSnapshot;
use crate::app::worker::{WorkerExecutor, worker_pool};
use crate::config::HiveConfig;
use crate::domain::{COMMAND_KIND, Decider, DefaultDecider, HiveError, TaskId, TaskSpec, WorkerId};
use crate::impls::{CommandExecutor, InMemoryEventBus, InMemoryTaskStore};
use crate::ports::{Clock, EventBus, SystemClock, TaskExecutor, TaskStore, UlidGenerator};
use crate::resilience::{AdaptiveTimeoutManager, CircuitBreakerRegistry, RetryPolicy};

/// # Example
/// ```ignore
/// let hive = HiveBuilder::new(config)
///     .with_command_executor()?
///     .expect_kinds(&["command"])
///     .build()?;
/// let running = hive.start().await;
/// ```
pub struct HiveBuilder {
    config: HiveConfig,
    store: Option<Arc<dyn TaskStore>>,
    bus: Option<Arc<dyn EventBus>>,
    clock: Option<Arc<dyn Clock>>,
    decider: Option<Arc<dyn Decider>>,
    retryable: Option<Box<dyn Fn(&HiveError) -> bool + Send + Sync>>,
    executors: ExecutorRegistry,
    expected_kinds: Option<Vec<String>>,
}

impl HiveBuilder {
    pub fn new(config: HiveConfig) -> Self {
        Self {
            config,
            store: None,
            bus: None,
            clock: None,
            decider: None,
            retryable: None,
            executors: ExecutorRegistry::new(),
            expected_kinds: None,
        }
    }

    /// Defaults to [`InMemoryTaskStore`].
    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to [`InMemoryEventBus`].
    pub fn with_event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    /// Replace the retry predicate (default: [`HiveError::is_transient`]).
    pub fn with_retryable<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&HiveError) -> bool + Send + Sync + 'static,
    {
        self.retryable = Some(Box::new(predicate));
        self
    }

    pub fn register_executor(
        mut self,
        kind: impl Into<String>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<Self, HiveError> {
        self.executors.register(kind, executor)?;
        Ok(self)
    }

    /// Register [`CommandExecutor`] for `command` and `pipeline` tasks.
    pub fn with_command_executor(self) -> Result<Self, HiveError> {
        self.register_executor(COMMAND_KIND, Arc::new(CommandExecutor::new()))
    }

    /// Task kinds that must have an executor by `build()`.
    pub fn expect_kinds(mut self, kinds: &[&str]) -> Self {
        self.expected_kinds = Some(kinds.iter().map(|k| k.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Hive, HiveError> {
        self.config.validate()?;

        if let Some(expected) = &self.expected_kinds {
            let registered = self.executors.registered_kinds();
            let missing: Vec<String> = expected
                .iter()
                .filter(|kind| !registered.contains(kind))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(HiveError::MissingExecutors(missing));
            }
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new(Arc::clone(&clock))));
        let bus = self
            .bus
            .unwrap_or_else(|| Arc::new(InMemoryEventBus::new()));

        let mut retry = RetryPolicy::from_config(&self.config.retry);
        if let Some(predicate) = self.retryable {
            retry = retry.with_retryable(predicate);
        }

        let ctx = HiveContext {
            recorder: Arc::new(EventRecorder::new(bus, Arc::clone(&clock))),
            ids: Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            decider: self.decider.unwrap_or_else(|| Arc::new(DefaultDecider)),
            executors: Arc::new(self.executors),
            breakers: Arc::new(CircuitBreakerRegistry::new(
                self.config.circuit_breaker.clone(),
            )),
            timeouts: Arc::new(AdaptiveTimeoutManager::new(self.config.timeouts.clone())),
            config: Arc::new(self.config),
            store,
            clock,
            retry,
        };

        info!(
            executors = ?ctx.executors.registered_kinds(),
            max_concurrent_workers = ctx.config.max_concurrent_workers,
            "hive built"
        );
        Ok(Hive {
            queen: Arc::new(Queen::new(ctx.clone())),
            ctx,
        })
    }
}

impl Default for HiveBuilder {
    fn default() -> Self {
        Self::new(HiveConfig::default())
    }
}

/// A wired but idle hive. Tests drive it by hand through [`Hive::queen`]
/// and [`Hive::worker_executor`].
pub struct Hive {
    ctx: HiveContext,
    queen: Arc<Queen>,
}

impl Hive {
    pub fn queen(&self) -> &Arc<Queen> {
        &self.queen
    }

    pub fn context(&self) -> &HiveContext {
        &self.ctx
    }

    pub fn worker_executor(&self, worker: WorkerId) -> WorkerExecutor {
        WorkerExecutor::new(worker, self.ctx.clone())
    }

    /// Spawn the scheduler loop and a pool of `max_concurrent_workers`
    /// workers; workers dropped for a lapsed heartbeat are replaced.
    pub async fn start(self) -> RunningHive {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = self.ctx.config.max_concurrent_workers;

        let queen = Arc::clone(&self.queen);
        let rx = shutdown_rx.clone();
        let scheduler = tokio::spawn(async move { queen.run(rx).await });
        let pool = tokio::spawn(worker_pool(
            Arc::clone(&self.queen),
            self.ctx.clone(),
            workers,
            shutdown_rx,
        ));
        let joins = vec![scheduler, pool];

        info!(workers, "hive started");
        RunningHive {
            hive: self,
            shutdown_tx,
            joins,
        }
    }
}

/// Handle on a started hive.
/// - `request_shutdown` stops new dispatch; runs in progress finish
/// - `shutdown_and_join` also waits for every loop to exit
pub struct RunningHive {
    hive: Hive,
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl RunningHive {
    pub fn queen(&self) -> &Arc<Queen> {
        &self.hive.queen
    }

    pub async fn submit(&self, batch: Vec<TaskSpec>) -> Result<Vec<TaskId>, HiveError> {
        self.hive.queen.submit(batch).await
    }

    pub async fn status(&self) -> Result<StatusSnapshot, HiveError> {
        self.hive.queen.status().await
    }

    /// Poll until no task can make progress, or `limit` elapses.
    pub async fn wait_until_settled(&self, limit: Duration) -> Result<StatusSnapshot, HiveError> {
        // `None` when `limit` reaches past what an instant can hold.
        let deadline = Instant::now().checked_add(limit);
        loop {
            let status = self.status().await?;
            if status.settled {
                return Ok(status);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(HiveError::AsyncTimeout {
                    operation: "wait_until_settled".to_string(),
                    timeout_duration: limit,
                });
            }
            tokio::time::sleep(self.hive.ctx.config.poll_interval).await;
        }
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "hive task panicked");
            }
        }
        info!("hive stopped");
    }
}
