//! Scheduler module: turns due schedules and on-demand requests into
//! check executions run by a pool of workers.
//!
//! One coordinator task owns the timers and the run-now channel. It feeds a
//! shared [`PriorityQueue`]; `num_workers` worker tasks pop from it and run
//! each check in its own task under a timeout.

mod disabled;
mod maintenance;
mod queue;
mod worker;

pub use disabled::*;
pub use queue::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::checker::CheckerRegistry;
use crate::config::ServerConfig;
use crate::db::{CheckerOptions, CheckerSchedule, TargetType};
use crate::error::{Error, Result};
use crate::ident::Identifier;
use crate::options::OptionsMerger;
use crate::storage::CheckerStorage;
use crate::usecase::{add_duration, ResultUsecase, ScheduleUsecase};

const RUN_NOW_CAPACITY: usize = 100;
const STATUS_NEXT_SCHEDULES: usize = 20;

/// Timing and sizing of the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub num_workers: usize,
    pub tick_interval: Duration,
    pub cleanup_interval: Duration,
    pub discovery_interval: Duration,
    pub execution_timeout: Duration,
    /// Initial value of the runtime flag.
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            tick_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(24 * 60 * 60),
            discovery_interval: Duration::from_secs(60 * 60),
            execution_timeout: Duration::from_secs(5 * 60),
            enabled: true,
        }
    }
}

impl From<&ServerConfig> for SchedulerConfig {
    fn from(cfg: &ServerConfig) -> Self {
        Self {
            num_workers: cfg.test_workers.max(1),
            ..Self::default()
        }
    }
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub config_enabled: bool,
    pub runtime_enabled: bool,
    pub running: bool,
    pub worker_count: usize,
    pub queue_size: usize,
    pub active_count: usize,
    pub next_schedules: Vec<CheckerSchedule>,
    pub last_run: Option<DateTime<Utc>>,
}

/// Operations exposed to admin and transport layers.
#[async_trait]
pub trait CheckScheduler: Send + Sync {
    /// Queue a run outside any schedule and return its execution id.
    async fn trigger_on_demand_check(
        &self,
        checker_name: &str,
        target_type: TargetType,
        target_id: Identifier,
        owner_id: Identifier,
        options: CheckerOptions,
    ) -> Result<Identifier>;

    fn status(&self) -> Result<SchedulerStatus>;

    /// Pause or resume scheduling of new work. Workers keep running.
    async fn set_enabled(&self, enabled: bool) -> Result<()>;

    /// Spread an overdue backlog without restarting.
    fn reschedule_upcoming_checks(&self) -> Result<usize>;

    async fn close(&self);
}

struct ActiveExecution {
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
}

struct State {
    runtime_enabled: bool,
    running: bool,
    active: HashMap<Identifier, ActiveExecution>,
    /// Schedules with a queued or running execution.
    in_flight: HashSet<Identifier>,
}

/// Shared between the coordinator, the workers and the public handle.
pub(crate) struct Core {
    config: SchedulerConfig,
    queue: PriorityQueue,
    storage: Arc<dyn CheckerStorage>,
    registry: Arc<CheckerRegistry>,
    schedules: Arc<ScheduleUsecase>,
    results: Arc<ResultUsecase>,
    merger: OptionsMerger,
    state: RwLock<State>,
    work_tx: mpsc::Sender<()>,
    work_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
    run_now_tx: mpsc::Sender<QueueItem>,
    stop: CancellationToken,
    workers_stop: CancellationToken,
}

/// The production scheduler.
pub struct Scheduler {
    core: Arc<Core>,
    run_now_rx: Mutex<Option<mpsc::Receiver<QueueItem>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        storage: Arc<dyn CheckerStorage>,
        registry: Arc<CheckerRegistry>,
        schedules: Arc<ScheduleUsecase>,
        results: Arc<ResultUsecase>,
    ) -> Self {
        let num_workers = config.num_workers.max(1);
        let config = SchedulerConfig { num_workers, ..config };
        let (work_tx, work_rx) = mpsc::channel(num_workers);
        let (run_now_tx, run_now_rx) = mpsc::channel(RUN_NOW_CAPACITY);

        // Before any trigger can create a pending execution of this process.
        match results.recover_interrupted_executions() {
            Ok(0) => {}
            Ok(n) => tracing::info!("Scheduler: Failed {} executions interrupted by a previous run", n),
            Err(e) => tracing::error!("Scheduler: Failed to recover interrupted executions: {}", e),
        }

        let core = Core {
            state: RwLock::new(State {
                runtime_enabled: config.enabled,
                running: false,
                active: HashMap::new(),
                in_flight: HashSet::new(),
            }),
            config,
            queue: PriorityQueue::new(),
            merger: OptionsMerger::new(storage.clone()),
            storage,
            registry,
            schedules,
            results,
            work_tx,
            work_rx: tokio::sync::Mutex::new(work_rx),
            run_now_tx,
            stop: CancellationToken::new(),
            workers_stop: CancellationToken::new(),
        };

        Self {
            core: Arc::new(core),
            run_now_rx: Mutex::new(Some(run_now_rx)),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Start the workers and the coordinator loop.
    pub async fn start(&self) -> Result<()> {
        if self.core.stop.is_cancelled() {
            return Err(Error::SchedulerStopped);
        }
        let Some(run_now_rx) = self.run_now_rx.lock().take() else {
            // Already started
            return Ok(());
        };
        let core = &self.core;

        match core.schedules.reschedule_overdue_checks() {
            Ok(0) => {}
            Ok(n) => tracing::info!("Scheduler: Spread {} overdue schedules", n),
            Err(e) => tracing::error!("Scheduler: Failed to reschedule overdue checks: {}", e),
        }

        core.state.write().running = true;

        let mut handles = Vec::with_capacity(core.config.num_workers + 1);
        for id in 0..core.config.num_workers {
            handles.push(tokio::spawn(worker::run_worker(core.clone(), id)));
        }

        maintenance::run_discovery(&core.schedules);
        core.check_schedules();

        handles.push(tokio::spawn(run_loop(core.clone(), run_now_rx)));
        self.handles.lock().extend(handles);

        tracing::info!("Scheduler started with {} workers", core.config.num_workers);
        Ok(())
    }

    #[cfg(test)]
    fn core(&self) -> &Core {
        &self.core
    }

    /// Move everything waiting on the run-now channel into the queue.
    #[cfg(test)]
    fn route_pending_on_demand(&self) {
        if let Some(rx) = self.run_now_rx.lock().as_mut() {
            while let Ok(item) = rx.try_recv() {
                self.core.enqueue(item);
            }
        }
    }
}

#[async_trait]
impl CheckScheduler for Scheduler {
    async fn trigger_on_demand_check(
        &self,
        checker_name: &str,
        target_type: TargetType,
        target_id: Identifier,
        owner_id: Identifier,
        options: CheckerOptions,
    ) -> Result<Identifier> {
        let core = &self.core;
        if core.stop.is_cancelled() {
            return Err(Error::SchedulerStopped);
        }
        if core.registry.get(checker_name).is_none() {
            return Err(Error::Validation(format!("unknown checker {:?}", checker_name)));
        }

        let schedule = CheckerSchedule {
            id: Identifier::default(),
            checker_name: checker_name.to_string(),
            owner_id,
            target_type,
            target_id,
            interval: Duration::ZERO,
            enabled: true,
            next_run: Utc::now(),
            last_run: None,
            options,
        };
        let execution = core.results.create_execution(&schedule, None)?;
        let execution_id = execution.id;
        let item = QueueItem::new(schedule, execution, Priority::OnDemand);

        match core.run_now_tx.try_send(item) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(item)) | Err(mpsc::error::TrySendError::Closed(item)) => {
                core.enqueue(item);
            }
        }

        tracing::info!(
            execution = %execution_id,
            checker = checker_name,
            "On-demand check requested"
        );
        Ok(execution_id)
    }

    fn status(&self) -> Result<SchedulerStatus> {
        let core = &self.core;
        let (runtime_enabled, running, active_count) = {
            let state = core.state.read();
            (state.runtime_enabled, state.running, state.active.len())
        };

        Ok(SchedulerStatus {
            config_enabled: true,
            runtime_enabled,
            running,
            worker_count: core.config.num_workers,
            queue_size: core.queue.len(),
            active_count,
            next_schedules: core.schedules.list_next_schedules(STATUS_NEXT_SCHEDULES)?,
            last_run: core.storage.last_check_scheduler_run()?,
        })
    }

    async fn set_enabled(&self, enabled: bool) -> Result<()> {
        let core = &self.core;
        let was_enabled = {
            let mut state = core.state.write();
            std::mem::replace(&mut state.runtime_enabled, enabled)
        };

        if enabled && !was_enabled {
            if let Err(e) = core.schedules.reschedule_overdue_checks() {
                tracing::error!("Scheduler: Failed to reschedule overdue checks on resume: {}", e);
            }
            core.check_schedules();
        }

        tracing::info!("Scheduler runtime {}", if enabled { "enabled" } else { "paused" });
        Ok(())
    }

    fn reschedule_upcoming_checks(&self) -> Result<usize> {
        self.core.schedules.reschedule_overdue_checks()
    }

    async fn close(&self) {
        let core = &self.core;
        core.stop.cancel();
        core.workers_stop.cancel();
        {
            let mut state = core.state.write();
            let now = Utc::now();
            for (id, active) in &state.active {
                tracing::info!(
                    execution = %id,
                    "Cancelling execution running for {}s",
                    (now - active.started_at).num_seconds()
                );
                active.cancel.cancel();
            }
            state.running = false;
        }

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Scheduler task ended abnormally: {}", e);
            }
        }
        tracing::info!("Scheduler stopped");
    }
}

impl Core {
    /// Queue an item and wake one idle worker.
    fn enqueue(&self, item: QueueItem) {
        tracing::debug!(
            execution = %item.execution.id,
            priority = ?item.priority,
            "Enqueued check"
        );
        self.queue.push(item);
        // A full buffer already guarantees a wake-up.
        let _ = self.work_tx.try_send(());
    }

    /// Queue every due schedule that is not already queued or running.
    fn check_schedules(&self) {
        if !self.state.read().runtime_enabled {
            return;
        }

        let due = match self.schedules.list_due_schedules() {
            Ok(due) => due,
            Err(e) => {
                tracing::error!("Scheduler: Failed to list due schedules: {}", e);
                return;
            }
        };

        let now = Utc::now();
        let mut queued = 0;
        for schedule in due {
            if !self.state.write().in_flight.insert(schedule.id) {
                tracing::debug!(schedule = %schedule.id, "Schedule still in flight, skipping");
                continue;
            }

            let priority = if add_duration(schedule.next_run, schedule.interval) < now {
                Priority::Overdue
            } else {
                Priority::Scheduled
            };

            match self.results.create_execution(&schedule, Some(schedule.id)) {
                Ok(execution) => {
                    self.enqueue(QueueItem::new(schedule, execution, priority));
                    queued += 1;
                }
                Err(e) => {
                    self.state.write().in_flight.remove(&schedule.id);
                    tracing::error!(schedule = %schedule.id, "Scheduler: Failed to create execution: {}", e);
                }
            }
        }

        if queued > 0 {
            tracing::debug!("Scheduler: Queued {} due checks", queued);
        }

        if let Err(e) = self.storage.check_scheduler_run(now) {
            tracing::error!("Scheduler: Failed to record scheduler run: {}", e);
        }
    }
}

/// Coordinator loop: timers, on-demand routing and shutdown.
async fn run_loop(core: Arc<Core>, mut run_now: mpsc::Receiver<QueueItem>) {
    let start = Instant::now();
    let mut tick = interval_at(start + core.config.tick_interval, core.config.tick_interval);
    let mut cleanup = interval_at(start + core.config.cleanup_interval, core.config.cleanup_interval);
    let mut discovery = interval_at(start + core.config.discovery_interval, core.config.discovery_interval);
    for timer in [&mut tick, &mut cleanup, &mut discovery] {
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    }

    loop {
        tokio::select! {
            _ = core.stop.cancelled() => break,
            _ = tick.tick() => core.check_schedules(),
            _ = cleanup.tick() => maintenance::run_cleanup(&core.results, Utc::now()),
            _ = discovery.tick() => maintenance::run_discovery(&core.schedules),
            Some(item) = run_now.recv() => core.enqueue(item),
        }
    }
}
