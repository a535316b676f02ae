//! Scheduler engine: the background tick loop.
//!
//! A single loop (1 s cadence) drives due-time dispatch and event-condition
//! polling. `start` fires boot-event tasks and awaits them before returning;
//! `stop` fires shutdown-event tasks, awaits them, then joins the loop with a
//! bounded grace period. Tick errors are logged and never terminate the loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::interval;

use super::runner::TaskRunner;
use super::task_store::{StoreError, TaskStore};
use super::types::{format_stamp, local_now, EventType, TriggerReason};

/// Configuration for the scheduler engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often the loop checks for work.
    pub tick_interval: Duration,
    /// Hard wall-clock bound per task execution.
    pub task_timeout: Duration,
    /// Bound per condition script evaluation.
    pub condition_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            task_timeout: Duration::from_secs(900),
            condition_timeout: Duration::from_secs(60),
        }
    }
}

/// The background scheduling engine.
pub struct SchedulerEngine {
    store: Arc<TaskStore>,
    config: EngineConfig,
    shutdown_notify: Arc<Notify>,
    is_running: Arc<RwLock<bool>>,
    started_at: Arc<RwLock<Option<NaiveDateTime>>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerEngine {
    pub fn new(store: Arc<TaskStore>, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            shutdown_notify: Arc::new(Notify::new()),
            is_running: Arc::new(RwLock::new(false)),
            started_at: Arc::new(RwLock::new(None)),
            loop_handle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Moment the engine came up; schedule runs older than this are stale.
    pub fn started_at(&self) -> Option<NaiveDateTime> {
        *self.started_at.read()
    }

    /// Start the tick loop, then fire all active boot-event tasks and await
    /// them before returning.
    pub async fn start(&self) {
        *self.started_at.write() = Some(local_now());
        *self.is_running.write() = true;

        let store = self.store.clone();
        let config = self.config.clone();
        let shutdown = self.shutdown_notify.clone();
        let is_running = self.is_running.clone();
        let started_at = self.started_at.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(config.tick_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !*is_running.read() {
                            break;
                        }
                        let Some(started) = *started_at.read() else { continue };
                        Self::tick(&store, &config, started).await;
                    }
                    _ = shutdown.notified() => break,
                }
            }
        });
        *self.loop_handle.lock() = Some(handle);

        self.trigger_system_event(EventType::SystemBoot).await;
        tracing::info!("scheduler engine started");
    }

    /// Stop the loop: set the stop flag, fire shutdown-event tasks and await
    /// them, then join the loop thread with a ~5 s grace period.
    pub async fn stop(&self) {
        {
            if !*self.is_running.read() {
                return;
            }
        }
        *self.is_running.write() = false;
        self.shutdown_notify.notify_waiters();

        self.trigger_system_event(EventType::SystemShutdown).await;

        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                tracing::warn!("scheduler loop did not stop within grace period");
            }
        }
        tracing::info!("scheduler engine stopped");
    }

    async fn tick(store: &Arc<TaskStore>, config: &EngineConfig, started_at: NaiveDateTime) {
        let now = local_now();
        if let Err(err) = Self::process_due_tasks(store, config, started_at, now).await {
            tracing::error!("scheduler loop error (due tasks): {err}");
        }
        if let Err(err) = Self::process_event_tasks(store, config, now).await {
            tracing::error!("scheduler loop error (event tasks): {err}");
        }
    }

    async fn process_due_tasks(
        store: &Arc<TaskStore>,
        config: &EngineConfig,
        started_at: NaiveDateTime,
        now: NaiveDateTime,
    ) -> Result<(), StoreError> {
        for task in store.fetch_due_tasks(now).await? {
            let Some(expression) = task.schedule_expression.clone() else {
                continue;
            };

            // A next_run_at predating engine start is a leftover from before
            // restart; reschedule forward instead of replaying the missed run.
            if task.next_run_at.is_some_and(|next| next < started_at) {
                tracing::info!(
                    "skipping stale run for task {} scheduled at {:?} (engine started at {})",
                    task.id,
                    task.next_run_at.as_ref().map(format_stamp),
                    format_stamp(&started_at),
                );
                if let Err(err) = store.schedule_next_run(task.id, &expression, started_at).await {
                    tracing::error!("failed to reschedule stale task {}: {err}", task.id);
                }
                continue;
            }

            if store.has_running_instance(task.id).await? {
                tracing::info!("task {} still running, skip", task.id);
                store.schedule_next_run(task.id, &expression, now).await?;
                continue;
            }

            if !store.dependencies_met(&task).await? {
                tracing::info!("task {} waiting for dependencies", task.id);
                // retry window: look again in a minute
                store
                    .schedule_next_run(task.id, &expression, now + chrono::Duration::minutes(1))
                    .await?;
                continue;
            }

            TaskRunner::spawn(
                store.clone(),
                task.clone(),
                TriggerReason::Schedule,
                config.task_timeout,
            );
            // Reschedule from `now` so the next match is always in this
            // tick's future.
            store.schedule_next_run(task.id, &expression, now).await?;
        }
        Ok(())
    }

    async fn process_event_tasks(
        store: &Arc<TaskStore>,
        config: &EngineConfig,
        now: NaiveDateTime,
    ) -> Result<(), StoreError> {
        for task in store.fetch_event_tasks(Some(EventType::Script)).await? {
            if let Some(last_check) = task.last_condition_check_at {
                if (now - last_check).num_seconds() < task.condition_interval {
                    continue;
                }
            }
            store.update_condition_check(task.id).await?;

            let Some(script) = task
                .condition_script
                .clone()
                .filter(|script| !script.is_empty())
            else {
                continue;
            };
            if !TaskRunner::run_condition(task.id, &script, config.condition_timeout).await {
                continue;
            }
            if store.has_running_instance(task.id).await? {
                continue;
            }
            if !store.dependencies_met(&task).await? {
                continue;
            }
            TaskRunner::spawn(
                store.clone(),
                task,
                TriggerReason::Condition,
                config.task_timeout,
            );
        }
        Ok(())
    }

    /// Fire all active tasks of a lifecycle event type in parallel and await
    /// them together.
    async fn trigger_system_event(&self, event_type: EventType) {
        let reason = match event_type {
            EventType::SystemBoot => TriggerReason::SystemBoot,
            EventType::SystemShutdown => TriggerReason::SystemShutdown,
            EventType::Script => return,
        };
        let tasks = match self.store.fetch_event_tasks(Some(event_type)).await {
            Ok(tasks) => tasks,
            Err(err) => {
                tracing::error!("failed to fetch {event_type} tasks: {err}");
                return;
            }
        };
        let mut handles = Vec::new();
        for task in tasks {
            match self.store.has_running_instance(task.id).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => {
                    tracing::error!("failed to check running instance for task {}: {err}", task.id);
                    continue;
                }
            }
            match self.store.dependencies_met(&task).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    tracing::error!("failed to check dependencies for task {}: {err}", task.id);
                    continue;
                }
            }
            handles.push(TaskRunner::spawn(
                self.store.clone(),
                task,
                reason,
                self.config.task_timeout,
            ));
        }
        futures::future::join_all(handles).await;
    }
}
