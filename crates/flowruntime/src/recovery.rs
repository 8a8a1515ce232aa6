//! Background drivers: the retry timer loop and the periodic recovery sweep.
//!
//! Timers give retries their latency; the sweep is the safety net that picks
//! up anything a timer missed (process restart, dropped timer, crash while a
//! step was `RUNNING`).

use crate::executor::{RetryTimer, WorkflowExecutor};
use crate::resolver;
use crate::runtime::RuntimeConfig;
use chrono::{DateTime, Utc};
use flowcore::{FlowError, InstanceId, StepStatus, WorkflowInstance, WorkflowStatus};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Notification status sent for every instance the sweep re-drives.
pub const RECOVERED: &str = "RECOVERED";

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    pub scanned: usize,
    pub redriven: Vec<InstanceId>,
    /// Instances whose lock was held by a live drive.
    pub busy: usize,
    pub errors: usize,
}

pub struct RecoverySweep {
    executor: WorkflowExecutor,
    interval: Duration,
    stale_after: Duration,
}

impl RecoverySweep {
    pub fn new(executor: WorkflowExecutor, config: &RuntimeConfig) -> Self {
        Self {
            executor,
            interval: config.recovery_interval(),
            stale_after: config.stale_after(),
        }
    }

    /// Re-drive every `RUNNING` instance that is stale or has a due retry.
    pub async fn sweep_once(&self) -> Result<RecoveryReport, FlowError> {
        let running = self
            .executor
            .instance_repository()
            .find_by_status(WorkflowStatus::Running)
            .await?;

        let mut report = RecoveryReport {
            scanned: running.len(),
            ..RecoveryReport::default()
        };

        for instance in &running {
            if !self.needs_recovery(instance).await {
                continue;
            }
            info!(instance_id = %instance.id, "Recovering workflow instance");
            self.executor
                .notifier()
                .on_state_change(&instance.id.to_string(), RECOVERED);

            match self.executor.continue_execution(instance.id).await {
                Ok(_) => report.redriven.push(instance.id),
                Err(FlowError::LockTimeout { .. }) => {
                    debug!(instance_id = %instance.id, "Instance busy; skipping");
                    report.busy += 1;
                }
                Err(err) => {
                    error!(instance_id = %instance.id, error = %err, "Recovery failed");
                    report.errors += 1;
                }
            }
        }

        if !report.redriven.is_empty() || report.errors > 0 {
            info!(
                scanned = report.scanned,
                redriven = report.redriven.len(),
                busy = report.busy,
                errors = report.errors,
                "Recovery sweep finished"
            );
        }
        Ok(report)
    }

    async fn needs_recovery(&self, instance: &WorkflowInstance) -> bool {
        let now = Utc::now();
        if instance
            .state
            .step_executions
            .iter()
            .any(|execution| execution.retry_due(now))
        {
            return true;
        }

        let stale = (now - instance.updated_at)
            .to_std()
            .map_or(false, |age| age >= self.stale_after);
        stale && !self.parked_on_input(instance, now).await
    }

    /// True when a drive would find nothing to do but wait for a human step.
    async fn parked_on_input(&self, instance: &WorkflowInstance, now: DateTime<Utc>) -> bool {
        let state = &instance.state;
        let awaiting = state
            .step_executions
            .iter()
            .any(|e| e.status == StepStatus::AwaitingInput);
        let interrupted = state
            .step_executions
            .iter()
            .any(|e| e.status == StepStatus::Running);
        if !awaiting || interrupted {
            return false;
        }

        match self.executor.load_definition(instance).await {
            Ok(definition) => {
                resolver::failed_step(&definition, state).is_none()
                    && resolver::ready_steps(&definition, state, now).is_empty()
            }
            Err(_) => false,
        }
    }

    /// Run the sweep every `recovery_interval` until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.sweep_once().await {
                            warn!(error = %err, "Recovery sweep could not list instances");
                        }
                    }
                }
            }
            debug!("Recovery sweep stopped");
        })
    }
}

/// Consume retry timers and re-enter each instance when its delay elapses.
///
/// Returns `None` if another driver already owns the timer channel.
pub fn spawn_retry_driver(
    executor: WorkflowExecutor,
    shutdown: CancellationToken,
) -> Option<JoinHandle<()>> {
    let mut timers = executor.take_retry_receiver()?;

    Some(tokio::spawn(async move {
        loop {
            let timer: RetryTimer = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = timers.recv() => match next {
                    Some(timer) => timer,
                    None => break,
                },
            };

            let executor = executor.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = tokio::time::sleep(timer.delay) => {
                        if let Err(err) = executor.continue_execution(timer.instance_id).await {
                            warn!(
                                instance_id = %timer.instance_id,
                                error = %err,
                                "Retry re-entry failed; recovery sweep will retry"
                            );
                        }
                    }
                }
            });
        }
        debug!("Retry driver stopped");
    }))
}
