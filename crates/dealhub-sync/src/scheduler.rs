//! Cron-driven runner around [`DealPipeline`] with a manual trigger and status.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::pipeline::{CycleReport, DealPipeline};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub total_runs: u64,
    pub total_deals_found: u64,
    pub total_alerts_sent: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub is_running: bool,
    pub cron: Option<String>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub stats: SchedulerStats,
}

#[derive(Debug, Default)]
struct SchedulerState {
    running: bool,
    generation: u64,
    cron: Option<String>,
    last_run: Option<DateTime<Utc>>,
    last_error: Option<String>,
    stats: SchedulerStats,
}

struct Shared {
    pipeline: Arc<DealPipeline>,
    state: Mutex<SchedulerState>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs one cycle and folds its outcome into the status; errors are logged, never fatal.
    async fn run_recorded(&self, channel: Option<&str>) -> Result<CycleReport> {
        let result = self.pipeline.run_cycle(channel).await;
        let now = self.pipeline.clock().now();
        let mut state = self.state();
        state.last_run = Some(now);
        state.stats.total_runs += 1;
        match &result {
            Ok(report) => {
                state.stats.total_deals_found += report.deals_found as u64;
                state.stats.total_alerts_sent += report.alerts_sent as u64;
                state.last_error = report.aborted.clone();
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "deal cycle failed");
                state.last_error = Some(format!("{err:#}"));
            }
        }
        result
    }
}

/// Accepts 5-field crontab expressions by prepending a seconds field.
pub fn normalize_cron(expr: &str) -> Result<String> {
    let fields = expr.split_whitespace().collect::<Vec<_>>();
    match fields.len() {
        5 => Ok(format!("0 {}", fields.join(" "))),
        6 | 7 => Ok(fields.join(" ")),
        n => Err(anyhow!("cron expression {expr:?} has {n} fields, expected 5 to 7")),
    }
}

#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
    jobs: Arc<AsyncMutex<Option<JobScheduler>>>,
    default_cron: String,
    initial_delay: Duration,
}

impl Scheduler {
    pub fn new(pipeline: Arc<DealPipeline>, default_cron: impl Into<String>, initial_delay: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                pipeline,
                state: Mutex::new(SchedulerState::default()),
            }),
            jobs: Arc::new(AsyncMutex::new(None)),
            default_cron: default_cron.into(),
            initial_delay,
        }
    }

    pub fn pipeline(&self) -> &Arc<DealPipeline> {
        &self.shared.pipeline
    }

    /// Stopped -> Running. A second call while running is a no-op.
    pub async fn start(&self, cron: Option<&str>) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if jobs.is_some() {
            info!("scheduler already running");
            return Ok(());
        }
        let expr = normalize_cron(cron.unwrap_or(&self.default_cron))?;

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let shared = self.shared.clone();
        let job = Job::new_async(expr.as_str(), move |_uuid, _l| {
            let shared = shared.clone();
            Box::pin(async move {
                let _ = shared.run_recorded(None).await;
            })
        })
        .with_context(|| format!("creating scheduler job for cron {expr}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        sched.start().await.context("starting scheduler")?;
        *jobs = Some(sched);

        let generation = self.mark_running(&expr);
        info!(cron = expr.as_str(), initial_delay_secs = self.initial_delay.as_secs(), "scheduler started");
        self.spawn_initial_run(generation);
        Ok(())
    }

    fn mark_running(&self, cron: &str) -> u64 {
        let mut state = self.shared.state();
        state.running = true;
        state.generation += 1;
        state.cron = Some(cron.to_string());
        state.generation
    }

    /// One cycle after the initial delay, unless the scheduler was stopped or restarted meanwhile.
    fn spawn_initial_run(&self, generation: u64) -> tokio::task::JoinHandle<()> {
        let shared = self.shared.clone();
        let delay = self.initial_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let still_current = {
                let state = shared.state();
                state.running && state.generation == generation
            };
            if still_current {
                let _ = shared.run_recorded(None).await;
            }
        })
    }

    /// Running -> Stopped. An in-flight cycle finishes on its own.
    pub async fn stop(&self) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if let Some(mut sched) = jobs.take() {
            sched.shutdown().await.context("shutting down scheduler")?;
        }
        let mut state = self.shared.state();
        state.running = false;
        state.cron = None;
        info!("scheduler stopped");
        Ok(())
    }

    pub fn status(&self) -> SchedulerStatus {
        let state = self.shared.state();
        SchedulerStatus {
            is_running: state.running,
            cron: state.cron.clone(),
            last_run: state.last_run,
            last_error: state.last_error.clone(),
            stats: state.stats.clone(),
        }
    }

    /// Runs a cycle now, alongside any timer-driven one.
    pub async fn trigger_check(&self, channel: Option<&str>) -> Result<CycleReport> {
        self.shared.run_recorded(channel).await
    }
}
