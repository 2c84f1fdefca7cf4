//! Turns scheduled and on-demand triggers into serialized backup runs.
//!
//! A single worker task owns every run. Triggers arrive over a channel with
//! room for one pending request: a trigger that arrives while a run is active
//! becomes the pending follow-up run, and any further trigger before that run
//! starts is merged into it.

mod schedule;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

pub use schedule::Schedule;

use crate::orchestrator::{BackupRun, Orchestrator, RunStatus, TriggerSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOutcome {
    /// The worker was idle; a run starts now.
    Started,
    /// A run is active or already queued; this trigger is served by the next run.
    Coalesced,
    /// The scheduler is shutting down.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running {
        since: DateTime<Utc>,
        trigger: TriggerSource,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct LastRun {
    pub id: Uuid,
    pub trigger: TriggerSource,
    pub status: RunStatus,
    pub artifact: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&BackupRun> for LastRun {
    fn from(run: &BackupRun) -> Self {
        Self {
            id: run.id,
            trigger: run.trigger,
            status: run.status(),
            artifact: run.artifact_name.clone(),
            finished_at: run.finished_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    #[serde(flatten)]
    pub state: RunState,
    pub pending: bool,
    pub next_scheduled: Option<DateTime<Utc>>,
    pub last_run: Option<LastRun>,
}

#[derive(Debug, Clone)]
struct Published {
    state: RunState,
    next_scheduled: Option<DateTime<Utc>>,
    last_run: Option<LastRun>,
}

/// Triggers accepted into the channel and not yet fully run, counting the one
/// in progress.
type Outstanding = Arc<Mutex<usize>>;

fn lock(outstanding: &Outstanding) -> MutexGuard<'_, usize> {
    outstanding.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cloneable entry point for submitting triggers and reading status.
#[derive(Clone)]
pub struct TriggerHandle {
    trigger_tx: mpsc::Sender<TriggerSource>,
    status_rx: watch::Receiver<Published>,
    outstanding: Outstanding,
}

impl TriggerHandle {
    /// Submits a trigger without waiting for the run.
    pub fn trigger(&self, source: TriggerSource) -> TriggerOutcome {
        let outcome = {
            let mut outstanding = lock(&self.outstanding);
            match self.trigger_tx.try_send(source) {
                Ok(()) => {
                    *outstanding += 1;
                    if *outstanding == 1 {
                        TriggerOutcome::Started
                    } else {
                        TriggerOutcome::Coalesced
                    }
                }
                Err(mpsc::error::TrySendError::Full(_)) => TriggerOutcome::Coalesced,
                Err(mpsc::error::TrySendError::Closed(_)) => TriggerOutcome::Rejected,
            }
        };
        match outcome {
            TriggerOutcome::Started => info!(%source, "Backup triggered"),
            TriggerOutcome::Coalesced => {
                info!(%source, "Backup already in progress; trigger merged into the next run")
            }
            TriggerOutcome::Rejected => {
                warn!(%source, "Trigger rejected; scheduler is shutting down")
            }
        }
        outcome
    }

    pub fn status(&self) -> SchedulerStatus {
        let published = self.status_rx.borrow().clone();
        SchedulerStatus {
            state: published.state,
            pending: self.trigger_tx.capacity() == 0,
            next_scheduled: published.next_scheduled,
            last_run: published.last_run,
        }
    }
}

pub struct Scheduler {
    handle: TriggerHandle,
    worker: JoinHandle<()>,
    timer: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawns the worker and, when `schedule` is set, the timer that feeds it.
    pub fn start(
        orchestrator: Arc<Orchestrator>,
        schedule: Option<Schedule>,
        shutdown: CancellationToken,
    ) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (status_tx, status_rx) = watch::channel(Published {
            state: RunState::Idle,
            next_scheduled: None,
            last_run: None,
        });
        let status_tx = Arc::new(status_tx);
        let outstanding = Outstanding::default();
        let handle = TriggerHandle {
            trigger_tx,
            status_rx,
            outstanding: outstanding.clone(),
        };

        let worker = tokio::spawn(worker_loop(
            orchestrator,
            trigger_rx,
            outstanding,
            status_tx.clone(),
            shutdown.clone(),
        ));
        let timer = schedule.map(|schedule| {
            tokio::spawn(timer_loop(schedule, handle.clone(), status_tx, shutdown))
        });

        Self {
            handle,
            worker,
            timer,
        }
    }

    pub fn handle(&self) -> TriggerHandle {
        self.handle.clone()
    }

    /// Waits for the worker to finish its current run after shutdown.
    pub async fn wait(self) {
        if let Some(timer) = self.timer {
            if let Err(e) = timer.await {
                error!("Schedule timer task failed: {}", e);
            }
        }
        if let Err(e) = self.worker.await {
            error!("Backup worker task failed: {}", e);
        }
    }
}

async fn worker_loop(
    orchestrator: Arc<Orchestrator>,
    mut trigger_rx: mpsc::Receiver<TriggerSource>,
    outstanding: Outstanding,
    status_tx: Arc<watch::Sender<Published>>,
    shutdown: CancellationToken,
) {
    loop {
        let source = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            received = trigger_rx.recv() => match received {
                Some(source) => source,
                None => break,
            },
        };

        status_tx.send_modify(|published| {
            published.state = RunState::Running {
                since: Utc::now(),
                trigger: source,
            }
        });
        // A run in progress is never interrupted by shutdown.
        let run = orchestrator.run_backup(source).await;
        *lock(&outstanding) -= 1;
        status_tx.send_modify(|published| {
            published.state = RunState::Idle;
            published.last_run = Some(LastRun::from(&run));
        });
    }

    trigger_rx.close();
    while let Ok(source) = trigger_rx.try_recv() {
        *lock(&outstanding) -= 1;
        warn!(%source, "Discarding pending trigger at shutdown");
    }
    info!("Backup worker stopped");
}

async fn timer_loop(
    schedule: Schedule,
    handle: TriggerHandle,
    status_tx: Arc<watch::Sender<Published>>,
    shutdown: CancellationToken,
) {
    if schedule.ignores_calendar_fields() {
        warn!(%schedule, "CRON day-of-month, month and day-of-week fields are ignored");
    }
    let mut last_fire: Option<DateTime<Utc>> = None;
    loop {
        let now = Utc::now();
        let from = last_fire.map_or(now, |last| last.max(now));
        let Some(next) = schedule.next_after(from) else {
            error!(%schedule, "No further fire time can be computed; stopping the schedule");
            break;
        };
        status_tx.send_modify(|published| published.next_scheduled = Some(next));
        info!(
            "Next scheduled run: {}",
            next.with_timezone(&schedule.timezone()).format("%Y-%m-%d %H:%M:%S %Z")
        );

        let wait = (next - now).to_std().unwrap_or_default();
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
        last_fire = Some(next);
        handle.trigger(TriggerSource::Scheduled);
    }
    status_tx.send_modify(|published| published.next_scheduled = None);
}
