// Background full-sync scheduler.
//
// Runs a full resync of every entity kind at start-up, when the app returns
// to the foreground, and from host-granted background windows. Kinds are
// fetched through the engine (so they coalesce with screen fetches) with
// bounded parallelism, and a failing kind never blocks the others.
//
// Every run, foreground or background, reschedules the next background run
// exactly once, whatever the outcome. A background run does so before its
// grant is completed.

pub mod host;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use tracker_common::kind::{EntityKind, FetchKey};

use crate::config::BackgroundSettings;
use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::remote::RemoteRepository;

pub use host::{
    BackgroundGrant, BackgroundHandler, BackgroundHost, BackgroundRun, GrantController, HostError,
    TokioHost,
};

// ── Configuration & reporting ───────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub task_id: String,
    /// Earliest delay between background runs.
    pub interval: Duration,
    pub max_parallel_fetches: usize,
    /// Kinds covered by a full sync, in dispatch order.
    pub kinds: Vec<EntityKind>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&BackgroundSettings::default())
    }
}

impl From<&BackgroundSettings> for SchedulerConfig {
    fn from(settings: &BackgroundSettings) -> Self {
        Self {
            task_id: settings.task_id.clone(),
            interval: settings.interval(),
            max_parallel_fetches: settings.max_parallel_fetches.max(1),
            kinds: EntityKind::ALL.to_vec(),
        }
    }
}

/// Rows fetched per kind by a successful full sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub synced: Vec<(EntityKind, usize)>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTrigger {
    Startup,
    AppActive,
    Background,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded { kinds: usize },
    Failed { reason: String },
    Expired,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_trigger: Option<RunTrigger>,
    pub last_outcome: Option<RunOutcome>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub runs: u64,
}

// ── Scheduler ───────────────────────────────────────────────────────

pub struct BackgroundSyncScheduler<R: RemoteRepository, H: BackgroundHost> {
    inner: Arc<SchedulerInner<R, H>>,
}

impl<R: RemoteRepository, H: BackgroundHost> Clone for BackgroundSyncScheduler<R, H> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

struct SchedulerInner<R: RemoteRepository, H: BackgroundHost> {
    engine: Arc<SyncEngine<R>>,
    host: Arc<H>,
    config: SchedulerConfig,
    /// Full syncs in progress.
    running: AtomicUsize,
    status_tx: watch::Sender<SchedulerStatus>,
}

impl<R: RemoteRepository, H: BackgroundHost> BackgroundSyncScheduler<R, H> {
    pub fn new(engine: Arc<SyncEngine<R>>, host: Arc<H>, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                engine,
                host,
                config,
                running: AtomicUsize::new(0),
                status_tx: watch::Sender::new(SchedulerStatus::default()),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn status(&self) -> SchedulerStatus {
        self.inner.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SchedulerStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Whether a full sync is currently running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst) > 0
    }

    /// Install the background handler with the host. The handler holds a
    /// weak reference, so the host never keeps the scheduler alive.
    pub fn register(&self) -> Result<(), SyncError> {
        let weak: Weak<SchedulerInner<R, H>> = Arc::downgrade(&self.inner);
        let handler: BackgroundHandler = Arc::new(move |grant: BackgroundGrant| -> BackgroundRun {
            let weak = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(inner) => {
                        let scheduler = BackgroundSyncScheduler { inner };
                        scheduler.handle_background_run(grant).await;
                    }
                    None => grant.complete(false),
                }
            })
        });
        self.inner.host.register(&self.inner.config.task_id, handler)?;
        Ok(())
    }

    /// Process start: register, run one full sync, then schedule the first
    /// background run regardless of the outcome.
    pub async fn start(&self) -> Result<SyncReport, SyncError> {
        self.register()?;
        let _running = RunningGuard::enter(&self.inner.running);
        self.run(RunTrigger::Startup, None).await
    }

    /// Suspended → active transition. Returns `None` without doing anything
    /// when a run is already in progress.
    pub async fn on_app_active(&self) -> Option<Result<SyncReport, SyncError>> {
        let Some(_running) = RunningGuard::exclusive(&self.inner.running) else {
            debug!("full sync already running, skipping foreground trigger");
            return None;
        };
        Some(self.run(RunTrigger::AppActive, None).await)
    }

    /// Entry point for a host-granted background window. Runs even when a
    /// foreground sync is in progress.
    pub async fn handle_background_run(&self, grant: BackgroundGrant) {
        let _running = RunningGuard::enter(&self.inner.running);
        let result = self.run(RunTrigger::Background, Some(grant.expiration())).await;
        grant.complete(result.is_ok());
    }

    /// Resync every configured kind, then reschedule the next background
    /// run whatever the outcome.
    pub async fn perform_full_sync(&self) -> Result<SyncReport, SyncError> {
        let _running = RunningGuard::enter(&self.inner.running);
        let reschedule = RescheduleOnExit::arm(self.clone());
        let result = self.perform_full_sync_until(None).await;
        reschedule.fire();
        result
    }

    /// Resync every configured kind, giving up when `expiration` flips to
    /// `true`. Kinds already merged stay merged. Does not reschedule.
    pub async fn perform_full_sync_until(
        &self,
        mut expiration: Option<watch::Receiver<bool>>,
    ) -> Result<SyncReport, SyncError> {
        let started_at = Utc::now();
        let kinds = self.inner.config.kinds.clone();
        let semaphore = Arc::new(Semaphore::new(self.inner.config.max_parallel_fetches.max(1)));

        let mut tasks = JoinSet::new();
        for kind in kinds.iter().copied() {
            let engine = Arc::clone(&self.inner.engine);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move { (kind, sync_kind(&engine, &semaphore, kind).await) });
        }

        let mut synced = Vec::new();
        let mut failed = Vec::new();
        loop {
            let step = match expiration.as_mut() {
                Some(expiration) => tokio::select! {
                    biased;
                    expired = async { expiration.wait_for(|expired| *expired).await.is_ok() } => {
                        if expired { Step::Expired } else { Step::SignalLost }
                    }
                    joined = tasks.join_next() => Step::Joined(joined),
                },
                None => Step::Joined(tasks.join_next().await),
            };

            match step {
                Step::Expired => {
                    // Only the waiters are aborted. Coalesced fetches already
                    // started run to completion on their own tasks and may
                    // still merge their batch after the grant ends.
                    tasks.abort_all();
                    let completed: Vec<EntityKind> = synced.iter().map(|(kind, _)| *kind).collect();
                    warn!(completed = completed.len(), total = kinds.len(), "full sync expired");
                    return Err(SyncError::Expired { completed, total: kinds.len() });
                }
                Step::SignalLost => expiration = None,
                Step::Joined(None) => break,
                Step::Joined(Some(Ok((kind, Ok(count))))) => synced.push((kind, count)),
                Step::Joined(Some(Ok((kind, Err(error))))) => {
                    warn!(%kind, %error, "kind failed during full sync");
                    failed.push((kind, error.to_string()));
                }
                Step::Joined(Some(Err(error))) => {
                    warn!(%error, "full sync task ended abnormally");
                }
            }
        }

        for kind in &kinds {
            let accounted = synced.iter().any(|(k, _)| k == kind)
                || failed.iter().any(|(k, _)| k == kind);
            if !accounted {
                failed.push((*kind, "sync task aborted".to_string()));
            }
        }

        if failed.is_empty() {
            Ok(SyncReport { synced, started_at, finished_at: Utc::now() })
        } else {
            let succeeded = synced.into_iter().map(|(kind, _)| kind).collect();
            Err(SyncError::Partial { succeeded, failed })
        }
    }

    /// Ask the host for the next background run, `interval` from now.
    pub fn schedule_next_run(&self) -> Result<DateTime<Utc>, SyncError> {
        let interval = chrono::Duration::from_std(self.inner.config.interval)
            .map_err(|error| SyncError::Host(format!("invalid background interval: {error}")))?;
        let next = Utc::now() + interval;
        self.inner.host.schedule(&self.inner.config.task_id, next)?;
        self.inner.status_tx.send_modify(|status| status.next_run_at = Some(next));
        info!(
            task_id = %self.inner.config.task_id,
            next_run_at = %next,
            "background sync scheduled"
        );
        Ok(next)
    }

    async fn run(
        &self,
        trigger: RunTrigger,
        expiration: Option<watch::Receiver<bool>>,
    ) -> Result<SyncReport, SyncError> {
        info!(?trigger, "full sync starting");
        let reschedule = RescheduleOnExit::arm(self.clone());
        let result = self.perform_full_sync_until(expiration).await;
        reschedule.fire();

        let outcome = match &result {
            Ok(report) => {
                info!(?trigger, kinds = report.synced.len(), "full sync finished");
                RunOutcome::Succeeded { kinds: report.synced.len() }
            }
            Err(SyncError::Expired { .. }) => RunOutcome::Expired,
            Err(error) => {
                warn!(?trigger, %error, "full sync failed");
                RunOutcome::Failed { reason: error.to_string() }
            }
        };
        self.inner.status_tx.send_modify(|status| {
            status.last_run_at = Some(Utc::now());
            status.last_trigger = Some(trigger);
            status.last_outcome = Some(outcome);
            status.runs += 1;
        });
        result
    }
}

enum Step {
    Joined(Option<Result<(EntityKind, Result<usize, SyncError>), tokio::task::JoinError>>),
    Expired,
    SignalLost,
}

async fn sync_kind<R: RemoteRepository>(
    engine: &SyncEngine<R>,
    semaphore: &Semaphore,
    kind: EntityKind,
) -> Result<usize, SyncError> {
    let _permit =
        semaphore.acquire().await.map_err(|_| SyncError::FetchAborted(kind.to_string()))?;
    let rows = engine.fetch(&FetchKey::all(kind)).await?;
    engine.store().record_synced(kind, Utc::now()).map_err(SyncError::store)?;
    debug!(%kind, rows = rows.len(), "kind synced");
    Ok(rows.len())
}

/// Counts one in-progress full sync until dropped.
struct RunningGuard<'a>(&'a AtomicUsize);

impl<'a> RunningGuard<'a> {
    /// Enter only if no other full sync is running.
    fn exclusive(count: &'a AtomicUsize) -> Option<Self> {
        count.compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst).ok().map(|_| Self(count))
    }

    /// Enter regardless of other runs.
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Reschedules the next background run exactly once: explicitly through
/// `fire`, or on drop if the run was cancelled before reaching it.
struct RescheduleOnExit<R: RemoteRepository, H: BackgroundHost> {
    scheduler: BackgroundSyncScheduler<R, H>,
    armed: bool,
}

impl<R: RemoteRepository, H: BackgroundHost> RescheduleOnExit<R, H> {
    fn arm(scheduler: BackgroundSyncScheduler<R, H>) -> Self {
        Self { scheduler, armed: true }
    }

    fn fire(mut self) {
        self.reschedule();
    }

    fn reschedule(&mut self) {
        if !std::mem::take(&mut self.armed) {
            return;
        }
        if let Err(error) = self.scheduler.schedule_next_run() {
            warn!(%error, "failed to reschedule background sync");
        }
    }
}

impl<R: RemoteRepository, H: BackgroundHost> Drop for RescheduleOnExit<R, H> {
    fn drop(&mut self) {
        self.reschedule();
    }
}
