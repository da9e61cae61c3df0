// Host background-execution boundary.
//
// The host owns when background work may run. Handlers are registered once
// per task id; each run receives a `BackgroundGrant` carrying the window's
// expiration signal and a completion callback. `TokioHost` is the in-process
// host used by the standalone binary: it fires runs from timers and expires
// each grant after a fixed execution budget.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SyncError;

/// One background run, as returned by a handler.
pub type BackgroundRun = Pin<Box<dyn Future<Output = ()> + Send>>;

pub type BackgroundHandler = Arc<dyn Fn(BackgroundGrant) -> BackgroundRun + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    #[error("background task `{0}` is not registered")]
    UnknownTask(String),
    #[error("background host unavailable: {0}")]
    Unavailable(String),
}

impl From<HostError> for SyncError {
    fn from(error: HostError) -> Self {
        SyncError::Host(error.to_string())
    }
}

/// Abstraction over the platform's background scheduler.
pub trait BackgroundHost: Send + Sync + 'static {
    /// Install the handler invoked for every run of `task_id`.
    fn register(&self, task_id: &str, handler: BackgroundHandler) -> Result<(), HostError>;

    /// Request a run of `task_id` no earlier than `earliest`. Replaces any
    /// pending request for the same task.
    fn schedule(&self, task_id: &str, earliest: DateTime<Utc>) -> Result<(), HostError>;
}

// ── Grant ───────────────────────────────────────────────────────────

/// One bounded execution window. Completing it tells the host whether the
/// run succeeded; dropping it uncompleted reports failure.
pub struct BackgroundGrant {
    task_id: String,
    expired: watch::Receiver<bool>,
    completion: Option<oneshot::Sender<bool>>,
}

/// Host side of a grant.
pub struct GrantController {
    expire_tx: watch::Sender<bool>,
    completion: oneshot::Receiver<bool>,
}

impl BackgroundGrant {
    pub fn new(task_id: impl Into<String>) -> (Self, GrantController) {
        let (expire_tx, expired) = watch::channel(false);
        let (completion_tx, completion) = oneshot::channel();
        (
            Self { task_id: task_id.into(), expired, completion: Some(completion_tx) },
            GrantController { expire_tx, completion },
        )
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn is_expired(&self) -> bool {
        *self.expired.borrow()
    }

    /// Flips to `true` when the host reclaims the window.
    pub fn expiration(&self) -> watch::Receiver<bool> {
        self.expired.clone()
    }

    pub fn complete(mut self, success: bool) {
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(success);
        }
    }
}

impl Drop for BackgroundGrant {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            warn!(task_id = %self.task_id, "background grant dropped without completion");
            let _ = completion.send(false);
        }
    }
}

impl GrantController {
    pub fn expire(&self) {
        self.expire_tx.send_replace(true);
    }

    /// Resolves with the handler's reported outcome, or `None` if the grant
    /// vanished without reporting.
    pub async fn completed(&mut self) -> Option<bool> {
        (&mut self.completion).await.ok()
    }
}

// ── Tokio host ──────────────────────────────────────────────────────

#[derive(Clone)]
pub struct TokioHost {
    inner: Arc<HostInner>,
}

struct HostInner {
    budget: Duration,
    handlers: Mutex<HashMap<String, BackgroundHandler>>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
    requests: Mutex<Vec<(String, DateTime<Utc>)>>,
    runs_completed: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TokioHost {
    /// `budget` is how long each grant stays valid before it is expired.
    pub fn new(budget: Duration) -> Self {
        Self {
            inner: Arc::new(HostInner {
                budget,
                handlers: Mutex::new(HashMap::new()),
                timers: Mutex::new(HashMap::new()),
                requests: Mutex::new(Vec::new()),
                runs_completed: AtomicUsize::new(0),
            }),
        }
    }

    /// Every schedule request accepted so far, oldest first.
    pub fn scheduled_requests(&self) -> Vec<(String, DateTime<Utc>)> {
        lock(&self.inner.requests).clone()
    }

    pub fn pending_timers(&self) -> usize {
        lock(&self.inner.timers).values().filter(|timer| !timer.is_finished()).count()
    }

    pub fn runs_completed(&self) -> usize {
        self.inner.runs_completed.load(Ordering::SeqCst)
    }

    /// Cancel every pending timer. Runs already started finish normally.
    pub fn shutdown(&self) {
        for (task_id, timer) in lock(&self.inner.timers).drain() {
            timer.abort();
            debug!(%task_id, "background timer cancelled");
        }
    }
}

impl BackgroundHost for TokioHost {
    fn register(&self, task_id: &str, handler: BackgroundHandler) -> Result<(), HostError> {
        lock(&self.inner.handlers).insert(task_id.to_string(), handler);
        debug!(%task_id, "background handler registered");
        Ok(())
    }

    fn schedule(&self, task_id: &str, earliest: DateTime<Utc>) -> Result<(), HostError> {
        let handler = lock(&self.inner.handlers)
            .get(task_id)
            .cloned()
            .ok_or_else(|| HostError::UnknownTask(task_id.to_string()))?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|error| HostError::Unavailable(error.to_string()))?;

        let delay = (earliest - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let weak = Arc::downgrade(&self.inner);
        let owned_id = task_id.to_string();
        let timer = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            tokio::spawn(run_grant(weak, owned_id, handler));
        });

        lock(&self.inner.requests).push((task_id.to_string(), earliest));
        if let Some(previous) = lock(&self.inner.timers).insert(task_id.to_string(), timer) {
            previous.abort();
        }
        debug!(
            %task_id,
            %earliest,
            delay_ms = delay.as_millis() as u64,
            "background run scheduled"
        );
        Ok(())
    }
}

impl Drop for HostInner {
    fn drop(&mut self) {
        for (_, timer) in lock(&self.timers).drain() {
            timer.abort();
        }
    }
}

async fn run_grant(host: Weak<HostInner>, task_id: String, handler: BackgroundHandler) {
    let Some(budget) = host.upgrade().map(|inner| inner.budget) else {
        return;
    };

    let (grant, mut controller) = BackgroundGrant::new(task_id.clone());
    info!(%task_id, budget_ms = budget.as_millis() as u64, "background run granted");
    let run = tokio::spawn(handler(grant));

    let outcome = match tokio::time::timeout(budget, controller.completed()).await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(%task_id, "background window expired");
            controller.expire();
            controller.completed().await
        }
    };
    if let Err(error) = run.await {
        warn!(%task_id, %error, "background handler task failed");
    }

    info!(%task_id, success = ?outcome, "background run finished");
    if let Some(inner) = host.upgrade() {
        inner.runs_completed.fetch_add(1, Ordering::SeqCst);
    }
}
