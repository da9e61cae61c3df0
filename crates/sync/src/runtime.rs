// Standalone runtime: wires store, remote, engine, host and scheduler.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracker_common::auth::AuthProvider;

use crate::config::{RemoteBackend, SyncSettings};
use crate::engine::SyncEngine;
use crate::remote::{HttpRepository, InMemoryRepository, RemoteRepository};
use crate::scheduler::{BackgroundSyncScheduler, SchedulerConfig, TokioHost};
use crate::store::LocalStore;

/// Run until Ctrl-C.
pub async fn run_standalone(settings: SyncSettings) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(());
    });
    run_until_shutdown(settings, shutdown_rx).await
}

/// Run the start-up sync, then serve background runs until `shutdown_rx`
/// fires.
pub async fn run_until_shutdown(
    settings: SyncSettings,
    shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let auth = settings.remote.auth().context("invalid remote.user_id")?;
    match auth.current_user_id() {
        Ok(user) => info!(%user, "optimistic writes enabled"),
        Err(error) => info!(%error, "optimistic writes disabled"),
    }

    let store_path = settings
        .store
        .resolved_path()
        .context("could not determine home directory for the local store")?;
    let store = LocalStore::open(&store_path, settings.store.merge_policy)?;
    info!(
        store_path = %store_path.display(),
        backend = ?settings.remote.backend,
        "sync runtime starting"
    );

    match settings.remote.backend {
        RemoteBackend::Memory => {
            serve(Arc::new(InMemoryRepository::new()), store, &settings, shutdown_rx).await
        }
        RemoteBackend::Http => {
            let base_url = settings
                .remote
                .base_url
                .as_deref()
                .context("remote.base_url is required for the http backend")?;
            let remote = HttpRepository::new(
                base_url,
                settings.remote.auth_token.clone(),
                settings.remote.poll_interval(),
            )
            .context("failed to build http repository")?;
            serve(Arc::new(remote), store, &settings, shutdown_rx).await
        }
    }
}

async fn serve<R: RemoteRepository>(
    remote: Arc<R>,
    store: LocalStore,
    settings: &SyncSettings,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let engine = Arc::new(SyncEngine::new(remote, store));
    let host = Arc::new(TokioHost::new(settings.background.execution_budget()));
    let scheduler = BackgroundSyncScheduler::new(
        engine,
        Arc::clone(&host),
        SchedulerConfig::from(&settings.background),
    );

    match scheduler.start().await {
        Ok(report) => info!(kinds = report.synced.len(), "start-up sync complete"),
        Err(error) => warn!(%error, "start-up sync incomplete"),
    }

    let _ = shutdown_rx.recv().await;
    host.shutdown();
    info!(runs = scheduler.status().runs, "sync runtime stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use tracker_common::kind::EntityKind;

    use super::*;
    use crate::store::MergePolicy;

    #[tokio::test]
    async fn memory_backend_syncs_and_stops_on_signal() {
        let dir = TempDir::new().unwrap();
        let mut settings = SyncSettings::default();
        settings.store.path = Some(dir.path().join("state").join("store.db"));

        let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
        shutdown_tx.send(()).unwrap();
        run_until_shutdown(settings.clone(), shutdown_rx).await.unwrap();

        let store =
            LocalStore::open(settings.store.path.as_ref().unwrap(), MergePolicy::LastWriteWins)
                .unwrap();
        for kind in EntityKind::ALL {
            assert!(store.last_synced_at(kind).unwrap().is_some(), "{kind} not synced");
        }
    }

    #[tokio::test]
    async fn http_backend_requires_base_url() {
        let dir = TempDir::new().unwrap();
        let mut settings = SyncSettings::default();
        settings.store.path = Some(dir.path().join("store.db"));
        settings.remote.backend = RemoteBackend::Http;

        let (_shutdown_tx, shutdown_rx) = broadcast::channel(4);
        let error = run_until_shutdown(settings, shutdown_rx).await.unwrap_err();
        assert!(error.to_string().contains("remote.base_url is required"));
    }

    #[tokio::test]
    async fn blank_user_id_is_rejected_before_start() {
        let dir = TempDir::new().unwrap();
        let mut settings = SyncSettings::default();
        settings.store.path = Some(dir.path().join("store.db"));
        settings.remote.user_id = Some(" ".into());

        let (_shutdown_tx, shutdown_rx) = broadcast::channel(4);
        let error = run_until_shutdown(settings, shutdown_rx).await.unwrap_err();
        assert!(error.to_string().contains("invalid remote.user_id"));
        assert!(!dir.path().join("store.db").exists());
    }
}
