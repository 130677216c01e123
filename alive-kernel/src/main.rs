/**
 * ALIVE KERNEL - Point d'entrée du serveur
 *
 * RÔLE : Bootstrap : config, logs, chargement des boxes, broker, keepalive,
 * maintenance, HTTP. Ctrl-C annule le token partagé ; la maintenance fait
 * ses sauvegardes d'arrêt avant la sortie du process.
 */

use alive_kernel::broker::{spawn_keepalives, Broker};
use alive_kernel::config::load_config;
use alive_kernel::dashboard::Dashboard;
use alive_kernel::http::{build_router, AppState};
use alive_kernel::maintenance::Scheduler;
use alive_kernel::persistence::SnapshotFile;
use alive_kernel::store::BoxStore;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Ok si .env n'existe pas
    dotenvy::dotenv().ok();

    let (cfg, config_problem) = load_config().await;

    let default_filter = if cfg.debug { "alive_kernel=debug" } else { "alive_kernel=info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(e) = config_problem {
        warn!("{e}; using default config");
    }

    // boxes : un état inconnu au démarrage est fatal
    let snapshots = SnapshotFile::in_dir(&cfg.data_path);
    snapshots
        .ensure_exists()
        .await
        .with_context(|| format!("cannot prepare data file {}", snapshots.path().display()))?;
    let loaded = snapshots
        .load()
        .await
        .with_context(|| format!("cannot load boxes from {}", snapshots.path().display()))?;
    let store = BoxStore::from_snapshot(loaded);

    let shutdown = CancellationToken::new();
    let broker = Broker::start(cfg.mailbox_capacity(), shutdown.clone());
    let keepalive = spawn_keepalives(broker.clone(), cfg.keepalive_every(), shutdown.clone());
    let dashboard = Dashboard::new(store, broker);

    let scheduler = Scheduler::new(dashboard.clone(), snapshots, cfg.maintenance());
    let maintenance = tokio::spawn(scheduler.run(shutdown.clone()));

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(e) => error!("cannot listen for ctrl-c: {e}"),
        }
        ctrl_c.cancel();
    });

    let app = build_router(AppState {
        dashboard,
        shutdown: shutdown.clone(),
    });
    let listener = TcpListener::bind(&cfg.listen)
        .await
        .with_context(|| format!("cannot listen on {}", cfg.listen))?;
    info!("listening on http://{}", cfg.listen);

    let graceful = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { graceful.cancelled().await })
        .await;
    // serveur arrêté (ou en erreur) : tout le reste s'arrête aussi
    shutdown.cancel();

    if let Err(e) = maintenance.await {
        error!("maintenance task failed: {e}");
    }
    if let Err(e) = keepalive.await {
        error!("keepalive task failed: {e}");
    }
    served.context("http server failed")?;
    info!("bye");
    Ok(())
}
