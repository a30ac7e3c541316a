/**
 * QUBIX KERNEL - Point d'entrée du serveur de vivacité
 *
 * RÔLE : Orchestration des modules : config, store, hub, tracker, HTTP.
 * Bootstrap avec logging tracing et arrêt propre sur Ctrl-C.
 */

use anyhow::Context;
use qubix_kernel::config::load_config;
use qubix_kernel::health::HealthTracker;
use qubix_kernel::http::{build_router, AppState};
use qubix_kernel::{EventHub, LivenessTracker, MemoryStore};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = load_config().await;

    // store en mémoire, seedé depuis le disque si présent
    let seed_path = std::env::var("QUBIX_STORE_SEED").unwrap_or_else(|_| "./data/providers.json".into());
    let store = match MemoryStore::load_seed(&seed_path).await {
        Ok(store) => store,
        Err(e) => {
            warn!("[kernel] failed to load seed {}: {:#}", seed_path, e);
            MemoryStore::new()
        }
    };
    let store = Arc::new(store);

    // hub temps réel + sweep des connexions inactives
    let hub = EventHub::new(cfg.hub_config());
    hub.start_eviction_sweep();

    // tracker de vivacité (sweep timeout immédiat puis périodique)
    let tracker = LivenessTracker::new(store, Arc::new(hub.clone()), cfg.liveness_config());
    tracker.start();

    let app_state = AppState {
        hub: hub.clone(),
        tracker: tracker.clone(),
        health_tracker: HealthTracker::new(),
    };
    let app = build_router(app_state);

    let addr = cfg.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("[kernel] listening on http://{addr}");

    // les WebSockets sont fermées avant que serve() attende les requêtes en cours
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("[kernel] ctrl-c handler failed: {}", e);
            }
            info!("[kernel] shutdown requested");
            tracker.stop();
            hub.shutdown();
        })
        .await
        .context("http server")?;

    info!("[kernel] stopped");
    Ok(())
}
