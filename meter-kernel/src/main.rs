/**
 * METER KERNEL - Process entry point of the meter bridge
 *
 * ROLE : Wires config, store, broker connection, event router, dispatcher and
 * the HTTP/WebSocket API together, then serves until the process stops.
 *
 * STARTUP : the broker connection is attempted in the background so the API
 * comes up even when the broker is down.
 */

use anyhow::Context;
use meter_kernel::broker::{ConnectionManager, RumqttDialer};
use meter_kernel::config::load_config;
use meter_kernel::dispatcher::CommandDispatcher;
use meter_kernel::fanout::FanOut;
use meter_kernel::health::HealthTracker;
use meter_kernel::http::{self, AppState};
use meter_kernel::router::EventRouter;
use meter_kernel::store::{JsonFileStore, MeterStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = Arc::new(load_config().await.context("loading configuration")?);
    info!(
        "broker {}:{} user={} password={}",
        cfg.mqtt.host,
        cfg.mqtt.port,
        cfg.mqtt.user.as_deref().unwrap_or("<none>"),
        cfg.mqtt.masked_password()
    );

    let store = Arc::new(
        JsonFileStore::new(&cfg.store.path).with_context(|| format!("opening store {}", cfg.store.path))?,
    );

    let codec = cfg.mqtt.codec();
    let fanout = FanOut::default();
    let router = Arc::new(EventRouter::new(codec.clone(), fanout.clone(), store.clone()));

    let broker = ConnectionManager::new(
        Box::new(RumqttDialer::new(cfg.mqtt.clone())),
        codec.subscription_patterns(),
        cfg.reconnect.policy(),
    );
    broker.start(router.clone());

    let store: Arc<dyn MeterStore> = store;
    let app_state = AppState {
        cfg: cfg.clone(),
        store,
        broker: broker.clone(),
        router,
        dispatcher: CommandDispatcher::new(broker.clone(), codec.clone()),
        fanout,
        codec,
        health_tracker: HealthTracker::new(),
    };
    let app = http::build_router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("http server")?;

    broker.shutdown().await;
    info!("bye");
    Ok(())
}
