//! Web server for the dashboard API and observer channel

use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    routing::{get, post},
};
use tokio::sync::oneshot;
use tower_http::cors::CorsLayer;

use super::broadcaster::ChangeDetector;
use super::handlers;
use super::hub::{Hub, HubHandle};
use super::websocket;
use crate::config::ServeSettings;
use crate::status::StatusBuilder;
use crate::Result;

/// How long in-flight requests get to finish after a shutdown signal.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Snapshot builder over the town's adapters
    pub builder: Arc<StatusBuilder>,
    /// Observer hub fed by the change detector
    pub hub: HubHandle,
}

impl AppState {
    pub fn new(builder: Arc<StatusBuilder>, hub: HubHandle) -> Self {
        Self { builder, hub }
    }
}

/// What `gt serve` needs to run.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub town_root: PathBuf,
    pub settings: ServeSettings,
    /// Allow any origin
    pub dev: bool,
}

/// Routes under `/api/v1`.
pub fn router(state: AppState, dev: bool) -> Router {
    let api = Router::new()
        .route("/status", get(handlers::get_status))
        .route("/status/summary", get(handlers::get_summary))
        .route("/rigs", get(handlers::list_rigs))
        .route("/rigs/{name}", get(handlers::get_rig))
        .route("/rigs/{name}/agents", get(handlers::get_rig_agents))
        .route("/agents", get(handlers::list_agents))
        .route("/agents/{*address}", get(handlers::get_agent))
        .route("/convoys", get(handlers::list_convoys))
        .route("/convoys/{id}", get(handlers::get_convoy))
        .route("/mail/inbox", get(handlers::mayor_inbox))
        .route("/mail/inbox/{*address}", get(handlers::agent_inbox))
        .route("/mail/count", get(handlers::mail_count))
        .route("/mail/messages/{id}", get(handlers::get_message))
        .route("/mail/messages/{id}/read", post(handlers::mark_read))
        .route("/mail/search", post(handlers::search_mail))
        .route("/events", get(handlers::list_events))
        .route("/doctor", get(handlers::run_doctor))
        .route("/doctor/{check}", get(handlers::run_check))
        .route("/doctor/{check}/fix", post(handlers::fix_check))
        .route("/ws", get(websocket::ws_handler));

    let app = Router::new().nest("/api/v1", api).with_state(state);
    if dev {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Start the dashboard server and change detector; returns after shutdown.
pub async fn start_server(options: ServeOptions) -> Result<()> {
    let builder = Arc::new(StatusBuilder::for_town(&options.town_root));
    let hub = Hub::spawn();

    let detector = Arc::new(ChangeDetector::new(
        Arc::clone(&builder),
        Arc::new(hub.clone()),
    ));
    let detector = detector.start(options.settings.poll_interval.value);

    let app = router(AppState::new(builder, hub), options.dev);

    let addr = options.settings.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(
        address = %addr,
        host_source = %options.settings.host.source,
        port_source = %options.settings.port.source,
        poll_interval_secs = options.settings.poll_interval.value.as_secs(),
        dev = options.dev,
        "dashboard listening"
    );

    let (signalled_tx, signalled_rx) = oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = signalled_tx.send(());
        })
        .into_future();
    let mut server = std::pin::pin!(server);

    let served = tokio::select! {
        result = &mut server => result,
        _ = async {
            if signalled_rx.await.is_ok() {
                tokio::time::sleep(SHUTDOWN_TIMEOUT).await;
            } else {
                std::future::pending::<()>().await;
            }
        } => {
            tracing::warn!(timeout_secs = SHUTDOWN_TIMEOUT.as_secs(), "shutdown window elapsed, closing remaining connections");
            Ok(())
        }
    };

    detector.stop().await;
    served?;
    tracing::info!("dashboard stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("shutdown signal received");
}
