//! HTTP and WebSocket surface for robots and dashboards.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::area::AreaRegistry;
use crate::config::ServeConfig;
use crate::error::ServeError;
use crate::firmware::FirmwareCatalog;
use crate::persist::Persister;
use crate::roster::FleetRoster;
use crate::sync_log::SyncLog;
use crate::types::{AreaId, ItemId, RobotReport};
use crate::work_mgr::WorkManager;

/// Upper bound on one blocking wait for sync changes.
const SYNC_WAIT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<WorkManager>,
    pub roster: Arc<FleetRoster>,
    pub firmware: Arc<FirmwareCatalog>,
    pub sync: Arc<SyncLog>,
}

#[derive(Debug, Deserialize)]
struct ExportRequest {
    area: AreaId,
    item: ItemId,
    delta: i64,
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    manager_running: bool,
    robots: usize,
    offline_robots: usize,
    sync_entries: usize,
    firmware_version: u32,
}

/// Routes under `prefix` (`""` or `/segment...`).
pub fn router(state: AppState, prefix: &str) -> Router {
    let api = Router::new()
        .route("/report", post(post_report))
        .route("/kernel", get(get_kernel))
        .route("/version", get(get_version))
        .route("/export", post(post_export))
        .route("/sync", get(get_sync))
        .route("/health", get(get_health))
        .with_state(state);
    if prefix.is_empty() {
        api
    } else {
        Router::new().nest(prefix, api)
    }
}

/// Load state, start the work manager and serve until Ctrl-C.
pub async fn run(config: ServeConfig) -> Result<(), ServeError> {
    let sync = Arc::new(SyncLog::new());
    let persister = Persister::new(&config.state_dir, Arc::clone(&sync));
    let registry = AreaRegistry::load(&persister)?;
    let firmware = FirmwareCatalog::load(&config.firmware)?;
    info!(version = firmware.version(), path = %config.firmware.display(), "firmware ready");
    let manager = Arc::new(WorkManager::start(registry, persister)?);
    let roster = Arc::new(FleetRoster::new(Arc::clone(&sync)));

    let watcher = {
        let roster = Arc::clone(&roster);
        let timeout = config.offline_timeout;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval((timeout / 4).max(Duration::from_secs(1)));
            loop {
                tick.tick().await;
                roster.detect_offline(timeout);
            }
        })
    };

    let state = AppState {
        manager: Arc::clone(&manager),
        roster,
        firmware: Arc::new(firmware),
        sync,
    };
    let app = router(state, &config.route_prefix);
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!(addr = %config.bind, prefix = %config.route_prefix, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    watcher.abort();
    if tokio::task::spawn_blocking(move || manager.shutdown())
        .await
        .is_err()
    {
        error!("work manager shutdown panicked");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn internal_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
}

async fn post_report(State(state): State<AppState>, body: String) -> Response {
    let report: RobotReport = match serde_json::from_str(&body) {
        Ok(report) => report,
        Err(err) => {
            warn!(error = %err, "malformed report dropped");
            return (StatusCode::BAD_REQUEST, "malformed report").into_response();
        }
    };
    state.roster.record(&report);
    let version = report.version;
    let has_new_kernel = report.new_kernel;

    let manager = Arc::clone(&state.manager);
    let decision = match tokio::task::spawn_blocking(move || manager.decide(report)).await {
        Ok(Ok(decision)) => decision,
        // Logged by the work manager.
        Ok(Err(_)) => return internal_error(),
        Err(err) => {
            error!(error = %err, "decision task failed");
            return internal_error();
        }
    };

    let mut body = String::from("{");
    body.push_str(&decision.to_lua());
    if let Some(upgrade) = state.firmware.upgrade_for(version, has_new_kernel) {
        body.push_str(&upgrade);
    }
    body.push('}');
    ([(header::CONTENT_TYPE, "text/plain")], body).into_response()
}

async fn get_kernel(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain")],
        state.firmware.source().to_string(),
    )
        .into_response()
}

async fn get_version(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain")],
        state.firmware.version().to_string(),
    )
        .into_response()
}

async fn post_export(State(state): State<AppState>, body: String) -> Response {
    let request: ExportRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(err) => {
            warn!(error = %err, "malformed export request dropped");
            return (StatusCode::BAD_REQUEST, "malformed export request").into_response();
        }
    };
    info!(area = %request.area, item = %request.item, delta = request.delta, "export request");
    let manager = Arc::clone(&state.manager);
    let applied = tokio::task::spawn_blocking(move || {
        manager.adjust_export_demand(request.area, request.item, request.delta)
    })
    .await;
    match applied {
        Ok(Ok(applied)) => axum::Json(applied).into_response(),
        Ok(Err(err)) => {
            error!(error = %err, "export request failed");
            internal_error()
        }
        Err(err) => {
            error!(error = %err, "export task failed");
            internal_error()
        }
    }
}

async fn get_health(State(state): State<AppState>) -> Response {
    let health = Health {
        status: "ok",
        manager_running: state.manager.is_running(),
        robots: state.roster.len(),
        offline_robots: state.roster.offline_robots().len(),
        sync_entries: state.sync.len(),
        firmware_version: state.firmware.version(),
    };
    let status = if health.manager_running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, axum::Json(health)).into_response()
}

async fn get_sync(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| sync_session(socket, state.sync))
}

/// Push the catch-up diff, wait for the client's `"ok"`, then block until the
/// log changes and push the next diff.
async fn sync_session(socket: WebSocket, sync: Arc<SyncLog>) {
    let (mut sender, mut receiver) = socket.split();
    let mut since = 0;
    loop {
        let refresh = sync.refresh(since);
        if sender
            .send(Message::Text(refresh.to_json().into()))
            .await
            .is_err()
        {
            return;
        }
        match receiver.next().await {
            Some(Ok(Message::Text(text))) if text.as_str() == "ok" => {}
            other => {
                debug!(?other, "sync session ended");
                return;
            }
        }
        since = refresh.seq;

        loop {
            let waiter = {
                let sync = Arc::clone(&sync);
                let generation = refresh.generation;
                tokio::task::spawn_blocking(move || sync.wait_for_change(generation, SYNC_WAIT))
            };
            tokio::select! {
                changed = waiter => {
                    if matches!(changed, Ok(true)) {
                        break;
                    }
                }
                message = receiver.next() => match message {
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    // Anything else while idle ends the session.
                    other => {
                        debug!(?other, "sync session ended while idle");
                        return;
                    }
                },
            }
        }
    }
}
