use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use sysinfo::System;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tracing::info;

use crate::db::{Db, Measurement};
use crate::engine::EngineStatus;
use crate::error::SensorError;
use crate::reading::{Quantity, Reading};
use crate::state::{SharedState, StatusResponse};
use crate::HubRegulator;

const INDEX_HTML: &str = include_str!("ui/index.html");

const DEFAULT_HISTORY_LIMIT: i64 = 500;
const MAX_HISTORY_LIMIT: i64 = 10_000;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub regulator: HubRegulator,
    pub db: Option<Db>,
    host: Arc<Mutex<System>>,
}

impl AppState {
    pub fn new(shared: SharedState, regulator: HubRegulator, db: Option<Db>) -> Self {
        Self {
            shared,
            regulator,
            db,
            host: Arc::new(Mutex::new(System::new())),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unknown measurement '{0}'")]
    UnknownMeasurement(String),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Sensor(#[from] SensorError),
    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::UnknownMeasurement(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Sensor(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

fn parse_measurement(name: &str) -> Result<Quantity, ApiError> {
    name.parse()
        .map_err(|_| ApiError::UnknownMeasurement(name.to_string()))
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/", get(index))
        .route("/api/status", get(api_status))
        .route("/api/all", get(api_all))
        .route("/api/{measurement}", get(api_current));
    if state.db.is_some() {
        router = router.route("/api/db/{measurement}", get(api_history));
    }
    router.with_state(state)
}

async fn index() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], INDEX_HTML)
}

#[derive(Serialize)]
struct HostStats {
    cpu_pct: f32,
    mem_used_bytes: u64,
    mem_total_bytes: u64,
    load_1m: f64,
    uptime_secs: u64,
}

#[derive(Serialize)]
struct FullStatus {
    #[serde(flatten)]
    system: StatusResponse,
    engine: EngineStatus,
    host: HostStats,
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let system = state.shared.read().await.to_status();
    let engine = state.regulator.status().await;

    let host = {
        let mut sys = state.host.lock().await;
        sys.refresh_cpu_all();
        sys.refresh_memory();
        HostStats {
            cpu_pct: sys.global_cpu_usage(),
            mem_used_bytes: sys.used_memory(),
            mem_total_bytes: sys.total_memory(),
            load_1m: System::load_average().one,
            uptime_secs: System::uptime(),
        }
    };

    Json(FullStatus {
        system,
        engine,
        host,
    })
}

async fn api_all(State(state): State<AppState>) -> Json<Reading> {
    Json(state.regulator.read_now().await)
}

#[derive(Serialize)]
struct CurrentValue {
    measurement: Quantity,
    value: f64,
}

async fn api_current(
    State(state): State<AppState>,
    Path(measurement): Path<String>,
) -> Result<Json<CurrentValue>, ApiError> {
    let quantity = parse_measurement(&measurement)?;
    let value = state.regulator.current(quantity).await?;
    Ok(Json(CurrentValue {
        measurement: quantity,
        value,
    }))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    /// Inclusive lower bound: unix seconds or RFC 3339.
    since: Option<String>,
    limit: Option<i64>,
}

fn parse_since(s: &str) -> Result<OffsetDateTime, ApiError> {
    let parsed = match s.parse::<i64>() {
        Ok(secs) => OffsetDateTime::from_unix_timestamp(secs).map_err(|e| e.to_string()),
        Err(_) => OffsetDateTime::parse(s, &Rfc3339).map_err(|e| e.to_string()),
    };
    parsed.map_err(|e| ApiError::BadRequest(format!("invalid 'since': {e}")))
}

async fn api_history(
    State(state): State<AppState>,
    Path(measurement): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<Measurement>>, ApiError> {
    let quantity = parse_measurement(&measurement)?;

    let since = params.since.as_deref().map(parse_since).transpose()?;

    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    if !(1..=MAX_HISTORY_LIMIT).contains(&limit) {
        return Err(ApiError::BadRequest(format!(
            "'limit' must be between 1 and {MAX_HISTORY_LIMIT}"
        )));
    }

    let Some(db) = &state.db else {
        return Err(ApiError::UnknownMeasurement(measurement));
    };
    Ok(Json(db.history(quantity, since, limit).await?))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

fn listen_addr() -> SocketAddr {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    SocketAddr::from(([0, 0, 0, 0], port))
}

pub async fn serve(state: AppState, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    #[cfg(feature = "tls")]
    if let (Ok(cert), Ok(key)) = (env::var("TLS_CERT"), env::var("TLS_KEY")) {
        return serve_tls(state, shutdown, &cert, &key).await;
    }

    let addr = listen_addr();
    let listener = TcpListener::bind(addr).await?;
    info!("web ui listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

#[cfg(feature = "tls")]
async fn serve_tls(
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
    cert: &str,
    key: &str,
) -> anyhow::Result<()> {
    use axum_server::tls_rustls::RustlsConfig;

    let addr = listen_addr();
    let config = RustlsConfig::from_pem_file(cert, key).await?;
    let handle = axum_server::Handle::new();

    let stopper = handle.clone();
    tokio::spawn(async move {
        let _ = shutdown.changed().await;
        stopper.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
    });

    info!("web ui listening on https://{addr}");
    axum_server::bind_rustls(addr, config)
        .handle(handle)
        .serve(router(state).into_make_service())
        .await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
