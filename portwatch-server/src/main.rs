//! Control surface binary for the stream orchestrator: wires
//! `portwatch_runtime::Orchestrator` behind a narrow JSON/HTTP API,
//! matching `ferrex-server`'s bootstrap shape (CLI args override env
//! config, `tracing_subscriber` init, `axum::serve`).

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use portwatch_core::{OrchestratorConfig, OrchestratorError, StreamConfig};
use portwatch_runtime::bus::{InProcEventBus, RedisEventBus};
use portwatch_runtime::media::FfmpegEncoderLauncher;
use portwatch_runtime::{HandleSnapshot, NullDetector, Orchestrator, SyntheticFrameSourceFactory, WorkerDeps};

/// Command line arguments, each overridable by its matching environment
/// variable.
#[derive(Parser, Debug)]
#[command(name = "portwatch-server")]
#[command(about = "Multi-stream inference orchestrator control surface")]
struct Args {
    #[arg(long, env = "SERVER_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "SERVER_PORT", default_value_t = 8080)]
    port: u16,

    /// Redis connection URL for the event bus. Falls back to the
    /// in-process broadcast bus when unset.
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    #[arg(long, env = "FFMPEG_PATH", default_value = "ffmpeg")]
    ffmpeg_path: String,

    #[arg(long, env = "MEDIA_SINK_BASE_URL", default_value = "rtsp://localhost:8554")]
    media_sink_base_url: String,

    #[arg(long, env = "MAX_WORKERS")]
    max_workers: Option<usize>,

    #[arg(long, env = "IDLE_TIMEOUT", value_parser = humantime::parse_duration)]
    idle_timeout: Option<Duration>,

    #[arg(long, env = "NO_VIEWER_TIMEOUT", value_parser = humantime::parse_duration)]
    no_viewer_timeout: Option<Duration>,

    #[arg(long, env = "PROTECTED_STREAM_IDS", value_delimiter = ',')]
    protected_stream_ids: Vec<String>,
}

#[derive(Clone)]
struct AppState {
    orchestrator: Orchestrator,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "portwatch_server=info,portwatch_runtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = OrchestratorConfig::default();
    if let Some(max_workers) = args.max_workers {
        config.max_workers = max_workers;
    }
    if let Some(idle_timeout) = args.idle_timeout {
        config.idle_timeout = idle_timeout;
    }
    if let Some(no_viewer_timeout) = args.no_viewer_timeout {
        config.no_viewer_timeout = no_viewer_timeout;
    }
    config.protected_stream_ids = args.protected_stream_ids.into_iter().collect::<HashSet<_>>();

    let event_bus: Arc<dyn portwatch_runtime::bus::EventBusAdapter> = match &args.redis_url {
        Some(redis_url) => {
            info!("using Redis event bus");
            Arc::new(RedisEventBus::new(redis_url).await?)
        }
        None => {
            info!("using in-process event bus (no REDIS_URL configured)");
            Arc::new(InProcEventBus::new(64))
        }
    };

    let deps = WorkerDeps {
        frame_source_factory: Arc::new(SyntheticFrameSourceFactory {
            fps: 25.0,
            local: false,
            frame_count: None,
        }),
        detector: Arc::new(NullDetector),
        event_bus,
        encoder_launcher: Arc::new(FfmpegEncoderLauncher {
            ffmpeg_path: args.ffmpeg_path.clone(),
            sink_base_url: args.media_sink_base_url.clone(),
        }),
    };

    let orchestrator = Orchestrator::new(config, deps);
    let state = AppState { orchestrator };

    let app = create_app(state.clone());

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    info!("portwatch-server listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown = shutdown_signal(state.orchestrator.clone());
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

    Ok(())
}

async fn shutdown_signal(orchestrator: Orchestrator) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received, stopping all workers");
    orchestrator.shutdown().await;
}

fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/streams", post(start_stream_handler).get(list_streams_handler))
        .route(
            "/streams/{id}",
            get(get_stream_handler).delete(stop_stream_handler),
        )
        .route(
            "/streams/{id}/viewers",
            post(acquire_viewer_handler).delete(release_viewer_handler),
        )
        .route("/streams/{id}/touch", post(touch_stream_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Maps `OrchestratorError` to an HTTP status without handlers ever
/// inlining that mapping themselves, matching `ferrex-server`'s
/// thin-handler convention.
struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(error: OrchestratorError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            OrchestratorError::ValidationError(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::AlreadyRunning(_) => StatusCode::CONFLICT,
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::CapacityExceeded => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::WorkerSpawnFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// JSON-serializable view of a `HandleSnapshot` (which carries raw
/// `Instant`s that have no wall-clock meaning outside this process).
#[derive(Serialize)]
struct StreamSnapshotResponse {
    stream_id: String,
    source_url: String,
    #[serde(rename = "loop")]
    loop_playback: bool,
    is_alive: bool,
    uptime_secs: f64,
    idle_secs: f64,
    restart_count: u32,
    last_exitcode: Option<i32>,
    backoff_secs: f64,
    viewer_count: u32,
    no_viewer_secs: Option<f64>,
    media_publisher_disabled: bool,
}

impl From<HandleSnapshot> for StreamSnapshotResponse {
    fn from(snapshot: HandleSnapshot) -> Self {
        let now = std::time::Instant::now();
        Self {
            stream_id: snapshot.stream_id,
            source_url: snapshot.source_url,
            loop_playback: snapshot.loop_playback,
            is_alive: snapshot.is_alive,
            uptime_secs: now.saturating_duration_since(snapshot.started_at).as_secs_f64(),
            idle_secs: snapshot.idle_for(now).as_secs_f64(),
            restart_count: snapshot.restart_count,
            last_exitcode: snapshot.last_exitcode,
            backoff_secs: snapshot.backoff_seconds,
            viewer_count: snapshot.viewer_count,
            no_viewer_secs: snapshot.no_viewer_for(now).map(|d| d.as_secs_f64()),
            media_publisher_disabled: snapshot.media_publisher_disabled,
        }
    }
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct StartStreamRequest {
    stream_id: String,
    source_url: String,
    #[serde(default, rename = "loop")]
    loop_playback: bool,
}

async fn start_stream_handler(
    State(state): State<AppState>,
    Json(request): Json<StartStreamRequest>,
) -> Result<Json<StreamSnapshotResponse>, ApiError> {
    let config = StreamConfig::new(request.stream_id, request.source_url, request.loop_playback)?;
    let snapshot = state.orchestrator.start_stream(config).await?;
    Ok(Json(snapshot.into()))
}

#[derive(Deserialize)]
struct StopStreamQuery {
    #[serde(default)]
    remove_config: bool,
}

async fn stop_stream_handler(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    Query(query): Query<StopStreamQuery>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.stop_stream(&stream_id, query.remove_config).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_stream_handler(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> Result<Json<StreamSnapshotResponse>, ApiError> {
    let snapshot = state.orchestrator.get_stream(&stream_id).await?;
    Ok(Json(snapshot.into()))
}

async fn list_streams_handler(State(state): State<AppState>) -> Json<Vec<StreamSnapshotResponse>> {
    Json(
        state
            .orchestrator
            .list_streams()
            .await
            .into_iter()
            .map(StreamSnapshotResponse::from)
            .collect(),
    )
}

async fn acquire_viewer_handler(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> Result<Json<StreamSnapshotResponse>, ApiError> {
    let snapshot = state.orchestrator.acquire_stream_viewer(&stream_id).await?;
    Ok(Json(snapshot.into()))
}

async fn release_viewer_handler(State(state): State<AppState>, Path(stream_id): Path<String>) -> StatusCode {
    state.orchestrator.release_stream_viewer(&stream_id).await;
    StatusCode::NO_CONTENT
}

async fn touch_stream_handler(State(state): State<AppState>, Path(stream_id): Path<String>) -> StatusCode {
    state.orchestrator.touch_stream(&stream_id).await;
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use portwatch_runtime::bus::InProcEventBus;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let mut config = OrchestratorConfig::default();
        config.watchdog_period = Duration::from_secs(3600);
        let deps = WorkerDeps {
            frame_source_factory: Arc::new(SyntheticFrameSourceFactory {
                fps: 30.0,
                local: false,
                frame_count: None,
            }),
            detector: Arc::new(NullDetector),
            event_bus: Arc::new(InProcEventBus::new(16)),
            encoder_launcher: Arc::new(portwatch_runtime::media::FfmpegEncoderLauncher {
                ffmpeg_path: "/bin/false".to_string(),
                sink_base_url: "rtsp://localhost:8554".to_string(),
            }),
        };
        AppState {
            orchestrator: Orchestrator::new(config, deps),
        }
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let app = create_app(test_state());
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn start_then_get_then_stop_round_trips() {
        let state = test_state();
        let app = create_app(state.clone());

        let body = serde_json::to_vec(&serde_json::json!({
            "stream_id": "cam-1",
            "source_url": "rtsp://host/live",
        }))
        .unwrap();
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/streams")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/streams/cam-1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/streams/cam-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        state.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn get_unknown_stream_is_404() {
        let state = test_state();
        let app = create_app(state.clone());
        let response = app
            .oneshot(Request::builder().uri("/streams/ghost").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        state.orchestrator.shutdown().await;
    }
}
