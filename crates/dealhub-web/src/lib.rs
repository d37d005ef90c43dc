//! Operational JSON API for DealHub (axum).

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dealhub_storage::FetchGateway;
use dealhub_sync::{DealHub, Scheduler};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "dealhub-web";

const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Scheduler,
    pub gateway: Arc<FetchGateway>,
}

impl AppState {
    pub fn new(scheduler: Scheduler) -> Self {
        let gateway = scheduler.pipeline().gateway().clone();
        Self { scheduler, gateway }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct CheckRequest {
    channel_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LimitQuery {
    limit: Option<usize>,
}

impl LimitQuery {
    fn clamped(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn json_error(status: StatusCode, err: impl std::fmt::Display) -> Response {
    (status, Json(ErrorBody { error: err.to_string() })).into_response()
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/status", get(status_handler))
        .route("/api/check", post(check_handler))
        .route("/api/deals", get(deals_handler))
        .route("/api/history", get(history_handler))
        .route("/api/providers", get(providers_handler))
        .route("/api/providers/reset", post(providers_reset_handler))
        .with_state(Arc::new(state))
}

/// Binds the ops API, starting the scheduler first when enabled.
pub async fn serve(hub: DealHub) -> anyhow::Result<()> {
    if hub.config.scheduler_enabled {
        hub.scheduler.start(None).await?;
    }
    let port = hub.config.web_port;
    let scheduler = hub.scheduler.clone();
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "ops api listening");
    axum::serve(listener, app(AppState::new(hub.scheduler)))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    scheduler.stop().await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.scheduler.status()).into_response()
}

async fn check_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        CheckRequest::default()
    } else {
        match serde_json::from_slice::<CheckRequest>(&body) {
            Ok(request) => request,
            Err(err) => return json_error(StatusCode::BAD_REQUEST, format!("invalid check request: {err}")),
        }
    };
    match state.scheduler.trigger_check(request.channel_id.as_deref()).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "manual check failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
        }
    }
}

async fn deals_handler(State(state): State<Arc<AppState>>, Query(query): Query<LimitQuery>) -> Response {
    match state.scheduler.pipeline().preview_deals(query.clamped()).await {
        Ok(deals) => Json(deals).into_response(),
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")),
    }
}

async fn history_handler(State(state): State<Arc<AppState>>, Query(query): Query<LimitQuery>) -> Response {
    let alerts = state.scheduler.pipeline().stores().alerts.clone();
    match alerts.recent_alerts(query.clamped()).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}

async fn providers_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.gateway.stats()).into_response()
}

async fn providers_reset_handler(State(state): State<Arc<AppState>>) -> Response {
    state.gateway.reset_usage();
    Json(state.gateway.stats()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::{TimeZone, Utc};
    use dealhub_adapters::AdapterKind;
    use dealhub_core::{ManualClock, WatchTarget};
    use dealhub_storage::{BreakerPolicy, FixtureProvider, MemoryStore, ProviderSettings};
    use dealhub_sync::{
        CooldownPolicy, DealPipeline, PipelineSettings, RecordingChannel, ScoringEngine, SourceConfig, Stores,
    };
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::path::Path;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state() -> AppState {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()));
        let manifest = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/routes.yaml");
        let gateway = FetchGateway::new(
            vec![(
                Arc::new(FixtureProvider::from_manifest(manifest, clock.clone()).unwrap()),
                ProviderSettings {
                    min_spacing: Duration::ZERO,
                    ..ProviderSettings::default()
                },
            )],
            BreakerPolicy::default(),
            clock.clone(),
        )
        .unwrap();
        let store = Arc::new(MemoryStore::with_targets(vec![WatchTarget::new(
            "ops",
            Some("Tudor"),
            Some("Black Bay 58"),
            3500.0,
        )]));
        let source = SourceConfig {
            source_id: "reddit-watchexchange".into(),
            display_name: "r/Watchexchange".into(),
            enabled: true,
            kind: AdapterKind::RedditWatches,
            listing_urls: vec!["https://www.reddit.com/r/Watchexchange/new.json?limit=50".into()],
            trust_bonus: 0.0,
            notes: None,
        };
        let pipeline = DealPipeline::new(
            Arc::new(gateway),
            Stores::shared(store),
            ScoringEngine::default(),
            vec![source],
            CooldownPolicy::default(),
            Arc::new(RecordingChannel::new()),
            clock,
            PipelineSettings {
                delivery_delay: Duration::ZERO,
                default_channel: Some("ops-chat".into()),
                ..PipelineSettings::default()
            },
        );
        AppState::new(Scheduler::new(Arc::new(pipeline), "*/15 * * * *", Duration::from_secs(30)))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Body) -> (StatusCode, Value) {
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::String(String::from_utf8_lossy(&bytes).into()));
        (status, value)
    }

    #[tokio::test]
    async fn healthz_and_status() {
        let app = app(state());
        let (status, body) = send(&app, "GET", "/healthz", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::String("ok".into()));

        let (status, body) = send(&app, "GET", "/api/status", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["isRunning"], false);
        assert_eq!(body["stats"]["totalRuns"], 0);
    }

    #[tokio::test]
    async fn check_runs_a_cycle_and_history_shows_the_alert() {
        let app = app(state());
        let (status, report) = send(&app, "POST", "/api/check", Body::from(r#"{"channelId":"manual"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["deals_found"], 1);
        assert_eq!(report["alerts_sent"], 1);

        let (_, history) = send(&app, "GET", "/api/history?limit=500", Body::empty()).await;
        let rows = history.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["channel"], "manual");

        let (_, deals) = send(&app, "GET", "/api/deals", Body::empty()).await;
        assert_eq!(deals[0]["on_cooldown"], true);
        assert_eq!(deals[0]["savings_percent"], 8.6);

        let (_, status) = send(&app, "GET", "/api/status", Body::empty()).await;
        assert_eq!(status["stats"]["totalAlertsSent"], 1);
    }

    #[tokio::test]
    async fn check_accepts_an_empty_body_and_rejects_garbage() {
        let app = app(state());
        let (status, _) = send(&app, "POST", "/api/check", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = send(&app, "POST", "/api/check", Body::from("{nope")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("invalid check request"));
    }

    #[tokio::test]
    async fn providers_report_and_reset_usage() {
        let app = app(state());
        send(&app, "POST", "/api/check", Body::empty()).await;
        let (_, stats) = send(&app, "GET", "/api/providers", Body::empty()).await;
        assert_eq!(stats[0]["name"], "fixture");
        assert_eq!(stats[0]["used"], 1);
        assert_eq!(stats[0]["circuit"], "closed");

        let (status, stats) = send(&app, "POST", "/api/providers/reset", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats[0]["used"], 0);
    }
}
