//! HTTP API and embedded UI.
//!
//! Routes: `/health` (always unauthenticated), `/api/events`,
//! `/api/battery`, `/preview.png`, and the embedded static UI on
//! everything else. Unknown `/api/*` paths return JSON 404, never HTML.
//! When basic auth is configured it guards every route except `/health`,
//! comparing both username and password in constant time.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Json, Response},
    routing::get,
    Router,
};
use base64::Engine;
use chrono::{Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use epdcal_core::rfc3339_nano;
use epdcal_feed::{expand_occurrences, parse_ics, ExpandConfig, Fetcher, ParsedEvent};

use crate::battery::{default_reader, BatteryReader, BatteryStatus};
use crate::cache::SnapshotCache;
use crate::config::{ics_cache_dir, preview_path, Config};
use crate::error::ServerResult;
use crate::shutdown::ShutdownHandle;

const INDEX_HTML: &str = include_str!("../static/index.html");
const CALENDAR_HTML: &str = include_str!("../static/calendar.html");

/// In-memory response snapshot TTL.
const RESPONSE_CACHE_TTL: Duration = Duration::from_secs(30);

/// Shared application state behind every handler.
pub struct AppState {
    pub config: Config,
    pub display_tz: Tz,
    pub fetcher: Fetcher,
    pub preview_path: PathBuf,
    battery: Box<dyn BatteryReader>,
    events_cache: RwLock<SnapshotCache<(i64, i64), EventsResponse>>,
    battery_cache: RwLock<SnapshotCache<(), BatteryStatus>>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Production wiring: cache and preview locations derive from the
    /// debug flag.
    pub fn new(config: Config, debug: bool) -> ServerResult<SharedState> {
        let cache_dir = ics_cache_dir(debug);
        let preview = preview_path(debug);
        Self::with_paths(config, cache_dir, preview)
    }

    /// Explicit paths, used by tests.
    pub fn with_paths(
        config: Config,
        cache_dir: PathBuf,
        preview: PathBuf,
    ) -> ServerResult<SharedState> {
        let display_tz = config.display_tz();
        let fetcher = Fetcher::new(cache_dir)?;
        Ok(Arc::new(Self {
            config,
            display_tz,
            fetcher,
            preview_path: preview,
            battery: default_reader(),
            events_cache: RwLock::new(SnapshotCache::new(RESPONSE_CACHE_TTL)),
            battery_cache: RwLock::new(SnapshotCache::new(RESPONSE_CACHE_TTL)),
        }))
    }
}

/// JSON error body: a short message, never URLs or tokens.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

/// JSON view of one occurrence.
#[derive(Debug, Clone, Serialize)]
pub struct OccurrenceDto {
    pub source_id: String,
    pub uid: String,
    pub instance_key: String,
    pub summary: String,
    pub description: String,
    pub location: String,
    pub all_day: bool,
    pub start: String,
    pub end: String,
}

/// Response shape for `/api/events`.
#[derive(Debug, Clone, Serialize)]
pub struct EventsResponse {
    pub occurrences: Vec<OccurrenceDto>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub truncated_uids: Vec<String>,
    pub range_start: String,
    pub range_end: String,
    pub display_timezone: String,
    pub week_start: String,
}

/// Builds the full router, including auth when configured.
pub fn router(state: SharedState) -> Router {
    let routes = Router::new()
        .route("/health", get(health))
        .route("/api/events", get(events))
        .route("/api/battery", get(battery))
        .route("/preview.png", get(preview))
        .fallback(static_ui)
        .with_state(state.clone());

    let routes = if state.config.basic_auth_enabled() {
        info!("HTTP basic auth enabled");
        routes.layer(middleware::from_fn_with_state(state, require_basic_auth))
    } else {
        routes
    };

    routes.layer(TraceLayer::new_for_http())
}

/// Binds the configured listen address and serves until shutdown.
pub async fn serve(state: SharedState, shutdown: ShutdownHandle) -> ServerResult<()> {
    let listener = tokio::net::TcpListener::bind(&state.config.listen).await?;
    info!(listen = %state.config.listen, "HTTP server listening");
    serve_on(listener, state, shutdown).await
}

/// Serves on an already-bound listener (tests bind their own).
pub async fn serve_on(
    listener: tokio::net::TcpListener,
    state: SharedState,
    shutdown: ShutdownHandle,
) -> ServerResult<()> {
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;
    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

#[derive(Debug, Default, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    days: Option<String>,
    #[serde(default)]
    backfill: Option<String>,
}

/// Lenient integer parsing: absent or malformed values take the default.
fn int_param(value: Option<&str>, default: i64) -> i64 {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

async fn events(State(state): State<SharedState>, Query(query): Query<EventsQuery>) -> Response {
    let default_days = state.config.horizon_days.max(1);
    let days = match int_param(query.days.as_deref(), default_days) {
        d if d > 0 => d,
        _ => default_days,
    };
    let backfill = int_param(query.backfill.as_deref(), 1).max(0);

    if let Some(cached) = state.events_cache.read().await.get(&(days, backfill)) {
        return Json(cached).into_response();
    }

    let tz = state.display_tz;
    let now = Utc::now().with_timezone(&tz);
    let range_start = now - ChronoDuration::days(backfill);
    let range_end = now + ChronoDuration::days(days);

    let sources = state.config.sources();
    if sources.is_empty() {
        return Json(EventsResponse {
            occurrences: Vec::new(),
            truncated_uids: Vec::new(),
            range_start: rfc3339_nano(&range_start),
            range_end: rfc3339_nano(&range_end),
            display_timezone: tz.name().to_string(),
            week_start: state.config.week_start.clone(),
        })
        .into_response();
    }

    let (fetched, fetch_errors) = state.fetcher.fetch_all(&sources).await;
    for err in &fetch_errors {
        warn!(error = %err, "events API: source fetch failed");
    }

    let mut parsed: Vec<ParsedEvent> = Vec::new();
    for result in &fetched {
        match parse_ics(&result.source, &result.body) {
            Ok(events) => parsed.extend(events),
            Err(e) => warn!(id = %result.source.id, error = %e, "events API: source parse failed"),
        }
    }

    let expand_cfg = ExpandConfig::new(tz, range_start, range_end);
    let expanded = match expand_occurrences(&parsed, &expand_cfg) {
        Ok(res) => res,
        Err(e) => {
            warn!(error = %e, "events API: expansion failed");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to expand events");
        }
    };

    let response = EventsResponse {
        occurrences: expanded
            .occurrences
            .iter()
            .map(|o| OccurrenceDto {
                source_id: o.source_id.clone(),
                uid: o.uid.clone(),
                instance_key: o.instance_key.clone(),
                summary: o.summary.clone(),
                description: o.description.clone(),
                location: o.location.clone(),
                all_day: o.all_day,
                start: rfc3339_nano(&o.start),
                end: rfc3339_nano(&o.end),
            })
            .collect(),
        truncated_uids: expanded.truncated_uids,
        range_start: rfc3339_nano(&range_start),
        range_end: rfc3339_nano(&range_end),
        display_timezone: tz.name().to_string(),
        week_start: state.config.week_start.clone(),
    };

    state
        .events_cache
        .write()
        .await
        .insert((days, backfill), response.clone());

    Json(response).into_response()
}

async fn battery(State(state): State<SharedState>) -> Response {
    if let Some(cached) = state.battery_cache.read().await.get(&()) {
        return Json(cached).into_response();
    }

    match state.battery.read() {
        Ok(status) => {
            state.battery_cache.write().await.insert((), status);
            Json(status).into_response()
        }
        Err(e) => {
            warn!(error = %e, "battery read failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to read battery")
        }
    }
}

async fn preview(State(state): State<SharedState>) -> Response {
    match tokio::fs::read(&state.preview_path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, "image/png")], bytes).into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            (StatusCode::NOT_FOUND, "no preview rendered yet").into_response()
        }
        Err(e) => {
            warn!(error = %e, "preview read failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "preview unavailable").into_response()
        }
    }
}

/// Everything unmatched: JSON 404 under /api, embedded UI otherwise.
async fn static_ui(request: Request) -> Response {
    let path = request.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return json_error(StatusCode::NOT_FOUND, "not found");
    }
    if path == "/calendar" || path == "/calendar/" {
        return Html(CALENDAR_HTML).into_response();
    }
    Html(INDEX_HTML).into_response()
}

/// Basic-auth gate for every route except `/health`.
async fn require_basic_auth(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let auth = state.config.basic_auth.as_ref();
    let authorized = auth.is_some_and(|creds| {
        request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(decode_basic)
            .is_some_and(|(user, pass)| {
                // Both comparisons always run so timing reveals neither.
                let user_ok = constant_time_eq(&user, &creds.username);
                let pass_ok = constant_time_eq(&pass, &creds.password);
                user_ok & pass_ok
            })
    });

    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            [(
                header::WWW_AUTHENTICATE,
                r#"Basic realm="epdcal", charset="UTF-8""#,
            )],
            "Unauthorized",
        )
            .into_response();
    }

    next.run(request).await
}

fn decode_basic(header_value: &str) -> Option<(String, String)> {
    let encoded = header_value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BasicAuthConfig;

    fn test_state(config: Config) -> (SharedState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::with_paths(
            config,
            dir.path().join("ics-cache"),
            dir.path().join("preview.png"),
        )
        .unwrap();
        (state, dir)
    }

    async fn spawn_server(state: SharedState) -> (String, ShutdownHandle) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = ShutdownHandle::new();
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            serve_on(listener, state, server_shutdown).await.ok();
        });
        (format!("http://{}", addr), shutdown)
    }

    #[test]
    fn decode_basic_roundtrip() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("user:p:ss");
        let decoded = decode_basic(&format!("Basic {encoded}")).unwrap();
        // Password may itself contain colons.
        assert_eq!(decoded, ("user".to_string(), "p:ss".to_string()));
        assert!(decode_basic("Bearer abc").is_none());
    }

    #[test]
    fn int_param_is_lenient() {
        assert_eq!(int_param(None, 7), 7);
        assert_eq!(int_param(Some("3"), 7), 3);
        assert_eq!(int_param(Some("not-a-number"), 7), 7);
        assert_eq!(int_param(Some("-2"), 7), -2);
    }

    #[test]
    fn constant_time_eq_semantics() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "secrex"));
        assert!(!constant_time_eq("secret", "secre"));
        assert!(!constant_time_eq("", "secret"));
    }

    #[tokio::test]
    async fn health_and_static_and_api_404() {
        let (state, _dir) = test_state(Config::default());
        let (base, shutdown) = spawn_server(state).await;
        let client = reqwest::Client::new();

        let health = client.get(format!("{base}/health")).send().await.unwrap();
        assert_eq!(health.status(), 200);
        assert_eq!(health.text().await.unwrap(), "OK");

        let index = client.get(format!("{base}/")).send().await.unwrap();
        assert_eq!(index.status(), 200);
        assert!(index.text().await.unwrap().contains("<html"));

        // Unknown API paths are JSON, never HTML.
        let missing = client
            .get(format!("{base}/api/definitely-not-a-thing"))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);
        let body: serde_json::Value = missing.json().await.unwrap();
        assert!(body.get("error").is_some());

        shutdown.trigger();
    }

    #[tokio::test]
    async fn events_with_no_sources_is_empty_but_well_formed() {
        let (state, _dir) = test_state(Config::default());
        let (base, shutdown) = spawn_server(state).await;

        let resp = reqwest::get(format!("{base}/api/events?days=3&backfill=0"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["occurrences"].as_array().unwrap().len(), 0);
        assert_eq!(body["display_timezone"], "Asia/Seoul");
        assert_eq!(body["week_start"], "monday");
        assert!(body.get("truncated_uids").is_none());

        shutdown.trigger();
    }

    #[tokio::test]
    async fn battery_endpoint_reports_status() {
        let (state, _dir) = test_state(Config::default());
        let (base, shutdown) = spawn_server(state).await;

        let resp = reqwest::get(format!("{base}/api/battery")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        let percent = body["percent"].as_u64().unwrap();
        assert!(percent <= 100);

        shutdown.trigger();
    }

    #[tokio::test]
    async fn preview_missing_is_404() {
        let (state, _dir) = test_state(Config::default());
        let (base, shutdown) = spawn_server(state).await;

        let resp = reqwest::get(format!("{base}/preview.png")).await.unwrap();
        assert_eq!(resp.status(), 404);

        shutdown.trigger();
    }

    #[tokio::test]
    async fn basic_auth_guards_everything_but_health() {
        let config = Config {
            basic_auth: Some(BasicAuthConfig {
                username: "calendar".into(),
                password: "hunter2".into(),
            }),
            ..Config::default()
        };
        let (state, _dir) = test_state(config);
        let (base, shutdown) = spawn_server(state).await;
        let client = reqwest::Client::new();

        // /health stays open.
        let health = client.get(format!("{base}/health")).send().await.unwrap();
        assert_eq!(health.status(), 200);

        // Everything else challenges.
        let denied = client.get(format!("{base}/")).send().await.unwrap();
        assert_eq!(denied.status(), 401);
        assert!(denied.headers().contains_key("www-authenticate"));

        let wrong = client
            .get(format!("{base}/api/events"))
            .basic_auth("calendar", Some("wrong"))
            .send()
            .await
            .unwrap();
        assert_eq!(wrong.status(), 401);

        let ok = client
            .get(format!("{base}/api/events"))
            .basic_auth("calendar", Some("hunter2"))
            .send()
            .await
            .unwrap();
        assert_eq!(ok.status(), 200);

        shutdown.trigger();
    }
}
