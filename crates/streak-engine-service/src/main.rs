use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use streak_engine_api::{
    MigrateResult, RecomputeRequest, RecomputeResult, RegisterChallengeRequest,
    RegisterUserRequest, StreakApi, TrackDayRequest, TrackDayResult, TrackDayStatus,
    API_CONTRACT_VERSION,
};
use streak_engine_core::{
    Challenge, ChallengeId, EngineError, SettlementReport, Track, User, UserId, UserScores,
};
use streak_engine_store_sqlite::{IntegrityReport, SchemaStatus};
use time::Date;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::ServiceConfig;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const DEFAULT_RECENT_TRACKS: u32 = 3;
const MAX_RECENT_TRACKS: u32 = 366;

#[derive(Debug, Clone)]
struct ServiceState {
    api: StreakApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct RecentQuery {
    n: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct MonthQuery {
    user_id: String,
    date: Date,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "streak-engine-service")]
#[command(about = "Local HTTP service for the streak engine")]
struct Args {
    #[arg(long, default_value = "./streak_engine.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// YAML file with engine and timer settings.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Run settlement every N seconds; overrides the config file.
    #[arg(long)]
    settle_every_secs: Option<u64>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(status: StatusCode, message: impl Into<String>) -> ServiceError {
        ServiceError {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
        }
    }

    fn not_found(what: impl std::fmt::Display) -> ServiceError {
        Self::error(StatusCode::NOT_FOUND, format!("{what} not found"))
    }

    fn bad_request(message: impl Into<String>) -> ServiceError {
        Self::error(StatusCode::BAD_REQUEST, message)
    }
}

/// Caller-correctable engine errors are 422; storage and everything else is 500.
fn api_error(err: &anyhow::Error) -> ServiceError {
    let status = match err.downcast_ref::<EngineError>() {
        Some(EngineError::Storage { .. }) | None => StatusCode::INTERNAL_SERVER_ERROR,
        Some(_) => StatusCode::UNPROCESSABLE_ENTITY,
    };
    ServiceState::error(status, format!("{err:#}"))
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn parse_challenge_id(raw: &str) -> Result<ChallengeId, ServiceError> {
    raw.parse().map_err(|err| ServiceState::bad_request(format!("invalid challenge id: {err}")))
}

fn parse_user_id(raw: &str) -> Result<UserId, ServiceError> {
    raw.parse().map_err(|err| ServiceState::bad_request(format!("invalid user id: {err}")))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/db/integrity-check", post(db_integrity_check))
        .route("/v1/users", post(users_register))
        .route("/v1/challenges", post(challenges_register))
        .route("/v1/tracks/day", post(tracks_day))
        .route("/v1/engine/recompute", post(engine_recompute))
        .route("/v1/settlement/run", post(settlement_run))
        .route("/v1/challenges/:challenge_id/tracks/recent", get(tracks_recent))
        .route("/v1/challenges/:challenge_id/tracks/month", get(tracks_month))
        .route("/v1/users/:user_id/scores", get(user_scores))
        .with_state(state)
}

fn spawn_settlement_timer(api: StreakApi, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let api = api.clone();
            match tokio::task::spawn_blocking(move || api.run_settlement()).await {
                Ok(Ok(report)) => info!(
                    challenges = report.challenges_seen,
                    settled = report.settled.len(),
                    failed = report.failures.len(),
                    increment = report.total_increment(),
                    "scheduled settlement finished"
                ),
                Ok(Err(error)) => warn!(error = %error, "scheduled settlement failed"),
                Err(error) => warn!(error = %error, "scheduled settlement task aborted"),
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = ServiceConfig::load(args.config.as_deref())?;
    let api = StreakApi::new(args.db).with_config(config.engine);

    if let Some(secs) = args.settle_every_secs.or(config.settlement_interval_secs) {
        info!(every_secs = secs, "settlement timer enabled");
        spawn_settlement_timer(api.clone(), Duration::from_secs(secs.max(1)));
    }

    let state = ServiceState { api };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, "streak engine service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| api_error(&err))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = state.api.migrate(request.dry_run).map_err(|err| api_error(&err))?;
    Ok(Json(envelope(result)))
}

async fn db_integrity_check(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<IntegrityReport>>, ServiceError> {
    let report = state.api.integrity_check().map_err(|err| api_error(&err))?;
    if !report.is_healthy() {
        warn!(
            quick_check = %report.quick_check_message,
            fk_violations = report.foreign_key_violations.len(),
            settlement_holes = report.challenges_with_settlement_holes,
            "integrity check found problems"
        );
    }
    Ok(Json(envelope(report)))
}

async fn users_register(
    State(state): State<ServiceState>,
    Json(request): Json<RegisterUserRequest>,
) -> Result<Json<ServiceEnvelope<User>>, ServiceError> {
    let user = state.api.register_user(request).map_err(|err| api_error(&err))?;
    Ok(Json(envelope(user)))
}

async fn challenges_register(
    State(state): State<ServiceState>,
    Json(request): Json<RegisterChallengeRequest>,
) -> Result<Json<ServiceEnvelope<Challenge>>, ServiceError> {
    let user_id = request.user_id;
    let challenge = state
        .api
        .register_challenge(request)
        .map_err(|err| api_error(&err))?
        .ok_or_else(|| ServiceState::not_found(format!("user {user_id}")))?;
    Ok(Json(envelope(challenge)))
}

async fn tracks_day(
    State(state): State<ServiceState>,
    Json(request): Json<TrackDayRequest>,
) -> Result<Json<ServiceEnvelope<TrackDayResult>>, ServiceError> {
    let challenge_id = request.challenge_id;
    let result = state.api.track_day(request).map_err(|err| api_error(&err))?;
    if result.status == TrackDayStatus::NotFound {
        return Err(ServiceState::not_found(format!("challenge {challenge_id}")));
    }
    Ok(Json(envelope(result)))
}

async fn engine_recompute(
    State(state): State<ServiceState>,
    Json(request): Json<RecomputeRequest>,
) -> Result<Json<ServiceEnvelope<RecomputeResult>>, ServiceError> {
    let result = state.api.recompute(request).map_err(|err| api_error(&err))?;
    Ok(Json(envelope(result)))
}

async fn settlement_run(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SettlementReport>>, ServiceError> {
    let report = state.api.run_settlement().map_err(|err| api_error(&err))?;
    Ok(Json(envelope(report)))
}

async fn tracks_recent(
    State(state): State<ServiceState>,
    Path(challenge_id): Path<String>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<ServiceEnvelope<Vec<Track>>>, ServiceError> {
    let challenge_id = parse_challenge_id(&challenge_id)?;
    let n = query.n.unwrap_or(DEFAULT_RECENT_TRACKS);
    if n == 0 || n > MAX_RECENT_TRACKS {
        return Err(ServiceState::bad_request(format!(
            "n must be between 1 and {MAX_RECENT_TRACKS}"
        )));
    }
    let tracks = state
        .api
        .recent_tracks(challenge_id, n)
        .map_err(|err| api_error(&err))?
        .ok_or_else(|| ServiceState::not_found(format!("challenge {challenge_id}")))?;
    Ok(Json(envelope(tracks)))
}

async fn tracks_month(
    State(state): State<ServiceState>,
    Path(challenge_id): Path<String>,
    Query(query): Query<MonthQuery>,
) -> Result<Json<ServiceEnvelope<Vec<Track>>>, ServiceError> {
    let challenge_id = parse_challenge_id(&challenge_id)?;
    let user_id = parse_user_id(&query.user_id)?;
    let tracks = state
        .api
        .month_tracks(user_id, challenge_id, query.date)
        .map_err(|err| api_error(&err))?
        .ok_or_else(|| ServiceState::not_found(format!("challenge {challenge_id}")))?;
    Ok(Json(envelope(tracks)))
}

async fn user_scores(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
) -> Result<Json<ServiceEnvelope<UserScores>>, ServiceError> {
    let user_id = parse_user_id(&user_id)?;
    let scores = state
        .api
        .user_scores(user_id)
        .map_err(|err| api_error(&err))?
        .ok_or_else(|| ServiceState::not_found(format!("user {user_id}")))?;
    Ok(Json(envelope(scores)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use serde_json::{json, Value};
    use time::OffsetDateTime;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("streak-engine-service-{}.sqlite3", ChallengeId::new()))
    }

    fn test_state() -> ServiceState {
        ServiceState { api: StreakApi::new(unique_temp_db_path()) }
    }

    async fn response_json(response: Response) -> Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn send(state: &ServiceState, method: &str, uri: &str, body: Option<Value>) -> Response {
        let builder = Request::builder().uri(uri).method(method);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap_or_else(|err| panic!("failed to build request: {err}"));

        match app(state.clone()).oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    fn data_str<'a>(value: &'a Value, field: &str) -> &'a str {
        value
            .get("data")
            .and_then(|data| data.get(field))
            .and_then(Value::as_str)
            .unwrap_or_else(|| panic!("missing data.{field} in {value}"))
    }

    async fn owner_and_challenge(state: &ServiceState) -> (String, String) {
        let user = response_json(send(state, "POST", "/v1/users", Some(json!({}))).await).await;
        let user_id = data_str(&user, "id").to_string();
        let challenge = response_json(
            send(
                state,
                "POST",
                "/v1/challenges",
                Some(json!({ "user_id": user_id, "name": "walk", "period": "every_day" })),
            )
            .await,
        )
        .await;
        let challenge_id = data_str(&challenge, "id").to_string();
        (user_id, challenge_id)
    }

    fn today() -> Date {
        OffsetDateTime::now_utc().date()
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let response = send(&test_state(), "GET", "/v1/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn track_day_flow_updates_recent_tracks_and_scores() {
        let state = test_state();
        let (user_id, challenge_id) = owner_and_challenge(&state).await;

        let response = send(
            &state,
            "POST",
            "/v1/tracks/day",
            Some(json!({
                "user_id": user_id,
                "challenge_id": challenge_id,
                "date": today().to_string(),
                "done": true,
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(data_str(&value, "status"), "applied");

        let uri = format!("/v1/challenges/{challenge_id}/tracks/recent?n=3");
        let recent = response_json(send(&state, "GET", &uri, None).await).await;
        let Some(tracks) = recent.get("data").and_then(Value::as_array) else {
            panic!("recent tracks should be an array: {recent}");
        };
        assert_eq!(tracks.len(), 3);
        assert_eq!(tracks[2].get("done").and_then(Value::as_bool), Some(true));

        let uri = format!("/v1/users/{user_id}/scores");
        let scores = response_json(send(&state, "GET", &uri, None).await).await;
        assert_eq!(
            scores.pointer("/data/provisional").and_then(Value::as_i64),
            Some(1),
            "unexpected scores: {scores}"
        );
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn edits_before_the_window_are_unprocessable() {
        let state = test_state();
        let (user_id, challenge_id) = owner_and_challenge(&state).await;
        let Some(old) = today().checked_sub(time::Duration::days(10)) else {
            panic!("calendar underflow");
        };

        let response = send(
            &state,
            "POST",
            "/v1/tracks/day",
            Some(json!({
                "user_id": user_id,
                "challenge_id": challenge_id,
                "date": old.to_string(),
                "done": true,
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let value = response_json(response).await;
        let error = value.get("error").and_then(Value::as_str).unwrap_or_default();
        assert!(error.contains("edit window closed"), "unexpected error: {error}");
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn unknown_and_malformed_ids_map_to_client_errors() {
        let state = test_state();

        let uri = format!("/v1/challenges/{}/tracks/recent", ChallengeId::new());
        assert_eq!(send(&state, "GET", &uri, None).await.status(), StatusCode::NOT_FOUND);

        let malformed = send(&state, "GET", "/v1/challenges/not-a-ulid/tracks/recent", None).await;
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);

        let uri = format!("/v1/users/{}/scores", UserId::new());
        assert_eq!(send(&state, "GET", &uri, None).await.status(), StatusCode::NOT_FOUND);

        let orphan = send(
            &state,
            "POST",
            "/v1/challenges",
            Some(json!({ "user_id": UserId::new().to_string(), "name": "orphan" })),
        )
        .await;
        assert_eq!(orphan.status(), StatusCode::NOT_FOUND);
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn month_view_is_owner_only() {
        let state = test_state();
        let (user_id, challenge_id) = owner_and_challenge(&state).await;
        send(
            &state,
            "POST",
            "/v1/tracks/day",
            Some(json!({
                "user_id": user_id,
                "challenge_id": challenge_id,
                "date": today().to_string(),
                "done": true,
            })),
        )
        .await;

        let uri = format!(
            "/v1/challenges/{challenge_id}/tracks/month?user_id={user_id}&date={}",
            today()
        );
        let owner = send(&state, "GET", &uri, None).await;
        assert_eq!(owner.status(), StatusCode::OK);
        let value = response_json(owner).await;
        assert_eq!(value.get("data").and_then(Value::as_array).map(Vec::len), Some(1));

        let uri = format!(
            "/v1/challenges/{challenge_id}/tracks/month?user_id={}&date={}",
            UserId::new(),
            today()
        );
        assert_eq!(send(&state, "GET", &uri, None).await.status(), StatusCode::NOT_FOUND);
    }

    // Test IDs: TSVC-006
    #[tokio::test]
    async fn settlement_and_migration_endpoints_return_envelopes() {
        let state = test_state();

        let body = json!({ "dry_run": true });
        let planned = send(&state, "POST", "/v1/db/migrate", Some(body)).await;
        assert_eq!(planned.status(), StatusCode::OK);
        let value = response_json(planned).await;
        assert_eq!(value.pointer("/data/dry_run").and_then(Value::as_bool), Some(true));

        owner_and_challenge(&state).await;
        let report = send(&state, "POST", "/v1/settlement/run", None).await;
        assert_eq!(report.status(), StatusCode::OK);
        let value = response_json(report).await;
        assert_eq!(value.pointer("/data/challenges_seen").and_then(Value::as_u64), Some(1));
        assert_eq!(
            value.get("api_contract_version").and_then(Value::as_str),
            Some(API_CONTRACT_VERSION)
        );
    }

    // Test IDs: TSVC-007
    #[tokio::test]
    async fn recompute_skips_future_dates_and_rejects_closed_ones() {
        let state = test_state();
        let (_, challenge_id) = owner_and_challenge(&state).await;
        let Some(tomorrow) = today().next_day() else {
            panic!("calendar overflow");
        };

        let response = send(
            &state,
            "POST",
            "/v1/engine/recompute",
            Some(json!({
                "challenge_id": challenge_id,
                "date": tomorrow.to_string(),
                "done": true,
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value.pointer("/data/applied").and_then(Value::as_bool), Some(false));

        let Some(closed) = today().checked_sub(time::Duration::days(10)) else {
            panic!("calendar underflow");
        };
        let response = send(
            &state,
            "POST",
            "/v1/engine/recompute",
            Some(json!({
                "challenge_id": challenge_id,
                "date": closed.to_string(),
                "done": true,
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    // Test IDs: TSVC-008
    #[tokio::test]
    async fn integrity_check_endpoint_reports_healthy_database() {
        let state = test_state();
        owner_and_challenge(&state).await;

        let response = send(&state, "POST", "/v1/db/integrity-check", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value.pointer("/data/quick_check_ok").and_then(Value::as_bool), Some(true));
        assert_eq!(
            value.pointer("/data/challenges_with_settlement_holes").and_then(Value::as_i64),
            Some(0)
        );
    }
}
