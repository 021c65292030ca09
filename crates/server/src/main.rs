use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use server_api::{
    draft_reply, moderate_text, register_push_token, spawn_fanout_worker, summarize_chat,
    update_presence, ApiContext, FixedWindowLimiter, HttpPushSender, LoggingPushSender,
    PushSender,
};
use shared::{
    assist::StubAssistant,
    domain::{ChatId, UserId},
    error::{ApiError, ErrorCode},
};
use storage::Store;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

mod config;

use config::{load_settings, prepare_database_url};

const MAX_BODY_BYTES: usize = 64 * 1024;
const LIMITER_EVICTION_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
struct AppState {
    api: ApiContext,
    auth_secret: String,
}

#[derive(Debug, Deserialize)]
struct PresenceRequest {
    status: String,
}

#[derive(Debug, Deserialize)]
struct PushRegisterRequest {
    token: String,
}

#[derive(Debug, Deserialize)]
struct AssistChatRequest {
    chat_id: String,
}

#[derive(Debug, Deserialize)]
struct ModerateRequest {
    text: String,
}

#[derive(Debug, Serialize)]
struct SummaryResponse {
    summary: String,
}

#[derive(Debug, Serialize)]
struct DraftResponse {
    suggestions: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ModerateResponse {
    approved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let store = Store::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        anyhow::anyhow!(error)
    })?;

    let limiter = Arc::new(FixedWindowLimiter::new());
    let eviction_limiter = Arc::clone(&limiter);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(LIMITER_EVICTION_INTERVAL);
        loop {
            ticker.tick().await;
            eviction_limiter.evict_expired();
        }
    });

    let push_sender: Arc<dyn PushSender> =
        match (&settings.push_endpoint, &settings.push_server_key) {
            (Some(endpoint), Some(key)) => Arc::new(HttpPushSender::new(endpoint, key)),
            _ => {
                info!("no push endpoint configured; notifications will be logged only");
                Arc::new(LoggingPushSender)
            }
        };
    spawn_fanout_worker(store.clone(), push_sender);

    let api = ApiContext {
        store,
        limiter,
        assistant: Arc::new(StubAssistant),
    };
    let state = AppState {
        api,
        auth_secret: settings.auth_secret.clone(),
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/presence", post(http_presence))
        .route("/push/register", post(http_register_push_token))
        .route("/assist/summarize", post(http_summarize))
        .route("/assist/draft", post(http_draft))
        .route("/assist/moderate", post(http_moderate))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

async fn healthz(
    State(state): State<Arc<AppState>>,
) -> Result<&'static str, (StatusCode, Json<ApiError>)> {
    state
        .api
        .store
        .health_check()
        .await
        .map_err(|error| reject(ApiError::new(ErrorCode::Internal, error.to_string())))?;
    Ok("ok")
}

async fn http_presence(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<PresenceRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiError>)> {
    let user_id = authenticate(&state, &headers)?;
    update_presence(&state.api, &user_id, &req.status)
        .await
        .map_err(reject)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn http_register_push_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<PushRegisterRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiError>)> {
    let user_id = authenticate(&state, &headers)?;
    register_push_token(&state.api, &user_id, &req.token)
        .await
        .map_err(reject)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn http_summarize(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<AssistChatRequest>,
) -> Result<Json<SummaryResponse>, (StatusCode, Json<ApiError>)> {
    let user_id = authenticate(&state, &headers)?;
    let summary = summarize_chat(&state.api, &user_id, &ChatId::new(req.chat_id))
        .await
        .map_err(reject)?;
    Ok(Json(SummaryResponse { summary }))
}

async fn http_draft(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<AssistChatRequest>,
) -> Result<Json<DraftResponse>, (StatusCode, Json<ApiError>)> {
    let user_id = authenticate(&state, &headers)?;
    let suggestions = draft_reply(&state.api, &user_id, &ChatId::new(req.chat_id))
        .await
        .map_err(reject)?;
    Ok(Json(DraftResponse { suggestions }))
}

async fn http_moderate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ModerateRequest>,
) -> Result<Json<ModerateResponse>, (StatusCode, Json<ApiError>)> {
    let user_id = authenticate(&state, &headers)?;
    let outcome = moderate_text(&state.api, &user_id, &req.text)
        .await
        .map_err(reject)?;
    Ok(Json(ModerateResponse {
        approved: outcome.approved,
        reason: outcome.reason,
    }))
}

fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<UserId, (StatusCode, Json<ApiError>)> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| {
            reject(ApiError::new(
                ErrorCode::Unauthorized,
                "missing bearer token",
            ))
        })?;

    let decoded = decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.auth_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| reject(ApiError::new(ErrorCode::Unauthorized, "invalid bearer token")))?;
    Ok(UserId::new(decoded.claims.sub))
}

fn reject(error: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match error.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation | ErrorCode::ModerationRejected => StatusCode::BAD_REQUEST,
        ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(error))
}
