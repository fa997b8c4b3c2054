use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::config::{AuthMode, CompanionConfig};
use crate::database::{self, Account, AccountError};
use crate::orchestrator::voice_reference;
use crate::personality::{self, Personality};
use crate::pomodoro::PomodoroPlan;
use crate::runtime::BackendRuntime;
use crate::speech::SayRequest;

type ApiError = (StatusCode, Json<Value>);

#[derive(Clone)]
pub struct ServerState {
    pub runtime: Arc<BackendRuntime>,
    pub auth: BackendAuthConfig,
}

impl ServerState {
    pub fn new(runtime: Arc<BackendRuntime>) -> Result<Self> {
        let auth = BackendAuthConfig::from_config(&runtime.config)?;
        Ok(Self { runtime, auth })
    }
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

impl BackendAuthConfig {
    pub fn from_config(config: &CompanionConfig) -> Result<Self> {
        let token = config
            .auth_token
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        if config.auth_mode == AuthMode::Required && token.is_none() {
            return Err(anyhow!(
                "BODYDOUBLE_TOKEN is required when auth mode is 'required'"
            ));
        }
        if config.auth_mode == AuthMode::Disabled {
            tracing::warn!("Backend auth mode is disabled; all API routes are unauthenticated");
        }
        Ok(Self {
            mode: config.auth_mode,
            token,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    username: String,
    password: String,
    #[serde(default)]
    voice_model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct VoiceModelRequest {
    voice_model: String,
}

#[derive(Debug, Serialize)]
struct AccountResponse {
    ok: bool,
    #[serde(flatten)]
    account: Account,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    user_id: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct VoiceToggleRequest {
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct PersonalityRequest {
    personality_id: String,
}

#[derive(Debug, Deserialize)]
struct PomodoroStartRequest {
    user_id: String,
    #[serde(default)]
    focus_min: Option<u32>,
    #[serde(default)]
    break_min: Option<u32>,
    #[serde(default)]
    cycles: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct PomodoroStopRequest {
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct AsrQuery {
    #[serde(default = "default_language")]
    language: String,
}

fn default_language() -> String {
    "en".to_string()
}

#[derive(Debug, Deserialize)]
struct GmailInitiateRequest {
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GmailStatusQuery {
    #[serde(default)]
    connection_id: String,
}

pub async fn serve_backend(runtime: BackendRuntime) -> Result<()> {
    let bind_addr = runtime
        .config
        .bind_addr
        .parse::<SocketAddr>()
        .context("Invalid BODYDOUBLE_BIND (expected host:port)")?;
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Body double backend listening on http://{}", bind_addr);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
        }
        signal_token.cancel();
    });

    serve_on(listener, Arc::new(runtime), shutdown).await
}

/// Serve on an already bound listener until `shutdown` fires, running the
/// background tasks for the same lifetime.
pub async fn serve_on(
    listener: tokio::net::TcpListener,
    runtime: Arc<BackendRuntime>,
    shutdown: CancellationToken,
) -> Result<()> {
    let state = Arc::new(ServerState::new(runtime.clone())?);
    let background = runtime.spawn_background_tasks(shutdown.clone());

    let server_shutdown = shutdown.clone();
    let served = axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await
        .context("Backend server failed");

    shutdown.cancel();
    runtime.shutdown().await;
    for task in background {
        if let Err(e) = task.await {
            tracing::warn!("Background task failed during shutdown: {}", e);
        }
    }
    served
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/accounts/register", post(register_account))
        .route("/accounts/login", post(login_account))
        .route("/accounts/:username", get(get_account))
        .route("/accounts/:username/voice-model", post(update_voice_model))
        .route("/chat/send", post(chat_send))
        .route("/prefs/personalities", get(list_personalities))
        .route("/prefs/:user_id", get(get_prefs))
        .route("/prefs/:user_id/voice", post(set_voice_pref))
        .route("/prefs/:user_id/personality", post(set_personality_pref))
        .route("/pomodoro/start", post(start_pomodoro))
        .route("/pomodoro/stop", post(stop_pomodoro))
        .route("/voice/say", post(voice_say))
        .route("/voice/asr", post(voice_asr))
        .route("/integrations/gmail/initiate", post(gmail_initiate))
        .route("/integrations/gmail/status", get(gmail_status))
        .route("/integrations/composio/health", get(composio_health))
        .route("/ws/events/:user_id", get(ws_events_route))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/healthz", get(health))
        .merge(protected)
        .with_state(state)
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    if auth_value.trim() != format!("Bearer {}", token) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

fn api_error(status: StatusCode, code: &str) -> ApiError {
    (status, Json(json!({ "error": code })))
}

fn api_error_detail(status: StatusCode, code: &str, detail: impl std::fmt::Display) -> ApiError {
    (status, Json(json!({ "error": code, "detail": detail.to_string() })))
}

fn internal_error(error: anyhow::Error) -> ApiError {
    api_error_detail(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", format!("{:#}", error))
}

fn personality_summary(personality: &Personality) -> Value {
    json!({
        "id": personality.id,
        "title": personality.title,
        "description": personality.description,
    })
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true, "voice_backend": "FishREST" }))
}

async fn register_account(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<AccountResponse>, ApiError> {
    let runtime = &state.runtime;
    let account = match database::register_blocking(
        runtime.accounts.clone(),
        body.username,
        body.password,
        body.voice_model,
    )
    .await
    {
        Ok(account) => account,
        Err(AccountError::UsernameTaken) => {
            return Err(api_error(StatusCode::CONFLICT, "username_taken"))
        }
        Err(AccountError::InvalidCredentials) => {
            return Err(api_error(StatusCode::BAD_REQUEST, "invalid_credentials"))
        }
        Err(AccountError::Storage(e)) => {
            return Err(api_error_detail(
                StatusCode::INTERNAL_SERVER_ERROR,
                "account_creation_failed",
                format!("{:#}", e),
            ))
        }
    };

    runtime.agent.ensure_agent(&account.username).await;
    runtime.prefs.ensure(&account.username);
    let account = runtime
        .accounts
        .get(&account.username)
        .map_err(internal_error)?
        .unwrap_or(account);
    Ok(Json(AccountResponse { ok: true, account }))
}

async fn login_account(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<AccountResponse>, ApiError> {
    if body.username.trim().is_empty() || body.password.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "invalid_credentials"));
    }
    match database::login_blocking(state.runtime.accounts.clone(), body.username, body.password).await {
        Ok(account) => {
            state.runtime.prefs.ensure(&account.username);
            Ok(Json(AccountResponse { ok: true, account }))
        }
        Err(AccountError::Storage(e)) => Err(internal_error(e)),
        Err(_) => Err(api_error(StatusCode::UNAUTHORIZED, "invalid_credentials")),
    }
}

async fn get_account(
    State(state): State<Arc<ServerState>>,
    Path(username): Path<String>,
) -> Result<Json<Account>, ApiError> {
    state
        .runtime
        .accounts
        .get(&username)
        .map_err(internal_error)?
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "not_found"))
}

async fn update_voice_model(
    State(state): State<Arc<ServerState>>,
    Path(username): Path<String>,
    Json(body): Json<VoiceModelRequest>,
) -> Result<Json<Value>, ApiError> {
    let accounts = &state.runtime.accounts;
    if accounts.get(&username).map_err(internal_error)?.is_none() {
        return Err(api_error(StatusCode::NOT_FOUND, "not_found"));
    }
    let voice_model = body.voice_model.trim();
    if voice_model.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "invalid_voice_model"));
    }
    accounts
        .set_voice_model(&username, voice_model)
        .map_err(internal_error)?;
    Ok(Json(json!({
        "ok": true,
        "username": username,
        "voice_model": voice_model,
    })))
}

async fn chat_send(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<ChatRequest>,
) -> Json<crate::chat::ChatReply> {
    Json(state.runtime.chat.send(&body.user_id, &body.text).await)
}

async fn list_personalities() -> Json<Value> {
    let items: Vec<Value> = personality::list().iter().map(personality_summary).collect();
    Json(json!({ "items": items }))
}

async fn get_prefs(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let prefs = state.runtime.prefs.get(&user_id);
    let personality = personality::resolve(Some(&prefs.personality_id));
    let account = state.runtime.accounts.get(&user_id).map_err(internal_error)?;
    Ok(Json(json!({
        "user_id": user_id,
        "voice_enabled": prefs.voice_enabled,
        "personality": personality_summary(personality),
        "voice_model": account.and_then(|account| account.voice_model),
    })))
}

async fn set_voice_pref(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<String>,
    Json(body): Json<VoiceToggleRequest>,
) -> Json<Value> {
    let prefs = state
        .runtime
        .prefs
        .update(&user_id, |prefs| prefs.voice_enabled = body.enabled);
    Json(json!({
        "ok": true,
        "user_id": user_id,
        "voice_enabled": prefs.voice_enabled,
    }))
}

async fn set_personality_pref(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<String>,
    Json(body): Json<PersonalityRequest>,
) -> Result<Json<Value>, ApiError> {
    let Some(personality) = personality::find(&body.personality_id) else {
        let available: Vec<&str> = personality::list().iter().map(|p| p.id).collect();
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "unknown_personality", "available": available })),
        ));
    };
    state
        .runtime
        .prefs
        .update(&user_id, |prefs| prefs.personality_id = personality.id.to_string());
    Ok(Json(json!({
        "ok": true,
        "user_id": user_id,
        "personality": personality_summary(personality),
    })))
}

async fn start_pomodoro(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<PomodoroStartRequest>,
) -> Json<Value> {
    let config = &state.runtime.config;
    let plan = PomodoroPlan {
        focus_min: body.focus_min.unwrap_or(config.default_focus_min),
        break_min: body.break_min.unwrap_or(config.default_break_min),
        cycles: body.cycles.unwrap_or(1),
    };
    state.runtime.pomodoro.start(&body.user_id, plan).await;
    Json(json!({ "ok": true }))
}

async fn stop_pomodoro(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<PomodoroStopRequest>,
) -> Json<Value> {
    state.runtime.pomodoro.stop(&body.user_id).await;
    Json(json!({ "ok": true }))
}

async fn voice_say(
    State(state): State<Arc<ServerState>>,
    Json(mut body): Json<SayRequest>,
) -> Result<Response, ApiError> {
    let runtime = &state.runtime;
    let explicit = body
        .reference_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty());
    if explicit.is_none() {
        if let Some(user_id) = body.user_id.as_deref() {
            let prefs = runtime.prefs.get(user_id);
            let persona = personality::resolve(Some(&prefs.personality_id));
            let account = runtime.accounts.get(user_id).map_err(internal_error)?;
            body.reference_id = voice_reference(account.as_ref(), persona);
        }
    }

    match runtime.speech.synthesize(&body).await {
        Ok(audio) => Ok((
            [(header::CONTENT_TYPE, body.media_type())],
            Body::from_stream(audio),
        )
            .into_response()),
        Err(e) => {
            tracing::warn!("Speech synthesis failed: {:#}", e);
            Err(api_error_detail(
                StatusCode::INTERNAL_SERVER_ERROR,
                "TTS generation failed",
                format!("{:#}", e),
            ))
        }
    }
}

async fn voice_asr(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<AsrQuery>,
    mut multipart: Multipart,
) -> Result<Json<crate::speech::Transcript>, ApiError> {
    let mut audio = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| api_error_detail(StatusCode::BAD_REQUEST, "invalid_upload", e))?
    {
        if field.name() == Some("file") {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| api_error_detail(StatusCode::BAD_REQUEST, "invalid_upload", e))?;
            audio = Some(bytes.to_vec());
            break;
        }
    }
    let audio = audio.ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "missing_file"))?;

    state
        .runtime
        .speech
        .transcribe(audio, &query.language)
        .await
        .map(Json)
        .map_err(|e| {
            tracing::warn!("Transcription failed: {:#}", e);
            api_error_detail(StatusCode::INTERNAL_SERVER_ERROR, "asr_failed", format!("{:#}", e))
        })
}

fn connector_error(error: crate::connector::ConnectorError) -> ApiError {
    let status = if error.is_client_error() {
        StatusCode::BAD_REQUEST
    } else {
        tracing::warn!("Connector request failed: {}", error);
        StatusCode::INTERNAL_SERVER_ERROR
    };
    api_error_detail(status, error.code(), &error)
}

async fn gmail_initiate(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<GmailInitiateRequest>,
) -> Result<Json<crate::connector::GmailConnection>, ApiError> {
    state
        .runtime
        .connector
        .initiate_gmail(body.user_id.as_deref())
        .await
        .map(Json)
        .map_err(connector_error)
}

async fn gmail_status(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<GmailStatusQuery>,
) -> Result<Json<crate::connector::ConnectionStatus>, ApiError> {
    state
        .runtime
        .connector
        .connection_status(&query.connection_id)
        .await
        .map(Json)
        .map_err(connector_error)
}

async fn composio_health(
    State(state): State<Arc<ServerState>>,
) -> Json<crate::connector::ConnectorHealth> {
    Json(state.runtime.connector.health())
}

async fn ws_events_route(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(state, user_id, socket))
}

async fn handle_events_socket(state: Arc<ServerState>, user_id: String, mut socket: WebSocket) {
    let (outbox_tx, outbox_rx) = flume::unbounded::<String>();
    let connection_id = state.runtime.rooms.join(&user_id, outbox_tx);

    loop {
        tokio::select! {
            outgoing = outbox_rx.recv_async() => {
                match outgoing {
                    Ok(payload) => {
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    state.runtime.rooms.leave(&user_id, connection_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn required(token: &str) -> BackendAuthConfig {
        BackendAuthConfig {
            mode: AuthMode::Required,
            token: Some(token.to_string()),
        }
    }

    #[test]
    fn authorize_accepts_matching_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer token-123"),
        );
        assert!(authorize(&headers, &required("token-123")).is_ok());
    }

    #[test]
    fn authorize_rejects_missing_or_invalid_token() {
        assert!(authorize(&HeaderMap::new(), &required("token-123")).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer wrong"),
        );
        assert!(authorize(&headers, &required("token-123")).is_err());
    }

    #[test]
    fn authorize_allows_when_auth_mode_disabled() {
        let auth = BackendAuthConfig {
            mode: AuthMode::Disabled,
            token: None,
        };
        assert!(authorize(&HeaderMap::new(), &auth).is_ok());
    }

    #[test]
    fn required_auth_without_token_is_rejected_at_startup() {
        let config = CompanionConfig {
            auth_mode: AuthMode::Required,
            auth_token: Some("   ".to_string()),
            ..CompanionConfig::default()
        };
        assert!(BackendAuthConfig::from_config(&config).is_err());
    }

    #[test]
    fn connector_errors_map_to_status_codes() {
        let (status, Json(body)) = connector_error(crate::connector::ConnectorError::NotConfigured);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "composio_not_configured");

        let (status, Json(body)) = connector_error(crate::connector::ConnectorError::Request {
            code: "get_status_failed",
            source: anyhow!("timeout"),
        });
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "get_status_failed");
    }
}
