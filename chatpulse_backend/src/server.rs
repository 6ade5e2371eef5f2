use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::database::{Character, GroupRoom, RoomKind, StoredMessage, UserProfile};
use crate::engine::{DirectExchange, GroupPost, TenantEngine};
use crate::events::EngineEvent;
use crate::group::MAX_PAUSE;
use crate::ledger::{LedgerError, RedPacket, RedPacketKind, Transfer};
use crate::memory::{MemoryEntry, ScoredMemory};
use crate::registry::{TenantConnection, TenantRegistry};
use crate::runtime::BackendRuntime;

#[derive(Clone)]
pub struct ServerState {
    pub registry: Arc<TenantRegistry>,
    pub auth: BackendAuthConfig,
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiEventEnvelope {
    pub event_type: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    active_tenants: usize,
}

#[derive(Debug, Deserialize)]
struct ListMessagesQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SearchMemoriesQuery {
    q: String,
    k: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    content: String,
}

#[derive(Debug, Deserialize)]
struct GroupMessageRequest {
    content: String,
    #[serde(default)]
    mentions: Vec<String>,
    #[serde(default)]
    all: bool,
}

#[derive(Debug, Default, Deserialize)]
struct PauseRequest {
    seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct NoChainRequest {
    no_chain: bool,
}

#[derive(Debug, Deserialize)]
struct CreateGroupRequest {
    name: String,
    members: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RedPacketRequest {
    kind: RedPacketKind,
    count: u32,
    amount: f64,
    #[serde(default)]
    note: String,
}

#[derive(Debug, Deserialize)]
struct TransferRequest {
    amount: f64,
    #[serde(default)]
    note: String,
}

#[derive(Debug, Serialize)]
struct PauseResponse {
    paused_ms: u64,
}

#[derive(Debug, Serialize)]
struct ToggleResponse {
    changed: bool,
}

#[derive(Debug, Serialize)]
struct RedPacketClaimResponse {
    packet: RedPacket,
    amount: f64,
}

pub async fn serve_backend(runtime: BackendRuntime) -> Result<()> {
    let bind_addr = runtime
        .config
        .bind_addr
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid bind address '{}' (expected host:port)", runtime.config.bind_addr))?;

    let auth = load_auth_config()?;
    let state = Arc::new(ServerState {
        registry: runtime.registry.clone(),
        auth,
    });

    let app = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("ChatPulse backend listening on http://{}", bind_addr);
    let served = axum::serve(listener, app)
        .await
        .context("Backend server failed");
    state.registry.shutdown_all();
    served
}

fn build_router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/tenants/:tenant/ws", get(ws_events_route))
        .route("/tenants/:tenant/state", get(get_live_state))
        .route("/tenants/:tenant/profile", get(get_profile).put(update_profile))
        .route(
            "/tenants/:tenant/characters",
            get(list_characters).post(upsert_character),
        )
        .route(
            "/tenants/:tenant/characters/:id",
            get(get_character).delete(delete_character),
        )
        .route("/tenants/:tenant/characters/:id/block", post(block_character))
        .route("/tenants/:tenant/characters/:id/unblock", post(unblock_character))
        .route(
            "/tenants/:tenant/characters/:id/messages",
            get(list_direct_messages).post(send_direct_message),
        )
        .route("/tenants/:tenant/characters/:id/transfers", post(send_transfer))
        .route(
            "/tenants/:tenant/characters/:id/memories/extract",
            post(extract_memories),
        )
        .route(
            "/tenants/:tenant/characters/:id/memories/search",
            get(search_memories),
        )
        .route("/tenants/:tenant/rooms", get(list_rooms).post(create_room))
        .route(
            "/tenants/:tenant/rooms/:id/messages",
            get(list_room_messages).post(post_room_message),
        )
        .route("/tenants/:tenant/rooms/:id/pause", post(pause_room))
        .route("/tenants/:tenant/rooms/:id/resume", post(resume_room))
        .route("/tenants/:tenant/rooms/:id/interrupt", post(interrupt_room))
        .route("/tenants/:tenant/rooms/:id/no-chain", put(set_no_chain))
        .route("/tenants/:tenant/rooms/:id/red-packets", post(send_red_packet))
        .route("/tenants/:tenant/red-packets/:id/claim", post(claim_red_packet))
        .route("/tenants/:tenant/transfers/:id/claim", post(claim_transfer))
        .route("/tenants/:tenant/transfers/:id/refund", post(refund_transfer))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(state, auth_middleware));

    Router::new().nest("/v1", protected)
}

fn map_engine_event(event: EngineEvent) -> ApiEventEnvelope {
    match event {
        EngineEvent::NewMessage(message) => envelope(
            "new_message",
            serde_json::to_value(message).unwrap_or_else(|_| serde_json::json!({})),
        ),
        EngineEvent::EngineState(state) => envelope(
            "engine_state",
            serde_json::to_value(state).unwrap_or_else(|_| serde_json::json!({})),
        ),
        EngineEvent::Typing {
            room_id,
            character_ids,
        } => envelope(
            "typing",
            serde_json::json!({
                "room_id": room_id,
                "character_ids": character_ids
            }),
        ),
        EngineEvent::CharacterUpdated(status) => envelope(
            "character_updated",
            serde_json::to_value(status).unwrap_or_else(|_| serde_json::json!({})),
        ),
        EngineEvent::CharacterRemoved(id) => {
            envelope("character_removed", serde_json::json!({ "id": id }))
        }
        EngineEvent::MomentPosted {
            moment_id,
            author_id,
        } => envelope(
            "moment_posted",
            serde_json::json!({ "moment_id": moment_id, "author_id": author_id }),
        ),
        EngineEvent::MemoriesStored {
            character_id,
            count,
        } => envelope(
            "memories_stored",
            serde_json::json!({ "character_id": character_id, "count": count }),
        ),
        EngineEvent::RedPacketClaimed {
            packet_id,
            claimer_id,
            amount,
        } => envelope(
            "red_packet_claimed",
            serde_json::json!({
                "packet_id": packet_id,
                "claimer_id": claimer_id,
                "amount": amount
            }),
        ),
        EngineEvent::Error(error) => envelope("error", serde_json::json!({ "error": error })),
    }
}

fn envelope(event_type: &str, payload: serde_json::Value) -> ApiEventEnvelope {
    ApiEventEnvelope {
        event_type: event_type.to_string(),
        emitted_at: Utc::now(),
        payload,
    }
}

fn load_auth_config() -> Result<BackendAuthConfig> {
    let mode = parse_auth_mode(std::env::var("CHATPULSE_BACKEND_AUTH_MODE").ok())?;
    let token = std::env::var("CHATPULSE_BACKEND_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "CHATPULSE_BACKEND_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Backend auth mode is disabled; all API routes are unauthenticated");
    }

    Ok(BackendAuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid CHATPULSE_BACKEND_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
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
    let expected = format!("Bearer {}", token);
    if auth_value.trim() != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_tenants: state.registry.active_tenants().len(),
    })
}

// ---- tenant event stream ----

async fn ws_events_route(
    State(state): State<Arc<ServerState>>,
    Path(tenant): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, (StatusCode, String)> {
    let connection = state
        .registry
        .connect(&tenant)
        .map_err(|error| (StatusCode::BAD_REQUEST, error.to_string()))?;
    Ok(ws
        .on_upgrade(move |socket| handle_events_socket(connection, socket))
        .into_response())
}

/// Streams the tenant's events until the client leaves. Dropping the
/// connection at the end releases the tenant.
async fn handle_events_socket(connection: TenantConnection, mut socket: WebSocket) {
    let engine = connection.engine().clone();
    let mut rx = engine.subscribe();

    if let Ok(state) = engine.snapshot_state() {
        let initial = map_engine_event(EngineEvent::EngineState(state));
        if let Ok(payload) = serde_json::to_string(&initial) {
            if socket.send(Message::Text(payload)).await.is_err() {
                return;
            }
        }
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let payload = match serde_json::to_string(&map_engine_event(event)) {
                            Ok(serialized) => serialized,
                            Err(error) => {
                                tracing::warn!("Failed to serialize websocket event: {}", error);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Websocket for {} lagged by {} events", connection.tenant_id(), skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
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
}

// ---- lookups ----

fn require_engine(state: &ServerState, tenant: &str) -> Result<Arc<TenantEngine>, (StatusCode, String)> {
    state.registry.engine(tenant).ok_or_else(|| {
        (
            StatusCode::CONFLICT,
            format!("tenant '{}' has no open connection", tenant),
        )
    })
}

fn require_character(engine: &TenantEngine, id: &str) -> Result<Character, (StatusCode, String)> {
    engine
        .database()
        .get_character(id)
        .map_err(internal_error)?
        .ok_or_else(|| not_found(format!("character '{}' not found", id)))
}

fn require_room(engine: &TenantEngine, id: &str) -> Result<GroupRoom, (StatusCode, String)> {
    engine
        .database()
        .get_group(id)
        .map_err(internal_error)?
        .ok_or_else(|| not_found(format!("room '{}' not found", id)))
}

fn pause_duration(request: &PauseRequest) -> Result<Option<Duration>, (StatusCode, String)> {
    match request.seconds {
        Some(0) => Err((
            StatusCode::BAD_REQUEST,
            "seconds must be positive".to_string(),
        )),
        Some(seconds) if seconds > MAX_PAUSE.as_secs() => Err((
            StatusCode::BAD_REQUEST,
            format!("seconds must be at most {}", MAX_PAUSE.as_secs()),
        )),
        seconds => Ok(seconds.map(Duration::from_secs)),
    }
}

fn require_content(content: &str) -> Result<(), (StatusCode, String)> {
    if content.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "content cannot be empty".to_string(),
        ));
    }
    Ok(())
}

// ---- profile & characters ----

async fn get_live_state(
    State(state): State<Arc<ServerState>>,
    Path(tenant): Path<String>,
) -> ApiResult<serde_json::Value> {
    let engine = require_engine(&state, &tenant)?;
    let snapshot = engine.snapshot_state().map_err(internal_error)?;
    Ok(Json(
        serde_json::to_value(snapshot).unwrap_or_else(|_| serde_json::json!({})),
    ))
}

async fn get_profile(
    State(state): State<Arc<ServerState>>,
    Path(tenant): Path<String>,
) -> ApiResult<UserProfile> {
    let engine = require_engine(&state, &tenant)?;
    engine.database().get_profile().map(Json).map_err(internal_error)
}

async fn update_profile(
    State(state): State<Arc<ServerState>>,
    Path(tenant): Path<String>,
    Json(profile): Json<UserProfile>,
) -> ApiResult<UserProfile> {
    let engine = require_engine(&state, &tenant)?;
    engine.update_profile(&profile).map(Json).map_err(internal_error)
}

async fn list_characters(
    State(state): State<Arc<ServerState>>,
    Path(tenant): Path<String>,
) -> ApiResult<Vec<Character>> {
    let engine = require_engine(&state, &tenant)?;
    engine.database().list_characters().map(Json).map_err(internal_error)
}

async fn get_character(
    State(state): State<Arc<ServerState>>,
    Path((tenant, id)): Path<(String, String)>,
) -> ApiResult<Character> {
    let engine = require_engine(&state, &tenant)?;
    require_character(&engine, &id).map(Json)
}

async fn upsert_character(
    State(state): State<Arc<ServerState>>,
    Path(tenant): Path<String>,
    Json(character): Json<Character>,
) -> ApiResult<Character> {
    let engine = require_engine(&state, &tenant)?;
    if character.name.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "name cannot be empty".to_string()));
    }
    engine.upsert_character(&character).map(Json).map_err(internal_error)
}

async fn delete_character(
    State(state): State<Arc<ServerState>>,
    Path((tenant, id)): Path<(String, String)>,
) -> ApiResult<ToggleResponse> {
    let engine = require_engine(&state, &tenant)?;
    require_character(&engine, &id)?;
    let changed = engine.delete_character(&id).map_err(internal_error)?;
    Ok(Json(ToggleResponse { changed }))
}

async fn block_character(
    State(state): State<Arc<ServerState>>,
    Path((tenant, id)): Path<(String, String)>,
) -> ApiResult<ToggleResponse> {
    let engine = require_engine(&state, &tenant)?;
    require_character(&engine, &id)?;
    engine.block_character(&id).map_err(internal_error)?;
    Ok(Json(ToggleResponse { changed: true }))
}

async fn unblock_character(
    State(state): State<Arc<ServerState>>,
    Path((tenant, id)): Path<(String, String)>,
) -> ApiResult<Character> {
    let engine = require_engine(&state, &tenant)?;
    require_character(&engine, &id)?;
    engine.unblock_character(&id).map(Json).map_err(internal_error)
}

// ---- direct chat ----

async fn list_direct_messages(
    State(state): State<Arc<ServerState>>,
    Path((tenant, id)): Path<(String, String)>,
    Query(query): Query<ListMessagesQuery>,
) -> ApiResult<Vec<StoredMessage>> {
    let engine = require_engine(&state, &tenant)?;
    require_character(&engine, &id)?;
    let limit = clamp_limit(query.limit, 100, 1, 1000);
    engine
        .database()
        .recent_messages(RoomKind::Direct, &id, limit, true)
        .map(Json)
        .map_err(internal_error)
}

async fn send_direct_message(
    State(state): State<Arc<ServerState>>,
    Path((tenant, id)): Path<(String, String)>,
    Json(body): Json<SendMessageRequest>,
) -> ApiResult<DirectExchange> {
    let engine = require_engine(&state, &tenant)?;
    require_character(&engine, &id)?;
    require_content(&body.content)?;
    engine
        .send_direct_message(&id, &body.content)
        .await
        .map(Json)
        .map_err(engine_error)
}

async fn send_transfer(
    State(state): State<Arc<ServerState>>,
    Path((tenant, id)): Path<(String, String)>,
    Json(body): Json<TransferRequest>,
) -> ApiResult<Transfer> {
    let engine = require_engine(&state, &tenant)?;
    require_character(&engine, &id)?;
    engine
        .send_transfer(&id, body.amount, &body.note)
        .map(Json)
        .map_err(engine_error)
}

// ---- memories ----

async fn extract_memories(
    State(state): State<Arc<ServerState>>,
    Path((tenant, id)): Path<(String, String)>,
) -> ApiResult<Vec<MemoryEntry>> {
    let engine = require_engine(&state, &tenant)?;
    require_character(&engine, &id)?;
    engine.extract_memories(&id).await.map(Json).map_err(engine_error)
}

async fn search_memories(
    State(state): State<Arc<ServerState>>,
    Path((tenant, id)): Path<(String, String)>,
    Query(query): Query<SearchMemoriesQuery>,
) -> ApiResult<Vec<ScoredMemory>> {
    let engine = require_engine(&state, &tenant)?;
    require_character(&engine, &id)?;
    let k = clamp_limit(query.k, 5, 1, 50);
    engine
        .search_memories(&id, &query.q, k)
        .await
        .map(Json)
        .map_err(internal_error)
}

// ---- group rooms ----

async fn list_rooms(
    State(state): State<Arc<ServerState>>,
    Path(tenant): Path<String>,
) -> ApiResult<Vec<GroupRoom>> {
    let engine = require_engine(&state, &tenant)?;
    engine.database().list_groups().map(Json).map_err(internal_error)
}

async fn create_room(
    State(state): State<Arc<ServerState>>,
    Path(tenant): Path<String>,
    Json(body): Json<CreateGroupRequest>,
) -> ApiResult<GroupRoom> {
    let engine = require_engine(&state, &tenant)?;
    if body.name.trim().is_empty() || body.members.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "a room needs a name and at least one member".to_string(),
        ));
    }
    for member in &body.members {
        require_character(&engine, member)?;
    }
    engine
        .create_group(body.name.trim(), &body.members)
        .map(Json)
        .map_err(internal_error)
}

async fn list_room_messages(
    State(state): State<Arc<ServerState>>,
    Path((tenant, id)): Path<(String, String)>,
    Query(query): Query<ListMessagesQuery>,
) -> ApiResult<Vec<StoredMessage>> {
    let engine = require_engine(&state, &tenant)?;
    require_room(&engine, &id)?;
    let limit = clamp_limit(query.limit, 100, 1, 1000);
    engine
        .database()
        .recent_messages(RoomKind::Group, &id, limit, true)
        .map(Json)
        .map_err(internal_error)
}

async fn post_room_message(
    State(state): State<Arc<ServerState>>,
    Path((tenant, id)): Path<(String, String)>,
    Json(body): Json<GroupMessageRequest>,
) -> ApiResult<GroupPost> {
    let engine = require_engine(&state, &tenant)?;
    require_room(&engine, &id)?;
    require_content(&body.content)?;
    engine
        .post_group_message(&id, &body.content, &body.mentions, body.all)
        .map(Json)
        .map_err(internal_error)
}

async fn pause_room(
    State(state): State<Arc<ServerState>>,
    Path((tenant, id)): Path<(String, String)>,
    body: Option<Json<PauseRequest>>,
) -> ApiResult<PauseResponse> {
    let engine = require_engine(&state, &tenant)?;
    require_room(&engine, &id)?;
    let request = body.map(|Json(body)| body).unwrap_or_default();
    let duration = pause_duration(&request)?;
    let paused = engine.pause_room(&id, duration).map_err(internal_error)?;
    Ok(Json(PauseResponse {
        paused_ms: paused.as_millis().min(u128::from(u64::MAX)) as u64,
    }))
}

async fn resume_room(
    State(state): State<Arc<ServerState>>,
    Path((tenant, id)): Path<(String, String)>,
) -> ApiResult<ToggleResponse> {
    let engine = require_engine(&state, &tenant)?;
    require_room(&engine, &id)?;
    let changed = engine.resume_room(&id).map_err(internal_error)?;
    Ok(Json(ToggleResponse { changed }))
}

async fn interrupt_room(
    State(state): State<Arc<ServerState>>,
    Path((tenant, id)): Path<(String, String)>,
) -> ApiResult<ToggleResponse> {
    let engine = require_engine(&state, &tenant)?;
    require_room(&engine, &id)?;
    let changed = engine.interrupt_room(&id).map_err(internal_error)?;
    Ok(Json(ToggleResponse { changed }))
}

async fn set_no_chain(
    State(state): State<Arc<ServerState>>,
    Path((tenant, id)): Path<(String, String)>,
    Json(body): Json<NoChainRequest>,
) -> ApiResult<GroupRoom> {
    let engine = require_engine(&state, &tenant)?;
    require_room(&engine, &id)?;
    engine.set_no_chain(&id, body.no_chain).map_err(internal_error)?;
    require_room(&engine, &id).map(Json)
}

// ---- money ----

async fn send_red_packet(
    State(state): State<Arc<ServerState>>,
    Path((tenant, id)): Path<(String, String)>,
    Json(body): Json<RedPacketRequest>,
) -> ApiResult<RedPacket> {
    let engine = require_engine(&state, &tenant)?;
    require_room(&engine, &id)?;
    engine
        .send_red_packet(&id, body.kind, body.count, body.amount, &body.note)
        .map(Json)
        .map_err(engine_error)
}

async fn claim_red_packet(
    State(state): State<Arc<ServerState>>,
    Path((tenant, id)): Path<(String, i64)>,
) -> ApiResult<RedPacketClaimResponse> {
    let engine = require_engine(&state, &tenant)?;
    let (packet, amount) = engine.claim_red_packet(id).map_err(engine_error)?;
    Ok(Json(RedPacketClaimResponse { packet, amount }))
}

async fn claim_transfer(
    State(state): State<Arc<ServerState>>,
    Path((tenant, id)): Path<(String, i64)>,
) -> ApiResult<Transfer> {
    let engine = require_engine(&state, &tenant)?;
    engine.claim_transfer(id).map(Json).map_err(engine_error)
}

async fn refund_transfer(
    State(state): State<Arc<ServerState>>,
    Path((tenant, id)): Path<(String, i64)>,
) -> ApiResult<Transfer> {
    let engine = require_engine(&state, &tenant)?;
    engine.refund_transfer(id).map(Json).map_err(engine_error)
}

fn clamp_limit(value: Option<usize>, default: usize, min: usize, max: usize) -> usize {
    value.unwrap_or(default).clamp(min, max)
}

fn not_found(message: String) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, message)
}

fn internal_error(error: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}

/// Ledger rejections become client errors; anything else is a 500.
fn engine_error(error: anyhow::Error) -> (StatusCode, String) {
    let status = match error.downcast_ref::<LedgerError>() {
        Some(LedgerError::NotFound(_)) => StatusCode::NOT_FOUND,
        Some(LedgerError::InvalidAmount | LedgerError::InvalidCount) => StatusCode::BAD_REQUEST,
        Some(
            LedgerError::InsufficientFunds { .. }
            | LedgerError::AlreadyResolved(_)
            | LedgerError::NotRecipient(_)
            | LedgerError::AlreadyClaimed { .. }
            | LedgerError::Exhausted(_),
        ) => StatusCode::CONFLICT,
        Some(LedgerError::Storage(_) | LedgerError::Other(_)) | None => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, error.to_string())
}
