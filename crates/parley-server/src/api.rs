use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, Method},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use parley_shared::constants::PROTOCOL_VERSION;
use parley_shared::{Message, MessageId, RoomId, UserId};

use crate::auth::IdentityVerifier;
use crate::blob_store::{content_type_for, BlobStore};
use crate::channels::ChannelManager;
use crate::config::ServerConfig;
use crate::dispatcher::{Attachment, AttachmentOutcome, Dispatcher};
use crate::error::ServerError;
use crate::friends::FriendNotifier;
use crate::gateway::PersistenceGateway;
use crate::registry::ConnectionRegistry;
use crate::session;

/// Most files accepted in one upload request.
const MAX_FILES_PER_UPLOAD: usize = 10;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub friends: Arc<FriendNotifier>,
    pub verifier: Arc<IdentityVerifier>,
    pub blob_store: Arc<BlobStore>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Wire up the routing core around `gateway`.
    pub async fn new(
        config: ServerConfig,
        gateway: Arc<dyn PersistenceGateway>,
    ) -> Result<Self, ServerError> {
        let blob_store = BlobStore::new(
            config.blob_storage_path.clone(),
            config.public_base_url.clone(),
            config.max_blob_size,
        )
        .await?;

        let registry = Arc::new(ConnectionRegistry::new());
        let channels = Arc::new(ChannelManager::new());
        let dispatcher = Dispatcher::new(registry.clone(), channels, gateway.clone());
        let friends = FriendNotifier::new(registry, gateway);

        Ok(Self {
            dispatcher: Arc::new(dispatcher),
            friends: Arc::new(friends),
            verifier: Arc::new(IdentityVerifier::new(config.jwt_secret.as_bytes())),
            blob_store: Arc::new(blob_store),
            config: Arc::new(config),
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let origin = match state
        .config
        .cors_origin
        .as_deref()
        .and_then(|o| HeaderValue::from_str(o).ok())
    {
        Some(origin) => AllowOrigin::exact(origin),
        None => AllowOrigin::any(),
    };
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let body_limit = state
        .blob_store
        .max_size()
        .saturating_mul(MAX_FILES_PER_UPLOAD)
        .saturating_add(64 * 1024);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_upgrade))
        .route("/messages/upload", post(upload_attachments))
        .route("/messages/room/{room_id}", get(room_history))
        .route("/messages/{id}/unsend", post(unsend_message))
        .route("/messages/{id}/delete", post(delete_message))
        .route("/messages/{id}/{recipient_id}", get(direct_history))
        .route("/files/{key}", get(file_download))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    protocol: &'static str,
    online: usize,
}

#[derive(Deserialize)]
struct WsAuthQuery {
    #[serde(default)]
    token: String,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        protocol: PROTOCOL_VERSION,
        online: state.dispatcher.registry().len().await,
    })
}

/// GET /ws?token=JWT
///
/// Authentication failures still upgrade, then close with 4001 (expired) or
/// 4002 (invalid) so browser clients can read the reason.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsAuthQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    match state.verifier.verify(&params.token) {
        Ok(user) => {
            info!(user = %user, "WebSocket connection authenticated");
            ws.on_upgrade(move |socket| session::run_session(socket, state, user))
        }
        Err(err) => {
            warn!(close_code = session::close_code_for(err), error = %err, "WebSocket auth failed");
            ws.on_upgrade(move |socket| session::reject(socket, err))
        }
    }
}

/// Resolve the caller from `Authorization: Bearer <token>`.
fn authenticate(headers: &HeaderMap, verifier: &IdentityVerifier) -> Result<UserId, ServerError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ServerError::Unauthorized)?;

    Ok(verifier.verify(token.trim())?)
}

async fn upload_attachments(
    headers: HeaderMap,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Vec<AttachmentOutcome>>, ServerError> {
    let sender = authenticate(&headers, &state.verifier)?;

    let mut room_id: Option<RoomId> = None;
    let mut recipient_id: Option<UserId> = None;
    let mut files = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("Multipart error: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "roomId" => {
                let text = field_text(field).await?;
                if !text.is_empty() {
                    room_id = Some(parse_id(&text, "roomId")?);
                }
            }
            "recipientId" => {
                let text = field_text(field).await?;
                if !text.is_empty() {
                    recipient_id = Some(parse_id(&text, "recipientId")?);
                }
            }
            "file" => {
                if files.len() == MAX_FILES_PER_UPLOAD {
                    return Err(ServerError::BadRequest(format!(
                        "At most {MAX_FILES_PER_UPLOAD} files per upload"
                    )));
                }
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ServerError::BadRequest(format!("Failed to read field: {}", e)))?;
                files.push(Attachment {
                    file_name,
                    bytes: bytes.to_vec(),
                });
            }
            _ => {}
        }
    }

    let count = files.len();
    let outcomes = state
        .dispatcher
        .send_attachments(&state.blob_store, sender, room_id, recipient_id, files)
        .await?;

    info!(
        sender = %sender,
        files = count,
        failed = outcomes.iter().filter(|o| o.error.is_some()).count(),
        "Attachments processed via API"
    );

    Ok(Json(outcomes))
}

async fn field_text(field: axum::extract::multipart::Field<'_>) -> Result<String, ServerError> {
    field
        .text()
        .await
        .map(|t| t.trim().to_string())
        .map_err(|e| ServerError::BadRequest(format!("Failed to read field: {}", e)))
}

fn parse_id<T: std::str::FromStr>(raw: &str, field: &str) -> Result<T, ServerError> {
    raw.parse()
        .map_err(|_| ServerError::BadRequest(format!("Invalid {field} '{raw}'")))
}

async fn unsend_message(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<MessageId>,
) -> Result<Json<Message>, ServerError> {
    let caller = authenticate(&headers, &state.verifier)?;
    let done = state.dispatcher.unsend(id).await?;
    info!(message = %id, caller = %caller, "Message unsent via API");
    Ok(Json(done.message))
}

async fn delete_message(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<MessageId>,
) -> Result<Json<Message>, ServerError> {
    let caller = authenticate(&headers, &state.verifier)?;
    let done = state.dispatcher.delete(id).await?;
    info!(message = %id, caller = %caller, "Message deleted via API");
    Ok(Json(done.message))
}

async fn room_history(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
) -> Result<Json<Vec<Message>>, ServerError> {
    authenticate(&headers, &state.verifier)?;
    Ok(Json(state.dispatcher.history_in_room(room_id).await?))
}

async fn direct_history(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path((user_id, recipient_id)): Path<(UserId, UserId)>,
) -> Result<Json<Vec<Message>>, ServerError> {
    let caller = authenticate(&headers, &state.verifier)?;
    if caller != user_id && caller != recipient_id {
        return Err(ServerError::Forbidden(
            "Not a participant in this conversation".into(),
        ));
    }
    Ok(Json(
        state.dispatcher.history_between(user_id, recipient_id).await?,
    ))
}

async fn file_download(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, ServerError> {
    let data = state.blob_store.get(&key).await?;
    Ok(([(header::CONTENT_TYPE, content_type_for(&key))], data).into_response())
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
