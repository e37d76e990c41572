//! HTTP Server - 提供 REST API 和 WebSocket 支持

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use parley_config::ServerConfig;
use parley_core::{Chat, ChatId, ChatSummary, StoredMessage};
use parley_gateway::{serve_socket, RegistryError, ServerEnvelope};
use parley_store::{types::DEFAULT_PAGE_SIZE, ChatPage, MessagePage, NewChat, Page, StorageError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, Instrument};

use crate::error::{codes, RelayError};
use crate::logging::connection_span;
use crate::state::AppState;

type SharedState = Arc<AppState>;

/// 错误响应
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Error returned by the REST handlers
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.message,
            code: self.code.to_string(),
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        if err.is_not_found() {
            Self::new(StatusCode::NOT_FOUND, codes::NOT_FOUND, err.to_string())
        } else {
            Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::PERSISTENCE_FAILED,
                err.to_string(),
            )
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        let status = match &err {
            RelayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RelayError::UpstreamRequestFailed(_) | RelayError::UpstreamDecodeFailed(_) => {
                StatusCode::BAD_GATEWAY
            }
            RelayError::PersistenceFailed(_) | RelayError::ClientDisconnected => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.code(), err.to_string())
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Closed => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                codes::UNAVAILABLE,
                err.to_string(),
            ),
            RegistryError::Encode(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::INVALID_REQUEST,
                err.to_string(),
            ),
        }
    }
}

/// 会话列表查询参数
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListChatsQuery {
    pub user_id: String,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub page_size: Option<u32>,
}

/// 分页查询参数
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub page_size: Option<u32>,
}

impl PageQuery {
    fn page(&self) -> Page {
        Page::new(
            self.page.unwrap_or(1),
            self.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        )
    }
}

/// 创建会话请求
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChatRequest {
    pub title: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// 修改会话标题请求
#[derive(Debug, Deserialize)]
pub struct RenameChatRequest {
    pub title: String,
}

/// 发送消息请求
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// 发送消息响应
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub chat_id: ChatId,
    pub message: Option<StoredMessage>,
}

/// 广播请求
#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    pub message: String,
}

/// 运行 HTTP 服务器，`shutdown` 取消后优雅退出
pub async fn run_server(
    state: AppState,
    config: &ServerConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid address: {}", e))?;

    let app = create_router(state, config.cors);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Parley server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Parley server stopped");
    Ok(())
}

/// 创建路由
pub fn create_router(state: AppState, cors: bool) -> Router {
    let router = Router::new()
        // 健康检查
        .route("/health", get(health_handler))
        // WebSocket
        .route("/ws/:user_id", get(websocket_handler))
        // 会话
        .route(
            "/api/v1/chats",
            get(list_chats_handler).post(create_chat_handler),
        )
        .route(
            "/api/v1/chats/:chat_id",
            get(get_chat_handler)
                .put(rename_chat_handler)
                .delete(delete_chat_handler),
        )
        .route(
            "/api/v1/chats/:chat_id/messages",
            get(list_messages_handler).post(send_message_handler),
        )
        // 广播
        .route("/api/v1/broadcast", post(broadcast_handler))
        .layer(TraceLayer::new_for_http());

    let router = if cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    };
    router.with_state(Arc::new(state))
}

/// 健康检查处理器
async fn health_handler(State(state): State<SharedState>) -> impl IntoResponse {
    let connections = state.registry.connection_count().await;
    let timestamp = chrono::Utc::now().to_rfc3339();

    match state.store.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "timestamp": timestamp,
                "connections": connections,
            })),
        ),
        Err(e) => {
            tracing::error!("Storage health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "timestamp": timestamp,
                    "connections": connections,
                    "error": e.to_string(),
                })),
            )
        }
    }
}

/// WebSocket 处理器
async fn websocket_handler(
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let span = connection_span(&user_id);
    let registry = state.registry.clone();
    let dispatcher = state.dispatcher.clone();
    let inbound = state.inbound.clone();

    // oversize frames must reach the read loop to be answered
    ws.max_message_size(inbound.max_frame_bytes.saturating_mul(2))
        .on_upgrade(move |socket| {
            async move {
                serve_socket(socket, user_id, registry, dispatcher, inbound).await;
            }
            .instrument(span)
        })
}

/// 会话列表处理器
async fn list_chats_handler(
    State(state): State<SharedState>,
    Query(query): Query<ListChatsQuery>,
) -> Result<Json<ChatPage>, ApiError> {
    let page = Page::new(
        query.page.unwrap_or(1),
        query.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
    );
    Ok(Json(state.store.list_chats(&query.user_id, page).await?))
}

/// 创建会话处理器
async fn create_chat_handler(
    State(state): State<SharedState>,
    Json(req): Json<CreateChatRequest>,
) -> Result<(StatusCode, Json<ChatSummary>), ApiError> {
    let title = required_title(&req.title)?;
    let chat = state
        .store
        .create_chat(NewChat {
            title,
            user_id: req.user_id.unwrap_or_else(|| "anonymous".to_string()),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(chat.summary())))
}

/// 修改会话标题处理器
async fn rename_chat_handler(
    State(state): State<SharedState>,
    Path(chat_id): Path<ChatId>,
    Json(req): Json<RenameChatRequest>,
) -> Result<Json<ChatSummary>, ApiError> {
    let title = required_title(&req.title)?;
    let chat = state.store.rename_chat(chat_id, title).await?;
    Ok(Json(chat.summary()))
}

/// 删除会话处理器
async fn delete_chat_handler(
    State(state): State<SharedState>,
    Path(chat_id): Path<ChatId>,
) -> Result<StatusCode, ApiError> {
    state.store.delete_chat(chat_id).await?;
    info!("Deleted chat {}", chat_id);
    Ok(StatusCode::NO_CONTENT)
}

/// 会话消息分页处理器
async fn list_messages_handler(
    State(state): State<SharedState>,
    Path(chat_id): Path<ChatId>,
    Query(query): Query<PageQuery>,
) -> Result<Json<MessagePage>, ApiError> {
    Ok(Json(state.store.list_messages(chat_id, query.page()).await?))
}

fn required_title(title: &str) -> Result<String, ApiError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            codes::INVALID_REQUEST,
            "title must not be empty",
        ));
    }
    Ok(title.to_string())
}

/// 获取会话处理器
async fn get_chat_handler(
    State(state): State<SharedState>,
    Path(chat_id): Path<ChatId>,
) -> Result<Json<Chat>, ApiError> {
    tracing::debug!("Fetching chat: {}", chat_id);
    Ok(Json(state.store.get_chat(chat_id).await?))
}

/// 非流式发送消息处理器
async fn send_message_handler(
    State(state): State<SharedState>,
    Path(chat_id): Path<ChatId>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, ApiError> {
    if req.content.trim().is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            codes::INVALID_REQUEST,
            "content must not be empty",
        ));
    }
    let user_id = req.user_id.unwrap_or_else(|| "anonymous".to_string());

    let outcome = state
        .orchestrator
        .handle_message(None, chat_id, &req.content, &user_id)
        .await?;
    Ok(Json(SendMessageResponse {
        chat_id: outcome.chat_id,
        message: outcome.reply,
    }))
}

/// 广播处理器
async fn broadcast_handler(
    State(state): State<SharedState>,
    Json(req): Json<BroadcastRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let recipients = state.registry.connection_count().await;
    state
        .registry
        .broadcast_envelope(&ServerEnvelope::system(req.message))
        .await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "recipients": recipients }))))
}
