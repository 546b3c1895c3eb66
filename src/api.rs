//! REST API server for the loan match advisor
//!
//! Exposes calculate-match, accounts, documents, chat sessions and the
//! admin views over HTTP.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::accounts::{AccountService, AuthOutcome};
use crate::admin::{AdminService, ApprovalRequest};
use crate::calculator::CurrencyConverter;
use crate::config::AdvisorConfig;
use crate::documents::{DocumentService, HttpDocumentExtractor, ProcessRequest, SignedUrlObjectStore};
use crate::error::AdvisorError;
use crate::llm::{build_advisory_model, AdvisoryModel, UnconfiguredModel};
use crate::models::MatchRequest;
use crate::recommendation::{MatchAdvisor, RecommendationEngine};
use crate::secrets::{secret_field, CachedSecretStore, FileSecretStore, SecretStore};
use crate::session::{ChatReply, SessionManager};
use crate::store::{build_stores, ProfileStore};

/// Secret holding the extraction service's `apiKey`.
const EXTRACTION_SECRET: &str = "extraction-service";

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrlRequest {
    pub asu_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRequest {
    pub connection_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageRequest {
    pub connection_id: String,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub user_data: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct ListUsersQuery {
    pub limit: Option<usize>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

type Reply = (StatusCode, Json<ApiResponse>);

fn status_of(err: &AdvisorError) -> StatusCode {
    StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn failure(err: AdvisorError) -> Reply {
    let status = status_of(&err);
    if status.is_server_error() {
        error!(kind = err.kind(), "Request failed: {}", err);
    } else {
        warn!(kind = err.kind(), "Request rejected: {}", err);
    }
    (status, Json(ApiResponse::error(err.to_string())))
}

/// Body decoding that reports type errors as validation failures.
fn parse_json<T: DeserializeOwned>(body: Value) -> crate::Result<T> {
    serde_json::from_value(body).map_err(|e| AdvisorError::Validation(format!("Invalid request: {}", e)))
}

fn respond<T: Serialize>(status: StatusCode, result: crate::Result<T>) -> Reply {
    match result {
        Ok(data) => (status, Json(ApiResponse::success(data))),
        Err(err) => failure(err),
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub advisor: Arc<MatchAdvisor>,
    pub sessions: Arc<SessionManager>,
    pub accounts: Arc<AccountService>,
    pub admin: Arc<AdminService>,
    /// Absent when no object store or extraction service is configured.
    pub documents: Option<Arc<DocumentService>>,
}

impl ApiState {
    /// Wires every service from configuration.
    pub async fn from_config(config: &AdvisorConfig) -> crate::Result<Self> {
        let stores = build_stores(config);
        let secrets = CachedSecretStore::new(Arc::new(FileSecretStore::new(config.secrets_dir.clone())));
        let model = build_advisory_model(config, &secrets).await?;

        let engine = match &model {
            Some(model) => RecommendationEngine::new(model.clone()),
            None => RecommendationEngine::fallback_only(),
        };
        let converter = CurrencyConverter::from_api_key(config.exchange_rate_api_key.clone())?;
        let advisor = MatchAdvisor::new(engine, converter, stores.profiles.clone());

        let chat_model = model.unwrap_or_else(|| Arc::new(UnconfiguredModel) as Arc<dyn AdvisoryModel>);
        let sessions = SessionManager::new(stores.sessions.clone(), stores.profiles.clone(), chat_model);

        let documents = match build_documents(config, &secrets, stores.profiles.clone()).await {
            Ok(docs) => Some(Arc::new(docs)),
            Err(err) => {
                warn!("Document handling disabled: {}", err);
                None
            }
        };

        Ok(Self {
            advisor: Arc::new(advisor),
            sessions: Arc::new(sessions),
            accounts: Arc::new(AccountService::new(stores.profiles.clone())),
            admin: Arc::new(AdminService::new(stores.profiles, config.tables.profiles.clone())),
            documents,
        })
    }

    fn documents(&self) -> crate::Result<&DocumentService> {
        self.documents
            .as_deref()
            .ok_or_else(|| AdvisorError::Config("document handling is not configured".into()))
    }
}

async fn build_documents(
    config: &AdvisorConfig,
    secrets: &dyn SecretStore,
    profiles: Arc<dyn ProfileStore>,
) -> crate::Result<DocumentService> {
    let objects = SignedUrlObjectStore::new(&config.object_store)?;
    let url = config
        .extraction_service_url
        .clone()
        .ok_or_else(|| AdvisorError::Config("EXTRACTION_SERVICE_URL is not set".into()))?;

    let api_key = secret_field(secrets, EXTRACTION_SECRET, "apiKey").await.ok();

    Ok(DocumentService::new(
        Arc::new(objects),
        Arc::new(HttpDocumentExtractor::new(url, api_key)?),
        profiles,
        config.object_store.upload_expiration,
    ))
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Accounts & Matching
/// =============================

async fn auth_handler(State(state): State<ApiState>, Json(body): Json<Value>) -> Reply {
    match state.accounts.handle(body).await {
        Ok(outcome @ AuthOutcome::SignedUp(_)) => (StatusCode::CREATED, Json(ApiResponse::success(outcome))),
        Ok(outcome) => (StatusCode::OK, Json(ApiResponse::success(outcome))),
        Err(err) => failure(err),
    }
}

async fn calculate_match(State(state): State<ApiState>, Json(body): Json<Value>) -> Reply {
    let req: MatchRequest = match parse_json(body) {
        Ok(req) => req,
        Err(err) => return failure(err),
    };
    info!(asu_id = ?req.asu_id, "Received calculate-match request");
    respond(StatusCode::OK, state.advisor.calculate(req).await)
}

/// =============================
/// Documents
/// =============================

async fn upload_urls(State(state): State<ApiState>, Json(body): Json<Value>) -> Reply {
    let result = match (state.documents(), parse_json::<UploadUrlRequest>(body)) {
        (Ok(docs), Ok(req)) => docs.upload_urls(req.asu_id.as_deref()).await,
        (Err(err), _) | (_, Err(err)) => Err(err),
    };
    respond(StatusCode::OK, result)
}

async fn process_documents(State(state): State<ApiState>, Json(body): Json<Value>) -> Reply {
    let result = match (state.documents(), parse_json::<ProcessRequest>(body)) {
        (Ok(docs), Ok(req)) => docs.process(req).await,
        (Err(err), _) | (_, Err(err)) => Err(err),
    };
    respond(StatusCode::OK, result)
}

/// =============================
/// Chat Sessions
/// =============================

fn chat_failure(err: AdvisorError) -> (StatusCode, Json<Value>) {
    error!(kind = err.kind(), "Chat request failed: {}", err);
    (
        status_of(&err),
        Json(serde_json::json!({"type": "error", "message": err.to_string()})),
    )
}

async fn chat_connect(State(state): State<ApiState>, Json(req): Json<ConnectionRequest>) -> (StatusCode, Json<Value>) {
    match state.sessions.connect(&req.connection_id).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"message": "Connected"}))),
        Err(err) => chat_failure(err),
    }
}

async fn chat_disconnect(
    State(state): State<ApiState>,
    Json(req): Json<ConnectionRequest>,
) -> (StatusCode, Json<Value>) {
    match state.sessions.disconnect(&req.connection_id).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"message": "Disconnected"}))),
        Err(err) => chat_failure(err),
    }
}

async fn chat_message(
    State(state): State<ApiState>,
    Json(req): Json<ChatMessageRequest>,
) -> (StatusCode, Json<Value>) {
    let result = match req.action.as_deref().unwrap_or("message") {
        "start" => state.sessions.start(&req.connection_id).await,
        "message" => {
            state
                .sessions
                .handle_message(
                    &req.connection_id,
                    req.message.as_deref().unwrap_or_default(),
                    req.user_data.as_ref(),
                )
                .await
        }
        other => Ok(ChatReply::Error {
            message: format!("Unknown action: {}", other),
        }),
    };

    match result {
        Ok(reply) => {
            let status = if reply.is_error() {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::OK
            };
            (
                status,
                Json(serde_json::to_value(&reply).unwrap_or(Value::Null)),
            )
        }
        Err(err) => chat_failure(err),
    }
}

/// =============================
/// Admin
/// =============================

async fn list_users(State(state): State<ApiState>, Query(query): Query<ListUsersQuery>) -> Reply {
    respond(StatusCode::OK, state.admin.list_users(query.limit).await)
}

async fn get_user(State(state): State<ApiState>, Path(asu_id): Path<String>) -> Reply {
    respond(StatusCode::OK, state.admin.get_user(&asu_id).await)
}

async fn user_documents(State(state): State<ApiState>, Path(asu_id): Path<String>) -> Reply {
    respond(StatusCode::OK, state.admin.documents(&asu_id).await)
}

async fn user_status(State(state): State<ApiState>, Path(asu_id): Path<String>) -> Reply {
    respond(StatusCode::OK, state.admin.status(&asu_id).await)
}

async fn update_approval(
    State(state): State<ApiState>,
    Path(asu_id): Path<String>,
    Json(body): Json<Value>,
) -> Reply {
    let result = match parse_json::<ApprovalRequest>(body) {
        Ok(req) => state.admin.update_approval(&asu_id, req).await,
        Err(err) => Err(err),
    };
    respond(StatusCode::OK, result)
}

async fn insights(State(state): State<ApiState>) -> Reply {
    respond(StatusCode::OK, state.admin.insights().await)
}

/// =============================
/// Router
/// =============================

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/auth", post(auth_handler))
        .route("/calculate-match", post(calculate_match))
        .route("/documents/upload-urls", post(upload_urls))
        .route("/documents/process", post(process_documents))
        .route("/chat/connect", post(chat_connect))
        .route("/chat/disconnect", post(chat_disconnect))
        .route("/chat/message", post(chat_message))
        .route("/admin/users", get(list_users))
        .route("/admin/users/:asu_id", get(get_user))
        .route("/admin/users/:asu_id/documents", get(user_documents))
        .route("/admin/users/:asu_id/status", get(user_status))
        .route("/admin/users/:asu_id/approval", post(update_approval))
        .route("/admin/insights", get(insights))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(state: ApiState, port: u16) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
