//! Axum-based collaboration API.
//!
//! Serves the multiplayer/skills/voice/PR-session surface plus health,
//! metrics, and sandbox summaries. All bodies are JSON, all ids are opaque
//! strings; error responses are `{"error": string}` with matched status
//! codes.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
};
use sandbox_core::provider::Provider;
use sandbox_core::{SandboxInfo, SyncStatus, metrics};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::error::CollabError;
use crate::multiplayer::{
    CreateSessionInput, Cursor, MultiplayerManager, PromptPriority,
};
use crate::pr_session::PrSessionManager;
use crate::skills::{SkillInput, SkillStore};
use crate::voice::VoiceManager;

// ---------------------------------------------------------------------------
// State & error plumbing
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct CollabState {
    pub multiplayer: Arc<MultiplayerManager>,
    pub skills: Arc<SkillStore>,
    pub voice: Arc<VoiceManager>,
    pub prs: Arc<PrSessionManager>,
    /// Optional provider for the sandbox summary endpoint.
    pub provider: Option<Arc<dyn Provider>>,
}

impl CollabState {
    pub fn new(provider: Option<Arc<dyn Provider>>) -> Self {
        Self {
            multiplayer: Arc::new(MultiplayerManager::default()),
            skills: Arc::new(SkillStore::new()),
            voice: Arc::new(VoiceManager::new()),
            prs: Arc::new(PrSessionManager::new()),
            provider,
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct ApiError {
    error: String,
}

fn api_error(status: StatusCode, msg: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (status, Json(ApiError { error: msg.into() }))
}

fn collab_error(err: CollabError) -> (StatusCode, Json<ApiError>) {
    let status = match err {
        CollabError::NotFound(_) => StatusCode::NOT_FOUND,
        CollabError::Validation(_) => StatusCode::BAD_REQUEST,
        CollabError::Conflict(_) => StatusCode::CONFLICT,
    };
    api_error(status, err.to_string())
}

fn session_not_found(id: &str) -> (StatusCode, Json<ApiError>) {
    api_error(StatusCode::NOT_FOUND, format!("Session '{id}' not found"))
}

// ---------------------------------------------------------------------------
// Multiplayer: sessions & roster
// ---------------------------------------------------------------------------

async fn create_session(
    State(state): State<CollabState>,
    Json(input): Json<CreateSessionInput>,
) -> impl IntoResponse {
    (StatusCode::OK, Json(state.multiplayer.create(input)))
}

async fn list_sessions(State(state): State<CollabState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.multiplayer.all()))
}

async fn get_session(
    State(state): State<CollabState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.multiplayer.get(&id) {
        Some(session) => (StatusCode::OK, Json(session)).into_response(),
        None => session_not_found(&id).into_response(),
    }
}

async fn delete_session(
    State(state): State<CollabState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if state.multiplayer.remove(&id) {
        (StatusCode::OK, Json(json!({ "deleted": id }))).into_response()
    } else {
        session_not_found(&id).into_response()
    }
}

#[derive(Deserialize)]
struct JoinRequest {
    name: String,
    #[serde(default)]
    color: String,
}

async fn join_session(
    State(state): State<CollabState>,
    Path(id): Path<String>,
    Json(req): Json<JoinRequest>,
) -> impl IntoResponse {
    match state.multiplayer.join(&id, &req.name, &req.color) {
        Ok(user) => (StatusCode::OK, Json(user)).into_response(),
        Err(err) => collab_error(err).into_response(),
    }
}

#[derive(Deserialize)]
struct UserRequest {
    user_id: String,
}

async fn leave_session(
    State(state): State<CollabState>,
    Path(id): Path<String>,
    Json(req): Json<UserRequest>,
) -> impl IntoResponse {
    if state.multiplayer.get(&id).is_none() {
        return session_not_found(&id).into_response();
    }
    if state.multiplayer.leave(&id, &req.user_id) {
        (StatusCode::OK, Json(json!({ "success": true }))).into_response()
    } else {
        api_error(
            StatusCode::BAD_REQUEST,
            format!("Unknown user '{}'", req.user_id),
        )
        .into_response()
    }
}

#[derive(Deserialize)]
struct CursorRequest {
    user_id: String,
    cursor: Cursor,
}

async fn update_cursor(
    State(state): State<CollabState>,
    Path(id): Path<String>,
    Json(req): Json<CursorRequest>,
) -> impl IntoResponse {
    if state.multiplayer.get(&id).is_none() {
        return session_not_found(&id).into_response();
    }
    if state.multiplayer.update_cursor(&id, &req.user_id, req.cursor) {
        (StatusCode::OK, Json(json!({ "success": true }))).into_response()
    } else {
        api_error(
            StatusCode::BAD_REQUEST,
            format!("Unknown user '{}'", req.user_id),
        )
        .into_response()
    }
}

async fn acquire_lock(
    State(state): State<CollabState>,
    Path(id): Path<String>,
    Json(req): Json<UserRequest>,
) -> impl IntoResponse {
    match state.multiplayer.acquire_lock(&id, &req.user_id) {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(err) => collab_error(err).into_response(),
    }
}

async fn release_lock(
    State(state): State<CollabState>,
    Path(id): Path<String>,
    Json(req): Json<UserRequest>,
) -> impl IntoResponse {
    match state.multiplayer.release_lock(&id, &req.user_id) {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(err) => collab_error(err).into_response(),
    }
}

async fn connect_client(
    State(state): State<CollabState>,
    Path(id): Path<String>,
    Json(req): Json<UserRequest>,
) -> impl IntoResponse {
    match state.multiplayer.connect(&id, &req.user_id) {
        Ok(client) => (StatusCode::OK, Json(client)).into_response(),
        Err(err) => collab_error(err).into_response(),
    }
}

#[derive(Deserialize)]
struct DisconnectRequest {
    client_id: String,
}

async fn disconnect_client(
    State(state): State<CollabState>,
    Path(id): Path<String>,
    Json(req): Json<DisconnectRequest>,
) -> impl IntoResponse {
    if state.multiplayer.get(&id).is_none() {
        return session_not_found(&id).into_response();
    }
    if state.multiplayer.disconnect(&id, &req.client_id) {
        (StatusCode::OK, Json(json!({ "success": true }))).into_response()
    } else {
        api_error(
            StatusCode::BAD_REQUEST,
            format!("Unknown client '{}'", req.client_id),
        )
        .into_response()
    }
}

async fn get_users(
    State(state): State<CollabState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.multiplayer.get_users(&id) {
        Ok(users) => (StatusCode::OK, Json(users)).into_response(),
        Err(err) => collab_error(err).into_response(),
    }
}

async fn get_clients(
    State(state): State<CollabState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.multiplayer.get_clients(&id) {
        Ok(clients) => (StatusCode::OK, Json(clients)).into_response(),
        Err(err) => collab_error(err).into_response(),
    }
}

#[derive(Deserialize)]
struct StateRequest {
    #[serde(default)]
    git_sync_status: Option<SyncStatus>,
    #[serde(default)]
    agent_status: Option<String>,
}

async fn update_session_state(
    State(state): State<CollabState>,
    Path(id): Path<String>,
    Json(req): Json<StateRequest>,
) -> impl IntoResponse {
    if state
        .multiplayer
        .update_state(&id, req.git_sync_status, req.agent_status)
    {
        (StatusCode::OK, Json(json!({ "success": true }))).into_response()
    } else {
        session_not_found(&id).into_response()
    }
}

// ---------------------------------------------------------------------------
// Multiplayer: prompt queue
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct PromptRequest {
    user_id: String,
    content: String,
    #[serde(default)]
    priority: PromptPriority,
}

async fn add_prompt(
    State(state): State<CollabState>,
    Path(id): Path<String>,
    Json(req): Json<PromptRequest>,
) -> impl IntoResponse {
    match state
        .multiplayer
        .add_prompt(&id, &req.user_id, &req.content, req.priority)
    {
        Ok(prompt) => (StatusCode::OK, Json(prompt)).into_response(),
        Err(err) => collab_error(err).into_response(),
    }
}

async fn get_prompts(
    State(state): State<CollabState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.multiplayer.get_prompts(&id) {
        Ok(prompts) => (StatusCode::OK, Json(prompts)).into_response(),
        Err(err) => collab_error(err).into_response(),
    }
}

async fn get_prompt(
    State(state): State<CollabState>,
    Path((id, pid)): Path<(String, String)>,
) -> impl IntoResponse {
    if state.multiplayer.get(&id).is_none() {
        return session_not_found(&id).into_response();
    }
    match state.multiplayer.get_prompt(&pid) {
        Some(prompt) => (StatusCode::OK, Json(prompt)).into_response(),
        None => api_error(StatusCode::NOT_FOUND, format!("Prompt '{pid}' not found"))
            .into_response(),
    }
}

async fn cancel_prompt(
    State(state): State<CollabState>,
    Path((id, pid)): Path<(String, String)>,
    Json(req): Json<UserRequest>,
) -> impl IntoResponse {
    if state.multiplayer.get(&id).is_none() {
        return session_not_found(&id).into_response();
    }
    let result = state.multiplayer.cancel_prompt(&pid, &req.user_id);
    if result.success {
        (StatusCode::OK, Json(result)).into_response()
    } else {
        (StatusCode::BAD_REQUEST, Json(result)).into_response()
    }
}

#[derive(Deserialize)]
struct ReorderRequest {
    user_id: String,
    new_index: usize,
}

async fn reorder_prompt(
    State(state): State<CollabState>,
    Path((id, pid)): Path<(String, String)>,
    Json(req): Json<ReorderRequest>,
) -> impl IntoResponse {
    if state.multiplayer.get(&id).is_none() {
        return session_not_found(&id).into_response();
    }
    let result = state
        .multiplayer
        .reorder_prompt(&pid, &req.user_id, req.new_index);
    if result.success {
        (StatusCode::OK, Json(result)).into_response()
    } else {
        (StatusCode::BAD_REQUEST, Json(result)).into_response()
    }
}

async fn queue_status(
    State(state): State<CollabState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.multiplayer.get_queue_status(&id) {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(err) => collab_error(err).into_response(),
    }
}

async fn queue_start(
    State(state): State<CollabState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.multiplayer.start_next_prompt(&id) {
        Ok(prompt) => (StatusCode::OK, Json(prompt)).into_response(),
        Err(err) => collab_error(err).into_response(),
    }
}

async fn queue_complete(
    State(state): State<CollabState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.multiplayer.complete_prompt(&id) {
        Ok(prompt) => (StatusCode::OK, Json(prompt)).into_response(),
        Err(err) => collab_error(err).into_response(),
    }
}

async fn queue_executing(
    State(state): State<CollabState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.multiplayer.get_executing(&id) {
        Ok(prompt) => (StatusCode::OK, Json(prompt)).into_response(),
        Err(err) => collab_error(err).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Skills
// ---------------------------------------------------------------------------

async fn list_skills(State(state): State<CollabState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.skills.list()))
}

async fn create_skill(
    State(state): State<CollabState>,
    Json(input): Json<SkillInput>,
) -> impl IntoResponse {
    match state.skills.create(input) {
        Ok(skill) => (StatusCode::OK, Json(skill)).into_response(),
        Err(err) => collab_error(err).into_response(),
    }
}

async fn get_skill(
    State(state): State<CollabState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.skills.get(&name) {
        Some(skill) => (StatusCode::OK, Json(skill)).into_response(),
        None => api_error(StatusCode::NOT_FOUND, format!("Skill '{name}' not found"))
            .into_response(),
    }
}

#[derive(Deserialize)]
struct SkillUpdateRequest {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    template: Option<String>,
}

async fn update_skill(
    State(state): State<CollabState>,
    Path(name): Path<String>,
    Json(req): Json<SkillUpdateRequest>,
) -> impl IntoResponse {
    match state.skills.update(&name, req.description, req.template) {
        Ok(skill) => (StatusCode::OK, Json(skill)).into_response(),
        Err(err) => collab_error(err).into_response(),
    }
}

async fn delete_skill(
    State(state): State<CollabState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    if state.skills.delete(&name) {
        (StatusCode::OK, Json(json!({ "deleted": name }))).into_response()
    } else {
        api_error(StatusCode::NOT_FOUND, format!("Skill '{name}' not found")).into_response()
    }
}

#[derive(Deserialize)]
struct InvokeRequest {
    #[serde(default)]
    args: HashMap<String, String>,
}

async fn invoke_skill(
    State(state): State<CollabState>,
    Path(name): Path<String>,
    Json(req): Json<InvokeRequest>,
) -> impl IntoResponse {
    match state.skills.invoke(&name, &req.args) {
        Ok(prompt) => (StatusCode::OK, Json(json!({ "prompt": prompt }))).into_response(),
        Err(err) => collab_error(err).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Voice
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct VoiceControlRequest {
    session_id: String,
}

async fn voice_start(
    State(state): State<CollabState>,
    Json(req): Json<VoiceControlRequest>,
) -> impl IntoResponse {
    match state.voice.start(&req.session_id) {
        Ok(session) => (StatusCode::OK, Json(session)).into_response(),
        Err(err) => collab_error(err).into_response(),
    }
}

async fn voice_stop(
    State(state): State<CollabState>,
    Json(req): Json<VoiceControlRequest>,
) -> impl IntoResponse {
    match state.voice.stop(&req.session_id) {
        Ok(session) => (StatusCode::OK, Json(session)).into_response(),
        Err(err) => collab_error(err).into_response(),
    }
}

#[derive(Deserialize)]
struct VoiceStatusQuery {
    session_id: String,
}

async fn voice_status(
    State(state): State<CollabState>,
    Query(query): Query<VoiceStatusQuery>,
) -> impl IntoResponse {
    match state.voice.status(&query.session_id) {
        Some(session) => (StatusCode::OK, Json(session)).into_response(),
        None => api_error(
            StatusCode::NOT_FOUND,
            format!("No voice session '{}'", query.session_id),
        )
        .into_response(),
    }
}

#[derive(Deserialize)]
struct VoiceAudioRequest {
    session_id: String,
    /// Base64-encoded audio payload.
    audio: String,
}

async fn voice_audio(
    State(state): State<CollabState>,
    Json(req): Json<VoiceAudioRequest>,
) -> impl IntoResponse {
    match state.voice.submit_audio(&req.session_id, req.audio.len()) {
        Ok(session) => (StatusCode::OK, Json(session)).into_response(),
        Err(err) => collab_error(err).into_response(),
    }
}

// ---------------------------------------------------------------------------
// PR sessions
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct PrCreateRequest {
    pr_number: u64,
    repository: String,
    session_id: String,
}

async fn create_pr_session(
    State(state): State<CollabState>,
    Json(req): Json<PrCreateRequest>,
) -> impl IntoResponse {
    match state
        .prs
        .create(req.pr_number, &req.repository, &req.session_id)
    {
        Ok(session) => (StatusCode::OK, Json(session)).into_response(),
        Err(err) => collab_error(err).into_response(),
    }
}

async fn list_pr_sessions(State(state): State<CollabState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.prs.all()))
}

async fn get_pr_session(
    State(state): State<CollabState>,
    Path(pr): Path<u64>,
) -> impl IntoResponse {
    match state.prs.get(pr) {
        Some(session) => (StatusCode::OK, Json(session)).into_response(),
        None => api_error(StatusCode::NOT_FOUND, format!("No session for PR #{pr}"))
            .into_response(),
    }
}

async fn get_pr_comments(
    State(state): State<CollabState>,
    Path(pr): Path<u64>,
) -> impl IntoResponse {
    match state.prs.comments(pr) {
        Ok(comments) => (StatusCode::OK, Json(comments)).into_response(),
        Err(err) => collab_error(err).into_response(),
    }
}

#[derive(Deserialize)]
struct PrCommentRequest {
    author: String,
    body: String,
}

async fn add_pr_comment(
    State(state): State<CollabState>,
    Path(pr): Path<u64>,
    Json(req): Json<PrCommentRequest>,
) -> impl IntoResponse {
    match state.prs.add_comment(pr, &req.author, &req.body) {
        Ok(comment) => (StatusCode::OK, Json(comment)).into_response(),
        Err(err) => collab_error(err).into_response(),
    }
}

#[derive(Deserialize)]
struct PrRespondRequest {
    body: String,
}

async fn respond_pr(
    State(state): State<CollabState>,
    Path(pr): Path<u64>,
    Json(req): Json<PrRespondRequest>,
) -> impl IntoResponse {
    match state.prs.respond(pr, &req.body) {
        Ok(comment) => (StatusCode::OK, Json(comment)).into_response(),
        Err(err) => collab_error(err).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Health, metrics & sandbox summaries (unauthenticated)
// ---------------------------------------------------------------------------

async fn health() -> impl IntoResponse {
    let m = metrics::metrics();
    let active = m.active_sandboxes.load(std::sync::atomic::Ordering::Relaxed);
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "uptime_secs": metrics::uptime_secs(),
            "active_sandboxes": active,
        })),
    )
}

async fn prometheus_metrics() -> impl IntoResponse {
    let body = metrics::metrics().render_prometheus();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

#[derive(serde::Serialize)]
struct SandboxSummary {
    id: String,
    status: sandbox_core::SandboxStatus,
    repository: String,
    image_tag: String,
    created: u64,
    last_activity: u64,
}

impl From<&SandboxInfo> for SandboxSummary {
    fn from(info: &SandboxInfo) -> Self {
        Self {
            id: info.id.clone(),
            status: info.status,
            repository: info.git.repo.clone(),
            image_tag: info.image.tag.clone(),
            created: info.time.created,
            last_activity: info.time.last_activity,
        }
    }
}

async fn list_sandboxes(State(state): State<CollabState>) -> impl IntoResponse {
    let Some(provider) = &state.provider else {
        return (StatusCode::OK, Json(json!({ "sandboxes": [] }))).into_response();
    };
    match provider.list(None).await {
        Ok(infos) => {
            let summaries: Vec<SandboxSummary> =
                infos.iter().map(SandboxSummary::from).collect();
            (StatusCode::OK, Json(json!({ "sandboxes": summaries }))).into_response()
        }
        Err(err) => {
            api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// CORS & router builder
// ---------------------------------------------------------------------------

/// Build CORS layer from `CORS_ALLOWED_ORIGINS`.
///
/// - If the env var is set, parse comma-separated origins and whitelist them.
/// - If unset or `"*"`, allow any origin (development mode).
fn build_cors_layer() -> CorsLayer {
    use axum::http::{Method, header};

    let allowed_methods = vec![
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::OPTIONS,
    ];
    let allowed_headers = vec![header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT];

    let origins_env = std::env::var("CORS_ALLOWED_ORIGINS").unwrap_or_default();

    if origins_env.is_empty() || origins_env == "*" {
        CorsLayer::new()
            .allow_origin(AllowOrigin::any())
            .allow_methods(allowed_methods)
            .allow_headers(allowed_headers)
    } else {
        let origins: Vec<_> = origins_env
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(allowed_methods)
            .allow_headers(allowed_headers)
            .allow_credentials(true)
    }
}

/// Build the collaboration API router with all endpoints and CORS.
pub fn collab_router(state: CollabState) -> Router {
    Router::new()
        // Multiplayer sessions
        .route("/multiplayer", post(create_session).get(list_sessions))
        .route("/multiplayer/{id}", get(get_session).delete(delete_session))
        .route("/multiplayer/{id}/join", post(join_session))
        .route("/multiplayer/{id}/leave", post(leave_session))
        .route("/multiplayer/{id}/cursor", put(update_cursor))
        .route(
            "/multiplayer/{id}/lock",
            post(acquire_lock).delete(release_lock),
        )
        .route("/multiplayer/{id}/connect", post(connect_client))
        .route("/multiplayer/{id}/disconnect", post(disconnect_client))
        .route("/multiplayer/{id}/users", get(get_users))
        .route("/multiplayer/{id}/clients", get(get_clients))
        .route("/multiplayer/{id}/state", put(update_session_state))
        // Prompt queue
        .route("/multiplayer/{id}/prompt", post(add_prompt))
        .route("/multiplayer/{id}/prompts", get(get_prompts))
        .route(
            "/multiplayer/{id}/prompt/{pid}",
            get(get_prompt).delete(cancel_prompt),
        )
        .route("/multiplayer/{id}/prompt/{pid}/reorder", put(reorder_prompt))
        .route("/multiplayer/{id}/queue/status", get(queue_status))
        .route("/multiplayer/{id}/queue/start", post(queue_start))
        .route("/multiplayer/{id}/queue/complete", post(queue_complete))
        .route("/multiplayer/{id}/queue/executing", get(queue_executing))
        // Skills
        .route("/skills", get(list_skills).post(create_skill))
        .route(
            "/skills/{name}",
            get(get_skill).put(update_skill).delete(delete_skill),
        )
        .route("/skills/{name}/invoke", post(invoke_skill))
        // Voice
        .route("/voice", post(voice_audio))
        .route("/voice/start", post(voice_start))
        .route("/voice/stop", post(voice_stop))
        .route("/voice/status", get(voice_status))
        // PR sessions
        .route("/pr-session", post(create_pr_session).get(list_pr_sessions))
        .route("/pr-session/{pr}", get(get_pr_session))
        .route(
            "/pr-session/{pr}/comments",
            get(get_pr_comments).post(add_pr_comment),
        )
        .route("/pr-session/{pr}/respond", post(respond_pr))
        // Health & metrics
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .route("/sandboxes", get(list_sandboxes))
        .layer(build_cors_layer())
        .with_state(state)
}
