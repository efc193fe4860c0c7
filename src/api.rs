use crate::auth;
use crate::config::Config;
use crate::db::{self, DbPool};
use crate::directory;
use crate::error::ApiError;
use crate::messages;
use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{header, Method, Request},
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

/// Authenticated caller id, injected by [`auth_middleware`].
#[derive(Debug, Clone, Copy)]
pub struct CallerId(pub i64);

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub secret: Vec<u8>,
}

impl AppState {
    pub fn new(config: &Config) -> Result<Self> {
        let pool = db::open_pool(&config.database)?;
        let conn = pool.get()?;
        let secret = db::signing_secret(&conn)?;
        Ok(Self { pool, secret })
    }
}

fn cors(methods: &[Method]) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(methods.to_vec())
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .max_age(Duration::from_secs(86400))
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    let auth_routes = Router::new()
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .layer(cors(&[Method::POST]));
    let message_routes = Router::new()
        .route("/api/messages", get(get_messages).post(send_message))
        .route("/api/messages/:id", delete(delete_message))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(cors(&[Method::GET, Method::POST, Method::DELETE]));
    let directory_routes = Router::new()
        .route("/api/users", get(list_directory))
        .route("/api/contacts", post(sync_contacts))
        .route("/api/presence/ping", post(ping_online))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(cors(&[Method::GET, Method::POST]));
    Router::new()
        .route("/api/health", get(health))
        .merge(auth_routes)
        .merge(message_routes)
        .merge(directory_routes)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn auth_middleware<B>(
    State(state): State<AppState>,
    mut req: Request<B>,
    next: Next<B>,
) -> Result<Response, ApiError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let Some(token) = token else {
        return Err(ApiError::auth("Authorization required"));
    };
    let claims = auth::verify_token(&state.secret, token)
        .map_err(|_| ApiError::auth("Invalid token"))?;
    let Some(user_id) = claims.user_id() else {
        return Err(ApiError::auth("Invalid token"));
    };
    req.extensions_mut().insert(CallerId(user_id));
    Ok(next.run(req).await)
}

#[derive(Deserialize)]
struct RegisterReq {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    display_name: Option<String>,
    avatar: Option<String>,
    #[serde(default)]
    phone: String,
}

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterReq>,
) -> Result<Json<Value>, ApiError> {
    let mut conn = state.pool.get()?;
    let user = auth::register(
        &mut conn,
        &req.username,
        &req.password,
        req.display_name.as_deref(),
        req.avatar.as_deref(),
        &req.phone,
    )?;
    let token = auth::issue_token(&state.secret, user.id, auth::TOKEN_LIFETIME)?;
    tracing::info!(user_id = user.id, "registered user");
    Ok(Json(json!({ "user": user, "token": token })))
}

#[derive(Deserialize)]
struct LoginReq {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginReq>,
) -> Result<Json<Value>, ApiError> {
    let conn = state.pool.get()?;
    let user = auth::login(&conn, &req.username, &req.password)?;
    let token = auth::issue_token(&state.secret, user.id, auth::TOKEN_LIFETIME)?;
    Ok(Json(json!({ "user": user, "token": token })))
}

#[derive(Deserialize)]
struct MessagesQuery {
    user_id: Option<i64>,
}

async fn get_messages(
    State(state): State<AppState>,
    Extension(CallerId(caller)): Extension<CallerId>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Value>, ApiError> {
    let mut conn = state.pool.get()?;
    match query.user_id {
        Some(peer) => {
            let messages = messages::list_thread(&mut conn, caller, peer)?;
            Ok(Json(json!({ "messages": messages })))
        }
        None => {
            let chats = messages::list_chats(&conn, caller)?;
            Ok(Json(json!({ "chats": chats })))
        }
    }
}

#[derive(Deserialize)]
struct SendReq {
    receiver_id: Option<i64>,
    #[serde(default)]
    message_text: String,
}

async fn send_message(
    State(state): State<AppState>,
    Extension(CallerId(caller)): Extension<CallerId>,
    Json(req): Json<SendReq>,
) -> Result<Json<Value>, ApiError> {
    let conn = state.pool.get()?;
    let message = messages::send_message(&conn, caller, req.receiver_id, &req.message_text)?;
    Ok(Json(json!({ "message": message })))
}

async fn delete_message(
    State(state): State<AppState>,
    Extension(CallerId(caller)): Extension<CallerId>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let conn = state.pool.get()?;
    let deleted = messages::delete_message(&conn, caller, id)?;
    Ok(Json(json!({ "status": "deleted", "deleted": deleted })))
}

#[derive(Deserialize)]
struct DirectoryQuery {
    search: Option<String>,
}

async fn list_directory(
    State(state): State<AppState>,
    Extension(CallerId(caller)): Extension<CallerId>,
    Query(query): Query<DirectoryQuery>,
) -> Result<Json<Value>, ApiError> {
    let conn = state.pool.get()?;
    let users = directory::list_directory(&conn, caller, query.search.as_deref())?;
    Ok(Json(json!({ "users": users })))
}

#[derive(Deserialize)]
struct SyncContactsReq {
    #[serde(default)]
    phones: Vec<String>,
}

async fn sync_contacts(
    State(state): State<AppState>,
    Extension(CallerId(caller)): Extension<CallerId>,
    Json(req): Json<SyncContactsReq>,
) -> Result<Json<Value>, ApiError> {
    let mut conn = state.pool.get()?;
    directory::sync_contacts(&mut conn, caller, &req.phones)?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn ping_online(
    State(state): State<AppState>,
    Extension(CallerId(caller)): Extension<CallerId>,
) -> Result<Json<Value>, ApiError> {
    let conn = state.pool.get()?;
    directory::ping_online(&conn, caller)?;
    Ok(Json(json!({ "status": "ok" })))
}

/// Run the HTTP server bound to the configured address.
pub async fn run_http_server(config: Config) -> Result<()> {
    let state = AppState::new(&config)?;
    let addr: SocketAddr = config.bind.parse()?;
    tracing::info!(%addr, db = %config.database.display(), "listening");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .await?;
    Ok(())
}
