//! HTTP and WebSocket surface
//!
//! JSON routes rooted at `/api/v1` with a uniform response envelope, CORS
//! open to any origin, and a WebSocket upgrade at `/api/v1/ws`. Each
//! handler authorizes against the API-key middleware before touching the
//! engine; failures map onto HTTP status codes at this boundary and nowhere
//! deeper.

mod ws;

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use warp::http::StatusCode;
use warp::reply::Reply;
use warp::Filter;

use crate::address::{RepositoryId, StableAddress};
use crate::auth::{AuthError, AuthManager, Permission};
use crate::document::{ConstructKind, DocumentError};
use crate::engine::{Engine, EngineError};
use crate::ops::{derive_author_id, derive_op_id, DagError, OpId, OpKind, Operation, OperationMeta};
use crate::position::{AuthorId, Position};
use crate::storage::StorageError;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ApiContext {
    pub engine: Arc<Engine>,
    pub auth: Arc<AuthManager>,
    pub repository: RepositoryId,
}

impl ApiContext {
    pub fn new(engine: Arc<Engine>, auth: Arc<AuthManager>, repository: RepositoryId) -> Self {
        Self {
            engine,
            auth,
            repository,
        }
    }

    /// Authorize a request or produce the 401/403 response to return.
    fn guard(
        &self,
        header: Option<&str>,
        needed: Permission,
    ) -> Result<crate::auth::AuthContext, warp::reply::Response> {
        let ctx = match self.auth.authorize(header) {
            Ok(ctx) => ctx,
            Err(AuthError::InvalidKey) => {
                return Err(error_reply(
                    StatusCode::UNAUTHORIZED,
                    "missing or invalid credentials",
                ))
            }
            Err(e) => {
                return Err(error_reply(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))
            }
        };
        if !ctx.has_permission(needed) {
            return Err(error_reply(StatusCode::FORBIDDEN, "permission denied"));
        }
        Ok(ctx)
    }
}

#[derive(Serialize)]
struct Envelope<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    code: u16,
}

fn ok_reply<T: Serialize>(data: T) -> warp::reply::Response {
    let body = Envelope {
        success: true,
        data: Some(data),
        message: None,
    };
    warp::reply::with_status(warp::reply::json(&body), StatusCode::OK).into_response()
}

fn created_reply<T: Serialize>(data: T) -> warp::reply::Response {
    let body = Envelope {
        success: true,
        data: Some(data),
        message: None,
    };
    warp::reply::with_status(warp::reply::json(&body), StatusCode::CREATED).into_response()
}

fn error_reply(status: StatusCode, error: &str) -> warp::reply::Response {
    let body = ErrorBody {
        success: false,
        error: error.to_string(),
        code: status.as_u16(),
    };
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

fn engine_error_reply(err: &EngineError) -> warp::reply::Response {
    error_reply(status_for(err), &err.to_string())
}

/// Boundary translation of engine failures to HTTP statuses.
fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::MissingDocumentId => StatusCode::BAD_REQUEST,
        EngineError::Dag(DagError::EmptyAuthor) => StatusCode::BAD_REQUEST,
        EngineError::Dag(DagError::OperationNotFound(_)) => StatusCode::NOT_FOUND,
        EngineError::Dag(DagError::CausalityViolation(_)) => StatusCode::BAD_REQUEST,
        EngineError::Document(DocumentError::InvalidPosition) => StatusCode::BAD_REQUEST,
        EngineError::Document(DocumentError::PositionOccupied) => StatusCode::CONFLICT,
        EngineError::Document(DocumentError::ConstructNotFound) => StatusCode::NOT_FOUND,
        EngineError::Address(crate::address::AddressError::OperationNotFound(_)) => {
            StatusCode::NOT_FOUND
        }
        EngineError::Address(crate::address::AddressError::AddressNotFound(_)) => {
            StatusCode::NOT_FOUND
        }
        EngineError::Storage(StorageError::OperationNotFound(_)) => StatusCode::NOT_FOUND,
        EngineError::Storage(StorageError::DocumentNotFound(_)) => StatusCode::NOT_FOUND,
        EngineError::ClientNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Submission body for `POST /operations`. The identifier is derived
/// server-side from the author, content and timestamp; retries carrying the
/// same timestamp land on the same identifier and re-apply idempotently.
#[derive(Debug, Deserialize)]
pub struct OperationRequest {
    #[serde(rename = "type")]
    pub kind: OpKind,
    pub position: Position,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub length: Option<usize>,
    pub author: AuthorId,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parents: Vec<OpId>,
    #[serde(default)]
    pub metadata: OperationMeta,
}

impl OperationRequest {
    fn into_operation(self) -> Operation {
        let timestamp = self.timestamp.unwrap_or_else(Utc::now);
        let id = derive_op_id(&self.author, &self.content, timestamp);
        Operation {
            id,
            kind: self.kind,
            position: self.position,
            content: self.content,
            content_type: crate::ops::CONTENT_TYPE_TEXT.to_string(),
            length: self.length,
            author: self.author,
            timestamp,
            parents: self.parents,
            metadata: self.metadata,
        }
    }
}

#[derive(Serialize)]
struct DocumentView {
    file_path: String,
    version: u64,
    content_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_operation: Option<OpId>,
    content: String,
    constructs: Vec<crate::document::Construct>,
}

#[derive(Serialize)]
struct SearchMatch {
    document: String,
    construct_id: String,
    #[serde(rename = "type")]
    kind: ConstructKind,
    content: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    pub name: String,
    pub author_name: String,
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct CreatedKey {
    key: crate::auth::ApiKey,
    /// Returned exactly once; only the hash is stored.
    plaintext: String,
}

const DEFAULT_QUERY_LIMIT: usize = 50;

/// Assemble the full route tree.
pub fn routes(
    ctx: ApiContext,
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    let cors = warp::cors()
        .allow_any_origin()
        .allow_headers(vec!["content-type", "authorization"])
        .allow_methods(vec!["GET", "POST", "PUT", "DELETE"]);

    let api = warp::path("api").and(warp::path("v1"));
    let auth_header = warp::header::optional::<String>("authorization");

    let create_operation = api
        .and(warp::path("operations"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(auth_header)
        .and(with_ctx(ctx.clone()))
        .and_then(handle_create_operation);

    let get_operation = api
        .and(warp::path("operations"))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::get())
        .and(auth_header)
        .and(with_ctx(ctx.clone()))
        .and_then(handle_get_operation);

    let list_operations = api
        .and(warp::path("operations"))
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(auth_header)
        .and(with_ctx(ctx.clone()))
        .and_then(handle_list_operations);

    let get_causal_history = api
        .and(warp::path("operations"))
        .and(warp::path::param::<String>())
        .and(warp::path("history"))
        .and(warp::path::end())
        .and(warp::get())
        .and(auth_header)
        .and(with_ctx(ctx.clone()))
        .and_then(handle_causal_history);

    let get_document = api
        .and(warp::path("documents"))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::get())
        .and(auth_header)
        .and(with_ctx(ctx.clone()))
        .and_then(handle_get_document);

    let get_document_history = api
        .and(warp::path("documents"))
        .and(warp::path::param::<String>())
        .and(warp::path("history"))
        .and(warp::path::end())
        .and(warp::get())
        .and(auth_header)
        .and(with_ctx(ctx.clone()))
        .and_then(handle_document_history);

    let resolve_address = api
        .and(warp::path("addresses"))
        .and(warp::path("resolve"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(auth_header)
        .and(with_ctx(ctx.clone()))
        .and_then(handle_resolve_address);

    let address_history = api
        .and(warp::path("addresses"))
        .and(warp::path::param::<String>())
        .and(warp::path("history"))
        .and(warp::path::end())
        .and(warp::get())
        .and(auth_header)
        .and(with_ctx(ctx.clone()))
        .and_then(handle_address_history);

    let search = api
        .and(warp::path("search"))
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(auth_header)
        .and(with_ctx(ctx.clone()))
        .and_then(handle_search);

    let health = api
        .and(warp::path("health"))
        .and(warp::path::end())
        .and(warp::get())
        .and_then(handle_health);

    let create_key = api
        .and(warp::path("auth"))
        .and(warp::path("keys"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .and(auth_header)
        .and(with_ctx(ctx.clone()))
        .and_then(handle_create_key);

    let list_keys = api
        .and(warp::path("auth"))
        .and(warp::path("keys"))
        .and(warp::path::end())
        .and(warp::get())
        .and(auth_header)
        .and(with_ctx(ctx.clone()))
        .and_then(handle_list_keys);

    let revoke_key = api
        .and(warp::path("auth"))
        .and(warp::path("keys"))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::delete())
        .and(auth_header)
        .and(with_ctx(ctx.clone()))
        .and_then(handle_revoke_key);

    let auth_status = api
        .and(warp::path("auth"))
        .and(warp::path("status"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(handle_auth_status);

    let websocket = api
        .and(warp::path("ws"))
        .and(warp::path::end())
        .and(warp::ws())
        .and(warp::query::<HashMap<String, String>>())
        .and(auth_header)
        .and(with_ctx(ctx))
        .and_then(handle_ws_upgrade);

    create_operation
        .or(get_causal_history)
        .or(get_operation)
        .or(list_operations)
        .or(get_document_history)
        .or(get_document)
        .or(resolve_address)
        .or(address_history)
        .or(search)
        .or(health)
        .or(create_key)
        .or(list_keys)
        .or(revoke_key)
        .or(auth_status)
        .or(websocket)
        .with(cors)
}

/// Bind and serve until shutdown.
pub async fn serve(ctx: ApiContext, addr: std::net::SocketAddr) {
    info!(%addr, "serving HTTP API");
    warp::serve(routes(ctx)).run(addr).await;
}

fn with_ctx(
    ctx: ApiContext,
) -> impl Filter<Extract = (ApiContext,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

async fn handle_create_operation(
    request: OperationRequest,
    header: Option<String>,
    ctx: ApiContext,
) -> Result<warp::reply::Response, Infallible> {
    if let Err(resp) = ctx.guard(header.as_deref(), Permission::WriteOperations) {
        return Ok(resp);
    }
    let op = request.into_operation();
    match ctx.engine.process_operation(op, None).await {
        Ok(op) => Ok(created_reply(&*op)),
        Err(e) => Ok(engine_error_reply(&e)),
    }
}

async fn handle_get_operation(
    id: String,
    header: Option<String>,
    ctx: ApiContext,
) -> Result<warp::reply::Response, Infallible> {
    if let Err(resp) = ctx.guard(header.as_deref(), Permission::ReadOperations) {
        return Ok(resp);
    }
    match ctx.engine.operation(&id) {
        Ok(op) => Ok(ok_reply(&*op)),
        Err(e) => Ok(engine_error_reply(&e)),
    }
}

async fn handle_list_operations(
    query: HashMap<String, String>,
    header: Option<String>,
    ctx: ApiContext,
) -> Result<warp::reply::Response, Infallible> {
    if let Err(resp) = ctx.guard(header.as_deref(), Permission::ReadOperations) {
        return Ok(resp);
    }

    let since = match query.get("since") {
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(ts) => Some(ts.with_timezone(&Utc)),
            Err(_) => {
                return Ok(error_reply(
                    StatusCode::BAD_REQUEST,
                    "since must be an RFC3339 timestamp",
                ))
            }
        },
        None => None,
    };
    let limit = query
        .get("limit")
        .and_then(|raw| raw.parse::<usize>().ok())
        .unwrap_or(DEFAULT_QUERY_LIMIT);

    let result = match (query.get("author"), since) {
        (Some(author), _) => ctx.engine.operations_by_author(author),
        (None, Some(since)) => ctx.engine.operations_since(since),
        (None, None) => ctx
            .engine
            .operations_since(DateTime::<Utc>::MIN_UTC),
    };

    match result {
        Ok(mut ops) => {
            if let Some(since) = since {
                ops.retain(|op| op.timestamp > since);
            }
            ops.sort_by_key(|op| op.timestamp);
            ops.truncate(limit);
            let ops: Vec<&Operation> = ops.iter().map(|op| op.as_ref()).collect();
            Ok(ok_reply(ops))
        }
        Err(e) => Ok(engine_error_reply(&e)),
    }
}

async fn handle_causal_history(
    id: String,
    header: Option<String>,
    ctx: ApiContext,
) -> Result<warp::reply::Response, Infallible> {
    if let Err(resp) = ctx.guard(header.as_deref(), Permission::ReadOperations) {
        return Ok(resp);
    }
    match ctx.engine.causal_history(&id) {
        Ok(history) => {
            let ops: Vec<&Operation> = history.iter().map(|op| op.as_ref()).collect();
            Ok(ok_reply(ops))
        }
        Err(e) => Ok(engine_error_reply(&e)),
    }
}

async fn handle_get_document(
    path: String,
    header: Option<String>,
    ctx: ApiContext,
) -> Result<warp::reply::Response, Infallible> {
    if let Err(resp) = ctx.guard(header.as_deref(), Permission::ReadDocuments) {
        return Ok(resp);
    }
    let document = match ctx.engine.document(&path).await {
        Ok(doc) => doc,
        Err(e) => return Ok(engine_error_reply(&e)),
    };
    let snapshot = match document.snapshot() {
        Ok(snapshot) => snapshot,
        Err(e) => return Ok(engine_error_reply(&EngineError::Document(e))),
    };
    let content = match document.render() {
        Ok(content) => content,
        Err(e) => return Ok(engine_error_reply(&EngineError::Document(e))),
    };
    Ok(ok_reply(DocumentView {
        file_path: snapshot.file_path,
        version: snapshot.version,
        content_hash: snapshot.content_hash,
        last_operation: snapshot.last_operation,
        content,
        constructs: snapshot.constructs,
    }))
}

async fn handle_document_history(
    path: String,
    header: Option<String>,
    ctx: ApiContext,
) -> Result<warp::reply::Response, Infallible> {
    if let Err(resp) = ctx.guard(header.as_deref(), Permission::ReadDocuments) {
        return Ok(resp);
    }
    match ctx.engine.addresses_for_document(&path) {
        Ok(addresses) => Ok(ok_reply(addresses)),
        Err(e) => Ok(engine_error_reply(&e)),
    }
}

async fn handle_resolve_address(
    address: StableAddress,
    header: Option<String>,
    ctx: ApiContext,
) -> Result<warp::reply::Response, Infallible> {
    if let Err(resp) = ctx.guard(header.as_deref(), Permission::ReadDocuments) {
        return Ok(resp);
    }
    match ctx.engine.resolve_address(&address) {
        Ok(resolved) => Ok(ok_reply(resolved)),
        Err(e) => Ok(engine_error_reply(&e)),
    }
}

async fn handle_address_history(
    address_key: String,
    header: Option<String>,
    ctx: ApiContext,
) -> Result<warp::reply::Response, Infallible> {
    if let Err(resp) = ctx.guard(header.as_deref(), Permission::ReadDocuments) {
        return Ok(resp);
    }
    match ctx.engine.address_history_by_key(&address_key) {
        Ok(history) => Ok(ok_reply(history)),
        Err(e) => Ok(engine_error_reply(&e)),
    }
}

async fn handle_search(
    query: HashMap<String, String>,
    header: Option<String>,
    ctx: ApiContext,
) -> Result<warp::reply::Response, Infallible> {
    if let Err(resp) = ctx.guard(header.as_deref(), Permission::Search) {
        return Ok(resp);
    }
    let Some(needle) = query.get("q").filter(|q| !q.is_empty()) else {
        return Ok(error_reply(StatusCode::BAD_REQUEST, "q is required"));
    };
    let kind_filter = query.get("type").and_then(|t| ConstructKind::parse(t));
    let limit = query
        .get("limit")
        .and_then(|raw| raw.parse::<usize>().ok())
        .unwrap_or(DEFAULT_QUERY_LIMIT);

    let paths = match ctx.engine.list_documents().await {
        Ok(paths) => paths,
        Err(e) => return Ok(engine_error_reply(&e)),
    };

    let needle = needle.to_lowercase();
    let mut matches = Vec::new();
    'outer: for path in paths {
        let snapshot = match ctx.engine.document_snapshot(&path).await {
            Ok(snapshot) => snapshot,
            Err(e) => return Ok(engine_error_reply(&e)),
        };
        for construct in snapshot.constructs {
            if let Some(kind) = kind_filter {
                if construct.kind != kind {
                    continue;
                }
            }
            if construct.content.to_lowercase().contains(&needle) {
                matches.push(SearchMatch {
                    document: path.clone(),
                    construct_id: construct.id,
                    kind: construct.kind,
                    content: construct.content,
                });
                if matches.len() >= limit {
                    break 'outer;
                }
            }
        }
    }
    Ok(ok_reply(matches))
}

async fn handle_health() -> Result<warp::reply::Response, Infallible> {
    #[derive(Serialize)]
    struct Health {
        status: &'static str,
        version: &'static str,
    }
    Ok(ok_reply(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_create_key(
    request: CreateKeyRequest,
    header: Option<String>,
    ctx: ApiContext,
) -> Result<warp::reply::Response, Infallible> {
    if let Err(resp) = ctx.guard(header.as_deref(), Permission::Admin) {
        return Ok(resp);
    }
    let author_id = derive_author_id(&request.author_name);
    match ctx.auth.create_key(
        request.name,
        author_id,
        request.permissions,
        request.expires_at,
    ) {
        Ok((key, plaintext)) => Ok(created_reply(CreatedKey { key, plaintext })),
        Err(e) => Ok(error_reply(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())),
    }
}

async fn handle_list_keys(
    header: Option<String>,
    ctx: ApiContext,
) -> Result<warp::reply::Response, Infallible> {
    if let Err(resp) = ctx.guard(header.as_deref(), Permission::Admin) {
        return Ok(resp);
    }
    match ctx.auth.list_keys() {
        Ok(keys) => Ok(ok_reply(keys)),
        Err(e) => Ok(error_reply(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())),
    }
}

async fn handle_revoke_key(
    id: String,
    header: Option<String>,
    ctx: ApiContext,
) -> Result<warp::reply::Response, Infallible> {
    if let Err(resp) = ctx.guard(header.as_deref(), Permission::Admin) {
        return Ok(resp);
    }
    match ctx.auth.revoke_key(&id) {
        Ok(()) => Ok(ok_reply("revoked")),
        Err(AuthError::KeyNotFound(id)) => Ok(error_reply(
            StatusCode::NOT_FOUND,
            &format!("API key not found: {id}"),
        )),
        Err(e) => Ok(error_reply(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())),
    }
}

async fn handle_auth_status(ctx: ApiContext) -> Result<warp::reply::Response, Infallible> {
    #[derive(Serialize)]
    struct AuthStatus {
        require_auth: bool,
        key_count: usize,
    }
    let key_count = ctx.auth.list_keys().map(|k| k.len()).unwrap_or(0);
    Ok(ok_reply(AuthStatus {
        require_auth: ctx.auth.require_auth(),
        key_count,
    }))
}

async fn handle_ws_upgrade(
    ws: warp::ws::Ws,
    query: HashMap<String, String>,
    header: Option<String>,
    ctx: ApiContext,
) -> Result<warp::reply::Response, Infallible> {
    let auth = match ctx.guard(header.as_deref(), Permission::WriteOperations) {
        Ok(auth) => auth,
        Err(resp) => return Ok(resp),
    };
    // An explicit author name wins over the key's author identity.
    let author: AuthorId = query
        .get("author")
        .map(|name| derive_author_id(name))
        .unwrap_or(auth.author_id);

    Ok(ws
        .on_upgrade(move |socket| ws::client_session(socket, ctx, author))
        .into_response())
}
