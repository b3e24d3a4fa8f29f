use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::lodestone::{
    registry::{ConnectionRegistry, ConnectionView},
    routes::{normalize_domain, RouteError, RouteTable, Upstream},
    telemetry::SharedPrometheusHandle,
};

#[derive(Clone)]
pub struct AdminState {
    pub routes: Arc<RouteTable>,
    pub registry: Arc<ConnectionRegistry>,
    pub prom: SharedPrometheusHandle,
    pub api_key: String,
}

pub async fn serve(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(Arc::new(state));

    tracing::info!(api_addr = %addr, "admin: listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|v| *v).await;
        })
        .await?;

    Ok(())
}

fn router(shared: Arc<AdminState>) -> Router {
    let protected = Router::new()
        .route("/routes", get(list_routes).post(create_route))
        .route(
            "/routes/{domain}",
            get(get_route).put(update_route).delete(delete_route),
        )
        .route("/connections", get(list_connections))
        .route("/connections/{id}/kick", post(kick_by_id))
        .route("/kick/username", post(kick_by_username))
        .route("/kick/ip", post(kick_by_ip))
        .route("/kick/uuid", post(kick_by_uuid))
        .layer(middleware::from_fn_with_state(
            shared.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(render_metrics))
        .merge(protected)
        .with_state(shared)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Every control-plane call authenticates with the x-api-key header: absent
/// key is unauthorised, wrong key is forbidden.
async fn require_api_key(
    State(state): State<Arc<AdminState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let presented = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());

    match presented {
        None => Err(StatusCode::UNAUTHORIZED),
        Some(key) if key == state.api_key => Ok(next.run(request).await),
        Some(_) => Err(StatusCode::FORBIDDEN),
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn render_metrics(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, state.prom.render())
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn route_error_response(err: RouteError) -> Response {
    match err {
        RouteError::Duplicate => error_response(StatusCode::CONFLICT, "route already exists"),
        RouteError::NotFound => error_response(StatusCode::NOT_FOUND, "route not found"),
        RouteError::InvalidDomain => error_response(StatusCode::BAD_REQUEST, "invalid domain"),
        RouteError::Persist(err) => {
            tracing::error!(err = %err, "admin: route persistence failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "persistence failed")
        }
    }
}

#[derive(Debug, Serialize)]
struct RouteResponse {
    domain: String,
    host: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct CreateRouteRequest {
    domain: String,
    host: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct UpdateRouteRequest {
    host: String,
    port: u16,
}

async fn list_routes(State(state): State<Arc<AdminState>>) -> Json<HashMap<String, Upstream>> {
    Json(state.routes.list())
}

async fn get_route(State(state): State<Arc<AdminState>>, Path(domain): Path<String>) -> Response {
    match state.routes.get(&domain) {
        Some(upstream) => (
            StatusCode::OK,
            Json(RouteResponse {
                domain: normalize_domain(&domain),
                host: upstream.host,
                port: upstream.port,
            }),
        )
            .into_response(),
        None => error_response(StatusCode::NOT_FOUND, "route not found"),
    }
}

async fn create_route(
    State(state): State<Arc<AdminState>>,
    Json(req): Json<CreateRouteRequest>,
) -> Response {
    if req.domain.trim().is_empty() || req.host.trim().is_empty() || req.port == 0 {
        return error_response(StatusCode::BAD_REQUEST, "invalid domain, host, or port");
    }

    let upstream = Upstream {
        host: req.host.trim().to_string(),
        port: req.port,
    };
    match state.routes.insert(&req.domain, upstream.clone()).await {
        Ok(domain) => {
            tracing::info!(domain = %domain, host = %upstream.host, port = upstream.port, "admin: route created");
            (
                StatusCode::CREATED,
                Json(RouteResponse {
                    domain,
                    host: upstream.host,
                    port: upstream.port,
                }),
            )
                .into_response()
        }
        Err(err) => route_error_response(err),
    }
}

async fn update_route(
    State(state): State<Arc<AdminState>>,
    Path(domain): Path<String>,
    Json(req): Json<UpdateRouteRequest>,
) -> Response {
    if req.host.trim().is_empty() || req.port == 0 {
        return error_response(StatusCode::BAD_REQUEST, "invalid host or port");
    }

    let upstream = Upstream {
        host: req.host.trim().to_string(),
        port: req.port,
    };
    match state.routes.update(&domain, upstream.clone()).await {
        Ok(domain) => {
            tracing::info!(domain = %domain, host = %upstream.host, port = upstream.port, "admin: route updated");
            (
                StatusCode::OK,
                Json(RouteResponse {
                    domain,
                    host: upstream.host,
                    port: upstream.port,
                }),
            )
                .into_response()
        }
        Err(err) => route_error_response(err),
    }
}

async fn delete_route(
    State(state): State<Arc<AdminState>>,
    Path(domain): Path<String>,
) -> Response {
    match state.routes.remove(&domain).await {
        Ok(()) => {
            tracing::info!(domain = %domain, "admin: route deleted");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => route_error_response(err),
    }
}

async fn list_connections(State(state): State<Arc<AdminState>>) -> Json<Vec<ConnectionView>> {
    Json(state.registry.snapshot())
}

#[derive(Debug, Serialize)]
struct KickResponse {
    kicked: usize,
}

async fn kick_by_id(State(state): State<Arc<AdminState>>, Path(id): Path<u64>) -> Response {
    if state.registry.kick(id) {
        tracing::info!(sid = id, "admin: session kicked");
        (StatusCode::OK, Json(KickResponse { kicked: 1 })).into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, "session not found")
    }
}

#[derive(Debug, Deserialize)]
struct KickByUsernameRequest {
    username: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct KickByIpRequest {
    ip: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct KickByUuidRequest {
    uuid: String,
    port: u16,
}

async fn kick_by_username(
    State(state): State<Arc<AdminState>>,
    Json(req): Json<KickByUsernameRequest>,
) -> Response {
    if req.username.trim().is_empty() || req.port == 0 {
        return error_response(StatusCode::BAD_REQUEST, "invalid username or port");
    }
    let matches = state.registry.by_username(req.username.trim(), req.port);
    kick_all(&state, matches, "username")
}

async fn kick_by_ip(
    State(state): State<Arc<AdminState>>,
    Json(req): Json<KickByIpRequest>,
) -> Response {
    if req.ip.trim().is_empty() || req.port == 0 {
        return error_response(StatusCode::BAD_REQUEST, "invalid ip or port");
    }
    let matches = state.registry.by_ip(req.ip.trim(), req.port);
    kick_all(&state, matches, "ip")
}

async fn kick_by_uuid(
    State(state): State<Arc<AdminState>>,
    Json(req): Json<KickByUuidRequest>,
) -> Response {
    if req.uuid.trim().is_empty() || req.port == 0 {
        return error_response(StatusCode::BAD_REQUEST, "invalid uuid or port");
    }
    let matches = state.registry.by_uuid(req.uuid.trim(), req.port);
    kick_all(&state, matches, "uuid")
}

fn kick_all(state: &AdminState, matches: Vec<ConnectionView>, key: &'static str) -> Response {
    let mut kicked = 0;
    for view in &matches {
        if state.registry.kick(view.id) {
            kicked += 1;
        }
    }
    if kicked == 0 {
        return error_response(StatusCode::NOT_FOUND, "no matching session");
    }
    tracing::info!(key, kicked, "admin: sessions kicked");
    (StatusCode::OK, Json(KickResponse { kicked })).into_response()
}
