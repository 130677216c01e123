/**
 * API HTTP ALIVE - Flux SSE des viewers + CRUD des boxes
 *
 * RÔLE :
 * Couche fine au-dessus du Dashboard : aucune logique métier ici.
 *
 * FONCTIONNEMENT :
 * - GET /events : une mailbox par requête, servie par `viewer::serve` dans une
 *   task dédiée qui écrit dans un pipe relu comme corps de réponse
 * - /api/v1/boxes : lecture, création, remplacement, suppression
 * - /api/v1/boxes/{id}/events : mise à jour de statut (diffusée aux viewers)
 * - /api/v1/box/... : anciennes routes, toujours servies avec un en-tête
 *   `Warning: 299` indiquant la route à utiliser
 * - Erreurs en JSON `{message, error?}` : 400 / 404 / 409 / 500
 */

use crate::broker::BrokerError;
use crate::dashboard::{Dashboard, DashboardError};
use crate::models::{Event, StatusBox};
use crate::store::StoreError;
use crate::viewer;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const STREAM_BUFFER: usize = 16 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub dashboard: Dashboard,
    pub shutdown: CancellationToken,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    error: Option<String>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            error: None,
        }
    }

    fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, error = ?self.error, "{}", self.message);
        }
        let body = ErrorBody {
            message: self.message,
            error: self.error,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => Self::not_found(err.to_string()),
            StoreError::DuplicateId(_) => Self::new(StatusCode::CONFLICT, err.to_string()),
        }
    }
}

impl From<DashboardError> for ApiError {
    fn from(err: DashboardError) -> Self {
        match err {
            DashboardError::Store(e) => e.into(),
            DashboardError::MissingId => Self::bad_request(err.to_string()),
            DashboardError::ReplaceRestored(ref e) | DashboardError::ReplaceLost(ref e) => {
                Self::internal(err.to_string()).with_error(e)
            }
        }
    }
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        Self::internal("event broker unavailable").with_error(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request("invalid JSON body").with_error(rejection.body_text())
    }
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/events", get(events))
        .route("/api/v1/boxes", get(list_boxes).post(create_box))
        .route("/api/v1/boxes/{id}", get(get_box).put(put_box).delete(delete_box))
        .route("/api/v1/boxes/{id}/events", post(post_event))
        .route("/api/v1/reload", post(reload))
        .merge(deprecated_routes())
        .with_state(app_state)
}

fn deprecated_routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/box", get(list_boxes))
        .route("/api/v1/box/new", post(create_box))
        .route("/api/v1/box/update", post(update_box))
        .route("/api/v1/box/{id}", get(get_box).delete(delete_box))
        .route("/api/v1/box/{id}/event", post(post_event))
        .layer(middleware::from_fn(deprecation_warning))
}

async fn deprecation_warning(req: Request, next: Next) -> Response {
    let replacement = replacement_route(req.method(), req.uri().path());
    let mut response = next.run(req).await;
    if let Some(replacement) = replacement {
        response.headers_mut().insert(header::WARNING, HeaderValue::from_static(replacement));
    }
    response
}

fn replacement_route(method: &Method, path: &str) -> Option<&'static str> {
    let rest = path.strip_prefix("/api/v1/box")?;
    if !(rest.is_empty() || rest.starts_with('/')) {
        return None;
    }
    let warning = match (method.as_str(), rest) {
        ("GET", "") => r#"299 alive "use GET /api/v1/boxes instead""#,
        ("POST", "/new") => r#"299 alive "use POST /api/v1/boxes instead""#,
        ("POST", "/update") => r#"299 alive "use PUT /api/v1/boxes/{id} instead""#,
        ("POST", r) if r.ends_with("/event") => r#"299 alive "use POST /api/v1/boxes/{id}/events instead""#,
        ("GET", _) => r#"299 alive "use GET /api/v1/boxes/{id} instead""#,
        ("DELETE", _) => r#"299 alive "use DELETE /api/v1/boxes/{id} instead""#,
        _ => return None,
    };
    Some(warning)
}

// GET /health
async fn health(State(app): State<AppState>) -> Json<serde_json::Value> {
    let viewers = app.dashboard.broker().client_count().await.unwrap_or(0);
    Json(serde_json::json!({
        "status": "ok",
        "viewers": viewers,
        "boxes": app.dashboard.store().len(),
    }))
}

// GET /events (flux SSE, une connexion = un viewer)
async fn events(State(app): State<AppState>) -> Result<Response, ApiError> {
    let mailbox = app.dashboard.broker().subscribe().await?;
    let (mut writer, reader) = tokio::io::duplex(STREAM_BUFFER);
    let cancel = app.shutdown.child_token();

    tokio::spawn(async move {
        if let Err(e) = viewer::serve(mailbox, &mut writer, cancel).await {
            debug!("viewer stream closed: {e}");
        }
    });

    let headers = [
        (header::CONTENT_TYPE, "text/event-stream"),
        (header::CACHE_CONTROL, "no-cache"),
        (header::CONNECTION, "keep-alive"),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(reader))).into_response())
}

// GET /api/v1/boxes
async fn list_boxes(State(app): State<AppState>) -> Json<Vec<StatusBox>> {
    Json(app.dashboard.store().get_all())
}

// POST /api/v1/boxes
async fn create_box(
    State(app): State<AppState>,
    body: Result<Json<StatusBox>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(status_box) = body?;
    let stored = app.dashboard.add_box(status_box).await?;
    let location = format!("/api/v1/boxes/{}", stored.id);
    Ok((StatusCode::CREATED, [(header::LOCATION, location)], Json(stored)).into_response())
}

// GET /api/v1/boxes/{id}
async fn get_box(State(app): State<AppState>, Path(id): Path<String>) -> Result<Json<StatusBox>, ApiError> {
    Ok(Json(app.dashboard.store().get_by_id(&id)?))
}

// PUT /api/v1/boxes/{id} (l'id du chemin fait foi)
async fn put_box(
    State(app): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<StatusBox>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(mut status_box) = body?;
    status_box.id = id;
    let outcome = app.dashboard.replace_box(status_box).await?;
    let status = if outcome.replaced { StatusCode::OK } else { StatusCode::CREATED };
    Ok((status, Json(outcome.status_box)).into_response())
}

// POST /api/v1/box/update (ancienne forme : l'id vient du corps)
async fn update_box(
    State(app): State<AppState>,
    body: Result<Json<StatusBox>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(status_box) = body?;
    let outcome = app.dashboard.replace_box(status_box).await?;
    let status = if outcome.replaced { StatusCode::OK } else { StatusCode::CREATED };
    Ok((status, Json(outcome.status_box)).into_response())
}

// DELETE /api/v1/boxes/{id}
async fn delete_box(State(app): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    match app.dashboard.delete_box(&id, true).await {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(StoreError::NotFound(id).into()),
    }
}

// POST /api/v1/boxes/{id}/events
async fn post_event(
    State(app): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<Event>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(mut event) = body?;
    event.id = id;
    app.dashboard.apply_event(event).await?;
    Ok(StatusCode::CREATED)
}

// POST /api/v1/reload (rechargement des navigateurs connectés)
async fn reload(State(app): State<AppState>) -> StatusCode {
    app.dashboard.reload_viewers().await;
    StatusCode::ACCEPTED
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, DEFAULT_MAILBOX_CAPACITY};
    use crate::models::{BoxSize, Status};
    use crate::store::BoxStore;
    use axum::http::Request;
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::time::timeout;
    use tower::ServiceExt;

    const WAIT: Duration = Duration::from_secs(2);

    fn app() -> (Router, Dashboard, CancellationToken) {
        let shutdown = CancellationToken::new();
        let broker = Broker::start(DEFAULT_MAILBOX_CAPACITY, shutdown.clone());
        let dashboard = Dashboard::new(BoxStore::new(), broker);
        let router = build_router(AppState {
            dashboard: dashboard.clone(),
            shutdown: shutdown.clone(),
        });
        (router, dashboard, shutdown)
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_counts() {
        let (router, dashboard, shutdown) = app();
        dashboard.add_box(StatusBox::new("svc", BoxSize::Small)).await.unwrap();

        let response = router.oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["boxes"], 1);
        assert_eq!(body["viewers"], 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_create_then_get_box() {
        let (router, _dashboard, shutdown) = app();
        let response = router
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/v1/boxes",
                serde_json::json!({"name": "Crow", "size": "medium", "maxTBU": "5m"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let location = response.headers()[header::LOCATION].to_str().unwrap().to_string();
        let created = body_json(response).await;
        assert_eq!(created["name"], "Crow");
        assert_eq!(created["maxTBU"], "5m");

        let response = router.oneshot(get_request(&location)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["id"], created["id"]);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_duplicate_id_conflicts() {
        let (router, _dashboard, shutdown) = app();
        let body = serde_json::json!({"id": "svc", "name": "one"});
        let first = router.clone().oneshot(json_request("POST", "/api/v1/boxes", body.clone())).await.unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = router.oneshot(json_request("POST", "/api/v1/boxes", body)).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
        assert!(body_json(second).await["message"].as_str().unwrap().contains("svc"));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_invalid_body_is_bad_request() {
        let (router, _dashboard, shutdown) = app();
        let response = router
            .oneshot(json_request("POST", "/api/v1/boxes", serde_json::json!({"size": "huge"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["message"], "invalid JSON body");
        assert!(body["error"].is_string());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_event_updates_box() {
        let (router, dashboard, shutdown) = app();
        let stored = dashboard.add_box(StatusBox::new("svc", BoxSize::Small)).await.unwrap();

        let uri = format!("/api/v1/boxes/{}/events", stored.id);
        let response = router
            .clone()
            .oneshot(json_request("POST", &uri, serde_json::json!({"status": "amber", "lastMessage": "slow"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let updated = dashboard.store().get_by_id(&stored.id).unwrap();
        assert_eq!(updated.status, Status::Amber);
        assert_eq!(updated.last_message, "slow");

        let response = router
            .oneshot(json_request("POST", "/api/v1/boxes/ghost/events", serde_json::json!({"status": "red"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_put_and_delete_box() {
        let (router, dashboard, shutdown) = app();
        let response = router
            .clone()
            .oneshot(json_request("PUT", "/api/v1/boxes/svc", serde_json::json!({"name": "v1"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = router
            .clone()
            .oneshot(json_request("PUT", "/api/v1/boxes/svc", serde_json::json!({"name": "v2"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(dashboard.store().get_by_id("svc").unwrap().name, "v2");

        let delete = Request::builder().method("DELETE").uri("/api/v1/boxes/svc").body(Body::empty()).unwrap();
        let response = router.clone().oneshot(delete).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = router.oneshot(get_request("/api/v1/boxes/svc")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_legacy_routes_answer_with_warning() {
        let (router, dashboard, shutdown) = app();
        let response = router
            .clone()
            .oneshot(json_request("POST", "/api/v1/box/new", serde_json::json!({"id": "old", "name": "legacy"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers()[header::WARNING],
            r#"299 alive "use POST /api/v1/boxes instead""#
        );

        let response = router
            .clone()
            .oneshot(json_request("POST", "/api/v1/box/old/event", serde_json::json!({"status": "green"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers()[header::WARNING].to_str().unwrap().contains("/events"));
        assert_eq!(dashboard.store().get_by_id("old").unwrap().status, Status::Green);

        let response = router
            .clone()
            .oneshot(json_request("POST", "/api/v1/box/update", serde_json::json!({"name": "no id"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router.clone().oneshot(get_request("/api/v1/box/old")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(header::WARNING));

        let response = router.oneshot(get_request("/api/v1/boxes/old")).await.unwrap();
        assert!(!response.headers().contains_key(header::WARNING));
        shutdown.cancel();
    }

    #[test]
    fn test_replacement_routes() {
        assert_eq!(
            replacement_route(&Method::DELETE, "/api/v1/box/abc"),
            Some(r#"299 alive "use DELETE /api/v1/boxes/{id} instead""#)
        );
        assert_eq!(replacement_route(&Method::GET, "/api/v1/boxes"), None);
        assert_eq!(replacement_route(&Method::PUT, "/api/v1/box/abc"), None);
    }

    #[tokio::test]
    async fn test_event_stream_frames_broadcasts() {
        let (router, dashboard, shutdown) = app();
        let response = router.oneshot(get_request("/events")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(dashboard.broker().client_count().await.unwrap(), 1);

        dashboard.reload_viewers().await;
        let mut stream = response.into_body().into_data_stream();
        let chunk = timeout(WAIT, stream.next()).await.unwrap().unwrap().unwrap();
        let text = String::from_utf8(chunk.to_vec()).unwrap();
        assert!(text.starts_with("data: {"));
        assert!(text.contains("\"type\":\"reloadPage\""));
        assert!(text.ends_with("\n\n"));

        // fin du flux à l'arrêt
        shutdown.cancel();
        assert!(timeout(WAIT, stream.next()).await.unwrap().is_none());
    }
}
