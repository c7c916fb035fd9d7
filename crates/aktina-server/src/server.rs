//! Web server entrypoints live here.

use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{Query, State},
    http::{HeaderName, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::{net::TcpListener, sync::watch, time::timeout};
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::ingest::IngestProvider;
use crate::search::{ApiError, ApiErrorKind, StudySearchProvider, StudySearchQuery};

const HEALTHZ_PATH: &str = "/v1/healthz";
const SEARCH_PATH: &str = "/v1/studies/search";
const UPLOAD_PATH: &str = "/v1/studies/upload";
const UPLOAD_EVENTS_PATH: &str = "/v1/studies/upload/events";
const HEALTHZ_STATUS: &str = "ok";
const REQUEST_ID_HEADER: &str = "x-request-id";
const ERROR_INVALID_PARAMETER: &str = "invalid_parameter";
const ERROR_NOT_FOUND: &str = "not_found";
const ERROR_INTERNAL: &str = "internal_server_error";

#[derive(Debug, Serialize, Copy, Clone, PartialEq, Eq)]
struct HealthzResponse {
    status: &'static str,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("listen address may not be empty")]
    EmptyListenAddr,
    #[error("invalid listen address `{address}`: {source}")]
    InvalidListenAddr {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("axum server error: {source}")]
    Serve {
        #[source]
        source: std::io::Error,
    },
}

type DynSearchProvider = Arc<dyn StudySearchProvider>;
type DynIngestProvider = Arc<dyn IngestProvider>;

#[derive(Clone)]
pub struct ApiState {
    search: DynSearchProvider,
    ingest: DynIngestProvider,
    subscribe_idle: Duration,
}

impl ApiState {
    pub fn new(
        search: DynSearchProvider,
        ingest: DynIngestProvider,
        subscribe_idle: Duration,
    ) -> Self {
        Self {
            search,
            ingest,
            subscribe_idle,
        }
    }
}

pub fn build_api_router(state: ApiState) -> Router {
    Router::new()
        .route(HEALTHZ_PATH, get(healthz))
        .route(SEARCH_PATH, get(search_studies))
        .route(UPLOAD_PATH, post(upload_studies).delete(cancel_upload))
        .route(UPLOAD_EVENTS_PATH, get(upload_events))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            REQUEST_ID_HEADER,
        )))
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static(REQUEST_ID_HEADER),
            MakeRequestUuid,
        ))
        .layer(CorsLayer::permissive())
}

async fn healthz() -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: HEALTHZ_STATUS,
    })
}

async fn search_studies(
    State(state): State<ApiState>,
    Query(query): Query<StudySearchQuery>,
) -> Result<Json<Value>, ApiError> {
    let result = state.search.search(query).await?;
    let mut body = serde_json::to_value(&result).map_err(|err| ApiError::internal(err.to_string()))?;
    if let Value::Object(map) = &mut body {
        map.insert("ok".to_string(), Value::Bool(true));
    }
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
struct UploadRequest {
    files: Vec<std::path::PathBuf>,
}

async fn upload_studies(
    State(state): State<ApiState>,
    Json(request): Json<UploadRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.files.is_empty() {
        return Err(ApiError::invalid_param("files", "no files uploaded"));
    }
    let job_id = state.ingest.enqueue(request.files).await?;
    Ok(Json(json!({
        "ok": true,
        "jobId": job_id,
        "events": format!("{UPLOAD_EVENTS_PATH}?jobId={job_id}"),
    })))
}

#[derive(Debug, Deserialize)]
struct JobQuery {
    #[serde(rename = "jobId")]
    job_id: String,
}

async fn cancel_upload(
    State(state): State<ApiState>,
    Query(query): Query<JobQuery>,
) -> Result<Json<Value>, ApiError> {
    if state.ingest.cancel(&query.job_id) {
        Ok(Json(json!({ "ok": true })))
    } else {
        Err(ApiError::not_found(
            "job",
            format!("job `{}` not found or already finished", query.job_id),
        ))
    }
}

async fn upload_events(
    State(state): State<ApiState>,
    Query(query): Query<JobQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let snapshot = state.ingest.job(&query.job_id).ok_or_else(|| {
        ApiError::not_found("job", format!("job `{}` not found", query.job_id))
    })?;
    let mut events = state
        .ingest
        .subscribe(&query.job_id)
        .ok_or_else(|| ApiError::not_found("job", format!("job `{}` not found", query.job_id)))?;
    let idle = state.subscribe_idle;

    let stream = async_stream::stream! {
        // Replay the last known progress so late subscribers start from a
        // meaningful value rather than silence.
        if let Ok(event) = Event::default().json_data(json!({ "progress": snapshot.progress })) {
            yield Ok::<_, Infallible>(event);
        }
        loop {
            match timeout(idle, events.next()).await {
                Ok(Some(job_event)) => {
                    let terminal = job_event.is_terminal();
                    match Event::default().json_data(job_event.to_payload()) {
                        Ok(event) => yield Ok(event),
                        Err(err) => {
                            warn!(error = %err, "failed to encode job event");
                            break;
                        }
                    }
                    if terminal {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(job_id = %query.job_id, "event subscription idle timeout");
                    break;
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.kind {
            ApiErrorKind::InvalidParameter => (StatusCode::BAD_REQUEST, ERROR_INVALID_PARAMETER),
            ApiErrorKind::NotFound { .. } => (StatusCode::NOT_FOUND, ERROR_NOT_FOUND),
            ApiErrorKind::Internal => (StatusCode::INTERNAL_SERVER_ERROR, ERROR_INTERNAL),
        };
        let mut body = json!({
            "ok": false,
            "error": code,
            "message": self.message,
        });
        if let (Value::Object(map), Some(field)) = (&mut body, self.field) {
            map.insert("field".to_string(), Value::String(field));
        }
        (status, Json(body)).into_response()
    }
}

pub async fn serve(
    config: ServerConfig,
    search: DynSearchProvider,
    ingest: DynIngestProvider,
) -> Result<(), ServerError> {
    let address = config.listen_addr.trim();
    if address.is_empty() {
        return Err(ServerError::EmptyListenAddr);
    }
    let addr: SocketAddr = address
        .parse()
        .map_err(|source| ServerError::InvalidListenAddr {
            address: address.to_string(),
            source,
        })?;

    let state = ApiState::new(
        search,
        ingest,
        Duration::from_secs(config.subscribe_idle_secs),
    );
    let router = build_api_router(state);

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            address: address.to_string(),
            source,
        })?;
    info!(%addr, "listening");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
            info!("draining connections");
        })
        .await
        .map_err(|source| ServerError::Serve { source })
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{JobEvent, JobEventStream, JobSnapshot, JobStateTag};
    use crate::search::{StudySearchResult, StudyHit};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::path::PathBuf;
    use tower::ServiceExt;

    struct MockSearch;

    #[async_trait]
    impl StudySearchProvider for MockSearch {
        async fn search(&self, query: StudySearchQuery) -> Result<StudySearchResult, ApiError> {
            if query.search.trim().is_empty() {
                return Err(ApiError::invalid_param("search", "no search query specified"));
            }
            Ok(StudySearchResult {
                studies: vec![StudyHit {
                    id: "1.2.3".to_string(),
                    thumbnail: None,
                    report: "unremarkable".to_string(),
                }],
                total: 1,
                ..Default::default()
            })
        }
    }

    struct MockIngest;

    #[async_trait]
    impl IngestProvider for MockIngest {
        async fn enqueue(&self, _files: Vec<PathBuf>) -> Result<String, ApiError> {
            Ok("job-1".to_string())
        }

        fn subscribe(&self, job_id: &str) -> Option<JobEventStream> {
            (job_id == "job-1").then(|| {
                Box::pin(futures_util::stream::iter(vec![
                    JobEvent::Progress(0.5),
                    JobEvent::Completed,
                ])) as JobEventStream
            })
        }

        fn job(&self, job_id: &str) -> Option<JobSnapshot> {
            (job_id == "job-1").then(|| JobSnapshot {
                id: "job-1".to_string(),
                state: JobStateTag::Indexing,
                progress: 0.5,
                current_study_uid: None,
                error: None,
            })
        }

        fn cancel(&self, _job_id: &str) -> bool {
            false
        }
    }

    struct StalledIngest;

    #[async_trait]
    impl IngestProvider for StalledIngest {
        async fn enqueue(&self, _files: Vec<PathBuf>) -> Result<String, ApiError> {
            Ok("job-1".to_string())
        }

        fn subscribe(&self, job_id: &str) -> Option<JobEventStream> {
            (job_id == "job-1").then(|| Box::pin(futures_util::stream::pending()) as JobEventStream)
        }

        fn job(&self, job_id: &str) -> Option<JobSnapshot> {
            (job_id == "job-1").then(|| JobSnapshot {
                id: "job-1".to_string(),
                state: JobStateTag::Uploading,
                progress: 0.25,
                current_study_uid: None,
                error: None,
            })
        }

        fn cancel(&self, _job_id: &str) -> bool {
            false
        }
    }

    fn router() -> Router {
        build_api_router(ApiState::new(
            Arc::new(MockSearch),
            Arc::new(MockIngest),
            Duration::from_secs(5),
        ))
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let response = router()
            .oneshot(Request::get(HEALTHZ_PATH).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn search_requires_a_term() {
        let response = router()
            .oneshot(
                Request::get(format!("{SEARCH_PATH}?search="))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["ok"], json!(false));
        assert_eq!(body["error"], json!("invalid_parameter"));
        assert_eq!(body["field"], json!("search"));
    }

    #[tokio::test]
    async fn search_wraps_provider_result() {
        let response = router()
            .oneshot(
                Request::get(format!("{SEARCH_PATH}?search=nodule"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["ok"], json!(true));
        assert_eq!(body["total"], json!(1));
        assert_eq!(body["studies"][0]["id"], json!("1.2.3"));
    }

    #[tokio::test]
    async fn upload_rejects_empty_file_list() {
        let response = router()
            .oneshot(
                Request::post(UPLOAD_PATH)
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"files":[]}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn upload_returns_job_handle() {
        let response = router()
            .oneshot(
                Request::post(UPLOAD_PATH)
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"files":["a.dcm"]}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["jobId"], json!("job-1"));
        assert_eq!(
            body["events"],
            json!(format!("{UPLOAD_EVENTS_PATH}?jobId=job-1"))
        );
    }

    #[tokio::test]
    async fn events_for_unknown_job_is_not_found() {
        let response = router()
            .oneshot(
                Request::get(format!("{UPLOAD_EVENTS_PATH}?jobId=nope"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn idle_event_feeds_are_closed_after_the_timeout() {
        let router = build_api_router(ApiState::new(
            Arc::new(MockSearch),
            Arc::new(StalledIngest),
            Duration::from_millis(50),
        ));
        let response = router
            .oneshot(
                Request::get(format!("{UPLOAD_EVENTS_PATH}?jobId=job-1"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        // The provider never emits, so only the replayed snapshot arrives
        // before the stream is closed.
        let collected = timeout(Duration::from_secs(5), response.into_body().collect())
            .await
            .expect("stream closed by the idle timeout")
            .expect("body");
        let body = String::from_utf8(collected.to_bytes().to_vec()).expect("utf8 body");
        assert!(body.contains(r#"{"progress":0.25}"#), "body: {body}");
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_not_found() {
        let response = router()
            .oneshot(
                Request::delete(format!("{UPLOAD_PATH}?jobId=nope"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
