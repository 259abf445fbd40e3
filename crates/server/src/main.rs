use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use server_api::{
    add_mentor, assign_mentor, assignment_history, dashboard, list_mentors, list_students, login,
    mentoring_overview, resolve_session, signup, unassign_mentor, ApiContext, Session,
    SessionConfig,
};
use shared::{
    domain::StudentId,
    error::{ApiError, ErrorCode},
    protocol::{
        AddMentorRequest, AssignMentorRequest, AssignOutcome, AssignmentReceipt, AssignmentRecord, DashboardView,
        LoginRequest, LoginResponse, MentorSummary, MentoringOverview, ServerEvent, SessionView,
        SignupRequest, StudentSummary, UnassignResponse,
    },
};
use storage::{MentorshipStore, Storage};
use tokio::sync::broadcast;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;

use config::{load_settings, prepare_database_url};

const MAX_REQUEST_BYTES: usize = 64 * 1024;

#[derive(Clone)]
struct AppState {
    api: ApiContext,
    events: broadcast::Sender<ServerEvent>,
}

type HttpError = (StatusCode, Json<ApiError>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let api = ApiContext {
        store: Arc::new(storage),
        sessions: SessionConfig {
            secret: settings.session_secret,
            ttl_seconds: settings.session_ttl_seconds,
        },
        capacity_policy: settings.capacity_policy,
    };
    let (events, _) = broadcast::channel(256);

    let state = AppState { api, events };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, capacity_policy = ?settings.capacity_policy, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/signup", post(http_signup))
        .route("/login", post(http_login))
        .route("/dashboard", get(http_dashboard))
        .route("/mentoring/overview", get(http_overview))
        .route("/mentoring/students", get(http_list_students))
        .route(
            "/mentoring/mentors",
            get(http_list_mentors).post(http_add_mentor),
        )
        .route("/mentoring/assignments", post(http_assign))
        .route(
            "/mentoring/students/:student_id/assignment",
            delete(http_unassign),
        )
        .route(
            "/mentoring/students/:student_id/assignments",
            get(http_assignment_history),
        )
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> HttpError {
    (status_for(err.code), Json(err))
}

async fn session_from_headers(state: &AppState, headers: &HeaderMap) -> Result<Session, HttpError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| {
            reject(ApiError::new(
                ErrorCode::Unauthorized,
                "missing bearer session token",
            ))
        })?;
    resolve_session(&state.api, token).await.map_err(reject)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    state.api.store.health_check().await.map_err(|e| {
        error!(error = %e, "health check failed");
        reject(ApiError::new(ErrorCode::Internal, e.to_string()))
    })?;
    Ok("ok")
}

async fn http_signup(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SignupRequest>,
) -> Result<Json<SessionView>, HttpError> {
    signup(&state.api, req).await.map(Json).map_err(reject)
}

async fn http_login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, HttpError> {
    login(&state.api, req).await.map(Json).map_err(reject)
}

async fn http_dashboard(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<DashboardView>, HttpError> {
    let session = session_from_headers(&state, &headers).await?;
    dashboard(&state.api, &session)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_overview(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<MentoringOverview>, HttpError> {
    let session = session_from_headers(&state, &headers).await?;
    mentoring_overview(&state.api, &session)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_list_students(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<StudentSummary>>, HttpError> {
    let session = session_from_headers(&state, &headers).await?;
    list_students(&state.api, &session)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_list_mentors(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<MentorSummary>>, HttpError> {
    let session = session_from_headers(&state, &headers).await?;
    list_mentors(&state.api, &session)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_add_mentor(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<AddMentorRequest>,
) -> Result<(StatusCode, Json<MentorSummary>), HttpError> {
    let session = session_from_headers(&state, &headers).await?;
    let mentor = add_mentor(&state.api, &session, req)
        .await
        .map_err(reject)?;
    let _ = state.events.send(ServerEvent::MentorAdded {
        mentor: mentor.clone(),
    });
    Ok((StatusCode::CREATED, Json(mentor)))
}

async fn http_assign(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<AssignMentorRequest>,
) -> Result<Json<AssignmentReceipt>, HttpError> {
    let session = session_from_headers(&state, &headers).await?;
    let receipt = assign_mentor(&state.api, &session, req)
        .await
        .map_err(reject)?;
    if receipt.outcome != AssignOutcome::Unchanged {
        let _ = state.events.send(ServerEvent::AssignmentChanged {
            institution_id: receipt.mentor.institution_id,
            student_id: receipt.assignment.student_id,
            mentor_id: Some(receipt.assignment.mentor_id),
        });
    }
    Ok(Json(receipt))
}

async fn http_unassign(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(student_id): Path<i64>,
) -> Result<Json<UnassignResponse>, HttpError> {
    let session = session_from_headers(&state, &headers).await?;
    let student_id = StudentId(student_id);
    let response = unassign_mentor(&state.api, &session, student_id)
        .await
        .map_err(reject)?;
    if response.deactivated {
        if let Ok(institution_id) = session.admin_institution() {
            let _ = state.events.send(ServerEvent::AssignmentChanged {
                institution_id,
                student_id,
                mentor_id: None,
            });
        }
    }
    Ok(Json(response))
}

async fn http_assignment_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(student_id): Path<i64>,
) -> Result<Json<Vec<AssignmentRecord>>, HttpError> {
    let session = session_from_headers(&state, &headers).await?;
    assignment_history(&state.api, &session, StudentId(student_id))
        .await
        .map(Json)
        .map_err(reject)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, HttpError> {
    let session = session_from_headers(&state, &headers).await?;
    Ok(ws.on_upgrade(move |socket| ws_connection(state, socket, session)))
}

async fn ws_connection(
    state: Arc<AppState>,
    socket: axum::extract::ws::WebSocket,
    session: Session,
) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let scope = session.admin_institution().ok();
    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.events.subscribe();

    let send_task = tokio::spawn(async move {
        while let Ok(event) = events_rx.recv().await {
            if !visible_to(scope, &event) {
                continue;
            }
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
}

/// Mentoring events only reach admins of the institution they concern.
fn visible_to(scope: Option<shared::domain::InstitutionId>, event: &ServerEvent) -> bool {
    let institution_id = match event {
        ServerEvent::AssignmentChanged { institution_id, .. } => *institution_id,
        ServerEvent::MentorAdded { mentor } => mentor.institution_id,
    };
    scope == Some(institution_id)
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
