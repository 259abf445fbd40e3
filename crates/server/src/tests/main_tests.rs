use super::*;
use axum::{body, body::Body, http::Request};
use server_api::credentials::hash_password;
use shared::domain::{InstitutionId, RoleKind};
use storage::NewProfile;
use tower::ServiceExt;

const PASSWORD: &str = "demo-password";

struct TestApp {
    app: Router,
    storage: Storage,
    institution: InstitutionId,
    events: broadcast::Sender<ServerEvent>,
}

async fn add_profile(
    storage: &Storage,
    email: &str,
    role: RoleKind,
    institution_id: Option<InstitutionId>,
) -> shared::domain::ProfileId {
    let password_hash = hash_password(PASSWORD).expect("hash");
    storage
        .create_profile(NewProfile {
            email,
            full_name: email,
            role,
            institution_id,
            password_hash: &password_hash,
        })
        .await
        .expect("profile")
}

async fn test_app() -> TestApp {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let institution = storage
        .create_institution("Demo College")
        .await
        .expect("institution");
    add_profile(
        &storage,
        "faculty@demo.com",
        RoleKind::CollegeAdmin,
        Some(institution),
    )
    .await;

    let api = ApiContext {
        store: Arc::new(storage.clone()),
        sessions: SessionConfig {
            secret: "s".to_string(),
            ttl_seconds: 60,
        },
        capacity_policy: shared::domain::CapacityPolicy::Advisory,
    };
    let (events, _) = broadcast::channel(32);
    let app = build_router(Arc::new(AppState {
        api,
        events: events.clone(),
    }));
    TestApp {
        app,
        storage,
        institution,
        events,
    }
}

async fn enroll(t: &TestApp, email: &str) -> i64 {
    let profile = add_profile(&t.storage, email, RoleKind::Student, Some(t.institution)).await;
    t.storage
        .enroll_student(profile, t.institution, "B.Tech CS", 6, &[])
        .await
        .expect("enroll")
        .0
}

async fn read_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

fn json_request(method: &str, uri: &str, token: Option<&str>, body: serde_json::Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).expect("request")
}

fn authed(method: &str, uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .expect("request")
}

async fn login_token(app: &Router, email: &str) -> String {
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/login",
            None,
            serde_json::json!({ "email": email, "password": PASSWORD }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let dto: LoginResponse = read_json(response).await;
    dto.token
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let t = test_app().await;
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = t.app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn mentoring_routes_require_a_bearer_token() {
    let t = test_app().await;
    let response = t
        .app
        .clone()
        .oneshot(
            Request::get("/mentoring/students")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = t
        .app
        .oneshot(authed("GET", "/mentoring/students", "not-a-token"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn bad_credentials_are_unauthorized() {
    let t = test_app().await;
    for body in [
        serde_json::json!({ "email": "ghost@demo.com", "password": PASSWORD }),
        serde_json::json!({ "email": "faculty@demo.com", "password": "wrong-password" }),
    ] {
        let response = t
            .app
            .clone()
            .oneshot(json_request("POST", "/login", None, body))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}

#[tokio::test]
async fn admin_signup_for_registered_institution_conflicts() {
    let t = test_app().await;
    let response = t
        .app
        .oneshot(json_request(
            "POST",
            "/signup",
            None,
            serde_json::json!({
                "email": "intruder@evil.com",
                "full_name": "Intruder",
                "password": "intruder-pass",
                "role": "college_admin",
                "institution": "Demo College",
            }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn assignment_lifecycle_over_http() {
    let t = test_app().await;
    let mut events = t.events.subscribe();
    let s1 = enroll(&t, "s1@demo.com").await;
    let s2 = enroll(&t, "s2@demo.com").await;
    let token = login_token(&t.app, "faculty@demo.com").await;

    let response = t
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/mentoring/mentors",
            Some(&token),
            serde_json::json!({
                "name": "Dr Mehta",
                "email": "mehta@demo.com",
                "specialization": "AI/ML",
                "max_students": 1,
            }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
    let mentor: MentorSummary = read_json(response).await;
    assert!(matches!(
        events.try_recv().expect("mentor event"),
        ServerEvent::MentorAdded { .. }
    ));

    let response = t
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/mentoring/assignments",
            Some(&token),
            serde_json::json!({ "student_id": s1, "mentor_id": mentor.mentor_id.0 }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let receipt: AssignmentReceipt = read_json(response).await;
    assert_eq!(receipt.outcome, AssignOutcome::Created);
    assert_eq!(receipt.mentor.available_slots, 0);
    match events.try_recv().expect("assignment event") {
        ServerEvent::AssignmentChanged {
            student_id,
            mentor_id,
            ..
        } => {
            assert_eq!(student_id.0, s1);
            assert_eq!(mentor_id, Some(mentor.mentor_id));
        }
        other => panic!("unexpected event {other:?}"),
    }

    let response = t
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/mentoring/assignments",
            Some(&token),
            serde_json::json!({ "student_id": s1, "mentor_id": mentor.mentor_id.0 }),
        ))
        .await
        .expect("response");
    let receipt: AssignmentReceipt = read_json(response).await;
    assert_eq!(receipt.outcome, AssignOutcome::Unchanged);
    assert!(
        events.try_recv().is_err(),
        "an unchanged assignment must not be broadcast"
    );

    let response = t
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/mentoring/assignments",
            Some(&token),
            serde_json::json!({ "student_id": s2, "mentor_id": mentor.mentor_id.0 }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let receipt: AssignmentReceipt = read_json(response).await;
    assert_eq!(receipt.mentor.raw_available_slots, -1);
    assert_eq!(receipt.mentor.available_slots, 0);
    assert!(receipt.mentor.is_full);

    let response = t
        .app
        .clone()
        .oneshot(authed(
            "DELETE",
            &format!("/mentoring/students/{s1}/assignment"),
            &token,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let removed: UnassignResponse = read_json(response).await;
    assert!(removed.deactivated);

    let response = t
        .app
        .clone()
        .oneshot(authed(
            "DELETE",
            &format!("/mentoring/students/{s1}/assignment"),
            &token,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let removed: UnassignResponse = read_json(response).await;
    assert!(!removed.deactivated);

    let response = t
        .app
        .clone()
        .oneshot(authed(
            "GET",
            &format!("/mentoring/students/{s1}/assignments"),
            &token,
        ))
        .await
        .expect("response");
    let history: Vec<AssignmentRecord> = read_json(response).await;
    assert_eq!(history.len(), 1);

    let response = t
        .app
        .clone()
        .oneshot(authed("GET", "/mentoring/overview", &token))
        .await
        .expect("response");
    let overview: MentoringOverview = read_json(response).await;
    assert_eq!(overview.total_students, 2);
    assert_eq!(overview.assigned_students, 1);

    let response = t
        .app
        .oneshot(authed("GET", "/mentoring/mentors", &token))
        .await
        .expect("response");
    let mentors: Vec<MentorSummary> = read_json(response).await;
    assert_eq!(mentors.len(), 1);
    assert_eq!(mentors[0].assigned_students, 1);
    assert_eq!(mentors[0].available_slots, 0);
}

#[tokio::test]
async fn missing_selection_is_a_bad_request() {
    let t = test_app().await;
    let token = login_token(&t.app, "faculty@demo.com").await;
    let response = t
        .app
        .oneshot(json_request(
            "POST",
            "/mentoring/assignments",
            Some(&token),
            serde_json::json!({ "student_id": 1 }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let err: ApiError = read_json(response).await;
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn students_cannot_open_admin_routes_but_see_their_dashboard() {
    let t = test_app().await;
    enroll(&t, "s1@demo.com").await;
    let token = login_token(&t.app, "s1@demo.com").await;

    let response = t
        .app
        .clone()
        .oneshot(authed("GET", "/mentoring/mentors", &token))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = t
        .app
        .oneshot(authed("GET", "/dashboard", &token))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let view: DashboardView = read_json(response).await;
    assert!(matches!(view, DashboardView::Student { student: Some(_), .. }));
}

#[tokio::test]
async fn signup_creates_company_profile() {
    let t = test_app().await;
    let response = t
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/signup",
            None,
            serde_json::json!({
                "email": "industry@demo.com",
                "full_name": "Demo Industry",
                "password": PASSWORD,
                "role": "company",
            }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let view: SessionView = read_json(response).await;
    assert_eq!(view.role, shared::domain::Role::Company);

    let token = login_token(&t.app, "industry@demo.com").await;
    let response = t
        .app
        .oneshot(authed("GET", "/dashboard", &token))
        .await
        .expect("response");
    let view: DashboardView = read_json(response).await;
    assert!(matches!(view, DashboardView::Company { .. }));
}

#[test]
fn events_are_scoped_to_the_admin_institution() {
    let event = ServerEvent::AssignmentChanged {
        institution_id: InstitutionId(1),
        student_id: StudentId(2),
        mentor_id: None,
    };
    assert!(visible_to(Some(InstitutionId(1)), &event));
    assert!(!visible_to(Some(InstitutionId(2)), &event));
    assert!(!visible_to(None, &event));
}
