use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::header::{CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tower::ServiceExt;

use mushroom_chamber::auth::Auth;
use mushroom_chamber::config::{ChamberConfig, Credentials, HardwareConfig};
use mushroom_chamber::control::{Chamber, SystemState};
use mushroom_chamber::hardware;
use mushroom_chamber::server::{build_router, AppState};

struct TestApp {
    router: Router,
    chamber: Arc<Mutex<Chamber>>,
}

impl TestApp {
    fn new() -> Self {
        let hardware = hardware::simulated(&HardwareConfig::default()).unwrap();
        let chamber = Arc::new(Mutex::new(Chamber::new(
            hardware.devices,
            &ChamberConfig::default(),
        )));
        let auth = Arc::new(Auth::new(&Credentials {
            viewer_user: Some("viewer".to_string()),
            viewer_pass: Some("look".to_string()),
            admin_user: Some("admin".to_string()),
            admin_pass: Some("change".to_string()),
        }));
        let router = build_router(AppState::new(Arc::clone(&chamber), auth, 30));
        Self { router, chamber }
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, body.to_vec())
    }

    async fn login(&self, username: &str, password: &str) -> String {
        let (status, headers, _) = self
            .send(
                Request::post("/login")
                    .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from(format!("username={username}&password={password}")))
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::SEE_OTHER);
        let cookie = headers.get(SET_COOKIE).unwrap().to_str().unwrap();
        cookie.split(';').next().unwrap().to_string()
    }

    async fn get_json(&self, path: &str, cookie: &str) -> (StatusCode, Value) {
        let (status, _, body) = self
            .send(Request::get(path).header(COOKIE, cookie).body(Body::empty()).unwrap())
            .await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn post_json(&self, path: &str, cookie: &str, body: Value) -> (StatusCode, Value) {
        let (status, _, body) = self
            .send(
                Request::post(path)
                    .header(COOKIE, cookie)
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await;
        (status, serde_json::from_slice(&body).unwrap())
    }
}

#[tokio::test]
async fn test_health_needs_no_login() {
    let app = TestApp::new();
    let (status, _, body) = app
        .send(Request::get("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, json!({"status": "ok"}));
}

#[tokio::test]
async fn test_dashboard_redirects_to_login() {
    let app = TestApp::new();
    let (status, headers, _) = app
        .send(Request::get("/").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(headers.get(LOCATION).unwrap(), "/login?next=/");
}

#[tokio::test]
async fn test_login_sets_cookie_and_follows_next() {
    let app = TestApp::new();
    let (status, headers, _) = app
        .send(
            Request::post("/login?next=/api/status")
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from("username=viewer&password=look"))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(headers.get(LOCATION).unwrap(), "/api/status");
    let cookie = headers.get(SET_COOKIE).unwrap().to_str().unwrap();
    assert!(cookie.starts_with("chamber_session="));
    assert!(cookie.contains("HttpOnly"));
}

#[tokio::test]
async fn test_bad_login_returns_login_page() {
    let app = TestApp::new();
    let (status, _, body) = app
        .send(
            Request::post("/login")
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from("username=admin&password=wrong"))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(String::from_utf8(body)
        .unwrap()
        .contains("Invalid username or password"));
}

#[tokio::test]
async fn test_login_is_rate_limited() {
    let app = TestApp::new();
    let mut statuses = Vec::new();
    for _ in 0..6 {
        let (status, _, _) = app
            .send(
                Request::post("/login")
                    .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from("username=admin&password=wrong"))
                    .unwrap(),
            )
            .await;
        statuses.push(status);
    }
    assert!(statuses[..5].iter().all(|s| *s == StatusCode::UNAUTHORIZED));
    assert_eq!(statuses[5], StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_api_requires_session() {
    let app = TestApp::new();
    let (status, _, body) = app
        .send(Request::get("/api/status").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["status"], 401);
}

#[tokio::test]
async fn test_viewer_reads_but_cannot_write() {
    let app = TestApp::new();
    let cookie = app.login("viewer", "look").await;

    let (status, body) = app.get_json("/api/status", &cookie).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["system_state"], "standby");
    assert_eq!(body["setpoints"]["temperature"], 20.0);

    let (status, body) = app.get_json("/api/pid", &cookie).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kp"], 2.0);

    let (status, body) = app
        .post_json("/api/state", &cookie, json!({"state": "active"}))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Admin access required");
}

#[tokio::test]
async fn test_admin_changes_setpoints() {
    let app = TestApp::new();
    let cookie = app.login("admin", "change").await;

    let (status, body) = app
        .post_json("/api/setpoints", &cookie, json!({"temperature": 22.5}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["message"].is_string());
    assert_eq!(app.chamber.lock().await.setpoints().temperature, 22.5);

    let (status, _) = app.post_json("/api/setpoints", &cookie, json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .post_json("/api/setpoints", &cookie, json!({"temperature": 90.0}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(app.chamber.lock().await.setpoints().temperature, 22.5);
}

#[tokio::test]
async fn test_admin_changes_state() {
    let app = TestApp::new();
    let cookie = app.login("admin", "change").await;

    let (status, _) = app
        .post_json("/api/state", &cookie, json!({"state": "active"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.chamber.lock().await.state(), SystemState::Active);

    let (status, _) = app.post_json("/api/state", &cookie, json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app
        .post_json("/api/state", &cookie, json!({"state": "party"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid system state: party");
}

#[tokio::test]
async fn test_emergency_stop_records_error() {
    let app = TestApp::new();
    let cookie = app.login("admin", "change").await;
    app.post_json("/api/state", &cookie, json!({"state": "active"}))
        .await;

    let (status, _) = app
        .post_json("/api/emergency_stop", &cookie, json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.chamber.lock().await.state(), SystemState::Standby);

    let (_, errors) = app.get_json("/api/errors", &cookie).await;
    assert_eq!(errors[0]["message"], "Emergency stop activated");
}

#[tokio::test]
async fn test_photo_mode_and_lights() {
    let app = TestApp::new();
    let cookie = app.login("admin", "change").await;

    let (status, body) = app.post_json("/api/photo", &cookie, json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Photo mode activated for 30 seconds");
    assert!(app.chamber.lock().await.photo_mode());

    let (status, _) = app
        .post_json("/api/photo", &cookie, json!({"duration": 0}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .post_json(
            "/api/lights",
            &cookie,
            json!({"colour": "blue", "neopixel": 0.5, "white": 0.2, "uv": 0.0}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let (_, setpoints) = app.get_json("/api/setpoints", &cookie).await;
    assert_eq!(setpoints["light_schedules"].as_array().unwrap().len(), 1);
    assert_eq!(setpoints["light_schedules"][0]["colour"], "blue");

    let (status, _) = app
        .post_json(
            "/api/lights/schedule",
            &cookie,
            json!({"schedules": [
                {"start": "06:00", "end": "10:00", "colour": "white", "neopixel": 1.0},
                {"start": "22:00", "end": "02:00"}
            ]}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let (_, setpoints) = app.get_json("/api/setpoints", &cookie).await;
    assert_eq!(setpoints["light_schedules"][1]["start"], "22:00");
}

#[tokio::test]
async fn test_pid_update() {
    let app = TestApp::new();
    let cookie = app.login("admin", "change").await;

    let (status, _) = app.post_json("/api/pid", &cookie, json!({"ki": 0.3})).await;
    assert_eq!(status, StatusCode::OK);
    let (_, pid) = app.get_json("/api/pid", &cookie).await;
    assert_eq!(pid["kp"], 2.0);
    assert!((pid["ki"].as_f64().unwrap() - 0.3).abs() < 1e-6);

    let (status, _) = app.post_json("/api/pid", &cookie, json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_logout_ends_session() {
    let app = TestApp::new();
    let cookie = app.login("viewer", "look").await;

    let (status, headers, _) = app
        .send(Request::get("/logout").header(COOKIE, &cookie).body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(headers.get(LOCATION).unwrap(), "/login");

    let (status, _, _) = app
        .send(Request::get("/api/timestamp").header(COOKIE, &cookie).body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_dashboard_renders_for_admin() {
    let app = TestApp::new();
    let cookie = app.login("admin", "change").await;
    let (status, _, body) = app
        .send(Request::get("/").header(COOKIE, &cookie).body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::OK);
    let html = String::from_utf8(body).unwrap();
    assert!(html.contains("Mushroom Chamber"));
    assert!(html.contains("Emergency stop"));
}

#[tokio::test]
async fn test_login_with_missing_password_returns_login_page() {
    let app = TestApp::new();
    let (status, _, body) = app
        .send(
            Request::post("/login")
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from("username=admin"))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(String::from_utf8(body)
        .unwrap()
        .contains("Invalid username or password"));

    let (status, _, _) = app
        .send(Request::post("/login").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_login_keeps_next_with_query_string() {
    let app = TestApp::new();
    let (_, _, page) = app
        .send(
            Request::get("/login?next=%2Fapi%2Fstatus%3Fa%3D1%26b%3D2")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert!(String::from_utf8(page).unwrap().contains("name=\"next\""));

    let (status, headers, _) = app
        .send(
            Request::post("/login")
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(
                    "username=viewer&password=look&next=%2Fapi%2Fstatus%3Fa%3D1%26b%3D2",
                ))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(headers.get(LOCATION).unwrap(), "/api/status?a=1&b=2");
}

#[tokio::test]
async fn test_photo_mode_without_body_uses_default() {
    let app = TestApp::new();
    let cookie = app.login("admin", "change").await;
    let (status, _, body) = app
        .send(
            Request::post("/api/photo")
                .header(COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["message"], "Photo mode activated for 30 seconds");
    assert!(app.chamber.lock().await.photo_mode());
}
