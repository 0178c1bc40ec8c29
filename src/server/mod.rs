//! HTTP interface: the dashboard, login and the JSON API.

mod error;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::FromRef;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;

use crate::auth::Auth;
use crate::control::Chamber;
use crate::rendering::Pages;

pub use error::{ApiError, ApiResult};

/// Shared state handed to every handler
#[derive(Clone, FromRef)]
pub struct AppState {
    pub chamber: Arc<Mutex<Chamber>>,
    pub auth: Arc<Auth>,
    pub pages: Arc<Pages>,
    pub photo_default_secs: u64,
}

impl AppState {
    pub fn new(chamber: Arc<Mutex<Chamber>>, auth: Arc<Auth>, photo_default_secs: u64) -> Self {
        Self {
            chamber,
            auth,
            pages: Arc::new(Pages::new()),
            photo_default_secs,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let page_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/login", get(handlers::login_page).post(handlers::login))
        .route("/logout", get(handlers::logout))
        .route("/", get(handlers::dashboard));

    let api_routes = Router::new()
        .route("/api/status", get(handlers::status))
        .route("/api/sensors", get(handlers::sensors))
        .route(
            "/api/setpoints",
            get(handlers::get_setpoints).post(handlers::update_setpoints),
        )
        .route("/api/lights/schedule", post(handlers::set_light_schedule))
        .route("/api/lights", post(handlers::set_lights))
        .route("/api/photo", post(handlers::photo_mode))
        .route("/api/pid", get(handlers::get_pid).post(handlers::update_pid))
        .route("/api/state", post(handlers::set_state))
        .route("/api/emergency_stop", post(handlers::emergency_stop))
        .route("/api/errors", get(handlers::errors))
        .route("/api/timestamp", get(handlers::timestamp));

    Router::new()
        .merge(page_routes)
        .merge(api_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}
