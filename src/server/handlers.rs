//! Route handlers.
//!
//! Reads need any logged-in user; anything that changes the chamber needs an
//! admin. Mutations answer `{"message": ...}`.

use axum::extract::rejection::{FormRejection, JsonRejection};
use axum::extract::{Query, State};
use axum::http::header::SET_COOKIE;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::{Form, Json};
use chrono::Local;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ApiError, ApiResult, AppState};
use crate::auth::{AdminUser, ClientAddr, CurrentUser, SESSION_COOKIE, SESSION_TTL};
use crate::control::{
    ErrorEntry, PidParameters, SensorData, SystemStatus, TIMESTAMP_FORMAT,
};
use crate::devices::Colour;
use crate::preferences::{LightSchedule, SetpointUpdate, Setpoints};

fn message(text: impl Into<String>) -> Json<Value> {
    Json(json!({ "message": text.into() }))
}

/// Unwraps a JSON body, turning a rejection into a 400
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

/// `GET /health`
pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    pub next: Option<String>,
}

/// Missing fields fail the login like wrong ones
#[derive(Debug, Default, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Carried from the login page so it survives `&` and `#`
    #[serde(default)]
    pub next: Option<String>,
}

/// Only same-site paths are followed after login
fn safe_next(next: Option<&str>) -> &str {
    match next {
        Some(path) if path.starts_with('/') && !path.starts_with("//") => path,
        _ => "/",
    }
}

fn login_error(state: &AppState, status: StatusCode, message: &str, next: Option<&str>) -> Response {
    match state.pages.login(Some(message), next) {
        Ok(html) => (status, Html(html)).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// `GET /login`
pub async fn login_page(
    State(state): State<AppState>,
    Query(query): Query<LoginQuery>,
) -> ApiResult<Html<String>> {
    Ok(Html(state.pages.login(None, query.next.as_deref())?))
}

/// `POST /login`
pub async fn login(
    State(state): State<AppState>,
    ClientAddr(client): ClientAddr,
    Query(query): Query<LoginQuery>,
    form: Result<Form<LoginForm>, FormRejection>,
) -> Response {
    let form = match form {
        Ok(Form(form)) => form,
        Err(rejection) => {
            tracing::debug!(error = %rejection, "unreadable login form");
            LoginForm::default()
        }
    };
    let next = form.next.as_deref().or(query.next.as_deref());
    if !state.auth.allow_login_attempt(&client) {
        tracing::warn!(client = %client, "login rate limit exceeded");
        return login_error(
            &state,
            StatusCode::TOO_MANY_REQUESTS,
            &ApiError::TooManyRequests.to_string(),
            next,
        );
    }
    match state.auth.login(&form.username, &form.password) {
        Some((token, _user)) => {
            let cookie = format!(
                "{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
                SESSION_TTL.as_secs()
            );
            ([(SET_COOKIE, cookie)], Redirect::to(safe_next(next))).into_response()
        }
        None => login_error(
            &state,
            StatusCode::UNAUTHORIZED,
            "Invalid username or password",
            next,
        ),
    }
}

/// `GET /logout`
pub async fn logout(State(state): State<AppState>, current: CurrentUser) -> Response {
    state.auth.logout(&current.token);
    let cookie = format!("{SESSION_COOKIE}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
    ([(SET_COOKIE, cookie)], Redirect::to("/login")).into_response()
}

/// `GET /`
pub async fn dashboard(
    State(state): State<AppState>,
    current: Result<CurrentUser, ApiError>,
) -> Response {
    let Ok(current) = current else {
        return Redirect::to("/login?next=/").into_response();
    };
    let status = state.chamber.lock().await.system_status(Local::now());
    match state.pages.dashboard(&status, &current.user) {
        Ok(html) => Html(html).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// `GET /api/status`
pub async fn status(State(state): State<AppState>, _user: CurrentUser) -> Json<SystemStatus> {
    Json(state.chamber.lock().await.system_status(Local::now()))
}

/// `GET /api/sensors`
pub async fn sensors(State(state): State<AppState>, _user: CurrentUser) -> Json<SensorData> {
    Json(state.chamber.lock().await.sensor_data())
}

/// `GET /api/setpoints`
pub async fn get_setpoints(State(state): State<AppState>, _user: CurrentUser) -> Json<Setpoints> {
    Json(state.chamber.lock().await.setpoints().clone())
}

/// `POST /api/setpoints`
pub async fn update_setpoints(
    State(state): State<AppState>,
    AdminUser(user): AdminUser,
    payload: Result<Json<SetpointUpdate>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let update = body(payload)?;
    state.chamber.lock().await.update_setpoints(update)?;
    tracing::info!(user = %user.username, "setpoints changed");
    Ok(message("Setpoints updated"))
}

/// A bare list or `{"schedules": [...]}`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum SchedulePayload {
    List(Vec<LightSchedule>),
    Wrapped { schedules: Vec<LightSchedule> },
}

/// `POST /api/lights/schedule`
pub async fn set_light_schedule(
    State(state): State<AppState>,
    _admin: AdminUser,
    payload: Result<Json<SchedulePayload>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let schedules = match body(payload)? {
        SchedulePayload::List(schedules) | SchedulePayload::Wrapped { schedules } => schedules,
    };
    let count = schedules.len();
    state.chamber.lock().await.set_light_schedules(schedules)?;
    Ok(message(format!("{count} light schedule(s) set")))
}

#[derive(Debug, Deserialize)]
pub struct LightsRequest {
    #[serde(alias = "color")]
    pub colour: Colour,
    #[serde(default)]
    pub neopixel: f32,
    #[serde(default)]
    pub white: f32,
    #[serde(default)]
    pub uv: f32,
}

/// `POST /api/lights`
pub async fn set_lights(
    State(state): State<AppState>,
    _admin: AdminUser,
    payload: Result<Json<LightsRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let request = body(payload)?;
    state.chamber.lock().await.set_light_wavelengths(
        request.colour,
        request.neopixel,
        request.white,
        request.uv,
        Local::now(),
    )?;
    Ok(message(format!("Lights set to {} for one hour", request.colour)))
}

#[derive(Debug, Default, Deserialize)]
pub struct PhotoRequest {
    pub duration: Option<u64>,
}

/// `POST /api/photo`; an empty body uses the default duration
pub async fn photo_mode(
    State(state): State<AppState>,
    _admin: AdminUser,
    payload: Result<Json<PhotoRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(JsonRejection::MissingJsonContentType(_)) => PhotoRequest::default(),
        Err(rejection) => return Err(ApiError::BadRequest(rejection.body_text())),
    };
    let duration = request.duration.unwrap_or(state.photo_default_secs);
    state.chamber.lock().await.trigger_photo_mode(duration)?;
    Ok(message(format!("Photo mode activated for {duration} seconds")))
}

/// `GET /api/pid`
pub async fn get_pid(State(state): State<AppState>, _user: CurrentUser) -> Json<PidParameters> {
    Json(state.chamber.lock().await.pid_parameters())
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PidRequest {
    pub kp: Option<f32>,
    pub ki: Option<f32>,
    pub kd: Option<f32>,
}

/// `POST /api/pid`
pub async fn update_pid(
    State(state): State<AppState>,
    _admin: AdminUser,
    payload: Result<Json<PidRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let request = body(payload)?;
    if request.kp.is_none() && request.ki.is_none() && request.kd.is_none() {
        return Err(ApiError::BadRequest("No PID parameters provided".to_string()));
    }
    state
        .chamber
        .lock()
        .await
        .update_pid(request.kp, request.ki, request.kd)?;
    Ok(message("PID parameters updated"))
}

#[derive(Debug, Deserialize)]
pub struct StateRequest {
    pub state: Option<String>,
}

/// `POST /api/state`
pub async fn set_state(
    State(state): State<AppState>,
    AdminUser(user): AdminUser,
    payload: Result<Json<StateRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let wanted = body(payload)?
        .state
        .ok_or_else(|| ApiError::BadRequest("No state provided".to_string()))?;
    state.chamber.lock().await.set_state(&wanted)?;
    tracing::info!(user = %user.username, state = %wanted, "state changed from the API");
    Ok(message(format!("System state set to {}", wanted.trim().to_ascii_lowercase())))
}

/// `POST /api/emergency_stop`
pub async fn emergency_stop(
    State(state): State<AppState>,
    AdminUser(user): AdminUser,
) -> Json<Value> {
    tracing::warn!(user = %user.username, "emergency stop requested");
    state.chamber.lock().await.emergency_stop();
    message("Emergency stop activated")
}

/// `GET /api/errors`
pub async fn errors(State(state): State<AppState>, _user: CurrentUser) -> Json<Vec<ErrorEntry>> {
    Json(state.chamber.lock().await.errors())
}

/// `GET /api/timestamp`
pub async fn timestamp(_user: CurrentUser) -> Json<String> {
    Json(Local::now().format(TIMESTAMP_FORMAT).to_string())
}
