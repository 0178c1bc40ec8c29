//! Users, sessions and login rate limiting.
//!
//! Two fixed accounts come from the environment: a viewer that can read the
//! dashboard and an admin that can change the chamber. Passwords are kept as
//! salted SHA-256 digests. Sessions are random tokens held in memory.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, FromRef, FromRequestParts};
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::request::Parts;
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::Credentials;
use crate::server::ApiError;

pub const SESSION_COOKIE: &str = "chamber_session";
pub const SESSION_TTL: Duration = Duration::from_secs(12 * 60 * 60);
pub const LOGIN_ATTEMPTS_PER_WINDOW: u32 = 5;
pub const LOGIN_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: u32,
    pub username: String,
    pub is_admin: bool,
}

struct Account {
    user: User,
    salt: [u8; 16],
    digest: [u8; 32],
}

fn hash_password(salt: &[u8], password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

/// Compares without stopping at the first differing byte
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// The fixed viewer and admin accounts
pub struct UserStore {
    accounts: Vec<Account>,
}

impl UserStore {
    /// Accounts with an empty name or password are skipped
    pub fn from_credentials(credentials: &Credentials) -> Self {
        let mut store = Self {
            accounts: Vec::new(),
        };
        store.add(
            1,
            credentials.viewer_user.as_deref(),
            credentials.viewer_pass.as_deref(),
            false,
        );
        store.add(
            2,
            credentials.admin_user.as_deref(),
            credentials.admin_pass.as_deref(),
            true,
        );
        if store.accounts.is_empty() {
            tracing::warn!("no dashboard users configured; set VIEWER_USER/VIEWER_PASS and ADMIN_USER/ADMIN_PASS");
        }
        store
    }

    fn add(&mut self, id: u32, username: Option<&str>, password: Option<&str>, is_admin: bool) {
        let (Some(username), Some(password)) = (username, password) else {
            return;
        };
        if username.is_empty() || password.is_empty() {
            return;
        }
        let mut salt = [0u8; 16];
        rand::thread_rng().fill(&mut salt[..]);
        self.accounts.push(Account {
            user: User {
                id,
                username: username.to_string(),
                is_admin,
            },
            salt,
            digest: hash_password(&salt, password),
        });
    }

    pub fn verify(&self, username: &str, password: &str) -> Option<User> {
        self.accounts
            .iter()
            .find(|a| a.user.username == username)
            .filter(|a| constant_time_eq(&hash_password(&a.salt, password), &a.digest))
            .map(|a| a.user.clone())
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

struct Session {
    user: User,
    expires: Instant,
}

/// Fixed-window attempt counter per client
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    clients: Mutex<HashMap<String, (Instant, u32)>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Counts an attempt; false once the client is over the limit
    pub fn check(&self, client: &str) -> bool {
        self.check_at(client, Instant::now())
    }

    fn check_at(&self, client: &str, now: Instant) -> bool {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        clients.retain(|_, (start, _)| now.duration_since(*start) < self.window);
        let (_, count) = clients.entry(client.to_string()).or_insert((now, 0));
        *count += 1;
        *count <= self.limit
    }
}

/// Accounts, live sessions and the login limiter
pub struct Auth {
    users: UserStore,
    sessions: Mutex<HashMap<String, Session>>,
    ttl: Duration,
    limiter: RateLimiter,
}

impl Auth {
    pub fn new(credentials: &Credentials) -> Self {
        Self {
            users: UserStore::from_credentials(credentials),
            sessions: Mutex::new(HashMap::new()),
            ttl: SESSION_TTL,
            limiter: RateLimiter::new(LOGIN_ATTEMPTS_PER_WINDOW, LOGIN_WINDOW),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn users(&self) -> &UserStore {
        &self.users
    }

    /// Checks the rate limit for a client address
    pub fn allow_login_attempt(&self, client: &str) -> bool {
        self.limiter.check(client)
    }

    /// Starts a session
    /// returns the token and the user, or None for bad credentials
    pub fn login(&self, username: &str, password: &str) -> Option<(String, User)> {
        let Some(user) = self.users.verify(username, password) else {
            tracing::warn!(username, "failed login");
            return None;
        };
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill(&mut bytes[..]);
        let token = hex::encode(bytes);
        let now = Instant::now();
        let mut sessions = self.sessions();
        sessions.retain(|_, s| s.expires > now);
        sessions.insert(
            token.clone(),
            Session {
                user: user.clone(),
                expires: now + self.ttl,
            },
        );
        tracing::info!(username, admin = user.is_admin, "user logged in");
        Some((token, user))
    }

    pub fn logout(&self, token: &str) {
        if let Some(session) = self.sessions().remove(token) {
            tracing::info!(username = %session.user.username, "user logged out");
        }
    }

    /// Looks up a live session
    pub fn authenticate(&self, token: &str) -> Option<User> {
        let mut sessions = self.sessions();
        match sessions.get(token) {
            Some(session) if session.expires > Instant::now() => Some(session.user.clone()),
            Some(_) => {
                sessions.remove(token);
                None
            }
            None => None,
        }
    }
}

fn cookie_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|header| header.split(';'))
        .filter_map(|cookie| cookie.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value)
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Candidate session tokens, the cookie first and then `Authorization: Bearer`
pub fn session_tokens(parts: &Parts) -> impl Iterator<Item = &str> {
    cookie_token(parts).into_iter().chain(bearer_token(parts))
}

/// Any logged-in user
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user: User,
    pub token: String,
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
    Arc<Auth>: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth = Arc::<Auth>::from_ref(state);
        // A stale cookie must not hide a valid bearer token
        session_tokens(parts)
            .find_map(|token| {
                auth.authenticate(token).map(|user| CurrentUser {
                    user,
                    token: token.to_string(),
                })
            })
            .ok_or(ApiError::Unauthorized)
    }
}

/// A logged-in admin
#[derive(Debug, Clone)]
pub struct AdminUser(pub User);

impl<S> FromRequestParts<S> for AdminUser
where
    S: Send + Sync,
    Arc<Auth>: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let current = CurrentUser::from_request_parts(parts, state).await?;
        if !current.user.is_admin {
            return Err(ApiError::Forbidden("Admin access required".to_string()));
        }
        Ok(AdminUser(current.user))
    }
}

/// Client address used as the rate limit key
#[derive(Debug, Clone)]
pub struct ClientAddr(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ClientAddr {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Ok(ClientAddr(addr))
    }
}
