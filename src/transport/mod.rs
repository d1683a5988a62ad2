//! Authenticated transport for the message/user backend.
//!
//! Every request carries `Authorization: Bearer <accessToken>` when a session
//! exists. A 401 triggers at most one refresh (`POST /auth/refresh`) and at
//! most one retry of the original request. Concurrent 401s share a single
//! refresh: the first caller refreshes under `refresh_lock`, later callers
//! see the rotated token and retry with it.
//!
//! A rejected or impossible refresh clears the session and emits
//! [`SessionEvent::ForcedLogout`].

pub mod store;

use reqwest::{Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::api::ApiError;

pub use store::{FileTokenStore, MemoryTokenStore, SessionTokens, TokenStore};

pub const REFRESH_PATH: &str = "/auth/refresh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Access token was rotated
    Refreshed,
    /// Session was invalidated and cleared
    ForcedLogout,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub base_url: String,
    pub request_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// A request that can be replayed after a token refresh.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn head(path: impl Into<String>) -> Self {
        Self::new(Method::HEAD, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn with_query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

pub struct AuthTransport {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenStore>,
    refresh_lock: Mutex<()>,
    events: broadcast::Sender<SessionEvent>,
}

impl AuthTransport {
    pub fn new(config: TransportConfig, tokens: Arc<dyn TokenStore>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("jobmarket-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        let (events, _) = broadcast::channel(16);

        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            tokens,
            refresh_lock: Mutex::new(()),
            events,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn tokens(&self) -> &Arc<dyn TokenStore> {
        &self.tokens
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Send `request`, refreshing the session once on 401.
    ///
    /// Non-2xx responses are returned as-is; only I/O failures are errors.
    pub async fn send(&self, request: &ApiRequest) -> Result<Response, ApiError> {
        let token = self.tokens.load().access_token;
        let response = self.dispatch(request, token.as_deref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!(path = %request.path, "Request unauthorized, attempting session refresh");
        match self.refresh_after_unauthorized(token).await {
            Some(fresh) => self.dispatch(request, Some(&fresh)).await,
            None => Ok(response),
        }
    }

    async fn dispatch(
        &self,
        request: &ApiRequest,
        token: Option<&str>,
    ) -> Result<Response, ApiError> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self.client.request(request.method.clone(), &url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        Ok(builder.send().await?)
    }

    /// Token to retry with, or `None` when the session is gone.
    async fn refresh_after_unauthorized(&self, stale: Option<String>) -> Option<String> {
        let _refresh = self.refresh_lock.lock().await;

        let current = self.tokens.load();
        if current.access_token.is_some() && current.access_token != stale {
            debug!("Session already refreshed by a concurrent request");
            return current.access_token;
        }
        if stale.is_some() && current.is_empty() {
            // A concurrent request already logged the session out.
            return None;
        }

        let Some(refresh_token) = current.refresh_token else {
            if stale.is_some() {
                self.force_logout("no refresh token");
            }
            return None;
        };

        match self.refresh(&refresh_token).await {
            Ok(rotated) => {
                match rotated.refresh_token {
                    Some(next) => self.tokens.save(&SessionTokens::new(
                        rotated.access_token.clone(),
                        next,
                    )),
                    None => self.tokens.set_access_token(&rotated.access_token),
                }
                info!("Session refreshed");
                let _ = self.events.send(SessionEvent::Refreshed);
                Some(rotated.access_token)
            }
            Err(e) => {
                self.force_logout(&e.to_string());
                None
            }
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse, ApiError> {
        let url = format!("{}{}", self.base_url, REFRESH_PATH);
        let response = self
            .client
            .post(&url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ApiError::Server {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }

    fn force_logout(&self, reason: &str) {
        warn!(reason = %reason, "Session invalidated, forcing logout");
        self.tokens.clear();
        let _ = self.events.send(SessionEvent::ForcedLogout);
    }
}
