//! Typed client for the off-chain message/user backend.
//!
//! Wire records are deserialized loosely and validated into model types at
//! this boundary: an item with a malformed address or timestamp is logged
//! and skipped, never passed through.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::ProfileSource;
use crate::model::{Address, DirectMessage, ProfileInfo};
use crate::transport::{ApiRequest, AuthTransport};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Server returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    /// Session missing or rejected after the refresh attempt
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// A message in a dispute thread as stored off-chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadMessage {
    pub dispute_id: u64,
    pub sender: Address,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Wire DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireUser {
    #[serde(default)]
    address: Option<String>,
    #[serde(default, alias = "username", alias = "name")]
    display_name: Option<String>,
    #[serde(default)]
    bio: Option<String>,
    #[serde(default)]
    skills: Vec<String>,
    #[serde(default)]
    avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDirectMessage {
    #[serde(default, alias = "_id")]
    id: Option<Value>,
    sender: String,
    receiver: String,
    content: String,
    #[serde(alias = "timestamp")]
    created_at: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireThreadMessage {
    #[serde(default)]
    dispute_id: Option<Value>,
    sender: String,
    content: String,
    #[serde(alias = "timestamp")]
    created_at: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListEnvelope {
    Bare(Vec<Value>),
    Messages { messages: Vec<Value> },
    Data { data: Vec<Value> },
}

impl ListEnvelope {
    fn into_items(self) -> Vec<Value> {
        match self {
            ListEnvelope::Bare(items)
            | ListEnvelope::Messages { messages: items }
            | ListEnvelope::Data { data: items } => items,
        }
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ApiError::InvalidResponse(format!("bad timestamp {raw:?}: {e}")))
}

fn parse_address(raw: &str) -> Result<Address, ApiError> {
    raw.parse()
        .map_err(|e| ApiError::InvalidResponse(format!("bad address {raw:?}: {e}")))
}

/// Ids come back as strings or numbers depending on the store.
fn id_string(id: Value) -> Option<String> {
    match id {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl TryFrom<WireDirectMessage> for DirectMessage {
    type Error = ApiError;

    fn try_from(wire: WireDirectMessage) -> Result<Self, Self::Error> {
        Ok(DirectMessage {
            id: wire.id.and_then(id_string),
            sender: parse_address(&wire.sender)?,
            receiver: parse_address(&wire.receiver)?,
            content: wire.content,
            created_at: parse_time(&wire.created_at)?,
        })
    }
}

impl WireThreadMessage {
    fn validate(self, dispute_id: u64) -> Result<ThreadMessage, ApiError> {
        Ok(ThreadMessage {
            dispute_id: self
                .dispute_id
                .and_then(id_string)
                .and_then(|id| id.parse().ok())
                .unwrap_or(dispute_id),
            sender: parse_address(&self.sender)?,
            content: self.content,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

/// Parse each list item independently, skipping the ones that fail.
fn validated_items<W, T>(
    endpoint: &str,
    items: Vec<Value>,
    mut validate: impl FnMut(W) -> Result<T, ApiError>,
) -> Vec<T>
where
    W: DeserializeOwned,
{
    items
        .into_iter()
        .filter_map(|item| {
            let result = serde_json::from_value::<W>(item)
                .map_err(ApiError::from)
                .and_then(&mut validate);
            match result {
                Ok(valid) => Some(valid),
                Err(e) => {
                    warn!(endpoint = endpoint, error = %e, "Skipping malformed item");
                    None
                }
            }
        })
        .collect()
}

// ============================================================================
// Client
// ============================================================================

pub struct MarketApi {
    transport: Arc<AuthTransport>,
}

impl MarketApi {
    pub fn new(transport: Arc<AuthTransport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<AuthTransport> {
        &self.transport
    }

    /// `HEAD /users/{address}`
    pub async fn user_exists(&self, address: &Address) -> Result<bool, ApiError> {
        let response = self
            .transport
            .send(&ApiRequest::head(format!("/users/{address}")))
            .await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(error_for(response).await),
        }
    }

    /// `GET /users/{address}`
    pub async fn user(&self, address: &Address) -> Result<ProfileInfo, ApiError> {
        let wire: WireUser = self.get_json(ApiRequest::get(format!("/users/{address}"))).await?;

        if let Some(raw) = wire.address.as_deref() {
            if parse_address(raw)? != *address {
                return Err(ApiError::InvalidResponse(format!(
                    "profile for {raw} returned for {address}"
                )));
            }
        }

        Ok(ProfileInfo {
            address: *address,
            display_name: wire.display_name.unwrap_or_default(),
            bio: wire.bio,
            skills: wire.skills,
            avatar_url: wire.avatar_url,
        })
    }

    /// `GET /messages/{disputeId}`, oldest first.
    pub async fn dispute_messages(&self, dispute_id: u64) -> Result<Vec<ThreadMessage>, ApiError> {
        let endpoint = "/messages";
        let envelope: ListEnvelope = self
            .get_json(ApiRequest::get(format!("{endpoint}/{dispute_id}")))
            .await?;
        let mut messages = validated_items(endpoint, envelope.into_items(), |w: WireThreadMessage| {
            w.validate(dispute_id)
        });
        messages.sort_by_key(|m| m.created_at);
        debug!(dispute_id = dispute_id, count = messages.len(), "Fetched dispute thread");
        Ok(messages)
    }

    /// `POST /messages {disputeId, content}`
    pub async fn post_dispute_message(
        &self,
        dispute_id: u64,
        content: &str,
    ) -> Result<ThreadMessage, ApiError> {
        let request = ApiRequest::post(
            "/messages",
            json!({ "disputeId": dispute_id, "content": content }),
        );
        let wire: WireThreadMessage = self.get_json(request).await?;
        wire.validate(dispute_id)
    }

    /// `GET /chat/messages/{peer}?page&limit`
    pub async fn chat_messages(
        &self,
        peer: &Address,
        page: u32,
        limit: u32,
    ) -> Result<Vec<DirectMessage>, ApiError> {
        let endpoint = "/chat/messages";
        let request = ApiRequest::get(format!("{endpoint}/{peer}"))
            .with_query("page", page)
            .with_query("limit", limit);
        let envelope: ListEnvelope = self.get_json(request).await?;
        Ok(validated_items(endpoint, envelope.into_items(), |w: WireDirectMessage| {
            DirectMessage::try_from(w)
        }))
    }

    /// `POST /chat/messages {to, content}`
    pub async fn send_chat_message(
        &self,
        to: &Address,
        content: &str,
    ) -> Result<DirectMessage, ApiError> {
        let request = ApiRequest::post(
            "/chat/messages",
            json!({ "to": to.to_string(), "content": content }),
        );
        let wire: WireDirectMessage = self.get_json(request).await?;
        wire.try_into()
    }

    /// `GET /chat/conversations`: the flat feed of every message involving
    /// the session's user.
    pub async fn conversations(&self) -> Result<Vec<DirectMessage>, ApiError> {
        let endpoint = "/chat/conversations";
        let envelope: ListEnvelope = self.get_json(ApiRequest::get(endpoint)).await?;
        Ok(validated_items(endpoint, envelope.into_items(), |w: WireDirectMessage| {
            DirectMessage::try_from(w)
        }))
    }

    async fn get_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        let response = self.transport.send(&request).await?;
        if !response.status().is_success() {
            return Err(error_for(response).await);
        }
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

async fn error_for(response: Response) -> ApiError {
    let status = response.status();
    let path = response.url().path().to_string();
    match status {
        StatusCode::UNAUTHORIZED => ApiError::Unauthorized,
        StatusCode::NOT_FOUND => ApiError::NotFound(path),
        _ => ApiError::Server {
            status: status.as_u16(),
            message: response.text().await.unwrap_or_default(),
        },
    }
}

#[async_trait]
impl ProfileSource for MarketApi {
    async fn exists(&self, address: &Address) -> Result<bool, ApiError> {
        self.user_exists(address).await
    }

    async fn fetch(&self, address: &Address) -> Result<ProfileInfo, ApiError> {
        self.user(address).await
    }
}
