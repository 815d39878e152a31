use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::domain::{Cid, MessageId, UserId};
use shared::error::{ApiError, ChatError};
use shared::events::ChatEvent;
use shared::models::{ChannelData, Member, Message, Reaction, Read};
use tracing::debug;

/// Outbound request middleware, applied in order: auth token injection, api
/// key, logging. Each interceptor returns a possibly-modified request.
pub trait RequestInterceptor: Send + Sync {
    fn intercept(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder;
}

pub struct ApiKeyInterceptor {
    pub api_key: String,
}

impl RequestInterceptor for ApiKeyInterceptor {
    fn intercept(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.query(&[("api_key", self.api_key.as_str())])
    }
}

pub struct AuthTokenInterceptor {
    pub token: String,
}

impl RequestInterceptor for AuthTokenInterceptor {
    fn intercept(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.header("Authorization", format!("Bearer {}", self.token))
    }
}

/// Server-authoritative channel snapshot returned by a channel query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelPage {
    pub channel: ChannelData,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub reads: Vec<Read>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryChannelsRequest {
    pub filter: serde_json::Value,
    #[serde(default)]
    pub limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryChannelsResponse {
    #[serde(default)]
    pub channels: Vec<ChannelPage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Serialize)]
struct SyncEventsRequest<'a> {
    cids: &'a [Cid],
    since: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct SyncEventsResponse {
    #[serde(default)]
    events: Vec<ChatEvent>,
}

/// REST surface used by feature code and by the sync manager's
/// reconciliation calls; always invoked through the retry service.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn send_message(&self, message: &Message) -> Result<Message, ChatError>;
    async fn delete_message(&self, id: &MessageId) -> Result<Message, ChatError>;
    async fn send_reaction(&self, reaction: &Reaction) -> Result<Reaction, ChatError>;
    async fn delete_reaction(
        &self,
        message_id: &MessageId,
        kind: &str,
        user_id: &UserId,
    ) -> Result<(), ChatError>;
    async fn query_channel(&self, cid: &Cid) -> Result<ChannelPage, ChatError>;
    async fn query_channels(
        &self,
        request: &QueryChannelsRequest,
    ) -> Result<QueryChannelsResponse, ChatError>;
    async fn sync_events(
        &self,
        cids: &[Cid],
        since: DateTime<Utc>,
    ) -> Result<Vec<ChatEvent>, ChatError>;
    async fn mark_read(&self, cid: &Cid, user_id: &UserId) -> Result<(), ChatError>;
}

/// Production implementation over reqwest.
pub struct HttpChatApi {
    http: reqwest::Client,
    base_url: String,
    interceptors: Vec<Arc<dyn RequestInterceptor>>,
}

impl HttpChatApi {
    pub fn new(base_url: impl Into<String>, interceptors: Vec<Arc<dyn RequestInterceptor>>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            interceptors,
        }
    }

    fn apply_interceptors(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        self.interceptors
            .iter()
            .fold(request, |request, interceptor| {
                interceptor.intercept(request)
            })
    }

    /// Execute a request, translating every failure into the structured
    /// error taxonomy at this boundary.
    async fn execute<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ChatError> {
        let body = self.execute_raw(request).await?;
        serde_json::from_slice(&body)
            .map_err(|err| ChatError::parse(format!("invalid response body: {err}")))
    }

    /// Like `execute`, for endpoints whose success body carries nothing.
    async fn execute_unit(&self, request: reqwest::RequestBuilder) -> Result<(), ChatError> {
        self.execute_raw(request).await.map(|_| ())
    }

    async fn execute_raw(&self, request: reqwest::RequestBuilder) -> Result<Vec<u8>, ChatError> {
        let request = self.apply_interceptors(request);
        let response = request
            .send()
            .await
            .map_err(|err| ChatError::network(err.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| ChatError::network(err.to_string()))?;
        if status.is_success() {
            return Ok(body.to_vec());
        }
        if body.is_empty() {
            debug!(status = status.as_u16(), "api: error response without body");
            return Err(ChatError::NoErrorBody);
        }
        match serde_json::from_slice::<ApiError>(&body) {
            Ok(api_error) => Err(ChatError::Server(api_error)),
            Err(_) => Err(ChatError::NoErrorBody),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn send_message(&self, message: &Message) -> Result<Message, ChatError> {
        self.execute(self.http.post(self.url("/messages")).json(message))
            .await
    }

    async fn delete_message(&self, id: &MessageId) -> Result<Message, ChatError> {
        self.execute(self.http.delete(self.url(&format!("/messages/{id}"))))
            .await
    }

    async fn send_reaction(&self, reaction: &Reaction) -> Result<Reaction, ChatError> {
        self.execute(
            self.http
                .post(self.url(&format!("/messages/{}/reactions", reaction.message_id)))
                .json(reaction),
        )
        .await
    }

    async fn delete_reaction(
        &self,
        message_id: &MessageId,
        kind: &str,
        user_id: &UserId,
    ) -> Result<(), ChatError> {
        self.execute_unit(
            self.http
                .delete(self.url(&format!("/messages/{message_id}/reactions/{kind}")))
                .query(&[("user_id", user_id.as_str())]),
        )
        .await
    }

    async fn query_channel(&self, cid: &Cid) -> Result<ChannelPage, ChatError> {
        self.execute(self.http.get(self.url(&format!(
            "/channels/{}/{}/state",
            cid.channel_type, cid.channel_id
        ))))
        .await
    }

    async fn query_channels(
        &self,
        request: &QueryChannelsRequest,
    ) -> Result<QueryChannelsResponse, ChatError> {
        self.execute(self.http.post(self.url("/channels/query")).json(request))
            .await
    }

    async fn sync_events(
        &self,
        cids: &[Cid],
        since: DateTime<Utc>,
    ) -> Result<Vec<ChatEvent>, ChatError> {
        let response: SyncEventsResponse = self
            .execute(
                self.http
                    .post(self.url("/sync"))
                    .json(&SyncEventsRequest { cids, since }),
            )
            .await?;
        Ok(response.events)
    }

    async fn mark_read(&self, cid: &Cid, user_id: &UserId) -> Result<(), ChatError> {
        self.execute_unit(
            self.http
                .post(self.url(&format!(
                    "/channels/{}/{}/read",
                    cid.channel_type, cid.channel_id
                )))
                .json(&serde_json::json!({ "user_id": user_id })),
        )
        .await
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
