use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use shared::{
    domain::{UserId, UserProfile},
    error::ApiErrorBody,
    protocol::{ApiEnvelope, InboxItem, SendMessageBody, WireMessage},
};
use tracing::debug;
use url::Url;

use crate::{
    error::{SyncError, SyncResult},
    session_store::AccessToken,
};

#[async_trait]
pub trait BackendApi: Send + Sync {
    async fn fetch_messages(
        &self,
        peer: &UserId,
        limit: usize,
        skip: usize,
    ) -> SyncResult<Vec<WireMessage>>;
    async fn send_message(&self, peer: &UserId, body: &str) -> SyncResult<WireMessage>;
    async fn mark_read(&self, peer: &UserId) -> SyncResult<()>;
    async fn fetch_inbox(&self) -> SyncResult<Vec<InboxItem>>;
    async fn fetch_friends(&self) -> SyncResult<Vec<UserProfile>>;
    async fn fetch_user(&self, id: &UserId) -> SyncResult<UserProfile>;
    async fn add_friend(&self, id: &UserId) -> SyncResult<()>;
    async fn remove_friend(&self, id: &UserId) -> SyncResult<()>;
    /// Invalidates the credential server-side.
    async fn logout(&self) -> SyncResult<()>;
}

pub struct HttpBackend {
    http: Client,
    base_url: Url,
    token: AccessToken,
}

impl HttpBackend {
    pub fn new(base_url: &str, token: AccessToken) -> SyncResult<Self> {
        Self::with_client(Client::new(), base_url, token)
    }

    pub fn with_client(http: Client, base_url: &str, token: AccessToken) -> SyncResult<Self> {
        let parsed = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|err| SyncError::InvalidInput(format!("api base url '{base_url}': {err}")))?;
        if parsed.cannot_be_a_base() {
            return Err(SyncError::InvalidInput(format!(
                "api base url '{base_url}' cannot carry paths"
            )));
        }
        Ok(Self {
            http,
            base_url: parsed,
            token,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        self.http
            .request(method, self.endpoint(segments))
            .bearer_auth(self.token.expose())
    }

    async fn execute(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> SyncResult<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|err| SyncError::network(operation, err))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.json::<ApiErrorBody>().await.unwrap_or_default();
        let reason = match body.message {
            Some(message) => format!("HTTP {status}: {message}"),
            None => format!("HTTP {status}"),
        };
        Err(SyncError::network(operation, reason))
    }

    async fn envelope<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> SyncResult<ApiEnvelope<T>> {
        self.execute(operation, request)
            .await?
            .json()
            .await
            .map_err(|err| SyncError::network(operation, format!("invalid response body: {err}")))
    }

    async fn data<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> SyncResult<T> {
        self.envelope(operation, request)
            .await?
            .data
            .ok_or_else(|| SyncError::network(operation, "response is missing data"))
    }

    async fn post_empty(&self, operation: &'static str, segments: &[&str]) -> SyncResult<()> {
        let request = self
            .request(Method::POST, segments)
            .json(&serde_json::json!({}));
        self.execute(operation, request).await?;
        Ok(())
    }

    /// List endpoints answer without `data` when there is nothing to list.
    async fn list<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> SyncResult<Vec<T>> {
        Ok(self
            .envelope::<Vec<T>>(operation, request)
            .await?
            .data
            .unwrap_or_default())
    }
}

#[async_trait]
impl BackendApi for HttpBackend {
    async fn fetch_messages(
        &self,
        peer: &UserId,
        limit: usize,
        skip: usize,
    ) -> SyncResult<Vec<WireMessage>> {
        debug!(peer = %peer, limit, skip, "rest: fetching message page");
        let request = self
            .request(Method::GET, &["message", "chat", peer.as_str()])
            .query(&[("limit", limit), ("skip", skip)]);
        self.list("fetch messages", request).await
    }

    async fn send_message(&self, peer: &UserId, body: &str) -> SyncResult<WireMessage> {
        let request = self
            .request(Method::POST, &["message", "send", peer.as_str()])
            .json(&SendMessageBody {
                message: body.to_string(),
            });
        self.data("send message", request).await
    }

    async fn mark_read(&self, peer: &UserId) -> SyncResult<()> {
        let request = self
            .request(Method::PATCH, &["message", "chat", peer.as_str(), "read"])
            .json(&serde_json::json!({}));
        self.execute("mark conversation read", request).await?;
        Ok(())
    }

    async fn fetch_inbox(&self) -> SyncResult<Vec<InboxItem>> {
        self.list("fetch inbox", self.request(Method::GET, &["message", "inbox"]))
            .await
    }

    async fn fetch_friends(&self) -> SyncResult<Vec<UserProfile>> {
        self.list("fetch friends", self.request(Method::GET, &["users", "friends"]))
            .await
    }

    async fn fetch_user(&self, id: &UserId) -> SyncResult<UserProfile> {
        self.data(
            "fetch user details",
            self.request(Method::GET, &["users", "getuserdetails", id.as_str()]),
        )
        .await
    }

    async fn add_friend(&self, id: &UserId) -> SyncResult<()> {
        self.post_empty("add friend", &["users", "friends", "add", id.as_str()])
            .await
    }

    async fn remove_friend(&self, id: &UserId) -> SyncResult<()> {
        self.post_empty("remove friend", &["users", "friends", "remove", id.as_str()])
            .await
    }

    async fn logout(&self) -> SyncResult<()> {
        self.post_empty("logout", &["users", "logout"]).await
    }
}

#[cfg(test)]
#[path = "tests/backend_tests.rs"]
mod tests;
