//! REST client for the communications API.
//!
//! [`ChatApi`] is the seam the session driver calls through;
//! [`HttpChatApi`] is the reqwest-backed implementation used in production.

use std::future::Future;
use std::time::Duration;

use serde::de::DeserializeOwned;
use url::Url;

use mentorchat_proto::api::{
    CHATS_PATH, ChatListResponse, MessagesResponse, SendRequest, SendResponse, messages_path,
    send_path,
};
use mentorchat_proto::message::{ConversationSummary, Message, UserId};

/// Default timeout for one REST request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Errors from REST calls.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request could not be sent or the response not read.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-2xx status.
    #[error("unexpected status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    /// The response body was not the expected JSON.
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),

    /// The server answered `success: false`.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// A request URL could not be built.
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

/// The three REST endpoints the client uses.
pub trait ChatApi: Send + Sync + 'static {
    /// `GET /api/communications/chats/?user_id={me}&q={query}`.
    fn list_chats(
        &self,
        me: &UserId,
        query: Option<&str>,
    ) -> impl Future<Output = Result<Vec<ConversationSummary>, ApiError>> + Send;

    /// `GET /api/communications/chats/{peer}/messages/?me={me}`.
    ///
    /// The server marks the returned messages as read as a side effect.
    fn fetch_messages(
        &self,
        peer: &UserId,
        me: &UserId,
    ) -> impl Future<Output = Result<Vec<Message>, ApiError>> + Send;

    /// `POST /api/communications/chats/{peer}/send/`, returning the
    /// persisted message.
    fn send_message(
        &self,
        peer: &UserId,
        me: &UserId,
        text: &str,
    ) -> impl Future<Output = Result<Message, ApiError>> + Send;
}

/// [`ChatApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpChatApi {
    /// Creates a client for the backend at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Http`] if the HTTP client cannot be built.
    pub fn new(base_url: Url, request_timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str, params: &[(&str, &str)]) -> Result<Url, ApiError> {
        let mut url = join_under(&self.base_url, path)?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in params {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }
}

/// Resolve `path` below `base`, keeping any path prefix the base carries.
///
/// `http://host/app` and `http://host/app/` both put `/api/x/` at
/// `http://host/app/api/x/`. The base's query and fragment are dropped.
pub(crate) fn join_under(base: &Url, path: &str) -> Result<Url, url::ParseError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let prefixed = format!("{}/", base.path());
        base.set_path(&prefixed);
    }
    base.join(path.trim_start_matches('/'))
}

impl ChatApi for HttpChatApi {
    async fn list_chats(
        &self,
        me: &UserId,
        query: Option<&str>,
    ) -> Result<Vec<ConversationSummary>, ApiError> {
        let url = self.endpoint(
            CHATS_PATH,
            &[("user_id", me.as_str()), ("q", query.unwrap_or_default())],
        )?;
        tracing::debug!(url = %url, "listing chats");
        let body: ChatListResponse = read_json(self.client.get(url).send().await?).await?;
        if !body.success {
            return Err(rejected(body.error));
        }
        Ok(body.users)
    }

    async fn fetch_messages(&self, peer: &UserId, me: &UserId) -> Result<Vec<Message>, ApiError> {
        let url = self.endpoint(&messages_path(peer), &[("me", me.as_str())])?;
        tracing::debug!(url = %url, "fetching history");
        let body: MessagesResponse = read_json(self.client.get(url).send().await?).await?;
        if !body.success {
            return Err(rejected(body.error));
        }
        Ok(body.messages)
    }

    async fn send_message(
        &self,
        peer: &UserId,
        me: &UserId,
        text: &str,
    ) -> Result<Message, ApiError> {
        let url = self.endpoint(&send_path(peer), &[])?;
        let request = SendRequest {
            me: me.clone(),
            text: text.to_string(),
        };
        tracing::debug!(url = %url, "sending message");
        let body: SendResponse =
            read_json(self.client.post(url).json(&request).send().await?).await?;
        match body {
            SendResponse {
                success: true,
                data: Some(message),
                ..
            } => Ok(message),
            SendResponse {
                success: true,
                data: None,
                ..
            } => Err(ApiError::Rejected("response carried no message".into())),
            SendResponse { error, .. } => Err(rejected(error)),
        }
    }
}

/// Check the status and decode a JSON body.
async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        tracing::warn!(status = %status, "REST request failed");
        return Err(ApiError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(serde_json::from_str(&body)?)
}

fn rejected(error: Option<String>) -> ApiError {
    ApiError::Rejected(error.unwrap_or_else(|| "unspecified error".into()))
}
