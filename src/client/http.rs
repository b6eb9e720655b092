//! Treehole JSON API client over reqwest.

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use super::{
    ApiClient, CommentPage, FollowedPage, PageCursor, PostBody, RawComment, RemoteImage,
};
use crate::config::ApiConfig;
use crate::error::{Error, FetchError, Result};
use crate::types::{CommentId, PostId, PostKind, QuoteRef};

/// Server messages that mean the session needs (re-)authentication
const AUTH_MESSAGE_HINTS: &[&str] = &["登录", "验证", "token", "login", "unauthorized"];

/// Production [`ApiClient`] for the treehole web API
#[derive(Clone, Debug)]
pub struct HttpApiClient {
    http: reqwest::Client,
    base_url: Url,
    comment_page_size: u32,
    followed_page_size: u32,
}

impl HttpApiClient {
    /// Build a client from the API configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL or token is invalid or the HTTP client
    /// cannot be created.
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let mut base_url = Url::parse(&config.base_url)
            .map_err(|e| Error::config("api.base_url", format!("invalid base URL: {e}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let mut headers = HeaderMap::new();
        if let Some(token) = &config.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| Error::config("api.token", format!("invalid token: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http,
            base_url,
            comment_page_size: config.comment_page_size,
            followed_page_size: config.followed_page_size,
        })
    }

    fn endpoint(&self, path: &str) -> std::result::Result<Url, FetchError> {
        self.base_url
            .join(path)
            .map_err(|e| FetchError::Permanent(format!("invalid endpoint '{path}': {e}")))
    }

    async fn get_envelope<T: DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, String)],
        post: Option<PostId>,
    ) -> std::result::Result<Envelope<T>, FetchError> {
        let response = self
            .http
            .get(url.clone())
            .query(query)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, url.as_str(), post));
        }

        let body = response.bytes().await.map_err(classify_transport)?;
        serde_json::from_slice(&body)
            .map_err(|e| FetchError::Malformed(format!("{url}: {e}")))
    }
}

#[async_trait::async_trait]
impl ApiClient for HttpApiClient {
    async fn fetch_post(&self, id: PostId) -> std::result::Result<PostBody, FetchError> {
        let url = self.endpoint(&format!("api/pku/{id}"))?;
        let envelope: Envelope<WirePost> = self.get_envelope(url, &[], Some(id)).await?;

        if !envelope.success {
            if is_auth_message(&envelope.message) {
                return Err(FetchError::Auth(envelope.message));
            }
            return Err(FetchError::NotFound(id));
        }
        let data = envelope
            .data
            .ok_or_else(|| FetchError::Malformed(format!("post {id}: missing data")))?;

        let image = if data.kind == PostKind::Image && !data.url.is_empty() {
            Some(RemoteImage {
                url: self.endpoint(&format!("api/pku_image/{id}"))?.to_string(),
                file_name: Some(data.url.clone()),
            })
        } else {
            None
        };

        Ok(PostBody {
            id,
            text: data.text,
            timestamp: data.timestamp,
            kind: data.kind,
            image,
        })
    }

    async fn fetch_comments(
        &self,
        id: PostId,
        cursor: Option<PageCursor>,
    ) -> std::result::Result<CommentPage, FetchError> {
        let page = cursor.unwrap_or(1);
        let url = self.endpoint(&format!("api/pku_comment_v3/{id}"))?;
        let query = [
            ("page", page.to_string()),
            ("limit", self.comment_page_size.to_string()),
            ("sort", "asc".to_string()),
        ];
        let envelope: Envelope<WirePage<WireComment>> = self.get_envelope(url, &query, None).await?;

        if !envelope.success {
            if is_auth_message(&envelope.message) {
                return Err(FetchError::Auth(envelope.message));
            }
            return Err(FetchError::Permanent(format!(
                "comments of post {id}: {}",
                envelope.message
            )));
        }

        // A thread without comments comes back with `data: null`
        let Some(wire) = envelope.data else {
            return Ok(CommentPage::default());
        };

        let next_cursor = wire.next_page(page);
        let comments = wire
            .data
            .into_iter()
            .map(|c| RawComment {
                id: CommentId(c.cid),
                text: c.text,
                timestamp: c.timestamp,
                author: c.name,
                quote: c.quote.and_then(|q| {
                    q.pid.map(|pid| QuoteRef {
                        post_id: PostId(pid),
                        comment_id: q.cid.map(CommentId),
                    })
                }),
            })
            .collect();

        Ok(CommentPage {
            comments,
            next_cursor,
        })
    }

    async fn fetch_followed_list(
        &self,
        cursor: Option<PageCursor>,
    ) -> std::result::Result<FollowedPage, FetchError> {
        let page = cursor.unwrap_or(1);
        let url = self.endpoint("api/follow_v2")?;
        let query = [
            ("page", page.to_string()),
            ("limit", self.followed_page_size.to_string()),
        ];
        let envelope: Envelope<WirePage<WireFollowed>> = self.get_envelope(url, &query, None).await?;

        if !envelope.success {
            if is_auth_message(&envelope.message) {
                return Err(FetchError::Auth(envelope.message));
            }
            return Err(FetchError::Permanent(format!(
                "followed list: {}",
                envelope.message
            )));
        }

        let Some(wire) = envelope.data else {
            return Ok(FollowedPage::default());
        };
        let next_cursor = wire.next_page(page);
        Ok(FollowedPage {
            ids: wire.data.into_iter().map(|f| PostId(f.pid)).collect(),
            next_cursor,
        })
    }

    async fn download(&self, url: &str) -> std::result::Result<Vec<u8>, FetchError> {
        let url = self
            .base_url
            .join(url)
            .map_err(|e| FetchError::Permanent(format!("invalid image URL '{url}': {e}")))?;

        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(classify_transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, url.as_str(), None));
        }

        let bytes = response.bytes().await.map_err(classify_transport)?;
        Ok(bytes.to_vec())
    }
}

/// `{success, message, data}` response envelope
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

/// Laravel-style paginated list
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct WirePage<T> {
    #[serde(default)]
    data: Vec<T>,
    current_page: Option<u32>,
    #[serde(default)]
    last_page: u32,
}

impl<T> WirePage<T> {
    fn next_page(&self, requested: u32) -> Option<PageCursor> {
        let current = self.current_page.unwrap_or(requested);
        (current < self.last_page).then_some(current + 1)
    }
}

#[derive(Debug, Deserialize)]
struct WirePost {
    #[serde(default)]
    text: String,
    timestamp: Option<i64>,
    #[serde(rename = "type", default)]
    kind: PostKind,
    #[serde(default)]
    url: String,
}

#[derive(Debug, Deserialize)]
struct WireComment {
    cid: i64,
    #[serde(default)]
    text: String,
    timestamp: Option<i64>,
    name: Option<String>,
    quote: Option<WireQuote>,
}

#[derive(Debug, Deserialize)]
struct WireQuote {
    pid: Option<i64>,
    cid: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WireFollowed {
    pid: i64,
}

fn is_auth_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    AUTH_MESSAGE_HINTS.iter().any(|hint| lower.contains(hint))
}

/// Map an unsuccessful HTTP status to a fetch error; `post` marks a post lookup
fn classify_status(status: StatusCode, url: &str, post: Option<PostId>) -> FetchError {
    match (status, post) {
        (StatusCode::NOT_FOUND, Some(id)) => FetchError::NotFound(id),
        (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, _) => {
            FetchError::Auth(format!("{status} from {url}"))
        }
        (StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS, _) => {
            FetchError::Transient(format!("{status} from {url}"))
        }
        (s, _) if s.is_server_error() => FetchError::Transient(format!("{status} from {url}")),
        _ => FetchError::Permanent(format!("{status} from {url}")),
    }
}

/// Map a transport-level reqwest error to a fetch error
fn classify_transport(err: reqwest::Error) -> FetchError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        FetchError::Transient(err.to_string())
    } else if err.is_decode() {
        FetchError::Malformed(err.to_string())
    } else {
        FetchError::Permanent(err.to_string())
    }
}
