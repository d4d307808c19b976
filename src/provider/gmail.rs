//! Gmail REST API client.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::debug;

use crate::auth::Credential;
use crate::error::ProviderError;
use crate::provider::{
    ListQuery, MailProvider, MessagePage, MessageRef, RemoteMessage, parse_retry_after,
    status_error, transport_error,
};
use crate::sync::mime::MimePart;

/// Public Gmail API base URL.
pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";

const SERVICE: &str = "gmail";

/// Gmail API client. Holds no tokens; every call takes a [`Credential`].
pub struct GmailClient {
    client: Client,
    base_url: String,
}

impl GmailClient {
    pub fn new(client: Client) -> Self {
        Self::with_base_url(client, GMAIL_API_BASE)
    }

    /// Create a client against a custom base URL (proxies, tests).
    pub fn with_base_url(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        credential: &Credential,
        url: &str,
        query: &[(&str, String)],
        not_found_id: Option<&str>,
    ) -> Result<T, ProviderError> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(credential.access_token.expose_secret())
            .query(query)
            .send()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND
            && let Some(id) = not_found_id
        {
            return Err(ProviderError::NotFound {
                service: SERVICE.into(),
                id: id.to_string(),
            });
        }
        if !status.is_success() {
            let retry_after = parse_retry_after(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(SERVICE, status, retry_after, &body));
        }

        resp.json::<T>()
            .await
            .map_err(|e| ProviderError::InvalidResponse {
                service: SERVICE.into(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl MailProvider for GmailClient {
    async fn list_messages(
        &self,
        credential: &Credential,
        query: &ListQuery,
    ) -> Result<MessagePage, ProviderError> {
        let url = format!("{}/users/me/messages", self.base_url);
        let mut params = vec![("maxResults", query.page_size.to_string())];
        if let Some(q) = &query.query {
            params.push(("q", q.clone()));
        }
        if let Some(token) = &query.page_token {
            params.push(("pageToken", token.clone()));
        }

        let list: GmailListResponse = self.get_json(credential, &url, &params, None).await?;
        debug!(
            user_id = credential.user_id,
            count = list.messages.len(),
            more = list.next_page_token.is_some(),
            "Listed remote messages"
        );
        Ok(MessagePage {
            messages: list
                .messages
                .into_iter()
                .map(|m| MessageRef {
                    id: m.id,
                    thread_id: m.thread_id,
                })
                .collect(),
            next_page_token: list.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    async fn get_message(
        &self,
        credential: &Credential,
        id: &str,
    ) -> Result<RemoteMessage, ProviderError> {
        // Ids are opaque provider strings; refuse anything that changes the path.
        if id.is_empty() || id.contains('/') || id.contains('\\') || id.contains("..") {
            return Err(ProviderError::RequestFailed {
                service: SERVICE.into(),
                reason: format!("invalid message id {id:?}"),
            });
        }

        let url = format!("{}/users/me/messages/{id}", self.base_url);
        let raw: GmailMessageResponse = self
            .get_json(credential, &url, &[("format", "full".into())], Some(id))
            .await?;
        Ok(raw.into_remote())
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailListResponse {
    #[serde(default)]
    messages: Vec<GmailMessageRef>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessageRef {
    id: String,
    thread_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessageResponse {
    id: String,
    thread_id: Option<String>,
    payload: Option<GmailPart>,
}

/// A MIME part; the top-level payload is a part with headers.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailPart {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<GmailHeader>,
    body: Option<GmailBody>,
    #[serde(default)]
    parts: Vec<GmailPart>,
}

#[derive(Debug, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct GmailBody {
    data: Option<String>,
}

impl GmailPart {
    fn into_mime(self) -> MimePart {
        let data = self.body.and_then(|b| b.data).filter(|d| !d.is_empty());
        let parts = self.parts.into_iter().map(GmailPart::into_mime).collect();
        MimePart::from_mime_type(&self.mime_type, data, parts)
    }
}

impl GmailMessageResponse {
    fn into_remote(self) -> RemoteMessage {
        let (headers, payload) = match self.payload {
            Some(mut part) => {
                let headers = std::mem::take(&mut part.headers)
                    .into_iter()
                    .map(|h| (h.name, h.value))
                    .collect();
                (headers, Some(part.into_mime()))
            }
            None => (Vec::new(), None),
        };
        RemoteMessage {
            id: self.id,
            thread_id: self.thread_id,
            headers,
            payload,
        }
    }
}
