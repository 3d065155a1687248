use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use url::Url;

use super::traits::RemoteApi;
use super::types::*;

/// `RemoteApi` over the backend's JSON REST endpoints.
pub struct HttpRemote {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, RemoteError> {
        // A trailing slash keeps `join` from dropping the last path segment.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base_url = Url::parse(&normalized)
            .map_err(|e| RemoteError::RequestFailed(format!("Invalid base URL {}: {}", base_url, e)))?;

        Ok(Self {
            client: Client::new(),
            base_url,
            token,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        self.base_url
            .join(path)
            .map_err(|e| RemoteError::RequestFailed(format!("Invalid endpoint {}: {}", path, e)))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn parse_error_message(status: StatusCode, body: &str) -> String {
        if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(body) {
            if let Some(message) = parsed
                .get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str())
            {
                return format!("HTTP {}: {}", status.as_u16(), message);
            }
        }
        format!("HTTP {}: Request failed", status.as_u16())
    }

    async fn check_status(response: Response) -> Result<Response, RemoteError> {
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RemoteError::Auth("Session rejected by backend".to_string()));
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(RemoteError::RateLimited { retry_after_secs });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::RequestFailed(Self::parse_error_message(
                status, &body,
            )));
        }

        Ok(response)
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn list_conversations(
        &self,
        page: u32,
        limit: u32,
    ) -> Result<ConversationPage, RemoteError> {
        let mut url = self.endpoint("conversations")?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("limit", &limit.to_string());

        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    }

    async fn fetch_conversations(
        &self,
        items: Vec<BatchItem>,
    ) -> Result<Vec<RemoteConversationDetail>, RemoteError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let url = self.endpoint("conversations/batch")?;
        let response = self
            .authorize(self.client.post(url))
            .json(&BatchRequest {
                conversations: items,
            })
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        let batch: BatchResponse = Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;

        Ok(batch.conversations)
    }
}
