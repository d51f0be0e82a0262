//! HTTP client for the streamed chat completion endpoint.

use std::time::Duration;

use reqwest::Client;

use crate::config::UpstreamConfig;
use crate::error::PagecastError;
use crate::frames::{payloads, PayloadStream};
use crate::generate::Credential;
use crate::providers::ChatRequest;

pub struct CompletionClient {
    http: Client,
    endpoint: String,
}

impl CompletionClient {
    /// Only the connect phase is bounded; a stream that stays open is read
    /// for as long as the caller keeps polling it.
    pub fn new(config: &UpstreamConfig) -> Result<Self, PagecastError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
        })
    }

    /// Send `request` and return the decoded payload stream.
    ///
    /// A non-2xx status becomes [`PagecastError::Upstream`] with the response
    /// body as detail. No retries.
    pub async fn open(
        &self,
        request: &ChatRequest,
        credential: Option<&Credential>,
    ) -> Result<PayloadStream, PagecastError> {
        let mut builder = self
            .http
            .post(&self.endpoint)
            .json(request);
        if let Some(credential) = credential {
            builder = builder.bearer_auth(credential.expose());
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), endpoint = %self.endpoint, "upstream rejected request");
            return Err(PagecastError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        tracing::debug!(
            model = %request.model,
            content_type = ?response.headers().get(reqwest::header::CONTENT_TYPE),
            "upstream stream opened"
        );
        Ok(Box::pin(payloads(response.bytes_stream())))
    }
}
