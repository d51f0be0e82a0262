//! From an inbound `{prompt}` request to a stream of completion tokens.

use std::fmt;
use std::pin::Pin;

use futures_util::stream::Stream;
use serde::Deserialize;
use serde_json::Value;
use tokio_stream::StreamExt;

use crate::config::UpstreamConfig;
use crate::error::PagecastError;
use crate::providers::{delta_text, ChatMessage, ChatRequest};
use crate::upstream::CompletionClient;

/// Separator of the legacy `prompt%%credential` encoding. It is not escaped:
/// a prompt that itself contains `%%` is split at its first occurrence.
pub const CREDENTIAL_SEPARATOR: &str = "%%";

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, PagecastError>> + Send>>;

/// Body of `POST /api/generate`.
#[derive(Debug, Default, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

/// API credential. Never printed in full.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// `None` for an empty or blank key.
    pub fn new(key: impl Into<String>) -> Option<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            None
        } else {
            Some(Self(key.trim().to_string()))
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// A validated request: the prompt to send and the credential to send it with.
#[derive(Debug, Clone)]
pub struct ResolvedRequest {
    pub prompt: String,
    pub credential: Option<Credential>,
}

/// Split `prompt%%credential` at the first separator.
pub fn split_credential(input: &str) -> (&str, Option<&str>) {
    match input.split_once(CREDENTIAL_SEPARATOR) {
        Some((prompt, credential)) => (prompt, Some(credential)),
        None => (input, None),
    }
}

impl GenerateRequest {
    pub fn from_json(body: &[u8]) -> Result<Self, PagecastError> {
        serde_json::from_slice(body).map_err(|e| PagecastError::BadRequest(format!("invalid JSON body: {e}")))
    }

    /// Validate the prompt and pick a credential.
    ///
    /// The `api_key` field wins; without it and with `legacy_split` the
    /// prompt is split on [`CREDENTIAL_SEPARATOR`]; `fallback` (usually the
    /// configured key) is used last.
    pub fn resolve(self, legacy_split: bool, fallback: Option<&str>) -> Result<ResolvedRequest, PagecastError> {
        let raw = self.prompt.filter(|p| !p.is_empty()).ok_or(PagecastError::MissingPrompt)?;

        let (prompt, inline) = match self.api_key {
            Some(key) => (raw, Credential::new(key)),
            None if legacy_split => {
                let (prompt, credential) = split_credential(&raw);
                (prompt.to_string(), credential.and_then(Credential::new))
            }
            None => (raw, None),
        };
        if prompt.is_empty() {
            return Err(PagecastError::MissingPrompt);
        }

        let credential = inline.or_else(|| fallback.and_then(Credential::new));
        Ok(ResolvedRequest { prompt, credential })
    }
}

/// Build the streamed chat completion call for `prompt`.
///
/// Fails before any network traffic when the prompt is empty.
pub fn build_chat_request(config: &UpstreamConfig, prompt: &str) -> Result<ChatRequest, PagecastError> {
    if prompt.is_empty() {
        return Err(PagecastError::MissingPrompt);
    }

    let mut messages = Vec::with_capacity(2);
    if !config.system_prompt.is_empty() {
        messages.push(ChatMessage::system(config.system_prompt.clone()));
    }
    messages.push(ChatMessage::user(format!("{prompt}{}", config.prompt_suffix)));

    Ok(ChatRequest {
        model: config.model.clone(),
        messages,
        temperature: config.temperature,
        top_p: config.top_p,
        frequency_penalty: config.frequency_penalty,
        presence_penalty: config.presence_penalty,
        max_tokens: config.max_tokens.filter(|&n| n > 0),
        stream: true,
        n: 1,
    })
}

/// Leading tokens checked by `trim_leading_newlines`.
const LEADING_TOKENS: usize = 2;

/// Map decoded payloads to their text deltas.
///
/// Payloads without text are dropped. With `trim_leading_newlines`, tokens
/// made only of line breaks are dropped when they are among the first
/// [`LEADING_TOKENS`] text tokens of the completion.
pub fn tokens<S>(payloads: S, trim_leading_newlines: bool) -> impl Stream<Item = Result<String, PagecastError>>
where
    S: Stream<Item = Result<Value, PagecastError>>,
{
    let mut index = 0usize;
    payloads.filter_map(move |item| match item {
        Ok(payload) => {
            let text = delta_text(&payload)?;
            if text.is_empty() {
                return None;
            }
            let leading = index < LEADING_TOKENS;
            index += 1;
            if trim_leading_newlines && leading && text.chars().all(|c| c == '\n' || c == '\r') {
                return None;
            }
            Some(Ok(text))
        }
        Err(err) => Some(Err(err)),
    })
}

/// Upstream client bound to one upstream configuration.
pub struct Generator {
    client: CompletionClient,
    upstream: UpstreamConfig,
}

impl Generator {
    pub fn new(upstream: &UpstreamConfig) -> Result<Self, PagecastError> {
        Ok(Self {
            client: CompletionClient::new(upstream)?,
            upstream: upstream.clone(),
        })
    }

    /// Open the completion call and return its token stream.
    pub async fn stream(&self, request: &ResolvedRequest) -> Result<TokenStream, PagecastError> {
        let chat = build_chat_request(&self.upstream, &request.prompt)?;
        let payloads = self.client.open(&chat, request.credential.as_ref()).await?;
        Ok(Box::pin(tokens(payloads, self.upstream.trim_leading_newlines)))
    }
}
