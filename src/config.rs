//! Runtime configuration.
//!
//! Loaded from an optional TOML file, then overridden by environment
//! variables, then by command-line flags (see [`crate::cli::Args::apply`]).
//! Every section has defaults, so an empty file is a valid config.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::PagecastError;
use crate::fence::{CloseBreak, EndPolicy, FenceStyle};

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a web developer. Answer with one complete HTML \
document that inlines all of its CSS and JavaScript, inside a single ```html code block.";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub server: ServerConfig,
    pub extract: ExtractConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpstreamConfig {
    pub endpoint: String,
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    /// Completion length cap; `0` leaves the field out of the request.
    pub max_tokens: Option<u32>,
    pub system_prompt: String,
    /// Appended to every user prompt.
    pub prompt_suffix: String,
    /// Used when a request carries no credential of its own.
    pub api_key: Option<String>,
    pub connect_timeout_secs: u64,
    /// Drop line-break-only tokens among the first two of a completion.
    pub trim_leading_newlines: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.7,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            max_tokens: Some(200),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            prompt_suffix: String::new(),
            api_key: None,
            connect_timeout_secs: 10,
            trim_leading_newlines: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Accept `prompt%%credential` when the request has no `api_key` field.
    pub legacy_credential_split: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8888,
            legacy_credential_split: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtractConfig {
    pub fence: FenceStyle,
    pub on_unclosed: EndPolicy,
    /// Whether the line break before a closing code fence is content.
    pub close_break: CloseBreak,
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self, PagecastError> {
        toml::from_str(text).map_err(|e| PagecastError::Config(e.to_string()))
    }

    /// Read `path` if given, otherwise start from defaults. Environment
    /// overrides are applied in both cases.
    pub fn load(path: Option<&Path>) -> Result<Self, PagecastError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    PagecastError::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `OPENAI_API_KEY`, `PAGECAST_ENDPOINT` and `PAGECAST_MODEL`.
    ///
    /// Takes the lookup as a closure so tests do not touch the process
    /// environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("OPENAI_API_KEY").filter(|v| !v.is_empty()) {
            self.upstream.api_key = Some(key);
        }
        if let Some(endpoint) = lookup("PAGECAST_ENDPOINT").filter(|v| !v.is_empty()) {
            self.upstream.endpoint = endpoint;
        }
        if let Some(model) = lookup("PAGECAST_MODEL").filter(|v| !v.is_empty()) {
            self.upstream.model = model;
        }
    }

    pub fn validate(&self) -> Result<(), PagecastError> {
        let upstream = &self.upstream;
        if !(upstream.endpoint.starts_with("http://") || upstream.endpoint.starts_with("https://")) {
            return Err(PagecastError::Config(format!(
                "upstream.endpoint must be an http(s) URL, got {:?}",
                upstream.endpoint
            )));
        }
        if upstream.model.trim().is_empty() {
            return Err(PagecastError::Config("upstream.model must not be empty".into()));
        }
        if !(0.0..=2.0).contains(&upstream.temperature) {
            return Err(PagecastError::Config(format!(
                "upstream.temperature must be within 0..=2, got {}",
                upstream.temperature
            )));
        }
        if !(0.0..=1.0).contains(&upstream.top_p) {
            return Err(PagecastError::Config(format!(
                "upstream.top_p must be within 0..=1, got {}",
                upstream.top_p
            )));
        }
        Ok(())
    }
}
