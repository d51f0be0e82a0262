//! Request-scoped driver tying a token stream to a [`FenceExtractor`].

use futures_util::stream::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

use crate::config::ExtractConfig;
use crate::error::PagecastError;
use crate::fence::{Extraction, FenceExtractor, FenceState};

/// Extracted content after one token, sent to a live renderer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Preview {
    pub index: usize,
    pub token: String,
    pub content: String,
    pub state: FenceState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    pub extraction: Extraction,
    pub tokens: usize,
    /// The stream was cut short; the extraction may be missing text.
    pub truncated: bool,
}

pub struct Session {
    extractor: FenceExtractor,
    /// When set, a [`Preview`] is sent here after every token.
    pub preview_tx: Option<mpsc::UnboundedSender<Preview>>,
    pub token_count: usize,
}

impl Session {
    pub fn new(extract: ExtractConfig) -> Self {
        Self {
            extractor: FenceExtractor::new(extract.fence, extract.on_unclosed)
                .with_close_break(extract.close_break),
            preview_tx: None,
            token_count: 0,
        }
    }

    pub fn with_previews(mut self, tx: mpsc::UnboundedSender<Preview>) -> Self {
        self.preview_tx = Some(tx);
        self
    }

    pub fn extractor(&self) -> &FenceExtractor {
        &self.extractor
    }

    /// Push one token and publish the resulting preview.
    pub fn feed(&mut self, token: &str) -> &str {
        self.extractor.push(token);
        if let Some(tx) = &self.preview_tx {
            // A dropped receiver only means nobody is watching.
            let _ = tx.send(Preview {
                index: self.token_count,
                token: token.to_string(),
                content: self.extractor.current().to_string(),
                state: self.extractor.state(),
            });
        }
        self.token_count += 1;
        self.extractor.current()
    }

    /// Consume `tokens` to the end and return the final extraction.
    ///
    /// Truncation, or a transport failure once text has arrived, ends the
    /// drive with `truncated` set; any other error is returned as is.
    pub async fn drive<S>(mut self, mut tokens: S) -> Result<Outcome, PagecastError>
    where
        S: Stream<Item = Result<String, PagecastError>> + Unpin,
    {
        let mut truncated = false;
        while let Some(item) = tokens.next().await {
            match item {
                Ok(token) => {
                    self.feed(&token);
                }
                Err(err)
                    if matches!(err, PagecastError::Truncated { .. })
                        || (self.token_count > 0 && matches!(err, PagecastError::Transport(_))) =>
                {
                    tracing::warn!(error = %err, tokens = self.token_count, "finishing with partial input");
                    truncated = true;
                    break;
                }
                Err(err) => return Err(err),
            }
        }

        let tokens = self.token_count;
        Ok(Outcome {
            extraction: self.extractor.finish(),
            tokens,
            truncated,
        })
    }
}
