//! Crate-level error type.
//!
//! Variants follow the four failure classes of a generation request:
//! client input, upstream transport, frame decode and protocol truncation.
//! Only frame decode errors past the first record are recoverable.

/// Every error the library can report.
#[derive(Debug, thiserror::Error)]
pub enum PagecastError {
    /// The inbound request carried no usable prompt.
    #[error("No prompt in the request")]
    MissingPrompt,

    /// The inbound request could not be understood at all.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The completion API answered with a non-2xx status.
    #[error("upstream returned HTTP {status}: {body}")]
    Upstream { status: u16, body: String },

    /// Connecting to or reading from the completion API failed.
    #[error("upstream transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// One stream record held a payload that is not valid JSON.
    #[error("malformed stream record #{record}: {source}")]
    Decode {
        record: usize,
        #[source]
        source: serde_json::Error,
    },

    /// The stream closed in the middle of a record.
    #[error("stream ended mid-record ({pending} unterminated bytes); the result may be incomplete")]
    Truncated { pending: usize },

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PagecastError {
    /// True for errors caused by the caller's input (4xx class).
    pub fn is_client_error(&self) -> bool {
        matches!(self, PagecastError::MissingPrompt | PagecastError::BadRequest(_))
    }

    /// True when the stream may continue past this error.
    ///
    /// A malformed record is skipped unless it is the very first one, which
    /// usually means the upstream is not speaking the expected protocol.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PagecastError::Decode { record, .. } if *record > 1)
    }

    /// HTTP status the entry point answers with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            PagecastError::MissingPrompt | PagecastError::BadRequest(_) => 400,
            PagecastError::Upstream { .. }
            | PagecastError::Transport(_)
            | PagecastError::Decode { .. }
            | PagecastError::Truncated { .. } => 502,
            PagecastError::Config(_) | PagecastError::Io(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_error(record: usize) -> PagecastError {
        let source = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        PagecastError::Decode { record, source }
    }

    #[test]
    fn test_missing_prompt_message() {
        assert_eq!(PagecastError::MissingPrompt.to_string(), "No prompt in the request");
    }

    #[test]
    fn test_client_errors_map_to_400() {
        assert!(PagecastError::MissingPrompt.is_client_error());
        assert!(PagecastError::BadRequest("x".into()).is_client_error());
        assert_eq!(PagecastError::MissingPrompt.status_code(), 400);
        assert_eq!(PagecastError::BadRequest("x".into()).status_code(), 400);
    }

    #[test]
    fn test_upstream_error_maps_to_502() {
        let err = PagecastError::Upstream { status: 401, body: "bad key".into() };
        assert!(!err.is_client_error());
        assert_eq!(err.status_code(), 502);
        assert!(err.to_string().contains("401"));
    }

    #[test]
    fn test_first_record_decode_error_is_fatal() {
        assert!(!decode_error(1).is_recoverable());
    }

    #[test]
    fn test_later_record_decode_error_is_recoverable() {
        assert!(decode_error(2).is_recoverable());
        assert!(decode_error(17).is_recoverable());
    }

    #[test]
    fn test_truncation_is_not_recoverable() {
        let err = PagecastError::Truncated { pending: 12 };
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("incomplete"));
    }
}
