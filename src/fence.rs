//! Incremental extraction of a fenced block from a token stream.
//!
//! Tokens are appended verbatim to a growing buffer. The extractor looks for
//! the first opening fence, then for the first closing fence after it, and
//! reports the best-known content after every token so callers can render a
//! live preview while the completion is still streaming.
//!
//! Scanning resumes where the previous scan stopped, backed off by one byte
//! less than the fence length, so total work stays linear and a fence split
//! across two tokens is still found.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Which delimiter encloses the content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FenceStyle {
    /// Markdown code fence: three backticks, an optional language tag on the
    /// opening line, closed by three backticks.
    #[default]
    Triple,
    /// A single backtick on each side, no language tag.
    Single,
}

impl FenceStyle {
    pub fn marker(self) -> &'static str {
        match self {
            FenceStyle::Triple => "```",
            FenceStyle::Single => "`",
        }
    }

    fn has_info_string(self) -> bool {
        matches!(self, FenceStyle::Triple)
    }
}

impl std::fmt::Display for FenceStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FenceStyle::Triple => write!(f, "triple"),
            FenceStyle::Single => write!(f, "single"),
        }
    }
}

/// What the final value is when the stream ends before a closing fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum EndPolicy {
    /// Everything after the opening fence, or nothing if no fence was seen.
    #[default]
    OpenToEnd,
    /// The whole accumulated text.
    WholeBuffer,
}

impl std::fmt::Display for EndPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndPolicy::OpenToEnd => write!(f, "open-to-end"),
            EndPolicy::WholeBuffer => write!(f, "whole-buffer"),
        }
    }
}

/// Who owns the line break right before a closing code fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum CloseBreak {
    /// The break stays at the end of the content.
    #[default]
    Keep,
    /// The break is part of the fence line and is dropped (`\n` or `\r\n`).
    Strip,
}

impl std::fmt::Display for CloseBreak {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseBreak::Keep => write!(f, "keep"),
            CloseBreak::Strip => write!(f, "strip"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FenceState {
    SeekingOpen,
    InsideFence,
    Closed,
}

/// Final result of an extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Extraction {
    pub content: String,
    pub state: FenceState,
    /// True only when a closing fence was found.
    pub complete: bool,
}

#[derive(Debug, Clone)]
pub struct FenceExtractor {
    style: FenceStyle,
    policy: EndPolicy,
    close_break: CloseBreak,
    buffer: String,
    state: FenceState,
    /// Next offset a fence search starts from.
    scan_from: usize,
    /// Offset just past an opening marker whose info string is still open.
    marker_end: Option<usize>,
    start: usize,
    end: usize,
}

impl FenceExtractor {
    pub fn new(style: FenceStyle, policy: EndPolicy) -> Self {
        Self {
            style,
            policy,
            close_break: CloseBreak::Keep,
            buffer: String::new(),
            state: FenceState::SeekingOpen,
            scan_from: 0,
            marker_end: None,
            start: 0,
            end: 0,
        }
    }

    /// Only affects [`FenceStyle::Triple`]; a single backtick never owns a
    /// line break.
    pub fn with_close_break(mut self, close_break: CloseBreak) -> Self {
        self.close_break = close_break;
        self
    }

    pub fn state(&self) -> FenceState {
        self.state
    }

    /// All text pushed so far.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Append a token and return the content known so far.
    pub fn push(&mut self, token: &str) -> &str {
        self.buffer.push_str(token);
        self.advance();
        self.current()
    }

    /// Content known so far.
    ///
    /// Empty until the opening fence (and its language tag line) is complete.
    /// Inside the fence, a tail that may still become the closing fence is
    /// held back, line break included. Once closed the value never changes.
    pub fn current(&self) -> &str {
        match self.state {
            FenceState::SeekingOpen => "",
            FenceState::InsideFence => {
                let region = &self.buffer[self.start..];
                &region[..region.len() - self.held_back(region)]
            }
            FenceState::Closed => &self.buffer[self.start..self.end],
        }
    }

    /// Final value at end of stream.
    pub fn finish(self) -> Extraction {
        let content = match (self.state, self.policy) {
            (FenceState::Closed, _) => self.buffer[self.start..self.end].to_string(),
            (_, EndPolicy::WholeBuffer) => self.buffer,
            (FenceState::InsideFence, EndPolicy::OpenToEnd) => self.buffer[self.start..].to_string(),
            // Nothing but a language tag can follow a pending opener.
            (FenceState::SeekingOpen, EndPolicy::OpenToEnd) => String::new(),
        };
        Extraction {
            content,
            state: self.state,
            complete: self.state == FenceState::Closed,
        }
    }

    fn advance(&mut self) {
        let marker = self.style.marker();
        loop {
            match self.state {
                FenceState::SeekingOpen => {
                    let after_marker = match self.marker_end {
                        Some(end) => end,
                        None => match find_from(&self.buffer, self.scan_from, marker) {
                            Some(at) => {
                                let end = at + marker.len();
                                self.marker_end = Some(end);
                                end
                            }
                            None => {
                                self.scan_from = resume_offset(&self.buffer, marker, self.scan_from);
                                return;
                            }
                        },
                    };
                    let skip = if self.style.has_info_string() {
                        match info_string_len(&self.buffer[after_marker..]) {
                            Some(len) => len,
                            None => return,
                        }
                    } else {
                        0
                    };
                    self.start = after_marker + skip;
                    self.scan_from = self.start;
                    self.marker_end = None;
                    self.state = FenceState::InsideFence;
                }
                FenceState::InsideFence => {
                    match find_from(&self.buffer, self.scan_from, marker) {
                        Some(at) => {
                            self.end = self.content_end(at);
                            self.state = FenceState::Closed;
                        }
                        None => {
                            self.scan_from = resume_offset(&self.buffer, marker, self.scan_from);
                        }
                    }
                    return;
                }
                FenceState::Closed => return,
            }
        }
    }

    /// End of content for a closing marker at `at`.
    fn content_end(&self, at: usize) -> usize {
        if !self.style.has_info_string() || self.close_break == CloseBreak::Keep {
            return at;
        }
        let body = &self.buffer[self.start..at];
        match body.strip_suffix("\r\n").or_else(|| body.strip_suffix('\n')) {
            Some(trimmed) => self.start + trimmed.len(),
            None => at,
        }
    }

    fn held_back(&self, region: &str) -> usize {
        let marker = self.style.marker();
        let held = partial_suffix(region, marker);
        if !self.style.has_info_string() {
            return held;
        }
        held.max(partial_suffix(region, "\n```"))
            .max(partial_suffix(region, "\r\n```"))
    }
}

/// One-shot extraction over a complete text.
pub fn extract(text: &str, style: FenceStyle, policy: EndPolicy) -> Extraction {
    let mut extractor = FenceExtractor::new(style, policy);
    extractor.push(text);
    extractor.finish()
}

fn find_from(buffer: &str, from: usize, pattern: &str) -> Option<usize> {
    buffer[from..].find(pattern).map(|at| from + at)
}

/// Where the next search starts: far enough back to catch a marker whose
/// first bytes are already at the end of the buffer.
fn resume_offset(buffer: &str, marker: &str, floor: usize) -> usize {
    let mut at = buffer.len().saturating_sub(marker.len() - 1).max(floor);
    while !buffer.is_char_boundary(at) {
        at -= 1;
    }
    at
}

/// Length of the longest proper prefix of `pattern` that `text` ends with.
fn partial_suffix(text: &str, pattern: &str) -> usize {
    (1..pattern.len())
        .rev()
        .find(|&len| text.ends_with(&pattern[..len]))
        .unwrap_or(0)
}

fn is_tag_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '-' | '+' | '_' | '.' | '#')
}

/// Bytes to skip after an opening code fence.
///
/// `Some(n)` when the opening line is a language tag followed by a line
/// break (n covers both), `Some(0)` when the fence is followed by anything
/// else, `None` while that cannot be decided yet.
fn info_string_len(rest: &str) -> Option<usize> {
    let tag = rest.find(|c: char| !is_tag_char(c)).unwrap_or(rest.len());
    let after_tag = &rest[tag..];
    let blanks = after_tag.len() - after_tag.trim_start_matches([' ', '\t']).len();
    let tail = &after_tag[blanks..];

    if tail.starts_with('\n') {
        Some(tag + blanks + 1)
    } else if tail.starts_with("\r\n") {
        Some(tag + blanks + 2)
    } else if tail.is_empty() || tail == "\r" {
        None
    } else {
        Some(0)
    }
}
