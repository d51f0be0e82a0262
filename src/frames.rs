//! Frame assembly for server-sent-event streams.
//!
//! The completion API answers with `data: <json>` lines terminated by `\n`
//! and finishes with `data: [DONE]`. Transport chunks carry no framing
//! guarantees, so [`FrameAssembler`] keeps a byte carry-over between chunks
//! and only decodes a record once its line break has arrived. Buffering bytes
//! rather than text means a multi-byte character split across two chunks is
//! decoded exactly as if it had arrived in one piece.

use std::collections::VecDeque;
use std::pin::Pin;

use futures_util::stream::{self, Stream};
use serde_json::Value;
use tokio_stream::StreamExt;

use crate::error::PagecastError;

/// Field prefix carrying a record's payload.
pub const DATA_PREFIX: &str = "data:";

/// Payload the upstream sends after the last record.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Boxed stream of decoded payloads, as returned by the upstream client.
pub type PayloadStream = Pin<Box<dyn Stream<Item = Result<Value, PagecastError>> + Send>>;

/// One decoded record.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Payload(Value),
    Done,
}

/// Incremental SSE record decoder.
///
/// Feed raw chunks with [`push`](Self::push) and call
/// [`finish`](Self::finish) once the transport reports end of input.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    carry: Vec<u8>,
    records: usize,
    done: bool,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `data:` records seen so far, sentinel included.
    pub fn records(&self) -> usize {
        self.records
    }

    /// True once the sentinel has been decoded.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Append a chunk and decode every record it completes.
    ///
    /// Decode failures are returned in place, in record order; whether they
    /// are fatal is up to the caller (see [`PagecastError::is_recoverable`]).
    /// Nothing is decoded after the sentinel.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Frame, PagecastError>> {
        let mut frames = Vec::new();
        if self.done {
            return frames;
        }
        self.carry.extend_from_slice(chunk);

        let mut consumed = 0;
        while let Some(offset) = self.carry[consumed..].iter().position(|&b| b == b'\n') {
            let line = &self.carry[consumed..consumed + offset];
            consumed += offset + 1;
            if let Some(frame) = decode_record(line, &mut self.records) {
                let finished = matches!(frame, Ok(Frame::Done));
                frames.push(frame);
                if finished {
                    self.done = true;
                    break;
                }
            }
        }

        if self.done {
            self.carry.clear();
        } else {
            self.carry.drain(..consumed);
        }
        frames
    }

    /// Close the input.
    ///
    /// Returns `Ok(None)` for a clean close, `Ok(Some(Frame::Done))` when the
    /// unterminated tail is the sentinel itself, and
    /// [`PagecastError::Truncated`] when any other partial record is left.
    pub fn finish(&mut self) -> Result<Option<Frame>, PagecastError> {
        if self.done {
            return Ok(None);
        }
        let tail = std::mem::take(&mut self.carry);
        if tail.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let mut records = self.records;
        match decode_record(&tail, &mut records) {
            Some(Ok(Frame::Done)) => {
                self.records = records;
                self.done = true;
                Ok(Some(Frame::Done))
            }
            _ => Err(PagecastError::Truncated { pending: tail.len() }),
        }
    }
}

/// Decode one line. Lines that are not `data:` fields yield `None`.
fn decode_record(line: &[u8], records: &mut usize) -> Option<Result<Frame, PagecastError>> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let text = String::from_utf8_lossy(line);
    let payload = text.strip_prefix(DATA_PREFIX)?;
    let payload = payload.strip_prefix(' ').unwrap_or(payload);

    *records += 1;
    if payload.trim() == DONE_SENTINEL {
        return Some(Ok(Frame::Done));
    }
    Some(
        serde_json::from_str(payload)
            .map(Frame::Payload)
            .map_err(|source| PagecastError::Decode { record: *records, source }),
    )
}

struct PayloadPump<S> {
    chunks: Pin<Box<S>>,
    assembler: FrameAssembler,
    ready: VecDeque<Result<Frame, PagecastError>>,
    finished: bool,
}

impl<S, B, E> PayloadPump<S>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Into<PagecastError>,
{
    async fn next_payload(&mut self) -> Option<Result<Value, PagecastError>> {
        loop {
            while let Some(frame) = self.ready.pop_front() {
                match frame {
                    Ok(Frame::Payload(value)) => return Some(Ok(value)),
                    Ok(Frame::Done) => {
                        self.finished = true;
                        self.ready.clear();
                        return None;
                    }
                    Err(err) if err.is_recoverable() => {
                        tracing::warn!(error = %err, "skipping malformed stream record");
                    }
                    Err(err) => {
                        self.finished = true;
                        self.ready.clear();
                        return Some(Err(err));
                    }
                }
            }
            if self.finished {
                return None;
            }

            match self.chunks.next().await {
                Some(Ok(chunk)) => {
                    let frames = self.assembler.push(chunk.as_ref());
                    self.ready.extend(frames);
                }
                Some(Err(err)) => {
                    self.finished = true;
                    return Some(Err(err.into()));
                }
                None => {
                    self.finished = true;
                    match self.assembler.finish() {
                        Ok(Some(frame)) => self.ready.push_back(Ok(frame)),
                        Ok(None) => {
                            tracing::debug!(
                                records = self.assembler.records(),
                                "stream closed without sentinel"
                            );
                            return None;
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "stream truncated");
                            return Some(Err(err));
                        }
                    }
                }
            }
        }
    }
}

/// Turn a stream of raw chunks into a lazy stream of decoded payloads.
///
/// Malformed records after the first are logged and skipped. A malformed
/// first record, a transport error or a truncated tail is yielded as an
/// error and ends the stream.
pub fn payloads<S, B, E>(chunks: S) -> impl Stream<Item = Result<Value, PagecastError>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Into<PagecastError>,
{
    let pump = PayloadPump {
        chunks: Box::pin(chunks),
        assembler: FrameAssembler::new(),
        ready: VecDeque::new(),
        finished: false,
    };
    stream::unfold(pump, |mut pump| async move {
        let item = pump.next_payload().await?;
        Some((item, pump))
    })
}

// ---------------------------------------------------------------------------
// Plain text bodies
// ---------------------------------------------------------------------------

/// Streaming UTF-8 decoder that holds back an incomplete trailing sequence.
///
/// Invalid sequences become U+FFFD, like a lossy decode of the whole body.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or_default());
                    match err.error_len() {
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                    }
                }
            }
        }
    }

    /// Flush whatever is left at end of input.
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

/// Decode a plain text body into non-empty text fragments, one per chunk.
pub fn text_chunks<S, B, E>(chunks: S) -> impl Stream<Item = Result<String, PagecastError>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Into<PagecastError>,
{
    let state = (Box::pin(chunks), Utf8Decoder::new(), false);
    stream::unfold(state, |(mut chunks, mut decoder, mut finished)| async move {
        loop {
            if finished {
                return None;
            }
            let text = match chunks.next().await {
                Some(Ok(chunk)) => decoder.decode(chunk.as_ref()),
                Some(Err(err)) => {
                    return Some((Err(err.into()), (chunks, decoder, true)));
                }
                None => {
                    finished = true;
                    decoder.finish()
                }
            };
            if !text.is_empty() {
                return Some((Ok(text), (chunks, decoder, finished)));
            }
        }
    })
}
