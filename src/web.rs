//! Minimal HTTP/1.1 entry point: `POST /api/generate` streams the plain
//! text completion back to the caller.

use std::sync::Arc;
use std::time::Instant;

use colored::*;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_stream::StreamExt;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::Config;
use crate::error::PagecastError;
use crate::frames::text_chunks;
use crate::generate::{GenerateRequest, Generator, TokenStream};

pub const GENERATE_PATH: &str = "/api/generate";

const MAX_HEAD: usize = 16 * 1024;
const MAX_BODY: usize = 1024 * 1024;
const MAX_HEADERS: usize = 64;

const STREAM_HEAD: &str = "HTTP/1.1 200 OK\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Cache-Control: no-cache\r\n\
Access-Control-Allow-Origin: *\r\n\
Transfer-Encoding: chunked\r\n\
Connection: close\r\n\r\n";

/// Terminates a chunked body. Left out when the upstream stream fails, so
/// the client sees an incomplete body instead of a clean end.
const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Shared by every connection of one server.
pub struct AppState {
    pub config: Config,
    generator: Generator,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self, PagecastError> {
        let generator = Generator::new(&config.upstream)?;
        Ok(Self { config, generator })
    }
}

/// Bind the configured address and serve until the process is stopped.
pub async fn serve(config: Config) -> Result<(), PagecastError> {
    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = TcpListener::bind(&addr).await?;

    eprintln!(
        "{}",
        format!("  Listening on http://{addr}{GENERATE_PATH}").bright_green()
    );
    eprintln!("{}", "  Press Ctrl+C to stop.".bright_blue());
    tracing::info!(%addr, upstream = %config.upstream.endpoint, model = %config.upstream.model, "server started");

    serve_on(listener, Arc::new(AppState::new(config)?)).await
}

/// Accept connections on an already bound listener, one task each.
pub async fn serve_on(listener: TcpListener, state: Arc<AppState>) -> Result<(), PagecastError> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let state = Arc::clone(&state);
        let span = tracing::info_span!("request", id = %Uuid::new_v4(), %peer);
        tokio::spawn(
            async move {
                if let Err(e) = handle_connection(stream, &state).await {
                    tracing::debug!(error = %e, "connection ended with error");
                }
            }
            .instrument(span),
        );
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// First header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Read one request head and its `Content-Length` body.
///
/// `Ok(None)` when the peer closed before sending anything.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<HttpRequest>, PagecastError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(PagecastError::BadRequest("connection closed mid-request".into()));
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);
        let head_len = match parsed.parse(&buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => {
                if buf.len() > MAX_HEAD {
                    return Err(PagecastError::BadRequest("request head too large".into()));
                }
                continue;
            }
            Err(e) => return Err(PagecastError::BadRequest(format!("malformed request: {e}"))),
        };

        let mut request = HttpRequest {
            method: parsed.method.unwrap_or_default().to_string(),
            path: parsed.path.unwrap_or("/").to_string(),
            headers: parsed
                .headers
                .iter()
                .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
                .collect(),
            body: Vec::new(),
        };

        let length = match request.header("content-length") {
            Some(value) => value
                .trim()
                .parse::<usize>()
                .map_err(|_| PagecastError::BadRequest(format!("invalid Content-Length {value:?}")))?,
            None => 0,
        };
        if length > MAX_BODY {
            return Err(PagecastError::BadRequest(format!("body of {length} bytes is too large")));
        }

        let mut body = buf[head_len..].to_vec();
        while body.len() < length {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Err(PagecastError::BadRequest("body shorter than Content-Length".into()));
            }
            body.extend_from_slice(&chunk[..n]);
        }
        body.truncate(length);
        request.body = body;
        return Ok(Some(request));
    }
}

/// Serve exactly one request on `stream`, then close it.
pub async fn handle_connection<S>(mut stream: S, state: &AppState) -> Result<(), PagecastError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = match read_request(&mut stream).await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(err @ PagecastError::BadRequest(_)) => {
            tracing::info!(error = %err, "unreadable request");
            write_plain(&mut stream, 400, &[], &err.to_string()).await?;
            return stream.shutdown().await.map_err(Into::into);
        }
        Err(err) => return Err(err),
    };

    let path = request.path.split('?').next().unwrap_or_default();
    tracing::debug!(method = %request.method, %path, bytes = request.body.len(), "request");

    match (request.method.as_str(), path) {
        ("POST", GENERATE_PATH) => generate(&mut stream, state, &request.body).await?,
        ("OPTIONS", GENERATE_PATH) => {
            let cors = [
                ("Access-Control-Allow-Methods", "POST, OPTIONS"),
                ("Access-Control-Allow-Headers", "Content-Type"),
            ];
            write_plain(&mut stream, 204, &cors, "").await?;
        }
        (_, GENERATE_PATH) => {
            write_plain(&mut stream, 405, &[("Allow", "POST, OPTIONS")], "Method Not Allowed").await?;
        }
        _ => write_plain(&mut stream, 404, &[], "Not Found").await?,
    }

    stream.shutdown().await.map_err(Into::into)
}

/// Validate, open the upstream call and relay tokens as they arrive.
///
/// The first token is awaited before the status line goes out, so an
/// upstream that fails up front is reported as 502 instead of an empty 200.
/// A failure after that ends the chunked body without its last chunk.
async fn generate<W>(writer: &mut W, state: &AppState, body: &[u8]) -> Result<(), PagecastError>
where
    W: AsyncWrite + Unpin,
{
    let server = &state.config.server;
    let resolved = match GenerateRequest::from_json(body)
        .and_then(|req| req.resolve(server.legacy_credential_split, state.config.upstream.api_key.as_deref()))
    {
        Ok(resolved) => resolved,
        Err(err) => {
            tracing::info!(error = %err, "rejected request");
            return write_plain(writer, err.status_code(), &[], &err.to_string()).await;
        }
    };

    let started = Instant::now();
    let mut tokens = match state.generator.stream(&resolved).await {
        Ok(tokens) => tokens,
        Err(err) => {
            tracing::warn!(error = %err, "upstream call failed");
            return write_plain(writer, err.status_code(), &[], &err.to_string()).await;
        }
    };

    let first = match tokens.next().await {
        Some(Ok(token)) => Some(token),
        Some(Err(err)) => {
            tracing::warn!(error = %err, "upstream stream failed before first token");
            return write_plain(writer, 502, &[], &err.to_string()).await;
        }
        None => None,
    };

    writer.write_all(STREAM_HEAD.as_bytes()).await?;
    let mut count = 0usize;
    let mut bytes = 0usize;
    if let Some(token) = first {
        write_chunk(writer, token.as_bytes()).await?;
        count += 1;
        bytes += token.len();
    }

    // A failed write returns early and drops `tokens`, closing the upstream.
    while let Some(item) = tokens.next().await {
        match item {
            Ok(token) => {
                write_chunk(writer, token.as_bytes()).await?;
                count += 1;
                bytes += token.len();
            }
            Err(err) => {
                tracing::warn!(error = %err, tokens = count, bytes, "upstream stream ended early; body left unterminated");
                return Ok(());
            }
        }
    }
    writer.write_all(LAST_CHUNK).await?;
    writer.flush().await?;

    tracing::info!(
        tokens = count,
        bytes,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "generation finished"
    );
    Ok(())
}

/// Ask a running server at `base` to generate, and read its body as tokens.
///
/// A body that ends without its last chunk surfaces as a transport error
/// after the text received so far.
pub async fn remote_tokens(base: &str, prompt: &str, api_key: Option<&str>) -> Result<TokenStream, PagecastError> {
    let url = format!("{}{GENERATE_PATH}", base.trim_end_matches('/'));
    let mut body = serde_json::json!({ "prompt": prompt });
    if let Some(key) = api_key {
        body["api_key"] = serde_json::Value::String(key.to_string());
    }

    let response = reqwest::Client::new().post(&url).json(&body).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(PagecastError::Upstream {
            status: status.as_u16(),
            body,
        });
    }
    tracing::debug!(%url, "remote stream opened");
    Ok(Box::pin(text_chunks(response.bytes_stream())))
}

async fn write_chunk<W>(writer: &mut W, data: &[u8]) -> Result<(), PagecastError>
where
    W: AsyncWrite + Unpin,
{
    // A zero-length chunk would end the body.
    if data.is_empty() {
        return Ok(());
    }
    writer.write_all(format!("{:x}\r\n", data.len()).as_bytes()).await?;
    writer.write_all(data).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await?;
    Ok(())
}

async fn write_plain<W>(
    writer: &mut W,
    status: u16,
    extra_headers: &[(&str, &str)],
    body: &str,
) -> Result<(), PagecastError>
where
    W: AsyncWrite + Unpin,
{
    let mut head = format!(
        "HTTP/1.1 {status} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nAccess-Control-Allow-Origin: *\r\nConnection: close\r\n",
        reason(status),
        body.len(),
    );
    for (name, value) in extra_headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");

    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        502 => "Bad Gateway",
        _ => "Internal Server Error",
    }
}
