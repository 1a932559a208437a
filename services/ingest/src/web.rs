//! Minimal HTTP front for the streaming endpoint.
//!
//! The streaming handshake arrives as a plain HTTP/1.1 GET whose query
//! string carries the parameters, and on success the same connection
//! becomes the stream. No HTTP framework survives that takeover, so this
//! front reads one request head off the raw socket, answers rejections
//! with a buffered response, and otherwise hands the connection over.

use crate::accept;
use crate::socket::StreamConn;
use crate::state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

const MAX_HEAD_BYTES: usize = 16 * 1024;
const MAX_HEADERS: usize = 64;
const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// The streaming endpoint path.
pub const STREAM_PATH: &str = "/stream";

#[derive(Debug, thiserror::Error)]
pub enum WebError {
    #[error("i/o on the request head: {0}")]
    Io(#[from] std::io::Error),
    #[error("client closed before the head completed")]
    Closed,
    #[error("request head exceeds {MAX_HEAD_BYTES} bytes")]
    HeadTooLarge,
    #[error("timed out reading the request head")]
    Timeout,
    #[error("malformed request: {0}")]
    BadRequest(String),
    #[error("only GET is served here")]
    Method,
}

/// One parsed request head.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub path: String,
    pub query: String,
    pub user_agent: Option<String>,
}

// ---------------------------------------------------------------------------
// Web client
// ---------------------------------------------------------------------------

/// The web server's view of one connection: it owns the socket until the
/// acceptance flow takes it over, after which the client is dead and any
/// HTTP status is informational only.
pub struct WebClient {
    conn: Option<StreamConn>,
    pub client_ip: String,
    pub client_port: String,
    response: Vec<u8>,
    dead: bool,
}

impl WebClient {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            conn: Some(StreamConn::Async(stream)),
            client_ip: peer.ip().to_string(),
            client_port: peer.port().to_string(),
            response: Vec::new(),
            dead: false,
        }
    }

    /// Read and parse one request head.
    pub async fn read_request(&mut self) -> Result<StreamRequest, WebError> {
        let Some(StreamConn::Async(stream)) = self.conn.as_mut() else {
            return Err(WebError::Closed);
        };
        let mut buf = Vec::with_capacity(1024);
        let mut chunk = [0u8; 2048];
        loop {
            let n = tokio::time::timeout(HEAD_READ_TIMEOUT, stream.read(&mut chunk))
                .await
                .map_err(|_| WebError::Timeout)??;
            if n == 0 {
                return Err(WebError::Closed);
            }
            buf.extend_from_slice(&chunk[..n]);
            if buf.len() > MAX_HEAD_BYTES {
                return Err(WebError::HeadTooLarge);
            }
            if let Some(request) = parse_head(&buf)? {
                return Ok(request);
            }
        }
    }

    /// Queue a full HTTP response into the client's buffer.
    pub fn buffer_response(&mut self, status: u16, body: &str) {
        self.response = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            reason_phrase(status),
            body.len(),
            body
        )
        .into_bytes();
    }

    /// Write whatever response is buffered.
    pub async fn flush(&mut self) -> std::io::Result<()> {
        if self.response.is_empty() {
            return Ok(());
        }
        let bytes = std::mem::take(&mut self.response);
        if let Some(StreamConn::Async(stream)) = self.conn.as_mut() {
            stream.write_all(&bytes).await?;
            stream.flush().await?;
        }
        Ok(())
    }

    pub async fn respond(&mut self, status: u16, body: &str) -> std::io::Result<()> {
        self.buffer_response(status, body);
        self.flush().await
    }

    /// Move the connection out of the web client. Buffered response bytes
    /// are flushed first; afterwards the client is dead and holds nothing.
    pub async fn take_over(&mut self) -> Option<StreamConn> {
        let _ = self.flush().await;
        self.dead = true;
        self.conn.take()
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn has_conn(&self) -> bool {
        self.conn.is_some()
    }
}

// ---------------------------------------------------------------------------
// Head parsing
// ---------------------------------------------------------------------------

/// Try to parse a complete request head out of `buf`; `Ok(None)` means more
/// bytes are needed.
fn parse_head(buf: &[u8]) -> Result<Option<StreamRequest>, WebError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(httparse::Status::Partial) => Ok(None),
        Ok(httparse::Status::Complete(_)) => {
            if req.method != Some("GET") {
                return Err(WebError::Method);
            }
            let target = req
                .path
                .ok_or_else(|| WebError::BadRequest("missing request target".to_owned()))?;
            let (path, query) = match target.split_once('?') {
                Some((p, q)) => (p.to_owned(), q.to_owned()),
                None => (target.to_owned(), String::new()),
            };
            let user_agent = req
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case("user-agent"))
                .and_then(|h| std::str::from_utf8(h.value).ok())
                .map(ToOwned::to_owned);
            Ok(Some(StreamRequest {
                path,
                query,
                user_agent,
            }))
        }
        Err(e) => Err(WebError::BadRequest(e.to_string())),
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        409 => "Conflict",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "",
    }
}

// ---------------------------------------------------------------------------
// Accept loop
// ---------------------------------------------------------------------------

/// Accept connections forever, one task per connection.
pub async fn serve(listener: TcpListener, app: Arc<AppState>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let app = Arc::clone(&app);
                tokio::spawn(async move {
                    handle_connection(stream, peer, app).await;
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, app: Arc<AppState>) {
    let mut client = WebClient::new(stream, peer);
    let request = match client.read_request().await {
        Ok(request) => request,
        Err(e) => {
            debug!(client_ip = %client.client_ip, error = %e, "dropping unreadable request");
            let _ = client.respond(400, "").await;
            return;
        }
    };
    if request.path != STREAM_PATH {
        let _ = client.respond(404, "").await;
        return;
    }
    accept::handle_stream_request(&app, client, &request).await;
}
