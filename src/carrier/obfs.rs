//! HTTP tunnel carrier (OBFS).
//!
//! Tunnels protocol frames inside ordinary HTTP POST traffic so that an
//! on-path observer sees a web client talking to a web server instead of a
//! custom datagram protocol.
//!
//! The server exposes two endpoints:
//!
//! * `POST /data` — the request body is one opaque frame, queued into the
//!   sending client's inbox.
//! * `POST /poll` — empty request body, used to drain the server-to-client
//!   direction when the client has nothing to send.
//!
//! Either response carries at most one queued server-to-client frame as its
//! body; an empty body means "no pending frame". Clients are identified by
//! the `X-Client-Id` request header. Per-client inbox and outbox queues are
//! FIFO and bounded: a full inbox answers `503` (the client's transport
//! retries), a full outbox drops its oldest frame (the peer's transport
//! retransmits it).
//!
//! The HTTP/1.1 messages are framed by hand over [`TcpStream`]s — request
//! line, headers, `Content-Length`-delimited octet body, one exchange per
//! connection. TLS termination, if any, is the deployment's business.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::carrier::{Carrier, Peer};
use crate::config::ObfsConfig;
use crate::error::{Error, Result};
use crate::transport::MAX_FRAME_SIZE;

const CLIENT_ID_HEADER: &str = "x-client-id";
const MAX_HEADER_LINE: usize = 1024;

#[derive(Default)]
struct ClientQueues {
    inbox: VecDeque<Bytes>,
    outbox: VecDeque<Bytes>,
}

struct TunnelState {
    clients: Mutex<HashMap<String, ClientQueues>>,
    /// Woken whenever a frame lands in any inbox.
    arrivals: Notify,
    queue_limit: usize,
}

/// Server side of the HTTP tunnel.
///
/// Owns the listener and a background accept loop; the [`Carrier`] methods
/// operate on the shared per-client queues the loop fills.
pub struct ObfsServerCarrier {
    state: Arc<TunnelState>,
    accept_task: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl ObfsServerCarrier {
    /// Bind the HTTP listener and start accepting tunnel connections.
    pub async fn bind(addr: SocketAddr, config: &ObfsConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let state = Arc::new(TunnelState {
            clients: Mutex::new(HashMap::new()),
            arrivals: Notify::new(),
            queue_limit: config.queue_limit,
        });

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let state = Arc::clone(&accept_state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_exchange(state, stream).await {
                                tracing::debug!(%remote, "tunnel exchange failed: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("tunnel accept error: {e}");
                    }
                }
            }
        });

        tracing::info!(%local_addr, "http tunnel listening");
        Ok(Self {
            state,
            accept_task,
            local_addr,
        })
    }

    /// The bound listener address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for ObfsServerCarrier {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[async_trait]
impl Carrier for ObfsServerCarrier {
    async fn send(&self, frame: &[u8], peer: &Peer) -> Result<()> {
        let Peer::Client(id) = peer else {
            return Err(Error::config("tunnel server requires a client-id peer"));
        };
        let mut clients = self.state.clients.lock();
        let queues = clients.entry(id.clone()).or_default();
        if queues.outbox.len() >= self.state.queue_limit {
            tracing::warn!(client = %id, "outbox full, dropping oldest frame");
            queues.outbox.pop_front();
        }
        queues.outbox.push_back(Bytes::copy_from_slice(frame));
        Ok(())
    }

    async fn recv(&self, wait: Duration) -> Result<(Bytes, Peer)> {
        let deadline = Instant::now() + wait;
        loop {
            {
                let mut clients = self.state.clients.lock();
                for (id, queues) in clients.iter_mut() {
                    if let Some(frame) = queues.inbox.pop_front() {
                        return Ok((frame, Peer::Client(id.clone())));
                    }
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            let _ = tokio::time::timeout(remaining, self.state.arrivals.notified()).await;
        }
    }

    async fn close(&self) {
        self.accept_task.abort();
    }
}

/// Serve one request/response exchange, then close the connection.
async fn handle_exchange(state: Arc<TunnelState>, stream: TcpStream) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let request = match read_request(&mut reader).await {
        Ok(request) => request,
        Err(e) => {
            write_response(reader.get_mut(), 400, &[]).await?;
            return Err(e);
        }
    };

    if request.method != "POST" || !matches!(request.path.as_str(), "/data" | "/poll") {
        write_response(reader.get_mut(), 404, &[]).await?;
        return Ok(());
    }
    let Some(client_id) = request.client_id else {
        write_response(reader.get_mut(), 400, &[]).await?;
        return Ok(());
    };

    let inbox_full = {
        let mut clients = state.clients.lock();
        let queues = clients.entry(client_id.clone()).or_default();
        !request.body.is_empty() && queues.inbox.len() >= state.queue_limit
    };
    if inbox_full {
        tracing::debug!(client = %client_id, "inbox full, refusing frame");
        return write_response(reader.get_mut(), 503, &[]).await;
    }

    let reply = {
        let mut clients = state.clients.lock();
        let queues = clients.entry(client_id.clone()).or_default();
        if !request.body.is_empty() {
            queues.inbox.push_back(Bytes::from(request.body));
        }
        queues.outbox.pop_front()
    };
    state.arrivals.notify_waiters();

    let body = reply.as_deref().unwrap_or(&[]);
    write_response(reader.get_mut(), 200, body).await
}

struct HttpRequest {
    method: String,
    path: String,
    client_id: Option<String>,
    body: Vec<u8>,
}

async fn read_request(reader: &mut BufReader<TcpStream>) -> Result<HttpRequest> {
    let request_line = read_header_line(reader).await?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| Error::unavailable("empty request line"))?
        .to_owned();
    let path = parts
        .next()
        .ok_or_else(|| Error::unavailable("request line without path"))?
        .to_owned();

    let mut client_id = None;
    let mut content_length = 0usize;
    loop {
        let line = read_header_line(reader).await?;
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();
        if name == CLIENT_ID_HEADER {
            client_id = Some(value.to_owned());
        } else if name == "content-length" {
            content_length = value
                .parse()
                .map_err(|_| Error::unavailable("bad content-length"))?;
        }
    }

    if content_length > MAX_FRAME_SIZE {
        return Err(Error::unavailable("body exceeds frame limit"));
    }
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;

    Ok(HttpRequest {
        method,
        path,
        client_id,
        body,
    })
}

async fn read_header_line(reader: &mut BufReader<TcpStream>) -> Result<String> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(Error::CarrierClosed);
    }
    if line.len() > MAX_HEADER_LINE {
        return Err(Error::unavailable("oversized header line"));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_owned())
}

async fn write_response(stream: &mut TcpStream, status: u16, body: &[u8]) -> Result<()> {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        503 => "Service Unavailable",
        _ => "Unknown",
    };
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: application/octet-stream\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

/// Client side of the HTTP tunnel.
///
/// `send` posts the frame to `/data`; `recv` serves buffered frames first
/// and otherwise polls `/poll` on the configured interval until the
/// deadline. One TCP connection per exchange.
pub struct ObfsClientCarrier {
    server: SocketAddr,
    client_id: String,
    poll_interval: Duration,
    pending: Mutex<VecDeque<Bytes>>,
}

impl ObfsClientCarrier {
    /// Create a tunnel client talking to `server`, identified by `client_id`.
    pub fn new(server: SocketAddr, client_id: impl Into<String>, config: &ObfsConfig) -> Self {
        Self {
            server,
            client_id: client_id.into(),
            poll_interval: config.poll_interval,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// The peer value that addresses the tunnel server.
    pub fn server_peer(&self) -> Peer {
        Peer::Socket(self.server)
    }

    /// One POST exchange; returns the response body frame, if any.
    async fn exchange(&self, path: &str, body: &[u8]) -> Result<Option<Bytes>> {
        let mut stream = TcpStream::connect(self.server)
            .await
            .map_err(|e| Error::unavailable(format!("tunnel connect: {e}")))?;

        let head = format!(
            "POST {path} HTTP/1.1\r\n\
             Host: {}\r\n\
             X-Client-Id: {}\r\n\
             Content-Type: application/octet-stream\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n",
            self.server, self.client_id,
            body.len()
        );
        stream.write_all(head.as_bytes()).await?;
        stream.write_all(body).await?;
        stream.flush().await?;

        let mut reader = BufReader::new(stream);
        let status_line = read_header_line(&mut reader).await?;
        let status: u16 = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::unavailable(format!("bad status line: {status_line}")))?;

        let mut content_length = 0usize;
        loop {
            let line = read_header_line(&mut reader).await?;
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.trim().eq_ignore_ascii_case("content-length") {
                    content_length = value
                        .trim()
                        .parse()
                        .map_err(|_| Error::unavailable("bad content-length"))?;
                }
            }
        }

        match status {
            200 => {}
            503 => return Err(Error::unavailable("server inbox full")),
            other => return Err(Error::unavailable(format!("tunnel status {other}"))),
        }

        if content_length == 0 {
            return Ok(None);
        }
        if content_length > MAX_FRAME_SIZE {
            return Err(Error::unavailable("response body exceeds frame limit"));
        }
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).await?;
        Ok(Some(Bytes::from(body)))
    }
}

#[async_trait]
impl Carrier for ObfsClientCarrier {
    async fn send(&self, frame: &[u8], _peer: &Peer) -> Result<()> {
        if let Some(reply) = self.exchange("/data", frame).await? {
            self.pending.lock().push_back(reply);
        }
        Ok(())
    }

    async fn recv(&self, wait: Duration) -> Result<(Bytes, Peer)> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(frame) = self.pending.lock().pop_front() {
                return Ok((frame, self.server_peer()));
            }
            match self.exchange("/poll", &[]).await {
                Ok(Some(frame)) => {
                    self.pending.lock().push_back(frame);
                    continue;
                }
                Ok(None) => {}
                // A transient server failure during a poll is the same as
                // silence; the deadline bounds how long we keep trying.
                Err(Error::CarrierUnavailable(reason)) => {
                    tracing::debug!("poll failed: {reason}");
                }
                Err(Error::Io(e)) => {
                    tracing::debug!("poll i/o error: {e}");
                }
                Err(e) => return Err(e),
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            tokio::time::sleep(remaining.min(self.poll_interval)).await;
        }
    }

    async fn close(&self) {
        // Connections are per-exchange; nothing persistent to shut down.
    }
}
