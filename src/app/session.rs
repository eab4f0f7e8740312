//! Session state machine.
//!
//! One [`Session`] drives one connection from `HELLO` through `BYE` on
//! either side of the wire. The phases move strictly forward:
//!
//! ```text
//! INIT → HELLO_SENT → MODE_SELECTED → [KEY_EXCHANGED] → READY → CLOSING → CLOSED
//! ```
//!
//! The session never retries anything itself — reliability is entirely the
//! transport's job. It reacts to invalid input (wrong message for the
//! phase, decode failure, decryption failure) by sending a single `ERROR`
//! and closing.

use std::collections::VecDeque;
use std::time::Duration;

use crate::app::crypto::{PayloadCipher, SessionKey};
use crate::app::message::{Message, ERR_CRYPTO, ERR_MODE_MISMATCH};
use crate::carrier::{Carrier, Peer};
use crate::config::Mode;
use crate::error::{Error, Result};
use crate::transport::{Endpoint, ShutdownHandle, TransferStats};

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Nothing exchanged yet.
    Init,
    /// Client sent `HELLO`, awaiting the server's.
    HelloSent,
    /// Mode agreed.
    ModeSelected,
    /// Session key installed (secure modes only).
    KeyExchanged,
    /// Data phase: chat may flow both ways.
    Ready,
    /// Farewell in progress.
    Closing,
    /// Session is over.
    Closed,
}

/// Something the peer did that the caller should see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The peer sent a chat message.
    Chat {
        /// Sender identity from the message.
        sender: String,
        /// Message body.
        text: String,
    },
    /// The peer said goodbye; the session is closed.
    Bye {
        /// Optional reason the peer gave.
        reason: Option<String>,
    },
    /// The peer reported a protocol error; the session is closed.
    PeerError {
        /// Machine-readable code.
        code: String,
        /// Human-readable detail.
        detail: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

/// One side of an application session over a reliable endpoint.
pub struct Session<C: Carrier> {
    endpoint: Endpoint<C>,
    role: Role,
    mode: Mode,
    identity: String,
    peer_identity: Option<String>,
    phase: SessionPhase,
    cipher: Option<PayloadCipher>,
    /// How long to wait for the peer's next application reply: the full
    /// ARQ budget of one frame, so a slow-but-alive transport is not
    /// mistaken for a dead peer.
    reply_wait: Duration,
    /// Events observed while waiting for something else.
    pending: VecDeque<SessionEvent>,
}

impl<C: Carrier> Session<C> {
    /// Create the client side of a session.
    pub fn client(endpoint: Endpoint<C>, mode: Mode, identity: impl Into<String>) -> Self {
        Self::new(endpoint, Role::Client, mode, identity.into())
    }

    /// Create the server side of a session.
    pub fn server(endpoint: Endpoint<C>, mode: Mode, identity: impl Into<String>) -> Self {
        Self::new(endpoint, Role::Server, mode, identity.into())
    }

    fn new(endpoint: Endpoint<C>, role: Role, mode: Mode, identity: String) -> Self {
        let config = endpoint.config();
        let reply_wait = config.timeout * config.max_retries;
        Self {
            endpoint,
            role,
            mode,
            identity,
            peer_identity: None,
            phase: SessionPhase::Init,
            cipher: None,
            reply_wait,
            pending: VecDeque::new(),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// The negotiated mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The peer's announced identity, once `HELLO`s have been exchanged.
    pub fn peer_identity(&self) -> Option<&str> {
        self.peer_identity.as_deref()
    }

    /// Transport transfer counters.
    pub fn stats(&self) -> TransferStats {
        self.endpoint.stats()
    }

    /// Handle for aborting the session's blocking operations.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.endpoint.shutdown_handle()
    }

    /// Return the session to a clean state so the endpoint can serve a new
    /// peer (server side, after [`SessionPhase::Closed`]).
    pub fn reset(&mut self) {
        self.endpoint.reset();
        self.cipher = None;
        self.peer_identity = None;
        self.phase = SessionPhase::Init;
        self.pending.clear();
    }

    /// Run the client half of the handshake against `peer`.
    ///
    /// On success the session is [`SessionPhase::Ready`]. A mode rejection
    /// surfaces as [`Error::Peer`] carrying the server's `MODE_MISMATCH`
    /// code.
    pub async fn connect(&mut self, peer: Peer) -> Result<()> {
        if self.role != Role::Client || self.phase != SessionPhase::Init {
            return Err(Error::handshake("connect is a client operation from INIT"));
        }

        self.endpoint.connect(peer).await?;

        self.send_message(&Message::Hello {
            client_id: self.identity.clone(),
            version: crate::APP_VERSION.to_owned(),
        })
        .await?;
        self.phase = SessionPhase::HelloSent;

        match self.recv_reply().await? {
            Message::Hello { client_id, version } => {
                tracing::info!(server = %client_id, %version, "server greeted us");
                self.peer_identity = Some(client_id);
            }
            Message::Error { code, detail } => return self.fail_from_peer(code, detail).await,
            other => return self.abort_protocol(unexpected("HELLO", &other)).await,
        }

        self.send_message(&Message::ModeSelect { mode: self.mode }).await?;
        match self.recv_reply().await? {
            Message::ModeSelect { mode } if mode == self.mode => {
                tracing::info!(%mode, "mode negotiated");
            }
            Message::Error { code, detail } => return self.fail_from_peer(code, detail).await,
            other => return self.abort_protocol(unexpected("MODE_SELECT", &other)).await,
        }
        self.phase = SessionPhase::ModeSelected;

        if self.mode.is_secure() {
            match self.recv_reply().await? {
                Message::KeyExchange { key } => {
                    let key = SessionKey::from_base64(&key)?;
                    self.cipher = Some(PayloadCipher::new(key));
                    self.phase = SessionPhase::KeyExchanged;
                    tracing::info!("session key installed, payloads encrypted from here on");
                }
                Message::Error { code, detail } => return self.fail_from_peer(code, detail).await,
                other => return self.abort_protocol(unexpected("KEY_EXCHANGE", &other)).await,
            }
        }

        self.phase = SessionPhase::Ready;
        Ok(())
    }

    /// Run the server half of the handshake. Blocks in the transport
    /// accept until a client arrives; returns the client's identity once
    /// the session is [`SessionPhase::Ready`].
    pub async fn accept(&mut self) -> Result<String> {
        if self.role != Role::Server || self.phase != SessionPhase::Init {
            return Err(Error::handshake("accept is a server operation from INIT"));
        }

        let peer = self.endpoint.accept().await?;
        tracing::info!(%peer, "transport connection up, expecting HELLO");

        let client_id = match self.recv_reply().await? {
            Message::Hello { client_id, version } => {
                tracing::info!(client = %client_id, %version, "client greeted us");
                self.peer_identity = Some(client_id.clone());
                client_id
            }
            other => return self.abort_protocol(unexpected("HELLO", &other)).await.map(|_| String::new()),
        };
        self.send_message(&Message::Hello {
            client_id: self.identity.clone(),
            version: crate::APP_VERSION.to_owned(),
        })
        .await?;

        match self.recv_reply().await? {
            Message::ModeSelect { mode: requested } => {
                if requested != self.mode {
                    tracing::warn!(%requested, configured = %self.mode, "mode mismatch, rejecting");
                    let detail =
                        format!("server is configured for {}, not {requested}", self.mode);
                    let _ = self
                        .send_message(&Message::Error {
                            code: ERR_MODE_MISMATCH.to_owned(),
                            detail,
                        })
                        .await;
                    self.shut_transport().await;
                    return Err(Error::ModeMismatch {
                        requested: requested.to_string(),
                        configured: self.mode.to_string(),
                    });
                }
                self.send_message(&Message::ModeSelect { mode: self.mode }).await?;
                tracing::info!(mode = %self.mode, "mode negotiated");
            }
            other => {
                return self
                    .abort_protocol(unexpected("MODE_SELECT", &other))
                    .await
                    .map(|_| String::new())
            }
        }
        self.phase = SessionPhase::ModeSelected;

        if self.mode.is_secure() {
            let key = SessionKey::random();
            // The key itself travels in cleartext; only what follows is
            // protected. Known protocol limitation.
            self.send_message(&Message::KeyExchange {
                key: key.to_base64(),
            })
            .await?;
            self.cipher = Some(PayloadCipher::new(key));
            self.phase = SessionPhase::KeyExchanged;
            tracing::info!("session key issued, payloads encrypted from here on");
        }

        self.phase = SessionPhase::Ready;
        Ok(client_id)
    }

    /// Send one chat message and wait briefly for the peer's advisory
    /// `ACK_MSG`. Its absence is logged, not fatal — delivery was already
    /// guaranteed by the transport acknowledgment.
    pub async fn send_chat(&mut self, text: impl Into<String>) -> Result<()> {
        if self.phase != SessionPhase::Ready {
            return Err(Error::handshake(format!(
                "cannot chat in phase {:?}",
                self.phase
            )));
        }

        self.send_message(&Message::Chat {
            text: text.into(),
            sender: self.identity.clone(),
        })
        .await?;

        match self.recv_message(self.reply_wait).await {
            Ok(Message::ChatAck { .. }) => {}
            Ok(other) => {
                if let Some(event) = self.digest(other).await? {
                    self.pending.push_back(event);
                }
            }
            Err(Error::Timeout) => {
                tracing::debug!("peer sent no application-level ack");
            }
            Err(e) => return Err(self.handle_recv_failure(e).await),
        }
        Ok(())
    }

    /// Wait up to `wait` for something from the peer.
    ///
    /// `Ok(None)` means the window passed quietly (or the session is
    /// already closed); errors mean the session had to shut down.
    pub async fn poll(&mut self, wait: Duration) -> Result<Option<SessionEvent>> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }
        if matches!(self.phase, SessionPhase::Closing | SessionPhase::Closed) {
            return Ok(None);
        }

        match self.recv_message(wait).await {
            Ok(message) => self.digest(message).await,
            Err(Error::Timeout) => Ok(None),
            Err(Error::CarrierClosed) | Err(Error::Cancelled) => {
                tracing::info!("transport gone, session over");
                self.phase = SessionPhase::Closed;
                Ok(None)
            }
            Err(e) => Err(self.handle_recv_failure(e).await),
        }
    }

    /// Say goodbye and tear the transport down.
    pub async fn bye(&mut self, reason: Option<String>) -> Result<()> {
        if self.phase == SessionPhase::Ready {
            self.phase = SessionPhase::Closing;
            if self.send_message(&Message::Bye { reason }).await.is_ok() {
                // Give the peer a moment to echo the farewell.
                match self.recv_message(self.reply_wait).await {
                    Ok(Message::Bye { .. }) => {}
                    Ok(other) => {
                        tracing::debug!(kind = other.kind(), "ignoring message during farewell");
                    }
                    Err(_) => {}
                }
            }
        }
        self.shut_transport().await;
        let stats = self.endpoint.stats();
        tracing::info!(
            frames_sent = stats.frames_sent,
            frames_received = stats.frames_received,
            retransmissions = stats.retransmissions,
            "session closed"
        );
        Ok(())
    }

    /// React to one decoded message during the data phase.
    async fn digest(&mut self, message: Message) -> Result<Option<SessionEvent>> {
        match message {
            Message::Chat { text, sender } => {
                self.send_message(&Message::ChatAck { msg_id: None }).await?;
                Ok(Some(SessionEvent::Chat { sender, text }))
            }
            Message::ChatAck { .. } => Ok(None),
            Message::Bye { reason } => {
                tracing::info!("peer said goodbye");
                self.phase = SessionPhase::Closing;
                let _ = self.send_message(&Message::Bye { reason: None }).await;
                self.shut_transport().await;
                Ok(Some(SessionEvent::Bye { reason }))
            }
            Message::Error { code, detail } => {
                tracing::warn!(%code, %detail, "peer reported an error");
                self.shut_transport().await;
                Ok(Some(SessionEvent::PeerError { code, detail }))
            }
            other => {
                self.abort_protocol(unexpected("MSG, ACK_MSG, ERROR or BYE", &other))
                    .await
                    .map(|_| None)
            }
        }
    }

    /// Serialize, optionally encrypt, and hand to the transport.
    async fn send_message(&mut self, message: &Message) -> Result<()> {
        let mut payload = message.encode()?;
        if let Some(cipher) = &self.cipher {
            payload = cipher.encrypt(&payload);
        }
        tracing::debug!(kind = message.kind(), len = payload.len(), "sending message");
        self.endpoint.send(&payload).await
    }

    /// Receive, optionally decrypt, and decode one message.
    async fn recv_message(&mut self, wait: Duration) -> Result<Message> {
        let payload = self.endpoint.recv(wait).await?;
        let plaintext = match &self.cipher {
            Some(cipher) => cipher.decrypt(&payload)?,
            None => payload.to_vec(),
        };
        let message = Message::decode(&plaintext)?;
        tracing::debug!(kind = message.kind(), "received message");
        Ok(message)
    }

    /// Receive the peer's next handshake reply, converting failures into
    /// the protocol's ERROR-and-close behavior.
    async fn recv_reply(&mut self) -> Result<Message> {
        match self.recv_message(self.reply_wait).await {
            Ok(message) => Ok(message),
            Err(e) => Err(self.handle_recv_failure(e).await),
        }
    }

    /// Map a receive failure onto the protocol's ERROR-and-close behavior,
    /// returning the error to surface to the caller.
    async fn handle_recv_failure(&mut self, e: Error) -> Error {
        match e {
            Error::Crypto(detail) => {
                let _ = self
                    .send_message(&Message::Error {
                        code: ERR_CRYPTO.to_owned(),
                        detail: detail.clone(),
                    })
                    .await;
                self.shut_transport().await;
                Error::Crypto(detail)
            }
            Error::MessageInvalid(detail) => {
                let _ = self.send_message(&Message::protocol_error(detail.clone())).await;
                self.shut_transport().await;
                Error::MessageInvalid(detail)
            }
            other => {
                self.shut_transport().await;
                other
            }
        }
    }

    /// The peer told us the session is over; close our side and surface
    /// its error.
    async fn fail_from_peer(&mut self, code: String, detail: String) -> Result<()> {
        tracing::warn!(%code, %detail, "peer rejected the session");
        self.shut_transport().await;
        Err(Error::Peer { code, detail })
    }

    /// We cannot continue; tell the peer why and close.
    async fn abort_protocol(&mut self, detail: String) -> Result<()> {
        tracing::warn!(%detail, "protocol violation, closing");
        let _ = self.send_message(&Message::protocol_error(detail.clone())).await;
        self.shut_transport().await;
        Err(Error::Handshake(detail))
    }

    async fn shut_transport(&mut self) {
        if self.phase != SessionPhase::Closed {
            self.phase = SessionPhase::Closing;
            if let Err(e) = self.endpoint.close().await {
                tracing::debug!("transport teardown: {e}");
            }
            self.phase = SessionPhase::Closed;
        }
    }
}

fn unexpected(wanted: &str, got: &Message) -> String {
    format!("expected {wanted}, got {}", got.kind())
}
