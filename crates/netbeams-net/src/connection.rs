//! Per-connection protocol state machine.
//!
//! A [`Connection`] owns one client stream and walks it through the BeamMP
//! handshake:
//!
//! ```text
//! Identify ─'C'─▶ Authenticate ─▶ Download ─"Done"─▶ MapLoad ─'H'─▶ Playing
//!    │'D'──────────────────────────▶ Download (then close)
//!    │'P'──▶ PingOnly (then close)
//! ```
//!
//! Any protocol error kicks the client (`"K" + reason`) and closes the stream.
//! Whatever happens, the slot reservation is released and the connection is
//! removed from the [`ConnectionMap`] when the state machine exits.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::Instrument;

use crate::auth::{AuthError, AuthGateway};
use crate::framing::{Frame, FrameError, FrameReader, encode};
use crate::player::Player;
use crate::settings::{ProtocolSettings, VersionCheck, parse_client_version};
use crate::slots::{Lease, SlotError, SlotManager};
use crate::tcp_server::{ConnectionHandle, ConnectionMap};

/// Read deadline while waiting for mod sync requests.
pub const MOD_SYNC_POLL: Duration = Duration::from_secs(1);

/// Pause between mod sync iterations.
pub const MOD_SYNC_PAUSE: Duration = Duration::from_millis(20);

/// Back-off after a gameplay read hits end of stream.
pub const EOF_BACKOFF: Duration = Duration::from_secs(1);

/// Kick reason used when the server stops.
pub const SHUTDOWN_REASON: &str = "Server shutting down";

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unknown,
    Identify,
    Authenticate,
    Password,
    Download,
    MapLoad,
    Playing,
    PingOnly,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a connection's state machine stopped.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("no free slot")]
    ServerFull,

    #[error("slot manager failure: {0}")]
    Slots(#[source] SlotError),

    #[error("unknown starting state {0:#04x}")]
    UnknownState(u8),

    #[error("read failed: {0}")]
    Read(#[source] FrameError),

    #[error("write failed: {0}")]
    Write(#[source] FrameError),

    #[error("unparseable client version {raw:?}")]
    VersionParse {
        raw: String,
        #[source]
        source: semver::Error,
    },

    #[error("client version {0} is below the minimum")]
    TooOld(semver::Version),

    #[error("client version {0} is at or above the maximum")]
    TooNew(semver::Version),

    #[error("auth key of {len} bytes exceeds {max}")]
    KeyTooLong { len: usize, max: usize },

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("slot refresh failed: {0}")]
    Reserve(#[source] SlotError),

    #[error("password authentication failed")]
    PasswordRejected,

    #[error("unknown mod sync request {0:?}")]
    UnknownRequest(String),

    #[error("empty frame during mod sync")]
    ModSync,

    #[error("slot reservation lapsed")]
    SessionExpired,

    #[error("gameplay read failed: {0}")]
    Gameplay(#[source] FrameError),
}

impl ConnectionError {
    /// The reason sent to the client in the kick frame.
    pub fn kick_reason(&self) -> &'static str {
        match self {
            Self::ServerFull => "Server is full",
            Self::Slots(_) => "The server is experiencing an error - Please try again later",
            Self::UnknownState(_) => "Unknown starting state",
            Self::Read(_) => "Unable to read data",
            Self::Write(_) | Self::Gameplay(_) => "Connection closed by server",
            Self::VersionParse { .. } => "Unable to parse version",
            Self::TooOld(_) => "Client version is too old",
            Self::TooNew(_) => "Client version is too new",
            Self::KeyTooLong { .. } => "Authentication key is too long",
            Self::Auth(_) | Self::PasswordRejected => "Unable to authenticate player",
            Self::Reserve(_) => "Unable to reserve slot",
            Self::UnknownRequest(_) => "The client sent an unknown request.",
            Self::ModSync => "Unable to sync mod data",
            Self::SessionExpired => "Session expired",
        }
    }
}

/// Shared collaborators every connection is built with.
pub struct ServerContext {
    pub settings: ProtocolSettings,
    pub slots: Arc<SlotManager>,
    pub auth: Arc<dyn AuthGateway>,
    pub connections: Arc<ConnectionMap>,
}

/// One client connection and its protocol cursor.
pub struct Connection<S> {
    peer: SocketAddr,
    reader: FrameReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    /// Encoded bytes not yet accepted by the writer. A frame cut short by a
    /// kick stays here and is finished before the kick frame goes out.
    outbox: BytesMut,
    ctx: Arc<ServerContext>,
    state: watch::Sender<ConnectionState>,
    kick_rx: watch::Receiver<Option<String>>,
    slot: Option<Lease>,
    player: Option<Arc<Player>>,
    span: tracing::Span,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap an accepted stream.
    ///
    /// The returned handle lets the listener observe the state and kick the
    /// connection from outside.
    pub fn new(stream: S, peer: SocketAddr, ctx: Arc<ServerContext>) -> (Self, ConnectionHandle) {
        let (reader, writer) = tokio::io::split(stream);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Unknown);
        let (kick_tx, kick_rx) = watch::channel(None);
        let span = tracing::info_span!("connection", %peer, player = tracing::field::Empty);

        let connection = Self {
            peer,
            reader: FrameReader::new(reader),
            writer,
            outbox: BytesMut::new(),
            ctx,
            state: state_tx,
            kick_rx,
            slot: None,
            player: None,
            span,
        };
        (connection, ConnectionHandle::new(kick_tx, state_rx))
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Run the state machine to completion, then clean up.
    pub async fn run(mut self) {
        let span = self.span.clone();
        async move {
            tracing::info!("Listening for messages");
            let mut kick_rx = self.kick_rx.clone();

            let kick = tokio::select! {
                result = self.drive() => match result {
                    Ok(()) => None,
                    Err(e) => {
                        tracing::warn!("Connection failed: {e}");
                        Some(e.kick_reason().to_string())
                    }
                },
                reason = wait_for_kick(&mut kick_rx) => Some(reason),
            };

            if let Some(reason) = kick {
                self.kick(&reason).await;
            }
            self.close().await;
        }
        .instrument(span)
        .await
    }

    async fn drive(&mut self) -> Result<(), ConnectionError> {
        self.set_state(ConnectionState::Identify);

        let code = self
            .reader
            .read_byte_timeout(self.ctx.settings.read_timeout)
            .await
            .map_err(ConnectionError::Read)?;
        tracing::debug!("Received starting state {:?}", code as char);

        let lease = self
            .ctx
            .slots
            .reserve_for_connection(None)
            .await
            .map_err(|e| match e {
                SlotError::ServerFull => ConnectionError::ServerFull,
                other => ConnectionError::Slots(other),
            })?;
        self.slot = Some(lease);

        match code {
            b'C' => {
                let lease = self.authenticate(lease).await?;
                self.sync_mod_data(lease).await?;
                self.load_map(lease).await?;
                self.play(lease).await
            }
            b'D' => self.sync_mod_data(lease).await,
            b'P' => {
                self.send(b"P").await?;
                self.set_state(ConnectionState::PingOnly);
                Ok(())
            }
            other => Err(ConnectionError::UnknownState(other)),
        }
    }

    async fn authenticate(&mut self, lease: Lease) -> Result<Lease, ConnectionError> {
        self.set_state(ConnectionState::Authenticate);
        let settings = &self.ctx.settings;

        let frame = self
            .reader
            .read_frame_timeout(settings.read_timeout)
            .await
            .map_err(ConnectionError::Read)?;
        let raw = String::from_utf8_lossy(frame.payload().get(2..).unwrap_or_default()).into_owned();
        let version = parse_client_version(&raw)
            .map_err(|source| ConnectionError::VersionParse { raw, source })?;

        match settings.versions.check(&version) {
            VersionCheck::Accepted => {}
            VersionCheck::TooOld => return Err(ConnectionError::TooOld(version)),
            VersionCheck::TooNew => return Err(ConnectionError::TooNew(version)),
        }
        tracing::debug!("Client version {version} - continuing authentication");
        self.send(b"A").await?;

        let key = self
            .reader
            .read_frame_timeout(self.ctx.settings.read_timeout)
            .await
            .map_err(ConnectionError::Read)?;
        let max = self.ctx.settings.max_key_length;
        if key.len() > max {
            return Err(ConnectionError::KeyTooLong {
                len: key.len(),
                max,
            });
        }

        let mut player = self.ctx.auth.authenticate(&key.text()).await?;
        tracing::info!("Changing logging context to {}", player.display_name);
        self.span.record("player", player.display_name.as_str());

        let lease = self
            .ctx
            .slots
            .reserve_for_connection(Some(lease))
            .await
            .map_err(ConnectionError::Reserve)?;
        self.slot = Some(lease);
        player.slot = Some(lease.id());
        player.address = Some(self.peer);

        let player = Arc::new(player);
        self.ctx
            .slots
            .bind_player(lease, Arc::clone(&player))
            .await
            .map_err(ConnectionError::Reserve)?;
        self.player = Some(player);

        if self.ctx.settings.password.is_some() {
            self.set_state(ConnectionState::Password);
            if !self.handle_password() {
                return Err(ConnectionError::PasswordRejected);
            }
        }
        Ok(lease)
    }

    /// Password-protected servers are not supported yet; every attempt fails.
    fn handle_password(&self) -> bool {
        tracing::warn!("Server password is set but password authentication is unsupported");
        false
    }

    async fn sync_mod_data(&mut self, lease: Lease) -> Result<(), ConnectionError> {
        self.set_state(ConnectionState::Download);

        let peers = self.ctx.connections.len().await.saturating_sub(1);
        self.send(format!("P{peers}").as_bytes()).await?;

        let grace = self.ctx.settings.mod_sync_grace;
        let mut last_frame = Instant::now();
        loop {
            match self.reader.read_frame_timeout(MOD_SYNC_POLL).await {
                Ok(frame) => {
                    last_frame = Instant::now();
                    if frame.is_empty() {
                        return Err(ConnectionError::ModSync);
                    }

                    match frame.code() {
                        Some(b'f') => tracing::trace!("Ignoring file request"),
                        Some(b'S') if frame.starts_with(b"SR") => {
                            // No mods are served, so the list is always empty.
                            self.send(b"-").await?;
                        }
                        Some(b'S') => {
                            return Err(ConnectionError::UnknownRequest(frame.text().into_owned()));
                        }
                        _ if frame.payload() == b"Done" => {
                            tracing::debug!("Client mod list synced");
                            return Ok(());
                        }
                        _ => tracing::debug!("Ignoring mod sync frame {:?}", frame.text()),
                    }
                }
                Err(FrameError::Timeout) if last_frame.elapsed() <= grace => {}
                Err(e) => return Err(ConnectionError::Read(e)),
            }

            if !self.ctx.slots.holds(lease).await {
                return Err(ConnectionError::SessionExpired);
            }
            tokio::time::sleep(MOD_SYNC_PAUSE).await;
        }
    }

    async fn load_map(&mut self, lease: Lease) -> Result<(), ConnectionError> {
        self.renew(self.ctx.slots.reserve_for_load(lease).await)?;
        self.set_state(ConnectionState::MapLoad);

        let map = Frame::command(b'M', &self.ctx.settings.map);
        self.send(map.payload()).await?;

        loop {
            match self.reader.read_frame_timeout(self.ctx.settings.read_timeout).await {
                Ok(frame) if frame.code() == Some(b'H') => break,
                Ok(frame) => tracing::warn!(
                    "Client may not be loaded - unrecognized map load response {:?}",
                    frame.text()
                ),
                Err(FrameError::Timeout) => {}
                Err(e) => return Err(ConnectionError::Read(e)),
            }

            if !self.ctx.slots.holds(lease).await {
                return Err(ConnectionError::SessionExpired);
            }
        }

        self.renew(self.ctx.slots.reserve_for_play(lease).await)?;
        self.set_state(ConnectionState::Playing);
        tracing::info!("Client is connected and loaded");
        Ok(())
    }

    async fn play(&mut self, lease: Lease) -> Result<(), ConnectionError> {
        let poll = self.ctx.settings.read_timeout;
        let idle_limit = self.ctx.settings.idle_limit;
        let mut last_activity = Instant::now();

        loop {
            match self.reader.read_frame_timeout(poll).await {
                Ok(frame) if frame.is_empty() => tracing::trace!("Empty frame"),
                Ok(frame) => {
                    last_activity = Instant::now();
                    parse_gameplay(&frame);
                }
                Err(FrameError::Timeout) => tracing::trace!("No data - still waiting"),
                Err(FrameError::ConnectionClosed) => tokio::time::sleep(EOF_BACKOFF).await,
                Err(e) => return Err(ConnectionError::Gameplay(e)),
            }

            if idle_limit.is_some_and(|limit| last_activity.elapsed() > limit) {
                tracing::info!("Client has been idle too long");
                return Err(ConnectionError::SessionExpired);
            }
            if !self.ctx.slots.holds(lease).await {
                return Err(ConnectionError::SessionExpired);
            }
        }
    }

    fn renew(&self, result: Result<Lease, SlotError>) -> Result<Lease, ConnectionError> {
        result.map_err(|e| match e {
            SlotError::NotReserved(_) => ConnectionError::SessionExpired,
            other => ConnectionError::Reserve(other),
        })
    }

    async fn send(&mut self, payload: &[u8]) -> Result<(), ConnectionError> {
        tracing::trace!("Writing {} bytes", payload.len());
        self.outbox.extend_from_slice(&encode(payload));
        self.flush_outbox().await.map_err(ConnectionError::Write)
    }

    /// Write out everything queued. Cancel safe: bytes the writer accepted are
    /// consumed from the outbox, the rest stays queued.
    async fn flush_outbox(&mut self) -> Result<(), FrameError> {
        self.writer.write_all_buf(&mut self.outbox).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Best-effort kick frame, queued behind whatever frame was still being
    /// written. Write errors are ignored; the stream is closed right after
    /// either way.
    async fn kick(&mut self, reason: &str) {
        tracing::info!(reason, "Kicking connection");
        let frame = Frame::command(b'K', reason);
        self.outbox.extend_from_slice(&frame.encode());

        let deadline = self.ctx.settings.read_timeout;
        match tokio::time::timeout(deadline, self.flush_outbox()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("Kick frame not delivered: {e}"),
            Err(_) => tracing::debug!("Kick frame not delivered within {deadline:?}"),
        }
    }

    async fn close(&mut self) {
        let _ = self.writer.shutdown().await;

        if let Some(lease) = self.slot.take() {
            self.ctx.slots.release(lease).await;
        }
        self.player = None;
        self.ctx.connections.remove(&self.peer).await;
        self.set_state(ConnectionState::Disconnected);
        tracing::info!("Connection closed");
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::info!("State changed from {previous} to {next}");
        }
    }
}

async fn wait_for_kick(rx: &mut watch::Receiver<Option<String>>) -> String {
    loop {
        if let Some(reason) = rx.borrow_and_update().clone() {
            return reason;
        }
        if rx.changed().await.is_err() {
            // Handle dropped; nobody can kick this connection any more.
            std::future::pending::<()>().await;
        }
    }
}

/// Gameplay payloads are not interpreted yet; they are only logged.
fn parse_gameplay(frame: &Frame) {
    tracing::debug!(
        code = ?frame.code().map(char::from),
        len = frame.len(),
        "Gameplay frame"
    );
}
