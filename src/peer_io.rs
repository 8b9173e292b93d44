//! Per-connection peer I/O core.
//!
//! [`PeerIo`] is the actor that owns one [`BufferedSocket`] exclusively
//! and is driven by exactly one task ([`PeerIo::run`]); "must run on the
//! event-loop thread" holds by construction rather than by a runtime
//! check, since no `&mut PeerIo<T>` ever escapes the task it was moved
//! into. [`PeerIoHandle`] is the `Send + Sync` sibling other threads hold:
//! it can request `close()` and read the plain accessors without touching
//! the socket.

use std::io::Cursor;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, trace, warn};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::buffered_socket::{BufferedSocket, SocketError, SocketEvent};
use crate::cipher::{CipherPair, EncryptionMode, InfoHash, HASH_LEN};
use crate::config::PeerIoConfig;
use crate::error::PeerIoError;
use crate::transport::Transport;

/// Which side initiated the TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Remote peer's 20-byte self-chosen identifier.
pub type PeerId = [u8; HASH_LEN];

/// Return code a read callback hands back to the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadControl {
    /// Progress made; wait for more bytes before calling again.
    More,
    /// Progress made and more input may already be buffered; call again now.
    Again,
    /// Cannot proceed (waiting on an external condition); do not re-invoke
    /// until the next readable event.
    Done,
}

/// Protocol capability flags the peer-message layer toggles once
/// negotiated: the extension protocol (LTEP) and the fast extension
/// (FEXT).
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub ltep: bool,
    pub fext: bool,
}

type ReadCallback<T> = Box<dyn FnMut(&mut PeerIo<T>) -> ReadControl + Send>;
type WriteCallback<T> = Box<dyn FnMut(&mut PeerIo<T>) + Send>;
type ErrorCallback<T> = Box<dyn FnMut(&mut PeerIo<T>, PeerIoError) + Send>;

#[derive(Default)]
struct Callbacks<T: Transport> {
    read: Option<ReadCallback<T>>,
    write: Option<WriteCallback<T>>,
    error: Option<ErrorCallback<T>>,
}

impl<T: Transport> Callbacks<T> {
    fn clear(&mut self) {
        self.read = None;
        self.write = None;
        self.error = None;
    }
}

/// Process-wide lock the read-loop holds across a whole read-again
/// sequence. A single, non-recursive `tokio::sync::Mutex`: the dispatcher
/// acquires it once per [`PeerIo::dispatch_read_loop`] invocation and
/// never re-enters, so recursion is structurally impossible rather than
/// merely disallowed.
pub type SessionLock = Arc<tokio::sync::Mutex<()>>;

/// Builds a fresh, unshared [`SessionLock`]. Callers that run many
/// [`PeerIo`]s in one process should construct one `SessionLock` and
/// share it across all of them, so read dispatch across the whole
/// process serializes on a single lock.
pub fn new_session_lock() -> SessionLock {
    Arc::new(tokio::sync::Mutex::new(()))
}

/// Cross-thread-safe snapshot of the bits of [`PeerIo`] state that are
/// reachable without touching the socket, plus the notify/close-flag pair
/// that makes [`PeerIoHandle::close`] safe from any thread.
struct Shared {
    direction: Direction,
    remote_addr: Ipv4Addr,
    remote_port: u16,
    created_at: Instant,
    bytes_from_peer: AtomicU64,
    output_bytes_waiting: AtomicU64,
    ltep: AtomicBool,
    fext: AtomicBool,
    encryption_stream: AtomicBool,
    has_torrent_hash: AtomicBool,
    peer_id: Mutex<Option<PeerId>>,
    closed: AtomicBool,
    close_notify: Notify,
}

/// One TCP peer connection: owns the socket, the [`BufferedSocket`], the
/// cipher pair, and the three installed callbacks.
pub struct PeerIo<T: Transport> {
    buffered: BufferedSocket<T>,
    crypto: CipherPair,
    peer_id: Option<PeerId>,
    caps: Capabilities,
    idle_timeout: Duration,
    config: PeerIoConfig,
    callbacks: Callbacks<T>,
    session_lock: SessionLock,
    shared: Arc<Shared>,
}

/// Cheaply clonable, `Send + Sync` counterpart to [`PeerIo`]. Lets other
/// threads request teardown or read status without synchronizing with
/// the single task that owns the socket.
#[derive(Clone)]
pub struct PeerIoHandle {
    shared: Arc<Shared>,
}

impl<T: Transport> PeerIo<T> {
    fn new(
        direction: Direction,
        transport: T,
        remote_addr: Ipv4Addr,
        remote_port: u16,
        info_hash: Option<InfoHash>,
        config: PeerIoConfig,
        session_lock: SessionLock,
    ) -> Self {
        let is_incoming = direction == Direction::Inbound;
        let shared = Arc::new(Shared {
            direction,
            remote_addr,
            remote_port,
            created_at: Instant::now(),
            bytes_from_peer: AtomicU64::new(0),
            output_bytes_waiting: AtomicU64::new(0),
            ltep: AtomicBool::new(false),
            fext: AtomicBool::new(false),
            encryption_stream: AtomicBool::new(false),
            has_torrent_hash: AtomicBool::new(info_hash.is_some()),
            peer_id: Mutex::new(None),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        });
        Self {
            buffered: BufferedSocket::new(transport, config.read_watermark_high(), config.idle_timeout()),
            crypto: CipherPair::new(is_incoming, info_hash),
            peer_id: None,
            caps: Capabilities::default(),
            idle_timeout: config.idle_timeout(),
            config,
            callbacks: Callbacks::default(),
            session_lock,
            shared,
        }
    }

    /// Opens a fresh outbound TCP connection and wraps it. Returns `None`
    /// on connect failure.
    pub async fn new_outgoing(
        addr: Ipv4Addr,
        port: u16,
        torrent_hash: InfoHash,
        config: PeerIoConfig,
        session_lock: SessionLock,
    ) -> Option<Self> {
        let transport = match T::connect(addr, port).await {
            Ok(t) => t,
            Err(e) => {
                warn!("outbound connect to {addr}:{port} failed: {e}");
                return None;
            }
        };
        if let Err(e) = transport.set_tos(config.tos()) {
            warn!("failed to set ToS on outbound socket to {addr}:{port}: {e}");
        }
        debug!("outbound peer connection established to {addr}:{port}");
        Some(Self::new(
            Direction::Outbound,
            transport,
            addr,
            port,
            Some(torrent_hash),
            config,
            session_lock,
        ))
    }

    /// Adopts an already-accepted socket. The torrent hash is unknown
    /// until [`PeerIo::set_torrent_hash`] is called once the remote's
    /// handshake identifies the swarm.
    pub fn new_incoming(
        transport: T,
        addr: Ipv4Addr,
        port: u16,
        config: PeerIoConfig,
        session_lock: SessionLock,
    ) -> Self {
        debug!("inbound peer connection accepted from {addr}:{port}");
        Self::new(Direction::Inbound, transport, addr, port, None, config, session_lock)
    }

    /// A `Send + Sync` handle that can `close()` this connection and read
    /// its plain accessors from any thread.
    pub fn handle(&self) -> PeerIoHandle {
        PeerIoHandle {
            shared: self.shared.clone(),
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    // ---- callback installation ---------------------------------------

    /// Installs the three callbacks, then immediately drains a
    /// pre-buffered input (e.g. handshake prologue bytes read before the
    /// peer-message layer was ready) through `read_cb` exactly once, if
    /// and only if the input buffer is already non-empty.
    pub async fn set_io_funcs(
        &mut self,
        read_cb: impl FnMut(&mut PeerIo<T>) -> ReadControl + Send + 'static,
        write_cb: impl FnMut(&mut PeerIo<T>) + Send + 'static,
        error_cb: impl FnMut(&mut PeerIo<T>, PeerIoError) + Send + 'static,
    ) {
        self.callbacks.read = Some(Box::new(read_cb));
        self.callbacks.write = Some(Box::new(write_cb));
        self.callbacks.error = Some(Box::new(error_cb));
        debug!("io callbacks installed for {}", self.addr_string());
        if self.buffered.input_len() > 0 {
            self.dispatch_read_loop().await;
        }
    }

    async fn dispatch_read_loop(&mut self) {
        let _guard = self.session_lock.clone().lock_owned().await;
        loop {
            if self.is_closed() {
                return;
            }
            let Some(mut cb) = self.callbacks.read.take() else {
                return;
            };
            let control = cb(self);
            if self.is_closed() {
                return;
            }
            self.callbacks.read = Some(cb);
            trace!("read_cb returned {control:?}");
            match control {
                ReadControl::More | ReadControl::Done => return,
                ReadControl::Again => {
                    if self.buffered.input_len() == 0 {
                        return;
                    }
                }
            }
        }
    }

    fn dispatch_write(&mut self) {
        if self.is_closed() {
            return;
        }
        if let Some(mut cb) = self.callbacks.write.take() {
            cb(self);
            if !self.is_closed() {
                self.callbacks.write = Some(cb);
            }
        }
    }

    fn dispatch_error(&mut self, err: SocketError) {
        let peer_err = match err {
            SocketError::Timeout => {
                warn!("peer {} idle timeout fired", self.addr_string());
                PeerIoError::Timeout(self.idle_timeout)
            }
            SocketError::Eof => {
                debug!("peer {} closed the connection", self.addr_string());
                PeerIoError::Eof
            }
            SocketError::Io(e) => {
                warn!("peer {} I/O error: {e}", self.addr_string());
                PeerIoError::Io(e)
            }
        };
        if self.is_closed() {
            return;
        }
        if let Some(mut cb) = self.callbacks.error.take() {
            cb(self, peer_err);
            if !self.is_closed() {
                self.callbacks.error = Some(cb);
            }
        }
    }

    /// Drives this connection's callbacks until `close()` is observed.
    /// Intended to be `tokio::spawn`ed once per accepted/dialed
    /// connection; this task *is* the "event-loop thread" the rest of
    /// the core's doc comments refer to.
    /// Runs one readable/writable/error tick and dispatches the matching
    /// callback. Returns `false` once `close()` has taken effect, `true`
    /// otherwise. [`PeerIo::run`] is a thin loop around this; exposed
    /// directly for consumers that want to fold several connections into
    /// one hand-rolled `select!` rather than spawning a task per peer.
    pub async fn poll_once(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut saw_error = false;
        tokio::select! {
            biased;
            _ = self.shared.close_notify.notified() => {}
            event = self.buffered.next_event() => {
                match event {
                    SocketEvent::Readable => self.dispatch_read_loop().await,
                    SocketEvent::Writable => self.dispatch_write(),
                    SocketEvent::Error(e) => {
                        self.dispatch_error(e);
                        saw_error = true;
                    }
                }
                self.shared
                    .output_bytes_waiting
                    .store(self.buffered.output_len() as u64, Ordering::Release);
            }
        }
        !saw_error && !self.is_closed()
    }

    /// Drives this connection's callbacks until `close()` is observed.
    /// Intended to be `tokio::spawn`ed once per accepted/dialed
    /// connection; this task *is* the "event-loop thread" the rest of
    /// the core's doc comments refer to.
    pub async fn run(mut self) {
        while self.poll_once().await {}
        debug!("tearing down peer connection {}", self.addr_string());
        // self drops here: BufferedSocket/transport/cipher freed together.
    }

    // ---- encrypted byte pipeline --------------------------------------

    /// Encrypts (if `encryption_mode() == Stream`) and queues `src` for
    /// output.
    pub fn write_bytes(&mut self, src: &[u8]) {
        match self.crypto.mode() {
            EncryptionMode::None => self.buffered.queue_output(src),
            EncryptionMode::Stream => {
                let mut scratch = src.to_vec();
                self.crypto.encrypt(&mut scratch);
                self.buffered.queue_output(&scratch);
            }
        }
        self.shared
            .output_bytes_waiting
            .store(self.buffered.output_len() as u64, Ordering::Release);
    }

    /// Drains exactly `n` bytes of buffered input, decrypting in place if
    /// `encryption_mode() == Stream`. Panics if fewer than `n` bytes are
    /// buffered; callers are expected to check [`PeerIo::input_bytes_available`]
    /// first.
    pub fn read_bytes(&mut self, n: usize) -> BytesMut {
        let mut bytes = self.buffered.take_input(n);
        if self.crypto.mode() == EncryptionMode::Stream {
            self.crypto.decrypt(&mut bytes[..]);
        }
        self.account_bytes_from_peer(n);
        bytes
    }

    /// Discards `n` bytes of buffered input without returning them, still
    /// advancing the receive keystream in `Stream` mode so a dropped
    /// message cannot desynchronise the cipher.
    pub fn drain(&mut self, n: usize) {
        let mut bytes = self.buffered.take_input(n);
        if self.crypto.mode() == EncryptionMode::Stream {
            self.crypto.decrypt(&mut bytes[..]);
        }
        self.account_bytes_from_peer(n);
    }

    fn account_bytes_from_peer(&mut self, n: usize) {
        self.shared
            .bytes_from_peer
            .fetch_add(n as u64, Ordering::AcqRel);
    }

    pub fn read_u8(&mut self) -> u8 {
        self.read_bytes(1)[0]
    }

    pub fn read_u16(&mut self) -> u16 {
        let bytes = self.read_bytes(2);
        Cursor::new(&bytes).read_u16::<BigEndian>().unwrap()
    }

    pub fn read_u32(&mut self) -> u32 {
        let bytes = self.read_bytes(4);
        Cursor::new(&bytes).read_u32::<BigEndian>().unwrap()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.write_bytes(&[value]);
    }

    pub fn write_u16(&mut self, value: u16) {
        let mut buf = Vec::with_capacity(2);
        buf.write_u16::<BigEndian>(value).unwrap();
        self.write_bytes(&buf);
    }

    pub fn write_u32(&mut self, value: u32) {
        let mut buf = Vec::with_capacity(4);
        buf.write_u32::<BigEndian>(value).unwrap();
        self.write_bytes(&buf);
    }

    /// Injects `src` directly into the output buffer, bypassing
    /// encryption entirely. Reserved for the handshake prologue, which
    /// precedes key exchange.
    pub fn write(&mut self, src: &[u8]) {
        self.buffered.queue_output(src);
        self.shared
            .output_bytes_waiting
            .store(self.buffered.output_len() as u64, Ordering::Release);
    }

    /// Copies `buf`'s contents out via [`PeerIo::write`] and clears it.
    pub fn write_buf(&mut self, buf: &mut BytesMut) {
        self.write(buf);
        buf.clear();
    }

    // ---- reconnect / timeout -------------------------------------------

    /// Re-dials the same `(addr, port)`, replacing the socket and the
    /// `BufferedSocket`. The cipher pair, counters, capability flags, and
    /// `created_at` survive unchanged. Only valid for outbound
    /// connections.
    pub async fn reconnect(&mut self) -> Result<(), PeerIoError> {
        if self.shared.direction != Direction::Outbound {
            return Err(PeerIoError::NotOutbound);
        }
        let transport = T::connect(self.shared.remote_addr, self.shared.remote_port)
            .await
            .map_err(PeerIoError::Connect)?;
        if let Err(e) = transport.set_tos(self.config.tos()) {
            warn!("failed to set ToS after reconnect: {e}");
        }
        self.buffered = BufferedSocket::new(
            transport,
            self.config.read_watermark_high(),
            self.idle_timeout,
        );
        debug!("reconnected to {}", self.addr_string());
        Ok(())
    }

    /// Updates the idle timeout on the underlying `BufferedSocket` and
    /// re-enables both read and write directions.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.idle_timeout = timeout;
        self.buffered.set_timeout(timeout);
    }

    // ---- teardown -------------------------------------------------------

    /// Clears all three callback slots so no further dispatch can find a
    /// live callback, then breaks the `run()` loop at its next wakeup.
    /// Safe to call from inside a callback (the in-flight dispatch
    /// completes and returns normally) or from any other thread via
    /// [`PeerIoHandle::close`].
    pub fn close(&mut self) {
        self.callbacks.clear();
        self.shared.closed.store(true, Ordering::Release);
        self.shared.close_notify.notify_one();
    }

    // ---- accessors --------------------------------------------------

    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    pub fn remote_addr(&self) -> Ipv4Addr {
        self.shared.remote_addr
    }

    pub fn remote_port(&self) -> u16 {
        self.shared.remote_port
    }

    /// `"<dotted-quad>:<port-decimal>"`.
    pub fn addr_string(&self) -> String {
        format!("{}:{}", self.shared.remote_addr, self.shared.remote_port)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.shared.remote_addr.into(), self.shared.remote_port)
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer_id
    }

    pub fn has_peer_id(&self) -> bool {
        self.peer_id.is_some()
    }

    pub fn set_peer_id(&mut self, peer_id: PeerId) {
        self.peer_id = Some(peer_id);
        *self.shared.peer_id.lock().unwrap() = Some(peer_id);
    }

    pub fn clear_peer_id(&mut self) {
        self.peer_id = None;
        *self.shared.peer_id.lock().unwrap() = None;
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    pub fn set_ltep(&mut self, supported: bool) {
        self.caps.ltep = supported;
        self.shared.ltep.store(supported, Ordering::Release);
    }

    pub fn set_fext(&mut self, supported: bool) {
        self.caps.fext = supported;
        self.shared.fext.store(supported, Ordering::Release);
    }

    pub fn encryption_mode(&self) -> EncryptionMode {
        self.crypto.mode()
    }

    pub fn set_encryption_mode(&mut self, mode: EncryptionMode) {
        self.crypto.set_mode(mode);
        self.shared
            .encryption_stream
            .store(mode == EncryptionMode::Stream, Ordering::Release);
    }

    pub fn has_torrent_hash(&self) -> bool {
        self.crypto.has_torrent_hash()
    }

    pub fn torrent_hash(&self) -> Option<InfoHash> {
        self.crypto.torrent_hash()
    }

    /// Installs the info-hash once an inbound handshake identifies the
    /// swarm.
    pub fn set_torrent_hash(&mut self, info_hash: InfoHash) {
        self.crypto.set_torrent_hash(info_hash);
        self.shared.has_torrent_hash.store(true, Ordering::Release);
    }

    pub fn age(&self) -> Duration {
        self.shared.created_at.elapsed()
    }

    pub fn bytes_from_peer(&self) -> u64 {
        self.shared.bytes_from_peer.load(Ordering::Acquire)
    }

    pub fn output_bytes_waiting(&self) -> usize {
        self.buffered.output_len()
    }

    /// Bytes currently buffered and not yet handed to `read_cb`. Lets a
    /// read callback decide it has enough for a full message before
    /// calling [`PeerIo::read_bytes`].
    pub fn input_bytes_available(&self) -> usize {
        self.buffered.input_len()
    }
}

impl PeerIoHandle {
    /// Requests teardown from any thread. Idempotent.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.close_notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    pub fn remote_addr(&self) -> Ipv4Addr {
        self.shared.remote_addr
    }

    pub fn remote_port(&self) -> u16 {
        self.shared.remote_port
    }

    pub fn addr_string(&self) -> String {
        format!("{}:{}", self.shared.remote_addr, self.shared.remote_port)
    }

    pub fn age(&self) -> Duration {
        self.shared.created_at.elapsed()
    }

    pub fn bytes_from_peer(&self) -> u64 {
        self.shared.bytes_from_peer.load(Ordering::Acquire)
    }

    pub fn output_bytes_waiting(&self) -> u64 {
        self.shared.output_bytes_waiting.load(Ordering::Acquire)
    }

    pub fn ltep(&self) -> bool {
        self.shared.ltep.load(Ordering::Acquire)
    }

    pub fn fext(&self) -> bool {
        self.shared.fext.load(Ordering::Acquire)
    }

    pub fn is_stream_encrypted(&self) -> bool {
        self.shared.encryption_stream.load(Ordering::Acquire)
    }

    pub fn has_torrent_hash(&self) -> bool {
        self.shared.has_torrent_hash.load(Ordering::Acquire)
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        *self.shared.peer_id.lock().unwrap()
    }
}
