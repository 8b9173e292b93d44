//! Peer I/O core: the per-connection byte transport every BitTorrent peer
//! session sits on.
//!
//! Owns one TCP socket and the buffered reader/writer wrapped around it,
//! applies symmetric stream encryption transparently to every byte moving
//! in either direction, drives application-level read/write/error
//! callbacks from an event loop, and enforces an inactivity timeout and
//! an input high-watermark that bounds memory per peer.
//!
//! This crate deliberately does not interpret the bytes it carries beyond
//! directing them through a cipher: the message-level peer wire protocol,
//! tracker client, and torrent/piece bookkeeping are external collaborators.
mod buffered_socket;
mod cipher;
mod config;
mod error;
mod peer_io;
mod transport;

pub use buffered_socket::{SocketError, SocketEvent};
pub use cipher::{EncryptionMode, InfoHash, HASH_LEN};
pub use config::{PeerIoConfig, DEFAULT_IDLE_TIMEOUT, DEFAULT_READ_WATERMARK_HIGH, DEFAULT_TOS};
pub use error::PeerIoError;
pub use peer_io::{
    new_session_lock, Capabilities, Direction, PeerId, PeerIo, PeerIoHandle, ReadControl,
    SessionLock,
};
pub use transport::Transport;
