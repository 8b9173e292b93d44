//! Error kinds for the peer I/O core.
//!
//! One `thiserror`-derived enum for the crate, following the module-local
//! `Error` convention used elsewhere in the protocol stack: `#[from]`
//! wrapping of `std::io::Error`, a `Debug` derive, and a human
//! `#[error("...")]` string per variant.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by [`crate::peer_io::PeerIo`] and
/// [`crate::buffered_socket::BufferedSocket`].
///
/// There is no `ProtocolViolation` variant here: detecting and raising
/// that is the peer-message layer's job, which reacts by calling `close`
/// — this core never inspects payload bytes closely enough to raise it
/// itself.
#[derive(Error, Debug)]
pub enum PeerIoError {
    /// Outbound TCP connect failed (construction or `reconnect`).
    #[error("failed to connect to peer")]
    Connect(#[from] std::io::Error),

    /// A read, write, or socket-level operation failed after the
    /// connection was established.
    #[error("peer connection I/O error")]
    Io(std::io::Error),

    /// No bytes exchanged in either direction for longer than the
    /// configured idle timeout.
    #[error("peer connection idle for more than {0:?}")]
    Timeout(Duration),

    /// The remote peer closed the connection.
    #[error("peer closed the connection")]
    Eof,

    /// `reconnect` was called on an inbound connection; reconnecting is
    /// only meaningful for a connection this side dialed itself.
    #[error("reconnect is only supported for outbound connections")]
    NotOutbound,
}
