//! Per-direction RC4-compatible stream cipher pair bound to a torrent
//! info-hash.
//!
//! The key schedule follows the public MSE key-derivation scheme
//! (`keyA`/`keyB` = SHA-1 of a fixed label plus the info-hash, the same
//! algorithm libtorrent/MSE implementations use), built on the
//! `sha1::{Digest, Sha1}` call shape used elsewhere for hashing metainfo
//! dictionaries. RC4 itself is a small KSA/PRGA state machine implemented
//! directly rather than pulling in a dependency for it.

use log::{debug, trace};
use sha1::{Digest, Sha1};

/// Length of a torrent info-hash / peer-id in bytes.
pub const HASH_LEN: usize = 20;

/// 20-byte SHA-1 torrent info-hash.
pub type InfoHash = [u8; HASH_LEN];

/// RC4 key-stream generator (KSA once at construction, PRGA byte-at-a-time).
#[derive(Clone)]
struct Rc4 {
    state: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    fn new(key: &[u8]) -> Self {
        let mut state = [0u8; 256];
        for (idx, slot) in state.iter_mut().enumerate() {
            *slot = idx as u8;
        }
        let mut j: u8 = 0;
        for i in 0..256usize {
            j = j
                .wrapping_add(state[i])
                .wrapping_add(key[i % key.len()]);
            state.swap(i, j as usize);
        }
        Self { state, i: 0, j: 0 }
    }

    /// XORs `buf` in place with the next `buf.len()` key-stream bytes.
    fn apply(&mut self, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.state[self.i as usize]);
            self.state.swap(self.i as usize, self.j as usize);
            let k = self.state[(self.state[self.i as usize].wrapping_add(self.state[self.j as usize])) as usize];
            *byte ^= k;
        }
    }
}

/// Which of the two MSE key labels a given direction derives its outgoing
/// key-stream from. Outbound peers write with `keyA`/read with `keyB`;
/// inbound peers do the opposite, so the same info-hash yields distinct
/// keystreams per endpoint.
fn derive_key(label: &[u8], info_hash: &InfoHash) -> [u8; 20] {
    let mut hasher = Sha1::default();
    hasher.update(label);
    hasher.update(info_hash);
    hasher.finalize().into()
}

/// Encryption mode toggle: plaintext, or RC4-style stream encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMode {
    None,
    Stream,
}

/// Pair of independent RC4 keystreams (one per direction) plus the
/// info-hash they were derived from, and the current [`EncryptionMode`].
///
/// Outgoing connections know the info-hash up front; incoming ones
/// construct with `info_hash: None` and call
/// [`CipherPair::set_torrent_hash`] once the handshake identifies the
/// swarm. Stream mode cannot actually encrypt anything until the hash
/// arrives, since that's what the keystreams themselves are derived from.
pub struct CipherPair {
    is_incoming: bool,
    info_hash: Option<InfoHash>,
    mode: EncryptionMode,
    read_key: Option<Rc4>,
    write_key: Option<Rc4>,
}

impl CipherPair {
    /// `is_incoming` selects which MSE key label backs reads vs writes;
    /// `info_hash` may be `None` for an inbound connection awaiting
    /// handshake.
    pub fn new(is_incoming: bool, info_hash: Option<InfoHash>) -> Self {
        let mut pair = Self {
            is_incoming,
            info_hash: None,
            mode: EncryptionMode::None,
            read_key: None,
            write_key: None,
        };
        if let Some(hash) = info_hash {
            pair.set_torrent_hash(hash);
        }
        pair
    }

    pub fn mode(&self) -> EncryptionMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: EncryptionMode) {
        debug!("cipher mode set to {mode:?}");
        self.mode = mode;
    }

    pub fn has_torrent_hash(&self) -> bool {
        self.info_hash.is_some()
    }

    pub fn torrent_hash(&self) -> Option<InfoHash> {
        self.info_hash
    }

    /// Installs the info-hash and (re)derives both keystreams. Intended to
    /// be called exactly once, when an inbound handshake identifies the
    /// swarm.
    pub fn set_torrent_hash(&mut self, info_hash: InfoHash) {
        let (read_label, write_label): (&[u8], &[u8]) = if self.is_incoming {
            (b"keyA", b"keyB")
        } else {
            (b"keyB", b"keyA")
        };
        self.read_key = Some(Rc4::new(&derive_key(read_label, &info_hash)));
        self.write_key = Some(Rc4::new(&derive_key(write_label, &info_hash)));
        self.info_hash = Some(info_hash);
        trace!("derived RC4 keystreams from torrent hash");
    }

    /// Encrypts `buf` in place using the write-direction keystream.
    /// Advances the keystream by `buf.len()` bytes regardless of call
    /// pattern, which is what keeps dropping a message via `drain`
    /// from desynchronising the cipher.
    pub fn encrypt(&mut self, buf: &mut [u8]) {
        if let Some(key) = self.write_key.as_mut() {
            key.apply(buf);
        }
    }

    /// Decrypts `buf` in place using the read-direction keystream.
    pub fn decrypt(&mut self, buf: &mut [u8]) {
        if let Some(key) = self.read_key.as_mut() {
            key.apply(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> InfoHash {
        [byte; HASH_LEN]
    }

    #[test]
    fn round_trips_through_opposite_endpoints() {
        let h = hash(0x42);
        let mut outbound = CipherPair::new(false, Some(h));
        let mut inbound = CipherPair::new(true, Some(h));
        outbound.set_mode(EncryptionMode::Stream);
        inbound.set_mode(EncryptionMode::Stream);

        let mut msg = *b"hello from the outbound peer";
        let plain = msg;
        outbound.encrypt(&mut msg);
        assert_ne!(msg, plain);
        inbound.decrypt(&mut msg);
        assert_eq!(msg, plain);
    }

    #[test]
    fn keystream_advances_across_calls() {
        let h = hash(0x07);
        let mut a = CipherPair::new(false, Some(h));
        let mut b = CipherPair::new(true, Some(h));
        a.set_mode(EncryptionMode::Stream);
        b.set_mode(EncryptionMode::Stream);

        let mut first = [1u8, 2, 3];
        let first_plain = first;
        a.encrypt(&mut first);
        let mut second = [4u8, 5, 6];
        let second_plain = second;
        a.encrypt(&mut second);

        b.decrypt(&mut first);
        b.decrypt(&mut second);
        assert_eq!(first, first_plain);
        assert_eq!(second, second_plain);
    }

    #[test]
    fn inbound_awaits_hash_before_deriving_keys() {
        let mut io = CipherPair::new(true, None);
        assert!(!io.has_torrent_hash());
        io.set_torrent_hash(hash(0x09));
        assert!(io.has_torrent_hash());
    }
}
