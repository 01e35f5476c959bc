//! Directional AEAD session state.
//!
//! A [`Session`] owns one ChaCha20-Poly1305 context and one nonce counter per
//! direction, bound to a 32-byte session id. The associated data for every
//! record is `session_id || direction_tag || nonce`, which ties a ciphertext
//! to this session, this direction and this counter value; flipping any of
//! them fails tag verification.
//!
//! The send and receive halves can be split so a writer task and a reader
//! task each own exactly the state they mutate.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key};
use zeroize::Zeroize;

use crate::nonce::{Nonce, NonceSequence, NONCE_LEN};
use crate::replay::ReplayWindow;
use crate::{Error, Result};

pub const KEY_LEN: usize = 32;
pub const TAG_LEN: usize = 16;
pub const SESSION_ID_LEN: usize = 32;

const DIRECTION_TAG_LEN: usize = 16;
const AAD_LEN: usize = SESSION_ID_LEN + DIRECTION_TAG_LEN + NONCE_LEN;

const CLIENT_TO_SERVER: &[u8; DIRECTION_TAG_LEN] = b"client-to-server";
const SERVER_TO_CLIENT: &[u8; DIRECTION_TAG_LEN] = b"server-to-client";

/// Which end of the tunnel this session lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn send_tag(self) -> &'static [u8; DIRECTION_TAG_LEN] {
        match self {
            Role::Client => CLIENT_TO_SERVER,
            Role::Server => SERVER_TO_CLIENT,
        }
    }

    fn recv_tag(self) -> &'static [u8; DIRECTION_TAG_LEN] {
        match self {
            Role::Client => SERVER_TO_CLIENT,
            Role::Server => CLIENT_TO_SERVER,
        }
    }

    pub fn peer(self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }
}

/// 32-byte key, wiped on drop.
#[derive(Clone)]
pub struct SecretKey(pub [u8; KEY_LEN]);

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Key pair oriented by wire direction, as the key schedule produces it.
#[derive(Clone, Debug)]
pub struct KeyMaterial {
    pub client_to_server: SecretKey,
    pub server_to_client: SecretKey,
}

impl KeyMaterial {
    /// Reorient into send/recv for one endpoint.
    pub fn for_role(self, role: Role) -> DirectionKeys {
        match role {
            Role::Client => DirectionKeys {
                send: self.client_to_server,
                recv: self.server_to_client,
            },
            Role::Server => DirectionKeys {
                send: self.server_to_client,
                recv: self.client_to_server,
            },
        }
    }
}

/// Key pair oriented by this endpoint's send/recv directions.
#[derive(Clone, Debug)]
pub struct DirectionKeys {
    pub send: SecretKey,
    pub recv: SecretKey,
}

/// Output of one encrypt call: ciphertext with appended tag plus the counter
/// value it was sealed under.
#[derive(Debug, Clone)]
pub struct SealedPacket {
    pub nonce: Nonce,
    pub ciphertext: Vec<u8>,
}

fn build_aad(
    session_id: &[u8; SESSION_ID_LEN],
    direction: &[u8; DIRECTION_TAG_LEN],
    nonce: &[u8; NONCE_LEN],
) -> [u8; AAD_LEN] {
    let mut aad = [0u8; AAD_LEN];
    aad[..SESSION_ID_LEN].copy_from_slice(session_id);
    aad[SESSION_ID_LEN..SESSION_ID_LEN + DIRECTION_TAG_LEN].copy_from_slice(direction);
    aad[SESSION_ID_LEN + DIRECTION_TAG_LEN..].copy_from_slice(nonce);
    aad
}

/// Sending half: cipher plus the strictly increasing counter.
pub struct SendSession {
    cipher: ChaCha20Poly1305,
    nonce: NonceSequence,
    session_id: [u8; SESSION_ID_LEN],
    direction: &'static [u8; DIRECTION_TAG_LEN],
}

impl SendSession {
    fn new(key: &SecretKey, session_id: [u8; SESSION_ID_LEN], role: Role) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key.0)),
            nonce: NonceSequence::new(),
            session_id,
            direction: role.send_tag(),
        }
    }

    /// Encrypt one packet under the next counter value.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<SealedPacket> {
        let nonce = self.nonce.next()?;
        let bytes = nonce.to_bytes();
        let aad = build_aad(&self.session_id, self.direction, &bytes);
        let ciphertext = self
            .cipher
            .encrypt(
                chacha20poly1305::Nonce::from_slice(&bytes),
                Payload { msg: plaintext, aad: &aad },
            )
            .map_err(|_| Error::Crypto("aead seal failed".into()))?;
        Ok(SealedPacket { nonce, ciphertext })
    }

    /// Counter value the next seal will use; doubles as a sent-packet count.
    pub fn seq(&self) -> Result<Nonce> {
        self.nonce.peek()
    }

    pub fn session_id(&self) -> &[u8; SESSION_ID_LEN] {
        &self.session_id
    }
}

/// Receiving half: cipher, the peer's counter, and (for datagram transports)
/// the anti-replay window.
pub struct RecvSession {
    cipher: ChaCha20Poly1305,
    nonce: NonceSequence,
    session_id: [u8; SESSION_ID_LEN],
    direction: &'static [u8; DIRECTION_TAG_LEN],
    replay: Option<ReplayWindow>,
}

impl RecvSession {
    fn new(key: &SecretKey, session_id: [u8; SESSION_ID_LEN], role: Role) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key.0)),
            nonce: NonceSequence::new(),
            session_id,
            direction: role.recv_tag(),
            replay: None,
        }
    }

    fn with_replay_window(mut self, capacity: usize) -> Self {
        self.replay = Some(ReplayWindow::new(capacity));
        self
    }

    fn open_raw(&self, nonce_bytes: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let aad = build_aad(&self.session_id, self.direction, nonce_bytes);
        self.cipher
            .decrypt(
                chacha20poly1305::Nonce::from_slice(nonce_bytes),
                Payload { msg: ciphertext, aad: &aad },
            )
            .map_err(|_| Error::DecryptFailed)
    }

    /// Decrypt a datagram record carrying its nonce explicitly. The nonce is
    /// entered into the replay window only after the tag verified.
    pub fn open(&mut self, nonce: Nonce, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let plaintext = self.open_raw(&nonce.to_bytes(), ciphertext)?;
        if let Some(replay) = &mut self.replay {
            replay.insert(nonce)?;
        }
        Ok(plaintext)
    }

    /// Decrypt the next in-order stream record; the counter only advances on
    /// success. A failure here is fatal for the stream.
    pub fn open_next(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.nonce.peek()?;
        let plaintext = self.open_raw(&nonce.to_bytes(), ciphertext)?;
        let _ = self.nonce.next();
        Ok(plaintext)
    }

    pub fn replay_stats(&self) -> Option<(u64, u64)> {
        self.replay.as_ref().map(ReplayWindow::stats)
    }
}

/// Bidirectional session created from a completed handshake.
pub struct Session {
    send: SendSession,
    recv: RecvSession,
}

impl Session {
    pub fn new(keys: DirectionKeys, session_id: [u8; SESSION_ID_LEN], role: Role) -> Self {
        Self {
            send: SendSession::new(&keys.send, session_id, role),
            recv: RecvSession::new(&keys.recv, session_id, role),
        }
    }

    /// Attach an anti-replay window to the receive half (datagram transports).
    pub fn with_replay_window(mut self, capacity: usize) -> Self {
        self.recv = self.recv.with_replay_window(capacity);
        self
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<SealedPacket> {
        self.send.seal(plaintext)
    }

    pub fn decrypt(&mut self, nonce: Nonce, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.recv.open(nonce, ciphertext)
    }

    pub fn decrypt_next(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.recv.open_next(ciphertext)
    }

    pub fn session_id(&self) -> &[u8; SESSION_ID_LEN] {
        self.send.session_id()
    }

    pub fn send_seq(&self) -> Result<Nonce> {
        self.send.seq()
    }

    /// Split into independently owned halves for the reader/writer tasks.
    pub fn split(self) -> (SendSession, RecvSession) {
        (self.send, self.recv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Session, Session) {
        let id = [0x5a; SESSION_ID_LEN];
        let material = KeyMaterial {
            client_to_server: SecretKey([1; KEY_LEN]),
            server_to_client: SecretKey([2; KEY_LEN]),
        };
        let client = Session::new(material.clone().for_role(Role::Client), id, Role::Client);
        let server = Session::new(material.for_role(Role::Server), id, Role::Server);
        (client, server)
    }

    #[test]
    fn roundtrip_both_directions() -> Result<()> {
        let (mut client, mut server) = pair();

        let sealed = client.encrypt(b"hello")?;
        assert_eq!(sealed.nonce, Nonce::ZERO);
        assert_eq!(sealed.ciphertext.len(), 5 + TAG_LEN);
        assert_eq!(server.decrypt_next(&sealed.ciphertext)?, b"hello");

        let back = server.encrypt(b"world")?;
        assert_eq!(client.decrypt_next(&back.ciphertext)?, b"world");
        Ok(())
    }

    #[test]
    fn direction_tags_are_not_interchangeable() -> Result<()> {
        let (mut client, _) = pair();
        let sealed = client.encrypt(b"msg")?;
        // A second client-side session cannot open client-to-server traffic:
        // its receive direction expects the server tag in the AAD.
        let id = [0x5a; SESSION_ID_LEN];
        let material = KeyMaterial {
            client_to_server: SecretKey([1; KEY_LEN]),
            server_to_client: SecretKey([1; KEY_LEN]),
        };
        let mut other_client = Session::new(material.for_role(Role::Client), id, Role::Client);
        assert!(matches!(
            other_client.decrypt(sealed.nonce, &sealed.ciphertext),
            Err(Error::DecryptFailed)
        ));
        Ok(())
    }

    #[test]
    fn session_id_binds_ciphertext() -> Result<()> {
        let material = KeyMaterial {
            client_to_server: SecretKey([1; KEY_LEN]),
            server_to_client: SecretKey([2; KEY_LEN]),
        };
        let mut client =
            Session::new(material.clone().for_role(Role::Client), [7; 32], Role::Client);
        let mut server = Session::new(material.for_role(Role::Server), [8; 32], Role::Server);
        let sealed = client.encrypt(b"msg")?;
        assert!(matches!(
            server.decrypt_next(&sealed.ciphertext),
            Err(Error::DecryptFailed)
        ));
        Ok(())
    }

    #[test]
    fn tampered_ciphertext_rejected() -> Result<()> {
        let (mut client, mut server) = pair();
        let mut sealed = client.encrypt(b"payload")?;
        sealed.ciphertext[0] ^= 0xff;
        assert!(matches!(
            server.decrypt_next(&sealed.ciphertext),
            Err(Error::DecryptFailed)
        ));
        Ok(())
    }

    #[test]
    fn stream_counter_advances_only_on_success() -> Result<()> {
        let (mut client, mut server) = pair();
        let first = client.encrypt(b"one")?;
        let second = client.encrypt(b"two")?;

        let mut garbage = first.ciphertext.clone();
        garbage[2] ^= 1;
        assert!(server.decrypt_next(&garbage).is_err());
        // The failed record did not consume the counter.
        assert_eq!(server.decrypt_next(&first.ciphertext)?, b"one");
        assert_eq!(server.decrypt_next(&second.ciphertext)?, b"two");
        Ok(())
    }

    #[test]
    fn replay_window_drops_duplicate_datagram() -> Result<()> {
        let id = [0x5a; SESSION_ID_LEN];
        let material = KeyMaterial {
            client_to_server: SecretKey([1; KEY_LEN]),
            server_to_client: SecretKey([2; KEY_LEN]),
        };
        let mut client = Session::new(material.clone().for_role(Role::Client), id, Role::Client);
        let mut server = Session::new(material.for_role(Role::Server), id, Role::Server)
            .with_replay_window(64);

        let sealed = client.encrypt(b"dgram")?;
        assert_eq!(server.decrypt(sealed.nonce, &sealed.ciphertext)?, b"dgram");
        assert!(matches!(
            server.decrypt(sealed.nonce, &sealed.ciphertext),
            Err(Error::NonUniqueNonce)
        ));
        Ok(())
    }

    #[test]
    fn nonces_increase_across_seals() -> Result<()> {
        let (mut client, _) = pair();
        let a = client.encrypt(b"a")?;
        let b = client.encrypt(b"b")?;
        assert!(b.nonce.value() > a.nonce.value());
        Ok(())
    }
}
