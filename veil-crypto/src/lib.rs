#![forbid(unsafe_code)]

//! Veil session cryptography.
//! - Nonce: 96-bit monotonic per-direction counter with overflow refusal
//! - Replay: bounded set of recently accepted datagram nonces
//! - Session: directional ChaCha20-Poly1305 contexts bound to a session id
//! - KDF: HKDF-SHA256 session-id and key-schedule derivations
//! - Epoch ring: bounded set of concurrently valid key generations (datagrams)
//! - Rekey controller: at-most-one in-flight rekey with timeout abort

pub mod epoch;
pub mod kdf;
pub mod nonce;
pub mod rekey;
pub mod replay;
pub mod session;

pub use epoch::{EpochRing, MAX_EPOCHS};
pub use nonce::{Nonce, NonceSequence, NONCE_LEN};
pub use rekey::{RekeyController, RekeyState};
pub use replay::{ReplayWindow, DEFAULT_REPLAY_WINDOW};
pub use session::{
    DirectionKeys, KeyMaterial, RecvSession, Role, SealedPacket, SecretKey, SendSession, Session,
    KEY_LEN, SESSION_ID_LEN, TAG_LEN,
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The 96-bit send counter ran out; the session must be torn down.
    #[error("nonce space exhausted")]
    NonceExhausted,
    /// AEAD tag verification failed.
    #[error("decrypt failed")]
    DecryptFailed,
    /// A datagram nonce was observed twice inside the replay window.
    #[error("non-unique nonce")]
    NonUniqueNonce,
    /// A datagram referenced a key epoch this ring does not hold.
    #[error("unknown epoch tag {0}")]
    UnknownEpoch(u8),
    /// A rekey was requested while another one is still pending.
    #[error("rekey already in progress")]
    RekeyInProgress,
    #[error("crypto: {0}")]
    Crypto(String),
}

pub type Result<T> = core::result::Result<T, Error>;
