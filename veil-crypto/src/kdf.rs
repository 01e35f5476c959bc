//! HKDF-SHA256 key schedule.
//!
//! The handshake itself lives outside this crate; what enters the dataplane
//! is its result: a shared secret, from which the session id and the
//! per-direction traffic keys are derived here. Epoch keys for rekeys are
//! derived from the same base secret plus the share exchanged in-band, with
//! the epoch number mixed into the info string so a replayed share can never
//! reproduce an earlier epoch's keys.

use hkdf::Hkdf;
use sha2::{Digest, Sha256};

use crate::session::{KeyMaterial, SecretKey, KEY_LEN, SESSION_ID_LEN};
use crate::{Error, Result};

const SESSION_ID_INFO: &[u8] = b"session-id-derivation";
const KEY_INFO_CLIENT_TO_SERVER: &[u8] = b"veil/key/client-to-server/v1";
const KEY_INFO_SERVER_TO_CLIENT: &[u8] = b"veil/key/server-to-client/v1";
const EPOCH_INFO_CLIENT_TO_SERVER: &[u8] = b"veil/epoch/client-to-server/v1";
const EPOCH_INFO_SERVER_TO_CLIENT: &[u8] = b"veil/epoch/server-to-client/v1";

fn expand(ikm: &[u8], salt: Option<&[u8]>, info: &[u8], out: &mut [u8]) -> Result<()> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, out)
        .map_err(|_| Error::Crypto("hkdf expand failed".into()))
}

/// Session id: HKDF(shared, salt = SHA-256(server_nonce || client_nonce),
/// info = "session-id-derivation"). Deterministic for equal inputs.
pub fn derive_session_id(
    shared_secret: &[u8],
    server_nonce: &[u8],
    client_nonce: &[u8],
) -> Result<[u8; SESSION_ID_LEN]> {
    let mut hasher = Sha256::new();
    hasher.update(server_nonce);
    hasher.update(client_nonce);
    let salt = hasher.finalize();

    let mut id = [0u8; SESSION_ID_LEN];
    expand(shared_secret, Some(salt.as_slice()), SESSION_ID_INFO, &mut id)?;
    Ok(id)
}

/// Initial traffic keys for both wire directions.
pub fn derive_direction_keys(shared_secret: &[u8], salt: &[u8]) -> Result<KeyMaterial> {
    let mut c2s = [0u8; KEY_LEN];
    let mut s2c = [0u8; KEY_LEN];
    expand(shared_secret, Some(salt), KEY_INFO_CLIENT_TO_SERVER, &mut c2s)?;
    expand(shared_secret, Some(salt), KEY_INFO_SERVER_TO_CLIENT, &mut s2c)?;
    Ok(KeyMaterial {
        client_to_server: SecretKey(c2s),
        server_to_client: SecretKey(s2c),
    })
}

/// Traffic keys for a rekeyed epoch. `share` is the fresh random value
/// carried in the rekey exchange; `epoch` is the agreed epoch number.
pub fn derive_epoch_keys(base_secret: &[u8], share: &[u8], epoch: u64) -> Result<KeyMaterial> {
    let mut c2s = [0u8; KEY_LEN];
    let mut s2c = [0u8; KEY_LEN];
    let mut info = Vec::with_capacity(EPOCH_INFO_CLIENT_TO_SERVER.len() + 8);

    info.extend_from_slice(EPOCH_INFO_CLIENT_TO_SERVER);
    info.extend_from_slice(&epoch.to_be_bytes());
    expand(base_secret, Some(share), &info, &mut c2s)?;

    info.clear();
    info.extend_from_slice(EPOCH_INFO_SERVER_TO_CLIENT);
    info.extend_from_slice(&epoch.to_be_bytes());
    expand(base_secret, Some(share), &info, &mut s2c)?;

    Ok(KeyMaterial {
        client_to_server: SecretKey(c2s),
        server_to_client: SecretKey(s2c),
    })
}
