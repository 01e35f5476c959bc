//! Bounded ring of concurrently valid key epochs for datagram sessions.
//!
//! During a rekey both endpoints briefly hold traffic sealed under the old
//! and the new keys. The ring keeps up to [`MAX_EPOCHS`] generations alive:
//! exactly one is the *active send* epoch, every other one is receive-only.
//! The active epoch is never evicted; inserting past capacity drops the
//! oldest receive-only generation.
//!
//! Each datagram carries a one-byte tag, the low 8 bits of its epoch id.
//! With at most [`MAX_EPOCHS`] live generations the truncation is
//! unambiguous, and a forged tag merely selects keys that fail verification.

use std::collections::BTreeMap;

use crate::nonce::Nonce;
use crate::session::{SealedPacket, Session};
use crate::{Error, Result};

pub const MAX_EPOCHS: usize = 4;

pub struct EpochRing {
    epochs: BTreeMap<u64, Session>,
    active_send: u64,
    next_epoch: u64,
}

impl EpochRing {
    /// Start the ring with the handshake session as epoch 0, active for send.
    pub fn new(initial: Session) -> Self {
        let mut epochs = BTreeMap::new();
        epochs.insert(0, initial);
        Self {
            epochs,
            active_send: 0,
            next_epoch: 1,
        }
    }

    /// Epoch id the next insertion will be assigned.
    pub fn next_epoch_id(&self) -> u64 {
        self.next_epoch
    }

    pub fn active_send_epoch(&self) -> u64 {
        self.active_send
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn contains(&self, epoch: u64) -> bool {
        self.epochs.contains_key(&epoch)
    }

    /// Insert a freshly keyed session as the next epoch (receive-only until
    /// activated). Returns the assigned id.
    pub fn insert(&mut self, session: Session) -> u64 {
        let id = self.next_epoch;
        self.next_epoch += 1;
        self.epochs.insert(id, session);
        self.evict_over_capacity();
        id
    }

    /// Insert under an id proposed by the peer. Ids must stay monotonic so
    /// tags remain unambiguous.
    pub fn insert_at(&mut self, epoch: u64, session: Session) -> Result<u64> {
        if epoch < self.next_epoch {
            return Err(Error::Crypto(format!(
                "epoch {epoch} below next expected {}",
                self.next_epoch
            )));
        }
        self.next_epoch = epoch + 1;
        self.epochs.insert(epoch, session);
        self.evict_over_capacity();
        Ok(epoch)
    }

    fn evict_over_capacity(&mut self) {
        while self.epochs.len() > MAX_EPOCHS {
            let oldest_inactive = self
                .epochs
                .keys()
                .copied()
                .find(|id| *id != self.active_send);
            match oldest_inactive {
                Some(id) => {
                    self.epochs.remove(&id);
                }
                None => break,
            }
        }
    }

    /// Make `epoch` the send epoch. Returns false if the ring does not hold it.
    pub fn activate_send(&mut self, epoch: u64) -> bool {
        if !self.epochs.contains_key(&epoch) {
            return false;
        }
        self.active_send = epoch;
        true
    }

    /// Seal a packet under the active send epoch. While the ring is non-empty
    /// the only possible failure is counter exhaustion.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(u64, SealedPacket)> {
        let id = self.active_send;
        let session = self
            .epochs
            .get_mut(&id)
            .ok_or_else(|| Error::Crypto("active send epoch missing from ring".into()))?;
        Ok((id, session.encrypt(plaintext)?))
    }

    /// Resolve a wire tag to the epoch id it abbreviates.
    pub fn epoch_for_tag(&self, tag: u8) -> Option<u64> {
        self.epochs
            .keys()
            .rev()
            .copied()
            .find(|id| (*id & 0xff) as u8 == tag)
    }

    /// Open a datagram under the epoch its tag names.
    pub fn decrypt(&mut self, tag: u8, nonce: Nonce, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let id = self.epoch_for_tag(tag).ok_or(Error::UnknownEpoch(tag))?;
        let session = self
            .epochs
            .get_mut(&id)
            .ok_or(Error::UnknownEpoch(tag))?;
        session.decrypt(nonce, ciphertext)
    }

    /// Drop a retired epoch. The active send epoch is refused.
    pub fn remove_epoch(&mut self, epoch: u64) -> bool {
        if epoch == self.active_send {
            return false;
        }
        self.epochs.remove(&epoch).is_some()
    }

    /// Send counter of the active epoch, for rekey cadence decisions.
    pub fn active_send_seq(&self) -> Result<Nonce> {
        self.epochs
            .get(&self.active_send)
            .ok_or_else(|| Error::Crypto("active send epoch missing from ring".into()))?
            .send_seq()
    }
}
