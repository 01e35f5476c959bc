//! Rekey control: at most one in-flight key transition per session.
//!
//! The initiator inserts the new epoch receive-only and goes `Pending`; the
//! epoch becomes its send epoch only once the peer acknowledged it. A pending
//! transition that is never acknowledged is aborted after a timeout and the
//! provisional epoch is dropped, so a lost acknowledgement can not wedge the
//! session.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::epoch::EpochRing;
use crate::nonce::Nonce;
use crate::session::{DirectionKeys, Role, SealedPacket, Session, SESSION_ID_LEN};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RekeyState {
    Stable,
    Pending { epoch: u64, started_at: Instant },
}

pub struct RekeyController {
    ring: EpochRing,
    state: RekeyState,
    pending_timeout: Duration,
    last_rekey_epoch: Option<u64>,
    active_since: Instant,
    session_id: [u8; SESSION_ID_LEN],
    role: Role,
    replay_window: usize,
}

impl RekeyController {
    pub fn new(
        initial_keys: DirectionKeys,
        session_id: [u8; SESSION_ID_LEN],
        role: Role,
        pending_timeout: Duration,
        replay_window: usize,
    ) -> Self {
        let initial =
            Session::new(initial_keys, session_id, role).with_replay_window(replay_window);
        Self {
            ring: EpochRing::new(initial),
            state: RekeyState::Stable,
            pending_timeout,
            last_rekey_epoch: None,
            active_since: Instant::now(),
            session_id,
            role,
            replay_window,
        }
    }

    fn build_session(&self, keys: DirectionKeys) -> Session {
        Session::new(keys, self.session_id, self.role).with_replay_window(self.replay_window)
    }

    /// Epoch id the next initiated rekey will use; needed up front because
    /// the key schedule mixes the epoch number in.
    pub fn next_epoch_id(&self) -> u64 {
        self.ring.next_epoch_id()
    }

    pub fn state(&self) -> RekeyState {
        self.state
    }

    pub fn pending_epoch(&self) -> Option<u64> {
        match self.state {
            RekeyState::Pending { epoch, .. } => Some(epoch),
            RekeyState::Stable => None,
        }
    }

    pub fn last_rekey_epoch(&self) -> Option<u64> {
        self.last_rekey_epoch
    }

    pub fn active_send_epoch(&self) -> u64 {
        self.ring.active_send_epoch()
    }

    /// Initiate a rekey: install the new epoch receive-only and mark it
    /// pending. Refused while another transition is in flight.
    pub fn rekey_and_apply(&mut self, keys: DirectionKeys) -> Result<u64> {
        if let RekeyState::Pending { .. } = self.state {
            return Err(Error::RekeyInProgress);
        }
        let session = self.build_session(keys);
        let epoch = self.ring.insert(session);
        self.state = RekeyState::Pending {
            epoch,
            started_at: Instant::now(),
        };
        debug!(epoch, "rekey pending");
        Ok(epoch)
    }

    /// Responder path: install the peer-proposed epoch and switch sending to
    /// it immediately — the initiator inserted it before asking, so it can
    /// already receive under the new keys.
    pub fn accept_remote(&mut self, epoch: u64, keys: DirectionKeys) -> Result<u64> {
        let session = self.build_session(keys);
        let epoch = self.ring.insert_at(epoch, session)?;
        self.ring.activate_send(epoch);
        self.active_since = Instant::now();
        self.last_rekey_epoch = Some(epoch);
        debug!(epoch, "remote rekey installed");
        Ok(epoch)
    }

    /// Peer acknowledged `epoch`: activate it for sending. Anything but the
    /// pending epoch is ignored, so duplicate acknowledgements are harmless.
    pub fn confirm_send_epoch(&mut self, epoch: u64) {
        match self.state {
            RekeyState::Pending { epoch: pending, .. } if pending == epoch => {
                self.ring.activate_send(epoch);
                self.active_since = Instant::now();
                self.last_rekey_epoch = Some(epoch);
                self.state = RekeyState::Stable;
                debug!(epoch, "rekey confirmed");
            }
            _ => {}
        }
    }

    /// Abort a transition whose acknowledgement never arrived. Returns true
    /// when a pending epoch was dropped.
    pub fn maybe_abort_pending(&mut self, now: Instant) -> bool {
        if let RekeyState::Pending { epoch, started_at } = self.state {
            if now.duration_since(started_at) > self.pending_timeout {
                self.ring.remove_epoch(epoch);
                self.state = RekeyState::Stable;
                debug!(epoch, "rekey aborted after timeout");
                return true;
            }
        }
        false
    }

    /// Whether the active epoch is due for replacement.
    pub fn needs_rekey(&self, max_packets: u64, max_age: Duration, now: Instant) -> bool {
        if self.pending_epoch().is_some() {
            return false;
        }
        let sent = self
            .ring
            .active_send_seq()
            .map(Nonce::value)
            .unwrap_or(u128::MAX);
        sent >= u128::from(max_packets) || now.duration_since(self.active_since) >= max_age
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(u64, SealedPacket)> {
        self.ring.encrypt(plaintext)
    }

    pub fn decrypt(&mut self, tag: u8, nonce: Nonce, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.ring.decrypt(tag, nonce, ciphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{KeyMaterial, SecretKey, KEY_LEN};

    fn keys(seed: u8, role: Role) -> DirectionKeys {
        KeyMaterial {
            client_to_server: SecretKey([seed; KEY_LEN]),
            server_to_client: SecretKey([seed.wrapping_add(1); KEY_LEN]),
        }
        .for_role(role)
    }

    fn controller(role: Role) -> RekeyController {
        RekeyController::new(keys(1, role), [9; 32], role, Duration::from_millis(50), 64)
    }

    #[test]
    fn second_rekey_refused_while_pending() -> Result<()> {
        let mut ctrl = controller(Role::Client);
        let before = ctrl.next_epoch_id();
        let epoch = ctrl.rekey_and_apply(keys(2, Role::Client))?;
        assert_eq!(epoch, before);
        assert_eq!(ctrl.pending_epoch(), Some(epoch));

        assert!(matches!(
            ctrl.rekey_and_apply(keys(3, Role::Client)),
            Err(Error::RekeyInProgress)
        ));
        // the refused call must not have burned an epoch id
        assert_eq!(ctrl.next_epoch_id(), epoch + 1);
        Ok(())
    }

    #[test]
    fn encrypt_never_fails_across_rekey() -> Result<()> {
        let mut ctrl = controller(Role::Client);
        for _ in 0..16 {
            ctrl.encrypt(b"before")?;
        }
        let epoch = ctrl.rekey_and_apply(keys(2, Role::Client))?;
        for _ in 0..16 {
            let (used, _) = ctrl.encrypt(b"during")?;
            assert_eq!(used, 0, "send stays on the old epoch until confirmed");
        }
        ctrl.confirm_send_epoch(epoch);
        let (used, _) = ctrl.encrypt(b"after")?;
        assert_eq!(used, epoch);
        Ok(())
    }

    #[test]
    fn confirmation_is_idempotent_and_selective() -> Result<()> {
        let mut ctrl = controller(Role::Client);
        let epoch = ctrl.rekey_and_apply(keys(2, Role::Client))?;
        // unrelated confirmations are ignored
        ctrl.confirm_send_epoch(epoch + 7);
        assert_eq!(ctrl.pending_epoch(), Some(epoch));

        ctrl.confirm_send_epoch(epoch);
        assert_eq!(ctrl.state(), RekeyState::Stable);
        assert_eq!(ctrl.last_rekey_epoch(), Some(epoch));
        // repeat confirmation changes nothing
        ctrl.confirm_send_epoch(epoch);
        assert_eq!(ctrl.active_send_epoch(), epoch);
        Ok(())
    }

    #[test]
    fn timeout_abort_restores_stable() -> Result<()> {
        let mut ctrl = RekeyController::new(
            keys(1, Role::Client),
            [9; 32],
            Role::Client,
            Duration::from_millis(5),
            64,
        );
        let old_active = ctrl.active_send_epoch();
        let epoch = ctrl.rekey_and_apply(keys(2, Role::Client))?;

        // not yet expired
        assert!(!ctrl.maybe_abort_pending(Instant::now()));

        std::thread::sleep(Duration::from_millis(10));
        assert!(ctrl.maybe_abort_pending(Instant::now()));
        assert_eq!(ctrl.state(), RekeyState::Stable);
        assert_eq!(ctrl.pending_epoch(), None);
        assert_eq!(ctrl.active_send_epoch(), old_active);
        // the aborted epoch is gone; a later rekey gets a fresh id
        let next = ctrl.rekey_and_apply(keys(3, Role::Client))?;
        assert_eq!(next, epoch + 1);
        Ok(())
    }

    #[test]
    fn initiator_and_responder_converge() -> Result<()> {
        let mut client = controller(Role::Client);
        let mut server = controller(Role::Server);

        // traffic under epoch 0 flows both ways
        let (e, sealed) = client.encrypt(b"ping")?;
        assert_eq!(server.decrypt((e & 0xff) as u8, sealed.nonce, &sealed.ciphertext)?, b"ping");

        let epoch = client.next_epoch_id();
        let client_epoch = client.rekey_and_apply(keys(7, Role::Client))?;
        assert_eq!(client_epoch, epoch);
        server.accept_remote(epoch, keys(7, Role::Server))?;

        // the server already sends under the new epoch; client can decrypt
        let (se, sealed) = server.encrypt(b"ack")?;
        assert_eq!(se, epoch);
        assert_eq!(client.decrypt((se & 0xff) as u8, sealed.nonce, &sealed.ciphertext)?, b"ack");

        client.confirm_send_epoch(epoch);
        let (ce, sealed) = client.encrypt(b"data")?;
        assert_eq!(ce, epoch);
        assert_eq!(server.decrypt((ce & 0xff) as u8, sealed.nonce, &sealed.ciphertext)?, b"data");
        Ok(())
    }

    #[test]
    fn cadence_triggers_on_packets_and_age() -> Result<()> {
        let mut ctrl = controller(Role::Client);
        let now = Instant::now();
        assert!(!ctrl.needs_rekey(10, Duration::from_secs(600), now));
        for _ in 0..10 {
            ctrl.encrypt(b"x")?;
        }
        assert!(ctrl.needs_rekey(10, Duration::from_secs(600), now));
        // age alone triggers as well
        assert!(ctrl.needs_rekey(u64::MAX, Duration::ZERO, now + Duration::from_secs(1)));
        Ok(())
    }
}
