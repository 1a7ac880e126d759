//! Double Ratchet with DH ratchet steps.
//!
//! References:
//!   - Signal Double Ratchet spec: <https://signal.org/docs/specifications/doubleratchet/>
//!
//! State separation (non-negotiable):
//!   RK  — root key (updated on every DH ratchet step)
//!   CKs — sending chain key (updated per message)
//!   CKr — receiving chain key (updated per message)
//!   MK  — message key (derived from CK, used once, then DELETED)
//!
//! The initiator performs one root-KDF step against the responder's signed
//! prekey before its first encrypt; the responder seeds the ratchet with its
//! signed prekey pair and performs the first DH step when the initiator's
//! opening message arrives.
//!
//! Out-of-order delivery is absorbed by a bounded, insertion-ordered cache
//! of skipped message keys. A single decrypt that would overflow the cache
//! is refused before any state changes; across messages the cache evicts
//! oldest-first.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::{error::CryptoError, kdf};

/// Default cap on stored skipped message keys per session.
pub const MAX_SKIPPED: u64 = 1000;

// ── Ratchet header (sent unencrypted alongside every ciphertext) ─────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Sender's current DH ratchet public key.
    pub dh: [u8; 32],
    /// Number of messages in the sender's previous sending chain.
    pub pn: u64,
    /// Message number within the current sending chain.
    pub n: u64,
}

impl MessageHeader {
    /// Canonical byte encoding, bound as AEAD associated data:
    /// `dh (32 bytes) || pn (u64 BE) || n (u64 BE)`.
    pub fn aad_bytes(&self) -> [u8; 48] {
        let mut out = [0u8; 48];
        out[..32].copy_from_slice(&self.dh);
        out[32..40].copy_from_slice(&self.pn.to_be_bytes());
        out[40..].copy_from_slice(&self.n.to_be_bytes());
        out
    }
}

// ── Chains and skipped keys ──────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct ChainState {
    key: [u8; 32],
    /// Next message number in this chain (strictly monotonic, resets to 0 on
    /// a DH ratchet step).
    next: u64,
}

#[derive(Serialize, Deserialize)]
struct SkippedKey {
    dh: [u8; 32],
    n: u64,
    mk: [u8; 32],
}

/// Insertion-ordered skipped-key cache with FIFO eviction.
#[derive(Default, Serialize, Deserialize)]
struct SkippedKeys {
    entries: Vec<SkippedKey>,
}

impl SkippedKeys {
    fn take(&mut self, dh: &[u8; 32], n: u64) -> Option<[u8; 32]> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.n == n && &e.dh == dh)?;
        let mut entry = self.entries.remove(idx);
        let mk = entry.mk;
        entry.mk.zeroize();
        Some(mk)
    }

    fn insert(&mut self, dh: [u8; 32], n: u64, mk: [u8; 32], max: u64) {
        while self.entries.len() as u64 >= max && !self.entries.is_empty() {
            let mut evicted = self.entries.remove(0);
            evicted.mk.zeroize();
        }
        self.entries.push(SkippedKey { dh, n, mk });
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// ── Ratchet state ────────────────────────────────────────────────────────────

/// Complete Double Ratchet session state.
/// Serialized to the key store, which re-encrypts it at rest.
#[derive(Serialize, Deserialize)]
pub struct RatchetState {
    dh_self_secret: [u8; 32],
    dh_self_public: [u8; 32],
    /// Peer's last seen DH ratchet public key. `None` until the responder
    /// receives the opening message.
    dh_remote: Option<[u8; 32]>,
    root_key: [u8; 32],
    chain_send: Option<ChainState>,
    chain_recv: Option<ChainState>,
    /// Messages sent under the previous sending chain.
    prev_chain_length: u64,
    skipped: SkippedKeys,
    #[serde(default = "default_max_skipped")]
    max_skipped: u64,
}

fn default_max_skipped() -> u64 {
    MAX_SKIPPED
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.dh_self_secret.zeroize();
        if let Some(c) = self.chain_send.as_mut() {
            c.key.zeroize();
        }
        if let Some(c) = self.chain_recv.as_mut() {
            c.key.zeroize();
        }
        for entry in self.skipped.entries.iter_mut() {
            entry.mk.zeroize();
        }
    }
}

impl RatchetState {
    /// Initiator construction, immediately after X3DH.
    ///
    /// The shared key becomes the root key, the responder's signed prekey is
    /// the first remote ratchet key, and one root-KDF step establishes the
    /// sending chain before any message goes out.
    pub fn init_sender(
        shared_key: [u8; 32],
        remote_signed_prekey: &[u8; 32],
        max_skipped: u64,
    ) -> Result<Self, CryptoError> {
        let dh_self = StaticSecret::random_from_rng(OsRng);
        let dh_self_public = X25519Public::from(&dh_self).to_bytes();

        let dh_out = dh_self.diffie_hellman(&X25519Public::from(*remote_signed_prekey));
        let (root_key, ck_send) = kdf::kdf_rk(&shared_key, dh_out.as_bytes())?;

        Ok(Self {
            dh_self_secret: dh_self.to_bytes(),
            dh_self_public,
            dh_remote: Some(*remote_signed_prekey),
            root_key,
            chain_send: Some(ChainState { key: ck_send, next: 0 }),
            chain_recv: None,
            prev_chain_length: 0,
            skipped: SkippedKeys::default(),
            max_skipped,
        })
    }

    /// Responder construction, on the first inbound message of a session.
    ///
    /// The signed prekey pair referenced by the initiator becomes the local
    /// ratchet key; no chain exists until the inbound DH step runs.
    pub fn init_receiver(
        shared_key: [u8; 32],
        signed_prekey_secret: &StaticSecret,
        max_skipped: u64,
    ) -> Self {
        Self {
            dh_self_secret: signed_prekey_secret.to_bytes(),
            dh_self_public: X25519Public::from(signed_prekey_secret).to_bytes(),
            dh_remote: None,
            root_key: shared_key,
            chain_send: None,
            chain_recv: None,
            prev_chain_length: 0,
            skipped: SkippedKeys::default(),
            max_skipped,
        }
    }

    /// Our current DH ratchet public key.
    pub fn ratchet_public(&self) -> [u8; 32] {
        self.dh_self_public
    }

    /// Number of cached skipped message keys.
    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    /// Messages sent so far in the current sending chain.
    pub fn send_count(&self) -> u64 {
        self.chain_send.as_ref().map_or(0, |c| c.next)
    }

    // ── Encrypt ──────────────────────────────────────────────────────────

    /// Advance the sending chain one step. Returns the header to transmit
    /// and the one-shot message key; the caller seals the payload with it.
    pub fn encrypt_step(&mut self) -> Result<(MessageHeader, [u8; 32]), CryptoError> {
        let chain = self
            .chain_send
            .as_mut()
            .ok_or_else(|| CryptoError::RatchetStep("no sending chain established".into()))?;

        let (next_ck, mk) = kdf::kdf_ck(&chain.key)?;
        chain.key = next_ck;

        let header = MessageHeader {
            dh: self.dh_self_public,
            pn: self.prev_chain_length,
            n: chain.next,
        };
        chain.next += 1;
        Ok((header, mk))
    }

    // ── Decrypt ──────────────────────────────────────────────────────────

    /// Derive the message key for a received header.
    ///
    /// Handles, in order: a key already cached for an out-of-order message;
    /// an inbound DH ratchet when the peer presents a new ratchet key; and
    /// skipping forward within the current receiving chain.
    ///
    /// The caller persists state only after the AEAD open succeeds, so a
    /// failed open (duplicate or tampered message) leaves durable state
    /// untouched.
    pub fn decrypt_step(&mut self, header: &MessageHeader) -> Result<[u8; 32], CryptoError> {
        if let Some(mk) = self.skipped.take(&header.dh, header.n) {
            return Ok(mk);
        }

        let ratchet_needed = self.dh_remote.map_or(true, |r| r != header.dh);

        // Refuse before mutating if this one message would blow the cache.
        let to_store = if ratchet_needed {
            let old_chain_tail = self
                .chain_recv
                .as_ref()
                .map_or(0, |c| header.pn.saturating_sub(c.next));
            old_chain_tail.saturating_add(header.n)
        } else {
            let chain = self
                .chain_recv
                .as_ref()
                .ok_or_else(|| CryptoError::RatchetStep("no receiving chain established".into()))?;
            header.n.saturating_sub(chain.next)
        };
        if to_store > self.max_skipped {
            return Err(CryptoError::TooManySkipped {
                requested: to_store,
                limit: self.max_skipped,
            });
        }

        if ratchet_needed {
            // Close out the current receiving chain up to the peer's count.
            if self.chain_recv.is_some() {
                self.skip_to(header.pn)?;
            }

            self.prev_chain_length = self.chain_send.as_ref().map_or(0, |c| c.next);
            self.dh_remote = Some(header.dh);

            let peer = X25519Public::from(header.dh);

            // Receiving step under the existing ratchet key.
            let dh_recv = StaticSecret::from(self.dh_self_secret).diffie_hellman(&peer);
            let (rk, ck_recv) = kdf::kdf_rk(&self.root_key, dh_recv.as_bytes())?;
            self.root_key = rk;
            self.chain_recv = Some(ChainState { key: ck_recv, next: 0 });

            // Sending step under a fresh ratchet key.
            let new_self = StaticSecret::random_from_rng(OsRng);
            self.dh_self_public = X25519Public::from(&new_self).to_bytes();
            let dh_send = new_self.diffie_hellman(&peer);
            let (rk2, ck_send) = kdf::kdf_rk(&self.root_key, dh_send.as_bytes())?;
            self.root_key = rk2;
            self.chain_send = Some(ChainState { key: ck_send, next: 0 });
            self.dh_self_secret = new_self.to_bytes();
        }

        self.skip_to(header.n)?;

        let chain = self
            .chain_recv
            .as_mut()
            .ok_or_else(|| CryptoError::RatchetStep("no receiving chain established".into()))?;
        let (next_ck, mk) = kdf::kdf_ck(&chain.key)?;
        chain.key = next_ck;
        // Counters never rewind; for a duplicate this derives a key the AEAD
        // open will reject, and the caller discards the mutated state.
        chain.next += 1;

        Ok(mk)
    }

    /// Derive and cache message keys from the current receiving position up
    /// to (but not including) `until`.
    fn skip_to(&mut self, until: u64) -> Result<(), CryptoError> {
        let dh = match self.dh_remote {
            Some(d) => d,
            None => return Ok(()),
        };
        let max = self.max_skipped;
        if let Some(chain) = self.chain_recv.as_mut() {
            while chain.next < until {
                let (next_ck, mk) = kdf::kdf_ck(&chain.key)?;
                chain.key = next_ck;
                self.skipped.insert(dh, chain.next, mk, max);
                chain.next += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (RatchetState, RatchetState) {
        let shared = [42u8; 32];
        let spk = StaticSecret::random_from_rng(OsRng);
        let spk_pub = X25519Public::from(&spk).to_bytes();
        let alice = RatchetState::init_sender(shared, &spk_pub, MAX_SKIPPED).unwrap();
        let bob = RatchetState::init_receiver(shared, &spk, MAX_SKIPPED);
        (alice, bob)
    }

    #[test]
    fn in_order_roundtrip() {
        let (mut alice, mut bob) = pair();
        for i in 0..3 {
            let (header, mk_a) = alice.encrypt_step().unwrap();
            assert_eq!(header.n, i);
            let mk_b = bob.decrypt_step(&header).unwrap();
            assert_eq!(mk_a, mk_b, "message {i}: keys must match");
        }
        assert_eq!(bob.skipped_len(), 0);
    }

    #[test]
    fn ping_pong_ratchets_and_counts_previous_chain() {
        let (mut alice, mut bob) = pair();

        // Alice → Bob
        let (h1, mk1) = alice.encrypt_step().unwrap();
        assert_eq!(bob.decrypt_step(&h1).unwrap(), mk1);

        // Bob → Alice: Bob never sent before, so pn = 0.
        let (r1, mk_r1) = bob.encrypt_step().unwrap();
        assert_eq!((r1.pn, r1.n), (0, 0));
        assert_eq!(alice.decrypt_step(&r1).unwrap(), mk_r1);

        // Alice → Bob again: new chain, previous chain held one message.
        let (h2, mk2) = alice.encrypt_step().unwrap();
        assert_eq!((h2.pn, h2.n), (1, 0));
        assert_ne!(h2.dh, h1.dh, "reply must force a fresh ratchet key");
        assert_eq!(bob.decrypt_step(&h2).unwrap(), mk2);
    }

    #[test]
    fn out_of_order_within_chain() {
        let (mut alice, mut bob) = pair();
        let sent: Vec<_> = (0..5).map(|_| alice.encrypt_step().unwrap()).collect();

        // Deliver as M3, M1, M5, M4, M2 (indices 2,0,4,3,1).
        for &i in &[2usize, 0, 4, 3, 1] {
            let (ref header, mk) = sent[i];
            assert_eq!(bob.decrypt_step(header).unwrap(), mk, "message {i}");
        }
        assert_eq!(bob.skipped_len(), 0, "all cached keys consumed");
    }

    #[test]
    fn skipped_keys_survive_a_ratchet_step() {
        let (mut alice, mut bob) = pair();

        let (h0, mk0) = alice.encrypt_step().unwrap();
        let (h1, mk1) = alice.encrypt_step().unwrap();

        // Bob only sees message 1, then replies (DH ratchet on Alice's side).
        assert_eq!(bob.decrypt_step(&h1).unwrap(), mk1);
        let (r, mk_r) = bob.encrypt_step().unwrap();
        assert_eq!(alice.decrypt_step(&r).unwrap(), mk_r);

        let (h2, mk2) = alice.encrypt_step().unwrap();
        assert_eq!(bob.decrypt_step(&h2).unwrap(), mk2);

        // The old chain's message 0 still decrypts from the cache.
        assert_eq!(bob.decrypt_step(&h0).unwrap(), mk0);
        assert_eq!(bob.skipped_len(), 0);
    }

    #[test]
    fn fifo_eviction_at_the_bound() {
        let shared = [9u8; 32];
        let spk = StaticSecret::random_from_rng(OsRng);
        let spk_pub = X25519Public::from(&spk).to_bytes();
        let mut alice = RatchetState::init_sender(shared, &spk_pub, 4).unwrap();
        let mut bob = RatchetState::init_receiver(shared, &spk, 4);

        let sent: Vec<_> = (0..8).map(|_| alice.encrypt_step().unwrap()).collect();

        assert_eq!(bob.decrypt_step(&sent[0].0).unwrap(), sent[0].1);
        // Jump to 3: caches keys 1 and 2.
        assert_eq!(bob.decrypt_step(&sent[3].0).unwrap(), sent[3].1);
        assert_eq!(bob.skipped_len(), 2);
        // Jump to 7: caches 4, 5, 6 — the table would hold five, so the
        // oldest entry (key 1) is evicted.
        assert_eq!(bob.decrypt_step(&sent[7].0).unwrap(), sent[7].1);
        assert_eq!(bob.skipped_len(), 4);

        // Key 2 survived; key 1 is gone and yields a chain-position key that
        // will not match (the AEAD open downstream rejects it).
        assert_eq!(bob.decrypt_step(&sent[2].0).unwrap(), sent[2].1);
        let stale = bob.decrypt_step(&sent[1].0).unwrap();
        assert_ne!(stale, sent[1].1, "evicted key is unrecoverable");
    }

    #[test]
    fn single_decrypt_over_the_bound_is_refused() {
        let shared = [5u8; 32];
        let spk = StaticSecret::random_from_rng(OsRng);
        let spk_pub = X25519Public::from(&spk).to_bytes();
        let mut alice = RatchetState::init_sender(shared, &spk_pub, 8).unwrap();
        let mut bob = RatchetState::init_receiver(shared, &spk, 8);

        let mut last = None;
        for _ in 0..10 {
            last = Some(alice.encrypt_step().unwrap());
        }
        let (header, _) = last.unwrap();
        assert_eq!(header.n, 9);

        let err = bob.decrypt_step(&header).unwrap_err();
        assert!(matches!(err, CryptoError::TooManySkipped { requested: 9, limit: 8 }));
        assert_eq!(bob.skipped_len(), 0, "refusal must not mutate the cache");
    }

    #[test]
    fn serialization_roundtrip_preserves_behaviour() {
        let (mut alice, mut bob) = pair();
        let (h0, mk0) = alice.encrypt_step().unwrap();
        assert_eq!(bob.decrypt_step(&h0).unwrap(), mk0);

        let frozen = serde_json::to_vec(&bob).unwrap();
        let mut thawed: RatchetState = serde_json::from_slice(&frozen).unwrap();

        let (h1, mk1) = alice.encrypt_step().unwrap();
        assert_eq!(thawed.decrypt_step(&h1).unwrap(), mk1);
        assert_eq!(thawed.max_skipped, MAX_SKIPPED);
    }

    #[test]
    fn header_aad_is_canonical() {
        let header = MessageHeader { dh: [0xAB; 32], pn: 3, n: 7 };
        let aad = header.aad_bytes();
        assert_eq!(&aad[..32], &[0xAB; 32]);
        assert_eq!(&aad[32..40], &3u64.to_be_bytes());
        assert_eq!(&aad[40..], &7u64.to_be_bytes());
    }
}
