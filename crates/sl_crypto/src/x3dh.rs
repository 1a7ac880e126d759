//! X3DH asynchronous key agreement.
//!
//! References:
//!   - Signal X3DH spec: <https://signal.org/docs/specifications/x3dh/>
//!   - RFC 7748 (X25519): <https://datatracker.ietf.org/doc/html/rfc7748>
//!   - RFC 5869 (HKDF):  <https://datatracker.ietf.org/doc/html/rfc5869>
//!
//! The initiator fetches the responder's published bundle:
//!   IK_B  (X25519 identity key) + Ed25519 signing key
//!   SPK_B (signed prekey, X25519) + signature over SPK_B by the signing key
//!   OPK_B (optional one-time prekey, X25519)
//!
//! The initiator generates ONE ephemeral keypair EK_A and computes:
//!   DH1 = DH(IK_A, SPK_B)
//!   DH2 = DH(EK_A, IK_B)
//!   DH3 = DH(EK_A, SPK_B)
//!   DH4 = DH(EK_A, OPK_B)   [if OPK present]
//!
//!   SK = HKDF(ikm = DH1 || DH2 || DH3 [|| DH4], salt = X3DH_SALT,
//!             info = "SharedSecret", L = 32)
//!
//! Non-negotiable ordering: the SPK signature is verified BEFORE any DH is
//! computed. SK feeds the Double Ratchet as the initial root key.

use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::{error::CryptoError, identity, identity::Identity, kdf};

/// HKDF salt: the protocol tag, zero-padded to the full 32-byte block.
fn x3dh_salt() -> [u8; 32] {
    let tag = b"WhatsAppCloneX3DH";
    let mut salt = [0u8; 32];
    salt[..tag.len()].copy_from_slice(tag);
    salt
}

// ── Prekey bundle (decoded view of the server response) ──────────────────────

/// A peer's published bundle, decoded to raw key bytes.
#[derive(Debug, Clone)]
pub struct PeerBundle {
    /// X25519 identity key.
    pub identity_key: [u8; 32],
    /// Ed25519 verifying key that signed the SPK.
    pub signing_key: [u8; 32],
    pub signed_prekey_id: u32,
    pub signed_prekey: [u8; 32],
    /// Ed25519 signature over the raw SPK public bytes.
    pub signed_prekey_signature: Vec<u8>,
    pub one_time_prekey: Option<OneTimeKey>,
}

#[derive(Debug, Clone, Copy)]
pub struct OneTimeKey {
    pub key_id: u32,
    pub public: [u8; 32],
}

impl PeerBundle {
    /// Check the SPK signature against the bundle's signing key.
    pub fn verify(&self) -> Result<(), CryptoError> {
        identity::verify(
            &self.signing_key,
            &self.signed_prekey,
            &self.signed_prekey_signature,
        )
    }
}

// ── Prekey generation (responder side material) ──────────────────────────────

/// Generate a signed prekey: an X25519 pair whose public half is signed by
/// the identity's Ed25519 key.
pub fn generate_signed_prekey(identity: &Identity) -> (StaticSecret, X25519Public, [u8; 64]) {
    let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let public = X25519Public::from(&secret);
    let sig = identity.sign(public.as_bytes());
    (secret, public, sig)
}

/// Generate a batch of one-time prekeys.
pub fn generate_one_time_prekeys(count: usize) -> Vec<(StaticSecret, X25519Public)> {
    (0..count)
        .map(|_| {
            let s = StaticSecret::random_from_rng(rand::rngs::OsRng);
            let p = X25519Public::from(&s);
            (s, p)
        })
        .collect()
}

// ── Initiator ────────────────────────────────────────────────────────────────

/// Outcome of the initiator handshake. Scrubbed on drop.
#[derive(zeroize::ZeroizeOnDrop)]
pub struct InitiatorAgreement {
    /// 32-byte shared key — the Double Ratchet's initial root key.
    pub shared_key: [u8; 32],
    /// Ephemeral secret, retained until the first message round-trip.
    pub ephemeral_secret: [u8; 32],
    pub ephemeral_public: [u8; 32],
    /// Which OPK the bundle spent, if any.
    pub used_one_time_prekey_id: Option<u32>,
}

/// Initiate a session against a peer's bundle.
pub fn initiate(me: &Identity, bundle: &PeerBundle) -> Result<InitiatorAgreement, CryptoError> {
    bundle.verify()?;

    let ik_b = X25519Public::from(bundle.identity_key);
    let spk_b = X25519Public::from(bundle.signed_prekey);

    let ek_a = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let ek_a_pub = X25519Public::from(&ek_a);

    let dh1 = me.agreement_secret().diffie_hellman(&spk_b);
    let dh2 = ek_a.diffie_hellman(&ik_b);
    let dh3 = ek_a.diffie_hellman(&spk_b);

    let mut ikm = Vec::with_capacity(4 * 32);
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    let mut used_opk = None;
    if let Some(opk) = &bundle.one_time_prekey {
        let dh4 = ek_a.diffie_hellman(&X25519Public::from(opk.public));
        ikm.extend_from_slice(dh4.as_bytes());
        used_opk = Some(opk.key_id);
    }

    let mut sk = [0u8; 32];
    kdf::hkdf_expand(&ikm, Some(&x3dh_salt()), b"SharedSecret", &mut sk)?;
    ikm.zeroize();

    Ok(InitiatorAgreement {
        shared_key: sk,
        ephemeral_secret: ek_a.to_bytes(),
        ephemeral_public: ek_a_pub.to_bytes(),
        used_one_time_prekey_id: used_opk,
    })
}

// ── Responder ────────────────────────────────────────────────────────────────

/// Reconstruct SK from the initiator's prelude material.
///
/// `spk_secret` — the signed prekey the initiator's bundle referenced.
/// `opk_secret` — the consumed one-time prekey, if the prelude names one.
pub fn respond(
    me: &Identity,
    spk_secret: &StaticSecret,
    opk_secret: Option<&StaticSecret>,
    initiator_identity: &[u8; 32],
    initiator_ephemeral: &[u8; 32],
) -> Result<[u8; 32], CryptoError> {
    let ik_a = X25519Public::from(*initiator_identity);
    let ek_a = X25519Public::from(*initiator_ephemeral);

    // Mirror the initiator's DH order exactly (DH is commutative per pair):
    //   DH1 = IK_A × SPK_B, DH2 = EK_A × IK_B, DH3 = EK_A × SPK_B
    let dh1 = spk_secret.diffie_hellman(&ik_a);
    let dh2 = me.agreement_secret().diffie_hellman(&ek_a);
    let dh3 = spk_secret.diffie_hellman(&ek_a);

    let mut ikm = Vec::with_capacity(4 * 32);
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    if let Some(opk) = opk_secret {
        let dh4 = opk.diffie_hellman(&ek_a);
        ikm.extend_from_slice(dh4.as_bytes());
    }

    let mut sk = [0u8; 32];
    kdf::hkdf_expand(&ikm, Some(&x3dh_salt()), b"SharedSecret", &mut sk)?;
    ikm.zeroize();

    Ok(sk)
}
