//! Encrypted message envelope — what the transport carries.
//!
//! Textual form: the version tag `E2EE:` followed by a compact JSON object:
//!
//! ```text
//! E2EE:{"ciphertext":"<b64>","header":{"dh":"<hex>","pn":0,"n":0},
//!       "x3dh":{"ik":"<hex>","ek":"<hex>","opk_id":7}?}
//! ```
//!
//! Binary fields are lowercase hex (keys) or base64 (ciphertext). The `x3dh`
//! prelude appears only on the first-ever message of a session so the
//! responder can reconstruct the shared secret; every later message carries
//! the ratchet header alone.
//!
//! The relay cannot see: plaintext, message type, or anything beyond the
//! ratchet counters it needs to do nothing with.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use sl_crypto::ratchet::MessageHeader;

/// Version tag. A future binary format would change this prefix.
pub const ENVELOPE_TAG: &str = "E2EE:";

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("missing {ENVELOPE_TAG} tag")]
    MissingTag,

    #[error("malformed envelope JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bad envelope field: {0}")]
    Field(String),
}

/// Decoded envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub header: MessageHeader,
    pub ciphertext: Vec<u8>,
    pub x3dh: Option<X3dhPrelude>,
}

/// Handshake prelude: what the responder needs to derive the shared secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct X3dhPrelude {
    /// Initiator's X25519 identity public key.
    pub identity_key: [u8; 32],
    /// Initiator's ephemeral public key.
    pub ephemeral_key: [u8; 32],
    /// One-time prekey the initiator's bundle spent, if any.
    pub opk_id: Option<u32>,
}

// ── Wire shape ───────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    ciphertext: String,
    header: WireHeader,
    #[serde(skip_serializing_if = "Option::is_none")]
    x3dh: Option<WirePrelude>,
}

#[derive(Serialize, Deserialize)]
struct WireHeader {
    dh: String,
    pn: u64,
    n: u64,
}

#[derive(Serialize, Deserialize)]
struct WirePrelude {
    ik: String,
    ek: String,
    opk_id: Option<u32>,
}

fn hex32(field: &str, s: &str) -> Result<[u8; 32], EnvelopeError> {
    let bytes = hex::decode(s).map_err(|e| EnvelopeError::Field(format!("{field}: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| EnvelopeError::Field(format!("{field}: expected 32 bytes")))
}

impl Envelope {
    pub fn encode(&self) -> String {
        let wire = WireEnvelope {
            ciphertext: URL_SAFE_NO_PAD.encode(&self.ciphertext),
            header: WireHeader {
                dh: hex::encode(self.header.dh),
                pn: self.header.pn,
                n: self.header.n,
            },
            x3dh: self.x3dh.as_ref().map(|p| WirePrelude {
                ik: hex::encode(p.identity_key),
                ek: hex::encode(p.ephemeral_key),
                opk_id: p.opk_id,
            }),
        };
        let json = serde_json::to_string(&wire).expect("envelope serialization is infallible");
        format!("{ENVELOPE_TAG}{json}")
    }

    pub fn decode(text: &str) -> Result<Self, EnvelopeError> {
        let json = text.strip_prefix(ENVELOPE_TAG).ok_or(EnvelopeError::MissingTag)?;
        let wire: WireEnvelope = serde_json::from_str(json)?;

        let ciphertext = URL_SAFE_NO_PAD
            .decode(&wire.ciphertext)
            .map_err(|e| EnvelopeError::Field(format!("ciphertext: {e}")))?;

        let x3dh = match wire.x3dh {
            None => None,
            Some(p) => Some(X3dhPrelude {
                identity_key: hex32("x3dh.ik", &p.ik)?,
                ephemeral_key: hex32("x3dh.ek", &p.ek)?,
                opk_id: p.opk_id,
            }),
        };

        Ok(Self {
            header: MessageHeader {
                dh: hex32("header.dh", &wire.header.dh)?,
                pn: wire.header.pn,
                n: wire.header.n,
            },
            ciphertext,
            x3dh,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(with_prelude: bool) -> Envelope {
        Envelope {
            header: MessageHeader { dh: [0x1f; 32], pn: 2, n: 9 },
            ciphertext: vec![1, 2, 3, 4, 5],
            x3dh: with_prelude.then_some(X3dhPrelude {
                identity_key: [0xaa; 32],
                ephemeral_key: [0xbb; 32],
                opk_id: Some(41),
            }),
        }
    }

    #[test]
    fn roundtrip_without_prelude() {
        let env = sample(false);
        let text = env.encode();
        assert!(text.starts_with("E2EE:{"));
        assert!(!text.contains("x3dh"), "prelude is omitted, not null");
        assert_eq!(Envelope::decode(&text).unwrap(), env);
    }

    #[test]
    fn roundtrip_with_prelude() {
        let env = sample(true);
        let decoded = Envelope::decode(&env.encode()).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(decoded.x3dh.unwrap().opk_id, Some(41));
    }

    #[test]
    fn rejects_missing_tag() {
        let env = sample(false);
        let text = env.encode();
        assert!(matches!(
            Envelope::decode(&text["E2EE:".len()..]),
            Err(EnvelopeError::MissingTag)
        ));
    }

    #[test]
    fn rejects_short_ratchet_key() {
        let text = r#"E2EE:{"ciphertext":"AQID","header":{"dh":"aabb","pn":0,"n":0}}"#;
        assert!(matches!(
            Envelope::decode(text),
            Err(EnvelopeError::Field(_))
        ));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            Envelope::decode("E2EE:{\"ciphertext\":"),
            Err(EnvelopeError::Json(_))
        ));
    }
}
