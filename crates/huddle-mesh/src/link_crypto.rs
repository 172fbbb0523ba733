//! Key agreement and framing encryption for loopback media links.
//!
//! Each side puts an X25519 public key into its SDP. Both derive two
//! AES-256-GCM keys from the shared secret with HKDF-SHA256, one per
//! direction, so a frame sealed by one side only opens on the other.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::error::MeshError;
use crate::peer::PeerRole;

const NONCE_LEN: usize = 12;
const INITIATOR_TO_RESPONDER: &[u8] = b"HuddleLinkI2R";
const RESPONDER_TO_INITIATOR: &[u8] = b"HuddleLinkR2I";

/// Our half of a link's key agreement.
pub struct LinkKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl LinkKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_hex(&self) -> String {
        hex::encode(self.public.as_bytes())
    }

    /// Derive the directional keys for a link with `remote_hex`.
    pub fn derive(&self, remote_hex: &str, role: PeerRole) -> Result<LinkKeys, MeshError> {
        let remote = parse_public(remote_hex)?;
        let shared = self.secret.diffie_hellman(&remote);
        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());

        let mut i2r = [0u8; 32];
        let mut r2i = [0u8; 32];
        hk.expand(INITIATOR_TO_RESPONDER, &mut i2r)
            .map_err(|e| MeshError::Negotiation(format!("HKDF expand failed: {e}")))?;
        hk.expand(RESPONDER_TO_INITIATOR, &mut r2i)
            .map_err(|e| MeshError::Negotiation(format!("HKDF expand failed: {e}")))?;

        let (send, recv) = match role {
            PeerRole::Initiator => (i2r, r2i),
            PeerRole::Responder => (r2i, i2r),
        };
        Ok(LinkKeys {
            send: FrameSealer::new(send),
            recv: FrameOpener { key: recv },
        })
    }
}

fn parse_public(remote_hex: &str) -> Result<PublicKey, MeshError> {
    let bytes = hex::decode(remote_hex)
        .map_err(|e| MeshError::Negotiation(format!("bad link key: {e}")))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| MeshError::Negotiation("link key must be 32 bytes".into()))?;
    Ok(PublicKey::from(bytes))
}

pub struct LinkKeys {
    pub send: FrameSealer,
    pub recv: FrameOpener,
}

/// Encrypts outbound frames with a counter nonce.
#[derive(ZeroizeOnDrop)]
pub struct FrameSealer {
    key: [u8; 32],
    #[zeroize(skip)]
    counter: u64,
}

impl FrameSealer {
    fn new(key: [u8; 32]) -> Self {
        Self { key, counter: 0 }
    }

    /// `nonce (12) || ciphertext`. Nonces never repeat for a key.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, MeshError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| MeshError::Codec(format!("link cipher: {e}")))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes[4..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter += 1;

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| MeshError::Codec(format!("frame encryption failed: {e}")))?;

        let mut output = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        output.extend_from_slice(&nonce_bytes);
        output.extend_from_slice(&ciphertext);
        Ok(output)
    }
}

#[derive(ZeroizeOnDrop)]
pub struct FrameOpener {
    key: [u8; 32],
}

impl FrameOpener {
    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>, MeshError> {
        if data.len() < NONCE_LEN {
            return Err(MeshError::Codec("frame too short".into()));
        }
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| MeshError::Codec(format!("link cipher: {e}")))?;
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| MeshError::Codec(format!("frame decryption failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linked() -> (LinkKeys, LinkKeys) {
        let a = LinkKeyPair::generate();
        let b = LinkKeyPair::generate();
        let a_keys = a.derive(&b.public_hex(), PeerRole::Initiator).unwrap();
        let b_keys = b.derive(&a.public_hex(), PeerRole::Responder).unwrap();
        (a_keys, b_keys)
    }

    #[test]
    fn frames_open_only_in_their_direction() {
        let (mut a, mut b) = linked();
        let sealed = a.send.seal(b"pcm").unwrap();
        assert_eq!(b.recv.open(&sealed).unwrap(), b"pcm");
        assert!(a.recv.open(&sealed).is_err());

        let back = b.send.seal(b"reply").unwrap();
        assert_eq!(a.recv.open(&back).unwrap(), b"reply");
    }

    #[test]
    fn nonces_advance_per_frame() {
        let (mut a, _) = linked();
        let first = a.send.seal(b"x").unwrap();
        let second = a.send.seal(b"x").unwrap();
        assert_ne!(first[..NONCE_LEN], second[..NONCE_LEN]);
        assert_ne!(first, second);
    }

    #[test]
    fn tampered_frames_are_rejected() {
        let (mut a, b) = linked();
        let mut sealed = a.send.seal(b"pcm").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(b.recv.open(&sealed).is_err());
        assert!(b.recv.open(&[0u8; 4]).is_err());
    }

    #[test]
    fn bad_remote_keys_are_negotiation_errors() {
        let a = LinkKeyPair::generate();
        assert!(matches!(
            a.derive("zz", PeerRole::Initiator),
            Err(MeshError::Negotiation(_))
        ));
        assert!(matches!(
            a.derive("abcd", PeerRole::Initiator),
            Err(MeshError::Negotiation(_))
        ));
    }
}
