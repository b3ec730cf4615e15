//! Key negotiation and layered cell encryption.
//!
//! Each hop of a circuit negotiates a pair of direction keys through
//! an ephemeral-ephemeral Diffie-Hellman exchange, expanded with
//! HKDF-SHA256. Cell bodies are onion-wrapped with one AES-128-CTR
//! layer per hop; every layer carries a fresh random IV, so cells are
//! independent and loss-tolerant.
//!
//! There is no per-cell authenticator at this layer: a corrupted or
//! mis-keyed cell surfaces as a decode failure in the layer above,
//! which tears the circuit down.

use cipher::{KeyIvInit, StreamCipher};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{Error, Result};

/// The AES-128 counter-mode instance used for layer encryption.
type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// Length of a layer IV, in bytes.
const IV_LEN: usize = 16;
/// Domain-separation label for circuit key expansion.
const KEY_EXPANSION_LABEL: &[u8] = b"circuit key expansion";

/// The negotiated direction keys for one hop.
///
/// `forward` protects traffic flowing from the initiator toward the
/// exit; `backward` protects the reverse direction. The key bytes are
/// wiped on drop; clones (each side of a relay pair holds one) wipe
/// independently.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    /// Key for initiator-to-exit traffic.
    forward: [u8; 16],
    /// Key for exit-to-initiator traffic.
    backward: [u8; 16],
}

impl SessionKeys {
    /// Derive direction keys from a raw shared secret.
    fn derive(shared: &[u8]) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(None, shared);
        let mut okm = [0_u8; 32];
        hk.expand(KEY_EXPANSION_LABEL, &mut okm)
            .map_err(|_| Error::CryptoFailure("key expansion failed"))?;
        let mut forward = [0_u8; 16];
        let mut backward = [0_u8; 16];
        forward.copy_from_slice(&okm[..16]);
        backward.copy_from_slice(&okm[16..]);
        okm.zeroize();
        Ok(SessionKeys { forward, backward })
    }

    /// Encrypt one forward layer onto `body`.
    pub fn encrypt_forward(&self, body: &[u8]) -> Vec<u8> {
        seal(&self.forward, body)
    }

    /// Remove one forward layer from `body`.
    pub fn decrypt_forward(&self, body: &[u8]) -> Result<Vec<u8>> {
        open(&self.forward, body)
    }

    /// Encrypt one backward layer onto `body`.
    pub fn encrypt_backward(&self, body: &[u8]) -> Vec<u8> {
        seal(&self.backward, body)
    }

    /// Remove one backward layer from `body`.
    pub fn decrypt_backward(&self, body: &[u8]) -> Result<Vec<u8>> {
        open(&self.backward, body)
    }
}

/// The initiator half of a handshake, waiting for the responder's key.
pub struct HandshakeState {
    /// Our ephemeral secret. Wipes itself on drop.
    secret: EphemeralSecret,
}

impl HandshakeState {
    /// Start a handshake: produce our key half to put on the wire.
    pub fn start() -> (HandshakeState, [u8; 32]) {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        (HandshakeState { secret }, public.to_bytes())
    }

    /// Complete the handshake with the responder's key half.
    pub fn finish(self, responder: &[u8; 32]) -> Result<SessionKeys> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*responder));
        if !shared.was_contributory() {
            return Err(Error::CryptoFailure("low-order handshake key"));
        }
        SessionKeys::derive(shared.as_bytes())
    }
}

/// Answer a handshake as the responder: derive the session keys and
/// produce our key half for the wire.
pub fn respond(initiator: &[u8; 32]) -> Result<([u8; 32], SessionKeys)> {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret).to_bytes();
    let shared = secret.diffie_hellman(&PublicKey::from(*initiator));
    if !shared.was_contributory() {
        return Err(Error::CryptoFailure("low-order handshake key"));
    }
    Ok((public, SessionKeys::derive(shared.as_bytes())?))
}

/// Encrypt `body` under `key` with a fresh IV, returning `iv ‖ ciphertext`.
fn seal(key: &[u8; 16], body: &[u8]) -> Vec<u8> {
    let mut iv = [0_u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    let mut out = Vec::with_capacity(IV_LEN + body.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(body);
    let mut cipher = Aes128Ctr::new(key.into(), (&iv).into());
    cipher.apply_keystream(&mut out[IV_LEN..]);
    out
}

/// Invert [`seal`]: strip the IV and decrypt the rest.
fn open(key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < IV_LEN {
        return Err(Error::CryptoFailure("layer shorter than its IV"));
    }
    let (iv, body) = data.split_at(IV_LEN);
    let mut out = body.to_vec();
    let iv: [u8; IV_LEN] = iv.try_into().map_err(|_| Error::CryptoFailure("bad IV"))?;
    let mut cipher = Aes128Ctr::new(key.into(), (&iv).into());
    cipher.apply_keystream(&mut out);
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::unwrap_used)]

    use super::*;

    /// Run a handshake, returning both sides' keys.
    fn handshake() -> (SessionKeys, SessionKeys) {
        let (state, initiator_half) = HandshakeState::start();
        let (responder_half, responder_keys) = respond(&initiator_half).unwrap();
        let initiator_keys = state.finish(&responder_half).unwrap();
        (initiator_keys, responder_keys)
    }

    #[test]
    fn handshake_agrees() {
        let (a, b) = handshake();
        assert_eq!(a.forward, b.forward);
        assert_eq!(a.backward, b.backward);
        assert_ne!(a.forward, a.backward);
    }

    #[test]
    fn layer_roundtrip() {
        let (a, b) = handshake();
        let body = b"an entirely innocuous datagram";
        let sealed = a.encrypt_forward(body);
        assert_ne!(&sealed[IV_LEN..], &body[..]);
        assert_eq!(b.decrypt_forward(&sealed).unwrap(), body.to_vec());

        let sealed = b.encrypt_backward(body);
        assert_eq!(a.decrypt_backward(&sealed).unwrap(), body.to_vec());
    }

    #[test]
    fn fresh_iv_every_layer() {
        let (a, _) = handshake();
        let one = a.encrypt_forward(b"same input");
        let two = a.encrypt_forward(b"same input");
        assert_ne!(one, two);
    }

    #[test]
    fn onion_order() {
        // Three hops: encrypt outermost-last, peel outermost-first.
        let hops: Vec<SessionKeys> = (0..3).map(|_| handshake().0).collect();
        let mut body = b"innermost".to_vec();
        for hop in hops.iter().rev() {
            body = hop.encrypt_forward(&body);
        }
        for hop in hops.iter() {
            body = hop.decrypt_forward(&body).unwrap();
        }
        assert_eq!(body, b"innermost".to_vec());
    }

    #[test]
    fn truncated_layer_rejected() {
        let (a, _) = handshake();
        assert!(a.decrypt_forward(&[1, 2, 3]).is_err());
    }
}
