//! ECDH P-256 handshake → AES-GCM-256 AEAD channel with counter-based
//! nonce and sliding-window replay protection (spec §4.3).

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use p256::ecdh::EphemeralSecret;
use p256::{EncodedPoint, PublicKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::error::SecurityError;

const HANDSHAKE_LABEL: &[u8] = b"voxcore-handshake-v1";
const EXPAND_LABEL: &[u8] = b"voxcore-channel-keys-v1";
const REPLAY_WINDOW_BITS: u64 = 64;

/// One derived AEAD channel direction: a 32-byte key plus a 4-byte nonce
/// prefix, role-assigned deterministically during the handshake.
struct ChannelKey {
    cipher: Aes256Gcm,
    nonce_prefix: [u8; 4],
}

/// `(nonce, ciphertext, tag)` returned by [`SecuritySession::encrypt`].
type SealedFrame = ([u8; 12], Vec<u8>, [u8; 16]);

/// Sliding bitmap replay window over AEAD counters (spec §4.3).
struct ReplayWindow {
    max_counter: Option<u64>,
    window: u64,
}

impl ReplayWindow {
    fn new() -> Self {
        Self { max_counter: None, window: 0 }
    }

    /// Accept or reject `counter`, updating state on acceptance.
    fn check_and_record(&mut self, counter: u64) -> Result<(), SecurityError> {
        let max = match self.max_counter {
            None => {
                self.max_counter = Some(counter);
                self.window = 1;
                return Ok(());
            }
            Some(m) => m,
        };
        if counter > max {
            let shift = counter - max;
            self.window = if shift >= REPLAY_WINDOW_BITS { 0 } else { self.window << shift };
            self.window |= 1;
            self.max_counter = Some(counter);
            Ok(())
        } else {
            let behind = max - counter;
            if behind >= REPLAY_WINDOW_BITS {
                Err(SecurityError::ReplayOutsideWindow)
            } else if self.window & (1 << behind) != 0 {
                Err(SecurityError::ReplayDetected)
            } else {
                self.window |= 1 << behind;
                Ok(())
            }
        }
    }
}

/// Handshake + per-packet AEAD state for one peer session.
pub struct SecuritySession {
    local_secret: Option<EphemeralSecret>,
    local_public: EncodedPoint,
    send: Option<ChannelKey>,
    recv: Option<ChannelKey>,
    send_counter: u64,
    replay: ReplayWindow,
}

impl SecuritySession {
    /// Generate a fresh ephemeral P-256 key pair for a new handshake.
    pub fn new() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public = EncodedPoint::from(p256::PublicKey::from(&secret));
        Self {
            local_secret: Some(secret),
            local_public: public,
            send: None,
            recv: None,
            send_counter: 0,
            replay: ReplayWindow::new(),
        }
    }

    /// This side's raw `X || Y` public point, to be sent to the peer.
    pub fn local_public_key(&self) -> Vec<u8> {
        self.local_public.as_bytes().to_vec()
    }

    pub fn is_established(&self) -> bool {
        self.send.is_some() && self.recv.is_some()
    }

    /// Complete the handshake given the peer's raw public key bytes.
    /// Consumes the ephemeral private key; zeroizes all intermediate
    /// secret material before returning.
    pub fn complete_handshake(&mut self, remote_public: &[u8]) -> Result<(), SecurityError> {
        let remote_point =
            EncodedPoint::from_bytes(remote_public).map_err(|_| SecurityError::InvalidRemoteKey)?;
        let remote_pub =
            PublicKey::from_sec1_bytes(remote_point.as_bytes()).map_err(|_| SecurityError::InvalidRemoteKey)?;

        let secret = self.local_secret.take().ok_or(SecurityError::HandshakeIncomplete)?;
        let shared = secret.diffie_hellman(&remote_pub);
        let mut shared_bytes = shared.raw_secret_bytes().to_vec();

        let local_bytes = self.local_public.as_bytes();
        let remote_bytes = remote_point.as_bytes();
        // Orientation-independent transcript: hash is identical regardless
        // of which side computes it, so both sides derive the same PRK
        // without needing to agree on roles up front.
        let (lo, hi) = if local_bytes <= remote_bytes {
            (local_bytes, remote_bytes)
        } else {
            (remote_bytes, local_bytes)
        };
        let mut hasher = Sha256::new();
        hasher.update(HANDSHAKE_LABEL);
        hasher.update(lo);
        hasher.update(hi);
        let transcript = hasher.finalize();

        let hk = Hkdf::<Sha256>::new(Some(&transcript), &shared_bytes);
        let mut okm = [0u8; 2 * 32 + 2 * 4];
        hk.expand(EXPAND_LABEL, &mut okm)
            .expect("okm length is a valid HKDF-SHA256 expand size");
        shared_bytes.zeroize();

        let key0: [u8; 32] = okm[0..32].try_into().unwrap();
        let key1: [u8; 32] = okm[32..64].try_into().unwrap();
        let prefix0: [u8; 4] = okm[64..68].try_into().unwrap();
        let prefix1: [u8; 4] = okm[68..72].try_into().unwrap();
        okm.zeroize();

        // Deterministic, role-free assignment: lexicographically smaller
        // public key sends with (key0, prefix0).
        let we_are_smaller = local_bytes <= remote_bytes;
        let (send_key, send_prefix, recv_key, recv_prefix) = if we_are_smaller {
            (key0, prefix0, key1, prefix1)
        } else {
            (key1, prefix1, key0, prefix0)
        };

        self.send = Some(ChannelKey {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&send_key)),
            nonce_prefix: send_prefix,
        });
        self.recv = Some(ChannelKey {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&recv_key)),
            nonce_prefix: recv_prefix,
        });
        let mut send_key = send_key;
        let mut recv_key = recv_key;
        send_key.zeroize();
        recv_key.zeroize();
        Ok(())
    }

    /// Encrypt one frame. Returns `(ciphertext, iv, tag)` with `iv` being
    /// the full 12-byte nonce (`prefix || counter`) and `tag` the 16-byte
    /// AEAD authentication tag, split out for `EncryptedEnvelope` framing.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<SealedFrame, SecurityError> {
        let send = self.send.as_ref().ok_or(SecurityError::HandshakeIncomplete)?;
        self.send_counter += 1;
        let counter = self.send_counter;
        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[..4].copy_from_slice(&send.nonce_prefix);
        nonce_bytes[4..].copy_from_slice(&counter.to_be_bytes());

        let mut sealed = send
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), Payload { msg: plaintext, aad: &[] })
            .map_err(|_| SecurityError::AuthenticationFailure)?;
        let tag_start = sealed.len() - 16;
        let mut tag = [0u8; 16];
        tag.copy_from_slice(&sealed[tag_start..]);
        sealed.truncate(tag_start);
        Ok((nonce_bytes, sealed, tag))
    }

    /// Decrypt one frame. `iv` is the 12-byte nonce, `tag` the 16-byte AEAD
    /// tag, `ciphertext` the sealed body without the tag appended back on
    /// before calling (this reassembles it internally).
    pub fn decrypt(&mut self, iv: &[u8; 12], ciphertext: &[u8], tag: &[u8; 16]) -> Result<Vec<u8>, SecurityError> {
        let recv = self.recv.as_ref().ok_or(SecurityError::HandshakeIncomplete)?;
        if iv[..4] != recv.nonce_prefix {
            return Err(SecurityError::InvalidNonce);
        }
        let counter = u64::from_be_bytes(iv[4..12].try_into().unwrap());

        let mut sealed = Vec::with_capacity(ciphertext.len() + 16);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);
        let plaintext = recv
            .cipher
            .decrypt(Nonce::from_slice(iv), Payload { msg: &sealed, aad: &[] })
            .map_err(|_| SecurityError::AuthenticationFailure)?;

        // Replay check only after a verified authentic frame, so a
        // forged packet can never poison the window.
        self.replay.check_and_record(counter)?;
        Ok(plaintext)
    }
}

impl Drop for SecuritySession {
    fn drop(&mut self) {
        // `Aes256Gcm`/`EphemeralSecret` already zeroize their own key
        // material on drop; this just makes the intent explicit and
        // covers the plain counters that aren't secret but shouldn't
        // linger either.
        self.send_counter = 0;
    }
}

impl Default for SecuritySession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn handshake_pair() -> (SecuritySession, SecuritySession) {
        let mut a = SecuritySession::new();
        let mut b = SecuritySession::new();
        let a_pub = a.local_public_key();
        let b_pub = b.local_public_key();
        a.complete_handshake(&b_pub).unwrap();
        b.complete_handshake(&a_pub).unwrap();
        (a, b)
    }

    #[test]
    fn handshake_establishes_both_sides() {
        let (a, b) = handshake_pair();
        assert!(a.is_established());
        assert!(b.is_established());
    }

    #[test]
    fn aead_roundtrip_and_replay_rejection() {
        let (mut a, mut b) = handshake_pair();
        let (iv, ct, tag) = a.encrypt(&[1, 2, 3]).unwrap();
        let pt = b.decrypt(&iv, &ct, &tag).unwrap();
        assert_eq!(pt, vec![1, 2, 3]);

        let err = b.decrypt(&iv, &ct, &tag).unwrap_err();
        assert_eq!(err, SecurityError::ReplayDetected);
    }

    #[test]
    fn invalid_remote_key_length_rejected() {
        let mut a = SecuritySession::new();
        let err = a.complete_handshake(&[1, 2, 3]).unwrap_err();
        assert_eq!(err, SecurityError::InvalidRemoteKey);
    }

    #[test]
    fn wrong_nonce_prefix_rejected() {
        let (mut a, mut b) = handshake_pair();
        let (mut iv, ct, tag) = a.encrypt(&[9]).unwrap();
        iv[0] ^= 0xFF;
        let err = b.decrypt(&iv, &ct, &tag).unwrap_err();
        assert_eq!(err, SecurityError::InvalidNonce);
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let (mut a, mut b) = handshake_pair();
        let (iv, mut ct, tag) = a.encrypt(&[1, 2, 3]).unwrap();
        ct[0] ^= 0xFF;
        let err = b.decrypt(&iv, &ct, &tag).unwrap_err();
        assert_eq!(err, SecurityError::AuthenticationFailure);
    }

    #[test]
    fn replay_window_boundary() {
        let (mut a, mut b) = handshake_pair();
        let mut frames = Vec::new();
        for i in 0..65 {
            frames.push(a.encrypt(&[i as u8]).unwrap());
        }
        // Decrypt the newest first to set max_counter = 65.
        let (iv, ct, tag) = &frames[64];
        b.decrypt(iv, ct, tag).unwrap();
        // counter == max - 63 is inside the window: accepted once.
        let (iv, ct, tag) = &frames[1];
        b.decrypt(iv, ct, tag).unwrap();
        // counter == max - 64 is outside the window.
        let (iv, ct, tag) = &frames[0];
        let err = b.decrypt(iv, ct, tag).unwrap_err();
        assert_eq!(err, SecurityError::ReplayOutsideWindow);
    }

    #[test]
    fn handshake_symmetry_regardless_of_who_computes_transcript_first() {
        let (a, b) = handshake_pair();
        // Both sides must have assigned complementary (not identical)
        // send/recv roles; encrypting on one and decrypting on the other
        // is the externally observable proof of that, exercised above.
        assert!(a.is_established() && b.is_established());
    }
}
