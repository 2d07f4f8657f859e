//! AES-256-CTR stream encryption with an HMAC-SHA256 trailer
//!
//! Stream layout: `IV (16) || ciphertext || tag (32)` where the tag covers
//! `IV || ciphertext`. The IV is emitted with the first encoded block and
//! the tag with the last; decoding holds back the trailing 32 bytes until
//! the final block and fails with an integrity error if they don't verify.

use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::crypto;
use crate::providers::DriveError;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

pub const ENCRYPTION_TRANSFORM_NAME: &str = "aes-256-ctr-hmac-sha256";
pub const IV_LEN: usize = 16;
pub const TAG_LEN: usize = 32;

/// Cipher and MAC keys derived from one master key
#[derive(Clone)]
pub struct EncryptionKey {
    cipher_key: [u8; 32],
    mac_key: [u8; 32],
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

impl EncryptionKey {
    pub fn from_master(master: &[u8; 32]) -> Result<Self, DriveError> {
        let (cipher_key, mac_key) = crypto::split_master_key(master).map_err(DriveError::TransformFailed)?;
        Ok(Self { cipher_key, mac_key })
    }

    /// Stretch a passphrase with Argon2id, then split
    pub fn from_passphrase(passphrase: &str, salt: &[u8]) -> Result<Self, DriveError> {
        let master = crypto::derive_key(passphrase, salt).map_err(DriveError::InvalidConfig)?;
        Self::from_master(&master)
    }

    /// Master key given as 64 hex characters
    pub fn from_hex(hex_key: &str) -> Result<Self, DriveError> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| DriveError::InvalidConfig(format!("Encryption key is not valid hex: {}", e)))?;
        let master: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| DriveError::InvalidConfig(format!("Encryption key must be 32 bytes, got {}", bytes.len())))?;
        Self::from_master(&master)
    }
}

struct Session {
    cipher: Option<Aes256Ctr>,
    mac: HmacSha256,
    iv: Vec<u8>,
    held: Vec<u8>,
    finished: bool,
}

/// Streaming encryption transform. Clones share the key but start a fresh stream.
pub struct AesCtrTransform {
    key: EncryptionKey,
    session: Option<Session>,
    iv_nonce: Option<Vec<u8>>,
}

impl Clone for AesCtrTransform {
    fn clone(&self) -> Self {
        Self::new(self.key.clone())
    }
}

impl AesCtrTransform {
    pub fn new(key: EncryptionKey) -> Self {
        Self {
            key,
            session: None,
            iv_nonce: None,
        }
    }

    /// Next stream gets a random IV
    pub fn reset(&mut self) {
        self.session = None;
        self.iv_nonce = None;
    }

    /// Next stream derives its IV from `nonce`, so identical input encodes
    /// to identical output. `nonce` must identify the plaintext.
    pub fn reset_deterministic(&mut self, nonce: &[u8]) {
        self.session = None;
        self.iv_nonce = Some(nonce.to_vec());
    }

    fn next_iv(&self) -> Result<[u8; IV_LEN], DriveError> {
        let mut iv = [0u8; IV_LEN];
        match &self.iv_nonce {
            Some(nonce) => {
                let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key.mac_key)
                    .map_err(|e| DriveError::TransformFailed(format!("HMAC init: {}", e)))?;
                mac.update(b"drivevault-iv\n");
                mac.update(nonce);
                iv.copy_from_slice(&mac.finalize().into_bytes()[..IV_LEN]);
            }
            None => OsRng.fill_bytes(&mut iv),
        }
        Ok(iv)
    }

    fn start_session(&self) -> Result<Session, DriveError> {
        let mac = <HmacSha256 as Mac>::new_from_slice(&self.key.mac_key)
            .map_err(|e| DriveError::TransformFailed(format!("HMAC init: {}", e)))?;
        Ok(Session {
            cipher: None,
            mac,
            iv: Vec::with_capacity(IV_LEN),
            held: Vec::new(),
            finished: false,
        })
    }

    fn cipher_for(&self, iv: &[u8; IV_LEN]) -> Aes256Ctr {
        Aes256Ctr::new((&self.key.cipher_key).into(), iv.into())
    }

    pub fn encode(&mut self, chunk: &[u8], is_last: bool) -> Result<Vec<u8>, DriveError> {
        let mut session = match self.session.take() {
            Some(session) => session,
            None => self.start_session()?,
        };
        if session.finished {
            return Err(DriveError::TransformFailed("encode called after the final block".into()));
        }

        let mut out = Vec::with_capacity(chunk.len() + IV_LEN + TAG_LEN);
        if session.cipher.is_none() {
            let iv = self.next_iv()?;
            session.cipher = Some(self.cipher_for(&iv));
            session.mac.update(&iv);
            out.extend_from_slice(&iv);
        }

        let mut buf = chunk.to_vec();
        if let Some(cipher) = session.cipher.as_mut() {
            cipher.apply_keystream(&mut buf);
        }
        session.mac.update(&buf);
        out.extend_from_slice(&buf);

        if is_last {
            let tag = session.mac.clone().finalize().into_bytes();
            out.extend_from_slice(&tag);
            session.finished = true;
        }

        self.session = Some(session);
        Ok(out)
    }

    pub fn decode(&mut self, chunk: &[u8], is_last: bool) -> Result<Vec<u8>, DriveError> {
        let mut session = match self.session.take() {
            Some(session) => session,
            None => self.start_session()?,
        };
        if session.finished {
            return Err(DriveError::TransformFailed("decode called after the final block".into()));
        }

        let mut pending = std::mem::take(&mut session.held);
        pending.extend_from_slice(chunk);

        let mut offset = 0;
        if session.cipher.is_none() {
            let take = (IV_LEN - session.iv.len()).min(pending.len());
            session.iv.extend_from_slice(&pending[..take]);
            offset = take;
            if session.iv.len() == IV_LEN {
                let mut iv = [0u8; IV_LEN];
                iv.copy_from_slice(&session.iv);
                session.cipher = Some(self.cipher_for(&iv));
                session.mac.update(&iv);
            }
        }

        let body = &pending[offset..];
        let (ciphertext, withheld) = if is_last {
            if session.cipher.is_none() || body.len() < TAG_LEN {
                return Err(DriveError::Integrity("Encrypted stream is truncated".into()));
            }
            body.split_at(body.len() - TAG_LEN)
        } else {
            body.split_at(body.len() - body.len().min(TAG_LEN))
        };

        session.mac.update(ciphertext);
        let mut plain = ciphertext.to_vec();
        if let Some(cipher) = session.cipher.as_mut() {
            cipher.apply_keystream(&mut plain);
        }

        if is_last {
            session
                .mac
                .clone()
                .verify_slice(withheld)
                .map_err(|_| DriveError::Integrity("Encrypted stream failed authentication".into()))?;
            session.finished = true;
        } else {
            session.held = withheld.to_vec();
        }

        self.session = Some(session);
        Ok(plain)
    }
}
