// drivevault key material helpers
// Argon2id passphrase stretching + HKDF key separation for the encryption transform

use hkdf::Hkdf;
use sha2::{Digest, Sha256};

pub const ARGON2_MEM_COST: u32 = 65536; // 64MB
pub const ARGON2_TIME_COST: u32 = 3;
pub const ARGON2_PARALLELISM: u32 = 4;

const CIPHER_KEY_INFO: &[u8] = b"drivevault-v1-cipher";
const MAC_KEY_INFO: &[u8] = b"drivevault-v1-mac";

/// Derive a 256-bit master key from passphrase + salt using Argon2id
pub fn derive_key(passphrase: &str, salt: &[u8]) -> Result<[u8; 32], String> {
    let params = argon2::Params::new(
        ARGON2_MEM_COST,
        ARGON2_TIME_COST,
        ARGON2_PARALLELISM,
        Some(32),
    ).map_err(|e| format!("Argon2 params: {}", e))?;

    let argon2 = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut key = [0u8; 32];
    argon2.hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| format!("Argon2 derive: {}", e))?;
    Ok(key)
}

/// Split a master key into independent cipher and MAC keys (HKDF-SHA256)
pub fn split_master_key(master: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), String> {
    let hk = Hkdf::<Sha256>::new(None, master);
    let mut cipher_key = [0u8; 32];
    let mut mac_key = [0u8; 32];
    hk.expand(CIPHER_KEY_INFO, &mut cipher_key)
        .map_err(|e| format!("HKDF expand: {}", e))?;
    hk.expand(MAC_KEY_INFO, &mut mac_key)
        .map_err(|e| format!("HKDF expand: {}", e))?;
    Ok((cipher_key, mac_key))
}

/// Generate cryptographically secure random bytes using OS entropy
pub fn random_bytes(len: usize) -> Vec<u8> {
    use rand::rngs::OsRng;
    use rand::RngCore;
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Lowercase hex SHA-256
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
