use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::error::{Result, VaultError};
use crate::types::{KEY_LEN, KeyRecord};

/// Leading byte of every sealed secret.
pub const FORMAT_VERSION: u8 = 0x01;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

const HEADER_LEN: usize = 1 + NONCE_LEN;

/// Encrypt arbitrary data with AES-256-GCM.
///
/// Output layout: `version (1) || nonce (12) || ciphertext+tag`.
/// The nonce is 12 random bytes from OsRng; `aad` is bound into the tag.
pub fn encrypt(plaintext: &[u8], key: &[u8; KEY_LEN], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| VaultError::Encryption(format!("Invalid key: {e}")))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            aes_gcm::aead::Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| VaultError::Encryption(format!("Encryption failed: {e}")))?;

    let mut output = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    output.push(FORMAT_VERSION);
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

/// Decrypt data produced by [`encrypt`].
///
/// Structural problems (too short, unknown version) are `MalformedInput`;
/// a tag mismatch (wrong key, tampering, wrong AAD) is `AuthenticationFailed`.
pub fn decrypt(sealed: &[u8], key: &[u8; KEY_LEN], aad: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < HEADER_LEN + TAG_LEN {
        return Err(VaultError::MalformedInput(format!(
            "expected at least {} bytes, got {}",
            HEADER_LEN + TAG_LEN,
            sealed.len()
        )));
    }
    if sealed[0] != FORMAT_VERSION {
        return Err(VaultError::MalformedInput(format!(
            "unsupported format version {:#04x}",
            sealed[0]
        )));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| VaultError::Encryption(format!("Invalid key: {e}")))?;
    let nonce = Nonce::from_slice(&sealed[1..HEADER_LEN]);

    cipher
        .decrypt(
            nonce,
            aes_gcm::aead::Payload {
                msg: &sealed[HEADER_LEN..],
                aad,
            },
        )
        .map_err(|_| VaultError::AuthenticationFailed)
}

/// AAD for a credential secret: binds ciphertext to its record id so a
/// ciphertext copied onto another record fails authentication.
pub fn credential_aad(id: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(11 + id.len());
    aad.extend_from_slice(b"credential:");
    aad.extend_from_slice(id.as_bytes());
    aad
}

/// Seal a credential secret under a key generation.
pub fn encrypt_secret(id: &str, secret: &str, key: &KeyRecord) -> Result<Vec<u8>> {
    encrypt(secret.as_bytes(), &key.material, &credential_aad(id))
}

/// Open a credential secret sealed by [`encrypt_secret`].
pub fn decrypt_secret(id: &str, sealed: &[u8], key: &KeyRecord) -> Result<zeroize::Zeroizing<String>> {
    let plaintext = zeroize::Zeroizing::new(decrypt(sealed, &key.material, &credential_aad(id))?);
    let text = std::str::from_utf8(&plaintext)
        .map_err(|_| VaultError::MalformedInput("secret is not valid UTF-8".to_string()))?;
    Ok(zeroize::Zeroizing::new(text.to_string()))
}

/// Short, non-reversible identifier of key material for display.
pub fn fingerprint(material: &[u8; KEY_LEN]) -> String {
    let digest = Sha256::digest(material);
    hex::encode(&digest[..8])
}
