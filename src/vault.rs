//! PIN-sealed seed storage
//!
//! The self-custodial mnemonic is persisted only as an [`EncryptedSeed`]:
//! Argon2id derives a key from the PIN and a random salt, ChaCha20-Poly1305
//! seals the phrase, and a blake3 hash of the derived key lets a wrong PIN be
//! rejected before any decryption is attempted.

use argon2::Argon2;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{WalletError, WalletResult};

const AAD_MNEMONIC: &[u8] = b"buho-spark-mnemonic";
const VERSION: u8 = 1;
pub const MIN_PIN_LEN: usize = 4;

/// Sealed mnemonic as stored in the wallet's connection data. All byte fields are base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSeed {
    pub version: u8,
    pub salt: String,
    pub verifier: String,
    pub nonce: String,
    pub ciphertext: String,
}

/// Seal `mnemonic` under `pin`.
pub fn seal(mnemonic: &str, pin: &str) -> WalletResult<EncryptedSeed> {
    check_pin(pin)?;
    let mut salt = [0u8; 16];
    let mut nonce = [0u8; 12];
    let mut rng = rand::thread_rng();
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut nonce);

    let key = derive_key(pin, &salt)?;
    let cipher = ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(&key[..]));
    let ciphertext = cipher
        .encrypt(
            chacha20poly1305::Nonce::from_slice(&nonce),
            Payload { msg: mnemonic.as_bytes(), aad: AAD_MNEMONIC },
        )
        .map_err(|e| WalletError::Storage(format!("seal: {e}")))?;

    Ok(EncryptedSeed {
        version: VERSION,
        salt: encode_base64(&salt),
        verifier: verifier(&key),
        nonce: encode_base64(&nonce),
        ciphertext: encode_base64(&ciphertext),
    })
}

/// Recover the mnemonic. A wrong PIN is a validation error, not a storage error.
pub fn open(seed: &EncryptedSeed, pin: &str) -> WalletResult<Zeroizing<String>> {
    if seed.version != VERSION {
        return Err(WalletError::Storage(format!("unsupported seed version {}", seed.version)));
    }
    let salt = decode_base64(&seed.salt)?;
    let key = derive_key(pin, &salt)?;
    if verifier(&key) != seed.verifier {
        return Err(WalletError::validation("pin", "Incorrect PIN"));
    }

    let nonce: [u8; 12] = decode_base64(&seed.nonce)?
        .try_into()
        .map_err(|_| WalletError::Storage("seed nonce invalid".into()))?;
    let ciphertext = decode_base64(&seed.ciphertext)?;
    let cipher = ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(&key[..]));
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(
                chacha20poly1305::Nonce::from_slice(&nonce),
                Payload { msg: &ciphertext, aad: AAD_MNEMONIC },
            )
            .map_err(|_| WalletError::Storage("seed ciphertext corrupted".into()))?,
    );
    let phrase = std::str::from_utf8(&plaintext)
        .map_err(|e| WalletError::Storage(format!("mnemonic utf8: {e}")))?;
    Ok(Zeroizing::new(phrase.to_string()))
}

pub fn verify_pin(seed: &EncryptedSeed, pin: &str) -> WalletResult<bool> {
    let salt = decode_base64(&seed.salt)?;
    Ok(verifier(&*derive_key(pin, &salt)?) == seed.verifier)
}

fn check_pin(pin: &str) -> WalletResult<()> {
    if pin.chars().count() < MIN_PIN_LEN {
        return Err(WalletError::validation(
            "pin",
            format!("PIN must be at least {MIN_PIN_LEN} characters"),
        ));
    }
    Ok(())
}

fn derive_key(pin: &str, salt: &[u8]) -> WalletResult<Zeroizing<[u8; 32]>> {
    let mut key = Zeroizing::new([0u8; 32]);
    Argon2::default()
        .hash_password_into(pin.as_bytes(), salt, &mut *key)
        .map_err(|e| WalletError::Storage(format!("key derivation: {e}")))?;
    Ok(key)
}

fn verifier(key: &[u8; 32]) -> String {
    blake3::hash(key).to_hex().to_string()
}

fn encode_base64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn decode_base64(value: &str) -> WalletResult<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(value)
        .map_err(|e| WalletError::Storage(format!("base64: {e}")))
}
