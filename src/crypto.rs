/// Conversation-key encryption for the message envelope.
///
/// Static-static X25519 Diffie-Hellman + XChaCha20-Poly1305 AEAD. Both
/// parties derive the identical key from their own secret and the other's
/// public key, so either side of a conversation can open a layer addressed
/// to it. Forward secrecy for the outer envelope layer comes from the
/// single-use wrap key generated per send, not from ephemeral DH here.
///
/// Key derivation: Ed25519 signing keys → X25519 via the standard
/// Edwards→Montgomery conversion (same as libsodium).
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::SigningKey;
use hkdf::Hkdf;
use sha2::{Digest, Sha256, Sha512};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519Secret};

use crate::error::MeshError;

/// HKDF info string for domain separation.
const HKDF_INFO: &[u8] = b"agentmesh-conversation-key-v1";

/// Armor format version byte prepended to every ciphertext.
const ARMOR_VERSION: u8 = 1;

/// XChaCha20 extended nonce length.
const NONCE_LEN: usize = 24;

/// Poly1305 authentication tag length.
const TAG_LEN: usize = 16;

/// Convert an Ed25519 public key to an X25519 public key.
///
/// Uses the birational map from the Edwards curve to Montgomery form.
/// Equivalent to libsodium's `crypto_sign_ed25519_pk_to_curve25519`.
fn ed25519_to_x25519_public(ed25519_pk: &[u8; 32]) -> Result<[u8; 32], MeshError> {
    let compressed = CompressedEdwardsY(*ed25519_pk);
    let edwards = compressed.decompress().ok_or_else(|| {
        MeshError::Crypto("invalid Ed25519 public key: decompression failed".into())
    })?;
    Ok(edwards.to_montgomery().to_bytes())
}

/// Convert an Ed25519 secret key (32-byte seed) to an X25519 secret key.
///
/// Mirrors libsodium's `crypto_sign_ed25519_sk_to_curve25519`:
/// SHA-512(seed), take first 32 bytes, clamp.
fn ed25519_to_x25519_secret(ed25519_seed: &[u8; 32]) -> [u8; 32] {
    let hash = Sha512::digest(ed25519_seed);
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&hash[..32]);
    // Standard X25519 clamping
    secret[0] &= 248;
    secret[31] &= 127;
    secret[31] |= 64;
    secret
}

/// Decode a hex-encoded Ed25519 public key.
pub fn decode_public_key(hex_pubkey: &str) -> Result<[u8; 32], MeshError> {
    hex::decode(hex_pubkey)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| MeshError::Crypto("public key is not 32 hex-encoded bytes".into()))
}

/// Derive the shared conversation key between one party's Ed25519 seed and
/// the other party's Ed25519 public key.
///
/// Symmetric: `conversation_key(a_seed, b_pk) == conversation_key(b_seed, a_pk)`.
pub fn conversation_key(
    my_seed: &[u8; 32],
    their_ed25519_pk: &[u8; 32],
) -> Result<[u8; 32], MeshError> {
    let secret = X25519Secret::from(ed25519_to_x25519_secret(my_seed));
    let public = X25519PublicKey::from(ed25519_to_x25519_public(their_ed25519_pk)?);
    let shared = secret.diffie_hellman(&public);

    let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut key = [0u8; 32];
    hkdf.expand(HKDF_INFO, &mut key)
        .expect("HKDF-SHA256 expand to 32 bytes always succeeds");
    Ok(key)
}

/// Encrypt UTF-8 plaintext under a conversation key.
///
/// Output is base64 of `version ‖ nonce ‖ ciphertext+tag`, suitable for an
/// event content string.
pub fn encrypt(plaintext: &str, key: &[u8; 32]) -> Result<String, MeshError> {
    use chacha20poly1305::aead::rand_core::{OsRng, RngCore};

    let cipher = XChaCha20Poly1305::new(key.into());

    // Random 24-byte nonce (safe for random generation with XChaCha20)
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from(nonce_bytes);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| MeshError::Crypto(format!("encryption failed: {e}")))?;

    let mut armored = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
    armored.push(ARMOR_VERSION);
    armored.extend_from_slice(&nonce_bytes);
    armored.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(armored))
}

/// Decrypt an armored ciphertext string under a conversation key.
///
/// Fails loudly for the wrong key, a corrupted ciphertext, or an unknown
/// armor version.
pub fn decrypt(armored: &str, key: &[u8; 32]) -> Result<String, MeshError> {
    let data = BASE64
        .decode(armored)
        .map_err(|_| MeshError::Decryption("invalid base64 armor".into()))?;
    if data.len() < 1 + NONCE_LEN + TAG_LEN {
        return Err(MeshError::Decryption("armored payload too short".into()));
    }
    if data[0] != ARMOR_VERSION {
        return Err(MeshError::Decryption(format!(
            "unsupported armor version: {}",
            data[0]
        )));
    }

    let nonce_bytes: [u8; NONCE_LEN] = data[1..1 + NONCE_LEN]
        .try_into()
        .expect("slice length checked above");
    let nonce = XNonce::from(nonce_bytes);

    let cipher = XChaCha20Poly1305::new(key.into());
    let plaintext = cipher
        .decrypt(&nonce, &data[1 + NONCE_LEN..])
        .map_err(|_| MeshError::Decryption("authentication error".into()))?;

    String::from_utf8(plaintext)
        .map_err(|_| MeshError::Decryption("plaintext is not valid UTF-8".into()))
}

/// Generate a fresh Ed25519 signing key from the OS entropy source.
///
/// Used for identity creation and for the single-use gift-wrap keys.
pub fn fresh_signing_key() -> SigningKey {
    use chacha20poly1305::aead::rand_core::OsRng;
    SigningKey::generate(&mut OsRng)
}

/// Uniform random u64 from the OS entropy source.
pub(crate) fn random_u64() -> u64 {
    use chacha20poly1305::aead::rand_core::{OsRng, RngCore};
    OsRng.next_u64()
}
