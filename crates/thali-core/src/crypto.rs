//! Cryptographic primitives for Thali.
//!
//! Provides three things:
//!   1. secp256k1 ECDH keypairs — the long-term identity of a device
//!   2. Key hashing — the 16-byte identity surface derived from a public key
//!   3. HKDF-SHA256 / HMAC-SHA256 helpers used by the beacon codec and the
//!      PSK session-key derivation
//!
//! Public keys travel on the wire in their 65-byte uncompressed SEC1
//! encoding. Private scalars never leave this module; ECDH and key
//! derivation are exposed as free functions over [`EcdhKeypair`].

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use k256::ecdh::diffie_hellman;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

/// Wire length of an uncompressed SEC1 secp256k1 public key.
pub const PUBLIC_KEY_LENGTH: usize = 65;

/// Length of the truncated SHA-256 key hash.
pub const KEY_HASH_LENGTH: usize = 16;

/// The first 16 bytes of SHA-256 over a 65-byte public key encoding.
///
/// This is the only identity surface remote peers ever see in beacons,
/// PSK identities, and `_local` replication checkpoints.
pub type KeyHash = [u8; KEY_HASH_LENGTH];

// ── Key hashing ───────────────────────────────────────────────────────────────

/// Compute the key hash of a public key.
pub fn key_hash(public: &PublicKey) -> KeyHash {
    let encoded = public.to_encoded_point(false);
    let digest = Sha256::digest(encoded.as_bytes());
    let mut hash = [0u8; KEY_HASH_LENGTH];
    hash.copy_from_slice(&digest[..KEY_HASH_LENGTH]);
    hash
}

/// Render a key hash as a URL-safe unpadded base64 string.
///
/// Used for PSK identities and `_local` document ids. Standard base64
/// contains `/`, which cannot appear inside a single path segment.
pub fn key_hash_id(hash: &KeyHash) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hash)
}

/// Parse a URL-safe unpadded base64 key hash id back into a [`KeyHash`].
pub fn parse_key_hash_id(id: &str) -> Option<KeyHash> {
    use base64::Engine as _;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(id)
        .ok()?;
    bytes.try_into().ok()
}

// ── Keypair ───────────────────────────────────────────────────────────────────

/// A device's long-term secp256k1 ECDH keypair.
///
/// Generated once per device. The public key appears (hashed) in every
/// beacon the device publishes. The private scalar never leaves this
/// struct; k256's `SecretKey` zeroizes its scalar on drop.
pub struct EcdhKeypair {
    secret: SecretKey,
    public: PublicKey,
}

impl EcdhKeypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Reconstruct a keypair from stored private key bytes.
    /// The public key is derived deterministically from the scalar.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret = SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidSecretKey)?;
        let public = secret.public_key();
        Ok(Self { secret, public })
    }

    /// The public half of this keypair.
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Serialize the private scalar for persistent storage.
    ///
    /// Store these bytes securely (mode 0600, ideally encrypted at
    /// rest). The public key need not be stored — it is derived on load.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.secret.to_bytes());
        Zeroizing::new(out)
    }

    /// The 65-byte uncompressed SEC1 encoding of the public key.
    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        let encoded = self.public.to_encoded_point(false);
        let mut out = [0u8; PUBLIC_KEY_LENGTH];
        out.copy_from_slice(encoded.as_bytes());
        out
    }

    /// The key hash of the public key.
    pub fn key_hash(&self) -> KeyHash {
        key_hash(&self.public)
    }
}

/// Parse a 65-byte uncompressed SEC1 public key.
pub fn public_key_from_bytes(bytes: &[u8]) -> Result<PublicKey, CryptoError> {
    PublicKey::from_sec1_bytes(bytes).map_err(|_| CryptoError::InvalidPublicKey)
}

// ── ECDH + KDF ────────────────────────────────────────────────────────────────

/// Raw ECDH shared secret (x-coordinate) between a local keypair and a
/// remote public key.
pub fn shared_secret(local: &EcdhKeypair, remote: &PublicKey) -> [u8; 32] {
    let shared = diffie_hellman(local.secret.to_nonzero_scalar(), remote.as_affine());
    let mut out = [0u8; 32];
    out.copy_from_slice(shared.raw_secret_bytes());
    out
}

/// HKDF-SHA256 expand with an explicit salt and empty info.
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], out: &mut [u8]) {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    // Output lengths in this crate are 32 bytes, far below the HKDF bound.
    hk.expand(&[], out)
        .unwrap_or_else(|_| unreachable!("HKDF output length exceeds 255 blocks"));
}

/// The pairwise session key between two identities:
/// `HKDF-SHA256(ECDH(local, remote), salt)`.
///
/// Used as the beacon HMAC key and as the replication PSK secret for the
/// same recipient set — one derivation, two uses.
pub fn session_key(local: &EcdhKeypair, remote: &PublicKey, salt: &[u8]) -> [u8; 32] {
    let shared = shared_secret(local, remote);
    let mut key = [0u8; 32];
    hkdf_sha256(&shared, salt, &mut key);
    key
}

/// HMAC-SHA256 truncated to 16 bytes.
pub fn hmac_sha256_trunc16(key: &[u8], data: &[u8]) -> [u8; KEY_HASH_LENGTH] {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
    mac.update(data);
    let full = mac.finalize().into_bytes();
    let mut out = [0u8; KEY_HASH_LENGTH];
    out.copy_from_slice(&full[..KEY_HASH_LENGTH]);
    out
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("not a valid uncompressed secp256k1 public key")]
    InvalidPublicKey,

    #[error("not a valid secp256k1 private scalar")]
    InvalidSecretKey,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_bytes_are_uncompressed_sec1() {
        let kp = EcdhKeypair::generate();
        let bytes = kp.public_bytes();
        assert_eq!(bytes.len(), PUBLIC_KEY_LENGTH);
        // Uncompressed SEC1 points always start with 0x04
        assert_eq!(bytes[0], 0x04);
    }

    #[test]
    fn keypair_roundtrip_via_secret_bytes() {
        let kp1 = EcdhKeypair::generate();
        let secret = kp1.secret_bytes();
        let kp2 = EcdhKeypair::from_secret_bytes(&*secret).unwrap();
        assert_eq!(kp1.public_bytes(), kp2.public_bytes());
    }

    #[test]
    fn from_secret_bytes_rejects_garbage() {
        assert!(EcdhKeypair::from_secret_bytes(&[0u8; 32]).is_err());
        assert!(EcdhKeypair::from_secret_bytes(&[1u8; 7]).is_err());
    }

    #[test]
    fn public_key_from_bytes_roundtrip() {
        let kp = EcdhKeypair::generate();
        let parsed = public_key_from_bytes(&kp.public_bytes()).unwrap();
        assert_eq!(&parsed, kp.public());
    }

    #[test]
    fn public_key_from_bytes_rejects_garbage() {
        assert!(public_key_from_bytes(&[0u8; 65]).is_err());
        assert!(public_key_from_bytes(&[4u8; 12]).is_err());
    }

    #[test]
    fn key_hash_is_deterministic_and_distinct() {
        let a = EcdhKeypair::generate();
        let b = EcdhKeypair::generate();
        assert_eq!(a.key_hash(), key_hash(a.public()));
        assert_ne!(a.key_hash(), b.key_hash());
    }

    #[test]
    fn key_hash_id_roundtrip() {
        let kp = EcdhKeypair::generate();
        let id = key_hash_id(&kp.key_hash());
        // URL-safe alphabet only, no padding
        assert!(!id.contains('/') && !id.contains('+') && !id.contains('='));
        assert_eq!(parse_key_hash_id(&id), Some(kp.key_hash()));
    }

    #[test]
    fn parse_key_hash_id_rejects_wrong_length() {
        assert_eq!(parse_key_hash_id("AAAA"), None);
        assert_eq!(parse_key_hash_id("not base64 at all!"), None);
    }

    #[test]
    fn ecdh_is_symmetric() {
        let a = EcdhKeypair::generate();
        let b = EcdhKeypair::generate();
        assert_eq!(shared_secret(&a, b.public()), shared_secret(&b, a.public()));
    }

    #[test]
    fn session_key_depends_on_salt() {
        let a = EcdhKeypair::generate();
        let b = EcdhKeypair::generate();
        let k1 = session_key(&a, b.public(), b"salt-one");
        let k2 = session_key(&a, b.public(), b"salt-two");
        assert_ne!(k1, k2);
        // And agrees across the pair for the same salt
        assert_eq!(k1, session_key(&b, a.public(), b"salt-one"));
    }

    #[test]
    fn hmac_truncation_is_prefix_stable() {
        let tag1 = hmac_sha256_trunc16(b"key", b"data");
        let tag2 = hmac_sha256_trunc16(b"key", b"data");
        let other = hmac_sha256_trunc16(b"key", b"datb");
        assert_eq!(tag1, tag2);
        assert_ne!(tag1, other);
    }
}
