//! Thali beacon wire format — build and parse notification beacon streams.
//!
//! A beacon stream lets a device announce "I have data for you" to a
//! pre-authorized set of public keys without revealing who is being
//! addressed. Every field and size here is part of the wire format.
//!
//! Layout:
//!
//!   Preamble (73 B) = ephemeral sender public key (65 B, uncompressed SEC1)
//!                   ‖ expiration seconds (int64 big-endian, 8 B)
//!   Beacon   (48 B) = sealed key id (32 B) ‖ HMAC-SHA256/16 (16 B)
//!   Stream          = Preamble ‖ Beacon*
//!
//! The sealed key id is AES-128-GCM over the sender's 16-byte key hash,
//! keyed and IV'd from HKDF over the ephemeral ECDH secret. GCM already
//! authenticates the payload; the trailing HMAC over the expiration is
//! still emitted and verified for wire compatibility. The cipher lives
//! behind [`KeyIdCipher`] so swapping it is a one-line change.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes128;
use aes_gcm::{AesGcm, Nonce};
use k256::PublicKey;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::crypto::{
    self, EcdhKeypair, KeyHash, KEY_HASH_LENGTH, PUBLIC_KEY_LENGTH,
};

// ── Wire constants ────────────────────────────────────────────────────────────

/// Length of the expiration field: int64, big-endian, seconds from now.
pub const EXPIRATION_LENGTH: usize = 8;

/// Length of the stream preamble.
pub const PREAMBLE_LENGTH: usize = PUBLIC_KEY_LENGTH + EXPIRATION_LENGTH;

/// Length of the sealed key id: 16-byte ciphertext + 16-byte GCM tag.
pub const SEALED_KEY_ID_LENGTH: usize = 32;

/// Length of the truncated per-beacon HMAC.
pub const BEACON_HMAC_LENGTH: usize = 16;

/// Length of one beacon.
pub const BEACON_LENGTH: usize = SEALED_KEY_ID_LENGTH + BEACON_HMAC_LENGTH;

/// Upper bound on the expiration field: one day, in seconds.
pub const MAX_EXPIRATION_SECONDS: i64 = 86_400;

/// AES-128-GCM with the 16-byte nonce the key derivation produces.
type KeyIdCipher = AesGcm<Aes128, U16>;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum BeaconError {
    /// `seconds_until_expiration` outside `0..=86_400`.
    #[error("expiration {0} outside 0..={MAX_EXPIRATION_SECONDS} seconds")]
    ArgumentRange(i64),

    /// The preamble is truncated, carries an invalid public key, or an
    /// out-of-range expiration.
    #[error("malformed preamble: {0}")]
    MalformedPreamble(&'static str),

    /// The bytes after the preamble are not a whole number of beacons.
    #[error("stream length {0} is not preamble plus whole beacons")]
    MalformedBeacon(usize),
}

// ── Address book ──────────────────────────────────────────────────────────────

/// Resolves a 16-byte key hash back to the full public key it was
/// derived from. The parser consults this for every beacon it manages
/// to open.
pub trait AddressBook {
    fn lookup(&self, key_hash: &KeyHash) -> Option<PublicKey>;
}

impl AddressBook for std::collections::HashMap<KeyHash, PublicKey> {
    fn lookup(&self, key_hash: &KeyHash) -> Option<PublicKey> {
        self.get(key_hash).copied()
    }
}

// ── Generate ──────────────────────────────────────────────────────────────────

/// Build a beacon stream for a recipient set.
///
/// An empty recipient set yields an empty stream (no preamble). The
/// expiration must be within `0..=86_400` seconds.
pub fn generate(
    recipients: &[PublicKey],
    local: &EcdhKeypair,
    seconds_until_expiration: i64,
) -> Result<Vec<u8>, BeaconError> {
    if !(0..=MAX_EXPIRATION_SECONDS).contains(&seconds_until_expiration) {
        return Err(BeaconError::ArgumentRange(seconds_until_expiration));
    }
    if recipients.is_empty() {
        return Ok(Vec::new());
    }

    let ephemeral = EcdhKeypair::generate();
    let key_id = local.key_hash();
    let expiration_be = seconds_until_expiration.to_be_bytes();

    let mut stream = Vec::with_capacity(PREAMBLE_LENGTH + recipients.len() * BEACON_LENGTH);
    stream.extend_from_slice(&ephemeral.public_bytes());
    stream.extend_from_slice(&expiration_be);

    for recipient in recipients {
        // HMAC key from the long-term pairwise secret
        let hk_xy = crypto::session_key(local, recipient, &expiration_be);
        let beacon_hmac = crypto::hmac_sha256_trunc16(&hk_xy, &expiration_be);

        // Sealing key + IV from the ephemeral pairwise secret
        let km = crypto::session_key(&ephemeral, recipient, &expiration_be);
        let (iv, hkey) = km.split_at(16);

        let sealed = seal_key_id(hkey, iv, &key_id);
        stream.extend_from_slice(&sealed);
        stream.extend_from_slice(&beacon_hmac);
    }

    Ok(stream)
}

// ── Parse ─────────────────────────────────────────────────────────────────────

/// Scan a beacon stream for a beacon addressed to `local`.
///
/// Returns the sender's key hash for the first beacon that both opens
/// under our ephemeral-derived key and carries a valid HMAC under a key
/// the address book recognizes; `None` when no beacon is for us.
/// Per-beacon decrypt and HMAC failures are skipped silently — only
/// preamble-level problems are errors.
pub fn parse(
    stream: &[u8],
    local: &EcdhKeypair,
    address_book: &dyn AddressBook,
) -> Result<Option<KeyHash>, BeaconError> {
    if stream.len() < PREAMBLE_LENGTH {
        return Err(BeaconError::MalformedPreamble("stream shorter than preamble"));
    }

    let ephemeral_public = crypto::public_key_from_bytes(&stream[..PUBLIC_KEY_LENGTH])
        .map_err(|_| BeaconError::MalformedPreamble("invalid ephemeral public key"))?;

    let expiration_be: [u8; EXPIRATION_LENGTH] = stream[PUBLIC_KEY_LENGTH..PREAMBLE_LENGTH]
        .try_into()
        .unwrap_or_else(|_| unreachable!("slice length fixed above"));
    let expiration = i64::from_be_bytes(expiration_be);
    if !(0..=MAX_EXPIRATION_SECONDS).contains(&expiration) {
        return Err(BeaconError::MalformedPreamble("expiration out of range"));
    }

    let body = &stream[PREAMBLE_LENGTH..];
    if body.len() % BEACON_LENGTH != 0 {
        return Err(BeaconError::MalformedBeacon(stream.len()));
    }

    // One unsealing key for the whole stream — the ephemeral secret does
    // not depend on which recipient a beacon targets.
    let km = crypto::session_key(local, &ephemeral_public, &expiration_be);
    let (iv, hkey) = km.split_at(16);

    for beacon in body.chunks_exact(BEACON_LENGTH) {
        let sealed = &beacon[..SEALED_KEY_ID_LENGTH];
        let hmac = &beacon[SEALED_KEY_ID_LENGTH..];

        // Not addressed to us — the GCM tag check fails
        let Some(sender_hash) = open_key_id(hkey, iv, sealed) else {
            continue;
        };

        // Sender we do not know
        let Some(sender_public) = address_book.lookup(&sender_hash) else {
            continue;
        };

        let hk_xy = crypto::session_key(local, &sender_public, &expiration_be);
        let expected = crypto::hmac_sha256_trunc16(&hk_xy, &expiration_be);
        if bool::from(expected.ct_eq(hmac)) {
            return Ok(Some(sender_hash));
        }
    }

    Ok(None)
}

/// Read the expiration field out of a stream's preamble without doing
/// any cryptography. `None` when the stream is too short.
///
/// Consumers use this to schedule cleanup at the instant the stream's
/// beacons stop being honored.
pub fn expiration_seconds(stream: &[u8]) -> Option<i64> {
    let bytes: [u8; EXPIRATION_LENGTH] = stream
        .get(PUBLIC_KEY_LENGTH..PREAMBLE_LENGTH)?
        .try_into()
        .ok()?;
    Some(i64::from_be_bytes(bytes))
}

// ── Cipher seam ───────────────────────────────────────────────────────────────

fn seal_key_id(hkey: &[u8], iv: &[u8], key_id: &KeyHash) -> [u8; SEALED_KEY_ID_LENGTH] {
    let cipher = KeyIdCipher::new_from_slice(hkey)
        .unwrap_or_else(|_| unreachable!("HKDF output is exactly one AES-128 key"));
    let sealed = cipher
        .encrypt(Nonce::<U16>::from_slice(iv), key_id.as_slice())
        .unwrap_or_else(|_| unreachable!("GCM encryption of a 16-byte block cannot fail"));
    let mut out = [0u8; SEALED_KEY_ID_LENGTH];
    out.copy_from_slice(&sealed);
    out
}

fn open_key_id(hkey: &[u8], iv: &[u8], sealed: &[u8]) -> Option<KeyHash> {
    let cipher = KeyIdCipher::new_from_slice(hkey).ok()?;
    let plain = cipher.decrypt(Nonce::<U16>::from_slice(iv), sealed).ok()?;
    if plain.len() != KEY_HASH_LENGTH {
        return None;
    }
    let mut out = [0u8; KEY_HASH_LENGTH];
    out.copy_from_slice(&plain);
    Some(out)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn book_of(keys: &[&EcdhKeypair]) -> HashMap<KeyHash, PublicKey> {
        keys.iter().map(|k| (k.key_hash(), *k.public())).collect()
    }

    #[test]
    fn happy_path_recipient_recovers_sender() {
        let alice = EcdhKeypair::generate();
        let bob = EcdhKeypair::generate();

        let stream = generate(&[*bob.public()], &alice, 3_600).unwrap();
        assert_eq!(stream.len(), PREAMBLE_LENGTH + BEACON_LENGTH);

        let book = book_of(&[&alice]);
        let found = parse(&stream, &bob, &book).unwrap();
        assert_eq!(found, Some(alice.key_hash()));
    }

    #[test]
    fn empty_address_book_finds_nothing() {
        let alice = EcdhKeypair::generate();
        let bob = EcdhKeypair::generate();

        let stream = generate(&[*bob.public()], &alice, 3_600).unwrap();
        let book: HashMap<KeyHash, PublicKey> = HashMap::new();
        assert_eq!(parse(&stream, &bob, &book).unwrap(), None);
    }

    #[test]
    fn wrong_recipient_finds_nothing() {
        let alice = EcdhKeypair::generate();
        let bob = EcdhKeypair::generate();
        let carol = EcdhKeypair::generate();

        let stream = generate(&[*carol.public()], &alice, 3_600).unwrap();
        let book = book_of(&[&alice]);
        assert_eq!(parse(&stream, &bob, &book).unwrap(), None);
    }

    #[test]
    fn second_recipient_in_stream_matches() {
        let alice = EcdhKeypair::generate();
        let bob = EcdhKeypair::generate();
        let carol = EcdhKeypair::generate();

        let stream = generate(&[*carol.public(), *bob.public()], &alice, 600).unwrap();
        assert_eq!(stream.len(), PREAMBLE_LENGTH + 2 * BEACON_LENGTH);

        let book = book_of(&[&alice]);
        assert_eq!(parse(&stream, &bob, &book).unwrap(), Some(alice.key_hash()));
        assert_eq!(parse(&stream, &carol, &book).unwrap(), Some(alice.key_hash()));
    }

    #[test]
    fn empty_recipient_set_yields_empty_stream() {
        let alice = EcdhKeypair::generate();
        let stream = generate(&[], &alice, 3_600).unwrap();
        assert!(stream.is_empty());
    }

    #[test]
    fn expiration_bounds_are_enforced() {
        let alice = EcdhKeypair::generate();
        let bob = EcdhKeypair::generate();

        assert!(matches!(
            generate(&[*bob.public()], &alice, -1),
            Err(BeaconError::ArgumentRange(-1))
        ));
        assert!(matches!(
            generate(&[*bob.public()], &alice, MAX_EXPIRATION_SECONDS + 1),
            Err(BeaconError::ArgumentRange(_))
        ));
        // Both endpoints are legal
        assert!(generate(&[*bob.public()], &alice, 0).is_ok());
        assert!(generate(&[*bob.public()], &alice, MAX_EXPIRATION_SECONDS).is_ok());
    }

    #[test]
    fn truncated_preamble_is_rejected() {
        let bob = EcdhKeypair::generate();
        let book: HashMap<KeyHash, PublicKey> = HashMap::new();
        let err = parse(&[0u8; 40], &bob, &book).unwrap_err();
        assert!(matches!(err, BeaconError::MalformedPreamble(_)));
    }

    #[test]
    fn garbage_ephemeral_key_is_rejected() {
        let bob = EcdhKeypair::generate();
        let book: HashMap<KeyHash, PublicKey> = HashMap::new();
        let err = parse(&[0u8; PREAMBLE_LENGTH], &bob, &book).unwrap_err();
        assert!(matches!(err, BeaconError::MalformedPreamble(_)));
    }

    #[test]
    fn out_of_range_expiration_is_rejected() {
        let alice = EcdhKeypair::generate();
        let bob = EcdhKeypair::generate();

        let mut stream = generate(&[*bob.public()], &alice, 3_600).unwrap();
        stream[PUBLIC_KEY_LENGTH..PREAMBLE_LENGTH]
            .copy_from_slice(&(MAX_EXPIRATION_SECONDS + 1).to_be_bytes());

        let book = book_of(&[&alice]);
        let err = parse(&stream, &bob, &book).unwrap_err();
        assert!(matches!(err, BeaconError::MalformedPreamble(_)));
    }

    #[test]
    fn ragged_beacon_length_is_rejected() {
        let alice = EcdhKeypair::generate();
        let bob = EcdhKeypair::generate();

        let mut stream = generate(&[*bob.public()], &alice, 3_600).unwrap();
        stream.truncate(stream.len() - 5);

        let book = book_of(&[&alice]);
        let err = parse(&stream, &bob, &book).unwrap_err();
        assert!(matches!(err, BeaconError::MalformedBeacon(_)));
    }

    #[test]
    fn preamble_with_no_beacons_parses_to_none() {
        let alice = EcdhKeypair::generate();
        let bob = EcdhKeypair::generate();
        let carol = EcdhKeypair::generate();

        // A valid stream addressed only to carol, truncated to the preamble
        let stream = generate(&[*carol.public()], &alice, 60).unwrap();
        let preamble_only = &stream[..PREAMBLE_LENGTH];

        let book = book_of(&[&alice]);
        assert_eq!(parse(preamble_only, &bob, &book).unwrap(), None);
    }

    #[test]
    fn tampered_beacon_is_skipped_not_fatal() {
        let alice = EcdhKeypair::generate();
        let bob = EcdhKeypair::generate();
        let carol = EcdhKeypair::generate();

        // Bob's beacon is second; corrupting carol's must not stop the scan.
        let mut stream = generate(&[*carol.public(), *bob.public()], &alice, 600).unwrap();
        stream[PREAMBLE_LENGTH] ^= 0xff;

        let book = book_of(&[&alice]);
        assert_eq!(parse(&stream, &bob, &book).unwrap(), Some(alice.key_hash()));
    }

    #[test]
    fn expiration_is_readable_without_keys() {
        let alice = EcdhKeypair::generate();
        let bob = EcdhKeypair::generate();
        let stream = generate(&[*bob.public()], &alice, 1234).unwrap();
        assert_eq!(expiration_seconds(&stream), Some(1234));
        assert_eq!(expiration_seconds(&stream[..20]), None);
    }

    #[test]
    fn tampered_hmac_rejects_the_match() {
        let alice = EcdhKeypair::generate();
        let bob = EcdhKeypair::generate();

        let mut stream = generate(&[*bob.public()], &alice, 600).unwrap();
        let hmac_offset = PREAMBLE_LENGTH + SEALED_KEY_ID_LENGTH;
        stream[hmac_offset] ^= 0xff;

        let book = book_of(&[&alice]);
        assert_eq!(parse(&stream, &bob, &book).unwrap(), None);
    }
}
