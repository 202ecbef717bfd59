//! thali-core — shared types, beacon wire format, and cryptographic primitives.
//! All other Thali crates depend on this one.

pub mod beacon;
pub mod config;
pub mod crypto;
pub mod psk;

pub use beacon::{generate, parse, AddressBook, BeaconError};
pub use crypto::{key_hash, key_hash_id, EcdhKeypair, KeyHash};
pub use psk::{PskStore, PskTables, BEACON_PSK_IDENTITY, BEACON_PSK_SECRET};
