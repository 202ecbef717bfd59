//! PSK identity tables shared between the notification sender and the
//! request-admission gate.
//!
//! The sender owns the write side: every beacon rotation builds a fresh
//! [`PskTables`] and swaps it in whole. The admission middleware reads
//! the latest snapshot per request. There are no back-references between
//! the two — just this cell.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use k256::PublicKey;

/// The fixed TLS-PSK identity every peer may use to fetch beacons.
pub const BEACON_PSK_IDENTITY: &str = "beacons";

/// The fixed secret behind [`BEACON_PSK_IDENTITY`]: sixteen zero bytes.
/// The beacon endpoint carries no secrets; the PSK only forces TLS.
pub const BEACON_PSK_SECRET: [u8; 16] = [0u8; 16];

/// One generation of PSK state, valid until the beacon stream it was
/// derived alongside expires.
#[derive(Default)]
pub struct PskTables {
    /// PSK identity → session secret.
    pub id_to_secret: HashMap<String, Vec<u8>>,
    /// PSK identity → the recipient public key it was derived for.
    /// The beacon identity has no entry here.
    pub id_to_public_key: HashMap<String, PublicKey>,
    /// Instant at which this generation stops being honored.
    /// `None` for the empty table published before the sender starts.
    pub expires_at: Option<Instant>,
}

impl PskTables {
    /// Whether this generation is still within its validity window.
    pub fn is_live(&self) -> bool {
        match self.expires_at {
            Some(deadline) => Instant::now() < deadline,
            None => false,
        }
    }

    /// Look up a replication identity, honoring expiry.
    pub fn replication_secret(&self, identity: &str) -> Option<&[u8]> {
        if !self.is_live() {
            return None;
        }
        self.id_to_secret.get(identity).map(Vec::as_slice)
    }

    /// The public key a replication identity was derived for.
    pub fn public_key(&self, identity: &str) -> Option<&PublicKey> {
        if !self.is_live() {
            return None;
        }
        self.id_to_public_key.get(identity)
    }
}

/// Atomically swappable snapshot of the PSK tables.
///
/// Reads clone an `Arc` under a short read lock; writers build the next
/// generation off to the side and swap it in one store.
#[derive(Clone, Default)]
pub struct PskStore {
    inner: Arc<RwLock<Arc<PskTables>>>,
}

impl PskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current table generation.
    pub fn snapshot(&self) -> Arc<PskTables> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the tables wholesale.
    pub fn swap(&self, next: PskTables) {
        *self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(next);
    }
}
