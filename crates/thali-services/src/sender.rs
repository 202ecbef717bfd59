//! Notification sender — publishes the beacon stream and the PSK tables
//! it implies.
//!
//! `start` generates a fresh stream for the recipient set, swaps in the
//! matching PSK generation (the fixed beacon identity plus one derived
//! identity per recipient), and schedules regeneration ahead of expiry.
//! The stream lands in a shared cell the HTTP handler reads; the tables
//! land in the [`PskStore`] the admission gate reads.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use k256::PublicKey;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use thali_core::beacon::{self, BeaconError, MAX_EXPIRATION_SECONDS};
use thali_core::config::BeaconConfig;
use thali_core::crypto::{self, EcdhKeypair};
use thali_core::psk::{PskStore, PskTables, BEACON_PSK_IDENTITY, BEACON_PSK_SECRET};

use crate::LifecycleError;

/// Atomically swappable copy of the published beacon stream.
/// Empty until the sender starts.
#[derive(Clone, Default)]
pub struct BeaconStreamCell {
    inner: Arc<std::sync::RwLock<Arc<Vec<u8>>>>,
}

impl BeaconStreamCell {
    pub fn load(&self) -> Arc<Vec<u8>> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn store(&self, stream: Vec<u8>) {
        *self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(stream);
    }
}

#[derive(Debug, Error)]
pub enum SenderError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Beacon(#[from] BeaconError),
}

pub struct NotificationSender {
    inner: Arc<SenderInner>,
    state: Mutex<SenderState>,
}

struct SenderInner {
    local: Arc<EcdhKeypair>,
    config: BeaconConfig,
    store: PskStore,
    stream: BeaconStreamCell,
    /// Current recipient set; the rotation task re-reads it each cycle.
    recipients: StdMutex<Vec<PublicKey>>,
}

enum SenderState {
    Stopped,
    Running { rotation: JoinHandle<()> },
}

impl NotificationSender {
    pub fn new(local: Arc<EcdhKeypair>, config: BeaconConfig) -> Self {
        Self {
            inner: Arc::new(SenderInner {
                local,
                config,
                store: PskStore::new(),
                stream: BeaconStreamCell::default(),
                recipients: StdMutex::new(Vec::new()),
            }),
            state: Mutex::new(SenderState::Stopped),
        }
    }

    /// The tables the admission gate reads.
    pub fn psk_store(&self) -> PskStore {
        self.inner.store.clone()
    }

    /// The stream cell the beacon handler reads.
    pub fn beacon_stream(&self) -> BeaconStreamCell {
        self.inner.stream.clone()
    }

    /// Snapshot copy of the identity → secret map.
    pub fn psk_id_to_secret(&self) -> std::collections::HashMap<String, Vec<u8>> {
        self.inner.store.snapshot().id_to_secret.clone()
    }

    /// Snapshot copy of the identity → public key map.
    pub fn psk_id_to_public_key(&self) -> std::collections::HashMap<String, PublicKey> {
        self.inner.store.snapshot().id_to_public_key.clone()
    }

    /// Publish beacons for `recipients` and begin rotating them.
    pub async fn start(&self, recipients: Vec<PublicKey>) -> Result<(), SenderError> {
        let mut state = self.state.lock().await;
        if matches!(*state, SenderState::Running { .. }) {
            return Err(LifecycleError::AlreadyStarted.into());
        }

        *self
            .inner
            .recipients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = recipients;
        self.inner.publish()?;

        let inner = self.inner.clone();
        let rotation = tokio::spawn(async move {
            let period = inner.rotation_period();
            loop {
                tokio::time::sleep(period).await;
                tracing::debug!("rotating beacon stream");
                if let Err(e) = inner.publish() {
                    tracing::warn!(error = %e, "beacon rotation failed");
                }
            }
        });

        *state = SenderState::Running { rotation };
        Ok(())
    }

    /// Replace the recipient set while running. Regenerates immediately.
    pub async fn set_beacon_keys(&self, recipients: Vec<PublicKey>) -> Result<(), SenderError> {
        let state = self.state.lock().await;
        if !matches!(*state, SenderState::Running { .. }) {
            return Err(LifecycleError::NotStarted.into());
        }
        *self
            .inner
            .recipients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = recipients;
        self.inner.publish()?;
        Ok(())
    }

    /// Withdraw the stream and the tables.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        let mut state = self.state.lock().await;
        let SenderState::Running { rotation } =
            std::mem::replace(&mut *state, SenderState::Stopped)
        else {
            return Err(LifecycleError::NotStarted);
        };
        rotation.abort();
        self.inner.stream.store(Vec::new());
        self.inner.store.swap(PskTables::default());
        Ok(())
    }
}

impl SenderInner {
    /// Generate a stream for the current recipients and swap both the
    /// stream and its PSK generation in.
    ///
    /// The table generation expires at the same instant the stream's
    /// beacons declare — one lifetime drives the wire expiration, the
    /// PSK salt, and the table deadline.
    fn publish(&self) -> Result<(), BeaconError> {
        let recipients = self
            .recipients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let lifetime = self.beacon_lifetime();
        let seconds = lifetime.as_secs() as i64;
        let stream = beacon::generate(&recipients, &self.local, seconds)?;

        let expiration_salt = seconds.to_be_bytes();
        let mut tables = PskTables {
            expires_at: Some(Instant::now() + lifetime),
            ..PskTables::default()
        };
        tables
            .id_to_secret
            .insert(BEACON_PSK_IDENTITY.to_string(), BEACON_PSK_SECRET.to_vec());
        for recipient in &recipients {
            let psk_id = crypto::key_hash_id(&crypto::key_hash(recipient));
            let secret = crypto::session_key(&self.local, recipient, &expiration_salt);
            tables.id_to_secret.insert(psk_id.clone(), secret.to_vec());
            tables.id_to_public_key.insert(psk_id, *recipient);
        }

        self.store.swap(tables);
        self.stream.store(stream);
        tracing::info!(recipients = recipients.len(), "beacon stream published");
        Ok(())
    }

    /// The configured stream lifetime in whole seconds, clamped to what
    /// the wire format can carry. Config validation rejects larger
    /// values at load time; the clamp keeps a hand-built config honest.
    fn beacon_lifetime(&self) -> Duration {
        let seconds = self
            .config
            .milliseconds_to_expire_duration()
            .as_secs()
            .min(MAX_EXPIRATION_SECONDS as u64);
        Duration::from_secs(seconds)
    }

    fn rotation_period(&self) -> Duration {
        self.beacon_lifetime()
            .saturating_sub(self.config.refresh_margin())
            .max(Duration::from_secs(1))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use thali_core::crypto::KeyHash;

    fn sender_with(recipient_count: usize) -> (NotificationSender, Vec<EcdhKeypair>) {
        let local = Arc::new(EcdhKeypair::generate());
        let recipients: Vec<EcdhKeypair> =
            (0..recipient_count).map(|_| EcdhKeypair::generate()).collect();
        (
            NotificationSender::new(local, BeaconConfig::default()),
            recipients,
        )
    }

    #[tokio::test]
    async fn start_publishes_stream_and_tables() {
        let (sender, recipients) = sender_with(2);
        let keys: Vec<PublicKey> = recipients.iter().map(|r| *r.public()).collect();

        sender.start(keys).await.unwrap();

        let stream = sender.beacon_stream().load();
        assert_eq!(
            stream.len(),
            beacon::PREAMBLE_LENGTH + 2 * beacon::BEACON_LENGTH
        );

        let secrets = sender.psk_id_to_secret();
        // Two recipients plus the fixed beacon identity
        assert_eq!(secrets.len(), 3);
        assert_eq!(
            secrets.get(BEACON_PSK_IDENTITY).map(Vec::as_slice),
            Some(&BEACON_PSK_SECRET[..])
        );

        let by_key = sender.psk_id_to_public_key();
        for recipient in &recipients {
            let id = crypto::key_hash_id(&recipient.key_hash());
            assert_eq!(by_key.get(&id), Some(recipient.public()));
        }

        sender.stop().await.unwrap();
    }

    #[tokio::test]
    async fn published_stream_parses_for_a_recipient() {
        let local = Arc::new(EcdhKeypair::generate());
        let recipient = EcdhKeypair::generate();
        let sender = NotificationSender::new(local.clone(), BeaconConfig::default());

        sender.start(vec![*recipient.public()]).await.unwrap();
        let stream = sender.beacon_stream().load();

        let book: HashMap<KeyHash, PublicKey> =
            [(local.key_hash(), *local.public())].into_iter().collect();
        assert_eq!(
            beacon::parse(&stream, &recipient, &book).unwrap(),
            Some(local.key_hash())
        );

        sender.stop().await.unwrap();
    }

    #[tokio::test]
    async fn double_start_fails() {
        let (sender, _) = sender_with(0);
        sender.start(Vec::new()).await.unwrap();
        assert!(matches!(
            sender.start(Vec::new()).await,
            Err(SenderError::Lifecycle(LifecycleError::AlreadyStarted))
        ));
        sender.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_without_start_fails() {
        let (sender, _) = sender_with(0);
        assert!(matches!(
            sender.stop().await,
            Err(LifecycleError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn stop_withdraws_everything_and_restart_works() {
        let (sender, recipients) = sender_with(1);
        let keys: Vec<PublicKey> = recipients.iter().map(|r| *r.public()).collect();

        sender.start(keys.clone()).await.unwrap();
        sender.stop().await.unwrap();

        assert!(sender.beacon_stream().load().is_empty());
        assert!(sender.psk_id_to_secret().is_empty());

        sender.start(keys).await.unwrap();
        assert!(!sender.beacon_stream().load().is_empty());
        sender.stop().await.unwrap();
    }

    #[tokio::test]
    async fn set_beacon_keys_requires_running() {
        let (sender, recipients) = sender_with(1);
        let keys: Vec<PublicKey> = recipients.iter().map(|r| *r.public()).collect();
        assert!(matches!(
            sender.set_beacon_keys(keys).await,
            Err(SenderError::Lifecycle(LifecycleError::NotStarted))
        ));
    }

    #[tokio::test]
    async fn oversized_lifetime_is_clamped_consistently() {
        let local = Arc::new(EcdhKeypair::generate());
        let recipient = EcdhKeypair::generate();
        // A week, far past what the wire format can declare
        let config = BeaconConfig {
            milliseconds_to_expire: 7 * 86_400_000,
            refresh_margin_ms: 60_000,
        };
        let sender = NotificationSender::new(local, config);

        sender.start(vec![*recipient.public()]).await.unwrap();

        // The wire beacon declares the clamped expiration...
        let stream = sender.beacon_stream().load();
        assert_eq!(
            beacon::expiration_seconds(&stream),
            Some(MAX_EXPIRATION_SECONDS)
        );

        // ...and the PSK tables die at that same instant, not a week out
        let deadline = sender.psk_store().snapshot().expires_at.unwrap();
        assert!(deadline <= Instant::now() + Duration::from_secs(MAX_EXPIRATION_SECONDS as u64));

        // Rotation is scheduled off the clamped lifetime too
        assert_eq!(
            sender.inner.rotation_period(),
            Duration::from_secs(MAX_EXPIRATION_SECONDS as u64) - Duration::from_secs(60)
        );

        sender.stop().await.unwrap();
    }

    #[tokio::test]
    async fn set_beacon_keys_replaces_the_generation() {
        let (sender, _) = sender_with(0);
        sender.start(Vec::new()).await.unwrap();
        // Empty recipient set publishes an empty stream
        assert!(sender.beacon_stream().load().is_empty());

        let newcomer = EcdhKeypair::generate();
        sender.set_beacon_keys(vec![*newcomer.public()]).await.unwrap();
        assert!(!sender.beacon_stream().load().is_empty());
        assert_eq!(sender.psk_id_to_public_key().len(), 1);

        sender.stop().await.unwrap();
    }
}
