//! Peer pool — bounded scheduler for outbound replication attempts.
//!
//! Actions are idempotent by `(connectionType, peerId)`: submitting an
//! action whose key is already in flight is a no-op. Concurrency is
//! bounded by a semaphore; retry timing is a pluggable [`PoolPolicy`].
//!
//! The default [`ImmediatePolicy`] starts at once and never retries.
//! That is deliberately coarse — production deployments must replace it
//! with something that backs off and respects battery and radio state.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use k256::PublicKey;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::registry::{PeerKey, PeerStatus};

/// One matched beacon turned into work: pull-replicate from the peer
/// whose key hash we recovered. Created by the notification client,
/// consumed once by the pool.
#[derive(Clone)]
pub struct NotificationAction {
    pub remote_public_key: PublicKey,
    pub peer_status: PeerStatus,
}

impl NotificationAction {
    pub fn key(&self) -> PeerKey {
        self.peer_status.key()
    }
}

pub type ReplicationFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Performs one pull-replication attempt against a peer. The document
/// store and its replicator live outside this crate.
pub trait ReplicationDriver: Send + Sync + 'static {
    fn replicate(&self, action: NotificationAction) -> ReplicationFuture;
}

/// Decides when attempt number `attempt` (0-based) may run.
/// `None` means stop retrying.
pub trait PoolPolicy: Send + Sync + 'static {
    fn next_attempt(&self, attempt: u32) -> Option<Duration>;
}

/// Start immediately, never retry.
///
/// Placeholder policy: it ignores failure causes, battery, and radio
/// congestion. Replace it before shipping.
pub struct ImmediatePolicy;

impl PoolPolicy for ImmediatePolicy {
    fn next_attempt(&self, attempt: u32) -> Option<Duration> {
        (attempt == 0).then_some(Duration::ZERO)
    }
}

/// The pool itself. Cheap to clone — all state is shared.
#[derive(Clone)]
pub struct PeerPool {
    driver: Arc<dyn ReplicationDriver>,
    policy: Arc<dyn PoolPolicy>,
    limit: Arc<Semaphore>,
    in_flight: Arc<DashMap<PeerKey, JoinHandle<()>>>,
}

impl PeerPool {
    pub fn new(
        driver: Arc<dyn ReplicationDriver>,
        policy: Arc<dyn PoolPolicy>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            driver,
            policy,
            limit: Arc::new(Semaphore::new(max_concurrency.max(1))),
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Submit an action. A no-op when its key is already in flight.
    pub fn enqueue(&self, action: NotificationAction) {
        let key = action.key();
        if self.in_flight.contains_key(&key) {
            tracing::debug!(peer = %key.peer_id, "action already in flight, ignored");
            return;
        }

        let driver = self.driver.clone();
        let policy = self.policy.clone();
        let limit = self.limit.clone();
        let in_flight = self.in_flight.clone();
        let task_key = key.clone();

        let task = tokio::spawn(async move {
            let mut attempt = 0u32;
            while let Some(delay) = policy.next_attempt(attempt) {
                attempt += 1;
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }

                let Ok(_permit) = limit.acquire().await else {
                    break;
                };

                match driver.replicate(action.clone()).await {
                    Ok(()) => {
                        tracing::debug!(peer = %task_key.peer_id, "replication attempt finished");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(peer = %task_key.peer_id, error = %e, "replication attempt failed");
                    }
                }
            }
            in_flight.remove(&task_key);
        });

        self.in_flight.insert(key, task);
    }

    /// Cancel the action for a key, aborting in-flight work. No-op for
    /// unknown keys.
    pub fn cancel(&self, key: &PeerKey) {
        if let Some((_, task)) = self.in_flight.remove(key) {
            task.abort();
            tracing::debug!(peer = %key.peer_id, "action cancelled");
        }
    }

    /// Abort everything.
    pub fn stop(&self) {
        let keys: Vec<PeerKey> = self.in_flight.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.cancel(&key);
        }
    }

    /// Number of actions currently tracked.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use thali_discovery::ConnectionType;
    use tokio::sync::Notify;

    fn action(peer_id: &str) -> NotificationAction {
        NotificationAction {
            remote_public_key: *thali_core::EcdhKeypair::generate().public(),
            peer_status: PeerStatus {
                peer_id: peer_id.to_string(),
                connection_type: ConnectionType::TcpNative,
                generation: 0,
                available: true,
                new_address_port: Some(false),
            },
        }
    }

    struct CountingDriver {
        calls: AtomicU32,
        release: Arc<Notify>,
        fail: bool,
    }

    impl CountingDriver {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                release: Arc::new(Notify::new()),
                fail,
            })
        }
    }

    impl ReplicationDriver for CountingDriver {
        fn replicate(&self, _action: NotificationAction) -> ReplicationFuture {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let release = self.release.clone();
            let fail = self.fail;
            Box::pin(async move {
                release.notified().await;
                if fail {
                    anyhow::bail!("replication refused");
                }
                Ok(())
            })
        }
    }

    /// Retry once after a zero delay, then give up.
    struct TwoShotPolicy;

    impl PoolPolicy for TwoShotPolicy {
        fn next_attempt(&self, attempt: u32) -> Option<Duration> {
            (attempt < 2).then_some(Duration::ZERO)
        }
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_a_no_op() {
        let driver = CountingDriver::new(false);
        let pool = PeerPool::new(driver.clone(), Arc::new(ImmediatePolicy), 4);

        pool.enqueue(action("peer-a"));
        pool.enqueue(action("peer-a"));
        tokio::task::yield_now().await;

        assert_eq!(pool.in_flight(), 1);
        driver.release.notify_waiters();
        // Drain: the single task finishes and unregisters itself
        while pool.in_flight() > 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(driver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_run_independently() {
        let driver = CountingDriver::new(false);
        let pool = PeerPool::new(driver.clone(), Arc::new(ImmediatePolicy), 4);

        pool.enqueue(action("peer-a"));
        pool.enqueue(action("peer-b"));
        tokio::task::yield_now().await;
        assert_eq!(pool.in_flight(), 2);

        driver.release.notify_waiters();
        while pool.in_flight() > 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(driver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancel_aborts_and_allows_resubmission() {
        let driver = CountingDriver::new(false);
        let pool = PeerPool::new(driver.clone(), Arc::new(ImmediatePolicy), 4);

        let a = action("peer-a");
        pool.enqueue(a.clone());
        tokio::task::yield_now().await;
        pool.cancel(&a.key());
        assert_eq!(pool.in_flight(), 0);

        pool.enqueue(a.clone());
        tokio::task::yield_now().await;
        assert_eq!(pool.in_flight(), 1);
        assert_eq!(driver.calls.load(Ordering::SeqCst), 2);

        pool.stop();
    }

    #[tokio::test]
    async fn policy_grants_retries_on_failure() {
        let driver = CountingDriver::new(true);
        let pool = PeerPool::new(driver.clone(), Arc::new(TwoShotPolicy), 4);

        pool.enqueue(action("peer-a"));
        tokio::task::yield_now().await;
        driver.release.notify_waiters();
        tokio::task::yield_now().await;
        driver.release.notify_waiters();

        while pool.in_flight() > 0 {
            driver.release.notify_waiters();
            tokio::task::yield_now().await;
        }
        assert_eq!(driver.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn immediate_policy_never_retries() {
        assert_eq!(ImmediatePolicy.next_attempt(0), Some(Duration::ZERO));
        assert_eq!(ImmediatePolicy.next_attempt(1), None);
    }
}
