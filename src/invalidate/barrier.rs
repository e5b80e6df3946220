//! Host-scoped synchronous invalidation barrier.
//!
//! When a sync-required change-set reaches a daemon session, the fan-out
//! engine registers a [`SyncObligation`] under the next sequence id for that
//! daemon's host. [`SyncBarrier::wait_for_invalidates`] captures the host's
//! high-water mark and waits until every obligation at or below it is gone,
//! either acknowledged by the daemon or released because its session closed.
//!
//! Each host has its own shard: one mutex over (last issued id, pending
//! obligations) and one [`Notify`] that is broadcast on every removal.
//! Waiters arm their notification before checking the predicate and never
//! hold the mutex across an await, so a removal between check and sleep is
//! never missed.
//!
//! The wait is bounded. A daemon that never answers delays its writer by at
//! most the configured timeout, after which the writer proceeds with a
//! warning in the log.

use crate::core::ids::{HostId, SessionId};
use crate::session::SessionLiveness;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Default bound on a barrier wait.
pub const DEFAULT_BARRIER_TIMEOUT: Duration = Duration::from_secs(60);

/// Proof-of-delivery record owed by one daemon session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncObligation {
    /// Host the daemon is bound to.
    pub host: HostId,
    /// Per-host sequence id.
    pub sync_id: i64,
    /// Session that must acknowledge.
    pub session: SessionId,
}

/// How a barrier wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierOutcome {
    /// No obligation was ever issued for the host.
    NothingIssued,
    /// Every obligation up to `target` was resolved.
    Satisfied { target: i64 },
    /// The timeout elapsed with `outstanding` obligations still pending.
    TimedOut { target: i64, outstanding: usize },
}

impl BarrierOutcome {
    /// Check whether the wait gave up.
    pub fn timed_out(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

#[derive(Debug)]
struct PendingObligation {
    session: SessionId,
    liveness: SessionLiveness,
}

#[derive(Debug, Default)]
struct HostSyncInner {
    /// Last issued id; 0 means none issued yet.
    last_issued: i64,
    pending: BTreeMap<i64, PendingObligation>,
}

impl HostSyncInner {
    fn has_pending_through(&self, target: i64) -> bool {
        self.pending.range(..=target).next().is_some()
    }

    fn count_pending_through(&self, target: i64) -> usize {
        self.pending.range(..=target).count()
    }

    /// Drop obligations whose session has gone away.
    fn prune_closed(&mut self) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, pending| !pending.liveness.is_closed());
        before - self.pending.len()
    }
}

#[derive(Debug, Default)]
struct HostSyncState {
    inner: Mutex<HostSyncInner>,
    changed: Notify,
}

/// Barrier counters.
#[derive(Debug, Default)]
pub struct BarrierStats {
    /// Obligations registered.
    pub registered: AtomicU64,
    /// Obligations removed by acknowledgement.
    pub acknowledged: AtomicU64,
    /// Obligations removed because their session closed.
    pub released: AtomicU64,
    /// Waits that hit the timeout.
    pub timeouts: AtomicU64,
}

/// Per-host obligation tracking and bounded waits.
#[derive(Debug)]
pub struct SyncBarrier {
    hosts: RwLock<HashMap<HostId, Arc<HostSyncState>>>,
    timeout: Duration,
    stats: BarrierStats,
}

impl SyncBarrier {
    /// Create a barrier with the given wait bound.
    pub fn new(timeout: Duration) -> Self {
        Self {
            hosts: RwLock::new(HashMap::new()),
            timeout,
            stats: BarrierStats::default(),
        }
    }

    /// Wait bound.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Counters.
    pub fn stats(&self) -> &BarrierStats {
        &self.stats
    }

    fn existing(&self, host: HostId) -> Option<Arc<HostSyncState>> {
        self.hosts.read().get(&host).cloned()
    }

    fn shard(&self, host: HostId) -> Arc<HostSyncState> {
        if let Some(state) = self.existing(host) {
            return state;
        }
        Arc::clone(self.hosts.write().entry(host).or_default())
    }

    /// Register an obligation for `session` and return its sequence id.
    ///
    /// Ids are strictly increasing per host and never reused.
    pub fn register(
        &self,
        host: HostId,
        session: SessionId,
        liveness: SessionLiveness,
    ) -> SyncObligation {
        let state = self.shard(host);
        let sync_id = {
            let mut inner = state.inner.lock();
            inner.last_issued += 1;
            let sync_id = inner.last_issued;
            inner
                .pending
                .insert(sync_id, PendingObligation { session, liveness });
            sync_id
        };
        self.stats.registered.fetch_add(1, Ordering::Relaxed);
        SyncObligation {
            host,
            sync_id,
            session,
        }
    }

    /// Acknowledge delivery up to `sync_id` for `session`.
    ///
    /// Batches reach a session in order, so an acknowledgement also covers
    /// that session's earlier obligations on the host. Returns the number of
    /// obligations removed.
    pub fn acknowledge(&self, host: HostId, session: SessionId, sync_id: i64) -> usize {
        let Some(state) = self.existing(host) else {
            return 0;
        };
        let removed = {
            let mut inner = state.inner.lock();
            let before = inner.pending.len();
            inner
                .pending
                .retain(|id, pending| *id > sync_id || pending.session != session);
            before - inner.pending.len()
        };
        if removed > 0 {
            self.stats
                .acknowledged
                .fetch_add(removed as u64, Ordering::Relaxed);
            state.changed.notify_waiters();
        }
        removed
    }

    /// Release every obligation `session` still owes on `host`.
    pub fn release_session(&self, host: HostId, session: SessionId) -> usize {
        let Some(state) = self.existing(host) else {
            return 0;
        };
        let removed = {
            let mut inner = state.inner.lock();
            let before = inner.pending.len();
            inner.pending.retain(|_, pending| pending.session != session);
            before - inner.pending.len()
        };
        if removed > 0 {
            self.stats
                .released
                .fetch_add(removed as u64, Ordering::Relaxed);
            state.changed.notify_waiters();
            tracing::debug!(%host, %session, removed, "released sync obligations of closed session");
        }
        removed
    }

    /// Last sequence id issued for `host`.
    pub fn last_issued(&self, host: HostId) -> Option<i64> {
        self.existing(host)
            .map(|state| state.inner.lock().last_issued)
            .filter(|id| *id > 0)
    }

    /// Outstanding obligations for `host`.
    pub fn pending(&self, host: HostId) -> usize {
        self.existing(host)
            .map(|state| state.inner.lock().pending.len())
            .unwrap_or(0)
    }

    /// Block until `host` has resolved everything issued so far.
    ///
    /// Obligations registered after the call begins are not waited for.
    /// Returns after at most the configured timeout; a timeout is logged and
    /// reported in the outcome, never raised.
    pub async fn wait_for_invalidates(&self, host: HostId) -> BarrierOutcome {
        self.wait_until(host, Instant::now() + self.timeout).await
    }

    /// Wait on several hosts under one shared deadline.
    pub async fn wait_for_hosts<I>(&self, hosts: I) -> Vec<(HostId, BarrierOutcome)>
    where
        I: IntoIterator<Item = HostId>,
    {
        let deadline = Instant::now() + self.timeout;
        let mut outcomes = Vec::new();
        for host in hosts {
            outcomes.push((host, self.wait_until(host, deadline).await));
        }
        outcomes
    }

    async fn wait_until(&self, host: HostId, deadline: Instant) -> BarrierOutcome {
        let Some(state) = self.existing(host) else {
            return BarrierOutcome::NothingIssued;
        };
        let target = state.inner.lock().last_issued;
        if target == 0 {
            return BarrierOutcome::NothingIssued;
        }

        loop {
            let notified = state.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (pruned, outstanding) = {
                let mut inner = state.inner.lock();
                let pruned = inner.prune_closed();
                (pruned, inner.count_pending_through(target))
            };
            if pruned > 0 {
                self.stats
                    .released
                    .fetch_add(pruned as u64, Ordering::Relaxed);
                state.changed.notify_waiters();
            }
            if outstanding == 0 {
                return BarrierOutcome::Satisfied { target };
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let outstanding = state.inner.lock().count_pending_through(target);
                if outstanding == 0 {
                    return BarrierOutcome::Satisfied { target };
                }
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    %host,
                    target,
                    outstanding,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "timed out waiting for daemons to apply invalidations"
                );
                return BarrierOutcome::TimedOut {
                    target,
                    outstanding,
                };
            }
        }
    }
}

impl Default for SyncBarrier {
    fn default() -> Self {
        Self::new(DEFAULT_BARRIER_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant as StdInstant;

    fn live() -> SessionLiveness {
        SessionLiveness::new()
    }

    #[tokio::test]
    async fn no_obligations_returns_immediately() {
        let barrier = SyncBarrier::new(Duration::from_secs(60));
        let start = StdInstant::now();
        assert_eq!(
            barrier.wait_for_invalidates(HostId(10)).await,
            BarrierOutcome::NothingIssued
        );
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn already_resolved_returns_immediately() {
        let barrier = SyncBarrier::new(Duration::from_secs(60));
        let ob = barrier.register(HostId(1), SessionId(1), live());
        barrier.acknowledge(HostId(1), SessionId(1), ob.sync_id);
        assert_eq!(
            barrier.wait_for_invalidates(HostId(1)).await,
            BarrierOutcome::Satisfied { target: 1 }
        );
    }

    #[tokio::test]
    async fn ack_releases_waiter_early() {
        let barrier = Arc::new(SyncBarrier::new(Duration::from_secs(60)));
        let ob = barrier.register(HostId(10), SessionId(1), live());

        let acker = Arc::clone(&barrier);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            acker.acknowledge(HostId(10), SessionId(1), ob.sync_id);
        });

        let start = StdInstant::now();
        let outcome = barrier.wait_for_invalidates(HostId(10)).await;
        let elapsed = start.elapsed();
        assert_eq!(outcome, BarrierOutcome::Satisfied { target: 1 });
        assert!(elapsed >= Duration::from_millis(150), "{:?}", elapsed);
        assert!(elapsed < Duration::from_secs(5), "{:?}", elapsed);
    }

    #[tokio::test]
    async fn times_out_and_returns_normally() {
        let barrier = SyncBarrier::new(Duration::from_millis(150));
        barrier.register(HostId(3), SessionId(1), live());

        let start = StdInstant::now();
        let outcome = barrier.wait_for_invalidates(HostId(3)).await;
        assert_eq!(
            outcome,
            BarrierOutcome::TimedOut {
                target: 1,
                outstanding: 1
            }
        );
        assert!(start.elapsed() >= Duration::from_millis(150));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(barrier.stats().timeouts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn later_obligations_are_not_awaited() {
        let barrier = Arc::new(SyncBarrier::new(Duration::from_secs(60)));
        let first = barrier.register(HostId(2), SessionId(1), live());

        let writer = Arc::clone(&barrier);
        let waiter = tokio::spawn(async move { writer.wait_for_invalidates(HostId(2)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Issued after the wait captured its target.
        let second = barrier.register(HostId(2), SessionId(2), live());
        assert!(second.sync_id > first.sync_id);
        barrier.acknowledge(HostId(2), SessionId(1), first.sync_id);

        let outcome = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter finished")
            .expect("task joined");
        assert_eq!(outcome, BarrierOutcome::Satisfied { target: 1 });
        assert_eq!(barrier.pending(HostId(2)), 1);
    }

    #[tokio::test]
    async fn release_session_wakes_every_waiter() {
        let barrier = Arc::new(SyncBarrier::new(Duration::from_secs(60)));
        barrier.register(HostId(4), SessionId(9), live());
        barrier.register(HostId(4), SessionId(9), live());

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move { barrier.wait_for_invalidates(HostId(4)).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(barrier.release_session(HostId(4), SessionId(9)), 2);
        for waiter in waiters {
            let outcome = tokio::time::timeout(Duration::from_secs(5), waiter)
                .await
                .expect("waiter finished")
                .expect("task joined");
            assert_eq!(outcome, BarrierOutcome::Satisfied { target: 2 });
        }
    }

    #[tokio::test]
    async fn closed_session_observed_by_waiter() {
        let barrier = SyncBarrier::new(Duration::from_secs(60));
        let liveness = live();
        barrier.register(HostId(5), SessionId(1), liveness.clone());
        liveness.close();

        let start = StdInstant::now();
        assert_eq!(
            barrier.wait_for_invalidates(HostId(5)).await,
            BarrierOutcome::Satisfied { target: 1 }
        );
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(barrier.pending(HostId(5)), 0);
    }

    #[tokio::test]
    async fn multi_host_wait_shares_one_deadline() {
        let barrier = SyncBarrier::new(Duration::from_millis(200));
        barrier.register(HostId(1), SessionId(1), live());
        barrier.register(HostId(2), SessionId(2), live());

        let start = StdInstant::now();
        let outcomes = barrier
            .wait_for_hosts([HostId(1), HostId(2), HostId(3)])
            .await;
        assert!(start.elapsed() < Duration::from_millis(390), "{:?}", start.elapsed());
        assert!(outcomes[0].1.timed_out());
        assert!(outcomes[1].1.timed_out());
        assert_eq!(outcomes[2].1, BarrierOutcome::NothingIssued);
    }

    #[test]
    fn ack_is_cumulative_per_session() {
        let barrier = SyncBarrier::default();
        let a1 = barrier.register(HostId(6), SessionId(1), live());
        let b1 = barrier.register(HostId(6), SessionId(2), live());
        let a2 = barrier.register(HostId(6), SessionId(1), live());

        assert_eq!(barrier.acknowledge(HostId(6), SessionId(1), a2.sync_id), 2);
        assert_eq!(barrier.pending(HostId(6)), 1);
        // Another session's id is not ours to acknowledge.
        assert_eq!(barrier.acknowledge(HostId(6), SessionId(1), b1.sync_id), 0);
        assert_eq!(barrier.acknowledge(HostId(6), SessionId(2), b1.sync_id), 1);
        assert!(a1.sync_id < b1.sync_id && b1.sync_id < a2.sync_id);
    }

    #[test]
    fn ids_strictly_increase_under_contention() {
        let barrier = Arc::new(SyncBarrier::default());
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    (0..500)
                        .map(|_| {
                            barrier
                                .register(HostId(1), SessionId(n), SessionLiveness::new())
                                .sync_id
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            let ids = handle.join().unwrap();
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            all.extend(ids);
        }
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4000);
        assert_eq!(barrier.last_issued(HostId(1)), Some(4000));
        assert_eq!(barrier.last_issued(HostId(2)), None);
    }
}
