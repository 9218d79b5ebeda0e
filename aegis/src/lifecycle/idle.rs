//! Idle accounting and per-instance watchdog timers.
//!
//! Every instance carries an [`ActivityTracker`]: router connections, tether
//! traffic and leases all feed it. The watchdog task `select!`s over the
//! tracker's change signal and the next deadline — no shared timer wheel.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::types::Lease;

#[derive(Debug)]
struct ActivityState {
    last_activity: Instant,
    active_conns: u32,
    lease: Option<Lease>,
}

/// Shared activity signal for one instance.
pub struct ActivityTracker {
    inner: Mutex<ActivityState>,
    changed: Notify,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ActivityState {
                last_activity: Instant::now(),
                active_conns: 0,
                lease: None,
            }),
            changed: Notify::new(),
        }
    }

    /// Any inbound traffic: resets both idle timers.
    pub fn touch(&self) {
        self.inner.lock().last_activity = Instant::now();
        self.changed.notify_waiters();
    }

    pub fn conn_opened(&self) {
        let mut inner = self.inner.lock();
        inner.active_conns += 1;
        inner.last_activity = Instant::now();
        drop(inner);
        self.changed.notify_waiters();
    }

    pub fn conn_closed(&self) {
        let mut inner = self.inner.lock();
        inner.active_conns = inner.active_conns.saturating_sub(1);
        inner.last_activity = Instant::now();
        drop(inner);
        self.changed.notify_waiters();
    }

    pub fn active_conns(&self) -> u32 {
        self.inner.lock().active_conns
    }

    /// Install or replace the lease (keepalive / explicit pin).
    pub fn set_lease(&self, lease: Lease) {
        self.inner.lock().lease = Some(lease);
        self.changed.notify_waiters();
    }

    pub fn clear_lease(&self) {
        self.inner.lock().lease = None;
        self.changed.notify_waiters();
    }

    pub fn lease(&self) -> Option<Lease> {
        self.inner.lock().lease.clone()
    }

    /// Whether something pins the instance to running right now: an open
    /// connection or an unexpired lease. Expired leases no longer inhibit
    /// the timers.
    pub fn pinned(&self, now: DateTime<Utc>) -> bool {
        let inner = self.inner.lock();
        if inner.active_conns > 0 {
            return true;
        }
        matches!(&inner.lease, Some(lease) if !lease.is_expired(now))
    }

    /// Deadline at which the instance becomes idle-eligible, measured from
    /// the last activity. Returns `None` while pinned (the caller re-checks
    /// on the next change signal or when the lease expires).
    pub fn idle_deadline(&self, idle_after: Duration) -> Option<Instant> {
        let inner = self.inner.lock();
        if inner.active_conns > 0 {
            return None;
        }
        let base = inner.last_activity + idle_after;
        match &inner.lease {
            Some(lease) if !lease.is_expired(Utc::now()) => {
                // The lease bounds the earliest possible idle transition.
                let remaining = (lease.expires_at - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                Some(base.max(Instant::now() + remaining))
            }
            _ => Some(base),
        }
    }

    /// Resolves on the next activity/lease/connection change.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease_in(secs: i64) -> Lease {
        Lease {
            expires_at: Utc::now() + chrono::Duration::seconds(secs),
            reason: "test".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connections_pin_the_instance() {
        let tracker = ActivityTracker::new();
        assert!(!tracker.pinned(Utc::now()));

        tracker.conn_opened();
        assert!(tracker.pinned(Utc::now()));
        assert!(tracker.idle_deadline(Duration::from_secs(60)).is_none());

        tracker.conn_closed();
        assert!(!tracker.pinned(Utc::now()));
        assert!(tracker.idle_deadline(Duration::from_secs(60)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_stops_pinning() {
        let tracker = ActivityTracker::new();
        tracker.set_lease(lease_in(-5));
        assert!(!tracker.pinned(Utc::now()));

        tracker.set_lease(lease_in(3600));
        assert!(tracker.pinned(Utc::now()));

        tracker.clear_lease();
        assert!(!tracker.pinned(Utc::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn touch_pushes_the_deadline() {
        let tracker = ActivityTracker::new();
        let idle = Duration::from_secs(60);
        let first = tracker.idle_deadline(idle).unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        tracker.touch();
        let second = tracker.idle_deadline(idle).unwrap();
        assert!(second > first);
    }

    #[tokio::test(start_paused = true)]
    async fn changed_wakes_on_touch() {
        let tracker = std::sync::Arc::new(ActivityTracker::new());
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.changed().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        tracker.touch();
        waiter.await.unwrap();
    }

    #[test]
    fn conn_close_never_underflows() {
        let tracker = ActivityTracker::new();
        tracker.conn_closed();
        assert_eq!(tracker.active_conns(), 0);
    }
}
