//! Network monitor - tracks online/offline transitions.

use std::cell::Cell;
use std::sync::Arc;

use parking_lot::ReentrantMutex;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::watch;

use super::observers::{ObserverSet, Subscription};
use crate::domain::ConnectivityState;
use crate::infrastructure::{Clock, ConnectivityProbe};

/// Single source of truth for connectivity.
///
/// Platform events are debounced: an event that repeats the current state
/// is dropped, so subscribers only ever see real transitions. A transition
/// is stored and published under one lock, so subscribers see transitions
/// in the order they were stored. The lock is reentrant, so callbacks may
/// read the current state.
pub struct NetworkMonitor {
    clock: Arc<dyn Clock>,
    state: ReentrantMutex<Cell<ConnectivityState>>,
    observers: ObserverSet<ConnectivityState>,
    tx: watch::Sender<ConnectivityState>,
}

/// Sample a probe that may block on a connection attempt.
fn sample(probe: &dyn ConnectivityProbe) -> bool {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| probe.is_online())
        }
        _ => probe.is_online(),
    }
}

impl NetworkMonitor {
    /// Create a monitor seeded from one probe sample.
    pub fn new(probe: &dyn ConnectivityProbe, clock: Arc<dyn Clock>) -> Self {
        let initial = ConnectivityState {
            online: sample(probe),
            last_transition_at: clock.now(),
        };
        tracing::debug!(online = initial.online, "Initial connectivity sampled");

        let (tx, _rx) = watch::channel(initial);
        Self {
            clock,
            state: ReentrantMutex::new(Cell::new(initial)),
            observers: ObserverSet::new(),
            tx,
        }
    }

    /// Current connectivity.
    #[must_use]
    pub fn current_state(&self) -> ConnectivityState {
        self.state.lock().get()
    }

    /// Shorthand for `current_state().online`.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.current_state().online
    }

    /// Call `callback` on every transition.
    pub fn subscribe(
        &self,
        callback: impl Fn(&ConnectivityState) + Send + Sync + 'static,
    ) -> Subscription {
        self.observers.subscribe(callback)
    }

    /// Stop calling a subscribed callback.
    pub fn unsubscribe(&self, token: Subscription) -> bool {
        self.observers.unsubscribe(token)
    }

    /// Async view of the state, for background tasks.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }

    /// Feed a platform online/offline event. Returns true on a transition.
    pub fn handle_platform_event(&self, online: bool) -> bool {
        let state = self.state.lock();
        if state.get().online == online {
            tracing::trace!(online, "Ignoring duplicate connectivity event");
            return false;
        }

        let next = ConnectivityState {
            online,
            last_transition_at: self.clock.now(),
        };
        state.set(next);

        if online {
            tracing::info!("Connection restored");
        } else {
            tracing::info!("Connection lost, working offline");
        }

        self.tx.send_replace(next);
        self.observers.notify(&next);
        true
    }

    /// Take a fresh probe sample off the async threads, e.g. when the app
    /// returns to the foreground. Returns true on a transition.
    pub async fn resample(&self, probe: Arc<dyn ConnectivityProbe>) -> bool {
        match tokio::task::spawn_blocking(move || probe.is_online()).await {
            Ok(online) => self.handle_platform_event(online),
            Err(e) => {
                tracing::warn!(error = %e, "Connectivity probe did not finish");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::{ManualClock, StaticProbe};
    use chrono::{Duration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_duplicate_events_are_debounced() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let monitor = NetworkMonitor::new(&StaticProbe(true), clock.clone());
        let transitions = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&transitions);
        let token = monitor.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!monitor.handle_platform_event(true));
        clock.advance(Duration::seconds(5));
        assert!(monitor.handle_platform_event(false));
        assert!(!monitor.handle_platform_event(false));
        assert!(monitor.handle_platform_event(true));

        assert_eq!(transitions.load(Ordering::SeqCst), 2);
        assert!(monitor.unsubscribe(token));
    }

    #[tokio::test]
    async fn test_transition_time_is_recorded() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let monitor = NetworkMonitor::new(&StaticProbe(false), clock.clone());
        assert!(!monitor.is_online());

        clock.advance(Duration::minutes(3));
        assert!(monitor.resample(Arc::new(StaticProbe(true))).await);

        let state = monitor.current_state();
        assert!(state.online);
        assert_eq!(state.last_transition_at, clock.now());
    }

    #[test]
    fn test_callbacks_see_the_stored_state() {
        let monitor = Arc::new(NetworkMonitor::new(
            &StaticProbe(true),
            Arc::new(ManualClock::new(Utc::now())),
        ));
        let agreed = Arc::new(AtomicUsize::new(0));

        let reader = Arc::downgrade(&monitor);
        let count = Arc::clone(&agreed);
        let _token = monitor.subscribe(move |state| {
            // reading back from inside the callback must not deadlock
            if let Some(monitor) = reader.upgrade() {
                if monitor.is_online() == state.online {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        let handles: Vec<_> = (0..8)
            .map(|n| {
                let monitor = Arc::clone(&monitor);
                std::thread::spawn(move || {
                    (0..50)
                        .filter(|_| monitor.handle_platform_event(n % 2 == 0))
                        .count()
                })
            })
            .collect();
        let transitions: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert!(transitions > 0);
        assert_eq!(agreed.load(Ordering::SeqCst), transitions);
        assert_eq!(monitor.watch().borrow().online, monitor.is_online());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_initial_sample_inside_runtime() {
        let monitor = NetworkMonitor::new(&StaticProbe(true), Arc::new(ManualClock::new(Utc::now())));
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_watch_sees_transitions() {
        let monitor = NetworkMonitor::new(&StaticProbe(false), Arc::new(ManualClock::new(Utc::now())));
        let mut rx = monitor.watch();

        monitor.handle_platform_event(true);
        rx.changed().await.unwrap();
        assert!(rx.borrow().online);
    }
}
