//! Drain control for intakes and listeners.
//!
//! Every request or delivery being worked on holds an [`InFlightGuard`].
//! Stopping flips the controller to `Draining` so no new work is admitted,
//! then waits, bounded, for the last guard to go away.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::Notify;

/// Lifecycle of one listener or consumer.
///
/// State machine: Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Starting,
    Ready,
    /// Refusing new work while in-flight work finishes.
    Draining,
    Stopped,
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicU64,
    idle: Notify,
}

/// Admission and drain state shared between a listener and its handlers.
#[derive(Debug)]
pub struct ShutdownController {
    state: ArcSwap<HealthState>,
    in_flight: Arc<InFlight>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(HealthState::Starting),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn set_ready(&self) {
        self.state.store(Arc::new(HealthState::Ready));
    }

    /// Stops admitting new work.
    pub fn trigger_shutdown(&self) {
        self.state.store(Arc::new(HealthState::Draining));
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.state.load()
    }

    /// Whether new work should be admitted.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        matches!(self.health_state(), HealthState::Starting | HealthState::Ready)
    }

    /// Marks one unit of work in flight until the guard drops.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Waits up to `timeout` for in-flight work to reach zero.
    ///
    /// On success the controller moves to `Stopped` and `true` is returned.
    /// On timeout it stays `Draining` and `false` is returned.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let idle = async {
            loop {
                // Register before checking so a concurrent last drop is seen.
                let notified = self.in_flight.idle.notified();
                if self.in_flight_count() == 0 {
                    break;
                }
                notified.await;
            }
        };
        let drained = tokio::time::timeout(timeout, idle).await.is_ok();
        if drained {
            self.state.store(Arc::new(HealthState::Stopped));
        }
        drained
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds one in-flight slot. Released on drop, including on panic unwind.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}
