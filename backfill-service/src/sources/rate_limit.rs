use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Global pacing for outbound requests to the remote source.
///
/// Two limits are enforced across every backfill sharing this limiter: a
/// ceiling on concurrently in-flight requests and a minimum spacing between
/// successive request starts. Both are held in shared state so concurrent
/// backfills for different devices cannot jointly exceed the remote's
/// tolerance.
#[derive(Clone)]
pub struct RateLimiter {
    permits: Arc<Semaphore>,
    next_slot: Arc<Mutex<Option<Instant>>>,
    min_interval: Duration,
}

/// Held for the duration of one request; releases the in-flight slot on drop.
pub struct RatePermit {
    _permit: OwnedSemaphorePermit,
}

impl RateLimiter {
    pub fn new(max_in_flight: usize, min_interval: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            next_slot: Arc::new(Mutex::new(None)),
            min_interval,
        }
    }

    /// Wait for an in-flight slot and for this request's pacing slot.
    pub async fn acquire(&self) -> RatePermit {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("rate limiter semaphore closed");

        let wake_at = {
            let mut next_slot = self.next_slot.lock().await;
            let now = Instant::now();
            let at = next_slot.map_or(now, |slot| slot.max(now));
            *next_slot = Some(at + self.min_interval);
            at
        };
        tokio::time::sleep_until(wake_at).await;

        RatePermit { _permit: permit }
    }
}
