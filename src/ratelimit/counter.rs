//! Self-expiring decay counter for a single key.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::trace;

use super::decision::Decision;
use crate::config::Limits;

/// Burst capacity consumed by one key, restored by a background decay process.
///
/// Every admission attempt reserves a unit with a single atomic increment and
/// gives it back if that pushed the counter over the burst. No caller can see
/// free capacity between the check and the reservation, so concurrent callers
/// are never admitted past `max_burst`.
///
/// The decay process removes one unit per period and reports the counter as
/// expired once nothing is left, at which point it stops for good.
pub(crate) struct DecayCounter {
    /// Capacity currently consumed
    amount: AtomicI64,
    /// Decay ticks that left the counter alive
    decays: AtomicU64,
    /// Set once the decay process has given up on this counter
    expired: AtomicBool,
    /// When the counter was created; decay ticks are aligned to it
    origin: Instant,
    limits: Limits,
}

/// Handle to a running decay process.
///
/// Dropping it detaches the process, which keeps running until it expires or
/// the shutdown signal fires.
#[derive(Debug)]
pub(crate) struct DecayTask {
    handle: JoinHandle<()>,
}

impl DecayTask {
    /// Stop the decay process without reporting expiry.
    pub fn abort(self) {
        self.handle.abort();
    }
}

/// Keeps the shared count of running decay processes accurate.
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self(live)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl DecayCounter {
    /// Create a counter and spawn its decay process on `runtime`.
    ///
    /// `on_expire` runs once, from the decay process, when the counter decays
    /// to zero. It is not called when the process ends because of `shutdown`
    /// or [`DecayTask::abort`].
    pub fn start<F>(
        limits: Limits,
        runtime: &Handle,
        shutdown: watch::Receiver<bool>,
        live: Arc<AtomicUsize>,
        on_expire: F,
    ) -> (Arc<Self>, DecayTask)
    where
        F: FnOnce() + Send + 'static,
    {
        let counter = Arc::new(Self {
            amount: AtomicI64::new(0),
            decays: AtomicU64::new(0),
            expired: AtomicBool::new(false),
            origin: Instant::now(),
            limits,
        });

        let guard = LiveGuard::new(live);
        let handle = runtime.spawn(counter.clone().run(shutdown, guard, on_expire));

        (counter, DecayTask { handle })
    }

    /// Try to reserve one unit of burst capacity.
    pub fn try_admit(&self) -> Decision {
        let amount = self.amount.fetch_add(1, Ordering::SeqCst) + 1;

        if amount > i64::from(self.limits.max_burst) {
            self.amount.fetch_sub(1, Ordering::SeqCst);
            return Decision::Denied {
                retry_at: self.next_decay_at(),
            };
        }

        Decision::Admitted
    }

    /// Get the capacity currently consumed.
    pub fn amount(&self) -> i64 {
        self.amount.load(Ordering::SeqCst)
    }

    /// Whether the counter has decayed to zero and its process has stopped.
    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    /// The next instant at which the decay process restores a unit.
    pub fn next_decay_at(&self) -> Instant {
        let ticks = self.decays.load(Ordering::SeqCst).saturating_add(1);
        let period_nanos = u64::try_from(self.limits.period.as_nanos()).unwrap_or(u64::MAX);
        self.origin + Duration::from_nanos(period_nanos.saturating_mul(ticks))
    }

    /// Remove one unit. Returns `true` once the counter has expired.
    fn decay(&self) -> bool {
        let remaining = self.amount.fetch_sub(1, Ordering::SeqCst) - 1;

        if remaining < 1 {
            // A tick on an unused counter takes it to -1.
            self.amount.fetch_max(0, Ordering::SeqCst);
            self.expired.store(true, Ordering::SeqCst);
            return true;
        }

        self.decays.fetch_add(1, Ordering::SeqCst);
        false
    }

    async fn run<F>(self: Arc<Self>, mut shutdown: watch::Receiver<bool>, _guard: LiveGuard, on_expire: F)
    where
        F: FnOnce(),
    {
        if *shutdown.borrow() {
            trace!("Limiter already shut down, decay process not started");
            return;
        }

        let period = self.limits.period;
        let mut ticker = interval_at(self.origin + period, period);

        let expired = loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    // An error means every limiter handle is gone.
                    if changed.is_err() || *shutdown.borrow() {
                        break false;
                    }
                }
                _ = ticker.tick() => {
                    if self.decay() {
                        break true;
                    }
                    trace!(amount = self.amount(), "Decay tick");
                }
            }
        };

        if expired {
            on_expire();
        } else {
            trace!(amount = self.amount(), "Decay process stopped by shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_burst: i32, period_ms: u64) -> Limits {
        Limits {
            max_burst,
            period: Duration::from_millis(period_ms),
        }
    }

    struct Harness {
        counter: Arc<DecayCounter>,
        task: Option<DecayTask>,
        expired: Arc<AtomicBool>,
        live: Arc<AtomicUsize>,
        shutdown: watch::Sender<bool>,
    }

    fn start(limits: Limits) -> Harness {
        let (shutdown, rx) = watch::channel(false);
        let live = Arc::new(AtomicUsize::new(0));
        let expired = Arc::new(AtomicBool::new(false));

        let flag = expired.clone();
        let (counter, task) = DecayCounter::start(limits, &Handle::current(), rx, live.clone(), move || {
            flag.store(true, Ordering::SeqCst);
        });

        Harness {
            counter,
            task: Some(task),
            expired,
            live,
            shutdown,
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_admit_within_burst() {
        let h = start(limits(3, 100));

        assert!(h.counter.try_admit().is_admitted());
        assert!(h.counter.try_admit().is_admitted());
        assert_eq!(h.counter.amount(), 2);
        assert_eq!(h.live.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_admit_exceeds_burst() {
        let h = start(limits(3, 100));
        let origin = Instant::now();

        for _ in 0..3 {
            assert!(h.counter.try_admit().is_admitted());
        }

        // Rejections give their reservation back
        for _ in 0..3 {
            assert_eq!(
                h.counter.try_admit(),
                Decision::Denied {
                    retry_at: origin + Duration::from_millis(100)
                }
            );
        }
        assert_eq!(h.counter.amount(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decay_restores_one_unit_per_period() {
        let h = start(limits(3, 100));
        let origin = Instant::now();

        for _ in 0..3 {
            h.counter.try_admit();
        }

        tokio::time::sleep(Duration::from_millis(110)).await;
        assert_eq!(h.counter.amount(), 2);
        assert_eq!(h.counter.next_decay_at(), origin + Duration::from_millis(200));

        assert!(h.counter.try_admit().is_admitted());
        assert!(!h.counter.try_admit().is_admitted());
        assert!(!h.expired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_counter_expires() {
        let h = start(limits(3, 100));

        h.counter.try_admit();
        h.counter.try_admit();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!h.expired.load(Ordering::SeqCst));
        assert_eq!(h.counter.amount(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.expired.load(Ordering::SeqCst));
        assert_eq!(h.counter.amount(), 0);
        assert_eq!(h.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unused_counter_expires_at_zero() {
        let h = start(limits(3, 100));
        assert!(!h.counter.is_expired());

        tokio::time::sleep(Duration::from_millis(110)).await;
        assert!(h.expired.load(Ordering::SeqCst));
        assert!(h.counter.is_expired());
        assert_eq!(h.counter.amount(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_decay_past_u32_ticks() {
        let h = start(limits(3, 1));
        let origin = Instant::now();

        let ticks = u64::from(u32::MAX) + 5;
        h.counter.decays.store(ticks, Ordering::SeqCst);

        assert_eq!(
            h.counter.next_decay_at(),
            origin + Duration::from_millis(ticks + 1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_decay_without_expiry() {
        let h = start(limits(3, 100));
        h.counter.try_admit();

        h.shutdown.send(true).unwrap();
        settle().await;
        assert_eq!(h.live.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!h.expired.load(Ordering::SeqCst));
        assert_eq!(h.counter.amount(), 1);
        assert!(!h.counter.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_shutdown_sender_stops_decay() {
        let h = start(limits(3, 100));
        h.counter.try_admit();

        drop(h.shutdown);
        settle().await;
        assert_eq!(h.live.load(Ordering::SeqCst), 0);
        assert!(!h.expired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_before_start() {
        let (shutdown, rx) = watch::channel(false);
        shutdown.send(true).unwrap();
        let live = Arc::new(AtomicUsize::new(0));

        let (counter, _task) = DecayCounter::start(limits(2, 100), &Handle::current(), rx, live.clone(), || {
            panic!("must not expire after shutdown");
        });
        settle().await;
        assert_eq!(live.load(Ordering::SeqCst), 0);

        // Without a decay process the counter never recovers
        assert!(counter.try_admit().is_admitted());
        assert!(counter.try_admit().is_admitted());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!counter.try_admit().is_admitted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_releases_decay_process() {
        let mut h = start(limits(3, 100));
        assert_eq!(h.live.load(Ordering::SeqCst), 1);

        h.task.take().unwrap().abort();
        settle().await;
        assert_eq!(h.live.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!h.expired.load(Ordering::SeqCst));
    }
}
