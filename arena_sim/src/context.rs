//! Simulation context implementing SessionContext for deterministic runs.

use arena_env::SessionContext;
use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Simulation context backed by a virtual clock and a seeded RNG.
///
/// - Time only moves when someone sleeps or a simulated frame is delivered
/// - `sleep` advances virtual time instead of waiting, stopping at each
///   scheduled wakeup on the way so pending deliveries get a turn
/// - All randomness of a run derives from the master seed
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Current virtual time (nanoseconds since simulation start)
    virtual_time_ns: Arc<Mutex<u64>>,

    rng: Arc<Mutex<ChaCha8Rng>>,

    /// Virtual times (ns) something is due, with multiplicity
    wakeups: Arc<Mutex<BTreeMap<u64, usize>>>,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,
}

impl SimContext {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            virtual_time_ns: Arc::new(Mutex::new(0)),
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
            wakeups: Arc::new(Mutex::new(BTreeMap::new())),
            epoch: UNIX_EPOCH + Duration::from_secs(1704067200), // 2024-01-01 00:00:00 UTC
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    pub fn advance_time(&self, duration: Duration) {
        let mut time = self.virtual_time_ns.lock().unwrap();
        *time += duration.as_nanos() as u64;
    }

    /// Moves the clock forward to `at`; never moves it back.
    pub fn advance_to(&self, at: Duration) {
        self.advance_to_ns(at.as_nanos() as u64);
    }

    fn advance_to_ns(&self, at_ns: u64) {
        let mut time = self.virtual_time_ns.lock().unwrap();
        *time = (*time).max(at_ns);
    }

    /// Registers a point in time a sleeper must not skip over.
    pub fn schedule_wakeup(&self, at: Duration) {
        let mut wakeups = self.wakeups.lock().unwrap();
        *wakeups.entry(at.as_nanos() as u64).or_default() += 1;
    }

    /// Removes one wakeup registered for `at`.
    pub fn cancel_wakeup(&self, at: Duration) {
        let mut wakeups = self.wakeups.lock().unwrap();
        let key = at.as_nanos() as u64;
        if let Some(count) = wakeups.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                wakeups.remove(&key);
            }
        }
    }

    /// Earliest wakeup strictly between now and `target_ns`.
    fn next_wakeup_before(&self, target_ns: u64) -> Option<u64> {
        let now = self.time_ns();
        if target_ns <= now {
            return None;
        }
        let wakeups = self.wakeups.lock().unwrap();
        wakeups
            .range((Bound::Excluded(now), Bound::Excluded(target_ns)))
            .next()
            .map(|(at, _)| *at)
    }

    pub fn time_ns(&self) -> u64 {
        *self.virtual_time_ns.lock().unwrap()
    }

    /// Derives a child seed from the master RNG (for bots, jitter, ...).
    pub fn fork_seed(&self) -> u64 {
        self.rng.lock().unwrap().gen()
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            virtual_time_ns: Arc::clone(&self.virtual_time_ns),
            rng: Arc::clone(&self.rng),
            wakeups: Arc::clone(&self.wakeups),
            epoch: self.epoch,
        }
    }
}

#[async_trait]
impl SessionContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(*self.virtual_time_ns.lock().unwrap())
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        let target = self.time_ns() + duration.as_nanos() as u64;
        while let Some(at) = self.next_wakeup_before(target) {
            self.advance_to_ns(at);
            tokio::task::yield_now().await;
        }
        self.advance_to_ns(target);
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tracing::trace!(task = name, "spawning simulated task");
        tokio::spawn(future);
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}
