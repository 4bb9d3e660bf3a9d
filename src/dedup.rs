//! Notification deduplication.
//!
//! Tracks the last time each `(rule, sensor)` pair fired and refuses a new
//! fire until the cooldown has elapsed. This is the only shared mutable state
//! in the core: one `parking_lot::Mutex` guards the whole map, which is fine
//! for tens of rules times tens of sensors. Time comes from an injected
//! [`Clock`] so tests can drive it by hand.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

// ---

/// Source of "now".
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock for tests and replays.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    // ---
    pub fn new(start: DateTime<Utc>) -> Self {
        ManualClock {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

// ---

#[derive(Debug, Clone)]
pub struct DedupConfig {
    pub cooldown: Duration,
    /// Entries whose last fire is older than this are dropped.
    pub retention: Duration,
    /// Upper bound on tracked pairs; least-recently-fired go first.
    pub max_entries: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        DedupConfig {
            cooldown: Duration::from_secs(30),
            retention: Duration::from_secs(3600),
            max_entries: 10_000,
        }
    }
}

/// Cooldown tracker keyed by `(rule_id, sensor_id)`.
pub struct Deduplicator {
    config: DedupConfig,
    last_fired: Mutex<HashMap<(i64, String), DateTime<Utc>>>,
}

impl Deduplicator {
    // ---
    pub fn new(config: DedupConfig) -> Self {
        Deduplicator {
            config,
            last_fired: Mutex::new(HashMap::new()),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.config.cooldown
    }

    /// True iff the pair never fired or its cooldown has fully elapsed.
    pub fn should_fire(&self, rule_id: i64, sensor_id: &str, now: DateTime<Utc>) -> bool {
        // ---
        let map = self.last_fired.lock();
        self.is_clear(map.get(&(rule_id, sensor_id.to_string())), now)
    }

    pub fn record_fired(&self, rule_id: i64, sensor_id: &str, now: DateTime<Utc>) {
        // ---
        let mut map = self.last_fired.lock();
        self.insert_locked(&mut map, rule_id, sensor_id, now);
    }

    /// Check and record under one lock. Returns `true` if the caller won the
    /// right to fire; concurrent callers for the same pair see `false`.
    pub fn try_fire(&self, rule_id: i64, sensor_id: &str, now: DateTime<Utc>) -> bool {
        // ---
        let mut map = self.last_fired.lock();
        if !self.is_clear(map.get(&(rule_id, sensor_id.to_string())), now) {
            return false;
        }
        self.insert_locked(&mut map, rule_id, sensor_id, now);
        true
    }

    /// Drop entries older than the retention window. Returns how many went.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        // ---
        let retention = to_chrono(self.config.retention);
        let mut map = self.last_fired.lock();
        let before = map.len();
        map.retain(|_, fired| now.signed_duration_since(*fired) < retention);
        let evicted = before - map.len();
        if evicted > 0 {
            debug!("Evicted {} expired dedup entries", evicted);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.last_fired.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_clear(&self, last: Option<&DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last {
            None => true,
            Some(fired) => now.signed_duration_since(*fired) >= to_chrono(self.config.cooldown),
        }
    }

    fn insert_locked(
        &self,
        map: &mut HashMap<(i64, String), DateTime<Utc>>,
        rule_id: i64,
        sensor_id: &str,
        now: DateTime<Utc>,
    ) {
        // ---
        let key = (rule_id, sensor_id.to_string());
        if !map.contains_key(&key) && map.len() >= self.config.max_entries {
            let oldest = map
                .iter()
                .min_by_key(|(_, fired)| **fired)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                debug!(
                    rule_id = oldest.0,
                    sensor_id = %oldest.1,
                    "Dedup map full, evicting least-recently-fired entry"
                );
                map.remove(&oldest);
            }
        }
        map.insert(key, now);
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn dedup_with_cooldown(secs: u64) -> Deduplicator {
        Deduplicator::new(DedupConfig {
            cooldown: Duration::from_secs(secs),
            ..Default::default()
        })
    }

    #[test]
    fn test_first_fire_allowed() {
        // ---
        let dedup = dedup_with_cooldown(30);
        assert!(dedup.should_fire(1, "S1", start()));
        assert!(dedup.is_empty());
    }

    #[test]
    fn test_suppressed_within_cooldown() {
        // ---
        let clock = ManualClock::new(start());
        let dedup = dedup_with_cooldown(30);

        dedup.record_fired(1, "S1", clock.now());
        clock.advance(Duration::from_secs(2));
        assert!(!dedup.should_fire(1, "S1", clock.now()));

        // Other keys are unaffected
        assert!(dedup.should_fire(1, "S2", clock.now()));
        assert!(dedup.should_fire(2, "S1", clock.now()));
    }

    #[test]
    fn test_fires_again_once_cooldown_elapses() {
        // ---
        let clock = ManualClock::new(start());
        let dedup = dedup_with_cooldown(30);

        assert!(dedup.try_fire(1, "S1", clock.now()));
        assert!(!dedup.try_fire(1, "S1", clock.now()));

        clock.advance(Duration::from_secs(29));
        assert!(!dedup.try_fire(1, "S1", clock.now()));

        clock.advance(Duration::from_secs(1));
        assert!(dedup.try_fire(1, "S1", clock.now()));
    }

    #[test]
    fn test_clock_stepped_backwards_keeps_suppression() {
        // ---
        let clock = ManualClock::new(start());
        let dedup = dedup_with_cooldown(30);

        assert!(dedup.try_fire(1, "S1", clock.now()));
        clock.set(start() - chrono::Duration::minutes(5));
        assert!(!dedup.should_fire(1, "S1", clock.now()));

        clock.set(start() + chrono::Duration::seconds(30));
        assert!(dedup.should_fire(1, "S1", clock.now()));
    }

    #[test]
    fn test_retention_eviction() {
        // ---
        let clock = ManualClock::new(start());
        let dedup = Deduplicator::new(DedupConfig {
            cooldown: Duration::from_secs(30),
            retention: Duration::from_secs(600),
            max_entries: 100,
        });

        dedup.record_fired(1, "S1", clock.now());
        clock.advance(Duration::from_secs(300));
        dedup.record_fired(2, "S1", clock.now());
        clock.advance(Duration::from_secs(301));

        assert_eq!(dedup.evict_expired(clock.now()), 1);
        assert_eq!(dedup.len(), 1);
        assert!(dedup.should_fire(1, "S1", clock.now()));
    }

    #[test]
    fn test_capacity_evicts_least_recently_fired() {
        // ---
        let clock = ManualClock::new(start());
        let dedup = Deduplicator::new(DedupConfig {
            cooldown: Duration::from_secs(3600),
            retention: Duration::from_secs(7200),
            max_entries: 2,
        });

        dedup.record_fired(1, "S1", clock.now());
        clock.advance(Duration::from_secs(1));
        dedup.record_fired(2, "S1", clock.now());
        clock.advance(Duration::from_secs(1));
        dedup.record_fired(3, "S1", clock.now());

        assert_eq!(dedup.len(), 2);
        // Rule 1 was the oldest and has been forgotten
        assert!(dedup.should_fire(1, "S1", clock.now()));
        assert!(!dedup.should_fire(2, "S1", clock.now()));
        assert!(!dedup.should_fire(3, "S1", clock.now()));
    }

    #[test]
    fn test_concurrent_try_fire_single_winner() {
        // ---
        let dedup = Arc::new(dedup_with_cooldown(30));
        let now = start();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dedup = dedup.clone();
                std::thread::spawn(move || dedup.try_fire(9, "S9", now))
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
