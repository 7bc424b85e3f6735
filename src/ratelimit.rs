use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::task::JoinHandle;

const EVICTION_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Limiter configuration. Zero values fall back to the defaults.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub max_failures: i32,
    pub block_time: Duration,
    pub window_time: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_failures: 5,
            block_time: Duration::from_secs(15 * 60),
            window_time: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FailureRecord {
    count: i32,
    first_fail: Instant,
    blocked_at: Option<Instant>,
}

/// Per-IP authentication failure limiter with a sliding counting window and
/// block escalation. All operations are total; the map is guarded by a
/// single lock.
pub struct Limiter {
    cfg: Config,
    failures: RwLock<HashMap<String, FailureRecord>>,
}

impl Limiter {
    pub fn new(mut cfg: Config) -> Self {
        let defaults = Config::default();
        if cfg.max_failures <= 0 {
            cfg.max_failures = defaults.max_failures;
        }
        if cfg.block_time.is_zero() {
            cfg.block_time = defaults.block_time;
        }
        if cfg.window_time.is_zero() {
            cfg.window_time = defaults.window_time;
        }
        Self { cfg, failures: RwLock::new(HashMap::new()) }
    }

    /// True while the IP is inside its block window.
    pub fn is_blocked(&self, ip: &str) -> bool {
        let failures = self.failures.read();
        match failures.get(ip) {
            Some(record) => match record.blocked_at {
                Some(blocked_at) => blocked_at.elapsed() < self.cfg.block_time,
                None => false,
            },
            None => false,
        }
    }

    /// Record an authentication failure. Returns true when the IP is (now)
    /// blocked.
    pub fn record_failure(&self, ip: &str) -> bool {
        let mut failures = self.failures.write();
        let now = Instant::now();

        let record = match failures.get_mut(ip) {
            None => {
                failures.insert(
                    ip.to_owned(),
                    FailureRecord { count: 1, first_fail: now, blocked_at: None },
                );
                return false;
            }
            Some(record) => record,
        };

        // already inside a block window, do not increment
        if let Some(blocked_at) = record.blocked_at {
            if now.duration_since(blocked_at) < self.cfg.block_time {
                return true;
            }
        }

        // counting window expired, start over
        if now.duration_since(record.first_fail) > self.cfg.window_time {
            record.count = 1;
            record.first_fail = now;
            record.blocked_at = None;
            return false;
        }

        record.count += 1;

        if record.count >= self.cfg.max_failures {
            record.blocked_at = Some(now);
            log::warn!(
                "ip blocked, ip: {}, failures: {}, block_duration: {:?}",
                ip,
                record.count,
                self.cfg.block_time
            );
            return true;
        }

        log::debug!(
            "auth failure recorded, ip: {}, failures: {}, remaining: {}",
            ip,
            record.count,
            self.cfg.max_failures - record.count
        );
        false
    }

    /// Any success clears the failure record for the IP. Idempotent.
    pub fn record_success(&self, ip: &str) {
        self.failures.write().remove(ip);
    }

    /// Currently blocked IPs, for diagnostics.
    pub fn blocked_ips(&self) -> Vec<String> {
        let failures = self.failures.read();
        failures
            .iter()
            .filter(|(_, record)| match record.blocked_at {
                Some(blocked_at) => blocked_at.elapsed() < self.cfg.block_time,
                None => false,
            })
            .map(|(ip, _)| ip.clone())
            .collect()
    }

    /// Drop records whose block has expired, or whose first failure is
    /// older than twice the counting window with no block.
    pub fn evict_expired(&self) {
        let mut failures = self.failures.write();
        let now = Instant::now();
        failures.retain(|_, record| {
            if let Some(blocked_at) = record.blocked_at {
                if now.duration_since(blocked_at) > self.cfg.block_time {
                    return false;
                }
                return true;
            }
            now.duration_since(record.first_fail) <= self.cfg.window_time * 2
        });
    }

    /// Periodic eviction task; aborted at shutdown.
    pub fn start_eviction(self: &Arc<Self>) -> JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(EVICTION_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tick.tick().await;
                limiter.evict_expired();
            }
        })
    }

    #[cfg(test)]
    fn record_count(&self) -> usize {
        self.failures.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_cfg() -> Config {
        Config {
            max_failures: 3,
            block_time: Duration::from_millis(80),
            window_time: Duration::from_millis(40),
        }
    }

    #[test]
    fn test_defaults_applied() {
        let l = Limiter::new(Config {
            max_failures: 0,
            block_time: Duration::ZERO,
            window_time: Duration::ZERO,
        });
        assert_eq!(l.cfg.max_failures, 5);
        assert_eq!(l.cfg.block_time, Duration::from_secs(900));
        assert_eq!(l.cfg.window_time, Duration::from_secs(300));
    }

    #[test]
    fn test_block_at_exact_threshold() {
        let l = Limiter::new(quick_cfg());
        assert!(!l.record_failure("1.2.3.4"));
        assert!(!l.is_blocked("1.2.3.4"));
        assert!(!l.record_failure("1.2.3.4"));
        assert!(!l.is_blocked("1.2.3.4"));
        // exactly max_failures blocks
        assert!(l.record_failure("1.2.3.4"));
        assert!(l.is_blocked("1.2.3.4"));
        // other IPs unaffected
        assert!(!l.is_blocked("5.6.7.8"));
    }

    #[test]
    fn test_blocked_does_not_increment() {
        let l = Limiter::new(quick_cfg());
        for _ in 0..3 {
            l.record_failure("1.2.3.4");
        }
        assert!(l.record_failure("1.2.3.4"));
        let failures = l.failures.read();
        assert_eq!(failures.get("1.2.3.4").map(|r| r.count), Some(3));
    }

    #[test]
    fn test_block_expires() {
        let l = Limiter::new(quick_cfg());
        for _ in 0..3 {
            l.record_failure("1.2.3.4");
        }
        assert!(l.is_blocked("1.2.3.4"));
        std::thread::sleep(Duration::from_millis(100));
        assert!(!l.is_blocked("1.2.3.4"));
    }

    #[test]
    fn test_window_reset() {
        let l = Limiter::new(quick_cfg());
        l.record_failure("1.2.3.4");
        l.record_failure("1.2.3.4");
        // let the counting window lapse, the next failure starts a new one
        std::thread::sleep(Duration::from_millis(60));
        assert!(!l.record_failure("1.2.3.4"));
        assert!(!l.record_failure("1.2.3.4"));
        assert!(l.record_failure("1.2.3.4"));
    }

    #[test]
    fn test_success_clears_and_is_idempotent() {
        let l = Limiter::new(quick_cfg());
        l.record_failure("1.2.3.4");
        l.record_failure("1.2.3.4");
        l.record_success("1.2.3.4");
        l.record_success("1.2.3.4");
        assert_eq!(l.record_count(), 0);
        // counting restarts from scratch
        assert!(!l.record_failure("1.2.3.4"));
        assert!(!l.record_failure("1.2.3.4"));
    }

    #[test]
    fn test_blocked_ips() {
        let l = Limiter::new(quick_cfg());
        for _ in 0..3 {
            l.record_failure("1.2.3.4");
        }
        l.record_failure("9.9.9.9");
        let blocked = l.blocked_ips();
        assert_eq!(blocked, vec!["1.2.3.4".to_string()]);
    }

    #[test]
    fn test_eviction() {
        let l = Limiter::new(quick_cfg());
        for _ in 0..3 {
            l.record_failure("1.2.3.4");
        }
        l.record_failure("9.9.9.9");
        assert_eq!(l.record_count(), 2);

        // nothing expired yet
        l.evict_expired();
        assert_eq!(l.record_count(), 2);

        // 9.9.9.9 expires after 2x window, 1.2.3.4 after its block
        std::thread::sleep(Duration::from_millis(100));
        l.evict_expired();
        assert_eq!(l.record_count(), 0);
    }
}
