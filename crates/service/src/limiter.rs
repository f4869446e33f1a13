use std::hash::{Hash, Hasher};
use std::net::IpAddr;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};

const SHARDS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterOptions {
    pub window_secs: u64,
    pub ban_threshold: u32,
    pub ban_secs: u64,
}

/// Ring of second-granularity buckets; the running total is the window
/// count. Advancing zeroes only the seconds that actually elapsed, so
/// admission is O(1) amortized and memory per key is bounded.
struct Window {
    buckets: Vec<u32>,
    total: u32,
    last_tick: u64,
}

impl Window {
    fn new(len: usize, now: u64) -> Self {
        Self {
            buckets: vec![0; len],
            total: 0,
            last_tick: now,
        }
    }

    fn advance(&mut self, now: u64) {
        if now <= self.last_tick {
            return;
        }

        let len = self.buckets.len() as u64;
        let steps = (now - self.last_tick).min(len);
        for i in 1..=steps {
            let idx = ((self.last_tick + i) % len) as usize;
            self.total -= self.buckets[idx];
            self.buckets[idx] = 0;
        }

        self.last_tick = now;
    }

    fn hit(&mut self, now: u64) {
        self.advance(now);
        let idx = (now % self.buckets.len() as u64) as usize;
        self.buckets[idx] += 1;
        self.total += 1;
    }

    fn count(&mut self, now: u64) -> u32 {
        self.advance(now);
        self.total
    }
}

/// Sliding-window admission control plus the abuse ban list.
///
/// Keys are `adapter:<server_id>`, `client:<user_id>` and
/// `unauth-adapter:<ip>`; limits are chosen by the caller per key class.
/// Windows are sharded so the router's hot path never funnels through one
/// lock.
pub struct RateLimiter {
    shards: [Mutex<AHashMap<String, Window>>; SHARDS],
    violations: Mutex<AHashMap<IpAddr, Window>>,
    bans: RwLock<AHashMap<IpAddr, u64>>,
    options: RateLimiterOptions,
}

impl RateLimiter {
    pub fn new(options: RateLimiterOptions) -> Self {
        Self {
            shards: std::array::from_fn(|_| Mutex::new(AHashMap::new())),
            violations: Mutex::new(AHashMap::new()),
            bans: RwLock::new(AHashMap::new()),
            options,
        }
    }

    /// Admit one message for `key`. A deny counts a violation against the
    /// remote IP; enough violations inside the window ban it.
    pub fn check(&self, key: &str, limit: u32, ip: IpAddr, now: u64) -> Admission {
        let denied = {
            let mut shard = self.shards[self.shard_index(key)].lock();
            let window = shard
                .entry(key.to_string())
                .or_insert_with(|| Window::new(self.options.window_secs as usize, now));

            if window.count(now) >= limit {
                true
            } else {
                window.hit(now);
                false
            }
        };

        if denied {
            self.record_violation(ip, now);
            Admission::Deny
        } else {
            Admission::Allow
        }
    }

    /// Whether `key` is at its limit, without consuming budget or counting
    /// a violation. Used for the pre-handshake check on the adapter
    /// listener, which only spends budget on a failed handshake.
    pub fn peek(&self, key: &str, limit: u32, now: u64) -> Admission {
        let mut shard = self.shards[self.shard_index(key)].lock();
        if let Some(window) = shard.get_mut(key) {
            if window.count(now) >= limit {
                return Admission::Deny;
            }
        }
        Admission::Allow
    }

    pub fn is_banned(&self, ip: IpAddr, now: u64) -> bool {
        self.bans.read().get(&ip).is_some_and(|expiry| *expiry > now)
    }

    /// Drop expired bans and idle windows; returns the active ban count.
    pub fn sweep(&self, now: u64) -> usize {
        let active = {
            let mut bans = self.bans.write();
            bans.retain(|_, expiry| *expiry > now);
            bans.len()
        };

        for shard in &self.shards {
            shard.lock().retain(|_, window| window.count(now) > 0);
        }
        self.violations.lock().retain(|_, window| window.count(now) > 0);

        active
    }

    pub fn active_bans(&self) -> usize {
        self.bans.read().len()
    }

    fn record_violation(&self, ip: IpAddr, now: u64) {
        let crossed = {
            let mut violations = self.violations.lock();
            let window = violations
                .entry(ip)
                .or_insert_with(|| Window::new(self.options.window_secs as usize, now));
            window.hit(now);
            window.total >= self.options.ban_threshold
        };

        if crossed {
            self.bans.write().insert(ip, now + self.options.ban_secs);
        }
    }

    fn shard_index(&self, key: &str) -> usize {
        let mut hasher = ahash::AHasher::default();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % SHARDS
    }
}
