use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use parking_lot::Mutex;
use proto::Role;
use serde::Serialize;

#[derive(Default)]
struct Count(AtomicU64);

impl Count {
    fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct Gauge(AtomicUsize);

impl Gauge {
    fn set(&self, value: usize) {
        self.0.store(value, Ordering::Relaxed);
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of the counters, for `/health` and the periodic
/// debug log line.
#[derive(Debug, Serialize)]
pub struct Snapshot {
    pub active_adapters: usize,
    pub active_clients_by_role: [usize; Role::COUNT],
    pub messages_in_total: u64,
    pub messages_out_total: u64,
    pub messages_per_second: f64,
    pub connection_errors: u64,
    pub authentication_failures: u64,
    pub rate_limit_denies: u64,
    pub parse_errors: u64,
    pub bans_active: usize,
}

impl Snapshot {
    pub fn active_connections(&self) -> usize {
        self.active_adapters + self.active_clients_by_role.iter().sum::<usize>()
    }
}

/// Hub-wide counters. Cheap to clone; every handle shares the same cells.
#[derive(Clone, Default)]
pub struct Statistics(Arc<Inner>);

#[derive(Default)]
struct Inner {
    messages_in: Count,
    messages_out: Count,
    connection_errors: Count,
    authentication_failures: Count,
    rate_limit_denies: Count,
    parse_errors: Count,
    active_adapters: Gauge,
    active_clients: [Gauge; Role::COUNT],
    bans_active: Gauge,
    ewma: Mutex<Ewma>,
}

#[derive(Default)]
struct Ewma {
    last_total: u64,
    value: f64,
}

impl Statistics {
    pub fn message_in(&self) {
        self.0.messages_in.add(1);
    }

    pub fn message_out(&self) {
        self.0.messages_out.add(1);
    }

    pub fn connection_error(&self) {
        self.0.connection_errors.add(1);
    }

    pub fn authentication_failure(&self) {
        self.0.authentication_failures.add(1);
    }

    pub fn rate_limit_deny(&self) {
        self.0.rate_limit_denies.add(1);
    }

    pub fn parse_error(&self) {
        self.0.parse_errors.add(1);
    }

    pub fn set_active_adapters(&self, value: usize) {
        self.0.active_adapters.set(value);
    }

    pub fn set_active_clients(&self, by_role: [usize; Role::COUNT]) {
        for (gauge, value) in self.0.active_clients.iter().zip(by_role) {
            gauge.set(value);
        }
    }

    pub fn set_bans_active(&self, value: usize) {
        self.0.bans_active.set(value);
    }

    /// Fold the traffic since the previous tick into the EWMA. Called by
    /// the supervisor on the metrics interval.
    pub fn tick_rate(&self, interval_secs: u64) {
        const ALPHA: f64 = 0.3;

        let total = self.0.messages_in.get() + self.0.messages_out.get();
        let mut ewma = self.0.ewma.lock();
        let rate = (total - ewma.last_total) as f64 / interval_secs.max(1) as f64;
        ewma.value = ALPHA * rate + (1.0 - ALPHA) * ewma.value;
        ewma.last_total = total;
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            active_adapters: self.0.active_adapters.get(),
            active_clients_by_role: std::array::from_fn(|i| self.0.active_clients[i].get()),
            messages_in_total: self.0.messages_in.get(),
            messages_out_total: self.0.messages_out.get(),
            messages_per_second: self.0.ewma.lock().value,
            connection_errors: self.0.connection_errors.get(),
            authentication_failures: self.0.authentication_failures.get(),
            rate_limit_denies: self.0.rate_limit_denies.get(),
            parse_errors: self.0.parse_errors.get(),
            bans_active: self.0.bans_active.get(),
        }
    }
}
