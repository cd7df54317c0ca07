//! Rate/session store and IP reputation interfaces.
//!
//! The pipeline reads request counters and challenge-pass timestamps through
//! [`RateStore`] and never caches them between requests. Deployments with
//! several workers plug in a shared store; [`MemoryRateStore`] serves a
//! single process.

use async_trait::async_trait;
use dashmap::DashMap;
use ipnet::IpNet;
use moka::future::Cache;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

const HOUR: u64 = 3600;
const DAY: u64 = 24 * HOUR;

/// Store failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("rate store unavailable: {0}")]
    Unavailable(String),
}

/// Counters and last verification pass for one client address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateWindow {
    /// Requests in the current hour window
    pub hourly: u64,
    /// Requests in the current day window
    pub daily: u64,
    /// Last successful human verification
    pub last_pass: Option<SystemTime>,
}

impl RateWindow {
    /// Time since the last pass; `Duration::MAX` when the client never passed.
    pub fn pass_age(&self, now: SystemTime) -> Duration {
        match self.last_pass {
            Some(at) => now.duration_since(at).unwrap_or_default(),
            None => Duration::MAX,
        }
    }
}

/// Shared per-client counters.
#[async_trait]
pub trait RateStore: Send + Sync {
    /// Read the counters for a client and, when `count` is set, count this
    /// request in the same atomic step.
    ///
    /// Returns the counters as they were before this request was counted, so
    /// concurrent callers observe distinct values.
    async fn observe(&self, ip: IpAddr, count: bool) -> Result<RateWindow, StoreError>;

    /// Remember a successful human verification.
    async fn record_challenge_pass(&self, ip: IpAddr) -> Result<(), StoreError>;
}

/// Fixed hour/day windows for one address.
#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    hour_index: u64,
    hourly: u64,
    day_index: u64,
    daily: u64,
}

impl Counters {
    fn roll(&mut self, secs: u64) {
        let hour_index = secs / HOUR;
        if hour_index != self.hour_index {
            self.hour_index = hour_index;
            self.hourly = 0;
        }
        let day_index = secs / DAY;
        if day_index != self.day_index {
            self.day_index = day_index;
            self.daily = 0;
        }
    }

    fn is_stale(&self, secs: u64) -> bool {
        self.day_index != secs / DAY
    }
}

fn epoch_secs(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// In-process store: counters in a `DashMap`, passes in a TTL cache.
pub struct MemoryRateStore {
    counters: DashMap<IpAddr, Counters>,
    passes: Cache<IpAddr, SystemTime>,
    max_clients: usize,
    /// Counter for cleanup scheduling
    request_counter: AtomicU64,
}

impl MemoryRateStore {
    /// Create a store tracking at most `max_clients` addresses.
    pub fn new(max_clients: usize, pass_ttl: Duration) -> Self {
        let passes = Cache::builder()
            .max_capacity(max_clients as u64)
            .time_to_live(pass_ttl)
            .build();

        Self {
            counters: DashMap::new(),
            passes,
            max_clients,
            request_counter: AtomicU64::new(0),
        }
    }

    /// Number of addresses with live counters.
    pub fn tracked_clients(&self) -> usize {
        self.counters.len()
    }

    fn observe_at(&self, ip: IpAddr, now: SystemTime, count: bool) -> (u64, u64) {
        let secs = epoch_secs(now);

        if !count {
            return match self.counters.get(&ip) {
                Some(entry) => {
                    let mut c = *entry;
                    c.roll(secs);
                    (c.hourly, c.daily)
                }
                None => (0, 0),
            };
        }

        self.maybe_cleanup(secs);

        if !self.counters.contains_key(&ip) && self.counters.len() >= self.max_clients {
            // Evict an arbitrary entry; the shard guard must be gone before removal
            let victim = self.counters.iter().next().map(|entry| *entry.key());
            if let Some(key) = victim {
                self.counters.remove(&key);
            }
        }

        let mut entry = self.counters.entry(ip).or_default();
        entry.roll(secs);
        let seen = (entry.hourly, entry.daily);
        entry.hourly += 1;
        entry.daily += 1;
        seen
    }

    fn maybe_cleanup(&self, secs: u64) {
        let count = self.request_counter.fetch_add(1, Ordering::Relaxed);

        // Cleanup every 1000 requests
        if count % 1000 == 999 {
            self.counters.retain(|_, c| !c.is_stale(secs));
        }
    }
}

impl Default for MemoryRateStore {
    fn default() -> Self {
        Self::new(100_000, Duration::from_secs(DAY + HOUR))
    }
}

#[async_trait]
impl RateStore for MemoryRateStore {
    async fn observe(&self, ip: IpAddr, count: bool) -> Result<RateWindow, StoreError> {
        let (hourly, daily) = self.observe_at(ip, SystemTime::now(), count);
        Ok(RateWindow {
            hourly,
            daily,
            last_pass: self.passes.get(&ip).await,
        })
    }

    async fn record_challenge_pass(&self, ip: IpAddr) -> Result<(), StoreError> {
        self.passes.insert(ip, SystemTime::now()).await;
        Ok(())
    }
}

/// Source of the known-proxy-or-bot signal.
#[async_trait]
pub trait IpReputation: Send + Sync {
    /// Whether the address belongs to a known proxy or bot network.
    async fn is_known_proxy_or_bot(&self, ip: IpAddr) -> bool;
}

/// Reputation from a fixed list of CIDR ranges.
#[derive(Debug, Clone, Default)]
pub struct StaticIpReputation {
    ranges: Vec<IpNet>,
}

impl StaticIpReputation {
    /// Parse ranges in CIDR notation.
    pub fn new<S: AsRef<str>>(ranges: &[S]) -> anyhow::Result<Self> {
        let ranges = ranges
            .iter()
            .map(|r| r.as_ref().parse::<IpNet>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { ranges })
    }
}

#[async_trait]
impl IpReputation for StaticIpReputation {
    async fn is_known_proxy_or_bot(&self, ip: IpAddr) -> bool {
        self.ranges.iter().any(|range| range.contains(&ip))
    }
}
