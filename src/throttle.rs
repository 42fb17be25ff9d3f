use std::time::{Duration, Instant};

use peer_proto::rate::MovingAverage;
use slab::Slab;

/// Refill cadence of the token bucket.
pub const TICK: Duration = Duration::from_millis(100);

/// Sliding window of the rate estimate.
const RATE_WINDOW: Duration = Duration::from_secs(60);

const MIN_GRANT: usize = 512;

/// Demand samples are clamped so a `usize::MAX` ask cannot wreck the
/// fixed-point average.
const DEMAND_CAP: usize = 1 << 20;

/// Transfer-rate meter over a sliding window.
pub struct Rate {
    samples: std::collections::VecDeque<(Instant, u64)>,
    total: u64,
}

impl Default for Rate {
    fn default() -> Self {
        Self::new()
    }
}

impl Rate {
    pub fn new() -> Self {
        Self {
            samples: std::collections::VecDeque::new(),
            total: 0,
        }
    }

    pub fn insert(&mut self, bytes: u64, now: Instant) {
        self.samples.push_back((now, bytes));
        self.total += bytes;
        self.expire(now);
    }

    /// Bytes per second over the window.
    pub fn rate(&mut self, now: Instant) -> u64 {
        self.expire(now);
        let elapsed = match self.samples.front() {
            Some((first, _)) => now.duration_since(*first).as_secs().max(1),
            None => return 0,
        };
        self.total / elapsed.min(RATE_WINDOW.as_secs())
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    fn expire(&mut self, now: Instant) {
        while let Some((t, bytes)) = self.samples.front() {
            if now.duration_since(*t) <= RATE_WINDOW {
                break;
            }
            self.total -= bytes;
            self.samples.pop_front();
        }
    }
}

/// Per-peer membership in a throttle group.
pub type NodeKey = usize;

struct Node {
    /// Recent demand, the weight for fair sharing.
    demand: MovingAverage,
    granted_this_tick: usize,
}

/// Token bucket shared by a group of peers.
///
/// Refills every 100 ms tick with a carry cap of one second's worth;
/// grants are split across nodes by recent demand. `max_rate == 0` means
/// unlimited: accounting is off but the rate meter still runs.
pub struct Throttle {
    max_rate: u32,
    available: usize,
    nodes: Slab<Node>,
    rate: Rate,
}

impl Throttle {
    pub fn new(max_rate: u32) -> Self {
        Self {
            max_rate,
            available: (max_rate / 10) as usize,
            nodes: Slab::new(),
            rate: Rate::new(),
        }
    }

    pub fn max_rate(&self) -> u32 {
        self.max_rate
    }

    pub fn is_throttled(&self) -> bool {
        self.max_rate > 0
    }

    pub fn set_max_rate(&mut self, max_rate: u32) {
        self.max_rate = max_rate;
        self.available = self.available.min(max_rate as usize);
    }

    pub fn add_node(&mut self) -> NodeKey {
        self.nodes.insert(Node {
            demand: MovingAverage::new(10),
            granted_this_tick: 0,
        })
    }

    pub fn remove_node(&mut self, key: NodeKey) {
        if self.nodes.contains(key) {
            self.nodes.remove(key);
        }
    }

    /// Refill the bucket; unused tokens carry over up to one second's
    /// budget.
    pub fn tick(&mut self) {
        if self.max_rate == 0 {
            return;
        }
        self.available = (self.available + self.max_rate as usize / 10)
            .min(self.max_rate as usize);
        for (_, node) in self.nodes.iter_mut() {
            node.granted_this_tick = 0;
        }
    }

    /// Ask for up to `want` bytes; the grant may be smaller. Actual usage
    /// is reported through [`record`](Throttle::record).
    pub fn request(&mut self, key: NodeKey, want: usize) -> usize {
        if want == 0 || !self.nodes.contains(key) {
            return 0;
        }

        let sample = want.min(DEMAND_CAP) as i64;

        if self.max_rate == 0 {
            self.nodes[key].demand.add_sample(sample);
            return want;
        }

        // Share of one tick's refill weighted by recent demand, read
        // before this request is folded in so a sudden burst cannot buy
        // itself the whole refill. The floor keeps light and new nodes
        // from being starved by heavy ones.
        let total: u64 = self.nodes.iter().map(|(_, n)| demand_weight(n)).sum();
        let weight = demand_weight(&self.nodes[key]);
        let refill = (self.max_rate / 10) as u64;
        let share = ((refill * weight / total.max(1)) as usize).max(MIN_GRANT);

        let node = &mut self.nodes[key];
        let left = share.saturating_sub(node.granted_this_tick);
        let grant = want.min(left).min(self.available);
        node.granted_this_tick += grant;
        node.demand.add_sample(sample);

        self.available -= grant;
        grant
    }

    /// Account bytes that actually hit the wire.
    pub fn record(&mut self, _key: NodeKey, bytes: usize, now: Instant) {
        self.rate.insert(bytes as u64, now);
    }

    #[cfg(test)]
    fn demand_of(&self, key: NodeKey) -> i64 {
        self.nodes[key].demand.mean()
    }

    pub fn rate(&mut self, now: Instant) -> u64 {
        self.rate.rate(now)
    }

    pub fn total(&self) -> u64 {
        self.rate.total()
    }
}

/// A node's weight in the share split: its average demand, floored so
/// idle history never zeroes anyone out.
fn demand_weight(node: &Node) -> u64 {
    node.demand.mean().max(MIN_GRANT as i64) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_grants_everything() {
        let mut t = Throttle::new(0);
        let k = t.add_node();
        assert_eq!(t.request(k, 1 << 20), 1 << 20);

        let now = Instant::now();
        t.record(k, 1 << 20, now);
        assert_eq!(t.total(), 1 << 20);
    }

    #[test]
    fn rate_limit_over_simulated_time() {
        // 100 KiB/s across 10 peers for 2 simulated seconds.
        let max = 100 * 1024;
        let mut t = Throttle::new(max);
        let keys: Vec<_> = (0..10).map(|_| t.add_node()).collect();

        let mut delivered = vec![0usize; keys.len()];
        for _ in 0..20 {
            t.tick();
            for (i, &k) in keys.iter().enumerate() {
                delivered[i] += t.request(k, usize::MAX);
            }
        }

        let total: usize = delivered.iter().sum();
        let expect = 2 * max as usize;
        assert!(
            total >= expect * 9 / 10 && total <= expect * 11 / 10,
            "total {} outside [{}, {}]",
            total,
            expect * 9 / 10,
            expect * 11 / 10
        );

        // Shares within 15% of equal.
        let equal = total / keys.len();
        for d in &delivered {
            assert!(
                (*d as i64 - equal as i64).unsigned_abs() as usize <= equal * 15 / 100,
                "share {} deviates from {}",
                d,
                equal
            );
        }
    }

    #[test]
    fn carry_is_capped() {
        let mut t = Throttle::new(1000);
        let k = t.add_node();

        // Long idle: many ticks with no demand.
        for _ in 0..100 {
            t.tick();
        }

        // At most one second's worth burst.
        let mut burst = 0;
        for _ in 0..10 {
            burst += t.request(k, usize::MAX);
        }
        assert!(burst <= 1000 + 512, "burst {}", burst);
    }

    #[test]
    fn shares_follow_recent_demand() {
        // 10 KiB/s: 1024 bytes of refill per tick.
        let mut t = Throttle::new(10_240);
        let a = t.add_node();
        let b = t.add_node();

        // Build history: A keeps asking for a lot, B for a little.
        for _ in 0..10 {
            t.tick();
            let _ = t.request(a, 8192);
            let _ = t.request(b, 256);
        }
        assert!(t.demand_of(a) > t.demand_of(b));

        // Both now want everything; A's recent demand buys the larger
        // share of the tick.
        t.tick();
        let ga = t.request(a, usize::MAX);
        let gb = t.request(b, usize::MAX);
        assert!(
            ga > gb,
            "demand-weighted shares out of order: {} vs {}",
            ga,
            gb
        );
    }

    #[test]
    fn light_user_not_starved() {
        let mut t = Throttle::new(10_000);
        let heavy = t.add_node();
        let light = t.add_node();

        t.tick();
        let _ = t.request(heavy, usize::MAX);
        let got = t.request(light, 400);
        assert_eq!(got, 400);
    }

    #[test]
    fn rate_window_expires() {
        let mut r = Rate::new();
        let t0 = Instant::now();
        r.insert(6000, t0);
        assert_eq!(r.rate(t0 + Duration::from_secs(3)), 2000);

        // After the window the sample ages out.
        assert_eq!(r.rate(t0 + Duration::from_secs(61)), 0);
        assert_eq!(r.total(), 0);
    }
}
