//! In-process metrics sink.
//!
//! Each scenario owns a `Stats`; an agent-level sink is fed through `Stats::with_parent`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy)]
enum Counter {
    PullData,
    PushData,
    JoinRequests,
    Acked,
    Unacked,
    Datagrams,
    PullResp,
    DecodeErrors,
    EncodeErrors,
    DialErrors,
    Rounds,
    LatencySumUs,
    LatencyCount,
}

/// Traffic counters (thread-safe)
#[derive(Debug)]
pub struct Stats {
    pull_data_sent: AtomicU64,
    push_data_sent: AtomicU64,
    join_requests_sent: AtomicU64,
    acked: AtomicU64,
    unacked: AtomicU64,
    datagrams_received: AtomicU64,
    pull_resp_received: AtomicU64,
    decode_errors: AtomicU64,
    encode_errors: AtomicU64,
    dial_errors: AtomicU64,
    rounds: AtomicU64,
    latency_sum_us: AtomicU64,
    latency_count: AtomicU64,
    started: Instant,
    parent: Option<Arc<Stats>>,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            pull_data_sent: AtomicU64::new(0),
            push_data_sent: AtomicU64::new(0),
            join_requests_sent: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            unacked: AtomicU64::new(0),
            datagrams_received: AtomicU64::new(0),
            pull_resp_received: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            encode_errors: AtomicU64::new(0),
            dial_errors: AtomicU64::new(0),
            rounds: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
            started: Instant::now(),
            parent: None,
        }
    }

    /// A sink whose every record is also added to `parent`.
    pub fn with_parent(parent: Arc<Stats>) -> Self {
        Self { parent: Some(parent), ..Self::new() }
    }

    fn add(&self, counter: Counter, n: u64) {
        self.counter(counter).fetch_add(n, Ordering::Relaxed);
        if let Some(parent) = &self.parent {
            parent.add(counter, n);
        }
    }

    fn counter(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::PullData => &self.pull_data_sent,
            Counter::PushData => &self.push_data_sent,
            Counter::JoinRequests => &self.join_requests_sent,
            Counter::Acked => &self.acked,
            Counter::Unacked => &self.unacked,
            Counter::Datagrams => &self.datagrams_received,
            Counter::PullResp => &self.pull_resp_received,
            Counter::DecodeErrors => &self.decode_errors,
            Counter::EncodeErrors => &self.encode_errors,
            Counter::DialErrors => &self.dial_errors,
            Counter::Rounds => &self.rounds,
            Counter::LatencySumUs => &self.latency_sum_us,
            Counter::LatencyCount => &self.latency_count,
        }
    }

    pub fn record_pull_data(&self) {
        self.add(Counter::PullData, 1);
    }

    pub fn record_push_data(&self, join_request: bool) {
        self.add(Counter::PushData, 1);
        if join_request {
            self.add(Counter::JoinRequests, 1);
        }
    }

    /// Acked and unacked totals for one finished exchange.
    pub fn record_acks(&self, acked: u64, unacked: u64) {
        self.add(Counter::Acked, acked);
        self.add(Counter::Unacked, unacked);
    }

    pub fn record_datagram(&self, latency: Duration) {
        self.add(Counter::Datagrams, 1);
        self.add(Counter::LatencySumUs, latency.as_micros() as u64);
        self.add(Counter::LatencyCount, 1);
    }

    pub fn record_pull_resp(&self) {
        self.add(Counter::PullResp, 1);
    }

    pub fn record_decode_error(&self) {
        self.add(Counter::DecodeErrors, 1);
    }

    pub fn record_encode_error(&self) {
        self.add(Counter::EncodeErrors, 1);
    }

    pub fn record_dial_error(&self) {
        self.add(Counter::DialErrors, 1);
    }

    pub fn record_round(&self) {
        self.add(Counter::Rounds, 1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let latency_count = self.latency_count.load(Ordering::Relaxed);
        let avg_latency_ms = if latency_count == 0 {
            0.0
        } else {
            self.latency_sum_us.load(Ordering::Relaxed) as f64 / latency_count as f64 / 1000.0
        };
        StatsSnapshot {
            pull_data_sent: self.pull_data_sent.load(Ordering::Relaxed),
            push_data_sent: self.push_data_sent.load(Ordering::Relaxed),
            join_requests_sent: self.join_requests_sent.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            unacked: self.unacked.load(Ordering::Relaxed),
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            pull_resp_received: self.pull_resp_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            encode_errors: self.encode_errors.load(Ordering::Relaxed),
            dial_errors: self.dial_errors.load(Ordering::Relaxed),
            rounds: self.rounds.load(Ordering::Relaxed),
            avg_latency_ms,
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

/// Snapshot of traffic counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub pull_data_sent: u64,
    pub push_data_sent: u64,
    pub join_requests_sent: u64,
    pub acked: u64,
    pub unacked: u64,
    pub datagrams_received: u64,
    pub pull_resp_received: u64,
    pub decode_errors: u64,
    pub encode_errors: u64,
    pub dial_errors: u64,
    pub rounds: u64,
    pub avg_latency_ms: f64,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let stats = Stats::new();
        stats.record_pull_data();
        stats.record_push_data(true);
        stats.record_push_data(false);
        stats.record_acks(1, 1);
        stats.record_datagram(Duration::from_millis(4));
        stats.record_datagram(Duration::from_millis(2));

        let snap = stats.snapshot();
        assert_eq!(snap.pull_data_sent, 1);
        assert_eq!(snap.push_data_sent, 2);
        assert_eq!(snap.join_requests_sent, 1);
        assert_eq!(snap.acked, 1);
        assert_eq!(snap.unacked, 1);
        assert_eq!(snap.datagrams_received, 2);
        assert!((snap.avg_latency_ms - 3.0).abs() < 0.001);
    }

    #[test]
    fn test_child_records_feed_parent() {
        let agent = Arc::new(Stats::new());
        let first = Stats::with_parent(Arc::clone(&agent));
        let second = Stats::with_parent(Arc::clone(&agent));
        first.record_push_data(false);
        first.record_round();
        second.record_push_data(true);
        second.record_acks(1, 0);

        assert_eq!(first.snapshot().push_data_sent, 1);
        assert_eq!(first.snapshot().acked, 0);
        assert_eq!(second.snapshot().rounds, 0);
        let totals = agent.snapshot();
        assert_eq!(totals.push_data_sent, 2);
        assert_eq!(totals.join_requests_sent, 1);
        assert_eq!(totals.acked, 1);
        assert_eq!(totals.rounds, 1);
    }
}
