use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

const RPC_LATENCY_BUCKET_UPPER_US: [u64; 8] =
    [100, 250, 500, 1_000, 2_500, 5_000, 10_000, u64::MAX];

/// Serializable form of [`BusMetrics`], returned by the `metrics.snapshot`
/// internal API (SPEC §4.J) and `BusClient::metrics_snapshot`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BusMetricsSnapshot {
    pub uptime_millis: u64,
    pub ingress_total: u64,
    pub ingress_rate_per_sec: f64,
    pub pending_rpc_count: u64,
    pub pending_server_execution_count: u64,
    pub active_listener_count: u64,
    pub event_publish_count: u64,
    pub broadcast_send_failed: u64,
    pub rpc_call_count: u64,
    pub rpc_call_error_count: u64,
    pub rpc_call_latency_avg_micros: f64,
    pub rpc_call_latency_p95_micros: u64,
    pub rpc_call_latency_max_micros: u64,
}

/// Lock-free atomic counters backing [`BusMetricsSnapshot`]. Hot paths stay O(1).
pub struct BusMetrics {
    start_unix_millis: i64,
    ingress_total: AtomicU64,
    pending_rpc_count: AtomicU64,
    pending_server_execution_count: AtomicU64,
    active_listener_count: AtomicU64,
    event_publish_count: AtomicU64,
    broadcast_send_failed: AtomicU64,
    rpc_call_count: AtomicU64,
    rpc_call_error_count: AtomicU64,
    rpc_call_latency_total_micros: AtomicU64,
    rpc_call_latency_max_micros: AtomicU64,
    rpc_call_latency_buckets: [AtomicU64; 8],
}

impl BusMetrics {
    pub fn new(start_unix_millis: i64) -> Self {
        Self {
            start_unix_millis,
            ingress_total: AtomicU64::new(0),
            pending_rpc_count: AtomicU64::new(0),
            pending_server_execution_count: AtomicU64::new(0),
            active_listener_count: AtomicU64::new(0),
            event_publish_count: AtomicU64::new(0),
            broadcast_send_failed: AtomicU64::new(0),
            rpc_call_count: AtomicU64::new(0),
            rpc_call_error_count: AtomicU64::new(0),
            rpc_call_latency_total_micros: AtomicU64::new(0),
            rpc_call_latency_max_micros: AtomicU64::new(0),
            rpc_call_latency_buckets: Default::default(),
        }
    }

    pub fn record_ingress(&self) {
        self.ingress_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_pending_rpc(&self) {
        self.pending_rpc_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_pending_rpc(&self) {
        saturating_dec(&self.pending_rpc_count);
    }

    pub fn inc_pending_server_execution(&self) {
        self.pending_server_execution_count
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_pending_server_execution(&self) {
        saturating_dec(&self.pending_server_execution_count);
    }

    pub fn set_active_listener_count(&self, count: u64) {
        self.active_listener_count.store(count, Ordering::Relaxed);
    }

    pub fn record_event_publish(&self) {
        self.event_publish_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_broadcast_send_failed(&self) {
        self.broadcast_send_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one completed client RPC call with its round-trip latency.
    pub fn record_rpc_call(&self, latency_micros: u64, is_error: bool) {
        self.rpc_call_count.fetch_add(1, Ordering::Relaxed);
        if is_error {
            self.rpc_call_error_count.fetch_add(1, Ordering::Relaxed);
        }
        self.rpc_call_latency_total_micros
            .fetch_add(latency_micros, Ordering::Relaxed);
        max_update(&self.rpc_call_latency_max_micros, latency_micros);
        let bucket_index = latency_bucket_index(latency_micros);
        self.rpc_call_latency_buckets[bucket_index].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, now_unix_millis: i64) -> BusMetricsSnapshot {
        let uptime_millis = if now_unix_millis <= self.start_unix_millis {
            0
        } else {
            (now_unix_millis - self.start_unix_millis) as u64
        };
        let ingress_total = self.ingress_total.load(Ordering::Relaxed);
        let ingress_rate_per_sec = if uptime_millis == 0 {
            0.0
        } else {
            (ingress_total as f64) / ((uptime_millis as f64) / 1_000.0)
        };

        let rpc_call_count = self.rpc_call_count.load(Ordering::Relaxed);
        let rpc_call_latency_total_micros =
            self.rpc_call_latency_total_micros.load(Ordering::Relaxed);
        let rpc_call_latency_avg_micros = if rpc_call_count == 0 {
            0.0
        } else {
            (rpc_call_latency_total_micros as f64) / (rpc_call_count as f64)
        };

        BusMetricsSnapshot {
            uptime_millis,
            ingress_total,
            ingress_rate_per_sec,
            pending_rpc_count: self.pending_rpc_count.load(Ordering::Relaxed),
            pending_server_execution_count: self
                .pending_server_execution_count
                .load(Ordering::Relaxed),
            active_listener_count: self.active_listener_count.load(Ordering::Relaxed),
            event_publish_count: self.event_publish_count.load(Ordering::Relaxed),
            broadcast_send_failed: self.broadcast_send_failed.load(Ordering::Relaxed),
            rpc_call_count,
            rpc_call_error_count: self.rpc_call_error_count.load(Ordering::Relaxed),
            rpc_call_latency_avg_micros,
            rpc_call_latency_p95_micros: self.rpc_call_latency_p95_micros(),
            rpc_call_latency_max_micros: self.rpc_call_latency_max_micros.load(Ordering::Relaxed),
        }
    }

    fn rpc_call_latency_p95_micros(&self) -> u64 {
        let total = self.rpc_call_count.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }
        let threshold = total.saturating_mul(95).div_ceil(100);
        let mut cumulative = 0u64;
        for (i, upper) in RPC_LATENCY_BUCKET_UPPER_US.iter().enumerate() {
            cumulative = cumulative
                .saturating_add(self.rpc_call_latency_buckets[i].load(Ordering::Relaxed));
            if cumulative >= threshold {
                return *upper;
            }
        }
        u64::MAX
    }
}

fn latency_bucket_index(latency_micros: u64) -> usize {
    for (i, upper) in RPC_LATENCY_BUCKET_UPPER_US.iter().enumerate() {
        if latency_micros <= *upper {
            return i;
        }
    }
    RPC_LATENCY_BUCKET_UPPER_US.len().saturating_sub(1)
}

fn saturating_dec(v: &AtomicU64) {
    let mut current = v.load(Ordering::Relaxed);
    loop {
        if current == 0 {
            return;
        }
        match v.compare_exchange_weak(current, current - 1, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(next) => current = next,
        }
    }
}

fn max_update(v: &AtomicU64, candidate: u64) {
    let mut current = v.load(Ordering::Relaxed);
    while candidate > current {
        match v.compare_exchange_weak(current, candidate, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(next) => current = next,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_computes_p95_from_histogram() {
        let metrics = BusMetrics::new(0);
        for _ in 0..95 {
            metrics.record_rpc_call(80, false);
        }
        for _ in 0..5 {
            metrics.record_rpc_call(8_000, true);
        }

        let snapshot = metrics.snapshot(2_000);
        assert_eq!(snapshot.rpc_call_count, 100);
        assert_eq!(snapshot.rpc_call_error_count, 5);
        assert_eq!(snapshot.rpc_call_latency_p95_micros, 100);
        assert_eq!(snapshot.rpc_call_latency_max_micros, 8_000);
    }

    #[test]
    fn pending_rpc_count_does_not_underflow() {
        let metrics = BusMetrics::new(0);
        metrics.dec_pending_rpc();
        let snapshot = metrics.snapshot(1_000);
        assert_eq!(snapshot.pending_rpc_count, 0);
    }
}
