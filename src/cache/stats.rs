use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Statistics for the caching proxy
#[derive(Debug, Clone)]
pub struct ProxyStats {
    /// Total number of routed (non-ping) requests
    pub requests_served: Arc<AtomicU64>,
    /// Number of ping requests answered inline
    pub ping_requests: Arc<AtomicU64>,
    /// Number of requests carrying a byte offset
    pub range_requests: Arc<AtomicU64>,
    /// Number of requests starting at byte zero
    pub full_requests: Arc<AtomicU64>,
    /// Bytes replayed from the local cache
    pub bytes_from_cache: Arc<AtomicU64>,
    /// Bytes relayed straight from the network
    pub bytes_from_network: Arc<AtomicU64>,
    /// Number of background catch-up tasks started
    pub catch_up_started: Arc<AtomicU64>,
    /// Number of cache files that reached the complete state
    pub files_completed: Arc<AtomicU64>,
    /// Number of requests that ended with an error
    pub failed_requests: Arc<AtomicU64>,
    /// Connections currently being served
    pub active_streams: Arc<AtomicU64>,
    /// Start time for calculating uptime
    pub start_time: Instant,
}

impl Default for ProxyStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyStats {
    pub fn new() -> Self {
        Self {
            requests_served: Arc::new(AtomicU64::new(0)),
            ping_requests: Arc::new(AtomicU64::new(0)),
            range_requests: Arc::new(AtomicU64::new(0)),
            full_requests: Arc::new(AtomicU64::new(0)),
            bytes_from_cache: Arc::new(AtomicU64::new(0)),
            bytes_from_network: Arc::new(AtomicU64::new(0)),
            catch_up_started: Arc::new(AtomicU64::new(0)),
            files_completed: Arc::new(AtomicU64::new(0)),
            failed_requests: Arc::new(AtomicU64::new(0)),
            active_streams: Arc::new(AtomicU64::new(0)),
            start_time: Instant::now(),
        }
    }

    pub fn increment_request(&self, offset: u64) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
        if offset > 0 {
            self.range_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.full_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn increment_ping(&self) {
        self.ping_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_cache_bytes(&self, bytes: u64) {
        self.bytes_from_cache.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_network_bytes(&self, bytes: u64) {
        self.bytes_from_network.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn increment_catch_up(&self) {
        self.catch_up_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_completed(&self) {
        self.files_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_failed(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_started(&self) {
        self.active_streams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_finished(&self) {
        // Saturating: never wrap below zero if start/finish ever get unbalanced.
        let _ = self
            .active_streams
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn catch_up_count(&self) -> u64 {
        self.catch_up_started.load(Ordering::Relaxed)
    }

    pub fn format_report(&self) -> String {
        let uptime_secs = self.start_time.elapsed().as_secs();
        let hours = uptime_secs / 3600;
        let minutes = (uptime_secs % 3600) / 60;
        let seconds = uptime_secs % 60;

        let from_cache = self.bytes_from_cache.load(Ordering::Relaxed);
        let from_network = self.bytes_from_network.load(Ordering::Relaxed);
        let total = from_cache + from_network;
        let hit_rate = if total > 0 {
            (from_cache as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        let mut report = format!(
            "Proxy Stats [{}h {}m {}s] | Requests: {} | Active: {} | Cache: {:.2} MB | Network: {:.2} MB | Hit Rate: {:.1}% | Range: {} | Full: {}",
            hours,
            minutes,
            seconds,
            self.requests_served.load(Ordering::Relaxed),
            self.active_streams.load(Ordering::Relaxed),
            from_cache as f64 / (1024.0 * 1024.0),
            from_network as f64 / (1024.0 * 1024.0),
            hit_rate,
            self.range_requests.load(Ordering::Relaxed),
            self.full_requests.load(Ordering::Relaxed),
        );

        let failed = self.failed_requests.load(Ordering::Relaxed);
        let catch_ups = self.catch_up_started.load(Ordering::Relaxed);
        if failed > 0 || catch_ups > 0 {
            report.push_str(&format!(
                "\n   Catch-up: {} | Completed: {} | Failed: {}",
                catch_ups,
                self.files_completed.load(Ordering::Relaxed),
                failed
            ));
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_stats_format() {
        let stats = ProxyStats::new();

        stats.increment_request(0);
        stats.increment_request(100);
        stats.increment_request(200);
        stats.add_cache_bytes(1024 * 1024 * 3);
        stats.add_network_bytes(1024 * 1024);
        stats.stream_started();

        let report = stats.format_report();

        assert!(report.contains("Requests: 3"));
        assert!(report.contains("Active: 1"));
        assert!(report.contains("Cache: 3.00 MB"));
        assert!(report.contains("Network: 1.00 MB"));
        assert!(report.contains("Hit Rate: 75.0%"));
        assert!(report.contains("Range: 2"));
        assert!(report.contains("Full: 1"));
        assert!(!report.contains("Catch-up"));
    }

    #[test]
    fn test_failure_line_only_when_relevant() {
        let stats = ProxyStats::new();
        stats.increment_catch_up();
        stats.increment_failed();

        let report = stats.format_report();
        assert!(report.contains("Catch-up: 1"));
        assert!(report.contains("Failed: 1"));
    }

    #[test]
    fn test_active_streams_never_underflow() {
        let stats = ProxyStats::new();
        stats.stream_finished();
        assert_eq!(stats.active_streams.load(Ordering::Relaxed), 0);

        stats.stream_started();
        stats.stream_started();
        stats.stream_finished();
        assert_eq!(stats.active_streams.load(Ordering::Relaxed), 1);
    }
}
