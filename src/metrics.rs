//! Lightweight Prometheus-compatible counters for the CCB broker.
//!
//! Uses atomic counters so a snapshot can be read through a shared
//! reference. Rendered in Prometheus text exposition format.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Broker counters
pub struct Metrics {
    /// Fresh target registrations (counter)
    pub targets_registered_total: AtomicU64,
    /// Targets that reclaimed their previous ccbid (counter)
    pub targets_reconnected_total: AtomicU64,
    /// Reconnect attempts that fell back to a fresh ccbid (counter)
    pub reconnect_rejections_total: AtomicU64,
    /// Targets torn down for any reason (counter)
    pub target_disconnects_total: AtomicU64,
    /// Client requests received (counter)
    pub requests_total: AtomicU64,
    /// Requests rejected because the target was unknown (counter)
    pub requests_rejected_total: AtomicU64,
    /// Requests the target reported as connected (counter)
    pub requests_succeeded_total: AtomicU64,
    /// Requests answered with a failure (counter)
    pub requests_failed_total: AtomicU64,
    /// Reconnect records expired by the sweep (counter)
    pub reconnect_records_pruned_total: AtomicU64,
    /// Broker start time (for uptime calculation)
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            targets_registered_total: AtomicU64::new(0),
            targets_reconnected_total: AtomicU64::new(0),
            reconnect_rejections_total: AtomicU64::new(0),
            target_disconnects_total: AtomicU64::new(0),
            requests_total: AtomicU64::new(0),
            requests_rejected_total: AtomicU64::new(0),
            requests_succeeded_total: AtomicU64::new(0),
            requests_failed_total: AtomicU64::new(0),
            reconnect_records_pruned_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Render metrics in Prometheus text exposition format.
    ///
    /// Gauges for the current number of targets and pending requests are
    /// supplied by the caller.
    pub fn render(&self, live_targets: usize, pending_requests: usize) -> String {
        let counters: [(&str, &str, &AtomicU64); 9] = [
            ("ccb_targets_registered_total", "Fresh target registrations", &self.targets_registered_total),
            ("ccb_targets_reconnected_total", "Targets that reclaimed their ccbid", &self.targets_reconnected_total),
            ("ccb_reconnect_rejections_total", "Reconnect attempts given a fresh ccbid", &self.reconnect_rejections_total),
            ("ccb_target_disconnects_total", "Targets torn down", &self.target_disconnects_total),
            ("ccb_requests_total", "Client requests received", &self.requests_total),
            ("ccb_requests_rejected_total", "Requests for unknown targets", &self.requests_rejected_total),
            ("ccb_requests_succeeded_total", "Requests the target connected", &self.requests_succeeded_total),
            ("ccb_requests_failed_total", "Requests answered with a failure", &self.requests_failed_total),
            ("ccb_reconnect_records_pruned_total", "Expired reconnect records", &self.reconnect_records_pruned_total),
        ];

        let mut out = String::new();
        for (name, help, value) in counters {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n",
                value.load(Ordering::Relaxed)
            ));
        }
        out.push_str(&format!(
            "# HELP ccb_targets Currently registered targets\n\
             # TYPE ccb_targets gauge\n\
             ccb_targets {}\n\
             # HELP ccb_pending_requests Requests waiting for a target result\n\
             # TYPE ccb_pending_requests gauge\n\
             ccb_pending_requests {}\n\
             # HELP ccb_uptime_seconds Broker uptime in seconds\n\
             # TYPE ccb_uptime_seconds gauge\n\
             ccb_uptime_seconds {}\n",
            live_targets,
            pending_requests,
            self.start_time.elapsed().as_secs(),
        ));
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
