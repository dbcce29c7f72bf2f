//! Metrics exposition (ambient concern carried despite spec §1 listing the
//! scrape endpoint as an external collaborator's job — see SPEC_FULL.md §G).
//!
//! Grounded on `original_source/app/services/metrics.py`'s two kinds of
//! counter: cumulative totals that only ever grow (`aggr_*_bytes_total`,
//! tracked here with `AtomicU64`) and instantaneous gauges recomputed from
//! the Registry snapshot on every scrape (active stream/engine counts,
//! current aggregate throughput). No `prometheus` crate dependency — like
//! the teacher's `session_tracker.rs` reporter, the text is hand-written
//! since the surface is small and fixed.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::models::{EgressState, Engine, Stream};

pub struct MetricsSink {
    downloaded_bytes_total: AtomicU64,
    uploaded_bytes_total: AtomicU64,
}

impl MetricsSink {
    pub fn new() -> Self {
        Self {
            downloaded_bytes_total: AtomicU64::new(0),
            uploaded_bytes_total: AtomicU64::new(0),
        }
    }

    /// Fold in the delta between a stream's already-accounted byte counts
    /// and its latest snapshot, so cumulative totals never double-count or
    /// decrease (spec §8 invariant: aggregate counters are monotonic).
    pub fn accumulate(&self, downloaded_delta: u64, uploaded_delta: u64) {
        self.downloaded_bytes_total.fetch_add(downloaded_delta, Ordering::Relaxed);
        self.uploaded_bytes_total.fetch_add(uploaded_delta, Ordering::Relaxed);
    }

    pub fn downloaded_bytes_total(&self) -> u64 {
        self.downloaded_bytes_total.load(Ordering::Relaxed)
    }

    pub fn uploaded_bytes_total(&self) -> u64 {
        self.uploaded_bytes_total.load(Ordering::Relaxed)
    }
}

impl Default for MetricsSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a sum of per-stream kbps readings into MB/s.
///
/// Deliberately `sum_kbps * 1024 / (1024 * 1024)`, i.e. dividing by 1024
/// once net (kB/s -> MB/s), not twice. Spec §5 calls this out explicitly:
/// the original engine's own dashboard applies an extra `/1024` here, which
/// under-reports throughput by 1024x. This crate does not reproduce that
/// bug.
pub fn aggregate_speed_mbps(sum_kbps: i64) -> f64 {
    (sum_kbps as f64 * 1024.0) / (1024.0 * 1024.0)
}

/// Maps an `EgressState` to the numeric gauge value the spec's `egress_health`
/// metric exposes: `1` when the egress path is usable, `0` otherwise
/// (including `Disabled`/`Unknown`, which are "not confirmed healthy").
fn egress_health_value(state: EgressState) -> u8 {
    matches!(state, EgressState::Healthy) as u8
}

/// Render the full Prometheus text-exposition body for `GET /metrics`
/// (spec §6). Gauges are computed fresh from the given snapshots; the
/// cumulative counters come from `sink`. `min_replicas` is needed to derive
/// `engines_over_minimum`; `egress` is the live `EgressHealth` reading.
pub fn render(sink: &MetricsSink, engines: &[Engine], streams: &[Stream], min_replicas: u32, egress: EgressState) -> String {
    let active_streams = streams.len();
    let healthy_engines = engines
        .iter()
        .filter(|e| e.health_status == crate::models::HealthStatus::Healthy)
        .count();
    let unhealthy_engines = engines
        .iter()
        .filter(|e| e.health_status == crate::models::HealthStatus::Unhealthy)
        .count();
    let engines_with_streams = engines.iter().filter(|e| e.load() > 0).count();
    let engines_over_minimum = (engines.len() as i64 - min_replicas as i64).max(0);

    let sum_peers: i64 = streams
        .iter()
        .filter_map(|s| s.latest_stats.as_ref())
        .filter_map(|s| s.peers)
        .sum();
    let sum_down_kbps: i64 = streams
        .iter()
        .filter_map(|s| s.latest_stats.as_ref())
        .filter_map(|s| s.speed_down_kbps)
        .sum();
    let sum_up_kbps: i64 = streams
        .iter()
        .filter_map(|s| s.latest_stats.as_ref())
        .filter_map(|s| s.speed_up_kbps)
        .sum();

    let mut out = String::new();

    out.push_str("# HELP aggr_downloaded_bytes_total Cumulative bytes downloaded across all streams.\n");
    out.push_str("# TYPE aggr_downloaded_bytes_total counter\n");
    out.push_str(&format!("aggr_downloaded_bytes_total {}\n", sink.downloaded_bytes_total()));

    out.push_str("# HELP aggr_uploaded_bytes_total Cumulative bytes uploaded across all streams.\n");
    out.push_str("# TYPE aggr_uploaded_bytes_total counter\n");
    out.push_str(&format!("aggr_uploaded_bytes_total {}\n", sink.uploaded_bytes_total()));

    out.push_str("# HELP aggr_download_speed_mbps Aggregate instantaneous download throughput in MB/s.\n");
    out.push_str("# TYPE aggr_download_speed_mbps gauge\n");
    out.push_str(&format!("aggr_download_speed_mbps {:.4}\n", aggregate_speed_mbps(sum_down_kbps)));

    out.push_str("# HELP aggr_upload_speed_mbps Aggregate instantaneous upload throughput in MB/s.\n");
    out.push_str("# TYPE aggr_upload_speed_mbps gauge\n");
    out.push_str(&format!("aggr_upload_speed_mbps {:.4}\n", aggregate_speed_mbps(sum_up_kbps)));

    out.push_str("# HELP aggr_peers Aggregate peer count reported across all streams.\n");
    out.push_str("# TYPE aggr_peers gauge\n");
    out.push_str(&format!("aggr_peers {sum_peers}\n"));

    out.push_str("# HELP aggr_active_streams Number of streams currently being served.\n");
    out.push_str("# TYPE aggr_active_streams gauge\n");
    out.push_str(&format!("aggr_active_streams {active_streams}\n"));

    out.push_str("# HELP healthy_engines Number of engines reporting healthy.\n");
    out.push_str("# TYPE healthy_engines gauge\n");
    out.push_str(&format!("healthy_engines {healthy_engines}\n"));

    out.push_str("# HELP unhealthy_engines Number of engines reporting unhealthy.\n");
    out.push_str("# TYPE unhealthy_engines gauge\n");
    out.push_str(&format!("unhealthy_engines {unhealthy_engines}\n"));

    out.push_str("# HELP engines_with_streams Number of engines currently carrying at least one stream.\n");
    out.push_str("# TYPE engines_with_streams gauge\n");
    out.push_str(&format!("engines_with_streams {engines_with_streams}\n"));

    out.push_str("# HELP engines_over_minimum Number of registered engines above the configured replica floor.\n");
    out.push_str("# TYPE engines_over_minimum gauge\n");
    out.push_str(&format!("engines_over_minimum {engines_over_minimum}\n"));

    out.push_str("# HELP egress_health Whether the egress path is reporting healthy (1) or not (0).\n");
    out.push_str("# TYPE egress_health gauge\n");
    out.push_str(&format!("egress_health {}\n", egress_health_value(egress)));

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_conversion_divides_by_1024_once() {
        // 1024 kB/s should read as exactly 1 MB/s, not ~0.001.
        assert!((aggregate_speed_mbps(1024) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cumulative_counters_only_increase() {
        let sink = MetricsSink::new();
        sink.accumulate(100, 10);
        sink.accumulate(50, 5);
        assert_eq!(sink.downloaded_bytes_total(), 150);
        assert_eq!(sink.uploaded_bytes_total(), 15);
    }

    #[test]
    fn render_includes_required_metric_names() {
        let sink = MetricsSink::new();
        let text = render(&sink, &[], &[], 1, EgressState::Disabled);
        assert!(text.contains("aggr_active_streams 0"));
        assert!(text.contains("aggr_downloaded_bytes_total 0"));
        assert!(text.contains("aggr_peers 0"));
        assert!(text.contains("healthy_engines 0"));
        assert!(text.contains("unhealthy_engines 0"));
        assert!(text.contains("engines_with_streams 0"));
        assert!(text.contains("engines_over_minimum 0"));
        assert!(text.contains("egress_health 0"));
    }

    #[test]
    fn egress_health_reports_one_only_when_healthy() {
        assert_eq!(egress_health_value(EgressState::Healthy), 1);
        assert_eq!(egress_health_value(EgressState::Unhealthy), 0);
        assert_eq!(egress_health_value(EgressState::Disabled), 0);
    }
}
