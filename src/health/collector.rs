//! The periodic loop that ties stat polling and inactivity detection
//! together (spec §4.4's `Collector._run` equivalent).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tracing::{info, warn};

use crate::health::{self, InactivityReason, InactivityThresholds, InactivityTracker};
use crate::metrics::MetricsSink;
use crate::models::{StatSnapshot, Stream, StreamEndedEvent, StreamStatus};
use crate::registry::Registry;

pub struct HealthCollector {
    registry: Arc<Registry>,
    metrics: Arc<MetricsSink>,
    tracker: InactivityTracker,
    client: reqwest::Client,
    collect_interval: Duration,
    stat_poll_timeout: Duration,
    stop_command_timeout: Duration,
}

impl HealthCollector {
    pub fn new(
        registry: Arc<Registry>,
        metrics: Arc<MetricsSink>,
        thresholds: InactivityThresholds,
        collect_interval: Duration,
        stat_poll_timeout: Duration,
        stop_command_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            metrics,
            tracker: InactivityTracker::new(thresholds),
            client: reqwest::Client::new(),
            collect_interval,
            stat_poll_timeout,
            stop_command_timeout,
        }
    }

    /// Run forever, polling every started stream's `stat_url` once per
    /// `collect_interval`. Never returns under normal operation; intended
    /// to be spawned as a background task from `App`.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.collect_interval);
        loop {
            ticker.tick().await;
            let streams = self.registry.list_streams(Some(StreamStatus::Started)).await;
            join_all(streams.into_iter().map(|s| {
                let this = self.clone();
                async move { this.collect_one(s.id).await }
            }))
            .await;
        }
    }

    async fn collect_one(&self, stream_id: String) {
        let Some(stream) = self.registry.get_stream(&stream_id).await else {
            return;
        };

        match health::poll_stat(&self.client, &stream.stat_url, self.stat_poll_timeout).await {
            Ok(health::StatOutcome::Data(raw)) => {
                let snapshot = health::parse_stat(raw, Utc::now());
                self.accumulate_byte_deltas(&stream_id, &stream, &snapshot).await;
                self.registry.append_stat(&stream_id, snapshot.clone()).await;

                if let Some(reason) = self
                    .tracker
                    .observe(&stream_id, stream.is_live, &snapshot, Utc::now())
                    .await
                {
                    self.handle_inactive(&stream_id, &stream.container_id, &stream.command_url, reason)
                        .await;
                }
            }
            Ok(health::StatOutcome::StaleSession) => {
                health::log_stale_session(&stream_id);
                self.terminate_stream(&stream_id, &stream.container_id, &stream.command_url, "stale_stream_detected")
                    .await;
            }
            Err(message) => {
                if health::is_stale_session_error(&message) {
                    health::log_stale_session(&stream_id);
                    self.terminate_stream(&stream_id, &stream.container_id, &stream.command_url, "stale_stream_detected")
                        .await;
                } else {
                    warn!(stream_id = %stream_id, error = %message, "stat poll failed");
                }
            }
        }
    }

    /// Fold the delta between a stream's `latest_stats` byte counts and the
    /// new snapshot into the process-wide aggregate (spec §6), then record
    /// the new totals on the stream so the next delta is computed against
    /// them rather than re-counting the same bytes.
    async fn accumulate_byte_deltas(&self, stream_id: &str, stream: &Stream, snapshot: &StatSnapshot) {
        let downloaded = snapshot.downloaded_bytes.unwrap_or(stream.accounted_downloaded_bytes);
        let uploaded = snapshot.uploaded_bytes.unwrap_or(stream.accounted_uploaded_bytes);
        let downloaded_delta = downloaded.saturating_sub(stream.accounted_downloaded_bytes);
        let uploaded_delta = uploaded.saturating_sub(stream.accounted_uploaded_bytes);
        self.metrics.accumulate(downloaded_delta, uploaded_delta);
        self.registry.mark_bytes_accounted(stream_id, downloaded, uploaded).await;
    }

    async fn handle_inactive(&self, stream_id: &str, container_id: &str, command_url: &str, reason: InactivityReason) {
        info!(stream_id, ?reason, "stream inactive, stopping");
        self.terminate_stream(stream_id, container_id, command_url, "inactive_stream_detected")
            .await;
    }

    /// Best-effort stop command to the engine, then remove the stream from
    /// the Registry regardless of whether the stop call succeeded — the
    /// engine's own idle handling will eventually reclaim the slot even if
    /// this call is lost (spec §4.4's two-step shutdown).
    async fn terminate_stream(&self, stream_id: &str, container_id: &str, command_url: &str, reason: &str) {
        let stop = tokio::time::timeout(self.stop_command_timeout, self.client.get(command_url).send()).await;
        if let Err(_) | Ok(Err(_)) = stop {
            warn!(stream_id, container_id, "stop command failed or timed out");
        }
        self.tracker.forget(stream_id).await;
        self.registry
            .on_stream_ended(StreamEndedEvent {
                stream_id: Some(stream_id.to_string()),
                container_id: Some(container_id.to_string()),
                reason: reason.to_string(),
            })
            .await;
    }
}
