//! Core data model shared by the registry, selector, health collector and
//! both proxy implementations.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health status of an engine as reported by the last health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl Default for HealthStatus {
    fn default() -> Self {
        HealthStatus::Unknown
    }
}

/// Egress/VPN health as reported by the external `EgressHealth` capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EgressState {
    Healthy,
    Unhealthy,
    Disabled,
    Starting,
    Unknown,
}

/// One externally managed engine process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Engine {
    pub container_id: String,
    pub container_name: String,
    pub host: String,
    pub port: u16,
    pub labels: HashMap<String, String>,
    pub health_status: HealthStatus,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_stream_usage: Option<DateTime<Utc>>,
    pub last_cache_cleanup: Option<DateTime<Utc>>,
    pub cache_size_bytes: Option<u64>,
    pub active_streams: HashSet<String>,
}

impl Engine {
    pub fn new(container_id: String, container_name: String, host: String, port: u16) -> Self {
        let now = Utc::now();
        Self {
            container_id,
            container_name,
            host,
            port,
            labels: HashMap::new(),
            health_status: HealthStatus::Unknown,
            first_seen: now,
            last_seen: now,
            last_health_check: None,
            last_stream_usage: None,
            last_cache_cleanup: None,
            cache_size_bytes: None,
            active_streams: HashSet::new(),
        }
    }

    /// Whether this engine carries the reserved `forwarded=true` label.
    pub fn is_forwarded(&self) -> bool {
        self.labels
            .get("forwarded")
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    pub fn load(&self) -> usize {
        self.active_streams.len()
    }
}

/// The business key used to idempotently identify a stream request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    ContentId,
    Infohash,
    Url,
    Magnet,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    pub key_type: KeyType,
    pub key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Started,
    Ended,
}

/// A single point-in-time position marker reported by a live stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivePosition {
    pub pos: i64,
    pub live_first: Option<i64>,
    pub live_last: Option<i64>,
    pub first_ts: Option<i64>,
    pub last_ts: Option<i64>,
    pub buffer_pieces: Option<i64>,
}

/// One rolling statistics observation for a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatSnapshot {
    pub timestamp: DateTime<Utc>,
    pub peers: Option<i64>,
    pub speed_down_kbps: Option<i64>,
    pub speed_up_kbps: Option<i64>,
    pub downloaded_bytes: Option<u64>,
    pub uploaded_bytes: Option<u64>,
    pub upstream_status_token: Option<String>,
    pub live_position: Option<LivePosition>,
}

/// Default bound on the per-stream stat ring (spec §3).
pub const DEFAULT_STAT_RING_CAPACITY: usize = 64;

/// One active or recently-ended playback session served by an engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    pub id: String,
    pub container_id: String,
    pub key: StreamKey,
    pub playback_session_id: String,
    pub playback_url: String,
    pub stat_url: String,
    pub command_url: String,
    pub is_live: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: StreamStatus,
    pub latest_stats: Option<StatSnapshot>,
    /// Cumulative bytes already folded into the process-wide aggregate
    /// counters; used to compute the delta contributed by each new
    /// [`StatSnapshot`] so the aggregate only ever increases.
    pub accounted_downloaded_bytes: u64,
    pub accounted_uploaded_bytes: u64,
}

impl Stream {
    pub fn matches(&self, container_id: &str, key: &StreamKey) -> bool {
        self.container_id == container_id && self.key == *key && self.status == StreamStatus::Started
    }
}

/// Event announcing that an engine finished a `getstream` call and a new
/// stream should be registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStartedEvent {
    pub stream_id: Option<String>,
    pub container_id: String,
    pub key: StreamKey,
    pub playback_session_id: String,
    pub playback_url: String,
    pub stat_url: String,
    pub command_url: String,
    pub is_live: bool,
}

/// Event announcing that a stream should be removed. Either `stream_id`
/// or `container_id` must be set (Registry falls back to "last started on
/// this container" when `stream_id` is absent).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamEndedEvent {
    pub stream_id: Option<String>,
    pub container_id: Option<String>,
    pub reason: String,
}

/// A handle returned by the `EngineRuntime` capability describing one
/// running (or just-launched) container.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    pub container_id: String,
    pub container_name: String,
    pub host: String,
    pub port: u16,
    pub labels: HashMap<String, String>,
}

/// An audit-only record of a lifecycle transition, handed to the
/// `AuditSink` capability. The core never reads these back — it is fully
/// reconstructable from the runtime's running containers per spec §1.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub stream_id: Option<String>,
    pub container_id: Option<String>,
    pub detail: String,
}
