//! The authoritative fleet registry (C1).
//!
//! All mutations serialize on a single [`tokio::sync::Mutex`]; no I/O or
//! subprocess call is ever made while the lock is held. Reads return owned
//! copies so a caller can never observe a mid-transition state — matching
//! the teacher's `Arc<RwLock<HashMap<...>>>` ownership pattern
//! (`services/relay_manager.rs`, `services/session_tracker.rs`) but with a
//! single `Mutex` since every public operation here mutates or wants a
//! transactionally-consistent read.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{FleetError, FleetResult};
use crate::events::LifecycleObserver;
use crate::models::{
    AuditEvent, Engine, HealthStatus, StatSnapshot, Stream, StreamEndedEvent, StreamKey,
    StreamStartedEvent, StreamStatus, DEFAULT_STAT_RING_CAPACITY,
};

struct RegistryState {
    engines: HashMap<String, Engine>,
    streams: HashMap<String, Stream>,
    stat_rings: HashMap<String, VecDeque<StatSnapshot>>,
    lookahead_layer: Option<usize>,
}

impl RegistryState {
    fn new() -> Self {
        Self {
            engines: HashMap::new(),
            streams: HashMap::new(),
            stat_rings: HashMap::new(),
            lookahead_layer: None,
        }
    }
}

/// Authoritative in-memory model of engines, streams and their rolling
/// statistics (spec §4.1).
pub struct Registry {
    state: Mutex<RegistryState>,
    observers: Mutex<Vec<Arc<dyn LifecycleObserver>>>,
    stat_ring_capacity: usize,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::new()),
            observers: Mutex::new(Vec::new()),
            stat_ring_capacity: DEFAULT_STAT_RING_CAPACITY,
        }
    }

    /// Register a proxy component that should be notified (fire-and-forget)
    /// whenever a stream it may be serving ends.
    pub async fn add_observer(&self, observer: Arc<dyn LifecycleObserver>) {
        self.observers.lock().await.push(observer);
    }

    // ---- engine lifecycle -------------------------------------------------

    pub async fn upsert_engine(&self, engine: Engine) {
        let mut state = self.state.lock().await;
        match state.engines.get_mut(&engine.container_id) {
            Some(existing) => {
                existing.host = engine.host;
                existing.port = engine.port;
                existing.labels = engine.labels;
                existing.last_seen = Utc::now();
                if engine.cache_size_bytes.is_some() {
                    existing.cache_size_bytes = engine.cache_size_bytes;
                }
            }
            None => {
                info!(container_id = %engine.container_id, "engine registered");
                state.engines.insert(engine.container_id.clone(), engine);
            }
        }
    }

    /// Remove an engine. Fails silently (returns `false`) if the engine
    /// still has active streams — per spec §3's lifecycle rule, an engine is
    /// only removed once the runtime reports it gone AND the Registry shows
    /// no active streams on it. This also resolves the Open Question in
    /// spec §9: removal and `on_stream_started` both serialize on `state`,
    /// so a start racing a removal for the same engine sees one consistent
    /// outcome — either the engine is still present (start succeeds) or
    /// already gone (start fails with `EngineUnknown`).
    pub async fn remove_engine(&self, container_id: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.engines.get(container_id) {
            Some(engine) if engine.active_streams.is_empty() => {
                state.engines.remove(container_id);
                info!(container_id, "engine removed");
                true
            }
            Some(_) => {
                warn!(container_id, "refusing to remove engine with active streams");
                false
            }
            None => false,
        }
    }

    pub async fn set_engine_health(&self, container_id: &str, status: HealthStatus, ts: chrono::DateTime<Utc>) {
        let mut state = self.state.lock().await;
        if let Some(engine) = state.engines.get_mut(container_id) {
            engine.health_status = status;
            engine.last_health_check = Some(ts);
        }
    }

    pub async fn get_engine(&self, container_id: &str) -> Option<Engine> {
        self.state.lock().await.engines.get(container_id).cloned()
    }

    pub async fn list_engines(&self) -> Vec<Engine> {
        self.state.lock().await.engines.values().cloned().collect()
    }

    // ---- stream lifecycle --------------------------------------------------

    /// Atomically register a new stream, or return the existing one if the
    /// same `(container_id, key_type, key)` already has an active stream
    /// (idempotency per spec §4.1).
    pub async fn on_stream_started(&self, evt: StreamStartedEvent) -> FleetResult<Stream> {
        let mut state = self.state.lock().await;

        if !state.engines.contains_key(&evt.container_id) {
            return Err(FleetError::EngineUnknown {
                container_id: evt.container_id,
            });
        }

        if let Some(existing) = state
            .streams
            .values()
            .find(|s| s.status == StreamStatus::Started && s.matches(&evt.container_id, &evt.key))
        {
            debug!(stream_id = %existing.id, "stream_started idempotent replay");
            return Ok(existing.clone());
        }

        let id = evt.stream_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let stream = Stream {
            id: id.clone(),
            container_id: evt.container_id.clone(),
            key: evt.key,
            playback_session_id: evt.playback_session_id,
            playback_url: evt.playback_url,
            stat_url: evt.stat_url,
            command_url: evt.command_url,
            is_live: evt.is_live,
            started_at: Utc::now(),
            ended_at: None,
            status: StreamStatus::Started,
            latest_stats: None,
            accounted_downloaded_bytes: 0,
            accounted_uploaded_bytes: 0,
        };

        if let Some(engine) = state.engines.get_mut(&evt.container_id) {
            engine.active_streams.insert(id.clone());
            engine.last_stream_usage = Some(Utc::now());
        }
        state.streams.insert(id.clone(), stream.clone());
        state.stat_rings.insert(id.clone(), VecDeque::new());

        info!(stream_id = %id, container_id = %evt.container_id, "stream started");
        Ok(stream)
    }

    /// Atomically end a stream: locate it, detach it from memory, drop its
    /// stat ring, then (outside the critical section) fire the
    /// proxy-cleanup notification. Never awaits I/O while `state` is held.
    pub async fn on_stream_ended(&self, evt: StreamEndedEvent) -> Option<Stream> {
        let ended = {
            let mut state = self.state.lock().await;

            let stream_id = match evt.stream_id.clone() {
                Some(id) => Some(id),
                None => evt.container_id.as_deref().and_then(|cid| {
                    state
                        .streams
                        .values()
                        .filter(|s| s.status == StreamStatus::Started && s.container_id == cid)
                        .max_by_key(|s| s.started_at)
                        .map(|s| s.id.clone())
                }),
            }?;

            let mut stream = state.streams.remove(&stream_id)?;
            stream.ended_at = Some(Utc::now());
            stream.status = StreamStatus::Ended;

            if let Some(engine) = state.engines.get_mut(&stream.container_id) {
                engine.active_streams.remove(&stream_id);
            }
            state.stat_rings.remove(&stream_id);

            info!(stream_id = %stream_id, reason = %evt.reason, "stream ended");
            Some(stream)
        };

        if let Some(stream) = &ended {
            self.notify_ended(stream, &evt.reason).await;
        }
        ended
    }

    async fn notify_ended(&self, stream: &Stream, reason: &str) {
        let observers = self.observers.lock().await.clone();
        let stream = stream.clone();
        let reason = reason.to_string();
        tokio::spawn(async move {
            for observer in observers {
                observer.on_stream_terminated(&stream, &reason).await;
            }
        });
    }

    /// Append a stat snapshot, update the stream's `latest_stats`, and
    /// evict the oldest entry once the ring exceeds capacity. No-op if the
    /// stream is not `started` (e.g. ended concurrently).
    pub async fn append_stat(&self, stream_id: &str, snap: StatSnapshot) {
        let mut state = self.state.lock().await;
        if !state.streams.contains_key(stream_id) {
            return;
        }
        {
            let ring = state.stat_rings.entry(stream_id.to_string()).or_default();
            ring.push_back(snap.clone());
            while ring.len() > self.stat_ring_capacity {
                ring.pop_front();
            }
        }
        if let Some(stream) = state.streams.get_mut(stream_id) {
            stream.latest_stats = Some(snap);
        }
    }

    /// Record the process-wide byte totals already folded into the
    /// aggregate counters for this stream, so future deltas are computed
    /// correctly (used by the health collector / metrics sink).
    pub async fn mark_bytes_accounted(&self, stream_id: &str, downloaded: u64, uploaded: u64) {
        let mut state = self.state.lock().await;
        if let Some(stream) = state.streams.get_mut(stream_id) {
            stream.accounted_downloaded_bytes = downloaded;
            stream.accounted_uploaded_bytes = uploaded;
        }
    }

    pub async fn get_stream(&self, id: &str) -> Option<Stream> {
        self.state.lock().await.streams.get(id).cloned()
    }

    pub async fn list_streams(&self, status_filter: Option<StreamStatus>) -> Vec<Stream> {
        let state = self.state.lock().await;
        state
            .streams
            .values()
            .filter(|s| status_filter.map(|f| f == s.status).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Streams currently served by the given engine (used by
    /// `GET /engines/{id}`, spec §8 invariant 2).
    pub async fn list_active_streams_for_engine(&self, container_id: &str) -> Vec<Stream> {
        let state = self.state.lock().await;
        state
            .streams
            .values()
            .filter(|s| s.status == StreamStatus::Started && s.container_id == container_id)
            .cloned()
            .collect()
    }

    // ---- lookahead layer ----------------------------------------------------

    pub async fn get_lookahead_layer(&self) -> Option<usize> {
        self.state.lock().await.lookahead_layer
    }

    pub async fn set_lookahead_layer(&self, n: usize) {
        self.state.lock().await.lookahead_layer = Some(n);
    }

    pub async fn reset_lookahead_layer(&self) {
        self.state.lock().await.lookahead_layer = None;
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Build an [`AuditEvent`] for a lifecycle transition; the registry never
/// persists these itself (spec §1: the database is audit-only), it only
/// shapes them for whatever `AuditSink` the application wires in.
pub fn audit_event(kind: &str, stream_id: Option<&str>, container_id: Option<&str>, detail: String) -> AuditEvent {
    AuditEvent {
        timestamp: Utc::now(),
        kind: kind.to_string(),
        stream_id: stream_id.map(|s| s.to_string()),
        container_id: container_id.map(|s| s.to_string()),
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::KeyType;

    fn key(k: &str) -> StreamKey {
        StreamKey {
            key_type: KeyType::Infohash,
            key: k.to_string(),
        }
    }

    async fn registry_with_engine(container_id: &str) -> Registry {
        let registry = Registry::new();
        registry
            .upsert_engine(Engine::new(
                container_id.to_string(),
                format!("{container_id}-name"),
                "127.0.0.1".to_string(),
                6878,
            ))
            .await;
        registry
            .set_engine_health(container_id, HealthStatus::Healthy, Utc::now())
            .await;
        registry
    }

    fn started_event(container_id: &str, key: StreamKey) -> StreamStartedEvent {
        StreamStartedEvent {
            stream_id: None,
            container_id: container_id.to_string(),
            key,
            playback_session_id: "sess".to_string(),
            playback_url: "http://e/play".to_string(),
            stat_url: "http://e/stat".to_string(),
            command_url: "http://e/cmd".to_string(),
            is_live: true,
        }
    }

    #[tokio::test]
    async fn unknown_engine_is_rejected() {
        let registry = Registry::new();
        let err = registry
            .on_stream_started(started_event("ghost", key("a")))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::EngineUnknown { .. }));
    }

    #[tokio::test]
    async fn stream_start_is_idempotent_per_business_key() {
        let registry = registry_with_engine("e1").await;
        let first = registry
            .on_stream_started(started_event("e1", key("abc")))
            .await
            .unwrap();
        let second = registry
            .on_stream_started(started_event("e1", key("abc")))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(registry.list_streams(None).await.len(), 1);
    }

    #[tokio::test]
    async fn ended_streams_vanish_from_every_view() {
        let registry = registry_with_engine("e1").await;
        let stream = registry
            .on_stream_started(started_event("e1", key("abc")))
            .await
            .unwrap();

        registry
            .append_stat(
                &stream.id,
                StatSnapshot {
                    timestamp: Utc::now(),
                    peers: Some(3),
                    speed_down_kbps: Some(100),
                    speed_up_kbps: Some(10),
                    downloaded_bytes: Some(1000),
                    uploaded_bytes: Some(100),
                    upstream_status_token: Some("playing".to_string()),
                    live_position: None,
                },
            )
            .await;

        let ended = registry
            .on_stream_ended(StreamEndedEvent {
                stream_id: Some(stream.id.clone()),
                container_id: None,
                reason: "test".to_string(),
            })
            .await;
        assert!(ended.is_some());

        assert!(registry.get_stream(&stream.id).await.is_none());
        assert!(registry.list_streams(None).await.is_empty());
        assert!(registry.list_streams(Some(StreamStatus::Started)).await.is_empty());

        let engine = registry.get_engine("e1").await.unwrap();
        assert!(!engine.active_streams.contains(&stream.id));
    }

    #[tokio::test]
    async fn end_by_container_id_falls_back_to_last_started() {
        let registry = registry_with_engine("e1").await;
        registry.on_stream_started(started_event("e1", key("a"))).await.unwrap();
        let second = registry.on_stream_started(started_event("e1", key("b"))).await.unwrap();

        let ended = registry
            .on_stream_ended(StreamEndedEvent {
                stream_id: None,
                container_id: Some("e1".to_string()),
                reason: "fallback".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(ended.id, second.id);
    }

    #[tokio::test]
    async fn engine_removal_blocked_while_streams_active() {
        let registry = registry_with_engine("e1").await;
        registry.on_stream_started(started_event("e1", key("a"))).await.unwrap();
        assert!(!registry.remove_engine("e1").await);
        assert!(registry.get_engine("e1").await.is_some());
    }

    #[tokio::test]
    async fn lookahead_layer_roundtrip() {
        let registry = Registry::new();
        assert_eq!(registry.get_lookahead_layer().await, None);
        registry.set_lookahead_layer(3).await;
        assert_eq!(registry.get_lookahead_layer().await, Some(3));
        registry.reset_lookahead_layer().await;
        assert_eq!(registry.get_lookahead_layer().await, None);
    }
}
