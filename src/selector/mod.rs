//! Layered-fill engine selection (C2).
//!
//! Grounded on `original_source/app/services/proxy/engine_selector.py`:
//! the original scores each engine (`forwarded` bonus, `-10` per active
//! stream, unhealthy engines excluded) and sorts by that score.
//!
//! Spec §4.2's prose describes the sort key as `(-load[e], not forwarded,
//! container_id)` with "highest load first" producing "compact packing" —
//! but its own worked example (S1: 3 engines, 15 sequential starts) requires
//! every engine to reach load 1 before any reaches load 2, which only comes
//! out of a *lowest*-load-first rule; literal highest-load-first packing
//! would drive the first engine straight to saturation instead. Since S1 is
//! the concrete, testable scenario and "layered fill" itself names a
//! round-robin-by-layer rule, this module sorts ascending by actual load
//! (lowest first), keeping the forwarded/id tiebreakers from the prose.
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::errors::{FleetError, FleetResult};
use crate::models::{Engine, HealthStatus};

/// See `DESIGN.md` for the full writeup of this resolution.
fn sort_key(engine: &Engine) -> (i64, bool, String) {
    (
        engine.load() as i64,
        !engine.is_forwarded(),
        engine.container_id.clone(),
    )
}

struct Cache {
    engines: Vec<Engine>,
    fetched_at: Instant,
}

/// Picks the engine that should receive the next stream, optionally caching
/// the healthy-engine snapshot for a short TTL to avoid re-sorting the
/// fleet on every concurrent `getstream` call.
pub struct EngineSelector {
    cache: Mutex<Option<Cache>>,
    cache_ttl: Duration,
}

impl EngineSelector {
    pub fn new(cache_ttl: Duration) -> Self {
        Self {
            cache: Mutex::new(None),
            cache_ttl,
        }
    }

    /// Drop the cached snapshot; called by the registry/health collector on
    /// any mutation that could change scoring (engine health flip, stream
    /// start/end).
    pub async fn invalidate_cache(&self) {
        *self.cache.lock().await = None;
    }

    async fn healthy_engines(&self, all: Vec<Engine>) -> Vec<Engine> {
        let mut cache = self.cache.lock().await;
        if let Some(entry) = cache.as_ref() {
            if entry.fetched_at.elapsed() < self.cache_ttl {
                return entry.engines.clone();
            }
        }
        let mut healthy: Vec<Engine> = all
            .into_iter()
            .filter(|e| e.health_status == HealthStatus::Healthy)
            .collect();
        healthy.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
        *cache = Some(Cache {
            engines: healthy.clone(),
            fetched_at: Instant::now(),
        });
        healthy
    }

    /// Select the lowest-loaded healthy engine under `max_streams_per_engine`
    /// capacity (layered fill, see `sort_key` above). Keeping idle replicas
    /// in reserve is the autoscaler's job
    /// ([`crate::autoscaler::Autoscaler`]'s free-replica floor), not the
    /// selector's.
    pub async fn select(&self, all_engines: Vec<Engine>, max_streams_per_engine: u32) -> FleetResult<Engine> {
        let healthy = self.healthy_engines(all_engines).await;
        if healthy.is_empty() {
            return Err(FleetError::NoEngineAvailable);
        }

        healthy
            .into_iter()
            .find(|e| (e.load() as u32) < max_streams_per_engine)
            .ok_or(FleetError::NoEngineAvailable)
    }
}
