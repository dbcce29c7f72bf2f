//! Autoscaler signal (C3): decides how many engines *should* exist, given
//! the current fleet and stream counts. Does not itself launch or
//! terminate anything — it returns a [`ScaleAction`] list that `App`'s
//! tick loop feeds to an [`crate::runtime::EngineRuntime`].
//!
//! The look-ahead rule is grounded on
//! `original_source/tests/test_lookahead_layer_tracking.py`: once any
//! engine's stream count reaches `max_streams_per_engine - 1`, provision
//! one more engine and remember the fleet's current minimum load as the
//! `lookahead_layer`. Don't provision again until some engine's load
//! reaches that same layer, so transient near-capacity doesn't cause
//! runaway over-provisioning.

use chrono::{DateTime, Utc};

use crate::models::Engine;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleAction {
    Launch(u32),
    Terminate(String),
}

pub struct Autoscaler {
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub max_streams_per_engine: u32,
    pub min_free_replicas: u32,
    pub engine_grace_period: chrono::Duration,
}

impl Autoscaler {
    pub fn new(
        min_replicas: u32,
        max_replicas: u32,
        max_streams_per_engine: u32,
        min_free_replicas: u32,
        engine_grace_period: std::time::Duration,
    ) -> Self {
        Self {
            min_replicas,
            max_replicas,
            max_streams_per_engine,
            min_free_replicas,
            engine_grace_period: chrono::Duration::from_std(engine_grace_period).unwrap_or(chrono::Duration::zero()),
        }
    }

    /// The instant idle-duration is measured from: the last time a stream
    /// ended on this engine, or when it was first seen if it has never
    /// carried one. Using `first_seen` as the fallback (instead of treating
    /// "never used" as infinitely idle) keeps a freshly launched engine out
    /// of the drain candidate pool until it has actually sat idle for
    /// `engine_grace_period`.
    fn idle_since(engine: &Engine) -> DateTime<Utc> {
        engine.last_stream_usage.unwrap_or(engine.first_seen)
    }

    fn should_trigger_lookahead(&self, engines: &[Engine], lookahead_layer: Option<usize>) -> bool {
        if engines.is_empty() {
            return false;
        }
        let threshold = self.max_streams_per_engine.saturating_sub(1) as usize;
        let any_near_capacity = engines.iter().any(|e| e.load() >= threshold);
        if !any_near_capacity {
            return false;
        }
        let min_load = engines.iter().map(Engine::load).min().unwrap_or(0);
        let all_at_layer = lookahead_layer.map(|layer| min_load >= layer).unwrap_or(true);
        all_at_layer
    }

    /// Evaluate the fixed rule order from spec §4.3: replica floor, free
    /// replica floor, look-ahead provisioning, replica ceiling, then drain
    /// idle engines above the floor. Returns at most one action per tick;
    /// the caller re-evaluates on the next tick once the action has taken
    /// effect, mirroring the original's single-decision-per-poll cadence.
    pub fn evaluate(&self, engines: &[Engine], lookahead_layer: Option<usize>, now: DateTime<Utc>) -> (Option<ScaleAction>, Option<usize>) {
        let count = engines.len() as u32;

        if count < self.min_replicas {
            return (Some(ScaleAction::Launch(self.min_replicas - count)), lookahead_layer);
        }

        let idle_count = engines.iter().filter(|e| e.load() == 0).count() as u32;
        if idle_count < self.min_free_replicas && count < self.max_replicas {
            return (Some(ScaleAction::Launch(1)), lookahead_layer);
        }

        if count < self.max_replicas && self.should_trigger_lookahead(engines, lookahead_layer) {
            let min_load = engines.iter().map(Engine::load).min().unwrap_or(0);
            return (Some(ScaleAction::Launch(1)), Some(min_load));
        }

        if count > self.min_replicas {
            if idle_count > self.min_free_replicas {
                if let Some(victim) = engines
                    .iter()
                    .filter(|e| e.load() == 0 && now - Self::idle_since(e) >= self.engine_grace_period)
                    .min_by_key(|e| Self::idle_since(e))
                {
                    return (Some(ScaleAction::Terminate(victim.container_id.clone())), lookahead_layer);
                }
            }
        }

        (None, lookahead_layer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration as StdDuration;

    fn engine_with_load(id: &str, load: usize) -> Engine {
        let mut e = Engine::new(id.to_string(), format!("{id}-n"), "h".to_string(), 1);
        e.health_status = crate::models::HealthStatus::Healthy;
        e.active_streams = (0..load).map(|i| format!("s{i}")).collect::<HashSet<_>>();
        e.last_stream_usage = Some(Utc::now());
        e
    }

    fn idle_since(id: &str, ago: chrono::Duration) -> Engine {
        let mut e = Engine::new(id.to_string(), format!("{id}-n"), "h".to_string(), 1);
        e.health_status = crate::models::HealthStatus::Healthy;
        e.last_stream_usage = Some(Utc::now() - ago);
        e
    }

    #[test]
    fn scales_up_to_floor() {
        let autoscaler = Autoscaler::new(2, 10, 5, 1, StdDuration::from_secs(0));
        let (action, _) = autoscaler.evaluate(&[engine_with_load("e1", 0)], None, Utc::now());
        assert_eq!(action, Some(ScaleAction::Launch(1)));
    }

    #[test]
    fn maintains_free_replica_floor() {
        let autoscaler = Autoscaler::new(1, 10, 5, 1, StdDuration::from_secs(0));
        let engines = vec![engine_with_load("e1", 3)];
        let (action, _) = autoscaler.evaluate(&engines, None, Utc::now());
        assert_eq!(action, Some(ScaleAction::Launch(1)));
    }

    #[test]
    fn lookahead_triggers_at_threshold_and_sets_layer() {
        let autoscaler = Autoscaler::new(1, 10, 5, 2, StdDuration::from_secs(0));
        let engines = vec![engine_with_load("e1", 4), engine_with_load("e2", 0), engine_with_load("e3", 0)];
        let (action, layer) = autoscaler.evaluate(&engines, None, Utc::now());
        assert_eq!(action, Some(ScaleAction::Launch(1)));
        assert_eq!(layer, Some(0));
    }

    #[test]
    fn lookahead_does_not_retrigger_until_new_layer_reached() {
        let autoscaler = Autoscaler::new(2, 10, 5, 1, StdDuration::from_secs(0));
        let engines = vec![engine_with_load("e1", 4), engine_with_load("e2", 0)];
        // lookahead_layer already set above the fleet's current minimum load,
        // so near-capacity alone must not re-trigger provisioning.
        let (action, layer) = autoscaler.evaluate(&engines, Some(1), Utc::now());
        assert_eq!(action, None);
        assert_eq!(layer, Some(1));
    }

    #[test]
    fn respects_max_replicas_ceiling() {
        let autoscaler = Autoscaler::new(1, 2, 5, 0, StdDuration::from_secs(0));
        let engines = vec![engine_with_load("e1", 4), engine_with_load("e2", 4)];
        let (action, _) = autoscaler.evaluate(&engines, None, Utc::now());
        assert_eq!(action, None);
    }

    #[test]
    fn drains_oldest_idle_engine_past_grace_period() {
        let autoscaler = Autoscaler::new(1, 10, 5, 0, StdDuration::from_secs(60));
        let engines = vec![
            idle_since("e1", chrono::Duration::seconds(120)),
            idle_since("e2", chrono::Duration::seconds(90)),
        ];
        let (action, _) = autoscaler.evaluate(&engines, None, Utc::now());
        assert_eq!(action, Some(ScaleAction::Terminate("e1".to_string())));
    }

    #[test]
    fn does_not_drain_freshly_launched_engine_within_grace_period() {
        let autoscaler = Autoscaler::new(1, 10, 5, 0, StdDuration::from_secs(60));
        // e1 never carried a stream and was just launched; e2 has sat idle
        // well past the grace period. The never-used engine must not be
        // preferred just because `last_stream_usage` is `None`.
        let mut e1 = Engine::new("e1".to_string(), "e1-n".to_string(), "h".to_string(), 1);
        e1.health_status = crate::models::HealthStatus::Healthy;
        let engines = vec![e1, idle_since("e2", chrono::Duration::seconds(120))];
        let (action, _) = autoscaler.evaluate(&engines, None, Utc::now());
        assert_eq!(action, Some(ScaleAction::Terminate("e2".to_string())));
    }

    #[test]
    fn does_not_drain_when_all_idle_engines_are_within_grace_period() {
        let autoscaler = Autoscaler::new(1, 10, 5, 0, StdDuration::from_secs(60));
        let engines = vec![idle_since("e1", chrono::Duration::seconds(10)), idle_since("e2", chrono::Duration::seconds(5))];
        let (action, _) = autoscaler.evaluate(&engines, None, Utc::now());
        assert_eq!(action, None);
    }
}
