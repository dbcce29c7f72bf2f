//! The single constructed application object (spec §9's Design Notes):
//! replaces the original's module-level singletons with one value that
//! owns every component and is threaded through the web layer via axum's
//! `State`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::autoscaler::{Autoscaler, ScaleAction};
use crate::config::Config;
use crate::errors::FleetResult;
use crate::events::LifecycleObserver;
use crate::health::{HealthCollector, InactivityThresholds};
use crate::metrics::MetricsSink;
use crate::models::{EngineHandle, Stream};
use crate::proxy::bytestream::{ByteStreamProxy, ByteStreamProxyConfig};
use crate::proxy::segmented::{SegmentedProxy, SegmentedProxyConfig};
use crate::registry::{audit_event, Registry};
use crate::runtime::{AuditSink, EgressHealth, EngineRuntime, NoopEngineRuntime, NullEgressHealth, TracingAuditSink};
use crate::selector::EngineSelector;

/// Bridges Registry lifecycle notifications into the configured
/// `AuditSink`, kept separate from the proxies' own observers so a slow
/// or misbehaving audit backend can never affect stream serving.
struct AuditObserver(Arc<dyn AuditSink>);

#[async_trait]
impl LifecycleObserver for AuditObserver {
    async fn on_stream_terminated(&self, stream: &Stream, reason: &str) {
        self.0
            .record(audit_event("stream_ended", Some(&stream.id), Some(&stream.container_id), reason.to_string()))
            .await;
    }
}

pub struct App {
    pub config: Config,
    pub registry: Arc<Registry>,
    pub selector: Arc<EngineSelector>,
    pub autoscaler: Autoscaler,
    pub health_collector: Arc<HealthCollector>,
    pub segmented_proxy: Arc<SegmentedProxy>,
    pub bytestream_proxy: Arc<ByteStreamProxy>,
    pub metrics: Arc<MetricsSink>,
    pub engine_runtime: Box<dyn EngineRuntime>,
    pub egress_health: Box<dyn EgressHealth>,
    pub audit_sink: Arc<dyn AuditSink>,
}

impl App {
    pub fn new(config: Config) -> Arc<Self> {
        let registry = Arc::new(Registry::new());

        let selector = Arc::new(EngineSelector::new(Duration::from_secs(2)));

        let autoscaler = Autoscaler::new(
            config.autoscaler.min_replicas,
            config.autoscaler.max_replicas,
            config.autoscaler.max_streams_per_engine,
            config.autoscaler.min_free_replicas,
            config.autoscaler.engine_grace_period,
        );

        let thresholds = InactivityThresholds {
            livepos_unchanged: config.health.inactive_livepos_threshold,
            prebuf: config.health.inactive_prebuf_threshold,
            zero_speed: config.health.inactive_zero_speed_threshold,
            low_speed_kb: config.health.inactive_low_speed_threshold_kb,
            low_speed: config.health.inactive_low_speed_threshold,
        };
        let metrics = Arc::new(MetricsSink::new());
        let health_collector = Arc::new(HealthCollector::new(
            registry.clone(),
            metrics.clone(),
            thresholds,
            config.health.collect_interval,
            config.health.stat_poll_timeout,
            config.health.stop_command_timeout,
        ));

        let segmented_proxy = Arc::new(SegmentedProxy::new(SegmentedProxyConfig {
            buffer_ready_timeout: config.segmented_proxy.buffer_ready_timeout,
            first_segment_timeout: config.segmented_proxy.first_segment_timeout,
            window_size: config.segmented_proxy.window_size,
            max_segments: config.segmented_proxy.max_segments,
            initial_buffer_seconds: config.segmented_proxy.initial_buffer_seconds,
            max_initial_segments: config.segmented_proxy.max_initial_segments,
            segment_fetch_interval_multiplier: config.segmented_proxy.segment_fetch_interval_multiplier,
            cleanup_interval: config.segmented_proxy.cleanup_interval,
            manifest_fetch_timeout: config.segmented_proxy.manifest_fetch_timeout,
            segment_fetch_timeout: config.segmented_proxy.segment_fetch_timeout,
        }));

        let bytestream_proxy = Arc::new(ByteStreamProxy::new(ByteStreamProxyConfig {
            client_queue_depth: config.bytestream_proxy.client_queue_depth,
            stream_idle_timeout: config.bytestream_proxy.stream_idle_timeout,
            max_retries: config.bytestream_proxy.max_retries,
            empty_stream_timeout: config.bytestream_proxy.empty_stream_timeout,
            health_check_interval: config.bytestream_proxy.health_check_interval,
            recency_ring_size: config.bytestream_proxy.recency_ring_size,
            max_connections_per_host: config.bytestream_proxy.max_connections_per_host,
        }));

        let app = Arc::new(Self {
            config,
            registry,
            selector,
            autoscaler,
            health_collector,
            segmented_proxy,
            bytestream_proxy,
            metrics,
            engine_runtime: Box::new(NoopEngineRuntime),
            egress_health: Box::new(NullEgressHealth),
            audit_sink: Arc::new(TracingAuditSink),
        });

        app
    }

    /// Register both proxies as lifecycle observers; done after
    /// construction since `Registry::add_observer` takes `Arc<dyn
    /// LifecycleObserver>` and the proxies must already be `Arc`-wrapped.
    pub async fn wire_observers(&self) {
        self.registry.add_observer(self.segmented_proxy.clone()).await;
        self.registry.add_observer(self.bytestream_proxy.clone()).await;
        self.registry.add_observer(Arc::new(AuditObserver(self.audit_sink.clone()))).await;
    }

    /// Spawn the background loops: health collector, autoscaler tick,
    /// segmented-channel cleanup, byte-stream session health monitor.
    /// Takes `Arc<Self>` by value since the autoscaler tick loop needs its
    /// own owned handle to the app for the lifetime of the task.
    pub fn spawn_background_tasks(self: Arc<Self>) {
        tokio::spawn(self.health_collector.clone().run());
        tokio::spawn(self.segmented_proxy.clone().run_cleanup());
        tokio::spawn(self.bytestream_proxy.clone().run_health_monitor());

        tokio::spawn(async move { self.run_autoscaler_loop().await });
    }

    async fn run_autoscaler_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.autoscaler.engine_grace_period / 10);
        loop {
            ticker.tick().await;
            if let Err(e) = self.autoscaler_tick().await {
                tracing::warn!(error = %e, "autoscaler tick failed");
            }
        }
    }

    async fn autoscaler_tick(&self) -> FleetResult<()> {
        let engines = self.registry.list_engines().await;
        let lookahead_layer = self.registry.get_lookahead_layer().await;
        let (action, new_layer) = self.autoscaler.evaluate(&engines, lookahead_layer, chrono::Utc::now());

        if new_layer != lookahead_layer {
            match new_layer {
                Some(layer) => self.registry.set_lookahead_layer(layer).await,
                None => self.registry.reset_lookahead_layer().await,
            }
        }

        match action {
            Some(ScaleAction::Launch(count)) => {
                let handles: Vec<EngineHandle> = self.engine_runtime.launch(count).await?;
                for handle in handles {
                    let mut engine = crate::models::Engine::new(handle.container_id, handle.container_name, handle.host, handle.port);
                    engine.labels = handle.labels;
                    self.registry.upsert_engine(engine).await;
                }
                self.selector.invalidate_cache().await;
                self.audit_sink
                    .record(audit_event("engine_launched", None, None, format!("count={count}")))
                    .await;
                info!(count, "autoscaler launched engines");
            }
            Some(ScaleAction::Terminate(container_id)) => {
                self.engine_runtime.terminate(&container_id).await?;
                self.registry.remove_engine(&container_id).await;
                self.selector.invalidate_cache().await;
                self.audit_sink
                    .record(audit_event("engine_terminated", None, Some(&container_id), String::new()))
                    .await;
                info!(container_id, "autoscaler terminated idle engine");
            }
            None => {}
        }
        Ok(())
    }
}
