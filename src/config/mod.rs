//! Application configuration, layered from a TOML file and `FLEET_`-prefixed
//! environment variables via `figment`, matching the teacher's config
//! layering pattern.

pub mod defaults;
pub mod duration_serde;

use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use defaults::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub autoscaler: AutoscalerConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub segmented_proxy: SegmentedProxyConfig,
    #[serde(default)]
    pub bytestream_proxy: ByteStreamProxyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            web: WebConfig::default(),
            autoscaler: AutoscalerConfig::default(),
            health: HealthConfig::default(),
            segmented_proxy: SegmentedProxyConfig::default(),
            bytestream_proxy: ByteStreamProxyConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, falling back to defaults for any
    /// field absent from both the file and the environment. Missing file is
    /// not an error: a fresh `Config::default()` is used in that case.
    pub fn load_from_file(path: &str) -> anyhow::Result<Config> {
        let mut figment = Figment::from(figment::providers::Serialized::defaults(Config::default()));
        if std::path::Path::new(path).exists() {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("FLEET_").split("__"));
        Ok(figment.extract()?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_url: default_base_url(),
        }
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoscalerConfig {
    #[serde(default = "default_min_replicas")]
    pub min_replicas: u32,
    #[serde(default = "default_max_replicas")]
    pub max_replicas: u32,
    #[serde(default = "default_max_streams_per_engine")]
    pub max_streams_per_engine: u32,
    #[serde(default = "default_min_free_replicas")]
    pub min_free_replicas: u32,
    #[serde(with = "duration_serde", default = "default_engine_grace_period")]
    pub engine_grace_period: Duration,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            min_replicas: default_min_replicas(),
            max_replicas: default_max_replicas(),
            max_streams_per_engine: default_max_streams_per_engine(),
            min_free_replicas: default_min_free_replicas(),
            engine_grace_period: default_engine_grace_period(),
        }
    }
}

fn default_min_replicas() -> u32 {
    DEFAULT_MIN_REPLICAS
}
fn default_max_replicas() -> u32 {
    DEFAULT_MAX_REPLICAS
}
fn default_max_streams_per_engine() -> u32 {
    DEFAULT_MAX_STREAMS_PER_ENGINE
}
fn default_min_free_replicas() -> u32 {
    DEFAULT_MIN_FREE_REPLICAS
}
fn default_engine_grace_period() -> Duration {
    humantime::parse_duration(DEFAULT_ENGINE_GRACE_PERIOD).unwrap()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(with = "duration_serde", default = "default_collect_interval")]
    pub collect_interval: Duration,
    #[serde(with = "duration_serde", default = "default_stat_poll_timeout")]
    pub stat_poll_timeout: Duration,
    #[serde(with = "duration_serde", default = "default_stop_command_timeout")]
    pub stop_command_timeout: Duration,
    #[serde(with = "duration_serde", default = "default_livepos_threshold")]
    pub inactive_livepos_threshold: Duration,
    #[serde(with = "duration_serde", default = "default_prebuf_threshold")]
    pub inactive_prebuf_threshold: Duration,
    #[serde(with = "duration_serde", default = "default_zero_speed_threshold")]
    pub inactive_zero_speed_threshold: Duration,
    #[serde(default = "default_low_speed_threshold_kb")]
    pub inactive_low_speed_threshold_kb: i64,
    #[serde(with = "duration_serde", default = "default_low_speed_threshold")]
    pub inactive_low_speed_threshold: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            collect_interval: default_collect_interval(),
            stat_poll_timeout: default_stat_poll_timeout(),
            stop_command_timeout: default_stop_command_timeout(),
            inactive_livepos_threshold: default_livepos_threshold(),
            inactive_prebuf_threshold: default_prebuf_threshold(),
            inactive_zero_speed_threshold: default_zero_speed_threshold(),
            inactive_low_speed_threshold_kb: default_low_speed_threshold_kb(),
            inactive_low_speed_threshold: default_low_speed_threshold(),
        }
    }
}

fn default_collect_interval() -> Duration {
    humantime::parse_duration(DEFAULT_COLLECT_INTERVAL).unwrap()
}
fn default_stat_poll_timeout() -> Duration {
    humantime::parse_duration(DEFAULT_STAT_POLL_TIMEOUT).unwrap()
}
fn default_stop_command_timeout() -> Duration {
    humantime::parse_duration(DEFAULT_STOP_COMMAND_TIMEOUT).unwrap()
}
fn default_livepos_threshold() -> Duration {
    humantime::parse_duration(DEFAULT_INACTIVE_LIVEPOS_THRESHOLD).unwrap()
}
fn default_prebuf_threshold() -> Duration {
    humantime::parse_duration(DEFAULT_INACTIVE_PREBUF_THRESHOLD).unwrap()
}
fn default_zero_speed_threshold() -> Duration {
    humantime::parse_duration(DEFAULT_INACTIVE_ZERO_SPEED_THRESHOLD).unwrap()
}
fn default_low_speed_threshold_kb() -> i64 {
    DEFAULT_INACTIVE_LOW_SPEED_THRESHOLD_KB
}
fn default_low_speed_threshold() -> Duration {
    humantime::parse_duration(DEFAULT_INACTIVE_LOW_SPEED_THRESHOLD).unwrap()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentedProxyConfig {
    #[serde(with = "duration_serde", default = "default_buffer_ready_timeout")]
    pub buffer_ready_timeout: Duration,
    #[serde(with = "duration_serde", default = "default_first_segment_timeout")]
    pub first_segment_timeout: Duration,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_max_segments")]
    pub max_segments: usize,
    #[serde(default = "default_initial_buffer_seconds")]
    pub initial_buffer_seconds: f64,
    #[serde(default = "default_max_initial_segments")]
    pub max_initial_segments: usize,
    #[serde(default = "default_segment_fetch_interval_multiplier")]
    pub segment_fetch_interval_multiplier: f64,
    #[serde(with = "duration_serde", default = "default_segmented_cleanup_interval")]
    pub cleanup_interval: Duration,
    #[serde(with = "duration_serde", default = "default_manifest_fetch_timeout")]
    pub manifest_fetch_timeout: Duration,
    #[serde(with = "duration_serde", default = "default_segment_fetch_timeout")]
    pub segment_fetch_timeout: Duration,
}

impl Default for SegmentedProxyConfig {
    fn default() -> Self {
        Self {
            buffer_ready_timeout: default_buffer_ready_timeout(),
            first_segment_timeout: default_first_segment_timeout(),
            window_size: default_window_size(),
            max_segments: default_max_segments(),
            initial_buffer_seconds: default_initial_buffer_seconds(),
            max_initial_segments: default_max_initial_segments(),
            segment_fetch_interval_multiplier: default_segment_fetch_interval_multiplier(),
            cleanup_interval: default_segmented_cleanup_interval(),
            manifest_fetch_timeout: default_manifest_fetch_timeout(),
            segment_fetch_timeout: default_segment_fetch_timeout(),
        }
    }
}

fn default_buffer_ready_timeout() -> Duration {
    humantime::parse_duration(DEFAULT_BUFFER_READY_TIMEOUT).unwrap()
}
fn default_first_segment_timeout() -> Duration {
    humantime::parse_duration(DEFAULT_FIRST_SEGMENT_TIMEOUT).unwrap()
}
fn default_window_size() -> usize {
    DEFAULT_WINDOW_SIZE
}
fn default_max_segments() -> usize {
    DEFAULT_MAX_SEGMENTS
}
fn default_initial_buffer_seconds() -> f64 {
    DEFAULT_INITIAL_BUFFER_SECONDS
}
fn default_max_initial_segments() -> usize {
    DEFAULT_MAX_INITIAL_SEGMENTS
}
fn default_segment_fetch_interval_multiplier() -> f64 {
    DEFAULT_SEGMENT_FETCH_INTERVAL_MULTIPLIER
}
fn default_segmented_cleanup_interval() -> Duration {
    humantime::parse_duration(DEFAULT_SEGMENTED_CLEANUP_INTERVAL).unwrap()
}
fn default_manifest_fetch_timeout() -> Duration {
    humantime::parse_duration(DEFAULT_MANIFEST_FETCH_TIMEOUT).unwrap()
}
fn default_segment_fetch_timeout() -> Duration {
    humantime::parse_duration(DEFAULT_SEGMENT_FETCH_TIMEOUT).unwrap()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ByteStreamProxyConfig {
    #[serde(default = "default_client_queue_depth")]
    pub client_queue_depth: usize,
    #[serde(with = "duration_serde", default = "default_stream_idle_timeout")]
    pub stream_idle_timeout: Duration,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(with = "duration_serde", default = "default_empty_stream_timeout")]
    pub empty_stream_timeout: Duration,
    #[serde(with = "duration_serde", default = "default_health_check_interval")]
    pub health_check_interval: Duration,
    #[serde(default = "default_recency_ring_size")]
    pub recency_ring_size: usize,
    #[serde(default = "default_max_connections_per_host")]
    pub max_connections_per_host: usize,
}

impl Default for ByteStreamProxyConfig {
    fn default() -> Self {
        Self {
            client_queue_depth: default_client_queue_depth(),
            stream_idle_timeout: default_stream_idle_timeout(),
            max_retries: default_max_retries(),
            empty_stream_timeout: default_empty_stream_timeout(),
            health_check_interval: default_health_check_interval(),
            recency_ring_size: default_recency_ring_size(),
            max_connections_per_host: default_max_connections_per_host(),
        }
    }
}

fn default_client_queue_depth() -> usize {
    DEFAULT_CLIENT_QUEUE_DEPTH
}
fn default_stream_idle_timeout() -> Duration {
    humantime::parse_duration(DEFAULT_STREAM_IDLE_TIMEOUT).unwrap()
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_empty_stream_timeout() -> Duration {
    humantime::parse_duration(DEFAULT_EMPTY_STREAM_TIMEOUT).unwrap()
}
fn default_health_check_interval() -> Duration {
    humantime::parse_duration(DEFAULT_BYTESTREAM_HEALTH_CHECK_INTERVAL).unwrap()
}
fn default_recency_ring_size() -> usize {
    DEFAULT_RECENCY_RING_SIZE
}
fn default_max_connections_per_host() -> usize {
    DEFAULT_MAX_CONNECTIONS_PER_HOST
}
