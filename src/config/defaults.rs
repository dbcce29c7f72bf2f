//! Configuration default values, centralized per spec §6's config table.

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";

pub const DEFAULT_MIN_REPLICAS: u32 = 2;
pub const DEFAULT_MAX_REPLICAS: u32 = 10;
pub const DEFAULT_MAX_STREAMS_PER_ENGINE: u32 = 5;
pub const DEFAULT_MIN_FREE_REPLICAS: u32 = 1;
pub const DEFAULT_ENGINE_GRACE_PERIOD: &str = "5m";

pub const DEFAULT_COLLECT_INTERVAL: &str = "2s";
pub const DEFAULT_STAT_POLL_TIMEOUT: &str = "3s";
pub const DEFAULT_STOP_COMMAND_TIMEOUT: &str = "5s";
pub const DEFAULT_INACTIVE_LIVEPOS_THRESHOLD: &str = "15s";
pub const DEFAULT_INACTIVE_PREBUF_THRESHOLD: &str = "10s";
pub const DEFAULT_INACTIVE_ZERO_SPEED_THRESHOLD: &str = "10s";
pub const DEFAULT_INACTIVE_LOW_SPEED_THRESHOLD_KB: i64 = 400;
pub const DEFAULT_INACTIVE_LOW_SPEED_THRESHOLD: &str = "20s";

pub const DEFAULT_BUFFER_READY_TIMEOUT: &str = "30s";
pub const DEFAULT_FIRST_SEGMENT_TIMEOUT: &str = "10s";
pub const DEFAULT_WINDOW_SIZE: usize = 6;
pub const DEFAULT_MAX_SEGMENTS: usize = 20;
pub const DEFAULT_INITIAL_BUFFER_SECONDS: f64 = 12.0;
pub const DEFAULT_MAX_INITIAL_SEGMENTS: usize = 6;
pub const DEFAULT_SEGMENT_FETCH_INTERVAL_MULTIPLIER: f64 = 0.5;
pub const DEFAULT_SEGMENTED_CLEANUP_INTERVAL: &str = "5s";

pub const DEFAULT_CLIENT_QUEUE_DEPTH: usize = 100;
pub const DEFAULT_STREAM_IDLE_TIMEOUT: &str = "5m";
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_EMPTY_STREAM_TIMEOUT: &str = "60s";
pub const DEFAULT_BYTESTREAM_HEALTH_CHECK_INTERVAL: &str = "5s";
pub const DEFAULT_RECENCY_RING_SIZE: usize = 100;
pub const DEFAULT_MAX_CONNECTIONS_PER_HOST: usize = 10;

pub const DEFAULT_MANIFEST_FETCH_TIMEOUT: &str = "10s";
pub const DEFAULT_SEGMENT_FETCH_TIMEOUT: &str = "10s";
