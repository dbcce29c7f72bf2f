//! Error type definitions for the fleet orchestrator.
//!
//! A single hierarchical enum covers every layer (registry, selector,
//! autoscaler, health collector, both proxies, web) so handlers can convert
//! with `?` and the web layer can map each kind to the right HTTP status.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    /// `on_stream_started` referenced a `container_id` the Registry has no
    /// record of (spec §4.1).
    #[error("unknown engine: {container_id}")]
    EngineUnknown { container_id: String },

    /// Selector discarded every engine because none were healthy.
    #[error("engine not healthy: {container_id}")]
    EngineNotHealthy { container_id: String },

    /// EngineSelector found no engine under capacity and healthy.
    #[error("no engine available")]
    NoEngineAvailable,

    /// Registry has no record of the requested stream.
    #[error("stream not found: {stream_id}")]
    StreamNotFound { stream_id: String },

    /// SegmentedProxy channel has not buffered enough to serve a manifest.
    #[error("channel not ready")]
    ChannelNotReady,

    /// Requested HLS segment sequence number has already been evicted or
    /// was never fetched.
    #[error("segment not found: channel={channel_id} seq={sequence}")]
    SegmentNotFound { channel_id: String, sequence: u64 },

    /// An upstream HTTP call exceeded its configured timeout.
    #[error("upstream timeout: {url}")]
    UpstreamTimeout { url: String },

    /// An upstream HTTP call failed to connect or returned a non-success
    /// status after retries.
    #[error("upstream connect failed: {url}")]
    UpstreamConnect { url: String },

    /// The upstream manifest was unreachable-but-200, or wasn't a media
    /// playlist at all (e.g. a master playlist, or unparseable text).
    #[error("bad upstream manifest at {url}: {detail}")]
    UpstreamProtocol { url: String, detail: String },

    /// ByteStreamProxy session creation timed out waiting for
    /// `connection_established`.
    #[error("session create failed for {content_key}")]
    SessionCreateFailed { content_key: String },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FleetError {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

pub type FleetResult<T> = Result<T, FleetError>;
