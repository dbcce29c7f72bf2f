//! HTTP surface (spec §6): the proxy-facing `/ace/*` routes, the fleet
//! introspection routes, the lifecycle event hooks kept only for
//! backward-compatible callers, and `/metrics`.

pub mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::app::App;

pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/ace/getstream", get(handlers::get_stream))
        .route("/ace/hls/:manifest_name", get(handlers::get_hls_manifest))
        .route("/ace/hls/:channel_id/segment/:segment_name", get(handlers::get_hls_segment))
        .route("/ace/direct/:stream_id", get(handlers::get_direct_stream))
        .route("/engines", get(handlers::list_engines))
        .route("/engines/:id", get(handlers::get_engine))
        .route("/streams", get(handlers::list_streams))
        .route("/events/stream_started", post(handlers::event_stream_started))
        .route("/events/stream_ended", post(handlers::event_stream_ended))
        .route("/metrics", get(handlers::metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}
