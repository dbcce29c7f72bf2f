//! In-process lifecycle notifications (C7).
//!
//! Spec §9's Design Notes call for replacing the original's cyclic
//! proxy-to-registry references with a single-direction observer: the
//! Registry owns the list of observers and pushes to them, a proxy never
//! reaches back into the Registry to ask "has my stream ended?". Dispatch
//! is fire-and-forget (`tokio::spawn` per observer, spec §4.7) so a slow or
//! wedged proxy can never stall `on_stream_ended`.

use async_trait::async_trait;

use crate::models::Stream;

/// Implemented by anything that must react when a stream it may be serving
/// is torn down in the Registry. Both [`crate::proxy::segmented`] and
/// [`crate::proxy::bytestream`] implement this to drop their session state.
#[async_trait]
pub trait LifecycleObserver: Send + Sync {
    async fn on_stream_terminated(&self, stream: &Stream, reason: &str);
}
