//! Proxy layer: two independent client-facing multiplexers sharing one
//! upstream fetch per channel/session (C5, C6).
//!
//! Spec §9's Design Notes ask for a shared base between the segmented and
//! byte-stream proxies rather than duplicating the "who's still watching"
//! bookkeeping in each. [`ClientActivity`] is that shared piece: both
//! proxies record a touch per client request and use it to decide when a
//! channel/session has gone cold enough to tear down.

pub mod bytestream;
pub mod segmented;

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::Mutex;

/// Tracks the last time each client was seen on a given channel/session,
/// independent of whether the proxy is segmented or byte-stream.
#[derive(Default)]
pub struct ClientActivity {
    last_seen: Mutex<HashMap<String, Instant>>,
}

impl ClientActivity {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn touch(&self, client_id: &str) {
        self.last_seen.lock().await.insert(client_id.to_string(), Instant::now());
    }

    pub async fn forget(&self, client_id: &str) {
        self.last_seen.lock().await.remove(client_id);
    }

    pub async fn client_count(&self) -> usize {
        self.last_seen.lock().await.len()
    }

    /// True once every known client has been idle for longer than
    /// `idle_for`, or there are no clients at all.
    pub async fn all_idle_for(&self, idle_for: std::time::Duration) -> bool {
        let map = self.last_seen.lock().await;
        map.values().all(|seen| seen.elapsed() >= idle_for)
    }
}
