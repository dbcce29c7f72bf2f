//! Continuous byte-stream fan-out proxy (C6): a single upstream HTTP
//! connection per content key, fanned out to many clients via bounded
//! per-client channels so one slow consumer can never stall the others.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{info, warn};

use crate::errors::{FleetError, FleetResult};
use crate::events::LifecycleObserver;
use crate::models::Stream;
use crate::proxy::ClientActivity;

const CHUNK_TARGET: usize = 64 * 1024;

pub struct ByteStreamProxyConfig {
    pub client_queue_depth: usize,
    pub stream_idle_timeout: Duration,
    pub max_retries: u32,
    pub empty_stream_timeout: Duration,
    pub health_check_interval: Duration,
    pub recency_ring_size: usize,
    pub max_connections_per_host: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnectionState {
    Connecting,
    Streaming,
    Failed,
}

pub(crate) struct Session {
    content_key: String,
    upstream_url: Mutex<String>,
    state: Mutex<ConnectionState>,
    established: Mutex<Option<oneshot::Sender<()>>>,
    clients: RwLock<HashMap<String, mpsc::Sender<Bytes>>>,
    activity: ClientActivity,
    last_data_at: Mutex<Instant>,
    stream_id: Mutex<Option<String>>,
    upstream_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    dropped_chunks: AtomicU32,
    /// Bounded backlog of the most recent chunks fanned out, replayed to a
    /// newly attached client so it doesn't start on dead air (spec §4.6).
    recency: Mutex<VecDeque<Bytes>>,
    /// Bumped on every attach; a scheduled idle-teardown task compares its
    /// captured generation against the current one before tearing the
    /// session down, so a client attaching during the grace window cancels
    /// the pending teardown instead of racing it.
    idle_generation: AtomicU64,
}

impl Session {
    fn new(content_key: String, upstream_url: String) -> Self {
        Self {
            content_key,
            upstream_url: Mutex::new(upstream_url),
            state: Mutex::new(ConnectionState::Connecting),
            established: Mutex::new(None),
            clients: RwLock::new(HashMap::new()),
            activity: ClientActivity::new(),
            last_data_at: Mutex::new(Instant::now()),
            stream_id: Mutex::new(None),
            upstream_task: Mutex::new(None),
            dropped_chunks: AtomicU32::new(0),
            recency: Mutex::new(VecDeque::new()),
            idle_generation: AtomicU64::new(0),
        }
    }
}

/// Manages one [`Session`] per content key, each backed by a single
/// upstream fetch task that fans bytes out to every attached client.
pub struct ByteStreamProxy {
    config: ByteStreamProxyConfig,
    client: reqwest::Client,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl ByteStreamProxy {
    pub fn new(config: ByteStreamProxyConfig) -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.max_connections_per_host)
            .build()
            .expect("reqwest client");
        Self {
            config,
            client,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Open (or attach to) the session for `content_key`, waiting up to
    /// `connect_timeout` for the upstream connection to be established
    /// before the first byte is guaranteed to flow (spec §4.6).
    pub async fn open_or_attach(
        proxy: &Arc<Self>,
        content_key: &str,
        upstream_url: &str,
        stream_id: Option<&str>,
        connect_timeout: Duration,
    ) -> FleetResult<Arc<Session>> {
        let existing = proxy.sessions.read().await.get(content_key).cloned();
        if let Some(session) = existing {
            return Ok(session);
        }

        let mut sessions = proxy.sessions.write().await;
        if let Some(session) = sessions.get(content_key) {
            return Ok(session.clone());
        }

        let session = Arc::new(Session::new(content_key.to_string(), upstream_url.to_string()));
        *session.stream_id.lock().await = stream_id.map(|s| s.to_string());

        let (tx, rx) = oneshot::channel();
        *session.established.lock().await = Some(tx);

        let task_self = proxy.clone();
        let task_session = session.clone();
        let handle = tokio::spawn(async move { task_self.upstream_loop(task_session).await });
        *session.upstream_task.lock().await = Some(handle);

        sessions.insert(content_key.to_string(), session.clone());
        drop(sessions);

        match tokio::time::timeout(connect_timeout, rx).await {
            Ok(Ok(())) => Ok(session),
            _ => Err(FleetError::SessionCreateFailed {
                content_key: content_key.to_string(),
            }),
        }
    }

    async fn upstream_loop(&self, session: Arc<Session>) {
        let mut attempt = 0u32;
        loop {
            let url = session.upstream_url.lock().await.clone();
            let request = self.client.get(&url).header("Accept-Encoding", "identity");

            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    attempt = 0;
                    *session.state.lock().await = ConnectionState::Streaming;
                    if let Some(tx) = session.established.lock().await.take() {
                        let _ = tx.send(());
                    }

                    let mut stream = resp.bytes_stream();
                    let mut buffer = Vec::with_capacity(CHUNK_TARGET);
                    while let Some(chunk) = stream.next().await {
                        match chunk {
                            Ok(bytes) => {
                                buffer.extend_from_slice(&bytes);
                                if buffer.len() >= CHUNK_TARGET {
                                    self.fan_out(&session, Bytes::from(std::mem::take(&mut buffer))).await;
                                }
                            }
                            Err(e) => {
                                warn!(content_key = %session.content_key, error = %e, "upstream stream error");
                                break;
                            }
                        }
                    }
                    if !buffer.is_empty() {
                        self.fan_out(&session, Bytes::from(buffer)).await;
                    }
                }
                _ => {
                    *session.state.lock().await = ConnectionState::Failed;
                }
            }

            attempt += 1;
            if attempt > self.config.max_retries {
                warn!(content_key = %session.content_key, "giving up after max retries");
                break;
            }
            let backoff = Duration::from_secs(2u64.pow(attempt.min(4))).min(Duration::from_secs(10));
            tokio::time::sleep(backoff).await;

            if session.clients.read().await.is_empty() && session.activity.client_count().await == 0 {
                break;
            }
        }
        *session.state.lock().await = ConnectionState::Failed;
    }

    async fn fan_out(&self, session: &Arc<Session>, chunk: Bytes) {
        *session.last_data_at.lock().await = Instant::now();

        {
            let mut recency = session.recency.lock().await;
            recency.push_back(chunk.clone());
            while recency.len() > self.config.recency_ring_size {
                recency.pop_front();
            }
        }

        let clients = session.clients.read().await;
        for (client_id, tx) in clients.iter() {
            if tx.try_send(chunk.clone()).is_err() {
                session.dropped_chunks.fetch_add(1, Ordering::Relaxed);
                warn!(content_key = %session.content_key, client_id, "dropping chunk, client queue full");
            }
        }
    }

    /// Attach a new client to an existing session, replaying the recency
    /// ring into its channel first so it catches up on recent bytes instead
    /// of waiting for the next upstream chunk (spec §4.6).
    pub async fn attach_client(&self, content_key: &str, client_id: &str) -> FleetResult<mpsc::Receiver<Bytes>> {
        let session = self
            .sessions
            .read()
            .await
            .get(content_key)
            .cloned()
            .ok_or_else(|| FleetError::SessionCreateFailed {
                content_key: content_key.to_string(),
            })?;

        // Cancels any idle-teardown scheduled by a previous last-client
        // detach; see `detach_client`.
        session.idle_generation.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(self.config.client_queue_depth);
        for chunk in session.recency.lock().await.iter() {
            let _ = tx.try_send(chunk.clone());
        }

        session.clients.write().await.insert(client_id.to_string(), tx);
        session.activity.touch(client_id).await;
        Ok(rx)
    }

    /// Detach a client; if it was the last one, schedule the session to
    /// tear down after `stream_idle_timeout` unless a new client attaches
    /// in the meantime (spec §4.6's idle-after-last-detach rule).
    pub async fn detach_client(proxy: &Arc<Self>, content_key: &str, client_id: &str) {
        let Some(session) = proxy.sessions.read().await.get(content_key).cloned() else {
            return;
        };
        session.clients.write().await.remove(client_id);
        session.activity.forget(client_id).await;

        if session.clients.read().await.is_empty() {
            let generation = session.idle_generation.fetch_add(1, Ordering::SeqCst) + 1;
            let proxy = proxy.clone();
            let content_key = content_key.to_string();
            let idle_timeout = proxy.config.stream_idle_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(idle_timeout).await;
                let Some(session) = proxy.sessions.read().await.get(&content_key).cloned() else {
                    return;
                };
                if session.idle_generation.load(Ordering::SeqCst) != generation {
                    // A client attached (or another detach/attach cycle ran)
                    // since this teardown was scheduled; let it stand.
                    return;
                }
                if session.clients.read().await.is_empty() {
                    proxy.stop(&content_key).await;
                }
            });
        }
    }

    /// Number of chunks dropped for `content_key` because some client's
    /// bounded queue was full (spec §4.6's slow-client drop policy).
    pub async fn dropped_chunks(&self, content_key: &str) -> u32 {
        self.sessions
            .read()
            .await
            .get(content_key)
            .map(|s| s.dropped_chunks.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub async fn stop(&self, content_key: &str) {
        if let Some(session) = self.sessions.write().await.remove(content_key) {
            if let Some(handle) = session.upstream_task.lock().await.take() {
                handle.abort();
            }
            info!(content_key, "bytestream session closed");
        }
    }

    /// Background task: close any session idle for longer than
    /// `empty_stream_timeout` with no clients, or producing no bytes for
    /// that long even with clients attached (spec §4.6).
    pub async fn run_health_monitor(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.health_check_interval);
        loop {
            ticker.tick().await;
            let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
            for content_key in ids {
                let Some(session) = self.sessions.read().await.get(&content_key).cloned() else {
                    continue;
                };
                let stale = session.last_data_at.lock().await.elapsed() >= self.config.empty_stream_timeout;
                let no_clients = session.clients.read().await.is_empty();
                if stale && no_clients {
                    self.stop(&content_key).await;
                }
            }
        }
    }
}

#[async_trait]
impl LifecycleObserver for ByteStreamProxy {
    async fn on_stream_terminated(&self, stream: &Stream, _reason: &str) {
        let content_key = {
            let sessions = self.sessions.read().await;
            let mut found = None;
            for (key, session) in sessions.iter() {
                if session.stream_id.lock().await.as_deref() == Some(stream.id.as_str()) {
                    found = Some(key.clone());
                    break;
                }
            }
            found
        };
        if let Some(content_key) = content_key {
            self.stop(&content_key).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ByteStreamProxyConfig {
        ByteStreamProxyConfig {
            client_queue_depth: 4,
            stream_idle_timeout: Duration::from_secs(300),
            max_retries: 3,
            empty_stream_timeout: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(5),
            recency_ring_size: 100,
            max_connections_per_host: 10,
        }
    }

    #[tokio::test]
    async fn attach_without_session_fails() {
        let proxy = ByteStreamProxy::new(test_config());
        let err = proxy.attach_client("ghost", "client1").await.unwrap_err();
        assert!(matches!(err, FleetError::SessionCreateFailed { .. }));
    }

    #[tokio::test]
    async fn detach_on_unknown_session_is_a_noop() {
        let proxy = Arc::new(ByteStreamProxy::new(test_config()));
        ByteStreamProxy::detach_client(&proxy, "ghost", "client1").await;
    }

    #[tokio::test]
    async fn attach_and_detach_tracks_client_activity() {
        let proxy = Arc::new(ByteStreamProxy::new(test_config()));
        let session = Arc::new(Session::new("key1".to_string(), "http://upstream/x".to_string()));
        proxy.sessions.write().await.insert("key1".to_string(), session.clone());

        let _rx = proxy.attach_client("key1", "client1").await.unwrap();
        assert_eq!(session.clients.read().await.len(), 1);

        ByteStreamProxy::detach_client(&proxy, "key1", "client1").await;
        assert_eq!(session.clients.read().await.len(), 0);
    }

    #[tokio::test]
    async fn attach_replays_recency_ring_to_a_new_client() {
        let proxy = Arc::new(ByteStreamProxy::new(test_config()));
        let session = Arc::new(Session::new("key1".to_string(), "http://upstream/x".to_string()));
        session.recency.lock().await.push_back(Bytes::from_static(b"chunk-a"));
        session.recency.lock().await.push_back(Bytes::from_static(b"chunk-b"));
        proxy.sessions.write().await.insert("key1".to_string(), session.clone());

        let mut rx = proxy.attach_client("key1", "client1").await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"chunk-a"));
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"chunk-b"));
    }

    #[tokio::test]
    async fn fan_out_counts_a_drop_when_a_clients_queue_is_full() {
        let mut config = test_config();
        config.client_queue_depth = 1;
        let proxy = ByteStreamProxy::new(config);
        let session = Arc::new(Session::new("key1".to_string(), "http://upstream/x".to_string()));
        let (tx, _rx) = mpsc::channel(1);
        // Fill the one slot so the next send is dropped, without anyone
        // ever reading from `_rx`.
        tx.try_send(Bytes::from_static(b"first")).unwrap();
        session.clients.write().await.insert("slow-client".to_string(), tx);

        proxy.fan_out(&session, Bytes::from_static(b"second")).await;

        assert_eq!(proxy.dropped_chunks("key1").await, 0); // session not registered under the proxy yet
        assert_eq!(session.dropped_chunks.load(Ordering::Relaxed), 1);
    }

    /// S4: one fast client that drains every chunk alongside one frozen
    /// client that never reads — the frozen client must absorb dropped
    /// chunks instead of backing up the shared fan-out loop, and once both
    /// detach the session tears itself down after `stream_idle_timeout`.
    #[tokio::test]
    async fn s4_frozen_client_drops_chunks_without_starving_fast_client() {
        let mut config = test_config();
        config.client_queue_depth = 1;
        config.stream_idle_timeout = Duration::from_millis(30);
        let proxy = Arc::new(ByteStreamProxy::new(config));
        let session = Arc::new(Session::new("key1".to_string(), "http://upstream/x".to_string()));
        proxy.sessions.write().await.insert("key1".to_string(), session.clone());

        let mut fast_rx = proxy.attach_client("key1", "fast").await.unwrap();
        let _frozen_rx = proxy.attach_client("key1", "frozen").await.unwrap(); // intentionally never drained

        for i in 0..5u8 {
            proxy.fan_out(&session, Bytes::copy_from_slice(&[i])).await;
            let got = fast_rx.try_recv().expect("fast client must keep receiving every chunk");
            assert_eq!(got[0], i);
        }

        assert!(
            proxy.dropped_chunks("key1").await > 0,
            "frozen client's full queue should have registered at least one drop"
        );

        ByteStreamProxy::detach_client(&proxy, "key1", "fast").await;
        ByteStreamProxy::detach_client(&proxy, "key1", "frozen").await;
        assert!(
            proxy.sessions.read().await.contains_key("key1"),
            "session must outlive the last detach until stream_idle_timeout elapses"
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(
            !proxy.sessions.read().await.contains_key("key1"),
            "session should be torn down once stream_idle_timeout has elapsed with no clients"
        );
    }
}
