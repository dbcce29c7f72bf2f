//! HLS-style manifest proxy (C5): one upstream fetch loop per channel,
//! fanning a sliding window of segments out to any number of players via a
//! generated `.m3u8` manifest.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info, warn};

use crate::errors::{FleetError, FleetResult};
use crate::events::LifecycleObserver;
use crate::models::Stream;
use crate::proxy::ClientActivity;

#[derive(Clone)]
struct Segment {
    sequence: u64,
    data: Bytes,
    duration_secs: f64,
}

/// A media playlist reduced to the fields the fetch loop needs, decoupled
/// from `m3u8_rs`'s borrowed error/AST types so it can be built, held across
/// an `.await`, and returned as an owned value.
struct ParsedPlaylist {
    target_duration: Option<f64>,
    version: Option<u32>,
    segments: Vec<ParsedSegment>,
}

struct ParsedSegment {
    uri: String,
    duration: f64,
}

pub struct SegmentedProxyConfig {
    pub buffer_ready_timeout: Duration,
    pub first_segment_timeout: Duration,
    pub window_size: usize,
    pub max_segments: usize,
    pub initial_buffer_seconds: f64,
    pub max_initial_segments: usize,
    pub segment_fetch_interval_multiplier: f64,
    pub cleanup_interval: Duration,
    pub manifest_fetch_timeout: Duration,
    pub segment_fetch_timeout: Duration,
}

pub(crate) struct Channel {
    channel_id: String,
    playback_url: Mutex<String>,
    segments: Mutex<VecDeque<Segment>>,
    next_sequence: AtomicU64,
    initial_buffer_ready: AtomicBool,
    has_segments: AtomicBool,
    /// Signalled whenever `initial_buffer_ready` or `has_segments` flips, so
    /// `get_manifest` can wait cooperatively instead of failing immediately
    /// (spec §4.5's `BUFFER_READY_TIMEOUT`/`FIRST_SEGMENT_TIMEOUT` waits).
    ready: Notify,
    /// Segment URIs already downloaded for this channel, so the fetch loop
    /// never re-fetches a segment still present in the upstream manifest's
    /// trailing window.
    fetched_uris: Mutex<HashSet<String>>,
    target_duration: Mutex<f64>,
    manifest_version: Mutex<u32>,
    clients: ClientActivity,
    stream_id: Mutex<Option<String>>,
    fetch_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Channel {
    fn new(channel_id: String, playback_url: String) -> Self {
        Self {
            channel_id,
            playback_url: Mutex::new(playback_url),
            segments: Mutex::new(VecDeque::new()),
            next_sequence: AtomicU64::new(0),
            initial_buffer_ready: AtomicBool::new(false),
            has_segments: AtomicBool::new(false),
            ready: Notify::new(),
            fetched_uris: Mutex::new(HashSet::new()),
            target_duration: Mutex::new(4.0),
            manifest_version: Mutex::new(3),
            clients: ClientActivity::new(),
            stream_id: Mutex::new(None),
            fetch_task: Mutex::new(None),
        }
    }

    /// Blocks (up to `timeout`) until `condition` reads true, waking on
    /// every `ready` signal rather than polling. `Notify::notified()` is
    /// called before re-checking `condition` so a signal raised between the
    /// check and the wait is never missed (tokio's documented race-free
    /// pattern for condition variables built on `Notify`).
    async fn wait_until(&self, timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            let notified = self.ready.notified();
            if condition() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return false;
            }
        }
    }
}

/// Manages one `Channel` per upstream live stream, each with its own
/// background fetch loop and sliding window of segments.
pub struct SegmentedProxy {
    config: SegmentedProxyConfig,
    client: reqwest::Client,
    channels: RwLock<HashMap<String, Arc<Channel>>>,
}

impl SegmentedProxy {
    pub fn new(config: SegmentedProxyConfig) -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(8)
            .build()
            .expect("reqwest client");
        Self {
            config,
            client,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Create the channel and start its fetch loop if it doesn't already
    /// exist; idempotent on `channel_id` so concurrent requests for the
    /// same channel share one upstream connection (spec §4.5).
    pub(crate) async fn ensure_channel(
        proxy: &Arc<Self>,
        channel_id: &str,
        playback_url: &str,
        stream_id: Option<&str>,
    ) -> Arc<Channel> {
        if let Some(existing) = proxy.channels.read().await.get(channel_id) {
            *existing.playback_url.lock().await = playback_url.to_string();
            *existing.stream_id.lock().await = stream_id.map(|s| s.to_string());
            return existing.clone();
        }

        let mut channels = proxy.channels.write().await;
        if let Some(existing) = channels.get(channel_id) {
            *existing.playback_url.lock().await = playback_url.to_string();
            *existing.stream_id.lock().await = stream_id.map(|s| s.to_string());
            return existing.clone();
        }

        let channel = Arc::new(Channel::new(channel_id.to_string(), playback_url.to_string()));
        *channel.stream_id.lock().await = stream_id.map(|s| s.to_string());

        let task_self = proxy.clone();
        let task_channel = channel.clone();
        let handle = tokio::spawn(async move { task_self.fetch_loop(task_channel).await });
        *channel.fetch_task.lock().await = Some(handle);

        channels.insert(channel_id.to_string(), channel.clone());
        info!(channel_id, "segmented channel opened");
        channel
    }

    /// Background per-channel loop (spec §4.5): repeatedly fetch the
    /// upstream media playlist, dedupe its segments against what's already
    /// been downloaded by URI, and pull down only the new trailing
    /// segment(s) — mirrors `original_source/app/proxy/hls_proxy.py`'s
    /// `StreamFetcher.fetch_loop`.
    async fn fetch_loop(&self, channel: Arc<Channel>) {
        let mut backoff = Duration::from_secs(1);
        let mut consecutive_errors = 0u32;

        loop {
            if Arc::strong_count(&channel) == 1 {
                // Only the loop itself holds a reference; the channel was
                // removed from the registry underneath us.
                break;
            }

            let url = channel.playback_url.lock().await.clone();
            match self.fetch_manifest(&url).await {
                Ok(playlist) => {
                    consecutive_errors = 0;
                    backoff = Duration::from_secs(1);

                    if let Some(target_duration) = playlist.target_duration {
                        *channel.target_duration.lock().await = target_duration;
                    }
                    if let Some(version) = playlist.version {
                        *channel.manifest_version.lock().await = version;
                    }

                    if playlist.segments.is_empty() {
                        warn!(channel_id = %channel.channel_id, "manifest has no segments");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }

                    if !channel.initial_buffer_ready.load(Ordering::SeqCst) {
                        self.fetch_initial_segments(&channel, &url, &playlist.segments).await;
                    } else {
                        self.fetch_latest_segment(&channel, &url, &playlist.segments).await;
                        let target_duration = *channel.target_duration.lock().await;
                        let wait = Duration::from_secs_f64(target_duration * self.config.segment_fetch_interval_multiplier);
                        tokio::time::sleep(wait).await;
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(channel_id = %channel.channel_id, error = %e, attempt = consecutive_errors, "manifest fetch failed");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(8));
                }
            }
        }
    }

    /// Fetch and parse the upstream `.m3u8` at `url` into an owned,
    /// `m3u8_rs`-independent representation.
    async fn fetch_manifest(&self, url: &str) -> FleetResult<ParsedPlaylist> {
        let resp = tokio::time::timeout(self.config.manifest_fetch_timeout, self.client.get(url).send())
            .await
            .map_err(|_| FleetError::UpstreamTimeout { url: url.to_string() })?
            .map_err(|_| FleetError::UpstreamConnect { url: url.to_string() })?;
        if !resp.status().is_success() {
            return Err(FleetError::UpstreamConnect { url: url.to_string() });
        }
        let body = resp.bytes().await.map_err(FleetError::Http)?;

        match m3u8_rs::parse_playlist_res(&body) {
            Ok(m3u8_rs::Playlist::MediaPlaylist(playlist)) => Ok(ParsedPlaylist {
                target_duration: Some(playlist.target_duration as f64),
                version: playlist.version.map(|v| v as u32),
                segments: playlist
                    .segments
                    .into_iter()
                    .map(|s| ParsedSegment {
                        uri: s.uri,
                        duration: s.duration as f64,
                    })
                    .collect(),
            }),
            Ok(m3u8_rs::Playlist::MasterPlaylist(_)) => Err(FleetError::UpstreamProtocol {
                url: url.to_string(),
                detail: "expected a media playlist, got a master playlist".to_string(),
            }),
            Err(_) => Err(FleetError::UpstreamProtocol {
                url: url.to_string(),
                detail: "failed to parse HLS manifest".to_string(),
            }),
        }
    }

    /// First pass for a freshly opened channel: walk the manifest from its
    /// tail until `initial_buffer_seconds`/`max_initial_segments` is met,
    /// download each of those segments, and flip `initial_buffer_ready`
    /// once at least one succeeded.
    async fn fetch_initial_segments(&self, channel: &Channel, base_url: &str, segments: &[ParsedSegment]) {
        let mut to_fetch = Vec::new();
        let mut accumulated = 0.0;
        for segment in segments.iter().rev() {
            accumulated += segment.duration;
            to_fetch.push(segment);
            if accumulated >= self.config.initial_buffer_seconds || to_fetch.len() >= self.config.max_initial_segments {
                break;
            }
        }
        to_fetch.reverse();

        let mut downloaded = 0;
        for segment in to_fetch {
            if self.download_segment(channel, base_url, segment).await {
                downloaded += 1;
            }
        }

        if downloaded > 0 {
            channel.initial_buffer_ready.store(true, Ordering::SeqCst);
            channel.ready.notify_waiters();
            debug!(channel_id = %channel.channel_id, downloaded, "initial buffer ready");
        }
    }

    /// Steady-state pass: the manifest's trailing segment is the only one
    /// that can be new, so fetch it unless we've already downloaded its URI.
    async fn fetch_latest_segment(&self, channel: &Channel, base_url: &str, segments: &[ParsedSegment]) {
        let Some(latest) = segments.last() else { return };
        if channel.fetched_uris.lock().await.contains(&latest.uri) {
            return;
        }
        self.download_segment(channel, base_url, latest).await;
    }

    /// Resolve `segment.uri` against the manifest's URL, download it, push
    /// it into the channel's ring, and record its URI as seen. Returns
    /// whether the download succeeded.
    async fn download_segment(&self, channel: &Channel, base_url: &str, segment: &ParsedSegment) -> bool {
        let segment_url = match reqwest::Url::parse(base_url).and_then(|base| base.join(&segment.uri)) {
            Ok(url) => url,
            Err(e) => {
                warn!(channel_id = %channel.channel_id, uri = %segment.uri, error = %e, "could not resolve segment URL");
                return false;
            }
        };

        let data = match tokio::time::timeout(self.config.segment_fetch_timeout, self.client.get(segment_url.clone()).send()).await {
            Ok(Ok(resp)) => match resp.bytes().await {
                Ok(data) => data,
                Err(e) => {
                    warn!(channel_id = %channel.channel_id, url = %segment_url, error = %e, "segment download failed");
                    return false;
                }
            },
            Ok(Err(e)) => {
                warn!(channel_id = %channel.channel_id, url = %segment_url, error = %e, "segment download failed");
                return false;
            }
            Err(_) => {
                warn!(channel_id = %channel.channel_id, url = %segment_url, "segment download timed out");
                return false;
            }
        };

        let seq = channel.next_sequence.fetch_add(1, Ordering::SeqCst);
        {
            let mut segments = channel.segments.lock().await;
            segments.push_back(Segment {
                sequence: seq,
                data,
                duration_secs: segment.duration,
            });
            while segments.len() > self.config.max_segments {
                segments.pop_front();
            }
        }
        channel.fetched_uris.lock().await.insert(segment.uri.clone());
        channel.has_segments.store(true, Ordering::SeqCst);
        channel.ready.notify_waiters();
        debug!(channel_id = %channel.channel_id, sequence = seq, "buffered segment");
        true
    }

    /// Render the sliding-window `.m3u8` manifest for `channel_id`, waiting
    /// cooperatively (rather than failing immediately) up to
    /// `buffer_ready_timeout` for the initial buffer and then up to
    /// `first_segment_timeout` for at least one segment to land — mirrors
    /// `HLSProxyServer.get_manifest_async`'s two-stage wait.
    pub async fn get_manifest(&self, channel_id: &str) -> FleetResult<String> {
        let channel = self.channel(channel_id).await?;

        if !channel
            .wait_until(self.config.buffer_ready_timeout, || channel.initial_buffer_ready.load(Ordering::SeqCst))
            .await
        {
            return Err(FleetError::ChannelNotReady);
        }

        if !channel
            .wait_until(self.config.first_segment_timeout, || channel.has_segments.load(Ordering::SeqCst))
            .await
        {
            return Err(FleetError::ChannelNotReady);
        }

        let segments = channel.segments.lock().await;
        let window: Vec<&Segment> = segments.iter().rev().take(self.config.window_size).rev().collect();
        let media_sequence = window.first().map(|s| s.sequence).unwrap_or(0);
        let version = *channel.manifest_version.lock().await;
        let target_duration = channel.target_duration.lock().await.ceil() as u64;

        let mut manifest = String::new();
        manifest.push_str("#EXTM3U\n");
        manifest.push_str(&format!("#EXT-X-VERSION:{version}\n"));
        manifest.push_str(&format!("#EXT-X-TARGETDURATION:{target_duration}\n"));
        manifest.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{media_sequence}\n"));
        for segment in window {
            manifest.push_str(&format!("#EXTINF:{:.3},\n", segment.duration_secs));
            manifest.push_str(&format!("segment/{}.ts\n", segment.sequence));
        }
        Ok(manifest)
    }

    pub async fn get_segment(&self, channel_id: &str, sequence: u64) -> FleetResult<Bytes> {
        let channel = self.channel(channel_id).await?;
        let segments = channel.segments.lock().await;
        segments
            .iter()
            .find(|s| s.sequence == sequence)
            .map(|s| s.data.clone())
            .ok_or(FleetError::SegmentNotFound {
                channel_id: channel_id.to_string(),
                sequence,
            })
    }

    pub async fn record_client_activity(&self, channel_id: &str, client_id: &str) -> FleetResult<()> {
        let channel = self.channel(channel_id).await?;
        channel.clients.touch(client_id).await;
        Ok(())
    }

    async fn channel(&self, channel_id: &str) -> FleetResult<Arc<Channel>> {
        self.channels
            .read()
            .await
            .get(channel_id)
            .cloned()
            .ok_or_else(|| FleetError::ChannelNotReady)
    }

    pub async fn stop_channel(&self, channel_id: &str) {
        if let Some(channel) = self.channels.write().await.remove(channel_id) {
            if let Some(handle) = channel.fetch_task.lock().await.take() {
                handle.abort();
            }
            info!(channel_id, "segmented channel closed");
        }
    }

    /// Background task: every `cleanup_interval`, close any channel whose
    /// clients have all been idle for longer than three manifest target
    /// durations (spec §4.5's inactivity rule — ~12s at a 4s target).
    pub async fn run_cleanup(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval);
        let idle_for = Duration::from_secs(12);
        loop {
            ticker.tick().await;
            let ids: Vec<String> = self.channels.read().await.keys().cloned().collect();
            for channel_id in ids {
                let Some(channel) = self.channels.read().await.get(&channel_id).cloned() else {
                    continue;
                };
                if channel.clients.client_count().await > 0 && channel.clients.all_idle_for(idle_for).await {
                    self.stop_channel(&channel_id).await;
                }
            }
        }
    }
}

#[async_trait]
impl LifecycleObserver for SegmentedProxy {
    async fn on_stream_terminated(&self, stream: &Stream, _reason: &str) {
        let channel_id = {
            let channels = self.channels.read().await;
            let mut found = None;
            for (id, channel) in channels.iter() {
                if channel.stream_id.lock().await.as_deref() == Some(stream.id.as_str()) {
                    found = Some(id.clone());
                    break;
                }
            }
            found
        };
        if let Some(channel_id) = channel_id {
            self.stop_channel(&channel_id).await;
        }
    }
}
