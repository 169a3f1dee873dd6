//! SSE stream hub
//!
//! One bounded broadcast channel per stream fans a single producer out to
//! every SSE subscriber. Events sent before the first subscriber attaches
//! are buffered and replayed. A reaper evicts idle streams and destroys
//! terminal streams once their subscribers have drained.

use lattice_shared::{SseEventType, StreamConfig, StreamEvent, StreamInfo, StreamStatus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct StreamState {
    status: StreamStatus,
    last_event_at: Option<DateTime<Utc>>,
    events_sent: u64,
    /// Events sent before any subscriber attached; replayed to the first.
    pending: VecDeque<StreamEvent>,
}

struct StreamEntry {
    stream_id: Uuid,
    service_id: String,
    user_id: Option<String>,
    tool_id: Option<String>,
    created_at: DateTime<Utc>,
    keepalive: Duration,
    timeout: Duration,
    max_queue: usize,
    state: Mutex<StreamState>,
    tx: broadcast::Sender<StreamEvent>,
    connected_clients: AtomicU32,
}

impl StreamEntry {
    fn info(&self) -> StreamInfo {
        let state = self.state.lock();
        StreamInfo {
            stream_id: self.stream_id,
            service_id: self.service_id.clone(),
            user_id: self.user_id.clone(),
            tool_id: self.tool_id.clone(),
            status: state.status,
            events_sent: state.events_sent,
            connected_clients: self.connected_clients.load(Ordering::SeqCst),
            created_at: self.created_at,
            last_event_at: state.last_event_at,
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.lock();
        if state.status != StreamStatus::Active {
            return false;
        }
        let reference = state.last_event_at.unwrap_or(self.created_at);
        (now - reference).num_seconds() >= self.timeout.as_secs() as i64
    }
}

/// Decrements the subscriber count when an SSE connection ends, however it
/// ends.
struct SubscriberGuard {
    entry: Arc<StreamEntry>,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.entry.connected_clients.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The hub: stream registry, producer API, subscriber fan-out, reaper.
pub struct StreamHub {
    streams: DashMap<Uuid, Arc<StreamEntry>>,
    config: StreamConfig,
}

impl StreamHub {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            streams: DashMap::new(),
            config,
        }
    }

    /// Create a stream and emit its initial `stream_created` event.
    pub fn create_stream(
        &self,
        service_id: &str,
        user_id: Option<String>,
        tool_id: Option<String>,
        keepalive_secs: Option<u64>,
        timeout_secs: Option<u64>,
    ) -> Uuid {
        let stream_id = Uuid::new_v4();
        let (tx, _) = broadcast::channel(self.config.max_queue_size);

        let entry = Arc::new(StreamEntry {
            stream_id,
            service_id: service_id.to_string(),
            user_id,
            tool_id,
            created_at: Utc::now(),
            keepalive: Duration::from_secs(keepalive_secs.unwrap_or(self.config.keepalive_secs)),
            timeout: Duration::from_secs(timeout_secs.unwrap_or(self.config.default_timeout_secs)),
            max_queue: self.config.max_queue_size,
            state: Mutex::new(StreamState {
                status: StreamStatus::Active,
                last_event_at: None,
                events_sent: 0,
                pending: VecDeque::new(),
            }),
            tx,
            connected_clients: AtomicU32::new(0),
        });
        self.streams.insert(stream_id, entry);

        self.send_event(
            stream_id,
            StreamEvent::new(
                SseEventType::StreamCreated,
                serde_json::json!({
                    "stream_id": stream_id.to_string(),
                    "service_id": service_id,
                }),
            ),
        );
        info!(stream = %stream_id, service = %service_id, "stream created");
        stream_id
    }

    /// Enqueue an event. Returns false for unknown or non-active streams
    /// and when the event queue is full, before or after a subscriber
    /// attaches. `complete` and `error` events transition the stream's
    /// status.
    pub fn send_event(&self, stream_id: Uuid, event: StreamEvent) -> bool {
        let Some(entry) = self.streams.get(&stream_id).map(|e| e.clone()) else {
            warn!(stream = %stream_id, "event for unknown stream");
            return false;
        };

        let mut state = entry.state.lock();
        if state.status != StreamStatus::Active {
            debug!(stream = %stream_id, status = ?state.status, "event for non-active stream");
            return false;
        }

        if entry.tx.receiver_count() == 0 {
            if state.pending.len() >= entry.max_queue {
                warn!(stream = %stream_id, "stream buffer full, dropping event");
                return false;
            }
            state.pending.push_back(event.clone());
        } else {
            // A full channel would silently evict the oldest unread event;
            // refuse the send instead so the producer sees the overflow.
            if entry.tx.len() >= entry.max_queue {
                warn!(stream = %stream_id, "stream queue full, dropping event");
                return false;
            }
            // Err means every receiver vanished since the count check;
            // the event is lost to nobody.
            let _ = entry.tx.send(event.clone());
        }

        state.last_event_at = Some(Utc::now());
        state.events_sent += 1;
        match event.event_type {
            SseEventType::Complete => state.status = StreamStatus::Completed,
            SseEventType::Error => state.status = StreamStatus::Error,
            _ => {}
        }
        true
    }

    pub fn send_progress(&self, stream_id: Uuid, progress: u32, message: &str) -> bool {
        self.send_event(
            stream_id,
            StreamEvent::new(
                SseEventType::Progress,
                serde_json::json!({ "progress": progress, "message": message }),
            ),
        )
    }

    pub fn send_status(&self, stream_id: Uuid, status: &str, message: &str) -> bool {
        self.send_event(
            stream_id,
            StreamEvent::new(
                SseEventType::Status,
                serde_json::json!({ "status": status, "message": message }),
            ),
        )
    }

    pub fn send_error(&self, stream_id: Uuid, error: &str) -> bool {
        self.send_event(
            stream_id,
            StreamEvent::new(SseEventType::Error, serde_json::json!({ "error": error })),
        )
    }

    pub fn send_complete(&self, stream_id: Uuid, result: serde_json::Value) -> bool {
        self.send_event(
            stream_id,
            StreamEvent::new(SseEventType::Complete, serde_json::json!({ "result": result })),
        )
    }

    /// Close a stream: emit `complete` and mark it completed.
    pub fn close_stream(&self, stream_id: Uuid) -> bool {
        self.send_complete(stream_id, serde_json::Value::Null)
    }

    /// Subscribe to a stream. The returned sequence yields every event in
    /// producer order, interleaved with `keepalive` events during silence,
    /// and ends after a terminal event.
    pub fn subscribe(&self, stream_id: Uuid) -> Option<BoxStream<'static, StreamEvent>> {
        let entry = self.streams.get(&stream_id).map(|e| e.clone())?;

        entry.connected_clients.fetch_add(1, Ordering::SeqCst);
        let mut rx = entry.tx.subscribe();
        // The first subscriber drains whatever the producer sent before
        // anyone attached.
        let buffered: Vec<StreamEvent> = entry.state.lock().pending.drain(..).collect();

        // Constructed here, moved into the generator: the count drops even
        // if the subscription is dropped unpolled.
        let guard = SubscriberGuard { entry };
        let stream = async_stream::stream! {
            let guard = guard;
            for event in buffered {
                let terminal = is_terminal_event(&event);
                yield event;
                if terminal {
                    return;
                }
            }

            loop {
                match tokio::time::timeout(guard.entry.keepalive, rx.recv()).await {
                    Ok(Ok(event)) => {
                        let terminal = is_terminal_event(&event);
                        yield event;
                        if terminal {
                            break;
                        }
                    }
                    // Lagged subscribers skip overwritten events and go on.
                    Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                    Ok(Err(broadcast::error::RecvError::Closed)) => break,
                    Err(_) => {
                        if guard.entry.state.lock().status != StreamStatus::Active {
                            break;
                        }
                        yield StreamEvent::new(SseEventType::Keepalive, serde_json::json!({}));
                    }
                }
            }
        };

        Some(stream.boxed())
    }

    pub fn stream_info(&self, stream_id: Uuid) -> Option<StreamInfo> {
        self.streams.get(&stream_id).map(|entry| entry.info())
    }

    /// Active streams, optionally filtered by user or service.
    pub fn active_streams(
        &self,
        user_id: Option<&str>,
        service_id: Option<&str>,
    ) -> Vec<StreamInfo> {
        self.streams
            .iter()
            .map(|entry| entry.info())
            .filter(|info| info.status == StreamStatus::Active)
            .filter(|info| user_id.map_or(true, |u| info.user_id.as_deref() == Some(u)))
            .filter(|info| service_id.map_or(true, |s| info.service_id == s))
            .collect()
    }

    pub fn stats(&self) -> serde_json::Value {
        let mut active = 0usize;
        let mut completed = 0usize;
        let mut errored = 0usize;
        let mut timed_out = 0usize;
        let mut total_events = 0u64;
        let mut total_clients = 0u32;

        for entry in self.streams.iter() {
            let info = entry.info();
            match info.status {
                StreamStatus::Active => active += 1,
                StreamStatus::Completed => completed += 1,
                StreamStatus::Error => errored += 1,
                StreamStatus::Timeout => timed_out += 1,
            }
            total_events += info.events_sent;
            total_clients += info.connected_clients;
        }

        serde_json::json!({
            "total_streams": self.streams.len(),
            "active_streams": active,
            "completed_streams": completed,
            "error_streams": errored,
            "timeout_streams": timed_out,
            "total_events_sent": total_events,
            "connected_clients": total_clients,
            "cleanup_interval": self.config.cleanup_interval_secs,
        })
    }

    /// One reaper pass: expire idle actives, destroy drained terminals.
    /// Returns the number of streams removed.
    pub fn reap(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0;

        // Expire first, then destroy anything terminal with no subscribers.
        for entry in self.streams.iter() {
            if entry.is_expired(now) {
                warn!(stream = %entry.stream_id, "stream timed out");
                entry.state.lock().status = StreamStatus::Timeout;
            }
        }
        self.streams.retain(|_, entry| {
            let terminal = entry.state.lock().status.is_terminal();
            let drained = entry.connected_clients.load(Ordering::SeqCst) == 0;
            if terminal && drained {
                removed += 1;
                debug!(stream = %entry.stream_id, "stream destroyed");
                false
            } else {
                true
            }
        });
        removed
    }

    /// Reaper loop body; run by an owned worker.
    pub async fn run_reaper(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.cleanup_interval_secs));
        ticker.tick().await;
        info!("stream reaper started");
        loop {
            tokio::select! {
                _ = ticker.tick() => { self.reap(); }
                _ = shutdown.recv() => break,
            }
        }
    }

    /// Close every stream (shutdown cascade).
    pub fn close_all(&self) {
        let ids: Vec<Uuid> = self.streams.iter().map(|e| e.stream_id).collect();
        for stream_id in ids {
            self.close_stream(stream_id);
        }
    }
}

fn is_terminal_event(event: &StreamEvent) -> bool {
    matches!(
        event.event_type,
        SseEventType::Complete | SseEventType::Error
    )
}
