//! Fan-out of log entries to live stream subscribers.
//!
//! Each channel owns a [`LogRing`] and a set of subscriber queues behind one mutex. Publishing
//! appends to the ring and offers the entry to every queue with `try_send` while the mutex is
//! held, and attaching snapshots the ring and registers the queue under the same mutex, so a
//! subscriber sees every sequence exactly once across the replay/live boundary. A queue that is
//! full when an entry is offered belongs to a subscriber that fell behind: it is dropped, which
//! ends that subscriber's stream.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use warden_core::{ring::DEFAULT_RING_CAPACITY, Channel, LogEntry, LogRing};

pub const DEFAULT_SUBSCRIBER_BACKLOG: usize = 256;
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub buffer_capacity: usize,
    pub subscriber_backlog: usize,
    pub keepalive_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_RING_CAPACITY,
            subscriber_backlog: DEFAULT_SUBSCRIBER_BACKLOG,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Entry(LogEntry),
    KeepAlive,
}

struct ChannelState {
    ring: LogRing,
    subscribers: HashMap<u64, mpsc::Sender<StreamItem>>,
}

struct HubInner {
    config: HubConfig,
    conn_counter: AtomicU64,
    closed: AtomicBool,
    channels: [Mutex<ChannelState>; 4],
}

#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

fn slot(channel: Channel) -> usize {
    match channel {
        Channel::Server => 0,
        Channel::System => 1,
        Channel::Chat => 2,
        Channel::Connection => 3,
    }
}

/// Offer an item without waiting. Returns false when the subscriber must be dropped.
fn offer(conn_id: u64, sender: &mpsc::Sender<StreamItem>, item: StreamItem) -> bool {
    match sender.try_send(item) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Closed(_)) => false,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(event = "slow_subscriber_dropped", conn_id = conn_id);
            false
        }
    }
}

impl BroadcastHub {
    pub fn new(config: HubConfig) -> Self {
        let channel_state = |channel: Channel| {
            Mutex::new(ChannelState {
                ring: LogRing::new(channel, config.buffer_capacity),
                subscribers: HashMap::new(),
            })
        };
        let channels = Channel::ALL.map(channel_state);
        Self {
            inner: Arc::new(HubInner {
                config,
                conn_counter: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                channels,
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    fn lock(&self, channel: Channel) -> MutexGuard<'_, ChannelState> {
        self.inner.channels[slot(channel)]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_conn_id(&self) -> u64 {
        self.inner.conn_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Append a line to the channel's ring and offer it to every attached subscriber.
    pub fn publish(&self, channel: Channel, text: impl Into<String>, error: bool) -> LogEntry {
        let mut state = self.lock(channel);
        let entry = state.ring.push(text, error);
        let mut dropped = Vec::new();
        for (conn_id, sender) in &state.subscribers {
            if !offer(*conn_id, sender, StreamItem::Entry(entry.clone())) {
                dropped.push(*conn_id);
            }
        }
        for conn_id in dropped {
            state.subscribers.remove(&conn_id);
            debug!(event = "subscriber_removed", channel = %channel, conn_id = conn_id);
        }
        entry
    }

    /// Attach a subscriber that first replays buffered entries newer than `after_sequence`.
    ///
    /// A cursor ahead of the ring (left over from before a service restart) is treated as
    /// absent and the whole buffer is replayed.
    pub fn attach(&self, channel: Channel, after_sequence: Option<u64>) -> Subscription {
        let conn_id = self.next_conn_id();
        let (tx, rx) = mpsc::channel(self.inner.config.subscriber_backlog.max(1));
        let replay = {
            let mut state = self.lock(channel);
            let last = state.ring.last_sequence();
            let after = after_sequence.filter(|seq| *seq <= last);
            let replay = state.ring.after(after);
            if !self.is_closed() {
                state.subscribers.insert(conn_id, tx);
            }
            replay
        };
        info!(
            event = "subscriber_attached",
            channel = %channel,
            conn_id = conn_id,
            after = after_sequence.unwrap_or_default(),
            replay = replay.len()
        );
        Subscription {
            conn_id,
            channel,
            replay: replay.into(),
            rx,
            hub: self.clone(),
        }
    }

    /// Remove a subscriber. Safe to call any number of times.
    pub fn detach(&self, channel: Channel, conn_id: u64) {
        let removed = self.lock(channel).subscribers.remove(&conn_id).is_some();
        if removed {
            info!(event = "subscriber_detached", channel = %channel, conn_id = conn_id);
        }
    }

    pub fn subscriber_count(&self, channel: Channel) -> usize {
        self.lock(channel).subscribers.len()
    }

    pub fn history(&self, channel: Channel, after: Option<u64>, limit: usize) -> Vec<LogEntry> {
        self.lock(channel).ring.tail_after(after, limit)
    }

    pub fn last_sequence(&self, channel: Channel) -> u64 {
        self.lock(channel).ring.last_sequence()
    }

    /// Offer a keep-alive marker to every subscriber. Nothing is stored.
    pub fn send_keepalive(&self) {
        for channel in Channel::ALL {
            let mut state = self.lock(channel);
            state
                .subscribers
                .retain(|conn_id, sender| offer(*conn_id, sender, StreamItem::KeepAlive));
        }
    }

    pub fn spawn_keepalive(self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.inner.config.keepalive_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                    _ = ticker.tick() => {
                        if self.is_closed() {
                            return;
                        }
                        self.send_keepalive();
                    }
                }
            }
        });
    }

    /// Close every subscriber stream and refuse new live attachments.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let mut closed = 0;
        for channel in Channel::ALL {
            let mut state = self.lock(channel);
            closed += state.subscribers.len();
            state.subscribers.clear();
        }
        info!(event = "hub_shutdown", closed = closed);
    }
}

/// One attached viewer. Yields the replay first, then live items; `None` once the hub
/// dropped it (overrun or shutdown). Dropping it detaches.
pub struct Subscription {
    conn_id: u64,
    channel: Channel,
    replay: VecDeque<LogEntry>,
    rx: mpsc::Receiver<StreamItem>,
    hub: BroadcastHub,
}

impl Subscription {
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub async fn next(&mut self) -> Option<StreamItem> {
        if let Some(entry) = self.replay.pop_front() {
            return Some(StreamItem::Entry(entry));
        }
        self.rx.recv().await
    }

    pub fn detach(&self) {
        self.hub.detach(self.channel, self.conn_id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}
