//! Tether store: per-instance ring buffer of conversation frames.
//!
//! `append` assigns the strictly monotonic `seq`, wakes long-poll waiters
//! and live subscribers, and hands the serialized frame to the persistence
//! callback (the registry). `load` restores a persisted tail at boot without
//! re-persisting; the next `seq` continues above the loaded maximum.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};

use aegis_shared::errors::AegisResult;
use aegis_shared::tether::TetherFrame;

/// Default number of frames retained per instance.
pub const DEFAULT_RING_CAPACITY: usize = 1000;
/// Query page size bounds.
pub const DEFAULT_QUERY_LIMIT: usize = 50;
pub const MAX_QUERY_LIMIT: usize = 200;

/// Live-subscriber fanout capacity; lagging subscribers drop old frames.
const SUBSCRIBER_CAP: usize = 256;

/// Persistence hook invoked once per accepted frame with
/// `(instance_id, seq, serialized_frame)`.
pub type PersistFn = Arc<dyn Fn(&str, u64, &str) -> AegisResult<()> + Send + Sync>;

/// Frame selection for `query` and `wait_for_frames`.
#[derive(Debug, Clone, Default)]
pub struct TetherQuery {
    /// Return frames with `seq` strictly greater than this.
    pub after_seq: u64,
    /// Page size; clamped to [`MAX_QUERY_LIMIT`], defaulting to
    /// [`DEFAULT_QUERY_LIMIT`] when zero.
    pub limit: usize,
    pub session_channel: Option<String>,
    pub session_id: Option<String>,
    /// Accept only these frame types when non-empty.
    pub types: HashSet<String>,
    /// Accept only frames whose payload `reply_to` equals this msg id.
    pub reply_to_msg_id: Option<String>,
}

impl TetherQuery {
    fn effective_limit(&self) -> usize {
        match self.limit {
            0 => DEFAULT_QUERY_LIMIT,
            n => n.min(MAX_QUERY_LIMIT),
        }
    }

    fn matches(&self, frame: &TetherFrame) -> bool {
        if frame.seq.unwrap_or(0) <= self.after_seq {
            return false;
        }
        if let Some(channel) = &self.session_channel {
            if &frame.session.channel != channel {
                return false;
            }
        }
        if let Some(id) = &self.session_id {
            if &frame.session.id != id {
                return false;
            }
        }
        if !self.types.is_empty() && !self.types.contains(&frame.frame_type) {
            return false;
        }
        if let Some(reply_to) = &self.reply_to_msg_id {
            if frame.payload.get("reply_to").and_then(|v| v.as_str()) != Some(reply_to.as_str()) {
                return false;
            }
        }
        true
    }
}

struct RingInner {
    frames: VecDeque<TetherFrame>,
    next_seq: u64,
}

/// Ring buffer for a single instance.
pub struct TetherRing {
    instance_id: String,
    capacity: usize,
    inner: Mutex<RingInner>,
    wakeup: Notify,
    subscribers: broadcast::Sender<TetherFrame>,
    persist: PersistFn,
}

impl TetherRing {
    fn new(instance_id: String, capacity: usize, persist: PersistFn) -> Self {
        let (subscribers, _) = broadcast::channel(SUBSCRIBER_CAP);
        Self {
            instance_id,
            capacity,
            inner: Mutex::new(RingInner {
                frames: VecDeque::with_capacity(capacity),
                next_seq: 1,
            }),
            wakeup: Notify::new(),
            subscribers,
            persist,
        }
    }

    /// Accept a frame: assign `seq`, retain, persist, wake waiters.
    pub fn append(&self, mut frame: TetherFrame) -> AegisResult<u64> {
        let seq;
        {
            let mut inner = self.inner.lock();
            seq = inner.next_seq;
            inner.next_seq += 1;
            frame.seq = Some(seq);
            inner.frames.push_back(frame.clone());
            while inner.frames.len() > self.capacity {
                inner.frames.pop_front();
            }
        }

        let serialized = serde_json::to_string(&frame)?;
        (self.persist)(&self.instance_id, seq, &serialized)?;

        let _ = self.subscribers.send(frame);
        self.wakeup.notify_waiters();
        Ok(seq)
    }

    /// Frames strictly after `query.after_seq`, oldest first, up to the
    /// effective limit.
    pub fn query(&self, query: &TetherQuery) -> Vec<TetherFrame> {
        let limit = query.effective_limit();
        let inner = self.inner.lock();
        inner
            .frames
            .iter()
            .filter(|f| query.matches(f))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Event-driven long-poll: returns the first non-empty match, or empty
    /// at the deadline.
    pub async fn wait_for_frames(&self, query: &TetherQuery, timeout: Duration) -> Vec<TetherFrame> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.wakeup.notified();
            tokio::pin!(notified);
            // Register interest before checking so an append between the
            // check and the await is not lost.
            notified.as_mut().enable();

            let hit = self.query(query);
            if !hit.is_empty() {
                return hit;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Vec::new();
            }
        }
    }

    /// Live fanout of every accepted frame.
    pub fn subscribe(&self) -> broadcast::Receiver<TetherFrame> {
        self.subscribers.subscribe()
    }

    /// Restore persisted frames at boot. Persistence is not invoked; the
    /// next `seq` continues above the loaded maximum.
    pub fn load(&self, frames: Vec<TetherFrame>) {
        let mut inner = self.inner.lock();
        let mut max_seq = inner.next_seq - 1;
        for frame in frames {
            if let Some(seq) = frame.seq {
                max_seq = max_seq.max(seq);
            }
            inner.frames.push_back(frame);
        }
        inner
            .frames
            .make_contiguous()
            .sort_by_key(|f| f.seq.unwrap_or(0));
        while inner.frames.len() > self.capacity {
            inner.frames.pop_front();
        }
        inner.next_seq = max_seq + 1;
    }

    /// Highest assigned `seq`, zero before the first append.
    pub fn last_seq(&self) -> u64 {
        self.inner.lock().next_seq - 1
    }
}

/// All per-instance rings, created lazily and dropped on destroy.
#[derive(Clone)]
pub struct TetherBus {
    capacity: usize,
    persist: PersistFn,
    rings: Arc<Mutex<HashMap<String, Arc<TetherRing>>>>,
}

impl TetherBus {
    pub fn new(capacity: usize, persist: PersistFn) -> Self {
        Self {
            capacity,
            persist,
            rings: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Ring for an instance, created on first touch.
    pub fn ring(&self, instance_id: &str) -> Arc<TetherRing> {
        let mut rings = self.rings.lock();
        rings
            .entry(instance_id.to_string())
            .or_insert_with(|| {
                Arc::new(TetherRing::new(
                    instance_id.to_string(),
                    self.capacity,
                    Arc::clone(&self.persist),
                ))
            })
            .clone()
    }

    /// Drop the ring on instance destroy. Persisted frames are the
    /// registry's concern.
    pub fn remove(&self, instance_id: &str) {
        self.rings.lock().remove(instance_id);
    }
}
