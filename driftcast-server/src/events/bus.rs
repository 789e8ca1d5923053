use chrono::Utc;
use dashmap::DashMap;
use driftcast_model::ServerMessage;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

pub const MAX_SUBSCRIBERS: usize = 1000;
/// Per-subscriber outbound queue bound.
const QUEUE_CAPACITY: usize = 256;
/// Slots reserved for events that must never be dropped.
const STATUS_RESERVED: usize = 32;
const PROGRESS_CAPACITY: usize = QUEUE_CAPACITY - STATUS_RESERVED;
const PING_INTERVAL: Duration = Duration::from_secs(20);
const PONG_DEADLINE: Duration = Duration::from_secs(40);
/// Grace period after queue exhaustion before a non-consuming subscriber is
/// cut loose.
const EXHAUSTED_DISCONNECT: Duration = Duration::from_secs(30);

/// What a subscriber wants to hear about.
#[derive(Debug, Clone)]
pub enum Scope {
    All,
    Jobs(HashSet<Uuid>),
}

impl Scope {
    fn wants(&self, job_id: Uuid) -> bool {
        match self {
            Self::All => true,
            Self::Jobs(set) => set.contains(&job_id),
        }
    }
}

struct EventQueue {
    items: VecDeque<ServerMessage>,
    progress_len: usize,
}

impl EventQueue {
    fn push(&mut self, msg: ServerMessage) {
        if msg.is_droppable() {
            self.progress_len += 1;
        }
        self.items.push_back(msg);
    }

    fn pop(&mut self) -> Option<ServerMessage> {
        let msg = self.items.pop_front()?;
        if msg.is_droppable() {
            self.progress_len -= 1;
        }
        Some(msg)
    }

    /// Remove the oldest droppable event matching `predicate`.
    fn evict_oldest_progress(&mut self, predicate: impl Fn(&ServerMessage) -> bool) -> bool {
        let pos = self
            .items
            .iter()
            .position(|m| m.is_droppable() && predicate(m));
        match pos {
            Some(pos) => {
                self.items.remove(pos);
                self.progress_len -= 1;
                true
            }
            None => false,
        }
    }
}

/// One push-channel consumer. Events flow through a bounded queue the socket
/// task drains; the bus side never blocks on a slow socket.
pub struct Subscriber {
    pub id: Uuid,
    scope: RwLock<Scope>,
    queue: Mutex<EventQueue>,
    notify: Notify,
    dropped: AtomicU64,
    last_pong: Mutex<Instant>,
    exhausted_since: Mutex<Option<Instant>>,
    closed: CancellationToken,
}

impl Subscriber {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            scope: RwLock::new(Scope::Jobs(HashSet::new())),
            queue: Mutex::new(EventQueue {
                items: VecDeque::with_capacity(QUEUE_CAPACITY),
                progress_len: 0,
            }),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            last_pong: Mutex::new(Instant::now()),
            exhausted_since: Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    pub fn subscribe_all(&self) {
        *self.scope.write() = Scope::All;
    }

    pub fn subscribe(&self, job_ids: &[Uuid]) {
        let mut scope = self.scope.write();
        match &mut *scope {
            Scope::All => {}
            Scope::Jobs(set) => set.extend(job_ids.iter().copied()),
        }
    }

    pub fn unsubscribe(&self, job_ids: &[Uuid]) {
        let mut scope = self.scope.write();
        if let Scope::Jobs(set) = &mut *scope {
            for id in job_ids {
                set.remove(id);
            }
        }
    }

    fn wants(&self, job_id: Uuid) -> bool {
        self.scope.read().wants(job_id)
    }

    /// Enqueue an event, applying the overflow policy. Progress events may be
    /// dropped; pings and status changes never are.
    fn enqueue(&self, msg: ServerMessage) {
        let mut queue = self.queue.lock();
        if msg.is_droppable() {
            if queue.progress_len >= PROGRESS_CAPACITY || queue.items.len() >= QUEUE_CAPACITY {
                self.exhausted_since.lock().get_or_insert_with(Instant::now);
                // Oldest buffered progress for jobs outside the current
                // subscription goes first.
                let scope = self.scope.read().clone();
                let evicted = queue.evict_oldest_progress(|m| {
                    m.job_id().is_some_and(|id| !scope.wants(id))
                });
                if evicted {
                    queue.push(msg);
                } else {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            } else {
                queue.push(msg);
            }
        } else {
            // Reserved-class event. If even the reserved headroom is gone,
            // sacrifice the oldest progress event rather than this one.
            if queue.items.len() >= QUEUE_CAPACITY {
                queue.evict_oldest_progress(|_| true);
            }
            queue.push(msg);
        }
        drop(queue);
        self.notify.notify_one();
    }

    /// Await the next event. Returns `None` once the subscriber is closed
    /// and its queue is drained.
    pub async fn next_event(&self) -> Option<ServerMessage> {
        loop {
            {
                let mut queue = self.queue.lock();
                if let Some(msg) = queue.pop() {
                    // The consumer made progress; exhaustion is over.
                    *self.exhausted_since.lock() = None;
                    return Some(msg);
                }
            }
            if self.closed.is_cancelled() {
                return None;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = self.closed.cancelled() => {}
            }
        }
    }

    pub fn mark_pong(&self) {
        *self.last_pong.lock() = Instant::now();
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Rejected registration: the connection cap is reached.
#[derive(Debug)]
pub struct BusFull;

/// Fan-out hub for job progress and status events. The subscriber table is a
/// sharded map; emission walks it without ever holding a shard lock across a
/// queue push.
pub struct ProgressBus {
    subscribers: DashMap<Uuid, Arc<Subscriber>>,
    dropped_total: AtomicU64,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            dropped_total: AtomicU64::new(0),
        }
    }

    pub fn register(&self) -> Result<Arc<Subscriber>, BusFull> {
        if self.subscribers.len() >= MAX_SUBSCRIBERS {
            return Err(BusFull);
        }
        let subscriber = Arc::new(Subscriber::new());
        self.subscribers.insert(subscriber.id, subscriber.clone());
        debug!(subscriber = %subscriber.id, total = self.subscribers.len(), "subscriber registered");
        Ok(subscriber)
    }

    pub fn remove(&self, id: Uuid) {
        if let Some((_, subscriber)) = self.subscribers.remove(&id) {
            self.dropped_total
                .fetch_add(subscriber.dropped_events(), Ordering::Relaxed);
            subscriber.close();
        }
    }

    /// Deliver an event to every subscriber whose scope matches. Ping events
    /// carry no job id and reach everyone.
    pub fn publish(&self, msg: ServerMessage) {
        let targets: Vec<Arc<Subscriber>> = self
            .subscribers
            .iter()
            .filter(|entry| match msg.job_id() {
                Some(job_id) => entry.value().wants(job_id),
                None => true,
            })
            .map(|entry| entry.value().clone())
            .collect();
        for subscriber in targets {
            subscriber.enqueue(msg.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Events dropped across the bus lifetime, including disconnected
    /// subscribers.
    pub fn dropped_total(&self) -> u64 {
        let live: u64 = self
            .subscribers
            .iter()
            .map(|entry| entry.value().dropped_events())
            .sum();
        self.dropped_total.load(Ordering::Relaxed) + live
    }

    /// Heartbeat loop: ping every 20 s, disconnect subscribers that missed
    /// the pong deadline or sat on an exhausted queue too long.
    pub fn spawn_keepalive(self: &Arc<Self>) {
        let bus = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let now = Instant::now();
                let mut stale = Vec::new();
                for entry in bus.subscribers.iter() {
                    let subscriber = entry.value();
                    let pong_overdue =
                        now.duration_since(*subscriber.last_pong.lock()) > PONG_DEADLINE;
                    let starved = subscriber
                        .exhausted_since
                        .lock()
                        .is_some_and(|since| now.duration_since(since) > EXHAUSTED_DISCONNECT);
                    if pong_overdue || starved {
                        warn!(
                            subscriber = %subscriber.id,
                            pong_overdue,
                            starved,
                            "disconnecting unresponsive subscriber"
                        );
                        stale.push(subscriber.id);
                        continue;
                    }
                    subscriber.enqueue(ServerMessage::Ping {
                        server_ts: Utc::now().timestamp_millis(),
                    });
                }
                for id in stale {
                    bus.remove(id);
                }
            }
        });
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}
