//! Process-wide state and the room-scheduler registry.
//!
//! Generalizes the teacher's single `Arc<SolanaService>` field into the
//! full set of core components (spec §2's cooperating components), all
//! cheaply `Clone`-able and shared across handlers via axum's `State`
//! extractor, same as the teacher's own `AppState`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::cache::{hot_reads::CacheStats, Cache};
use crate::config::AppConfig;
use crate::dispatcher::Dispatcher;
use crate::eventbus::EventBus;
use crate::ledger::Ledger;
use crate::models::{Room, RoomId};
use crate::queue::PayoutQueue;
use crate::scheduler::{self, SchedulerHandle};
use crate::session::SessionAuthority;



/// Owns one [`SchedulerHandle`] per active room, spawning the backing
/// task lazily on first use. Mirrors the registry shape already used for
/// the event bus's per-subject channels and the dispatcher's per-user
/// locks: a `DashMap` keyed by id, populated on demand.
#[derive(Clone)]
pub struct RoomRegistry {
    handles: Arc<DashMap<RoomId, SchedulerHandle>>,
    ledger: Ledger,
    events: EventBus,
    queue: PayoutQueue,
    countdown: Duration,
    linger: Duration,
    watchdog: Duration,
}

impl RoomRegistry {
    pub fn new(
        ledger: Ledger,
        events: EventBus,
        queue: PayoutQueue,
        countdown: Duration,
        linger: Duration,
        watchdog: Duration,
    ) -> Self {
        Self {
            handles: Arc::new(DashMap::new()),
            ledger,
            events,
            queue,
            countdown,
            linger,
            watchdog,
        }
    }

    pub fn get(&self, room_id: RoomId) -> Option<SchedulerHandle> {
        self.handles.get(&room_id).map(|h| h.clone())
    }

    /// Return the handle for `room`, spawning its scheduler task if this
    /// is the first time the room has been touched this process lifetime.
    pub fn ensure_spawned(&self, room: Room) -> SchedulerHandle {
        if let Some(handle) = self.get(room.id) {
            return handle;
        }
        let handle = scheduler::spawn(
            room.clone(),
            self.ledger.clone(),
            self.events.clone(),
            self.queue.clone(),
            self.countdown,
            self.linger,
            self.watchdog,
        );
        self.handles.insert(room.id, handle.clone());
        handle
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub ledger: Ledger,
    pub cache: Cache,
    /// Hit/miss/eviction counters for the C9 hot-read cache, shared across
    /// every component that touches it. Surfaced read-only via
    /// `GET /debug/cache-stats`.
    pub cache_stats: Arc<CacheStats>,
    pub events: EventBus,
    pub rooms: RoomRegistry,
    pub queue: PayoutQueue,
    pub session: SessionAuthority,
    pub dispatcher: Dispatcher,
}

impl AppState {
    pub fn new(config: AppConfig, ledger: Ledger, cache: Cache) -> Self {
        let config = Arc::new(config);
        let events = EventBus::new();
        let queue = PayoutQueue::new(
            ledger.clone(),
            events.clone(),
            config.queue_concurrency,
            config.queue_max_attempts,
            config.queue_initial_backoff,
            config.queue_backoff_factor,
        );
        let rooms = RoomRegistry::new(
            ledger.clone(),
            events.clone(),
            queue.clone(),
            Duration::from_secs(config.room_defaults.countdown_secs),
            Duration::from_secs(config.room_defaults.linger_secs),
            Duration::from_secs(config.room_defaults.watchdog_secs),
        );
        let session = SessionAuthority::new(
            config.session_signing_key.clone(),
            cache.clone(),
            config.session_ttl,
        );
        let dispatcher = Dispatcher::new(cache.clone(), config.idempotency_ttl);

        Self {
            config,
            ledger,
            cache,
            cache_stats: Arc::new(CacheStats::default()),
            events,
            rooms,
            queue,
            session,
            dispatcher,
        }
    }
}
