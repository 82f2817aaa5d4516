//! In-process publish/subscribe event bus (spec §4.3) — C3
//!
//! One `tokio::sync::broadcast` channel per subject, registered lazily in a
//! `DashMap` so publishers and subscribers never need to coordinate creation
//! order. Grounded on the axum chat-room broadcast-channel pattern this
//! corpus's teacher uses for its websocket handler (`handlers/ws.rs`),
//! generalised from one fixed room channel to a keyed registry of subjects.
//!
//! Every event carries a per-subject monotonic `sequence` so a subscriber
//! can detect gaps. A subscriber that falls behind the channel's bounded
//! capacity receives `RecvError::Lagged`; we surface that as a synthetic
//! `Overflow` event rather than silently resuming, per spec §4.3's
//! overflow-marker requirement.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub subject: String,
    pub sequence: u64,
    pub payload: serde_json::Value,
    #[serde(rename = "sentAt")]
    pub sent_at: DateTime<Utc>,
}

impl Envelope {
    /// A synthetic marker delivered in place of events a lagging subscriber
    /// missed. `sequence` is the bus's next sequence at the time of
    /// detection, not the sequence of any particular dropped event.
    fn overflow(subject: &str, sequence: u64, sent_at: DateTime<Utc>) -> Self {
        Self {
            subject: subject.to_string(),
            sequence,
            payload: serde_json::json!({ "type": "overflow" }),
            sent_at,
        }
    }
}

struct Subject {
    tx: broadcast::Sender<Envelope>,
    sequence: AtomicU64,
}

/// Subject name builders for the fixed subjects the spec enumerates
/// (§4.3): `room.<roomId>.state`, `.ticks`, `.animation`, `.result`,
/// `user.<userId>.balance`, `global.result`.
pub mod subjects {
    use crate::models::{RoomId, UserId};

    pub fn room_state(room_id: RoomId) -> String {
        format!("room.{room_id}.state")
    }
    pub fn room_ticks(room_id: RoomId) -> String {
        format!("room.{room_id}.ticks")
    }
    pub fn room_animation(room_id: RoomId) -> String {
        format!("room.{room_id}.animation")
    }
    pub fn room_result(room_id: RoomId) -> String {
        format!("room.{room_id}.result")
    }
    pub fn user_balance(user_id: UserId) -> String {
        format!("user.{user_id}.balance")
    }
    pub fn global_result() -> String {
        "global.result".to_string()
    }
}

#[derive(Clone, Default)]
pub struct EventBus {
    subjects: Arc<DashMap<String, Subject>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn subject_entry(&self, subject: &str) -> dashmap::mapref::one::Ref<'_, String, Subject> {
        if let Some(entry) = self.subjects.get(subject) {
            return entry;
        }
        self.subjects.entry(subject.to_string()).or_insert_with(|| {
            let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
            Subject {
                tx,
                sequence: AtomicU64::new(0),
            }
        });
        self.subjects.get(subject).expect("just inserted")
    }

    /// Publish `payload` on `subject`, assigning the next sequence number.
    /// A send with no active subscribers is not an error.
    pub fn publish(&self, subject: &str, payload: serde_json::Value) {
        let entry = self.subject_entry(subject);
        let sequence = entry.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let envelope = Envelope {
            subject: subject.to_string(),
            sequence,
            payload,
            sent_at: Utc::now(),
        };
        let _ = entry.tx.send(envelope);
    }

    pub fn subscribe(&self, subject: &str) -> Subscription {
        let entry = self.subject_entry(subject);
        Subscription {
            subject: subject.to_string(),
            rx: entry.tx.subscribe(),
        }
    }
}

pub struct Subscription {
    subject: String,
    rx: broadcast::Receiver<Envelope>,
}

impl Subscription {
    /// Await the next event on this subject. A lag is translated into one
    /// synthetic overflow envelope rather than propagated as an error;
    /// the next call resumes from the channel's current tail.
    pub async fn recv(&mut self) -> Envelope {
        loop {
            match self.rx.recv().await {
                Ok(envelope) => return envelope,
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    return Envelope::overflow(&self.subject, 0, Utc::now());
                }
                Err(broadcast::error::RecvError::Closed) => {
                    std::future::pending::<()>().await;
                    unreachable!("broadcast sender lives as long as the EventBus entry");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_assigns_increasing_sequence() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("room.test.state");
        bus.publish("room.test.state", serde_json::json!({"n": 1}));
        bus.publish("room.test.state", serde_json::json!({"n": 2}));

        let first = sub.recv().await;
        let second = sub.recv().await;
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
    }

    #[tokio::test]
    async fn subscribe_before_publish_does_not_miss_events() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("global.result");
        bus.publish("global.result", serde_json::json!({"win": true}));
        let envelope = sub.recv().await;
        assert_eq!(envelope.subject, "global.result");
    }

    #[tokio::test]
    async fn lag_surfaces_as_overflow_marker() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("room.test.ticks");
        for n in 0..(CHANNEL_CAPACITY as i64 + 10) {
            bus.publish("room.test.ticks", serde_json::json!({"n": n}));
        }
        let envelope = sub.recv().await;
        assert_eq!(envelope.payload["type"], "overflow");
    }
}
