//! Session-filtered, reconnect-safe event broadcast.
//!
//! Each subscriber watches exactly one session at a time. Publishing an
//! event delivers it only to subscribers whose active session matches the
//! event's `session_id`.
//!
//! A subscriber that disconnects keeps its slot. Events for its session are
//! queued in a per-subscriber backlog (bounded, oldest evicted first) and
//! flushed in order when it reconnects with the same subscriber id. The
//! same backlog absorbs bursts when a connected subscriber's channel is
//! full; [`Subscription::recv`] refills the channel from it as the observer
//! reads, so per-session ordering holds either way.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::pipeline::{EventRecord, EventSink};

/// Hub sizing.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum envelopes queued per subscriber while it is disconnected or
    /// its channel is full.
    pub backlog_capacity: usize,
    /// Capacity of each connected subscriber's channel.
    pub channel_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            backlog_capacity: 256,
            channel_capacity: 64,
        }
    }
}

/// Message sent to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// `masking_event`, `redaction_event`, `compaction_event`,
    /// `fallback_event`, `over_budget_event`, `budget_event`, or one of the
    /// control replies (`subscribed`, `session_switched`, `pong`).
    #[serde(rename = "type")]
    pub kind: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn from_event(event: &EventRecord) -> Self {
        Self {
            kind: event.event_type().to_string(),
            session_id: event.session_id.clone(),
            timestamp: event.timestamp,
            payload: serde_json::to_value(event).unwrap_or_default(),
        }
    }

    pub fn control(kind: &str, session_id: &str, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.to_string(),
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// First message on a new or resumed connection.
    pub fn subscribed(subscriber_id: &str, session_id: &str, replayed: usize) -> Self {
        Self::control(
            "subscribed",
            session_id,
            serde_json::json!({ "subscriber_id": subscriber_id, "replayed": replayed }),
        )
    }
}

/// Inbound control messages from an observer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    SwitchSession { session_id: String },
    Ping,
}

/// Receiving half handed to a connected observer.
#[derive(Debug)]
pub struct Subscription {
    pub subscriber_id: String,
    pub session_id: String,
    /// Envelopes waiting in the backlog when this subscription was created.
    pub replayed: usize,
    /// Connection number of this subscriber; bumped by every reconnect.
    pub generation: u64,
    pub receiver: mpsc::Receiver<Envelope>,
    hub: Weak<Mutex<HubInner>>,
}

impl Subscription {
    /// Next envelope for this connection, in publish order.
    ///
    /// Moves queued envelopes into the channel before waiting, so a burst
    /// that overflowed the channel is delivered without further publishes.
    /// `None` once the hub closed the channel (the subscriber was removed
    /// or a newer connection took it over).
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.refill();
        self.receiver.recv().await
    }

    fn refill(&self) {
        let Some(inner) = self.hub.upgrade() else {
            return;
        };
        let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner
            .subscribers
            .get(&self.subscriber_id)
            .is_some_and(|s| s.generation == self.generation)
        {
            inner.flush(&self.subscriber_id);
        }
    }
}

/// Hub counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub subscribers: usize,
    pub connected: usize,
    pub sessions: usize,
    pub published: u64,
    pub delivered: u64,
    pub queued: u64,
    pub evicted: u64,
    pub malformed: u64,
}

struct Subscriber {
    session_id: String,
    sender: Option<mpsc::Sender<Envelope>>,
    backlog: VecDeque<Envelope>,
    disconnected_at: Option<Instant>,
    generation: u64,
}

impl Subscriber {
    fn is_connected(&self) -> bool {
        self.sender.is_some()
    }

    fn mark_disconnected(&mut self) {
        self.sender = None;
        self.disconnected_at.get_or_insert_with(Instant::now);
    }
}

#[derive(Default)]
struct HubInner {
    subscribers: HashMap<String, Subscriber>,
    stats: HubStats,
}

impl HubInner {
    /// Queue an envelope, evicting the oldest when the backlog is full.
    fn enqueue(&mut self, id: &str, envelope: Envelope, capacity: usize) {
        let Some(sub) = self.subscribers.get_mut(id) else {
            return;
        };
        if capacity == 0 {
            self.stats.evicted += 1;
            return;
        }
        while sub.backlog.len() >= capacity {
            sub.backlog.pop_front();
            self.stats.evicted += 1;
        }
        sub.backlog.push_back(envelope);
        self.stats.queued += 1;
    }

    /// Push as much of the backlog as the channel accepts. Returns the
    /// number of envelopes sent.
    fn flush(&mut self, id: &str) -> usize {
        let Some(sub) = self.subscribers.get_mut(id) else {
            return 0;
        };
        let mut sent = 0;
        while let Some(front) = sub.backlog.front() {
            let Some(sender) = sub.sender.as_ref() else {
                break;
            };
            match sender.try_send(front.clone()) {
                Ok(()) => {
                    sub.backlog.pop_front();
                    sent += 1;
                }
                Err(TrySendError::Full(_)) => break,
                Err(TrySendError::Closed(_)) => {
                    debug!("Subscriber {id} channel closed during flush");
                    sub.mark_disconnected();
                    break;
                }
            }
        }
        self.stats.delivered += sent as u64;
        sent
    }

    fn deliver(&mut self, id: &str, envelope: Envelope, capacity: usize) -> bool {
        let Some(sub) = self.subscribers.get_mut(id) else {
            return false;
        };
        if sub.backlog.is_empty()
            && let Some(sender) = sub.sender.as_ref()
        {
            match sender.try_send(envelope) {
                Ok(()) => {
                    self.stats.delivered += 1;
                    return true;
                }
                Err(TrySendError::Full(envelope)) => {
                    self.enqueue(id, envelope, capacity);
                    return false;
                }
                Err(TrySendError::Closed(envelope)) => {
                    debug!("Subscriber {id} went away; queueing");
                    sub.mark_disconnected();
                    self.enqueue(id, envelope, capacity);
                    return false;
                }
            }
        }
        self.enqueue(id, envelope, capacity);
        self.flush(id) > 0
    }
}

/// Session-scoped broadcast hub. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TelemetryHub {
    inner: Arc<Mutex<HubInner>>,
    config: HubConfig,
}

impl Default for TelemetryHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

impl TelemetryHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner::default())),
            config,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn channel(&self) -> (mpsc::Sender<Envelope>, mpsc::Receiver<Envelope>) {
        mpsc::channel(self.config.channel_capacity.max(1))
    }

    /// Register a new subscriber watching `session_id`.
    pub fn subscribe(&self, session_id: &str) -> Subscription {
        let id = format!("sub_{}", uuid::Uuid::now_v7().simple());
        let (tx, rx) = self.channel();
        self.lock().subscribers.insert(
            id.clone(),
            Subscriber {
                session_id: session_id.to_string(),
                sender: Some(tx),
                backlog: VecDeque::new(),
                disconnected_at: None,
                generation: 0,
            },
        );
        debug!("Subscriber {id} watching session {session_id}");
        Subscription {
            subscriber_id: id,
            session_id: session_id.to_string(),
            replayed: 0,
            generation: 0,
            receiver: rx,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Resume a known subscriber with a fresh channel, flushing whatever
    /// was queued while it was away. Any previous connection's channel is
    /// closed. `None` for unknown ids (never issued, unsubscribed or
    /// reaped).
    pub fn reconnect(&self, subscriber_id: &str) -> Option<Subscription> {
        let (tx, rx) = self.channel();
        let mut inner = self.lock();
        let sub = inner.subscribers.get_mut(subscriber_id)?;
        sub.sender = Some(tx);
        sub.disconnected_at = None;
        sub.generation += 1;
        let generation = sub.generation;
        let session_id = sub.session_id.clone();
        let replayed = sub.backlog.len();
        inner.flush(subscriber_id);
        info!("Subscriber {subscriber_id} reconnected to {session_id}; replaying {replayed}");
        Some(Subscription {
            subscriber_id: subscriber_id.to_string(),
            session_id,
            replayed,
            generation,
            receiver: rx,
            hub: Arc::downgrade(&self.inner),
        })
    }

    /// Mark a subscriber's connection `generation` disconnected. Its events
    /// queue until it reconnects or is reaped. Returns `false` for unknown
    /// ids and for a generation a later reconnect has replaced.
    pub fn disconnect(&self, subscriber_id: &str, generation: u64) -> bool {
        let mut inner = self.lock();
        match inner.subscribers.get_mut(subscriber_id) {
            Some(sub) if sub.generation == generation => {
                sub.mark_disconnected();
                debug!("Subscriber {subscriber_id} disconnected");
                true
            }
            Some(_) => {
                debug!(
                    "Ignoring disconnect of replaced connection {generation} for {subscriber_id}"
                );
                false
            }
            None => false,
        }
    }

    /// Forget a subscriber entirely, dropping its backlog.
    pub fn unsubscribe(&self, subscriber_id: &str) -> bool {
        self.lock().subscribers.remove(subscriber_id).is_some()
    }

    /// Point a subscriber at another session. Anything still queued for the
    /// previous session is dropped.
    pub fn switch_session(&self, subscriber_id: &str, session_id: &str) -> bool {
        let mut inner = self.lock();
        match inner.subscribers.get_mut(subscriber_id) {
            Some(sub) => {
                sub.session_id = session_id.to_string();
                sub.backlog.clear();
                debug!("Subscriber {subscriber_id} switched to session {session_id}");
                true
            }
            None => false,
        }
    }

    pub fn session_of(&self, subscriber_id: &str) -> Option<String> {
        self.lock()
            .subscribers
            .get(subscriber_id)
            .map(|s| s.session_id.clone())
    }

    /// Deliver an event to every subscriber watching its session. Returns
    /// the number of subscribers it was sent to immediately (the rest, if
    /// any, have it queued).
    pub fn publish(&self, event: &EventRecord) -> usize {
        self.publish_envelope(Envelope::from_event(event))
    }

    pub fn publish_envelope(&self, envelope: Envelope) -> usize {
        let capacity = self.config.backlog_capacity;
        let mut inner = self.lock();
        inner.stats.published += 1;
        let targets: Vec<String> = inner
            .subscribers
            .iter()
            .filter(|(_, s)| s.session_id == envelope.session_id)
            .map(|(id, _)| id.clone())
            .collect();
        let mut sent = 0;
        for id in targets {
            if inner.deliver(&id, envelope.clone(), capacity) {
                sent += 1;
            }
        }
        sent
    }

    /// Apply an inbound control message. Malformed input is logged and
    /// dropped. Returns the reply to send back, if any.
    pub fn handle_control(&self, subscriber_id: &str, text: &str) -> Option<Envelope> {
        let message = match serde_json::from_str::<ControlMessage>(text) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    "Dropping malformed control message from {subscriber_id}: {e} ({})",
                    crate::preview(text, 120)
                );
                self.lock().stats.malformed += 1;
                return None;
            }
        };
        match message {
            ControlMessage::SwitchSession { session_id } => {
                if self.switch_session(subscriber_id, &session_id) {
                    Some(Envelope::control(
                        "session_switched",
                        &session_id,
                        serde_json::Value::Null,
                    ))
                } else {
                    warn!("Control message for unknown subscriber {subscriber_id}");
                    None
                }
            }
            ControlMessage::Ping => {
                let session = self.session_of(subscriber_id)?;
                Some(Envelope::control("pong", &session, serde_json::Value::Null))
            }
        }
    }

    /// Drop subscribers that have been disconnected for longer than
    /// `max_idle`. Returns how many were removed.
    pub fn reap_disconnected(&self, max_idle: Duration) -> usize {
        let mut inner = self.lock();
        let before = inner.subscribers.len();
        inner
            .subscribers
            .retain(|_, s| s.disconnected_at.is_none_or(|at| at.elapsed() <= max_idle));
        let reaped = before - inner.subscribers.len();
        if reaped > 0 {
            info!("Reaped {reaped} idle subscriber(s)");
        }
        reaped
    }

    pub fn stats(&self) -> HubStats {
        let inner = self.lock();
        let sessions: HashSet<&str> = inner
            .subscribers
            .values()
            .map(|s| s.session_id.as_str())
            .collect();
        let connected = inner
            .subscribers
            .values()
            .filter(|s| s.is_connected())
            .count();
        HubStats {
            subscribers: inner.subscribers.len(),
            connected,
            sessions: sessions.len(),
            ..inner.stats.clone()
        }
    }
}

impl EventSink for TelemetryHub {
    fn emit(&self, event: &EventRecord) {
        self.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Outcome, Stage};

    fn event(session: &str, tokens_after: usize) -> EventRecord {
        EventRecord {
            stage: Stage::Sanitize,
            session_id: session.into(),
            timestamp: Utc::now(),
            tokens_before: 1000,
            tokens_after,
            outcome: Outcome::Reduced,
            model: "m".into(),
            limit: 800,
            reserved: 0,
            warnings: vec![],
            detail: serde_json::Value::Null,
        }
    }

    fn drain(sub: &mut Subscription) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(e) = sub.receiver.try_recv() {
            out.push(e);
        }
        out
    }

    fn tokens_after(envelopes: &[Envelope]) -> Vec<u64> {
        envelopes
            .iter()
            .map(|e| e.payload["tokens_after"].as_u64().unwrap())
            .collect()
    }

    #[test]
    fn events_are_filtered_by_session() {
        let hub = TelemetryHub::default();
        let mut a = hub.subscribe("A");
        let mut b = hub.subscribe("B");

        assert_eq!(hub.publish(&event("A", 1)), 1);
        hub.publish(&event("B", 2));
        hub.publish(&event("C", 3));

        let got_a = drain(&mut a);
        let got_b = drain(&mut b);
        assert_eq!(got_a.len(), 1);
        assert_eq!(got_a[0].session_id, "A");
        assert_eq!(got_a[0].kind, "masking_event");
        assert_eq!(got_b.len(), 1);
        assert_eq!(got_b[0].session_id, "B");
    }

    #[test]
    fn backlog_flushes_in_order_on_reconnect() {
        let hub = TelemetryHub::default();
        let sub = hub.subscribe("A");
        let id = sub.subscriber_id.clone();
        assert!(hub.disconnect(&id, sub.generation));

        for n in 1..=3 {
            hub.publish(&event("A", n));
        }
        assert_eq!(hub.stats().queued, 3);

        let mut resumed = hub.reconnect(&id).unwrap();
        assert_eq!(resumed.replayed, 3);
        assert_eq!(tokens_after(&drain(&mut resumed)), vec![1, 2, 3]);

        hub.publish(&event("A", 4));
        assert_eq!(tokens_after(&drain(&mut resumed)), vec![4]);
    }

    #[test]
    fn backlog_evicts_oldest_first() {
        let hub = TelemetryHub::new(HubConfig {
            backlog_capacity: 2,
            channel_capacity: 8,
        });
        let sub = hub.subscribe("A");
        let id = sub.subscriber_id.clone();
        hub.disconnect(&id, sub.generation);
        for n in 1..=5 {
            hub.publish(&event("A", n));
        }
        let mut resumed = hub.reconnect(&id).unwrap();
        assert_eq!(tokens_after(&drain(&mut resumed)), vec![4, 5]);
        assert_eq!(hub.stats().evicted, 3);
    }

    #[test]
    fn dropped_receiver_is_detected_and_queued() {
        let hub = TelemetryHub::default();
        let sub = hub.subscribe("A");
        let id = sub.subscriber_id.clone();
        drop(sub);

        assert_eq!(hub.publish(&event("A", 7)), 0);
        assert_eq!(hub.stats().connected, 0);
        let mut resumed = hub.reconnect(&id).unwrap();
        assert_eq!(tokens_after(&drain(&mut resumed)), vec![7]);
    }

    #[test]
    fn full_channel_spills_into_backlog_without_reordering() {
        let hub = TelemetryHub::new(HubConfig {
            backlog_capacity: 16,
            channel_capacity: 2,
        });
        let mut sub = hub.subscribe("A");
        for n in 1..=4 {
            hub.publish(&event("A", n));
        }
        assert_eq!(tokens_after(&drain(&mut sub)), vec![1, 2]);
        hub.publish(&event("A", 5));
        let mut got = drain(&mut sub);
        hub.publish(&event("A", 6));
        got.extend(drain(&mut sub));
        assert_eq!(tokens_after(&got), vec![3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn reading_drains_an_overflowed_burst_without_more_publishes() {
        let hub = TelemetryHub::new(HubConfig {
            backlog_capacity: 16,
            channel_capacity: 2,
        });
        let mut sub = hub.subscribe("A");
        for n in 1..=5 {
            hub.publish(&event("A", n));
        }

        let mut got = Vec::new();
        while let Ok(Some(envelope)) =
            tokio::time::timeout(Duration::from_millis(300), sub.recv()).await
        {
            got.push(envelope);
        }
        assert_eq!(tokens_after(&got), vec![1, 2, 3, 4, 5]);
        let stats = hub.stats();
        assert_eq!(stats.delivered, 5);
        assert_eq!(stats.connected, 1);
    }

    #[tokio::test]
    async fn replay_larger_than_the_channel_arrives_in_full() {
        let hub = TelemetryHub::new(HubConfig {
            backlog_capacity: 16,
            channel_capacity: 2,
        });
        let sub = hub.subscribe("A");
        let id = sub.subscriber_id.clone();
        hub.disconnect(&id, sub.generation);
        for n in 1..=4 {
            hub.publish(&event("A", n));
        }

        let mut resumed = hub.reconnect(&id).unwrap();
        assert_eq!(resumed.replayed, 4);
        let mut got = Vec::new();
        for _ in 0..4 {
            got.push(resumed.recv().await.unwrap());
        }
        assert_eq!(tokens_after(&got), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn stale_disconnect_leaves_the_resumed_connection_alone() {
        let hub = TelemetryHub::default();
        let old = hub.subscribe("A");
        let id = old.subscriber_id.clone();

        let mut resumed = hub.reconnect(&id).unwrap();
        assert_eq!(resumed.generation, old.generation + 1);
        assert!(!hub.disconnect(&id, old.generation));
        assert_eq!(hub.stats().connected, 1);

        assert_eq!(hub.publish(&event("A", 9)), 1);
        assert_eq!(tokens_after(&drain(&mut resumed)), vec![9]);

        // The replaced connection's channel is closed.
        let mut old = old;
        assert!(old.recv().await.is_none());
        assert!(hub.disconnect(&id, resumed.generation));
    }

    #[test]
    fn switch_session_changes_filter_and_drops_old_backlog() {
        let hub = TelemetryHub::default();
        let sub = hub.subscribe("A");
        let id = sub.subscriber_id.clone();
        hub.disconnect(&id, sub.generation);
        hub.publish(&event("A", 1));

        let reply = hub
            .handle_control(&id, r#"{"type":"switch_session","session_id":"B"}"#)
            .unwrap();
        assert_eq!(reply.kind, "session_switched");
        assert_eq!(hub.session_of(&id).as_deref(), Some("B"));

        let mut resumed = hub.reconnect(&id).unwrap();
        assert_eq!(resumed.replayed, 0);
        hub.publish(&event("A", 2));
        hub.publish(&event("B", 3));
        assert_eq!(tokens_after(&drain(&mut resumed)), vec![3]);
    }

    #[test]
    fn malformed_control_is_dropped() {
        let hub = TelemetryHub::default();
        let id = hub.subscribe("A").subscriber_id;
        assert!(hub.handle_control(&id, "not json").is_none());
        assert!(hub.handle_control(&id, r#"{"type":"explode"}"#).is_none());
        assert_eq!(hub.stats().malformed, 2);

        let pong = hub.handle_control(&id, r#"{"type":"ping"}"#).unwrap();
        assert_eq!(pong.kind, "pong");
        assert_eq!(pong.session_id, "A");
    }

    #[test]
    fn reap_removes_only_idle_disconnected() {
        let hub = TelemetryHub::default();
        let _live = hub.subscribe("A");
        let gone = hub.subscribe("A").subscriber_id;
        hub.disconnect(&gone, 0);

        assert_eq!(hub.reap_disconnected(Duration::from_secs(3600)), 0);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(hub.reap_disconnected(Duration::from_millis(1)), 1);
        assert!(hub.reconnect(&gone).is_none());
        let stats = hub.stats();
        assert_eq!(stats.subscribers, 1);
        assert_eq!(stats.sessions, 1);
    }

    #[test]
    fn envelope_wire_shape() {
        let env = Envelope::from_event(&event("A", 5));
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "masking_event");
        assert_eq!(json["session_id"], "A");
        assert!(json["timestamp"].is_string());
        assert_eq!(json["payload"]["stage"], "sanitize");
    }
}
