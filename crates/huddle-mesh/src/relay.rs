//! Publish/subscribe transport underneath the signaling channel.
//!
//! A relay carries opaque text frames on named topics and tracks which
//! identities are present on each topic. Delivery is best-effort and
//! at-most-once; nothing is acknowledged or retried.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::MeshError;

/// Presence as reported by the relay itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceUpdate {
    /// Full roster of tracked identities on the topic.
    Sync(Vec<String>),
    Join(Vec<String>),
    Leave(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Presence(PresenceUpdate),
    Message(String),
}

/// Outbound half of a subscription.
pub trait RelaySink: Send {
    /// Start tracking `identity` as present on the topic.
    fn track(&mut self, identity: &str) -> Result<(), MeshError>;
    /// Broadcast a frame to every other subscriber of the topic.
    fn publish(&mut self, text: String) -> Result<(), MeshError>;
    /// Leave the topic. Idempotent.
    fn close(&mut self);
}

/// One live subscription to a relay topic.
pub struct RelaySubscription {
    topic: String,
    sink: Box<dyn RelaySink>,
    frames: mpsc::UnboundedReceiver<RelayFrame>,
    closed: bool,
}

impl RelaySubscription {
    pub fn new(
        topic: String,
        sink: Box<dyn RelaySink>,
        frames: mpsc::UnboundedReceiver<RelayFrame>,
    ) -> Self {
        Self {
            topic,
            sink,
            frames,
            closed: false,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn track(&mut self, identity: &str) -> Result<(), MeshError> {
        if self.closed {
            return Err(MeshError::RelayUnavailable("subscription closed".into()));
        }
        self.sink.track(identity)
    }

    pub fn publish(&mut self, text: String) -> Result<(), MeshError> {
        if self.closed {
            return Err(MeshError::RelayUnavailable("subscription closed".into()));
        }
        self.sink.publish(text)
    }

    /// Next inbound frame. `None` once the relay has dropped the subscription.
    pub async fn recv(&mut self) -> Option<RelayFrame> {
        if self.closed {
            return None;
        }
        self.frames.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.sink.close();
            self.frames.close();
        }
    }
}

impl Drop for RelaySubscription {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
pub trait SignalRelay: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<RelaySubscription, MeshError>;
}

type DropFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// In-process relay hub shared by every participant of a simulation.
#[derive(Clone)]
pub struct MemoryRelay {
    hub: Arc<Mutex<Hub>>,
}

struct Hub {
    available: bool,
    subscribe_delay: Duration,
    next_member: u64,
    topics: HashMap<String, HashMap<u64, Member>>,
    drop_filter: Option<DropFilter>,
}

struct Member {
    tx: mpsc::UnboundedSender<RelayFrame>,
    identity: Option<String>,
}

impl Hub {
    fn roster(&self, topic: &str) -> Vec<String> {
        let Some(members) = self.topics.get(topic) else {
            return Vec::new();
        };
        members
            .values()
            .filter_map(|m| m.identity.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn broadcast(&self, topic: &str, frame: &RelayFrame, except: Option<u64>) {
        if let Some(members) = self.topics.get(topic) {
            for (id, member) in members {
                if Some(*id) != except {
                    let _ = member.tx.send(frame.clone());
                }
            }
        }
    }

    fn broadcast_presence(&self, topic: &str, delta: PresenceUpdate) {
        self.broadcast(topic, &RelayFrame::Presence(delta), None);
        let sync = PresenceUpdate::Sync(self.roster(topic));
        self.broadcast(topic, &RelayFrame::Presence(sync), None);
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub {
                available: true,
                subscribe_delay: Duration::ZERO,
                next_member: 0,
                topics: HashMap::new(),
                drop_filter: None,
            })),
        }
    }

    /// While unavailable, subscribe/track/publish fail with
    /// [`MeshError::RelayUnavailable`].
    pub fn set_available(&self, available: bool) {
        self.hub.lock().available = available;
    }

    pub fn set_subscribe_delay(&self, delay: Duration) {
        self.hub.lock().subscribe_delay = delay;
    }

    /// Silently drop every published frame for which `filter` returns true.
    pub fn drop_messages_where(&self, filter: impl Fn(&str) -> bool + Send + Sync + 'static) {
        self.hub.lock().drop_filter = Some(Arc::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        self.hub.lock().drop_filter = None;
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.hub.lock().topics.get(topic).map_or(0, HashMap::len)
    }

    pub fn roster(&self, topic: &str) -> Vec<String> {
        self.hub.lock().roster(topic)
    }

    /// Simulate an outage: drop every subscription and refuse new ones.
    pub fn disconnect_all(&self) {
        let mut hub = self.hub.lock();
        hub.available = false;
        hub.topics.clear();
        tracing::warn!("memory relay disconnected all subscribers");
    }
}

#[async_trait]
impl SignalRelay for MemoryRelay {
    async fn subscribe(&self, topic: &str) -> Result<RelaySubscription, MeshError> {
        let delay = self.hub.lock().subscribe_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let member = {
            let mut hub = self.hub.lock();
            if !hub.available {
                return Err(MeshError::RelayUnavailable(format!(
                    "cannot subscribe to {topic}"
                )));
            }
            let id = hub.next_member;
            hub.next_member += 1;
            let roster = hub.roster(topic);
            let _ = tx.send(RelayFrame::Presence(PresenceUpdate::Sync(roster)));
            hub.topics
                .entry(topic.to_string())
                .or_default()
                .insert(id, Member { tx, identity: None });
            id
        };

        tracing::debug!(topic = %topic, member, "relay subscription opened");
        let sink = MemorySink {
            hub: Arc::clone(&self.hub),
            topic: topic.to_string(),
            member,
            closed: false,
        };
        Ok(RelaySubscription::new(topic.to_string(), Box::new(sink), rx))
    }
}

struct MemorySink {
    hub: Arc<Mutex<Hub>>,
    topic: String,
    member: u64,
    closed: bool,
}

impl MemorySink {
    fn unavailable(&self) -> MeshError {
        MeshError::RelayUnavailable(format!("relay dropped {}", self.topic))
    }
}

impl RelaySink for MemorySink {
    fn track(&mut self, identity: &str) -> Result<(), MeshError> {
        let mut hub = self.hub.lock();
        if !hub.available {
            return Err(self.unavailable());
        }
        let member = hub
            .topics
            .get_mut(&self.topic)
            .and_then(|members| members.get_mut(&self.member))
            .ok_or_else(|| self.unavailable())?;
        member.identity = Some(identity.to_string());
        hub.broadcast_presence(&self.topic, PresenceUpdate::Join(vec![identity.to_string()]));
        Ok(())
    }

    fn publish(&mut self, text: String) -> Result<(), MeshError> {
        let hub = self.hub.lock();
        if !hub.available {
            return Err(self.unavailable());
        }
        if hub.drop_filter.as_ref().is_some_and(|filter| filter(&text)) {
            tracing::trace!(topic = %self.topic, "memory relay dropped frame");
            return Ok(());
        }
        hub.broadcast(&self.topic, &RelayFrame::Message(text), Some(self.member));
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let mut hub = self.hub.lock();
        let Some(members) = hub.topics.get_mut(&self.topic) else {
            return;
        };
        let removed = members.remove(&self.member);
        if members.is_empty() {
            hub.topics.remove(&self.topic);
        }

        if let Some(identity) = removed.and_then(|m| m.identity) {
            if !hub.roster(&self.topic).contains(&identity) {
                hub.broadcast_presence(&self.topic, PresenceUpdate::Leave(vec![identity]));
            }
        }
        tracing::debug!(topic = %self.topic, member = self.member, "relay subscription closed");
    }
}

impl Drop for MemorySink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_message(sub: &mut RelaySubscription) -> String {
        loop {
            match sub.recv().await {
                Some(RelayFrame::Message(text)) => return text,
                Some(RelayFrame::Presence(_)) => {}
                None => panic!("subscription ended"),
            }
        }
    }

    #[tokio::test]
    async fn subscribe_receives_initial_sync() {
        let relay = MemoryRelay::new();
        let mut a = relay.subscribe("voice:c1").await.unwrap();
        a.track("alice").unwrap();

        let mut b = relay.subscribe("voice:c1").await.unwrap();
        assert_eq!(
            b.recv().await,
            Some(RelayFrame::Presence(PresenceUpdate::Sync(vec!["alice".into()])))
        );
        assert_eq!(relay.subscriber_count("voice:c1"), 2);
    }

    #[tokio::test]
    async fn publish_skips_sender_and_other_topics() {
        let relay = MemoryRelay::new();
        let mut a = relay.subscribe("voice:c1").await.unwrap();
        let mut b = relay.subscribe("voice:c1").await.unwrap();
        let mut other = relay.subscribe("voice:c2").await.unwrap();

        a.publish("hello".into()).unwrap();
        assert_eq!(next_message(&mut b).await, "hello");

        b.publish("back".into()).unwrap();
        assert_eq!(next_message(&mut a).await, "back");

        other.close();
        assert_eq!(relay.subscriber_count("voice:c2"), 0);
    }

    #[tokio::test]
    async fn close_announces_leave_once() {
        let relay = MemoryRelay::new();
        let mut a = relay.subscribe("voice:c1").await.unwrap();
        let mut b = relay.subscribe("voice:c1").await.unwrap();
        b.track("bob").unwrap();
        b.close();
        b.close();

        let mut leaves = 0;
        while let Ok(frame) = a.frames.try_recv() {
            if frame == RelayFrame::Presence(PresenceUpdate::Leave(vec!["bob".into()])) {
                leaves += 1;
            }
        }
        assert_eq!(leaves, 1);
        assert!(relay.roster("voice:c1").is_empty());
    }

    #[tokio::test]
    async fn outage_ends_subscriptions() {
        let relay = MemoryRelay::new();
        let mut a = relay.subscribe("voice:c1").await.unwrap();
        let _ = a.recv().await;
        relay.disconnect_all();
        assert_eq!(a.recv().await, None);
        assert!(matches!(
            relay.subscribe("voice:c1").await,
            Err(MeshError::RelayUnavailable(_))
        ));
        assert!(a.publish("x".into()).is_err());
    }

    #[tokio::test]
    async fn drop_filter_loses_matching_frames() {
        let relay = MemoryRelay::new();
        let mut a = relay.subscribe("t").await.unwrap();
        let mut b = relay.subscribe("t").await.unwrap();
        relay.drop_messages_where(|text| text.starts_with("lost"));
        a.publish("lost one".into()).unwrap();
        a.publish("kept".into()).unwrap();
        assert_eq!(next_message(&mut b).await, "kept");

        relay.clear_drop_filter();
        a.publish("lost no more".into()).unwrap();
        assert_eq!(next_message(&mut b).await, "lost no more");
    }
}
