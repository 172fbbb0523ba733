use crate::envelope::{ActivitySample, NegotiationPayload, PresenceChange, SignalEnvelope};
use crate::error::MeshError;
use crate::relay::{PresenceUpdate, RelayFrame, RelaySubscription, SignalRelay};

/// Inbound signaling, already filtered for the local participant.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    /// Presence as tracked by the relay.
    Roster(PresenceUpdate),
    /// A presence envelope published by a peer.
    PeerPresence {
        peer: String,
        change: PresenceChange,
    },
    Negotiation {
        from: String,
        payload: NegotiationPayload,
    },
    Activity(ActivitySample),
}

/// The signaling relay bound to one voice channel.
///
/// Envelopes we sent ourselves and negotiation addressed to someone else are
/// dropped on receipt. Malformed frames are logged and skipped.
pub struct SignalingChannel {
    local: String,
    subscription: RelaySubscription,
    announced: bool,
}

impl SignalingChannel {
    pub async fn open(
        relay: &dyn SignalRelay,
        topic: &str,
        local: &str,
    ) -> Result<Self, MeshError> {
        let subscription = relay.subscribe(topic).await?;
        tracing::info!(topic = %topic, local = %local, "signaling channel open");
        Ok(Self {
            local: local.to_string(),
            subscription,
            announced: false,
        })
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn topic(&self) -> &str {
        self.subscription.topic()
    }

    /// Track the local identity on the channel and tell peers we joined.
    pub fn announce_presence(&mut self) -> Result<(), MeshError> {
        self.subscription.track(&self.local)?;
        self.announced = true;
        self.publish(&SignalEnvelope::Presence {
            sender: self.local.clone(),
            change: PresenceChange::Join,
        })
    }

    pub fn send_negotiation(
        &mut self,
        target: &str,
        payload: NegotiationPayload,
    ) -> Result<(), MeshError> {
        tracing::debug!(peer = %target, kind = payload.kind(), "sending negotiation");
        self.publish(&SignalEnvelope::Negotiation {
            sender: self.local.clone(),
            target: target.to_string(),
            payload,
        })
    }

    pub fn send_activity(&mut self, sample: ActivitySample) -> Result<(), MeshError> {
        self.publish(&SignalEnvelope::Activity(sample))
    }

    fn publish(&mut self, envelope: &SignalEnvelope) -> Result<(), MeshError> {
        let text = envelope.encode()?;
        self.subscription.publish(text)
    }

    /// Next event for the local participant. `None` once the relay stream
    /// has ended. Cancel safe.
    pub async fn next_event(&mut self) -> Option<SignalEvent> {
        loop {
            match self.subscription.recv().await? {
                RelayFrame::Presence(update) => return Some(SignalEvent::Roster(update)),
                RelayFrame::Message(text) => {
                    if let Some(event) = self.accept(&text) {
                        return Some(event);
                    }
                }
            }
        }
    }

    fn accept(&self, text: &str) -> Option<SignalEvent> {
        let envelope = match SignalEnvelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(topic = %self.topic(), error = %e, "dropping malformed signal");
                return None;
            }
        };
        if envelope.sender() == self.local {
            return None;
        }
        match envelope {
            SignalEnvelope::Presence { sender, change } => Some(SignalEvent::PeerPresence {
                peer: sender,
                change,
            }),
            SignalEnvelope::Negotiation {
                sender,
                target,
                payload,
            } => {
                if target != self.local {
                    return None;
                }
                Some(SignalEvent::Negotiation {
                    from: sender,
                    payload,
                })
            }
            SignalEnvelope::Activity(sample) => Some(SignalEvent::Activity(sample)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.subscription.is_closed()
    }

    /// Leave the channel. Idempotent.
    pub fn unsubscribe(&mut self) {
        if self.subscription.is_closed() {
            return;
        }
        if self.announced {
            let leave = SignalEnvelope::Presence {
                sender: self.local.clone(),
                change: PresenceChange::Leave,
            };
            // Best effort: the relay may already be gone.
            if let Err(e) = self.publish(&leave) {
                tracing::debug!(error = %e, "leave announcement not delivered");
            }
        }
        self.subscription.close();
        tracing::info!(topic = %self.topic(), "signaling channel closed");
    }
}
