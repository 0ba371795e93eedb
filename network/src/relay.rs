//! Session-scoped, fire-and-forget message transport.
//!
//! The relay never interprets frames: it moves opaque text between the
//! members of a session and maintains the membership primitive presence is
//! built on. Nothing is queued for absent recipients.

use async_trait::async_trait;
use log::{debug, trace, warn};
use session_core::{Error, Participant, SessionId, SessionIdentity};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};

/// Default per-member channel capacity
pub const DEFAULT_RELAY_CAPACITY: usize = 256;

/// Raw membership updates delivered by the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceUpdate {
    /// Full roster, always the first update after subscribing
    Snapshot(Vec<Participant>),
    /// A member subscribed (may repeat for the same identity)
    Joined(Participant),
    /// A member unsubscribed or timed out
    Left(SessionIdentity),
    /// Our own subscription was lost
    Disconnected,
}

/// Addressing of an outgoing frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Only the named member
    To(SessionIdentity),
    /// Every member except the sender
    Broadcast,
}

/// Receiving side of a live subscription
#[derive(Debug)]
pub struct RelaySubscription {
    /// Membership updates
    pub presence: mpsc::Receiver<PresenceUpdate>,
    /// Encoded frames addressed to us
    pub frames: mpsc::Receiver<String>,
}

/// Session-scoped pub/sub transport
#[async_trait]
pub trait SignalRelay: Send + Sync {
    /// Join the session channel as `participant`
    async fn subscribe(
        &self,
        session: &SessionId,
        participant: Participant,
    ) -> Result<RelaySubscription, Error>;

    /// Fire-and-forget send. Succeeds even when the recipient is absent.
    async fn send(
        &self,
        session: &SessionId,
        from: &SessionIdentity,
        delivery: Delivery,
        frame: String,
    ) -> Result<(), Error>;

    /// Leave the session channel
    async fn unsubscribe(&self, session: &SessionId, identity: &SessionIdentity)
        -> Result<(), Error>;
}

struct Member {
    participant: Participant,
    presence_tx: mpsc::Sender<PresenceUpdate>,
    frame_tx: mpsc::Sender<String>,
}

type Sessions = HashMap<SessionId, HashMap<SessionIdentity, Member>>;

/// In-process relay hub shared by every client of an embedding process
#[derive(Clone)]
pub struct LocalRelay {
    sessions: Arc<Mutex<Sessions>>,
    capacity: usize,
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::new(DEFAULT_RELAY_CAPACITY)
    }
}

impl LocalRelay {
    /// Create a hub with the given per-member channel capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Identities currently subscribed to `session`
    pub async fn members(&self, session: &SessionId) -> Vec<SessionIdentity> {
        let sessions = self.sessions.lock().await;
        let mut members: Vec<_> = sessions
            .get(session)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Drop a member's connection without telling anyone else.
    ///
    /// The member itself observes `Disconnected`; the rest of the session keeps
    /// it in their rosters until [`LocalRelay::expire`] is called.
    pub async fn disconnect(&self, session: &SessionId, identity: &SessionIdentity) {
        let mut sessions = self.sessions.lock().await;
        if let Some(member) = sessions
            .get_mut(session)
            .and_then(|members| members.remove(identity))
        {
            debug!("Relay dropped connection of {} in {}", identity, session);
            let _ = member.presence_tx.try_send(PresenceUpdate::Disconnected);
        }
    }

    /// Announce that a silently disconnected member has timed out
    pub async fn expire(&self, session: &SessionId, identity: &SessionIdentity) {
        let mut sessions = self.sessions.lock().await;
        if let Some(members) = sessions.get_mut(session) {
            debug!("Relay expired {} in {}", identity, session);
            fan_out_presence(members, None, PresenceUpdate::Left(identity.clone()));
        }
    }
}

/// Deliver `update` to every member but `except`.
///
/// A member whose presence channel is full is dropped like a lost connection:
/// its channels close, so it resubscribes and starts over from a snapshot.
fn fan_out_presence(
    members: &mut HashMap<SessionIdentity, Member>,
    except: Option<&SessionIdentity>,
    update: PresenceUpdate,
) {
    let mut overflowed = Vec::new();
    for (identity, member) in members.iter() {
        if Some(identity) == except {
            continue;
        }
        match member.presence_tx.try_send(update.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => overflowed.push(identity.clone()),
            Err(TrySendError::Closed(_)) => trace!("Presence receiver of {} is gone", identity),
        }
    }
    for identity in overflowed {
        warn!("Presence backlog of {} is full, dropping its connection", identity);
        members.remove(&identity);
    }
}

#[async_trait]
impl SignalRelay for LocalRelay {
    async fn subscribe(
        &self,
        session: &SessionId,
        participant: Participant,
    ) -> Result<RelaySubscription, Error> {
        let (presence_tx, presence_rx) = mpsc::channel(self.capacity);
        let (frame_tx, frame_rx) = mpsc::channel(self.capacity);

        let mut sessions = self.sessions.lock().await;
        let members = sessions.entry(session.clone()).or_default();

        let identity = participant.identity.clone();
        if members.contains_key(&identity) {
            debug!("{} re-subscribed to {}", identity, session);
        }
        members.insert(
            identity.clone(),
            Member {
                participant: participant.clone(),
                presence_tx: presence_tx.clone(),
                frame_tx,
            },
        );

        let mut roster: Vec<Participant> =
            members.values().map(|m| m.participant.clone()).collect();
        roster.sort_by(|a, b| a.identity.cmp(&b.identity));

        presence_tx
            .try_send(PresenceUpdate::Snapshot(roster))
            .map_err(|e| Error::TransportFailure(format!("Failed to deliver snapshot: {}", e)))?;
        fan_out_presence(members, Some(&identity), PresenceUpdate::Joined(participant));

        Ok(RelaySubscription {
            presence: presence_rx,
            frames: frame_rx,
        })
    }

    async fn send(
        &self,
        session: &SessionId,
        from: &SessionIdentity,
        delivery: Delivery,
        frame: String,
    ) -> Result<(), Error> {
        let sessions = self.sessions.lock().await;
        let members = sessions
            .get(session)
            .filter(|members| members.contains_key(from))
            .ok_or_else(|| {
                Error::TransportFailure(format!("{} is not subscribed to {}", from, session))
            })?;

        match delivery {
            Delivery::To(to) => match members.get(&to) {
                Some(member) => {
                    if member.frame_tx.try_send(frame).is_err() {
                        trace!("Dropped frame for {}: channel unavailable", to);
                    }
                }
                None => trace!("Dropped frame for absent member {}", to),
            },
            Delivery::Broadcast => {
                for (identity, member) in members.iter().filter(|(id, _)| *id != from) {
                    if member.frame_tx.try_send(frame.clone()).is_err() {
                        trace!("Dropped broadcast for {}", identity);
                    }
                }
            }
        }

        Ok(())
    }

    async fn unsubscribe(
        &self,
        session: &SessionId,
        identity: &SessionIdentity,
    ) -> Result<(), Error> {
        let mut sessions = self.sessions.lock().await;
        let Some(members) = sessions.get_mut(session) else {
            return Ok(());
        };
        if members.remove(identity).is_none() {
            warn!("{} unsubscribed from {} without a subscription", identity, session);
            return Ok(());
        }
        fan_out_presence(members, None, PresenceUpdate::Left(identity.clone()));
        if members.is_empty() {
            sessions.remove(session);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionId {
        SessionId::new("class-1")
    }

    #[tokio::test]
    async fn first_update_is_snapshot() {
        let relay = LocalRelay::default();
        let _t = relay
            .subscribe(&session(), Participant::new("t", "Teacher"))
            .await
            .unwrap();
        let mut s1 = relay
            .subscribe(&session(), Participant::new("s1", "Student"))
            .await
            .unwrap();

        match s1.presence.recv().await {
            Some(PresenceUpdate::Snapshot(roster)) => {
                let ids: Vec<_> = roster.iter().map(|p| p.identity.as_str()).collect();
                assert_eq!(ids, vec!["s1", "t"]);
            }
            other => panic!("Expected snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unicast_reaches_only_recipient() {
        let relay = LocalRelay::default();
        let mut t = relay
            .subscribe(&session(), Participant::new("t", "Teacher"))
            .await
            .unwrap();
        let mut s1 = relay
            .subscribe(&session(), Participant::new("s1", "One"))
            .await
            .unwrap();
        let mut s2 = relay
            .subscribe(&session(), Participant::new("s2", "Two"))
            .await
            .unwrap();

        relay
            .send(&session(), &"t".into(), Delivery::To("s1".into()), "hi".into())
            .await
            .unwrap();

        assert_eq!(s1.frames.recv().await.as_deref(), Some("hi"));
        assert!(s2.frames.try_recv().is_err());
        assert!(t.frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_skips_sender() {
        let relay = LocalRelay::default();
        let mut t = relay
            .subscribe(&session(), Participant::new("t", "Teacher"))
            .await
            .unwrap();
        let mut s1 = relay
            .subscribe(&session(), Participant::new("s1", "One"))
            .await
            .unwrap();

        relay
            .send(&session(), &"t".into(), Delivery::Broadcast, "all".into())
            .await
            .unwrap();

        assert_eq!(s1.frames.recv().await.as_deref(), Some("all"));
        assert!(t.frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn absent_recipient_is_not_an_error() {
        let relay = LocalRelay::default();
        let _t = relay
            .subscribe(&session(), Participant::new("t", "Teacher"))
            .await
            .unwrap();
        let result = relay
            .send(&session(), &"t".into(), Delivery::To("ghost".into()), "x".into())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn unsubscribed_sender_fails() {
        let relay = LocalRelay::default();
        let result = relay
            .send(&session(), &"t".into(), Delivery::Broadcast, "x".into())
            .await;
        assert!(matches!(result, Err(Error::TransportFailure(_))));
    }

    #[tokio::test]
    async fn unsubscribe_announces_left() {
        let relay = LocalRelay::default();
        let mut t = relay
            .subscribe(&session(), Participant::new("t", "Teacher"))
            .await
            .unwrap();
        let _s1 = relay
            .subscribe(&session(), Participant::new("s1", "One"))
            .await
            .unwrap();
        relay.unsubscribe(&session(), &"s1".into()).await.unwrap();

        assert!(matches!(t.presence.recv().await, Some(PresenceUpdate::Snapshot(_))));
        assert_eq!(
            t.presence.recv().await,
            Some(PresenceUpdate::Joined(Participant::new("s1", "One")))
        );
        assert_eq!(
            t.presence.recv().await,
            Some(PresenceUpdate::Left("s1".into()))
        );
    }

    #[tokio::test]
    async fn disconnect_is_silent_until_expired() {
        let relay = LocalRelay::default();
        let mut t = relay
            .subscribe(&session(), Participant::new("t", "Teacher"))
            .await
            .unwrap();
        let mut s1 = relay
            .subscribe(&session(), Participant::new("s1", "One"))
            .await
            .unwrap();

        relay.disconnect(&session(), &"s1".into()).await;

        // snapshot + joined only
        assert!(matches!(t.presence.recv().await, Some(PresenceUpdate::Snapshot(_))));
        assert!(matches!(t.presence.recv().await, Some(PresenceUpdate::Joined(_))));
        assert!(t.presence.try_recv().is_err());

        assert!(matches!(s1.presence.recv().await, Some(PresenceUpdate::Snapshot(_))));
        assert_eq!(s1.presence.recv().await, Some(PresenceUpdate::Disconnected));

        relay.expire(&session(), &"s1".into()).await;
        assert_eq!(
            t.presence.recv().await,
            Some(PresenceUpdate::Left("s1".into()))
        );
        assert_eq!(relay.members(&session()).await, vec![SessionIdentity::new("t")]);
    }

    #[tokio::test]
    async fn member_with_full_presence_backlog_is_dropped() {
        let relay = LocalRelay::new(1);
        let mut t = relay
            .subscribe(&session(), Participant::new("t", "Teacher"))
            .await
            .unwrap();
        // t never drains its snapshot
        let mut s1 = relay
            .subscribe(&session(), Participant::new("s1", "One"))
            .await
            .unwrap();

        assert_eq!(relay.members(&session()).await, vec![SessionIdentity::new("s1")]);
        assert!(matches!(t.presence.recv().await, Some(PresenceUpdate::Snapshot(_))));
        assert_eq!(t.presence.recv().await, None);
        assert_eq!(t.frames.recv().await, None);
        assert!(matches!(s1.presence.recv().await, Some(PresenceUpdate::Snapshot(_))));

        // back with a fresh snapshot on resubscribe
        let mut t = relay
            .subscribe(&session(), Participant::new("t", "Teacher"))
            .await
            .unwrap();
        match t.presence.recv().await {
            Some(PresenceUpdate::Snapshot(roster)) => assert_eq!(roster.len(), 2),
            other => panic!("Expected snapshot, got {:?}", other),
        }
        assert_eq!(
            s1.presence.recv().await,
            Some(PresenceUpdate::Joined(Participant::new("t", "Teacher")))
        );
    }
}
