//! Roster tracking on top of the relay's membership updates.

use crate::relay::PresenceUpdate;
use log::{debug, trace};
use session_core::{Participant, SessionIdentity};
use std::collections::BTreeMap;

/// Idempotent roster change relevant to the local client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterChange {
    Joined(Participant),
    Left(SessionIdentity),
}

/// Which identities are currently present in the session.
///
/// Duplicate `Joined` updates and `Left` updates for unknown identities
/// produce no change. Changes never mention the local identity.
pub struct PresenceRegistry {
    local: SessionIdentity,
    roster: BTreeMap<SessionIdentity, Participant>,
    online: bool,
}

impl PresenceRegistry {
    pub fn new(local: SessionIdentity) -> Self {
        Self {
            local,
            roster: BTreeMap::new(),
            online: false,
        }
    }

    /// Fold a relay update into the roster
    pub fn apply(&mut self, update: PresenceUpdate) -> Vec<RosterChange> {
        match update {
            PresenceUpdate::Snapshot(participants) => {
                self.online = true;
                let next: BTreeMap<_, _> = participants
                    .into_iter()
                    .map(|p| (p.identity.clone(), p))
                    .collect();

                let mut changes: Vec<RosterChange> = self
                    .roster
                    .keys()
                    .filter(|id| !next.contains_key(*id) && **id != self.local)
                    .cloned()
                    .map(RosterChange::Left)
                    .collect();
                changes.extend(
                    next.values()
                        .filter(|p| !self.roster.contains_key(&p.identity) && p.identity != self.local)
                        .cloned()
                        .map(RosterChange::Joined),
                );

                debug!("Roster snapshot with {} members", next.len());
                self.roster = next;
                changes
            }
            PresenceUpdate::Joined(participant) => {
                if self.roster.contains_key(&participant.identity) {
                    trace!("Duplicate join for {}", participant.identity);
                    return Vec::new();
                }
                self.roster
                    .insert(participant.identity.clone(), participant.clone());
                if participant.identity == self.local {
                    return Vec::new();
                }
                vec![RosterChange::Joined(participant)]
            }
            PresenceUpdate::Left(identity) => {
                if self.roster.remove(&identity).is_none() || identity == self.local {
                    trace!("Ignoring leave for {}", identity);
                    return Vec::new();
                }
                vec![RosterChange::Left(identity)]
            }
            PresenceUpdate::Disconnected => self.clear(),
        }
    }

    /// Forget everyone; the roster is empty until the next snapshot
    pub fn clear(&mut self) -> Vec<RosterChange> {
        self.online = false;
        let departed = std::mem::take(&mut self.roster);
        departed
            .into_keys()
            .filter(|id| *id != self.local)
            .map(RosterChange::Left)
            .collect()
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn contains(&self, identity: &SessionIdentity) -> bool {
        self.roster.contains_key(identity)
    }

    /// Present participants, ourselves included
    pub fn participants(&self) -> Vec<Participant> {
        self.roster.values().cloned().collect()
    }

    /// Present identities other than our own
    pub fn remote_identities(&self) -> Vec<SessionIdentity> {
        self.roster
            .keys()
            .filter(|id| **id != self.local)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(id: &str) -> Participant {
        Participant::new(id, id.to_uppercase())
    }

    #[test]
    fn snapshot_seeds_remote_peers() {
        let mut registry = PresenceRegistry::new("s2".into());
        let changes = registry.apply(PresenceUpdate::Snapshot(vec![p("s1"), p("s2"), p("t")]));
        assert_eq!(
            changes,
            vec![RosterChange::Joined(p("s1")), RosterChange::Joined(p("t"))]
        );
        assert!(registry.is_online());
        assert_eq!(registry.participants().len(), 3);
    }

    #[test]
    fn duplicate_join_is_ignored() {
        let mut registry = PresenceRegistry::new("t".into());
        registry.apply(PresenceUpdate::Snapshot(vec![p("t")]));
        assert_eq!(
            registry.apply(PresenceUpdate::Joined(p("s1"))),
            vec![RosterChange::Joined(p("s1"))]
        );
        assert!(registry.apply(PresenceUpdate::Joined(p("s1"))).is_empty());
        assert_eq!(registry.remote_identities(), vec![SessionIdentity::new("s1")]);
    }

    #[test]
    fn unknown_leave_is_ignored() {
        let mut registry = PresenceRegistry::new("t".into());
        registry.apply(PresenceUpdate::Snapshot(vec![p("t"), p("s1")]));
        assert_eq!(
            registry.apply(PresenceUpdate::Left("s1".into())),
            vec![RosterChange::Left("s1".into())]
        );
        assert!(registry.apply(PresenceUpdate::Left("s1".into())).is_empty());
        assert!(registry.apply(PresenceUpdate::Left("ghost".into())).is_empty());
    }

    #[test]
    fn resnapshot_diffs_against_current_roster() {
        let mut registry = PresenceRegistry::new("t".into());
        registry.apply(PresenceUpdate::Snapshot(vec![p("t"), p("s1")]));
        let changes = registry.apply(PresenceUpdate::Snapshot(vec![p("t"), p("s2")]));
        assert_eq!(
            changes,
            vec![RosterChange::Left("s1".into()), RosterChange::Joined(p("s2"))]
        );
    }

    #[test]
    fn disconnect_empties_roster() {
        let mut registry = PresenceRegistry::new("t".into());
        registry.apply(PresenceUpdate::Snapshot(vec![p("t"), p("s1"), p("s2")]));
        let changes = registry.apply(PresenceUpdate::Disconnected);
        assert_eq!(
            changes,
            vec![RosterChange::Left("s1".into()), RosterChange::Left("s2".into())]
        );
        assert!(!registry.is_online());
        assert!(registry.participants().is_empty());
        assert!(!registry.contains(&"t".into()));
    }
}
