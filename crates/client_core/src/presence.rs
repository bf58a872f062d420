use std::collections::{BTreeMap, HashSet};

use shared::{
    domain::{PresenceEntry, UserId, UserProfile},
    protocol::PresenceMember,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::SyncError;

fn entry_from(member: PresenceMember) -> PresenceEntry {
    PresenceEntry {
        friend_id: member.id,
        name: member.name,
        avatar_ref: member.avatar,
    }
}

/// Online friends derived from the broker's connected set and the backend's
/// friend list. Without a friend list the raw connected set is exposed.
#[derive(Debug)]
pub struct PresenceTracker {
    connected: BTreeMap<UserId, PresenceEntry>,
    friends: Option<HashSet<UserId>>,
    snapshot_received: bool,
    view: watch::Sender<Vec<PresenceEntry>>,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceTracker {
    pub fn new() -> Self {
        let (view, _) = watch::channel(Vec::new());
        Self {
            connected: BTreeMap::new(),
            friends: None,
            snapshot_received: false,
            view,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<PresenceEntry>> {
        self.view.subscribe()
    }

    pub fn is_degraded(&self) -> bool {
        self.friends.is_none()
    }

    /// False until the broker delivered a snapshot since the last teardown.
    pub fn has_snapshot(&self) -> bool {
        self.snapshot_received
    }

    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    pub fn is_connected(&self, id: &UserId) -> bool {
        self.connected.contains_key(id)
    }

    pub fn is_online(&self, id: &UserId) -> bool {
        self.is_connected(id)
            && self
                .friends
                .as_ref()
                .map_or(true, |friends| friends.contains(id))
    }

    pub fn online(&self) -> Vec<PresenceEntry> {
        self.connected
            .values()
            .filter(|entry| self.is_online(&entry.friend_id))
            .cloned()
            .collect()
    }

    /// Replaces the connected set with a subscribe-time snapshot.
    pub fn replace_connected(&mut self, members: Vec<PresenceMember>) {
        self.connected = members
            .into_iter()
            .map(|member| (member.id.clone(), entry_from(member)))
            .collect();
        self.snapshot_received = true;
        info!(
            connected = self.connected.len(),
            degraded = self.is_degraded(),
            "presence: snapshot applied"
        );
        self.publish();
    }

    /// A failed friend-list fetch leaves the tracker in degraded mode.
    pub fn resolve_friends(&mut self, friends: Result<Vec<UserProfile>, SyncError>) {
        match friends {
            Ok(friends) => self.set_friends(&friends),
            Err(err) => {
                warn!(error = %err, "presence: friend list unavailable, showing raw connected set");
                self.friends = None;
                self.publish();
            }
        }
    }

    pub fn set_friends(&mut self, friends: &[UserProfile]) {
        self.friends = Some(friends.iter().map(|f| f.id.clone()).collect());
        self.publish();
    }

    pub fn member_added(&mut self, member: PresenceMember) -> bool {
        if self.connected.contains_key(&member.id) {
            return false;
        }
        debug!(id = %member.id, "presence: member added");
        self.connected.insert(member.id.clone(), entry_from(member));
        self.publish();
        true
    }

    pub fn member_removed(&mut self, id: &UserId) -> bool {
        if self.connected.remove(id).is_none() {
            return false;
        }
        debug!(id = %id, "presence: member removed");
        self.publish();
        true
    }

    /// Subscription teardown forgets everyone.
    pub fn clear(&mut self) {
        self.connected.clear();
        self.friends = None;
        self.snapshot_received = false;
        self.publish();
    }

    fn publish(&self) {
        let next = self.online();
        self.view.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
