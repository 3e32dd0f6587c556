//! # Publisher Registry
//!
//! Maps each [`DestinationIdentity`] to its [`Publisher`] and tracks the
//! identities still waiting for a wire (re)subscription. The registry is owned
//! by the manager task and is never shared, so it needs no locking.

use std::collections::btree_set;
use std::collections::{BTreeSet, HashMap};

use crate::core::publisher::{Publisher, WireState};
use crate::core::subscription::DestinationIdentity;
use crate::core::transport::SessionRef;

/// Identities awaiting a wire subscribe.
#[derive(Debug, Default, Clone)]
pub struct PendingSet {
    identities: BTreeSet<DestinationIdentity>,
}

impl PendingSet {
    /// Returns `true` if the identity was not queued yet.
    pub fn insert(&mut self, identity: DestinationIdentity) -> bool {
        self.identities.insert(identity)
    }

    pub fn remove(&mut self, identity: &DestinationIdentity) -> bool {
        self.identities.remove(identity)
    }

    pub fn contains(&self, identity: &DestinationIdentity) -> bool {
        self.identities.contains(identity)
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    /// Empties the set. Entries that fail again are expected to be re-inserted.
    pub fn take_all(&mut self) -> Vec<DestinationIdentity> {
        std::mem::take(&mut self.identities).into_iter().collect()
    }

    pub fn iter(&self) -> btree_set::Iter<'_, DestinationIdentity> {
        self.identities.iter()
    }
}

/// Point-in-time view of one publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherSnapshot {
    pub identity: DestinationIdentity,
    pub destination: String,
    pub wire_id: String,
    pub wire_state: WireState,
    pub callbacks: usize,
}

#[derive(Default)]
pub(crate) struct Registry {
    publishers: HashMap<DestinationIdentity, Publisher>,
    pending: PendingSet,
}

impl Registry {
    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }

    pub fn get_mut(&mut self, identity: &DestinationIdentity) -> Option<&mut Publisher> {
        self.publishers.get_mut(identity)
    }

    /// The publisher for `identity`, created with `create` on first use.
    pub fn get_or_insert_with<F>(&mut self, identity: &DestinationIdentity, create: F) -> &mut Publisher
    where
        F: FnOnce() -> Publisher,
    {
        self.publishers.entry(identity.clone()).or_insert_with(|| {
            log::debug!("Creating publisher for {}", identity);
            create()
        })
    }

    /// Drops the publisher if it has neither dispatchers nor handles left.
    pub fn remove_if_idle(&mut self, identity: &DestinationIdentity) -> Option<Publisher> {
        if !self.publishers.get(identity).is_some_and(Publisher::is_idle) {
            return None;
        }
        self.pending.remove(identity);
        let removed = self.publishers.remove(identity);
        log::info!("Removed publisher for {} ({} left)", identity, self.publishers.len());
        removed
    }

    /// Points every publisher at the new session.
    pub fn attach_session(&mut self, session: &SessionRef) {
        for publisher in self.publishers.values_mut() {
            publisher.set_session(Some(session.clone()));
        }
    }

    /// Forgets the session. Publishers that had a wire subscription are queued.
    ///
    /// Returns how many identities were requeued.
    pub fn detach_session(&mut self) -> usize {
        let mut requeued = 0;
        for (identity, publisher) in self.publishers.iter_mut() {
            if publisher.reset_wire() && self.pending.insert(identity.clone()) {
                requeued += 1;
            }
        }
        requeued
    }

    pub fn pending(&self) -> &PendingSet {
        &self.pending
    }

    pub fn pending_mut(&mut self) -> &mut PendingSet {
        &mut self.pending
    }

    pub fn snapshots(&self) -> Vec<PublisherSnapshot> {
        let mut snapshots: Vec<PublisherSnapshot> = self
            .publishers
            .values()
            .map(|publisher| PublisherSnapshot {
                identity: publisher.identity().clone(),
                destination: publisher.destination().to_string(),
                wire_id: publisher.wire_id().to_string(),
                wire_state: publisher.wire_state(),
                callbacks: publisher.callback_count(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.identity.cmp(&b.identity));
        snapshots
    }
}
