use std::collections::BTreeMap;

use crate::{
    key::{Distance, Key},
    routing::Contact,
};

/// Candidates of a single lookup, ordered by distance to its target.
///
/// Distinct keys are at distinct distances from the target, so keying by
/// distance also deduplicates by identity.
#[derive(Debug, Clone)]
pub struct Shortlist {
    target: Key,
    contacts: BTreeMap<Distance, Contact>,
}

impl Shortlist {
    pub fn new(target: Key) -> Self {
        Shortlist {
            target,
            contacts: BTreeMap::new(),
        }
    }

    pub fn target(&self) -> &Key {
        &self.target
    }

    /// Merges contacts in. A contact that is already present keeps the data
    /// it was first seen with.
    pub fn extend(&mut self, contacts: impl IntoIterator<Item = Contact>) {
        for contact in contacts {
            self.contacts
                .entry(contact.id.distance(&self.target))
                .or_insert(contact);
        }
    }

    pub fn add(&mut self, contact: Contact) {
        self.extend([contact]);
    }

    pub fn remove(&mut self, id: &Key) -> Option<Contact> {
        self.contacts.remove(&id.distance(&self.target))
    }

    pub fn contains(&self, id: &Key) -> bool {
        self.contacts.contains_key(&id.distance(&self.target))
    }

    pub fn closest(&self) -> Option<&Contact> {
        self.contacts.values().next()
    }

    /// Contacts closest first.
    pub fn iter(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.values()
    }

    pub fn sorted_contacts(&self) -> Vec<Contact> {
        self.contacts.values().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}
