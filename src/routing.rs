use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter},
    hash::{Hash, Hasher},
    net::{AddrParseError, SocketAddr},
    str::FromStr,
};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::{
    key::{Key, KeyError},
    shortlist::Shortlist,
    K_PARAM, N_BUCKETS,
};

/// A peer in the overlay. Identity is the key alone, the address is only
/// where it was last seen.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Contact {
    pub id: Key,
    pub addr: SocketAddr,
}

impl Contact {
    pub fn new(id: Key, addr: SocketAddr) -> Self {
        Contact { id, addr }
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

impl Hash for Contact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl Display for Contact {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseContactError {
    #[error("expected <id>@<address>")]
    MissingSeparator,
    #[error("can't parse id: {0}")]
    Key(#[from] KeyError),
    #[error("can't parse address: {0}")]
    Addr(#[from] AddrParseError),
}

impl FromStr for Contact {
    type Err = ParseContactError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, addr) = s
            .trim()
            .split_once('@')
            .ok_or(ParseContactError::MissingSeparator)?;

        Ok(Contact {
            id: id.parse()?,
            addr: addr.parse()?,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("local node {0} is part of its own seed contacts")]
    SelfInSeed(Key),
}

/// Returned by [RoutingTable::update] when the target bucket has no room.
#[derive(Debug, thiserror::Error)]
#[error("bucket is full, can't add {candidate} without evicting {oldest}")]
pub struct BucketFull {
    pub candidate: Contact,
    pub oldest: Contact,
}

/// Contacts ordered from least to most recently seen.
#[derive(Debug, Default)]
struct KBucket {
    contacts: Vec<Contact>,
}

impl KBucket {
    fn position(&self, id: &Key) -> Option<usize> {
        self.contacts.iter().position(|c| &c.id == id)
    }

    fn update(&mut self, contact: Contact) -> Result<(), BucketFull> {
        match self.position(&contact.id) {
            Some(i) => {
                self.contacts.remove(i);
                self.contacts.push(contact);
                Ok(())
            }
            None if self.contacts.len() < K_PARAM => {
                self.contacts.push(contact);
                Ok(())
            }
            None => Err(BucketFull {
                candidate: contact,
                oldest: self.contacts[0],
            }),
        }
    }

    fn remove(&mut self, id: &Key) -> bool {
        match self.position(id) {
            Some(i) => {
                self.contacts.remove(i);
                true
            }
            None => false,
        }
    }
}

/// K-buckets indexed by the length of the prefix a contact shares with the
/// local node.
#[derive(Debug)]
pub struct RoutingTable {
    local: Contact,
    buckets: Mutex<Vec<KBucket>>,
}

impl RoutingTable {
    pub fn new(local: Contact, seed: &[Contact]) -> Result<RoutingTable, RoutingError> {
        if seed.iter().any(|c| c.id == local.id) {
            return Err(RoutingError::SelfInSeed(local.id));
        }

        let mut buckets: Vec<KBucket> = (0..N_BUCKETS).map(|_| KBucket::default()).collect();
        for contact in seed {
            let index = bucket_index(&local.id, &contact.id);
            if let Err(e) = buckets[index].update(*contact) {
                debug!("dropping seed contact: {}", e);
            }
        }

        Ok(RoutingTable {
            local,
            buckets: Mutex::new(buckets),
        })
    }

    pub fn local(&self) -> &Contact {
        &self.local
    }

    /// Moves a known contact to the most recently seen position of its
    /// bucket, or inserts it if there is room. The local node is ignored.
    pub async fn update(&self, contact: Contact) -> Result<(), BucketFull> {
        if contact.id == self.local.id {
            return Ok(());
        }

        let index = bucket_index(&self.local.id, &contact.id);
        trace!("updating bucket {} with {}", index, contact);
        self.buckets.lock().await[index].update(contact)
    }

    /// Evicts `stale` and inserts `contact` in its place if there is room.
    pub async fn replace(&self, stale: &Key, contact: Contact) -> Result<(), BucketFull> {
        if contact.id == self.local.id {
            return Ok(());
        }

        let mut buckets = self.buckets.lock().await;
        if *stale != self.local.id {
            buckets[bucket_index(&self.local.id, stale)].remove(stale);
        }
        buckets[bucket_index(&self.local.id, &contact.id)].update(contact)
    }

    pub async fn remove(&self, id: &Key) -> bool {
        if *id == self.local.id {
            return false;
        }

        let index = bucket_index(&self.local.id, id);
        let removed = self.buckets.lock().await[index].remove(id);
        if !removed {
            trace!("tried to remove routing entry that doesn't exist: {}", id);
        }
        removed
    }

    /// Lookup the `count` contacts closest to `target` in this table.
    pub async fn closest(&self, target: &Key, count: usize) -> Shortlist {
        let mut contacts: Vec<Contact> = self
            .buckets
            .lock()
            .await
            .iter()
            .flat_map(|bucket| bucket.contacts.iter().copied())
            .collect();

        contacts.sort_by_key(|c| c.id.distance(target));
        contacts.truncate(count);

        let mut shortlist = Shortlist::new(*target);
        shortlist.extend(contacts);
        shortlist
    }

    pub async fn contains(&self, id: &Key) -> bool {
        if *id == self.local.id {
            return false;
        }

        let index = bucket_index(&self.local.id, id);
        self.buckets.lock().await[index].position(id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.buckets
            .lock()
            .await
            .iter()
            .map(|b| b.contacts.len())
            .sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// All known contacts, bucket by bucket.
    pub async fn contacts(&self) -> Vec<Contact> {
        self.buckets
            .lock()
            .await
            .iter()
            .flat_map(|b| b.contacts.iter().copied())
            .collect()
    }
}

#[inline]
fn bucket_index(local: &Key, id: &Key) -> usize {
    local.distance(id).zeroes_in_prefix().min(N_BUCKETS - 1)
}
