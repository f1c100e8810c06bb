use std::collections::HashSet;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::{
    kademlia::{DhtError, FindValueResult, Kademlia},
    key::Key,
    routing::Contact,
    shortlist::Shortlist,
    transport::{Pending, RequestError, Transport},
    A_PARAM,
};

/// What a walk asks every peer it visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    /// Closest contacts to an identifier.
    FindNodes(Key),
    /// The value stored under a key, or the closest contacts to it.
    FindValue(Key),
    /// Closest contacts to a key that is about to be stored.
    Store(Key),
}

#[derive(Debug, Clone)]
pub enum WalkResult {
    /// Shortlist at convergence, closest first.
    Contacts(Vec<Contact>),
    Value { value: String, from: Contact },
}

/// A single peer failed to answer. The walk drops the peer and carries on.
#[derive(Debug, thiserror::Error)]
#[error("call to {contact} failed: {source}")]
pub struct CallFailed {
    pub contact: Contact,
    pub source: RequestError,
}

enum Issued {
    Nodes(Pending<Vec<Contact>>),
    Value(Pending<FindValueResult>),
}

enum Outcome {
    Closer(Vec<Contact>),
    Value(String),
}

struct Answer {
    from: Contact,
    outcome: Outcome,
}

impl Issued {
    async fn wait(self) -> Result<Answer, RequestError> {
        match self {
            Issued::Nodes(call) => {
                let response = call.wait().await?;
                Ok(Answer {
                    from: response.from,
                    outcome: Outcome::Closer(response.body),
                })
            }
            Issued::Value(call) => {
                let response = call.wait().await?;
                let outcome = match response.body {
                    FindValueResult::Value(value) => Outcome::Value(value),
                    FindValueResult::Nodes(nodes) => Outcome::Closer(nodes),
                };
                Ok(Answer {
                    from: response.from,
                    outcome,
                })
            }
        }
    }
}

impl Call {
    pub fn target(&self) -> Key {
        match self {
            Call::FindNodes(key) | Call::FindValue(key) | Call::Store(key) => *key,
        }
    }

    async fn issue<T: Transport>(&self, transport: &T, dst: &Contact) -> Result<Issued, RequestError> {
        match self {
            Call::FindNodes(target) | Call::Store(target) => {
                transport.find_nodes(target, dst).await.map(Issued::Nodes)
            }
            Call::FindValue(key) => transport.find_value(key, dst).await.map(Issued::Value),
        }
    }

    /// Folds an answer into the shortlist, skipping `excluded` contacts.
    /// Returns the value that ends the walk early, if any.
    fn accept(
        &self,
        outcome: Outcome,
        shortlist: &mut Shortlist,
        excluded: &HashSet<Key>,
    ) -> Option<String> {
        match (self, outcome) {
            (Call::FindValue(_), Outcome::Value(value)) => Some(value),
            (_, Outcome::Value(_)) => None,
            (_, Outcome::Closer(contacts)) => {
                shortlist.extend(contacts.into_iter().filter(|c| !excluded.contains(&c.id)));
                None
            }
        }
    }
}

/// A walk queries at most α peers per round until a round leaves the closest
/// contact unchanged. From then on every uncontacted candidate is queried each
/// round, and the next round without a closer contact ends the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Normal,
    ProbingRest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue(Phase),
    Converged,
}

impl Phase {
    fn fan_out(self) -> usize {
        match self {
            Phase::Normal => A_PARAM,
            Phase::ProbingRest => usize::MAX,
        }
    }

    fn advance(self, closest_changed: bool) -> Step {
        match (self, closest_changed) {
            (Phase::Normal, true) => Step::Continue(Phase::Normal),
            (Phase::Normal, false) | (Phase::ProbingRest, true) => {
                Step::Continue(Phase::ProbingRest)
            }
            (Phase::ProbingRest, false) => Step::Converged,
        }
    }
}

impl<T: Transport> Kademlia<T> {
    /// Iteratively queries the overlay for `call`'s target.
    ///
    /// Unreachable or silent peers are dropped from the shortlist, so the
    /// walk only fails when there is nobody to start from.
    pub async fn walk(&self, call: Call) -> Result<WalkResult, DhtError> {
        let target = call.target();
        let mut shortlist = self.routes.closest(&target, A_PARAM).await;
        let mut closest = match shortlist.closest() {
            Some(contact) => Some(contact.id),
            None => return Err(DhtError::NoKnownContacts),
        };

        let mut contacted = HashSet::new();
        // the local node and every peer that failed once
        let mut excluded = HashSet::from([self.local.id]);
        let mut phase = Phase::Normal;
        let mut round = 0usize;

        loop {
            round += 1;

            let selected: Vec<Contact> = shortlist
                .iter()
                .filter(|c| !contacted.contains(&c.id))
                .take(phase.fan_out())
                .copied()
                .collect();

            trace!(
                "walk {:?} round {} ({:?}): querying {} of {} candidates",
                call,
                round,
                phase,
                selected.len(),
                shortlist.len()
            );

            let mut inflight = JoinSet::new();
            for contact in selected {
                match call.issue(self.transport.as_ref(), &contact).await {
                    Ok(issued) => {
                        contacted.insert(contact.id);
                        inflight.spawn(async move { (contact, issued.wait().await) });
                    }
                    Err(source) => {
                        debug!("{}", CallFailed { contact, source });
                        shortlist.remove(&contact.id);
                        excluded.insert(contact.id);
                    }
                }
            }

            while let Some(joined) = inflight.join_next().await {
                let (contact, result) = match joined {
                    Ok(joined) => joined,
                    Err(e) => {
                        warn!("walk call task died: {}", e);
                        continue;
                    }
                };

                match result {
                    Ok(Answer { from, outcome }) => {
                        self.append_with_refresh(from).await;

                        if let Some(value) = call.accept(outcome, &mut shortlist, &excluded) {
                            debug!("walk {:?} found value at {}", call, from);
                            return Ok(WalkResult::Value { value, from });
                        }
                    }
                    Err(source) => {
                        debug!("{}", CallFailed { contact, source });
                        shortlist.remove(&contact.id);
                        excluded.insert(contact.id);
                    }
                }
            }

            let now_closest = shortlist.closest().map(|c| c.id);
            let changed = now_closest != closest;
            closest = now_closest;

            match phase.advance(changed) {
                Step::Continue(next) => phase = next,
                Step::Converged => {
                    trace!(
                        "walk {:?} converged after {} rounds on {} contacts",
                        call,
                        round,
                        shortlist.len()
                    );
                    return Ok(WalkResult::Contacts(shortlist.sorted_contacts()));
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        kademlia::{Reply, Request},
        pending::{PendingCalls, SessionId},
        transport::Response,
        KEY_LEN, K_PARAM,
    };
    use std::{
        collections::HashMap,
        net::SocketAddr,
        sync::{Arc, Mutex},
    };
    use tokio::time::{Duration, Instant};

    /// In-process network where every peer gives a fixed answer.
    #[derive(Default)]
    struct FakeNet {
        answers: HashMap<Key, Vec<Contact>>,
        values: HashMap<Key, String>,
        silent: HashSet<Key>,
        unreachable: HashSet<Key>,
        contacted: Mutex<Vec<Key>>,
        timeout: Option<Duration>,
        nodes: Arc<PendingCalls<Response<Vec<Contact>>>>,
        found: Arc<PendingCalls<Response<FindValueResult>>>,
        acks: Arc<PendingCalls<Response<()>>>,
    }

    impl FakeNet {
        fn answer<V>(
            &self,
            calls: &Arc<PendingCalls<Response<V>>>,
            dst: &Contact,
            body: V,
        ) -> Result<Pending<V>, RequestError> {
            if self.unreachable.contains(&dst.id) {
                return Err(RequestError::Unreachable(*dst));
            }
            self.contacted.lock().unwrap().push(dst.id);

            let session = SessionId::random()?;
            let timeout = self.timeout.unwrap_or(Duration::from_millis(20));
            let call = calls.register(session, Instant::now() + timeout)?;
            if !self.silent.contains(&dst.id) {
                calls.resolve(&session, Response { from: *dst, body });
            }
            Ok(call)
        }

        fn closer(&self, dst: &Contact) -> Vec<Contact> {
            self.answers.get(&dst.id).cloned().unwrap_or_default()
        }

        fn contacted(&self) -> Vec<Key> {
            self.contacted.lock().unwrap().clone()
        }
    }

    impl Transport for FakeNet {
        async fn ping(&self, dst: &Contact) -> Result<Pending<()>, RequestError> {
            self.answer(&self.acks, dst, ())
        }

        async fn store(&self, _: &Key, _: &str, dst: &Contact) -> Result<Pending<()>, RequestError> {
            self.answer(&self.acks, dst, ())
        }

        async fn find_nodes(&self, _: &Key, dst: &Contact) -> Result<Pending<Vec<Contact>>, RequestError> {
            self.answer(&self.nodes, dst, self.closer(dst))
        }

        async fn find_value(
            &self,
            _: &Key,
            dst: &Contact,
        ) -> Result<Pending<FindValueResult>, RequestError> {
            let body = match self.values.get(&dst.id) {
                Some(value) => FindValueResult::Value(value.clone()),
                None => FindValueResult::Nodes(self.closer(dst)),
            };
            self.answer(&self.found, dst, body)
        }
    }

    fn local() -> Contact {
        Contact::new(Key::from([0; KEY_LEN]), SocketAddr::from(([127, 0, 0, 1], 1)))
    }

    fn target() -> Key {
        Key::hash(b"target")
    }

    /// `n` peers, closest to [target] first.
    fn peers(n: usize) -> Vec<Contact> {
        let mut peers: Vec<Contact> = (0..n)
            .map(|i| {
                Contact::new(
                    Key::hash(&(i as u32).to_be_bytes()),
                    SocketAddr::from(([127, 0, 0, 1], 2000 + i as u16)),
                )
            })
            .collect();
        peers.sort_by_key(|c| c.id.distance(&target()));
        peers
    }

    /// Every peer knows the three peers just closer to the target than itself.
    fn chain(peers: &[Contact]) -> FakeNet {
        let mut net = FakeNet::default();
        for (rank, peer) in peers.iter().enumerate() {
            net.answers
                .insert(peer.id, peers[rank.saturating_sub(3)..rank].to_vec());
        }
        net
    }

    /// Contacts sharing no prefix bit with [local], all in bucket 0.
    fn bucket_zero(n: usize) -> Vec<Contact> {
        (0..n)
            .map(|i| {
                let mut id = [0u8; KEY_LEN];
                id[0] = 0x80;
                id[KEY_LEN - 1] = i as u8;
                Contact::new(Key::from(id), SocketAddr::from(([127, 0, 0, 1], 3000 + i as u16)))
            })
            .collect()
    }

    fn node(seed: &[Contact], net: FakeNet) -> Kademlia<FakeNet> {
        Kademlia::with_transport(local(), seed, net).unwrap()
    }

    fn contacts(result: WalkResult) -> Vec<Contact> {
        match result {
            WalkResult::Contacts(contacts) => contacts,
            WalkResult::Value { value, .. } => panic!("unexpected value {}", value),
        }
    }

    #[test]
    fn phase_transitions() {
        assert_eq!(Phase::Normal.advance(true), Step::Continue(Phase::Normal));
        assert_eq!(
            Phase::Normal.advance(false),
            Step::Continue(Phase::ProbingRest)
        );
        assert_eq!(
            Phase::ProbingRest.advance(true),
            Step::Continue(Phase::ProbingRest)
        );
        assert_eq!(Phase::ProbingRest.advance(false), Step::Converged);

        assert_eq!(Phase::Normal.fan_out(), A_PARAM);
        assert!(Phase::ProbingRest.fan_out() > A_PARAM);
    }

    #[tokio::test]
    async fn empty_table_has_no_contacts() {
        let node = node(&[], FakeNet::default());
        let err = node.walk(Call::FindNodes(target())).await.unwrap_err();
        assert!(matches!(err, DhtError::NoKnownContacts));
    }

    #[tokio::test]
    async fn converges_on_closest() {
        let peers = peers(30);
        let seed = &peers[27..];
        let node = node(seed, chain(&peers));

        let initial = node.routes.closest(&target(), A_PARAM).await;
        let initial_distance = initial.closest().unwrap().id.distance(&target());

        let found = contacts(node.walk(Call::FindNodes(target())).await.unwrap());

        assert_eq!(found[0], peers[0]);
        assert!(found[0].id.distance(&target()) <= initial_distance);
        for pair in found.windows(2) {
            assert!(pair[0].id.distance(&target()) < pair[1].id.distance(&target()));
        }

        // nobody is asked twice
        let contacted = node.transport.contacted();
        let unique: HashSet<Key> = contacted.iter().copied().collect();
        assert_eq!(unique.len(), contacted.len());
        assert!(contacted.len() <= peers.len());

        // responders end up in the routing table
        assert!(node.routes.contains(&peers[0].id).await);
    }

    #[tokio::test]
    async fn never_queries_itself() {
        let peers = peers(4);
        let mut net = chain(&peers);
        net.answers.get_mut(&peers[3].id).unwrap().push(local());

        let node = node(&peers[3..], net);
        let found = contacts(node.walk(Call::FindNodes(target())).await.unwrap());

        assert!(!found.contains(&local()));
        assert!(!node.transport.contacted().contains(&local().id));
    }

    #[tokio::test]
    async fn silent_peers_are_dropped() {
        let peers = peers(5);
        let mut net = chain(&peers);
        net.silent = peers.iter().map(|c| c.id).collect();

        let node = node(&peers, net);
        let found = contacts(node.walk(Call::FindNodes(target())).await.unwrap());

        assert!(found.is_empty());
        assert_eq!(node.transport.contacted().len(), A_PARAM);
        assert!(node.transport.nodes.is_empty());
    }

    #[tokio::test]
    async fn undispatchable_peers_are_dropped() {
        let peers = peers(6);
        let mut net = chain(&peers);
        net.unreachable.insert(peers[0].id);

        let node = node(&peers[3..], net);
        let found = contacts(node.walk(Call::FindNodes(target())).await.unwrap());

        assert!(!found.contains(&peers[0]));
        assert_eq!(found[0], peers[1]);
        assert!(!node.transport.contacted().contains(&peers[0].id));
    }

    #[tokio::test]
    async fn probes_past_alpha_dead_ends() {
        let peers = peers(8);
        let mut net = FakeNet::default();
        // the seeds are closer than the four contacts they reveal, but only
        // the farthest of those leads on to the target
        net.answers.insert(peers[1].id, peers[4..].to_vec());
        net.answers.insert(peers[7].id, vec![peers[0]]);

        let node = node(&peers[1..4], net);
        let found = contacts(node.walk(Call::FindNodes(target())).await.unwrap());

        assert_eq!(found[0], peers[0]);
        assert_eq!(found.len(), peers.len());
    }

    #[tokio::test]
    async fn probing_keeps_going_while_it_improves() {
        let peers = peers(13);
        let mut net = FakeNet::default();
        net.answers.insert(peers[3].id, peers[6..10].to_vec());
        // found while probing: two closer contacts and two more to check
        net.answers
            .insert(peers[9].id, vec![peers[1], peers[2], peers[10], peers[11]]);
        net.answers.insert(peers[1].id, vec![peers[12]]);

        let node = node(&peers[3..6], net);
        let found = contacts(node.walk(Call::FindNodes(target())).await.unwrap());
        assert_eq!(found[0], peers[1]);

        // the round after the improvement queries every candidate at once and
        // ends the walk, leaving the contact it revealed unasked
        let contacted: HashSet<Key> = node.transport.contacted().into_iter().collect();
        let expected: HashSet<Key> = peers[1..12].iter().map(|c| c.id).collect();
        assert_eq!(contacted, expected);
        assert!(found.contains(&peers[12]));
    }

    #[tokio::test]
    async fn full_bucket_keeps_live_oldest() {
        let contacts = bucket_zero(K_PARAM + 1);
        let (seed, newcomer) = (&contacts[..K_PARAM], contacts[K_PARAM]);
        let oldest = seed[0];
        let node = node(seed, FakeNet::default());

        node.append_with_refresh(newcomer).await;
        for _ in 0..200 {
            if node.routes.contacts().await.last() == Some(&oldest) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(node.routes.contacts().await.last(), Some(&oldest));
        assert!(!node.routes.contains(&newcomer.id).await);
        assert_eq!(node.routes.len().await, K_PARAM);
        assert_eq!(node.transport.contacted(), vec![oldest.id]);
    }

    #[tokio::test]
    async fn full_bucket_replaces_silent_oldest() {
        let contacts = bucket_zero(K_PARAM + 1);
        let (seed, newcomer) = (&contacts[..K_PARAM], contacts[K_PARAM]);
        let oldest = seed[0];
        let mut net = FakeNet::default();
        net.silent.insert(oldest.id);
        let node = node(seed, net);

        node.append_with_refresh(newcomer).await;
        for _ in 0..200 {
            if node.routes.contains(&newcomer.id).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(node.routes.contains(&newcomer.id).await);
        assert!(!node.routes.contains(&oldest.id).await);
        assert_eq!(node.routes.len().await, K_PARAM);
    }

    #[tokio::test]
    async fn full_bucket_does_not_delay_replies() {
        let contacts = bucket_zero(K_PARAM + 1);
        let (seed, newcomer) = (&contacts[..K_PARAM], contacts[K_PARAM]);
        let mut net = FakeNet::default();
        net.silent.insert(seed[0].id);
        net.timeout = Some(Duration::from_secs(10));
        let node = node(seed, net);

        let reply = tokio::time::timeout(
            Duration::from_millis(200),
            node.handle_request(&Request::Ping, newcomer),
        )
        .await
        .expect("reply held back by the eviction ping");

        assert!(matches!(reply, Reply::Ping));

        // the eviction ping is still waiting on the silent contact
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(node.transport.acks.len(), 1);
    }

    #[tokio::test]
    async fn find_value_stops_early() {
        let peers = peers(20);
        let mut net = chain(&peers);
        net.values.insert(peers[10].id, "hello".to_owned());

        let node = node(&peers[17..], net);
        match node.walk(Call::FindValue(target())).await.unwrap() {
            WalkResult::Value { value, from } => {
                assert_eq!(value, "hello");
                assert_eq!(from, peers[10]);
            }
            WalkResult::Contacts(contacts) => panic!("value not found, got {:?}", contacts),
        }

        assert!(!node.transport.contacted().contains(&peers[0].id));
    }

    #[tokio::test]
    async fn missing_value_returns_contacts() {
        let peers = peers(6);
        let node = node(&peers[3..], chain(&peers));

        let found = contacts(node.walk(Call::FindValue(target())).await.unwrap());
        assert_eq!(found[0], peers[0]);
    }

    #[tokio::test]
    async fn abandoned_walk_cleans_up_pending_calls() {
        let peers = peers(3);
        let mut net = chain(&peers);
        net.silent = peers.iter().map(|c| c.id).collect();
        net.timeout = Some(Duration::from_secs(10));
        let node = node(&peers, net);

        let walk = tokio::spawn({
            let node = node.clone();
            async move { node.walk(Call::FindNodes(target())).await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(node.transport.nodes.len(), peers.len());

        walk.abort();
        assert!(walk.await.unwrap_err().is_cancelled());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(node.transport.nodes.is_empty());
    }
}
