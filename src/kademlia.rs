use async_channel as mpmc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::{debug, error, info, trace, warn};

use crate::{
    key::{Key, KeyError},
    lookup::{Call, WalkResult},
    routing::{BucketFull, Contact, ParseContactError, RoutingError, RoutingTable},
    rpc::{InitRpcError, ReqContext, Rpc},
    transport::{Pending, RequestError, Response, Transport},
    A_PARAM, K_PARAM, TIMEOUT,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    Ping,
    Store(Key, String),
    FindNode(Key),
    FindValue(Key),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum FindValueResult {
    Nodes(Vec<Contact>),
    Value(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Reply {
    Ping,
    Store,
    FindNode(Vec<Contact>),
    FindValue(FindValueResult),
}

pub struct KademliaBuilder {
    bootstrap_nodes: Vec<Contact>,
    address: Option<SocketAddr>,
    key: Option<Key>,
    timeout: Duration,
}

/// A DHT node. Cheap to clone, clones share the same state.
pub struct Kademlia<T = Rpc> {
    pub(crate) routes: Arc<RoutingTable>,
    store: Arc<Mutex<HashMap<Key, String>>>,
    pub(crate) transport: Arc<T>,
    pub(crate) local: Contact,
    /// Held by user handles only. The UDP listener stops once the last one
    /// is dropped.
    listening: Option<Arc<oneshot::Sender<()>>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ReadBootstrapError {
    #[error("can't parse node: {0}")]
    CantParseNode(#[from] ParseContactError),
    #[error("can't read bootstrap nodes: {0}")]
    IoError(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    #[error("no known contacts to start a lookup from")]
    NoKnownContacts,
    #[error("value with key {0} not found")]
    NotFound(Key),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("can't start node: {0}")]
    Start(#[from] InitRpcError),
}

pub type Result<T> = core::result::Result<T, RequestError>;

impl Default for KademliaBuilder {
    fn default() -> Self {
        KademliaBuilder {
            bootstrap_nodes: Vec::new(),
            address: None,
            key: None,
            timeout: Duration::from_millis(TIMEOUT),
        }
    }
}

impl KademliaBuilder {
    pub fn new() -> Self {
        KademliaBuilder::default()
    }

    /// Identifier of the node, random if not set.
    pub fn key(&mut self, key: Key) -> &mut Self {
        self.key = Some(key);
        self
    }

    pub fn address(&mut self, address: SocketAddr) -> &mut Self {
        self.address = Some(address);
        self
    }

    /// How long a single call waits for its reply.
    pub fn timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = timeout;
        self
    }

    pub fn bootstrap(&mut self, nodes: Vec<Contact>) -> &mut Self {
        self.bootstrap_nodes = nodes;
        self
    }

    /// Read bootstrap nodes from reader, one `<id>@<address>` per line.
    pub fn bootstrap_read(
        &mut self,
        reader: &mut impl Read,
    ) -> std::result::Result<&mut Self, ReadBootstrapError> {
        let mut buf = String::new();
        reader.read_to_string(&mut buf)?;

        self.bootstrap_nodes = buf
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::parse)
            .collect::<std::result::Result<_, _>>()?;

        Ok(self)
    }

    pub async fn start(&mut self) -> std::result::Result<Kademlia, DhtError> {
        let address = self
            .address
            .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));

        let key = match self.key {
            Some(key) => key,
            None => Key::random()?,
        };

        if self.bootstrap_nodes.iter().any(|c| c.id == key) {
            return Err(RoutingError::SelfInSeed(key).into());
        }

        let (req_tx, req_rx) = mpsc::channel(1024);
        let (close_tx, close_rx) = oneshot::channel();
        let rpc = Rpc::new(address, key, self.timeout, req_tx, close_rx).await?;

        let mut node = Kademlia::with_transport(rpc.local(), &self.bootstrap_nodes, rpc)?;
        info!("new node created {}", node.local);

        node.detached().start_req_handler(req_rx);
        node.listening = Some(Arc::new(close_tx));

        Ok(node)
    }
}

impl<T> Clone for Kademlia<T> {
    fn clone(&self) -> Self {
        Kademlia {
            routes: Arc::clone(&self.routes),
            store: Arc::clone(&self.store),
            transport: Arc::clone(&self.transport),
            local: self.local,
            listening: self.listening.clone(),
        }
    }
}

impl<T> Kademlia<T> {
    /// A clone that doesn't keep the listener alive.
    fn detached(&self) -> Self {
        Kademlia {
            listening: None,
            ..self.clone()
        }
    }
}

impl Kademlia {
    pub fn setup() -> KademliaBuilder {
        KademliaBuilder::new()
    }

    /// Starts a node with a random key on an ephemeral port and no seeds.
    pub async fn start() -> std::result::Result<Self, DhtError> {
        KademliaBuilder::new().start().await
    }

    fn start_req_handler(self, mut rx: mpsc::Receiver<ReqContext>) {
        tokio::spawn(async move {
            while let Some(req_context) = rx.recv().await {
                let node = self.clone();

                tokio::spawn(async move {
                    let rep = node
                        .handle_request(req_context.get_req(), req_context.get_src())
                        .await;
                    if let Err(e) = node.transport.reply(req_context, rep).await {
                        error!("reply send error: {}", e)
                    }
                });
            }

            debug!("channel closed, since sender is dead.");
        });
    }
}

impl<T: Transport> Kademlia<T> {
    /// Builds a node on top of an already running transport.
    pub fn with_transport(
        local: Contact,
        seed: &[Contact],
        transport: T,
    ) -> std::result::Result<Self, DhtError> {
        Ok(Kademlia {
            routes: Arc::new(RoutingTable::new(local, seed)?),
            store: Arc::new(Mutex::new(HashMap::new())),
            transport: Arc::new(transport),
            local,
            listening: None,
        })
    }

    pub fn local(&self) -> Contact {
        self.local
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Serves a request from `src`, who is remembered as a live contact.
    pub async fn handle_request(&self, req: &Request, src: Contact) -> Reply {
        self.append_with_refresh(src).await;

        match req {
            Request::Ping => Reply::Ping,
            Request::Store(k, v) => {
                trace!("{}: storing {}", src, k);
                self.store.lock().await.insert(*k, v.clone());

                Reply::Store
            }
            Request::FindNode(id) => Reply::FindNode(self.closest_known(id, &src).await),
            Request::FindValue(k) => {
                let lookup_res = self.store.lock().await.get(k).cloned();

                match lookup_res {
                    Some(v) => Reply::FindValue(FindValueResult::Value(v)),
                    None => Reply::FindValue(FindValueResult::Nodes(
                        self.closest_known(k, &src).await,
                    )),
                }
            }
        }
    }

    async fn closest_known(&self, target: &Key, requester: &Contact) -> Vec<Contact> {
        self.routes
            .closest(target, K_PARAM + 1)
            .await
            .iter()
            .filter(|c| c.id != requester.id)
            .take(K_PARAM)
            .copied()
            .collect()
    }

    /// Waits for a dispatched call. A peer that times out is forgotten.
    async fn settle<R>(
        &self,
        what: &str,
        dst: &Contact,
        dispatched: Result<Pending<R>>,
    ) -> Result<Response<R>> {
        let result = match dispatched {
            Ok(call) => call.wait().await.map_err(RequestError::from),
            Err(e) => Err(e),
        };

        if let Err(err) = &result {
            if err.is_timeout() {
                debug!("DST {}: {} req timeout", dst, what);
                self.routes.remove(&dst.id).await;
            } else {
                warn!("DST {}: {} req error: {}", dst, what, err);
            }
        }

        result
    }

    pub async fn ping_raw(&self, dst: &Contact) -> Result<Response<()>> {
        let dispatched = self.transport.ping(dst).await;
        self.settle("ping", dst, dispatched).await
    }

    /// Pings dst and saves it to the routing table if it is connectable.
    pub async fn ping(&self, dst: &Contact) -> Result<()> {
        let response = self.ping_raw(dst).await?;
        self.append_with_refresh(response.from).await;
        Ok(())
    }

    /// Asks dst to store `v` under its hash.
    pub async fn store(&self, dst: &Contact, v: &str) -> Result<()> {
        let k = Key::hash(v.as_bytes());
        let dispatched = self.transport.store(&k, v, dst).await;
        let response = self.settle("store", dst, dispatched).await?;
        self.append_with_refresh(response.from).await;
        Ok(())
    }

    pub async fn find_node(&self, dst: &Contact, id: &Key) -> Result<Vec<Contact>> {
        let dispatched = self.transport.find_nodes(id, dst).await;
        let response = self.settle("find node", dst, dispatched).await?;
        self.append_with_refresh(response.from).await;
        Ok(response.body)
    }

    pub async fn find_value(&self, dst: &Contact, k: &Key) -> Result<FindValueResult> {
        let dispatched = self.transport.find_value(k, dst).await;
        let response = self.settle("find value", dst, dispatched).await?;
        self.append_with_refresh(response.from).await;
        Ok(response.body)
    }

    /// Stores `v` at every destination using [A_PARAM] workers. Returns the
    /// destinations that acknowledged.
    pub async fn store_many(&self, dsts: &[Contact], v: &str) -> Vec<Contact> {
        let (jobs_sender, jobs_receiver) = mpmc::unbounded();
        let (results_sender, mut results_receiver) = mpsc::unbounded_channel();

        for _ in 0..A_PARAM.min(dsts.len()) {
            let jobs: mpmc::Receiver<Contact> = jobs_receiver.clone();
            let results = results_sender.clone();
            let node = self.clone();
            let v = v.to_owned();
            tokio::spawn(async move {
                while let Ok(dst) = jobs.recv().await {
                    trace!("store_many: new job: {}", dst);

                    let stored = node.store(&dst, &v).await;
                    if results.send((dst, stored)).is_err() {
                        break;
                    }
                }
            });
        }

        drop(results_sender);
        drop(jobs_receiver);

        for dst in dsts {
            if jobs_sender.send(*dst).await.is_err() {
                break;
            }
        }

        drop(jobs_sender);

        let mut stored = Vec::with_capacity(dsts.len());
        while let Some((dst, result)) = results_receiver.recv().await {
            match result {
                Ok(()) => stored.push(dst),
                Err(e) => warn!("failed to store at {}: {}", dst, e),
            }
        }

        stored
    }

    /// Looks up the neighbourhood of the local node to populate the routing
    /// table.
    pub async fn join(&self) -> std::result::Result<(), DhtError> {
        let contacts = self.lookup_nodes(Call::FindNodes(self.local.id)).await?;

        info!("acquainted with {} nodes", contacts.len());
        for contact in &contacts {
            info!("\t{}", contact);
        }

        Ok(())
    }

    /// Stores `v` at the nodes closest to its hash and returns that hash.
    ///
    /// Only the first [K_PARAM] contacts of the converged shortlist are asked
    /// to store the value.
    pub async fn put(&self, v: &str) -> std::result::Result<Key, DhtError> {
        let k = Key::hash(v.as_bytes());
        debug!("key: {}", k);

        let mut candidates = self.lookup_nodes(Call::Store(k)).await?;
        candidates.truncate(K_PARAM);

        let stored = self.store_many(&candidates, v).await;
        if stored.is_empty() {
            warn!("value with key {} was not stored at any node", k);
        } else {
            info!("stored value with key {} at {} nodes", k, stored.len());
            for contact in &stored {
                debug!("\t{}", contact);
            }
        }

        Ok(k)
    }

    pub async fn get(&self, k: &Key) -> std::result::Result<String, DhtError> {
        match self.walk(Call::FindValue(*k)).await? {
            WalkResult::Value { value, from } => {
                debug!("value with key {} found at {}", k, from);
                Ok(value)
            }
            WalkResult::Contacts(_) => Err(DhtError::NotFound(*k)),
        }
    }

    async fn lookup_nodes(&self, call: Call) -> std::result::Result<Vec<Contact>, DhtError> {
        match self.walk(call).await? {
            WalkResult::Contacts(contacts) => Ok(contacts),
            // only value lookups end on a value
            WalkResult::Value { from, .. } => Ok(vec![from]),
        }
    }

    /// Appends a contact to the routing table. When its bucket is full the
    /// least recently seen contact is pinged in the background and replaced
    /// only if it doesn't answer.
    pub async fn append_with_refresh(&self, contact: Contact) {
        if let Err(full) = self.routes.update(contact).await {
            let node = self.detached();
            tokio::spawn(async move { node.resolve_full_bucket(full).await });
        }
    }

    async fn resolve_full_bucket(&self, full: BucketFull) {
        match self.ping_raw(&full.oldest).await {
            Ok(_) => {
                debug!("{}: bucket full, discarding {}", full.oldest, full.candidate);
                _ = self.routes.update(full.oldest).await;
            }
            Err(_) => {
                debug!("evicting {} in favour of {}", full.oldest, full.candidate);
                if let Err(e) = self.routes.replace(&full.oldest.id, full.candidate).await {
                    warn!("{}: can't update routing table: {}", full.candidate.addr, e);
                }
            }
        }
    }

    pub async fn log_routes(&self) {
        for contact in self.routes.contacts().await {
            info!("{} at {}", contact.id, self.local.id.distance(&contact.id).zeroes_in_prefix());
        }
    }
}
