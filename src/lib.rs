mod kademlia;
mod key;
mod lookup;
mod pending;
mod routing;
mod rpc;
mod shortlist;
mod transport;

pub use kademlia::{
    DhtError, FindValueResult, Kademlia, KademliaBuilder, ReadBootstrapError, Reply, Request,
};
pub use key::{Distance, Key, KeyError, PrefixFlips};
pub use lookup::{Call, CallFailed, WalkResult};
pub use pending::{CallError, DuplicateSession, PendingCall, PendingCalls, SessionId};
pub use routing::{BucketFull, Contact, ParseContactError, RoutingError, RoutingTable};
pub use rpc::{InitRpcError, ReqContext, Rpc, SendMsgError};
pub use shortlist::Shortlist;
pub use transport::{Pending, RequestError, Response, Transport};

/// Length of key in bytes
pub const KEY_LEN: usize = 20;
/// Number of buckets
pub const N_BUCKETS: usize = KEY_LEN * 8;
/// Entries per bucket
pub const K_PARAM: usize = 20;
/// Max message length
pub const MESSAGE_LEN: usize = 8196;
/// Default timeout in milliseconds
pub const TIMEOUT: u64 = 5000;
/// Number of parallel requests
pub const A_PARAM: usize = 3;
