use std::future::Future;

use crate::{
    kademlia::FindValueResult,
    key::{Key, KeyError},
    pending::{CallError, DuplicateSession, PendingCall},
    routing::Contact,
    rpc::SendMsgError,
};

/// A resolved call: who answered and what they said.
#[derive(Debug, Clone)]
pub struct Response<T> {
    pub from: Contact,
    pub body: T,
}

/// Handle of a dispatched call of one kind.
pub type Pending<T> = PendingCall<Response<T>>;

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("received unknown reply")]
    UnknownResponse,
    #[error(transparent)]
    CantSendMsg(#[from] SendMsgError),
    #[error(transparent)]
    DuplicateSession(#[from] DuplicateSession),
    #[error("can't mint session id: {0}")]
    Session(#[from] KeyError),
    #[error("{0} is unreachable")]
    Unreachable(Contact),
}

impl RequestError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RequestError::Call(CallError::Timeout))
    }
}

/// Sends requests to remote peers.
///
/// Every method returns once the request is on its way; an error means it
/// could not be dispatched at all. The returned handle resolves to the reply
/// or to a timeout.
pub trait Transport: Send + Sync + 'static {
    fn ping(&self, dst: &Contact) -> impl Future<Output = Result<Pending<()>, RequestError>> + Send;

    fn store(
        &self,
        key: &Key,
        value: &str,
        dst: &Contact,
    ) -> impl Future<Output = Result<Pending<()>, RequestError>> + Send;

    fn find_nodes(
        &self,
        target: &Key,
        dst: &Contact,
    ) -> impl Future<Output = Result<Pending<Vec<Contact>>, RequestError>> + Send;

    fn find_value(
        &self,
        key: &Key,
        dst: &Contact,
    ) -> impl Future<Output = Result<Pending<FindValueResult>, RequestError>> + Send;
}
