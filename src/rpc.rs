use serde::{Deserialize, Serialize};
use std::{io, net::SocketAddr, sync::Arc};
use tokio::{
    net::UdpSocket,
    sync::{mpsc, oneshot},
    time::{Duration, Instant},
};
use tracing::{debug, trace, warn};

use crate::{
    kademlia::{FindValueResult, Reply, Request},
    key::Key,
    pending::{PendingCalls, SessionId},
    routing::Contact,
    transport::{Pending, RequestError, Response, Transport},
    MESSAGE_LEN,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcMessage {
    session: SessionId,
    src: Contact,
    dst: Key,
    msg: Message,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    Request(Request),
    Reply(Reply),
}

#[derive(Debug, thiserror::Error)]
#[error("can't bind udp socket: {0}")]
pub struct InitRpcError(#[from] io::Error);

#[derive(Debug, thiserror::Error)]
pub enum SendMsgError {
    #[error("can't encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("encoded message of {0} bytes exceeds the datagram limit")]
    TooLong(usize),
    #[error("can't send datagram: {0}")]
    Io(#[from] io::Error),
}

/// An inbound request waiting for the node to answer it.
#[derive(Debug)]
pub struct ReqContext {
    session: SessionId,
    src: Contact,
    req: Request,
}

impl ReqContext {
    pub fn get_req(&self) -> &Request {
        &self.req
    }

    pub fn get_src(&self) -> Contact {
        self.src
    }
}

/// Reply channels of every call in flight, one table per call kind.
#[derive(Default)]
struct Inflight {
    ping: Arc<PendingCalls<Response<()>>>,
    store: Arc<PendingCalls<Response<()>>>,
    find_node: Arc<PendingCalls<Response<Vec<Contact>>>>,
    find_value: Arc<PendingCalls<Response<FindValueResult>>>,
}

impl Inflight {
    fn dispatch(&self, session: SessionId, from: Contact, rep: Reply) {
        let delivered = match rep {
            Reply::Ping => self.ping.resolve(&session, Response { from, body: () }),
            Reply::Store => self.store.resolve(&session, Response { from, body: () }),
            Reply::FindNode(nodes) => self.find_node.resolve(&session, Response { from, body: nodes }),
            Reply::FindValue(result) => self
                .find_value
                .resolve(&session, Response { from, body: result }),
        };

        if !delivered {
            warn!("{}: unsolicited or late reply, ignoring.", from);
        }
    }
}

/// UDP transport. Requests addressed to this node are forwarded to the
/// channel given to [Rpc::new], replies are matched to their callers.
///
/// The listener runs until `closed` resolves, either by a send or by its
/// sender being dropped.
#[derive(Clone)]
pub struct Rpc {
    socket: Arc<UdpSocket>,
    local: Contact,
    inflight: Arc<Inflight>,
    timeout: Duration,
}

impl Rpc {
    pub async fn new(
        addr: SocketAddr,
        local_id: Key,
        timeout: Duration,
        req_tx: mpsc::Sender<ReqContext>,
        closed: oneshot::Receiver<()>,
    ) -> Result<Rpc, InitRpcError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local = Contact::new(local_id, socket.local_addr()?);
        let inflight = Arc::new(Inflight::default());

        tokio::spawn(listen(
            Arc::clone(&socket),
            local,
            Arc::clone(&inflight),
            req_tx,
            closed,
        ));

        Ok(Rpc {
            socket,
            local,
            inflight,
            timeout,
        })
    }

    pub fn local(&self) -> Contact {
        self.local
    }

    pub fn get_address(&self) -> SocketAddr {
        self.local.addr
    }

    pub async fn reply(&self, ctx: ReqContext, rep: Reply) -> Result<(), SendMsgError> {
        let rmsg = RpcMessage {
            session: ctx.session,
            src: self.local,
            dst: ctx.src.id,
            msg: Message::Reply(rep),
        };

        self.send_msg(&rmsg, ctx.src.addr).await
    }

    async fn send_msg(&self, rmsg: &RpcMessage, addr: SocketAddr) -> Result<(), SendMsgError> {
        let enc_msg = rmp_serde::to_vec(rmsg)?;
        if enc_msg.len() > MESSAGE_LEN {
            return Err(SendMsgError::TooLong(enc_msg.len()));
        }

        self.socket.send_to(&enc_msg, addr).await?;
        trace!("| OUT | {:?} ==> {}", rmsg.msg, rmsg.dst);

        Ok(())
    }

    async fn send_req<T>(
        &self,
        calls: &Arc<PendingCalls<Response<T>>>,
        req: Request,
        dst: &Contact,
    ) -> Result<Pending<T>, RequestError> {
        let session = SessionId::random()?;
        let call = calls.register(session, Instant::now() + self.timeout)?;

        let rmsg = RpcMessage {
            session,
            src: self.local,
            dst: dst.id,
            msg: Message::Request(req),
        };
        self.send_msg(&rmsg, dst.addr).await?;

        Ok(call)
    }
}

impl Transport for Rpc {
    async fn ping(&self, dst: &Contact) -> Result<Pending<()>, RequestError> {
        self.send_req(&self.inflight.ping, Request::Ping, dst).await
    }

    async fn store(&self, key: &Key, value: &str, dst: &Contact) -> Result<Pending<()>, RequestError> {
        self.send_req(
            &self.inflight.store,
            Request::Store(*key, value.to_owned()),
            dst,
        )
        .await
    }

    async fn find_nodes(
        &self,
        target: &Key,
        dst: &Contact,
    ) -> Result<Pending<Vec<Contact>>, RequestError> {
        self.send_req(&self.inflight.find_node, Request::FindNode(*target), dst)
            .await
    }

    async fn find_value(
        &self,
        key: &Key,
        dst: &Contact,
    ) -> Result<Pending<FindValueResult>, RequestError> {
        self.send_req(&self.inflight.find_value, Request::FindValue(*key), dst)
            .await
    }
}

async fn listen(
    socket: Arc<UdpSocket>,
    local: Contact,
    inflight: Arc<Inflight>,
    req_tx: mpsc::Sender<ReqContext>,
    mut closed: oneshot::Receiver<()>,
) {
    let mut buf = vec![0u8; MESSAGE_LEN];
    loop {
        let received = tokio::select! {
            _ = &mut closed => {
                debug!("closing rpc listener of {}.", local);
                break;
            }
            received = socket.recv_from(&mut buf) => received,
        };

        let (len, src_addr) = match received {
            Ok(received) => received,
            Err(e) => {
                warn!("can't receive datagram: {}", e);
                continue;
            }
        };

        let mut rmsg: RpcMessage = match rmp_serde::from_slice(&buf[..len]) {
            Ok(rmsg) => rmsg,
            Err(e) => {
                warn!("{}: can't decode message: {}", src_addr, e);
                continue;
            }
        };
        rmsg.src.addr = src_addr;

        trace!("|  IN | {:?} <== {}", rmsg.msg, rmsg.src);

        if rmsg.dst != local.id {
            warn!("{}: message is addressed to {}, ignoring.", src_addr, rmsg.dst);
            continue;
        }

        match rmsg.msg {
            Message::Request(req) => {
                let ctx = ReqContext {
                    session: rmsg.session,
                    src: rmsg.src,
                    req,
                };

                if req_tx.send(ctx).await.is_err() {
                    debug!("closing rpc listener, since request receiver is dead.");
                    break;
                }
            }
            Message::Reply(rep) => inflight.dispatch(rmsg.session, rmsg.src, rep),
        }
    }
}
