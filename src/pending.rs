use scc::HashMap;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Debug, Formatter},
    sync::Arc,
};
use tokio::{
    sync::oneshot,
    time::{self, Instant},
};
use tracing::trace;

use crate::key::{Key, KeyError};

/// Correlates one outgoing call with its reply.
#[derive(Hash, Eq, PartialEq, Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SessionId(Key);

impl SessionId {
    pub fn random() -> Result<Self, KeyError> {
        Ok(SessionId(Key::random()?))
    }
}

impl From<Key> for SessionId {
    fn from(key: Key) -> Self {
        SessionId(key)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("session {0:?} is already registered")]
pub struct DuplicateSession(pub SessionId);

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("request has timed out")]
    Timeout,
    #[error("call was abandoned before a reply arrived")]
    Abandoned,
}

/// Session id to single-use reply channel map, shared by every in-flight call
/// of one kind.
///
/// Taking a channel out of the map is the only way to deliver into it, so each
/// session gets at most one reply.
pub struct PendingCalls<V> {
    map: HashMap<SessionId, oneshot::Sender<V>>,
}

impl<V> PendingCalls<V> {
    pub fn new() -> Self {
        PendingCalls {
            map: HashMap::new(),
        }
    }

    pub fn put(&self, id: SessionId, tx: oneshot::Sender<V>) -> Result<(), DuplicateSession> {
        self.map.insert(id, tx).map_err(|(id, _)| DuplicateSession(id))
    }

    /// Claims the reply channel of `id`. [None] means the call already
    /// finished, timed out, or never existed.
    pub fn take(&self, id: &SessionId) -> Option<oneshot::Sender<V>> {
        self.map.remove(id).map(|(_, tx)| tx)
    }

    pub fn remove(&self, id: &SessionId) -> bool {
        self.map.remove(id).is_some()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.map.contains(id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Delivers `value` to the call waiting on `id`. Returns false if nobody
    /// is waiting anymore, in which case the value is dropped.
    pub fn resolve(&self, id: &SessionId, value: V) -> bool {
        match self.take(id) {
            Some(tx) => tx.send(value).is_ok(),
            None => {
                trace!("dropping reply for stale session {:?}", id);
                false
            }
        }
    }

    /// Registers a fresh channel for `id` and returns the handle awaiting it.
    /// The entry is removed once the handle is dropped.
    pub fn register(
        self: &Arc<Self>,
        id: SessionId,
        deadline: Instant,
    ) -> Result<PendingCall<V>, DuplicateSession> {
        let (tx, rx) = oneshot::channel();
        self.put(id, tx)?;

        Ok(PendingCall {
            session: id,
            rx,
            calls: Arc::clone(self),
            deadline,
        })
    }
}

impl<V> Default for PendingCalls<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Debug for PendingCalls<V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCalls")
            .field("len", &self.map.len())
            .finish()
    }
}

/// An outstanding call registered in a [PendingCalls] map.
pub struct PendingCall<V> {
    session: SessionId,
    rx: oneshot::Receiver<V>,
    calls: Arc<PendingCalls<V>>,
    deadline: Instant,
}

impl<V> PendingCall<V> {
    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Waits for the reply until the call's deadline.
    pub async fn wait(mut self) -> Result<V, CallError> {
        match time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(CallError::Abandoned),
            Err(_) => Err(CallError::Timeout),
        }
    }
}

impl<V> Drop for PendingCall<V> {
    fn drop(&mut self) {
        self.calls.remove(&self.session);
    }
}

impl<V> Debug for PendingCall<V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("session", &self.session)
            .field("deadline", &self.deadline)
            .finish()
    }
}
