//! Call setup relay.
//!
//! The server never touches media. It forwards ring/accept/reject/end between two peers, addressed
//! by the peer ids clients chose, and keeps one record per peer pair so out-of-order signals can be
//! told apart from real ones. Signals for peers that are not present are dropped without telling
//! the sender.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    hub::Hub,
    protocol::{CallInitiate, CallReply, FromPeer, IncomingCall, ServerEvent},
    registry::{ConnectionId, Registry},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    None,
    Ringing,
    Accepted,
    Rejected,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Initiate,
    Accept,
    Reject,
    End,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Ended)
    }

    pub fn next(self, signal: SignalKind) -> Option<Self> {
        match (self, signal) {
            (Self::None, SignalKind::Initiate) => Some(Self::Ringing),
            (Self::Ringing, SignalKind::Accept) => Some(Self::Accepted),
            (Self::Ringing, SignalKind::Reject) => Some(Self::Rejected),
            (Self::Ringing | Self::Accepted, SignalKind::End) => Some(Self::Ended),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallAttempt {
    /// Connection that sent `call-initiate`.
    pub opened_by: ConnectionId,
    pub initiator: String,
    pub target: String,
    pub kind: CallKind,
    pub state: CallState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Initiate(CallInitiate),
    Accept(CallReply),
    Reject(CallReply),
    End(CallReply),
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::Initiate(_) => SignalKind::Initiate,
            Self::Accept(_) => SignalKind::Accept,
            Self::Reject(_) => SignalKind::Reject,
            Self::End(_) => SignalKind::End,
        }
    }

    fn from_peer_id(&self) -> &str {
        match self {
            Self::Initiate(call) => &call.from_peer_id,
            Self::Accept(reply) | Self::Reject(reply) | Self::End(reply) => &reply.from_peer_id,
        }
    }

    fn target_peer_id(&self) -> &str {
        match self {
            Self::Initiate(call) => &call.target_peer_id,
            Self::Accept(reply) | Self::Reject(reply) | Self::End(reply) => &reply.target_peer_id,
        }
    }

    fn to_event(&self) -> ServerEvent {
        let from_peer = |reply: &CallReply| FromPeer { from_peer_id: reply.from_peer_id.clone() };
        match self {
            Self::Initiate(call) => ServerEvent::IncomingCall(IncomingCall {
                from_peer_id: call.from_peer_id.clone(),
                from_username: call.from_username.clone(),
                call_kind: call.call_kind,
            }),
            Self::Accept(reply) => ServerEvent::CallAccepted(from_peer(reply)),
            Self::Reject(reply) => ServerEvent::CallRejected(from_peer(reply)),
            Self::End(reply) => ServerEvent::CallEnded(from_peer(reply)),
        }
    }
}

/// What happened to a signal. Never reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered(ConnectionId),
    TargetOffline,
    /// The signal is not valid from the pair's current state.
    OutOfOrder(CallState),
}

type PairKey = (String, String);

fn pair_key(a: &str, b: &str) -> PairKey {
    if a <= b {
        (a.to_owned(), b.to_owned())
    } else {
        (b.to_owned(), a.to_owned())
    }
}

#[derive(Debug, Default)]
pub struct CallRelay {
    attempts: Mutex<HashMap<PairKey, CallAttempt>>,
}

impl CallRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forwards `signal`, sent by connection `origin`, to the connection holding the target peer id.
    pub fn relay(&self, registry: &Registry, hub: &Hub, origin: ConnectionId, signal: Signal) -> RelayOutcome {
        let kind = signal.kind();
        let from = signal.from_peer_id();

        let target = registry
            .find_by_peer_id(signal.target_peer_id())
            .filter(|record| hub.is_attached(record.connection_id));
        let Some(target) = target else {
            debug!(?kind, from, target = signal.target_peer_id(), "call target offline, dropping signal");
            return RelayOutcome::TargetOffline;
        };

        {
            let mut attempts = self.lock();
            let key = pair_key(from, &target.peer_id);

            let live = attempts.get(&key);
            let current = live.map_or(CallState::None, |a| a.state);
            // only the callee may answer
            let answered_by_caller = matches!(kind, SignalKind::Accept | SignalKind::Reject)
                && live.is_some_and(|a| a.target != from);

            let next = match current.next(kind) {
                Some(next) if !answered_by_caller => next,
                _ => {
                    debug!(?kind, ?current, from, target = %target.peer_id, "out of order call signal, dropping");
                    return RelayOutcome::OutOfOrder(current);
                }
            };

            match &signal {
                Signal::Initiate(call) => {
                    attempts.insert(key, CallAttempt {
                        opened_by: origin,
                        initiator: call.from_peer_id.clone(),
                        target: call.target_peer_id.clone(),
                        kind: call.call_kind,
                        state: next,
                    });
                }
                _ if next.is_terminal() => {
                    attempts.remove(&key);
                }
                _ => {
                    if let Some(attempt) = attempts.get_mut(&key) {
                        attempt.state = next;
                    }
                }
            }
        }

        hub.unicast(target.connection_id, &signal.to_event());
        RelayOutcome::Delivered(target.connection_id)
    }

    /// Live attempt between two peers, in either direction. Finished calls leave no record.
    pub fn attempt(&self, a: &str, b: &str) -> Option<CallAttempt> {
        self.lock().get(&pair_key(a, b)).cloned()
    }

    pub fn live_attempts(&self) -> usize {
        self.lock().len()
    }

    /// Drops every attempt opened by `conn`, and every attempt involving `departed_peer` when
    /// that peer id has no connection left. The other side of each dropped call gets
    /// `call-ended`. Returns how many calls were cut.
    pub fn forget_connection(
        &self,
        registry: &Registry,
        hub: &Hub,
        conn: ConnectionId,
        departed_peer: Option<&str>,
    ) -> usize {
        let mut cut = Vec::new();
        self.lock().retain(|_, attempt| {
            let (gone, other) = if attempt.opened_by == conn || departed_peer == Some(attempt.initiator.as_str()) {
                (&attempt.initiator, &attempt.target)
            } else if departed_peer == Some(attempt.target.as_str()) {
                (&attempt.target, &attempt.initiator)
            } else {
                return true;
            };
            cut.push((gone.clone(), other.clone()));
            false
        });

        for (gone, other) in &cut {
            if let Some(record) = registry.find_by_peer_id(other) {
                hub.unicast(record.connection_id, &ServerEvent::CallEnded(FromPeer { from_peer_id: gone.clone() }));
            }
        }
        cut.len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PairKey, CallAttempt>> {
        self.attempts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
