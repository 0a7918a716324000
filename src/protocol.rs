//! JSON frames exchanged over the websocket.
//!
//! Every frame is `{"event": "<kebab-case name>", "data": {...}}`.

use serde::{Deserialize, Serialize};

use crate::{registry::ConnectionRecord, signaling::CallKind, store::{Message, MessageKind}};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    Announce(Announce),
    TypingStart(Typing),
    TypingStop(Typing),
    SendMessage(SendMessage),
    CallInitiate(CallInitiate),
    CallAccept(CallReply),
    CallReject(CallReply),
    CallEnd(CallReply),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announce {
    pub username: String,
    pub peer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Typing {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub username: String,
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub file_payload: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInitiate {
    pub target_peer_id: String,
    pub from_peer_id: String,
    pub from_username: String,
    pub call_kind: CallKind,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallReply {
    pub target_peer_id: String,
    pub from_peer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    MessageHistory(Vec<Message>),
    PresenceList(Vec<ConnectionRecord>),
    Joined(Joined),
    Left(Left),
    PeerTyping(Typing),
    PeerStoppedTyping(Typing),
    NewMessage(Message),
    IncomingCall(IncomingCall),
    CallAccepted(FromPeer),
    CallRejected(FromPeer),
    CallEnded(FromPeer),
    AnnounceRejected(Rejection),
    MessageRejected(Rejection),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Joined {
    pub username: String,
    pub peer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Left {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCall {
    pub from_peer_id: String,
    pub from_username: String,
    pub call_kind: CallKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FromPeer {
    pub from_peer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub reason: String,
}

/// How hard the hub tries to get an event through a congested queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Dropped for a connection whose queue is full.
    Transient,
    /// Never dropped; a connection that cannot take it is evicted instead.
    Reliable,
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MessageHistory(_) => "message-history",
            Self::PresenceList(_) => "presence-list",
            Self::Joined(_) => "joined",
            Self::Left(_) => "left",
            Self::PeerTyping(_) => "peer-typing",
            Self::PeerStoppedTyping(_) => "peer-stopped-typing",
            Self::NewMessage(_) => "new-message",
            Self::IncomingCall(_) => "incoming-call",
            Self::CallAccepted(_) => "call-accepted",
            Self::CallRejected(_) => "call-rejected",
            Self::CallEnded(_) => "call-ended",
            Self::AnnounceRejected(_) => "announce-rejected",
            Self::MessageRejected(_) => "message-rejected",
        }
    }

    pub fn delivery(&self) -> Delivery {
        match self {
            Self::PeerTyping(_) | Self::PeerStoppedTyping(_) => Delivery::Transient,
            _ => Delivery::Reliable,
        }
    }
}
