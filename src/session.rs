use tracing::{debug, error, info, warn};

use crate::{
    protocol::{Announce, ClientEvent, Joined, Left, Rejection, SendMessage, ServerEvent},
    registry::ConnectionId,
    signaling::{RelayOutcome, Signal},
    AppState,
};

/// Handles one inbound event for `conn`. Callers feed events of one connection in arrival order.
pub async fn dispatch(state: &AppState, conn: ConnectionId, event: ClientEvent) {
    handle(state, conn, event).await;
    reap_evicted(state);
}

async fn handle(state: &AppState, conn: ConnectionId, event: ClientEvent) {
    match event {
        ClientEvent::Announce(announce) => on_announce(state, conn, announce).await,
        ClientEvent::TypingStart(typing) => {
            state.hub.broadcast_except(&ServerEvent::PeerTyping(typing), conn);
        }
        ClientEvent::TypingStop(typing) => {
            state.hub.broadcast_except(&ServerEvent::PeerStoppedTyping(typing), conn);
        }
        ClientEvent::SendMessage(message) => on_send_message(state, conn, message).await,
        ClientEvent::CallInitiate(call) => on_signal(state, conn, Signal::Initiate(call)),
        ClientEvent::CallAccept(reply) => on_signal(state, conn, Signal::Accept(reply)),
        ClientEvent::CallReject(reply) => on_signal(state, conn, Signal::Reject(reply)),
        ClientEvent::CallEnd(reply) => on_signal(state, conn, Signal::End(reply)),
    }
}

/// Parses a raw frame and dispatches it; garbage is logged and skipped.
pub async fn dispatch_frame(state: &AppState, conn: ConnectionId, frame: &[u8]) {
    match serde_json::from_slice::<ClientEvent>(frame) {
        Ok(event) => dispatch(state, conn, event).await,
        Err(e) => debug!(conn_id = %conn, error = %e, "ignoring malformed frame"),
    }
}

async fn on_announce(state: &AppState, conn: ConnectionId, Announce { username, peer_id }: Announce) {
    let record = match state.registry.register(conn, username, peer_id) {
        Ok(record) => record,
        Err(e) => {
            warn!(conn_id = %conn, error = %e, "announce rejected");
            state.hub.unicast(conn, &ServerEvent::AnnounceRejected(Rejection { reason: e.to_string() }));
            return;
        }
    };
    info!(conn_id = %conn, username = %record.username, peer_id = %record.peer_id, "announced");

    match state.log.recent_messages(state.config.history_limit).await {
        Ok(history) => state.hub.unicast(conn, &ServerEvent::MessageHistory(history)),
        Err(e) => error!(conn_id = %conn, error = %e, "could not load message history"),
    }

    state.hub.broadcast_all(&ServerEvent::PresenceList(state.registry.snapshot()));
    state.hub.broadcast_all(&ServerEvent::Joined(Joined {
        username: record.username,
        peer_id: record.peer_id,
    }));
}

async fn on_send_message(state: &AppState, conn: ConnectionId, message: SendMessage) {
    let SendMessage { username, content, kind, file_payload } = message;

    match state.log.append(&username, &content, kind, file_payload.as_deref()).await {
        Ok(stored) => state.hub.broadcast_all(&ServerEvent::NewMessage(stored)),
        Err(e) => {
            error!(conn_id = %conn, error = %e, "message not persisted, not broadcasting");
            state.hub.unicast(conn, &ServerEvent::MessageRejected(Rejection { reason: e.to_string() }));
        }
    }
}

fn on_signal(state: &AppState, conn: ConnectionId, signal: Signal) {
    let kind = signal.kind();
    match state.relay.relay(&state.registry, &state.hub, conn, signal) {
        RelayOutcome::Delivered(target) => debug!(conn_id = %conn, ?kind, %target, "relayed call signal"),
        outcome => debug!(conn_id = %conn, ?kind, ?outcome, "call signal dropped"),
    }
}

/// Tears down `conn`. Safe to call any number of times; only the first call notifies peers.
pub async fn disconnect(state: &AppState, conn: ConnectionId) {
    teardown(state, conn);
    reap_evicted(state);
}

fn teardown(state: &AppState, conn: ConnectionId) {
    state.hub.detach(conn);

    let record = state.registry.deregister(conn);
    // a peer id is gone only once no connection uses it anymore
    let departed_peer = record
        .as_ref()
        .map(|r| r.peer_id.as_str())
        .filter(|peer_id| state.registry.find_by_peer_id(peer_id).is_none());
    state.relay.forget_connection(&state.registry, &state.hub, conn, departed_peer);

    let Some(record) = record else {
        return;
    };
    info!(conn_id = %conn, username = %record.username, "left");

    state.hub.broadcast_all(&ServerEvent::PresenceList(state.registry.snapshot()));
    state.hub.broadcast_all(&ServerEvent::Left(Left { username: record.username }));
}

/// Tears down connections the hub evicted as slow consumers. Notifying the rest may evict more.
fn reap_evicted(state: &AppState) {
    loop {
        let evicted = state.hub.take_evicted();
        if evicted.is_empty() {
            return;
        }
        for conn in evicted {
            warn!(conn_id = %conn, "evicted slow client");
            teardown(state, conn);
        }
    }
}
