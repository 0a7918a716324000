use huddle::{
    hub::Frame,
    protocol::{Announce, CallInitiate, ClientEvent, SendMessage},
    registry::ConnectionId,
    session,
    signaling::CallKind,
    store::MessageKind,
    AppState, Config,
};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

struct Client {
    id: ConnectionId,
    rx: mpsc::Receiver<Frame>,
}

impl Client {
    fn connect(state: &AppState) -> Self {
        let id = Uuid::now_v7();
        Self { id, rx: state.hub.attach(id) }
    }

    async fn announce(state: &AppState, username: &str, peer_id: &str) -> Self {
        let client = Self::connect(state);
        client.send(state, ClientEvent::Announce(Announce {
            username: username.into(),
            peer_id: peer_id.into(),
        }))
        .await;
        client
    }

    async fn send(&self, state: &AppState, event: ClientEvent) {
        session::dispatch(state, self.id, event).await;
    }

    fn frames(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }

    fn named(&mut self, event: &str) -> Vec<Value> {
        self.frames().into_iter().filter(|f| f["event"] == event).collect()
    }
}

async fn state() -> AppState {
    AppState::new(Config::default()).await.unwrap()
}

fn text(username: &str, content: &str) -> ClientEvent {
    ClientEvent::SendMessage(SendMessage {
        username: username.into(),
        content: content.into(),
        kind: MessageKind::Text,
        file_payload: None,
    })
}

#[tokio::test]
async fn chat_message_echoes_to_everyone_once() {
    let state = state().await;
    let mut a = Client::announce(&state, "ada", "pa").await;
    let mut b = Client::announce(&state, "bob", "pb").await;
    a.frames();
    b.frames();

    a.send(&state, text("ada", "hi")).await;

    let at_a = a.named("new-message");
    let at_b = b.named("new-message");
    assert_eq!(at_a.len(), 1);
    assert_eq!(at_b.len(), 1);
    assert_eq!(at_a[0]["data"]["content"], "hi");
    assert_eq!(at_a[0]["data"], at_b[0]["data"]);
    assert!(at_a[0]["data"]["id"].is_i64());
    assert!(at_a[0]["data"]["timestamp"].is_i64());
}

#[tokio::test]
async fn incoming_call_reaches_only_the_target() {
    let state = state().await;
    let mut a = Client::announce(&state, "ada", "pa").await;
    let mut b = Client::announce(&state, "bob", "pb").await;
    let mut c = Client::announce(&state, "cyd", "pc").await;
    a.frames();
    b.frames();
    c.frames();

    a.send(&state, ClientEvent::CallInitiate(CallInitiate {
        target_peer_id: "pb".into(),
        from_peer_id: "pa".into(),
        from_username: "ada".into(),
        call_kind: CallKind::Audio,
    }))
    .await;

    let rings = b.frames();
    assert_eq!(rings.len(), 1);
    assert_eq!(rings[0]["event"], "incoming-call");
    assert_eq!(rings[0]["data"]["fromPeerId"], "pa");
    assert_eq!(rings[0]["data"]["fromUsername"], "ada");
    assert_eq!(rings[0]["data"]["callKind"], "audio");
    assert!(a.frames().is_empty());
    assert!(c.frames().is_empty());
}

#[tokio::test]
async fn call_to_unknown_peer_is_silently_dropped() {
    let state = state().await;
    let mut a = Client::announce(&state, "ada", "pa").await;
    let mut b = Client::announce(&state, "bob", "pb").await;
    a.frames();
    b.frames();

    a.send(&state, ClientEvent::CallInitiate(CallInitiate {
        target_peer_id: "ghost".into(),
        from_peer_id: "pa".into(),
        from_username: "ada".into(),
        call_kind: CallKind::Video,
    }))
    .await;

    assert!(a.frames().is_empty());
    assert!(b.frames().is_empty());
}

#[tokio::test]
async fn late_joiner_gets_newest_hundred_in_order() {
    let state = state().await;
    for i in 0..150 {
        state.log.append("ada", &format!("m{i}"), MessageKind::Text, None).await.unwrap();
    }

    let mut late = Client::announce(&state, "bob", "pb").await;

    let history = late.named("message-history");
    assert_eq!(history.len(), 1);
    let messages = history[0]["data"].as_array().unwrap();
    assert_eq!(messages.len(), 100);
    assert_eq!(messages[0]["content"], "m50");
    assert_eq!(messages[99]["content"], "m149");
    let ids: Vec<i64> = messages.iter().map(|m| m["id"].as_i64().unwrap()).collect();
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
}

#[tokio::test]
async fn double_disconnect_announces_left_once() {
    let state = state().await;
    let a = Client::announce(&state, "ada", "pa").await;
    let mut b = Client::announce(&state, "bob", "pb").await;
    b.frames();

    tokio::join!(
        session::disconnect(&state, a.id),
        session::disconnect(&state, a.id),
    );
    session::disconnect(&state, a.id).await;

    let frames = b.frames();
    let left: Vec<_> = frames.iter().filter(|f| f["event"] == "left").collect();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0]["data"]["username"], "ada");

    let presence = frames.iter().find(|f| f["event"] == "presence-list").unwrap();
    assert_eq!(presence["data"].as_array().unwrap().len(), 1);
    assert_eq!(state.registry.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_disconnect_tasks_notify_once() {
    let state = state().await;
    let a = Client::announce(&state, "ada", "pa").await;
    let mut b = Client::announce(&state, "bob", "pb").await;
    b.frames();

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let state = state.clone();
            let id = a.id;
            tokio::spawn(async move { session::disconnect(&state, id).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(b.named("left").len(), 1);
}

#[tokio::test]
async fn presence_tracks_joins_and_leaves() {
    let state = state().await;
    let mut a = Client::announce(&state, "ada", "pa").await;
    let b = Client::announce(&state, "bob", "pb").await;

    let frames = a.frames();
    let joined: Vec<_> = frames.iter().filter(|f| f["event"] == "joined").collect();
    assert_eq!(joined.len(), 2);
    assert_eq!(joined[1]["data"]["peerId"], "pb");
    let last_presence = frames.iter().rev().find(|f| f["event"] == "presence-list").unwrap();
    let names: Vec<_> = last_presence["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["username"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["ada", "bob"]);

    session::disconnect(&state, b.id).await;
    let after = a.named("presence-list");
    assert_eq!(after[0]["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn failed_append_is_not_broadcast() {
    let state = state().await;
    let mut a = Client::announce(&state, "ada", "pa").await;
    let mut b = Client::announce(&state, "bob", "pb").await;
    a.frames();
    b.frames();

    state.log.close().await;
    a.send(&state, text("ada", "into the void")).await;

    let at_a = a.frames();
    assert_eq!(at_a.len(), 1);
    assert_eq!(at_a[0]["event"], "message-rejected");
    assert!(b.frames().is_empty());
}

#[tokio::test]
async fn disconnected_client_gets_nothing_more() {
    let state = state().await;
    let mut a = Client::announce(&state, "ada", "pa").await;
    let b = Client::announce(&state, "bob", "pb").await;

    session::disconnect(&state, a.id).await;
    a.frames();
    b.send(&state, text("bob", "anyone?")).await;

    assert!(a.frames().is_empty());
}
