//! End-to-end fan-out scenarios against an in-memory SQLite store.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::UnboundedReceiver;

use chatline_db::{Database, NewMessage};
use chatline_gateway::connection::handle_text;
use chatline_gateway::error::DispatchError;
use chatline_gateway::session::Session;
use chatline_gateway::{ChannelRegistry, ConnectionHandle, MessageDispatcher, MessageStore, Notifier};
use chatline_types::events::GatewayEvent;
use chatline_types::models::{ChatMessage, MessageTarget};
use chatline_types::{GroupId, MessageId, UserId};

struct Harness {
    db: Arc<Database>,
    registry: ChannelRegistry,
    dispatcher: MessageDispatcher,
}

impl Harness {
    fn new(users: &[&str]) -> Self {
        let db = Arc::new(Database::open_in_memory().unwrap());
        for name in users {
            db.create_user(name, "hash").unwrap().unwrap();
        }
        let registry = ChannelRegistry::new();
        let dispatcher = MessageDispatcher::new(db.clone(), registry.clone());
        Self {
            db,
            registry,
            dispatcher,
        }
    }

    async fn connect(&self, user_id: UserId) -> (ConnectionHandle, UnboundedReceiver<GatewayEvent>) {
        let (handle, rx) = ConnectionHandle::new();
        self.registry.register(user_id, &handle).await;
        (handle, rx)
    }
}

fn drain(rx: &mut UnboundedReceiver<GatewayEvent>) -> Vec<GatewayEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

fn at_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap()
}

#[tokio::test]
async fn direct_message_reaches_sender_and_receiver_devices() {
    let h = Harness::new(&["alice", "bob", "carol"]);
    let (_a1, mut a1_rx) = h.connect(1).await;
    let (_a2, mut a2_rx) = h.connect(1).await;
    let (_b1, mut b1_rx) = h.connect(2).await;
    let (_c1, mut c1_rx) = h.connect(3).await;

    let delivery = h
        .dispatcher
        .send_direct(1, 2, "hi".into(), Some(at_millis(1000)), None)
        .await
        .unwrap();

    let expected = ChatMessage::new(
        delivery.message.id,
        1,
        MessageTarget::Direct(2),
        "hi".into(),
        at_millis(1000),
        "alice".into(),
    );
    assert_eq!(delivery.message, expected);
    assert_eq!(delivery.delivered, 3);

    for rx in [&mut a1_rx, &mut a2_rx, &mut b1_rx] {
        assert_eq!(drain(rx), vec![GatewayEvent::DirectMessage(expected.clone())]);
    }
    assert!(drain(&mut c1_rx).is_empty());

    let history = h.db.get_direct_messages(2, 1).unwrap();
    assert_eq!(history, vec![expected]);
}

#[tokio::test]
async fn direct_message_to_offline_user_is_still_persisted() {
    let h = Harness::new(&["alice", "bob"]);
    let delivery = h
        .dispatcher
        .send_direct(1, 2, "later".into(), None, None)
        .await
        .unwrap();

    assert_eq!(delivery.delivered, 0);
    assert_eq!(delivery.recipients, vec![1, 2]);
    assert_eq!(h.db.get_direct_messages(1, 2).unwrap().len(), 1);
}

#[tokio::test]
async fn group_message_uses_membership_snapshot() {
    let h = Harness::new(&["u1", "u2", "u3", "u4"]);
    let gid = h.db.create_group("crew", "CREW01", 1).unwrap().unwrap();
    h.db.join_group_by_code("CREW01", 2).unwrap();
    h.db.join_group_by_code("CREW01", 3).unwrap();

    let mut rxs = Vec::new();
    for uid in 1..=4 {
        rxs.push(h.connect(uid).await);
    }

    let first = h
        .dispatcher
        .send_group(2, gid, "hello crew".into(), None, None)
        .await
        .unwrap();
    assert_eq!(first.recipients, vec![1, 2, 3]);

    // User 4 joins after dispatch
    h.db.join_group_by_code("CREW01", 4).unwrap();

    for (i, (_, rx)) in rxs.iter_mut().enumerate() {
        let events = drain(rx);
        if i < 3 {
            assert_eq!(events, vec![GatewayEvent::GroupMessage(first.message.clone())]);
        } else {
            assert!(events.is_empty(), "late joiner got {:?}", events);
        }
    }

    let second = h
        .dispatcher
        .send_group(1, gid, "welcome".into(), None, None)
        .await
        .unwrap();
    assert_eq!(second.recipients, vec![1, 2, 3, 4]);
    assert_eq!(drain(&mut rxs[3].1), vec![GatewayEvent::GroupMessage(second.message)]);
    assert_eq!(h.db.get_group_messages(gid).unwrap().len(), 2);
}

#[tokio::test]
async fn outsider_cannot_post_to_group() {
    let h = Harness::new(&["u1", "u2", "outsider"]);
    let gid = h.db.create_group("pair", "PAIR01", 1).unwrap().unwrap();
    h.db.join_group_by_code("PAIR01", 2).unwrap();

    let (_m1, mut m1_rx) = h.connect(1).await;
    let (_m2, mut m2_rx) = h.connect(2).await;
    let (_o, mut o_rx) = h.connect(3).await;

    let err = h
        .dispatcher
        .send_group(3, gid, "let me in".into(), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NotAMember { group_id } if group_id == gid));
    assert_eq!(err.client_message(), format!("not a member of group {}", gid));

    assert!(h.db.get_group_messages(gid).unwrap().is_empty());
    for rx in [&mut m1_rx, &mut m2_rx, &mut o_rx] {
        assert!(drain(rx).is_empty());
    }

    // Unknown group ids are refused the same way
    let err = h
        .dispatcher
        .send_group(1, gid + 100, "hello?".into(), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NotAMember { .. }));
}

#[tokio::test]
async fn empty_content_is_rejected_before_persistence() {
    let h = Harness::new(&["alice", "bob"]);
    let (_b, mut b_rx) = h.connect(2).await;

    let err = h
        .dispatcher
        .send_direct(1, 2, "   ".into(), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::EmptyContent));
    assert!(h.db.get_direct_messages(1, 2).unwrap().is_empty());
    assert!(drain(&mut b_rx).is_empty());
}

#[tokio::test]
async fn friend_request_to_offline_user_stays_pending() {
    let h = Harness::new(&["u1", "u2", "u3", "u4", "erin", "u6", "gail"]);
    let notifier = Notifier::new(h.registry.clone());

    h.db.send_friend_request(5, 7).unwrap();
    assert_eq!(notifier.notify_friend_request(7, 5, "erin").await, 0);

    let pending = h.db.list_pending_requests(7).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].user_id, 5);
    assert_eq!(pending[0].username, "erin");
}

// -- Stores with injected behaviour --

/// Fails every write.
struct BrokenStore;

impl MessageStore for BrokenStore {
    fn store_message(&self, _msg: &NewMessage) -> Result<MessageId> {
        Err(anyhow!("disk full"))
    }
    fn username(&self, _user_id: UserId) -> Result<Option<String>> {
        Ok(Some("nobody".into()))
    }
    fn group_members(&self, _group_id: GroupId) -> Result<Option<Vec<UserId>>> {
        Ok(Some(vec![1, 2]))
    }
    fn is_member(&self, _group_id: GroupId, _user_id: UserId) -> Result<bool> {
        Ok(true)
    }
    fn direct_history(&self, _a: UserId, _b: UserId) -> Result<Vec<ChatMessage>> {
        Ok(Vec::new())
    }
    fn group_history(&self, _group_id: GroupId) -> Result<Vec<ChatMessage>> {
        Ok(Vec::new())
    }
}

/// Delegates to a real database, but can lose groups and pause inside the
/// membership lookup.
struct ScriptedStore {
    db: Database,
    vanish_groups: bool,
    gate: Option<Gate>,
}

struct Gate {
    entered: Mutex<std_mpsc::Sender<()>>,
    release: Mutex<std_mpsc::Receiver<()>>,
}

impl MessageStore for ScriptedStore {
    fn store_message(&self, msg: &NewMessage) -> Result<MessageId> {
        self.db.insert_message(msg)
    }
    fn username(&self, user_id: UserId) -> Result<Option<String>> {
        self.db.get_username(user_id)
    }
    fn group_members(&self, group_id: GroupId) -> Result<Option<Vec<UserId>>> {
        if let Some(gate) = &self.gate {
            gate.entered.lock().unwrap().send(()).unwrap();
            gate.release.lock().unwrap().recv().unwrap();
        }
        if self.vanish_groups {
            return Ok(None);
        }
        self.db.get_group_members(group_id)
    }
    fn is_member(&self, group_id: GroupId, user_id: UserId) -> Result<bool> {
        self.db.is_group_member(group_id, user_id)
    }
    fn direct_history(&self, a: UserId, b: UserId) -> Result<Vec<ChatMessage>> {
        self.db.get_direct_messages(a, b)
    }
    fn group_history(&self, group_id: GroupId) -> Result<Vec<ChatMessage>> {
        self.db.get_group_messages(group_id)
    }
}

fn group_db() -> (Database, GroupId) {
    let db = Database::open_in_memory().unwrap();
    for name in ["u1", "u2", "u3"] {
        db.create_user(name, "hash").unwrap();
    }
    let gid = db.create_group("trio", "TRIO01", 1).unwrap().unwrap();
    db.join_group_by_code("TRIO01", 2).unwrap();
    db.join_group_by_code("TRIO01", 3).unwrap();
    (db, gid)
}

#[tokio::test]
async fn persistence_failure_aborts_fanout() {
    let registry = ChannelRegistry::new();
    let dispatcher = MessageDispatcher::new(Arc::new(BrokenStore), registry.clone());
    let (a, mut a_rx) = ConnectionHandle::new();
    let (b, mut b_rx) = ConnectionHandle::new();
    registry.register(1, &a).await;
    registry.register(2, &b).await;

    let err = dispatcher
        .send_direct(1, 2, "lost".into(), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Persistence(_)));
    assert_eq!(err.client_message(), "Failed to send message");
    assert!(drain(&mut a_rx).is_empty());
    assert!(drain(&mut b_rx).is_empty());
}

#[tokio::test]
async fn vanished_group_reports_error_without_fanout() {
    let (db, gid) = group_db();
    let store = ScriptedStore {
        db,
        vanish_groups: true,
        gate: None,
    };
    let registry = ChannelRegistry::new();
    let dispatcher = MessageDispatcher::new(Arc::new(store), registry.clone());
    let (h, mut rx) = ConnectionHandle::new();
    registry.register(1, &h).await;

    let err = dispatcher
        .send_group(1, gid, "anyone?".into(), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::MembershipUnavailable { group_id } if group_id == gid));
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn disconnect_during_group_dispatch_spares_the_others() {
    let (db, gid) = group_db();
    let (entered_tx, entered_rx) = std_mpsc::channel();
    let (release_tx, release_rx) = std_mpsc::channel();
    let store = ScriptedStore {
        db,
        vanish_groups: false,
        gate: Some(Gate {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        }),
    };
    let registry = ChannelRegistry::new();
    let dispatcher = MessageDispatcher::new(Arc::new(store), registry.clone());

    let (h1, mut rx1) = ConnectionHandle::new();
    let (h2, mut rx2) = ConnectionHandle::new();
    let (h3, mut rx3) = ConnectionHandle::new();
    registry.register(1, &h1).await;
    registry.register(2, &h2).await;
    registry.register(3, &h3).await;

    let in_flight = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.send_group(2, gid, "still here".into(), None, None).await }
    });

    // Wait until the dispatch is resolving members, then drop user 3
    tokio::task::spawn_blocking(move || entered_rx.recv().unwrap())
        .await
        .unwrap();
    registry.unregister(&h3).await;
    release_tx.send(()).unwrap();

    let delivery = in_flight.await.unwrap().unwrap();
    assert_eq!(delivery.recipients, vec![1, 2, 3]);
    assert_eq!(delivery.delivered, 2);
    assert_eq!(drain(&mut rx1).len(), 1);
    assert_eq!(drain(&mut rx2).len(), 1);
    assert!(drain(&mut rx3).is_empty());
}

// -- Protocol, driven through text frames --

#[tokio::test]
async fn protocol_requires_join_and_matching_sender() {
    let h = Harness::new(&["alice", "bob"]);
    let (_b, mut b_rx) = h.connect(2).await;

    let (handle, mut rx) = ConnectionHandle::new();
    let mut session = Session::new(h.registry.clone(), handle, 1);

    let dm = r#"{"type":"DirectMessage","data":{"sender_id":1,"receiver_id":2,"content":"hey"}}"#;

    handle_text(&mut session, &h.dispatcher, dm).await;
    assert!(matches!(drain(&mut rx).as_slice(), [GatewayEvent::Error { .. }]));

    handle_text(&mut session, &h.dispatcher, "{not json").await;
    assert_eq!(drain(&mut rx), vec![GatewayEvent::error("Malformed command")]);

    handle_text(&mut session, &h.dispatcher, r#"{"type":"Join","data":{"user_id":2}}"#).await;
    assert!(matches!(drain(&mut rx).as_slice(), [GatewayEvent::Error { .. }]));

    handle_text(&mut session, &h.dispatcher, r#"{"type":"Join","data":{"user_id":1}}"#).await;
    assert!(matches!(
        drain(&mut rx).as_slice(),
        [GatewayEvent::Connected { user_id: 1, .. }]
    ));

    let spoofed = r#"{"type":"DirectMessage","data":{"sender_id":2,"receiver_id":1,"content":"fake"}}"#;
    handle_text(&mut session, &h.dispatcher, spoofed).await;
    assert!(matches!(drain(&mut rx).as_slice(), [GatewayEvent::Error { .. }]));

    handle_text(&mut session, &h.dispatcher, dm).await;
    let echoed = drain(&mut rx);
    assert!(matches!(echoed.as_slice(), [GatewayEvent::DirectMessage(m)] if m.content == "hey"));
    assert_eq!(drain(&mut b_rx), echoed);

    assert_eq!(h.db.get_direct_messages(1, 2).unwrap().len(), 1);

    session.disconnect().await;
    assert!(!h.registry.is_online(1).await);
}

#[tokio::test]
async fn sequential_messages_on_one_connection_keep_order() {
    let h = Harness::new(&["alice", "bob"]);
    let (handle, mut rx) = ConnectionHandle::new();
    let mut session = Session::new(h.registry.clone(), handle, 1);
    handle_text(&mut session, &h.dispatcher, r#"{"type":"Join","data":{"user_id":1}}"#).await;
    drain(&mut rx);

    let ts = "2024-05-01T12:00:00Z";
    for i in 0..10 {
        let frame = format!(
            r#"{{"type":"DirectMessage","data":{{"sender_id":1,"receiver_id":2,"content":"m{}","timestamp":"{}"}}}}"#,
            i, ts
        );
        handle_text(&mut session, &h.dispatcher, &frame).await;
    }

    let history = h.db.get_direct_messages(1, 2).unwrap();
    let contents: Vec<String> = history.into_iter().map(|m| m.content).collect();
    let expected: Vec<String> = (0..10).map(|i| format!("m{}", i)).collect();
    assert_eq!(contents, expected);
}
