use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use uuid::Uuid;

use parley_db::Database;
use parley_gateway::auth::Authenticator;
use parley_gateway::{ClientConn, Flow, Gateway, GatewayConfig};

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    gateway: Gateway,
    db: Arc<Database>,
    config: GatewayConfig,
}

impl Harness {
    async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    async fn with_config(tweak: impl FnOnce(&mut GatewayConfig)) -> Self {
        let root: PathBuf = std::env::temp_dir().join(format!("parley-test-{}", Uuid::new_v4()));
        let mut config = GatewayConfig {
            upload_dir: root.join("files"),
            upload_temp_dir: root.join("partial"),
            ..GatewayConfig::default()
        };
        tweak(&mut config);
        let db = Arc::new(Database::open_in_memory().unwrap());
        let gateway = Gateway::new(db.clone(), config.clone(), None).await.unwrap();
        Self {
            gateway,
            db,
            config,
        }
    }

    /// Create a user straight in the database and sign in with a token, so
    /// tests don't pay for password hashing.
    async fn user(&self, username: &str) -> Client {
        let user_id = Uuid::new_v4();
        assert!(
            self.db
                .create_user(&user_id.to_string(), username, "unused", 1)
                .unwrap()
        );
        let token = Authenticator::new(self.config.jwt_secret.clone(), self.config.token_ttl)
            .issue_token(user_id, username)
            .unwrap();

        let mut client = self.connect();
        client.send(&self.gateway, json!({"type": "auth", "token": token})).await;
        let login = client.expect("login_response").await;
        assert_eq!(login["success"], true);
        client.expect("online_users").await;
        client.user_id = Some(user_id);
        client
    }

    fn connect(&self) -> Client {
        let (conn, rx) = self.gateway.open_connection();
        Client {
            conn,
            rx,
            user_id: None,
        }
    }
}

struct Client {
    conn: ClientConn,
    rx: mpsc::Receiver<Utf8Bytes>,
    user_id: Option<Uuid>,
}

impl Client {
    fn id(&self) -> Uuid {
        self.user_id.expect("client is signed in")
    }

    async fn send(&mut self, gateway: &Gateway, frame: Value) -> Flow {
        gateway.handle_text(&mut self.conn, &frame.to_string()).await
    }

    /// Next frame of the given type, skipping anything else.
    async fn expect(&mut self, kind: &str) -> Value {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let payload = tokio::time::timeout_at(deadline, self.rx.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {kind}"))
                .expect("outbound queue closed");
            let frame: Value = serde_json::from_str(payload.as_str()).unwrap();
            if frame["type"] == kind {
                return frame;
            }
        }
    }

    /// Every frame up to and including the next one of the given type.
    async fn until(&mut self, kind: &str) -> Vec<Value> {
        let deadline = tokio::time::Instant::now() + WAIT;
        let mut frames = Vec::new();
        loop {
            let payload = tokio::time::timeout_at(deadline, self.rx.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {kind}"))
                .expect("outbound queue closed");
            let frame: Value = serde_json::from_str(payload.as_str()).unwrap();
            let done = frame["type"] == kind;
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }

    /// Everything already queued.
    fn drain(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(payload) = self.rx.try_recv() {
            frames.push(serde_json::from_str(payload.as_str()).unwrap());
        }
        frames
    }

    fn has_queued(&mut self, kind: &str) -> bool {
        self.drain().iter().any(|f| f["type"] == kind)
    }
}

#[tokio::test]
async fn commands_before_login_are_refused() {
    let h = Harness::new().await;
    let mut client = h.connect();

    client
        .send(&h.gateway, json!({"type": "chat", "content": "hello"}))
        .await;
    let err = client.expect("error").await;
    assert_eq!(err["code"], "NOT_AUTHENTICATED");

    client.send(&h.gateway, json!({"type": "ping"})).await;
    client.expect("pong").await;
}

#[tokio::test]
async fn register_then_login_issues_a_token() {
    let h = Harness::new().await;
    let mut client = h.connect();

    client
        .send(
            &h.gateway,
            json!({"type": "register", "username": "alice", "password": "hunter22"}),
        )
        .await;
    let registered = client.expect("register_response").await;
    assert_eq!(registered["success"], true);

    client
        .send(
            &h.gateway,
            json!({"type": "register", "username": "alice", "password": "hunter22"}),
        )
        .await;
    let taken = client.expect("register_response").await;
    assert_eq!(taken["success"], false);

    client
        .send(
            &h.gateway,
            json!({"type": "login", "username": "alice", "password": "wrong-one"}),
        )
        .await;
    let rejected = client.expect("login_response").await;
    assert_eq!(rejected["success"], false);
    assert!(rejected.get("token").is_none());

    client
        .send(
            &h.gateway,
            json!({"type": "login", "username": "alice", "password": "hunter22"}),
        )
        .await;
    let accepted = client.expect("login_response").await;
    assert_eq!(accepted["success"], true);
    assert_eq!(accepted["userId"], registered["userId"]);
    assert!(accepted["token"].as_str().is_some_and(|t| !t.is_empty()));

    client
        .send(
            &h.gateway,
            json!({"type": "login", "username": "alice", "password": "hunter22"}),
        )
        .await;
    let err = client.expect("error").await;
    assert_eq!(err["code"], "ALREADY_AUTHENTICATED");
}

#[tokio::test]
async fn chat_reaches_every_member_with_one_id() {
    let h = Harness::new().await;
    let mut alice = h.user("alice").await;
    let mut bob = h.user("bob").await;

    alice
        .send(
            &h.gateway,
            json!({"type": "chat", "roomId": "global", "content": "  hi @bob  "}),
        )
        .await;

    let seen_by_alice = alice.expect("chat").await;
    let seen_by_bob = bob.expect("chat").await;
    assert_eq!(seen_by_alice["messageId"], seen_by_bob["messageId"]);
    assert_eq!(seen_by_bob["content"], "hi @bob");
    assert_eq!(seen_by_bob["userId"], json!(alice.id()));

    let saved = alice.expect("message_saved").await;
    assert_eq!(saved["messageId"], seen_by_alice["messageId"]);

    let mention = bob.expect("mention").await;
    assert_eq!(mention["from"], "alice");
}

#[tokio::test]
async fn sender_sees_its_chat_before_the_save_ack() {
    let h = Harness::new().await;
    let mut alice = h.user("alice").await;

    for n in 0..100 {
        alice
            .send(
                &h.gateway,
                json!({"type": "chat", "content": format!("burst {n}")}),
            )
            .await;
        let frames = alice.until("message_saved").await;
        let saved = frames.last().unwrap();
        assert!(
            frames
                .iter()
                .any(|f| f["type"] == "chat" && f["messageId"] == saved["messageId"]),
            "message_saved for {} arrived before its chat",
            saved["messageId"]
        );
    }
}

#[tokio::test]
async fn dm_shorthand_converges_on_one_room() {
    let h = Harness::new().await;
    let mut alice = h.user("alice").await;
    let mut bob = h.user("bob").await;

    alice
        .send(
            &h.gateway,
            json!({"type": "chat", "roomId": format!("dm_{}", bob.id()), "content": "psst"}),
        )
        .await;
    let first = bob.expect("chat").await;
    assert_eq!(alice.expect("chat").await["content"], "psst");

    bob.send(
        &h.gateway,
        json!({"type": "chat", "roomId": format!("dm_{}", alice.id()), "content": "yes?"}),
    )
    .await;
    let reply = alice.expect("chat").await;
    assert_eq!(reply["content"], "yes?");

    assert_eq!(first["roomId"], reply["roomId"]);
    let (lo, hi) = if alice.id() < bob.id() {
        (alice.id(), bob.id())
    } else {
        (bob.id(), alice.id())
    };
    assert_eq!(first["roomId"], format!("dm_{lo}_{hi}"));

    let mut carol = h.user("carol").await;
    carol
        .send(
            &h.gateway,
            json!({"type": "get_history", "roomId": first["roomId"]}),
        )
        .await;
    let err = carol.expect("error").await;
    assert_eq!(err["code"], "PERMISSION_DENIED");
}

#[tokio::test]
async fn only_the_sender_edits_and_deleted_messages_stay_deleted() {
    let h = Harness::new().await;
    let mut alice = h.user("alice").await;
    let mut bob = h.user("bob").await;

    alice
        .send(&h.gateway, json!({"type": "chat", "content": "draft"}))
        .await;
    let id = alice.expect("chat").await["messageId"].clone();
    bob.expect("chat").await;

    bob.send(
        &h.gateway,
        json!({"type": "edit_message", "messageId": id, "content": "mine now"}),
    )
    .await;
    assert_eq!(bob.expect("error").await["code"], "PERMISSION_DENIED");

    alice
        .send(
            &h.gateway,
            json!({"type": "edit_message", "messageId": id, "content": "final"}),
        )
        .await;
    let edited = bob.expect("message_edited").await;
    assert_eq!(edited["newContent"], "final");
    assert_eq!(edited["version"], 1);

    alice
        .send(
            &h.gateway,
            json!({"type": "edit_message", "messageId": id, "content": "stale", "baseVersion": 0}),
        )
        .await;
    assert_eq!(alice.expect("error").await["code"], "CONFLICT");

    alice
        .send(&h.gateway, json!({"type": "delete_message", "messageId": id}))
        .await;
    bob.expect("message_deleted").await;

    alice
        .send(
            &h.gateway,
            json!({"type": "edit_message", "messageId": id, "content": "back"}),
        )
        .await;
    assert_eq!(alice.expect("error").await["code"], "ALREADY_DELETED");

    bob.send(
        &h.gateway,
        json!({"type": "get_history", "roomId": "global"}),
    )
    .await;
    let history = bob.expect("history").await;
    let message = &history["messages"][0];
    assert_eq!(message["messageId"], id);
    assert_eq!(message["isDeleted"], true);
    assert_eq!(message["content"], "");
}

#[tokio::test]
async fn repeated_reactions_are_idempotent() {
    let h = Harness::new().await;
    let mut alice = h.user("alice").await;
    let mut bob = h.user("bob").await;

    alice
        .send(&h.gateway, json!({"type": "chat", "content": "vote with emoji"}))
        .await;
    let id = bob.expect("chat").await["messageId"].clone();

    for _ in 0..2 {
        bob.send(
            &h.gateway,
            json!({"type": "reaction", "messageId": id, "emoji": "👍"}),
        )
        .await;
    }
    alice.expect("reaction_added").await;
    alice.drain();

    bob.send(&h.gateway, json!({"type": "get_reactions", "messageId": id}))
        .await;
    let list = bob.expect("reactions_list").await;
    assert_eq!(list["reactions"].as_array().unwrap().len(), 1);
    assert!(!alice.has_queued("reaction_added"));

    bob.send(
        &h.gateway,
        json!({"type": "remove_reaction", "messageId": id, "emoji": "👍"}),
    )
    .await;
    alice.expect("reaction_removed").await;
}

#[tokio::test]
async fn poll_keeps_only_the_latest_vote() {
    let h = Harness::new().await;
    let mut alice = h.user("alice").await;
    let mut bob = h.user("bob").await;

    alice
        .send(
            &h.gateway,
            json!({"type": "poll_create", "question": "Lunch?", "options": ["pizza", "sushi"]}),
        )
        .await;
    let poll_id = bob.expect("poll_created").await["poll"]["id"].clone();

    bob.send(
        &h.gateway,
        json!({"type": "poll_vote", "pollId": poll_id, "optionId": 0}),
    )
    .await;
    alice.expect("poll_voted").await;

    bob.send(
        &h.gateway,
        json!({"type": "poll_vote", "pollId": poll_id, "optionId": 1}),
    )
    .await;
    let voted = alice.expect("poll_voted").await;
    assert_eq!(voted["poll"]["options"][0]["votes"], 0);
    assert_eq!(voted["poll"]["options"][1]["votes"], 1);
    assert_eq!(voted["userId"], json!(bob.id()));

    bob.send(
        &h.gateway,
        json!({"type": "poll_close", "pollId": poll_id}),
    )
    .await;
    assert_eq!(bob.expect("error").await["code"], "PERMISSION_DENIED");

    alice
        .send(&h.gateway, json!({"type": "poll_close", "pollId": poll_id}))
        .await;
    bob.expect("poll_closed").await;

    bob.send(
        &h.gateway,
        json!({"type": "poll_vote", "pollId": poll_id, "optionId": 0}),
    )
    .await;
    assert_eq!(bob.expect("error").await["code"], "CONFLICT");
}

#[tokio::test]
async fn stale_typing_indicators_expire() {
    let h = Harness::with_config(|c| c.typing_ttl = Duration::from_millis(50)).await;
    let mut alice = h.user("alice").await;
    let mut bob = h.user("bob").await;

    alice
        .send(&h.gateway, json!({"type": "typing_start", "roomId": "global"}))
        .await;
    assert_eq!(bob.expect("typing").await["isTyping"], true);

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(h.gateway.sweep_typing().await, 1);
    let stopped = bob.expect("typing").await;
    assert_eq!(stopped["isTyping"], false);
    assert_eq!(stopped["userId"], json!(alice.id()));

    assert_eq!(h.gateway.sweep_typing().await, 0);
}

#[tokio::test]
async fn disconnect_broadcasts_offline() {
    let h = Harness::new().await;
    let mut alice = h.user("alice").await;
    let mut bob = h.user("bob").await;
    alice.expect("presence_update").await;

    bob.send(&h.gateway, json!({"type": "typing_start", "roomId": "global"}))
        .await;
    assert_eq!(alice.expect("typing").await["isTyping"], true);

    h.gateway.close_connection(&mut bob.conn).await;
    let stopped = alice.expect("typing").await;
    assert_eq!(stopped["isTyping"], false);
    assert_eq!(stopped["userId"], json!(bob.id()));
    assert_eq!(stopped["roomId"], "global");
    assert_eq!(h.gateway.sweep_typing().await, 0);

    let update = alice.expect("presence_update").await;
    assert_eq!(update["userId"], json!(bob.id()));
    assert_eq!(update["status"], "offline");
    assert_eq!(h.gateway.connection_count(), 1);
}

#[tokio::test]
async fn chunks_may_arrive_in_any_order() {
    let h = Harness::new().await;
    let mut alice = h.user("alice").await;
    let mut bob = h.user("bob").await;
    let body = b"0123456789";

    alice
        .send(
            &h.gateway,
            json!({
                "type": "upload_init",
                "fileName": "notes.txt",
                "fileSize": body.len(),
                "mimeType": "text/plain",
                "chunkSize": 4,
                "totalChunks": 3
            }),
        )
        .await;
    let ready = alice.expect("upload_ready").await;
    let upload_id = ready["uploadId"].clone();

    for index in [2usize, 0, 1] {
        let chunk = &body[index * 4..body.len().min(index * 4 + 4)];
        alice
            .send(
                &h.gateway,
                json!({
                    "type": "upload_chunk",
                    "uploadId": upload_id,
                    "chunkIndex": index,
                    "chunkData": BASE64.encode(chunk)
                }),
            )
            .await;
        alice.expect("upload_progress").await;
    }

    alice
        .send(
            &h.gateway,
            json!({"type": "upload_finalize", "uploadId": upload_id}),
        )
        .await;
    let complete = alice.expect("upload_complete").await;
    assert_eq!(complete["fileSize"], 10);
    assert_eq!(complete["sha256"], hex::encode(Sha256::digest(body)));

    let posted = bob.expect("chat").await;
    assert_eq!(posted["content"], "📎 notes.txt");
    assert_eq!(posted["metadata"]["messageType"], "file");
    assert_eq!(posted["metadata"]["fileUrl"], complete["fileUrl"]);

    alice
        .send(
            &h.gateway,
            json!({"type": "upload_finalize", "uploadId": upload_id}),
        )
        .await;
    let again = alice.expect("upload_error").await;
    assert_eq!(again["code"], "CONFLICT");
}

#[tokio::test]
async fn finalize_reports_missing_chunks() {
    let h = Harness::new().await;
    let mut alice = h.user("alice").await;

    alice
        .send(
            &h.gateway,
            json!({
                "type": "upload_init",
                "fileName": "clip.ogg",
                "fileSize": 8,
                "mimeType": "audio/ogg",
                "chunkSize": 4,
                "totalChunks": 2
            }),
        )
        .await;
    let upload_id = alice.expect("upload_ready").await["uploadId"].clone();
    alice
        .send(
            &h.gateway,
            json!({
                "type": "upload_chunk",
                "uploadId": upload_id,
                "chunkIndex": 1,
                "chunkData": BASE64.encode(b"5678")
            }),
        )
        .await;
    alice.expect("upload_progress").await;

    alice
        .send(
            &h.gateway,
            json!({"type": "upload_finalize", "uploadId": upload_id}),
        )
        .await;
    let err = alice.expect("upload_error").await;
    assert_eq!(err["code"], "INCOMPLETE_UPLOAD");
    assert_eq!(err["uploadId"], upload_id);
}

#[tokio::test]
async fn repeated_garbage_closes_the_connection() {
    let h = Harness::new().await;
    let mut alice = h.user("alice").await;

    assert_eq!(
        h.gateway.handle_text(&mut alice.conn, "{not json").await,
        Flow::Continue
    );
    assert_eq!(alice.expect("error").await["code"], "MALFORMED_FRAME");

    alice
        .send(&h.gateway, json!({"type": "launch_missiles"}))
        .await;
    assert_eq!(alice.expect("error").await["code"], "VALIDATION_ERROR");

    assert_eq!(
        h.gateway.handle_text(&mut alice.conn, "still not json").await,
        Flow::Close
    );
}

#[tokio::test]
async fn private_rooms_need_an_invitation() {
    let h = Harness::new().await;
    let mut alice = h.user("alice").await;
    let mut bob = h.user("bob").await;

    alice
        .send(
            &h.gateway,
            json!({"type": "create_room", "name": "planning", "kind": "private"}),
        )
        .await;
    let created = alice.expect("room_created").await;
    let room_id = created["roomId"].clone();
    assert_eq!(created["roomType"], "private");

    bob.send(&h.gateway, json!({"type": "join_room", "roomId": room_id}))
        .await;
    assert_eq!(bob.expect("error").await["code"], "PERMISSION_DENIED");

    alice
        .send(
            &h.gateway,
            json!({"type": "invite", "roomId": room_id, "userId": bob.id()}),
        )
        .await;
    let invited = bob.expect("room_invited").await;
    assert_eq!(invited["roomId"], room_id);
    assert_eq!(invited["invitedBy"], json!(alice.id()));

    alice
        .send(
            &h.gateway,
            json!({"type": "invite", "roomId": room_id, "userId": bob.id()}),
        )
        .await;
    assert_eq!(alice.expect("error").await["code"], "CONFLICT");

    bob.send(
        &h.gateway,
        json!({"type": "chat", "roomId": room_id, "content": "thanks"}),
    )
    .await;
    assert_eq!(alice.expect("chat").await["content"], "thanks");

    bob.send(&h.gateway, json!({"type": "get_rooms"})).await;
    let list = bob.expect("room_list").await;
    let rooms = list["rooms"].as_array().unwrap();
    assert_eq!(rooms[0]["roomId"], "global");
    assert!(rooms.iter().any(|r| r["roomId"] == room_id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn simultaneous_first_dms_share_one_room() {
    let h = Harness::new().await;
    const ROUNDS: usize = 10;

    for round in 0..ROUNDS {
        let alice = h.user(&format!("alice{round}")).await;
        let bob = h.user(&format!("bob{round}")).await;
        let (alice_id, bob_id) = (alice.id(), bob.id());
        let start = Arc::new(tokio::sync::Barrier::new(2));

        let opener = |mut client: Client, peer: Uuid| {
            let gateway = h.gateway.clone();
            let start = start.clone();
            tokio::spawn(async move {
                start.wait().await;
                client
                    .send(
                        &gateway,
                        json!({"type": "chat", "roomId": format!("dm_{peer}"), "content": "hey"}),
                    )
                    .await;
                client
            })
        };
        let first = opener(alice, bob_id);
        let second = opener(bob, alice_id);
        let mut alice = first.await.unwrap();
        let mut bob = second.await.unwrap();

        let (lo, hi) = if alice_id < bob_id {
            (alice_id, bob_id)
        } else {
            (bob_id, alice_id)
        };
        let canonical = format!("dm_{lo}_{hi}");
        for client in [&mut alice, &mut bob] {
            for _ in 0..2 {
                assert_eq!(client.expect("chat").await["roomId"], canonical);
            }
        }
    }

    h.gateway.shutdown().await;
    let dm_rows: i64 = h
        .db
        .with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM rooms WHERE kind = 'dm'", [], |r| r.get(0))
                .map_err(Into::into)
        })
        .unwrap();
    assert_eq!(dm_rows, ROUNDS as i64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn observers_agree_on_room_order() {
    let h = Harness::with_config(|c| c.outbound_queue = 1024).await;
    const PER_SENDER: usize = 40;

    let senders = [h.user("ann").await, h.user("ben").await];
    let mut observers = [h.user("cat").await, h.user("dan").await];
    for observer in observers.iter_mut() {
        observer.drain();
    }

    let tasks: Vec<_> = senders
        .into_iter()
        .enumerate()
        .map(|(k, mut sender)| {
            let gateway = h.gateway.clone();
            tokio::spawn(async move {
                for i in 0..PER_SENDER {
                    sender
                        .send(
                            &gateway,
                            json!({"type": "chat", "roomId": "global", "content": format!("s{k}-{i}")}),
                        )
                        .await;
                }
                sender
            })
        })
        .collect();
    let mut finished = Vec::new();
    for task in tasks {
        finished.push(task.await.unwrap());
    }

    let mut seen = Vec::new();
    for observer in observers.iter_mut() {
        let mut order = Vec::with_capacity(2 * PER_SENDER);
        for _ in 0..2 * PER_SENDER {
            let chat = observer.expect("chat").await;
            order.push((
                chat["messageId"].as_i64().unwrap(),
                chat["content"].as_str().unwrap().to_string(),
            ));
        }
        seen.push(order);
    }

    assert_eq!(seen[0], seen[1]);
    assert!(seen[0].windows(2).all(|w| w[0].0 < w[1].0));
    for k in 0..2 {
        let from_sender: Vec<&str> = seen[0]
            .iter()
            .map(|(_, content)| content.as_str())
            .filter(|c| c.starts_with(&format!("s{k}-")))
            .collect();
        let sent: Vec<String> = (0..PER_SENDER).map(|i| format!("s{k}-{i}")).collect();
        assert_eq!(from_sender, sent);
    }
    drop(finished);
}

#[tokio::test]
async fn scheduled_messages_post_when_due() {
    let h = Harness::new().await;
    let mut alice = h.user("alice").await;
    let mut bob = h.user("bob").await;

    alice
        .send(
            &h.gateway,
            json!({"type": "chat", "roomId": "global", "content": "/schedule 2s coffee?"}),
        )
        .await;
    let confirmation = alice.expect("chat").await;
    assert_eq!(confirmation["username"], "Bot");
    assert!(confirmation["content"].as_str().unwrap().contains("Message Scheduled"));
    bob.expect("chat").await;

    alice
        .send(
            &h.gateway,
            json!({"type": "chat", "roomId": "global", "content": "/schedule 1h later"}),
        )
        .await;
    let pending = alice.expect("chat").await;
    let later_id = pending["content"]
        .as_str()
        .unwrap()
        .split('`')
        .find(|part| part.starts_with("sched_"))
        .unwrap()
        .to_string();

    bob.send(
        &h.gateway,
        json!({"type": "chat", "roomId": "global", "content": format!("/cancelschedule {later_id}")}),
    )
    .await;
    assert_eq!(bob.expect("error").await["code"], "PERMISSION_DENIED");

    alice
        .send(
            &h.gateway,
            json!({"type": "chat", "roomId": "global", "content": "/schedules"}),
        )
        .await;
    let listed = alice.expect("chat").await;
    assert!(listed["content"].as_str().unwrap().contains(&later_id));

    alice
        .send(
            &h.gateway,
            json!({"type": "chat", "roomId": "global", "content": format!("/cancelschedule {later_id}")}),
        )
        .await;
    assert!(alice.expect("chat").await["content"].as_str().unwrap().contains("cancelled"));
    bob.drain();

    assert_eq!(h.gateway.deliver_scheduled().await, 0);
    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert_eq!(h.gateway.deliver_scheduled().await, 1);

    let delivered = bob.expect("chat").await;
    assert_eq!(delivered["content"], "coffee?");
    assert_eq!(delivered["userId"], json!(alice.id()));
    assert_eq!(delivered["metadata"]["messageType"], "scheduled");
    assert_eq!(h.gateway.deliver_scheduled().await, 0);
}

#[tokio::test]
async fn leaving_the_room_voids_a_pending_upload() {
    let h = Harness::new().await;
    let mut alice = h.user("alice").await;

    alice
        .send(
            &h.gateway,
            json!({"type": "create_room", "name": "vault", "kind": "private"}),
        )
        .await;
    let room_id = alice.expect("room_created").await["roomId"].clone();

    alice
        .send(
            &h.gateway,
            json!({
                "type": "upload_init",
                "roomId": room_id,
                "fileName": "plan.txt",
                "fileSize": 4,
                "mimeType": "text/plain",
                "chunkSize": 4,
                "totalChunks": 1
            }),
        )
        .await;
    let upload_id = alice.expect("upload_ready").await["uploadId"].clone();
    alice
        .send(
            &h.gateway,
            json!({
                "type": "upload_chunk",
                "uploadId": upload_id,
                "chunkIndex": 0,
                "chunkData": BASE64.encode(b"plan")
            }),
        )
        .await;
    alice.expect("upload_progress").await;

    alice
        .send(&h.gateway, json!({"type": "leave_room", "roomId": room_id}))
        .await;
    alice.expect("room_left").await;

    alice
        .send(
            &h.gateway,
            json!({"type": "upload_finalize", "uploadId": upload_id}),
        )
        .await;
    let err = alice.expect("upload_error").await;
    assert_eq!(err["code"], "PERMISSION_DENIED");
    assert!(!alice.has_queued("upload_complete"));

    let stored = std::fs::read_dir(&h.config.upload_dir)
        .map(|dir| dir.count())
        .unwrap_or(0);
    assert_eq!(stored, 0);
}
