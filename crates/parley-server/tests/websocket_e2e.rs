use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use uuid::Uuid;

use parley_db::Database;
use parley_gateway::{Gateway, GatewayConfig};
use parley_server::build_router;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: std::net::SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn spawn_server() -> TestServer {
    let root = std::env::temp_dir().join(format!("parley-e2e-{}", Uuid::new_v4()));
    let config = GatewayConfig {
        upload_dir: root.join("files"),
        upload_temp_dir: root.join("partial"),
        ..GatewayConfig::default()
    };
    let db = Arc::new(Database::open_in_memory().expect("db"));
    let gateway = Gateway::new(db, config.clone(), None)
        .await
        .expect("gateway");
    let router = build_router(gateway, &config.upload_dir);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .ok();
    });

    TestServer {
        addr,
        shutdown: Some(shutdown_tx),
    }
}

async fn send(ws: &mut Socket, frame: Value) {
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .expect("ws send");
}

/// Next JSON frame of the given type, skipping everything else.
async fn expect(ws: &mut Socket, kind: &str) -> Value {
    let wait = async {
        loop {
            match ws.next().await.expect("ws open").expect("ws frame") {
                Message::Text(payload) => {
                    let frame: Value = serde_json::from_str(payload.as_str()).expect("json");
                    if frame["type"] == kind {
                        return frame;
                    }
                }
                Message::Close(_) => panic!("socket closed while waiting for {kind}"),
                _ => {}
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {kind}"))
}

async fn register_and_login(server: &TestServer, username: &str) -> (Socket, String) {
    let (mut ws, _) = connect_async(format!("ws://{}/gateway", server.addr))
        .await
        .expect("ws connect");
    send(
        &mut ws,
        json!({"type": "register", "username": username, "password": "secret99"}),
    )
    .await;
    assert_eq!(expect(&mut ws, "register_response").await["success"], true);

    send(
        &mut ws,
        json!({"type": "login", "username": username, "password": "secret99"}),
    )
    .await;
    let login = expect(&mut ws, "login_response").await;
    assert_eq!(login["success"], true);
    let token = login["token"].as_str().expect("token").to_string();
    (ws, token)
}

#[tokio::test]
async fn chat_over_a_real_socket() {
    let server = spawn_server().await;
    let (mut alice, _) = register_and_login(&server, "alice").await;
    let (mut bob, _) = register_and_login(&server, "bob").await;

    send(
        &mut alice,
        json!({"type": "chat", "roomId": "global", "content": "hello over tcp"}),
    )
    .await;

    let received = expect(&mut bob, "chat").await;
    assert_eq!(received["content"], "hello over tcp");
    assert_eq!(received["username"], "alice");
    let saved = expect(&mut alice, "message_saved").await;
    assert_eq!(saved["messageId"], received["messageId"]);

    let health: Value = reqwest::get(format!("http://{}/health", server.addr))
        .await
        .expect("health request")
        .json()
        .await
        .expect("health json");
    assert_eq!(health["status"], "ok");
    assert_eq!(health["connections"], 2);
}

#[tokio::test]
async fn token_in_query_resumes_the_session() {
    let server = spawn_server().await;
    let (first, token) = register_and_login(&server, "carol").await;
    drop(first);

    let (mut ws, _) = connect_async(format!("ws://{}/gateway?token={}", server.addr, token))
        .await
        .expect("ws connect");
    let login = expect(&mut ws, "login_response").await;
    assert_eq!(login["success"], true);
    assert_eq!(login["username"], "carol");

    send(&mut ws, json!({"type": "ping"})).await;
    expect(&mut ws, "pong").await;
}

#[tokio::test]
async fn bad_token_leaves_the_socket_unauthenticated() {
    let server = spawn_server().await;
    let (mut ws, _) = connect_async(format!("ws://{}/gateway?token=garbage", server.addr))
        .await
        .expect("ws connect");
    let login = expect(&mut ws, "login_response").await;
    assert_eq!(login["success"], false);

    send(&mut ws, json!({"type": "get_rooms"})).await;
    assert_eq!(expect(&mut ws, "error").await["code"], "NOT_AUTHENTICATED");
}
