#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use gateway::{
    auth::JwtVerifier, config::Config, transcripts::MemoryTranscriptStore, AppState,
};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use shared_types::Envelope;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::frame::coding::CloseCode, Message},
    MaybeTlsStream, WebSocketStream,
};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const JWT_SECRET: &str = "integration-jwt-secret";
pub const WORKER_SECRET: &str = "integration-worker-secret";
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<AppState>,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl TestServer {
    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

pub fn test_config(handshake_timeout: Duration) -> Config {
    Config {
        port: 0,
        worker_secret: Some(WORKER_SECRET.to_string()),
        jwt_secret: JWT_SECRET.to_string(),
        handshake_timeout,
        upload_fragment_bytes: 8,
        max_upload_bytes: 1024 * 1024,
        transcript_database_url: String::new(),
        cors_origins: Vec::new(),
    }
}

pub async fn start_server() -> TestServer {
    start_server_with(test_config(Duration::from_secs(2))).await
}

pub async fn start_server_with(config: Config) -> TestServer {
    let verifier = JwtVerifier::new(&config.jwt_secret).expect("verifier");
    let state = Arc::new(AppState::new(
        config,
        Arc::new(verifier),
        Arc::new(MemoryTranscriptStore::new()),
    ));
    let app = gateway::router(Arc::clone(&state));

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind listener");
    let addr = listener.local_addr().expect("Failed to get addr");

    let handle = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .await
            .expect("Server failed");
    });

    TestServer {
        addr,
        state,
        handle,
    }
}

#[derive(Serialize)]
struct Claims<'a> {
    sub: &'a str,
    exp: usize,
}

pub fn token_for(sub: &str) -> String {
    let exp = (chrono::Utc::now().timestamp() + 3600) as usize;
    encode(
        &Header::default(),
        &Claims { sub, exp },
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .expect("encode token")
}

pub async fn connect(url: &str) -> Ws {
    let (ws, _) = connect_async(url).await.expect("WebSocket connect failed");
    ws
}

pub async fn send_json(ws: &mut Ws, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string()))
        .await
        .expect("send failed");
}

pub async fn send_envelope(ws: &mut Ws, envelope: &Envelope) {
    ws.send(Message::Text(envelope.encode().expect("encode")))
        .await
        .expect("send failed");
}

/// Next text frame as an envelope, skipping control frames.
pub async fn recv_envelope(ws: &mut Ws) -> Envelope {
    loop {
        let msg = timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("WebSocket error");
        match msg {
            Message::Text(text) => return Envelope::decode(&text).expect("decodable envelope"),
            Message::Close(frame) => panic!("unexpected close: {frame:?}"),
            _ => continue,
        }
    }
}

/// Asserts nothing arrives within `window`.
pub async fn expect_silence(ws: &mut Ws, window: Duration) {
    if let Ok(Some(Ok(msg))) = timeout(window, ws.next()).await {
        if let Message::Text(text) = msg {
            panic!("expected silence, got {text}");
        }
    }
}

/// Waits for the server to close the socket and returns the close code.
pub async fn expect_close(ws: &mut Ws) -> Option<u16> {
    loop {
        match timeout(RECV_TIMEOUT, ws.next()).await.expect("timed out waiting for close") {
            Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}

pub fn is_policy_close(code: Option<u16>) -> bool {
    code == Some(u16::from(CloseCode::Policy))
}

/// Connect and authenticate a worker, waiting until the relay has attached it.
pub async fn connect_worker(server: &TestServer) -> Ws {
    let mut ws = connect(&server.ws_url("/ws/worker")).await;
    send_json(
        &mut ws,
        serde_json::json!({"type": "auth", "secret": WORKER_SECRET}),
    )
    .await;

    let attached = async {
        while !server.state.relay.worker_connected().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    timeout(RECV_TIMEOUT, attached)
        .await
        .expect("worker never attached");
    ws
}

/// Connect a session with the given query string and consume the
/// `auth_success` + availability `status` greeting. Returns the resolved id.
pub async fn connect_session(server: &TestServer, query: &str) -> (Ws, String) {
    let mut ws = connect(&server.ws_url(&format!("/ws/session{query}"))).await;
    let (user_id, _greeting) = read_greeting(&mut ws).await;
    (ws, user_id)
}

pub async fn read_greeting(ws: &mut Ws) -> (String, Envelope) {
    let hello = recv_envelope(ws).await;
    assert_eq!(hello.kind(), "auth_success");
    let user_id = hello.user_id.expect("auth_success carries user_id");
    let status = recv_envelope(ws).await;
    assert_eq!(status.kind(), "status");
    (user_id, status)
}
