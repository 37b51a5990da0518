//! Full path: browser session → gateway relay → worker link → pipeline →
//! streamed answer back through the gateway.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use gateway::{auth::JwtVerifier, config::Config, transcripts::MemoryTranscriptStore, AppState};
use shared_types::{fragment, Envelope, Payload};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use worker::{
    extract::{DocumentExtractor, OcrSettings},
    link,
    pipeline::{Pipeline, PipelineSettings},
    providers::{GenerationEvent, GenerationRequest, Generator, HashEmbedder},
    store::DocumentStore,
    WorkerService,
};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WORKER_SECRET: &str = "link-e2e-secret";
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Echoes whether the prompt carried the revenue passage, one word per token.
struct EchoGenerator;

#[async_trait]
impl Generator for EchoGenerator {
    async fn stream(&self, request: GenerationRequest) -> anyhow::Result<mpsc::Receiver<GenerationEvent>> {
        let (tx, rx) = mpsc::channel(8);
        let answer = if request.prompt.contains("grew twelve percent") {
            ["Revenue", " grew", " 12%."]
        } else {
            ["I", " do not", " know."]
        };
        tokio::spawn(async move {
            for token in answer {
                let _ = tx.send(GenerationEvent::Token(token.to_string())).await;
            }
            let _ = tx.send(GenerationEvent::Done).await;
        });
        Ok(rx)
    }

    fn name(&self) -> &str {
        "echo"
    }
}

async fn start_gateway() -> (String, Arc<AppState>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    serve_gateway(listener)
}

fn serve_gateway(listener: TcpListener) -> (String, Arc<AppState>, tokio::task::JoinHandle<()>) {
    let config = Config {
        port: 0,
        worker_secret: Some(WORKER_SECRET.to_string()),
        jwt_secret: "link-e2e-jwt".to_string(),
        handshake_timeout: Duration::from_secs(2),
        upload_fragment_bytes: 64,
        max_upload_bytes: 1024 * 1024,
        transcript_database_url: String::new(),
        cors_origins: Vec::new(),
    };
    let verifier = JwtVerifier::new(&config.jwt_secret).expect("verifier");
    let state = Arc::new(AppState::new(
        config,
        Arc::new(verifier),
        Arc::new(MemoryTranscriptStore::new()),
    ));
    let app = gateway::router(Arc::clone(&state));

    let addr = listener.local_addr().expect("addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .await
            .expect("server failed");
    });
    (format!("ws://{addr}"), state, handle)
}

async fn worker_service() -> Arc<WorkerService> {
    let pipeline = Pipeline::new(
        Arc::new(HashEmbedder::default()),
        Arc::new(EchoGenerator),
        PipelineSettings {
            top_k: 1,
            ..Default::default()
        },
    );
    let extractor = DocumentExtractor::with_tesseract(OcrSettings::default());
    let store = DocumentStore::spawn(4).await.expect("store");
    Arc::new(WorkerService::new(extractor, pipeline, store))
}

async fn wait_for_worker(state: &AppState) {
    timeout(RECV_TIMEOUT, async {
        while !state.relay.worker_connected().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker never attached");
}

async fn start_worker(base: &str, state: &AppState) -> tokio::task::JoinHandle<anyhow::Result<()>> {
    let service = worker_service().await;
    let url = format!("{base}/ws/worker");
    let handle = tokio::spawn(async move { link::connect_once(&url, WORKER_SECRET, service).await });
    wait_for_worker(state).await;
    handle
}

async fn send(ws: &mut Ws, envelope: Envelope) {
    ws.send(Message::Text(envelope.encode().expect("encode")))
        .await
        .expect("send");
}

async fn recv(ws: &mut Ws) -> Envelope {
    loop {
        let msg = timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out")
            .expect("stream ended")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return Envelope::decode(&text).expect("envelope");
        }
    }
}

/// Receive until an envelope of `kind` arrives, returning everything seen.
async fn recv_until(ws: &mut Ws, kind: &str) -> Vec<Envelope> {
    let mut seen = Vec::new();
    loop {
        let env = recv(ws).await;
        let done = env.kind() == kind;
        seen.push(env);
        if done {
            return seen;
        }
    }
}

const REPORT: &str = "Acme Corp annual report for the fiscal year.\n\n\
    Quarterly revenue grew twelve percent, driven by widget exports.\n\n\
    The board appointed a new chief financial officer in March.";

#[tokio::test]
async fn test_upload_and_ask_through_gateway() {
    let (base, state, _server) = start_gateway().await;
    let worker = start_worker(&base, &state).await;

    let (mut ws, _) = connect_async(format!("{base}/ws/session?user_id=alice"))
        .await
        .expect("connect");
    let hello = recv(&mut ws).await;
    assert_eq!(hello.kind(), "auth_success");
    assert_eq!(hello.user_id.as_deref(), Some("guest_alice"));
    assert_eq!(recv(&mut ws).await.kind(), "status");

    send(
        &mut ws,
        Envelope::new(Payload::UploadStart {
            filename: "report.txt".into(),
        }),
    )
    .await;
    for data in fragment(REPORT.as_bytes(), 40) {
        send(&mut ws, Envelope::new(Payload::UploadChunk { data })).await;
    }
    send(&mut ws, Envelope::new(Payload::UploadEnd)).await;

    let processing = recv(&mut ws).await;
    assert_eq!(
        processing.payload,
        Payload::Status {
            data: "Processing 'report.txt'...".into()
        }
    );
    let ready = recv(&mut ws).await;
    assert_eq!(
        ready.payload,
        Payload::Status {
            data: "Successfully processed 'report.txt'. Ready to answer questions.".into()
        }
    );

    send(
        &mut ws,
        Envelope::new(Payload::Ask {
            data: "How much did quarterly revenue grow?".into(),
        }),
    )
    .await;
    let replies = recv_until(&mut ws, "answer_end").await;

    let request_id = replies[0].request_id.clone().expect("gateway assigned a request id");
    assert!(replies.iter().all(|e| e.request_id.as_deref() == Some(request_id.as_str())));
    let answer: String = replies
        .iter()
        .filter_map(|e| match &e.payload {
            Payload::AnswerChunk { data } => Some(data.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(answer, "Revenue grew 12%.");

    worker.abort();
}

#[tokio::test]
async fn test_ask_before_upload_reports_no_document() {
    let (base, state, _server) = start_gateway().await;
    let worker = start_worker(&base, &state).await;

    let (mut ws, _) = connect_async(format!("{base}/ws/session?user_id=bob"))
        .await
        .expect("connect");
    assert_eq!(recv(&mut ws).await.kind(), "auth_success");
    assert_eq!(recv(&mut ws).await.kind(), "status");

    send(
        &mut ws,
        Envelope::new(Payload::Ask {
            data: "anything?".into(),
        })
        .with_request(Some("client-1".into())),
    )
    .await;

    let reply = recv(&mut ws).await;
    assert_eq!(reply.request_id.as_deref(), Some("client-1"));
    assert_eq!(
        reply.payload,
        Payload::Error {
            data: "No PDF has been processed yet.".into()
        }
    );

    worker.abort();
}

#[tokio::test]
async fn test_general_chat_needs_no_document() {
    let (base, state, _server) = start_gateway().await;
    let worker = start_worker(&base, &state).await;

    let (mut ws, _) = connect_async(format!("{base}/ws/session?user_id=carol"))
        .await
        .expect("connect");
    recv(&mut ws).await;
    recv(&mut ws).await;

    send(
        &mut ws,
        Envelope::new(Payload::GeneralChat {
            data: "hello".into(),
        }),
    )
    .await;
    let replies = recv_until(&mut ws, "answer_end").await;
    assert_eq!(replies.len(), 4);
    assert!(replies[..3].iter().all(|e| e.kind() == "answer_chunk"));

    worker.abort();
}

#[tokio::test]
async fn test_link_ends_when_gateway_rejects_secret() {
    let (base, state, _server) = start_gateway().await;

    let pipeline = Pipeline::new(
        Arc::new(HashEmbedder::default()),
        Arc::new(EchoGenerator),
        PipelineSettings::default(),
    );
    let service = Arc::new(WorkerService::new(
        DocumentExtractor::with_tesseract(OcrSettings::default()),
        pipeline,
        DocumentStore::spawn(1).await.expect("store"),
    ));

    timeout(
        RECV_TIMEOUT,
        link::connect_once(&format!("{base}/ws/worker"), "wrong-secret", service),
    )
    .await
    .expect("link should end after the gateway closes it")
    .ok();
    assert!(!state.relay.worker_connected().await);
}

#[tokio::test]
async fn test_run_keeps_dialing_until_gateway_appears() {
    // Reserve a port, then leave it closed so the first dials are refused.
    let addr = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind")
        .local_addr()
        .expect("addr");

    let service = worker_service().await;
    let url = format!("ws://{addr}/ws/worker");
    let link = tokio::spawn(async move {
        link::run(&url, WORKER_SECRET, Duration::from_millis(50), service).await
    });

    // Several refused attempts go by.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!link.is_finished());

    let listener = TcpListener::bind(addr).await.expect("rebind reserved port");
    let (base, state, _server) = serve_gateway(listener);
    wait_for_worker(&state).await;

    // The redialed link carries traffic end to end.
    let (mut ws, _) = connect_async(format!("{base}/ws/session?user_id=lena"))
        .await
        .expect("connect");
    assert_eq!(recv(&mut ws).await.kind(), "auth_success");
    recv(&mut ws).await;
    send(
        &mut ws,
        Envelope::new(Payload::GeneralChat {
            data: "still there?".into(),
        }),
    )
    .await;
    let replies = recv_until(&mut ws, "answer_end").await;
    assert!(replies.iter().any(|e| e.kind() == "answer_chunk"));

    link.abort();
}
