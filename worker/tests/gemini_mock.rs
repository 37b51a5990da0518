//! Gemini providers against a local stand-in for the REST API.

use std::net::SocketAddr;

use axum::{
    extract::{Path, Query},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use worker::providers::{
    Embedder, GeminiEmbedder, GeminiGenerator, GenerationEvent, GenerationRequest, Generator,
};

#[derive(serde::Deserialize)]
struct KeyQuery {
    key: String,
}

async fn models(Path(rest): Path<String>, Query(q): Query<KeyQuery>, Json(body): Json<Value>) -> Response {
    if q.key != "test-key" {
        return (StatusCode::FORBIDDEN, "bad key").into_response();
    }

    if rest.ends_with(":batchEmbedContents") {
        let requests = body["requests"].as_array().cloned().unwrap_or_default();
        let embeddings: Vec<Value> = requests
            .iter()
            .map(|r| {
                let text = r["content"]["parts"][0]["text"].as_str().unwrap_or("");
                json!({ "values": [text.len() as f32, 1.0] })
            })
            .collect();
        return Json(json!({ "embeddings": embeddings })).into_response();
    }

    if rest.ends_with(":streamGenerateContent") {
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 64);
        let prompt = body["contents"][0]["parts"][0]["text"].as_str().unwrap_or("");
        if prompt == "fail" {
            return (StatusCode::TOO_MANY_REQUESTS, "quota exceeded").into_response();
        }
        let sse = [
            r#"data: {"candidates":[{"content":{"parts":[{"text":"Hel"}],"role":"model"}}]}"#,
            r#"data: {"candidates":[{"content":{"parts":[{"text":"lo ✓"}],"role":"model"}}]}"#,
            r#"data: {"candidates":[{"finishReason":"STOP"}]}"#,
        ]
        .join("\r\n\r\n");
        return ([(header::CONTENT_TYPE, "text/event-stream")], sse).into_response();
    }

    StatusCode::NOT_FOUND.into_response()
}

async fn start_mock() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let app = Router::new().route("/v1beta/models/{*rest}", post(models));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("mock server failed");
    });
    (addr, handle)
}

fn base(addr: SocketAddr) -> String {
    format!("http://{addr}/v1beta/models")
}

fn request(prompt: &str) -> GenerationRequest {
    GenerationRequest {
        prompt: prompt.to_string(),
        temperature: 0.25,
        max_output_tokens: 64,
    }
}

#[tokio::test]
async fn test_batch_embeddings_keep_input_order() {
    let (addr, server) = start_mock().await;
    let embedder = GeminiEmbedder::new("test-key".into(), "text-embedding-004".into())
        .with_base_url(base(addr));

    // More than one API batch.
    let texts: Vec<String> = (0..150).map(|i| "x".repeat(i + 1)).collect();
    let vectors = embedder.embed_batch(&texts).await.unwrap();

    assert_eq!(vectors.len(), 150);
    assert_eq!(vectors[0], vec![1.0, 1.0]);
    assert_eq!(vectors[149], vec![150.0, 1.0]);
    server.abort();
}

#[tokio::test]
async fn test_embedding_http_error_surfaces() {
    let (addr, server) = start_mock().await;
    let embedder =
        GeminiEmbedder::new("wrong".into(), "text-embedding-004".into()).with_base_url(base(addr));

    let err = embedder.embed_batch(&["a".to_string()]).await.unwrap_err();
    assert!(err.to_string().contains("403"));
    server.abort();
}

#[tokio::test]
async fn test_stream_yields_tokens_then_done() {
    let (addr, server) = start_mock().await;
    let generator =
        GeminiGenerator::new("test-key".into(), "gemini-test".into()).with_base_url(base(addr));

    let mut rx = generator.stream(request("hi")).await.unwrap();
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    assert_eq!(
        events,
        vec![
            GenerationEvent::Token("Hel".into()),
            GenerationEvent::Token("lo ✓".into()),
            GenerationEvent::Done,
        ]
    );
    server.abort();
}

#[tokio::test]
async fn test_stream_http_error_becomes_error_event() {
    let (addr, server) = start_mock().await;
    let generator =
        GeminiGenerator::new("test-key".into(), "gemini-test".into()).with_base_url(base(addr));

    let mut rx = generator.stream(request("fail")).await.unwrap();
    match rx.recv().await {
        Some(GenerationEvent::Error(msg)) => assert!(msg.contains("429")),
        other => panic!("expected error event, got {other:?}"),
    }
    assert!(rx.recv().await.is_none());
    server.abort();
}
