use std::sync::Arc;
use std::time::Duration;

use ragchat_stream::{
    ApiError, ChatEvent, ChatMode, ChatRequest, ChatTransport, FailureKind, HandoffStatus,
    HttpTransport, SessionEpoch, StreamClient, StreamEventPayload, StreamOptions, StreamRequest,
    StreamTarget, TransportConfig, TurnId,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

struct CapturedRequest {
    head: String,
    body: Vec<u8>,
}

impl CapturedRequest {
    fn request_line(&self) -> &str {
        self.head.lines().next().unwrap_or_default()
    }

    fn has_header(&self, name: &str, value: &str) -> bool {
        self.head.lines().any(|line| {
            line.split_once(':').is_some_and(|(key, found)| {
                key.trim().eq_ignore_ascii_case(name) && found.trim().eq_ignore_ascii_case(value)
            })
        })
    }

    fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

async fn read_more(socket: &mut TcpStream, buffer: &mut Vec<u8>) -> usize {
    let mut chunk = [0u8; 4096];
    let read = socket.read(&mut chunk).await.expect("read request bytes");
    buffer.extend_from_slice(&chunk[..read]);
    read
}

async fn read_request(socket: &mut TcpStream) -> CapturedRequest {
    let mut buffer = Vec::new();
    let header_end = loop {
        if let Some(position) = find(&buffer, b"\r\n\r\n") {
            break position + 4;
        }
        assert!(read_more(socket, &mut buffer).await > 0, "client hung up");
    };

    let head = String::from_utf8_lossy(&buffer[..header_end]).into_owned();
    let mut body = buffer[header_end..].to_vec();

    let content_length = head.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case("content-length")
            .then(|| value.trim().parse::<usize>().ok())
            .flatten()
    });

    match content_length {
        Some(length) => {
            while body.len() < length {
                assert!(read_more(socket, &mut body).await > 0, "body truncated");
            }
        }
        None if head.to_ascii_lowercase().contains("transfer-encoding: chunked") => {
            while find(&body, b"0\r\n\r\n").is_none() {
                assert!(read_more(socket, &mut body).await > 0, "body truncated");
            }
        }
        None => {}
    }

    CapturedRequest { head, body }
}

/// Accepts one connection and answers with a close-delimited event stream.
async fn serve_event_stream(chunks: Vec<&'static [u8]>) -> (String, JoinHandle<CapturedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_request(&mut socket).await;

        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n",
            )
            .await
            .unwrap();
        for chunk in chunks {
            socket.write_all(chunk).await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        socket.shutdown().await.unwrap();
        request
    });

    (base_url, server)
}

/// Accepts one connection and answers with a fixed-length body.
async fn serve_response(
    status_line: &'static str,
    content_type: &'static str,
    body: &'static str,
) -> (String, JoinHandle<CapturedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_request(&mut socket).await;
        let response = format!(
            "HTTP/1.1 {status_line}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.unwrap();
        request
    });

    (base_url, server)
}

fn transport(base_url: &str) -> Arc<HttpTransport> {
    Arc::new(
        HttpTransport::new(
            TransportConfig::new(base_url).with_connect_timeout(Duration::from_secs(5)),
        )
        .unwrap(),
    )
}

fn stream_request(mode: ChatMode, body: ChatRequest) -> StreamRequest {
    StreamRequest::new(
        StreamTarget::new(SessionEpoch::new(0), TurnId::new(1)),
        mode,
        body,
    )
}

async fn run_turn(
    transport: Arc<HttpTransport>,
    request: StreamRequest,
) -> Vec<StreamEventPayload> {
    let mut handle = StreamClient::new(transport, StreamOptions::default())
        .stream_chat(request)
        .unwrap();
    tokio::spawn(handle.worker);

    let mut payloads = Vec::new();
    while let Some(event) = handle.stream.recv().await {
        payloads.push(event.payload);
    }
    payloads
}

#[tokio::test]
async fn agent_stream_is_decoded_across_tcp_chunks() {
    let (base_url, server) = serve_event_stream(vec![
        &b"event: conversation_id\ndata: abc-123\n\nda"[..],
        &b"ta: caf\xc3"[..],
        &b"\xa9\n\n"[..],
        &b"event: handoff_status\ndata: pending\n\n"[..],
    ])
    .await;

    let body = ChatRequest::new("I need a person")
        .with_conversation_id(Some("abc-123".to_string()))
        .with_user_id("test-user");
    let payloads = run_turn(transport(&base_url), stream_request(ChatMode::Agent, body)).await;

    assert_eq!(payloads.len(), 4, "{payloads:?}");
    assert!(matches!(
        &payloads[0],
        StreamEventPayload::Event(ChatEvent::ConversationId(id)) if id == "abc-123"
    ));
    assert!(matches!(
        &payloads[1],
        StreamEventPayload::Event(ChatEvent::Data(text)) if text == "caf\u{e9}"
    ));
    assert!(matches!(
        &payloads[2],
        StreamEventPayload::Event(ChatEvent::HandoffStatus(HandoffStatus::Pending))
    ));
    assert!(matches!(payloads[3], StreamEventPayload::Done));

    let request = server.await.unwrap();
    assert_eq!(
        request.request_line(),
        "POST /api/v1/chat/agent/stream HTTP/1.1"
    );
    assert!(request.has_header("accept", "text/event-stream"));
    assert!(request.has_header("content-type", "application/json"));

    let sent: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(
        sent,
        serde_json::json!({
            "message": "I need a person",
            "conversation_id": "abc-123",
            "user_id": "test-user",
        })
    );
}

#[tokio::test]
async fn rag_stream_sends_prompt_and_null_conversation() {
    let (base_url, server) = serve_event_stream(vec![&b"data: ok\n\n"[..]]).await;

    let body = ChatRequest::new("hello").with_rag_prompt("Context:\n{context}");
    let payloads = run_turn(transport(&base_url), stream_request(ChatMode::Rag, body)).await;
    assert!(matches!(payloads.last(), Some(StreamEventPayload::Done)));

    let request = server.await.unwrap();
    assert_eq!(
        request.request_line(),
        "POST /api/v1/chat/rag/stream HTTP/1.1"
    );
    let sent: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(sent["conversation_id"], serde_json::Value::Null);
    assert_eq!(sent["rag_prompt"], "Context:\n{context}");
}

#[tokio::test]
async fn non_success_status_surfaces_http_error() {
    let (base_url, server) = serve_response(
        "503 Service Unavailable",
        "text/plain",
        "vector store offline",
    )
    .await;

    let payloads = run_turn(
        transport(&base_url),
        stream_request(ChatMode::Rag, ChatRequest::new("hi")),
    )
    .await;

    assert_eq!(payloads.len(), 1);
    assert!(matches!(
        &payloads[0],
        StreamEventPayload::Failed(error) if error.kind() == FailureKind::HttpError(503)
    ));
    server.await.unwrap();
}

#[tokio::test]
async fn refused_connection_is_transport_unreachable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let payloads = run_turn(
        transport(&base_url),
        stream_request(ChatMode::Rag, ChatRequest::new("hi")),
    )
    .await;

    assert!(matches!(
        &payloads[0],
        StreamEventPayload::Failed(error) if error.kind() == FailureKind::TransportUnreachable
    ));
}

#[tokio::test]
async fn prompt_template_is_fetched() {
    let (base_url, server) = serve_response(
        "200 OK",
        "application/json",
        r#"{"prompt":"Answer using {context}"}"#,
    )
    .await;

    let prompt = transport(&base_url).fetch_prompt().await.unwrap();
    assert_eq!(prompt, "Answer using {context}");

    let request = server.await.unwrap();
    assert_eq!(request.request_line(), "GET /api/v1/chat/rag/prompt HTTP/1.1");
}

#[tokio::test]
async fn prompt_fetch_failure_is_an_api_error() {
    let (base_url, server) = serve_response("500 Internal Server Error", "text/plain", "boom").await;

    let error = transport(&base_url).fetch_prompt().await.unwrap_err();
    assert!(matches!(error, ApiError::Status { status: 500, .. }));
    server.await.unwrap();
}

#[tokio::test]
async fn health_reports_ok() {
    let (base_url, server) =
        serve_response("200 OK", "application/json", r#"{"status":"ok"}"#).await;

    assert!(transport(&base_url).health().await.unwrap());
    let request = server.await.unwrap();
    assert_eq!(request.request_line(), "GET /api/v1/health HTTP/1.1");
}

#[tokio::test]
async fn upload_posts_file_as_multipart_field() {
    let (base_url, server) =
        serve_response("200 OK", "application/json", r#"{"doc_id":"doc-42"}"#).await;

    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("notes.txt");
    std::fs::write(&path, "retrieval augmented generation").unwrap();

    let receipt = transport(&base_url).upload_document(&path).await.unwrap();
    assert_eq!(receipt.doc_id, "doc-42");

    let request = server.await.unwrap();
    assert_eq!(request.request_line(), "POST /api/v1/upload HTTP/1.1");
    let body = request.body_text();
    assert!(body.contains(r#"name="file""#), "{body}");
    assert!(body.contains(r#"filename="notes.txt""#), "{body}");
    assert!(body.contains("retrieval augmented generation"));
}

#[tokio::test]
async fn upload_rejects_unsupported_files_without_network() {
    // Nothing listens here; validation must fail first.
    let transport = transport("http://127.0.0.1:9");
    let error = transport
        .upload_document(std::path::Path::new("installer.exe"))
        .await
        .unwrap_err();

    assert!(matches!(error, ApiError::UnsupportedDocument { .. }));
}
