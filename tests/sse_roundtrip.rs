//! End-to-end scenarios over the push-stream (SSE) transport.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, HttpRequest, HttpResponse};
use futures::StreamExt;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;

use mcp_wire::client::Client;
use mcp_wire::server::McpServer;
use mcp_wire::transport::{ClientSseTransport, HttpMiddleware, Next, ServerSseTransport};
use mcp_wire::types::{CallToolResponse, Content};

#[derive(Deserialize, JsonSchema)]
struct EchoArgs {
    /// The message to echo back
    message: String,
}

async fn start_echo_server(transport: ServerSseTransport) -> McpServer {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let server = McpServer::builder()
        .name("echo-server")
        .version("1.0.0")
        .build();
    server
        .register_tool("echo", "Echo back the message you send", |args: EchoArgs| {
            async move { Ok(CallToolResponse::text(format!("Echo: {}", args.message))) }
        })
        .await;
    server.serve(Arc::new(transport)).await.unwrap();
    server
}

/// Pull one `event:`/`data:` pair off a raw SSE byte stream.
async fn next_event<S>(stream: &mut S, buffer: &mut String) -> (String, String)
where
    S: futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin,
{
    loop {
        if let Some(pos) = buffer.find("\n\n") {
            let raw: String = buffer.drain(..pos + 2).collect();
            let mut event = String::new();
            let mut data = String::new();
            for line in raw.lines() {
                if let Some(value) = line.strip_prefix("event: ") {
                    event = value.to_string();
                } else if let Some(value) = line.strip_prefix("data: ") {
                    data = value.to_string();
                }
            }
            return (event, data);
        }
        let chunk = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for an SSE event")
            .expect("SSE stream ended unexpectedly")
            .expect("SSE stream error");
        buffer.push_str(&String::from_utf8_lossy(&chunk));
    }
}

#[tokio::test]
async fn raw_wire_scenarios() {
    let port = 18481;
    let server = start_echo_server(ServerSseTransport::new("127.0.0.1", port, "/mcp/sse")).await;
    let origin = format!("http://127.0.0.1:{port}");
    let http = reqwest::Client::new();

    // Opening the stream announces the session's message URL first.
    let response = http
        .get(format!("{origin}/mcp/sse"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let mut stream = Box::pin(response.bytes_stream());
    let mut buffer = String::new();
    let (event, data) = next_event(&mut stream, &mut buffer).await;
    assert_eq!(event, "endpoint");
    let (path, session_id) = data.split_once("?session_id=").unwrap();
    assert_eq!(path, "/mcp/sse/message");
    assert_eq!(session_id.len(), 32);
    assert!(session_id.chars().all(|c| c.is_ascii_hexdigit()));

    // Initialize through the announced URL; the response rides the stream.
    let response = http
        .post(format!("{origin}{data}"))
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {"name": "raw-client", "version": "0.0.1"},
            },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    let (event, data) = next_event(&mut stream, &mut buffer).await;
    assert_eq!(event, "message");
    let envelope: serde_json::Value = serde_json::from_str(&data).unwrap();
    assert_eq!(envelope["id"], 1);
    assert_eq!(envelope["result"]["protocolVersion"], "2024-11-05");
    assert_eq!(envelope["result"]["serverInfo"]["name"], "echo-server");

    // Dynamic registration broadcasts a list-changed notification.
    server
        .register_tool("extra", "Registered mid-session", |_args: EchoArgs| async move {
            Ok(CallToolResponse::text("extra"))
        })
        .await;
    let (event, data) = next_event(&mut stream, &mut buffer).await;
    assert_eq!(event, "message");
    let envelope: serde_json::Value = serde_json::from_str(&data).unwrap();
    assert_eq!(envelope["method"], "notifications/tools/list_changed");
    assert!(envelope.get("id").is_none());
    assert!(envelope.get("params").is_none());

    // A session that never existed answers 404.
    let response = http
        .post(format!(
            "{origin}/mcp/sse/message?session_id=00000000000000000000000000000000"
        ))
        .json(&json!({"jsonrpc": "2.0", "id": 9, "method": "ping"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    // A missing session id answers 400, as does a malformed body.
    let response = http
        .post(format!("{origin}/mcp/sse/message"))
        .json(&json!({"jsonrpc": "2.0", "id": 9, "method": "ping"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = http
        .post(format!("{origin}/mcp/sse/message?session_id={session_id}"))
        .header("Content-Type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Health endpoint.
    let response = http
        .get(format!("{origin}/mcp/sse/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn client_facade_round_trip() {
    let port = 18482;
    let server = start_echo_server(ServerSseTransport::new("127.0.0.1", port, "/mcp/sse")).await;

    let transport =
        ClientSseTransport::builder(format!("http://127.0.0.1:{port}/mcp/sse")).build();
    let client = Client::builder(Arc::new(transport))
        .client_info("sse-client", "0.1.0")
        .build();

    let init = client.initialize().await.unwrap();
    assert_eq!(init.server_info.name, "echo-server");

    let response = client
        .call_tool("echo", Some(json!({"message": "Hi"})))
        .await
        .unwrap();
    assert_eq!(response.content, vec![Content::text("Echo: Hi")]);

    let tools = client.list_tools(None).await.unwrap();
    assert_eq!(tools.tools[0].name, "echo");

    client.close().await.unwrap();
    server.close().await.unwrap();
}

struct TagHeader {
    name: &'static str,
    value: &'static str,
}

#[async_trait::async_trait(?Send)]
impl HttpMiddleware for TagHeader {
    async fn handle(&self, req: HttpRequest, body: web::Bytes, next: Next<'_>) -> HttpResponse {
        let mut response = next.run(req, body).await;
        response.headers_mut().insert(
            actix_web::http::header::HeaderName::from_static(self.name),
            actix_web::http::header::HeaderValue::from_static(self.value),
        );
        response
    }
}

struct Reject;

#[async_trait::async_trait(?Send)]
impl HttpMiddleware for Reject {
    async fn handle(&self, _req: HttpRequest, _body: web::Bytes, _next: Next<'_>) -> HttpResponse {
        HttpResponse::Unauthorized().body("blocked")
    }
}

#[tokio::test]
async fn middleware_wraps_requests_in_reverse_registration_order() {
    let port = 18483;
    let transport = ServerSseTransport::new("127.0.0.1", port, "/mcp/sse")
        .with_middleware(TagHeader {
            name: "x-tag",
            value: "inner",
        })
        .with_middleware(TagHeader {
            name: "x-tag",
            value: "outer",
        });
    let _server = start_echo_server(transport).await;

    let response = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{port}/mcp/sse/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    // The last middleware added wraps at the outside, so it writes the
    // header last and wins.
    assert_eq!(response.headers().get("x-tag").unwrap(), "outer");
}

#[tokio::test]
async fn middleware_can_short_circuit() {
    let port = 18484;
    let transport =
        ServerSseTransport::new("127.0.0.1", port, "/mcp/sse").with_middleware(Reject);
    let _server = start_echo_server(transport).await;

    let response = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{port}/mcp/sse"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}
