//! HTTP server for the reasoning core.
//! Plain tokio TCP handling; answers stream back as server-sent events.

use chatbi_reasoner::agent::{ClarificationAnswer, HttpQueryExecutor, ReasoningOrchestrator, TurnRequest};
use chatbi_reasoner::config::AppConfig;
use chatbi_reasoner::error::ChatBiError;
use chatbi_reasoner::llm::{OpenAiClient, OpenAiEmbedder};
use chatbi_reasoner::semantic::vector_store::Embedder;
use chatbi_reasoner::semantic::{HashingEmbedder, SemanticCatalog};
use chatbi_reasoner::stream::{encode_done, encode_event};
use chatbi_reasoner::tenant::{MetadataTenantDirectory, RawRequest, TenantContext, TenantGuard};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const MAX_HEADER_BYTES: usize = 16 * 1024;
const MAX_BODY_BYTES: usize = 1024 * 1024;

struct AppState {
    guard: TenantGuard,
    orchestrator: Arc<ReasoningOrchestrator>,
    event_buffer: usize,
}

struct Request {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl Request {
    fn header(&self, name: &str) -> Option<String> {
        self.headers.get(name).cloned()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env()?;
    let Some(api_key) = config.openai_api_key.clone() else {
        anyhow::bail!("OPENAI_API_KEY must be set to run the server");
    };

    let shutdown = CancellationToken::new();
    let llm = OpenAiClient::new(api_key.clone(), config.openai_base_url.clone(), config.llm_model.clone())?;
    let embedder: Arc<dyn Embedder> = if std::env::var("CHATBI_OFFLINE_EMBEDDINGS").is_ok() {
        Arc::new(HashingEmbedder::default())
    } else {
        Arc::new(OpenAiEmbedder::new(
            api_key,
            config.openai_base_url.clone(),
            config.embedding_model.clone(),
        ))
    };
    let catalog = SemanticCatalog::new(embedder, config.pruning.clone())
        .with_metadata_root(&config.metadata_root)
        .with_glossary_watch(config.glossary_poll_interval, shutdown.clone());
    let executor = HttpQueryExecutor::new(config.executor_url.clone(), config.orchestrator.turn_timeout)?;

    let state = Arc::new(AppState {
        guard: TenantGuard::new(Arc::new(MetadataTenantDirectory::new(&config.metadata_root))),
        orchestrator: Arc::new(ReasoningOrchestrator::new(
            Arc::new(llm),
            Arc::new(executor),
            Arc::new(catalog),
            config.orchestrator.clone(),
        )),
        event_buffer: config.orchestrator.event_buffer,
    });

    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!(
        addr = %config.bind_addr,
        metadata_root = %config.metadata_root.display(),
        model = %config.llm_model,
        "Server listening"
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                tracing::debug!(%addr, "New connection");
                tokio::spawn(handle_connection(stream, Arc::clone(&state)));
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                shutdown.cancel();
                return Ok(());
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, state: Arc<AppState>) {
    let request = match read_request(&mut stream).await {
        Ok(Some(request)) => request,
        Ok(None) => {
            let _ = stream
                .write_all(create_response(400, "Bad Request", r#"{"error":"malformed request"}"#).as_bytes())
                .await;
            return;
        }
        Err(e) => {
            warn!("Failed to read request: {}", e);
            return;
        }
    };
    info!(method = %request.method, path = %request.path, "Request");

    let result = match (request.method.as_str(), request.path.as_str()) {
        ("POST", "/api/ask") => return handle_ask(stream, &state, request).await,
        ("POST", "/api/clarify") => handle_clarify(&state, &request).await,
        ("GET", "/health") | ("GET", "/api/health") => {
            create_response(200, "OK", r#"{"status":"ok","service":"chatbi-reasoner"}"#)
        }
        ("OPTIONS", _) => create_response(204, "No Content", ""),
        _ => create_response(404, "Not Found", r#"{"error":"not found"}"#),
    };
    if let Err(e) = stream.write_all(result.as_bytes()).await {
        warn!("Failed to write response: {}", e);
    }
}

/// Read headers up to the blank line, then exactly `Content-Length` bytes.
async fn read_request(stream: &mut TcpStream) -> std::io::Result<Option<Request>> {
    let mut buffer = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = find_subsequence(&buffer, b"\r\n\r\n") {
            break pos;
        }
        if buffer.len() > MAX_HEADER_BYTES {
            return Ok(None);
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buffer.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
    let mut lines = head.lines();
    let Some(request_line) = lines.next() else {
        return Ok(None);
    };
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return Ok(None);
    }
    let method = parts[0].to_string();
    let mut path = parts[1].split('?').next().unwrap_or("/").trim_end_matches('/').to_string();
    if path.is_empty() {
        path = "/".to_string();
    }

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }

    let content_length = headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        return Ok(None);
    }
    let mut body = buffer[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(Some(Request {
        method,
        path,
        headers,
        body,
    }))
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

async fn attach(state: &AppState, request: &Request) -> Result<TenantContext, String> {
    let raw = RawRequest {
        tenant_id: request.header("x-tenant-id"),
        user_id: request.header("x-user-id"),
        session_id: request.header("x-session-id"),
    };
    state.guard.attach(&raw).await.map_err(|e| match e {
        ChatBiError::Tenant(message) => message,
        other => {
            error!("Tenant lookup failed: {}", other);
            "Tenant lookup failed".to_string()
        }
    })
}

async fn handle_ask(mut stream: TcpStream, state: &AppState, request: Request) {
    let ctx = match attach(state, &request).await {
        Ok(ctx) => ctx,
        Err(message) => {
            let body = serde_json::json!({ "error": message }).to_string();
            let _ = stream.write_all(create_response(403, "Forbidden", &body).as_bytes()).await;
            return;
        }
    };
    let turn_request: TurnRequest = match serde_json::from_slice(&request.body) {
        Ok(turn_request) => turn_request,
        Err(e) => {
            let body = serde_json::json!({ "error": format!("Invalid request body: {}", e) }).to_string();
            let _ = stream.write_all(create_response(400, "Bad Request", &body).as_bytes()).await;
            return;
        }
    };

    if stream.write_all(sse_headers().as_bytes()).await.is_err() {
        return;
    }

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(state.event_buffer);
    let turn = {
        let orchestrator = Arc::clone(&state.orchestrator);
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { orchestrator.run_turn(&ctx, turn_request, tx, cancel).await })
    };

    while let Some(event) = rx.recv().await {
        let frame = match encode_event(&event) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode event: {}", e);
                continue;
            }
        };
        if stream.write_all(frame.as_bytes()).await.is_err() {
            warn!(session_id = %ctx.session_id(), "Client disconnected; cancelling turn");
            cancel.cancel();
            break;
        }
    }
    // Further emits fail once the receiver is gone.
    drop(rx);

    match turn.await {
        Ok(report) => info!(
            tenant_id = %report.tenant_id,
            outcome = report.outcome.as_str(),
            executions = report.executions,
            "Turn finished"
        ),
        Err(e) => error!("Turn task failed: {}", e),
    }
    if !cancel.is_cancelled() {
        let _ = stream.write_all(encode_done().as_bytes()).await;
    }
    let _ = stream.shutdown().await;
}

async fn handle_clarify(state: &AppState, request: &Request) -> String {
    let ctx = match attach(state, request).await {
        Ok(ctx) => ctx,
        Err(message) => {
            let body = serde_json::json!({ "error": message }).to_string();
            return create_response(403, "Forbidden", &body);
        }
    };
    let answer: ClarificationAnswer = match serde_json::from_slice(&request.body) {
        Ok(answer) => answer,
        Err(e) => {
            let body = serde_json::json!({ "error": format!("Invalid answer: {}", e) }).to_string();
            return create_response(400, "Bad Request", &body);
        }
    };
    match state.orchestrator.clarifications().answer(&ctx, answer) {
        Ok(()) => create_response(200, "OK", r#"{"delivered":true}"#),
        Err(e) => {
            let body = serde_json::json!({ "delivered": false, "error": e.to_string() }).to_string();
            create_response(409, "Conflict", &body)
        }
    }
}

fn sse_headers() -> String {
    "HTTP/1.1 200 OK\r\n\
     Content-Type: text/event-stream\r\n\
     Cache-Control: no-cache\r\n\
     Connection: close\r\n\
     Access-Control-Allow-Origin: *\r\n\
     \r\n"
        .to_string()
}

fn create_response(status: u16, status_text: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type, X-Tenant-Id, X-User-Id, X-Session-Id\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        status_text,
        body.len(),
        body
    )
}
