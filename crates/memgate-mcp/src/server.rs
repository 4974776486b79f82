use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use memgate_core::ServiceConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::gateway::ToolGateway;
use crate::protocol::{
    JsonRpcRequest, JsonRpcResponse, ToolsCallParams, INTERNAL_ERROR, INVALID_PARAMS,
    INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR,
};
use crate::registry::RegistryError;

const DEFAULT_MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const MAX_HTTP_BODY_BYTES: usize = 4 * 1024 * 1024;
const MAX_STDIO_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// JSON-RPC front end over a [`ToolGateway`], served on stdio or HTTP.
pub struct McpServer {
    gateway: ToolGateway,
    inflight: Mutex<HashMap<String, CancellationToken>>,
}

#[derive(Debug, Deserialize)]
struct RegisterParams {
    name: String,
    service: ServiceConfig,
}

/// Removes an in-flight entry however the call ends.
struct InflightGuard<'a> {
    inflight: &'a Mutex<HashMap<String, CancellationToken>>,
    key: String,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.inflight.lock().remove(&self.key);
    }
}

impl McpServer {
    pub fn new(gateway: ToolGateway) -> Self {
        Self {
            gateway,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub const fn gateway(&self) -> &ToolGateway {
        &self.gateway
    }

    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        if request.jsonrpc != "2.0" {
            return Some(JsonRpcResponse::error(
                request.id.unwrap_or(Value::Null),
                INVALID_REQUEST,
                "invalid jsonrpc version",
            ));
        }

        let Some(id) = request.id else {
            match request.method.as_str() {
                "notifications/cancelled" => self.cancel_inflight(&request.params),
                "notifications/initialized" => {}
                other => tracing::debug!(method = %other, "ignoring notification"),
            }
            return None;
        };

        let response = match request.method.as_str() {
            "initialize" => {
                let protocol_version = request
                    .params
                    .get("protocolVersion")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_MCP_PROTOCOL_VERSION);
                JsonRpcResponse::success(
                    id,
                    json!({
                        "protocolVersion": protocol_version,
                        "serverInfo": {"name": "memgate", "version": env!("CARGO_PKG_VERSION")},
                        "capabilities": {
                            "tools": {"listChanged": false}
                        }
                    }),
                )
            }
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => JsonRpcResponse::success(
                id,
                json!({ "tools": self.gateway.list_tools() }),
            ),
            "tools/call" => self.handle_tools_call(id, request.params).await,
            "gateway/health" => {
                let services = self.gateway.get_service_health().await;
                JsonRpcResponse::success(id, json!({ "services": services }))
            }
            "gateway/register" => self.handle_register(id, request.params).await,
            _ => JsonRpcResponse::error(id, METHOD_NOT_FOUND, "method not found"),
        };
        Some(response)
    }

    async fn handle_tools_call(&self, id: Value, params: Value) -> JsonRpcResponse {
        let params: ToolsCallParams = match serde_json::from_value(params) {
            Ok(v) => v,
            Err(err) => {
                return JsonRpcResponse::error(
                    id,
                    INVALID_PARAMS,
                    format!("invalid tools/call params: {err}"),
                )
            }
        };

        let cancel = CancellationToken::new();
        let key = request_key(&id);
        self.inflight.lock().insert(key.clone(), cancel.clone());
        let _guard = InflightGuard {
            inflight: &self.inflight,
            key,
        };

        let arguments = params.arguments.unwrap_or_else(|| json!({}));
        match self
            .gateway
            .call_tool_with_cancel(&params.name, arguments, cancel)
            .await
        {
            Ok(result) => JsonRpcResponse::success(id, result.to_value()),
            Err(err) => JsonRpcResponse::from_error_result(id, err),
        }
    }

    async fn handle_register(&self, id: Value, params: Value) -> JsonRpcResponse {
        let params: RegisterParams = match serde_json::from_value(params) {
            Ok(v) => v,
            Err(err) => {
                return JsonRpcResponse::error(
                    id,
                    INVALID_PARAMS,
                    format!("invalid gateway/register params: {err}"),
                )
            }
        };
        let mut service = params.service;
        service.name = params.name;
        let name = service.name.clone();
        match self.gateway.register_service(service).await {
            Ok(()) => JsonRpcResponse::success(
                id,
                json!({ "registered": name, "tools": self.gateway.list_tools().len() }),
            ),
            Err(err @ RegistryError::Config(_)) => {
                JsonRpcResponse::error(id, INVALID_PARAMS, err.to_string())
            }
            Err(err) => {
                tracing::error!(service = %name, error = %err, "registration failed");
                JsonRpcResponse::error(id, INTERNAL_ERROR, err.to_string())
            }
        }
    }

    fn cancel_inflight(&self, params: &Value) {
        let Some(request_id) = params.get("requestId") else {
            return;
        };
        let key = request_key(request_id);
        if let Some(token) = self.inflight.lock().get(&key) {
            tracing::debug!(request = %key, "cancelling in-flight call");
            token.cancel();
        }
    }

    /// Serves newline-delimited or `Content-Length` framed JSON-RPC on
    /// stdin/stdout. Each request runs on its own task; replies use the
    /// framing of the request they answer. Returns once stdin closes and
    /// every pending reply is written.
    pub async fn serve_stdio(self: Arc<Self>) -> io::Result<()> {
        let mut reader = BufReader::new(tokio::io::stdin());
        let (tx, mut rx) = mpsc::unbounded_channel::<(JsonRpcResponse, StdioFrame)>();
        let writer = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some((response, frame)) = rx.recv().await {
                if let Err(err) = write_stdio_response(&mut stdout, &response, frame).await {
                    tracing::error!(error = %err, "stdout write failed");
                    break;
                }
            }
        });

        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                break;
            }
            let trimmed = line.trim_end_matches(['\r', '\n']).trim_start();
            if trimmed.is_empty() {
                continue;
            }

            let (payload, frame) = if is_stdio_header_line(trimmed) {
                let content_length = match read_stdio_content_length(&mut reader, trimmed).await {
                    Ok(v) => v,
                    Err(err) => {
                        let response = JsonRpcResponse::error(
                            Value::Null,
                            PARSE_ERROR,
                            format!("invalid stdio frame: {err}"),
                        );
                        let _ = tx.send((response, StdioFrame::LineDelimited));
                        continue;
                    }
                };
                let mut body = vec![0_u8; content_length];
                if let Err(err) = reader.read_exact(&mut body).await {
                    let response = JsonRpcResponse::error(
                        Value::Null,
                        PARSE_ERROR,
                        format!("invalid stdio frame body: {err}"),
                    );
                    let _ = tx.send((response, StdioFrame::ContentLength));
                    continue;
                }
                (body, StdioFrame::ContentLength)
            } else {
                (trimmed.as_bytes().to_vec(), StdioFrame::LineDelimited)
            };

            let request = match decode_request(&payload) {
                Ok(v) => v,
                Err(response) => {
                    let _ = tx.send((response, frame));
                    continue;
                }
            };
            let server = self.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Some(response) = server.handle_request(request).await {
                    let _ = tx.send((response, frame));
                }
            });
        }

        drop(tx);
        if let Err(err) = writer.await {
            tracing::error!(error = %err, "stdio writer task failed");
        }
        Ok(())
    }

    pub async fn serve_http(self: Arc<Self>, addr: &str) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener).await
    }

    /// Accept loop over an already bound listener. Runs until the task is
    /// dropped.
    pub async fn serve_listener(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        tracing::info!(addr = %listener.local_addr()?, "http transport listening");
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = server.handle_http_connection(stream).await {
                            tracing::warn!(%peer, error = %err, "http request error");
                        }
                    });
                }
                Err(err) => tracing::warn!(error = %err, "http accept error"),
            }
        }
    }

    async fn handle_http_connection(&self, stream: TcpStream) -> io::Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let response = match read_http_request(&mut reader).await {
            Ok(Some(req)) => self.dispatch_http_request(req).await,
            Ok(None) => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::InvalidData => HttpResponse::json(
                400,
                &json!({"error": "bad_request", "message": err.to_string()}),
            ),
            Err(err) => return Err(err),
        };
        write_http_response(&mut write_half, response).await
    }

    async fn dispatch_http_request(&self, req: HttpRequest) -> HttpResponse {
        match (req.method.as_str(), req.path.as_str()) {
            ("GET", "/health") => {
                let services = self.gateway.get_service_health().await;
                let healthy = services.values().all(|s| s.healthy);
                HttpResponse::json(
                    if healthy { 200 } else { 503 },
                    &json!({
                        "status": if healthy { "ok" } else { "degraded" },
                        "services": services,
                    }),
                )
            }
            ("GET", "/metrics") => HttpResponse::text(
                200,
                "text/plain; version=0.0.4",
                self.gateway.render_metrics_text(),
            ),
            ("POST", "/mcp") => match decode_request(&req.body) {
                Ok(request) => match self.handle_request(request).await {
                    Some(response) => HttpResponse::json(200, &response),
                    None => HttpResponse::text(202, "application/json", String::new()),
                },
                Err(response) => HttpResponse::json(200, &response),
            },
            (_, "/health" | "/metrics" | "/mcp") => {
                HttpResponse::json(405, &json!({"error": "method_not_allowed"}))
            }
            _ => HttpResponse::json(404, &json!({"error": "not_found"})),
        }
    }
}

/// Map key for an in-flight request id, so `1` and `"1"` stay distinct.
fn request_key(id: &Value) -> String {
    id.to_string()
}

/// Malformed JSON is a parse error; well-formed JSON that is not a request
/// object is an invalid request.
fn decode_request(payload: &[u8]) -> Result<JsonRpcRequest, JsonRpcResponse> {
    let value: Value = serde_json::from_slice(payload).map_err(|err| {
        JsonRpcResponse::error(Value::Null, PARSE_ERROR, format!("parse error: {err}"))
    })?;
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|err| {
        JsonRpcResponse::error(id, INVALID_REQUEST, format!("invalid request: {err}"))
    })
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

struct HttpResponse {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl HttpResponse {
    fn json<T: Serialize + ?Sized>(status: u16, value: &T) -> Self {
        let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
        Self {
            status,
            content_type: "application/json",
            body,
        }
    }

    fn text(status: u16, content_type: &'static str, body: String) -> Self {
        Self {
            status,
            content_type,
            body: body.into_bytes(),
        }
    }
}

async fn read_http_request<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> io::Result<Option<HttpRequest>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let first = line.trim_end_matches(['\r', '\n']);
    if first.is_empty() {
        return Ok(None);
    }

    let mut parts = first.split_whitespace();
    let Some(method) = parts.next() else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "invalid http request line (missing method)",
        ));
    };
    let Some(target) = parts.next() else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "invalid http request line (missing path)",
        ));
    };
    let path = target.split_once('?').map_or(target, |(p, _)| p).to_string();

    let mut content_length = 0usize;
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header).await? == 0 {
            break;
        }
        let header = header.trim_end_matches(['\r', '\n']);
        if header.is_empty() {
            break;
        }
        if let Some(v) = parse_content_length(header) {
            content_length = v;
        }
    }
    if content_length > MAX_HTTP_BODY_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("request body of {content_length} bytes exceeds limit"),
        ));
    }

    let mut body = vec![0_u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body).await?;
    }
    Ok(Some(HttpRequest {
        method: method.to_string(),
        path,
        body,
    }))
}

async fn write_http_response<W: AsyncWrite + Unpin>(
    stream: &mut W,
    response: HttpResponse,
) -> io::Result<()> {
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        http_reason_phrase(response.status),
        response.content_type,
        response.body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&response.body).await?;
    stream.flush().await
}

const fn http_reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StdioFrame {
    LineDelimited,
    ContentLength,
}

async fn write_stdio_response<W: AsyncWrite + Unpin>(
    out: &mut W,
    response: &JsonRpcResponse,
    frame: StdioFrame,
) -> io::Result<()> {
    let serialized = serde_json::to_vec(response)?;
    match frame {
        StdioFrame::LineDelimited => {
            out.write_all(&serialized).await?;
            out.write_all(b"\n").await?;
        }
        StdioFrame::ContentLength => {
            let head = format!("Content-Length: {}\r\n\r\n", serialized.len());
            out.write_all(head.as_bytes()).await?;
            out.write_all(&serialized).await?;
        }
    }
    out.flush().await
}

fn is_stdio_header_line(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.starts_with("content-length:") || lower.starts_with("content-type:")
}

async fn read_stdio_content_length<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    first_line: &str,
) -> io::Result<usize> {
    let mut content_length = parse_content_length(first_line);
    let mut header_line = String::new();
    loop {
        header_line.clear();
        if reader.read_line(&mut header_line).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected eof while reading frame headers",
            ));
        }
        let trimmed = header_line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some(v) = parse_content_length(trimmed) {
            content_length = Some(v);
        }
    }
    let content_length = content_length
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing content-length header"))?;
    if content_length > MAX_STDIO_FRAME_BYTES {
        // Skip the body without buffering it so the next frame starts clean.
        tokio::io::copy(&mut (&mut *reader).take(content_length as u64), &mut tokio::io::sink())
            .await?;
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {content_length} bytes exceeds {MAX_STDIO_FRAME_BYTES} byte limit"),
        ));
    }
    Ok(content_length)
}

fn parse_content_length(line: &str) -> Option<usize> {
    let (name, value) = line.split_once(':')?;
    if !name.trim().eq_ignore_ascii_case("content-length") {
        return None;
    }
    value.trim().parse::<usize>().ok()
}
