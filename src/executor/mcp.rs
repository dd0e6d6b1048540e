//! Minimal MCP client over stdio.
//!
//! Speaks newline-delimited JSON-RPC 2.0 to a tool server child process
//! (by default the Playwright browser server). Only what the chat executor
//! needs is implemented: the initialize handshake, `tools/list` and
//! `tools/call`. Requests are strictly sequential.

use std::process::Stdio;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, Command};

use crate::config::ToolServerConfig;
use crate::error::ToolError;

const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC "method not found".
const METHOD_NOT_FOUND: i64 = -32601;

type Reader = Box<dyn AsyncRead + Send + Sync + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// A tool advertised by the server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// JSON schema of the arguments.
    #[serde(default)]
    pub input_schema: Value,
}

/// Flattened result of a tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub text: String,
    /// The tool ran but reported failure.
    pub is_error: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListToolsResult {
    #[serde(default)]
    tools: Vec<McpTool>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallToolResult {
    #[serde(default)]
    content: Vec<Content>,
    #[serde(default)]
    is_error: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Content {
    Text {
        text: String,
    },
    Image {
        #[serde(default, rename = "mimeType")]
        mime_type: String,
    },
    #[serde(other)]
    Other,
}

/// Connection to one tool server.
///
/// When created with [`McpClient::spawn`] the server process is owned by the
/// client and killed when the client is dropped.
pub struct McpClient {
    lines: Lines<BufReader<Reader>>,
    writer: Writer,
    next_id: u64,
    child: Option<Child>,
}

impl McpClient {
    /// Start the configured server and complete the initialize handshake.
    pub async fn spawn(config: &ToolServerConfig) -> Result<Self, ToolError> {
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Spawn {
                command: config.display(),
                source,
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ToolError::Protocol("server stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ToolError::Protocol("server stdout not captured".to_string()))?;

        let mut client = Self::connect(stdout, stdin);
        client.child = Some(child);

        tokio::time::timeout(config.startup_timeout, client.initialize())
            .await
            .map_err(|_| ToolError::Timeout {
                method: "initialize".to_string(),
                timeout: config.startup_timeout,
            })??;

        tracing::info!(command = %config.display(), "Tool server started");
        Ok(client)
    }

    /// Wrap an existing byte stream. The caller must run [`initialize`](Self::initialize).
    pub fn connect<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Sync + Unpin + 'static,
        W: AsyncWrite + Send + Sync + Unpin + 'static,
    {
        let reader: Reader = Box::new(reader);
        Self {
            lines: BufReader::new(reader).lines(),
            writer: Box::new(writer),
            next_id: 0,
            child: None,
        }
    }

    pub async fn initialize(&mut self) -> Result<(), ToolError> {
        let result = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            )
            .await?;
        let server = result.get("serverInfo").cloned().unwrap_or_default();
        tracing::debug!(%server, "Tool server initialized");
        self.notify("notifications/initialized").await
    }

    /// Every tool the server offers, following pagination.
    pub async fn list_tools(&mut self) -> Result<Vec<McpTool>, ToolError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(c) => json!({ "cursor": c }),
                None => json!({}),
            };
            let page: ListToolsResult = decode(self.request("tools/list", params).await?)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }
    }

    pub async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<ToolOutput, ToolError> {
        let result: CallToolResult = decode(
            self.request("tools/call", json!({ "name": name, "arguments": arguments }))
                .await?,
        )?;

        let text = result
            .content
            .into_iter()
            .filter_map(|c| match c {
                Content::Text { text } => Some(text),
                Content::Image { mime_type } => Some(format!("[image {mime_type}]")),
                Content::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        Ok(ToolOutput {
            text,
            is_error: result.is_error,
        })
    }

    async fn request(&mut self, method: &str, params: Value) -> Result<Value, ToolError> {
        self.next_id += 1;
        let id = self.next_id;
        self.send(&json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }))
            .await?;

        loop {
            let line = self.lines.next_line().await?.ok_or(ToolError::Closed)?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let message: Value = serde_json::from_str(line)
                .map_err(|e| ToolError::Protocol(format!("{e}: {line}")))?;

            // Server-initiated request or notification.
            if message.get("method").is_some() {
                if let Some(request_id) = message.get("id") {
                    self.send(&json!({
                        "jsonrpc": "2.0",
                        "id": request_id,
                        "error": { "code": METHOD_NOT_FOUND, "message": "not supported by client" },
                    }))
                    .await?;
                }
                continue;
            }

            // Late reply to an abandoned request.
            if message.get("id").and_then(Value::as_u64) != Some(id) {
                continue;
            }

            if let Some(error) = message.get("error") {
                return Err(ToolError::Rpc {
                    code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                    message: error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                });
            }
            return Ok(message.get("result").cloned().unwrap_or(Value::Null));
        }
    }

    async fn notify(&mut self, method: &str) -> Result<(), ToolError> {
        self.send(&json!({ "jsonrpc": "2.0", "method": method })).await
    }

    async fn send(&mut self, message: &Value) -> Result<(), ToolError> {
        let mut line = message.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("next_id", &self.next_id)
            .field("has_process", &self.child.is_some())
            .finish()
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, ToolError> {
    serde_json::from_value(value).map_err(|e| ToolError::Protocol(e.to_string()))
}

/// In-process tool server for tests: one `browser_navigate` tool.
/// Returns a connected, uninitialized client and the `tools/call` params seen.
#[cfg(test)]
pub(crate) fn fake_server() -> (McpClient, std::sync::Arc<std::sync::Mutex<Vec<Value>>>) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_io);
    let calls = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen = calls.clone();

    tokio::spawn(async move {
        let (server_read, mut server_write) = tokio::io::split(server_io);
        let mut lines = BufReader::new(server_read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let msg: Value = serde_json::from_str(&line).unwrap();
            let Some(id) = msg.get("id").cloned() else {
                continue;
            };
            let reply = match msg["method"].as_str().unwrap_or_default() {
                "initialize" => json!({ "jsonrpc": "2.0", "id": id, "result": {
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "fake", "version": "0" },
                }}),
                "tools/list" => json!({ "jsonrpc": "2.0", "id": id, "result": { "tools": [{
                    "name": "browser_navigate",
                    "description": "Navigate to a URL",
                    "inputSchema": {
                        "type": "object",
                        "properties": { "url": { "type": "string" } },
                        "required": ["url"],
                    },
                }]}}),
                "tools/call" if msg["params"]["name"] == "browser_navigate" => {
                    seen.lock().unwrap().push(msg["params"].clone());
                    let url = msg["params"]["arguments"]["url"].as_str().unwrap_or_default();
                    json!({ "jsonrpc": "2.0", "id": id, "result": {
                        "content": [{ "type": "text", "text": format!("Navigated to {url}") }],
                    }})
                }
                _ => json!({ "jsonrpc": "2.0", "id": id, "error": {
                    "code": -32602, "message": "Unknown tool",
                }}),
            };
            let mut out = reply.to_string();
            out.push('\n');
            if server_write.write_all(out.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    (McpClient::connect(client_read, client_write), calls)
}
