//! Remote tool servers: line-delimited JSON-RPC children and HTTP endpoints.
//!
//! A configuration file lists tool-server endpoints. At startup the
//! registry performs the `initialize` handshake, fetches each server's
//! catalogue with `tools/list`, and registers proxy handlers whose call
//! semantics are: serialise the args, send `tools/call`, await a single
//! response, surface `isError` as a failed outcome. Remote names are
//! namespaced `{server}__{tool}` with a hyphens-to-underscores alias.

use super::{ToolContext, ToolHandler, ToolOutcome, ToolRegistry, tighten_schema};
use crate::errors::KernelError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

/// Per-call and initialisation timeout for remote servers.
const RPC_TIMEOUT: Duration = Duration::from_secs(60);

/// One endpoint entry in `toolservers.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum ToolServerConfig {
    /// A child process speaking line-delimited JSON-RPC on stdio.
    Stdio {
        name: String,
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// An HTTP endpoint taking one POST per call.
    Http { name: String, url: String },
}

impl ToolServerConfig {
    pub fn name(&self) -> &str {
        match self {
            Self::Stdio { name, .. } | Self::Http { name, .. } => name,
        }
    }
}

/// Load the tool-server manifest.
pub fn load_manifest(path: &Path) -> Result<Vec<ToolServerConfig>, KernelError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        KernelError::Config(format!("cannot read tool-server manifest {}: {e}", path.display()))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        KernelError::Config(format!("tool-server manifest {} is invalid: {e}", path.display()))
    })
}

/// A JSON-RPC 2.0 transport to one server.
#[async_trait]
pub trait ToolServerTransport: Send + Sync {
    async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, KernelError>;

    async fn notify(&self, method: &str, params: serde_json::Value) -> Result<(), KernelError>;
}

// --- stdio transport --------------------------------------------------------

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<serde_json::Value, String>>>>>;

/// Line-delimited JSON-RPC over a child process's stdio.
pub struct StdioTransport {
    name: String,
    stdin: Mutex<tokio::process::ChildStdin>,
    pending: PendingMap,
    next_id: AtomicU64,
    _child: Mutex<Child>,
}

impl StdioTransport {
    /// Spawn the child and start the response router.
    pub async fn spawn(name: &str, command: &str, args: &[String]) -> Result<Arc<Self>, KernelError> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                KernelError::Config(format!("cannot spawn tool server {name} ({command}): {e}"))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            KernelError::Config(format!("tool server {name} has no stdin"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            KernelError::Config(format!("tool server {name} has no stdout"))
        })?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let transport = Arc::new(Self {
            name: name.to_string(),
            stdin: Mutex::new(stdin),
            pending: pending.clone(),
            next_id: AtomicU64::new(1),
            _child: Mutex::new(child),
        });

        let server_name = name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        route_response(&pending, &server_name, &line).await;
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            // Child exited: reject everything still in flight.
            let mut map = pending.lock().await;
            for (_, sender) in map.drain() {
                let _ = sender.send(Err(format!("tool server {server_name} exited")));
            }
        });

        Ok(transport)
    }
}

async fn route_response(pending: &PendingMap, server: &str, line: &str) {
    #[derive(Deserialize)]
    struct Incoming {
        #[serde(default)]
        id: Option<u64>,
        #[serde(default)]
        result: Option<serde_json::Value>,
        #[serde(default)]
        error: Option<serde_json::Value>,
    }

    let parsed: Incoming = match serde_json::from_str(line) {
        Ok(p) => p,
        Err(e) => {
            warn!(server, error = %e, "dropping malformed tool-server line");
            return;
        }
    };
    let Some(id) = parsed.id else {
        debug!(server, "ignoring notification from tool server");
        return;
    };
    let Some(sender) = pending.lock().await.remove(&id) else {
        warn!(server, id, "response for unknown request id");
        return;
    };
    let payload = match (parsed.result, parsed.error) {
        (_, Some(error)) => Err(error.to_string()),
        (Some(result), None) => Ok(result),
        (None, None) => Ok(serde_json::Value::Null),
    };
    let _ = sender.send(payload);
}

#[async_trait]
impl ToolServerTransport for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, KernelError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        {
            let mut stdin = self.stdin.lock().await;
            let line = format!("{frame}\n");
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                self.pending.lock().await.remove(&id);
                return Err(KernelError::ToolFailed {
                    tool: self.name.clone(),
                    message: format!("write to tool server failed: {e}"),
                    retryable: false,
                });
            }
            let _ = stdin.flush().await;
        }

        match tokio::time::timeout(RPC_TIMEOUT, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(message))) => Err(KernelError::ToolFailed {
                tool: self.name.clone(),
                message,
                retryable: false,
            }),
            Ok(Err(_)) => Err(KernelError::ToolFailed {
                tool: self.name.clone(),
                message: "tool server dropped the request".to_string(),
                retryable: true,
            }),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(KernelError::ToolFailed {
                    tool: self.name.clone(),
                    message: format!("tool server call timed out after {}s", RPC_TIMEOUT.as_secs()),
                    retryable: true,
                })
            }
        }
    }

    async fn notify(&self, method: &str, params: serde_json::Value) -> Result<(), KernelError> {
        let frame = json!({"jsonrpc": "2.0", "method": method, "params": params});
        let mut stdin = self.stdin.lock().await;
        let line = format!("{frame}\n");
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| KernelError::ToolFailed {
                tool: self.name.clone(),
                message: format!("notify failed: {e}"),
                retryable: false,
            })?;
        let _ = stdin.flush().await;
        Ok(())
    }
}

// --- http transport ---------------------------------------------------------

/// One POST per JSON-RPC call.
pub struct HttpTransport {
    name: String,
    url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(name: &str, url: &str) -> Result<Self, KernelError> {
        let http = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .map_err(|e| KernelError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            name: name.to_string(),
            url: url.to_string(),
            http,
            next_id: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl ToolServerTransport for HttpTransport {
    async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, KernelError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        let response = self
            .http
            .post(&self.url)
            .json(&frame)
            .send()
            .await
            .map_err(|e| KernelError::ToolFailed {
                tool: self.name.clone(),
                message: format!("tool server request failed: {e}"),
                retryable: true,
            })?;

        let body: serde_json::Value =
            response.json().await.map_err(|e| KernelError::ToolFailed {
                tool: self.name.clone(),
                message: format!("tool server returned non-JSON: {e}"),
                retryable: false,
            })?;

        if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
            return Err(KernelError::ToolFailed {
                tool: self.name.clone(),
                message: error.to_string(),
                retryable: false,
            });
        }
        Ok(body.get("result").cloned().unwrap_or(serde_json::Value::Null))
    }

    async fn notify(&self, method: &str, params: serde_json::Value) -> Result<(), KernelError> {
        let frame = json!({"jsonrpc": "2.0", "method": method, "params": params});
        let _ = self.http.post(&self.url).json(&frame).send().await;
        Ok(())
    }
}

// --- proxy registration -----------------------------------------------------

/// Proxy handler for one remote tool.
pub struct RemoteToolProxy {
    transport: Arc<dyn ToolServerTransport>,
    remote_name: String,
}

#[async_trait]
impl ToolHandler for RemoteToolProxy {
    async fn call(&self, args: serde_json::Value, _ctx: &ToolContext) -> ToolOutcome {
        let result = self
            .transport
            .request(
                "tools/call",
                json!({"name": self.remote_name, "arguments": args}),
            )
            .await;
        match result {
            Ok(value) => outcome_from_mcp(&value),
            Err(KernelError::ToolFailed {
                message, retryable, ..
            }) => ToolOutcome::Error {
                message,
                retryable,
                exit_code: None,
            },
            Err(e) => ToolOutcome::error(e.to_string()),
        }
    }
}

/// Map a `tools/call` result to an outcome, surfacing `isError`.
fn outcome_from_mcp(result: &serde_json::Value) -> ToolOutcome {
    let text = result
        .get("content")
        .and_then(|c| c.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_else(|| result.to_string());

    if result.get("isError").and_then(|e| e.as_bool()).unwrap_or(false) {
        ToolOutcome::error(text)
    } else {
        ToolOutcome::text(text)
    }
}

/// A remote tool as reported by `tools/list`.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Option<serde_json::Value>,
}

/// Namespaced registry name for a remote tool.
pub fn namespaced(server: &str, tool: &str) -> String {
    format!("{server}__{tool}")
}

/// Perform the handshake, fetch the catalogue, and register proxies.
pub async fn attach_server(
    registry: &mut ToolRegistry,
    name: &str,
    transport: Arc<dyn ToolServerTransport>,
) -> Result<usize, KernelError> {
    tokio::time::timeout(
        RPC_TIMEOUT,
        transport.request(
            "initialize",
            json!({
                "protocolVersion": "2024-11-05",
                "clientInfo": {"name": "vigil", "version": env!("CARGO_PKG_VERSION")},
                "capabilities": {}
            }),
        ),
    )
    .await
    .map_err(|_| KernelError::ToolFailed {
        tool: name.to_string(),
        message: "tool server initialize timed out".to_string(),
        retryable: true,
    })??;
    transport.notify("notifications/initialized", json!({})).await?;

    let listing = transport.request("tools/list", json!({})).await?;
    let tools: Vec<RemoteToolInfo> = serde_json::from_value(
        listing.get("tools").cloned().unwrap_or(serde_json::Value::Array(Vec::new())),
    )
    .map_err(|e| KernelError::ToolFailed {
        tool: name.to_string(),
        message: format!("tools/list returned an invalid catalogue: {e}"),
        retryable: false,
    })?;

    let mut registered = 0;
    for tool in tools {
        let schema = tighten_schema(
            tool.input_schema
                .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
        );
        let full_name = namespaced(name, &tool.name);
        registry.register(
            &full_name,
            &tool.description,
            schema,
            Arc::new(RemoteToolProxy {
                transport: transport.clone(),
                remote_name: tool.name.clone(),
            }),
        )?;
        let underscored = full_name.replace('-', "_");
        if underscored != full_name {
            registry.alias(&underscored, &full_name);
        }
        registered += 1;
    }
    debug!(server = name, count = registered, "registered remote tools");
    Ok(registered)
}

/// Attach every server from a manifest; a server that fails to start is
/// logged and skipped rather than failing the run.
pub async fn attach_from_manifest(
    registry: &mut ToolRegistry,
    configs: &[ToolServerConfig],
) -> usize {
    let mut total = 0;
    for config in configs {
        let attach_result = match config {
            ToolServerConfig::Stdio { name, command, args } => {
                match StdioTransport::spawn(name, command, args).await {
                    Ok(transport) => attach_server(registry, name, transport).await,
                    Err(e) => Err(e),
                }
            }
            ToolServerConfig::Http { name, url } => match HttpTransport::new(name, url) {
                Ok(transport) => attach_server(registry, name, Arc::new(transport)).await,
                Err(e) => Err(e),
            },
        };
        match attach_result {
            Ok(count) => total += count,
            Err(e) => warn!(server = config.name(), error = %e, "skipping tool server"),
        }
    }
    total
}
