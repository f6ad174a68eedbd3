/// Liveness source: the node RPC queried for chain progress.
///
/// Only three calls matter: the head block number, the sync status (whose
/// current block stands in for the head while catching up), and a block
/// lookup used to log the hash of the observed height.
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of a fetched block, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMarker {
    pub number: u64,
    pub hash: String,
}

/// Sync progress reported by a node that is still catching up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncProgress {
    pub current_block: u64,
    pub highest_block: u64,
}

/// Anything that can report a monotonically non-decreasing progress counter.
pub trait LivenessSource {
    /// `None` when the node reports it is not syncing.
    fn sync_progress(&self) -> impl Future<Output = Result<Option<SyncProgress>, RpcError>> + Send;

    fn block_number(&self) -> impl Future<Output = Result<u64, RpcError>> + Send;

    /// `None` when the node has no block at that height.
    fn block_by_number(
        &self,
        number: u64,
    ) -> impl Future<Output = Result<Option<BlockMarker>, RpcError>> + Send;
}

/// Ethereum-style JSON-RPC over HTTP.
pub struct EthRpcClient {
    url: String,
    client: reqwest::Client,
    next_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

impl EthRpcClient {
    pub fn new(url: impl Into<String>) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| RpcError::Client { source: e })?;
        Ok(Self {
            url: url.into(),
            client,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call(&self, method: &'static str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcError::Transport { method, source: e })?;

        if !resp.status().is_success() {
            return Err(RpcError::Status {
                method,
                status: resp.status().as_u16(),
            });
        }

        let reply: RpcResponse = resp
            .json()
            .await
            .map_err(|e| RpcError::Transport { method, source: e })?;

        if let Some(err) = reply.error {
            return Err(RpcError::Remote {
                method,
                code: err.code,
                message: err.message,
            });
        }

        Ok(reply.result)
    }
}

impl LivenessSource for EthRpcClient {
    async fn sync_progress(&self) -> Result<Option<SyncProgress>, RpcError> {
        let method = "eth_syncing";
        let value = self.call(method, json!([])).await?;
        parse_sync(&value).map_err(|reason| RpcError::Malformed { method, reason })
    }

    async fn block_number(&self) -> Result<u64, RpcError> {
        let method = "eth_blockNumber";
        let value = self.call(method, json!([])).await?;
        parse_quantity(&value).map_err(|reason| RpcError::Malformed { method, reason })
    }

    async fn block_by_number(&self, number: u64) -> Result<Option<BlockMarker>, RpcError> {
        let method = "eth_getBlockByNumber";
        let value = self
            .call(method, json!([format!("{number:#x}"), false]))
            .await?;
        parse_block(&value).map_err(|reason| RpcError::Malformed { method, reason })
    }
}

/// Decode a hex quantity such as `"0x1b4"`.
fn parse_quantity(value: &Value) -> Result<u64, String> {
    let text = value
        .as_str()
        .ok_or_else(|| format!("expected hex quantity, got {value}"))?;
    let digits = text
        .strip_prefix("0x")
        .filter(|d| !d.is_empty())
        .ok_or_else(|| format!("invalid hex quantity {text:?}"))?;
    u64::from_str_radix(digits, 16).map_err(|e| format!("invalid hex quantity {text:?}: {e}"))
}

fn parse_sync(value: &Value) -> Result<Option<SyncProgress>, String> {
    match value {
        Value::Bool(false) => Ok(None),
        Value::Object(fields) => {
            let field = |name: &str| {
                fields
                    .get(name)
                    .ok_or_else(|| format!("sync status missing {name}"))
                    .and_then(parse_quantity)
            };
            Ok(Some(SyncProgress {
                current_block: field("currentBlock")?,
                highest_block: field("highestBlock")?,
            }))
        }
        other => Err(format!("unexpected sync status {other}")),
    }
}

fn parse_block(value: &Value) -> Result<Option<BlockMarker>, String> {
    if value.is_null() {
        return Ok(None);
    }
    let number = value
        .get("number")
        .ok_or_else(|| "block missing number".to_string())
        .and_then(parse_quantity)?;
    let hash = value
        .get("hash")
        .and_then(Value::as_str)
        .ok_or_else(|| "block missing hash".to_string())?;
    Ok(Some(BlockMarker {
        number,
        hash: hash.to_string(),
    }))
}

/// Errors talking to the liveness source.
#[derive(Debug)]
pub enum RpcError {
    /// The HTTP client could not be constructed.
    Client { source: reqwest::Error },
    /// Connection, request or body decoding failed.
    Transport {
        method: &'static str,
        source: reqwest::Error,
    },
    /// Non-success HTTP status.
    Status { method: &'static str, status: u16 },
    /// The node answered with a JSON-RPC error object.
    Remote {
        method: &'static str,
        code: i64,
        message: String,
    },
    /// The result did not have the expected shape.
    Malformed {
        method: &'static str,
        reason: String,
    },
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::Client { source } => write!(f, "failed to build RPC client: {}", source),
            RpcError::Transport { method, source } => {
                write!(f, "{} request failed: {}", method, source)
            }
            RpcError::Status { method, status } => {
                write!(f, "{} returned HTTP status {}", method, status)
            }
            RpcError::Remote {
                method,
                code,
                message,
            } => write!(f, "{} returned error {}: {}", method, code, message),
            RpcError::Malformed { method, reason } => {
                write!(f, "{} returned a malformed result: {}", method, reason)
            }
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RpcError::Client { source } => Some(source),
            RpcError::Transport { source, .. } => Some(source),
            _ => None,
        }
    }
}
