//! Read heights and blocks from Ethereum-style JSON-RPC endpoints.

use crate::Error;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

#[derive(Deserialize)]
struct Response {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// JSON-RPC implementation of [blockflow_ingest::Client].
///
/// The height of an endpoint is its `eth_blockNumber`. A record is the JSON encoding of
/// `eth_getBlockByNumber` (with full transactions). A `null` block has not been produced yet.
#[derive(Clone)]
pub struct RpcClient {
    http: reqwest::Client,
    id: Arc<AtomicU64>,
}

impl RpcClient {
    /// Create a client whose requests fail after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            id: Arc::new(AtomicU64::new(0)),
        })
    }

    async fn call(&self, endpoint: &str, method: &str, params: Value) -> Result<Value, Error> {
        let id = self.id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let response: Response = self
            .http
            .post(endpoint)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if let Some(err) = response.error {
            return Err(Error::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }
}

impl blockflow_ingest::Client for RpcClient {
    type Error = Error;

    async fn height(&self, endpoint: &str) -> Result<u64, Self::Error> {
        let result = self.call(endpoint, "eth_blockNumber", json!([])).await?;
        parse_quantity(&result)
    }

    async fn fetch(&self, endpoint: &str, index: u64) -> Result<Option<Bytes>, Self::Error> {
        let result = self
            .call(
                endpoint,
                "eth_getBlockByNumber",
                json!([format!("{index:#x}"), true]),
            )
            .await?;
        decode_block(index, result)
    }
}

/// Parse a hex-encoded quantity (`"0x1b4"`).
fn parse_quantity(value: &Value) -> Result<u64, Error> {
    let raw = value
        .as_str()
        .ok_or_else(|| Error::InvalidResponse(format!("expected quantity, got {value}")))?;
    let digits = raw
        .strip_prefix("0x")
        .filter(|digits| !digits.is_empty())
        .ok_or_else(|| Error::InvalidResponse(format!("malformed quantity: {raw}")))?;
    u64::from_str_radix(digits, 16)
        .map_err(|_| Error::InvalidResponse(format!("malformed quantity: {raw}")))
}

/// Encode a block returned for `index` (`None` if it has not been produced yet).
fn decode_block(index: u64, block: Value) -> Result<Option<Bytes>, Error> {
    if block.is_null() {
        return Ok(None);
    }
    let number = block
        .get("number")
        .ok_or_else(|| Error::InvalidResponse("block without number".to_string()))?;
    let number = parse_quantity(number)?;
    if number != index {
        return Err(Error::InvalidResponse(format!(
            "requested block {index}, got {number}"
        )));
    }
    let encoded = serde_json::to_vec(&block)
        .map_err(|err| Error::InvalidResponse(format!("failed to encode block: {err}")))?;
    Ok(Some(Bytes::from(encoded)))
}
