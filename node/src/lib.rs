//! Run the ingestion pipeline against JSON-RPC sources, persisting to local blobs.
//!
//! This crate wires [blockflow_ingest] to concrete collaborators:
//!
//! - [rpc::RpcClient] reads heights and blocks from Ethereum-style JSON-RPC endpoints.
//! - [store::Store] commits ordered batches to an append-only, checksummed record log.
//! - [config::Config] loads everything from a YAML file.

use thiserror::Error;

pub mod config;
pub mod rpc;
pub mod store;

/// Errors that can occur when running a node.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to read config: {0}")]
    ReadConfig(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseConfig(#[from] serde_yaml::Error),
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),
    #[error("runtime error: {0}")]
    Runtime(#[from] commonware_runtime::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("corrupt store: {0}")]
    Corrupt(&'static str),
    #[error("gap in commit: expected {expected}, got {got}")]
    Gap { expected: u64, got: u64 },
    #[error("duplicate commit: {0}")]
    Duplicate(u64),
    #[error("record too large: {0} bytes")]
    RecordTooLarge(usize),
    #[error("ingest error: {0}")]
    Ingest(#[from] blockflow_ingest::Error),
}
