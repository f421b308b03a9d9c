//! YAML configuration of a node.
//!
//! Durations are written in human-readable form (`500ms`, `2s`, `1m`). Every field except
//! `sources` has a default:
//!
//! ```yaml
//! sources:
//!   - http://127.0.0.1:8545
//!   - https://rpc.example.com
//! genesis: 0
//! storage_dir: ./blockflow
//! partition: blocks
//! metrics_port: 9090
//! log_level: info
//! json_logs: false
//! pipeline:
//!   batch_bytes: 2097152
//!   request_timeout: 10s
//!   stall_heal: 15s
//! ```

use crate::Error;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Configuration of a node.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Endpoints of the JSON-RPC sources.
    pub sources: Vec<String>,

    /// First block to ingest when nothing has been persisted yet.
    pub genesis: u64,

    /// Directory holding the record log.
    pub storage_dir: PathBuf,

    /// Partition (within `storage_dir`) holding the record log.
    pub partition: String,

    /// Port to serve metrics on (disabled if absent).
    pub metrics_port: Option<u16>,

    /// Log filter (e.g. `info` or `blockflow_ingest=debug,info`).
    pub log_level: String,

    /// Emit logs as JSON.
    pub json_logs: bool,

    /// Tuning of the ingestion pipeline.
    pub pipeline: Pipeline,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            genesis: 0,
            storage_dir: PathBuf::from("./blockflow"),
            partition: "blocks".to_string(),
            metrics_port: None,
            log_level: "info".to_string(),
            json_logs: false,
            pipeline: Pipeline::default(),
        }
    }
}

/// Tuning of the ingestion pipeline (see [blockflow_ingest::Config]).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Pipeline {
    pub buffer_ceiling: usize,
    pub batch_bytes: usize,
    pub output_capacity: usize,
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub local_weight: usize,
    pub max_workers: usize,
    pub lag_per_worker: u64,
    #[serde(with = "humantime_serde")]
    pub scale_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub backoff_initial: Duration,
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub stall_warn: Duration,
    #[serde(with = "humantime_serde")]
    pub stall_heal: Duration,
    pub cache_capacity: usize,
    #[serde(with = "humantime_serde")]
    pub report_interval: Duration,
}

impl Default for Pipeline {
    fn default() -> Self {
        let cfg = blockflow_ingest::Config::default();
        Self {
            buffer_ceiling: cfg.buffer_ceiling,
            batch_bytes: cfg.batch_bytes,
            output_capacity: cfg.output_capacity,
            refresh_interval: cfg.refresh_interval,
            probe_timeout: cfg.probe_timeout,
            request_timeout: cfg.request_timeout,
            local_weight: cfg.local_weight,
            max_workers: cfg.max_workers,
            lag_per_worker: cfg.lag_per_worker,
            scale_interval: cfg.scale_interval,
            retry_delay: cfg.retry_delay,
            backoff_initial: cfg.backoff_initial,
            backoff_max: cfg.backoff_max,
            poll_interval: cfg.poll_interval,
            stall_warn: cfg.stall_warn,
            stall_heal: cfg.stall_heal,
            cache_capacity: cfg.cache_capacity,
            report_interval: cfg.report_interval,
        }
    }
}

impl Config {
    /// Load a configuration from a YAML file.
    pub fn load(path: &str) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Parse a configuration from YAML.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Configuration of the ingestion pipeline.
    pub fn ingest(&self) -> blockflow_ingest::Config {
        let p = &self.pipeline;
        blockflow_ingest::Config {
            sources: self.sources.clone(),
            genesis: self.genesis,
            buffer_ceiling: p.buffer_ceiling,
            batch_bytes: p.batch_bytes,
            output_capacity: p.output_capacity,
            refresh_interval: p.refresh_interval,
            probe_timeout: p.probe_timeout,
            request_timeout: p.request_timeout,
            local_weight: p.local_weight,
            max_workers: p.max_workers,
            lag_per_worker: p.lag_per_worker,
            scale_interval: p.scale_interval,
            retry_delay: p.retry_delay,
            backoff_initial: p.backoff_initial,
            backoff_max: p.backoff_max,
            poll_interval: p.poll_interval,
            stall_warn: p.stall_warn,
            stall_heal: p.stall_heal,
            cache_capacity: p.cache_capacity,
            report_interval: p.report_interval,
        }
    }
}
