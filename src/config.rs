use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::engine::EngineError;
use crate::limits::*;
use crate::model::*;

pub const DEFAULT_RESERVATION_WINDOW_MS: Ms = 24 * HOUR_MS;
pub const DEFAULT_QUEUE: &str = "default";

fn default_window() -> Ms {
    DEFAULT_RESERVATION_WINDOW_MS
}

fn default_fraction() -> f64 {
    1.0
}

/// Per-queue plan settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    pub capacity: ResourceVector,
    #[serde(default = "default_window")]
    pub reservation_window: Ms,
    #[serde(default = "default_fraction")]
    pub instantaneous_max_capacity: f64,
    #[serde(default = "default_fraction")]
    pub average_capacity: f64,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, capacity: ResourceVector) -> Self {
        Self {
            name: name.into(),
            capacity,
            reservation_window: DEFAULT_RESERVATION_WINDOW_MS,
            instantaneous_max_capacity: 1.0,
            average_capacity: 1.0,
        }
    }

    pub fn with_window(mut self, window: Ms) -> Self {
        self.reservation_window = window;
        self
    }

    pub fn with_instantaneous_max(mut self, fraction: f64) -> Self {
        self.instantaneous_max_capacity = fraction;
        self
    }

    pub fn with_average(mut self, fraction: f64) -> Self {
        self.average_capacity = fraction;
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |reason| EngineError::InvalidQueueConfig {
            queue: self.name.clone(),
            reason,
        };
        if self.name.is_empty() {
            return Err(invalid("empty queue name"));
        }
        if self.name.len() > MAX_QUEUE_NAME_LEN {
            return Err(EngineError::LimitExceeded("queue name too long"));
        }
        if self.capacity.is_zero() {
            return Err(invalid("capacity must be non-zero"));
        }
        if self.reservation_window <= 0 {
            return Err(invalid("reservation window must be positive"));
        }
        if !(self.instantaneous_max_capacity > 0.0 && self.instantaneous_max_capacity <= 1.0) {
            return Err(invalid("instantaneous_max_capacity must be in (0, 1]"));
        }
        if !(self.average_capacity > 0.0 && self.average_capacity <= 1.0) {
            return Err(invalid("average_capacity must be in (0, 1]"));
        }
        Ok(())
    }
}

/// Read a JSON array of queue configs.
pub fn load_queues(path: &Path) -> io::Result<Vec<QueueConfig>> {
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Process settings, read from `HORIZON_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub queues_file: Option<PathBuf>,
    /// Plans are loaded from here at startup and written back on shutdown.
    pub snapshot_path: Option<PathBuf>,
    pub acl_enabled: bool,
    pub step_ms: u64,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub cluster: ResourceVector,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|s| s.parse::<u64>().ok());
        Self {
            bind: lookup("HORIZON_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: lookup("HORIZON_PORT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(7433),
            queues_file: lookup("HORIZON_QUEUES").map(PathBuf::from),
            snapshot_path: lookup("HORIZON_SNAPSHOT").map(PathBuf::from),
            acl_enabled: lookup("HORIZON_ACL_ENABLED")
                .map(|s| matches!(s.as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            step_ms: parsed("HORIZON_STEP_MS").unwrap_or(1000),
            max_connections: lookup("HORIZON_MAX_CONNECTIONS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(256),
            metrics_port: lookup("HORIZON_METRICS_PORT").and_then(|s| s.parse().ok()),
            cluster: ResourceVector::new(
                parsed("HORIZON_CLUSTER_MEMORY").unwrap_or(64 * 1024),
                parsed("HORIZON_CLUSTER_VCORES").unwrap_or(64),
            ),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Queue configs from `HORIZON_QUEUES`, or a single default queue sized to the cluster.
    pub fn queues(&self) -> io::Result<Vec<QueueConfig>> {
        match &self.queues_file {
            Some(path) => load_queues(path),
            None => Ok(vec![QueueConfig::new(DEFAULT_QUEUE, self.cluster)]),
        }
    }
}
