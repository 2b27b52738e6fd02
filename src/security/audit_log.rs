use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

const MAX_LABEL_LEN: usize = 255;
const MAX_AGENT_LEN: usize = 500;
const QUEUE_DEPTH: usize = 1024;

/// One durable entry in the append-only audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub credential_hash: String,
    pub endpoint: String,
    pub request_data: String,
    pub response_code: u16,
    pub ip_address: String,
    pub user_agent: String,
}

/// Caller identity as seen by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub address: String,
    pub agent: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            agent: String::new(),
        }
    }
}

/// Destination for audit records. Implementations must not block the caller.
pub trait AuditSink: Send + Sync + std::fmt::Debug {
    fn append(&self, record: AuditRecord) -> Result<()>;
}

/// Keeps records in memory; for tests and embedding hosts that drain it themselves.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditSink {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        match self.records.lock() {
            Ok(g) => g.clone(),
            Err(e) => e.into_inner().clone(),
        }
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, record: AuditRecord) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| anyhow!("audit buffer poisoned"))?
            .push(record);
        Ok(())
    }
}

/// Appends JSON lines to a file from a background task.
#[derive(Debug, Clone)]
pub struct JsonlAuditSink {
    path: PathBuf,
    tx: mpsc::Sender<AuditRecord>,
}

impl JsonlAuditSink {
    /// Open (or create) `path` for appending and start the writer task.
    pub async fn open(path: impl AsRef<Path>) -> Result<(Self, JoinHandle<()>)> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening audit log {}", path.display()))?;

        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let handle = tokio::spawn(write_loop(file, path.clone(), rx));
        Ok((Self { path, tx }, handle))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAuditSink {
    fn append(&self, record: AuditRecord) -> Result<()> {
        self.tx
            .try_send(record)
            .map_err(|e| anyhow!("audit queue rejected record: {e}"))
    }
}

async fn write_loop(mut file: tokio::fs::File, path: PathBuf, mut rx: mpsc::Receiver<AuditRecord>) {
    while let Some(record) = rx.recv().await {
        let mut line = match serde_json::to_vec(&record) {
            Ok(v) => v,
            Err(e) => {
                error!(target: "audit", event = "sink_error", error = %e, "failed to encode audit record");
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = file.write_all(&line).await {
            error!(target: "audit", event = "sink_error", path = %path.display(), error = %e, "failed to append audit record");
            continue;
        }
        if let Err(e) = file.flush().await {
            error!(target: "audit", event = "sink_error", path = %path.display(), error = %e, "failed to flush audit log");
        }
    }
    debug!("audit writer stopped");
}

/// Best-effort writer of audit records.
#[derive(Debug, Clone)]
pub struct AuditLogger {
    sink: Arc<dyn AuditSink>,
}

impl AuditLogger {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Bind the per-request context: the `log_requests` flag of the settings
    /// snapshot in force and the caller's transport identity.
    pub fn for_request<'a>(&'a self, log_requests: bool, client: &'a ClientInfo) -> RequestAudit<'a> {
        RequestAudit {
            logger: self,
            enabled: log_requests,
            client,
        }
    }

    fn write(&self, record: AuditRecord) {
        // Failures stop here; the request being described is unaffected.
        if let Err(e) = self.sink.append(record) {
            error!(target: "audit", event = "sink_error", error = %e, "audit record dropped");
        }
    }
}

pub struct RequestAudit<'a> {
    logger: &'a AuditLogger,
    enabled: bool,
    client: &'a ClientInfo,
}

impl RequestAudit<'_> {
    /// `credential_hash` is always a digest, also for secrets that matched nothing.
    pub fn record(&self, credential_hash: &str, label: &str, metadata: &Value, outcome_code: u16) {
        if !self.enabled {
            return;
        }
        let record = AuditRecord {
            timestamp: Utc::now(),
            credential_hash: credential_hash.to_string(),
            endpoint: truncate(label, MAX_LABEL_LEN),
            request_data: serde_json::to_string(metadata).unwrap_or_default(),
            response_code: outcome_code,
            ip_address: self.client.address.clone(),
            user_agent: truncate(&self.client.agent, MAX_AGENT_LEN),
        };
        self.logger.write(record);
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}
