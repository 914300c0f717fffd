//! Audit sinks: who attached to which target, and when.
//!
//! Recording must never take a session down, so both sinks swallow their
//! own failures.

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use porthole_core::exec::{AuditEvent, AuditSink};

/// Appends one JSON object per line to a trail file.
pub struct FileAudit {
    path: String,
}

impl FileAudit {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    async fn append(&self, event: &AuditEvent) -> std::io::Result<()> {
        let mut line = serde_json::to_string(event).map_err(std::io::Error::other)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await
    }
}

#[async_trait]
impl AuditSink for FileAudit {
    async fn record(&self, event: AuditEvent) {
        if let Err(err) = self.append(&event).await {
            debug!("audit append to {} failed: {}", self.path, err);
        }
    }
}

/// Fallback sink when no audit file is configured.
pub struct LogAudit;

#[async_trait]
impl AuditSink for LogAudit {
    async fn record(&self, event: AuditEvent) {
        info!("audit: {} {} {}", event.user, event.action, event.target);
    }
}
