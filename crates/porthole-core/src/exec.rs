//! Target addressing and the seams to the world outside a session.
//!
//! Everything a session touches beyond its own state machine goes through
//! a trait here: [`RemoteExec`] hands out attached shell channels,
//! [`TargetDiscovery`] answers existence probes, [`BulkTransfer`] moves
//! file payloads, and [`AuditSink`] records who connected where. Tests
//! swap all of them for scripted doubles.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{Error, Result};

/// Namespace-qualified name of a remote target, `namespace/name` on the
/// wire and the command line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetRef {
    pub namespace: String,
    pub name: String,
}

impl TargetRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for TargetRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(namespace, name))
            }
            _ => Err(Error::InvalidTarget(s.to_string())),
        }
    }
}

/// Terminal dimensions in character cells. Zero is never a usable size,
/// so construction clamps both axes to at least one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub cols: u16,
    pub rows: u16,
}

impl Geometry {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            cols: cols.max(1),
            rows: rows.max(1),
        }
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Byte source attached to a remote shell. `Ok(None)` is a clean EOF.
#[async_trait]
pub trait ExecReader: Send {
    async fn read(&mut self) -> Result<Option<Bytes>>;
}

/// Byte sink attached to a remote shell.
#[async_trait]
pub trait ExecWriter: Send {
    async fn write(&mut self, data: &[u8]) -> Result<()>;
    async fn resize(&mut self, geometry: Geometry) -> Result<()>;
    async fn shutdown(&mut self) -> Result<()>;
}

/// Both halves of an attached shell channel.
pub struct ExecChannel {
    pub reader: Box<dyn ExecReader>,
    pub writer: Box<dyn ExecWriter>,
}

impl fmt::Debug for ExecChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecChannel").finish_non_exhaustive()
    }
}

/// Attaches interactive shell channels to targets.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    async fn attach(&self, target: &TargetRef, geometry: Geometry) -> Result<ExecChannel>;
}

/// Answers whether a target currently exists.
#[async_trait]
pub trait TargetDiscovery: Send + Sync {
    async fn query(&self, target: &TargetRef) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Connected,
    Disconnected,
    Uploaded,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuditAction::Connected => "connected",
            AuditAction::Disconnected => "disconnected",
            AuditAction::Uploaded => "uploaded",
        };
        f.write_str(name)
    }
}

/// One audit record: who did what to which target, when.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    #[serde(flatten)]
    pub target: TargetRef,
    pub user: String,
    pub action: AuditAction,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn now(target: &TargetRef, user: &str, action: AuditAction) -> Self {
        Self {
            target: target.clone(),
            user: user.to_string(),
            action,
            at: Utc::now(),
        }
    }
}

/// Fire-and-forget audit recording. Implementations swallow their own
/// failures so bookkeeping can never take a session down.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

/// Monotonic completion fraction for a transfer, observable through a
/// watch channel. Reports below the current value or outside `[0, 1]`
/// are ignored.
pub struct Progress {
    tx: watch::Sender<f64>,
}

impl Progress {
    pub fn channel() -> (Self, watch::Receiver<f64>) {
        let (tx, rx) = watch::channel(0.0);
        (Self { tx }, rx)
    }

    pub fn report(&self, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        self.tx.send_if_modified(|current| {
            if fraction > *current {
                *current = fraction;
                true
            } else {
                false
            }
        });
    }

    pub fn finish(&self) {
        self.report(1.0);
    }
}

/// Pushes a file payload to a destination path on the target.
#[async_trait]
pub trait BulkTransfer: Send + Sync {
    async fn put(
        &self,
        target: &TargetRef,
        dest: &str,
        payload: Bytes,
        progress: &Progress,
    ) -> Result<()>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_parses_namespace_and_name() {
        let target: TargetRef = "default/web-0".parse().unwrap();
        assert_eq!(target, TargetRef::new("default", "web-0"));
        assert_eq!(target.to_string(), "default/web-0");
    }

    #[test]
    fn malformed_targets_are_rejected() {
        for bad in ["web-0", "default/", "/web-0", "a/b/c", ""] {
            assert!(matches!(
                bad.parse::<TargetRef>(),
                Err(Error::InvalidTarget(_))
            ));
        }
    }

    #[test]
    fn geometry_never_collapses_to_zero() {
        let g = Geometry::new(0, 0);
        assert_eq!(g, Geometry { cols: 1, rows: 1 });
        assert_eq!(Geometry::default(), Geometry { cols: 80, rows: 24 });
    }

    #[test]
    fn progress_is_monotonic_and_clamped() {
        let (progress, rx) = Progress::channel();
        progress.report(0.5);
        assert_eq!(*rx.borrow(), 0.5);
        progress.report(0.3);
        assert_eq!(*rx.borrow(), 0.5);
        progress.report(7.0);
        assert_eq!(*rx.borrow(), 1.0);
        progress.report(-1.0);
        assert_eq!(*rx.borrow(), 1.0);
    }

    #[test]
    fn audit_events_serialize_flat() {
        let event = AuditEvent::now(
            &TargetRef::new("default", "web-0"),
            "alice",
            AuditAction::Connected,
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["namespace"], "default");
        assert_eq!(json["name"], "web-0");
        assert_eq!(json["user"], "alice");
        assert_eq!(json["action"], "connected");
        assert!(json["at"].is_string());
    }
}
