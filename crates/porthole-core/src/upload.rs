//! Out-of-band file delivery into a target.
//!
//! Uploads ride a [`BulkTransfer`] backend, not the interactive session,
//! so a multi-megabyte file cannot stall keystrokes. The injector owns
//! the naming rules: client-supplied names must be bare file names, and
//! the destination directory is fixed at construction, never taken from
//! the client.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::exec::{BulkTransfer, Progress, TargetRef};
use crate::session::{Session, SessionState};

pub const DEFAULT_DEST_DIR: &str = "/tmp";

/// Validates a client-supplied file name: no separators, no traversal,
/// nothing empty.
pub fn sanitize_file_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::UploadValidationFailed("empty file name".into()));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(Error::UploadValidationFailed(format!(
            "file name {name:?} contains a path separator"
        )));
    }
    if name.contains("..") {
        return Err(Error::UploadValidationFailed(format!(
            "file name {name:?} contains a traversal sequence"
        )));
    }
    Ok(name.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Success { remote_path: String },
    Failure { reason: String },
}

/// A running upload: observe progress, cancel, or wait it out.
#[derive(Debug)]
pub struct UploadTask {
    progress: watch::Receiver<f64>,
    handle: JoinHandle<UploadOutcome>,
}

impl UploadTask {
    pub fn progress(&self) -> watch::Receiver<f64> {
        self.progress.clone()
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub async fn wait(self) -> UploadOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(_) => UploadOutcome::Failure {
                reason: "upload cancelled".into(),
            },
        }
    }
}

pub struct UploadInjector {
    transfer: Arc<dyn BulkTransfer>,
    dest_dir: String,
}

impl UploadInjector {
    pub fn new(transfer: Arc<dyn BulkTransfer>, dest_dir: impl Into<String>) -> Self {
        Self {
            transfer,
            dest_dir: dest_dir.into(),
        }
    }

    pub fn remote_path(&self, file_name: &str) -> String {
        format!("{}/{}", self.dest_dir.trim_end_matches('/'), file_name)
    }

    /// Starts an upload. Validation failures are returned immediately;
    /// transfer failures surface through the task outcome. When `session`
    /// is an open session to the target, a bare carriage return is sent
    /// after success so the shell redraws its prompt and the new file is
    /// easy to find.
    pub fn upload(
        &self,
        target: &TargetRef,
        file_name: &str,
        payload: Bytes,
        session: Option<Session>,
    ) -> Result<UploadTask> {
        let file_name = sanitize_file_name(file_name)?;
        let remote_path = self.remote_path(&file_name);
        let (progress, progress_rx) = Progress::channel();
        let transfer = self.transfer.clone();
        let target = target.clone();
        let size = payload.len();
        let handle = tokio::spawn(async move {
            match transfer.put(&target, &remote_path, payload, &progress).await {
                Ok(()) => {
                    progress.finish();
                    info!("uploaded {} bytes to {} as {}", size, target, remote_path);
                    if let Some(session) = session {
                        if session.state() == SessionState::Open {
                            session.send(Bytes::from_static(b"\r"));
                        }
                    }
                    UploadOutcome::Success { remote_path }
                }
                Err(err) => {
                    warn!("upload of {} to {} failed: {}", remote_path, target, err);
                    UploadOutcome::Failure {
                        reason: err.to_string(),
                    }
                }
            }
        });
        Ok(UploadTask {
            progress: progress_rx,
            handle,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::mock::{MockExec, RecordingTransfer, RemoteHandle, WriteOp};
    use crate::exec::Geometry;
    use crate::session::{CloseReason, SessionConfig};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn target() -> TargetRef {
        TargetRef::new("default", "web-0")
    }

    fn injector(transfer: &Arc<RecordingTransfer>) -> UploadInjector {
        UploadInjector::new(transfer.clone(), DEFAULT_DEST_DIR)
    }

    async fn open_session() -> (Session, RemoteHandle) {
        let (exec, mut handles) = MockExec::new();
        let session = Session::new(
            target(),
            "alice",
            Geometry::default(),
            SessionConfig {
                liveness_timeout: None,
                ..SessionConfig::default()
            },
        );
        let (output_tx, _output_rx) = mpsc::unbounded_channel();
        session.open(exec.as_ref(), output_tx).await.unwrap();
        let mut handle = handles.recv().await.unwrap();
        assert!(matches!(handle.next_write().await, WriteOp::Resize(_)));
        (session, handle)
    }

    #[tokio::test]
    async fn separators_and_traversal_are_rejected() {
        let transfer = RecordingTransfer::new();
        let injector = injector(&transfer);
        for bad in ["../../etc/passwd", "a/b.txt", "a\\b.txt", "..", "", "   "] {
            let err = injector
                .upload(&target(), bad, Bytes::from_static(b"x"), None)
                .unwrap_err();
            assert!(
                matches!(err, Error::UploadValidationFailed(_)),
                "{bad:?} should be rejected"
            );
        }
        assert!(transfer.puts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn success_lands_in_the_destination_directory() {
        let transfer = RecordingTransfer::new();
        let injector = UploadInjector::new(transfer.clone(), "/tmp/");
        let task = injector
            .upload(&target(), "notes.txt", Bytes::from_static(b"hello"), None)
            .unwrap();
        assert_eq!(
            task.wait().await,
            UploadOutcome::Success {
                remote_path: "/tmp/notes.txt".into()
            }
        );
        let puts = transfer.puts.lock().unwrap();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0], (target(), "/tmp/notes.txt".to_string(), 5));
    }

    #[tokio::test]
    async fn surrounding_whitespace_is_trimmed() {
        let transfer = RecordingTransfer::new();
        let injector = injector(&transfer);
        let task = injector
            .upload(&target(), "  notes.txt ", Bytes::from_static(b"x"), None)
            .unwrap();
        assert_eq!(
            task.wait().await,
            UploadOutcome::Success {
                remote_path: "/tmp/notes.txt".into()
            }
        );
    }

    #[tokio::test]
    async fn transfer_failure_surfaces_the_reason() {
        let transfer = RecordingTransfer::new();
        transfer.fail_next("disk full");
        let injector = injector(&transfer);
        let task = injector
            .upload(&target(), "notes.txt", Bytes::from_static(b"x"), None)
            .unwrap();
        match task.wait().await {
            UploadOutcome::Failure { reason } => assert!(reason.contains("disk full")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(transfer.puts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn progress_reaches_one_on_success() {
        let transfer = RecordingTransfer::new();
        let injector = injector(&transfer);
        let task = injector
            .upload(&target(), "notes.txt", Bytes::from_static(b"x"), None)
            .unwrap();
        let progress = task.progress();
        task.wait().await;
        assert_eq!(*progress.borrow(), 1.0);
    }

    #[tokio::test]
    async fn open_session_gets_a_prompt_nudge() {
        let (session, mut handle) = open_session().await;
        let transfer = RecordingTransfer::new();
        let injector = injector(&transfer);
        let task = injector
            .upload(&target(), "notes.txt", Bytes::from_static(b"x"), Some(session))
            .unwrap();
        assert!(matches!(task.wait().await, UploadOutcome::Success { .. }));
        assert_eq!(handle.next_write().await, WriteOp::Data(b"\r".to_vec()));
    }

    #[tokio::test]
    async fn closed_session_is_left_alone() {
        let (session, mut handle) = open_session().await;
        session.close(CloseReason::UserRequested);
        session.wait_closed().await;
        assert_eq!(handle.next_write().await, WriteOp::Shutdown);

        let transfer = RecordingTransfer::new();
        let injector = injector(&transfer);
        let task = injector
            .upload(&target(), "notes.txt", Bytes::from_static(b"x"), Some(session))
            .unwrap();
        assert!(matches!(task.wait().await, UploadOutcome::Success { .. }));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.try_next_write(), None);
    }

    #[tokio::test]
    async fn cancel_aborts_a_hung_transfer() {
        let transfer = RecordingTransfer::new();
        transfer.hang_forever();
        let injector = injector(&transfer);
        let task = injector
            .upload(&target(), "notes.txt", Bytes::from_static(b"x"), None)
            .unwrap();
        task.cancel();
        assert_eq!(
            task.wait().await,
            UploadOutcome::Failure {
                reason: "upload cancelled".into()
            }
        );
        assert!(transfer.puts.lock().unwrap().is_empty());
    }
}
