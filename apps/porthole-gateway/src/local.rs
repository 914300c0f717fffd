//! Local exec backend: every attach spawns the configured shell in a
//! fresh PTY pair. It stands in for a cluster exec backend, so the
//! namespace half of a target is free-form here and only shows up in
//! logs and audit records.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::io::AsyncWriteExt;
use tokio::task;
use tracing::debug;

use porthole_core::error::{Error, Result};
use porthole_core::exec::{
    BulkTransfer, ExecChannel, ExecReader, ExecWriter, Geometry, Progress, RemoteExec,
    TargetDiscovery, TargetRef,
};

const READ_CHUNK: usize = 4096;
const TRANSFER_CHUNK: usize = 4096;

fn pty_size(geometry: Geometry) -> PtySize {
    PtySize {
        rows: geometry.rows,
        cols: geometry.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

pub struct LocalExec {
    shell: String,
}

impl LocalExec {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

#[async_trait]
impl RemoteExec for LocalExec {
    async fn attach(&self, target: &TargetRef, geometry: Geometry) -> Result<ExecChannel> {
        let unreachable = |what: &str, err: &dyn std::fmt::Display| Error::TargetUnreachable {
            target: target.to_string(),
            message: format!("{what}: {err}"),
        };

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(geometry))
            .map_err(|err| unreachable("open pty", &err))?;

        let mut cmd = CommandBuilder::new(&self.shell);
        cmd.env("TERM", "xterm-256color");
        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|err| unreachable(&format!("spawn {}", self.shell), &err))?;

        let master = pair.master;
        let reader = master
            .try_clone_reader()
            .map_err(|err| unreachable("clone pty reader", &err))?;
        let writer = master
            .take_writer()
            .map_err(|err| unreachable("take pty writer", &err))?;

        debug!("spawned {} in a pty for {}", self.shell, target);
        Ok(ExecChannel {
            reader: Box::new(PtyReader {
                reader: Arc::new(Mutex::new(reader)),
            }),
            writer: Box::new(PtyWriter {
                writer: Arc::new(Mutex::new(writer)),
                master: Arc::new(Mutex::new(master)),
                child: Arc::new(Mutex::new(Some(child))),
            }),
        })
    }
}

struct PtyReader {
    reader: Arc<Mutex<Box<dyn Read + Send>>>,
}

#[async_trait]
impl ExecReader for PtyReader {
    async fn read(&mut self) -> Result<Option<Bytes>> {
        let reader = self.reader.clone();
        let chunk = task::spawn_blocking(move || loop {
            let mut guard = reader.lock().unwrap();
            let mut buffer = vec![0u8; READ_CHUNK];
            match guard.read(&mut buffer) {
                Ok(0) => return Ok(None),
                Ok(n) => {
                    buffer.truncate(n);
                    return Ok(Some(buffer));
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::from(err)),
            }
        })
        .await
        .map_err(|err| Error::TransportBroken(format!("pty read task: {err}")))??;
        Ok(chunk.map(Bytes::from))
    }
}

struct PtyWriter {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    child: Arc<Mutex<Option<Box<dyn Child + Send + Sync>>>>,
}

impl PtyWriter {
    fn kill_child(child: &Mutex<Option<Box<dyn Child + Send + Sync>>>) {
        let mut guard = child.lock().unwrap();
        if let Some(mut child) = guard.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[async_trait]
impl ExecWriter for PtyWriter {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let writer = self.writer.clone();
        let data = data.to_vec();
        task::spawn_blocking(move || {
            let mut guard = writer.lock().unwrap();
            guard.write_all(&data)?;
            guard.flush()
        })
        .await
        .map_err(|err| Error::TransportBroken(format!("pty write task: {err}")))?
        .map_err(Error::from)
    }

    async fn resize(&mut self, geometry: Geometry) -> Result<()> {
        let master = self.master.lock().unwrap();
        master
            .resize(pty_size(geometry))
            .map_err(|err| Error::TransportBroken(format!("pty resize: {err}")))
    }

    async fn shutdown(&mut self) -> Result<()> {
        let child = self.child.clone();
        task::spawn_blocking(move || Self::kill_child(&child))
            .await
            .map_err(|err| Error::TransportBroken(format!("pty shutdown task: {err}")))?;
        Ok(())
    }
}

impl Drop for PtyWriter {
    fn drop(&mut self) {
        Self::kill_child(&self.child);
    }
}

/// Existence here means the shell program resolves to an executable.
pub struct LocalDiscovery {
    shell: String,
}

impl LocalDiscovery {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

fn resolve_program(program: &str) -> bool {
    let candidate = Path::new(program);
    if candidate.is_absolute() {
        return candidate.is_file();
    }
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(program).is_file())
}

#[async_trait]
impl TargetDiscovery for LocalDiscovery {
    async fn query(&self, _target: &TargetRef) -> Result<bool> {
        let shell = self.shell.clone();
        task::spawn_blocking(move || resolve_program(&shell))
            .await
            .map_err(|err| Error::QueryFailed(format!("discovery task: {err}")))
    }
}

/// Writes upload payloads to the destination path on the gateway host.
pub struct LocalBulkTransfer;

#[async_trait]
impl BulkTransfer for LocalBulkTransfer {
    async fn put(
        &self,
        _target: &TargetRef,
        dest: &str,
        payload: Bytes,
        progress: &Progress,
    ) -> Result<()> {
        let failed = |what: &str, err: std::io::Error| {
            Error::UploadTransportFailed(format!("{what} {dest}: {err}"))
        };
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|err| failed("create", err))?;
        let total = payload.len().max(1);
        let mut written = 0usize;
        for slice in payload.chunks(TRANSFER_CHUNK) {
            file.write_all(slice)
                .await
                .map_err(|err| failed("write", err))?;
            written += slice.len();
            progress.report(written as f64 / total as f64);
        }
        file.flush().await.map_err(|err| failed("flush", err))?;
        Ok(())
    }
}
