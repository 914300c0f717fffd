//! One attached relay between a client terminal and a remote exec stream.
//!
//! A [`Session`] owns two pumps running as tasks: the inbound pump moves
//! remote output toward the renderer, filtering heartbeat probes and
//! stamping the activity clock; the outbound pump drains a queue of data,
//! resize, and heartbeat items toward the remote, so writes of each kind
//! stay in submission order. Close happens exactly once, whichever side
//! asks first, and the losing reason is discarded.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::time::{interval, sleep, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chunk::{ChunkPolicy, ChunkedTransfer};
use crate::error::{Error, Result};
use crate::exec::{ExecChannel, ExecReader, ExecWriter, Geometry, RemoteExec, TargetRef};
use crate::protocol::{is_heartbeat, HEARTBEAT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

/// Why a session ended. Everything except a transport failure counts as a
/// clean close and must not trigger reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    UserRequested,
    RemoteExited,
    IdleTimeout,
    LifetimeExceeded,
    TransportFailed,
}

impl CloseReason {
    pub fn is_clean(&self) -> bool {
        !matches!(self, CloseReason::TransportFailed)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CloseReason::UserRequested => "user requested",
            CloseReason::RemoteExited => "remote exited",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::LifetimeExceeded => "lifetime exceeded",
            CloseReason::TransportFailed => "transport failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Remote silence tolerated before the probe timer emits a heartbeat.
    /// `None` disables probing, for remotes whose failures surface on
    /// their own (a local PTY, for instance).
    pub liveness_timeout: Option<Duration>,
    pub chunk: ChunkPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            liveness_timeout: Some(Duration::from_secs(45)),
            chunk: ChunkPolicy::default(),
        }
    }
}

/// Items queued toward the remote. A single queue keeps data and resize
/// writes in the order they were submitted.
enum Outbound {
    Data(Bytes),
    Resize(Geometry),
    Heartbeat,
}

struct Inner {
    id: Uuid,
    target: TargetRef,
    user: String,
    config: SessionConfig,
    state: Mutex<SessionState>,
    geometry: Mutex<Geometry>,
    last_activity: Mutex<Instant>,
    outbound: Mutex<Option<UnboundedSender<Outbound>>>,
    closed: watch::Sender<Option<CloseReason>>,
}

impl Inner {
    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    fn enqueue(&self, item: Outbound) -> bool {
        match self.outbound.lock().unwrap().as_ref() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    /// Transitions to `Closing` and records the reason. Returns false if a
    /// close was already in flight; the first caller wins.
    fn begin_close(&self, reason: CloseReason) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                return false;
            }
            *state = SessionState::Closing;
        }
        // dropping the sender lets the outbound pump drain and shut down
        self.outbound.lock().unwrap().take();
        self.closed.send_replace(Some(reason));
        true
    }
}

/// Handle to one relay. Cheap to clone; all clones drive the same state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    pub fn new(
        target: TargetRef,
        user: impl Into<String>,
        geometry: Geometry,
        config: SessionConfig,
    ) -> Self {
        let (closed, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                target,
                user: user.into(),
                config,
                state: Mutex::new(SessionState::Connecting),
                geometry: Mutex::new(geometry),
                last_activity: Mutex::new(Instant::now()),
                outbound: Mutex::new(None),
                closed,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn target(&self) -> &TargetRef {
        &self.inner.target
    }

    pub fn user(&self) -> &str {
        &self.inner.user
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock().unwrap()
    }

    pub fn geometry(&self) -> Geometry {
        *self.inner.geometry.lock().unwrap()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.inner.closed.borrow()
    }

    /// Attaches to the remote and starts the pumps. Remote output lands on
    /// `output`. The first thing the remote sees is a resize to the
    /// session geometry, so sizes set before opening still apply.
    pub async fn open(
        &self,
        backend: &dyn RemoteExec,
        output: UnboundedSender<Bytes>,
    ) -> Result<()> {
        let current = self.state();
        if current != SessionState::Connecting {
            return Err(Error::InvalidState {
                expected: "connecting",
                actual: current.name(),
            });
        }
        let geometry = self.geometry();
        let channel = match backend.attach(&self.inner.target, geometry).await {
            Ok(channel) => channel,
            Err(err) => {
                *self.inner.state.lock().unwrap() = SessionState::Closed;
                self.inner
                    .closed
                    .send_replace(Some(CloseReason::TransportFailed));
                return Err(err);
            }
        };
        let ExecChannel { reader, writer } = channel;

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Outbound::Resize(geometry));
        *self.inner.outbound.lock().unwrap() = Some(tx);
        self.inner.touch();
        *self.inner.state.lock().unwrap() = SessionState::Open;
        info!(
            "session {} open: {} for {} at {}x{}",
            self.inner.id, self.inner.target, self.inner.user, geometry.cols, geometry.rows
        );

        let inbound = tokio::spawn(inbound_pump(self.inner.clone(), reader, output));
        let outbound = tokio::spawn(outbound_pump(self.inner.clone(), writer, rx));
        let probe = self
            .inner
            .config
            .liveness_timeout
            .map(|liveness| tokio::spawn(probe_loop(self.inner.clone(), liveness)));

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _ = tokio::join!(inbound, outbound);
            if let Some(task) = probe {
                task.abort();
            }
            *inner.state.lock().unwrap() = SessionState::Closed;
            debug!("session {} fully closed", inner.id);
        });
        Ok(())
    }

    /// Queues raw bytes toward the remote. Anything sent while the session
    /// is not open is dropped.
    pub fn send(&self, data: impl Into<Bytes>) {
        let data = data.into();
        if self.state() != SessionState::Open {
            warn!(
                "session {} not open, dropping {} bytes",
                self.inner.id,
                data.len()
            );
            return;
        }
        self.inner.enqueue(Outbound::Data(data));
    }

    /// Sends text, splitting oversized payloads into paced fragments so a
    /// large paste cannot flood the remote line discipline.
    pub async fn send_text(&self, text: &str) {
        let mut transfer = ChunkedTransfer::prepare(text, &self.inner.config.chunk);
        if transfer.fragment_count() > 1 {
            debug!(
                "session {} splitting {} bytes into {} pieces",
                self.inner.id,
                text.len(),
                transfer.fragment_count()
            );
        }
        while let Some(piece) = transfer.next_fragment() {
            self.send(Bytes::from(piece));
            if transfer.has_remaining() {
                sleep(self.inner.config.chunk.delay).await;
            }
        }
    }

    /// Records the new geometry and, when open, forwards it to the remote.
    /// Repeats of the current size are not re-sent.
    pub fn resize(&self, cols: u16, rows: u16) {
        let geometry = Geometry::new(cols, rows);
        let changed = {
            let mut current = self.inner.geometry.lock().unwrap();
            let changed = *current != geometry;
            *current = geometry;
            changed
        };
        if changed && self.state() == SessionState::Open {
            self.inner.enqueue(Outbound::Resize(geometry));
        }
    }

    /// Starts an orderly close. Later calls with a different reason lose.
    pub fn close(&self, reason: CloseReason) {
        if self.inner.begin_close(reason) {
            info!("session {} closing: {}", self.inner.id, reason);
        }
    }

    /// Resolves once a close reason is recorded.
    pub async fn wait_closed(&self) -> CloseReason {
        let mut closed = self.inner.closed.subscribe();
        loop {
            if let Some(reason) = *closed.borrow() {
                return reason;
            }
            if closed.changed().await.is_err() {
                return CloseReason::TransportFailed;
            }
        }
    }
}

/// Resolves once the session has a close reason, including one recorded
/// before the caller subscribed.
async fn until_closed(closed: &mut watch::Receiver<Option<CloseReason>>) {
    loop {
        if closed.borrow().is_some() {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}

async fn inbound_pump(
    inner: Arc<Inner>,
    mut reader: Box<dyn ExecReader>,
    output: UnboundedSender<Bytes>,
) {
    let mut closed = inner.closed.subscribe();
    loop {
        tokio::select! {
            read = reader.read() => match read {
                Ok(Some(payload)) => {
                    inner.touch();
                    if is_heartbeat(&payload) {
                        debug!("session {} heartbeat from remote", inner.id);
                        continue;
                    }
                    if output.send(payload).is_err() {
                        inner.begin_close(CloseReason::UserRequested);
                        break;
                    }
                }
                Ok(None) => {
                    debug!("session {} remote hung up", inner.id);
                    inner.begin_close(CloseReason::RemoteExited);
                    break;
                }
                Err(err) => {
                    warn!("session {} read failed: {}", inner.id, err);
                    inner.begin_close(CloseReason::TransportFailed);
                    break;
                }
            },
            _ = until_closed(&mut closed) => break,
        }
    }
}

async fn outbound_pump(
    inner: Arc<Inner>,
    mut writer: Box<dyn ExecWriter>,
    mut queue: UnboundedReceiver<Outbound>,
) {
    while let Some(item) = queue.recv().await {
        let wrote = match item {
            Outbound::Data(data) => writer.write(&data).await,
            Outbound::Resize(geometry) => writer.resize(geometry).await,
            Outbound::Heartbeat => writer.write(&[HEARTBEAT]).await,
        };
        if let Err(err) = wrote {
            warn!("session {} write failed: {}", inner.id, err);
            inner.begin_close(CloseReason::TransportFailed);
            break;
        }
    }
    if let Err(err) = writer.shutdown().await {
        debug!("session {} writer shutdown: {}", inner.id, err);
    }
}

/// Emits a heartbeat sentinel whenever the remote has been silent past the
/// liveness window. Probing a dead transport makes the failure surface as
/// a write error.
async fn probe_loop(inner: Arc<Inner>, liveness: Duration) {
    let mut ticker = interval(liveness / 3);
    let mut closed = inner.closed.subscribe();
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if inner.idle_for() < liveness {
                    continue;
                }
                debug!("session {} remote quiet, probing", inner.id);
                if !inner.enqueue(Outbound::Heartbeat) {
                    break;
                }
            }
            _ = until_closed(&mut closed) => break,
        }
    }
}
