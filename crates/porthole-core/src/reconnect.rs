//! Bounded reconnection around a session.
//!
//! The policy lives in [`Machine`], a pure state machine that hands out
//! directives; [`Supervisor`] executes them against real sessions. Keeping
//! the two apart means every backoff rule is testable without a clock,
//! and the supervisor's only timing dependency is the injectable
//! [`Timer`]. The supervisor holds at most one pending timer at any
//! moment, created fresh for each scheduled retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::exec::{Geometry, RemoteExec, TargetRef};
use crate::session::{CloseReason, Session, SessionConfig};

/// Exponential backoff parameters. Retry `n` (1-based) waits
/// `base * multiplier^(n-1)`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        self.base.mul_f64(self.multiplier.powi(exponent as i32))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Connected,
    Reconnecting,
    Exhausted,
}

/// What the supervisor should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Stop: the session ended cleanly.
    Settle,
    /// Wait this long, then try to open a new session.
    RetryAfter(Duration),
    /// Stop: the retry budget is spent or the failure is fatal.
    GiveUp,
}

/// Pure reconnection policy. Feed it session outcomes, follow its
/// directives.
#[derive(Debug)]
pub struct Machine {
    policy: BackoffPolicy,
    state: SupervisorState,
    attempts: u32,
}

impl Machine {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            state: SupervisorState::Idle,
            attempts: 0,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Retries consumed since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// A session opened. Resets the retry budget.
    pub fn on_open(&mut self) {
        self.state = SupervisorState::Connected;
        self.attempts = 0;
    }

    /// A session closed. Clean closes settle; failures schedule a retry.
    pub fn on_close(&mut self, reason: CloseReason) -> Directive {
        if reason.is_clean() {
            self.state = SupervisorState::Idle;
            Directive::Settle
        } else {
            self.schedule_retry()
        }
    }

    /// A scheduled retry failed to open. Fatal errors burn the whole
    /// budget at once.
    pub fn on_attempt_failed(&mut self, fatal: bool) -> Directive {
        if fatal {
            self.state = SupervisorState::Exhausted;
            Directive::GiveUp
        } else {
            self.schedule_retry()
        }
    }

    fn schedule_retry(&mut self) -> Directive {
        if self.attempts >= self.policy.max_attempts {
            self.state = SupervisorState::Exhausted;
            return Directive::GiveUp;
        }
        self.attempts += 1;
        self.state = SupervisorState::Reconnecting;
        Directive::RetryAfter(self.policy.delay_for(self.attempts))
    }
}

/// Sleep provider, injectable so tests drive retries without waiting.
#[async_trait]
pub trait Timer: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioTimer;

#[async_trait]
impl Timer for TokioTimer {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Commands a terminal frontend feeds into its supervised tab.
#[derive(Debug)]
pub enum TabCommand {
    Input(Bytes),
    Paste(String),
    Resize(Geometry),
    Close,
}

/// Lifecycle notifications for a frontend status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabEvent {
    Connected,
    Reconnecting {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },
    Exhausted,
}

/// Terminal state of a supervised tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabOutcome {
    Clean(CloseReason),
    NeverConnected,
    Exhausted,
}

/// Runs sessions against a backend and reconnects through failures.
///
/// A failure before the first successful open is reported as
/// [`TabOutcome::NeverConnected`] without consuming the retry budget;
/// reconnection is for links that worked and then broke.
pub struct Supervisor {
    target: TargetRef,
    user: String,
    geometry: Geometry,
    backend: Arc<dyn RemoteExec>,
    session_config: SessionConfig,
    timer: Arc<dyn Timer>,
    machine: Machine,
}

impl Supervisor {
    pub fn new(
        target: TargetRef,
        user: impl Into<String>,
        geometry: Geometry,
        backend: Arc<dyn RemoteExec>,
        session_config: SessionConfig,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            target,
            user: user.into(),
            geometry,
            backend,
            session_config,
            timer: Arc::new(TokioTimer),
            machine: Machine::new(backoff),
        }
    }

    pub fn with_timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = timer;
        self
    }

    /// Drives sessions until the tab ends. Remote output for every
    /// session, first or reconnected, lands on the same `output` channel.
    pub async fn run(
        mut self,
        mut commands: UnboundedReceiver<TabCommand>,
        output: UnboundedSender<Bytes>,
        events: UnboundedSender<TabEvent>,
    ) -> TabOutcome {
        let mut last_reason = None;
        loop {
            let session = Session::new(
                self.target.clone(),
                self.user.clone(),
                self.geometry,
                self.session_config,
            );
            let directive = match session.open(self.backend.as_ref(), output.clone()).await {
                Ok(()) => {
                    self.machine.on_open();
                    let _ = events.send(TabEvent::Connected);
                    let reason = self.serve(&session, &mut commands).await;
                    if !reason.is_clean() {
                        warn!("session to {} lost: {}", self.target, reason);
                    }
                    last_reason = Some(reason);
                    self.machine.on_close(reason)
                }
                Err(err) if self.machine.state() == SupervisorState::Idle => {
                    warn!("could not open {}: {}", self.target, err);
                    return TabOutcome::NeverConnected;
                }
                Err(err) => {
                    warn!("reconnect to {} failed: {}", self.target, err);
                    self.machine.on_attempt_failed(err.is_fatal())
                }
            };
            match directive {
                Directive::Settle => {
                    let reason = last_reason.unwrap_or(CloseReason::UserRequested);
                    info!("session to {} over: {}", self.target, reason);
                    return TabOutcome::Clean(reason);
                }
                Directive::RetryAfter(delay) => {
                    let attempt = self.machine.attempts();
                    let max_attempts = self.machine.policy().max_attempts;
                    info!(
                        "retrying {} in {:?} (attempt {}/{})",
                        self.target, delay, attempt, max_attempts
                    );
                    let _ = events.send(TabEvent::Reconnecting {
                        attempt,
                        max_attempts,
                        delay,
                    });
                    if !self.pause_for_retry(delay, &mut commands).await {
                        return TabOutcome::Clean(CloseReason::UserRequested);
                    }
                }
                Directive::GiveUp => {
                    warn!("giving up on {}", self.target);
                    let _ = events.send(TabEvent::Exhausted);
                    return TabOutcome::Exhausted;
                }
            }
        }
    }

    /// Relays commands into the open session until it closes.
    async fn serve(
        &mut self,
        session: &Session,
        commands: &mut UnboundedReceiver<TabCommand>,
    ) -> CloseReason {
        let wait = session.wait_closed();
        tokio::pin!(wait);
        loop {
            tokio::select! {
                reason = &mut wait => return reason,
                command = commands.recv() => match command {
                    Some(TabCommand::Input(data)) => session.send(data),
                    Some(TabCommand::Paste(text)) => session.send_text(&text).await,
                    Some(TabCommand::Resize(geometry)) => {
                        self.geometry = geometry;
                        session.resize(geometry.cols, geometry.rows);
                    }
                    Some(TabCommand::Close) | None => {
                        session.close(CloseReason::UserRequested);
                        return wait.await;
                    }
                },
            }
        }
    }

    /// Waits out one backoff delay. Returns false when the user closes
    /// the tab instead of waiting. Keystrokes have no live session to go
    /// to and are dropped; resizes are kept for the next session.
    async fn pause_for_retry(
        &mut self,
        delay: Duration,
        commands: &mut UnboundedReceiver<TabCommand>,
    ) -> bool {
        let timer = self.timer.clone();
        let sleep = timer.sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = commands.recv() => match command {
                    Some(TabCommand::Resize(geometry)) => self.geometry = geometry,
                    Some(TabCommand::Close) | None => return false,
                    Some(_) => debug!("no session for {}, dropping input", self.target),
                },
            }
        }
    }
}
