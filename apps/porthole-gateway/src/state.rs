use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use porthole_core::cache::ExistenceCache;
use porthole_core::exec::{AuditSink, RemoteExec, TargetRef};
use porthole_core::session::{Session, SessionState};
use porthole_core::upload::UploadInjector;

use crate::config::Config;

/// Live sessions keyed by id, shared between the terminal handlers and
/// the upload path.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<Uuid, Session>>,
}

impl SessionRegistry {
    pub fn insert(&self, session: Session) {
        self.sessions.insert(session.id(), session);
    }

    pub fn remove(&self, id: &Uuid) {
        self.sessions.remove(id);
    }

    /// Any open session attached to `target`. Used after an upload to
    /// nudge the shell prompt.
    pub fn find_open(&self, target: &TargetRef) -> Option<Session> {
        self.sessions
            .iter()
            .find(|entry| entry.target() == target && entry.state() == SessionState::Open)
            .map(|entry| entry.value().clone())
    }

    pub fn active(&self) -> usize {
        self.sessions.len()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub backend: Arc<dyn RemoteExec>,
    pub cache: Arc<ExistenceCache>,
    pub audit: Arc<dyn AuditSink>,
    pub uploads: Arc<UploadInjector>,
    pub sessions: SessionRegistry,
}
