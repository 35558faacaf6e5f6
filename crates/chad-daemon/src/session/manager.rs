use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use chad_git::GitWorktreeManager;
use chad_protocol::SessionId;

use super::state::{SessionHandle, SessionInfo};
use crate::errors::DaemonError;
use crate::pty::PtyStreamService;

/// In-memory registry of live sessions.
///
/// Holds the strong references to every session and, transitively, its
/// event log, worktree, and active streams; deletion here is the
/// definitive teardown point. Critical sections are short: the map lock is
/// never held across git or PTY work.
pub struct SessionManager {
    sessions: Mutex<HashMap<SessionId, Arc<SessionHandle>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Create a new session.
    pub fn create_session(&self, name: Option<String>, project_path: PathBuf) -> Arc<SessionHandle> {
        let id = SessionId::new(uuid::Uuid::new_v4().to_string());
        let name = name.unwrap_or_else(|| format!("session-{}", &id.as_ref()[..8]));
        let handle = Arc::new(SessionHandle::new(id.clone(), name, project_path));

        self.sessions
            .lock()
            .expect("session registry poisoned")
            .insert(id.clone(), handle.clone());

        info!(event = "daemon.session.create_completed", session_id = %id);
        handle
    }

    pub fn get(&self, session_id: &SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions
            .lock()
            .expect("session registry poisoned")
            .get(session_id)
            .cloned()
    }

    pub fn get_or_err(&self, session_id: &SessionId) -> Result<Arc<SessionHandle>, DaemonError> {
        self.get(session_id)
            .ok_or_else(|| DaemonError::SessionNotFound(session_id.to_string()))
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .lock()
            .expect("session registry poisoned")
            .values()
            .map(|s| s.to_info())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    /// Request cancellation of the session's running task and terminate
    /// its active PTY. Idempotent.
    pub fn cancel(
        &self,
        session_id: &SessionId,
        pty_service: &PtyStreamService,
    ) -> Result<bool, DaemonError> {
        let session = self.get_or_err(session_id)?;

        let active = session.with_state(|s| s.active);
        if !active {
            return Ok(false);
        }

        session.set_cancel_requested(true);
        if let Some(stream) = pty_service.get_by_session(session_id.as_ref()) {
            if let Err(e) = pty_service.terminate(&stream.stream_id().clone()) {
                warn!(
                    event = "daemon.session.cancel_terminate_failed",
                    session_id = %session_id,
                    error = %e,
                );
            }
        }

        info!(event = "daemon.session.cancel_requested", session_id = %session_id);
        Ok(true)
    }

    /// Destroy a session: terminate streams, tear down the worktree, and
    /// drop the registry entry.
    pub fn delete_session(
        &self,
        session_id: &SessionId,
        pty_service: &PtyStreamService,
    ) -> Result<(), DaemonError> {
        let session = self.get_or_err(session_id)?;

        info!(event = "daemon.session.destroy_started", session_id = %session_id);

        session.set_cancel_requested(true);
        pty_service.cleanup_session(session_id.as_ref());

        let (project_path, has_worktree) =
            session.with_state(|s| (s.project_path.clone(), s.worktree.is_some()));
        if has_worktree {
            let git = GitWorktreeManager::new(project_path);
            if let Err(e) = git.delete_worktree(session_id.as_ref()) {
                warn!(
                    event = "daemon.session.destroy_worktree_failed",
                    session_id = %session_id,
                    error = %e,
                );
            }
        }

        self.sessions
            .lock()
            .expect("session registry poisoned")
            .remove(session_id);

        info!(event = "daemon.session.destroy_completed", session_id = %session_id);
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().expect("session registry poisoned").len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_get() {
        let manager = SessionManager::new();
        let session = manager.create_session(Some("work".to_string()), PathBuf::from("/tmp"));
        assert_eq!(manager.count(), 1);

        let fetched = manager.get(&session.id).unwrap();
        assert_eq!(fetched.to_info().name, "work");
    }

    #[test]
    fn test_default_name_derived_from_id() {
        let manager = SessionManager::new();
        let session = manager.create_session(None, PathBuf::from("/tmp"));
        let info = session.to_info();
        assert!(info.name.starts_with("session-"));
    }

    #[test]
    fn test_get_unknown_session_errors() {
        let manager = SessionManager::new();
        let missing = SessionId::new("missing");
        assert!(matches!(
            manager.get_or_err(&missing),
            Err(DaemonError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_cancel_inactive_session_is_noop() {
        let manager = SessionManager::new();
        let (pty, _rx) = PtyStreamService::new();
        let session = manager.create_session(None, PathBuf::from("/tmp"));

        let cancelled = manager.cancel(&session.id, &pty).unwrap();
        assert!(!cancelled);
        assert!(!session.cancel_requested());
    }

    #[test]
    fn test_cancel_active_session_sets_flag() {
        let manager = SessionManager::new();
        let (pty, _rx) = PtyStreamService::new();
        let session = manager.create_session(None, PathBuf::from("/tmp"));
        session.with_state_mut(|s| s.active = true);

        let cancelled = manager.cancel(&session.id, &pty).unwrap();
        assert!(cancelled);
        assert!(session.cancel_requested());

        // Cancelling again is harmless
        let cancelled = manager.cancel(&session.id, &pty).unwrap();
        assert!(cancelled);
    }

    #[test]
    fn test_delete_removes_from_registry() {
        let manager = SessionManager::new();
        let (pty, _rx) = PtyStreamService::new();
        let session = manager.create_session(None, PathBuf::from("/tmp"));

        manager.delete_session(&session.id, &pty).unwrap();
        assert_eq!(manager.count(), 0);
        assert!(manager.get(&session.id).is_none());
    }

    #[test]
    fn test_list_sorted_by_creation() {
        let manager = SessionManager::new();
        let a = manager.create_session(Some("a".to_string()), PathBuf::from("/tmp"));
        std::thread::sleep(std::time::Duration::from_millis(5));
        let _b = manager.create_session(Some("b".to_string()), PathBuf::from("/tmp"));

        let list = manager.list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, a.id);
    }
}
