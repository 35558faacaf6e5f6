use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use chad_paths::ChadPaths;
use chad_protocol::{ArtifactRef, Event, EventPayload, SessionId};

use super::EventLogError;

/// Payloads below this size stay inline in the event (10 KiB).
pub const ARTIFACT_SIZE_THRESHOLD: usize = 10 * 1024;

/// Hard ceiling for stored artifacts (10 MiB); content beyond is truncated.
pub const MAX_ARTIFACT_SIZE: usize = 10 * 1024 * 1024;

const TRUNCATION_MARKER: &[u8] = b"\n[TRUNCATED - exceeded 10MB limit]";

/// Append-only, sequence-numbered event log for one session.
///
/// The single orchestrator process owns the file for its lifetime; there is
/// no cross-process locking. Re-opening recovers the previous maximum `seq`
/// from the final line so an interrupted session continues numbering.
pub struct EventLog {
    session_id: SessionId,
    base_dir: PathBuf,
    artifacts_dir: PathBuf,
    log_path: PathBuf,
    seq: u64,
    current_turn_id: Option<String>,
}

impl EventLog {
    /// Open (or create) the event log for a session.
    ///
    /// `base_dir` overrides the log root; otherwise `$CHAD_LOG_DIR` or
    /// `~/.chad/logs` applies. A corrupt trailing line is tolerated; the
    /// scan keeps the last line that parses.
    pub fn open(session_id: SessionId, base_dir: Option<PathBuf>) -> Result<Self, EventLogError> {
        let base_dir = match base_dir {
            Some(dir) => dir,
            None => ChadPaths::resolve()
                .map_err(|e| EventLogError::SerializeFailed {
                    message: e.to_string(),
                })?
                .log_dir(),
        };

        fs::create_dir_all(&base_dir)?;
        let artifacts_dir = base_dir.join("artifacts").join(session_id.as_ref());
        fs::create_dir_all(&artifacts_dir)?;

        let log_path = base_dir.join(format!("{session_id}.jsonl"));
        let seq = recover_seq(&log_path);

        if seq > 0 {
            info!(
                event = "core.eventlog.reopened",
                session_id = %session_id,
                last_seq = seq,
            );
        }

        Ok(Self {
            session_id,
            base_dir,
            artifacts_dir,
            log_path,
            seq,
            current_turn_id: None,
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Latest assigned sequence number (0 when empty).
    pub fn latest_seq(&self) -> u64 {
        self.seq
    }

    /// Start a new conversation turn; subsequent events without an explicit
    /// turn id inherit the returned one.
    pub fn start_turn(&mut self) -> String {
        let turn_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        self.current_turn_id = Some(turn_id.clone());
        turn_id
    }

    /// Append an event payload, assigning the next `seq`, the session id,
    /// the timestamp, and (if unset) the current turn id.
    ///
    /// The file is opened in append mode per call: a write failure is fatal
    /// to the task but at most truncates the tail, which the next open
    /// tolerates.
    pub fn append(&mut self, payload: EventPayload) -> Result<Event, EventLogError> {
        self.seq += 1;
        let event = Event {
            seq: self.seq,
            ts: chrono::Utc::now().to_rfc3339(),
            session_id: self.session_id.clone(),
            turn_id: self.current_turn_id.clone(),
            payload,
        };

        let line = serde_json::to_string(&event).map_err(|e| EventLogError::SerializeFailed {
            message: e.to_string(),
        })?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;

        Ok(event)
    }

    /// Store content as a sidecar artifact if it meets the inline threshold.
    ///
    /// Returns `None` below 10 KiB so the caller inlines the bytes. Content
    /// beyond 10 MiB is truncated with a textual marker. The sha256 of the
    /// stored content doubles as the filename tail and the integrity field.
    pub fn store_artifact(
        &self,
        content: &[u8],
        name: &str,
    ) -> Result<Option<ArtifactRef>, EventLogError> {
        let mut owned;
        let content = if content.len() > MAX_ARTIFACT_SIZE {
            owned = content[..MAX_ARTIFACT_SIZE].to_vec();
            owned.extend_from_slice(TRUNCATION_MARKER);
            &owned[..]
        } else {
            content
        };

        if content.len() < ARTIFACT_SIZE_THRESHOLD {
            return Ok(None);
        }

        let sha256 = hex::encode(Sha256::digest(content));
        let filename = format!("{name}_{}.txt", &sha256[..8]);
        let artifact_path = self.artifacts_dir.join(&filename);
        fs::write(&artifact_path, content)?;

        let rel_path = artifact_path
            .strip_prefix(&self.base_dir)
            .unwrap_or(&artifact_path)
            .to_string_lossy()
            .into_owned();

        debug!(
            event = "core.eventlog.artifact_stored",
            session_id = %self.session_id,
            path = %rel_path,
            size = content.len(),
        );

        Ok(Some(ArtifactRef {
            path: rel_path,
            sha256,
            size: content.len() as u64,
        }))
    }

    /// Read an artifact's content by reference.
    pub fn read_artifact(&self, artifact: &ArtifactRef) -> Option<Vec<u8>> {
        fs::read(self.base_dir.join(&artifact.path)).ok()
    }

    /// Read events strictly after `since_seq`, optionally filtered by type
    /// name. Malformed lines are skipped.
    pub fn read_events(
        &self,
        since_seq: u64,
        event_types: Option<&[String]>,
    ) -> Result<Vec<Event>, EventLogError> {
        if !self.log_path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.log_path)?;
        let mut events = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(event) = serde_json::from_str::<Event>(line) else {
                continue;
            };
            if event.seq <= since_seq {
                continue;
            }
            if let Some(types) = event_types {
                if !types.iter().any(|t| t == event.payload.type_name()) {
                    continue;
                }
            }
            events.push(event);
        }
        Ok(events)
    }

    /// List session ids that have a log file under `base_dir`.
    pub fn list_sessions(base_dir: &Path) -> Vec<String> {
        let Ok(entries) = fs::read_dir(base_dir) else {
            return Vec::new();
        };
        let mut sessions: Vec<String> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                    path.file_stem().map(|s| s.to_string_lossy().into_owned())
                } else {
                    None
                }
            })
            .collect();
        sessions.sort();
        sessions
    }
}

/// Recover the highest `seq` from the final parseable line of a log file.
fn recover_seq(log_path: &Path) -> u64 {
    let Ok(content) = fs::read_to_string(log_path) else {
        return 0;
    };

    let mut seq = 0;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(value) => {
                if let Some(s) = value.get("seq").and_then(|s| s.as_u64()) {
                    seq = s;
                }
            }
            Err(_) => {
                // Corrupt line (likely a torn tail write); keep what we have
                warn!(event = "core.eventlog.corrupt_line_skipped", path = %log_path.display());
            }
        }
    }
    seq
}
