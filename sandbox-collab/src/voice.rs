//! Voice session state holders consumed by voice clients.

use std::collections::HashMap;
use std::sync::Mutex;

use sandbox_core::util::now_ts;
use serde::Serialize;

use crate::error::{CollabError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceState {
    Active,
    Stopped,
}

#[derive(Clone, Debug, Serialize)]
pub struct VoiceSession {
    pub session_id: String,
    pub state: VoiceState,
    pub started_at: u64,
    pub stopped_at: Option<u64>,
    pub chunks_received: u64,
    pub bytes_received: u64,
}

#[derive(Default)]
pub struct VoiceManager {
    sessions: Mutex<HashMap<String, VoiceSession>>,
}

impl VoiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a voice session. Conflicts when one is already active.
    pub fn start(&self, session_id: &str) -> Result<VoiceSession> {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(existing) = sessions.get(session_id) {
            if existing.state == VoiceState::Active {
                return Err(CollabError::Conflict(format!(
                    "Voice already active for session '{session_id}'"
                )));
            }
        }
        let session = VoiceSession {
            session_id: session_id.to_string(),
            state: VoiceState::Active,
            started_at: now_ts(),
            stopped_at: None,
            chunks_received: 0,
            bytes_received: 0,
        };
        sessions.insert(session_id.to_string(), session.clone());
        Ok(session)
    }

    pub fn stop(&self, session_id: &str) -> Result<VoiceSession> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| CollabError::NotFound(format!("No voice session '{session_id}'")))?;
        if session.state != VoiceState::Active {
            return Err(CollabError::Validation(format!(
                "Voice session '{session_id}' is not active"
            )));
        }
        session.state = VoiceState::Stopped;
        session.stopped_at = Some(now_ts());
        Ok(session.clone())
    }

    pub fn status(&self, session_id: &str) -> Option<VoiceSession> {
        self.sessions.lock().unwrap().get(session_id).cloned()
    }

    /// Record an audio submission while the session is active.
    pub fn submit_audio(&self, session_id: &str, bytes: usize) -> Result<VoiceSession> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| CollabError::NotFound(format!("No voice session '{session_id}'")))?;
        if session.state != VoiceState::Active {
            return Err(CollabError::Validation(format!(
                "Voice session '{session_id}' is not accepting audio"
            )));
        }
        session.chunks_received += 1;
        session.bytes_received += bytes as u64;
        Ok(session.clone())
    }
}
