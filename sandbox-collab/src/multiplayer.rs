//! Shared-session state: user roster, exclusive edit lock, client
//! connections, and the priority prompt queue.
//!
//! All operations return success/failure explicitly — lock and queue
//! operations yield [`OpResult`] rather than errors, since contention is
//! normal control flow for collaborating users.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use sandbox_core::SyncStatus;
use sandbox_core::util::{next_id, now_ms, now_ts};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{CollabError, Result};

#[derive(Clone, Debug)]
pub struct MultiplayerConfig {
    pub max_users: usize,
    pub max_queue: usize,
}

impl Default for MultiplayerConfig {
    fn default() -> Self {
        Self {
            max_users: 8,
            max_queue: 32,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cursor {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub color: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    pub joined_at: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct ClientConn {
    pub id: String,
    pub user_id: String,
    pub last_seen: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptPriority {
    #[default]
    Normal,
    High,
    Urgent,
}

impl PromptPriority {
    fn rank(self) -> u8 {
        match self {
            PromptPriority::Normal => 0,
            PromptPriority::High => 1,
            PromptPriority::Urgent => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptStatus {
    Queued,
    Executing,
    Completed,
    Cancelled,
}

#[derive(Clone, Debug, Serialize)]
pub struct Prompt {
    pub id: String,
    pub user_id: String,
    pub content: String,
    pub priority: PromptPriority,
    pub enqueued_at: u64,
    pub status: PromptStatus,
    #[serde(skip)]
    seq: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edit_lock: Option<String>,
    pub git_sync_status: SyncStatus,
    pub agent_status: String,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            edit_lock: None,
            git_sync_status: SyncStatus::Pending,
            agent_status: "idle".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct MultiplayerSession {
    pub id: String,
    pub name: String,
    pub created_at: u64,
    pub users: HashMap<String, User>,
    pub clients: HashMap<String, ClientConn>,
    pub state: SessionState,
    /// All prompts ever queued in this session, by id.
    pub prompts: HashMap<String, Prompt>,
    /// Queued prompt ids in pop order.
    pub queue: Vec<String>,
    /// Id of the prompt currently executing, if any.
    pub executing: Option<String>,
}

/// Explicit success/failure for lock and queue operations.
#[derive(Clone, Debug, Serialize)]
pub struct OpResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl OpResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            reason: None,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct QueueStatus {
    pub length: usize,
    pub has_executing: bool,
    pub is_full: bool,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CreateSessionInput {
    #[serde(default)]
    pub name: String,
}

pub struct MultiplayerManager {
    config: MultiplayerConfig,
    sessions: Mutex<HashMap<String, MultiplayerSession>>,
    seq: AtomicU64,
}

impl MultiplayerManager {
    pub fn new(config: MultiplayerConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    pub fn create(&self, input: CreateSessionInput) -> MultiplayerSession {
        let session = MultiplayerSession {
            id: next_id("mp"),
            name: input.name,
            created_at: now_ts(),
            users: HashMap::new(),
            clients: HashMap::new(),
            state: SessionState::default(),
            prompts: HashMap::new(),
            queue: Vec::new(),
            executing: None,
        };
        self.sessions
            .lock()
            .unwrap()
            .insert(session.id.clone(), session.clone());
        info!("multiplayer: created session {}", session.id);
        session
    }

    pub fn get(&self, session_id: &str) -> Option<MultiplayerSession> {
        self.sessions.lock().unwrap().get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &str) -> bool {
        let removed = self.sessions.lock().unwrap().remove(session_id).is_some();
        if removed {
            info!("multiplayer: removed session {session_id}");
        }
        removed
    }

    pub fn all(&self) -> Vec<MultiplayerSession> {
        let mut sessions: Vec<MultiplayerSession> =
            self.sessions.lock().unwrap().values().cloned().collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }

    fn with_session<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut MultiplayerSession) -> T,
    ) -> Result<T> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| CollabError::NotFound(format!("Session '{session_id}' not found")))?;
        Ok(f(session))
    }

    // ── Roster ──────────────────────────────────────────────────────────

    pub fn join(&self, session_id: &str, name: &str, color: &str) -> Result<User> {
        let max_users = self.config.max_users;
        self.with_session(session_id, |session| {
            if session.users.len() >= max_users {
                return Err(CollabError::Validation("Session is full".into()));
            }
            let user = User {
                id: next_id("user"),
                name: name.to_string(),
                color: color.to_string(),
                cursor: None,
                joined_at: now_ts(),
            };
            session.users.insert(user.id.clone(), user.clone());
            Ok(user)
        })?
    }

    /// Remove a user: releases a held edit lock and disconnects all the
    /// user's clients.
    pub fn leave(&self, session_id: &str, user_id: &str) -> bool {
        self.with_session(session_id, |session| {
            if session.users.remove(user_id).is_none() {
                return false;
            }
            if session.state.edit_lock.as_deref() == Some(user_id) {
                session.state.edit_lock = None;
            }
            session.clients.retain(|_, c| c.user_id != user_id);
            true
        })
        .unwrap_or(false)
    }

    pub fn update_cursor(&self, session_id: &str, user_id: &str, cursor: Cursor) -> bool {
        self.with_session(session_id, |session| {
            match session.users.get_mut(user_id) {
                Some(user) => {
                    user.cursor = Some(cursor);
                    true
                }
                None => false,
            }
        })
        .unwrap_or(false)
    }

    pub fn get_users(&self, session_id: &str) -> Result<Vec<User>> {
        self.with_session(session_id, |session| {
            let mut users: Vec<User> = session.users.values().cloned().collect();
            users.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
            users
        })
    }

    // ── Edit lock ───────────────────────────────────────────────────────

    pub fn acquire_lock(&self, session_id: &str, user_id: &str) -> Result<OpResult> {
        self.with_session(session_id, |session| {
            if !session.users.contains_key(user_id) {
                return OpResult::fail(format!("Unknown user '{user_id}'"));
            }
            match &session.state.edit_lock {
                None => {
                    session.state.edit_lock = Some(user_id.to_string());
                    OpResult::ok()
                }
                Some(holder) if holder == user_id => OpResult::ok(),
                Some(holder) => {
                    let holder_name = session
                        .users
                        .get(holder)
                        .map(|u| u.name.clone())
                        .unwrap_or_else(|| holder.clone());
                    OpResult::fail(format!("Lock held by {holder_name}"))
                }
            }
        })
    }

    pub fn release_lock(&self, session_id: &str, user_id: &str) -> Result<OpResult> {
        self.with_session(session_id, |session| {
            if session.state.edit_lock.as_deref() == Some(user_id) {
                session.state.edit_lock = None;
                OpResult::ok()
            } else {
                OpResult::fail("Lock not held by this user")
            }
        })
    }

    // ── Clients ─────────────────────────────────────────────────────────

    pub fn connect(&self, session_id: &str, user_id: &str) -> Result<ClientConn> {
        self.with_session(session_id, |session| {
            if !session.users.contains_key(user_id) {
                return Err(CollabError::Validation(format!(
                    "Unknown user '{user_id}'"
                )));
            }
            let client = ClientConn {
                id: next_id("client"),
                user_id: user_id.to_string(),
                last_seen: now_ts(),
            };
            session.clients.insert(client.id.clone(), client.clone());
            Ok(client)
        })?
    }

    pub fn disconnect(&self, session_id: &str, client_id: &str) -> bool {
        self.with_session(session_id, |session| {
            session.clients.remove(client_id).is_some()
        })
        .unwrap_or(false)
    }

    pub fn get_clients(&self, session_id: &str) -> Result<Vec<ClientConn>> {
        self.with_session(session_id, |session| {
            session.clients.values().cloned().collect()
        })
    }

    pub fn update_state(
        &self,
        session_id: &str,
        git_sync_status: Option<SyncStatus>,
        agent_status: Option<String>,
    ) -> bool {
        self.with_session(session_id, |session| {
            if let Some(status) = git_sync_status {
                session.state.git_sync_status = status;
            }
            if let Some(status) = agent_status {
                session.state.agent_status = status;
            }
            true
        })
        .unwrap_or(false)
    }

    // ── Prompt queue ────────────────────────────────────────────────────

    /// Queue a prompt. Priority tiers jump ahead of lower tiers; within a
    /// tier, ordering is FIFO.
    pub fn add_prompt(
        &self,
        session_id: &str,
        user_id: &str,
        content: &str,
        priority: PromptPriority,
    ) -> Result<Prompt> {
        let max_queue = self.config.max_queue;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.with_session(session_id, |session| {
            if !session.users.contains_key(user_id) {
                return Err(CollabError::Validation(format!(
                    "Unknown user '{user_id}'"
                )));
            }
            if session.queue.len() >= max_queue {
                return Err(CollabError::Validation("Prompt queue is full".into()));
            }

            let prompt = Prompt {
                id: next_id("prompt"),
                user_id: user_id.to_string(),
                content: content.to_string(),
                priority,
                enqueued_at: now_ms(),
                status: PromptStatus::Queued,
                seq,
            };

            // Insert after the last queued prompt of equal-or-higher priority.
            let position = session
                .queue
                .iter()
                .position(|id| {
                    session
                        .prompts
                        .get(id)
                        .map(|p| p.priority.rank() < priority.rank())
                        .unwrap_or(false)
                })
                .unwrap_or(session.queue.len());
            session.queue.insert(position, prompt.id.clone());
            session.prompts.insert(prompt.id.clone(), prompt.clone());
            Ok(prompt)
        })?
    }

    /// Queue contents: the executing prompt first (if any), then queued
    /// prompts in pop order.
    pub fn get_prompts(&self, session_id: &str) -> Result<Vec<Prompt>> {
        self.with_session(session_id, |session| {
            let mut prompts = Vec::new();
            if let Some(executing) = session
                .executing
                .as_ref()
                .and_then(|id| session.prompts.get(id))
            {
                prompts.push(executing.clone());
            }
            for id in &session.queue {
                if let Some(prompt) = session.prompts.get(id) {
                    prompts.push(prompt.clone());
                }
            }
            prompts
        })
    }

    pub fn get_prompt(&self, prompt_id: &str) -> Option<Prompt> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .values()
            .find_map(|session| session.prompts.get(prompt_id).cloned())
    }

    /// Only the owner can cancel, and never the executing prompt.
    pub fn cancel_prompt(&self, prompt_id: &str, user_id: &str) -> OpResult {
        let mut sessions = self.sessions.lock().unwrap();
        for session in sessions.values_mut() {
            let Some(prompt) = session.prompts.get_mut(prompt_id) else {
                continue;
            };
            if prompt.user_id != user_id {
                return OpResult::fail("Only the prompt owner can cancel it");
            }
            return match prompt.status {
                PromptStatus::Executing => {
                    OpResult::fail("Cannot cancel an executing prompt")
                }
                PromptStatus::Completed | PromptStatus::Cancelled => {
                    OpResult::fail("Prompt is no longer queued")
                }
                PromptStatus::Queued => {
                    prompt.status = PromptStatus::Cancelled;
                    session.queue.retain(|id| id != prompt_id);
                    OpResult::ok()
                }
            };
        }
        OpResult::fail(format!("Prompt '{prompt_id}' not found"))
    }

    /// Move a queued prompt to `new_index` within the queue. Owner-only.
    pub fn reorder_prompt(&self, prompt_id: &str, user_id: &str, new_index: usize) -> OpResult {
        let mut sessions = self.sessions.lock().unwrap();
        for session in sessions.values_mut() {
            let Some(prompt) = session.prompts.get(prompt_id) else {
                continue;
            };
            if prompt.user_id != user_id {
                return OpResult::fail("Only the prompt owner can reorder it");
            }
            if prompt.status != PromptStatus::Queued {
                return OpResult::fail("Only queued prompts can be reordered");
            }
            let Some(current) = session.queue.iter().position(|id| id == prompt_id) else {
                return OpResult::fail("Prompt is not in the queue");
            };
            let id = session.queue.remove(current);
            let clamped = new_index.min(session.queue.len());
            session.queue.insert(clamped, id);
            return OpResult::ok();
        }
        OpResult::fail(format!("Prompt '{prompt_id}' not found"))
    }

    /// Pop the highest-priority head and mark it executing. Returns `None`
    /// when a prompt is already executing or the queue is empty.
    pub fn start_next_prompt(&self, session_id: &str) -> Result<Option<Prompt>> {
        self.with_session(session_id, |session| {
            if session.executing.is_some() {
                return None;
            }
            let id = loop {
                match session.queue.first().cloned() {
                    Some(id) => {
                        session.queue.remove(0);
                        match session.prompts.get(&id).map(|p| p.status) {
                            Some(PromptStatus::Queued) => break id,
                            _ => continue,
                        }
                    }
                    None => return None,
                }
            };
            let prompt = session.prompts.get_mut(&id)?;
            prompt.status = PromptStatus::Executing;
            session.executing = Some(id);
            Some(prompt.clone())
        })
    }

    /// Mark the executing prompt completed. No-op when nothing is executing.
    pub fn complete_prompt(&self, session_id: &str) -> Result<Option<Prompt>> {
        self.with_session(session_id, |session| {
            let id = session.executing.take()?;
            let prompt = session.prompts.get_mut(&id)?;
            prompt.status = PromptStatus::Completed;
            Some(prompt.clone())
        })
    }

    pub fn get_executing(&self, session_id: &str) -> Result<Option<Prompt>> {
        self.with_session(session_id, |session| {
            session
                .executing
                .as_ref()
                .and_then(|id| session.prompts.get(id).cloned())
        })
    }

    pub fn get_queue_status(&self, session_id: &str) -> Result<QueueStatus> {
        let max_queue = self.config.max_queue;
        self.with_session(session_id, |session| QueueStatus {
            length: session.queue.len(),
            has_executing: session.executing.is_some(),
            is_full: session.queue.len() >= max_queue,
        })
    }
}

impl Default for MultiplayerManager {
    fn default() -> Self {
        Self::new(MultiplayerConfig::default())
    }
}
