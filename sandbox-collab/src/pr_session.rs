//! PR-bound session state consumed by review clients.

use std::collections::HashMap;
use std::sync::Mutex;

use sandbox_core::util::{next_id, now_ts};
use serde::Serialize;

use crate::error::{CollabError, Result};

#[derive(Clone, Debug, Serialize)]
pub struct PrComment {
    pub id: String,
    pub author: String,
    pub body: String,
    pub created_at: u64,
    /// True when the comment was produced by the agent as a response.
    pub is_response: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct PrSession {
    pub pr_number: u64,
    pub repository: String,
    pub session_id: String,
    pub created_at: u64,
    pub comments: Vec<PrComment>,
}

#[derive(Default)]
pub struct PrSessionManager {
    sessions: Mutex<HashMap<u64, PrSession>>,
}

impl PrSessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a session to a PR. Conflicts when the PR already has one.
    pub fn create(&self, pr_number: u64, repository: &str, session_id: &str) -> Result<PrSession> {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(&pr_number) {
            return Err(CollabError::Conflict(format!(
                "PR #{pr_number} already has a session"
            )));
        }
        let session = PrSession {
            pr_number,
            repository: repository.to_string(),
            session_id: session_id.to_string(),
            created_at: now_ts(),
            comments: Vec::new(),
        };
        sessions.insert(pr_number, session.clone());
        Ok(session)
    }

    pub fn get(&self, pr_number: u64) -> Option<PrSession> {
        self.sessions.lock().unwrap().get(&pr_number).cloned()
    }

    pub fn all(&self) -> Vec<PrSession> {
        let mut sessions: Vec<PrSession> =
            self.sessions.lock().unwrap().values().cloned().collect();
        sessions.sort_by(|a, b| a.pr_number.cmp(&b.pr_number));
        sessions
    }

    pub fn add_comment(&self, pr_number: u64, author: &str, body: &str) -> Result<PrComment> {
        self.push_comment(pr_number, author, body, false)
    }

    pub fn comments(&self, pr_number: u64) -> Result<Vec<PrComment>> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(&pr_number)
            .map(|s| s.comments.clone())
            .ok_or_else(|| CollabError::NotFound(format!("No session for PR #{pr_number}")))
    }

    /// Append an agent response comment.
    pub fn respond(&self, pr_number: u64, body: &str) -> Result<PrComment> {
        self.push_comment(pr_number, "agent", body, true)
    }

    fn push_comment(
        &self,
        pr_number: u64,
        author: &str,
        body: &str,
        is_response: bool,
    ) -> Result<PrComment> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(&pr_number)
            .ok_or_else(|| CollabError::NotFound(format!("No session for PR #{pr_number}")))?;
        let comment = PrComment {
            id: next_id("comment"),
            author: author.to_string(),
            body: body.to_string(),
            created_at: now_ts(),
            is_response,
        };
        session.comments.push(comment.clone());
        Ok(comment)
    }
}
