//! Collaboration surface for the sandbox orchestration core: multiplayer
//! sessions with a priority prompt queue, skill templates, voice sessions,
//! PR-bound sessions, and the HTTP/JSON API serving them.

pub mod api;
pub mod error;
pub mod multiplayer;
pub mod pr_session;
pub mod skills;
pub mod voice;

pub use api::{CollabState, collab_router};
pub use error::{CollabError, Result};
pub use multiplayer::{
    ClientConn, CreateSessionInput, Cursor, MultiplayerConfig, MultiplayerManager,
    MultiplayerSession, OpResult, Prompt, PromptPriority, PromptStatus, QueueStatus, SessionState,
    User,
};
pub use pr_session::{PrComment, PrSession, PrSessionManager};
pub use skills::{Skill, SkillInput, SkillStore};
pub use voice::{VoiceManager, VoiceSession, VoiceState};
