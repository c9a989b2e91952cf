use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;
use crate::types::Session;

/// Persists a session so an orchestration run can stop and resume at the
/// exact same spot. The on-disk format is opaque to the core —
/// this trait is the only contract a caller needs to satisfy.
#[async_trait]
pub trait SessionManager: Send + Sync {
    /// Save a checkpoint of the current session state.
    async fn checkpoint(&self, snapshot: &SessionSnapshot) -> Result<(), OrchestratorError>;

    /// Load the most recent checkpoint for a session id.
    async fn load(&self, session_id: &str) -> Result<Option<SessionSnapshot>, OrchestratorError>;
}

/// Everything needed to resume an orchestration run. The objective (the
/// first message of `session.messages`) must be byte-identical to what was
/// originally checkpointed across every subsequent save — callers must never
/// construct a snapshot whose session has had its first message altered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session: Session,
    pub iteration: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// No persistence. Fire-and-forget — the default for one-shot invocations.
pub struct NoSessionManager;

#[async_trait]
impl SessionManager for NoSessionManager {
    async fn checkpoint(&self, _snapshot: &SessionSnapshot) -> Result<(), OrchestratorError> {
        Ok(())
    }

    async fn load(&self, _session_id: &str) -> Result<Option<SessionSnapshot>, OrchestratorError> {
        Ok(None)
    }
}
