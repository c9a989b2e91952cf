use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::OrchestratorError;
use crate::orchestrator::{Callbacks, OrchestrationOutcome, Orchestrator};
use crate::provider::InferenceProvider;
use crate::types::{InferenceRequest, Message, Role, Session};

/// What the verification judge decided about a run that already reached a
/// natural stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationVerdict {
    Satisfied,
    Deficient { deficiencies: String },
}

/// Optional post-hoc check run once after a successful main-loop
/// termination: was the user's original request actually satisfied? If not,
/// the model's own account of what's missing is appended as a user message
/// and the loop re-enters — exactly once.
pub struct VerificationPass;

impl VerificationPass {
    pub fn new() -> Self {
        Self
    }

    async fn judge(&self, session: &Session, summarizer: &dyn InferenceProvider) -> VerificationVerdict {
        let objective = session.objective().map(|m| m.content.as_str()).unwrap_or("");
        let last_reply = session
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
            .unwrap_or("");

        let prompt = format!(
            "Original request:\n{objective}\n\n\
             Final assistant reply:\n{last_reply}\n\n\
             Was the original request fully satisfied? Respond with a single word, \
             SATISFIED or DEFICIENT, followed by a brief explanation if DEFICIENT."
        );

        let request = InferenceRequest {
            messages: vec![Message::user(prompt)],
            temperature: None,
            max_tokens: 256,
            system_prompt: None,
            tools: vec![],
            response_format: None,
        };

        match summarizer.complete_with_request(request).await {
            Ok(response) => self.parse(&response.content),
            Err(e) => {
                warn!(error = %e, "verification judge call failed, treating run as satisfied");
                VerificationVerdict::Satisfied
            }
        }
    }

    fn parse(&self, content: &str) -> VerificationVerdict {
        let first_token = content.split_whitespace().next().unwrap_or("").to_uppercase();
        if first_token == "DEFICIENT" {
            VerificationVerdict::Deficient {
                deficiencies: content.trim().to_string(),
            }
        } else {
            VerificationVerdict::Satisfied
        }
    }

    /// Run the check against a session that just reached `outcome`. If the
    /// judge finds a deficiency, append it as a user message and re-run the
    /// orchestrator exactly once; whatever that second run produces is
    /// final, regardless of what a second verification pass might say.
    pub async fn maybe_reenter(
        &self,
        orchestrator: &Orchestrator,
        session: &mut Session,
        outcome: OrchestrationOutcome,
        summarizer: &dyn InferenceProvider,
        cancel: CancellationToken,
        callbacks: &Callbacks,
    ) -> Result<OrchestrationOutcome, OrchestratorError> {
        if !matches!(outcome, OrchestrationOutcome::Completed { .. }) {
            return Ok(outcome);
        }

        match self.judge(session, summarizer).await {
            VerificationVerdict::Satisfied => Ok(outcome),
            VerificationVerdict::Deficient { deficiencies } => {
                session.push(Message::user(format!(
                    "The previous response did not fully satisfy the request. {deficiencies}\n\
                     Please address the gap."
                )));
                orchestrator.run(session, cancel, callbacks).await
            }
        }
    }
}

impl Default for VerificationPass {
    fn default() -> Self {
        Self::new()
    }
}
