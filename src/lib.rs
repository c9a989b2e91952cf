//! Orchestration core for agentic LLM/tool loops: request/response scheduling,
//! context compaction, loop detection, auto-continue judgement, tool
//! validation and repair, user-facing authorization, multi-task planning,
//! and a post-hoc verification pass.
//!
//! Concrete LLM HTTP clients, concrete tool executors (shell, filesystem,
//! sandbox, MCP bridges), and a concrete on-disk session format are all out
//! of scope — this crate supplies the trait boundaries
//! ([`provider::InferenceProvider`], [`tools::ToolExecutor`],
//! [`session::SessionManager`]) and the scheduling logic that sits between
//! them.

pub mod autocontinue;
pub mod cli;
pub mod compaction;
pub mod error;
pub mod events;
pub mod interaction;
pub mod loop_detector;
pub mod orchestrator;
pub mod planning;
pub mod provider;
pub mod rewrite;
pub mod sandbox;
pub mod session;
pub mod token_estimator;
pub mod tools;
pub mod types;
pub mod verification;

pub use error::{OrchestratorError, ProviderError, ValidationError};
pub use events::{OrchestratorEvent, ProviderUsageEvent};
pub use orchestrator::{Callbacks, OrchestrationOutcome, Orchestrator, SessionOutcome};
pub use provider::InferenceProvider;
pub use session::{NoSessionManager, SessionManager, SessionSnapshot};
pub use types::{
    InferenceRequest, InferenceResponse, Message, PlanningBoard, Role, Session, StopReason, Task,
    TaskExecutionSummary, TaskStatus, ToolCall, ToolSpec, ToolWhitelist, Usage,
};

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::error::ProviderError;
    use crate::tools::{ToolExecutor, ToolRegistry};

    struct ScriptedProvider {
        responses: Mutex<VecDeque<Result<InferenceResponse, ProviderError>>>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<Result<InferenceResponse, ProviderError>>) -> Self {
            Self { responses: Mutex::new(responses.into_iter().collect()) }
        }
    }

    #[async_trait]
    impl InferenceProvider for ScriptedProvider {
        async fn complete_with_request(&self, _request: InferenceRequest) -> Result<InferenceResponse, ProviderError> {
            self.responses.lock().await.pop_front().unwrap_or(Err(ProviderError::Request("no more responses".into())))
        }
    }

    struct EchoExecutor;

    #[async_trait]
    impl ToolExecutor for EchoExecutor {
        async fn execute(&self, arguments: &serde_json::Value) -> Result<String, String> {
            Ok(arguments["text"].as_str().unwrap_or_default().to_string())
        }
    }

    /// End-to-end smoke test: a user prompt triggers one tool call, then a
    /// final reply, driven entirely through the public API a caller embeds.
    #[tokio::test]
    async fn full_loop_drives_a_tool_call_to_completion() {
        let first = InferenceResponse {
            content: String::new(),
            tool_calls: vec![ToolCall { id: "1".into(), name: "echo".into(), arguments: json!({"text": "hi"}) }],
            stop_reason: StopReason::ToolUse,
            usage: Some(Usage { input_tokens: 5, output_tokens: 5 }),
            provider_response_id: None,
        };
        let second = InferenceResponse {
            content: "done".into(),
            tool_calls: vec![],
            stop_reason: StopReason::EndTurn,
            usage: Some(Usage { input_tokens: 5, output_tokens: 5 }),
            provider_response_id: None,
        };
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(first), Ok(second)]));
        let registry = Arc::new(
            ToolRegistry::new().add(
                ToolSpec {
                    name: "echo".into(),
                    description: "echo text back".into(),
                    parameters_schema: json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]}),
                    critical: true,
                    mcp_key: None,
                },
                EchoExecutor,
            ),
        );

        let orchestrator = Orchestrator::new(provider, registry, "claude-3-sonnet-20240229");
        let mut session = Session::new("s1", "/tmp/workspace");
        session.push(Message::user("please echo hi"));

        let outcome = orchestrator
            .run(&mut session, CancellationToken::new(), &Callbacks::default())
            .await
            .unwrap();

        match outcome {
            OrchestrationOutcome::Completed { text, .. } => assert_eq!(text, "done"),
            other => panic!("expected Completed, got {other:?}"),
        }
        assert!(session.messages.iter().any(|m| m.role == Role::Tool && m.content == "hi"));
    }
}
