use serde_json::Value;

use crate::types::TaskStatus;

/// Callback-stream events emitted by the orchestration loop for UI/telemetry
/// consumers. None of these drive control flow — they are observational.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    IterationStart { iteration: u32 },
    Progress { chunk: String },
    ToolCall { id: String, name: String, arguments: Value },
    ToolResult { id: String, name: String, output: String, is_error: bool },
    Compacted { pre_tokens: u32, post_tokens: u32 },
    AuthorizationRequested { request_id: String, interaction_type: String },
    AuthorizationResolved { request_id: String, approved: bool },
    TaskStarted { task_id: String, index: usize, total: usize },
    TaskFinished { task_id: String, status: TaskStatus },
    Finished { iterations: u32 },
    Error { message: String },
}

/// Provider-usage callback payload, reported once per LLM call.
#[derive(Debug, Clone, Default)]
pub struct ProviderUsageEvent {
    pub input_tokens: u32,
    pub output_tokens: u32,
}
