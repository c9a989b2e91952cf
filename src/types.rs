use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A role a message is authored under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::System => "system",
        }
    }
}

/// A tool invocation requested by the model in an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// The append-only conversation entry. The objective is `messages[0]` and is
/// never rewritten; structured fields (tool calls, stop reason, etc.) are
/// represented directly here rather than encoded into `content`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_id: None,
            tool_name: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_id: None,
            tool_name: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_id: None,
            tool_name: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn tool_result(tool_id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_id: Some(tool_id.into()),
            tool_name: Some(name.into()),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Why the model stopped generating on a given turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Stop,
    EndTurn,
    Length,
    ToolUse,
    Other,
}

#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn accumulate(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// The request sent to an `InferenceProvider`.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
    pub tools: Vec<Value>,
    pub response_format: Option<Value>,
}

/// The response received from an `InferenceProvider`.
#[derive(Debug, Clone)]
pub struct InferenceResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: StopReason,
    pub usage: Option<Usage>,
    pub provider_response_id: Option<String>,
}

/// A tool specification held by the registry.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
    /// Critical tools are always visible, bypassing per-turn whitelist filtering.
    pub critical: bool,
    pub mcp_key: Option<String>,
}

impl ToolSpec {
    pub fn required_params(&self) -> Vec<String> {
        self.parameters_schema["required"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default()
    }
}

/// Status of a planning-board task. Advances monotonically from `Pending`
/// through at most one terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Partial,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Partial)
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub text: String,
    pub priority: u32,
    pub description: String,
    pub status: TaskStatus,
    pub subtasks: Vec<Task>,
    pub summary: Option<TaskExecutionSummary>,
}

impl Task {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            priority: 0,
            description: String::new(),
            status: TaskStatus::Pending,
            subtasks: Vec::new(),
            summary: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlanningBoard {
    pub description: String,
    pub primary_tasks: Vec<Task>,
}

/// Structured hand-off passed as context into the next task.
#[derive(Debug, Clone)]
pub struct TaskExecutionSummary {
    pub task_id: String,
    pub task_text: String,
    pub status: TaskStatus,
    pub summary: String,
    pub files_modified: BTreeSet<String>,
    pub files_read: BTreeSet<String>,
    pub errors: Vec<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// The unit of isolation for a run: an ordered message log plus file-tracking
/// sets and an optional explicit task summary slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub working_directory: String,
    pub messages: Vec<Message>,
    pub files_read: BTreeSet<String>,
    pub files_modified: BTreeSet<String>,
    pub task_summary: Option<String>,
}

impl Session {
    pub fn new(id: impl Into<String>, working_directory: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            working_directory: working_directory.into(),
            messages: Vec::new(),
            files_read: BTreeSet::new(),
            files_modified: BTreeSet::new(),
            task_summary: None,
        }
    }

    /// The first user message, immutable for the session's lifetime.
    pub fn objective(&self) -> Option<&Message> {
        self.messages.first()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }
}

/// Per-turn whitelist of visible tool names.
#[derive(Debug, Clone)]
pub enum ToolWhitelist {
    All,
    Names(BTreeSet<String>),
}

impl ToolWhitelist {
    pub fn allows(&self, name: &str) -> bool {
        match self {
            ToolWhitelist::All => true,
            ToolWhitelist::Names(names) => names.contains(name),
        }
    }
}
