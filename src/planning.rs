use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::events::OrchestratorEvent;
use crate::orchestrator::{Callbacks, Orchestrator, OrchestrationOutcome};
use crate::provider::InferenceProvider;
use crate::rewrite::strip_wrapping;
use crate::types::{InferenceRequest, Message, PlanningBoard, Session, Task, TaskExecutionSummary, TaskStatus};

const SIMPLE_PROMPT_MAX_WORDS: usize = 12;
const MULTI_STEP_MARKERS: [&str; 6] = ["and then", "after that", "first,", "next,", "finally,", "once that's done"];

/// What the planning decider concluded, and with what constraints.
#[derive(Debug, Clone)]
pub struct PlanningDecision {
    pub run_planning: bool,
    pub reason: String,
    /// `None` means every configured MCP server remains available.
    pub allowed_mcps: Option<Vec<String>>,
    pub notes: String,
}

impl PlanningDecision {
    fn skip(reason: impl Into<String>) -> Self {
        Self {
            run_planning: false,
            reason: reason.into(),
            allowed_mcps: None,
            notes: String::new(),
        }
    }

    fn unrestricted(reason: impl Into<String>) -> Self {
        Self {
            run_planning: true,
            reason: reason.into(),
            allowed_mcps: None,
            notes: String::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeciderResponse {
    run_planning: bool,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    allowed_mcps: Vec<String>,
    #[serde(default)]
    notes: String,
}

/// Decides whether a prompt warrants the overhead of a planning board at all.
/// A heuristic short-circuit skips the LLM call entirely for prompts too
/// simple to benefit from one.
pub struct PlanningDecider;

impl PlanningDecider {
    pub fn new() -> Self {
        Self
    }

    /// A short, single-clause request with no sequencing language. These
    /// never benefit from a planning board — consulting the model about one
    /// would just spend a call to learn what the heuristic already knows.
    pub fn is_simple_prompt(&self, prompt: &str) -> bool {
        let word_count = prompt.split_whitespace().count();
        if word_count > SIMPLE_PROMPT_MAX_WORDS {
            return false;
        }
        let sentence_count = prompt.matches(['.', '!', '?']).count();
        if sentence_count > 1 {
            return false;
        }
        let lower = prompt.to_lowercase();
        !MULTI_STEP_MARKERS.iter().any(|marker| lower.contains(marker))
    }

    pub async fn decide(
        &self,
        prompt: &str,
        mcp_servers: &[String],
        summarizer: &dyn InferenceProvider,
    ) -> PlanningDecision {
        if self.is_simple_prompt(prompt) {
            return PlanningDecision::skip("prompt is short and single-step");
        }

        let request = self.build_request(prompt, mcp_servers);
        let response = match summarizer.complete_with_request(request).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "planning decider call failed, defaulting to run with no MCP restriction");
                return PlanningDecision::unrestricted(format!("decider call failed: {e}"));
            }
        };

        let cleaned = normalize_json_text(&strip_wrapping(&response.content));
        match serde_json::from_str::<DeciderResponse>(&cleaned) {
            Ok(parsed) => PlanningDecision {
                run_planning: parsed.run_planning,
                reason: parsed.reason,
                allowed_mcps: if parsed.allowed_mcps.is_empty() { None } else { Some(parsed.allowed_mcps) },
                notes: parsed.notes,
            },
            Err(e) => {
                warn!(error = %e, raw = %response.content, "unparseable planning decider response");
                PlanningDecision::unrestricted("unparseable decider response")
            }
        }
    }

    fn build_request(&self, prompt: &str, mcp_servers: &[String]) -> InferenceRequest {
        let servers = if mcp_servers.is_empty() {
            "(none configured)".to_string()
        } else {
            mcp_servers.join(", ")
        };
        let text = format!(
            "A user submitted this request:\n\n{prompt}\n\n\
             Available MCP servers: {servers}\n\n\
             Decide whether this request is complex enough to benefit from an \
             up-front task plan before execution begins. Respond with strictly \
             this JSON shape, nothing else:\n\
             {{\"run_planning\": boolean, \"reason\": string, \"allowed_mcps\": [string], \"notes\": string}}"
        );
        InferenceRequest {
            messages: vec![Message::user(text)],
            temperature: None,
            max_tokens: 512,
            system_prompt: None,
            tools: vec![],
            response_format: None,
        }
    }
}

impl Default for PlanningDecider {
    fn default() -> Self {
        Self::new()
    }
}

/// Replace unescaped literal newlines inside JSON string values with `\n` so
/// a model that forgot to escape them doesn't break parsing.
fn normalize_json_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    for c in s.chars() {
        if in_string {
            if escaped {
                out.push(c);
                escaped = false;
                continue;
            }
            match c {
                '\\' => {
                    out.push(c);
                    escaped = true;
                }
                '"' => {
                    in_string = false;
                    out.push(c);
                }
                '\n' => out.push_str("\\n"),
                '\r' => {}
                _ => out.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
        }
    }
    out
}

/// Asks a planning model to produce a task board for a given objective.
pub struct PlanningSubAgent;

#[derive(Debug, Deserialize)]
struct RawTask {
    id: String,
    text: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    priority: u32,
    #[serde(default)]
    subtasks: Vec<RawSubtask>,
}

#[derive(Debug, Deserialize)]
struct RawSubtask {
    text: String,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Deserialize)]
struct RawBoard {
    description: String,
    primary_tasks: Vec<RawTask>,
}

impl PlanningSubAgent {
    pub fn new() -> Self {
        Self
    }

    pub async fn produce_board(
        &self,
        objective: &str,
        summarizer: &dyn InferenceProvider,
    ) -> Result<PlanningBoard, String> {
        let request = InferenceRequest {
            messages: vec![Message::user(format!(
                "Break this objective into an ordered list of primary tasks:\n\n{objective}\n\n\
                 Respond with strictly this JSON shape, nothing else:\n\
                 {{\"description\": string, \"primary_tasks\": [{{\"id\": string, \"text\": string, \
                 \"description\": string, \"priority\": integer, \"subtasks\": [{{\"text\": string, \"done\": boolean}}]}}]}}"
            ))],
            temperature: None,
            max_tokens: 2048,
            system_prompt: None,
            tools: vec![],
            response_format: None,
        };

        let response = summarizer
            .complete_with_request(request)
            .await
            .map_err(|e| format!("planning sub-agent call failed: {e}"))?;

        let cleaned = normalize_json_text(&strip_wrapping(&response.content));
        let raw: RawBoard = serde_json::from_str(&cleaned)
            .map_err(|e| format!("unparseable planning board response: {e}"))?;

        Ok(PlanningBoard {
            description: raw.description,
            primary_tasks: raw
                .primary_tasks
                .into_iter()
                .map(|t| Task {
                    id: t.id,
                    text: t.text,
                    priority: t.priority,
                    description: t.description,
                    status: TaskStatus::Pending,
                    subtasks: t
                        .subtasks
                        .into_iter()
                        .map(|s| {
                            let mut task = Task::new(String::new(), s.text);
                            task.status = if s.done { TaskStatus::Completed } else { TaskStatus::Pending };
                            task
                        })
                        .collect(),
                    summary: None,
                })
                .collect(),
        })
    }
}

impl Default for PlanningSubAgent {
    fn default() -> Self {
        Self::new()
    }
}

/// Tool name the child orchestrator's model can call to hand back an
/// explicit summary for its task, preferred over inferring one from the
/// last assistant message.
pub const SUMMARY_TOOL_NAME: &str = "report_task_summary";

/// Runs a planning board's primary tasks serially, each against a fresh
/// child session but the same collaborators (provider, registry,
/// interaction actor). A failed task does not abort the board — its summary
/// carries the error text forward to whatever task runs next.
pub struct BoardExecutor<'a> {
    pub orchestrator: &'a Orchestrator,
}

impl<'a> BoardExecutor<'a> {
    pub fn new(orchestrator: &'a Orchestrator) -> Self {
        Self { orchestrator }
    }

    pub async fn run(
        &self,
        board: &mut PlanningBoard,
        objective: &str,
        cancel: CancellationToken,
        callbacks: &Callbacks,
    ) -> Vec<TaskExecutionSummary> {
        let total = board.primary_tasks.len();
        let mut completed_summaries: Vec<TaskExecutionSummary> = board
            .primary_tasks
            .iter()
            .filter_map(|t| t.summary.clone())
            .collect();

        for index in 0..total {
            if board.primary_tasks[index].status.is_terminal() {
                continue;
            }
            if cancel.is_cancelled() {
                break;
            }

            let task_id = board.primary_tasks[index].id.clone();
            callbacks.emit(OrchestratorEvent::TaskStarted {
                task_id: task_id.clone(),
                index,
                total,
            });

            let prompt = self.build_task_prompt(objective, &board.primary_tasks[index], index, total, &completed_summaries);
            let mut child_session = Session::new(format!("{task_id}-session"), "");
            child_session.push(Message::user(prompt));

            let outcome = self.orchestrator.run(&mut child_session, cancel.clone(), callbacks).await;

            let (status, summary) = self.summarize_outcome(&task_id, &board.primary_tasks[index].text, &child_session, outcome);
            board.primary_tasks[index].status = status;
            board.primary_tasks[index].summary = Some(summary.clone());
            completed_summaries.push(summary);

            callbacks.emit(OrchestratorEvent::TaskFinished { task_id, status });
        }

        completed_summaries
    }

    fn build_task_prompt(
        &self,
        objective: &str,
        task: &Task,
        index: usize,
        total: usize,
        previous: &[TaskExecutionSummary],
    ) -> String {
        let mut out = format!("Overall objective:\n{objective}\n\n");
        out.push_str(&format!("Task {} of {}: {}\n", index + 1, total, task.text));
        if !task.description.is_empty() {
            out.push_str(&format!("Description: {}\n", task.description));
        }
        if !task.subtasks.is_empty() {
            out.push_str("Subtasks:\n");
            for subtask in &task.subtasks {
                let marker = if subtask.status == TaskStatus::Completed { "[x]" } else { "[ ]" };
                out.push_str(&format!("- {marker} {}\n", subtask.text));
            }
        }
        if index > 0 && !previous.is_empty() {
            out.push_str("\nPrevious Tasks Completed:\n");
            for summary in previous {
                out.push_str(&format!("- {} ({:?}): {}", summary.task_text, summary.status, summary.summary));
                if !summary.errors.is_empty() {
                    out.push_str(&format!(" [errors: {}]", summary.errors.join("; ")));
                }
                out.push('\n');
            }
        }
        out
    }

    fn summarize_outcome(
        &self,
        task_id: &str,
        task_text: &str,
        session: &Session,
        outcome: Result<OrchestrationOutcome, crate::error::OrchestratorError>,
    ) -> (TaskStatus, TaskExecutionSummary) {
        let explicit_summary = session
            .messages
            .iter()
            .rev()
            .find(|m| m.tool_calls.iter().any(|c| c.name == SUMMARY_TOOL_NAME))
            .and_then(|m| m.tool_calls.iter().find(|c| c.name == SUMMARY_TOOL_NAME))
            .and_then(|c| c.arguments.get("summary").and_then(Value::as_str))
            .map(str::to_string)
            .filter(|s| !s.trim().is_empty());

        let last_assistant = session
            .messages
            .iter()
            .rev()
            .find(|m| m.role == crate::types::Role::Assistant && !m.content.trim().is_empty())
            .map(|m| m.content.clone());

        match outcome {
            Ok(_) => {
                let summary_text = explicit_summary
                    .or(last_assistant)
                    .unwrap_or_else(|| "Task completed".to_string());
                let summary = TaskExecutionSummary {
                    task_id: task_id.to_string(),
                    task_text: task_text.to_string(),
                    status: TaskStatus::Completed,
                    summary: summary_text,
                    files_modified: session.files_modified.clone(),
                    files_read: session.files_read.clone(),
                    errors: Vec::new(),
                    timestamp: chrono::Utc::now(),
                };
                (TaskStatus::Completed, summary)
            }
            Err(e) => {
                let error_text = e.to_string();
                let summary_text = explicit_summary
                    .or(last_assistant)
                    .unwrap_or_else(|| "Task completed".to_string());
                let summary = TaskExecutionSummary {
                    task_id: task_id.to_string(),
                    task_text: task_text.to_string(),
                    status: TaskStatus::Failed,
                    summary: summary_text,
                    files_modified: session.files_modified.clone(),
                    files_read: session.files_read.clone(),
                    errors: vec![error_text],
                    timestamp: chrono::Utc::now(),
                };
                (TaskStatus::Failed, summary)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::tools::ToolRegistry;
    use crate::types::{InferenceResponse, StopReason};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    struct MockSummarizer {
        responses: Mutex<VecDeque<Result<InferenceResponse, ProviderError>>>,
    }

    impl MockSummarizer {
        fn new(texts: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(
                    texts
                        .into_iter()
                        .map(|t| {
                            Ok(InferenceResponse {
                                content: t.to_string(),
                                tool_calls: vec![],
                                stop_reason: StopReason::EndTurn,
                                usage: None,
                                provider_response_id: None,
                            })
                        })
                        .collect(),
                ),
            }
        }
    }

    #[async_trait]
    impl InferenceProvider for MockSummarizer {
        async fn complete_with_request(&self, _request: InferenceRequest) -> Result<InferenceResponse, ProviderError> {
            self.responses.lock().await.pop_front().unwrap_or(Err(ProviderError::Request("no more responses".into())))
        }
    }

    #[test]
    fn simple_prompt_heuristic() {
        let decider = PlanningDecider::new();
        assert!(decider.is_simple_prompt("fix the typo in README"));
        assert!(!decider.is_simple_prompt(
            "First, refactor the parser module. Next, update all call sites. Finally, run the test suite and fix any failures."
        ));
    }

    #[tokio::test]
    async fn simple_prompt_skips_llm_call() {
        let summarizer = MockSummarizer::new(vec![]);
        let decider = PlanningDecider::new();
        let decision = decider.decide("fix typo", &[], &summarizer).await;
        assert!(!decision.run_planning);
    }

    #[tokio::test]
    async fn complex_prompt_consults_model() {
        let summarizer = MockSummarizer::new(vec![
            r#"{"run_planning": true, "reason": "multi-step work", "allowed_mcps": ["github"], "notes": "n/a"}"#,
        ]);
        let decider = PlanningDecider::new();
        let decision = decider
            .decide(
                "First, audit every config file. Then migrate them to the new schema. Finally, open a PR per service.",
                &["github".to_string(), "slack".to_string()],
                &summarizer,
            )
            .await;
        assert!(decision.run_planning);
        assert_eq!(decision.allowed_mcps, Some(vec!["github".to_string()]));
    }

    #[tokio::test]
    async fn unparseable_decider_response_falls_back_to_unrestricted_run() {
        let summarizer = MockSummarizer::new(vec!["not json"]);
        let decider = PlanningDecider::new();
        let decision = decider
            .decide(
                "First, do a lot of complicated multi-step work across several services.",
                &[],
                &summarizer,
            )
            .await;
        assert!(decision.run_planning);
        assert!(decision.allowed_mcps.is_none());
    }

    #[test]
    fn normalize_json_text_escapes_bare_newlines_in_strings() {
        let raw = "{\"reason\": \"line one\nline two\"}";
        let normalized = normalize_json_text(raw);
        let parsed: Value = serde_json::from_str(&normalized).unwrap();
        assert_eq!(parsed["reason"], "line one\nline two");
    }

    fn registry() -> Arc<ToolRegistry> {
        Arc::new(ToolRegistry::new())
    }

    #[tokio::test]
    async fn board_executor_runs_tasks_serially_and_marks_completed() {
        let provider = Arc::new(MockSummarizer::new(vec!["task one done", "task two done"]));
        let orchestrator = Orchestrator::new(provider, registry(), "claude-3-sonnet-20240229");
        let executor = BoardExecutor::new(&orchestrator);

        let mut board = PlanningBoard {
            description: "do two things".into(),
            primary_tasks: vec![Task::new("t1", "first task"), Task::new("t2", "second task")],
        };

        let summaries = executor
            .run(&mut board, "overall objective", CancellationToken::new(), &Callbacks::default())
            .await;

        assert_eq!(summaries.len(), 2);
        assert!(board.primary_tasks.iter().all(|t| t.status == TaskStatus::Completed));
        assert_eq!(summaries[0].summary, "task one done");
    }

    #[tokio::test]
    async fn board_reentry_with_all_tasks_completed_makes_no_llm_calls() {
        let provider = Arc::new(MockSummarizer::new(vec![]));
        let orchestrator = Orchestrator::new(provider, registry(), "claude-3-sonnet-20240229");
        let executor = BoardExecutor::new(&orchestrator);

        let mut task = Task::new("t1", "already done");
        task.status = TaskStatus::Completed;
        task.summary = Some(TaskExecutionSummary {
            task_id: "t1".into(),
            task_text: "already done".into(),
            status: TaskStatus::Completed,
            summary: "done previously".into(),
            files_modified: Default::default(),
            files_read: Default::default(),
            errors: vec![],
            timestamp: chrono::Utc::now(),
        });
        let mut board = PlanningBoard { description: "one task".into(), primary_tasks: vec![task] };

        let summaries = executor
            .run(&mut board, "objective", CancellationToken::new(), &Callbacks::default())
            .await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].summary, "done previously");
    }

    #[tokio::test]
    async fn failed_task_does_not_abort_board_and_carries_error_forward() {
        let provider = Arc::new(MockSummarizer::new(vec![]));
        // No responses queued: the first task's call fails, the second must
        // still run (and also fails, since nothing is queued for it either).
        let orchestrator = Orchestrator::new(provider, registry(), "claude-3-sonnet-20240229");
        let executor = BoardExecutor::new(&orchestrator);

        let mut board = PlanningBoard {
            description: "two risky things".into(),
            primary_tasks: vec![Task::new("t1", "risky task"), Task::new("t2", "second risky task")],
        };

        let summaries = executor
            .run(&mut board, "objective", CancellationToken::new(), &Callbacks::default())
            .await;

        assert_eq!(summaries.len(), 2);
        assert!(board.primary_tasks.iter().all(|t| t.status == TaskStatus::Failed));
        assert!(!summaries[0].errors.is_empty());
        assert!(!summaries[1].errors.is_empty());
    }
}
