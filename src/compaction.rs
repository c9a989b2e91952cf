use tracing::{debug, info};

use crate::error::{OrchestratorError, ProviderError};
use crate::provider::InferenceProvider;
use crate::token_estimator::{estimate_messages, heuristic_context_window};
use crate::types::{InferenceRequest, Message, Role, Session, StopReason};

const COMPACTION_DIRECTIVE: &str = "Continue to implement this.";

/// Smallest prefix length `k` such that the summed tokens of messages
/// `[0, k)` meet or exceed `total / 2`. Reaching the threshold is never
/// allowed to require consuming every message — that degenerates into
/// "compact everything" — so the last message is always left out when the
/// naive walk would otherwise need it.
pub fn select_compaction_prefix(per_message_tokens: &[u32], total: u32) -> usize {
    let len = per_message_tokens.len();
    if len == 0 {
        return 0;
    }
    if len == 1 {
        return 1;
    }

    let target = total as f64 / 2.0;
    let mut cumulative: u64 = 0;
    let mut k = len;
    for (i, &tokens) in per_message_tokens.iter().enumerate() {
        cumulative += tokens as u64;
        if cumulative as f64 >= target {
            k = i + 1;
            break;
        }
    }

    if k >= len {
        k = len - 1;
    }

    if per_message_tokens.iter().all(|&t| t == 0) {
        k = k.max(2);
    }

    k
}

/// Collapse whitespace, then: empty/whitespace input becomes a sentinel;
/// non-positive limits collapse to empty; limits of 3 or fewer truncate
/// without an ellipsis; larger limits truncate to `limit - 3` chars and
/// append `...` so the final length never exceeds `limit`.
pub fn condense_content(text: &str, limit: i64) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return "(no content)".to_string();
    }
    if limit <= 0 {
        return String::new();
    }
    let limit = limit as usize;

    let chars: Vec<char> = collapsed.chars().collect();
    if chars.len() <= limit {
        return collapsed;
    }

    if limit <= 3 {
        return chars.into_iter().take(limit).collect();
    }

    let keep = limit - 3;
    let truncated: String = chars.into_iter().take(keep).collect();
    format!("{truncated}...")
}

/// Display label for a message's role, used by the compactor and any log/UI
/// surfacing of the message list.
pub fn format_role_label(role: &str, tool_name: Option<&str>) -> String {
    let trimmed = role.trim();
    if trimmed.is_empty() {
        return "Unknown".to_string();
    }

    let mut chars = trimmed.chars();
    let capitalized = match chars.next() {
        Some(first) => format!("{}{}", first.to_uppercase(), chars.as_str()),
        None => return "Unknown".to_string(),
    };

    match tool_name {
        Some(name) if !name.is_empty() => format!("{capitalized} ({name})"),
        _ => capitalized,
    }
}

/// Replaces the oldest prefix of a session's log with a single synthetic
/// summary message once the session exceeds a model-specific token
/// threshold. Never mutates `messages[0]` (the objective).
pub struct ContextCompactor {
    /// Fraction of the context window at which full summarizing compaction
    /// triggers.
    pub compaction_threshold: f32,
    /// Fraction of the context window at which the cheaper micro-compaction
    /// pre-pass (tool-result pruning) triggers. Lower than `compaction_threshold`.
    pub prune_threshold: f32,
    /// How many of the most recent tool-result messages micro-compaction
    /// leaves untouched.
    pub keep_recent_tool_results: usize,
    /// Below this combined token count, every verbatim user prompt is kept;
    /// above it, user prompts are condensed into a bulleted rewrite instead.
    pub unify_user_prompt_tokens: u32,
}

impl Default for ContextCompactor {
    fn default() -> Self {
        Self {
            compaction_threshold: 0.75,
            prune_threshold: 0.60,
            keep_recent_tool_results: 3,
            unify_user_prompt_tokens: 2_000,
        }
    }
}

impl ContextCompactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_compaction_threshold(mut self, threshold: f32) -> Self {
        self.compaction_threshold = threshold;
        self
    }

    pub fn with_prune_threshold(mut self, threshold: f32) -> Self {
        self.prune_threshold = threshold;
        self
    }

    pub fn needs_compaction(&self, total_tokens: u32, context_window: u32) -> bool {
        if context_window == 0 {
            return true;
        }
        (total_tokens as f64 / context_window as f64) >= self.compaction_threshold as f64
    }

    fn needs_micro_compaction(&self, total_tokens: u32, context_window: u32) -> bool {
        if context_window == 0 {
            return true;
        }
        (total_tokens as f64 / context_window as f64) >= self.prune_threshold as f64
    }

    /// Optimization pre-pass: prune old tool-result bodies to a stub noting
    /// the original size. Never touches message 0, never substitutes for the
    /// prefix-summarization path below — only runs in front of it. Returns
    /// true if anything was pruned.
    pub fn micro_compact(&self, session: &mut Session, model_id: &str) -> bool {
        let (total, _) = estimate_messages(&session.messages, model_id);
        let window = heuristic_context_window(model_id);
        if !self.needs_micro_compaction(total, window) {
            return false;
        }

        let tool_indices: Vec<usize> = session
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role == Role::Tool)
            .map(|(i, _)| i)
            .collect();

        if tool_indices.len() <= self.keep_recent_tool_results {
            return false;
        }

        let prune_count = tool_indices.len() - self.keep_recent_tool_results;
        let mut pruned_any = false;
        for &idx in &tool_indices[..prune_count] {
            let msg = &mut session.messages[idx];
            if msg.content.starts_with("[tool result pruned") {
                continue;
            }
            let original_len = msg.content.len();
            let name = msg.tool_name.clone().unwrap_or_else(|| "unknown".into());
            msg.content = format!("[tool result pruned — {name}: {original_len} bytes]");
            pruned_any = true;
        }

        if pruned_any {
            debug!(pruned = prune_count, "micro-compaction pruned old tool results");
        }
        pruned_any
    }

    /// Build the summarize-model request for the session's selected prefix,
    /// or `None` if there is nothing to compact (prefix would not exclude
    /// the objective).
    pub fn build_summarization_request(
        &self,
        session: &Session,
        prefix_len: usize,
        model: &str,
    ) -> Option<InferenceRequest> {
        if prefix_len <= 1 || prefix_len > session.messages.len() {
            return None;
        }

        let prefix = &session.messages[1..prefix_len];
        let user_prompts: Vec<&str> = prefix
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .collect();
        let latest_user_prompt = session
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("");

        let combined_user_tokens: u32 = user_prompts.iter().map(|p| (p.len() as u32) / 4).sum();

        let mut sections = Vec::new();
        if combined_user_tokens < self.unify_user_prompt_tokens {
            let mut section = String::from("User requests:\n");
            for prompt in &user_prompts {
                section.push_str("- ");
                section.push_str(prompt);
                section.push('\n');
            }
            sections.push(section);
        } else {
            let mut section = String::from("User requests (condensed):\n");
            for prompt in &user_prompts {
                section.push_str("- ");
                section.push_str(&condense_content(prompt, 200));
                section.push('\n');
            }
            sections.push(section);
        }

        if !session.files_modified.is_empty() {
            let mut section = String::from("Files modified so far:\n");
            for file in &session.files_modified {
                section.push_str("- ");
                section.push_str(file);
                section.push('\n');
            }
            sections.push(section);
        }

        sections.push(format!("Most recent user request:\n{latest_user_prompt}"));
        sections.push(COMPACTION_DIRECTIVE.to_string());

        let prompt = format!(
            "Summarize the conversation so far so it can continue in a fresh context \
             window. Preserve everything needed to continue the task.\n\n{}",
            sections.join("\n\n")
        );

        Some(InferenceRequest {
            messages: vec![Message::user(prompt)],
            temperature: None,
            max_tokens: 1024,
            system_prompt: None,
            tools: vec![],
            response_format: None,
        })
    }

    /// Replace `messages[1..prefix_len)` with a single synthetic `system`
    /// message, leaving `messages[0]` and everything from `prefix_len`
    /// onward untouched. Atomic: callers see either the old log or the new
    /// one, never a state missing the objective.
    pub fn apply(&self, session: &mut Session, prefix_len: usize, summary: String) -> bool {
        if prefix_len <= 1 || prefix_len > session.messages.len() || session.messages.is_empty() {
            return false;
        }

        let mut replaced = Vec::with_capacity(session.messages.len() - prefix_len + 2);
        replaced.push(session.messages[0].clone());
        replaced.push(Message::system(summary));
        replaced.extend_from_slice(&session.messages[prefix_len..]);
        session.messages = replaced;
        true
    }

    /// Decide, build, call the summarize model, and apply — the full
    /// compaction cycle run synchronously between orchestration iterations.
    /// Returns `(pre_tokens, post_tokens)` if compaction ran.
    pub async fn maybe_compact(
        &self,
        session: &mut Session,
        model_id: &str,
        summarizer: &dyn InferenceProvider,
    ) -> Result<Option<(u32, u32)>, OrchestratorError> {
        self.micro_compact(session, model_id);

        let (total, per_message) = estimate_messages(&session.messages, model_id);
        let window = heuristic_context_window(model_id);
        if !self.needs_compaction(total, window) {
            return Ok(None);
        }

        let prefix_len = select_compaction_prefix(&per_message, total);
        let Some(request) = self.build_summarization_request(session, prefix_len, model_id) else {
            return Ok(None);
        };

        let response = summarizer
            .complete_with_request(request)
            .await
            .map_err(OrchestratorError::Provider)?;

        if response.stop_reason == StopReason::Length {
            return Err(OrchestratorError::Provider(ProviderError::Parse(
                "summarize model truncated its compaction response".into(),
            )));
        }

        self.apply(session, prefix_len, response.content.clone());
        let (post_total, _) = estimate_messages(&session.messages, model_id);
        info!(total, post_total, "context compacted");
        Ok(Some((total, post_total)))
    }
}
