use std::time::Duration;

use tracing::warn;

use crate::loop_detector::LoopDetector;
use crate::provider::InferenceProvider;
use crate::token_estimator::estimate;
use crate::types::{InferenceRequest, Message, Role, Session};

const DEADLINE: Duration = Duration::from_secs(15);
const RECENT_MESSAGE_TOKEN_BUDGET: u32 = 1_000;
const MAX_RECENT_USER_PROMPTS: usize = 10;
const MAX_RECENT_ASSISTANT_MESSAGES: usize = 10;

/// What the judge decided, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Stop { reason: String },
}

/// Decides, via a secondary model, whether a truncated or empty assistant
/// reply should be resumed. Holds one loop detector for the lifetime of an
/// orchestration call, fed the last ten assistant messages on every check —
/// separate from the fresh per-call detector used for streaming output.
pub struct AutoContinueJudge {
    pub deadline: Duration,
    history_detector: LoopDetector,
}

impl Default for AutoContinueJudge {
    fn default() -> Self {
        Self {
            deadline: DEADLINE,
            history_detector: LoopDetector::new(),
        }
    }
}

impl AutoContinueJudge {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn judge(
        &self,
        session: &Session,
        model_id: &str,
        summarizer: &dyn InferenceProvider,
    ) -> Verdict {
        if let Some(reason) = self.detect_repetition(session) {
            return Verdict::Stop { reason };
        }

        let request = self.build_request(session, model_id);
        let call = summarizer.complete_with_request(request);

        match tokio::time::timeout(self.deadline, call).await {
            Ok(Ok(response)) => self.parse_verdict(&response.content),
            Ok(Err(e)) => {
                warn!(error = %e, "auto-continue judge call failed, defaulting to stop");
                Verdict::Stop {
                    reason: format!("summarize model call failed: {e}"),
                }
            }
            Err(_) => {
                warn!("auto-continue judge timed out, defaulting to stop");
                Verdict::Stop {
                    reason: "summarize model call timed out".into(),
                }
            }
        }
    }

    /// Feed the last ten assistant messages through a fresh loop detector
    /// before spending an LLM call. Short-circuits the judge call entirely.
    fn detect_repetition(&self, session: &Session) -> Option<String> {
        let recent: Vec<&str> = session
            .messages
            .iter()
            .rev()
            .filter(|m| m.role == Role::Assistant)
            .take(MAX_RECENT_ASSISTANT_MESSAGES)
            .map(|m| m.content.as_str())
            .collect();

        for content in recent.into_iter().rev() {
            if self.history_detector.add_text(content).is_some()
                || self.history_detector.add_text(" ").is_some()
            {
                return Some("detected repetitive text pattern".to_string());
            }
        }
        None
    }

    fn build_request(&self, session: &Session, model_id: &str) -> InferenceRequest {
        let system_prompt = session
            .messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.clone());

        let recent_user_prompts: Vec<String> = session
            .messages
            .iter()
            .rev()
            .filter(|m| m.role == Role::User)
            .take(MAX_RECENT_USER_PROMPTS)
            .map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        let excerpt = self.select_recent_excerpt(session, model_id);

        let mut prompt = String::from(
            "The assistant's last reply was truncated or empty. Decide whether the \
             conversation should continue automatically. Respond with a single word, \
             CONTINUE or STOP, optionally followed by a brief reason.\n\n",
        );
        if let Some(sys) = &system_prompt {
            prompt.push_str("System prompt in effect:\n");
            prompt.push_str(sys);
            prompt.push_str("\n\n");
        }
        prompt.push_str("Recent user prompts:\n");
        for p in &recent_user_prompts {
            prompt.push_str("- ");
            prompt.push_str(p);
            prompt.push('\n');
        }
        prompt.push_str("\nRecent conversation excerpt:\n");
        for m in &excerpt {
            prompt.push_str(&format!("[{}] {}\n", m.role.as_str(), m.content));
        }

        InferenceRequest {
            messages: vec![Message::user(prompt)],
            temperature: None,
            max_tokens: 64,
            system_prompt: None,
            tools: vec![],
            response_format: None,
        }
    }

    /// Tail of the message log bounded to ~1000 tokens; if the tail already
    /// exceeds the budget on its own, include every message anyway.
    fn select_recent_excerpt<'a>(&self, session: &'a Session, model_id: &str) -> Vec<&'a Message> {
        let mut selected: Vec<&Message> = Vec::new();
        let mut used = 0u32;
        for message in session.messages.iter().rev() {
            let tokens = estimate(&message.content, model_id);
            if used >= RECENT_MESSAGE_TOKEN_BUDGET && !selected.is_empty() {
                break;
            }
            selected.push(message);
            used += tokens;
        }
        selected.reverse();
        selected
    }

    fn parse_verdict(&self, content: &str) -> Verdict {
        let first_token = content.split_whitespace().next().unwrap_or("");
        match first_token.to_uppercase().as_str() {
            "CONTINUE" => Verdict::Continue,
            "STOP" => Verdict::Stop {
                reason: content.trim().to_string(),
            },
            _ => {
                let upper = content.to_uppercase();
                if upper.contains("CONTINUE") && !upper.contains("DO NOT CONTINUE") {
                    Verdict::Continue
                } else {
                    Verdict::Stop {
                        reason: content.trim().to_string(),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    use crate::error::ProviderError;
    use crate::types::{InferenceResponse, StopReason};

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
        async fn complete_with_request(
            &self,
            _request: InferenceRequest,
        ) -> Result<InferenceResponse, ProviderError> {
            self.responses
                .lock()
                .await
                .pop_front()
                .unwrap_or(Err(ProviderError::Request("no more responses".into())))
        }
    }

    fn session_with_assistant_replies(replies: &[&str]) -> Session {
        let mut session = Session::new("s1", "/tmp");
        session.push(Message::user("do the thing"));
        for r in replies {
            session.push(Message::assistant(*r, vec![]));
        }
        session
    }

    #[tokio::test]
    async fn continue_on_explicit_verdict() {
        let session = session_with_assistant_replies(&["partial output"]);
        let summarizer = MockSummarizer::new(vec!["CONTINUE"]);
        let judge = AutoContinueJudge::new();
        let verdict = judge.judge(&session, "claude-3-sonnet-20240229", &summarizer).await;
        assert_eq!(verdict, Verdict::Continue);
    }

    #[tokio::test]
    async fn stop_on_explicit_verdict() {
        let session = session_with_assistant_replies(&["partial output"]);
        let summarizer = MockSummarizer::new(vec!["STOP looks complete"]);
        let judge = AutoContinueJudge::new();
        let verdict = judge.judge(&session, "claude-3-sonnet-20240229", &summarizer).await;
        assert!(matches!(verdict, Verdict::Stop { .. }));
    }

    #[tokio::test]
    async fn heuristic_fallback_on_unparseable_response() {
        let session = session_with_assistant_replies(&["partial output"]);
        let summarizer = MockSummarizer::new(vec!["I think you should CONTINUE working on this."]);
        let judge = AutoContinueJudge::new();
        let verdict = judge.judge(&session, "claude-3-sonnet-20240229", &summarizer).await;
        assert_eq!(verdict, Verdict::Continue);
    }

    #[tokio::test]
    async fn heuristic_respects_do_not_continue() {
        let session = session_with_assistant_replies(&["partial output"]);
        let summarizer = MockSummarizer::new(vec!["DO NOT CONTINUE, this is finished."]);
        let judge = AutoContinueJudge::new();
        let verdict = judge.judge(&session, "claude-3-sonnet-20240229", &summarizer).await;
        assert!(matches!(verdict, Verdict::Stop { .. }));
    }

    #[tokio::test]
    async fn repetition_short_circuits_without_llm_call() {
        // No responses queued — if the judge ever fell through to the LLM
        // this would return a "call failed" stop instead.
        let summarizer = MockSummarizer::new(vec![]);
        let judge = AutoContinueJudge::new();

        let mut last_verdict = Verdict::Continue;
        for n in 1..=11 {
            let replies: Vec<&str> = std::iter::repeat("First step is done. Moving to next step.")
                .take(n)
                .collect();
            let session = session_with_assistant_replies(&replies);
            last_verdict = judge.judge(&session, "claude-3-sonnet-20240229", &summarizer).await;
            if matches!(last_verdict, Verdict::Stop { .. }) {
                break;
            }
        }

        match last_verdict {
            Verdict::Stop { reason } => assert!(reason.contains("detected repetitive text pattern")),
            Verdict::Continue => panic!("expected stop"),
        }
    }
}
