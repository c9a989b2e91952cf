use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::provider::InferenceProvider;
use crate::tools::ToolRegistry;
use crate::types::{InferenceRequest, Message, ToolCall, ToolSpec};

/// What the summarize model proposed as a fix for a malformed tool call.
#[derive(Debug, Clone, Deserialize)]
struct RewriteResponse {
    rewritten_tool_name: Option<String>,
    #[serde(default)]
    rewritten_params: Value,
    #[serde(default)]
    #[allow(dead_code)]
    explanation: String,
    #[serde(default)]
    should_rewrite: bool,
}

/// Opt-in repair path for a tool call that failed validation. Feature-flagged
/// by whether the caller constructs one at all — an orchestrator with no
/// rewriter configured simply surfaces the original validation error.
pub struct ToolCallRewriter;

impl ToolCallRewriter {
    pub fn new() -> Self {
        Self
    }

    /// Ask the summarize model to repair `call`, given the reason it failed
    /// validation and the full catalog of tools it could legitimately use.
    /// Returns `None` when the model declines, returns an unparseable
    /// response, or names a tool the registry does not recognize — any of
    /// which surfaces the original validation error as final.
    pub async fn rewrite(
        &self,
        call: &ToolCall,
        reason: &str,
        registry: &ToolRegistry,
        summarizer: &dyn InferenceProvider,
    ) -> Option<ToolCall> {
        let request = self.build_request(call, reason, registry.list_specs());
        let response = match summarizer.complete_with_request(request).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "tool-call rewrite request failed");
                return None;
            }
        };

        let cleaned = strip_wrapping(&response.content);
        let parsed: RewriteResponse = match serde_json::from_str(&cleaned) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, raw = %response.content, "unparseable tool-call rewrite response");
                return None;
            }
        };

        if !parsed.should_rewrite {
            return None;
        }
        let name = parsed.rewritten_tool_name?;
        if registry.spec(&name).is_none() {
            warn!(name = %name, "rewrite named a tool not in the registry");
            return None;
        }

        Some(ToolCall {
            id: call.id.clone(),
            name,
            arguments: parsed.rewritten_params,
        })
    }

    fn build_request(&self, call: &ToolCall, reason: &str, available: Vec<&ToolSpec>) -> InferenceRequest {
        let available_tools: Vec<Value> = available
            .iter()
            .map(|s| {
                json!({
                    "name": s.name,
                    "description": s.description,
                    "parameters_schema": s.parameters_schema,
                })
            })
            .collect();

        let payload = json!({
            "invalid_tool_name": call.name,
            "invalid_params": call.arguments,
            "reason": reason,
            "available_tools": available_tools,
        });

        let prompt = format!(
            "A tool call failed validation. Propose a fix.\n\n{}\n\n\
             Respond with strictly this JSON shape, nothing else:\n\
             {{\"rewritten_tool_name\": string|null, \"rewritten_params\": object, \
             \"explanation\": string, \"should_rewrite\": boolean}}",
            serde_json::to_string_pretty(&payload).unwrap_or_default()
        );

        InferenceRequest {
            messages: vec![Message::user(prompt)],
            temperature: None,
            max_tokens: 512,
            system_prompt: None,
            tools: vec![],
            response_format: None,
        }
    }
}

impl Default for ToolCallRewriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip a `<think>...</think>` preamble and any surrounding markdown code
/// fence so a structured-output response can be parsed as plain JSON.
pub(crate) fn strip_wrapping(raw: &str) -> String {
    let mut s = raw.trim();

    while let Some(start) = s.find("<think>") {
        if let Some(end) = s.find("</think>") {
            let after = end + "</think>".len();
            let mut combined = String::new();
            combined.push_str(&s[..start]);
            combined.push_str(&s[after..]);
            return strip_wrapping(combined.trim());
        }
        break;
    }

    if let Some(rest) = s.strip_prefix("```") {
        s = rest;
        if let Some(nl) = s.find('\n') {
            // Drop an optional language tag on the fence's opening line.
            s = &s[nl + 1..];
        }
        if let Some(end) = s.rfind("```") {
            s = &s[..end];
        }
    }

    s.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::types::{InferenceResponse, StopReason, ToolSpec};
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

    fn registry_with(name: &str) -> ToolRegistry {
        struct Noop;
        #[async_trait]
        impl crate::tools::ToolExecutor for Noop {
            async fn execute(&self, _arguments: &Value) -> Result<String, String> {
                Ok("ok".into())
            }
        }
        ToolRegistry::new().add(
            ToolSpec {
                name: name.into(),
                description: "d".into(),
                parameters_schema: json!({"type": "object", "properties": {"path": {"type": "string"}}, "required": ["path"]}),
                critical: false,
                mcp_key: None,
            },
            Noop,
        )
    }

    #[tokio::test]
    async fn accepts_well_formed_rewrite() {
        let registry = registry_with("read_file");
        let summarizer = MockSummarizer::new(vec![
            r#"{"rewritten_tool_name": "read_file", "rewritten_params": {"path": "a.txt"}, "explanation": "fixed name", "should_rewrite": true}"#,
        ]);
        let call = ToolCall { id: "1".into(), name: "read_fil".into(), arguments: json!({"path": "a.txt"}) };
        let rewriter = ToolCallRewriter::new();
        let rewritten = rewriter.rewrite(&call, "unknown tool", &registry, &summarizer).await;
        assert_eq!(rewritten.unwrap().name, "read_file");
    }

    #[tokio::test]
    async fn rejects_when_should_rewrite_is_false() {
        let registry = registry_with("read_file");
        let summarizer = MockSummarizer::new(vec![
            r#"{"rewritten_tool_name": "read_file", "rewritten_params": {}, "explanation": "n/a", "should_rewrite": false}"#,
        ]);
        let call = ToolCall { id: "1".into(), name: "bogus".into(), arguments: json!({}) };
        let rewriter = ToolCallRewriter::new();
        assert!(rewriter.rewrite(&call, "unknown tool", &registry, &summarizer).await.is_none());
    }

    #[tokio::test]
    async fn rejects_unknown_rewritten_tool() {
        let registry = registry_with("read_file");
        let summarizer = MockSummarizer::new(vec![
            r#"{"rewritten_tool_name": "does_not_exist", "rewritten_params": {}, "explanation": "n/a", "should_rewrite": true}"#,
        ]);
        let call = ToolCall { id: "1".into(), name: "bogus".into(), arguments: json!({}) };
        let rewriter = ToolCallRewriter::new();
        assert!(rewriter.rewrite(&call, "unknown tool", &registry, &summarizer).await.is_none());
    }

    #[tokio::test]
    async fn strips_think_block_and_code_fence() {
        let registry = registry_with("read_file");
        let summarizer = MockSummarizer::new(vec![
            "<think>let me consider this</think>\n```json\n{\"rewritten_tool_name\": \"read_file\", \"rewritten_params\": {\"path\": \"a.txt\"}, \"explanation\": \"ok\", \"should_rewrite\": true}\n```",
        ]);
        let call = ToolCall { id: "1".into(), name: "read_fil".into(), arguments: json!({}) };
        let rewriter = ToolCallRewriter::new();
        let rewritten = rewriter.rewrite(&call, "unknown tool", &registry, &summarizer).await;
        assert_eq!(rewritten.unwrap().name, "read_file");
    }

    #[tokio::test]
    async fn unparseable_response_yields_none() {
        let registry = registry_with("read_file");
        let summarizer = MockSummarizer::new(vec!["not json"]);
        let call = ToolCall { id: "1".into(), name: "bogus".into(), arguments: json!({}) };
        let rewriter = ToolCallRewriter::new();
        assert!(rewriter.rewrite(&call, "unknown tool", &registry, &summarizer).await.is_none());
    }
}
