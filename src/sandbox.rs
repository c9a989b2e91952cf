use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::provider::InferenceProvider;
use crate::types::{InferenceRequest, Message};

/// Patterns that reference a process-spawning primitive the sandbox forbids.
static BANNED_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r#"["']os/exec["']"#,
        r"\bexec\.Command\b",
        r"\bexec\.CommandContext\b",
        r"\bos\.StartProcess\b",
        r"\bsyscall\.Exec\b",
        r"\bsyscall\.ForkExec\b",
        r"\.Run\(\s*\)",
        r"\.Output\(\s*\)",
        r"\.CombinedOutput\(\s*\)",
        r"\.Start\(\s*\)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern compiles"))
    .collect()
});

static PRINT_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^(fmt\.Print(ln)?|print(ln)?)\(\s*(.*?)\s*\)$"#).expect("static pattern compiles")
});

static STRING_LITERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r#""((?:[^"\\]|\\.)*)""#).expect("static pattern compiles"));

fn references_banned_call(code: &str) -> bool {
    BANNED_PATTERNS.iter().any(|re| re.is_match(code))
}

fn has_main_entry_point(code: &str) -> bool {
    code.contains("func main(")
}

fn has_package_declaration(code: &str) -> bool {
    code.lines().any(|l| l.trim_start().starts_with("package "))
}

/// Extract the body of `func main() { ... }` by brace counting. Returns
/// `None` if no balanced `main` function is found.
fn extract_main_body(code: &str) -> Option<String> {
    let start = code.find("func main(")?;
    let brace_start = code[start..].find('{')? + start;
    let mut depth = 0i32;
    let mut end = None;
    for (i, c) in code[brace_start..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(brace_start + i);
                    break;
                }
            }
            _ => {}
        }
    }
    let end = end?;
    Some(code[brace_start + 1..end].to_string())
}

/// Result of the print-only fast path.
pub struct PrintOnlyResult {
    pub text: String,
}

/// Correctness-and-latency optimization: when `main` is nothing but
/// print statements over literal strings and no sandbox API is referenced
/// anywhere in the program, skip execution entirely and return the
/// concatenated literal text. Also closes off the trivial prompt-injection
/// vector of a sandboxed "compute" that just echoes attacker-controlled text.
pub fn detect_print_only(code: &str) -> Option<PrintOnlyResult> {
    if code.contains("Sandbox") || code.contains("ExecuteCommand") {
        return None;
    }
    let body = extract_main_body(code)?;

    let mut out = String::new();
    for raw_stmt in body.split(';').flat_map(|s| s.split('\n')) {
        let stmt = raw_stmt.trim().trim_end_matches(';').trim();
        if stmt.is_empty() {
            continue;
        }
        let caps = PRINT_CALL.captures(stmt)?;
        let args = caps.get(4).map(|m| m.as_str()).unwrap_or("");
        let is_println = caps.get(1).map(|m| m.as_str()).unwrap_or("").ends_with("ln");

        let arg_list: Vec<&str> = split_top_level_commas(args);
        let mut literals = Vec::with_capacity(arg_list.len());
        for arg in &arg_list {
            let trimmed = arg.trim();
            if trimmed.is_empty() {
                continue;
            }
            let lit = STRING_LITERAL.captures(trimmed)?;
            if lit.get(0).map(|m| m.as_str()) != Some(trimmed) {
                // Argument isn't *purely* a string literal (e.g. a variable
                // or concatenation expression) — not a print-only program.
                return None;
            }
            literals.push(unescape(lit.get(1).unwrap().as_str()));
        }

        out.push_str(&literals.join(" "));
        if is_println {
            out.push('\n');
        }
    }

    Some(PrintOnlyResult { text: out })
}

fn split_top_level_commas(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut start = 0usize;
    let bytes = s.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        match bytes[i] as char {
            '"' if !in_string => in_string = true,
            '"' if in_string && (i == 0 || bytes[i - 1] != b'\\') => in_string = false,
            '(' if !in_string => depth += 1,
            ')' if !in_string => depth -= 1,
            ',' if !in_string && depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    if start < s.len() || !s.is_empty() {
        out.push(&s[start..]);
    }
    out
}

fn unescape(s: &str) -> String {
    s.replace("\\n", "\n").replace("\\t", "\t").replace("\\\"", "\"")
}

/// Error surfaced when a rewrite attempt is rejected.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SandboxRewriteError {
    #[error("rewrite still references a banned primitive")]
    StillBanned,
    #[error("rewrite is missing a main entry point")]
    MissingMain,
    #[error("rewrite is missing a package declaration")]
    MissingPackage,
    #[error("summarize model call failed: {0}")]
    ProviderFailed(String),
}

/// Detects and rewrites disallowed process-spawning code before a sandbox
/// dispatch, and repairs code the sandbox failed to compile.
pub struct SandboxCodeRewriter;

impl SandboxCodeRewriter {
    pub fn new() -> Self {
        Self
    }

    pub fn needs_disallowed_call_rewrite(&self, code: &str) -> bool {
        references_banned_call(code)
    }

    /// Ask the summarize model to rewrite code that references a banned
    /// process-spawning primitive so it instead uses the sandbox's
    /// allow-listed `ExecuteCommand(argv, stdin) -> (stdout, stderr, exit_code)`
    /// primitive.
    pub async fn rewrite_disallowed_calls(
        &self,
        code: &str,
        summarizer: &dyn InferenceProvider,
    ) -> Result<String, SandboxRewriteError> {
        let prompt = format!(
            "The following sandboxed program references a disallowed process-spawning \
             primitive. Rewrite it to use only the sandbox-provided \
             `ExecuteCommand(argv []string, stdin string) (stdout string, stderr string, exitCode int)` \
             primitive (and other sandbox-provided functions) instead of any direct OS \
             process spawning. Preserve the program's intent. Return only the rewritten \
             source code, nothing else.\n\n```\n{code}\n```"
        );
        let rewritten = self.call_summarizer(prompt, summarizer).await?;

        if references_banned_call(&rewritten) {
            return Err(SandboxRewriteError::StillBanned);
        }
        if !has_main_entry_point(&rewritten) {
            return Err(SandboxRewriteError::MissingMain);
        }
        Ok(rewritten)
    }

    /// Single-shot repair guided by a compiler diagnostic. Never retried —
    /// a second compilation failure bubbles out as a tool error.
    pub async fn rewrite_after_compile_error(
        &self,
        code: &str,
        diagnostic: &str,
        summarizer: &dyn InferenceProvider,
    ) -> Result<String, SandboxRewriteError> {
        let prompt = format!(
            "The following sandboxed program failed to compile. Repair it using the \
             compiler diagnostic below. Return only the corrected source code, nothing \
             else.\n\nDiagnostic:\n{diagnostic}\n\nProgram:\n```\n{code}\n```"
        );
        let rewritten = self.call_summarizer(prompt, summarizer).await?;

        if !has_main_entry_point(&rewritten) {
            return Err(SandboxRewriteError::MissingMain);
        }
        if !has_package_declaration(&rewritten) {
            return Err(SandboxRewriteError::MissingPackage);
        }
        Ok(rewritten)
    }

    async fn call_summarizer(
        &self,
        prompt: String,
        summarizer: &dyn InferenceProvider,
    ) -> Result<String, SandboxRewriteError> {
        let request = InferenceRequest {
            messages: vec![Message::user(prompt)],
            temperature: None,
            max_tokens: 4096,
            system_prompt: None,
            tools: vec![],
            response_format: None,
        };
        let response = summarizer
            .complete_with_request(request)
            .await
            .map_err(|e| {
                warn!(error = %e, "sandbox rewrite request failed");
                SandboxRewriteError::ProviderFailed(e.to_string())
            })?;
        Ok(strip_code_fence(&response.content))
    }
}

impl Default for SandboxCodeRewriter {
    fn default() -> Self {
        Self::new()
    }
}

fn strip_code_fence(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = if let Some(nl) = rest.find('\n') { &rest[nl + 1..] } else { rest };
        if let Some(end) = rest.rfind("```") {
            return rest[..end].trim().to_string();
        }
        return rest.trim().to_string();
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
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

    #[test]
    fn print_only_detects_literal_prints() {
        let code = r#"
package main

func main() {
	fmt.Println("hello")
	fmt.Println("world")
}
"#;
        let result = detect_print_only(code).expect("should detect print-only");
        assert_eq!(result.text, "hello\nworld\n");
    }

    #[test]
    fn print_only_rejects_variable_args() {
        let code = r#"
func main() {
	x := compute()
	fmt.Println(x)
}
"#;
        assert!(detect_print_only(code).is_none());
    }

    #[test]
    fn print_only_rejects_when_sandbox_api_referenced() {
        let code = r#"
func main() {
	fmt.Println("hello")
	ExecuteCommand([]string{"ls"}, "")
}
"#;
        assert!(detect_print_only(code).is_none());
    }

    #[test]
    fn detects_banned_exec_command() {
        let code = r#"
import "os/exec"
func main() {
	cmd := exec.Command("ls")
	cmd.Run()
}
"#;
        let rewriter = SandboxCodeRewriter::new();
        assert!(rewriter.needs_disallowed_call_rewrite(code));
    }

    #[test]
    fn clean_code_does_not_need_rewrite() {
        let code = r#"
func main() {
	out, _, _ := ExecuteCommand([]string{"ls"}, "")
	fmt.Println(out)
}
"#;
        let rewriter = SandboxCodeRewriter::new();
        assert!(!rewriter.needs_disallowed_call_rewrite(code));
    }

    #[tokio::test]
    async fn rewrite_disallowed_calls_accepts_clean_result() {
        let rewriter = SandboxCodeRewriter::new();
        let summarizer = MockSummarizer::new(vec![
            "```go\nfunc main() {\n\tout, _, _ := ExecuteCommand([]string{\"ls\"}, \"\")\n\tfmt.Println(out)\n}\n```",
        ]);
        let rewritten = rewriter
            .rewrite_disallowed_calls("func main() { exec.Command(\"ls\").Run() }", &summarizer)
            .await
            .expect("should accept clean rewrite");
        assert!(rewritten.contains("ExecuteCommand"));
    }

    #[tokio::test]
    async fn rewrite_disallowed_calls_rejects_if_still_banned() {
        let rewriter = SandboxCodeRewriter::new();
        let summarizer = MockSummarizer::new(vec!["func main() { exec.Command(\"ls\").Run() }"]);
        let err = rewriter
            .rewrite_disallowed_calls("func main() { exec.Command(\"ls\").Run() }", &summarizer)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxRewriteError::StillBanned));
    }

    #[tokio::test]
    async fn rewrite_disallowed_calls_rejects_missing_main() {
        let rewriter = SandboxCodeRewriter::new();
        let summarizer = MockSummarizer::new(vec!["func helper() { return }"]);
        let err = rewriter
            .rewrite_disallowed_calls("func main() { exec.Command(\"ls\").Run() }", &summarizer)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxRewriteError::MissingMain));
    }

    #[tokio::test]
    async fn compile_error_rewrite_rejects_missing_package() {
        let rewriter = SandboxCodeRewriter::new();
        let summarizer = MockSummarizer::new(vec!["func main() {}"]);
        let err = rewriter
            .rewrite_after_compile_error("broken code", "syntax error", &summarizer)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxRewriteError::MissingPackage));
    }

    #[tokio::test]
    async fn compile_error_rewrite_accepts_valid_result() {
        let rewriter = SandboxCodeRewriter::new();
        let summarizer = MockSummarizer::new(vec!["package main\n\nfunc main() {}\n"]);
        let rewritten = rewriter
            .rewrite_after_compile_error("broken code", "syntax error", &summarizer)
            .await
            .expect("should accept");
        assert!(rewritten.contains("package main"));
    }
}
