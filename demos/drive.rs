//! Minimal illustration of driving an [`Orchestrator`] end to end. The LLM
//! client is a canned mock — this binary exists to show the wiring a real
//! caller needs (policy flags, an authorization actor, event callbacks), not
//! to be a usable agent.

use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use tenon_core::cli::{exit_code, NonInteractivePolicyArgs};
use tenon_core::error::ProviderError;
use tenon_core::interaction::{NonInteractiveHandler, UserInteractionActor};
use tenon_core::orchestrator::{Callbacks, OrchestrationOutcome, Orchestrator, SessionOutcome};
use tenon_core::tools::{ToolExecutor, ToolRegistry};
use tenon_core::types::{InferenceRequest, InferenceResponse, Message, Session, StopReason, ToolSpec, Usage};
use tenon_core::{InferenceProvider, OrchestratorEvent};

#[derive(Parser)]
#[command(name = "drive", about = "Drive the orchestration core against a canned mock model")]
struct Cli {
    /// The task to hand the orchestrator.
    objective: String,

    #[command(flatten)]
    policy: NonInteractivePolicyArgs,
}

/// Always replies with a fixed closing remark after echoing whatever tool
/// the objective mentions, just enough to exercise one full iteration.
struct CannedProvider;

#[async_trait]
impl InferenceProvider for CannedProvider {
    async fn complete_with_request(&self, request: InferenceRequest) -> Result<InferenceResponse, ProviderError> {
        let already_called_echo = request.messages.iter().any(|m| m.tool_calls.iter().any(|c| c.name == "echo"));
        if already_called_echo {
            return Ok(InferenceResponse {
                content: "Done — the echo tool ran successfully.".into(),
                tool_calls: vec![],
                stop_reason: StopReason::EndTurn,
                usage: Some(Usage { input_tokens: 20, output_tokens: 10 }),
                provider_response_id: None,
            });
        }
        Ok(InferenceResponse {
            content: String::new(),
            tool_calls: vec![tenon_core::ToolCall {
                id: "call-1".into(),
                name: "echo".into(),
                arguments: json!({"text": "hello from the demo"}),
            }],
            stop_reason: StopReason::ToolUse,
            usage: Some(Usage { input_tokens: 20, output_tokens: 5 }),
            provider_response_id: None,
        })
    }
}

struct EchoExecutor;

#[async_trait]
impl ToolExecutor for EchoExecutor {
    async fn execute(&self, arguments: &serde_json::Value) -> Result<String, String> {
        Ok(arguments["text"].as_str().unwrap_or_default().to_string())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let policy = cli.policy.into_policy();

    let provider: Arc<dyn InferenceProvider> = Arc::new(CannedProvider);
    let registry = Arc::new(ToolRegistry::new().add(
        ToolSpec {
            name: "echo".into(),
            description: "Echo text back to the caller".into(),
            parameters_schema: json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]}),
            critical: true,
            mcp_key: None,
        },
        EchoExecutor,
    ));
    let interaction = Arc::new(UserInteractionActor::spawn(Arc::new(NonInteractiveHandler::new(policy))));

    let orchestrator = Orchestrator::new(provider, registry, "claude-3-sonnet-20240229").with_interaction(interaction.clone());

    let mut session = Session::new("demo-session", std::env::current_dir().map(|p| p.display().to_string()).unwrap_or_default());
    session.push(Message::user(cli.objective));

    let callbacks = Callbacks {
        on_event: Some(Arc::new(|event: OrchestratorEvent| match event {
            OrchestratorEvent::IterationStart { iteration } => println!("--- iteration {iteration} ---"),
            OrchestratorEvent::ToolCall { name, .. } => println!("calling tool: {name}"),
            OrchestratorEvent::ToolResult { name, output, is_error, .. } => {
                println!("{name} -> {output} (error: {is_error})")
            }
            OrchestratorEvent::Finished { iterations } => println!("finished after {iterations} iteration(s)"),
            OrchestratorEvent::Error { message } => eprintln!("error: {message}"),
            _ => {}
        })),
        on_usage: None,
    };

    // No summarizer is wired up for this demo, so `run_session` skips the
    // planning decision and verification pass and falls straight into the
    // main loop — this is the entry point a real caller drives, though.
    let result = orchestrator.run_session(&mut session, CancellationToken::new(), &callbacks).await;
    Arc::try_unwrap(interaction).ok().unwrap().stop().await;

    match result {
        Ok(SessionOutcome::Direct(OrchestrationOutcome::Completed { text, .. })) => {
            println!("{text}");
            std::process::exit(exit_code::SUCCESS);
        }
        Ok(SessionOutcome::Direct(OrchestrationOutcome::JudgeStopped { reason, .. })) => {
            eprintln!("auto-continue judge stopped the run: {reason}");
            std::process::exit(exit_code::SUCCESS);
        }
        Ok(SessionOutcome::Direct(OrchestrationOutcome::ResourceExhausted { iterations, .. })) => {
            eprintln!("stopped after the {iterations}-iteration cap");
            std::process::exit(exit_code::ORCHESTRATION_ERROR);
        }
        Ok(SessionOutcome::Planned { summaries, .. }) => {
            for summary in &summaries {
                println!("[{:?}] {}: {}", summary.status, summary.task_text, summary.summary);
            }
            std::process::exit(exit_code::SUCCESS);
        }
        Err(e) => {
            eprintln!("orchestration failed: {e}");
            std::process::exit(exit_code::ORCHESTRATION_ERROR);
        }
    }
}
