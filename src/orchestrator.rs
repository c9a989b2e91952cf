use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::autocontinue::{AutoContinueJudge, Verdict};
use crate::compaction::ContextCompactor;
use crate::error::{OrchestratorError, ProviderError, ValidationError};
use crate::events::{OrchestratorEvent, ProviderUsageEvent};
use crate::interaction::{
    AuthorizationRequest, InteractionType, UserInteractionActor,
};
use crate::loop_detector::LoopDetector;
use crate::planning::{BoardExecutor, PlanningDecider, PlanningSubAgent};
use crate::provider::InferenceProvider;
use crate::rewrite::ToolCallRewriter;
use crate::tools::ToolRegistry;
use crate::types::{
    InferenceRequest, Message, PlanningBoard, Role, Session, StopReason, TaskExecutionSummary, ToolCall,
    ToolWhitelist, Usage,
};
use crate::verification::VerificationPass;

/// Hard cap on loop iterations per orchestration call.
pub const MAX_ITERATIONS: u32 = 256;
const RETRY_BUDGET: u32 = 2;
const BASE_BACKOFF: Duration = Duration::from_millis(250);
const DEFAULT_RATE_LIMIT_DELAY: Duration = Duration::from_millis(1_000);

/// Observational callbacks the loop drives as it runs. None of these affect
/// control flow — they exist purely so a caller (UI, telemetry, tests) can
/// watch a run happen.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_event: Option<Arc<dyn Fn(OrchestratorEvent) + Send + Sync>>,
    pub on_usage: Option<Arc<dyn Fn(ProviderUsageEvent) + Send + Sync>>,
}

impl Callbacks {
    pub(crate) fn emit(&self, event: OrchestratorEvent) {
        if let Some(cb) = &self.on_event {
            cb(event);
        }
    }

    pub(crate) fn usage(&self, usage: &Usage) {
        if let Some(cb) = &self.on_usage {
            cb(ProviderUsageEvent {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
            });
        }
    }
}

/// How an orchestration call ended. All three are "normal" returns — only
/// cancellation and unrecoverable provider errors propagate as `Err`.
#[derive(Debug, Clone)]
pub enum OrchestrationOutcome {
    /// The model produced a final reply with no further tool calls.
    Completed { text: String, iterations: u32, usage: Usage },
    /// The auto-continue judge, or repetition detection feeding it, decided
    /// to stop rather than resume a truncated/empty reply.
    JudgeStopped { reason: String, iterations: u32, usage: Usage },
    /// The 256-iteration cap was reached without a natural stop.
    ResourceExhausted { iterations: u32, usage: Usage },
}

impl OrchestrationOutcome {
    pub fn usage(&self) -> &Usage {
        match self {
            OrchestrationOutcome::Completed { usage, .. } => usage,
            OrchestrationOutcome::JudgeStopped { usage, .. } => usage,
            OrchestrationOutcome::ResourceExhausted { usage, .. } => usage,
        }
    }
}

/// How a whole session (as opposed to a single loop call) ended: either the
/// main loop ran directly, or the planning decider routed it through a task
/// board first.
#[derive(Debug, Clone)]
pub enum SessionOutcome {
    Direct(OrchestrationOutcome),
    Planned { board: PlanningBoard, summaries: Vec<TaskExecutionSummary> },
}

/// The central scheduler: call the LLM, emit text, dispatch tool calls,
/// append results, repeat. Single-threaded with respect to one session's
/// conversation — exactly one LLM call is in flight per session at a time.
pub struct Orchestrator {
    pub provider: Arc<dyn InferenceProvider>,
    pub summarizer: Option<Arc<dyn InferenceProvider>>,
    pub registry: Arc<ToolRegistry>,
    pub interaction: Option<Arc<UserInteractionActor>>,
    pub rewriter: Option<ToolCallRewriter>,
    pub model_id: String,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
    pub compactor: ContextCompactor,
    pub auto_continue: AutoContinueJudge,
    pub max_iterations: u32,
    /// MCP servers available to advertise to the planning decider. Purely
    /// informational for `run` — only `run_session` consults it.
    pub mcp_servers: Vec<String>,
    /// Post-hoc check run after `run_session`'s main loop completes. Absent
    /// by default — callers opt in with [`Orchestrator::with_verification`].
    pub verification: Option<VerificationPass>,
}

impl Orchestrator {
    pub fn new(provider: Arc<dyn InferenceProvider>, registry: Arc<ToolRegistry>, model_id: impl Into<String>) -> Self {
        Self {
            provider,
            summarizer: None,
            registry,
            interaction: None,
            rewriter: None,
            model_id: model_id.into(),
            max_tokens: 4096,
            system_prompt: None,
            compactor: ContextCompactor::default(),
            auto_continue: AutoContinueJudge::default(),
            max_iterations: MAX_ITERATIONS,
            mcp_servers: Vec::new(),
            verification: None,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn InferenceProvider>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_interaction(mut self, actor: Arc<UserInteractionActor>) -> Self {
        self.interaction = Some(actor);
        self
    }

    pub fn with_rewriter(mut self, rewriter: ToolCallRewriter) -> Self {
        self.rewriter = Some(rewriter);
        self
    }

    pub fn with_max_iterations(mut self, n: u32) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn with_mcp_servers(mut self, servers: Vec<String>) -> Self {
        self.mcp_servers = servers;
        self
    }

    pub fn with_verification(mut self, verification: VerificationPass) -> Self {
        self.verification = Some(verification);
        self
    }

    /// Run the loop against `session` until a termination condition is hit.
    /// `session` is mutated in place so callers (including the planning board
    /// executor) can inspect it afterward.
    pub async fn run(
        &self,
        session: &mut Session,
        cancel: CancellationToken,
        callbacks: &Callbacks,
    ) -> Result<OrchestrationOutcome, OrchestratorError> {
        let whitelist = self
            .registry
            .resolve_whitelist(&self.model_id, self.summarizer.as_deref())
            .await;

        let mut total_usage = Usage::default();
        let mut final_text = String::new();

        for iteration in 0..self.max_iterations {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }
            callbacks.emit(OrchestratorEvent::IterationStart { iteration });

            let request = self.build_request(session, &whitelist);
            let (response, loop_detection) = match self.call_with_retry(request, &cancel, callbacks).await {
                Ok(pair) => pair,
                Err(e) => {
                    callbacks.emit(OrchestratorEvent::Error { message: e.to_string() });
                    return Err(e);
                }
            };

            if let Some(detection) = loop_detection {
                let e = OrchestratorError::LoopDetected {
                    pattern: detection.pattern,
                    count: detection.count,
                };
                callbacks.emit(OrchestratorEvent::Error { message: e.to_string() });
                return Err(e);
            }

            total_usage.accumulate(&response.usage.clone().unwrap_or_default());
            callbacks.usage(&total_usage);

            if !response.content.is_empty() {
                final_text = response.content.clone();
            }

            session.push(Message::assistant(response.content.clone(), response.tool_calls.clone()));

            let terminal_stop = response.tool_calls.is_empty()
                && !response.content.is_empty()
                && matches!(response.stop_reason, StopReason::Stop | StopReason::EndTurn);

            if terminal_stop {
                callbacks.emit(OrchestratorEvent::Finished { iterations: iteration + 1 });
                info!(iterations = iteration + 1, "orchestration completed");
                return Ok(OrchestrationOutcome::Completed {
                    text: final_text,
                    iterations: iteration + 1,
                    usage: total_usage,
                });
            }

            if matches!(response.stop_reason, StopReason::Length) || response.content.is_empty() {
                let verdict = match &self.summarizer {
                    Some(summarizer) => self.auto_continue.judge(session, &self.model_id, summarizer.as_ref()).await,
                    None => Verdict::Stop {
                        reason: "no summarize model configured for auto-continue".into(),
                    },
                };
                if let Verdict::Stop { reason } = verdict {
                    callbacks.emit(OrchestratorEvent::Finished { iterations: iteration + 1 });
                    return Ok(OrchestrationOutcome::JudgeStopped {
                        reason,
                        iterations: iteration + 1,
                        usage: total_usage,
                    });
                }
            }

            for call in &response.tool_calls {
                if cancel.is_cancelled() {
                    callbacks.emit(OrchestratorEvent::Error { message: "cancelled".into() });
                    return Err(OrchestratorError::Cancelled);
                }
                self.dispatch_tool_call(call, &whitelist, session, callbacks).await;
            }

            if cancel.is_cancelled() {
                callbacks.emit(OrchestratorEvent::Error { message: "cancelled".into() });
                return Err(OrchestratorError::Cancelled);
            }

            if let Some(summarizer) = &self.summarizer {
                match self.compactor.maybe_compact(session, &self.model_id, summarizer.as_ref()).await {
                    Ok(Some((pre, post))) => callbacks.emit(OrchestratorEvent::Compacted { pre_tokens: pre, post_tokens: post }),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "compaction failed, continuing uncompacted"),
                }
            } else {
                self.compactor.micro_compact(session, &self.model_id);
            }
        }

        callbacks.emit(OrchestratorEvent::Finished { iterations: self.max_iterations });
        session.push(Message::system(format!(
            "Orchestration stopped after reaching the {}-iteration cap.",
            self.max_iterations
        )));
        Ok(OrchestrationOutcome::ResourceExhausted {
            iterations: self.max_iterations,
            usage: total_usage,
        })
    }

    /// Drive a whole session from its objective to a final result: consult
    /// the planning decider first, run a planning board if it says to,
    /// otherwise fall straight into the main loop — then, if configured,
    /// run the verification pass against whatever the main loop produced.
    ///
    /// A planning board's tasks already run the main loop once per task
    /// (via `BoardExecutor`), so verification only re-enters the `Direct`
    /// branch; a board's completion is taken as final.
    pub async fn run_session(
        &self,
        session: &mut Session,
        cancel: CancellationToken,
        callbacks: &Callbacks,
    ) -> Result<SessionOutcome, OrchestratorError> {
        let objective = session.objective().map(|m| m.content.clone()).unwrap_or_default();

        if let Some(summarizer) = &self.summarizer {
            let decider = PlanningDecider::new();
            let decision = decider.decide(&objective, &self.mcp_servers, summarizer.as_ref()).await;

            if decision.run_planning {
                info!(reason = %decision.reason, "planning decider chose to run a task board");
                let sub_agent = PlanningSubAgent::new();
                match sub_agent.produce_board(&objective, summarizer.as_ref()).await {
                    Ok(mut board) => {
                        let executor = BoardExecutor::new(self);
                        let summaries = executor.run(&mut board, &objective, cancel, callbacks).await;
                        return Ok(SessionOutcome::Planned { board, summaries });
                    }
                    Err(e) => {
                        warn!(error = %e, "planning sub-agent failed, falling back to direct execution");
                    }
                }
            }
        }

        let outcome = self.run(session, cancel.clone(), callbacks).await?;
        let outcome = match (&self.verification, &self.summarizer) {
            (Some(pass), Some(summarizer)) => {
                pass.maybe_reenter(self, session, outcome, summarizer.as_ref(), cancel, callbacks).await?
            }
            _ => outcome,
        };
        Ok(SessionOutcome::Direct(outcome))
    }

    fn build_request(&self, session: &Session, whitelist: &ToolWhitelist) -> InferenceRequest {
        InferenceRequest {
            messages: session.messages.clone(),
            temperature: None,
            max_tokens: self.max_tokens,
            system_prompt: self.system_prompt.clone(),
            tools: self.registry.schemas_for_turn(whitelist),
            response_format: None,
        }
    }

    /// Stream the call through a fresh per-call loop detector. Transport
    /// errors retry up to `RETRY_BUDGET` times with exponential backoff;
    /// 4xx other than 429 and parse failures are fatal immediately.
    async fn call_with_retry(
        &self,
        request: InferenceRequest,
        cancel: &CancellationToken,
        callbacks: &Callbacks,
    ) -> Result<(crate::types::InferenceResponse, Option<crate::loop_detector::LoopDetection>), OrchestratorError> {
        let mut attempt = 0;
        loop {
            let detector = LoopDetector::new();
            let detection: Arc<Mutex<Option<crate::loop_detector::LoopDetection>>> = Arc::new(Mutex::new(None));
            let detection_for_closure = detection.clone();
            let callbacks_clone = callbacks.clone();

            let on_chunk = move |chunk: &str| {
                callbacks_clone.emit(OrchestratorEvent::Progress { chunk: chunk.to_string() });
                if detection_for_closure.lock().unwrap().is_none() {
                    if let Some(d) = detector.add_text(chunk) {
                        *detection_for_closure.lock().unwrap() = Some(d);
                    }
                }
            };

            let result = tokio::select! {
                r = self.provider.stream_with_request(request.clone(), cancel.clone(), &on_chunk) => r,
                _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            };

            match result {
                Ok(response) => {
                    let found = detection.lock().unwrap().clone();
                    return Ok((response, found));
                }
                Err(e) if e.is_retryable() && attempt < RETRY_BUDGET => {
                    let delay = match &e {
                        ProviderError::RateLimited { retry_after_ms } => {
                            Duration::from_millis(retry_after_ms.unwrap_or(DEFAULT_RATE_LIMIT_DELAY.as_millis() as u64))
                        }
                        _ => BASE_BACKOFF * 2u32.pow(attempt),
                    };
                    warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "retrying provider call");
                    attempt += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                    }
                }
                Err(e) => return Err(OrchestratorError::Provider(e)),
            }
        }
    }

    async fn dispatch_tool_call(
        &self,
        call: &ToolCall,
        whitelist: &ToolWhitelist,
        session: &mut Session,
        callbacks: &Callbacks,
    ) {
        callbacks.emit(OrchestratorEvent::ToolCall {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        });

        let validated = match self.registry.validate(call, whitelist) {
            Ok(()) => Some(call.clone()),
            Err(e) => self.recover_validation_failure(call, e, whitelist, session, callbacks).await,
        };

        let Some(call) = validated else {
            return;
        };

        if let Some(interaction_type) = self.authorization_kind_for(&call.name) {
            match self.authorize(&call, interaction_type, callbacks).await {
                Ok(()) => {}
                Err(reason) => {
                    self.append_tool_error(session, &call, &format!("authorization denied: {reason}"), callbacks);
                    return;
                }
            }
        }

        let outcome = self.registry.execute(&call.name, &call.arguments).await;
        match outcome {
            Ok(output) => {
                callbacks.emit(OrchestratorEvent::ToolResult {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    output: output.clone(),
                    is_error: false,
                });
                session.push(Message::tool_result(call.id.clone(), call.name.clone(), output));
            }
            Err(error) => self.append_tool_error(session, &call, &error, callbacks),
        }
    }

    async fn recover_validation_failure(
        &self,
        call: &ToolCall,
        error: ValidationError,
        whitelist: &ToolWhitelist,
        session: &mut Session,
        callbacks: &Callbacks,
    ) -> Option<ToolCall> {
        let (Some(rewriter), Some(summarizer)) = (&self.rewriter, &self.summarizer) else {
            self.append_tool_error(session, call, &error.to_string(), callbacks);
            return None;
        };

        let Some(rewritten) = rewriter.rewrite(call, &error.to_string(), &self.registry, summarizer.as_ref()).await else {
            self.append_tool_error(session, call, &error.to_string(), callbacks);
            return None;
        };

        match self.registry.validate(&rewritten, whitelist) {
            Ok(()) => Some(rewritten),
            Err(second_error) => {
                self.append_tool_error(session, call, &second_error.to_string(), callbacks);
                None
            }
        }
    }

    fn append_tool_error(&self, session: &mut Session, call: &ToolCall, message: &str, callbacks: &Callbacks) {
        callbacks.emit(OrchestratorEvent::ToolResult {
            id: call.id.clone(),
            name: call.name.clone(),
            output: message.to_string(),
            is_error: true,
        });
        session.push(Message::tool_result(call.id.clone(), call.name.clone(), message.to_string()));
    }

    /// Heuristic mapping from tool name to the kind of authorization it
    /// needs, since concrete tool executors (and therefore their real
    /// authorization requirements) are out of scope for this crate.
    fn authorization_kind_for(&self, tool_name: &str) -> Option<InteractionType> {
        let name = tool_name.to_lowercase();
        if name.contains("write") || name.contains("edit") || name.contains("delete") {
            Some(InteractionType::FileWrite)
        } else if name.contains("sandbox") {
            Some(InteractionType::SandboxExec)
        } else if name.contains("shell") || name.contains("exec") || name.contains("command") {
            Some(InteractionType::ShellCommand)
        } else if name.contains("fetch") || name.contains("web") || name.contains("network") {
            Some(InteractionType::NetworkAccess)
        } else {
            None
        }
    }

    async fn authorize(&self, call: &ToolCall, kind: InteractionType, callbacks: &Callbacks) -> Result<(), String> {
        let Some(actor) = &self.interaction else {
            return Err("no authorization actor configured".into());
        };

        let request_id = call.id.clone();
        callbacks.emit(OrchestratorEvent::AuthorizationRequested {
            request_id: request_id.clone(),
            interaction_type: format!("{kind:?}"),
        });

        let request = AuthorizationRequest::new(request_id.clone(), kind, call.arguments.clone());
        let decision = actor.request(request).await;
        let approved = decision.is_approved();
        callbacks.emit(OrchestratorEvent::AuthorizationResolved { request_id, approved });

        if approved {
            Ok(())
        } else {
            Err(match decision {
                crate::interaction::AuthorizationDecision::Denied { reason } => reason,
                crate::interaction::AuthorizationDecision::Cancelled { reason } => reason,
                crate::interaction::AuthorizationDecision::TimedOut => "authorization timed out".into(),
                crate::interaction::AuthorizationDecision::Approved => unreachable!(),
            })
        }
    }
}
