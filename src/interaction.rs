use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const MAILBOX_CAPACITY: usize = 16;

/// What kind of action is being authorized. Drives which non-interactive
/// policy rule applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteractionType {
    FileWrite,
    ShellCommand,
    NetworkAccess,
    SandboxExec,
    Other(String),
}

/// One authorization prompt. `payload` carries whatever detail the handler
/// needs to decide (a path, a command line, a domain, ...).
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub request_id: String,
    pub interaction_type: InteractionType,
    pub payload: Value,
    pub timeout: Duration,
}

impl AuthorizationRequest {
    pub fn new(request_id: impl Into<String>, interaction_type: InteractionType, payload: Value) -> Self {
        Self {
            request_id: request_id.into(),
            interaction_type,
            payload,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// The actor's verdict on a request. Exactly one of these is ever delivered
/// per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationDecision {
    Approved,
    Denied { reason: String },
    Cancelled { reason: String },
    TimedOut,
}

impl AuthorizationDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, AuthorizationDecision::Approved)
    }
}

/// Cumulative counters surfaced by `HealthCheck`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActorCounters {
    pub total: u64,
    pub timed_out: u64,
    pub cancelled: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthStatus {
    pub pending: usize,
    pub counters: ActorCounters,
}

/// Decides a single authorization request. Interactive handlers prompt a
/// human (the terminal UI itself is out of scope here); non-interactive
/// handlers apply a static policy.
#[async_trait]
pub trait AuthorizationHandler: Send + Sync {
    async fn handle(&self, request: &AuthorizationRequest) -> AuthorizationDecision;
}

enum ActorMessage {
    Request {
        request: AuthorizationRequest,
        respond_to: oneshot::Sender<AuthorizationDecision>,
    },
    Ack {
        request_id: String,
    },
    Cancel {
        request_id: String,
        reason: String,
    },
    HealthCheck {
        respond_to: oneshot::Sender<HealthStatus>,
    },
    Stop,
}

enum DoneSignal {
    Finished { request_id: String, timed_out: bool },
}

struct PendingEntry {
    cancel_tx: Option<oneshot::Sender<String>>,
}

/// Serializes user-visible authorization prompts across an arbitrary number
/// of concurrent callers. Owns a mailbox; every request gets exactly one
/// response, and `Stop` cancels everything still outstanding rather than
/// leaving callers hanging.
pub struct UserInteractionActor {
    mailbox: mpsc::Sender<ActorMessage>,
    task: tokio::task::JoinHandle<()>,
}

impl UserInteractionActor {
    pub fn spawn(handler: Arc<dyn AuthorizationHandler>) -> Self {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let task = tokio::spawn(run_actor(rx, handler));
        Self { mailbox: tx, task }
    }

    /// Submit a request and await its decision. Non-blocking at the mailbox
    /// layer: a full mailbox simply awaits the send, it never deadlocks the
    /// rest of the actor's handling of in-flight requests.
    pub async fn request(&self, request: AuthorizationRequest) -> AuthorizationDecision {
        let (respond_to, rx) = oneshot::channel();
        if self
            .mailbox
            .send(ActorMessage::Request {
                request,
                respond_to,
            })
            .await
            .is_err()
        {
            return AuthorizationDecision::Cancelled {
                reason: "actor is stopped".into(),
            };
        }
        rx.await.unwrap_or(AuthorizationDecision::Cancelled {
            reason: "actor dropped the response channel".into(),
        })
    }

    /// Client signals the prompt was displayed. Book-keeping only.
    pub async fn ack(&self, request_id: impl Into<String>) {
        let _ = self
            .mailbox
            .send(ActorMessage::Ack {
                request_id: request_id.into(),
            })
            .await;
    }

    pub async fn cancel(&self, request_id: impl Into<String>, reason: impl Into<String>) {
        let _ = self
            .mailbox
            .send(ActorMessage::Cancel {
                request_id: request_id.into(),
                reason: reason.into(),
            })
            .await;
    }

    pub async fn health_check(&self) -> HealthStatus {
        let (respond_to, rx) = oneshot::channel();
        if self
            .mailbox
            .send(ActorMessage::HealthCheck { respond_to })
            .await
            .is_err()
        {
            return HealthStatus {
                pending: 0,
                counters: ActorCounters::default(),
            };
        }
        rx.await.unwrap_or(HealthStatus {
            pending: 0,
            counters: ActorCounters::default(),
        })
    }

    /// Stop the actor. Every pending request receives a cancelled response.
    pub async fn stop(self) {
        let _ = self.mailbox.send(ActorMessage::Stop).await;
        let _ = self.task.await;
    }
}

async fn run_actor(mut mailbox: mpsc::Receiver<ActorMessage>, handler: Arc<dyn AuthorizationHandler>) {
    let mut pending: HashMap<String, PendingEntry> = HashMap::new();
    let mut counters = ActorCounters::default();
    let (done_tx, mut done_rx) = mpsc::channel::<DoneSignal>(MAILBOX_CAPACITY);

    loop {
        tokio::select! {
            msg = mailbox.recv() => {
                match msg {
                    None => break,
                    Some(ActorMessage::Request { request, respond_to }) => {
                        counters.total += 1;
                        let (cancel_tx, cancel_rx) = oneshot::channel::<String>();
                        pending.insert(request.request_id.clone(), PendingEntry { cancel_tx: Some(cancel_tx) });

                        let handler = handler.clone();
                        let done_tx = done_tx.clone();
                        let request_id = request.request_id.clone();
                        let timeout = request.timeout;

                        tokio::spawn(async move {
                            let mut timed_out = false;
                            let decision = tokio::select! {
                                d = handler.handle(&request) => d,
                                reason = cancel_rx => AuthorizationDecision::Cancelled {
                                    reason: reason.unwrap_or_else(|_| "cancelled".into()),
                                },
                                _ = tokio::time::sleep(timeout) => {
                                    timed_out = true;
                                    AuthorizationDecision::TimedOut
                                }
                            };
                            let _ = respond_to.send(decision);
                            let _ = done_tx
                                .send(DoneSignal::Finished { request_id, timed_out })
                                .await;
                        });
                    }
                    Some(ActorMessage::Ack { request_id }) => {
                        if !pending.contains_key(&request_id) {
                            warn!(request_id, "ack for unknown or already-resolved request");
                        }
                    }
                    Some(ActorMessage::Cancel { request_id, reason }) => {
                        if let Some(mut entry) = pending.remove(&request_id) {
                            if let Some(tx) = entry.cancel_tx.take() {
                                let _ = tx.send(reason);
                            }
                            counters.cancelled += 1;
                        }
                    }
                    Some(ActorMessage::HealthCheck { respond_to }) => {
                        let _ = respond_to.send(HealthStatus {
                            pending: pending.len(),
                            counters,
                        });
                    }
                    Some(ActorMessage::Stop) => {
                        for (_, entry) in pending.drain() {
                            if let Some(tx) = entry.cancel_tx {
                                let _ = tx.send("actor stopped".into());
                            }
                        }
                        break;
                    }
                }
            }
            Some(signal) = done_rx.recv() => {
                match signal {
                    DoneSignal::Finished { request_id, timed_out } => {
                        if pending.remove(&request_id).is_some() && timed_out {
                            counters.timed_out += 1;
                        }
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Non-interactive policy handler
// ---------------------------------------------------------------------------

/// Static policy applied when no human is present to prompt. Default is
/// deny; each rule only ever widens access.
#[derive(Debug, Clone, Default)]
pub struct NonInteractivePolicy {
    pub dangerously_allow_all: bool,
    pub allowed_dirs: Vec<String>,
    pub allowed_files: Vec<String>,
    pub allowed_command_prefixes: Vec<String>,
    pub allow_all_network: bool,
    pub allowed_domain_patterns: Vec<String>,
    /// Forces denial of shell/sandbox execution — no human is present to
    /// authorize it even if a command prefix would otherwise match.
    pub require_sandbox_auth: bool,
}

pub struct NonInteractiveHandler {
    pub policy: NonInteractivePolicy,
}

impl NonInteractiveHandler {
    pub fn new(policy: NonInteractivePolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl AuthorizationHandler for NonInteractiveHandler {
    async fn handle(&self, request: &AuthorizationRequest) -> AuthorizationDecision {
        if self.policy.dangerously_allow_all {
            return AuthorizationDecision::Approved;
        }

        match &request.interaction_type {
            InteractionType::ShellCommand | InteractionType::SandboxExec => {
                if self.policy.require_sandbox_auth {
                    return AuthorizationDecision::Denied {
                        reason: "sandbox authorization required, no human present".into(),
                    };
                }
                let command = request.payload["command"].as_str().unwrap_or("");
                if self
                    .policy
                    .allowed_command_prefixes
                    .iter()
                    .any(|prefix| command.starts_with(prefix.as_str()))
                {
                    AuthorizationDecision::Approved
                } else {
                    AuthorizationDecision::Denied {
                        reason: format!("command '{command}' matches no allowed prefix"),
                    }
                }
            }
            InteractionType::FileWrite => {
                let path = request.payload["path"].as_str().unwrap_or("");
                let in_dir = self
                    .policy
                    .allowed_dirs
                    .iter()
                    .any(|dir| Path::new(path).starts_with(dir));
                let is_file = self.policy.allowed_files.iter().any(|f| f == path);
                if in_dir || is_file {
                    AuthorizationDecision::Approved
                } else {
                    AuthorizationDecision::Denied {
                        reason: format!("path '{path}' is outside every allowed directory/file"),
                    }
                }
            }
            InteractionType::NetworkAccess => {
                if self.policy.allow_all_network {
                    return AuthorizationDecision::Approved;
                }
                let domain = request.payload["domain"].as_str().unwrap_or("");
                if self
                    .policy
                    .allowed_domain_patterns
                    .iter()
                    .any(|pattern| domain_matches(pattern, domain))
                {
                    AuthorizationDecision::Approved
                } else {
                    AuthorizationDecision::Denied {
                        reason: format!("domain '{domain}' matches no allowed pattern"),
                    }
                }
            }
            InteractionType::Other(name) => AuthorizationDecision::Denied {
                reason: format!("no policy rule for interaction '{name}'"),
            },
        }
    }
}

/// `*.example.com` matches any subdomain; `example.*` matches any TLD;
/// anything else must match exactly.
fn domain_matches(pattern: &str, domain: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return domain == suffix || domain.ends_with(&format!(".{suffix}"));
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return domain == prefix || domain.starts_with(&format!("{prefix}."));
    }
    pattern == domain
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn req(kind: InteractionType, payload: Value) -> AuthorizationRequest {
        AuthorizationRequest::new("r1", kind, payload)
    }

    #[tokio::test]
    async fn default_policy_denies() {
        let handler = NonInteractiveHandler::new(NonInteractivePolicy::default());
        let decision = handler
            .handle(&req(InteractionType::ShellCommand, json!({"command": "ls"})))
            .await;
        assert!(matches!(decision, AuthorizationDecision::Denied { .. }));
    }

    #[tokio::test]
    async fn dangerously_allow_all_approves_everything() {
        let handler = NonInteractiveHandler::new(NonInteractivePolicy {
            dangerously_allow_all: true,
            ..Default::default()
        });
        let decision = handler
            .handle(&req(InteractionType::ShellCommand, json!({"command": "rm -rf /"})))
            .await;
        assert!(decision.is_approved());
    }

    #[tokio::test]
    async fn shell_command_prefix_allowlist() {
        let handler = NonInteractiveHandler::new(NonInteractivePolicy {
            allowed_command_prefixes: vec!["git ".into(), "ls".into()],
            ..Default::default()
        });
        assert!(
            handler
                .handle(&req(InteractionType::ShellCommand, json!({"command": "git status"})))
                .await
                .is_approved()
        );
        assert!(matches!(
            handler
                .handle(&req(InteractionType::ShellCommand, json!({"command": "rm -rf /"})))
                .await,
            AuthorizationDecision::Denied { .. }
        ));
    }

    #[tokio::test]
    async fn sandbox_auth_required_forces_denial() {
        let handler = NonInteractiveHandler::new(NonInteractivePolicy {
            allowed_command_prefixes: vec!["git".into()],
            require_sandbox_auth: true,
            ..Default::default()
        });
        let decision = handler
            .handle(&req(InteractionType::ShellCommand, json!({"command": "git status"})))
            .await;
        assert!(matches!(decision, AuthorizationDecision::Denied { .. }));
    }

    #[tokio::test]
    async fn file_write_directory_prefix() {
        let handler = NonInteractiveHandler::new(NonInteractivePolicy {
            allowed_dirs: vec!["/workspace".into()],
            ..Default::default()
        });
        assert!(
            handler
                .handle(&req(InteractionType::FileWrite, json!({"path": "/workspace/a.rs"})))
                .await
                .is_approved()
        );
        assert!(matches!(
            handler
                .handle(&req(InteractionType::FileWrite, json!({"path": "/etc/passwd"})))
                .await,
            AuthorizationDecision::Denied { .. }
        ));
    }

    #[test]
    fn domain_wildcard_suffix() {
        assert!(domain_matches("*.example.com", "api.example.com"));
        assert!(domain_matches("*.example.com", "example.com"));
        assert!(!domain_matches("*.example.com", "example.org"));
    }

    #[test]
    fn domain_wildcard_prefix() {
        assert!(domain_matches("example.*", "example.org"));
        assert!(domain_matches("example.*", "example.com"));
        assert!(!domain_matches("example.*", "notexample.com"));
    }

    #[tokio::test]
    async fn network_access_allow_all() {
        let handler = NonInteractiveHandler::new(NonInteractivePolicy {
            allow_all_network: true,
            ..Default::default()
        });
        assert!(
            handler
                .handle(&req(InteractionType::NetworkAccess, json!({"domain": "anything.io"})))
                .await
                .is_approved()
        );
    }

    struct ApproveAfter(Duration);

    #[async_trait]
    impl AuthorizationHandler for ApproveAfter {
        async fn handle(&self, _request: &AuthorizationRequest) -> AuthorizationDecision {
            tokio::time::sleep(self.0).await;
            AuthorizationDecision::Approved
        }
    }

    #[tokio::test]
    async fn exactly_one_response_per_request() {
        let actor = UserInteractionActor::spawn(Arc::new(ApproveAfter(Duration::from_millis(1))));
        let decision = actor
            .request(AuthorizationRequest::new("r1", InteractionType::Other("x".into()), json!({})))
            .await;
        assert!(decision.is_approved());
        actor.stop().await;
    }

    #[tokio::test]
    async fn request_times_out() {
        let actor = UserInteractionActor::spawn(Arc::new(ApproveAfter(Duration::from_secs(10))));
        let decision = actor
            .request(
                AuthorizationRequest::new("r1", InteractionType::Other("x".into()), json!({}))
                    .with_timeout(Duration::from_millis(20)),
            )
            .await;
        assert_eq!(decision, AuthorizationDecision::TimedOut);
        let health = actor.health_check().await;
        assert_eq!(health.counters.timed_out, 1);
        actor.stop().await;
    }

    #[tokio::test]
    async fn cancel_resolves_pending_request() {
        let actor = UserInteractionActor::spawn(Arc::new(ApproveAfter(Duration::from_secs(10))));
        let req_future = actor.request(AuthorizationRequest::new(
            "r1",
            InteractionType::Other("x".into()),
            json!({}),
        ));
        // Give the request a tick to register before cancelling.
        tokio::time::sleep(Duration::from_millis(5)).await;
        actor.cancel("r1", "user dismissed").await;
        let decision = req_future.await;
        assert!(matches!(decision, AuthorizationDecision::Cancelled { .. }));
        actor.stop().await;
    }

    #[tokio::test]
    async fn stop_cancels_all_pending_requests() {
        let actor = UserInteractionActor::spawn(Arc::new(ApproveAfter(Duration::from_secs(10))));
        let (tx, rx) = oneshot::channel();
        let mailbox = actor.mailbox.clone();
        tokio::spawn(async move {
            let (respond_to, rx2) = oneshot::channel();
            let _ = mailbox
                .send(ActorMessage::Request {
                    request: AuthorizationRequest::new("r1", InteractionType::Other("x".into()), json!({})),
                    respond_to,
                })
                .await;
            let decision = rx2.await.unwrap();
            let _ = tx.send(decision);
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        actor.stop().await;
        let decision = rx.await.unwrap();
        assert!(matches!(decision, AuthorizationDecision::Cancelled { .. }));
    }
}
