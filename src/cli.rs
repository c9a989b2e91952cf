use clap::Args;

use crate::interaction::NonInteractivePolicy;

/// Flags for configuring a [`NonInteractivePolicy`] from a command line,
/// mirroring the authorization knobs a caller needs when no human is
/// available to answer prompts. Exit codes for a binary built on this crate
/// follow the convention: 0 success, 1 the orchestration terminated with an
/// error, 2 bad arguments.
#[derive(Debug, Clone, Args)]
pub struct NonInteractivePolicyArgs {
    /// Approve every authorization request without consulting any rule below.
    #[arg(long)]
    pub dangerously_allow_all: bool,

    /// Allow shell/sandbox commands starting with this prefix. Repeatable.
    #[arg(long = "allow-command", value_name = "PREFIX")]
    pub allow_command: Vec<String>,

    /// Allow network access to domains matching this pattern
    /// (`*.example.com`, `example.*`, or an exact domain). Repeatable.
    #[arg(long = "allow-domain", value_name = "PATTERN")]
    pub allow_domain: Vec<String>,

    /// Allow file writes under this directory. Repeatable.
    #[arg(long = "allow-dir", value_name = "PATH")]
    pub allow_dir: Vec<String>,

    /// Allow file writes to this exact path. Repeatable.
    #[arg(long = "allow-file", value_name = "PATH")]
    pub allow_file: Vec<String>,

    /// Allow network access to any domain.
    #[arg(long)]
    pub allow_all_network: bool,

    /// Force denial of every shell/sandbox execution regardless of
    /// `--allow-command`, since no human is present to authorize it.
    #[arg(long)]
    pub require_sandbox_auth: bool,
}

impl NonInteractivePolicyArgs {
    pub fn into_policy(self) -> NonInteractivePolicy {
        NonInteractivePolicy {
            dangerously_allow_all: self.dangerously_allow_all,
            allowed_dirs: self.allow_dir,
            allowed_files: self.allow_file,
            allowed_command_prefixes: self.allow_command,
            allow_all_network: self.allow_all_network,
            allowed_domain_patterns: self.allow_domain,
            require_sandbox_auth: self.require_sandbox_auth,
        }
    }
}

/// Process exit codes a binary built on this crate should use.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const ORCHESTRATION_ERROR: i32 = 1;
    pub const BAD_ARGUMENTS: i32 = 2;
}
