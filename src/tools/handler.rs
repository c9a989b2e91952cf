use async_trait::async_trait;
use serde_json::Value;

use crate::types::ToolSpec;

/// A tool's execution backend. Concrete
/// implementations (shell, filesystem, sandbox, web-fetch, MCP bridges) are
/// out of scope for this crate; callers register whatever implements this
/// trait against a [`ToolRegistry`](super::registry::ToolRegistry).
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, arguments: &Value) -> Result<String, String>;
}

/// A registered tool: its spec (as seen by the LLM and the validator) plus
/// the executor that runs it.
pub struct ToolDef {
    pub spec: ToolSpec,
    pub(crate) executor: Box<dyn ToolExecutor>,
}

impl ToolDef {
    /// The tool schema shape sent to the LLM: name, description, input_schema.
    pub fn llm_schema(&self) -> Value {
        serde_json::json!({
            "name": self.spec.name,
            "description": self.spec.description,
            "input_schema": self.spec.parameters_schema,
        })
    }
}
