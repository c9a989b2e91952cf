use std::collections::BTreeSet;

use serde_json::{json, Value};
use tracing::warn;

use super::handler::{ToolDef, ToolExecutor};
use crate::error::ValidationError;
use crate::provider::InferenceProvider;
use crate::types::{InferenceRequest, Message, Role, ToolCall, ToolSpec, ToolWhitelist};

/// Catalog of available tools: stores specs and executors, resolves the
/// per-turn whitelist, and validates incoming tool calls against it.
pub struct ToolRegistry {
    tools: Vec<ToolDef>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Register a tool spec with its executor.
    pub fn add(mut self, spec: ToolSpec, executor: impl ToolExecutor + 'static) -> Self {
        self.tools.push(ToolDef {
            spec,
            executor: Box::new(executor),
        });
        self
    }

    /// Every registered spec.
    pub fn list_specs(&self) -> Vec<&ToolSpec> {
        self.tools.iter().map(|t| &t.spec).collect()
    }

    pub fn spec(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|t| t.spec.name == name).map(|t| &t.spec)
    }

    /// The executor for a tool name, if registered.
    pub fn get_executor(&self, name: &str) -> Option<&(dyn ToolExecutor)> {
        self.tools
            .iter()
            .find(|t| t.spec.name == name)
            .map(|t| t.executor.as_ref())
    }

    /// Tool schemas visible for one turn: critical tools always, non-critical
    /// tools gated by `whitelist`, plus the `tool_search` meta-tool whenever
    /// anything is hidden so the model can still discover it.
    pub fn schemas_for_turn(&self, whitelist: &ToolWhitelist) -> Vec<Value> {
        let mut visible = Vec::new();
        let mut any_hidden = false;
        for tool in &self.tools {
            if tool.spec.critical || whitelist.allows(&tool.spec.name) {
                visible.push(tool.llm_schema());
            } else {
                any_hidden = true;
            }
        }
        if any_hidden {
            visible.push(Self::search_tool_schema());
        }
        visible
    }

    /// All tool schemas, ignoring whitelisting — used to build the planning
    /// prompt and other contexts where the full catalog matters.
    pub fn schemas(&self) -> Vec<Value> {
        self.tools.iter().map(|t| t.llm_schema()).collect()
    }

    pub async fn execute(&self, name: &str, arguments: &Value) -> Result<String, String> {
        if name == "tool_search" {
            let query = arguments["query"].as_str().unwrap_or("");
            let results = self.search(query);
            return Ok(serde_json::to_string_pretty(&results).unwrap_or_else(|_| "[]".into()));
        }
        let executor = self
            .get_executor(name)
            .ok_or_else(|| format!("unknown tool: {name}"))?;
        executor.execute(arguments).await
    }

    /// Search tools by query. Matches against name and description.
    /// Returns compact summaries (name + description only, no full input_schema)
    /// so the model can discover deferred tools without blowing the context budget.
    pub fn search(&self, query: &str) -> Vec<Value> {
        let query_lower = query.to_lowercase();
        let terms: Vec<&str> = query_lower.split_whitespace().collect();

        self.tools
            .iter()
            .filter(|t| {
                let name = t.spec.name.to_lowercase();
                let desc = t.spec.description.to_lowercase();
                let haystack = format!("{name} {desc}");
                terms.iter().any(|term| haystack.contains(term))
            })
            .map(|t| {
                json!({
                    "name": t.spec.name,
                    "description": t.spec.description,
                })
            })
            .collect()
    }

    /// The schema for the built-in `tool_search` meta-tool.
    pub fn search_tool_schema() -> Value {
        json!({
            "name": "tool_search",
            "description": "Search for available tools by keyword. Use when you need a tool that isn't in your current list. Returns tool names and descriptions matching the query.",
            "input_schema": {
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Search query \u{2014} keywords to match against tool names and descriptions"
                    }
                },
                "required": ["query"]
            }
        })
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.spec.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Distinct MCP server groups among the registered, non-critical tools.
    fn mcp_groups(&self) -> BTreeSet<&str> {
        self.tools
            .iter()
            .filter(|t| !t.spec.critical)
            .filter_map(|t| t.spec.mcp_key.as_deref())
            .collect()
    }

    /// Resolve the per-turn whitelist. Without a summarize model,
    /// every tool is visible — there is nothing to consult.
    pub async fn resolve_whitelist(
        &self,
        model_id: &str,
        summarizer: Option<&dyn InferenceProvider>,
    ) -> ToolWhitelist {
        let Some(summarizer) = summarizer else {
            return ToolWhitelist::All;
        };

        let optional: Vec<&ToolDef> = self.tools.iter().filter(|t| !t.spec.critical).collect();
        if optional.is_empty() {
            return ToolWhitelist::All;
        }

        let request = self.build_whitelist_request(&optional, model_id);
        match summarizer.complete_with_request(request).await {
            Ok(response) => self.parse_whitelist_response(&response.content),
            Err(e) => {
                warn!(error = %e, "tool whitelist call failed, enabling all tools");
                ToolWhitelist::All
            }
        }
    }

    fn build_whitelist_request(&self, optional: &[&ToolDef], model_id: &str) -> InferenceRequest {
        let _ = model_id;
        let mut prompt = String::from(
            "Decide which of the following optional tools should be enabled for this turn. \
             Respond with a JSON array of names: [\"*\"] to enable all, [] to enable none, or \
             a list of specific tool names / MCP group names to enable.\n\nOptional tools:\n",
        );
        for tool in optional {
            prompt.push_str(&format!("- {}: {}\n", tool.spec.name, tool.spec.description));
        }
        let groups = self.mcp_groups();
        if !groups.is_empty() {
            prompt.push_str("\nMCP server groups (enabling a group enables all its tools):\n");
            for g in groups {
                prompt.push_str(&format!("- {g}\n"));
            }
        }

        InferenceRequest {
            messages: vec![Message::user(prompt)],
            temperature: None,
            max_tokens: 512,
            system_prompt: None,
            tools: vec![],
            response_format: None,
        }
    }

    fn parse_whitelist_response(&self, content: &str) -> ToolWhitelist {
        let trimmed = content.trim();
        let names: Vec<String> = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(_) => {
                warn!(response = %content, "unparseable tool whitelist response, enabling all tools");
                return ToolWhitelist::All;
            }
        };

        if names.iter().any(|n| n == "*") {
            return ToolWhitelist::All;
        }

        let mut resolved: BTreeSet<String> = BTreeSet::new();
        for name in &names {
            let is_group = self.tools.iter().any(|t| t.spec.mcp_key.as_deref() == Some(name.as_str()));
            if is_group {
                for tool in self.tools.iter().filter(|t| t.spec.mcp_key.as_deref() == Some(name.as_str())) {
                    resolved.insert(tool.spec.name.clone());
                }
            } else {
                resolved.insert(name.clone());
            }
        }
        ToolWhitelist::Names(resolved)
    }

    /// Validate a tool call against this registry and the turn's whitelist.
    pub fn validate(&self, call: &ToolCall, whitelist: &ToolWhitelist) -> Result<(), ValidationError> {
        let spec = self.spec(&call.name).ok_or_else(|| ValidationError::UnknownTool {
            tool_name: call.name.clone(),
        })?;

        if !spec.critical && !whitelist.allows(&call.name) {
            return Err(ValidationError::NotWhitelisted {
                tool_name: call.name.clone(),
            });
        }

        let properties = &spec.parameters_schema["properties"];
        for param in spec.required_params() {
            match call.arguments.get(&param) {
                None | Some(Value::Null) => {
                    return Err(ValidationError::MissingParam {
                        tool_name: call.name.clone(),
                        missing_param: param,
                    });
                }
                Some(value) => {
                    if let Some(expected) = properties[&param]["type"].as_str() {
                        if !json_type_matches(value, expected) {
                            return Err(ValidationError::WrongType {
                                tool_name: call.name.clone(),
                                missing_param: param,
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Check a JSON value against a JSON-schema primitive type name.
fn json_type_matches(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
