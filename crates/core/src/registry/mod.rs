//! C7 — Tool Registry. Typed, schema-validating catalog of invocable
//! tools, keyed by name. The registry is the sole authority for tool
//! names and schemas: a generator may *propose* a call, but only
//! `validate` can turn it into a `ToolCall`.

use std::collections::{BTreeSet, HashMap};

use jsonschema::Validator;
use thiserror::Error;

use crate::types::{SideEffectClass, Tool, ToolCall, RequestId};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("tool already registered: {0}")]
    DuplicateTool(String),
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("arguments do not match schema for {tool}: {detail}")]
    SchemaError { tool: String, detail: String },
    #[error("invalid schema for tool {0}: {1}")]
    InvalidSchema(String, String),
}

struct RegisteredTool {
    tool: Tool,
    validator: Validator,
}

/// Immutable after startup: every tool is registered once via `register`,
/// then only `lookup`/`validate`/`scope_filter` are called for the rest of
/// the process lifetime — no lock is needed on the read path.
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    pub fn register(&mut self, tool: Tool) -> Result<(), RegistryError> {
        if self.tools.contains_key(&tool.name) {
            return Err(RegistryError::DuplicateTool(tool.name.clone()));
        }
        let validator = jsonschema::validator_for(&tool.input_schema)
            .map_err(|e| RegistryError::InvalidSchema(tool.name.clone(), e.to_string()))?;
        let name = tool.name.clone();
        self.tools.insert(name, RegisteredTool { tool, validator });
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<&Tool, RegistryError> {
        self.tools.get(name).map(|r| &r.tool).ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn validate(
        &self,
        name: &str,
        arguments: serde_json::Value,
        issued_by: &str,
        correlation_id: RequestId,
    ) -> Result<ToolCall, RegistryError> {
        let entry = self.tools.get(name).ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let errors: Vec<String> = entry.validator.iter_errors(&arguments).map(|e| e.to_string()).collect();
        if !errors.is_empty() {
            return Err(RegistryError::SchemaError { tool: name.to_string(), detail: errors.join("; ") });
        }
        Ok(ToolCall { tool_name: name.to_string(), arguments, issued_by: issued_by.to_string(), correlation_id })
    }

    pub fn scope_filter(&self, scope_tag: &str) -> BTreeSet<String> {
        self.tools
            .values()
            .filter(|r| r.tool.scope_tags.contains(scope_tag))
            .map(|r| r.tool.name.clone())
            .collect()
    }

    pub fn side_effect_class(&self, name: &str) -> Option<SideEffectClass> {
        self.tools.get(name).map(|r| r.tool.side_effect_class)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn sample_tool(name: &str) -> Tool {
        Tool {
            name: name.to_string(),
            scope_tags: BTreeSet::from(["dashboard".to_string()]),
            input_schema: json!({"type": "object", "properties": {"x": {"type": "integer"}}, "required": ["x"]}),
            output_schema: json!({"type": "object"}),
            idempotent: true,
            side_effect_class: SideEffectClass::Read,
            risk_weight: 0.1,
        }
    }

    #[test]
    fn register_then_lookup() {
        let mut reg = ToolRegistry::new();
        reg.register(sample_tool("check_health")).unwrap();
        assert!(reg.lookup("check_health").is_ok());
        assert!(reg.lookup("missing").is_err());
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut reg = ToolRegistry::new();
        reg.register(sample_tool("t")).unwrap();
        let err = reg.register(sample_tool("t")).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateTool(_)));
    }

    #[test]
    fn validate_rejects_bad_args() {
        let mut reg = ToolRegistry::new();
        reg.register(sample_tool("t")).unwrap();
        let rid = RequestId::new();
        assert!(reg.validate("t", json!({"x": 1}), "router", rid).is_ok());
        assert!(reg.validate("t", json!({"x": "not an int"}), "router", rid).is_err());
    }

    #[test]
    fn scope_filter_returns_matching_tools() {
        let mut reg = ToolRegistry::new();
        reg.register(sample_tool("t1")).unwrap();
        let scoped = reg.scope_filter("dashboard");
        assert!(scoped.contains("t1"));
        assert!(reg.scope_filter("admin").is_empty());
    }
}
