use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A tool invocation requested by a model, in either dialect.
///
/// Streaming deltas carry `index` so argument fragments can be accumulated
/// per call; buffered responses omit it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: ToolCallKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp: Option<McpCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallKind {
    #[default]
    Function,
    Mcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Providers send arguments either as a JSON string or as an object;
    /// streaming always uses string fragments.
    #[serde(default)]
    pub arguments: ToolArguments,
}

/// Remote MCP server binding carried on `type: "mcp"` tool calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpCall {
    pub server_label: String,
    pub server_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_approval: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

/// Tool-call arguments as they appear on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolArguments {
    Text(String),
    Json(serde_json::Value),
}

impl Default for ToolArguments {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl ToolArguments {
    /// The single-string projection: strings pass through, objects are
    /// JSON-encoded. Streaming accumulation always works on this form.
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Json(v) => v.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(s) => s.is_empty(),
            Self::Json(v) => v.is_null(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_accept_string_or_object() {
        let s: ToolArguments = serde_json::from_str(r#""{\"a\":1}""#).unwrap();
        assert_eq!(s.as_text(), r#"{"a":1}"#);

        let o: ToolArguments = serde_json::from_str(r#"{"a":1}"#).unwrap();
        assert_eq!(o.as_text(), r#"{"a":1}"#);
    }

    #[test]
    fn tool_call_roundtrip_preserves_index() {
        let raw = r#"{"id":"call_1","type":"function","function":{"name":"f","arguments":"{}"},"index":2}"#;
        let tc: ToolCall = serde_json::from_str(raw).unwrap();
        assert_eq!(tc.index, Some(2));
        let back = serde_json::to_value(&tc).unwrap();
        assert_eq!(back["index"], 2);
        assert_eq!(back["type"], "function");
    }

    #[test]
    fn mcp_call_minimal_shape() {
        let raw = r#"{"id":"m1","type":"mcp","mcp":{"server_label":"docs","server_url":"https://mcp.example.com"}}"#;
        let tc: ToolCall = serde_json::from_str(raw).unwrap();
        assert_eq!(tc.kind, ToolCallKind::Mcp);
        assert!(tc.mcp.unwrap().allowed_tools.is_empty());
    }
}
