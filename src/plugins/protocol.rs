//! Plugin protocol definitions
//!
//! Defines the tool definitions a plugin declares and the JSON
//! request/response format spoken with worker-process plugins.

use super::contract::PluginMetadata;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tool definition declared by a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name (e.g., "auth_get")
    pub name: String,
    /// Human-readable description; only the first line is published
    #[serde(default)]
    pub description: String,
    /// Parameter definitions
    #[serde(default)]
    pub parameters: Vec<ParameterDef>,
    /// Whether this tool requires confirmation
    #[serde(default)]
    pub requires_confirmation: bool,
    /// Whether this tool is potentially destructive
    #[serde(default)]
    pub is_destructive: bool,
}

/// Parameter definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Parameter name
    pub name: String,
    /// Parameter type (string, number, boolean, array, object)
    #[serde(rename = "type")]
    pub param_type: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Whether parameter is required
    #[serde(default)]
    pub required: bool,
    /// Default value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

impl ToolDefinition {
    /// Create a definition with no parameters
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters: vec![],
            requires_confirmation: false,
            is_destructive: false,
        }
    }

    /// Add a parameter
    pub fn with_param(mut self, name: &str, param_type: &str, description: &str, required: bool) -> Self {
        self.parameters.push(ParameterDef {
            name: name.to_string(),
            param_type: param_type.to_string(),
            description: description.to_string(),
            required,
            default: None,
        });
        self
    }

    /// The description published to the host: first non-empty line,
    /// or a generated one when the plugin gave none
    pub fn summary(&self, plugin: &str) -> String {
        self.description
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} from {}", self.name, plugin))
    }
}

/// What a request asks the worker to do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginMethod {
    /// Return the worker's registration (metadata and tools)
    Describe,
    /// Lifecycle hook after a successful initialize
    OnLoad,
    /// Lifecycle hook before the worker is stopped
    OnUnload,
    /// Run a tool
    #[default]
    Invoke,
}

impl PluginMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginMethod::Describe => "describe",
            PluginMethod::OnLoad => "on_load",
            PluginMethod::OnUnload => "on_unload",
            PluginMethod::Invoke => "invoke",
        }
    }
}

/// Registration a plugin hands back when it is loaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub metadata: PluginMetadata,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
}

/// Request sent to a plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginRequest {
    /// Request ID for correlation
    pub id: String,
    /// Requested operation
    #[serde(default)]
    pub method: PluginMethod,
    /// Tool name to invoke
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool: String,
    /// Parameters passed to the tool
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
}

/// Response from a plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginResponse {
    /// Request ID this responds to
    pub id: String,
    /// Whether the operation succeeded
    pub success: bool,
    /// Result data (if success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error message (if failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Human-readable output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl PluginResponse {
    /// Create a success response carrying only human-readable output
    pub fn output(id: &str, output: &str) -> Self {
        Self {
            id: id.to_string(),
            success: true,
            result: None,
            error: None,
            output: Some(output.to_string()),
        }
    }

    /// Create an error response
    pub fn error(id: &str, message: &str) -> Self {
        Self {
            id: id.to_string(),
            success: false,
            result: None,
            error: Some(message.to_string()),
            output: None,
        }
    }

    /// Text to show an operator: output, then error, then the raw result
    pub fn display_text(&self) -> String {
        if let Some(output) = &self.output {
            return output.clone();
        }
        if let Some(error) = &self.error {
            return error.clone();
        }
        self.result
            .as_ref()
            .map(|r| r.to_string())
            .unwrap_or_default()
    }
}

impl PluginRequest {
    /// Create a new tool invocation request
    pub fn new(tool: &str, params: HashMap<String, serde_json::Value>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            method: PluginMethod::Invoke,
            tool: tool.to_string(),
            params,
        }
    }

    /// Create a lifecycle request (describe, on_load, on_unload)
    pub fn lifecycle(method: PluginMethod) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            method,
            tool: String::new(),
            params: HashMap::new(),
        }
    }

    /// Get a string parameter
    pub fn get_string(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(|v| v.as_str())
    }

    /// Get a required string parameter
    pub fn require_string(&self, name: &str) -> Result<&str, String> {
        self.get_string(name)
            .ok_or_else(|| format!("Missing required parameter: {}", name))
    }
}
