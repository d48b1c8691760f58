// SPDX-License-Identifier: MIT
//! MCP tool catalogue (spec §4.9 supplement, SPEC_FULL §4 "Ambient — MCP
//! tool catalogue"): the JSON-Schema tool definitions returned by
//! `tools/list` for the ten operations the Bridge exposes.
//!
//! Grounded in the teacher's `mcp::tools::clawd_tools()` catalogue shape
//! (`McpToolDef::new(name, description, input_schema)`, one entry per
//! operation) — generalised from ClawDE's task-management tools to Lux's
//! LSP operations.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDef {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

impl McpToolDef {
    fn new(name: &str, description: &str, input_schema: Value) -> Self {
        McpToolDef {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
        }
    }
}

fn uri_schema() -> Value {
    json!({
        "type": "string",
        "description": "Document URI, e.g. file:///path/to/file.go",
    })
}

fn position_properties() -> Value {
    json!({
        "uri": uri_schema(),
        "line": { "type": "integer", "description": "Zero-based line number" },
        "character": { "type": "integer", "description": "Zero-based character offset" },
    })
}

/// The catalogue returned by `tools/list`: hover, definition, references,
/// completion, format, document_symbols, code_action, rename,
/// workspace_symbols, diagnostics (spec §4.9) — no more, no fewer.
pub fn catalogue() -> Vec<McpToolDef> {
    vec![
        McpToolDef::new(
            "hover",
            "Show hover information (type, docs) at a position in a document.",
            json!({
                "type": "object",
                "required": ["uri", "line", "character"],
                "properties": position_properties(),
            }),
        ),
        McpToolDef::new(
            "definition",
            "Find the definition site(s) of the symbol at a position.",
            json!({
                "type": "object",
                "required": ["uri", "line", "character"],
                "properties": position_properties(),
            }),
        ),
        McpToolDef::new(
            "references",
            "Find all references to the symbol at a position.",
            json!({
                "type": "object",
                "required": ["uri", "line", "character"],
                "properties": {
                    "uri": uri_schema(),
                    "line": { "type": "integer" },
                    "character": { "type": "integer" },
                    "include_declaration": {
                        "type": "boolean",
                        "description": "Include the declaration site itself.",
                        "default": true,
                    },
                },
            }),
        ),
        McpToolDef::new(
            "completion",
            "List completion candidates at a position.",
            json!({
                "type": "object",
                "required": ["uri", "line", "character"],
                "properties": position_properties(),
            }),
        ),
        McpToolDef::new(
            "format",
            "Format a document, via an external formatter if one is configured for its filetype, else the backend's LSP formatter.",
            json!({
                "type": "object",
                "required": ["uri"],
                "properties": { "uri": uri_schema() },
            }),
        ),
        McpToolDef::new(
            "document_symbols",
            "List the symbols (functions, types, ...) declared in a document.",
            json!({
                "type": "object",
                "required": ["uri"],
                "properties": { "uri": uri_schema() },
            }),
        ),
        McpToolDef::new(
            "code_action",
            "List available code actions (quick fixes, refactors) for a range.",
            json!({
                "type": "object",
                "required": ["uri", "start_line", "start_character", "end_line", "end_character"],
                "properties": {
                    "uri": uri_schema(),
                    "start_line": { "type": "integer" },
                    "start_character": { "type": "integer" },
                    "end_line": { "type": "integer" },
                    "end_character": { "type": "integer" },
                },
            }),
        ),
        McpToolDef::new(
            "rename",
            "Rename the symbol at a position across the workspace.",
            json!({
                "type": "object",
                "required": ["uri", "line", "character", "new_name"],
                "properties": {
                    "uri": uri_schema(),
                    "line": { "type": "integer" },
                    "character": { "type": "integer" },
                    "new_name": { "type": "string" },
                },
            }),
        ),
        McpToolDef::new(
            "workspace_symbols",
            "Search for symbols by name across the workspace.",
            json!({
                "type": "object",
                "required": ["uri", "query"],
                "properties": {
                    "uri": {
                        "type": "string",
                        "description": "Any document URI in the target workspace, used to pick the backend.",
                    },
                    "query": { "type": "string" },
                },
            }),
        ),
        McpToolDef::new(
            "diagnostics",
            "Show the most recently published diagnostics for a document.",
            json!({
                "type": "object",
                "required": ["uri"],
                "properties": { "uri": uri_schema() },
            }),
        ),
    ]
}
