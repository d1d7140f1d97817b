//! The memory tool: one polymorphic entry point, parsed into [`MemoryAction`].
//!
//! The model calls a single tool named `memory` with an `action` field and
//! action-specific parameters. Parsing happens before dispatch so handlers only
//! ever see well-formed actions.

use memforge_state::{AuditOperation, MAX_CONTENT_CHARS};
use serde_json::{json, Value};

use crate::error::ActionError;
use crate::llm::{ToolCall, ToolSchema};

pub const TOOL_NAME: &str = "memory";

pub const ACTION_NAMES: [&str; 6] = [
    "search",
    "consolidate",
    "update",
    "delete",
    "protect",
    "complete",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryAction {
    /// Case-insensitive substring search over unprotected core memories
    Search { query: String },
    /// Merge two or more memories into one new memory
    Consolidate { ids: Vec<String>, content: String },
    /// Replace a memory's content
    Update { id: String, content: String },
    /// Hard-delete one or more memories
    Delete { ids: Vec<String> },
    /// Mark a memory as protected
    Protect { id: String },
    /// End the session
    Complete { summary: String },
}

impl MemoryAction {
    pub fn name(&self) -> &'static str {
        match self {
            MemoryAction::Search { .. } => "search",
            MemoryAction::Consolidate { .. } => "consolidate",
            MemoryAction::Update { .. } => "update",
            MemoryAction::Delete { .. } => "delete",
            MemoryAction::Protect { .. } => "protect",
            MemoryAction::Complete { .. } => "complete",
        }
    }

    /// Actions that count toward the per-session mutation cap.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            MemoryAction::Consolidate { .. }
                | MemoryAction::Update { .. }
                | MemoryAction::Delete { .. }
        )
    }

    /// Audit operation recorded when an attempt of this action is rejected.
    pub fn audit_operation(&self) -> Option<AuditOperation> {
        audit_operation_for(self.name())
    }

    /// First memory id the action targets, for audit entries.
    pub fn primary_target(&self) -> Option<&str> {
        match self {
            MemoryAction::Update { id, .. } | MemoryAction::Protect { id } => Some(id.as_str()),
            MemoryAction::Consolidate { ids, .. } | MemoryAction::Delete { ids } => {
                ids.first().map(String::as_str)
            }
            MemoryAction::Search { .. } | MemoryAction::Complete { .. } => None,
        }
    }

    /// Parse a tool call. Calls to the `memory` tool carry the action in
    /// `arguments.action`; a call named after an action is accepted as well.
    pub fn from_tool_call(call: &ToolCall) -> Result<Self, ActionError> {
        let name = if call.name == TOOL_NAME {
            match call.arguments.get("action").and_then(Value::as_str) {
                Some(action) => action,
                None => {
                    return Err(ActionError::MissingParam {
                        action: TOOL_NAME.to_string(),
                        param: "action".to_string(),
                    })
                }
            }
        } else {
            call.name.as_str()
        };
        Self::parse(name, &call.arguments)
    }

    pub fn parse(name: &str, args: &Value) -> Result<Self, ActionError> {
        match name {
            "search" => Ok(MemoryAction::Search {
                query: required_str(name, args, "query")?,
            }),
            "consolidate" => {
                let ids = required_ids(name, args, "ids")?;
                if ids.len() < 2 {
                    return Err(invalid(name, "ids", "consolidate needs at least two distinct ids"));
                }
                Ok(MemoryAction::Consolidate {
                    ids,
                    content: required_content(name, args)?,
                })
            }
            "update" => Ok(MemoryAction::Update {
                id: required_str(name, args, "id")?,
                content: required_content(name, args)?,
            }),
            "delete" => {
                let ids = if args.get("ids").is_some() {
                    required_ids(name, args, "ids")?
                } else {
                    vec![required_str(name, args, "id")?]
                };
                Ok(MemoryAction::Delete { ids })
            }
            "protect" => Ok(MemoryAction::Protect {
                id: required_str(name, args, "id")?,
            }),
            "complete" => Ok(MemoryAction::Complete {
                summary: required_str(name, args, "summary")?,
            }),
            other => Err(ActionError::UnknownAction {
                name: other.to_string(),
                valid: ACTION_NAMES.join(", "),
            }),
        }
    }
}

/// Audit operation for a raw action name, if the action writes memory.
pub fn audit_operation_for(name: &str) -> Option<AuditOperation> {
    match name {
        "consolidate" => Some(AuditOperation::ConsolidateCreate),
        "update" => Some(AuditOperation::Update),
        "delete" => Some(AuditOperation::Delete),
        "protect" => Some(AuditOperation::Protect),
        _ => None,
    }
}

/// Action name a tool call refers to, without validating its parameters.
pub fn raw_action_name(call: &ToolCall) -> &str {
    if call.name == TOOL_NAME {
        call.arguments
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or(TOOL_NAME)
    } else {
        &call.name
    }
}

fn invalid(action: &str, param: &str, reason: impl Into<String>) -> ActionError {
    ActionError::InvalidParam {
        action: action.to_string(),
        param: param.to_string(),
        reason: reason.into(),
    }
}

fn missing(action: &str, param: &str) -> ActionError {
    ActionError::MissingParam {
        action: action.to_string(),
        param: param.to_string(),
    }
}

fn required_str(action: &str, args: &Value, param: &str) -> Result<String, ActionError> {
    match args.get(param) {
        None | Some(Value::Null) => Err(missing(action, param)),
        Some(Value::String(s)) => Ok(s.trim().to_string()),
        Some(_) => Err(invalid(action, param, "expected a string")),
    }
}

fn required_content(action: &str, args: &Value) -> Result<String, ActionError> {
    let content = required_str(action, args, "content")?;
    if content.is_empty() {
        return Err(invalid(action, "content", "must not be empty"));
    }
    let chars = content.chars().count();
    if chars > MAX_CONTENT_CHARS {
        return Err(invalid(
            action,
            "content",
            format!("{chars} characters exceeds the limit of {MAX_CONTENT_CHARS}"),
        ));
    }
    Ok(content)
}

/// Non-empty list of ids, duplicates removed, order kept.
fn required_ids(action: &str, args: &Value, param: &str) -> Result<Vec<String>, ActionError> {
    let items = match args.get(param) {
        None | Some(Value::Null) => return Err(missing(action, param)),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(invalid(action, param, "expected an array of ids")),
    };

    let mut ids: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        let id = item
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| invalid(action, param, "every id must be a non-empty string"))?;
        if !ids.iter().any(|existing| existing == id) {
            ids.push(id.to_string());
        }
    }
    if ids.is_empty() {
        return Err(invalid(action, param, "must not be empty"));
    }
    Ok(ids)
}

/// Tool definition offered to the model.
pub fn tool_schema() -> ToolSchema {
    ToolSchema {
        name: TOOL_NAME.to_string(),
        description: "Inspect and refine the owner's durable memories. Choose one action per call: \
            search(query), consolidate(ids, content), update(id, content), delete(id | ids), \
            protect(id), complete(summary)."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ACTION_NAMES,
                    "description": "Which operation to perform"
                },
                "query": {
                    "type": "string",
                    "description": "search: case-insensitive text to look for"
                },
                "id": {
                    "type": "string",
                    "description": "update, delete, protect: target memory id"
                },
                "ids": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "consolidate (two or more), delete (batch): target memory ids"
                },
                "content": {
                    "type": "string",
                    "description": "consolidate, update: new memory text"
                },
                "summary": {
                    "type": "string",
                    "description": "complete: what this session changed and why"
                }
            },
            "required": ["action"]
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(args: Value) -> ToolCall {
        ToolCall::new("c1", TOOL_NAME, args)
    }

    #[test]
    fn test_unknown_action_names_valid_ones() {
        let err = MemoryAction::from_tool_call(&call(json!({"action": "shred"}))).unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, ActionError::UnknownAction { .. }));
        for name in ACTION_NAMES {
            assert!(message.contains(name), "missing {name} in {message}");
        }
    }

    #[test]
    fn test_missing_param_names_action_and_param() {
        let err = MemoryAction::from_tool_call(&call(json!({"action": "update", "id": "m1"})))
            .unwrap_err();
        assert!(matches!(
            err,
            ActionError::MissingParam { ref action, ref param } if action == "update" && param == "content"
        ));
    }

    #[test]
    fn test_delete_accepts_id_or_ids() {
        let single = MemoryAction::from_tool_call(&call(json!({"action": "delete", "id": "a"})))
            .unwrap();
        assert_eq!(single, MemoryAction::Delete { ids: vec!["a".to_string()] });

        let batch = MemoryAction::from_tool_call(&call(
            json!({"action": "delete", "ids": ["a", "b", "a"]}),
        ))
        .unwrap();
        assert_eq!(
            batch,
            MemoryAction::Delete { ids: vec!["a".to_string(), "b".to_string()] }
        );
        assert!(batch.is_mutating());
    }

    #[test]
    fn test_consolidate_needs_two_distinct_ids() {
        let err = MemoryAction::from_tool_call(&call(
            json!({"action": "consolidate", "ids": ["a", "a"], "content": "merged"}),
        ))
        .unwrap_err();
        assert!(matches!(err, ActionError::InvalidParam { .. }));
    }

    #[test]
    fn test_oversized_content_is_rejected() {
        let content = "x".repeat(MAX_CONTENT_CHARS + 1);
        let err = MemoryAction::from_tool_call(&call(
            json!({"action": "update", "id": "a", "content": content}),
        ))
        .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_tool_named_after_action_is_accepted() {
        let action =
            MemoryAction::from_tool_call(&ToolCall::new("c", "protect", json!({"id": "m1"})))
                .unwrap();
        assert_eq!(action, MemoryAction::Protect { id: "m1".to_string() });
        assert!(!action.is_mutating());
    }

    #[test]
    fn test_schema_lists_every_action() {
        let schema = tool_schema();
        let actions = schema.parameters["properties"]["action"]["enum"]
            .as_array()
            .unwrap()
            .len();
        assert_eq!(actions, ACTION_NAMES.len());
    }
}
