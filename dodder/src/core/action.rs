//! Strict parse-and-validate boundary for backend replies.
//!
//! A reply becomes an [`Action`] only if it is exactly one JSON object that
//! conforms to `schemas/action.schema.json`, carries a command and directory
//! exactly when it asks to run one, and passes the deny-list policy. Anything
//! else is rejected whole; nothing is coerced.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jsonschema::{Draft, Validator};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::policy::check_command;
use crate::core::types::{Action, ActionKind, ActionStep, ActionType};
use crate::error::ValidationError;

pub const ACTION_SCHEMA: &str = include_str!("../../schemas/action.schema.json");

/// Wire shape of a backend reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireAction {
    #[serde(rename = "type")]
    kind: ActionKind,
    thought: String,
    action: WireStep,
    #[serde(rename = "nextMessage")]
    next_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireStep {
    #[serde(rename = "type")]
    action_type: ActionType,
    cmd: Option<String>,
    cwd: Option<String>,
    reason: String,
    msg: String,
}

/// Compiled validator for raw backend replies.
pub struct ActionValidator {
    schema: Validator,
}

impl ActionValidator {
    pub fn new() -> Result<Self> {
        let schema_json: Value =
            serde_json::from_str(ACTION_SCHEMA).context("parse action schema json")?;
        let schema = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&schema_json)
            .context("compile action schema")?;
        Ok(Self { schema })
    }

    /// Validate one raw reply with no project root known. Relative working
    /// directories then leave relative command targets unresolved.
    pub fn validate(&self, raw: &str) -> Result<Action, ValidationError> {
        self.validate_with_root(raw, None)
    }

    /// Validate one raw reply for a project rooted at `root`. The deny-list
    /// sees the directory the command will actually start in.
    pub fn validate_in(&self, raw: &str, root: &Path) -> Result<Action, ValidationError> {
        self.validate_with_root(raw, Some(root))
    }

    fn validate_with_root(
        &self,
        raw: &str,
        root: Option<&Path>,
    ) -> Result<Action, ValidationError> {
        let value = parse_single_object(raw)?;

        let messages: Vec<String> = self
            .schema
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect();
        if !messages.is_empty() {
            return Err(ValidationError::SchemaViolation(messages));
        }

        let wire: WireAction = serde_json::from_value(value)
            .map_err(|err| ValidationError::SchemaViolation(vec![err.to_string()]))?;
        let step = step_from_wire(&wire.action)?;

        if let ActionStep::RunCommand {
            command,
            working_directory,
        } = &step
        {
            let cwd = match root {
                Some(root) if working_directory.is_relative() => Some(root.join(working_directory)),
                Some(_) => Some(working_directory.clone()),
                None => Some(working_directory.clone()).filter(|dir| dir.is_absolute()),
            };
            check_command(command, cwd.as_deref()).map_err(ValidationError::PolicyViolation)?;
        }

        Ok(Action::new(
            wire.kind,
            wire.thought,
            step,
            wire.action.reason,
            wire.action.msg,
            wire.next_message,
        ))
    }
}

/// Parse `raw` as exactly one JSON object. Surrounding whitespace is the only
/// thing tolerated around it.
fn parse_single_object(raw: &str) -> Result<Value, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::MalformedOutput(
            "empty reply".to_string(),
        ));
    }
    let value: Value = serde_json::from_str(trimmed)
        .map_err(|err| ValidationError::MalformedOutput(err.to_string()))?;
    if !value.is_object() {
        return Err(ValidationError::MalformedOutput(format!(
            "expected a single JSON object, got {}",
            json_type_name(&value)
        )));
    }
    Ok(value)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn step_from_wire(step: &WireStep) -> Result<ActionStep, ValidationError> {
    let cmd = non_blank(step.cmd.as_deref());
    let cwd = non_blank(step.cwd.as_deref());

    match step.action_type {
        ActionType::RunCommand => match (cmd, cwd) {
            (Some(command), Some(dir)) => Ok(ActionStep::RunCommand {
                command: command.to_string(),
                working_directory: PathBuf::from(dir),
            }),
            _ => {
                let mut errors = Vec::new();
                if cmd.is_none() {
                    errors.push(
                        "action.cmd must be a non-empty string when action.type is \"run-command\""
                            .to_string(),
                    );
                }
                if cwd.is_none() {
                    errors.push(
                        "action.cwd must be a non-empty string when action.type is \"run-command\""
                            .to_string(),
                    );
                }
                Err(ValidationError::SchemaViolation(errors))
            }
        },
        ActionType::None => {
            let mut errors = Vec::new();
            if cmd.is_some() {
                errors.push("action.cmd must be null when action.type is \"none\"".to_string());
            }
            if cwd.is_some() {
                errors.push("action.cwd must be null when action.type is \"none\"".to_string());
            }
            if errors.is_empty() {
                Ok(ActionStep::None)
            } else {
                Err(ValidationError::SchemaViolation(errors))
            }
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.trim().is_empty())
}

/// Canonical JSON for a validated action, as recorded in the conversation.
pub fn to_canonical_json(action: &Action) -> String {
    let (action_type, cmd, cwd) = match action.step() {
        ActionStep::RunCommand {
            command,
            working_directory,
        } => (
            ActionType::RunCommand,
            Some(command.clone()),
            Some(working_directory.display().to_string()),
        ),
        ActionStep::None => (ActionType::None, None, None),
    };
    let wire = WireAction {
        kind: action.kind(),
        thought: action.thought().to_string(),
        action: WireStep {
            action_type,
            cmd,
            cwd,
            reason: action.reason().to_string(),
            msg: action.user_message().to_string(),
        },
        next_message: action.next_step().to_string(),
    };
    // Plain data with string keys always serializes.
    serde_json::to_string(&wire).unwrap_or_default()
}
