//! Shared deterministic types for the agent loop.
//!
//! These types define the contracts between the validator, the conversation,
//! and the loop controller. They hold no I/O handles.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Session phase declared by the backend in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    /// Planning: analysing the request, designing the project.
    Agent,
    /// Executing: acting like a developer applying changes.
    Assistant,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Agent => "agent",
            ActionKind::Assistant => "assistant",
        }
    }
}

/// Discriminant of the `action.type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionType {
    RunCommand,
    None,
}

/// What the loop should do with a validated action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionStep {
    /// Run `command` through the host shell inside `working_directory`.
    RunCommand {
        command: String,
        working_directory: PathBuf,
    },
    /// Nothing to execute this turn.
    None,
}

/// A validated, immutable decision extracted from one assistant turn.
///
/// Only [`crate::core::action::ActionValidator`] constructs values of this type,
/// so holding an `Action` proves the raw reply passed every check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    kind: ActionKind,
    thought: String,
    step: ActionStep,
    reason: String,
    user_message: String,
    next_step: String,
}

impl Action {
    pub(crate) fn new(
        kind: ActionKind,
        thought: String,
        step: ActionStep,
        reason: String,
        user_message: String,
        next_step: String,
    ) -> Self {
        Self {
            kind,
            thought,
            step,
            reason,
            user_message,
            next_step,
        }
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn thought(&self) -> &str {
        &self.thought
    }

    pub fn step(&self) -> &ActionStep {
        &self.step
    }

    pub fn action_type(&self) -> ActionType {
        match self.step {
            ActionStep::RunCommand { .. } => ActionType::RunCommand,
            ActionStep::None => ActionType::None,
        }
    }

    /// The `(command, working_directory)` pair when this action runs a command.
    pub fn command(&self) -> Option<(&str, &Path)> {
        match &self.step {
            ActionStep::RunCommand {
                command,
                working_directory,
            } => Some((command.as_str(), working_directory.as_path())),
            ActionStep::None => None,
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn next_step(&self) -> &str {
        &self.next_step
    }
}

/// Captured outcome of running one shell command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    /// Process exit code, when the process exited normally.
    pub exit_code: Option<i32>,
    /// Spawn failure, timeout, or cancellation detail.
    pub error: Option<String>,
    /// Set when the process was killed after the command timeout.
    pub timed_out: bool,
    /// Set when the user cancelled the command; output is partial.
    pub cancelled: bool,
}

impl ExecutionResult {
    /// Whether the captured output may be partial.
    pub fn is_incomplete(&self) -> bool {
        self.timed_out || self.cancelled
    }
}

/// Sampling parameters forwarded to the backend on every generation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1500,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
        }
    }
}

impl GenerationParams {
    /// Returns a list of stable error messages (empty on success).
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            errors.push(format!("temperature must be >= 0 (got {})", self.temperature));
        }
        if self.max_tokens == 0 {
            errors.push("max_tokens must be > 0".to_string());
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            errors.push(format!("top_p must be in (0, 1] (got {})", self.top_p));
        }
        for (name, value) in [
            ("frequency_penalty", self.frequency_penalty),
            ("presence_penalty", self.presence_penalty),
        ] {
            if !(-2.0..=2.0).contains(&value) {
                errors.push(format!("{name} must be in [-2, 2] (got {value})"));
            }
        }
        errors
    }
}

/// Immutable per-run configuration, owned by one loop controller.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectContext {
    /// Backend model name.
    pub model: String,
    /// Project root; relative command directories resolve against it.
    pub root: PathBuf,
    /// Extra instruction text appended to the system prompt.
    pub instructions: Option<String>,
    pub params: GenerationParams,
}

impl ProjectContext {
    /// Resolve a command's working directory against the project root.
    pub fn resolve_dir(&self, dir: &Path) -> PathBuf {
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            self.root.join(dir)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params_are_valid() {
        assert!(GenerationParams::default().validate().is_empty());
    }

    #[test]
    fn params_report_every_out_of_range_value() {
        let params = GenerationParams {
            temperature: -1.0,
            max_tokens: 0,
            top_p: 0.0,
            frequency_penalty: 3.0,
            presence_penalty: -2.5,
        };
        let errors = params.validate();
        assert_eq!(errors.len(), 5);
        assert!(errors[0].contains("temperature"));
        assert!(errors[2].contains("top_p"));
        assert!(errors[4].contains("presence_penalty"));
    }

    #[test]
    fn resolve_dir_keeps_absolute_and_joins_relative() {
        let ctx = ProjectContext {
            model: "llama3.1".to_string(),
            root: PathBuf::from("/work/project"),
            instructions: None,
            params: GenerationParams::default(),
        };
        assert_eq!(
            ctx.resolve_dir(Path::new("/tmp")),
            PathBuf::from("/tmp")
        );
        assert_eq!(
            ctx.resolve_dir(Path::new("web")),
            PathBuf::from("/work/project/web")
        );
    }
}
