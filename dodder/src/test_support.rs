//! Test-only doubles for the model, the shell, and user input.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::core::conversation::Turn;
use crate::core::types::{ExecutionResult, GenerationParams, ProjectContext};
use crate::error::{BackendError, ShellError};
use crate::io::console::UserInput;
use crate::io::model::ModelClient;
use crate::io::shell::Shell;

/// Build a raw backend reply in the expected JSON shape.
pub fn reply(kind: &str, action_type: &str, cmd: Option<&str>, cwd: Option<&str>) -> String {
    json!({
        "type": kind,
        "thought": format!("{kind} turn"),
        "action": {
            "type": action_type,
            "cmd": cmd.map_or(Value::Null, |c| json!(c)),
            "cwd": cwd.map_or(Value::Null, |c| json!(c)),
            "reason": "scripted",
            "msg": format!("{action_type} step"),
        },
        "nextMessage": "continue",
    })
    .to_string()
}

/// Project context rooted at `root` with default generation parameters.
pub fn test_context(root: impl Into<PathBuf>) -> ProjectContext {
    ProjectContext {
        model: "test-model".to_string(),
        root: root.into(),
        instructions: None,
        params: GenerationParams::default(),
    }
}

/// Model that returns queued replies and records every window it receives.
///
/// Once the queue is empty every call fails with `BackendError::Unavailable`.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    replies: RefCell<VecDeque<Result<String, BackendError>>>,
    windows: RefCell<Vec<Vec<Turn>>>,
    models: Vec<String>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Result<String, BackendError>>) -> Self {
        Self {
            replies: RefCell::new(replies.into()),
            ..Self::default()
        }
    }

    pub fn with_models(mut self, models: &[&str]) -> Self {
        self.models = models.iter().map(|m| m.to_string()).collect();
        self
    }

    /// Every window passed to `generate`, in call order.
    pub fn windows(&self) -> Vec<Vec<Turn>> {
        self.windows.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.replies.borrow().len()
    }
}

impl ModelClient for ScriptedModel {
    fn generate(
        &self,
        _model: &str,
        turns: &[&Turn],
        _params: &GenerationParams,
    ) -> Result<String, BackendError> {
        self.windows
            .borrow_mut()
            .push(turns.iter().map(|turn| (*turn).clone()).collect());
        self.replies.borrow_mut().pop_front().unwrap_or_else(|| {
            Err(BackendError::Unavailable(
                "scripted model has no replies left".to_string(),
            ))
        })
    }

    fn list_models(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.models.clone())
    }
}

/// Shell that records every `(command, cwd)` pair without spawning anything.
///
/// Returns queued results in order, then successful empty results.
#[derive(Debug, Default)]
pub struct RecordingShell {
    results: RefCell<VecDeque<Result<ExecutionResult, ShellError>>>,
    calls: RefCell<Vec<(String, PathBuf)>>,
}

impl RecordingShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_results(self, results: Vec<Result<ExecutionResult, ShellError>>) -> Self {
        *self.results.borrow_mut() = results.into();
        self
    }

    pub fn calls(&self) -> Vec<(String, PathBuf)> {
        self.calls.borrow().clone()
    }
}

impl Shell for RecordingShell {
    fn execute(&self, command: &str, cwd: &Path) -> Result<ExecutionResult, ShellError> {
        self.calls
            .borrow_mut()
            .push((command.to_string(), cwd.to_path_buf()));
        self.results.borrow_mut().pop_front().unwrap_or_else(|| {
            Ok(ExecutionResult {
                success: true,
                exit_code: Some(0),
                ..ExecutionResult::default()
            })
        })
    }
}

/// User input read from a fixed list of lines, then end of input.
#[derive(Debug, Default)]
pub struct ScriptedInput {
    lines: VecDeque<String>,
    prompts: Vec<String>,
}

impl ScriptedInput {
    pub fn new(lines: &[&str]) -> Self {
        Self {
            lines: lines.iter().map(|line| line.to_string()).collect(),
            prompts: Vec::new(),
        }
    }

    /// Prompts shown so far.
    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }
}

impl UserInput for ScriptedInput {
    fn read_line(&mut self, prompt: &str) -> Result<Option<String>> {
        self.prompts.push(prompt.to_string());
        Ok(self.lines.pop_front())
    }
}

/// Scratch project directory with an optional `.dodder/config.toml`.
pub struct TestProject {
    dir: TempDir,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn context(&self) -> ProjectContext {
        test_context(self.path())
    }

    /// Write `.dodder/config.toml` with the given TOML body.
    pub fn write_config(&self, body: &str) -> Result<PathBuf> {
        let path = crate::io::config::default_config_path(self.path());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, body)?;
        Ok(path)
    }
}
