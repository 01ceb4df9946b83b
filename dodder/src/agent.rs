//! Loop controller: drives model, validator, and shell one turn at a time.
//!
//! The controller owns the conversation for one run. It generates only while
//! the newest turn is user input or a tool result, and it never calls the
//! model again before the result of the previous command has been appended.
//! Every way out of [`AgentLoop::run_until_input`] leaves the conversation
//! waiting for the user.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::action::{ActionValidator, to_canonical_json};
use crate::core::conversation::{Conversation, Role};
use crate::core::policy::PolicyViolation;
use crate::core::retry::RetryBudget;
use crate::core::types::{Action, ActionKind, ActionStep, ExecutionResult, ProjectContext};
use crate::error::{AgentError, BackendError, ValidationError};
use crate::io::config::DodderConfig;
use crate::io::model::ModelClient;
use crate::io::prompt::PromptEngine;
use crate::io::shell::{Shell, ShellInfo};

/// Loop phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Analysing the request; no command has run in this cycle.
    Planning,
    /// Commands may run; results feed the next generation.
    Executing,
    /// Suspended until the user replies.
    AwaitingUser,
    /// The run is over; nothing more is appended.
    Done,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Planning => "planning",
            LoopState::Executing => "executing",
            LoopState::AwaitingUser => "awaiting-user",
            LoopState::Done => "done",
        };
        f.write_str(name)
    }
}

/// Why [`AgentLoop::run_until_input`] returned control to the caller.
#[derive(Debug)]
pub enum Suspension {
    /// A planning reply with nothing to run; the next request is expected.
    NextRequest,
    /// An executing reply with nothing to run; feedback is expected.
    Feedback,
    /// A recoverable failure surfaced to the user: refusal, exhausted
    /// corrections, repeated backend timeouts, or cancellation.
    Escalated(AgentError),
}

/// Progress reported while the loop runs.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    /// A reply passed validation.
    Action(Action),
    /// The declared `type` does not fit the loop phase. Dispatch still follows `action.type`.
    Inconsistent {
        declared: ActionKind,
        state: LoopState,
    },
    CommandStarted {
        command: String,
        cwd: PathBuf,
    },
    CommandFinished(ExecutionResult),
    /// A command was refused before it could run.
    Refused(PolicyViolation),
    /// A rejected reply triggered a corrective re-prompt.
    Correction {
        error: ValidationError,
        attempt: u32,
    },
    /// A backend call failed and is being retried.
    BackendRetry {
        error: BackendError,
        attempt: u32,
    },
}

/// Retry bounds and context budget for one controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    /// Corrective re-prompts allowed after consecutive rejected replies.
    pub max_corrections: u32,
    /// Total backend attempts per generation, first try included.
    pub max_backend_attempts: u32,
    /// Character budget for the window sent to the backend.
    pub window_chars: usize,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from_config(&DodderConfig::default())
    }
}

impl LoopSettings {
    pub fn from_config(config: &DodderConfig) -> Self {
        Self {
            max_corrections: config.agent.max_corrections,
            max_backend_attempts: config.backend.max_attempts.max(1),
            window_chars: config.agent.window_chars,
        }
    }
}

/// Drives one run of the agent against a model and a shell.
pub struct AgentLoop<'a, M: ModelClient, S: Shell> {
    context: ProjectContext,
    model: &'a M,
    shell: &'a S,
    validator: ActionValidator,
    prompts: PromptEngine,
    conversation: Conversation,
    state: LoopState,
    corrections: RetryBudget,
    settings: LoopSettings,
    cancel: CancelToken,
}

impl<'a, M: ModelClient, S: Shell> AgentLoop<'a, M, S> {
    /// Create a controller whose conversation holds only the system turn.
    pub fn new(
        context: ProjectContext,
        shell_info: &ShellInfo,
        model: &'a M,
        shell: &'a S,
        settings: LoopSettings,
        cancel: CancelToken,
    ) -> Result<Self> {
        let validator = ActionValidator::new()?;
        let prompts = PromptEngine::new()?;
        let system_prompt = prompts
            .render_system(shell_info, &context.root, context.instructions.as_deref())
            .context("build system prompt")?;
        Ok(Self {
            context,
            model,
            shell,
            validator,
            prompts,
            conversation: Conversation::new(system_prompt),
            state: LoopState::Planning,
            corrections: RetryBudget::new(settings.max_corrections),
            settings,
            cancel,
        })
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn context(&self) -> &ProjectContext {
        &self.context
    }

    /// Seed the conversation with the first request.
    pub fn start(&mut self, request: &str) -> Result<(), AgentError> {
        if self.conversation.len() != 1 {
            return Err(AgentError::InvalidState(
                "run already started".to_string(),
            ));
        }
        self.submit_user_input(request)
    }

    /// Append a user turn and return to planning.
    ///
    /// Accepted while awaiting the user, or while planning between requests.
    pub fn submit_user_input(&mut self, text: &str) -> Result<(), AgentError> {
        let idle_planning = self.state == LoopState::Planning && !self.wants_generation();
        if self.state != LoopState::AwaitingUser && !idle_planning {
            return Err(AgentError::InvalidState(format!(
                "cannot accept user input while {}",
                self.state
            )));
        }
        self.append(Role::User, text)?;
        self.state = LoopState::Planning;
        self.corrections.reset();
        if self.cancel.reset() {
            debug!("cleared pending cancellation");
        }
        Ok(())
    }

    /// End the run. No further turns are appended.
    pub fn finish(&mut self) {
        info!(turns = self.conversation.len(), "run finished");
        self.state = LoopState::Done;
    }

    /// Generate, validate, and dispatch until the user has to speak again.
    ///
    /// Returns `Err` only for failures that end the run: an unreachable backend
    /// after every attempt, or a call in the wrong state. The state is then `Done`
    /// for the former and unchanged for the latter.
    #[instrument(skip_all, fields(model = %self.context.model))]
    pub fn run_until_input<F: FnMut(&LoopEvent)>(
        &mut self,
        mut on_event: F,
    ) -> Result<Suspension, AgentError> {
        if !self.wants_generation() {
            return Err(AgentError::InvalidState(format!(
                "nothing to generate for while {}",
                self.state
            )));
        }

        loop {
            if self.cancel.is_cancelled() {
                info!("cancelled before generation");
                return Ok(self.escalate(AgentError::UserCancelled));
            }

            let raw = match self.generate(&mut on_event) {
                Ok(raw) => raw,
                Err(err @ BackendError::Timeout(_)) => {
                    return Ok(self.escalate(AgentError::Backend(err)));
                }
                Err(err @ BackendError::Unavailable(_)) => {
                    warn!(err = %err, "backend unavailable, ending run");
                    self.state = LoopState::Done;
                    return Err(AgentError::Backend(err));
                }
            };

            match self.validator.validate_in(&raw, &self.context.root) {
                Ok(action) => {
                    self.corrections.reset();
                    if let Some(suspension) = self.dispatch(action, &mut on_event)? {
                        return Ok(suspension);
                    }
                }
                Err(ValidationError::PolicyViolation(violation)) => {
                    warn!(rule = %violation.rule, "refused command");
                    self.append(Role::Assistant, raw)?;
                    self.append(Role::ToolResult, render_refusal(&violation))?;
                    on_event(&LoopEvent::Refused(violation.clone()));
                    return Ok(self.escalate(AgentError::Validation(
                        ValidationError::PolicyViolation(violation),
                    )));
                }
                Err(err) => {
                    self.append(Role::Assistant, raw)?;
                    if !self.corrections.record_failure() {
                        warn!(err = %err, failures = self.corrections.failures(), "corrections exhausted");
                        return Ok(self.escalate(AgentError::Validation(err)));
                    }
                    debug!(err = %err, "requesting corrected reply");
                    let correction = self
                        .prompts
                        .render_correction(&err.to_string())
                        .map_err(|e| AgentError::InvalidState(format!("{e:#}")))?;
                    self.append(Role::User, correction)?;
                    on_event(&LoopEvent::Correction {
                        error: err,
                        attempt: self.corrections.failures(),
                    });
                }
            }
        }
    }

    /// Whether the newest turn is waiting for a model reply.
    fn wants_generation(&self) -> bool {
        let active = matches!(self.state, LoopState::Planning | LoopState::Executing);
        let pending = self
            .conversation
            .last()
            .is_some_and(|turn| matches!(turn.role, Role::User | Role::ToolResult));
        active && pending
    }

    fn generate<F: FnMut(&LoopEvent)>(&self, on_event: &mut F) -> Result<String, BackendError> {
        let mut budget = RetryBudget::new(self.settings.max_backend_attempts.saturating_sub(1));
        loop {
            let window = self.conversation.window(self.settings.window_chars);
            debug!(
                turns = window.len(),
                history = self.conversation.len(),
                "requesting generation"
            );
            match self
                .model
                .generate(&self.context.model, &window, &self.context.params)
            {
                Ok(raw) => return Ok(raw),
                Err(err) => {
                    if self.cancel.is_cancelled() || !budget.record_failure() {
                        return Err(err);
                    }
                    warn!(err = %err, attempt = budget.failures(), "retrying backend");
                    on_event(&LoopEvent::BackendRetry {
                        error: err,
                        attempt: budget.failures(),
                    });
                }
            }
        }
    }

    fn dispatch<F: FnMut(&LoopEvent)>(
        &mut self,
        action: Action,
        on_event: &mut F,
    ) -> Result<Option<Suspension>, AgentError> {
        if action.kind() == ActionKind::Agent && self.state == LoopState::Executing {
            warn!(
                declared = action.kind().as_str(),
                state = %self.state,
                "declared type does not match loop state"
            );
            on_event(&LoopEvent::Inconsistent {
                declared: action.kind(),
                state: self.state,
            });
        }

        self.append(Role::Assistant, to_canonical_json(&action))?;
        on_event(&LoopEvent::Action(action.clone()));

        let (command, dir) = match action.step() {
            ActionStep::None => {
                return Ok(Some(match action.kind() {
                    ActionKind::Agent => {
                        self.state = LoopState::Planning;
                        Suspension::NextRequest
                    }
                    ActionKind::Assistant => {
                        self.state = LoopState::AwaitingUser;
                        Suspension::Feedback
                    }
                }));
            }
            ActionStep::RunCommand {
                command,
                working_directory,
            } => (command.as_str(), working_directory.as_path()),
        };

        self.state = LoopState::Executing;
        let cwd = self.context.resolve_dir(dir);
        let result = self.execute(command, &cwd, on_event);
        self.append(Role::ToolResult, render_execution(command, &cwd, &result))?;

        if result.cancelled {
            return Ok(Some(self.escalate(AgentError::UserCancelled)));
        }
        Ok(None)
    }

    fn execute<F: FnMut(&LoopEvent)>(
        &self,
        command: &str,
        cwd: &Path,
        on_event: &mut F,
    ) -> ExecutionResult {
        on_event(&LoopEvent::CommandStarted {
            command: command.to_string(),
            cwd: cwd.to_path_buf(),
        });

        let result = if self.cancel.is_cancelled() {
            ExecutionResult {
                error: Some("cancelled by user before start".to_string()),
                cancelled: true,
                ..ExecutionResult::default()
            }
        } else {
            match self.shell.execute(command, cwd) {
                Ok(result) => result,
                Err(err) => {
                    warn!(err = %err, "command not started");
                    ExecutionResult {
                        error: Some(err.to_string()),
                        ..ExecutionResult::default()
                    }
                }
            }
        };

        on_event(&LoopEvent::CommandFinished(result.clone()));
        result
    }

    fn escalate(&mut self, err: AgentError) -> Suspension {
        self.state = LoopState::AwaitingUser;
        Suspension::Escalated(err)
    }

    fn append(&mut self, role: Role, content: impl Into<String>) -> Result<usize, AgentError> {
        self.conversation
            .append(role, content)
            .map_err(|err| AgentError::InvalidState(err.to_string()))
    }
}

/// Tool-result turn for a command that ran (or failed to start).
pub fn render_execution(command: &str, cwd: &Path, result: &ExecutionResult) -> String {
    let mut out = String::from("[command result]\n");
    out.push_str(&format!("command: {command}\n"));
    out.push_str(&format!("cwd: {}\n", cwd.display()));
    out.push_str(&format!("success: {}\n", result.success));
    match result.exit_code {
        Some(code) => out.push_str(&format!("exit_code: {code}\n")),
        None => out.push_str("exit_code: unknown\n"),
    }
    let detail = result.error.as_deref().unwrap_or("output may be partial");
    if result.is_incomplete() {
        out.push_str(&format!("incomplete: {detail}\n"));
    } else if let Some(error) = &result.error {
        out.push_str(&format!("error: {error}\n"));
    }
    push_stream(&mut out, "stdout", &result.stdout);
    push_stream(&mut out, "stderr", &result.stderr);
    out
}

fn push_stream(out: &mut String, label: &str, text: &str) {
    out.push_str(&format!("--- {label} ---\n"));
    let text = text.trim_end();
    if text.is_empty() {
        out.push_str("(empty)\n");
    } else {
        out.push_str(text);
        out.push('\n');
    }
}

/// Tool-result turn for a command refused by the policy.
pub fn render_refusal(violation: &PolicyViolation) -> String {
    format!(
        "[command refused]\nrule: {}\nreason: {}\nThe command was not executed. Choose a safer command or ask the user.\n",
        violation.rule, violation.reason
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingShell, ScriptedModel, reply, test_context};

    fn posix() -> ShellInfo {
        ShellInfo::resolve(false, |_| None)
    }

    fn controller<'a>(
        model: &'a ScriptedModel,
        shell: &'a RecordingShell,
        cancel: CancelToken,
    ) -> AgentLoop<'a, ScriptedModel, RecordingShell> {
        AgentLoop::new(
            test_context("/work"),
            &posix(),
            model,
            shell,
            LoopSettings::default(),
            cancel,
        )
        .expect("controller")
    }

    #[test]
    fn new_conversation_holds_only_system_turn() {
        let model = ScriptedModel::new(vec![]);
        let shell = RecordingShell::new();
        let agent = controller(&model, &shell, CancelToken::new());
        assert_eq!(agent.conversation().len(), 1);
        assert_eq!(agent.conversation().snapshot()[0].role, Role::System);
        assert!(agent.conversation().snapshot()[0].content.contains("/work"));
        assert_eq!(agent.state(), LoopState::Planning);
    }

    #[test]
    fn run_before_start_is_invalid() {
        let model = ScriptedModel::new(vec![]);
        let shell = RecordingShell::new();
        let mut agent = controller(&model, &shell, CancelToken::new());
        let err = agent.run_until_input(|_| {}).unwrap_err();
        assert!(matches!(err, AgentError::InvalidState(_)));
        assert!(model.windows().is_empty());
    }

    #[test]
    fn planning_reply_waits_for_next_request() {
        let model = ScriptedModel::new(vec![Ok(reply("agent", "none", None, None))]);
        let shell = RecordingShell::new();
        let mut agent = controller(&model, &shell, CancelToken::new());
        agent.start("plan a todo app").expect("start");

        let suspension = agent.run_until_input(|_| {}).expect("run");
        assert!(matches!(suspension, Suspension::NextRequest));
        assert_eq!(agent.state(), LoopState::Planning);
        assert!(shell.calls().is_empty());

        agent.submit_user_input("looks good").expect("submit");
        assert_eq!(agent.conversation().len(), 4);
    }

    #[test]
    fn executing_reply_waits_for_feedback() {
        let model = ScriptedModel::new(vec![Ok(reply("assistant", "none", None, None))]);
        let shell = RecordingShell::new();
        let mut agent = controller(&model, &shell, CancelToken::new());
        agent.start("done?").expect("start");
        let suspension = agent.run_until_input(|_| {}).expect("run");
        assert!(matches!(suspension, Suspension::Feedback));
        assert_eq!(agent.state(), LoopState::AwaitingUser);
    }

    #[test]
    fn relative_directory_resolves_against_root() {
        let model = ScriptedModel::new(vec![
            Ok(reply("assistant", "run-command", Some("ls"), Some("web"))),
            Ok(reply("assistant", "none", None, None)),
        ]);
        let shell = RecordingShell::new();
        let mut agent = controller(&model, &shell, CancelToken::new());
        agent.start("list web").expect("start");
        agent.run_until_input(|_| {}).expect("run");
        assert_eq!(
            shell.calls(),
            vec![("ls".to_string(), PathBuf::from("/work/web"))]
        );
    }

    #[test]
    fn invalid_directory_becomes_failed_tool_result() {
        let model = ScriptedModel::new(vec![
            Ok(reply("assistant", "run-command", Some("ls"), Some("/missing"))),
            Ok(reply("assistant", "none", None, None)),
        ]);
        let shell = RecordingShell::new().with_results(vec![Err(
            crate::error::ShellError::InvalidWorkingDirectory(PathBuf::from("/missing")),
        )]);
        let mut agent = controller(&model, &shell, CancelToken::new());
        agent.start("list").expect("start");
        agent.run_until_input(|_| {}).expect("run");

        let tool_turn = agent
            .conversation()
            .snapshot()
            .iter()
            .find(|turn| turn.role == Role::ToolResult)
            .expect("tool result");
        assert!(tool_turn.content.contains("success: false"));
        assert!(tool_turn.content.contains("invalid working directory /missing"));
    }

    #[test]
    fn agent_kind_after_command_is_reported_not_rewritten() {
        let model = ScriptedModel::new(vec![
            Ok(reply("assistant", "run-command", Some("ls"), Some("/work"))),
            Ok(reply("agent", "run-command", Some("pwd"), Some("/work"))),
            Ok(reply("assistant", "none", None, None)),
        ]);
        let shell = RecordingShell::new();
        let mut agent = controller(&model, &shell, CancelToken::new());
        agent.start("inspect").expect("start");

        let mut events = Vec::new();
        agent
            .run_until_input(|event| events.push(event.clone()))
            .expect("run");
        assert!(events.contains(&LoopEvent::Inconsistent {
            declared: ActionKind::Agent,
            state: LoopState::Executing,
        }));
        assert_eq!(shell.calls().len(), 2);
    }

    #[test]
    fn unavailable_backend_ends_the_run() {
        let model = ScriptedModel::new(vec![
            Err(BackendError::Unavailable("connection refused".to_string())),
            Err(BackendError::Unavailable("connection refused".to_string())),
        ]);
        let shell = RecordingShell::new();
        let mut agent = controller(&model, &shell, CancelToken::new());
        agent.start("hello").expect("start");

        let mut retries = 0;
        let err = agent
            .run_until_input(|event| {
                if matches!(event, LoopEvent::BackendRetry { .. }) {
                    retries += 1;
                }
            })
            .unwrap_err();
        assert!(matches!(err, AgentError::Backend(BackendError::Unavailable(_))));
        assert_eq!(retries, 1);
        assert_eq!(agent.state(), LoopState::Done);
        assert!(agent.submit_user_input("again").is_err());
    }

    #[test]
    fn backend_recovers_within_attempts() {
        let model = ScriptedModel::new(vec![
            Err(BackendError::Unavailable("warming up".to_string())),
            Ok(reply("agent", "none", None, None)),
        ]);
        let shell = RecordingShell::new();
        let mut agent = controller(&model, &shell, CancelToken::new());
        agent.start("hello").expect("start");
        let suspension = agent.run_until_input(|_| {}).expect("run");
        assert!(matches!(suspension, Suspension::NextRequest));
    }

    #[test]
    fn pending_cancellation_stops_before_generation() {
        let model = ScriptedModel::new(vec![Ok(reply("agent", "none", None, None))]);
        let shell = RecordingShell::new();
        let cancel = CancelToken::new();
        let mut agent = controller(&model, &shell, cancel.clone());
        agent.start("hello").expect("start");
        cancel.cancel();

        let suspension = agent.run_until_input(|_| {}).expect("run");
        assert!(matches!(
            suspension,
            Suspension::Escalated(AgentError::UserCancelled)
        ));
        assert!(model.windows().is_empty());

        agent.submit_user_input("try again").expect("submit");
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn cancelled_command_is_recorded_as_incomplete() {
        let model = ScriptedModel::new(vec![Ok(reply(
            "assistant",
            "run-command",
            Some("npm install"),
            Some("/work"),
        ))]);
        let shell = RecordingShell::new().with_results(vec![Ok(ExecutionResult {
            stdout: "added 10 packages".to_string(),
            error: Some("cancelled by user".to_string()),
            cancelled: true,
            ..ExecutionResult::default()
        })]);
        let mut agent = controller(&model, &shell, CancelToken::new());
        agent.start("install").expect("start");

        let suspension = agent.run_until_input(|_| {}).expect("run");
        assert!(matches!(
            suspension,
            Suspension::Escalated(AgentError::UserCancelled)
        ));
        assert_eq!(agent.state(), LoopState::AwaitingUser);
        let last = agent.conversation().last().expect("turn");
        assert_eq!(last.role, Role::ToolResult);
        assert!(last.content.contains("incomplete: cancelled by user"));
        assert!(last.content.contains("added 10 packages"));
    }

    #[test]
    fn render_execution_lists_every_field() {
        let result = ExecutionResult {
            stdout: "hello\n".to_string(),
            stderr: String::new(),
            success: false,
            exit_code: Some(2),
            error: Some("exited with status 2".to_string()),
            timed_out: false,
            cancelled: false,
        };
        let text = render_execution("make", Path::new("/work"), &result);
        assert_eq!(
            text,
            "[command result]\ncommand: make\ncwd: /work\nsuccess: false\nexit_code: 2\nerror: exited with status 2\n--- stdout ---\nhello\n--- stderr ---\n(empty)\n"
        );
    }

    #[test]
    fn render_refusal_names_rule() {
        let text = render_refusal(&PolicyViolation {
            rule: "disk-format".to_string(),
            reason: "formats a disk".to_string(),
        });
        assert!(text.starts_with("[command refused]\nrule: disk-format\n"));
    }
}
