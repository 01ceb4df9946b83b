//! Interactive driver for `dodder run`.
//!
//! Pumps user lines into the loop controller until the user leaves, input
//! ends, or the run fails.

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::agent::{AgentLoop, LoopEvent, Suspension};
use crate::io::console::UserInput;
use crate::io::model::ModelClient;
use crate::io::shell::Shell;

pub const INPUT_PROMPT: &str = "> ";

/// Something the terminal should show.
#[derive(Debug)]
pub enum SessionEvent<'e> {
    Loop(&'e LoopEvent),
    Suspended(&'e Suspension),
}

/// Why the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The user typed `exit` or `quit`.
    UserExit,
    /// Input reached end of file.
    EndOfInput,
}

/// Summary of a finished session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOutcome {
    pub end: SessionEnd,
    pub turns: usize,
    pub cycles: u32,
}

fn is_exit_command(line: &str) -> bool {
    let line = line.trim();
    line.eq_ignore_ascii_case("exit") || line.eq_ignore_ascii_case("quit")
}

/// Run a session starting from `request`.
///
/// Fatal loop errors are returned as `AgentError` inside the `anyhow` chain so
/// callers can map them to exit codes.
#[instrument(skip_all)]
pub fn run_session<M, S, I, F>(
    agent: &mut AgentLoop<'_, M, S>,
    input: &mut I,
    request: &str,
    mut on_event: F,
) -> Result<SessionOutcome>
where
    M: ModelClient,
    S: Shell,
    I: UserInput,
    F: FnMut(SessionEvent<'_>),
{
    agent.start(request).context("start run")?;
    let mut cycles = 0u32;

    loop {
        cycles += 1;
        let suspension = agent
            .run_until_input(|event| on_event(SessionEvent::Loop(event)))
            .context("run agent loop")?;
        on_event(SessionEvent::Suspended(&suspension));

        let end = loop {
            let Some(line) = input.read_line(INPUT_PROMPT)? else {
                break Some(SessionEnd::EndOfInput);
            };
            if line.trim().is_empty() {
                continue;
            }
            if is_exit_command(&line) {
                break Some(SessionEnd::UserExit);
            }
            agent
                .submit_user_input(line.trim())
                .context("submit user input")?;
            break None;
        };

        if let Some(end) = end {
            agent.finish();
            debug!(?end, cycles, "session ended");
            return Ok(SessionOutcome {
                end,
                turns: agent.conversation().len(),
                cycles,
            });
        }
    }
}
