//! Local-LLM coding agent.
//!
//! Dodder turns a natural-language project request into a sequence of
//! validated shell actions. A model served by Ollama proposes one JSON action
//! per turn; only replies that pass strict validation and the deny-list policy
//! ever reach the shell. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (conversation, action validation,
//!   command policy, retry bounds). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (shell processes, Ollama HTTP, config
//!   and instruction files, terminal input). Behind traits where tests need doubles.
//!
//! [`agent`] drives one run through its state machine and [`session`] pumps
//! user input into it for the CLI.

pub mod agent;
pub mod cancel;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
