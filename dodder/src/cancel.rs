//! Cooperative cancellation shared between the Ctrl-C listener and the shell.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use tracing::{debug, warn};

use crate::exit_codes;

/// Cloneable flag; every clone observes the same state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Clear the flag and report whether it was set.
    pub fn reset(&self) -> bool {
        self.cancelled.swap(false, Ordering::SeqCst)
    }
}

/// Set `token` on every Ctrl-C for the rest of the process.
///
/// A second Ctrl-C while the token is still set exits the process, so the
/// user can always leave, even while the session is blocked reading input.
pub fn listen_for_interrupts(token: CancelToken) {
    let spawned = thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    warn!(err = %err, "cannot start signal runtime, ctrl-c will not cancel commands");
                    return;
                }
            };
            runtime.block_on(async move {
                while tokio::signal::ctrl_c().await.is_ok() {
                    if token.is_cancelled() {
                        eprintln!();
                        std::process::exit(exit_codes::INTERRUPTED);
                    }
                    debug!("ctrl-c received, cancelling");
                    eprintln!("\n^C cancelling; press ctrl-c again to quit");
                    token.cancel();
                }
            });
        });
    if let Err(err) = spawned {
        warn!(err = %err, "cannot spawn ctrl-c listener");
    }
}
