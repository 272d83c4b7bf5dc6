//! Interrupt handling
//!
//! The first SIGINT/SIGTERM cancels the command's [`CancelToken`] so in-flight
//! builds and watchers unwind and report. A second signal exits immediately
//! with [`EXIT_CODE_CANCELLED`].

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::cancel::CancelToken;

/// Exit code for cancelled commands
pub const EXIT_CODE_CANCELLED: i32 = 130;

/// Action to take after receiving a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// First signal: cancel the running command
    Cancel,
    /// Second signal: exit now
    ImmediateExit,
    /// Third+ signal: ignore
    Ignore,
}

/// Signal handler state
#[derive(Debug, Default)]
pub struct SignalState {
    signal_count: AtomicU8,
    token: CancelToken,
}

impl SignalState {
    pub fn new(token: CancelToken) -> Self {
        Self {
            signal_count: AtomicU8::new(0),
            token,
        }
    }

    pub fn signal_count(&self) -> u8 {
        self.signal_count.load(Ordering::SeqCst)
    }

    /// Handle one signal and return what the process should do
    pub fn handle_signal(&self) -> SignalAction {
        match self.signal_count.fetch_add(1, Ordering::SeqCst) {
            0 => {
                self.token.cancel();
                SignalAction::Cancel
            }
            1 => SignalAction::ImmediateExit,
            _ => SignalAction::Ignore,
        }
    }
}

/// Install the process-wide handler. Must be called at most once.
pub fn install(token: CancelToken) -> Result<Arc<SignalState>, ctrlc::Error> {
    let state = Arc::new(SignalState::new(token));
    let handler_state = Arc::clone(&state);
    ctrlc::set_handler(move || match handler_state.handle_signal() {
        SignalAction::Cancel => {
            eprintln!("\nInterrupted, cancelling (press Ctrl-C again to exit immediately)...");
        }
        SignalAction::ImmediateExit => {
            eprintln!("\nExiting immediately");
            std::process::exit(EXIT_CODE_CANCELLED);
        }
        SignalAction::Ignore => {}
    })?;
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_signal_cancels_token() {
        let token = CancelToken::new();
        let state = SignalState::new(token.clone());

        assert_eq!(state.handle_signal(), SignalAction::Cancel);
        assert!(token.is_cancelled());
        assert_eq!(state.signal_count(), 1);
    }

    #[test]
    fn test_second_signal_requests_immediate_exit() {
        let state = SignalState::new(CancelToken::new());
        state.handle_signal();
        assert_eq!(state.handle_signal(), SignalAction::ImmediateExit);
        assert_eq!(state.handle_signal(), SignalAction::Ignore);
        assert_eq!(state.signal_count(), 3);
    }
}
