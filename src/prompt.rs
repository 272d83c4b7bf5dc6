//! Yes/no confirmation

use std::io::{self, BufRead, IsTerminal, Write};

/// Asks the user a yes/no question
pub trait Confirmer: Send + Sync {
    /// Whether a question can be put to a person at all
    fn can_prompt(&self) -> bool;

    fn confirm(&self, question: &str) -> io::Result<bool>;
}

/// Prompts on stderr and reads the answer from stdin.
///
/// Answers no without asking when either stream is not a terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalConfirmer;

impl Confirmer for TerminalConfirmer {
    fn can_prompt(&self) -> bool {
        io::stdin().is_terminal() && io::stderr().is_terminal()
    }

    fn confirm(&self, question: &str) -> io::Result<bool> {
        if !self.can_prompt() {
            return Ok(false);
        }
        let mut stderr = io::stderr().lock();
        write!(stderr, "{question} [y/N] ")?;
        stderr.flush()?;
        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        Ok(parse_answer(&answer))
    }
}

/// Fixed answer, for `--yes`/`--no` and tests
#[derive(Debug, Clone, Copy)]
pub struct AssumeConfirmer(pub bool);

impl Confirmer for AssumeConfirmer {
    fn can_prompt(&self) -> bool {
        true
    }

    fn confirm(&self, question: &str) -> io::Result<bool> {
        tracing::debug!(question, answer = self.0, "assumed confirmation");
        Ok(self.0)
    }
}

fn parse_answer(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
