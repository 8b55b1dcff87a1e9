//! Operator decisions.
//!
//! The reconciler asks every question through a [`DecisionProvider`], so the
//! same state machine runs against a terminal in production and against a
//! scripted provider in tests.

use anyhow::{bail, Context, Result};
use std::io::{self, BufRead, Write};

pub trait DecisionProvider {
    /// Yes/no question
    fn confirm(&mut self, question: &str) -> Result<bool>;

    /// Pick one of `options`
    fn choose<'o>(&mut self, question: &str, options: &[&'o str]) -> Result<&'o str>;
}

/// Asks on stdout and reads answers from stdin until a valid one arrives
pub struct TerminalPrompt<R> {
    input: R,
}

impl TerminalPrompt<io::StdinLock<'static>> {
    pub fn stdin() -> Self {
        Self {
            input: io::stdin().lock(),
        }
    }
}

impl<R: BufRead> TerminalPrompt<R> {
    pub fn new(input: R) -> Self {
        Self { input }
    }

    fn ask(&mut self, prompt: &str) -> Result<String> {
        print!("{}", prompt);
        io::stdout().flush()?;

        let mut answer = String::new();
        let read = self
            .input
            .read_line(&mut answer)
            .context("reading answer from stdin")?;
        if read == 0 {
            bail!("stdin closed while waiting for an answer");
        }
        Ok(answer.trim().to_string())
    }
}

impl<R: BufRead> DecisionProvider for TerminalPrompt<R> {
    fn confirm(&mut self, question: &str) -> Result<bool> {
        let mut answer = self.ask(&format!("{} (y/n): ", question))?;
        loop {
            match answer.as_str() {
                "y" => return Ok(true),
                "n" => return Ok(false),
                _ => answer = self.ask("Please answer y/n: ")?,
            }
        }
    }

    fn choose<'o>(&mut self, question: &str, options: &[&'o str]) -> Result<&'o str> {
        let choices = options.join("/");
        let mut answer = self.ask(&format!("{} ({}): ", question, choices))?;
        loop {
            if let Some(choice) = options.iter().find(|option| **option == answer) {
                return Ok(*choice);
            }
            answer = self.ask(&format!("Please answer {}: ", choices))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirm_retries_until_valid() {
        let mut prompt = TerminalPrompt::new("maybe\nY\nn\n".as_bytes());
        assert!(!prompt.confirm("Restore?").unwrap());
    }

    #[test]
    fn test_choose_returns_option() {
        let mut prompt = TerminalPrompt::new("discard\nkeep\n".as_bytes());
        assert_eq!(prompt.choose("Fate?", &["rollback", "keep"]).unwrap(), "keep");
    }

    #[test]
    fn test_eof_is_an_error() {
        let mut prompt = TerminalPrompt::new("".as_bytes());
        assert!(prompt.confirm("Restore?").is_err());
    }
}
