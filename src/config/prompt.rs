//! Interactive prompts for values missing at SSE startup.

use std::io::{BufRead, Write};

use crate::config::handshake::strip_bom;

/// Asks the operator for a value.
pub trait Prompter {
    /// Asks `question` and returns the answer, or `default` when the answer
    /// is empty or cannot be read.
    fn ask(&mut self, question: &str, default: &str) -> String;
}

/// Prompts on stderr and reads answers from stdin.
///
/// stdout is left alone so it stays usable as a protocol stream.
#[derive(Debug, Default)]
pub struct StdinPrompter;

impl Prompter for StdinPrompter {
    fn ask(&mut self, question: &str, default: &str) -> String {
        let stdin = std::io::stdin();
        ask_with(&mut stdin.lock(), &mut std::io::stderr(), question, default)
    }
}

/// Prompts on `output` and reads one line from `input`.
pub fn ask_with<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    question: &str,
    default: &str,
) -> String {
    if let Err(e) = write!(output, "{question} (default: {default}): ").and_then(|()| output.flush()) {
        tracing::debug!(error = %e, "Failed to write prompt");
    }

    let mut line = String::new();
    match input.read_line(&mut line) {
        Ok(0) => default.to_string(),
        Ok(_) => {
            let answer = strip_bom(line.trim());
            if answer.is_empty() {
                default.to_string()
            } else {
                answer.to_string()
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read answer, using default");
            default.to_string()
        }
    }
}

/// Answers prompts from a fixed script; defaults once it runs out.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct ScriptedPrompter {
    answers: std::collections::VecDeque<String>,
    /// Questions asked so far.
    pub(crate) asked: Vec<String>,
}

#[cfg(test)]
impl ScriptedPrompter {
    /// Creates a prompter that replies with `answers` in order.
    pub(crate) fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: answers.into_iter().map(Into::into).collect(),
            asked: Vec::new(),
        }
    }
}

#[cfg(test)]
impl Prompter for ScriptedPrompter {
    fn ask(&mut self, question: &str, default: &str) -> String {
        self.asked.push(question.to_string());
        match self.answers.pop_front() {
            Some(answer) if !answer.is_empty() => answer,
            _ => default.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn answer_is_trimmed() {
        let mut out = Vec::new();
        let answer = ask_with(&mut Cursor::new("  9000 \n"), &mut out, "Port", "8080");
        assert_eq!(answer, "9000");
        assert_eq!(String::from_utf8(out).unwrap(), "Port (default: 8080): ");
    }

    #[test]
    fn empty_answer_uses_default() {
        let answer = ask_with(&mut Cursor::new("\n"), &mut Vec::new(), "Port", "8080");
        assert_eq!(answer, "8080");
    }

    #[test]
    fn eof_uses_default() {
        let answer = ask_with(&mut Cursor::new(""), &mut Vec::new(), "Port", "8080");
        assert_eq!(answer, "8080");
    }

    #[test]
    fn bom_is_stripped() {
        let answer = ask_with(&mut Cursor::new("\u{feff}Hi\n"), &mut Vec::new(), "Greeting", "Hello");
        assert_eq!(answer, "Hi");
    }

    #[test]
    fn scripted_prompter_records_questions() {
        let mut prompter = ScriptedPrompter::new(["a", ""]);
        assert_eq!(prompter.ask("one", "x"), "a");
        assert_eq!(prompter.ask("two", "y"), "y");
        assert_eq!(prompter.ask("three", "z"), "z");
        assert_eq!(prompter.asked, vec!["one", "two", "three"]);
    }
}
