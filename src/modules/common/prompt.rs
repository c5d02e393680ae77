// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::collections::VecDeque;
use std::io::{BufRead, Write};

use crate::modules::settings::quad::QuadOption;

/// Outcome of a yes/no prompt. Cancel is distinct from No: a cancel
/// backs out of the surrounding operation entirely.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PromptAnswer {
    Yes,
    No,
    Cancel,
}

impl PromptAnswer {
    pub fn is_yes(&self) -> bool {
        *self == PromptAnswer::Yes
    }
}

/// The single seam between the pipeline and the terminal. Batch mode
/// and tests substitute non-interactive implementations, so every
/// prompt-driven path in the state machine is drivable from tests.
pub trait Prompter: Send {
    /// Resolve a quadoption, prompting only for the `Ask*` variants.
    fn ask_quad(&mut self, prompt: &str, option: QuadOption) -> PromptAnswer;

    /// Free-text entry with an editable initial value; None is cancel.
    fn ask_string(&mut self, prompt: &str, initial: &str) -> Option<String>;

    /// Pick one of several labeled choices; None is cancel.
    fn ask_choice(&mut self, prompt: &str, choices: &[&str]) -> Option<usize>;
}

/// Batch contexts never block: quadoptions take their batch answer,
/// strings keep their initial value, menus take the first entry.
pub struct BatchPrompter;

impl Prompter for BatchPrompter {
    fn ask_quad(&mut self, _prompt: &str, option: QuadOption) -> PromptAnswer {
        if option.batch_answer() {
            PromptAnswer::Yes
        } else {
            PromptAnswer::No
        }
    }

    fn ask_string(&mut self, _prompt: &str, initial: &str) -> Option<String> {
        Some(initial.to_string())
    }

    fn ask_choice(&mut self, _prompt: &str, _choices: &[&str]) -> Option<usize> {
        Some(0)
    }
}

/// Line-oriented terminal prompter.
pub struct StdPrompter;

impl StdPrompter {
    fn read_line(&self) -> Option<String> {
        let mut line = String::new();
        match std::io::stdin().lock().read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
            Err(_) => None,
        }
    }
}

impl Prompter for StdPrompter {
    fn ask_quad(&mut self, prompt: &str, option: QuadOption) -> PromptAnswer {
        if !option.wants_prompt() {
            return if option.batch_answer() {
                PromptAnswer::Yes
            } else {
                PromptAnswer::No
            };
        }
        let hint = if option.batch_answer() {
            "[Y/n]"
        } else {
            "[y/N]"
        };
        eprint!("{} {} ", prompt, hint);
        let _ = std::io::stderr().flush();
        match self.read_line() {
            None => PromptAnswer::Cancel,
            Some(line) => match line.trim().to_ascii_lowercase().as_str() {
                "" => {
                    if option.batch_answer() {
                        PromptAnswer::Yes
                    } else {
                        PromptAnswer::No
                    }
                }
                "y" | "yes" => PromptAnswer::Yes,
                "n" | "no" => PromptAnswer::No,
                _ => PromptAnswer::Cancel,
            },
        }
    }

    fn ask_string(&mut self, prompt: &str, initial: &str) -> Option<String> {
        if initial.is_empty() {
            eprint!("{}: ", prompt);
        } else {
            eprint!("{} [{}]: ", prompt, initial);
        }
        let _ = std::io::stderr().flush();
        match self.read_line() {
            None => None,
            Some(line) if line.is_empty() => Some(initial.to_string()),
            Some(line) => Some(line),
        }
    }

    fn ask_choice(&mut self, prompt: &str, choices: &[&str]) -> Option<usize> {
        for (i, choice) in choices.iter().enumerate() {
            eprintln!("  {}) {}", i + 1, choice);
        }
        eprint!("{}: ", prompt);
        let _ = std::io::stderr().flush();
        self.read_line()
            .and_then(|line| line.trim().parse::<usize>().ok())
            .filter(|n| (1..=choices.len()).contains(n))
            .map(|n| n - 1)
    }
}

/// Deterministic prompter fed a fixed answer script, for tests.
#[derive(Default)]
pub struct ScriptedPrompter {
    pub quad_answers: VecDeque<PromptAnswer>,
    pub string_answers: VecDeque<Option<String>>,
    pub choice_answers: VecDeque<Option<usize>>,
    pub transcript: Vec<String>,
}

impl ScriptedPrompter {
    pub fn new() -> Self {
        ScriptedPrompter::default()
    }

    pub fn answer_quad(mut self, answer: PromptAnswer) -> Self {
        self.quad_answers.push_back(answer);
        self
    }

    pub fn answer_string(mut self, answer: Option<&str>) -> Self {
        self.string_answers.push_back(answer.map(|s| s.to_string()));
        self
    }

    pub fn answer_choice(mut self, answer: Option<usize>) -> Self {
        self.choice_answers.push_back(answer);
        self
    }
}

impl Prompter for ScriptedPrompter {
    fn ask_quad(&mut self, prompt: &str, option: QuadOption) -> PromptAnswer {
        self.transcript.push(prompt.to_string());
        if !option.wants_prompt() {
            return if option.batch_answer() {
                PromptAnswer::Yes
            } else {
                PromptAnswer::No
            };
        }
        self.quad_answers.pop_front().unwrap_or_else(|| {
            if option.batch_answer() {
                PromptAnswer::Yes
            } else {
                PromptAnswer::No
            }
        })
    }

    fn ask_string(&mut self, prompt: &str, initial: &str) -> Option<String> {
        self.transcript.push(prompt.to_string());
        self.string_answers
            .pop_front()
            .unwrap_or_else(|| Some(initial.to_string()))
    }

    fn ask_choice(&mut self, prompt: &str, _choices: &[&str]) -> Option<usize> {
        self.transcript.push(prompt.to_string());
        self.choice_answers.pop_front().unwrap_or(Some(0))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn batch_prompter_follows_quad_defaults() {
        let mut p = BatchPrompter;
        assert!(p.ask_quad("send?", QuadOption::AskYes).is_yes());
        assert_eq!(p.ask_quad("send?", QuadOption::AskNo), PromptAnswer::No);
    }

    #[test]
    fn scripted_prompter_replays_answers() {
        let mut p = ScriptedPrompter::new()
            .answer_quad(PromptAnswer::No)
            .answer_string(Some("other"));
        assert_eq!(p.ask_quad("q", QuadOption::AskYes), PromptAnswer::No);
        assert_eq!(p.ask_string("s", "init"), Some("other".to_string()));
        assert_eq!(p.transcript, vec!["q", "s"]);
    }
}
