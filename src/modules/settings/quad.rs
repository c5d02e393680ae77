// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// A four-valued user preference. The `Ask*` variants prompt in
/// interactive mode and resolve to their default in batch contexts.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum, Serialize, Deserialize)]
pub enum QuadOption {
    #[clap(name = "yes")]
    Yes,
    #[clap(name = "no")]
    No,
    #[clap(name = "ask-yes")]
    AskYes,
    #[clap(name = "ask-no")]
    AskNo,
}

impl QuadOption {
    pub fn wants_prompt(self) -> bool {
        matches!(self, QuadOption::AskYes | QuadOption::AskNo)
    }

    /// The answer a batch context resolves to without prompting.
    pub fn batch_answer(self) -> bool {
        matches!(self, QuadOption::Yes | QuadOption::AskYes)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn batch_resolution() {
        assert!(QuadOption::Yes.batch_answer());
        assert!(QuadOption::AskYes.batch_answer());
        assert!(!QuadOption::No.batch_answer());
        assert!(!QuadOption::AskNo.batch_answer());
        assert!(!QuadOption::Yes.wants_prompt());
        assert!(QuadOption::AskNo.wants_prompt());
    }
}
