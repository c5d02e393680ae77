// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use regex::Regex;
use tracing::warn;

use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailForgeResult;
use crate::modules::settings::scope::SessionOptions;
use crate::raise_error;

/// One hook line: a pattern matched against addresses and a `set`
/// command applied to the session options when it matches.
#[derive(Clone, Debug)]
pub struct HookRule {
    pattern: Regex,
    command: String,
}

impl HookRule {
    /// Parse `"PATTERN COMMAND..."`. The pattern is a case-insensitive
    /// regular expression; `.` matches every message.
    pub fn parse(line: &str) -> MailForgeResult<Self> {
        let trimmed = line.trim();
        let (pattern, command) = trimmed.split_once(char::is_whitespace).ok_or_else(|| {
            raise_error!(
                format!("Hook needs a pattern and a command: {:?}", line),
                ErrorCode::InvalidParameter
            )
        })?;
        let pattern = Regex::new(&format!("(?i){}", pattern)).map_err(|e| {
            raise_error!(
                format!("Bad hook pattern {:?}: {}", pattern, e),
                ErrorCode::InvalidParameter
            )
        })?;
        Ok(HookRule {
            pattern,
            command: command.trim().to_string(),
        })
    }

    pub fn matches(&self, addresses: &[String]) -> bool {
        addresses.iter().any(|a| self.pattern.is_match(a))
    }
}

pub fn parse_rules(lines: &[String]) -> Vec<HookRule> {
    lines
        .iter()
        .filter_map(|line| match HookRule::parse(line) {
            Ok(rule) => Some(rule),
            Err(e) => {
                warn!("Ignoring malformed hook {:?}: {}", line, e);
                None
            }
        })
        .collect()
}

/// Apply every matching rule in order. Assignment errors are logged
/// and skipped; a broken hook must not abort a send.
pub fn apply_hooks(rules: &[HookRule], addresses: &[String], options: &mut SessionOptions) {
    for rule in rules {
        if rule.matches(addresses) {
            if let Err(e) = options.apply_assignment(&rule.command) {
                warn!("Hook command failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::modules::settings::cli::Settings;

    #[test]
    fn matching_hook_changes_from() {
        let rules = parse_rules(&[
            "@work\\.example\\.com set from=me@work.example.com".to_string(),
            "@elsewhere\\.net set from=other@example.net".to_string(),
        ]);
        let mut opts = SessionOptions::from_settings(&Settings::new_for_test());
        apply_hooks(
            &rules,
            &["boss@work.example.com".to_string()],
            &mut opts,
        );
        assert_eq!(opts.from.as_deref(), Some("me@work.example.com"));
    }

    #[test]
    fn malformed_hooks_are_dropped() {
        let rules = parse_rules(&["just-a-pattern".to_string()]);
        assert!(rules.is_empty());
    }
}
