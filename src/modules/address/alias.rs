// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::collections::HashMap;

use tracing::warn;

use crate::modules::address::{parse_address_list, Address};

/// Alias substitutions applied to recipient lists during send. Each
/// alias maps a short name to a parsed address list; expansion is
/// recursive with visited-marking to break cycles.
#[derive(Clone, Debug, Default)]
pub struct AliasTable {
    entries: HashMap<String, Vec<Address>>,
}

impl AliasTable {
    /// Build from `"name addr1, addr2"` definition lines. Malformed
    /// lines are logged and skipped.
    pub fn from_definitions(lines: &[String]) -> Self {
        let mut entries = HashMap::new();
        for line in lines {
            let Some((name, value)) = line.trim().split_once(char::is_whitespace) else {
                warn!("Ignoring malformed alias: {:?}", line);
                continue;
            };
            match parse_address_list(value.trim()) {
                Ok(list) => {
                    entries.insert(name.to_ascii_lowercase(), list);
                }
                Err(e) => warn!("Ignoring alias {:?}: {}", name, e),
            }
        }
        AliasTable { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Expand aliases in the list, recursively. A name already being
    /// expanded stops recursion instead of looping.
    pub fn expand(&self, list: Vec<Address>) -> Vec<Address> {
        let mut visiting = Vec::new();
        self.expand_inner(list, &mut visiting)
    }

    fn expand_inner(&self, list: Vec<Address>, visiting: &mut Vec<String>) -> Vec<Address> {
        let mut out = Vec::with_capacity(list.len());
        for addr in list {
            let key = addr
                .mailbox
                .as_deref()
                .map(|m| m.to_ascii_lowercase())
                .unwrap_or_default();
            // Only bare names without a domain are alias candidates.
            let expandable = !addr.group
                && !addr.is_group_terminator()
                && !key.contains('@')
                && self.entries.contains_key(&key);
            if expandable && !visiting.contains(&key) {
                visiting.push(key.clone());
                let substituted = self.entries.get(&key).cloned().unwrap_or_default();
                out.extend(self.expand_inner(substituted, visiting));
                visiting.pop();
            } else {
                out.push(addr);
            }
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::modules::address::mailboxes;

    #[test]
    fn expands_nested_aliases() {
        let table = AliasTable::from_definitions(&[
            "team alice@example.com, helpers".to_string(),
            "helpers bob@example.com, carol@example.com".to_string(),
        ]);
        let list = parse_address_list("team").unwrap();
        let expanded = table.expand(list);
        assert_eq!(
            mailboxes(&expanded),
            vec![
                "alice@example.com",
                "bob@example.com",
                "carol@example.com"
            ]
        );
    }

    #[test]
    fn cycles_do_not_loop() {
        let table = AliasTable::from_definitions(&[
            "a b".to_string(),
            "b a".to_string(),
        ]);
        let list = parse_address_list("a").unwrap();
        let expanded = table.expand(list);
        // The inner reference to the alias already being expanded is
        // kept verbatim.
        assert_eq!(mailboxes(&expanded), vec!["a"]);
    }

    #[test]
    fn addresses_with_domains_pass_through() {
        let table = AliasTable::from_definitions(&["team x@example.com".to_string()]);
        let list = parse_address_list("team@example.com").unwrap();
        let expanded = table.expand(list);
        assert_eq!(mailboxes(&expanded), vec!["team@example.com"]);
    }
}
