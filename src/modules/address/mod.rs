// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::fmt;

use itertools::Itertools;

use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailForgeResult;
use crate::modules::settings::scope::SessionOptions;
use crate::raise_error;

pub mod alias;
pub mod idna;

/// One entry of an ordered address list. A group opener carries the
/// group's display name in `mailbox` with `group` set; the matching
/// terminator has no mailbox at all.
#[derive(Clone, Debug, Default)]
pub struct Address {
    pub personal: Option<String>,
    pub mailbox: Option<String>,
    pub group: bool,
    /// Set once the mailbox has been through the IDNA check; §idna
    /// round-trips compare equal modulo this flag.
    pub intl_checked: bool,
}

impl Address {
    pub fn new(personal: Option<&str>, mailbox: &str) -> Self {
        Address {
            personal: personal.map(|p| p.to_string()),
            mailbox: Some(mailbox.to_string()),
            group: false,
            intl_checked: false,
        }
    }

    pub fn group_terminator() -> Self {
        Address::default()
    }

    pub fn is_group_terminator(&self) -> bool {
        self.mailbox.is_none() && !self.group
    }

    /// Case-insensitive mailbox equality; display names do not count.
    pub fn same_mailbox(&self, other: &Address) -> bool {
        match (&self.mailbox, &other.mailbox) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => false,
        }
    }

    pub fn matches_str(&self, mailbox: &str) -> bool {
        self.mailbox
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case(mailbox))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.personal, &self.mailbox) {
            (Some(personal), Some(mailbox)) if self.group => {
                write!(f, "{} {}:", quote_personal(personal), mailbox)
            }
            (None, Some(mailbox)) if self.group => write!(f, "{}:", mailbox),
            (Some(personal), Some(mailbox)) => {
                write!(f, "{} <{}>", quote_personal(personal), mailbox)
            }
            (None, Some(mailbox)) => write!(f, "{}", mailbox),
            _ => write!(f, ";"),
        }
    }
}

/// Quote a display name when it contains RFC 5322 specials.
fn quote_personal(personal: &str) -> String {
    let needs_quoting = personal
        .chars()
        .any(|c| "()<>[]:;@\\,.\"".contains(c));
    if !needs_quoting {
        return personal.to_string();
    }
    let mut out = String::with_capacity(personal.len() + 2);
    out.push('"');
    for c in personal.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

#[derive(Debug, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    Comma,
    Colon,
    Semicolon,
    AngleOpen,
    AngleClose,
}

/// Tokenize a header value, honoring quoted strings and dropping
/// comments. A comma inside quotes or a comment never splits.
fn tokenize(input: &str) -> MailForgeResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    let mut word = String::new();

    macro_rules! flush {
        () => {
            if !word.is_empty() {
                tokens.push(Token::Word(std::mem::take(&mut word)));
            }
        };
    }

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                flush!();
                let mut quoted = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => {
                            if let Some(escaped) = chars.next() {
                                quoted.push(escaped);
                            }
                        }
                        Some('"') => break,
                        Some(inner) => quoted.push(inner),
                        None => {
                            return Err(raise_error!(
                                format!("Unterminated quote in address: {}", input),
                                ErrorCode::InvalidAddress
                            ))
                        }
                    }
                }
                tokens.push(Token::Quoted(quoted));
            }
            '(' => {
                flush!();
                let mut depth = 1usize;
                let mut comment = String::new();
                for inner in chars.by_ref() {
                    match inner {
                        '(' => depth += 1,
                        ')' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                    if depth > 0 {
                        comment.push(inner);
                    }
                }
                if depth != 0 {
                    return Err(raise_error!(
                        format!("Unterminated comment in address: {}", input),
                        ErrorCode::InvalidAddress
                    ));
                }
                // An old-style "addr (Name)" form keeps the comment as
                // the display name.
                tokens.push(Token::Quoted(comment.trim().to_string()));
            }
            ',' => {
                flush!();
                tokens.push(Token::Comma);
            }
            ':' => {
                flush!();
                tokens.push(Token::Colon);
            }
            ';' => {
                flush!();
                tokens.push(Token::Semicolon);
            }
            '<' => {
                flush!();
                tokens.push(Token::AngleOpen);
            }
            '>' => {
                flush!();
                tokens.push(Token::AngleClose);
            }
            c if c.is_whitespace() => flush!(),
            _ => word.push(c),
        }
    }
    flush!();
    Ok(tokens)
}

/// Parse a comma-separated header value into an ordered address list.
/// Group syntax (`name: a, b;`) is preserved through opener and
/// terminator entries.
pub fn parse_address_list(input: &str) -> MailForgeResult<Vec<Address>> {
    let tokens = tokenize(input)?;
    let mut out: Vec<Address> = Vec::new();
    // Accumulated phrase words and an optional comment-style name.
    let mut phrase: Vec<String> = Vec::new();
    let mut trailing_name: Option<String> = None;
    let mut in_group = false;

    macro_rules! flush_simple {
        () => {
            if !phrase.is_empty() {
                let mailbox = phrase.join("");
                out.push(Address {
                    personal: trailing_name.take().filter(|n| !n.is_empty()),
                    mailbox: Some(mailbox),
                    group: false,
                    intl_checked: false,
                });
                phrase.clear();
            } else {
                trailing_name = None;
            }
        };
    }

    let mut iter = tokens.into_iter().peekable();
    while let Some(token) = iter.next() {
        match token {
            Token::Word(w) => phrase.push(w),
            Token::Quoted(q) => {
                if phrase.is_empty() && iter.peek() == Some(&Token::AngleOpen) {
                    phrase.push(q);
                } else {
                    trailing_name = Some(q);
                }
            }
            Token::AngleOpen => {
                // Everything so far was the display name.
                let personal = if phrase.is_empty() {
                    trailing_name.take()
                } else {
                    Some(phrase.join(" "))
                };
                phrase.clear();
                let mut route_addr = String::new();
                loop {
                    match iter.next() {
                        Some(Token::AngleClose) => break,
                        Some(Token::Word(w)) => route_addr.push_str(&w),
                        Some(Token::Quoted(q)) => route_addr.push_str(&q),
                        Some(Token::Comma) => route_addr.push(','),
                        Some(Token::Colon) => route_addr.push(':'),
                        Some(_) | None => {
                            return Err(raise_error!(
                                format!("Unterminated angle address: {}", input),
                                ErrorCode::InvalidAddress
                            ))
                        }
                    }
                }
                out.push(Address {
                    personal: personal.filter(|p| !p.is_empty()),
                    mailbox: Some(route_addr),
                    group: false,
                    intl_checked: false,
                });
            }
            Token::Colon => {
                let name = if phrase.is_empty() {
                    trailing_name.take().unwrap_or_default()
                } else {
                    phrase.join(" ")
                };
                phrase.clear();
                out.push(Address {
                    personal: None,
                    mailbox: Some(name),
                    group: true,
                    intl_checked: false,
                });
                in_group = true;
            }
            Token::Semicolon => {
                flush_simple!();
                out.push(Address::group_terminator());
                in_group = false;
            }
            Token::Comma => flush_simple!(),
            Token::AngleClose => {
                return Err(raise_error!(
                    format!("Unexpected '>' in address: {}", input),
                    ErrorCode::InvalidAddress
                ))
            }
        }
    }
    flush_simple!();
    if in_group {
        out.push(Address::group_terminator());
    }
    Ok(out)
}

/// Render a list back to header-value form. Group members stay between
/// their opener and the `;`.
pub fn write_address_list(list: &[Address], include_personal: bool) -> String {
    let mut out = String::new();
    let mut in_group = false;
    for (i, addr) in list.iter().enumerate() {
        if addr.is_group_terminator() {
            out.push(';');
            in_group = false;
            continue;
        }
        if i > 0 && !out.is_empty() && !out.ends_with(": ") {
            if !in_group || !list[i - 1].group {
                out.push_str(", ");
            }
        }
        if addr.group {
            let name = addr.mailbox.clone().unwrap_or_default();
            out.push_str(&name);
            out.push_str(": ");
            in_group = true;
            continue;
        }
        if include_personal {
            out.push_str(&addr.to_string());
        } else if let Some(mailbox) = &addr.mailbox {
            out.push_str(mailbox);
        }
    }
    // A trailing ", ;" reads better as ";".
    out.replace(", ;", ";")
}

/// Drop later duplicates, preserving first occurrence. Group markers
/// are never considered duplicates of anything.
pub fn dedupe(list: &mut Vec<Address>) {
    let mut seen: Vec<String> = Vec::new();
    list.retain(|addr| match &addr.mailbox {
        Some(mailbox) if !addr.group => {
            let key = mailbox.to_ascii_lowercase();
            if seen.contains(&key) {
                false
            } else {
                seen.push(key);
                true
            }
        }
        _ => true,
    });
}

/// Remove from `b` every address present in `a`.
pub fn remove_xrefs(a: &[Address], b: &mut Vec<Address>) {
    b.retain(|candidate| {
        candidate.mailbox.is_none()
            || candidate.group
            || !a.iter().any(|held| held.same_mailbox(candidate))
    });
}

/// True when the address is the local user (From or an alternate).
pub fn is_user(addr: &Address, options: &SessionOptions) -> bool {
    let Some(mailbox) = &addr.mailbox else {
        return false;
    };
    if mailbox.eq_ignore_ascii_case(&options.user) {
        return true;
    }
    if let Some(from) = &options.from {
        if let Ok(parsed) = parse_address_list(from) {
            if parsed.iter().any(|a| a.matches_str(mailbox)) {
                return true;
            }
        }
    }
    options
        .alternates
        .iter()
        .any(|alt| alt.eq_ignore_ascii_case(mailbox))
}

/// Strip the local user from the list. With `leave_only`, a list that
/// would become empty keeps one self-address instead.
pub fn remove_user(list: &mut Vec<Address>, leave_only: bool, options: &SessionOptions) {
    let had_user = list.iter().any(|a| is_user(a, options));
    let first_user = list.iter().find(|a| is_user(a, options)).cloned();
    list.retain(|a| a.is_group_terminator() || a.group || !is_user(a, options));
    if leave_only && had_user && list.iter().all(|a| a.mailbox.is_none() || a.group) {
        if let Some(user) = first_user {
            list.push(user);
        }
    }
}

fn matches_pattern(mailbox: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| {
        !p.is_empty()
            && (mailbox.eq_ignore_ascii_case(p)
                || mailbox.to_ascii_lowercase().contains(&p.to_ascii_lowercase()))
    })
}

pub fn is_mail_list(addr: &Address, options: &SessionOptions) -> bool {
    addr.mailbox
        .as_deref()
        .is_some_and(|m| matches_pattern(m, &options.lists) || matches_pattern(m, &options.subscribed))
}

pub fn is_subscribed_list(addr: &Address, options: &SessionOptions) -> bool {
    addr.mailbox
        .as_deref()
        .is_some_and(|m| matches_pattern(m, &options.subscribed))
}

/// The subset of `to ∪ cc` that is a known mailing list and not a
/// group marker.
pub fn find_mailing_lists<'a>(
    to: &'a [Address],
    cc: &'a [Address],
    options: &SessionOptions,
) -> Vec<&'a Address> {
    to.iter()
        .chain(cc.iter())
        .filter(|a| !a.group && !a.is_group_terminator() && is_mail_list(a, options))
        .collect()
}

/// All concrete mailboxes in a list, skipping group markers.
pub fn mailboxes(list: &[Address]) -> Vec<String> {
    list.iter()
        .filter(|a| !a.group)
        .filter_map(|a| a.mailbox.clone())
        .unique()
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::modules::settings::cli::Settings;

    fn options() -> SessionOptions {
        let mut opts = SessionOptions::from_settings(&Settings::new_for_test());
        opts.user = "me@example.com".to_string();
        opts.alternates = vec!["me@alt.example.com".to_string()];
        opts
    }

    #[test]
    fn parses_display_name_and_angle_address() {
        let list = parse_address_list("Jane Doe <jane@example.com>").unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].personal.as_deref(), Some("Jane Doe"));
        assert_eq!(list[0].mailbox.as_deref(), Some("jane@example.com"));
    }

    #[test]
    fn comma_inside_quotes_does_not_split() {
        let list = parse_address_list(r#""Doe, Jane" <jane@example.com>, bob@example.org"#)
            .unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].personal.as_deref(), Some("Doe, Jane"));
        assert_eq!(list[1].mailbox.as_deref(), Some("bob@example.org"));
    }

    #[test]
    fn group_syntax_round_trips() {
        let list = parse_address_list("friends: a@example.com, b@example.com;").unwrap();
        assert!(list[0].group);
        assert!(list[3].is_group_terminator());
        let written = write_address_list(&list, false);
        assert_eq!(written, "friends: a@example.com, b@example.com;");
    }

    #[test]
    fn old_style_comment_becomes_personal() {
        let list = parse_address_list("jane@example.com (Jane Doe)").unwrap();
        assert_eq!(list[0].personal.as_deref(), Some("Jane Doe"));
        assert_eq!(list[0].mailbox.as_deref(), Some("jane@example.com"));
    }

    #[test]
    fn dedupe_is_idempotent() {
        let mut list = parse_address_list("a@x.org, B@x.org, A@X.ORG, b@x.org").unwrap();
        dedupe(&mut list);
        assert_eq!(mailboxes(&list), vec!["a@x.org", "B@x.org"]);
        let snapshot = mailboxes(&list);
        dedupe(&mut list);
        assert_eq!(mailboxes(&list), snapshot);
    }

    #[test]
    fn xref_removal_leaves_no_intersection() {
        let a = parse_address_list("a@x.org, c@x.org").unwrap();
        let mut b = parse_address_list("a@x.org, b@x.org, C@X.ORG").unwrap();
        remove_xrefs(&a, &mut b);
        assert_eq!(mailboxes(&b), vec!["b@x.org"]);
        assert!(b.iter().all(|addr| !a.iter().any(|h| h.same_mailbox(addr))));
    }

    #[test]
    fn remove_user_keeps_one_self_address_when_asked() {
        let mut list = parse_address_list("me@example.com, me@alt.example.com").unwrap();
        remove_user(&mut list, true, &options());
        assert_eq!(mailboxes(&list), vec!["me@example.com"]);

        let mut list = parse_address_list("me@example.com, other@example.net").unwrap();
        remove_user(&mut list, true, &options());
        assert_eq!(mailboxes(&list), vec!["other@example.net"]);
    }

    #[test]
    fn finds_mailing_lists_excluding_group_markers() {
        let mut opts = options();
        opts.lists = vec!["dev@lists.example.com".to_string()];
        let to = parse_address_list("dev@lists.example.com").unwrap();
        let cc = parse_address_list("friends: x@example.com;").unwrap();
        let found = find_mailing_lists(&to, &cc, &opts);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].mailbox.as_deref(), Some("dev@lists.example.com"));
    }
}
