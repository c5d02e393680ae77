// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use chrono::Local;
use regex::Regex;

use crate::modules::address::{parse_address_list, Address};

pub mod write;

/// The header block of a message being built or inspected. Address
/// lists are ordered; `references` runs oldest-first so the newest
/// ancestor is the last element.
#[derive(Clone, Debug, Default)]
pub struct Envelope {
    pub from: Vec<Address>,
    pub sender: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub reply_to: Vec<Address>,
    pub mail_followup_to: Vec<Address>,
    pub subject: Option<String>,
    /// Byte offset into `subject` past any reply prefix. The real
    /// subject is a view, never a second allocation.
    real_subject_offset: usize,
    pub message_id: Option<String>,
    pub in_reply_to: Vec<String>,
    pub references: Vec<String>,
    /// Frozen once written so signatures cover the value on the wire.
    pub date: Option<String>,
    /// Raw `Name: value` user headers, order preserved.
    pub user_headers: Vec<String>,
    pub autocrypt: Option<String>,
    pub spam: Option<String>,
}

impl Envelope {
    pub fn new() -> Self {
        Envelope::default()
    }

    /// Set the subject and locate the real subject behind any reply
    /// prefix recognized by `reply_regexp`.
    pub fn set_subject(&mut self, subject: &str, reply_regexp: &str) {
        let offset = Regex::new(&format!("(?i){}", reply_regexp))
            .ok()
            .and_then(|re| re.find(subject))
            .filter(|m| m.start() == 0)
            .map(|m| m.end())
            .unwrap_or(0);
        self.subject = Some(subject.to_string());
        self.real_subject_offset = offset;
    }

    /// The subject with any reply prefix stripped; empty when no
    /// subject is set.
    pub fn real_subject(&self) -> &str {
        match &self.subject {
            Some(subject) => &subject[self.real_subject_offset..],
            None => "",
        }
    }

    pub fn has_reply_prefix(&self) -> bool {
        self.real_subject_offset > 0
    }

    /// Freeze the Date header at the current local time if not yet
    /// materialized, and return it. Repeated calls reuse the frozen
    /// value so signing and wire output agree.
    pub fn date_header(&mut self) -> &str {
        if self.date.is_none() {
            self.date = Some(Local::now().to_rfc2822());
        }
        self.date.as_deref().unwrap_or_default()
    }

    /// All recipient mailboxes in to, cc, bcc order.
    pub fn recipients(&self) -> Vec<Address> {
        self.to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .filter(|a| !a.group && !a.is_group_terminator())
            .cloned()
            .collect()
    }

    pub fn has_recipients(&self) -> bool {
        !self.recipients().is_empty()
    }

    /// Lower a parsed message header into the send-side model.
    pub fn from_parsed(message: &mail_parser::Message<'_>) -> Self {
        let mut env = Envelope::new();
        env.from = lower_addresses(message.from());
        env.sender = lower_addresses(message.sender());
        env.to = lower_addresses(message.to());
        env.cc = lower_addresses(message.cc());
        env.bcc = lower_addresses(message.bcc());
        env.reply_to = lower_addresses(message.reply_to());
        if let Some(subject) = message.subject() {
            env.subject = Some(subject.to_string());
        }
        env.message_id = message.message_id().map(|id| bracket_message_id(id));
        env.in_reply_to = lower_id_list(message.in_reply_to());
        env.references = lower_id_list(message.references());
        env.date = message.date().map(|d| d.to_rfc822());
        for header in message.headers() {
            let name = header.name();
            if name.eq_ignore_ascii_case("mail-followup-to") {
                if let Some(raw) = header.value().as_text() {
                    if let Ok(list) = parse_address_list(raw) {
                        env.mail_followup_to = list;
                    }
                }
            } else if name.starts_with("X-") && !name.starts_with("X-MailForge-") {
                if let Some(raw) = header.value().as_text() {
                    env.user_headers.push(format!("{}: {}", name, raw));
                }
            } else if name.eq_ignore_ascii_case("autocrypt") {
                env.autocrypt = header.value().as_text().map(|t| t.to_string());
            }
        }
        env
    }
}

fn lower_addresses(addr: Option<&mail_parser::Address<'_>>) -> Vec<Address> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        mail_parser::Address::List(list) => list.iter().map(lower_addr).collect(),
        mail_parser::Address::Group(groups) => {
            let mut out = Vec::new();
            for group in groups {
                out.push(Address {
                    personal: None,
                    mailbox: Some(group.name.clone().unwrap_or_default().to_string()),
                    group: true,
                    intl_checked: false,
                });
                out.extend(group.addresses.iter().map(lower_addr));
                out.push(Address::group_terminator());
            }
            out
        }
    }
}

fn lower_addr(addr: &mail_parser::Addr<'_>) -> Address {
    Address {
        personal: addr.name.as_ref().map(|n| n.to_string()),
        mailbox: addr.address.as_ref().map(|a| a.to_string()),
        group: false,
        intl_checked: false,
    }
}

fn lower_id_list(value: &mail_parser::HeaderValue<'_>) -> Vec<String> {
    match value {
        mail_parser::HeaderValue::Text(id) => vec![bracket_message_id(id.as_ref())],
        mail_parser::HeaderValue::TextList(ids) => {
            ids.iter().map(|id| bracket_message_id(id.as_ref())).collect()
        }
        _ => Vec::new(),
    }
}

/// mail-parser strips the angle brackets; the model keeps them.
pub fn bracket_message_id(id: &str) -> String {
    let trimmed = id.trim();
    if trimmed.starts_with('<') {
        trimmed.to_string()
    } else {
        format!("<{}>", trimmed)
    }
}

/// A valid Message-ID is bracketed, carries an `@`, and contains no
/// whitespace or control bytes.
pub fn is_valid_message_id(id: &str) -> bool {
    id.len() > 4
        && id.starts_with('<')
        && id.ends_with('>')
        && id.contains('@')
        && !id
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn real_subject_skips_reply_prefix() {
        let mut env = Envelope::new();
        env.set_subject("Re: the plan", r"^(re(\[[0-9]+\])*|aw):[ \t]*");
        assert_eq!(env.real_subject(), "the plan");
        assert!(env.has_reply_prefix());

        env.set_subject("the plan", r"^(re(\[[0-9]+\])*|aw):[ \t]*");
        assert_eq!(env.real_subject(), "the plan");
        assert!(!env.has_reply_prefix());
    }

    #[test]
    fn date_header_is_frozen() {
        let mut env = Envelope::new();
        let first = env.date_header().to_string();
        let second = env.date_header().to_string();
        assert_eq!(first, second);
    }

    #[test]
    fn message_id_validity() {
        assert!(is_valid_message_id("<1712.abc@example.com>"));
        assert!(!is_valid_message_id("1712.abc@example.com"));
        assert!(!is_valid_message_id("<no-at-sign>"));
        assert!(!is_valid_message_id("<sp ace@example.com>"));
    }

    #[test]
    fn parsed_message_lowers_to_envelope() {
        let raw = b"From: Jane <jane@example.com>\r\n\
To: bob@example.org\r\n\
Subject: Re: hello\r\n\
Message-ID: <m1@example.com>\r\n\
References: <r1@example.com> <r2@example.com>\r\n\
In-Reply-To: <r2@example.com>\r\n\
\r\n\
body\r\n";
        let message = mail_parser::MessageParser::default().parse(&raw[..]).unwrap();
        let env = Envelope::from_parsed(&message);
        assert_eq!(env.from[0].mailbox.as_deref(), Some("jane@example.com"));
        assert_eq!(env.message_id.as_deref(), Some("<m1@example.com>"));
        assert_eq!(
            env.references,
            vec!["<r1@example.com>", "<r2@example.com>"]
        );
        assert_eq!(env.in_reply_to, vec!["<r2@example.com>"]);
    }
}
