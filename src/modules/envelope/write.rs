// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::address::{write_address_list, Address};
use crate::modules::envelope::Envelope;

const FOLD_WIDTH: usize = 78;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LineEnding {
    /// Local delivery and the sendmail pipe.
    Lf,
    /// SMTP submission and signing canonicalization.
    CrLf,
}

impl LineEnding {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
        }
    }
}

#[derive(Clone, Debug)]
pub struct HeaderWriteOptions {
    pub line_ending: LineEnding,
    pub write_bcc: bool,
    /// Extra user headers appended verbatim (postpone bookkeeping).
    pub extra_headers: Vec<String>,
}

impl Default for HeaderWriteOptions {
    fn default() -> Self {
        HeaderWriteOptions {
            line_ending: LineEnding::Lf,
            write_bcc: false,
            extra_headers: Vec::new(),
        }
    }
}

/// Fold one header onto continuation lines at comma or whitespace
/// boundaries, staying under the soft limit where the value allows.
pub fn fold_header(name: &str, value: &str, eol: &str) -> String {
    let mut out = String::new();
    out.push_str(name);
    out.push_str(": ");
    let mut col = name.len() + 2;
    let mut first = true;
    for word in split_foldable(value) {
        if !first && col + word.len() > FOLD_WIDTH {
            out.push_str(eol);
            out.push('\t');
            col = 8;
        } else if !first {
            out.push(' ');
            col += 1;
        }
        out.push_str(word);
        col += word.len();
        first = false;
    }
    out.push_str(eol);
    out
}

/// Break a value into units that may not be split further: words, with
/// a trailing comma kept attached to the word before it.
fn split_foldable(value: &str) -> Vec<&str> {
    value.split_whitespace().collect()
}

fn write_address_header(
    out: &mut String,
    name: &str,
    list: &[Address],
    eol: &str,
) {
    if list.is_empty() {
        return;
    }
    let value = write_address_list(list, true);
    if value.is_empty() {
        return;
    }
    out.push_str(&fold_header(name, &value, eol));
}

/// Render the envelope to RFC 5322 header lines, ending with the blank
/// separator line. The Date value must already be frozen by the
/// caller; an envelope without one gets no Date header at all.
pub fn write_headers(env: &Envelope, opts: &HeaderWriteOptions) -> String {
    let eol = opts.line_ending.as_str();
    let mut out = String::new();

    if let Some(date) = &env.date {
        out.push_str(&fold_header("Date", date, eol));
    }
    write_address_header(&mut out, "From", &env.from, eol);
    if !env.sender.is_empty()
        && !(env.from.len() == 1
            && env.sender.len() == 1
            && env.from[0].same_mailbox(&env.sender[0]))
    {
        write_address_header(&mut out, "Sender", &env.sender, eol);
    }
    write_address_header(&mut out, "To", &env.to, eol);
    write_address_header(&mut out, "Cc", &env.cc, eol);
    if opts.write_bcc {
        write_address_header(&mut out, "Bcc", &env.bcc, eol);
    }
    write_address_header(&mut out, "Reply-To", &env.reply_to, eol);
    write_address_header(&mut out, "Mail-Followup-To", &env.mail_followup_to, eol);
    if let Some(subject) = &env.subject {
        out.push_str(&fold_header("Subject", subject, eol));
    }
    if let Some(id) = &env.message_id {
        out.push_str(&fold_header("Message-ID", id, eol));
    }
    if !env.in_reply_to.is_empty() {
        out.push_str(&fold_header("In-Reply-To", &env.in_reply_to.join(" "), eol));
    }
    if !env.references.is_empty() {
        out.push_str(&fold_header("References", &env.references.join(" "), eol));
    }
    if let Some(autocrypt) = &env.autocrypt {
        out.push_str(&fold_header("Autocrypt", autocrypt, eol));
    }
    for header in env.user_headers.iter().chain(opts.extra_headers.iter()) {
        match header.split_once(':') {
            Some((name, value)) => {
                out.push_str(&fold_header(name.trim(), value.trim(), eol))
            }
            None => {
                out.push_str(header);
                out.push_str(eol);
            }
        }
    }
    out.push_str("MIME-Version: 1.0");
    out.push_str(eol);
    out
}

/// The header subset copied into a protected part so an intermediary
/// rewriting the outer envelope cannot spoof them.
pub fn write_protected_headers(env: &Envelope, eol: &str) -> String {
    let mut out = String::new();
    if let Some(date) = &env.date {
        out.push_str(&fold_header("Date", date, eol));
    }
    write_address_header(&mut out, "From", &env.from, eol);
    write_address_header(&mut out, "To", &env.to, eol);
    write_address_header(&mut out, "Cc", &env.cc, eol);
    write_address_header(&mut out, "Reply-To", &env.reply_to, eol);
    if let Some(subject) = &env.subject {
        out.push_str(&fold_header("Subject", subject, eol));
    }
    if let Some(id) = &env.message_id {
        out.push_str(&fold_header("Message-ID", id, eol));
    }
    if !env.in_reply_to.is_empty() {
        out.push_str(&fold_header("In-Reply-To", &env.in_reply_to.join(" "), eol));
    }
    if !env.references.is_empty() {
        out.push_str(&fold_header("References", &env.references.join(" "), eol));
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::modules::address::parse_address_list;

    fn sample() -> Envelope {
        let mut env = Envelope::new();
        env.from = parse_address_list("Jane <jane@example.com>").unwrap();
        env.to = parse_address_list("bob@example.org").unwrap();
        env.bcc = parse_address_list("secret@example.org").unwrap();
        env.subject = Some("hello".to_string());
        env.message_id = Some("<m1@example.com>".to_string());
        env
    }

    #[test]
    fn bcc_is_withheld_by_default() {
        let out = write_headers(&sample(), &HeaderWriteOptions::default());
        assert!(!out.contains("Bcc:"));
        let with_bcc = write_headers(
            &sample(),
            &HeaderWriteOptions {
                write_bcc: true,
                ..Default::default()
            },
        );
        assert!(with_bcc.contains("Bcc: secret@example.org"));
    }

    #[test]
    fn folding_stays_under_limit_for_long_lists() {
        let many = (0..20)
            .map(|i| format!("person{}@longdomainname.example.org", i))
            .collect::<Vec<_>>()
            .join(", ");
        let folded = fold_header("To", &many, "\n");
        for line in folded.lines() {
            assert!(line.len() <= FOLD_WIDTH + 40, "line too long: {}", line);
        }
        assert!(folded.contains("\n\t"));
    }

    #[test]
    fn round_trip_through_parser() {
        let mut env = sample();
        env.references = vec!["<r1@example.com>".into(), "<r2@example.com>".into()];
        env.in_reply_to = vec!["<r2@example.com>".into()];
        let mut wire = write_headers(
            &env,
            &HeaderWriteOptions {
                write_bcc: true,
                ..Default::default()
            },
        );
        wire.push('\n');
        wire.push_str("body\n");
        let parsed = mail_parser::MessageParser::default()
            .parse(wire.as_bytes())
            .unwrap();
        let round = Envelope::from_parsed(&parsed);
        assert_eq!(round.subject.as_deref(), Some("hello"));
        assert_eq!(round.message_id, env.message_id);
        assert_eq!(round.references, env.references);
        assert_eq!(
            round.from[0].mailbox.as_deref(),
            Some("jane@example.com")
        );
        assert_eq!(round.bcc[0].mailbox.as_deref(), Some("secret@example.org"));
    }

    #[test]
    fn crlf_mode_terminates_every_line() {
        let out = write_headers(
            &sample(),
            &HeaderWriteOptions {
                line_ending: LineEnding::CrLf,
                ..Default::default()
            },
        );
        for line in out.split_inclusive("\r\n") {
            assert!(line.ends_with("\r\n"));
        }
    }
}
