// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::fs::{self, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use mail_parser::mailbox::mbox::MessageIterator;
use tracing::debug;

use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailForgeResult;
use crate::raise_error;

/// The narrow mailbox contract the send pipeline needs: append for
/// Fcc/postpone, and message-id addressed lookup and flagging for the
/// replied-mark phase after a background resume.
pub trait MailStore {
    fn append(&self, raw: &[u8], envelope_from: &str) -> MailForgeResult<()>;
    fn first(&self) -> MailForgeResult<Option<Vec<u8>>>;
    fn find_by_message_id(&self, message_id: &str) -> MailForgeResult<Option<Vec<u8>>>;
    /// Returns false when the message is no longer present; the
    /// caller skips missing ids silently.
    fn set_replied(&self, message_id: &str) -> MailForgeResult<bool>;
    fn remove_by_message_id(&self, message_id: &str) -> MailForgeResult<bool>;
    fn count(&self) -> MailForgeResult<usize>;
}

/// A single-file mbox store with `>From` quoting and X-Status answer
/// flags, opened read-only or created on first append.
pub struct MboxStore {
    path: PathBuf,
}

impl MboxStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        MboxStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn messages(&self) -> MailForgeResult<Vec<Vec<u8>>> {
        let Ok(file) = fs::File::open(&self.path) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for message in MessageIterator::new(BufReader::new(file)) {
            match message {
                Ok(message) => out.push(message.unwrap_contents()),
                Err(_) => {
                    return Err(raise_error!(
                        format!("Malformed mbox file {:?}", self.path),
                        ErrorCode::MailboxOpenFailed
                    ))
                }
            }
        }
        Ok(out)
    }

    fn message_id_matches(raw: &[u8], wanted: &str) -> bool {
        mail_parser::MessageParser::default()
            .parse(raw)
            .and_then(|m| {
                m.message_id()
                    .map(|id| crate::modules::envelope::bracket_message_id(id) == wanted)
            })
            .unwrap_or(false)
    }

    /// Rewrite the mailbox with `transform` applied to the matching
    /// message (None drops it). Writes a sibling temp file and renames
    /// over the original.
    fn rewrite(
        &self,
        message_id: &str,
        transform: impl Fn(Vec<u8>) -> Option<Vec<u8>>,
    ) -> MailForgeResult<bool> {
        let messages = self.messages()?;
        let mut found = false;
        let mut out: Vec<u8> = Vec::new();
        for raw in messages {
            if !found && Self::message_id_matches(&raw, message_id) {
                found = true;
                match transform(raw) {
                    Some(updated) => append_one(&mut out, &updated, "MAILER-DAEMON"),
                    None => continue,
                }
            } else {
                append_one(&mut out, &raw, "MAILER-DAEMON");
            }
        }
        if !found {
            return Ok(false);
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &out).map_err(|e| {
            raise_error!(
                format!("Cannot write {:?}: {}", tmp, e),
                ErrorCode::FileOpenFailed
            )
        })?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            raise_error!(
                format!("Cannot rename {:?} over {:?}: {}", tmp, self.path, e),
                ErrorCode::FileRenameFailed
            )
        })?;
        Ok(true)
    }
}

fn append_one(out: &mut Vec<u8>, raw: &[u8], envelope_from: &str) {
    let date = Local::now().format("%a %b %e %T %Y");
    out.extend_from_slice(format!("From {} {}\n", envelope_from, date).as_bytes());
    for line in raw.split_inclusive(|&b| b == b'\n') {
        let body = line.strip_suffix(b"\n").unwrap_or(line);
        let unquoted = {
            let mut i = 0;
            while i < body.len() && body[i] == b'>' {
                i += 1;
            }
            &body[i..]
        };
        if unquoted.starts_with(b"From ") {
            out.push(b'>');
        }
        out.extend_from_slice(line);
    }
    if !out.ends_with(b"\n") {
        out.push(b'\n');
    }
    out.push(b'\n');
}

/// Insert or replace the `X-Status` answered flag in a raw message.
fn mark_answered(raw: Vec<u8>) -> Option<Vec<u8>> {
    let split = raw
        .windows(2)
        .position(|w| w == b"\n\n")
        .map(|i| i + 1)
        .unwrap_or(raw.len());
    let (headers, body) = raw.split_at(split);
    let mut out = Vec::with_capacity(raw.len() + 16);
    let mut replaced = false;
    for line in headers.split_inclusive(|&b| b == b'\n') {
        if line.to_ascii_lowercase().starts_with(b"x-status:") {
            let text = String::from_utf8_lossy(line);
            let (_, value) = text.split_once(':').unwrap_or(("", ""));
            let mut flags: String = value.trim().to_string();
            if !flags.contains('A') {
                flags.push('A');
            }
            out.extend_from_slice(format!("X-Status: {}\n", flags).as_bytes());
            replaced = true;
        } else {
            out.extend_from_slice(line);
        }
    }
    if !replaced {
        out.extend_from_slice(b"X-Status: A\n");
    }
    out.extend_from_slice(body);
    Some(out)
}

impl MailStore for MboxStore {
    fn append(&self, raw: &[u8], envelope_from: &str) -> MailForgeResult<()> {
        let mut buffer = Vec::with_capacity(raw.len() + 128);
        append_one(&mut buffer, raw, envelope_from);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| {
                raise_error!(
                    format!("Cannot open mailbox {:?}: {}", self.path, e),
                    ErrorCode::MailboxOpenFailed
                )
            })?;
        file.write_all(&buffer).map_err(|e| {
            raise_error!(
                format!("Cannot append to {:?}: {}", self.path, e),
                ErrorCode::FccWriteFailed
            )
        })?;
        debug!("Appended {} bytes to {:?}", buffer.len(), self.path);
        Ok(())
    }

    fn first(&self) -> MailForgeResult<Option<Vec<u8>>> {
        Ok(self.messages()?.into_iter().next())
    }

    fn find_by_message_id(&self, message_id: &str) -> MailForgeResult<Option<Vec<u8>>> {
        for raw in self.messages()? {
            if Self::message_id_matches(&raw, message_id) {
                return Ok(Some(raw));
            }
        }
        Ok(None)
    }

    fn set_replied(&self, message_id: &str) -> MailForgeResult<bool> {
        self.rewrite(message_id, mark_answered)
    }

    fn remove_by_message_id(&self, message_id: &str) -> MailForgeResult<bool> {
        self.rewrite(message_id, |_| None)
    }

    fn count(&self) -> MailForgeResult<usize> {
        Ok(self.messages()?.len())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const MSG_A: &[u8] = b"Message-ID: <a@example.com>\n\
Subject: first\n\
\n\
From a line that needs quoting\n";

    const MSG_B: &[u8] = b"Message-ID: <b@example.com>\n\
Subject: second\n\
\n\
body b\n";

    fn store() -> (tempfile::TempDir, MboxStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MboxStore::new(dir.path().join("box"));
        (dir, store)
    }

    #[test]
    fn append_and_find_round_trip() {
        let (_dir, store) = store();
        store.append(MSG_A, "me@example.com").unwrap();
        store.append(MSG_B, "me@example.com").unwrap();
        assert_eq!(store.count().unwrap(), 2);

        let found = store.find_by_message_id("<b@example.com>").unwrap().unwrap();
        let parsed = mail_parser::MessageParser::default().parse(&found[..]).unwrap();
        assert_eq!(parsed.subject(), Some("second"));
        // From-quoting survived the round trip.
        let a = store.find_by_message_id("<a@example.com>").unwrap().unwrap();
        assert!(String::from_utf8_lossy(&a).contains("From a line"));
    }

    #[test]
    fn set_replied_flags_only_the_target() {
        let (_dir, store) = store();
        store.append(MSG_A, "me@example.com").unwrap();
        store.append(MSG_B, "me@example.com").unwrap();

        assert!(store.set_replied("<a@example.com>").unwrap());
        let a = store.find_by_message_id("<a@example.com>").unwrap().unwrap();
        assert!(String::from_utf8_lossy(&a).contains("X-Status: A"));
        let b = store.find_by_message_id("<b@example.com>").unwrap().unwrap();
        assert!(!String::from_utf8_lossy(&b).contains("X-Status"));
    }

    #[test]
    fn missing_id_reports_false() {
        let (_dir, store) = store();
        store.append(MSG_A, "me@example.com").unwrap();
        assert!(!store.set_replied("<gone@example.com>").unwrap());
    }

    #[test]
    fn remove_deletes_exactly_one() {
        let (_dir, store) = store();
        store.append(MSG_A, "me@example.com").unwrap();
        store.append(MSG_B, "me@example.com").unwrap();
        assert!(store.remove_by_message_id("<a@example.com>").unwrap());
        assert_eq!(store.count().unwrap(), 1);
        assert!(store.find_by_message_id("<a@example.com>").unwrap().is_none());
    }
}
