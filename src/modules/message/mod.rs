// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::path::Path;

use crate::modules::crypto::SecurityFlags;
use crate::modules::envelope::write::HeaderWriteOptions;
use crate::modules::envelope::Envelope;
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailForgeResult;
use crate::modules::mime::body::{BodyArena, BodyId, ContentSource, MajorType};
use crate::modules::mime::parse::lower_message;
use crate::modules::mime::write::{assign_boundaries, write_message};
use crate::raise_error;

/// The message being built: envelope, owning body arena, the root of
/// the visible tree, and the draft's security state.
#[derive(Debug, Default)]
pub struct DraftMessage {
    pub envelope: Envelope,
    pub arena: BodyArena,
    pub root: Option<BodyId>,
    pub security: SecurityFlags,
}

impl DraftMessage {
    pub fn new() -> Self {
        DraftMessage::default()
    }

    /// A draft whose single text part is backed by `path`. The draft
    /// owns the file.
    pub fn with_text_file(path: &Path) -> Self {
        let mut draft = DraftMessage::new();
        let id = draft.arena.new_body();
        draft.arena[id].content = ContentSource::owned_file(path.to_path_buf());
        draft.arena[id].restamp();
        draft.root = Some(id);
        draft
    }

    pub fn root(&self) -> MailForgeResult<BodyId> {
        self.root.ok_or_else(|| {
            raise_error!("Draft has no body".into(), ErrorCode::BodyTreeCorrupt)
        })
    }

    /// The first text part: the "main" message text the editor works
    /// on, unless the user has deleted it.
    pub fn main_text(&self) -> Option<BodyId> {
        let root = self.root?;
        if self.arena[root].major == MajorType::Text {
            return Some(root);
        }
        self.arena
            .children(root)
            .into_iter()
            .find(|&id| self.arena[id].major == MajorType::Text)
    }

    /// Parse raw message bytes into a fresh draft (resume, draft-file
    /// sends).
    pub fn from_raw(raw: &[u8], tmpdir: &Path) -> MailForgeResult<Self> {
        let parsed = mail_parser::MessageParser::default()
            .parse(raw)
            .ok_or_else(|| {
                raise_error!(
                    "Cannot parse message".into(),
                    ErrorCode::MessageParseFailed
                )
            })?;
        let mut draft = DraftMessage::new();
        draft.envelope = Envelope::from_parsed(&parsed);
        draft.root = Some(lower_message(&mut draft.arena, &parsed, tmpdir)?);
        Ok(draft)
    }

    /// Render the complete wire image, assigning boundaries first.
    pub fn render(&mut self, opts: &HeaderWriteOptions) -> MailForgeResult<Vec<u8>> {
        let root = self.root()?;
        assign_boundaries(&mut self.arena, root)?;
        write_message(&self.envelope, &self.arena, root, opts)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::modules::utils::temp_message_file;
    use std::fs;

    #[test]
    fn text_file_draft_has_main_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_message_file(dir.path()).unwrap();
        fs::write(&path, b"hello\n").unwrap();
        let draft = DraftMessage::with_text_file(&path);
        assert_eq!(draft.main_text(), draft.root);
    }

    #[test]
    fn raw_round_trip_keeps_envelope_and_body() {
        let dir = tempfile::tempdir().unwrap();
        let raw = b"From: a@example.com\r\n\
To: b@example.com\r\n\
Subject: resumed\r\n\
Message-ID: <d1@example.com>\r\n\
Content-Type: text/plain\r\n\
\r\n\
draft body\r\n";
        let mut draft = DraftMessage::from_raw(raw, dir.path()).unwrap();
        assert_eq!(draft.envelope.subject.as_deref(), Some("resumed"));
        let main = draft.main_text().unwrap();
        let text = draft.arena.resolve_content(main, None).unwrap();
        assert_eq!(String::from_utf8_lossy(&text).trim(), "draft body");

        let wire = draft.render(&HeaderWriteOptions::default()).unwrap();
        let reparsed = mail_parser::MessageParser::default().parse(&wire[..]).unwrap();
        assert_eq!(reparsed.subject(), Some("resumed"));
    }
}
