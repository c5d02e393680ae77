// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::path::Path;

use mime_guess::MimeGuess;

use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailForgeResult;
use crate::modules::message::DraftMessage;
use crate::modules::mime::body::{
    BodyId, ContentSource, Disposition, MajorType,
};
use crate::modules::mime::encoding::update_encoding;
use crate::modules::utils::temp_message_file;
use crate::raise_error;

/// One visible row of the compose attachment list.
#[derive(Clone, Debug)]
pub struct AttachEntry {
    pub body: BodyId,
    pub parent: Option<BodyId>,
    pub level: usize,
}

/// The tree-aware, ordered attachment list backing the compose view.
/// The vector is a flattened preorder walk; `parent` links let move
/// and delete operations re-link the arena correctly.
#[derive(Debug, Default)]
pub struct AttachCtx {
    entries: Vec<AttachEntry>,
}

impl AttachCtx {
    pub fn new() -> Self {
        AttachCtx::default()
    }

    /// Re-derive the visible list from the current tree.
    pub fn rebuild(&mut self, draft: &DraftMessage) {
        self.entries.clear();
        let Some(root) = draft.root else {
            return;
        };
        if draft.arena[root].major == MajorType::Multipart {
            for child in draft.arena.children(root) {
                self.push_subtree(draft, child, Some(root), 0);
            }
        } else {
            self.push_subtree(draft, root, None, 0);
        }
    }

    fn push_subtree(
        &mut self,
        draft: &DraftMessage,
        id: BodyId,
        parent: Option<BodyId>,
        level: usize,
    ) {
        self.entries.push(AttachEntry {
            body: id,
            parent,
            level,
        });
        for child in draft.arena.children(id) {
            self.push_subtree(draft, child, Some(id), level + 1);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, index: usize) -> MailForgeResult<&AttachEntry> {
        self.entries.get(index).ok_or_else(|| {
            raise_error!(
                format!("No attachment at position {}", index + 1),
                ErrorCode::InvalidParameter
            )
        })
    }

    /// Attachments beyond the main text exist iff more than one entry
    /// is visible.
    pub fn has_attachments(&self) -> bool {
        self.entries.len() > 1
    }

    /// Ensure the root can take additional siblings; wraps a bare part
    /// into multipart/mixed on the first attach.
    fn ensure_mixed(draft: &mut DraftMessage) -> MailForgeResult<BodyId> {
        let root = draft.root()?;
        if draft.arena[root].major == MajorType::Multipart
            && draft.arena[root].subtype == "mixed"
        {
            return Ok(root);
        }
        let wrapper = draft.arena.make_multipart_mixed(root);
        draft.root = Some(wrapper);
        Ok(wrapper)
    }

    fn append_child(draft: &mut DraftMessage, parent: BodyId, id: BodyId) {
        match draft.arena.children(parent).last() {
            Some(&last) => draft.arena[last].next = Some(id),
            None => draft.arena[parent].first_child = Some(id),
        }
    }

    /// Attach a user file. The body borrows the file (`unlink` stays
    /// off) so an aborted send never deletes user data.
    pub fn attach_file(
        &mut self,
        draft: &mut DraftMessage,
        path: &Path,
    ) -> MailForgeResult<BodyId> {
        if !path.is_file() {
            return Err(raise_error!(
                format!("{:?} is not a readable file", path),
                ErrorCode::FileOpenFailed
            ));
        }
        let guess = MimeGuess::from_path(path).first_or_octet_stream();
        let id = draft.arena.new_body();
        {
            let node = &mut draft.arena[id];
            node.major = MajorType::parse(guess.type_().as_str());
            node.subtype = guess.subtype().as_str().to_string();
            node.disposition = Disposition::Attachment;
            node.d_filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned());
            node.content = ContentSource::borrowed_file(path.to_path_buf());
            node.restamp();
        }
        update_encoding(&mut draft.arena, id)?;
        let parent = Self::ensure_mixed(draft)?;
        Self::append_child(draft, parent, id);
        self.rebuild(draft);
        Ok(id)
    }

    /// Attach a full message as message/rfc822.
    pub fn attach_message(
        &mut self,
        draft: &mut DraftMessage,
        raw: &[u8],
        tmpdir: &Path,
    ) -> MailForgeResult<BodyId> {
        let parsed = mail_parser::MessageParser::default()
            .parse(raw)
            .ok_or_else(|| {
                raise_error!(
                    "Cannot parse message to attach".into(),
                    ErrorCode::MessageParseFailed
                )
            })?;
        let id = draft.arena.new_body();
        let path = temp_message_file(tmpdir)?;
        std::fs::write(&path, raw)?;
        {
            let node = &mut draft.arena[id];
            node.major = MajorType::Message;
            node.subtype = "rfc822".to_string();
            node.disposition = Disposition::Inline;
            node.content = ContentSource::owned_file(path);
            node.inner_message = Some(Box::new(
                crate::modules::envelope::Envelope::from_parsed(&parsed),
            ));
            node.restamp();
        }
        let parent = Self::ensure_mixed(draft)?;
        Self::append_child(draft, parent, id);
        self.rebuild(draft);
        Ok(id)
    }

    /// Remove an attachment and free its subtree. The last remaining
    /// part is never removable.
    pub fn delete(&mut self, draft: &mut DraftMessage, index: usize) -> MailForgeResult<()> {
        if self.entries.len() <= 1 {
            return Err(raise_error!(
                "Cannot delete the only part of the message".into(),
                ErrorCode::InvalidParameter
            ));
        }
        let entry = self.entry(index)?.clone();
        let body = entry.body;
        let next = draft.arena[body].next;

        match entry.parent {
            Some(parent) => {
                if draft.arena[parent].first_child == Some(body) {
                    draft.arena[parent].first_child = next;
                } else {
                    let mut cursor = draft.arena[parent].first_child;
                    while let Some(current) = cursor {
                        if draft.arena[current].next == Some(body) {
                            draft.arena[current].next = next;
                            break;
                        }
                        cursor = draft.arena[current].next;
                    }
                }
            }
            None => {
                draft.root = next;
            }
        }
        draft.arena[body].next = None;
        draft.arena.free(body);
        self.rebuild(draft);
        Ok(())
    }

    /// Swap with the following sibling. Works only between adjacent
    /// siblings of the same container; the container's first-child
    /// link (or the draft root) is re-pointed when the head moves.
    pub fn move_down(&mut self, draft: &mut DraftMessage, index: usize) -> MailForgeResult<()> {
        let entry = self.entry(index)?.clone();
        if draft.arena[entry.body].next.is_none() {
            return Err(raise_error!(
                "Attachment is already last among its siblings".into(),
                ErrorCode::InvalidParameter
            ));
        }
        let new_head = draft.arena.swap_with_next(entry.parent, entry.body)?;
        if entry.parent.is_none() {
            if let Some(head) = new_head {
                draft.root = Some(head);
            }
        }
        self.rebuild(draft);
        Ok(())
    }

    /// Swap with the preceding sibling.
    pub fn move_up(&mut self, draft: &mut DraftMessage, index: usize) -> MailForgeResult<()> {
        let entry = self.entry(index)?.clone();
        let head = match entry.parent {
            Some(parent) => draft.arena[parent].first_child,
            None => draft.root,
        };
        let mut pred = None;
        let mut cursor = head;
        while let Some(current) = cursor {
            if current == entry.body {
                break;
            }
            pred = Some(current);
            cursor = draft.arena[current].next;
        }
        let pred = pred.ok_or_else(|| {
            raise_error!(
                "Attachment is already first among its siblings".into(),
                ErrorCode::InvalidParameter
            )
        })?;
        let new_head = draft.arena.swap_with_next(entry.parent, pred)?;
        if entry.parent.is_none() {
            if let Some(head) = new_head {
                draft.root = Some(head);
            }
        }
        self.rebuild(draft);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &AttachEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    fn draft_with_text(dir: &Path) -> DraftMessage {
        let path = temp_message_file(dir).unwrap();
        fs::write(&path, b"main text\n").unwrap();
        DraftMessage::with_text_file(&path)
    }

    #[test]
    fn first_attach_wraps_into_mixed() {
        let dir = tempfile::tempdir().unwrap();
        let mut draft = draft_with_text(dir.path());
        let user_file = dir.path().join("photo.png");
        fs::write(&user_file, b"\x89PNG\r\n").unwrap();

        let mut ctx = AttachCtx::new();
        ctx.rebuild(&draft);
        assert_eq!(ctx.len(), 1);

        ctx.attach_file(&mut draft, &user_file).unwrap();
        let root = draft.root().unwrap();
        assert_eq!(draft.arena[root].subtype, "mixed");
        assert_eq!(ctx.len(), 2);
        let png = ctx.entry(1).unwrap().body;
        assert_eq!(draft.arena[png].type_string(), "image/png");
        // Aborting must not unlink the user's file.
        draft.arena.free(png);
        assert!(user_file.exists());
    }

    #[test]
    fn delete_refuses_last_part() {
        let dir = tempfile::tempdir().unwrap();
        let mut draft = draft_with_text(dir.path());
        let mut ctx = AttachCtx::new();
        ctx.rebuild(&draft);
        assert!(ctx.delete(&mut draft, 0).is_err());
    }

    #[test]
    fn move_down_at_head_relinks_parent() {
        let dir = tempfile::tempdir().unwrap();
        let mut draft = draft_with_text(dir.path());
        let f1 = dir.path().join("a.txt");
        let f2 = dir.path().join("b.txt");
        fs::write(&f1, b"a").unwrap();
        fs::write(&f2, b"b").unwrap();

        let mut ctx = AttachCtx::new();
        ctx.rebuild(&draft);
        ctx.attach_file(&mut draft, &f1).unwrap();
        ctx.attach_file(&mut draft, &f2).unwrap();

        // Visible order: main text, a.txt, b.txt.
        ctx.move_down(&mut draft, 0).unwrap();
        let root = draft.root().unwrap();
        let order: Vec<Option<String>> = draft
            .arena
            .children(root)
            .into_iter()
            .map(|id| draft.arena[id].d_filename.clone())
            .collect();
        assert_eq!(
            order,
            vec![Some("a.txt".to_string()), None, Some("b.txt".to_string())]
        );
        assert_eq!(draft.arena[root].first_child, Some(ctx.entry(0).unwrap().body));
    }

    #[test]
    fn delete_middle_attachment_relinks_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let mut draft = draft_with_text(dir.path());
        let f1 = dir.path().join("a.txt");
        let f2 = dir.path().join("b.txt");
        fs::write(&f1, b"a").unwrap();
        fs::write(&f2, b"b").unwrap();

        let mut ctx = AttachCtx::new();
        ctx.rebuild(&draft);
        ctx.attach_file(&mut draft, &f1).unwrap();
        ctx.attach_file(&mut draft, &f2).unwrap();
        ctx.delete(&mut draft, 1).unwrap();

        assert_eq!(ctx.len(), 2);
        assert!(f1.exists());
        let root = draft.root().unwrap();
        assert_eq!(draft.arena.children(root).len(), 2);
    }
}
