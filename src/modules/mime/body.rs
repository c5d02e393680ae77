// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::ops::{Index, IndexMut};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::modules::envelope::Envelope;
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailForgeResult;
use crate::modules::mime::param::ParamList;
use crate::modules::utils::temp_message_file;
use crate::{raise_error, utc_now};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct BodyId(usize);

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MajorType {
    Text,
    Multipart,
    Message,
    Application,
    Audio,
    Image,
    Video,
    Model,
    Other(String),
}

impl MajorType {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "text" => MajorType::Text,
            "multipart" => MajorType::Multipart,
            "message" => MajorType::Message,
            "application" => MajorType::Application,
            "audio" => MajorType::Audio,
            "image" => MajorType::Image,
            "video" => MajorType::Video,
            "model" => MajorType::Model,
            other => MajorType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MajorType::Text => "text",
            MajorType::Multipart => "multipart",
            MajorType::Message => "message",
            MajorType::Application => "application",
            MajorType::Audio => "audio",
            MajorType::Image => "image",
            MajorType::Video => "video",
            MajorType::Model => "model",
            MajorType::Other(s) => s,
        }
    }

    /// Only these majors may carry child parts.
    pub fn is_container(&self) -> bool {
        matches!(self, MajorType::Multipart | MajorType::Message)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransferEncoding {
    SevenBit,
    EightBit,
    Binary,
    QuotedPrintable,
    Base64,
}

impl TransferEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferEncoding::SevenBit => "7bit",
            TransferEncoding::EightBit => "8bit",
            TransferEncoding::Binary => "binary",
            TransferEncoding::QuotedPrintable => "quoted-printable",
            TransferEncoding::Base64 => "base64",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "8bit" => TransferEncoding::EightBit,
            "binary" => TransferEncoding::Binary,
            "quoted-printable" => TransferEncoding::QuotedPrintable,
            "base64" => TransferEncoding::Base64,
            _ => TransferEncoding::SevenBit,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Disposition {
    Inline,
    Attachment,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Inline => "inline",
            Disposition::Attachment => "attachment",
        }
    }
}

/// Where a node's octets live. Exactly one source is authoritative:
/// a backing file (possibly owned, see `unlink`) or a byte range into
/// a parent stream. Containers carry no content of their own.
#[derive(Clone, Debug)]
pub enum ContentSource {
    None,
    File { path: PathBuf, unlink: bool },
    Span { offset: u64, length: u64 },
}

impl ContentSource {
    pub fn owned_file(path: PathBuf) -> Self {
        ContentSource::File { path, unlink: true }
    }

    pub fn borrowed_file(path: PathBuf) -> Self {
        ContentSource::File {
            path,
            unlink: false,
        }
    }

    pub fn file_path(&self) -> Option<&Path> {
        match self {
            ContentSource::File { path, .. } => Some(path),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BodyNode {
    pub major: MajorType,
    pub subtype: String,
    pub params: ParamList,
    pub encoding: TransferEncoding,
    pub disposition: Disposition,
    /// Emit a Content-Disposition header for this part.
    pub use_disp: bool,
    /// Display filename offered to the recipient.
    pub d_filename: Option<String>,
    pub description: Option<String>,
    pub content: ContentSource,
    pub first_child: Option<BodyId>,
    pub next: Option<BodyId>,
    /// Parsed header of a message/rfc822 part.
    pub inner_message: Option<Box<Envelope>>,
    /// Envelope snapshot attached to the topmost protected part.
    pub protected_headers: Option<Box<Envelope>>,
    /// Suppress charset conversion for this part.
    pub noconv: bool,
    /// Last-known mtime of the backing file, for external-edit checks.
    pub stamp: i64,
    pub tagged: bool,
}

impl BodyNode {
    fn text_plain() -> Self {
        BodyNode {
            major: MajorType::Text,
            subtype: "plain".to_string(),
            params: ParamList::new(),
            encoding: TransferEncoding::SevenBit,
            disposition: Disposition::Inline,
            use_disp: true,
            d_filename: None,
            description: None,
            content: ContentSource::None,
            first_child: None,
            next: None,
            inner_message: None,
            protected_headers: None,
            noconv: false,
            stamp: 0,
            tagged: false,
        }
    }

    pub fn is_multipart(&self) -> bool {
        self.major == MajorType::Multipart
    }

    pub fn type_string(&self) -> String {
        format!("{}/{}", self.major.as_str(), self.subtype)
    }

    pub fn restamp(&mut self) {
        self.stamp = utc_now!();
    }
}

/// The owning store for one message's body tree. Nodes reference each
/// other by id; a freed slot stays vacant so a second free of the same
/// id is a no-op rather than a double-free.
#[derive(Debug, Default)]
pub struct BodyArena {
    nodes: Vec<Option<BodyNode>>,
}

impl Index<BodyId> for BodyArena {
    type Output = BodyNode;
    fn index(&self, id: BodyId) -> &BodyNode {
        self.nodes[id.0]
            .as_ref()
            .unwrap_or_else(|| panic!("body {} used after free", id.0))
    }
}

impl IndexMut<BodyId> for BodyArena {
    fn index_mut(&mut self, id: BodyId) -> &mut BodyNode {
        self.nodes[id.0]
            .as_mut()
            .unwrap_or_else(|| panic!("body {} used after free", id.0))
    }
}

impl BodyArena {
    pub fn new() -> Self {
        BodyArena::default()
    }

    /// A fresh body with send-mode defaults: text/plain, inline
    /// disposition, disposition emitted, 7bit.
    pub fn new_body(&mut self) -> BodyId {
        self.alloc(BodyNode::text_plain())
    }

    pub fn alloc(&mut self, node: BodyNode) -> BodyId {
        self.nodes.push(Some(node));
        BodyId(self.nodes.len() - 1)
    }

    pub fn is_alive(&self, id: BodyId) -> bool {
        self.nodes.get(id.0).is_some_and(|slot| slot.is_some())
    }

    pub fn try_node(&self, id: BodyId) -> MailForgeResult<&BodyNode> {
        self.nodes
            .get(id.0)
            .and_then(|slot| slot.as_ref())
            .ok_or_else(|| {
                raise_error!(
                    format!("Body tree references freed node {}", id.0),
                    ErrorCode::BodyTreeCorrupt
                )
            })
    }

    /// Recursively free this node, its children, and its following
    /// siblings. Backing files are unlinked iff the node owns them.
    pub fn free(&mut self, id: BodyId) {
        let Some(slot) = self.nodes.get_mut(id.0) else {
            return;
        };
        let Some(node) = slot.take() else {
            return;
        };
        if let ContentSource::File { path, unlink } = &node.content {
            if *unlink {
                if let Err(e) = fs::remove_file(path) {
                    if path.exists() {
                        warn!("Cannot unlink {:?}: {}", path, e);
                    }
                }
            }
        }
        if let Some(child) = node.first_child {
            self.free(child);
        }
        if let Some(next) = node.next {
            self.free(next);
        }
    }

    /// Free one node only, keeping its children and siblings alive.
    /// The caller is responsible for relinking them.
    pub fn free_single(&mut self, id: BodyId) {
        if let Some(slot) = self.nodes.get_mut(id.0) {
            if let Some(node) = slot.take() {
                if let ContentSource::File { path, unlink } = &node.content {
                    if *unlink {
                        let _ = fs::remove_file(path);
                    }
                }
            }
        }
    }

    /// Read the octets a node is authoritative for. A `Span` needs the
    /// parent stream it indexes into.
    pub fn resolve_content(
        &self,
        id: BodyId,
        parent_stream: Option<&Path>,
    ) -> MailForgeResult<Vec<u8>> {
        let node = self.try_node(id)?;
        match &node.content {
            ContentSource::File { path, .. } => fs::read(path).map_err(|e| {
                raise_error!(
                    format!("Cannot read {:?}: {}", path, e),
                    ErrorCode::FileOpenFailed
                )
            }),
            ContentSource::Span { offset, length } => {
                let path = parent_stream.ok_or_else(|| {
                    raise_error!(
                        "Byte-range content without a parent stream".into(),
                        ErrorCode::BodyTreeCorrupt
                    )
                })?;
                let mut file = fs::File::open(path).map_err(|e| {
                    raise_error!(
                        format!("Cannot open {:?}: {}", path, e),
                        ErrorCode::FileOpenFailed
                    )
                })?;
                file.seek(SeekFrom::Start(*offset))?;
                let mut buf = vec![0u8; *length as usize];
                file.read_exact(&mut buf).map_err(|e| {
                    raise_error!(
                        format!("Short read from {:?}: {}", path, e),
                        ErrorCode::FileOpenFailed
                    )
                })?;
                Ok(buf)
            }
            ContentSource::None => Ok(Vec::new()),
        }
    }

    /// Snapshot a received body into a send-mode body: content is
    /// materialized to a fresh owned temp file, parameters and display
    /// metadata are copied, and the inner-message back-pointer is
    /// dropped. Children are not copied; the caller re-parses them if
    /// needed.
    pub fn copy_body(
        &mut self,
        src: BodyId,
        parent_stream: Option<&Path>,
        tmpdir: &Path,
    ) -> MailForgeResult<BodyId> {
        let bytes = self.resolve_content(src, parent_stream)?;
        let node = self.try_node(src)?.clone();
        let path = temp_message_file(tmpdir)?;
        fs::write(&path, &bytes).map_err(|e| {
            raise_error!(
                format!("Cannot write {:?}: {}", path, e),
                ErrorCode::FileOpenFailed
            )
        })?;
        let copy = BodyNode {
            content: ContentSource::owned_file(path),
            first_child: None,
            next: None,
            inner_message: None,
            stamp: utc_now!(),
            ..node
        };
        Ok(self.alloc(copy))
    }

    /// Wrap a sibling chain in a fresh multipart/mixed container.
    pub fn make_multipart_mixed(&mut self, first: BodyId) -> BodyId {
        let mut parent = BodyNode::text_plain();
        parent.major = MajorType::Multipart;
        parent.subtype = "mixed".to_string();
        parent.use_disp = false;
        parent.first_child = Some(first);
        self.alloc(parent)
    }

    /// Wrap two renditions of the same content in multipart/alternative.
    pub fn make_multipart_alternative(&mut self, plain: BodyId, alt: BodyId) -> BodyId {
        self[plain].next = Some(alt);
        let mut parent = BodyNode::text_plain();
        parent.major = MajorType::Multipart;
        parent.subtype = "alternative".to_string();
        parent.use_disp = false;
        parent.first_child = Some(plain);
        self.alloc(parent)
    }

    /// Unwrap a multipart container, returning its first child. The
    /// caller owns any remaining siblings of that child. Protected
    /// headers hoisted onto the wrapper travel back to the child.
    pub fn remove_multipart(&mut self, parent: BodyId) -> MailForgeResult<BodyId> {
        let node = self.try_node(parent)?;
        if !node.is_multipart() {
            return Ok(parent);
        }
        let first = node.first_child.ok_or_else(|| {
            raise_error!(
                "multipart container without children".into(),
                ErrorCode::BodyTreeCorrupt
            )
        })?;
        let protected = self[parent].protected_headers.take();
        if protected.is_some() {
            self[first].protected_headers = protected;
        }
        self[parent].first_child = None;
        self.free_single(parent);
        Ok(first)
    }

    /// Ids of the direct children of a container, in order.
    pub fn children(&self, id: BodyId) -> Vec<BodyId> {
        let mut out = Vec::new();
        let mut cursor = self
            .nodes
            .get(id.0)
            .and_then(|slot| slot.as_ref())
            .and_then(|n| n.first_child);
        while let Some(child) = cursor {
            out.push(child);
            cursor = self.nodes[child.0].as_ref().and_then(|n| n.next);
        }
        out
    }

    /// Every id in the subtree rooted at `id`, preorder, not crossing
    /// to `id`'s own siblings.
    pub fn subtree(&self, id: BodyId) -> Vec<BodyId> {
        let mut out = vec![id];
        for child in self.children(id) {
            out.extend(self.subtree(child));
        }
        out
    }

    /// Swap `a` with its next sibling. `parent` is the container whose
    /// child list holds `a`, or None at the root level. Returns the new
    /// head of the sibling list when `a` was the head; the parent's
    /// first-child link is re-pointed here as well, so a nested swap
    /// keeps the tree consistent.
    pub fn swap_with_next(
        &mut self,
        parent: Option<BodyId>,
        a: BodyId,
    ) -> MailForgeResult<Option<BodyId>> {
        let b = self[a].next.ok_or_else(|| {
            raise_error!(
                "No following attachment to swap with".into(),
                ErrorCode::InvalidParameter
            )
        })?;

        // Find a's predecessor within its sibling list.
        let head = match parent {
            Some(p) => self[p].first_child,
            None => None,
        };
        let mut pred = None;
        if let Some(mut cursor) = head {
            while cursor != a {
                match self[cursor].next {
                    Some(next) => {
                        pred = Some(cursor);
                        cursor = next;
                    }
                    None => break,
                }
            }
        }

        let after_b = self[b].next;
        self[a].next = after_b;
        self[b].next = Some(a);
        match pred {
            Some(p) => {
                self[p].next = Some(b);
                Ok(None)
            }
            None => {
                if let Some(p) = parent {
                    self[p].first_child = Some(b);
                }
                Ok(Some(b))
            }
        }
    }

    /// Structural invariants: containers are the only nodes with
    /// children, and content authority is unique per node.
    pub fn validate(&self, root: BodyId) -> MailForgeResult<()> {
        for id in self.subtree(root) {
            let node = self.try_node(id)?;
            if node.first_child.is_some() && !node.major.is_container() {
                return Err(raise_error!(
                    format!(
                        "{} part has children but is not a container",
                        node.type_string()
                    ),
                    ErrorCode::BodyTreeCorrupt
                ));
            }
            if node.major == MajorType::Multipart {
                if !matches!(node.content, ContentSource::None) {
                    return Err(raise_error!(
                        "multipart container with its own content".into(),
                        ErrorCode::BodyTreeCorrupt
                    ));
                }
            } else if matches!(node.content, ContentSource::None)
                && node.first_child.is_none()
            {
                return Err(raise_error!(
                    format!("{} part without content", node.type_string()),
                    ErrorCode::BodyTreeCorrupt
                ));
            }
        }
        Ok(())
    }
}

impl Drop for BodyArena {
    fn drop(&mut self) {
        for slot in self.nodes.iter_mut() {
            if let Some(node) = slot.take() {
                if let ContentSource::File { path, unlink } = node.content {
                    if unlink {
                        let _ = fs::remove_file(path);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn owned_part(arena: &mut BodyArena, dir: &Path, data: &[u8]) -> BodyId {
        let path = temp_message_file(dir).unwrap();
        fs::write(&path, data).unwrap();
        let id = arena.new_body();
        arena[id].content = ContentSource::owned_file(path);
        id
    }

    #[test]
    fn free_respects_unlink_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut arena = BodyArena::new();

        let owned = owned_part(&mut arena, dir.path(), b"owned");
        let owned_path = arena[owned].content.file_path().unwrap().to_path_buf();

        let borrowed_path = dir.path().join("user-supplied.txt");
        fs::write(&borrowed_path, b"keep me").unwrap();
        let borrowed = arena.new_body();
        arena[borrowed].content = ContentSource::borrowed_file(borrowed_path.clone());

        arena.free(owned);
        arena.free(borrowed);
        assert!(!owned_path.exists());
        assert!(borrowed_path.exists());
    }

    #[test]
    fn double_free_is_inert() {
        let dir = tempfile::tempdir().unwrap();
        let mut arena = BodyArena::new();
        let id = owned_part(&mut arena, dir.path(), b"x");
        arena.free(id);
        arena.free(id);
        assert!(!arena.is_alive(id));
    }

    #[test]
    fn multipart_wrap_and_unwrap() {
        let dir = tempfile::tempdir().unwrap();
        let mut arena = BodyArena::new();
        let a = owned_part(&mut arena, dir.path(), b"first");
        let b = owned_part(&mut arena, dir.path(), b"second");
        arena[a].next = Some(b);
        let parent = arena.make_multipart_mixed(a);
        assert_eq!(arena.children(parent), vec![a, b]);
        arena.validate(parent).unwrap();

        let unwrapped = arena.remove_multipart(parent).unwrap();
        assert_eq!(unwrapped, a);
        assert!(!arena.is_alive(parent));
        assert!(arena.is_alive(a));
        assert!(arena.is_alive(b));
    }

    #[test]
    fn swap_head_updates_parent_link() {
        let dir = tempfile::tempdir().unwrap();
        let mut arena = BodyArena::new();
        let a = owned_part(&mut arena, dir.path(), b"a");
        let b = owned_part(&mut arena, dir.path(), b"b");
        let c = owned_part(&mut arena, dir.path(), b"c");
        arena[a].next = Some(b);
        arena[b].next = Some(c);
        let parent = arena.make_multipart_mixed(a);

        let new_head = arena.swap_with_next(Some(parent), a).unwrap();
        assert_eq!(new_head, Some(b));
        assert_eq!(arena[parent].first_child, Some(b));
        assert_eq!(arena.children(parent), vec![b, a, c]);
    }

    #[test]
    fn swap_mid_list_keeps_parent_link() {
        let dir = tempfile::tempdir().unwrap();
        let mut arena = BodyArena::new();
        let a = owned_part(&mut arena, dir.path(), b"a");
        let b = owned_part(&mut arena, dir.path(), b"b");
        let c = owned_part(&mut arena, dir.path(), b"c");
        arena[a].next = Some(b);
        arena[b].next = Some(c);
        let parent = arena.make_multipart_mixed(a);

        let new_head = arena.swap_with_next(Some(parent), b).unwrap();
        assert_eq!(new_head, None);
        assert_eq!(arena.children(parent), vec![a, c, b]);
    }

    #[test]
    fn alternative_wrap_orders_renditions() {
        let dir = tempfile::tempdir().unwrap();
        let mut arena = BodyArena::new();
        let plain = owned_part(&mut arena, dir.path(), b"plain rendition");
        let html = owned_part(&mut arena, dir.path(), b"<p>rich rendition</p>");
        arena[html].subtype = "html".to_string();
        let parent = arena.make_multipart_alternative(plain, html);
        assert_eq!(arena[parent].subtype, "alternative");
        assert_eq!(arena.children(parent), vec![plain, html]);
        arena.validate(parent).unwrap();
    }

    #[test]
    fn copy_body_owns_fresh_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut arena = BodyArena::new();
        let src_path = dir.path().join("original.txt");
        fs::write(&src_path, b"payload").unwrap();
        let src = arena.new_body();
        arena[src].content = ContentSource::borrowed_file(src_path.clone());

        let copy = arena.copy_body(src, None, dir.path()).unwrap();
        let copy_path = arena[copy].content.file_path().unwrap().to_path_buf();
        assert_ne!(copy_path, src_path);
        assert_eq!(fs::read(&copy_path).unwrap(), b"payload");
        matches!(
            arena[copy].content,
            ContentSource::File { unlink: true, .. }
        );
        assert!(arena[copy].inner_message.is_none());
    }

    #[test]
    fn span_content_resolves_against_parent_stream() {
        let dir = tempfile::tempdir().unwrap();
        let stream = dir.path().join("stream.mbox");
        fs::write(&stream, b"0123456789").unwrap();
        let mut arena = BodyArena::new();
        let id = arena.new_body();
        arena[id].content = ContentSource::Span {
            offset: 2,
            length: 4,
        };
        let bytes = arena.resolve_content(id, Some(&stream)).unwrap();
        assert_eq!(bytes, b"2345");
    }
}
