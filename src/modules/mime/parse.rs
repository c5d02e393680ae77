// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::fs;
use std::path::Path;

use mail_parser::{Message, MessagePartId, MimeHeaders, PartType};

use crate::modules::envelope::Envelope;
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailForgeResult;
use crate::modules::mime::body::{
    BodyArena, BodyId, ContentSource, Disposition, MajorType,
};
use crate::modules::mime::encoding::update_encoding;
use crate::modules::utils::temp_message_file;
use crate::raise_error;

/// Lower a parsed message's body structure into the arena. Leaf
/// contents are materialized (decoded) into owned temp files; nested
/// rfc822 messages keep their raw bytes and a parsed inner envelope.
pub fn lower_message(
    arena: &mut BodyArena,
    message: &Message<'_>,
    tmpdir: &Path,
) -> MailForgeResult<BodyId> {
    let root = lower_part(arena, message, 0, tmpdir)?;
    for id in arena.subtree(root) {
        if arena[id].content.file_path().is_some() && arena[id].major != MajorType::Message {
            update_encoding(arena, id)?;
        }
    }
    Ok(root)
}

fn lower_part(
    arena: &mut BodyArena,
    message: &Message<'_>,
    part_id: MessagePartId,
    tmpdir: &Path,
) -> MailForgeResult<BodyId> {
    let part = message.parts.get(part_id as usize).ok_or_else(|| {
        raise_error!(
            format!("Message references missing part {}", part_id),
            ErrorCode::MessageParseFailed
        )
    })?;

    let id = arena.new_body();
    if let Some(ctype) = part.content_type() {
        arena[id].major = MajorType::parse(ctype.ctype());
        arena[id].subtype = ctype
            .subtype()
            .unwrap_or(match arena[id].major {
                MajorType::Text => "plain",
                MajorType::Multipart => "mixed",
                _ => "octet-stream",
            })
            .to_ascii_lowercase();
        if let Some(attributes) = ctype.attributes() {
            for attribute in attributes {
                arena[id].params.set(attribute.name.as_ref(), attribute.value.as_ref());
            }
        }
        if ctype.attribute("protected-headers").is_some() {
            let snapshot = envelope_from_part_headers(part);
            arena[id].protected_headers = Some(Box::new(snapshot));
        }
    } else if part.is_text_html() {
        arena[id].subtype = "html".to_string();
    }

    if let Some(disposition) = part.content_disposition() {
        if disposition.ctype().eq_ignore_ascii_case("attachment") {
            arena[id].disposition = Disposition::Attachment;
        }
        if let Some(filename) = disposition.attribute("filename") {
            arena[id].d_filename = Some(filename.to_string());
        }
    }
    if arena[id].d_filename.is_none() {
        if let Some(name) = part
            .content_type()
            .and_then(|c| c.attribute("name"))
        {
            arena[id].d_filename = Some(name.to_string());
        }
    }

    match &part.body {
        PartType::Multipart(children) => {
            arena[id].content = ContentSource::None;
            let mut previous: Option<BodyId> = None;
            for child_id in children.iter().copied() {
                let child = lower_part(arena, message, child_id, tmpdir)?;
                match previous {
                    Some(prev) => arena[prev].next = Some(child),
                    None => arena[id].first_child = Some(child),
                }
                previous = Some(child);
            }
        }
        PartType::Message(inner) => {
            let path = temp_message_file(tmpdir)?;
            fs::write(&path, inner.raw_message()).map_err(|e| {
                raise_error!(
                    format!("Cannot write {:?}: {}", path, e),
                    ErrorCode::FileOpenFailed
                )
            })?;
            arena[id].content = ContentSource::owned_file(path);
            arena[id].inner_message = Some(Box::new(Envelope::from_parsed(&inner)));
        }
        _ => {
            let path = temp_message_file(tmpdir)?;
            fs::write(&path, part.contents()).map_err(|e| {
                raise_error!(
                    format!("Cannot write {:?}: {}", path, e),
                    ErrorCode::FileOpenFailed
                )
            })?;
            arena[id].content = ContentSource::owned_file(path);
        }
    }
    arena[id].restamp();
    Ok(id)
}

/// Build an envelope view from one part's own header block, used for
/// protected-header snapshots.
fn envelope_from_part_headers(part: &mail_parser::MessagePart<'_>) -> Envelope {
    let mut env = Envelope::new();
    for header in part.headers() {
        let Some(value) = header.value().as_text() else {
            continue;
        };
        let name = header.name();
        if name.eq_ignore_ascii_case("subject") {
            env.subject = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("from") {
            if let Ok(list) = crate::modules::address::parse_address_list(value) {
                env.from = list;
            }
        } else if name.eq_ignore_ascii_case("to") {
            if let Ok(list) = crate::modules::address::parse_address_list(value) {
                env.to = list;
            }
        } else if name.eq_ignore_ascii_case("cc") {
            if let Ok(list) = crate::modules::address::parse_address_list(value) {
                env.cc = list;
            }
        } else if name.eq_ignore_ascii_case("message-id") {
            env.message_id = Some(crate::modules::envelope::bracket_message_id(value));
        }
    }
    env
}

#[cfg(test)]
mod test {
    use super::*;

    const NESTED: &[u8] = b"From: outer@example.com\r\n\
To: in@example.com\r\n\
Subject: outer\r\n\
Content-Type: multipart/mixed; boundary=\"xyz\"\r\n\
\r\n\
--xyz\r\n\
Content-Type: text/plain\r\n\
\r\n\
main text\r\n\
--xyz\r\n\
Content-Type: application/pdf; name=\"doc.pdf\"\r\n\
Content-Disposition: attachment; filename=\"doc.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0=\r\n\
--xyz--\r\n";

    #[test]
    fn lowers_multipart_with_attachment() {
        let dir = tempfile::tempdir().unwrap();
        let message = mail_parser::MessageParser::default().parse(NESTED).unwrap();
        let mut arena = BodyArena::new();
        let root = lower_message(&mut arena, &message, dir.path()).unwrap();

        assert_eq!(arena[root].major, MajorType::Multipart);
        let children = arena.children(root);
        assert_eq!(children.len(), 2);
        assert_eq!(arena[children[0]].major, MajorType::Text);
        let text = arena.resolve_content(children[0], None).unwrap();
        assert_eq!(String::from_utf8_lossy(&text).trim(), "main text");

        assert_eq!(arena[children[1]].subtype, "pdf");
        assert_eq!(arena[children[1]].d_filename.as_deref(), Some("doc.pdf"));
        assert_eq!(arena[children[1]].disposition, Disposition::Attachment);
        // The base64 transfer encoding was undone during lowering.
        let pdf = arena.resolve_content(children[1], None).unwrap();
        assert_eq!(&pdf, b"%PDF-");
        arena.validate(root).unwrap();
    }
}
