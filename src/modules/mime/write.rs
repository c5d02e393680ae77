// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::envelope::write::{
    fold_header, write_headers, write_protected_headers, HeaderWriteOptions, LineEnding,
};
use crate::modules::envelope::Envelope;
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailForgeResult;
use crate::modules::mime::body::{BodyArena, BodyId, MajorType, TransferEncoding};
use crate::modules::mime::encoding::encode_for_wire;
use crate::modules::mime::param::ParamList;
use crate::modules::utils::generate_boundary;
use crate::raise_error;

const BOUNDARY_ATTEMPTS: usize = 16;

/// Assign a boundary to every multipart container in the subtree. A
/// candidate that appears as a line prefix anywhere in the tree's
/// content is rejected and re-drawn.
pub fn assign_boundaries(arena: &mut BodyArena, root: BodyId) -> MailForgeResult<()> {
    let leaf_lines = collect_content_lines(arena, root)?;
    for id in arena.subtree(root) {
        if arena[id].major != MajorType::Multipart {
            continue;
        }
        if arena[id].params.get("boundary").is_some() {
            continue;
        }
        let mut chosen = None;
        for _ in 0..BOUNDARY_ATTEMPTS {
            let candidate = generate_boundary();
            let delimiter = format!("--{}", candidate);
            if !leaf_lines.iter().any(|line| line.starts_with(&delimiter)) {
                chosen = Some(candidate);
                break;
            }
        }
        let boundary = chosen.ok_or_else(|| {
            raise_error!(
                "Could not find a collision-free MIME boundary".into(),
                ErrorCode::BadBoundary
            )
        })?;
        arena[id].params.set("boundary", &boundary);
    }
    Ok(())
}

fn collect_content_lines(arena: &BodyArena, root: BodyId) -> MailForgeResult<Vec<String>> {
    let mut lines = Vec::new();
    for id in arena.subtree(root) {
        if arena[id].content.file_path().is_none() {
            continue;
        }
        let bytes = arena.resolve_content(id, None)?;
        let encoded = encode_for_wire(&bytes, arena[id].encoding);
        for line in encoded.split(|&b| b == b'\n') {
            lines.push(String::from_utf8_lossy(line).into_owned());
        }
    }
    Ok(lines)
}

/// The MIME header block of one part (no trailing blank line).
pub fn write_mime_header(arena: &BodyArena, id: BodyId, eol: &str) -> String {
    let node = &arena[id];
    let mut out = String::new();

    if let Some(protected) = &node.protected_headers {
        out.push_str(&write_protected_headers(protected, eol));
    }

    let mut ctype = node.type_string();
    let mut params = node.params.clone();
    if node.protected_headers.is_some() {
        params.set("protected-headers", "v1");
    }
    for param in params.iter() {
        ctype.push_str(&format!(
            "; {}={}",
            param.attribute,
            ParamList::format_value(&param.value)
        ));
    }
    out.push_str(&fold_header("Content-Type", &ctype, eol));

    if node.encoding != TransferEncoding::SevenBit || !node.major.is_container() {
        out.push_str(&fold_header(
            "Content-Transfer-Encoding",
            node.encoding.as_str(),
            eol,
        ));
    }

    if node.use_disp {
        let mut disp = node.disposition.as_str().to_string();
        if let Some(filename) = &node.d_filename {
            disp.push_str(&format!(
                "; filename={}",
                ParamList::format_value(filename)
            ));
        }
        out.push_str(&fold_header("Content-Disposition", &disp, eol));
    }

    if let Some(description) = &node.description {
        out.push_str(&fold_header("Content-Description", description, eol));
    }
    out
}

/// The encoded content of one part and, for containers, its framed
/// children. Output uses the requested line ending throughout.
pub fn write_mime_body(
    arena: &BodyArena,
    id: BodyId,
    eol: LineEnding,
) -> MailForgeResult<Vec<u8>> {
    let node = &arena[id];
    let eol_str = eol.as_str();
    let mut out = Vec::new();

    if node.major == MajorType::Multipart {
        let boundary = node.params.get("boundary").ok_or_else(|| {
            raise_error!(
                format!("{} part without a boundary", node.type_string()),
                ErrorCode::BadBoundary
            )
        })?;
        let boundary = boundary.to_string();
        for child in arena.children(id) {
            out.extend_from_slice(format!("--{}{}", boundary, eol_str).as_bytes());
            out.extend_from_slice(write_mime_header(arena, child, eol_str).as_bytes());
            out.extend_from_slice(eol_str.as_bytes());
            out.extend_from_slice(&write_mime_body(arena, child, eol)?);
        }
        out.extend_from_slice(format!("--{}--{}", boundary, eol_str).as_bytes());
        return Ok(out);
    }

    let raw = arena.resolve_content(id, None)?;
    let encoded = encode_for_wire(&raw, node.encoding);
    out.extend_from_slice(&normalize_newlines(&encoded, eol));
    if !out.ends_with(eol_str.as_bytes()) {
        out.extend_from_slice(eol_str.as_bytes());
    }
    Ok(out)
}

/// One part rendered completely: MIME headers, blank line, content.
/// Signing canonicalizes through this same path, so the bytes covered
/// by a signature are the bytes that reach the wire.
pub fn write_part(
    arena: &BodyArena,
    id: BodyId,
    eol: LineEnding,
) -> MailForgeResult<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(write_mime_header(arena, id, eol.as_str()).as_bytes());
    out.extend_from_slice(eol.as_str().as_bytes());
    out.extend_from_slice(&write_mime_body(arena, id, eol)?);
    Ok(out)
}

/// The complete wire image: envelope headers, the root part's MIME
/// headers, the separator line, and the body tree.
pub fn write_message(
    env: &Envelope,
    arena: &BodyArena,
    root: BodyId,
    opts: &HeaderWriteOptions,
) -> MailForgeResult<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(write_headers(env, opts).as_bytes());
    out.extend_from_slice(write_mime_header(arena, root, opts.line_ending.as_str()).as_bytes());
    out.extend_from_slice(opts.line_ending.as_str().as_bytes());
    out.extend_from_slice(&write_mime_body(arena, root, opts.line_ending)?);
    Ok(out)
}

/// Rewrite bare-LF line endings to the requested form.
pub fn normalize_newlines(data: &[u8], eol: LineEnding) -> Vec<u8> {
    match eol {
        LineEnding::Lf => data
            .iter()
            .copied()
            .filter(|&b| b != b'\r')
            .collect(),
        LineEnding::CrLf => {
            let mut out = Vec::with_capacity(data.len() + data.len() / 32);
            let mut prev = 0u8;
            for &b in data {
                if b == b'\n' && prev != b'\r' {
                    out.push(b'\r');
                }
                out.push(b);
                prev = b;
            }
            out
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::modules::mime::body::ContentSource;
    use crate::modules::utils::temp_message_file;
    use std::fs;

    fn leaf(arena: &mut BodyArena, dir: &std::path::Path, data: &[u8]) -> BodyId {
        let path = temp_message_file(dir).unwrap();
        fs::write(&path, data).unwrap();
        let id = arena.new_body();
        arena[id].content = ContentSource::owned_file(path);
        id
    }

    #[test]
    fn boundary_never_prefixes_content_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut arena = BodyArena::new();
        let a = leaf(&mut arena, dir.path(), b"plain text\nmore\n");
        let b = leaf(&mut arena, dir.path(), b"second part\n");
        arena[a].next = Some(b);
        let root = arena.make_multipart_mixed(a);
        assign_boundaries(&mut arena, root).unwrap();

        let boundary = arena[root].params.get("boundary").unwrap().to_string();
        let body = write_mime_body(&arena, root, LineEnding::Lf).unwrap();
        let text = String::from_utf8(body).unwrap();
        let delim = format!("--{}", boundary);
        let delim_lines = text.lines().filter(|l| l.starts_with(&delim)).count();
        // Two part openers plus the closing delimiter, nothing leaked
        // from content.
        assert_eq!(delim_lines, 3);
    }

    #[test]
    fn multipart_output_parses_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut arena = BodyArena::new();
        let a = leaf(&mut arena, dir.path(), b"hello body\n");
        let b = leaf(&mut arena, dir.path(), b"attachment data\n");
        arena[b].d_filename = Some("notes.txt".to_string());
        arena[b].disposition = crate::modules::mime::body::Disposition::Attachment;
        arena[a].next = Some(b);
        let root = arena.make_multipart_mixed(a);
        assign_boundaries(&mut arena, root).unwrap();

        let mut env = Envelope::new();
        env.set_subject("test", "^re:");
        env.from = crate::modules::address::parse_address_list("a@example.com").unwrap();
        env.to = crate::modules::address::parse_address_list("b@example.com").unwrap();
        env.message_id = Some("<x@example.com>".into());

        let wire = write_message(&env, &arena, root, &HeaderWriteOptions::default()).unwrap();
        let parsed = mail_parser::MessageParser::default().parse(&wire[..]).unwrap();
        assert_eq!(parsed.attachments().count(), 1);
        assert_eq!(
            parsed.body_text(0).as_deref().map(str::trim),
            Some("hello body")
        );
    }

    #[test]
    fn deterministic_output_for_signing() {
        let dir = tempfile::tempdir().unwrap();
        let mut arena = BodyArena::new();
        let a = leaf(&mut arena, dir.path(), b"sign me\n");
        let first = write_part(&arena, a, LineEnding::CrLf).unwrap();
        let second = write_part(&arena, a, LineEnding::CrLf).unwrap();
        assert_eq!(first, second);
        assert!(first.windows(2).any(|w| w == b"\r\n"));
    }

    #[test]
    fn protected_headers_param_and_block() {
        let dir = tempfile::tempdir().unwrap();
        let mut arena = BodyArena::new();
        let a = leaf(&mut arena, dir.path(), b"secret\n");
        let mut inner = Envelope::new();
        inner.subject = Some("the real subject".into());
        arena[a].protected_headers = Some(Box::new(inner));

        let header = write_mime_header(&arena, a, "\n");
        assert!(header.contains("protected-headers=v1"));
        assert!(header.contains("Subject: the real subject"));
    }
}
