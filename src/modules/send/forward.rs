// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::path::Path;

use mail_parser::{Message, MimeHeaders};

use crate::modules::attach::AttachCtx;
use crate::modules::envelope::Envelope;
use crate::modules::error::MailForgeResult;
use crate::modules::format::{FormatContext, Template};
use crate::modules::message::DraftMessage;
use crate::modules::mime::body::{ContentSource, Disposition, MajorType};
use crate::modules::mime::encoding::update_encoding;
use crate::modules::send::reply::quote_body;
use crate::modules::settings::scope::SessionOptions;
use crate::modules::utils::temp_message_file;

/// Subject for a forward, e.g. `[author@example.org: the plan]`.
pub fn forward_subject(
    out: &mut Envelope,
    original: &Envelope,
    options: &SessionOptions,
) -> MailForgeResult<()> {
    let template = Template::parse(&options.forward_format)?;
    let mut ctx = FormatContext::new();
    let from = original.from.first();
    ctx.set(
        'a',
        from.and_then(|a| a.mailbox.clone()).unwrap_or_default(),
    );
    ctx.set(
        'f',
        from.map(|a| a.to_string()).unwrap_or_default(),
    );
    ctx.set('s', original.real_subject().to_string());
    out.set_subject(&template.render(&ctx), &options.reply_regexp);
    Ok(())
}

fn banner(template: &str, original: &Envelope) -> MailForgeResult<String> {
    let template = Template::parse(template)?;
    let mut ctx = FormatContext::new();
    let from = original.from.first();
    ctx.set(
        'f',
        from.map(|a| a.to_string()).unwrap_or_default(),
    );
    ctx.set(
        'a',
        from.and_then(|a| a.mailbox.clone()).unwrap_or_default(),
    );
    ctx.set('s', original.subject.clone().unwrap_or_default());
    if let Some(date) = &original.date {
        ctx.set('d', date.clone());
    }
    Ok(template.render(&ctx))
}

/// The rendered draft text of an inline forward plus the part ids of
/// leaves that could not be decoded into it.
pub struct InlineForward {
    pub text: String,
    pub undecodable_parts: Vec<usize>,
}

/// Build the inline-forward body: attribution banner, the decoded (or
/// raw) original text, optional quoting, and the trailer banner.
pub fn render_inline_forward(
    message: &Message<'_>,
    original: &Envelope,
    options: &SessionOptions,
) -> MailForgeResult<InlineForward> {
    let mut text = String::new();
    text.push_str(&banner(&options.forward_attribution_intro, original)?);
    text.push('\n');
    text.push('\n');

    let body = if options.forward_decode {
        message.body_text(0).map(|t| t.into_owned()).unwrap_or_default()
    } else {
        String::from_utf8_lossy(message.raw_message()).into_owned()
    };
    if options.forward_quote {
        text.push_str(&quote_body(&body, &options.indent_string));
    } else {
        text.push_str(&body);
    }
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text.push('\n');
    text.push_str(&banner(&options.forward_attribution_trailer, original)?);
    text.push('\n');

    let undecodable_parts = if options.forward_decode {
        message
            .parts
            .iter()
            .enumerate()
            .filter(|(_, part)| part.is_binary())
            .map(|(i, _)| i)
            .collect()
    } else {
        Vec::new()
    };
    Ok(InlineForward {
        text,
        undecodable_parts,
    })
}

/// Re-attach the non-decodable leaves of a decoded forward to the
/// draft, preserving their type and display name.
pub fn reattach_parts(
    draft: &mut DraftMessage,
    ctx: &mut AttachCtx,
    message: &Message<'_>,
    parts: &[usize],
    tmpdir: &Path,
) -> MailForgeResult<()> {
    for &index in parts {
        let Some(part) = message.parts.get(index) else {
            continue;
        };
        let path = temp_message_file(tmpdir)?;
        std::fs::write(&path, part.contents())?;
        let id = draft.arena.new_body();
        {
            let node = &mut draft.arena[id];
            if let Some(ctype) = part.content_type() {
                node.major = MajorType::parse(ctype.ctype());
                node.subtype = ctype
                    .subtype()
                    .unwrap_or("octet-stream")
                    .to_ascii_lowercase();
            } else {
                node.major = MajorType::Application;
                node.subtype = "octet-stream".to_string();
            }
            node.disposition = Disposition::Attachment;
            node.d_filename = part.attachment_name().map(|n| n.to_string());
            node.content = ContentSource::owned_file(path);
            node.restamp();
        }
        update_encoding(&mut draft.arena, id)?;
        let root = draft.root()?;
        let parent = if draft.arena[root].major == MajorType::Multipart {
            root
        } else {
            let wrapper = draft.arena.make_multipart_mixed(root);
            draft.root = Some(wrapper);
            wrapper
        };
        match draft.arena.children(parent).last() {
            Some(&last) if last != id => draft.arena[last].next = Some(id),
            _ => draft.arena[parent].first_child = Some(id),
        }
        ctx.rebuild(draft);
    }
    Ok(())
}

/// Forward as attachment: the whole original becomes a message/rfc822
/// child of the draft.
pub fn attach_forward(
    draft: &mut DraftMessage,
    ctx: &mut AttachCtx,
    raw: &[u8],
    tmpdir: &Path,
) -> MailForgeResult<()> {
    ctx.attach_message(draft, raw, tmpdir)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::modules::address::parse_address_list;
    use crate::modules::settings::cli::Settings;

    const ORIGINAL: &[u8] = b"From: Author <author@example.org>\r\n\
To: me@example.com\r\n\
Subject: Re: the plan\r\n\
Content-Type: multipart/mixed; boundary=\"b\"\r\n\
\r\n\
--b\r\n\
Content-Type: text/plain\r\n\
\r\n\
original words\r\n\
--b\r\n\
Content-Type: application/zip; name=\"data.zip\"\r\n\
Content-Disposition: attachment; filename=\"data.zip\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
UEsDBA==\r\n\
--b--\r\n";

    fn options() -> SessionOptions {
        SessionOptions::from_settings(&Settings::new_for_test())
    }

    fn envelope() -> Envelope {
        let mut env = Envelope::new();
        env.from = parse_address_list("Author <author@example.org>").unwrap();
        env.set_subject("Re: the plan", &options().reply_regexp);
        env
    }

    #[test]
    fn forward_subject_uses_real_subject() {
        let mut out = Envelope::new();
        forward_subject(&mut out, &envelope(), &options()).unwrap();
        assert_eq!(out.subject.as_deref(), Some("[author@example.org: the plan]"));
    }

    #[test]
    fn inline_forward_banners_and_body() {
        let message = mail_parser::MessageParser::default().parse(ORIGINAL).unwrap();
        let fwd = render_inline_forward(&message, &envelope(), &options()).unwrap();
        assert!(fwd
            .text
            .starts_with("----- Forwarded message from Author <author@example.org> -----"));
        assert!(fwd.text.contains("original words"));
        assert!(fwd.text.trim_end().ends_with("----- End forwarded message -----"));
        assert_eq!(fwd.undecodable_parts.len(), 1);
    }

    #[test]
    fn quoted_forward_prefixes_body() {
        let message = mail_parser::MessageParser::default().parse(ORIGINAL).unwrap();
        let mut opts = options();
        opts.forward_quote = true;
        let fwd = render_inline_forward(&message, &envelope(), &opts).unwrap();
        assert!(fwd.text.contains("> original words"));
    }

    #[test]
    fn reattach_restores_type_and_name() {
        let dir = tempfile::tempdir().unwrap();
        let message = mail_parser::MessageParser::default().parse(ORIGINAL).unwrap();
        let path = temp_message_file(dir.path()).unwrap();
        std::fs::write(&path, b"fwd text\n").unwrap();
        let mut draft = DraftMessage::with_text_file(&path);
        let mut ctx = AttachCtx::new();
        ctx.rebuild(&draft);

        let fwd = render_inline_forward(&message, &envelope(), &options()).unwrap();
        reattach_parts(&mut draft, &mut ctx, &message, &fwd.undecodable_parts, dir.path())
            .unwrap();
        assert_eq!(ctx.len(), 2);
        let zip = ctx.entry(1).unwrap().body;
        assert_eq!(draft.arena[zip].type_string(), "application/zip");
        assert_eq!(draft.arena[zip].d_filename.as_deref(), Some("data.zip"));
    }
}
