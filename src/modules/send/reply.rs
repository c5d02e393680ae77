// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use chrono::{DateTime, Local};

use crate::modules::address::{
    dedupe, is_mail_list, is_user, parse_address_list, remove_user, remove_xrefs, Address,
};
use crate::modules::common::prompt::{PromptAnswer, Prompter};
use crate::modules::envelope::Envelope;
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailForgeResult;
use crate::modules::format::{FormatContext, Template};
use crate::modules::send::{
    SEND_GROUP_CHAT_REPLY, SEND_GROUP_REPLY, SEND_LIST_REPLY, SEND_TO_SENDER,
};
use crate::modules::settings::scope::SessionOptions;
use crate::raise_error;

/// Pick the primary reply target per the reply-to policy.
fn default_to(
    out_to: &mut Vec<Address>,
    original: &Envelope,
    options: &SessionOptions,
    prompter: &mut dyn Prompter,
) -> MailForgeResult<()> {
    // Replying to one's own message goes back to its recipients.
    if original.from.iter().any(|a| is_user(a, options)) && !options.reply_self {
        out_to.extend(original.to.iter().cloned());
        return Ok(());
    }

    let reply_to = &original.reply_to;
    if reply_to.is_empty() {
        out_to.extend(original.from.iter().cloned());
        return Ok(());
    }

    // A list that points Reply-To at itself while the user asked to
    // ignore that falls back to the author.
    let reply_to_is_list = reply_to.iter().any(|a| is_mail_list(a, options));
    let reply_to_in_recips = reply_to.iter().any(|rt| {
        original
            .to
            .iter()
            .chain(original.cc.iter())
            .any(|r| r.same_mailbox(rt))
    });
    if reply_to_is_list && reply_to_in_recips && options.ignore_list_reply_to {
        out_to.extend(original.from.iter().cloned());
        return Ok(());
    }

    // Reply-To that simply restates From is not a real redirection.
    if reply_to.len() == 1
        && original.from.len() == 1
        && reply_to[0].same_mailbox(&original.from[0])
        && reply_to[0].personal == original.from[0].personal
    {
        out_to.extend(original.from.iter().cloned());
        return Ok(());
    }

    let prompt = format!(
        "Reply to {}?",
        reply_to
            .first()
            .and_then(|a| a.mailbox.clone())
            .unwrap_or_default()
    );
    match prompter.ask_quad(&prompt, options.reply_to) {
        PromptAnswer::Yes => out_to.extend(reply_to.iter().cloned()),
        PromptAnswer::No => out_to.extend(original.from.iter().cloned()),
        PromptAnswer::Cancel => {
            return Err(raise_error!(
                "Reply cancelled".into(),
                ErrorCode::UserAborted
            ))
        }
    }
    Ok(())
}

/// Derive the recipient lists for a reply to one message.
pub fn fetch_recips(
    out: &mut Envelope,
    original: &Envelope,
    flags: u32,
    options: &SessionOptions,
    prompter: &mut dyn Prompter,
) -> MailForgeResult<()> {
    let group = flags & (SEND_GROUP_REPLY | SEND_GROUP_CHAT_REPLY) != 0;
    let list = flags & SEND_LIST_REPLY != 0;

    if !original.mail_followup_to.is_empty() && (group || list) {
        let honor = if list {
            PromptAnswer::Yes
        } else {
            prompter.ask_quad("Honor Mail-Followup-To?", options.honor_followup_to)
        };
        match honor {
            PromptAnswer::Yes => {
                out.to.extend(original.mail_followup_to.iter().cloned());
                return fix_reply_recipients(out, options);
            }
            PromptAnswer::Cancel => {
                return Err(raise_error!(
                    "Reply cancelled".into(),
                    ErrorCode::UserAborted
                ))
            }
            PromptAnswer::No => {}
        }
    }

    if list {
        // List-reply without MFT: answer the lists on the original.
        for addr in original.to.iter().chain(original.cc.iter()) {
            if is_mail_list(addr, options) {
                out.to.push(addr.clone());
            }
        }
        if out.to.is_empty() {
            // No list recipient; fall back to the author.
            out.to.extend(original.from.iter().cloned());
        }
    } else if flags & SEND_TO_SENDER != 0 {
        out.to.extend(original.from.iter().cloned());
    } else {
        default_to(&mut out.to, original, options, prompter)?;
    }

    if group {
        let target = if flags & SEND_GROUP_CHAT_REPLY != 0 {
            &mut out.to
        } else {
            &mut out.cc
        };
        for addr in original.to.iter().chain(original.cc.iter()) {
            if !addr.group && !addr.is_group_terminator() {
                target.push(addr.clone());
            }
        }
    }

    fix_reply_recipients(out, options)
}

/// Remove self, duplicates, and to/cc cross-references, then promote
/// cc when to ended up empty.
pub fn fix_reply_recipients(env: &mut Envelope, options: &SessionOptions) -> MailForgeResult<()> {
    remove_user(&mut env.to, true, options);
    remove_user(&mut env.cc, false, options);
    dedupe(&mut env.to);
    dedupe(&mut env.cc);
    remove_xrefs(&env.to, &mut env.cc);
    if env.to.is_empty() && !env.cc.is_empty() {
        std::mem::swap(&mut env.to, &mut env.cc);
    }
    Ok(())
}

/// Prefix the subject with `Re: ` unless the original already carried
/// a recognized reply prefix.
pub fn reply_subject(out: &mut Envelope, original: &Envelope, options: &SessionOptions) {
    let real = original.real_subject();
    let subject = if real.is_empty() {
        "Re: your mail".to_string()
    } else {
        format!("Re: {}", real)
    };
    out.set_subject(&subject, &options.reply_regexp);
}

/// References/In-Reply-To for a single-parent reply: the parent's id
/// is appended to its own reference chain, newest last.
pub fn reply_references(out: &mut Envelope, original: &Envelope) {
    out.in_reply_to.clear();
    out.references.clear();
    if let Some(id) = &original.message_id {
        out.in_reply_to.push(id.clone());
    }
    let ancestors = if !original.references.is_empty() {
        original.references.clone()
    } else {
        original.in_reply_to.clone()
    };
    out.references = ancestors;
    if let Some(id) = &original.message_id {
        if !out.references.contains(id) {
            out.references.push(id.clone());
        }
    }
}

/// A reply to several tagged parents has no coherent ancestry; both
/// threading headers stay empty.
pub fn clear_references_for_multiple_parents(out: &mut Envelope) {
    out.in_reply_to.clear();
    out.references.clear();
}

/// The attribution line above the quoted text, e.g.
/// "On Mon, Jan 5, Jane Doe wrote:".
pub fn make_attribution(
    original: &Envelope,
    options: &SessionOptions,
) -> MailForgeResult<String> {
    let template = Template::parse(&options.attribution)?;
    let mut ctx = FormatContext::new();
    let from = original.from.first();
    ctx.set(
        'n',
        from.and_then(|a| a.personal.clone())
            .or_else(|| from.and_then(|a| a.mailbox.clone()))
            .unwrap_or_default(),
    );
    ctx.set(
        'a',
        from.and_then(|a| a.mailbox.clone()).unwrap_or_default(),
    );
    ctx.set('s', original.subject.clone().unwrap_or_default());
    if let Some(date) = &original.date {
        ctx.set('d', date.clone());
        ctx.date = DateTime::parse_from_rfc2822(date)
            .ok()
            .map(|d| d.with_timezone(&Local));
    }
    Ok(template.render(&ctx))
}

/// Quote a body with the indent string, preserving blank lines.
pub fn quote_body(text: &str, indent: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 8);
    for line in text.lines() {
        out.push_str(indent);
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Recipients for a reply to multiple tagged messages: the union of
/// their author lists.
pub fn union_of_senders(originals: &[Envelope]) -> Vec<Address> {
    let mut out = Vec::new();
    for env in originals {
        out.extend(env.from.iter().cloned());
    }
    out
}

/// The Mail-Followup-To an outgoing list message should carry: the
/// lists being addressed plus the author when not subscribed.
pub fn generate_followup_to(env: &Envelope, options: &SessionOptions) -> Vec<Address> {
    if !options.followup_to {
        return Vec::new();
    }
    let lists: Vec<Address> = env
        .to
        .iter()
        .chain(env.cc.iter())
        .filter(|a| is_mail_list(a, options))
        .cloned()
        .collect();
    if lists.is_empty() {
        return Vec::new();
    }
    let subscribed = lists
        .iter()
        .any(|a| crate::modules::address::is_subscribed_list(a, options));
    let mut mft = lists;
    if !subscribed {
        if let Ok(user) = parse_address_list(&options.user) {
            mft.extend(user);
        }
    }
    dedupe(&mut mft);
    mft
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::modules::address::mailboxes;
    use crate::modules::common::prompt::{BatchPrompter, ScriptedPrompter};
    use crate::modules::settings::cli::Settings;
    use crate::modules::settings::quad::QuadOption;

    fn options() -> SessionOptions {
        let mut opts = SessionOptions::from_settings(&Settings::new_for_test());
        opts.user = "me@example.com".to_string();
        opts
    }

    fn original() -> Envelope {
        let mut env = Envelope::new();
        env.from = parse_address_list("Author <author@example.org>").unwrap();
        env.to = parse_address_list("me@example.com, peer@example.org").unwrap();
        env.cc = parse_address_list("cc1@example.org").unwrap();
        env.message_id = Some("<orig@example.org>".to_string());
        env.set_subject("Re: the plan", &options().reply_regexp);
        env
    }

    #[test]
    fn simple_reply_targets_author() {
        let mut out = Envelope::new();
        let mut prompter = BatchPrompter;
        fetch_recips(&mut out, &original(), 0, &options(), &mut prompter).unwrap();
        assert_eq!(mailboxes(&out.to), vec!["author@example.org"]);
        assert!(out.cc.is_empty());
    }

    #[test]
    fn group_reply_adds_recipients_minus_self() {
        let mut out = Envelope::new();
        let mut prompter = BatchPrompter;
        fetch_recips(
            &mut out,
            &original(),
            SEND_GROUP_REPLY,
            &options(),
            &mut prompter,
        )
        .unwrap();
        assert_eq!(mailboxes(&out.to), vec!["author@example.org"]);
        let cc = mailboxes(&out.cc);
        assert!(cc.contains(&"peer@example.org".to_string()));
        assert!(cc.contains(&"cc1@example.org".to_string()));
        assert!(!cc.contains(&"me@example.com".to_string()));
    }

    #[test]
    fn reply_to_prompt_no_uses_author() {
        let mut env = original();
        env.reply_to = parse_address_list("list@lists.example.org").unwrap();
        let mut out = Envelope::new();
        let mut opts = options();
        opts.reply_to = QuadOption::AskYes;
        let mut prompter = ScriptedPrompter::new().answer_quad(PromptAnswer::No);
        fetch_recips(&mut out, &env, 0, &opts, &mut prompter).unwrap();
        assert_eq!(mailboxes(&out.to), vec!["author@example.org"]);
    }

    #[test]
    fn mft_is_used_verbatim_for_list_reply() {
        let mut env = original();
        env.mail_followup_to = parse_address_list("dev@lists.example.org").unwrap();
        let mut out = Envelope::new();
        let mut prompter = BatchPrompter;
        fetch_recips(&mut out, &env, SEND_LIST_REPLY, &options(), &mut prompter).unwrap();
        assert_eq!(mailboxes(&out.to), vec!["dev@lists.example.org"]);
    }

    #[test]
    fn own_message_reply_goes_to_original_recipients() {
        let mut env = original();
        env.from = parse_address_list("me@example.com").unwrap();
        let mut out = Envelope::new();
        let mut prompter = BatchPrompter;
        fetch_recips(&mut out, &env, 0, &options(), &mut prompter).unwrap();
        // Self is pruned; the peer remains.
        assert_eq!(mailboxes(&out.to), vec!["peer@example.org"]);
    }

    #[test]
    fn cc_promoted_when_to_would_be_empty() {
        let mut env = Envelope::new();
        env.to = Vec::new();
        env.cc = parse_address_list("only@example.org").unwrap();
        fix_reply_recipients(&mut env, &options()).unwrap();
        assert_eq!(mailboxes(&env.to), vec!["only@example.org"]);
        assert!(env.cc.is_empty());
    }

    #[test]
    fn subject_not_double_prefixed() {
        let mut out = Envelope::new();
        reply_subject(&mut out, &original(), &options());
        assert_eq!(out.subject.as_deref(), Some("Re: the plan"));
    }

    #[test]
    fn references_append_parent_last() {
        let mut env = original();
        env.references = vec!["<r1@x>".into(), "<r2@x>".into()];
        let mut out = Envelope::new();
        reply_references(&mut out, &env);
        assert_eq!(
            out.references,
            vec!["<r1@x>", "<r2@x>", "<orig@example.org>"]
        );
        assert_eq!(out.in_reply_to, vec!["<orig@example.org>"]);
    }

    #[test]
    fn in_reply_to_feeds_references_when_no_chain() {
        let mut env = original();
        env.in_reply_to = vec!["<parent@x>".into()];
        let mut out = Envelope::new();
        reply_references(&mut out, &env);
        assert_eq!(out.references, vec!["<parent@x>", "<orig@example.org>"]);
    }

    #[test]
    fn attribution_renders_name_and_subject() {
        let mut opts = options();
        opts.attribution = "On %d, %n wrote about %s:".to_string();
        let mut env = original();
        env.date = Some("Mon, 5 Jan 2026 10:00:00 +0000".to_string());
        let line = make_attribution(&env, &opts).unwrap();
        assert!(line.contains("Author wrote about Re: the plan:"));
        assert!(line.starts_with("On Mon, 5 Jan 2026"));
    }

    #[test]
    fn quoting_prefixes_every_line() {
        assert_eq!(
            quote_body("one\n\ntwo\n", "> "),
            "> one\n> \n> two\n"
        );
    }
}
