// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::fs;
use std::path::PathBuf;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::modules::address::alias::AliasTable;
use crate::modules::address::{idna, mailboxes, parse_address_list, Address};
use crate::modules::common::prompt::{PromptAnswer, Prompter};
use crate::modules::crypto::{
    CryptoGateway, SecurityFlags, APPLICATION_PGP, APPLICATION_SMIME, SEC_AUTOCRYPT,
    SEC_AUTOCRYPT_OVERRIDE, SEC_ENCRYPT, SEC_INLINE, SEC_OPPENC, SEC_SIGN,
};
use crate::modules::envelope::write::HeaderWriteOptions;
use crate::modules::envelope::Envelope;
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailForgeResult;
use crate::modules::mailbox::{MailStore, MboxStore};
use crate::modules::message::DraftMessage;
use crate::modules::mime::body::{BodyId, MajorType, TransferEncoding};
use crate::modules::mime::encoding::update_encoding;
use crate::modules::settings::hooks::{apply_hooks, parse_rules};
use crate::modules::settings::quad::QuadOption;
use crate::modules::settings::scope::{OptionScope, SessionOptions};
use crate::modules::utils::{generate_message_id, temp_message_file};
use crate::raise_error;

pub mod background;
pub mod editor;
pub mod fcc;
pub mod forward;
pub mod mta;
pub mod postpone;
pub mod reply;
#[cfg(test)]
mod tests;

// Send-mode flags.
pub const SEND_REPLY: u32 = 1 << 0;
pub const SEND_GROUP_REPLY: u32 = 1 << 1;
pub const SEND_GROUP_CHAT_REPLY: u32 = 1 << 2;
pub const SEND_LIST_REPLY: u32 = 1 << 3;
pub const SEND_TO_SENDER: u32 = 1 << 4;
pub const SEND_FORWARD: u32 = 1 << 5;
pub const SEND_RESEND: u32 = 1 << 6;
pub const SEND_POSTPONED: u32 = 1 << 7;
pub const SEND_DRAFT_FILE: u32 = 1 << 8;
pub const SEND_KEY: u32 = 1 << 9;
pub const SEND_MAILX: u32 = 1 << 10;
pub const SEND_BATCH: u32 = 1 << 11;
pub const SEND_NO_FREE_HEADER: u32 = 1 << 12;
pub const SEND_BACKGROUND_EDIT: u32 = 1 << 13;
pub const SEND_CHECK_POSTPONED: u32 = 1 << 14;

/// Where the session stands in the edit lifecycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SendState {
    New,
    FirstEdit,
    FirstEditHeaders,
    ComposeEdit,
    ComposeEditHeaders,
}

/// Terminal (and one non-terminal) outcomes of a send session.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SendOutcome {
    Sent,
    Aborted,
    Postponed,
    Backgrounded,
}

/// Immutable snapshot of the message being answered or forwarded,
/// taken before any suspension can invalidate mailbox positions.
#[derive(Clone, Debug)]
pub struct CurrentMessage {
    pub envelope: Envelope,
    pub raw: Vec<u8>,
    pub security: SecurityFlags,
}

/// The state-bearing object of one send session. Created by a send
/// entry point and owned by the pipeline until a terminal outcome; a
/// background suspend parks it in the registry instead.
#[derive(Debug)]
pub struct SendContext {
    pub msg: DraftMessage,
    pub fcc: String,
    /// The draft text file the editor works on.
    pub tempfile: PathBuf,
    pub mtime: i64,
    /// Snapshot of the message(s) being answered. Nulled out across a
    /// background suspend; the replied-flag phase re-resolves by id.
    pub cur: Option<CurrentMessage>,
    pub cur_message_id: Option<String>,
    pub cur_security: SecurityFlags,
    pub tagged_message_ids: Vec<String>,
    /// Absolute path of the originating mailbox, for replied flags.
    pub ctx_realpath: Option<PathBuf>,
    pub state: SendState,
    pub flags: u32,
    /// Per-session crypto overrides.
    pub sign_as: Option<String>,
    pub smime_crypt_alg: Option<String>,
    pub global_scope: Option<OptionScope>,
    pub local_scope: Option<OptionScope>,
    pub is_backgrounded: bool,
    pub background_pid: Option<u32>,
    pub options: SessionOptions,
}

impl SendContext {
    /// A fresh session around an empty draft file.
    pub fn new(flags: u32, options: SessionOptions) -> MailForgeResult<Self> {
        let tempfile = temp_message_file(&options.tmpdir)?;
        let msg = DraftMessage::with_text_file(&tempfile);
        Ok(SendContext {
            msg,
            fcc: String::new(),
            tempfile,
            mtime: 0,
            cur: None,
            cur_message_id: None,
            cur_security: SecurityFlags::default(),
            tagged_message_ids: Vec::new(),
            ctx_realpath: None,
            state: SendState::New,
            flags,
            sign_as: None,
            smime_crypt_alg: None,
            global_scope: None,
            local_scope: None,
            is_backgrounded: false,
            background_pid: None,
            options,
        })
    }

    pub fn is_batch(&self) -> bool {
        self.flags & (SEND_BATCH | SEND_MAILX) != 0
    }

    pub fn is_reply(&self) -> bool {
        self.flags
            & (SEND_REPLY
                | SEND_GROUP_REPLY
                | SEND_GROUP_CHAT_REPLY
                | SEND_LIST_REPLY
                | SEND_TO_SENDER)
            != 0
    }

    /// Attach the snapshot of the message being answered.
    pub fn set_current(&mut self, current: CurrentMessage) {
        self.cur_message_id = current.envelope.message_id.clone();
        self.cur_security = current.security;
        self.cur = Some(current);
    }

    /// The envelope From, defaulted from the session options.
    pub fn resolve_from(&mut self) -> MailForgeResult<()> {
        if !self.msg.envelope.from.is_empty() {
            return Ok(());
        }
        let mut from = match &self.options.from {
            Some(configured) => parse_address_list(configured)?,
            None => parse_address_list(&self.options.user)?,
        };
        if let (Some(first), Some(realname)) = (from.first_mut(), &self.options.realname) {
            if first.personal.is_none() {
                first.personal = Some(realname.clone());
            }
        }
        self.msg.envelope.from = from;
        Ok(())
    }

    pub fn envelope_from(&self) -> String {
        self.msg
            .envelope
            .from
            .first()
            .and_then(|a| a.mailbox.clone())
            .unwrap_or_else(|| self.options.user.clone())
    }

    /// Write initial draft text and remember the pre-edit stamp.
    pub fn write_draft_text(&mut self, text: &str) -> MailForgeResult<()> {
        fs::write(&self.tempfile, text).map_err(|e| {
            raise_error!(
                format!("Cannot write draft {:?}: {}", self.tempfile, e),
                ErrorCode::FileOpenFailed
            )
        })?;
        self.mtime = editor::file_mtime(&self.tempfile);
        Ok(())
    }

    pub fn read_draft_text(&self) -> MailForgeResult<String> {
        fs::read_to_string(&self.tempfile).map_err(|e| {
            raise_error!(
                format!("Cannot read draft {:?}: {}", self.tempfile, e),
                ErrorCode::FileOpenFailed
            )
        })
    }

    /// Take over a reconstructed draft: its main text moves into this
    /// session's edit file so the editor and the body tree stay in
    /// sync.
    pub fn adopt_draft(&mut self, msg: DraftMessage) -> MailForgeResult<()> {
        self.msg = msg;
        let Some(main) = self.msg.main_text() else {
            return Ok(());
        };
        let text = self.msg.arena.resolve_content(main, None)?;
        self.write_draft_text(&String::from_utf8_lossy(&text))?;
        let old = std::mem::replace(
            &mut self.msg.arena[main].content,
            crate::modules::mime::body::ContentSource::owned_file(self.tempfile.clone()),
        );
        if let crate::modules::mime::body::ContentSource::File { path, unlink: true } = old {
            if path != self.tempfile {
                let _ = fs::remove_file(path);
            }
        }
        Ok(())
    }

    /// Append the signature file, preceded by the dash line when
    /// configured.
    pub fn append_signature(&mut self) -> MailForgeResult<()> {
        let Some(signature) = &self.options.signature else {
            return Ok(());
        };
        let Ok(sig) = fs::read_to_string(signature) else {
            debug!("Signature file {:?} unreadable; skipping", signature);
            return Ok(());
        };
        let mut text = self.read_draft_text()?;
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        if self.options.sig_dashes {
            text.push_str("-- \n");
        }
        text.push_str(&sig);
        self.write_draft_text(&text)
    }
}

/// Expand aliases and IDNA-normalize all recipient lists.
pub fn prepare_recipients(
    env: &mut Envelope,
    aliases: &AliasTable,
) -> MailForgeResult<()> {
    for list in [&mut env.to, &mut env.cc, &mut env.bcc] {
        let expanded = aliases.expand(std::mem::take(list));
        *list = expanded;
        idna::to_intl(list)?;
    }
    Ok(())
}

/// Post-edit crypto defaults (§crypt knobs), applied only while the
/// security state is still untouched.
pub fn apply_crypto_defaults(sctx: &mut SendContext) {
    if sctx.msg.security.0 != 0 {
        return;
    }
    let options = &sctx.options;
    let mut security = SecurityFlags::default();

    if options.crypt_autosign {
        security.insert(SEC_SIGN);
    }
    if options.crypt_autoencrypt {
        security.insert(SEC_ENCRYPT);
    }
    if sctx.is_reply() {
        if options.crypt_replysign && sctx.cur_security.sign() {
            security.insert(SEC_SIGN);
        }
        if options.crypt_replyencrypt && sctx.cur_security.encrypt() {
            security.insert(SEC_ENCRYPT);
        }
        if options.crypt_replysignencrypted && sctx.cur_security.encrypt() {
            security.insert(SEC_SIGN);
        }
        if options.autocrypt
            && options.autocrypt_reply
            && sctx.cur_security.intersects(SEC_AUTOCRYPT)
        {
            security.insert(SEC_AUTOCRYPT | SEC_AUTOCRYPT_OVERRIDE | APPLICATION_PGP);
        }
    }
    if options.crypt_opportunistic_encrypt {
        security.insert(SEC_OPPENC);
    }

    if security.intersects(SEC_SIGN | SEC_ENCRYPT) && !security.intersects(SEC_AUTOCRYPT) {
        // Pick the backend: follow the original message where the
        // auto-follow knobs say so, else the configured default.
        if options.crypt_auto_pgp && sctx.cur_security.intersects(APPLICATION_PGP) {
            security.insert(APPLICATION_PGP);
        } else if options.crypt_auto_smime && sctx.cur_security.intersects(APPLICATION_SMIME) {
            security.insert(APPLICATION_SMIME);
        } else if options.smime_is_default {
            security.insert(APPLICATION_SMIME);
        } else {
            security.insert(APPLICATION_PGP);
        }
    }

    if security.intersects(APPLICATION_PGP) {
        let inline_new = options.pgp_autoinline;
        let inline_reply = options.pgp_replyinline
            && sctx.is_reply()
            && sctx.cur_security.intersects(SEC_INLINE);
        if inline_new || inline_reply {
            security.insert(SEC_INLINE);
        }
    }

    sctx.msg.security = security;
}

/// Resolve the opportunistic-encryption decision: encrypt iff every
/// recipient resolves to a key, silently.
pub async fn resolve_oppenc(
    sctx: &mut SendContext,
    gateway: &CryptoGateway,
) -> Vec<String> {
    if !sctx.msg.security.intersects(SEC_OPPENC) {
        return Vec::new();
    }
    if !sctx
        .msg
        .security
        .intersects(APPLICATION_PGP | APPLICATION_SMIME)
    {
        sctx.msg.security.insert(if sctx.options.smime_is_default {
            APPLICATION_SMIME
        } else {
            APPLICATION_PGP
        });
    }
    let recipients = sctx.msg.envelope.recipients();
    match gateway
        .find_keys(sctx.msg.security, &recipients, true, None)
        .await
    {
        Ok(keys) => {
            sctx.msg.security.insert(SEC_ENCRYPT);
            keys
        }
        Err(e) => {
            debug!("Opportunistic encryption off: {}", e.oneline());
            sctx.msg.security.remove(SEC_ENCRYPT);
            Vec::new()
        }
    }
}

/// Detach `original` from wherever it sits under `protected`, then
/// free the protection wrappers. Restores the draft to its
/// pre-protection shape after a failed send.
pub fn restore_unprotected(
    msg: &mut DraftMessage,
    protected: BodyId,
    original: BodyId,
) {
    if protected == original {
        return;
    }
    for id in msg.arena.subtree(protected) {
        if !msg.arena.is_alive(id) || !msg.arena[id].major.is_container() {
            continue;
        }
        let children = msg.arena.children(id);
        if let Some(pos) = children.iter().position(|&c| c == original) {
            let next = msg.arena[original].next;
            if pos == 0 {
                msg.arena[id].first_child = next;
            } else {
                let pred = children[pos - 1];
                msg.arena[pred].next = next;
            }
            msg.arena[original].next = None;
            break;
        }
    }
    msg.arena.free(protected);
    msg.arena[original].protected_headers = None;
    msg.root = Some(original);
    msg.security.remove(crate::modules::crypto::SEC_GOODSIGN);
}

/// The finalize stage: recipient checks, protection, Fcc, and the MTA
/// handoff. On MTA failure the pre-protection body is restored so the
/// caller can re-enter compose and retry.
pub async fn finalize_send(
    sctx: &mut SendContext,
    gateway: &CryptoGateway,
    prompter: &mut dyn Prompter,
    aliases: &AliasTable,
) -> MailForgeResult<()> {
    prepare_recipients(&mut sctx.msg.envelope, aliases)?;
    if !sctx.msg.envelope.has_recipients() {
        return Err(raise_error!(
            "No recipients specified".into(),
            ErrorCode::NoRecipients
        ));
    }

    // Empty subject gate.
    if sctx
        .msg
        .envelope
        .subject
        .as_deref()
        .unwrap_or("")
        .is_empty()
    {
        let answer = prompter.ask_quad(
            "No subject, abort sending?",
            sctx.options.abort_nosubject,
        );
        if answer != PromptAnswer::No {
            return Err(raise_error!(
                "Sending aborted: no subject".into(),
                ErrorCode::EmptySubjectAbort
            ));
        }
    }

    // Missing-attachment scan over the draft text.
    if sctx.options.abort_noattach != QuadOption::No {
        let has_attachment = sctx
            .msg
            .root
            .map(|root| sctx.msg.arena.children(root).len() > 1)
            .unwrap_or(false);
        if !has_attachment {
            let text = sctx.read_draft_text().unwrap_or_default();
            let mentions = Regex::new(&format!("(?i){}", sctx.options.abort_noattach_regexp))
                .ok()
                .is_some_and(|re| re.is_match(&text));
            if mentions {
                let answer = prompter.ask_quad(
                    "No attachments, abort sending?",
                    sctx.options.abort_noattach,
                );
                if answer == PromptAnswer::Yes {
                    return Err(raise_error!(
                        "Sending aborted: attachment mentioned but missing".into(),
                        ErrorCode::MissingAttachmentAbort
                    ));
                }
            }
        }
    }

    // Refresh the main text's transfer encoding, and force nested
    // rfc822 parts to 7bit so signatures cover stable bytes.
    if let Some(main) = sctx.msg.main_text() {
        update_encoding(&mut sctx.msg.arena, main)?;
    }
    {
        let root = sctx.msg.root()?;
        for id in sctx.msg.arena.subtree(root) {
            if sctx.msg.arena[id].major == MajorType::Message {
                crate::modules::mime::encoding::message_to_7bit(&mut sctx.msg.arena, id)?;
            }
        }
    }
    let id_is_valid = sctx
        .msg
        .envelope
        .message_id
        .as_deref()
        .is_some_and(crate::modules::envelope::is_valid_message_id);
    if !id_is_valid {
        sctx.msg.envelope.message_id = Some(generate_message_id());
    }
    let mft = reply::generate_followup_to(&sctx.msg.envelope, &sctx.options);
    if !mft.is_empty() && sctx.msg.envelope.mail_followup_to.is_empty() {
        sctx.msg.envelope.mail_followup_to = mft;
    }

    // The Date header is frozen now, before any signature covers it.
    sctx.msg.envelope.date_header();

    // Opportunistic decision, then key resolution for a real encrypt.
    let mut keylist = resolve_oppenc(sctx, gateway).await;
    let protection_needed = sctx.msg.security.intersects(SEC_SIGN | SEC_ENCRYPT)
        || sctx.msg.security.contains(SEC_AUTOCRYPT);
    if sctx.msg.security.encrypt() && keylist.is_empty() {
        let recipients = sctx.msg.envelope.recipients();
        keylist = gateway
            .find_keys(sctx.msg.security, &recipients, false, Some(&mut *prompter))
            .await?;
    }

    let original_root = sctx.msg.root()?;
    let mut protected_root = original_root;
    if protection_needed {
        let mut security = sctx.msg.security;
        if !security.intersects(APPLICATION_PGP | APPLICATION_SMIME)
            && !security.contains(SEC_AUTOCRYPT)
        {
            security.insert(if sctx.options.smime_is_default {
                APPLICATION_SMIME
            } else {
                APPLICATION_PGP
            });
            sctx.msg.security = security;
        }
        crate::modules::mime::write::assign_boundaries(&mut sctx.msg.arena, original_root)?;

        // Per-session overrides take precedence over configured keys.
        let mut options = sctx.options.clone();
        if let Some(sign_as) = &sctx.sign_as {
            if security.is_smime() {
                options.smime_default_key = Some(sign_as.clone());
            } else {
                options.pgp_sign_as = Some(sign_as.clone());
            }
        }
        if let Some(alg) = &sctx.smime_crypt_alg {
            options.smime_encrypt_with = alg.clone();
        }

        if security.contains(SEC_INLINE) && security.is_pgp() {
            gateway
                .pgp
                .traditional(
                    &mut sctx.msg.arena,
                    original_root,
                    &keylist,
                    options.pgp_sign_as.as_deref(),
                    security.sign(),
                    security.encrypt(),
                    &options.tmpdir,
                )
                .await?;
        } else {
            // Protected headers ride on the outermost protected part.
            let snapshot = sctx.msg.envelope.clone();
            sctx.msg.arena[original_root].protected_headers = Some(Box::new(snapshot));
            match gateway
                .protect(
                    &mut sctx.msg.arena,
                    original_root,
                    security,
                    &keylist,
                    &options,
                )
                .await
            {
                Ok(root) => protected_root = root,
                Err(e) => {
                    sctx.msg.arena[original_root].next = None;
                    sctx.msg.arena[original_root].protected_headers = None;
                    return Err(e);
                }
            }
            sctx.msg.root = Some(protected_root);
            if sctx.msg.arena[protected_root].major == MajorType::Multipart {
                sctx.msg.arena[protected_root].encoding = TransferEncoding::SevenBit;
            }
        }
    }

    let wire = sctx.msg.render(&HeaderWriteOptions {
        write_bcc: sctx.options.write_bcc,
        ..Default::default()
    });
    let wire = match wire {
        Ok(wire) => wire,
        Err(e) => {
            restore_unprotected(&mut sctx.msg, protected_root, original_root);
            return Err(e);
        }
    };

    let recipients = mailboxes(&sctx.msg.envelope.recipients());
    let envelope_from = sctx.envelope_from();

    if !sctx.fcc.is_empty() && sctx.options.fcc_before_send {
        fcc::write_fcc(
            &wire,
            &envelope_from,
            &sctx.fcc,
            &sctx.options,
            prompter,
            sctx.is_batch(),
            true,
        )?;
    }

    if let Err(e) = mta::submit(&sctx.options, &envelope_from, &recipients, &wire).await {
        restore_unprotected(&mut sctx.msg, protected_root, original_root);
        return Err(e);
    }

    if !sctx.fcc.is_empty() && !sctx.options.fcc_before_send {
        fcc::write_fcc(
            &wire,
            &envelope_from,
            &sctx.fcc,
            &sctx.options,
            prompter,
            sctx.is_batch(),
            false,
        )?;
    }

    mark_replied(sctx);
    info!("Message sent");
    Ok(())
}

/// After a successful send, set the replied flag on the originals by
/// message-id, because indexes may have shifted while backgrounded.
/// Ids that disappeared in the meantime are skipped silently.
fn mark_replied(sctx: &SendContext) {
    if !sctx.is_reply() {
        return;
    }
    let Some(path) = &sctx.ctx_realpath else {
        return;
    };
    let store = MboxStore::new(path.clone());
    let mut ids: Vec<&String> = sctx.tagged_message_ids.iter().collect();
    if let Some(id) = &sctx.cur_message_id {
        if ids.is_empty() {
            ids.push(id);
        }
    }
    for id in ids {
        match store.set_replied(id) {
            Ok(true) => debug!("Marked {} replied", id),
            Ok(false) => debug!("Message {} no longer present; skipping", id),
            Err(e) => warn!("Cannot set replied flag on {}: {}", id, e.oneline()),
        }
    }
}

/// The default Fcc for a session, from `$record` unless a hook or the
/// user already picked one.
pub fn default_fcc(sctx: &mut SendContext) {
    if sctx.fcc.is_empty() {
        if sctx.options.copy.batch_answer() {
            if let Some(record) = &sctx.options.record {
                sctx.fcc = record.clone();
            }
        }
    }
}

/// Apply reply-hooks (when answering) then send-hooks against the
/// draft's recipients.
pub fn run_send_hooks(sctx: &mut SendContext, reply_hooks: &[String], send_hooks: &[String]) {
    let addresses = mailboxes(&sctx.msg.envelope.recipients());
    if sctx.is_reply() {
        let rules = parse_rules(reply_hooks);
        let from_addrs: Vec<String> = sctx
            .cur
            .as_ref()
            .map(|c| mailboxes(&c.envelope.from))
            .unwrap_or_default();
        apply_hooks(&rules, &from_addrs, &mut sctx.options);
    }
    let rules = parse_rules(send_hooks);
    apply_hooks(&rules, &addresses, &mut sctx.options);
}

/// Build the initial draft text for a reply: attribution plus quoted
/// body when `$include` answers yes.
pub fn build_reply_text(
    sctx: &mut SendContext,
    prompter: &mut dyn Prompter,
) -> MailForgeResult<()> {
    let Some(current) = sctx.cur.clone() else {
        return sctx.write_draft_text("");
    };
    let include = prompter.ask_quad("Include message in reply?", sctx.options.include);
    match include {
        PromptAnswer::Cancel => {
            return Err(raise_error!(
                "Reply cancelled".into(),
                ErrorCode::UserAborted
            ))
        }
        PromptAnswer::No => return sctx.write_draft_text(""),
        PromptAnswer::Yes => {}
    }
    let mut text = reply::make_attribution(&current.envelope, &sctx.options)?;
    text.push('\n');
    let parsed = mail_parser::MessageParser::default().parse(&current.raw[..]);
    let body = parsed
        .as_ref()
        .and_then(|m| m.body_text(0))
        .map(|t| t.into_owned())
        .unwrap_or_default();
    text.push_str(&reply::quote_body(&body, &sctx.options.indent_string));
    sctx.write_draft_text(&text)
}

/// Build a reply session: recipients, subject, and threading headers
/// derive from the original message(s). With several tagged parents
/// the recipients are the union of their authors and the threading
/// headers stay empty.
pub fn begin_reply(
    flags: u32,
    options: SessionOptions,
    originals: Vec<CurrentMessage>,
    ctx_realpath: Option<PathBuf>,
    prompter: &mut dyn Prompter,
) -> MailForgeResult<SendContext> {
    if originals.is_empty() {
        return Err(raise_error!(
            "Nothing to reply to".into(),
            ErrorCode::InvalidParameter
        ));
    }
    let mut sctx = SendContext::new(flags | SEND_REPLY, options)?;
    sctx.ctx_realpath = ctx_realpath;

    if originals.len() == 1 {
        let current = originals.into_iter().next().ok_or_else(|| {
            raise_error!("Nothing to reply to".into(), ErrorCode::InternalError)
        })?;
        let mut out = Envelope::new();
        reply::fetch_recips(&mut out, &current.envelope, flags, &sctx.options, prompter)?;
        reply::reply_subject(&mut out, &current.envelope, &sctx.options);
        reply::reply_references(&mut out, &current.envelope);
        sctx.msg.envelope = out;
        sctx.set_current(current);
    } else {
        let envelopes: Vec<Envelope> =
            originals.iter().map(|c| c.envelope.clone()).collect();
        let mut out = Envelope::new();
        out.to = reply::union_of_senders(&envelopes);
        reply::fix_reply_recipients(&mut out, &sctx.options)?;
        reply::reply_subject(&mut out, &envelopes[0], &sctx.options);
        reply::clear_references_for_multiple_parents(&mut out);
        sctx.msg.envelope = out;
        sctx.tagged_message_ids = envelopes
            .iter()
            .filter_map(|e| e.message_id.clone())
            .collect();
        let folded = originals
            .iter()
            .fold(SecurityFlags::default(), |mut acc, c| {
                acc.insert(c.security.0);
                acc
            });
        if let Some(first) = originals.into_iter().next() {
            sctx.set_current(first);
        }
        sctx.cur_security = folded;
        sctx.cur_message_id = None;
    }
    Ok(sctx)
}

/// Build a forward session. `$mime_forward` selects between attaching
/// the original as message/rfc822 and copying it inline with the
/// attribution banners; the non-decodable leaves of a decoded inline
/// forward are re-attached after a single prompt.
pub fn begin_forward(
    flags: u32,
    options: SessionOptions,
    original: CurrentMessage,
    ctx_realpath: Option<PathBuf>,
    prompter: &mut dyn Prompter,
) -> MailForgeResult<SendContext> {
    let mut sctx = SendContext::new(flags | SEND_FORWARD, options)?;
    sctx.ctx_realpath = ctx_realpath;
    forward::forward_subject(&mut sctx.msg.envelope, &original.envelope, &sctx.options)?;

    let as_attachment = prompter
        .ask_quad("Forward as attachment?", sctx.options.mime_forward)
        .is_yes();
    if as_attachment {
        sctx.write_draft_text("")?;
        let mut attachments = crate::modules::attach::AttachCtx::new();
        attachments.rebuild(&sctx.msg);
        let tmpdir = sctx.options.tmpdir.clone();
        forward::attach_forward(&mut sctx.msg, &mut attachments, &original.raw, &tmpdir)?;
    } else {
        let parsed = mail_parser::MessageParser::default()
            .parse(&original.raw[..])
            .ok_or_else(|| {
                raise_error!(
                    "Cannot parse message to forward".into(),
                    ErrorCode::MessageParseFailed
                )
            })?;
        let rendered =
            forward::render_inline_forward(&parsed, &original.envelope, &sctx.options)?;
        sctx.write_draft_text(&rendered.text)?;
        if !rendered.undecodable_parts.is_empty() {
            let keep = prompter.ask_quad(
                "Forward attachments that cannot be decoded?",
                sctx.options.forward_attachments,
            );
            if keep.is_yes() {
                let mut attachments = crate::modules::attach::AttachCtx::new();
                attachments.rebuild(&sctx.msg);
                let tmpdir = sctx.options.tmpdir.clone();
                forward::reattach_parts(
                    &mut sctx.msg,
                    &mut attachments,
                    &parsed,
                    &rendered.undecodable_parts,
                    &tmpdir,
                )?;
            }
        }
    }
    sctx.set_current(original);
    Ok(sctx)
}

/// Per-process send environment: alias table and hook scripts, built
/// once from the settings.
pub struct SendEnvironment {
    pub aliases: AliasTable,
    pub reply_hooks: Vec<String>,
    pub send_hooks: Vec<String>,
    pub send2_hooks: Vec<String>,
}

impl SendEnvironment {
    pub fn from_settings(settings: &crate::modules::settings::cli::Settings) -> Self {
        SendEnvironment {
            aliases: AliasTable::from_definitions(&settings.mailforge_alias),
            reply_hooks: settings.mailforge_reply_hook.clone(),
            send_hooks: settings.mailforge_send_hook.clone(),
            send2_hooks: settings.mailforge_send2_hook.clone(),
        }
    }

    pub fn empty() -> Self {
        SendEnvironment {
            aliases: AliasTable::default(),
            reply_hooks: Vec::new(),
            send_hooks: Vec::new(),
            send2_hooks: Vec::new(),
        }
    }
}

/// Rewrite the draft file as an editable buffer, optionally with the
/// header block in front of the body.
pub fn prepare_edit_buffer(sctx: &mut SendContext, with_headers: bool) -> MailForgeResult<()> {
    if !with_headers {
        sctx.mtime = editor::file_mtime(&sctx.tempfile);
        return Ok(());
    }
    let body = sctx.read_draft_text()?;
    let env = &sctx.msg.envelope;
    let mut buffer = String::new();
    buffer.push_str(&format!(
        "From: {}\n",
        crate::modules::address::write_address_list(&env.from, true)
    ));
    buffer.push_str(&format!(
        "To: {}\n",
        crate::modules::address::write_address_list(&env.to, true)
    ));
    buffer.push_str(&format!(
        "Cc: {}\n",
        crate::modules::address::write_address_list(&env.cc, true)
    ));
    buffer.push_str(&format!(
        "Bcc: {}\n",
        crate::modules::address::write_address_list(&env.bcc, true)
    ));
    buffer.push_str(&format!(
        "Subject: {}\n",
        env.subject.as_deref().unwrap_or("")
    ));
    buffer.push_str(&format!(
        "Reply-To: {}\n",
        crate::modules::address::write_address_list(&env.reply_to, true)
    ));
    buffer.push_str(&format!("Fcc: {}\n", sctx.fcc));
    for header in &env.user_headers {
        buffer.push_str(header);
        buffer.push('\n');
    }
    buffer.push('\n');
    buffer.push_str(&body);
    sctx.write_draft_text(&buffer)
}

/// Parse the edited buffer back: the header block mutates the
/// envelope, the remainder becomes the draft body again.
pub fn absorb_edit_buffer(sctx: &mut SendContext, with_headers: bool) -> MailForgeResult<()> {
    if !with_headers {
        return Ok(());
    }
    let buffer = sctx.read_draft_text()?;
    let (head, body) = match buffer.split_once("\n\n") {
        Some((head, body)) => (head.to_string(), body.to_string()),
        None => (String::new(), buffer),
    };

    // Unfold continuation lines before interpreting.
    let mut lines: Vec<String> = Vec::new();
    for line in head.lines() {
        if (line.starts_with(' ') || line.starts_with('\t')) && !lines.is_empty() {
            if let Some(last) = lines.last_mut() {
                last.push(' ');
                last.push_str(line.trim_start());
            }
        } else {
            lines.push(line.to_string());
        }
    }

    sctx.msg.envelope.user_headers.clear();
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "from" => sctx.msg.envelope.from = parse_or_empty(value)?,
            "to" => sctx.msg.envelope.to = parse_or_empty(value)?,
            "cc" => sctx.msg.envelope.cc = parse_or_empty(value)?,
            "bcc" => sctx.msg.envelope.bcc = parse_or_empty(value)?,
            "reply-to" => sctx.msg.envelope.reply_to = parse_or_empty(value)?,
            "subject" => {
                let regexp = sctx.options.reply_regexp.clone();
                sctx.msg.envelope.set_subject(value, &regexp);
            }
            "fcc" => sctx.fcc = value.to_string(),
            _ => sctx
                .msg
                .envelope
                .user_headers
                .push(format!("{}: {}", name.trim(), value)),
        }
    }
    sctx.write_draft_text(&body)
}

fn parse_or_empty(value: &str) -> MailForgeResult<Vec<Address>> {
    if value.trim().is_empty() {
        Ok(Vec::new())
    } else {
        parse_address_list(value)
    }
}

/// The first edit: mailcap for non-text drafts, `$editor` otherwise,
/// headers in the buffer when `$edit_headers`. Returns true when the
/// session should suspend for a background editor instead.
pub async fn first_edit(
    sctx: &mut SendContext,
    prompter: &mut dyn Prompter,
) -> MailForgeResult<bool> {
    // A non-text main part is handed to its mailcap edit command.
    let mailcap_entry = sctx.msg.main_text().is_none().then(|| {
        let root = sctx.msg.root().ok()?;
        let ctype = sctx.msg.arena[root].type_string();
        let path = crate::modules::mailcap::search_path(
            &crate::modules::settings::cli::SETTINGS.mailforge_mailcap_path,
        );
        crate::modules::mailcap::lookup(
            &path,
            &ctype,
            crate::modules::mailcap::MailcapField::Edit,
        )
        .ok()
        .map(|entry| (entry, ctype))
    });
    if let Some(Some((entry, ctype))) = mailcap_entry {
        let root = sctx.msg.root()?;
        let file = sctx.msg.arena[root]
            .content
            .file_path()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        if crate::modules::mailcap::test_passes(&entry, &file, &ctype).await {
            let command = entry.expand_command(&file, &ctype);
            let status = tokio::process::Command::new("/bin/sh")
                .arg("-c")
                .arg(&command)
                .status()
                .await
                .map_err(|e| {
                    raise_error!(
                        format!("Cannot run mailcap editor {:?}: {}", command, e),
                        ErrorCode::EditorFailed
                    )
                })?;
            if !status.success() {
                return Err(raise_error!(
                    format!("Mailcap editor exited with {}", status.code().unwrap_or(-1)),
                    ErrorCode::EditorFailed
                ));
            }
            let root = sctx.msg.root()?;
            sctx.msg.arena[root].restamp();
            return Ok(false);
        }
    }

    let with_headers = sctx.options.edit_headers;
    sctx.state = if with_headers {
        SendState::FirstEditHeaders
    } else {
        SendState::FirstEdit
    };
    prepare_edit_buffer(sctx, with_headers)?;
    if sctx.options.background_edit && sctx.flags & SEND_BACKGROUND_EDIT != 0 {
        return Ok(true);
    }

    let before = editor::file_mtime(&sctx.tempfile);
    editor::edit_foreground(&sctx.options.editor, &sctx.tempfile).await?;
    let after = editor::file_mtime(&sctx.tempfile);

    if after == before && sctx.is_reply() {
        let answer = prompter.ask_quad(
            "Message not modified, abort?",
            sctx.options.abort_unmodified,
        );
        if answer != PromptAnswer::No {
            return Err(raise_error!(
                "Aborted unmodified message".into(),
                ErrorCode::UnmodifiedAbort
            ));
        }
    }
    absorb_edit_buffer(sctx, with_headers)?;
    sctx.mtime = editor::file_mtime(&sctx.tempfile);
    Ok(false)
}

/// Drive one send session from setup to a terminal outcome. On a
/// background suspension, ownership of the SCTX moves to the registry
/// and the caller resumes it from a reap event.
pub async fn send_message(
    mut sctx: SendContext,
    gateway: &CryptoGateway,
    prompter: &mut dyn Prompter,
    ops: &mut dyn crate::modules::compose::OpSource,
    registry: Option<&background::BackgroundRegistry>,
    autocrypt_db: Option<&dyn crate::modules::crypto::autocrypt::AutocryptDb>,
    environment: &SendEnvironment,
) -> MailForgeResult<SendOutcome> {
    // Offer postponed drafts before starting something new.
    if sctx.flags & SEND_CHECK_POSTPONED != 0
        && sctx.flags & SEND_POSTPONED == 0
        && postpone::postponed_count(&sctx.options) > 0
    {
        let answer = prompter.ask_quad("Recall postponed message?", sctx.options.recall);
        match answer {
            PromptAnswer::Yes => {
                let resumed = postpone::resume_first(gateway, &sctx.options).await?;
                sctx.adopt_draft(resumed.msg)?;
                sctx.fcc = resumed.fcc;
                sctx.flags |= SEND_POSTPONED;
            }
            PromptAnswer::Cancel => {
                return Err(raise_error!(
                    "Cancelled".into(),
                    ErrorCode::UserAborted
                ))
            }
            PromptAnswer::No => {}
        }
    }

    // Setup: hooks, identity, reply/forward body, signature.
    run_send_hooks(
        &mut sctx,
        &environment.reply_hooks,
        &environment.send_hooks,
    );
    sctx.resolve_from()?;
    if sctx.flags & SEND_POSTPONED == 0 {
        if sctx.is_reply() && sctx.cur.is_some() {
            build_reply_text(&mut sctx, prompter)?;
        }
        if sctx.flags & SEND_BATCH == 0 {
            sctx.append_signature()?;
        }
    }
    {
        let rules = parse_rules(&environment.send2_hooks);
        let addresses = mailboxes(&sctx.msg.envelope.recipients());
        apply_hooks(&rules, &addresses, &mut sctx.options);
    }

    // First edit, unless batch/mailx/key modes skip it.
    if !sctx.is_batch()
        && sctx.flags & SEND_KEY == 0
        && !sctx.options.autoedit
    {
        if first_edit(&mut sctx, prompter).await? {
            let registry = registry.ok_or_else(|| {
                raise_error!(
                    "Background editing is not available here".into(),
                    ErrorCode::InvalidParameter
                )
            })?;
            let editor = sctx.options.editor.clone();
            let draft = sctx.tempfile.clone();
            registry.launch(sctx, &editor, &draft).await?;
            return Ok(SendOutcome::Backgrounded);
        }
    }

    apply_crypto_defaults(&mut sctx);
    default_fcc(&mut sctx);

    if sctx.is_batch() {
        return match finalize_send(&mut sctx, gateway, prompter, &environment.aliases).await {
            Ok(()) => Ok(SendOutcome::Sent),
            Err(e) => Err(e),
        };
    }

    compose_and_finish(sctx, gateway, prompter, ops, registry, autocrypt_db, environment).await
}

/// The compose half of the session: loop the controller, then
/// dispatch its outcome. Interactive finalize errors return the user
/// to the controller; a user abort terminates the session.
pub async fn compose_and_finish(
    mut sctx: SendContext,
    gateway: &CryptoGateway,
    prompter: &mut dyn Prompter,
    ops: &mut dyn crate::modules::compose::OpSource,
    registry: Option<&background::BackgroundRegistry>,
    autocrypt_db: Option<&dyn crate::modules::crypto::autocrypt::AutocryptDb>,
    environment: &SendEnvironment,
) -> MailForgeResult<SendOutcome> {
    loop {
        let outcome = crate::modules::compose::compose_loop(
            &mut sctx,
            gateway,
            prompter,
            ops,
            autocrypt_db,
        )
        .await?;
        match outcome {
            crate::modules::compose::ComposeOutcome::Send => {
                match finalize_send(&mut sctx, gateway, prompter, &environment.aliases).await {
                    Ok(()) => return Ok(SendOutcome::Sent),
                    Err(e) if e.kind() == crate::modules::error::code::ErrorKind::UserAborted => {
                        return Err(e)
                    }
                    Err(e) => {
                        warn!("Send failed: {}", e.oneline());
                        continue;
                    }
                }
            }
            crate::modules::compose::ComposeOutcome::Postpone => {
                postpone::postpone_draft(&mut sctx, gateway).await?;
                return Ok(SendOutcome::Postponed);
            }
            crate::modules::compose::ComposeOutcome::Abort => {
                info!("Message aborted");
                return Ok(SendOutcome::Aborted);
            }
            crate::modules::compose::ComposeOutcome::Background => {
                let registry = registry.ok_or_else(|| {
                    raise_error!(
                        "Background editing is not available here".into(),
                        ErrorCode::InvalidParameter
                    )
                })?;
                let with_headers = matches!(
                    sctx.state,
                    SendState::FirstEditHeaders | SendState::ComposeEditHeaders
                );
                prepare_edit_buffer(&mut sctx, with_headers)?;
                let editor = sctx.options.editor.clone();
                let draft = sctx.tempfile.clone();
                registry.launch(sctx, &editor, &draft).await?;
                return Ok(SendOutcome::Backgrounded);
            }
        }
    }
}

/// Re-enter a reaped session: restore the compose-time options (the
/// §scope swap against the index options), absorb the edit, and run
/// the controller again.
pub async fn resume_backgrounded(
    mut sctx: SendContext,
    index_options: &mut SessionOptions,
    gateway: &CryptoGateway,
    prompter: &mut dyn Prompter,
    ops: &mut dyn crate::modules::compose::OpSource,
    registry: Option<&background::BackgroundRegistry>,
    autocrypt_db: Option<&dyn crate::modules::crypto::autocrypt::AutocryptDb>,
    environment: &SendEnvironment,
) -> MailForgeResult<SendOutcome> {
    sctx.global_scope = Some(OptionScope::capture(index_options));
    let restore = sctx
        .local_scope
        .take()
        .map(|local| local.swap_in(index_options));

    let with_headers = matches!(
        sctx.state,
        SendState::FirstEditHeaders | SendState::ComposeEditHeaders
    );
    let modified = editor::file_mtime(&sctx.tempfile) != sctx.mtime;
    if modified {
        absorb_edit_buffer(&mut sctx, with_headers)?;
        if let Some(main) = sctx.msg.main_text() {
            sctx.msg.arena[main].restamp();
            update_encoding(&mut sctx.msg.arena, main)?;
        }
    }
    if matches!(sctx.state, SendState::FirstEdit | SendState::FirstEditHeaders) {
        apply_crypto_defaults(&mut sctx);
        default_fcc(&mut sctx);
    }

    let global = sctx.global_scope.take();
    let result = compose_and_finish(
        sctx,
        gateway,
        prompter,
        ops,
        registry,
        autocrypt_db,
        environment,
    )
    .await;

    // The compose-session options were live while the session ran;
    // the index gets its own back now.
    if let Some(restore) = restore {
        let _ = restore.swap_in(index_options);
    } else if let Some(global) = global {
        let _ = global.swap_in(index_options);
    }
    result
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::modules::settings::cli::Settings;

    fn options() -> SessionOptions {
        let mut opts = SessionOptions::from_settings(&Settings::new_for_test());
        opts.tmpdir = std::env::temp_dir();
        opts.user = "me@example.com".to_string();
        opts
    }

    #[test]
    fn crypto_defaults_follow_reply_security() {
        let mut sctx = SendContext::new(SEND_REPLY, options()).unwrap();
        sctx.options.crypt_replyencrypt = true;
        sctx.options.crypt_replysignencrypted = true;
        sctx.cur_security = SecurityFlags(SEC_ENCRYPT | APPLICATION_PGP);
        apply_crypto_defaults(&mut sctx);
        assert!(sctx.msg.security.encrypt());
        assert!(sctx.msg.security.sign());
        assert!(sctx.msg.security.intersects(APPLICATION_PGP));
    }

    #[test]
    fn crypto_defaults_leave_touched_state_alone() {
        let mut sctx = SendContext::new(0, options()).unwrap();
        sctx.options.crypt_autosign = true;
        sctx.msg.security = SecurityFlags(SEC_ENCRYPT | APPLICATION_SMIME);
        apply_crypto_defaults(&mut sctx);
        assert!(!sctx.msg.security.sign());
    }

    #[test]
    fn default_fcc_respects_copy_quadoption() {
        let mut sctx = SendContext::new(0, options()).unwrap();
        sctx.options.record = Some("=sent".to_string());
        default_fcc(&mut sctx);
        assert_eq!(sctx.fcc, "=sent");

        let mut off = SendContext::new(0, options()).unwrap();
        off.options.copy = QuadOption::No;
        off.options.record = Some("=sent".to_string());
        default_fcc(&mut off);
        assert!(off.fcc.is_empty());
    }

    #[test]
    fn resolve_from_uses_configured_identity() {
        let mut sctx = SendContext::new(0, options()).unwrap();
        sctx.options.from = Some("jane@example.com".to_string());
        sctx.options.realname = Some("Jane Doe".to_string());
        sctx.resolve_from().unwrap();
        assert_eq!(
            sctx.msg.envelope.from[0].mailbox.as_deref(),
            Some("jane@example.com")
        );
        assert_eq!(
            sctx.msg.envelope.from[0].personal.as_deref(),
            Some("Jane Doe")
        );
    }

    #[test]
    fn signature_appended_with_dashes() {
        let dir = tempfile::tempdir().unwrap();
        let sig = dir.path().join("sig");
        fs::write(&sig, "Jane\n").unwrap();
        let mut sctx = SendContext::new(0, options()).unwrap();
        sctx.options.signature = Some(sig);
        sctx.write_draft_text("body\n").unwrap();
        sctx.append_signature().unwrap();
        assert_eq!(sctx.read_draft_text().unwrap(), "body\n-- \nJane\n");
    }
}
