// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::collections::VecDeque;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::modules::address::parse_address_list;
use crate::modules::attach::AttachCtx;
use crate::modules::common::prompt::{PromptAnswer, Prompter};
use crate::modules::crypto::autocrypt::{recommendation, AutocryptDb, AutocryptRec};
use crate::modules::crypto::{
    CryptoGateway, APPLICATION_PGP, APPLICATION_SMIME, SEC_AUTOCRYPT, SEC_AUTOCRYPT_OVERRIDE,
    SEC_ENCRYPT, SEC_INLINE, SEC_OPPENC, SEC_SIGN,
};
use crate::modules::error::MailForgeResult;
use crate::modules::mime::body::{Disposition, MajorType};
use crate::modules::mime::encoding::update_encoding;
use crate::modules::send::editor::{edit_foreground, file_mtime};
use crate::modules::send::{SendContext, SendState};
use crate::modules::settings::quad::QuadOption;

pub mod ops;

/// One user operation against the compose view. Free-text inputs are
/// gathered through the prompter at dispatch time, so ops are plain
/// commands the way menu keys are.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ComposeOp {
    EditTo,
    EditCc,
    EditBcc,
    EditFrom,
    EditReplyTo,
    EditSubject,
    EditFcc,
    EditMessage,
    EditHeaders,
    AttachFile,
    AttachMessage,
    AttachKey,
    Detach(usize),
    MoveUp(usize),
    MoveDown(usize),
    EditType(usize),
    EditEncoding(usize),
    ToggleDisposition(usize),
    ToggleUnlink(usize),
    ToggleRecode(usize),
    RenameAttachment(usize),
    RenameFile(usize),
    UpdateEncoding(usize),
    ToggleSign,
    ToggleEncrypt,
    ToggleInline,
    UsePgp,
    UseSmime,
    ToggleAutocrypt,
    SignAs,
    ClearSecurity,
    Send,
    Postpone,
    Abort,
    Background,
}

/// How the compose session ended.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ComposeOutcome {
    Send,
    Postpone,
    Abort,
    Background,
}

/// Feeds operations to the controller: the TUI in interactive use, a
/// script in tests.
pub trait OpSource {
    fn next_op(&mut self) -> ComposeOp;
}

pub struct ScriptedOps {
    ops: VecDeque<ComposeOp>,
}

impl ScriptedOps {
    pub fn new(ops: impl IntoIterator<Item = ComposeOp>) -> Self {
        ScriptedOps {
            ops: ops.into_iter().collect(),
        }
    }
}

impl OpSource for ScriptedOps {
    fn next_op(&mut self) -> ComposeOp {
        self.ops.pop_front().unwrap_or(ComposeOp::Send)
    }
}

fn edit_address_list(
    prompter: &mut dyn Prompter,
    prompt: &str,
    list: &mut Vec<crate::modules::address::Address>,
) -> MailForgeResult<bool> {
    let current = crate::modules::address::write_address_list(list, true);
    let Some(entered) = prompter.ask_string(prompt, &current) else {
        return Ok(false);
    };
    if entered == current {
        return Ok(false);
    }
    *list = if entered.trim().is_empty() {
        Vec::new()
    } else {
        parse_address_list(&entered)?
    };
    Ok(true)
}

/// The compose controller: a loop over user operations mutating the
/// SCTX until the user chooses send, postpone, abort, or background.
/// It never touches the originating mailbox; recipient changes
/// invalidate the opportunistic-encrypt and autocrypt decisions.
pub async fn compose_loop(
    sctx: &mut SendContext,
    gateway: &CryptoGateway,
    prompter: &mut dyn Prompter,
    ops: &mut dyn OpSource,
    autocrypt_db: Option<&dyn AutocryptDb>,
) -> MailForgeResult<ComposeOutcome> {
    let mut attachments = AttachCtx::new();
    attachments.rebuild(&sctx.msg);
    let mut recommendation_state = compute_recommendation(sctx, autocrypt_db);
    apply_recommendation(sctx, recommendation_state);

    // An enabled account advertises its key on everything it sends.
    if let Some(db) = autocrypt_db {
        let from = sctx
            .msg
            .envelope
            .from
            .first()
            .and_then(|a| a.mailbox.clone())
            .unwrap_or_else(|| sctx.options.user.clone());
        if let Some(account) = db.account(&from) {
            if account.enabled && sctx.msg.envelope.autocrypt.is_none() {
                sctx.msg.envelope.autocrypt =
                    Some(crate::modules::crypto::autocrypt::account_header(&account));
            }
        }
    }

    macro_rules! entry_body {
        ($index:expr) => {
            match attachments.entry($index) {
                Ok(entry) => entry.body,
                Err(e) => {
                    warn!("{}", e.oneline());
                    continue;
                }
            }
        };
    }

    loop {
        let op = ops.next_op();
        debug!("compose op: {:?}", op);
        let mut recipients_changed = false;
        match op {
            ComposeOp::EditTo => {
                match edit_address_list(prompter, "To", &mut sctx.msg.envelope.to) {
                    Ok(changed) => recipients_changed = changed,
                    Err(e) => warn!("{}", e.oneline()),
                }
            }
            ComposeOp::EditCc => {
                match edit_address_list(prompter, "Cc", &mut sctx.msg.envelope.cc) {
                    Ok(changed) => recipients_changed = changed,
                    Err(e) => warn!("{}", e.oneline()),
                }
            }
            ComposeOp::EditBcc => {
                match edit_address_list(prompter, "Bcc", &mut sctx.msg.envelope.bcc) {
                    Ok(changed) => recipients_changed = changed,
                    Err(e) => warn!("{}", e.oneline()),
                }
            }
            ComposeOp::EditFrom => {
                if let Err(e) =
                    edit_address_list(prompter, "From", &mut sctx.msg.envelope.from)
                {
                    warn!("{}", e.oneline());
                }
            }
            ComposeOp::EditReplyTo => {
                if let Err(e) =
                    edit_address_list(prompter, "Reply-To", &mut sctx.msg.envelope.reply_to)
                {
                    warn!("{}", e.oneline());
                }
            }
            ComposeOp::EditSubject => {
                let current = sctx.msg.envelope.subject.clone().unwrap_or_default();
                if let Some(subject) = prompter.ask_string("Subject", &current) {
                    let regexp = sctx.options.reply_regexp.clone();
                    sctx.msg.envelope.set_subject(&subject, &regexp);
                }
            }
            ComposeOp::EditFcc => {
                if let Some(fcc) = prompter.ask_string("Fcc", &sctx.fcc) {
                    sctx.fcc = fcc;
                }
            }
            ComposeOp::EditMessage | ComposeOp::EditHeaders => {
                let with_headers =
                    op == ComposeOp::EditHeaders || sctx.options.edit_headers;
                sctx.state = if with_headers {
                    SendState::ComposeEditHeaders
                } else {
                    SendState::ComposeEdit
                };
                if sctx.options.background_edit {
                    return Ok(ComposeOutcome::Background);
                }
                crate::modules::send::prepare_edit_buffer(sctx, with_headers)?;
                let before = file_mtime(&sctx.tempfile);
                if let Err(e) = edit_foreground(&sctx.options.editor, &sctx.tempfile).await {
                    warn!("{}", e.oneline());
                }
                if file_mtime(&sctx.tempfile) != before {
                    crate::modules::send::absorb_edit_buffer(sctx, with_headers)?;
                    if let Some(main) = sctx.msg.main_text() {
                        sctx.msg.arena[main].restamp();
                        update_encoding(&mut sctx.msg.arena, main)?;
                    }
                }
                attachments.rebuild(&sctx.msg);
            }
            ComposeOp::AttachFile => {
                if let Some(path) = prompter.ask_string("Attach file", "") {
                    if !path.trim().is_empty() {
                        if let Err(e) = attachments
                            .attach_file(&mut sctx.msg, &PathBuf::from(path.trim()))
                        {
                            warn!("{}", e.oneline());
                        }
                    }
                }
            }
            ComposeOp::AttachMessage => {
                if let Some(path) = prompter.ask_string("Attach message file", "") {
                    if !path.trim().is_empty() {
                        match std::fs::read(path.trim()) {
                            Ok(raw) => {
                                let tmpdir = sctx.options.tmpdir.clone();
                                if let Err(e) =
                                    attachments.attach_message(&mut sctx.msg, &raw, &tmpdir)
                                {
                                    warn!("{}", e.oneline());
                                }
                            }
                            Err(e) => warn!("Cannot read {}: {}", path.trim(), e),
                        }
                    }
                }
            }
            ComposeOp::AttachKey => {
                let default = sctx
                    .sign_as
                    .clone()
                    .or_else(|| sctx.options.pgp_sign_as.clone())
                    .unwrap_or_default();
                if let Some(key) = prompter.ask_string("Attach key", &default) {
                    if !key.trim().is_empty() {
                        let tmpdir = sctx.options.tmpdir.clone();
                        let id = match gateway
                            .pgp
                            .key_attachment(&mut sctx.msg.arena, key.trim(), &tmpdir)
                            .await
                        {
                            Ok(id) => id,
                            Err(e) => {
                                warn!("{}", e.oneline());
                                continue;
                            }
                        };
                        let root = sctx.msg.root()?;
                        let parent = if sctx.msg.arena[root].major == MajorType::Multipart {
                            root
                        } else {
                            let wrapper = sctx.msg.arena.make_multipart_mixed(root);
                            sctx.msg.root = Some(wrapper);
                            wrapper
                        };
                        match sctx.msg.arena.children(parent).last() {
                            Some(&last) if last != id => {
                                sctx.msg.arena[last].next = Some(id)
                            }
                            _ => sctx.msg.arena[parent].first_child = Some(id),
                        }
                        attachments.rebuild(&sctx.msg);
                        sctx.msg
                            .security
                            .insert(crate::modules::crypto::SEC_KEY_ATTACH);
                    }
                }
            }
            ComposeOp::Detach(index) => {
                let is_main = attachments
                    .entry(index)
                    .ok()
                    .map(|e| Some(e.body) == sctx.msg.main_text())
                    .unwrap_or(false);
                if is_main {
                    let confirmed = prompter.ask_quad(
                        "Really delete the main message text?",
                        QuadOption::AskNo,
                    );
                    if confirmed != PromptAnswer::Yes {
                        continue;
                    }
                }
                if let Err(e) = attachments.delete(&mut sctx.msg, index) {
                    warn!("{}", e.oneline());
                }
            }
            ComposeOp::MoveUp(index) => {
                if let Err(e) = attachments.move_up(&mut sctx.msg, index) {
                    info!("{}", e.oneline());
                }
            }
            ComposeOp::MoveDown(index) => {
                if let Err(e) = attachments.move_down(&mut sctx.msg, index) {
                    info!("{}", e.oneline());
                }
            }
            ComposeOp::EditType(index) => {
                let body = entry_body!(index);
                let current = sctx.msg.arena[body].type_string();
                if let Some(entered) = prompter.ask_string("Content-Type", &current) {
                    let Some((major, subtype)) = entered.split_once('/') else {
                        warn!("Bad content type: {}", entered);
                        continue;
                    };
                    sctx.msg.arena[body].major = MajorType::parse(major.trim());
                    sctx.msg.arena[body].subtype =
                        subtype.trim().to_ascii_lowercase();
                    update_encoding(&mut sctx.msg.arena, body)?;
                }
            }
            ComposeOp::EditEncoding(index) => {
                let body = entry_body!(index);
                let current = sctx.msg.arena[body].encoding.as_str().to_string();
                if let Some(entered) = prompter.ask_string("Content-Transfer-Encoding", &current)
                {
                    let entered = entered.trim().to_ascii_lowercase();
                    match entered.as_str() {
                        "7bit" | "8bit" | "binary" | "quoted-printable" | "base64" => {
                            sctx.msg.arena[body].encoding =
                                crate::modules::mime::body::TransferEncoding::parse(&entered);
                        }
                        other => warn!("Unknown transfer encoding: {}", other),
                    }
                }
            }
            ComposeOp::RenameFile(index) => {
                let body = entry_body!(index);
                let Some(current) = sctx.msg.arena[body]
                    .content
                    .file_path()
                    .map(|p| p.to_string_lossy().into_owned())
                else {
                    continue;
                };
                if let Some(entered) = prompter.ask_string("Rename file to", &current) {
                    let entered = entered.trim();
                    if entered.is_empty() || entered == current {
                        continue;
                    }
                    let new_path = PathBuf::from(entered);
                    if let Err(e) = std::fs::rename(&current, &new_path) {
                        warn!("Cannot rename {:?} to {:?}: {}", current, new_path, e);
                        continue;
                    }
                    if let crate::modules::mime::body::ContentSource::File { path, .. } =
                        &mut sctx.msg.arena[body].content
                    {
                        *path = new_path;
                    }
                    sctx.msg.arena[body].restamp();
                }
            }
            ComposeOp::ToggleDisposition(index) => {
                let body = entry_body!(index);
                let node = &mut sctx.msg.arena[body];
                node.disposition = match node.disposition {
                    Disposition::Inline => Disposition::Attachment,
                    Disposition::Attachment => Disposition::Inline,
                };
            }
            ComposeOp::ToggleUnlink(index) => {
                let body = entry_body!(index);
                if let crate::modules::mime::body::ContentSource::File { unlink, .. } =
                    &mut sctx.msg.arena[body].content
                {
                    *unlink = !*unlink;
                }
            }
            ComposeOp::ToggleRecode(index) => {
                let body = entry_body!(index);
                let node = &mut sctx.msg.arena[body];
                node.noconv = !node.noconv;
            }
            ComposeOp::RenameAttachment(index) => {
                let body = entry_body!(index);
                let current = sctx.msg.arena[body]
                    .d_filename
                    .clone()
                    .unwrap_or_default();
                if let Some(name) = prompter.ask_string("Display name", &current) {
                    sctx.msg.arena[body].d_filename =
                        Some(name).filter(|n| !n.is_empty());
                }
            }
            ComposeOp::UpdateEncoding(index) => {
                let body = entry_body!(index);
                update_encoding(&mut sctx.msg.arena, body)?;
                sctx.msg.arena[body].restamp();
            }
            ComposeOp::ToggleSign => {
                if sctx.msg.security.sign() {
                    sctx.msg.security.remove(SEC_SIGN);
                } else {
                    sctx.msg.security.set_manual_protection(SEC_SIGN);
                }
            }
            ComposeOp::ToggleEncrypt => {
                if sctx.msg.security.encrypt() {
                    sctx.msg.security.remove(SEC_ENCRYPT);
                } else {
                    sctx.msg.security.set_manual_protection(SEC_ENCRYPT);
                    sctx.msg.security.remove(SEC_OPPENC);
                }
            }
            ComposeOp::ToggleInline => {
                if sctx.msg.security.intersects(SEC_AUTOCRYPT) {
                    info!("Inline armor is unavailable with autocrypt");
                } else {
                    let was = sctx.msg.security.intersects(SEC_INLINE);
                    if was {
                        sctx.msg.security.remove(SEC_INLINE);
                    } else {
                        sctx.msg.security.insert(SEC_INLINE);
                    }
                }
            }
            ComposeOp::UsePgp => {
                sctx.msg.security.remove(APPLICATION_SMIME);
                sctx.msg.security.set_manual_protection(APPLICATION_PGP);
            }
            ComposeOp::UseSmime => {
                sctx.msg
                    .security
                    .remove(APPLICATION_PGP | SEC_INLINE | SEC_AUTOCRYPT);
                sctx.msg.security.insert(APPLICATION_SMIME);
            }
            ComposeOp::ToggleAutocrypt => {
                if sctx.msg.security.intersects(SEC_AUTOCRYPT) {
                    sctx.msg
                        .security
                        .remove(SEC_AUTOCRYPT | SEC_AUTOCRYPT_OVERRIDE);
                } else {
                    sctx.msg
                        .security
                        .remove(APPLICATION_SMIME | SEC_INLINE);
                    sctx.msg.security.insert(
                        SEC_AUTOCRYPT | SEC_AUTOCRYPT_OVERRIDE | APPLICATION_PGP,
                    );
                }
            }
            ComposeOp::SignAs => {
                let current = sctx.sign_as.clone().unwrap_or_default();
                if let Some(key) = prompter.ask_string("Sign as", &current) {
                    sctx.sign_as = Some(key).filter(|k| !k.is_empty());
                    if sctx.sign_as.is_some() {
                        sctx.msg.security.set_manual_protection(SEC_SIGN);
                    }
                }
            }
            ComposeOp::ClearSecurity => {
                sctx.msg.security = Default::default();
            }
            ComposeOp::Send => return Ok(ComposeOutcome::Send),
            ComposeOp::Postpone => return Ok(ComposeOutcome::Postpone),
            ComposeOp::Abort => return Ok(ComposeOutcome::Abort),
            ComposeOp::Background => return Ok(ComposeOutcome::Background),
        }

        if recipients_changed {
            recommendation_state = compute_recommendation(sctx, autocrypt_db);
            apply_recommendation(sctx, recommendation_state);
            // The opportunistic decision is stale; it re-resolves in
            // the finalize stage with the new recipient set.
            if sctx.options.crypt_opportunistic_encrypt {
                sctx.msg.security.insert(SEC_OPPENC);
            }
        }
    }
}

fn compute_recommendation(
    sctx: &SendContext,
    db: Option<&dyn AutocryptDb>,
) -> AutocryptRec {
    let Some(db) = db else {
        return AutocryptRec::Off;
    };
    let from = sctx
        .msg
        .envelope
        .from
        .first()
        .and_then(|a| a.mailbox.clone())
        .unwrap_or_else(|| sctx.options.user.clone());
    recommendation(
        db,
        &from,
        &sctx.msg.envelope.recipients(),
        sctx.options.autocrypt,
    )
}

/// Fold the recommendation into the draft's security unless the user
/// already made a manual choice.
fn apply_recommendation(sctx: &mut SendContext, rec: AutocryptRec) {
    if sctx.msg.security.intersects(SEC_AUTOCRYPT_OVERRIDE) {
        return;
    }
    match rec {
        AutocryptRec::Yes => {
            sctx.msg
                .security
                .remove(APPLICATION_SMIME | SEC_INLINE);
            sctx.msg
                .security
                .insert(SEC_AUTOCRYPT | APPLICATION_PGP | SEC_ENCRYPT);
        }
        AutocryptRec::Available | AutocryptRec::Discouraged | AutocryptRec::No => {
            if sctx.msg.security.intersects(SEC_AUTOCRYPT) {
                sctx.msg.security.remove(SEC_AUTOCRYPT | SEC_ENCRYPT);
            }
        }
        AutocryptRec::Off => {}
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::modules::common::prompt::ScriptedPrompter;
    use crate::modules::settings::cli::Settings;
    use crate::modules::settings::scope::SessionOptions;

    fn sctx() -> SendContext {
        let mut options = SessionOptions::from_settings(&Settings::new_for_test());
        options.tmpdir = std::env::temp_dir();
        options.user = "me@example.com".to_string();
        let mut sctx = SendContext::new(0, options).unwrap();
        sctx.write_draft_text("hello\n").unwrap();
        sctx
    }

    fn gateway(sctx: &SendContext) -> CryptoGateway {
        CryptoGateway::from_options(&sctx.options).unwrap()
    }

    #[tokio::test]
    async fn edit_to_then_send() {
        let mut sctx = sctx();
        let gw = gateway(&sctx);
        let mut prompter =
            ScriptedPrompter::new().answer_string(Some("alice@example.com"));
        let mut ops = ScriptedOps::new([ComposeOp::EditTo, ComposeOp::Send]);
        let outcome = compose_loop(&mut sctx, &gw, &mut prompter, &mut ops, None)
            .await
            .unwrap();
        assert_eq!(outcome, ComposeOutcome::Send);
        assert_eq!(
            sctx.msg.envelope.to[0].mailbox.as_deref(),
            Some("alice@example.com")
        );
    }

    #[tokio::test]
    async fn manual_sign_clears_autocrypt() {
        let mut sctx = sctx();
        sctx.msg.security.insert(SEC_AUTOCRYPT | APPLICATION_PGP);
        let gw = gateway(&sctx);
        let mut prompter = ScriptedPrompter::new();
        let mut ops = ScriptedOps::new([ComposeOp::ToggleSign, ComposeOp::Postpone]);
        let outcome = compose_loop(&mut sctx, &gw, &mut prompter, &mut ops, None)
            .await
            .unwrap();
        assert_eq!(outcome, ComposeOutcome::Postpone);
        assert!(sctx.msg.security.sign());
        assert!(!sctx.msg.security.intersects(SEC_AUTOCRYPT));
    }

    #[tokio::test]
    async fn smime_selection_excludes_pgp_and_inline() {
        let mut sctx = sctx();
        sctx.msg.security.insert(APPLICATION_PGP | SEC_INLINE);
        let gw = gateway(&sctx);
        let mut prompter = ScriptedPrompter::new();
        let mut ops = ScriptedOps::new([ComposeOp::UseSmime, ComposeOp::Abort]);
        compose_loop(&mut sctx, &gw, &mut prompter, &mut ops, None)
            .await
            .unwrap();
        assert!(sctx.msg.security.is_smime());
        assert!(!sctx.msg.security.intersects(APPLICATION_PGP));
        assert!(!sctx.msg.security.intersects(SEC_INLINE));
    }

    #[tokio::test]
    async fn detaching_main_text_needs_confirmation() {
        let mut sctx = sctx();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("extra.txt");
        std::fs::write(&file, b"x").unwrap();
        let gw = gateway(&sctx);
        {
            let mut attachments = AttachCtx::new();
            attachments.rebuild(&sctx.msg);
            attachments.attach_file(&mut sctx.msg, &file).unwrap();
        }
        let mut prompter = ScriptedPrompter::new().answer_quad(PromptAnswer::No);
        let mut ops = ScriptedOps::new([ComposeOp::Detach(0), ComposeOp::Abort]);
        compose_loop(&mut sctx, &gw, &mut prompter, &mut ops, None)
            .await
            .unwrap();
        // Declined: the main text is still there.
        assert!(sctx.msg.main_text().is_some());
    }

    #[tokio::test]
    async fn background_op_suspends() {
        let mut sctx = sctx();
        let gw = gateway(&sctx);
        let mut prompter = ScriptedPrompter::new();
        let mut ops = ScriptedOps::new([ComposeOp::Background]);
        let outcome = compose_loop(&mut sctx, &gw, &mut prompter, &mut ops, None)
            .await
            .unwrap();
        assert_eq!(outcome, ComposeOutcome::Background);
    }
}
