// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::path::{Path, PathBuf};

use mail_parser::MessageParser;
use tracing::{debug, info};

use crate::modules::crypto::{
    CryptoGateway, Encryptor, SecurityFlags, APPLICATION_PGP, APPLICATION_SMIME, SEC_ENCRYPT,
};
use crate::modules::envelope::write::HeaderWriteOptions;
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailForgeResult;
use crate::modules::mailbox::{MailStore, MboxStore};
use crate::modules::message::DraftMessage;
use crate::modules::mime::body::MajorType;
use crate::modules::mime::parse::lower_message;
use crate::modules::send::SendContext;
use crate::modules::settings::scope::SessionOptions;
use crate::modules::utils::generate_message_id;
use crate::raise_error;

const FCC_HEADER: &str = "X-MailForge-Fcc";
const SECURITY_HEADER: &str = "X-MailForge-Security";

pub fn postponed_path(options: &SessionOptions) -> PathBuf {
    let configured = Path::new(&options.postponed);
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        options.folder.join(configured)
    }
}

/// Serialize an incomplete session to the postpone folder. Signing is
/// suppressed (a signature cannot survive the disk round trip), and an
/// encrypted draft is re-encrypted to the stable postpone key so it
/// stays readable on resume. The chosen security bits are preserved in
/// a recovery header.
pub async fn postpone_draft(
    sctx: &mut SendContext,
    gateway: &CryptoGateway,
) -> MailForgeResult<()> {
    let security = sctx.msg.security;

    if sctx.msg.envelope.message_id.is_none() {
        sctx.msg.envelope.message_id = Some(generate_message_id());
    }

    // The resume code needs an unambiguous tree shape: a bare
    // non-text root gets its multipart/mixed wrapper now.
    let root = sctx.msg.root()?;
    if sctx.msg.arena[root].major != MajorType::Multipart
        && sctx.msg.arena[root].first_child.is_some()
    {
        let wrapper = sctx.msg.arena.make_multipart_mixed(root);
        sctx.msg.root = Some(wrapper);
    }

    if sctx.options.postpone_encrypt && security.encrypt() {
        let key = postpone_key(sctx, security)?;
        let root = sctx.msg.root()?;
        crate::modules::mime::write::assign_boundaries(&mut sctx.msg.arena, root)?;
        let mut store_flags = SecurityFlags(SEC_ENCRYPT);
        store_flags.insert(if security.is_smime() {
            APPLICATION_SMIME
        } else {
            APPLICATION_PGP
        });
        let protected = gateway
            .protect(
                &mut sctx.msg.arena,
                root,
                store_flags,
                &[key],
                &sctx.options,
            )
            .await?;
        sctx.msg.root = Some(protected);
    }

    let extra_headers = vec![
        format!("{}: {}", FCC_HEADER, sctx.fcc),
        format!("{}: {}", SECURITY_HEADER, security.0),
    ];
    let wire = sctx.msg.render(&HeaderWriteOptions {
        write_bcc: true,
        extra_headers,
        ..Default::default()
    })?;

    let path = postponed_path(&sctx.options);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let store = MboxStore::new(path);
    store.append(&wire, &sctx.envelope_from()).map_err(|e| {
        raise_error!(
            format!("Cannot postpone draft: {}", e.oneline()),
            ErrorCode::PostponeWriteFailed
        )
    })?;
    info!("Draft postponed to {:?}", store.path());
    Ok(())
}

/// The key an encrypted postponed draft is readable by.
fn postpone_key(sctx: &SendContext, security: SecurityFlags) -> MailForgeResult<String> {
    let options = &sctx.options;
    options
        .postpone_encrypt_as
        .clone()
        .or_else(|| sctx.sign_as.clone())
        .or_else(|| {
            if security.is_smime() {
                options.smime_default_key.clone()
            } else {
                options.pgp_sign_as.clone()
            }
        })
        .ok_or_else(|| {
            raise_error!(
                "No key configured to encrypt postponed drafts to".into(),
                ErrorCode::CommandNotConfigured
            )
        })
}

/// How many drafts wait in the postpone folder.
pub fn postponed_count(options: &SessionOptions) -> usize {
    MboxStore::new(postponed_path(options))
        .count()
        .unwrap_or(0)
}

/// A postponed draft, reconstructed.
pub struct ResumedDraft {
    pub msg: DraftMessage,
    pub fcc: String,
    pub security: SecurityFlags,
}

/// Parse the first postponed message back into a draft: recover the
/// security bitmask and Fcc from the recovery headers, decrypt a
/// postpone-encrypted body, and strip the reconstruction wrapper. The
/// draft is removed from the folder.
pub async fn resume_first(
    gateway: &CryptoGateway,
    options: &SessionOptions,
) -> MailForgeResult<ResumedDraft> {
    let store = MboxStore::new(postponed_path(options));
    let raw = store
        .first()?
        .ok_or_else(|| {
            raise_error!(
                "No postponed messages".into(),
                ErrorCode::InvalidParameter
            )
        })?;

    let parsed = MessageParser::default().parse(&raw[..]).ok_or_else(|| {
        raise_error!(
            "Cannot parse postponed draft".into(),
            ErrorCode::MessageParseFailed
        )
    })?;
    let mut fcc = String::new();
    let mut security = SecurityFlags::default();
    for header in parsed.headers() {
        if header.name().eq_ignore_ascii_case(FCC_HEADER) {
            fcc = header
                .value()
                .as_text()
                .unwrap_or_default()
                .trim()
                .to_string();
        } else if header.name().eq_ignore_ascii_case(SECURITY_HEADER) {
            security = SecurityFlags(
                header
                    .value()
                    .as_text()
                    .and_then(|v| v.trim().parse::<u32>().ok())
                    .unwrap_or(0),
            );
        }
    }

    let mut msg = DraftMessage::from_raw(&raw, &options.tmpdir)?;
    let message_id = msg.envelope.message_id.clone();

    decrypt_if_needed(gateway, &mut msg, security, options).await?;

    // Strip the reconstruction wrapper: a mixed container with one
    // child collapses back to that child.
    if let Some(root) = msg.root {
        if msg.arena[root].major == MajorType::Multipart
            && msg.arena[root].subtype == "mixed"
            && msg.arena.children(root).len() == 1
        {
            let unwrapped = msg.arena.remove_multipart(root)?;
            msg.root = Some(unwrapped);
        }
    }

    // Signing was suppressed on disk; the recovered bits restore the
    // user's original choice.
    msg.security = security;
    // A new send attempt gets its own Date and Message-ID.
    msg.envelope.date = None;
    msg.envelope.message_id = Some(generate_message_id());

    if let Some(id) = &message_id {
        if store.remove_by_message_id(id)? {
            debug!("Removed postponed draft {}", id);
        }
    }
    Ok(ResumedDraft { msg, fcc, security })
}

/// Replace an encrypted resume body with its decrypted tree.
async fn decrypt_if_needed(
    gateway: &CryptoGateway,
    msg: &mut DraftMessage,
    security: SecurityFlags,
    options: &SessionOptions,
) -> MailForgeResult<()> {
    let Some(root) = msg.root else {
        return Ok(());
    };
    let node = &msg.arena[root];
    let pgp_encrypted =
        node.major == MajorType::Multipart && node.subtype == "encrypted";
    let smime_encrypted = node.major == MajorType::Application
        && node.subtype == "pkcs7-mime";
    if !pgp_encrypted && !smime_encrypted {
        return Ok(());
    }

    let key = options
        .postpone_encrypt_as
        .clone()
        .or_else(|| {
            if security.is_smime() {
                options.smime_default_key.clone()
            } else {
                options.pgp_sign_as.clone()
            }
        });

    let ciphertext_node = if pgp_encrypted {
        *msg.arena.children(root).get(1).ok_or_else(|| {
            raise_error!(
                "multipart/encrypted draft without a data part".into(),
                ErrorCode::BodyTreeCorrupt
            )
        })?
    } else {
        root
    };
    let path = msg.arena[ciphertext_node]
        .content
        .file_path()
        .ok_or_else(|| {
            raise_error!(
                "Encrypted draft part has no backing file".into(),
                ErrorCode::BodyTreeCorrupt
            )
        })?
        .to_path_buf();

    let plaintext = if smime_encrypted {
        gateway.smime.decrypt(&path, key.as_deref()).await?
    } else {
        gateway.pgp.decrypt(&path, key.as_deref()).await?
    };

    // The plaintext is a full MIME entity; lower it as the new tree.
    let inner = MessageParser::default()
        .parse(&plaintext[..])
        .ok_or_else(|| {
            raise_error!(
                "Decrypted draft does not parse".into(),
                ErrorCode::MessageParseFailed
            )
        })?;
    let new_root = lower_message(&mut msg.arena, &inner, &options.tmpdir)?;
    msg.arena.free(root);
    msg.root = Some(new_root);
    Ok(())
}
