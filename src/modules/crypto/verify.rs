// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::fs;
use std::path::Path;

use tracing::warn;

use crate::modules::crypto::{
    run_crypto_command, CryptoGateway, SecurityFlags, SEC_BADSIGN, SEC_GOODSIGN, SEC_PARTSIGN,
};
use crate::modules::envelope::write::LineEnding;
use crate::modules::envelope::Envelope;
use crate::modules::error::MailForgeResult;
use crate::modules::format::FormatContext;
use crate::modules::mime::body::{BodyArena, BodyId, MajorType};
use crate::modules::mime::write::write_part;
use crate::modules::utils::temp_message_file;

/// Check the canonical multipart/signed layout: exactly two children,
/// the second being the detached signature in the declared protocol.
/// Returns the (content, signature) pair when the shape holds.
fn signed_layout(arena: &BodyArena, id: BodyId) -> Option<(BodyId, BodyId)> {
    let node = &arena[id];
    if node.major != MajorType::Multipart || node.subtype != "signed" {
        return None;
    }
    let protocol = node.params.get("protocol")?.to_ascii_lowercase();
    let children = arena.children(id);
    let [content, signature] = children.as_slice() else {
        return None;
    };
    let sig_type = arena[*signature].type_string();
    if sig_type != protocol {
        return None;
    }
    Some((*content, *signature))
}

/// Verify a multipart/signed subtree, returning the verification bits
/// to merge into the message's security state. A structurally bad
/// part is reported and displayed unverified rather than rejected.
pub async fn verify_signed(
    gateway: &CryptoGateway,
    arena: &BodyArena,
    id: BodyId,
    tmpdir: &Path,
) -> MailForgeResult<SecurityFlags> {
    let mut flags = SecurityFlags::default();
    let Some((content, signature)) = signed_layout(arena, id) else {
        warn!("bad-format multipart/signed; displaying unverified");
        return Ok(flags);
    };

    let canonical = write_part(arena, content, LineEnding::CrLf)?;
    let content_path = temp_message_file(tmpdir)?;
    fs::write(&content_path, &canonical)?;
    let sig_bytes = arena.resolve_content(signature, None)?;
    let sig_path = temp_message_file(tmpdir)?;
    fs::write(&sig_path, &sig_bytes)?;

    let smime = arena[signature].subtype.contains("pkcs7");
    let mut ctx = FormatContext::new();
    ctx.set('f', content_path.to_string_lossy());
    ctx.set('s', sig_path.to_string_lossy());
    let command = if smime {
        if let Some(ca) = &gateway.smime.ca_location {
            ctx.set('C', ca.to_string_lossy());
        }
        gateway.smime.verify_command.render_command(&ctx)
    } else {
        gateway.pgp.verify_command.render_command(&ctx)
    };

    let result = run_crypto_command(&command, None).await;
    let _ = fs::remove_file(&content_path);
    let _ = fs::remove_file(&sig_path);
    match result {
        Ok(_) => flags.insert(SEC_GOODSIGN),
        Err(e) => {
            warn!("Signature verification failed: {}", e.oneline());
            flags.insert(SEC_BADSIGN);
        }
    }
    Ok(flags)
}

/// Partial-signature detection for an aggregate: some children signed,
/// some not.
pub fn aggregate_signature_state(
    arena: &BodyArena,
    id: BodyId,
    child_flags: &[SecurityFlags],
) -> SecurityFlags {
    let mut flags = SecurityFlags::default();
    if arena[id].major != MajorType::Multipart {
        return flags;
    }
    let signed = child_flags
        .iter()
        .filter(|f| f.intersects(SEC_GOODSIGN | SEC_BADSIGN))
        .count();
    if signed > 0 && signed < child_flags.len() {
        flags.insert(SEC_PARTSIGN);
    } else {
        for child in child_flags {
            flags.insert(child.0 & (SEC_GOODSIGN | SEC_BADSIGN));
        }
    }
    flags
}

/// Surface the protected-header snapshot carried inside a verified
/// part. For multipart/signed the signed inner part's headers win over
/// whatever an encrypted outer layer claimed, closing the spoofing
/// hole where only the outer envelope is attacker-reachable.
pub fn surface_protected_headers(
    arena: &BodyArena,
    root: BodyId,
) -> Option<Envelope> {
    if let Some((content, _)) = signed_layout(arena, root) {
        if let Some(inner) = &arena[content].protected_headers {
            return Some(inner.as_ref().clone());
        }
    }
    for id in arena.subtree(root) {
        if let Some(snapshot) = &arena[id].protected_headers {
            return Some(snapshot.as_ref().clone());
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::modules::mime::body::ContentSource;

    fn leaf(arena: &mut BodyArena, dir: &Path, data: &[u8]) -> BodyId {
        let path = temp_message_file(dir).unwrap();
        fs::write(&path, data).unwrap();
        let id = arena.new_body();
        arena[id].content = ContentSource::owned_file(path);
        id
    }

    fn signed_tree(arena: &mut BodyArena, dir: &Path, protocol: &str, sig_subtype: &str) -> BodyId {
        let content = leaf(arena, dir, b"signed content\n");
        let sig = leaf(arena, dir, b"fake signature\n");
        arena[sig].major = MajorType::Application;
        arena[sig].subtype = sig_subtype.to_string();
        arena[content].next = Some(sig);
        let wrapper = arena.make_multipart_mixed(content);
        arena[wrapper].subtype = "signed".to_string();
        arena[wrapper].params.set("protocol", protocol);
        wrapper
    }

    #[test]
    fn canonical_layout_is_recognized() {
        let dir = tempfile::tempdir().unwrap();
        let mut arena = BodyArena::new();
        let ok = signed_tree(
            &mut arena,
            dir.path(),
            "application/pgp-signature",
            "pgp-signature",
        );
        assert!(signed_layout(&arena, ok).is_some());
    }

    #[test]
    fn protocol_mismatch_is_bad_format() {
        let dir = tempfile::tempdir().unwrap();
        let mut arena = BodyArena::new();
        let bad = signed_tree(
            &mut arena,
            dir.path(),
            "application/pgp-signature",
            "pkcs7-signature",
        );
        assert!(signed_layout(&arena, bad).is_none());
    }

    #[test]
    fn partial_signing_reported_for_mixed_aggregates() {
        let dir = tempfile::tempdir().unwrap();
        let mut arena = BodyArena::new();
        let a = leaf(&mut arena, dir.path(), b"a");
        let b = leaf(&mut arena, dir.path(), b"b");
        arena[a].next = Some(b);
        let parent = arena.make_multipart_mixed(a);

        let flags = aggregate_signature_state(
            &arena,
            parent,
            &[SecurityFlags(SEC_GOODSIGN), SecurityFlags::default()],
        );
        assert!(flags.intersects(SEC_PARTSIGN));

        let uniform = aggregate_signature_state(
            &arena,
            parent,
            &[SecurityFlags(SEC_GOODSIGN), SecurityFlags(SEC_GOODSIGN)],
        );
        assert!(uniform.intersects(SEC_GOODSIGN));
        assert!(!uniform.intersects(SEC_PARTSIGN));
    }

    #[test]
    fn signed_inner_headers_override_outer_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut arena = BodyArena::new();
        let wrapper = signed_tree(
            &mut arena,
            dir.path(),
            "application/pgp-signature",
            "pgp-signature",
        );
        let content = arena.children(wrapper)[0];

        let mut spoofed = Envelope::new();
        spoofed.subject = Some("spoofed".into());
        arena[wrapper].protected_headers = Some(Box::new(spoofed));

        let mut genuine = Envelope::new();
        genuine.subject = Some("genuine".into());
        arena[content].protected_headers = Some(Box::new(genuine));

        let surfaced = surface_protected_headers(&arena, wrapper).unwrap();
        assert_eq!(surfaced.subject.as_deref(), Some("genuine"));
    }
}
