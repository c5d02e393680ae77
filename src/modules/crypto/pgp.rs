// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::fs;
use std::path::Path;

use itertools::Itertools;

use crate::modules::address::Address;
use crate::modules::crypto::{run_crypto_command, Encryptor, KeyResolver, Signer};
use crate::modules::envelope::write::LineEnding;
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailForgeResult;
use crate::modules::format::{FormatContext, Template};
use crate::modules::mime::body::{
    BodyArena, BodyId, ContentSource, Disposition, MajorType, TransferEncoding,
};
use crate::modules::mime::write::write_part;
use crate::modules::settings::cli::SETTINGS;
use crate::modules::utils::{shell_quote, temp_message_file};
use crate::raise_error;

/// The PGP backend: every operation shells out through the configured
/// command templates.
pub struct PgpBackend {
    pub sign_command: Template,
    pub clearsign_command: Template,
    pub encrypt_only_command: Template,
    pub encrypt_sign_command: Template,
    pub decrypt_command: Template,
    pub verify_command: Template,
    pub list_keys_command: Template,
    pub export_command: Template,
    pub import_command: Template,
}

impl PgpBackend {
    pub fn from_settings() -> MailForgeResult<Self> {
        Ok(PgpBackend {
            sign_command: Template::parse(&SETTINGS.mailforge_pgp_sign_command)?,
            clearsign_command: Template::parse(&SETTINGS.mailforge_pgp_clearsign_command)?,
            encrypt_only_command: Template::parse(&SETTINGS.mailforge_pgp_encrypt_only_command)?,
            encrypt_sign_command: Template::parse(&SETTINGS.mailforge_pgp_encrypt_sign_command)?,
            decrypt_command: Template::parse(&SETTINGS.mailforge_pgp_decrypt_command)?,
            verify_command: Template::parse(&SETTINGS.mailforge_pgp_verify_command)?,
            list_keys_command: Template::parse(&SETTINGS.mailforge_pgp_list_keys_command)?,
            export_command: Template::parse(&SETTINGS.mailforge_pgp_export_command)?,
            import_command: Template::parse(&SETTINGS.mailforge_pgp_import_command)?,
        })
    }

    /// Import key material (an application/pgp-keys attachment, an
    /// Autocrypt keydata blob written to disk) into the local ring.
    pub async fn import_key(&self, file: &Path) -> MailForgeResult<String> {
        let mut ctx = FormatContext::new();
        ctx.set('f', file.to_string_lossy());
        let command = self.import_command.render_command(&ctx);
        let output = run_crypto_command(&command, None).await?;
        Ok(output.stderr)
    }

    fn recipient_clause(keylist: &[String]) -> String {
        keylist
            .iter()
            .map(|key| format!("-r {}", shell_quote(key)))
            .join(" ")
    }

    /// Wrap `root` in RFC 3156 multipart/signed with a detached
    /// armored signature over its canonical CRLF form.
    pub async fn sign_body(
        &self,
        arena: &mut BodyArena,
        root: BodyId,
        sign_as: Option<&str>,
        tmpdir: &Path,
    ) -> MailForgeResult<BodyId> {
        let canonical = write_part(arena, root, LineEnding::CrLf)?;
        let content_path = temp_message_file(tmpdir)?;
        fs::write(&content_path, &canonical)?;

        let signature = self.sign_detached(&content_path, sign_as).await;
        let _ = fs::remove_file(&content_path);
        let signature = signature?;

        let sig_path = temp_message_file(tmpdir)?;
        fs::write(&sig_path, &signature)?;

        let sig = arena.new_body();
        {
            let node = &mut arena[sig];
            node.major = MajorType::Application;
            node.subtype = "pgp-signature".to_string();
            node.params.set("name", "signature.asc");
            node.use_disp = false;
            node.content = ContentSource::owned_file(sig_path);
        }
        arena[root].next = Some(sig);

        let wrapper = arena.make_multipart_mixed(root);
        {
            let node = &mut arena[wrapper];
            node.subtype = "signed".to_string();
            node.params.set("protocol", self.signature_protocol());
            node.params.set("micalg", &self.micalg());
            node.encoding = TransferEncoding::SevenBit;
        }
        crate::modules::mime::write::assign_boundaries(arena, wrapper)?;
        Ok(wrapper)
    }

    /// Wrap `root` in RFC 3156 multipart/encrypted. The plaintext
    /// subtree is left untouched and unreferenced by the wrapper so
    /// the caller can restore it if the send fails later.
    pub async fn encrypt_body(
        &self,
        arena: &mut BodyArena,
        root: BodyId,
        keylist: &[String],
        sign_as: Option<&str>,
        also_sign: bool,
        tmpdir: &Path,
    ) -> MailForgeResult<BodyId> {
        let canonical = write_part(arena, root, LineEnding::CrLf)?;
        let content_path = temp_message_file(tmpdir)?;
        fs::write(&content_path, &canonical)?;

        let ciphertext = self
            .encrypt(&content_path, keylist, sign_as, also_sign)
            .await;
        let _ = fs::remove_file(&content_path);
        let ciphertext = ciphertext?;

        let version_path = temp_message_file(tmpdir)?;
        fs::write(&version_path, b"Version: 1\n")?;
        let data_path = temp_message_file(tmpdir)?;
        fs::write(&data_path, &ciphertext)?;

        let version = arena.new_body();
        {
            let node = &mut arena[version];
            node.major = MajorType::Application;
            node.subtype = "pgp-encrypted".to_string();
            node.use_disp = false;
            node.content = ContentSource::owned_file(version_path);
        }
        let data = arena.new_body();
        {
            let node = &mut arena[data];
            node.major = MajorType::Application;
            node.subtype = "octet-stream".to_string();
            node.use_disp = true;
            node.disposition = Disposition::Inline;
            node.content = ContentSource::owned_file(data_path);
        }
        arena[version].next = Some(data);

        let wrapper = arena.make_multipart_mixed(version);
        {
            let node = &mut arena[wrapper];
            node.subtype = "encrypted".to_string();
            node.params.set("protocol", "application/pgp-encrypted");
            node.encoding = TransferEncoding::SevenBit;
        }
        crate::modules::mime::write::assign_boundaries(arena, wrapper)?;
        Ok(wrapper)
    }

    /// Traditional inline armor: the part's own content is replaced by
    /// clearsigned or armored-encrypted text; the tree shape does not
    /// change.
    pub async fn traditional(
        &self,
        arena: &mut BodyArena,
        root: BodyId,
        keylist: &[String],
        sign_as: Option<&str>,
        sign: bool,
        encrypt: bool,
        tmpdir: &Path,
    ) -> MailForgeResult<()> {
        if arena[root].major != MajorType::Text {
            return Err(raise_error!(
                "Inline PGP only applies to text parts".into(),
                ErrorCode::InvalidParameter
            ));
        }
        let input = arena.resolve_content(root, None)?;
        let input_path = temp_message_file(tmpdir)?;
        fs::write(&input_path, &input)?;
        let out_path = temp_message_file(tmpdir)?;

        let mut ctx = FormatContext::new();
        ctx.set('f', input_path.to_string_lossy());
        ctx.set('s', out_path.to_string_lossy());
        if let Some(key) = sign_as {
            ctx.set('k', key);
        }
        ctx.set_raw('c', Self::recipient_clause(keylist));

        let template = if encrypt {
            if sign {
                &self.encrypt_sign_command
            } else {
                &self.encrypt_only_command
            }
        } else {
            &self.clearsign_command
        };
        let command = template.render_command(&ctx);
        let result = run_crypto_command(&command, None).await;
        let _ = fs::remove_file(&input_path);
        result?;

        let old = std::mem::replace(
            &mut arena[root].content,
            ContentSource::owned_file(out_path),
        );
        if let ContentSource::File { path, unlink: true } = old {
            let _ = fs::remove_file(path);
        }
        arena[root].restamp();
        Ok(())
    }

    /// A public-key block as an attachable body part.
    pub async fn key_attachment(
        &self,
        arena: &mut BodyArena,
        key_id: &str,
        tmpdir: &Path,
    ) -> MailForgeResult<BodyId> {
        let mut ctx = FormatContext::new();
        ctx.set('k', key_id);
        let command = self.export_command.render_command(&ctx);
        let output = run_crypto_command(&command, None).await?;
        if output.stdout.is_empty() {
            return Err(raise_error!(
                format!("No key material exported for {}", key_id),
                ErrorCode::RecipientKeyMissing
            ));
        }
        let path = temp_message_file(tmpdir)?;
        fs::write(&path, &output.stdout)?;
        let id = arena.new_body();
        {
            let node = &mut arena[id];
            node.major = MajorType::Application;
            node.subtype = "pgp-keys".to_string();
            node.use_disp = true;
            node.disposition = Disposition::Attachment;
            node.d_filename = Some(format!("{}.asc", key_id.trim_start_matches("0x")));
            node.content = ContentSource::owned_file(path);
            node.restamp();
        }
        Ok(id)
    }
}

impl Signer for PgpBackend {
    async fn sign_detached(
        &self,
        content: &Path,
        sign_as: Option<&str>,
    ) -> MailForgeResult<Vec<u8>> {
        let sig_path = content.with_extension("asc");
        let mut ctx = FormatContext::new();
        ctx.set('f', content.to_string_lossy());
        ctx.set('s', sig_path.to_string_lossy());
        if let Some(key) = sign_as {
            ctx.set('k', key);
        }
        let command = self.sign_command.render_command(&ctx);
        run_crypto_command(&command, None).await?;
        let signature = fs::read(&sig_path).map_err(|e| {
            raise_error!(
                format!("Signature output {:?} missing: {}", sig_path, e),
                ErrorCode::CryptoCommandFailed
            )
        })?;
        let _ = fs::remove_file(&sig_path);
        Ok(signature)
    }

    fn micalg(&self) -> String {
        "pgp-sha256".to_string()
    }

    fn signature_protocol(&self) -> &'static str {
        "application/pgp-signature"
    }
}

impl Encryptor for PgpBackend {
    async fn encrypt(
        &self,
        content: &Path,
        keylist: &[String],
        sign_as: Option<&str>,
        also_sign: bool,
    ) -> MailForgeResult<Vec<u8>> {
        let out_path = content.with_extension("pgp");
        let mut ctx = FormatContext::new();
        ctx.set('f', content.to_string_lossy());
        ctx.set('s', out_path.to_string_lossy());
        ctx.set_raw('c', Self::recipient_clause(keylist));
        if let Some(key) = sign_as {
            ctx.set('k', key);
        }
        let template = if also_sign {
            &self.encrypt_sign_command
        } else {
            &self.encrypt_only_command
        };
        let command = template.render_command(&ctx);
        run_crypto_command(&command, None).await?;
        let ciphertext = fs::read(&out_path).map_err(|e| {
            raise_error!(
                format!("Encrypted output {:?} missing: {}", out_path, e),
                ErrorCode::CryptoCommandFailed
            )
        })?;
        let _ = fs::remove_file(&out_path);
        Ok(ciphertext)
    }

    async fn decrypt(&self, content: &Path, key: Option<&str>) -> MailForgeResult<Vec<u8>> {
        let out_path = content.with_extension("clear");
        let mut ctx = FormatContext::new();
        ctx.set('f', content.to_string_lossy());
        ctx.set('s', out_path.to_string_lossy());
        if let Some(key) = key {
            ctx.set('k', key);
        }
        let command = self.decrypt_command.render_command(&ctx);
        run_crypto_command(&command, None).await?;
        let plaintext = fs::read(&out_path).map_err(|e| {
            raise_error!(
                format!("Decrypted output {:?} missing: {}", out_path, e),
                ErrorCode::CryptoCommandFailed
            )
        })?;
        let _ = fs::remove_file(&out_path);
        Ok(plaintext)
    }
}

impl KeyResolver for PgpBackend {
    async fn find_keys(
        &self,
        recipients: &[Address],
        oppenc: bool,
    ) -> MailForgeResult<Vec<String>> {
        let mut keys = Vec::new();
        for addr in recipients {
            let Some(mailbox) = addr.mailbox.as_deref() else {
                continue;
            };
            if addr.group {
                continue;
            }
            let key = self.find_one(mailbox, oppenc).await?;
            keys.push(key);
        }
        Ok(keys)
    }
}

impl PgpBackend {
    async fn find_one(&self, mailbox: &str, oppenc: bool) -> MailForgeResult<String> {
        let mut ctx = FormatContext::new();
        ctx.set('c', mailbox);
        let command = self.list_keys_command.render_command(&ctx);
        let output = match run_crypto_command(&command, None).await {
            Ok(output) => output,
            Err(_) if oppenc => {
                return Err(raise_error!(
                    format!("No key found for {}", mailbox),
                    ErrorCode::RecipientKeyMissing
                ))
            }
            Err(e) => return Err(e),
        };
        let candidates = parse_colon_listing(&String::from_utf8_lossy(&output.stdout));
        select_candidate(candidates, mailbox, oppenc)
    }
}

#[derive(Clone, Debug)]
struct KeyCandidate {
    key_id: String,
    validity: char,
    uids: Vec<String>,
}

impl KeyCandidate {
    fn trusted(&self) -> bool {
        matches!(self.validity, 'f' | 'u')
    }

    fn usable(&self) -> bool {
        !matches!(self.validity, 'e' | 'r' | 'd' | 'i' | 'n')
    }
}

/// Minimal reader for `--with-colons` output: `pub` records open a
/// candidate, `uid` records attach user ids to the last one.
fn parse_colon_listing(listing: &str) -> Vec<KeyCandidate> {
    let mut out: Vec<KeyCandidate> = Vec::new();
    for line in listing.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        match fields.first().copied() {
            Some("pub") if fields.len() > 4 => {
                out.push(KeyCandidate {
                    key_id: fields[4].to_string(),
                    validity: fields[1].chars().next().unwrap_or('-'),
                    uids: Vec::new(),
                });
            }
            Some("uid") if fields.len() > 9 => {
                if let Some(last) = out.last_mut() {
                    last.uids.push(fields[9].to_string());
                }
            }
            _ => {}
        }
    }
    out
}

fn select_candidate(
    candidates: Vec<KeyCandidate>,
    mailbox: &str,
    oppenc: bool,
) -> MailForgeResult<String> {
    let matching: Vec<KeyCandidate> = candidates
        .into_iter()
        .filter(|c| {
            c.usable()
                && (c.uids.is_empty()
                    || c.uids
                        .iter()
                        .any(|uid| uid.to_ascii_lowercase().contains(&mailbox.to_ascii_lowercase())))
        })
        .collect();
    if matching.is_empty() {
        return Err(raise_error!(
            format!("No key found for {}", mailbox),
            ErrorCode::RecipientKeyMissing
        ));
    }
    if oppenc {
        // Opportunistic mode picks a single trusted match silently and
        // otherwise declines.
        let trusted: Vec<&KeyCandidate> = matching.iter().filter(|c| c.trusted()).collect();
        match trusted.as_slice() {
            [only] => Ok(only.key_id.clone()),
            [] if matching.len() == 1 => Ok(matching[0].key_id.clone()),
            _ => Err(raise_error!(
                format!("No unambiguous key for {}", mailbox),
                ErrorCode::RecipientKeyMissing
            )),
        }
    } else {
        match matching.iter().find(|c| c.trusted()) {
            Some(candidate) => Ok(candidate.key_id.clone()),
            None => Ok(matching[0].key_id.clone()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const LISTING: &str = "\
tru::1:1700000000:0:3:1:5
pub:f:4096:1:AAAA1111BBBB2222:1600000000:::-:::scESC::::::23::0:
uid:f::::1600000000::HASH::Jane Doe <jane@example.com>::::::::::0:
pub:e:2048:1:CCCC3333DDDD4444:1400000000:::-:::sc::::::23::0:
uid:e::::1400000000::HASH::Jane Doe <jane@example.com>::::::::::0:
pub:u:255:22:EEEE5555FFFF6666:1650000000:::-:::scESC::::::23::0:
uid:u::::1650000000::HASH::Bob <bob@example.org>::::::::::0:
";

    #[test]
    fn colon_listing_parses_candidates() {
        let candidates = parse_colon_listing(LISTING);
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0].key_id, "AAAA1111BBBB2222");
        assert!(candidates[0].trusted());
        assert!(!candidates[1].usable());
    }

    #[test]
    fn expired_keys_are_never_selected() {
        let candidates = parse_colon_listing(LISTING);
        let key = select_candidate(candidates, "jane@example.com", false).unwrap();
        assert_eq!(key, "AAAA1111BBBB2222");
    }

    #[test]
    fn oppenc_declines_when_no_match() {
        let candidates = parse_colon_listing(LISTING);
        let err = select_candidate(candidates, "stranger@example.net", true).unwrap_err();
        assert_eq!(err.code(), ErrorCode::RecipientKeyMissing);
    }

    #[test]
    fn recipient_clause_quotes_each_key() {
        let clause =
            PgpBackend::recipient_clause(&["KEY1".to_string(), "it's".to_string()]);
        assert_eq!(clause, "-r 'KEY1' -r 'it'\\''s'");
    }
}
