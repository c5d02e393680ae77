// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::fs;
use std::path::{Path, PathBuf};

use itertools::Itertools;
use tracing::debug;

use crate::modules::address::Address;
use crate::modules::common::prompt::{PromptAnswer, Prompter};
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
use crate::modules::settings::quad::QuadOption;
use crate::modules::settings::scope::SessionOptions;
use crate::modules::utils::{shell_quote, temp_message_file};
use crate::raise_error;

/// One line of the certificate index: mailbox, certificate hash, a
/// human label, a trust character, and the abilities the key grants.
#[derive(Clone, Debug)]
pub struct SmimeKey {
    pub address: String,
    pub hash: String,
    pub label: String,
    pub trust: char,
    pub abilities: String,
}

impl SmimeKey {
    pub fn trusted(&self) -> bool {
        self.trust == 't'
    }

    /// Expired, revoked, and invalid entries are never offered.
    pub fn valid(&self) -> bool {
        matches!(self.trust, 't' | 'v' | 'u')
    }

    pub fn can_encrypt(&self) -> bool {
        self.abilities.contains('e')
    }

    pub fn can_sign(&self) -> bool {
        self.abilities.contains('s')
    }
}

pub struct SmimeBackend {
    pub sign_command: Template,
    pub encrypt_command: Template,
    pub decrypt_command: Template,
    pub verify_command: Template,
    pub certificates_dir: PathBuf,
    pub ca_location: Option<PathBuf>,
    pub digest: String,
    pub cipher: String,
    index: Vec<SmimeKey>,
}

impl SmimeBackend {
    pub fn from_settings(options: &SessionOptions) -> MailForgeResult<Self> {
        let certificates_dir = SETTINGS.mailforge_smime_certificates.clone();
        let index = load_index(&certificates_dir.join(".index"));
        Ok(SmimeBackend {
            sign_command: Template::parse(&SETTINGS.mailforge_smime_sign_command)?,
            encrypt_command: Template::parse(&SETTINGS.mailforge_smime_encrypt_command)?,
            decrypt_command: Template::parse(&SETTINGS.mailforge_smime_decrypt_command)?,
            verify_command: Template::parse(&SETTINGS.mailforge_smime_verify_command)?,
            certificates_dir,
            ca_location: SETTINGS.mailforge_smime_ca_location.clone(),
            digest: options.smime_sign_digest_alg.clone(),
            cipher: options.smime_encrypt_with.clone(),
            index,
        })
    }

    #[cfg(test)]
    pub fn set_index(&mut self, index: Vec<SmimeKey>) {
        self.index = index;
    }

    fn certificate_path(&self, hash: &str) -> PathBuf {
        self.certificates_dir.join(hash)
    }

    fn key_path(&self, hash: &str) -> PathBuf {
        self.certificates_dir.join(format!("{}.key", hash))
    }

    /// Candidates matching an address substring, a certificate hash,
    /// or a label, filtered by the requested ability.
    pub fn candidates(&self, query: &str, need_encrypt: bool) -> Vec<&SmimeKey> {
        let query_lower = query.to_ascii_lowercase();
        self.index
            .iter()
            .filter(|key| {
                key.address.to_ascii_lowercase().contains(&query_lower)
                    || key.hash == query
                    || key.label.to_ascii_lowercase().contains(&query_lower)
            })
            .filter(|key| {
                if need_encrypt {
                    key.can_encrypt()
                } else {
                    key.can_sign()
                }
            })
            .collect()
    }

    /// The silent selection policy: opportunistic mode needs a single
    /// trusted match (or a single valid one as fallback); anything
    /// ambiguous declines so the caller can drop to plaintext.
    fn select_silently(&self, mailbox: &str, oppenc: bool) -> MailForgeResult<String> {
        let valid: Vec<&SmimeKey> = self
            .candidates(mailbox, true)
            .into_iter()
            .filter(|k| k.valid())
            .collect();
        if valid.is_empty() {
            return Err(raise_error!(
                format!("No S/MIME certificate for {}", mailbox),
                ErrorCode::RecipientKeyMissing
            ));
        }
        let trusted: Vec<&SmimeKey> = valid
            .iter()
            .copied()
            .filter(|k| k.trusted())
            .collect();
        match (trusted.as_slice(), valid.as_slice()) {
            ([only], _) => Ok(only.hash.clone()),
            ([], [only]) => Ok(only.hash.clone()),
            _ if oppenc => Err(raise_error!(
                format!("No unambiguous S/MIME certificate for {}", mailbox),
                ErrorCode::RecipientKeyMissing
            )),
            _ => Ok(valid[0].hash.clone()),
        }
    }

    /// Interactive selection: a menu over the candidates, with an
    /// explicit confirmation before using a certificate that is not
    /// trusted.
    pub fn select_with_prompter(
        &self,
        mailbox: &str,
        prompter: &mut dyn Prompter,
    ) -> MailForgeResult<String> {
        let valid: Vec<&SmimeKey> = self
            .candidates(mailbox, true)
            .into_iter()
            .filter(|k| k.valid())
            .collect();
        if valid.is_empty() {
            return Err(raise_error!(
                format!("No S/MIME certificate for {}", mailbox),
                ErrorCode::RecipientKeyMissing
            ));
        }
        let labels: Vec<String> = valid
            .iter()
            .map(|k| format!("{}  {}  [{}]", k.hash, k.label, k.trust))
            .collect();
        let label_refs: Vec<&str> = labels.iter().map(|s| s.as_str()).collect();
        let picked = prompter
            .ask_choice(&format!("S/MIME certificates matching {}", mailbox), &label_refs)
            .ok_or_else(|| {
                raise_error!(
                    format!("Certificate selection for {} cancelled", mailbox),
                    ErrorCode::KeySelectionDeclined
                )
            })?;
        let key = valid.get(picked).ok_or_else(|| {
            raise_error!(
                "Certificate menu returned an invalid entry".into(),
                ErrorCode::InternalError
            )
        })?;
        if !key.trusted() {
            let confirmed = prompter.ask_quad(
                &format!("Certificate {} is not trusted. Use it anyway?", key.hash),
                QuadOption::AskNo,
            );
            if confirmed != PromptAnswer::Yes {
                return Err(raise_error!(
                    format!("Untrusted certificate for {} declined", mailbox),
                    ErrorCode::KeyNotTrusted
                ));
            }
        }
        Ok(key.hash.clone())
    }

    pub fn find_keys_with_prompter(
        &self,
        recipients: &[Address],
        oppenc: bool,
        mut prompter: Option<&mut dyn Prompter>,
    ) -> MailForgeResult<Vec<String>> {
        let mut keys = Vec::new();
        for addr in recipients {
            let Some(mailbox) = addr.mailbox.as_deref() else {
                continue;
            };
            if addr.group {
                continue;
            }
            let hash = match self.select_silently(mailbox, oppenc) {
                Ok(hash) => hash,
                Err(e) => match (&mut prompter, oppenc) {
                    (Some(prompter), false) => self.select_with_prompter(mailbox, *prompter)?,
                    _ => return Err(e),
                },
            };
            keys.push(hash);
        }
        Ok(keys)
    }

    /// Wrap `root` in multipart/signed with a DER pkcs7 detached
    /// signature.
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
            node.subtype = "pkcs7-signature".to_string();
            node.params.set("name", "smime.p7s");
            node.encoding = TransferEncoding::Base64;
            node.disposition = Disposition::Attachment;
            node.d_filename = Some("smime.p7s".to_string());
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

    /// Replace the visible tree with an application/pkcs7-mime
    /// enveloped-data part encrypted to the recipient certificates.
    pub async fn encrypt_body(
        &self,
        arena: &mut BodyArena,
        root: BodyId,
        keylist: &[String],
        tmpdir: &Path,
    ) -> MailForgeResult<BodyId> {
        let canonical = write_part(arena, root, LineEnding::CrLf)?;
        let content_path = temp_message_file(tmpdir)?;
        fs::write(&content_path, &canonical)?;

        let ciphertext = self.encrypt(&content_path, keylist, None, false).await;
        let _ = fs::remove_file(&content_path);
        let ciphertext = ciphertext?;

        let data_path = temp_message_file(tmpdir)?;
        fs::write(&data_path, &ciphertext)?;

        let envelope = arena.new_body();
        {
            let node = &mut arena[envelope];
            node.major = MajorType::Application;
            node.subtype = "pkcs7-mime".to_string();
            node.params.set("name", "smime.p7m");
            node.params.set("smime-type", "enveloped-data");
            node.encoding = TransferEncoding::Base64;
            node.disposition = Disposition::Attachment;
            node.d_filename = Some("smime.p7m".to_string());
            node.content = ContentSource::owned_file(data_path);
        }
        Ok(envelope)
    }
}

fn load_index(path: &Path) -> Vec<SmimeKey> {
    let Ok(data) = fs::read_to_string(path) else {
        debug!("No S/MIME index at {:?}", path);
        return Vec::new();
    };
    parse_index(&data)
}

pub fn parse_index(data: &str) -> Vec<SmimeKey> {
    data.lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [address, hash, label, trust, abilities, ..] => Some(SmimeKey {
                    address: address.to_string(),
                    hash: hash.to_string(),
                    label: label.to_string(),
                    trust: trust.chars().next().unwrap_or('u'),
                    abilities: abilities.to_string(),
                }),
                _ => None,
            }
        })
        .collect()
}

impl Signer for SmimeBackend {
    async fn sign_detached(
        &self,
        content: &Path,
        sign_as: Option<&str>,
    ) -> MailForgeResult<Vec<u8>> {
        let key = sign_as.ok_or_else(|| {
            raise_error!(
                "No S/MIME signing key configured".into(),
                ErrorCode::CommandNotConfigured
            )
        })?;
        let key_file = self.key_path(key);
        let key_value = if key_file.exists() {
            key_file.to_string_lossy().into_owned()
        } else {
            key.to_string()
        };
        let sig_path = content.with_extension("p7s");
        let mut ctx = FormatContext::new();
        ctx.set('f', content.to_string_lossy());
        ctx.set('s', sig_path.to_string_lossy());
        ctx.set('k', key_value);
        ctx.set('d', &self.digest);
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
        self.digest.clone()
    }

    fn signature_protocol(&self) -> &'static str {
        "application/pkcs7-signature"
    }
}

impl Encryptor for SmimeBackend {
    async fn encrypt(
        &self,
        content: &Path,
        keylist: &[String],
        _sign_as: Option<&str>,
        _also_sign: bool,
    ) -> MailForgeResult<Vec<u8>> {
        let certs = keylist
            .iter()
            .map(|hash| {
                let path = self.certificate_path(hash);
                if path.exists() {
                    Ok(shell_quote(&path.to_string_lossy()))
                } else {
                    Err(raise_error!(
                        format!("Certificate file {:?} is missing", path),
                        ErrorCode::RecipientKeyMissing
                    ))
                }
            })
            .collect::<MailForgeResult<Vec<String>>>()?
            .into_iter()
            .join(" ");
        let out_path = content.with_extension("p7m");
        let mut ctx = FormatContext::new();
        ctx.set('f', content.to_string_lossy());
        ctx.set('s', out_path.to_string_lossy());
        ctx.set('a', &self.cipher);
        ctx.set_raw('c', certs);
        let command = self.encrypt_command.render_command(&ctx);
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
        let key = key.ok_or_else(|| {
            raise_error!(
                "No S/MIME decryption key configured".into(),
                ErrorCode::CommandNotConfigured
            )
        })?;
        let key_file = self.key_path(key);
        let key_value = if key_file.exists() {
            key_file.to_string_lossy().into_owned()
        } else {
            key.to_string()
        };
        let out_path = content.with_extension("clear");
        let mut ctx = FormatContext::new();
        ctx.set('f', content.to_string_lossy());
        ctx.set('s', out_path.to_string_lossy());
        ctx.set('k', key_value);
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

impl KeyResolver for SmimeBackend {
    async fn find_keys(
        &self,
        recipients: &[Address],
        oppenc: bool,
    ) -> MailForgeResult<Vec<String>> {
        self.find_keys_with_prompter(recipients, oppenc, None)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::modules::common::prompt::ScriptedPrompter;
    use crate::modules::settings::scope::SessionOptions;

    const INDEX: &str = "\
jane@example.com aabbccdd Jane_Work t se
jane@example.com 11223344 Jane_Old e se
bob@example.org 55667788 Bob u e
carol@example.net 99aabbcc Carol v e
carol@example.net ddeeff00 Carol_Alt v e
";

    fn backend() -> SmimeBackend {
        let options = SessionOptions::from_settings(&SETTINGS);
        let mut backend = SmimeBackend::from_settings(&options).unwrap();
        backend.set_index(parse_index(INDEX));
        backend
    }

    #[test]
    fn index_parses_and_filters_expired() {
        let backend = backend();
        let candidates = backend.candidates("jane@example.com", true);
        assert_eq!(candidates.len(), 2);
        let hash = backend.select_silently("jane@example.com", true).unwrap();
        assert_eq!(hash, "aabbccdd");
    }

    #[test]
    fn oppenc_declines_ambiguous_untrusted_matches() {
        let backend = backend();
        let err = backend.select_silently("carol@example.net", true).unwrap_err();
        assert_eq!(err.code(), ErrorCode::RecipientKeyMissing);
        // A single unverified match is still usable opportunistically.
        let ok = backend.select_silently("bob@example.org", true).unwrap();
        assert_eq!(ok, "55667788");
    }

    #[test]
    fn untrusted_pick_requires_confirmation() {
        let backend = backend();
        let mut prompter = ScriptedPrompter::new()
            .answer_choice(Some(0))
            .answer_quad(PromptAnswer::No);
        let err = backend
            .select_with_prompter("bob@example.org", &mut prompter)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::KeyNotTrusted);

        let mut accepting = ScriptedPrompter::new()
            .answer_choice(Some(0))
            .answer_quad(PromptAnswer::Yes);
        let hash = backend
            .select_with_prompter("bob@example.org", &mut accepting)
            .unwrap();
        assert_eq!(hash, "55667788");
    }
}
