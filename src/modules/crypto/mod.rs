// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::path::Path;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::modules::address::Address;
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailForgeResult;
use crate::modules::mime::body::{BodyArena, BodyId};
use crate::modules::settings::scope::SessionOptions;
use crate::raise_error;

pub mod autocrypt;
pub mod pgp;
pub mod smime;
pub mod verify;

// Message security bits.
pub const SEC_ENCRYPT: u32 = 1 << 0;
pub const SEC_SIGN: u32 = 1 << 1;
pub const SEC_GOODSIGN: u32 = 1 << 2;
pub const SEC_BADSIGN: u32 = 1 << 3;
pub const SEC_PARTSIGN: u32 = 1 << 4;
pub const SEC_INLINE: u32 = 1 << 5;
pub const SEC_OPPENC: u32 = 1 << 6;
pub const SEC_KEY_ATTACH: u32 = 1 << 7;
pub const SEC_AUTOCRYPT: u32 = 1 << 8;
pub const SEC_AUTOCRYPT_OVERRIDE: u32 = 1 << 9;
pub const APPLICATION_PGP: u32 = 1 << 10;
pub const APPLICATION_SMIME: u32 = 1 << 11;

// Which backends are compiled/configured in.
pub const WITH_PGP: u32 = 1 << 0;
pub const WITH_SMIME: u32 = 1 << 1;

/// The per-draft security bitmask.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct SecurityFlags(pub u32);

impl SecurityFlags {
    pub fn contains(&self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    pub fn intersects(&self, bits: u32) -> bool {
        self.0 & bits != 0
    }

    pub fn insert(&mut self, bits: u32) {
        self.0 |= bits;
    }

    pub fn remove(&mut self, bits: u32) {
        self.0 &= !bits;
    }

    pub fn encrypt(&self) -> bool {
        self.intersects(SEC_ENCRYPT)
    }

    pub fn sign(&self) -> bool {
        self.intersects(SEC_SIGN)
    }

    pub fn is_protected(&self) -> bool {
        self.intersects(SEC_ENCRYPT | SEC_SIGN | SEC_AUTOCRYPT)
    }

    pub fn is_pgp(&self) -> bool {
        self.intersects(APPLICATION_PGP | SEC_AUTOCRYPT)
    }

    pub fn is_smime(&self) -> bool {
        self.intersects(APPLICATION_SMIME)
    }

    /// Enabling sign or encrypt by hand clears autocrypt unless the
    /// override bit says the user insisted on both.
    pub fn set_manual_protection(&mut self, bits: u32) {
        self.insert(bits);
        if !self.contains(SEC_AUTOCRYPT_OVERRIDE) {
            self.remove(SEC_AUTOCRYPT);
        }
    }

    /// Structural invariant on a protected draft: exactly one backend
    /// selected, and autocrypt never combined with S/MIME or inline.
    pub fn validate(&self) -> MailForgeResult<()> {
        if self.intersects(SEC_ENCRYPT | SEC_SIGN) && !self.intersects(SEC_AUTOCRYPT) {
            let pgp = self.intersects(APPLICATION_PGP);
            let smime = self.intersects(APPLICATION_SMIME);
            if pgp == smime {
                return Err(raise_error!(
                    "Protected draft must select exactly one crypto backend".into(),
                    ErrorCode::InternalError
                ));
            }
        }
        if self.intersects(SEC_AUTOCRYPT)
            && self.intersects(APPLICATION_SMIME | SEC_INLINE)
        {
            return Err(raise_error!(
                "Autocrypt cannot combine with S/MIME or inline armor".into(),
                ErrorCode::InternalError
            ));
        }
        Ok(())
    }
}

/// Output of one crypto subprocess run.
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
}

/// Run a rendered command line through `/bin/sh -c`, feeding
/// `stdin_data` when given and collecting both streams. A non-zero
/// exit surfaces the captured stderr.
pub async fn run_crypto_command(
    command: &str,
    stdin_data: Option<&[u8]>,
) -> MailForgeResult<CommandOutput> {
    debug!("Running crypto command: {}", command);
    let mut child = tokio::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .stdin(if stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            raise_error!(
                format!("Cannot spawn {:?}: {}", command, e),
                ErrorCode::CryptoCommandFailed
            )
        })?;

    if let Some(data) = stdin_data {
        use tokio::io::AsyncWriteExt;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(data).await.map_err(|e| {
                raise_error!(
                    format!("Cannot write to crypto subprocess: {}", e),
                    ErrorCode::CryptoCommandFailed
                )
            })?;
        }
    }

    let output = child.wait_with_output().await.map_err(|e| {
        raise_error!(
            format!("Crypto subprocess failed: {}", e),
            ErrorCode::CryptoCommandFailed
        )
    })?;
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !output.status.success() {
        return Err(raise_error!(
            format!(
                "Crypto command exited with {}\n{}",
                output.status.code().unwrap_or(-1),
                stderr
            ),
            ErrorCode::CryptoCommandFailed
        ));
    }
    Ok(CommandOutput {
        stdout: output.stdout,
        stderr,
    })
}

/// Produce a detached signature or an enveloped form of canonical
/// content, depending on the operation.
pub trait Signer {
    fn sign_detached(
        &self,
        content: &Path,
        sign_as: Option<&str>,
    ) -> impl std::future::Future<Output = MailForgeResult<Vec<u8>>> + Send;

    /// The micalg token advertised on multipart/signed.
    fn micalg(&self) -> String;

    /// The protocol parameter of the signature part.
    fn signature_protocol(&self) -> &'static str;
}

pub trait Encryptor {
    fn encrypt(
        &self,
        content: &Path,
        keylist: &[String],
        sign_as: Option<&str>,
        also_sign: bool,
    ) -> impl std::future::Future<Output = MailForgeResult<Vec<u8>>> + Send;

    fn decrypt(
        &self,
        content: &Path,
        key: Option<&str>,
    ) -> impl std::future::Future<Output = MailForgeResult<Vec<u8>>> + Send;
}

pub trait KeyResolver {
    /// Resolve one usable key per recipient. In opportunistic mode the
    /// resolver must stay silent and fail softly; interactive mode may
    /// consult the prompter.
    fn find_keys(
        &self,
        recipients: &[Address],
        oppenc: bool,
    ) -> impl std::future::Future<Output = MailForgeResult<Vec<String>>> + Send;
}

/// Runtime view over the configured backends. The bitmask only selects
/// which implementation handles a message; every entry point checks it
/// and degrades to an "unavailable" error instead of panicking.
pub struct CryptoGateway {
    pub with_crypto: u32,
    pub pgp: pgp::PgpBackend,
    pub smime: smime::SmimeBackend,
}

impl CryptoGateway {
    pub fn from_options(options: &SessionOptions) -> MailForgeResult<Self> {
        Ok(CryptoGateway {
            with_crypto: WITH_PGP | WITH_SMIME,
            pgp: pgp::PgpBackend::from_settings()?,
            smime: smime::SmimeBackend::from_settings(options)?,
        })
    }

    pub fn ensure_available(&self, flags: SecurityFlags) -> MailForgeResult<()> {
        if flags.is_smime() && self.with_crypto & WITH_SMIME == 0 {
            return Err(raise_error!(
                "S/MIME support is unavailable".into(),
                ErrorCode::CryptoBackendUnavailable
            ));
        }
        if flags.is_pgp() && self.with_crypto & WITH_PGP == 0 {
            return Err(raise_error!(
                "PGP support is unavailable".into(),
                ErrorCode::CryptoBackendUnavailable
            ));
        }
        Ok(())
    }

    /// Resolve keys for every recipient under the selected backend.
    /// In opportunistic mode a missing key is reported as an error the
    /// caller interprets as "leave the message unencrypted"; in
    /// interactive mode an ambiguous S/MIME match falls through to a
    /// selection menu on the prompter.
    pub async fn find_keys(
        &self,
        flags: SecurityFlags,
        recipients: &[Address],
        oppenc: bool,
        prompter: Option<&mut dyn crate::modules::common::prompt::Prompter>,
    ) -> MailForgeResult<Vec<String>> {
        self.ensure_available(flags)?;
        if flags.is_smime() {
            self.smime
                .find_keys_with_prompter(recipients, oppenc, prompter)
        } else {
            self.pgp.find_keys(recipients, oppenc).await
        }
    }

    /// Apply the protection the flags ask for, returning the new root.
    /// The original subtree stays alive inside (signed) or beside
    /// (encrypted) the returned wrapper so a failed send can restore
    /// it.
    pub async fn protect(
        &self,
        arena: &mut BodyArena,
        root: BodyId,
        flags: SecurityFlags,
        keylist: &[String],
        options: &SessionOptions,
    ) -> MailForgeResult<BodyId> {
        flags.validate()?;
        self.ensure_available(flags)?;
        if flags.is_smime() {
            let sign_as = options.smime_default_key.as_deref();
            match (flags.sign(), flags.encrypt()) {
                (true, false) => {
                    self.smime
                        .sign_body(arena, root, sign_as, &options.tmpdir)
                        .await
                }
                (false, true) => {
                    self.smime
                        .encrypt_body(arena, root, keylist, &options.tmpdir)
                        .await
                }
                (true, true) => {
                    let signed = self
                        .smime
                        .sign_body(arena, root, sign_as, &options.tmpdir)
                        .await?;
                    self.smime
                        .encrypt_body(arena, signed, keylist, &options.tmpdir)
                        .await
                }
                (false, false) => Ok(root),
            }
        } else {
            let sign_as = options.pgp_sign_as.as_deref();
            match (flags.sign(), flags.encrypt() || flags.contains(SEC_AUTOCRYPT)) {
                (true, false) => {
                    self.pgp
                        .sign_body(arena, root, sign_as, &options.tmpdir)
                        .await
                }
                (sign, true) => {
                    self.pgp
                        .encrypt_body(arena, root, keylist, sign_as, sign, &options.tmpdir)
                        .await
                }
                (false, false) => Ok(root),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn manual_protection_clears_autocrypt() {
        let mut flags = SecurityFlags(SEC_AUTOCRYPT | APPLICATION_PGP);
        flags.set_manual_protection(SEC_SIGN);
        assert!(!flags.intersects(SEC_AUTOCRYPT));

        let mut overridden =
            SecurityFlags(SEC_AUTOCRYPT | SEC_AUTOCRYPT_OVERRIDE | APPLICATION_PGP);
        overridden.set_manual_protection(SEC_SIGN);
        assert!(overridden.intersects(SEC_AUTOCRYPT));
    }

    #[test]
    fn validate_requires_exactly_one_backend() {
        assert!(SecurityFlags(SEC_SIGN | APPLICATION_PGP).validate().is_ok());
        assert!(SecurityFlags(SEC_SIGN).validate().is_err());
        assert!(SecurityFlags(SEC_SIGN | APPLICATION_PGP | APPLICATION_SMIME)
            .validate()
            .is_err());
        assert!(SecurityFlags(SEC_ENCRYPT | SEC_AUTOCRYPT).validate().is_ok());
        assert!(SecurityFlags(SEC_AUTOCRYPT | APPLICATION_SMIME)
            .validate()
            .is_err());
    }
}
