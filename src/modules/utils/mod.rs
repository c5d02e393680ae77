// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::path::{Path, PathBuf};

use base64::{engine::general_purpose, Engine};
use rand::Rng;

use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailForgeResult;

#[macro_export]
macro_rules! mailforge_version {
    () => {
        env!("CARGO_PKG_VERSION")
    };
}

#[macro_export]
macro_rules! utc_now {
    () => {{
        use chrono::Utc;
        Utc::now().timestamp_millis()
    }};
}

#[macro_export]
macro_rules! base64_encode {
    ($bytes:expr) => {{
        use base64::{engine::general_purpose::STANDARD, *};
        STANDARD.encode($bytes)
    }};
}

#[macro_export]
macro_rules! base64_decode {
    ($key:expr) => {{
        use base64::{engine::general_purpose::STANDARD, *};
        STANDARD.decode($key)
    }};
}

#[macro_export]
macro_rules! raise_error {
    ($msg:expr, $code:expr) => {
        $crate::modules::error::MailForgeError::Generic {
            message: $msg,
            location: snafu::Location::default(),
            code: $code,
        }
    };
}

#[macro_export]
macro_rules! run_with_timeout {
    ($duration:expr, $task:expr, $err_msg:expr) => {{
        match tokio::time::timeout($duration, $task).await {
            Ok(result) => Ok(result),
            Err(_) => Err($err_msg),
        }
    }};
}

#[macro_export]
macro_rules! validate_email {
    ($email:expr) => {{
        $crate::modules::utils::validate_email($email)
    }};
}

pub fn validate_email(email: &str) -> MailForgeResult<()> {
    use std::str::FromStr;
    let parsed = email_address::EmailAddress::from_str(email).map_err(|_| {
        raise_error!(
            format!("Invalid email format: {}", email),
            ErrorCode::InvalidAddress
        )
    })?;
    if email != parsed.email() {
        return Err(raise_error!(
            format!("Invalid email format: {}", email),
            ErrorCode::InvalidAddress
        ));
    }
    Ok(())
}

/// Generate an RFC 5322 Message-ID bracketed as `<millis.hex16@host>`.
pub fn generate_message_id() -> String {
    let random_bytes: [u8; 16] = rand::rng().random();
    let random_id = hex::encode(random_bytes);
    let timestamp_millis = utc_now!();
    let host = gethostname::gethostname();
    let host = host.to_string_lossy();
    let host = if host.is_empty() {
        "localhost"
    } else {
        host.as_ref()
    };
    format!("<{}.{}@{}>", timestamp_millis, random_id, host)
}

/// A candidate MIME boundary: 16 random bytes, base64, with an `=_`
/// sentinel that cannot survive quoted-printable output. Callers
/// rejection-sample against the tree content before committing to it.
pub fn generate_boundary() -> String {
    let random_bytes: [u8; 16] = rand::rng().random();
    let token = general_purpose::URL_SAFE_NO_PAD.encode(random_bytes);
    format!("=_{}", token)
}

/// Create an exclusive scratch file under `tmpdir`, returning its path.
/// The caller owns the file; body nodes record ownership in `unlink`.
pub fn temp_message_file(tmpdir: &Path) -> MailForgeResult<PathBuf> {
    let file = tempfile::Builder::new()
        .prefix("mailforge-")
        .suffix(".eml")
        .tempfile_in(tmpdir)
        .map_err(|e| {
            raise_error!(
                format!("Cannot create temporary file in {:?}: {}", tmpdir, e),
                ErrorCode::TempFileFailed
            )
        })?;
    let (_, path) = file.keep().map_err(|e| {
        raise_error!(
            format!("Cannot persist temporary file: {}", e),
            ErrorCode::TempFileFailed
        )
    })?;
    Ok(path)
}

/// Escape a string for single-quoted interpolation into `/bin/sh -c`.
/// Embedded single quotes use the `'\''` idiom.
pub fn shell_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn message_id_is_bracketed() {
        let id = generate_message_id();
        assert!(id.starts_with('<') && id.ends_with('>'));
        assert!(id.contains('@'));
    }

    #[test]
    fn boundary_carries_sentinel() {
        let b = generate_boundary();
        assert!(b.starts_with("=_"));
        assert!(b.len() > 10);
    }

    #[test]
    fn shell_quote_embedded_quote() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote("plain"), "'plain'");
    }
}
