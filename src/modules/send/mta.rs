// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::process::Stdio;

use mail_send::smtp::message::Message;
use mail_send::{Credentials, SmtpClientBuilder};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::modules::envelope::write::LineEnding;
use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailForgeResult;
use crate::modules::mime::write::normalize_newlines;
use crate::modules::settings::scope::SessionOptions;
use crate::raise_error;

/// Hand a finished message to the configured transport. The sendmail
/// pipe receives LF line endings, the SMTP path CRLF; the caller
/// renders with LF and the conversion happens here so both paths share
/// one rendering.
pub async fn submit(
    options: &SessionOptions,
    envelope_from: &str,
    recipients: &[String],
    message_lf: &[u8],
) -> MailForgeResult<()> {
    if recipients.is_empty() {
        return Err(raise_error!(
            "No recipients specified".into(),
            ErrorCode::NoRecipients
        ));
    }
    match &options.smtp_url {
        Some(url) => {
            let crlf = normalize_newlines(message_lf, LineEnding::CrLf);
            submit_smtp(options, url, envelope_from, recipients, &crlf).await
        }
        None => invoke_sendmail(&options.sendmail, recipients, message_lf).await,
    }
}

/// Pipe the message to `sendmail -oi -- <addresses>` on stdin,
/// surfacing the captured stderr on a non-zero exit.
pub async fn invoke_sendmail(
    command: &str,
    recipients: &[String],
    message: &[u8],
) -> MailForgeResult<()> {
    let words = shell_words::split(command).map_err(|e| {
        raise_error!(
            format!("Bad sendmail command {:?}: {}", command, e),
            ErrorCode::CommandNotConfigured
        )
    })?;
    let (program, args) = words.split_first().ok_or_else(|| {
        raise_error!(
            "Empty sendmail command".into(),
            ErrorCode::CommandNotConfigured
        )
    })?;

    debug!("Invoking MTA: {} {:?} -- {:?}", program, args, recipients);
    let mut child = tokio::process::Command::new(program)
        .args(args)
        .arg("--")
        .args(recipients)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            raise_error!(
                format!("Cannot spawn {}: {}", program, e),
                ErrorCode::SendmailFailed
            )
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(message).await.map_err(|e| {
            raise_error!(
                format!("Cannot write message to {}: {}", program, e),
                ErrorCode::SendmailFailed
            )
        })?;
    }

    let output = child.wait_with_output().await.map_err(|e| {
        raise_error!(
            format!("Waiting for {} failed: {}", program, e),
            ErrorCode::SendmailFailed
        )
    })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(raise_error!(
            format!(
                "{} exited with {}\n{}",
                program,
                output.status.code().unwrap_or(-1),
                stderr
            ),
            ErrorCode::SendmailFailed
        ));
    }
    info!("Message delivered to {}", program);
    Ok(())
}

async fn submit_smtp(
    options: &SessionOptions,
    url: &str,
    envelope_from: &str,
    recipients: &[String],
    message_crlf: &[u8],
) -> MailForgeResult<()> {
    let (host, port) = parse_smtp_url(url)?;

    let mut message = Message::empty().body(message_crlf);
    message = message.from(envelope_from.to_string());
    for recipient in recipients {
        message = message.to(recipient.clone());
    }

    let mut builder =
        SmtpClientBuilder::new(host.clone(), port).implicit_tls(port == 465);
    if let (Some(user), Some(pass)) = (&options.smtp_user, &options.smtp_pass) {
        builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
    }
    let mut client = builder.connect().await.map_err(|e| {
        raise_error!(
            format!("Cannot connect to {}:{}: {}", host, port, e),
            ErrorCode::SmtpConnectionFailed
        )
    })?;
    client.send(message).await.map_err(|e| {
        raise_error!(
            format!("SMTP delivery to {} failed: {}", host, e),
            ErrorCode::SmtpCommandFailed
        )
    })?;
    info!("Message delivered to {}:{}", host, port);
    Ok(())
}

fn parse_smtp_url(url: &str) -> MailForgeResult<(String, u16)> {
    let trimmed = url
        .trim_start_matches("smtps://")
        .trim_start_matches("smtp://");
    match trimmed.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| {
                raise_error!(
                    format!("Bad SMTP port in {:?}", url),
                    ErrorCode::InvalidParameter
                )
            })?;
            Ok((host.to_string(), port))
        }
        None => Ok((trimmed.to_string(), 587)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn sendmail_true_accepts_message() {
        invoke_sendmail("/bin/true", &["a@example.com".to_string()], b"body\n")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn sendmail_failure_surfaces_stderr() {
        let err = invoke_sendmail(
            "/bin/sh -c 'echo relay access denied >&2; exit 1'",
            &["a@example.com".to_string()],
            b"body\n",
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SendmailFailed);
        assert!(format!("{}", err).contains("relay access denied"));
    }

    #[test]
    fn smtp_url_forms() {
        assert_eq!(
            parse_smtp_url("smtp.example.com:465").unwrap(),
            ("smtp.example.com".to_string(), 465)
        );
        assert_eq!(
            parse_smtp_url("smtps://relay:25").unwrap(),
            ("relay".to_string(), 25)
        );
        assert_eq!(
            parse_smtp_url("relay.example.com").unwrap(),
            ("relay.example.com".to_string(), 587)
        );
    }
}
