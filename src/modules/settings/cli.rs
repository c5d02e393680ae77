// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::settings::quad::QuadOption;
use clap::{builder::ValueParser, Parser};
use std::{collections::HashSet, env, path::PathBuf, sync::LazyLock};

#[cfg(not(test))]
pub static SETTINGS: LazyLock<Settings> = LazyLock::new(Settings::parse);

#[cfg(test)]
pub static SETTINGS: LazyLock<Settings> = LazyLock::new(Settings::new_for_test);

fn comma_list() -> ValueParser {
    ValueParser::new(|s: &str| -> Result<HashSet<String>, String> {
        Ok(s.split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect())
    })
}

#[derive(Debug, Parser)]
#[clap(
    name = "mailforge",
    about = "A terminal mail composition and submission engine: builds MIME messages,
    applies PGP/S-MIME protection, and hands them to sendmail or an SMTP relay.",
    version = env!("CARGO_PKG_VERSION")
)]
pub struct Settings {
    /// Recipient addresses for a new message.
    #[clap(value_name = "ADDRESS")]
    pub recipients: Vec<String>,

    /// Subject for a new message
    #[clap(short = 's', long, help = "Set the subject of the message")]
    pub subject: Option<String>,

    /// Attach a file to the message (repeatable)
    #[clap(short = 'a', long, help = "Attach a file to the message")]
    pub attach: Vec<PathBuf>,

    /// Read the initial message body from this file instead of stdin
    #[clap(short = 'i', long, help = "Include the file in the message body")]
    pub include: Option<PathBuf>,

    /// Use this draft file for headers and body
    #[clap(short = 'H', long, help = "Read headers and body from a draft file")]
    pub draft_file: Option<PathBuf>,

    /// Send without any interactive prompting
    #[clap(long, help = "Batch mode: read the body from stdin and send")]
    pub batch: bool,

    /// Resume the first postponed message instead of composing anew
    #[clap(short = 'p', long, help = "Resume a postponed message")]
    pub resume_postponed: bool,

    /// mailforge log level (default: "info")
    #[clap(
        long,
        default_value = "info",
        env,
        help = "Set the log level for mailforge"
    )]
    pub mailforge_log_level: String,

    /// Enable ANSI logs (default: false)
    #[clap(long, default_value = "false", env, help = "Enable ANSI formatted logs")]
    pub mailforge_ansi_logs: bool,

    /// Enable log file output (default: false)
    /// If false, logs will be printed to stderr
    #[clap(
        long,
        default_value = "false",
        env,
        help = "Enable log file output (otherwise logs go to stderr)"
    )]
    pub mailforge_log_to_file: bool,

    #[clap(
        long,
        default_value = "logs",
        env,
        help = "Set the directory for log files"
    )]
    pub mailforge_log_dir: PathBuf,

    /// Maximum number of log files (default: 5)
    #[clap(
        long,
        default_value = "5",
        env,
        help = "Set the maximum number of session log files"
    )]
    pub mailforge_max_log_files: usize,

    /// Sender address; derived from the local user when unset
    #[clap(long, env, help = "Set the From address")]
    pub mailforge_from: Option<String>,

    /// Display name attached to the From address
    #[clap(long, env, help = "Set the real name used in the From header")]
    pub mailforge_realname: Option<String>,

    /// Addresses treated as the local user besides From
    #[clap(
        long,
        env,
        default_value = "",
        help = "Comma-separated addresses considered to be the local user",
        value_parser = comma_list()
    )]
    pub mailforge_alternates: HashSet<String>,

    /// Mailing list patterns
    #[clap(
        long,
        env,
        default_value = "",
        help = "Comma-separated mailing list address patterns",
        value_parser = comma_list()
    )]
    pub mailforge_lists: HashSet<String>,

    /// Subscribed mailing list patterns (a subset of the list patterns)
    #[clap(
        long,
        env,
        default_value = "",
        help = "Comma-separated subscribed list address patterns",
        value_parser = comma_list()
    )]
    pub mailforge_subscribed: HashSet<String>,

    #[clap(long, env, help = "Editor command; falls back to EDITOR, VISUAL, vi")]
    pub mailforge_editor: Option<String>,

    #[clap(
        long,
        default_value = "false",
        env,
        help = "Include headers in the edit buffer"
    )]
    pub mailforge_edit_headers: bool,

    #[clap(
        long,
        default_value = "false",
        env,
        help = "Skip the initial edit and go straight to the compose menu"
    )]
    pub mailforge_autoedit: bool,

    #[clap(
        long,
        default_value = "false",
        env,
        help = "Allow editor sessions to run in the background"
    )]
    pub mailforge_background_edit: bool,

    #[clap(
        long,
        default_value = "ask-yes",
        env,
        help = "Abort when the subject is empty"
    )]
    pub mailforge_abort_nosubject: QuadOption,

    #[clap(
        long,
        default_value = "ask-yes",
        env,
        help = "Abort when the message was not modified in the editor"
    )]
    pub mailforge_abort_unmodified: QuadOption,

    #[clap(
        long,
        default_value = "no",
        env,
        help = "Abort when the body mentions attachments but none are attached"
    )]
    pub mailforge_abort_noattach: QuadOption,

    #[clap(
        long,
        default_value = r"\battach(|ed|ments?)\b",
        env,
        help = "Regular expression that triggers the missing-attachment check"
    )]
    pub mailforge_abort_noattach_regexp: String,

    #[clap(
        long,
        default_value = "ask-yes",
        env,
        help = "Quote the original message in replies"
    )]
    pub mailforge_include: QuadOption,

    #[clap(
        long,
        default_value = "On %d, %n wrote:",
        env,
        help = "Attribution line placed above quoted text in replies"
    )]
    pub mailforge_attribution: String,

    #[clap(
        long,
        default_value = "",
        env,
        help = "Locale applied to dates inside the attribution line"
    )]
    pub mailforge_attribution_locale: String,

    #[clap(
        long,
        default_value = r"^(re(\[[0-9]+\])*|aw):[ \t]*",
        env,
        help = "Pattern recognizing an existing reply prefix in the subject"
    )]
    pub mailforge_reply_regexp: String,

    #[clap(
        long,
        default_value = "ask-yes",
        env,
        help = "Honor Reply-To when answering"
    )]
    pub mailforge_reply_to: QuadOption,

    #[clap(
        long,
        default_value = "false",
        env,
        help = "When a list sets Reply-To back to itself, answer the author instead"
    )]
    pub mailforge_ignore_list_reply_to: bool,

    #[clap(
        long,
        default_value = "false",
        env,
        help = "When replying to your own message, keep yourself as recipient"
    )]
    pub mailforge_reply_self: bool,

    #[clap(
        long,
        default_value = "> ",
        env,
        help = "Prefix applied to quoted lines"
    )]
    pub mailforge_indent_string: String,

    #[clap(
        long,
        default_value = "true",
        env,
        help = "Generate Mail-Followup-To for subscribed lists"
    )]
    pub mailforge_followup_to: bool,

    #[clap(
        long,
        default_value = "yes",
        env,
        help = "Honor Mail-Followup-To when group-replying"
    )]
    pub mailforge_honor_followup_to: QuadOption,

    #[clap(
        long,
        default_value = "[%a: %s]",
        env,
        help = "Subject template for forwarded messages"
    )]
    pub mailforge_forward_format: String,

    #[clap(
        long,
        default_value = "true",
        env,
        help = "Decode the original message when forwarding inline"
    )]
    pub mailforge_forward_decode: bool,

    #[clap(
        long,
        default_value = "false",
        env,
        help = "Quote the forwarded body with the indent string"
    )]
    pub mailforge_forward_quote: bool,

    #[clap(
        long,
        default_value = "no",
        env,
        help = "Forward the message as a message/rfc822 attachment"
    )]
    pub mailforge_mime_forward: QuadOption,

    #[clap(
        long,
        default_value = "ask-yes",
        env,
        help = "Re-attach non-decodable attachments when forwarding inline"
    )]
    pub mailforge_forward_attachments: QuadOption,

    #[clap(
        long,
        default_value = "----- Forwarded message from %f -----",
        env,
        help = "Banner placed above a forwarded message"
    )]
    pub mailforge_forward_attribution_intro: String,

    #[clap(
        long,
        default_value = "----- End forwarded message -----",
        env,
        help = "Banner placed below a forwarded message"
    )]
    pub mailforge_forward_attribution_trailer: String,

    #[clap(long, env, help = "Signature file appended to outgoing messages")]
    pub mailforge_signature: Option<PathBuf>,

    #[clap(
        long,
        default_value = "true",
        env,
        help = "Precede the signature with a dash line"
    )]
    pub mailforge_sig_dashes: bool,

    #[clap(long, env, default_value = "Mail", help = "Default mailbox folder")]
    pub mailforge_folder: PathBuf,

    #[clap(long, env, help = "Default Fcc target for outgoing mail")]
    pub mailforge_record: Option<String>,

    #[clap(
        long,
        env,
        default_value = "postponed",
        help = "Mailbox that stores postponed drafts"
    )]
    pub mailforge_postponed: String,

    #[clap(long, env, default_value = "/tmp", help = "Scratch file directory")]
    pub mailforge_tmpdir: PathBuf,

    #[clap(
        long,
        default_value = "yes",
        env,
        help = "Save copies of outgoing messages"
    )]
    pub mailforge_copy: QuadOption,

    #[clap(
        long,
        default_value = "false",
        env,
        help = "Write the Fcc before invoking the MTA"
    )]
    pub mailforge_fcc_before_send: bool,

    #[clap(
        long,
        env,
        default_value = "",
        help = "Delimiter splitting a multi-target Fcc list (empty disables splitting)"
    )]
    pub mailforge_fcc_delimiter: String,

    #[clap(
        long,
        default_value = "ask-yes",
        env,
        help = "Postpone the message when leaving without sending"
    )]
    pub mailforge_postpone: QuadOption,

    #[clap(
        long,
        default_value = "ask-yes",
        env,
        help = "Offer to resume postponed messages when composing"
    )]
    pub mailforge_recall: QuadOption,

    #[clap(
        long,
        env,
        default_value = "/usr/sbin/sendmail -oi",
        help = "Local MTA command; addresses are appended after --"
    )]
    pub mailforge_sendmail: String,

    #[clap(
        long,
        env,
        help = "SMTP relay as host:port; when set it is preferred over sendmail"
    )]
    pub mailforge_smtp_url: Option<String>,

    #[clap(long, env, help = "SMTP authentication user")]
    pub mailforge_smtp_user: Option<String>,

    #[clap(long, env, help = "SMTP authentication password")]
    pub mailforge_smtp_pass: Option<String>,

    #[clap(
        long,
        default_value = "false",
        env,
        help = "Include the Bcc header in the wire output"
    )]
    pub mailforge_write_bcc: bool,

    #[clap(
        long,
        default_value = "false",
        env,
        help = "Sign all outgoing messages"
    )]
    pub mailforge_crypt_autosign: bool,

    #[clap(
        long,
        default_value = "false",
        env,
        help = "Encrypt all outgoing messages"
    )]
    pub mailforge_crypt_autoencrypt: bool,

    #[clap(
        long,
        default_value = "false",
        env,
        help = "Sign replies to signed messages"
    )]
    pub mailforge_crypt_replysign: bool,

    #[clap(
        long,
        default_value = "false",
        env,
        help = "Encrypt replies to encrypted messages"
    )]
    pub mailforge_crypt_replyencrypt: bool,

    #[clap(
        long,
        default_value = "false",
        env,
        help = "Sign replies to encrypted messages"
    )]
    pub mailforge_crypt_replysignencrypted: bool,

    #[clap(
        long,
        default_value = "false",
        env,
        help = "Encrypt opportunistically whenever keys exist for every recipient"
    )]
    pub mailforge_crypt_opportunistic_encrypt: bool,

    #[clap(
        long,
        default_value = "true",
        env,
        help = "Answer with PGP when the original was PGP protected"
    )]
    pub mailforge_crypt_auto_pgp: bool,

    #[clap(
        long,
        default_value = "true",
        env,
        help = "Answer with S/MIME when the original was S/MIME protected"
    )]
    pub mailforge_crypt_auto_smime: bool,

    #[clap(
        long,
        default_value = "false",
        env,
        help = "Use traditional inline PGP instead of PGP/MIME for new messages"
    )]
    pub mailforge_pgp_autoinline: bool,

    #[clap(
        long,
        default_value = "false",
        env,
        help = "Use inline PGP when replying to an inline PGP message"
    )]
    pub mailforge_pgp_replyinline: bool,

    #[clap(
        long,
        default_value = "false",
        env,
        help = "Prefer S/MIME when both backends could protect a message"
    )]
    pub mailforge_smime_is_default: bool,

    #[clap(long, env, help = "PGP key id used for signing")]
    pub mailforge_pgp_sign_as: Option<String>,

    #[clap(long, env, help = "S/MIME key id used for signing")]
    pub mailforge_smime_default_key: Option<String>,

    #[clap(
        long,
        env,
        default_value = "sha256",
        help = "Digest algorithm for S/MIME signatures"
    )]
    pub mailforge_smime_sign_digest_alg: String,

    #[clap(
        long,
        env,
        default_value = "aes256",
        help = "Cipher for S/MIME encryption"
    )]
    pub mailforge_smime_encrypt_with: String,

    #[clap(
        long,
        default_value = "false",
        env,
        help = "Re-encrypt encrypted drafts to the postpone key when postponing"
    )]
    pub mailforge_postpone_encrypt: bool,

    #[clap(long, env, help = "Key id that postponed encrypted drafts are readable by")]
    pub mailforge_postpone_encrypt_as: Option<String>,

    #[clap(
        long,
        default_value = "false",
        env,
        help = "Enable the Autocrypt overlay"
    )]
    pub mailforge_autocrypt: bool,

    #[clap(
        long,
        default_value = "true",
        env,
        help = "Answer Autocrypt messages with Autocrypt"
    )]
    pub mailforge_autocrypt_reply: bool,

    #[clap(
        long,
        env,
        default_value = "autocrypt",
        help = "Directory holding the Autocrypt account and peer state"
    )]
    pub mailforge_autocrypt_dir: PathBuf,

    #[clap(
        long,
        env,
        default_value = "",
        help = "Colon-separated mailcap search path (empty uses the standard locations)"
    )]
    pub mailforge_mailcap_path: String,

    #[clap(
        long,
        env,
        default_value = "gpg --batch --yes --no-tty --armor --textmode %?k?-u %k? --detach-sign -o %s %f",
        help = "Command producing a detached PGP signature"
    )]
    pub mailforge_pgp_sign_command: String,

    #[clap(
        long,
        env,
        default_value = "gpg --batch --yes --no-tty --armor --textmode %?k?-u %k? --clearsign -o %s %f",
        help = "Command clear-signing inline PGP text"
    )]
    pub mailforge_pgp_clearsign_command: String,

    #[clap(
        long,
        env,
        default_value = "gpg --batch --yes --no-tty --armor --encrypt --trust-model always %c -o %s %f",
        help = "Command encrypting to the recipient key list"
    )]
    pub mailforge_pgp_encrypt_only_command: String,

    #[clap(
        long,
        env,
        default_value = "gpg --batch --yes --no-tty --armor --encrypt --sign %?k?-u %k? --trust-model always %c -o %s %f",
        help = "Command encrypting and signing in one pass"
    )]
    pub mailforge_pgp_encrypt_sign_command: String,

    #[clap(
        long,
        env,
        default_value = "gpg --batch --yes --no-tty --decrypt -o %s %f",
        help = "Command decrypting a PGP message"
    )]
    pub mailforge_pgp_decrypt_command: String,

    #[clap(
        long,
        env,
        default_value = "gpg --batch --yes --no-tty --verify %s %f",
        help = "Command verifying a detached PGP signature"
    )]
    pub mailforge_pgp_verify_command: String,

    #[clap(
        long,
        env,
        default_value = "gpg --batch --yes --no-tty --with-colons --list-keys %c",
        help = "Command listing candidate PGP keys for an address"
    )]
    pub mailforge_pgp_list_keys_command: String,

    #[clap(
        long,
        env,
        default_value = "gpg --batch --yes --no-tty --armor --export %k",
        help = "Command exporting a public key block"
    )]
    pub mailforge_pgp_export_command: String,

    #[clap(
        long,
        env,
        default_value = "gpg --batch --yes --no-tty --import %f",
        help = "Command importing key material from a file"
    )]
    pub mailforge_pgp_import_command: String,

    #[clap(
        long,
        env,
        default_value = "openssl smime -sign -md %d -signer %k -inkey %k -in %f -out %s -outform DER %?i?-certfile %i?",
        help = "Command producing an S/MIME signature"
    )]
    pub mailforge_smime_sign_command: String,

    #[clap(
        long,
        env,
        default_value = "openssl smime -encrypt -%a -outform DER -in %f -out %s %c",
        help = "Command encrypting to the recipient certificate list"
    )]
    pub mailforge_smime_encrypt_command: String,

    #[clap(
        long,
        env,
        default_value = "openssl smime -decrypt -inform DER -in %f -inkey %k -out %s",
        help = "Command decrypting an S/MIME message"
    )]
    pub mailforge_smime_decrypt_command: String,

    #[clap(
        long,
        env,
        default_value = "openssl smime -verify -inform DER -in %s -content %f %?C?-CAfile %C?",
        help = "Command verifying an S/MIME signature"
    )]
    pub mailforge_smime_verify_command: String,

    #[clap(
        long,
        env,
        default_value = "smime-certificates",
        help = "Directory holding S/MIME certificates and the key index"
    )]
    pub mailforge_smime_certificates: PathBuf,

    #[clap(long, env, help = "CA bundle passed to the S/MIME verify command")]
    pub mailforge_smime_ca_location: Option<PathBuf>,

    /// An alias definition: "name addr1, addr2" (repeatable)
    #[clap(long, env, help = "Define an alias: 'name address, address'")]
    pub mailforge_alias: Vec<String>,

    /// A send-hook: "PATTERN COMMAND", applied when a recipient matches
    /// PATTERN before the initial edit (repeatable)
    #[clap(long, env, help = "Send hook: 'pattern set option=value'")]
    pub mailforge_send_hook: Vec<String>,

    /// A reply-hook, applied before send-hooks when replying (repeatable)
    #[clap(long, env, help = "Reply hook: 'pattern set option=value'")]
    pub mailforge_reply_hook: Vec<String>,

    /// A send2-hook, re-applied whenever the message changes (repeatable)
    #[clap(long, env, help = "Send2 hook: 'pattern set option=value'")]
    pub mailforge_send2_hook: Vec<String>,
}

impl Settings {
    pub fn new_for_test() -> Self {
        Settings::parse_from(["mailforge"])
    }

    /// The editor fallback chain: the configured command, then
    /// MAILFORGE_EDITOR, EDITOR, VISUAL, and finally vi.
    pub fn resolve_editor(&self) -> String {
        if let Some(editor) = &self.mailforge_editor {
            return editor.clone();
        }
        for var in ["MAILFORGE_EDITOR", "EDITOR", "VISUAL"] {
            if let Ok(value) = env::var(var) {
                if !value.is_empty() {
                    return value;
                }
            }
        }
        "vi".to_string()
    }

    /// The address treated as the local user when no From is set.
    pub fn resolve_user(&self) -> String {
        if let Some(from) = &self.mailforge_from {
            return from.clone();
        }
        let user = env::var("USER").unwrap_or_else(|_| "user".to_string());
        let host = gethostname::gethostname();
        let host = host.to_string_lossy();
        if host.is_empty() {
            format!("{}@localhost", user)
        } else {
            format!("{}@{}", user, host)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_parse() {
        let settings = Settings::new_for_test();
        assert_eq!(settings.mailforge_log_level, "info");
        assert_eq!(settings.mailforge_indent_string, "> ");
        assert!(!settings.mailforge_fcc_before_send);
        assert!(settings.resolve_user().contains('@'));
    }
}
