// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::path::PathBuf;

use crate::modules::settings::cli::Settings;
use crate::modules::settings::quad::QuadOption;

/// The mutable option set a send session runs under. Process-start
/// configuration lives in the `SETTINGS` global; everything a hook or
/// the compose session may change is carried here by value so that a
/// backgrounded session keeps the options it was left with.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub from: Option<String>,
    pub realname: Option<String>,
    pub user: String,
    pub alternates: Vec<String>,
    pub lists: Vec<String>,
    pub subscribed: Vec<String>,

    pub editor: String,
    pub edit_headers: bool,
    pub autoedit: bool,
    pub background_edit: bool,

    pub abort_nosubject: QuadOption,
    pub abort_unmodified: QuadOption,
    pub abort_noattach: QuadOption,
    pub abort_noattach_regexp: String,

    pub include: QuadOption,
    pub attribution: String,
    pub attribution_locale: String,
    pub reply_regexp: String,
    pub reply_to: QuadOption,
    pub ignore_list_reply_to: bool,
    pub reply_self: bool,
    pub indent_string: String,
    pub followup_to: bool,
    pub honor_followup_to: QuadOption,

    pub forward_format: String,
    pub forward_decode: bool,
    pub forward_quote: bool,
    pub mime_forward: QuadOption,
    pub forward_attachments: QuadOption,
    pub forward_attribution_intro: String,
    pub forward_attribution_trailer: String,

    pub signature: Option<PathBuf>,
    pub sig_dashes: bool,

    pub folder: PathBuf,
    pub record: Option<String>,
    pub postponed: String,
    pub tmpdir: PathBuf,

    pub copy: QuadOption,
    pub fcc_before_send: bool,
    pub fcc_delimiter: String,
    pub postpone: QuadOption,
    pub recall: QuadOption,

    pub sendmail: String,
    pub smtp_url: Option<String>,
    pub smtp_user: Option<String>,
    pub smtp_pass: Option<String>,
    pub write_bcc: bool,

    pub crypt_autosign: bool,
    pub crypt_autoencrypt: bool,
    pub crypt_replysign: bool,
    pub crypt_replyencrypt: bool,
    pub crypt_replysignencrypted: bool,
    pub crypt_opportunistic_encrypt: bool,
    pub crypt_auto_pgp: bool,
    pub crypt_auto_smime: bool,
    pub pgp_autoinline: bool,
    pub pgp_replyinline: bool,
    pub smime_is_default: bool,
    pub pgp_sign_as: Option<String>,
    pub smime_default_key: Option<String>,
    pub smime_sign_digest_alg: String,
    pub smime_encrypt_with: String,
    pub postpone_encrypt: bool,
    pub postpone_encrypt_as: Option<String>,
    pub autocrypt: bool,
    pub autocrypt_reply: bool,
}

impl SessionOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        SessionOptions {
            from: settings.mailforge_from.clone(),
            realname: settings.mailforge_realname.clone(),
            user: settings.resolve_user(),
            alternates: settings.mailforge_alternates.iter().cloned().collect(),
            lists: settings.mailforge_lists.iter().cloned().collect(),
            subscribed: settings.mailforge_subscribed.iter().cloned().collect(),
            editor: settings.resolve_editor(),
            edit_headers: settings.mailforge_edit_headers,
            autoedit: settings.mailforge_autoedit,
            background_edit: settings.mailforge_background_edit,
            abort_nosubject: settings.mailforge_abort_nosubject,
            abort_unmodified: settings.mailforge_abort_unmodified,
            abort_noattach: settings.mailforge_abort_noattach,
            abort_noattach_regexp: settings.mailforge_abort_noattach_regexp.clone(),
            include: settings.mailforge_include,
            attribution: settings.mailforge_attribution.clone(),
            attribution_locale: settings.mailforge_attribution_locale.clone(),
            reply_regexp: settings.mailforge_reply_regexp.clone(),
            reply_to: settings.mailforge_reply_to,
            ignore_list_reply_to: settings.mailforge_ignore_list_reply_to,
            reply_self: settings.mailforge_reply_self,
            indent_string: settings.mailforge_indent_string.clone(),
            followup_to: settings.mailforge_followup_to,
            honor_followup_to: settings.mailforge_honor_followup_to,
            forward_format: settings.mailforge_forward_format.clone(),
            forward_decode: settings.mailforge_forward_decode,
            forward_quote: settings.mailforge_forward_quote,
            mime_forward: settings.mailforge_mime_forward,
            forward_attachments: settings.mailforge_forward_attachments,
            forward_attribution_intro: settings.mailforge_forward_attribution_intro.clone(),
            forward_attribution_trailer: settings.mailforge_forward_attribution_trailer.clone(),
            signature: settings.mailforge_signature.clone(),
            sig_dashes: settings.mailforge_sig_dashes,
            folder: settings.mailforge_folder.clone(),
            record: settings.mailforge_record.clone(),
            postponed: settings.mailforge_postponed.clone(),
            tmpdir: settings.mailforge_tmpdir.clone(),
            copy: settings.mailforge_copy,
            fcc_before_send: settings.mailforge_fcc_before_send,
            fcc_delimiter: settings.mailforge_fcc_delimiter.clone(),
            postpone: settings.mailforge_postpone,
            recall: settings.mailforge_recall,
            sendmail: settings.mailforge_sendmail.clone(),
            smtp_url: settings.mailforge_smtp_url.clone(),
            smtp_user: settings.mailforge_smtp_user.clone(),
            smtp_pass: settings.mailforge_smtp_pass.clone(),
            write_bcc: settings.mailforge_write_bcc,
            crypt_autosign: settings.mailforge_crypt_autosign,
            crypt_autoencrypt: settings.mailforge_crypt_autoencrypt,
            crypt_replysign: settings.mailforge_crypt_replysign,
            crypt_replyencrypt: settings.mailforge_crypt_replyencrypt,
            crypt_replysignencrypted: settings.mailforge_crypt_replysignencrypted,
            crypt_opportunistic_encrypt: settings.mailforge_crypt_opportunistic_encrypt,
            crypt_auto_pgp: settings.mailforge_crypt_auto_pgp,
            crypt_auto_smime: settings.mailforge_crypt_auto_smime,
            pgp_autoinline: settings.mailforge_pgp_autoinline,
            pgp_replyinline: settings.mailforge_pgp_replyinline,
            smime_is_default: settings.mailforge_smime_is_default,
            pgp_sign_as: settings.mailforge_pgp_sign_as.clone(),
            smime_default_key: settings.mailforge_smime_default_key.clone(),
            smime_sign_digest_alg: settings.mailforge_smime_sign_digest_alg.clone(),
            smime_encrypt_with: settings.mailforge_smime_encrypt_with.clone(),
            postpone_encrypt: settings.mailforge_postpone_encrypt,
            postpone_encrypt_as: settings.mailforge_postpone_encrypt_as.clone(),
            autocrypt: settings.mailforge_autocrypt,
            autocrypt_reply: settings.mailforge_autocrypt_reply,
        }
    }

    /// `set name=value` / `set name` / `unset name` over the subset of
    /// options hooks may change. Unknown names are reported, not
    /// ignored, so a typo in a hook is visible.
    pub fn apply_assignment(&mut self, command: &str) -> Result<(), String> {
        let words = shell_words::split(command).map_err(|e| e.to_string())?;
        let mut words = words.iter();
        let verb = words.next().ok_or("empty hook command")?;
        match verb.as_str() {
            "set" => {
                for word in words {
                    let (name, value) = match word.split_once('=') {
                        Some((n, v)) => (n, Some(v)),
                        None => (word.as_str(), None),
                    };
                    self.set_option(name, value)?;
                }
                Ok(())
            }
            "unset" => {
                for word in words {
                    self.unset_option(word)?;
                }
                Ok(())
            }
            other => Err(format!("unsupported hook verb: {}", other)),
        }
    }

    fn set_option(&mut self, name: &str, value: Option<&str>) -> Result<(), String> {
        match (name, value) {
            ("from", Some(v)) => self.from = Some(v.to_string()),
            ("realname", Some(v)) => self.realname = Some(v.to_string()),
            ("signature", Some(v)) => self.signature = Some(PathBuf::from(v)),
            ("record", Some(v)) => self.record = Some(v.to_string()),
            ("attribution", Some(v)) => self.attribution = v.to_string(),
            ("indent_string", Some(v)) => self.indent_string = v.to_string(),
            ("sendmail", Some(v)) => self.sendmail = v.to_string(),
            ("smtp_url", Some(v)) => self.smtp_url = Some(v.to_string()),
            ("pgp_sign_as", Some(v)) => self.pgp_sign_as = Some(v.to_string()),
            ("smime_default_key", Some(v)) => self.smime_default_key = Some(v.to_string()),
            ("crypt_autosign", None) => self.crypt_autosign = true,
            ("crypt_autoencrypt", None) => self.crypt_autoencrypt = true,
            ("crypt_opportunistic_encrypt", None) => self.crypt_opportunistic_encrypt = true,
            ("sig_dashes", None) => self.sig_dashes = true,
            ("edit_headers", None) => self.edit_headers = true,
            ("fcc_before_send", None) => self.fcc_before_send = true,
            (other, _) => return Err(format!("unknown hook option: {}", other)),
        }
        Ok(())
    }

    fn unset_option(&mut self, name: &str) -> Result<(), String> {
        match name {
            "from" => self.from = None,
            "signature" => self.signature = None,
            "record" => self.record = None,
            "smtp_url" => self.smtp_url = None,
            "crypt_autosign" => self.crypt_autosign = false,
            "crypt_autoencrypt" => self.crypt_autoencrypt = false,
            "crypt_opportunistic_encrypt" => self.crypt_opportunistic_encrypt = false,
            "sig_dashes" => self.sig_dashes = false,
            "edit_headers" => self.edit_headers = false,
            "fcc_before_send" => self.fcc_before_send = false,
            other => return Err(format!("unknown hook option: {}", other)),
        }
        Ok(())
    }
}

/// A saved copy of the session options. Backgrounding captures the
/// compose session's options (`local`), resuming captures the index's
/// current options (`global`) so they can be restored afterwards.
#[derive(Clone, Debug)]
pub struct OptionScope {
    saved: SessionOptions,
}

impl OptionScope {
    pub fn capture(options: &SessionOptions) -> Self {
        OptionScope {
            saved: options.clone(),
        }
    }

    /// Swap the saved options in, returning a scope that restores the
    /// previous state.
    pub fn swap_in(self, options: &mut SessionOptions) -> OptionScope {
        let previous = options.clone();
        *options = self.saved;
        OptionScope { saved: previous }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::modules::settings::cli::Settings;

    fn options() -> SessionOptions {
        SessionOptions::from_settings(&Settings::new_for_test())
    }

    #[test]
    fn hook_assignment_mutates_only_named_options() {
        let mut opts = options();
        opts.apply_assignment("set from=work@example.com crypt_autosign")
            .unwrap();
        assert_eq!(opts.from.as_deref(), Some("work@example.com"));
        assert!(opts.crypt_autosign);
        assert!(opts
            .apply_assignment("set no_such_option=1")
            .is_err());
    }

    #[test]
    fn scope_swap_round_trips() {
        let mut opts = options();
        let outside = OptionScope::capture(&opts);
        opts.from = Some("inside@example.com".into());
        let inside = OptionScope::capture(&opts);

        // Resume: bring the compose-session options back.
        let restore = inside.swap_in(&mut opts);
        assert_eq!(opts.from.as_deref(), Some("inside@example.com"));

        // Finish: put the index options back in place.
        let _ = restore.swap_in(&mut opts);
        assert_eq!(opts.from.as_deref(), Some("inside@example.com"));

        let _ = outside.swap_in(&mut opts);
        assert_eq!(opts.from, None);
    }
}
