// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::modules::common::prompt::Prompter;
use crate::modules::error::MailForgeResult;
use crate::modules::mailbox::{MailStore, MboxStore};
use crate::modules::settings::scope::SessionOptions;

/// Split a multi-target Fcc value. An empty delimiter means the whole
/// value is one target.
pub fn split_targets(fcc: &str, delimiter: &str) -> Vec<String> {
    if fcc.trim().is_empty() {
        return Vec::new();
    }
    if delimiter.is_empty() {
        return vec![fcc.trim().to_string()];
    }
    fcc.split(delimiter)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Expand folder shortcuts: `~` for the home directory, `=`/`+` for
/// the mail folder, `$VAR` environment references. Everything else is
/// taken literally.
pub fn expand_target(target: &str, options: &SessionOptions) -> PathBuf {
    if let Some(rest) = target.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    if let Some(rest) = target.strip_prefix('=').or_else(|| target.strip_prefix('+')) {
        return options.folder.join(rest);
    }
    if let Some(name) = target.strip_prefix('$') {
        if let Ok(value) = std::env::var(name) {
            return PathBuf::from(value);
        }
    }
    PathBuf::from(target)
}

/// Write the rendered message to every Fcc target independently. A
/// transient failure on one target loops through the retry menu in
/// interactive mode; in batch mode it is fatal only when the Fcc runs
/// before the send.
pub fn write_fcc(
    message_lf: &[u8],
    envelope_from: &str,
    fcc: &str,
    options: &SessionOptions,
    prompter: &mut dyn Prompter,
    batch: bool,
    before_send: bool,
) -> MailForgeResult<()> {
    let targets = split_targets(fcc, &options.fcc_delimiter);
    let mut first_error = None;
    for target in targets {
        let mut path = expand_target(&target, options);
        loop {
            let store = MboxStore::new(path.clone());
            match store.append(message_lf, envelope_from) {
                Ok(()) => {
                    info!("Fcc written to {:?}", store.path());
                    break;
                }
                Err(e) if batch => {
                    warn!("Fcc to {:?} failed: {}", path, e.oneline());
                    if before_send {
                        return Err(e);
                    }
                    first_error.get_or_insert(e);
                    break;
                }
                Err(e) => {
                    let picked = prompter.ask_choice(
                        &format!("Saving to {:?} failed: {}", path, e.oneline()),
                        &["retry", "alternate mailbox", "skip"],
                    );
                    match picked {
                        Some(0) => continue,
                        Some(1) => {
                            match prompter
                                .ask_string("Save copy to", &path.to_string_lossy())
                            {
                                Some(alternate) if !alternate.trim().is_empty() => {
                                    path = expand_target(alternate.trim(), options);
                                    continue;
                                }
                                _ => break,
                            }
                        }
                        _ => break,
                    }
                }
            }
        }
    }
    // An after-send Fcc failure in batch mode is reported but does not
    // undo a completed delivery.
    if let Some(e) = first_error {
        warn!("Message sent, but saving a copy failed: {}", e.oneline());
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::modules::common::prompt::{BatchPrompter, ScriptedPrompter};
    use crate::modules::settings::cli::Settings;

    fn options() -> SessionOptions {
        SessionOptions::from_settings(&Settings::new_for_test())
    }

    const RAW: &[u8] = b"Message-ID: <f@example.com>\nSubject: x\n\nbody\n";

    #[test]
    fn empty_delimiter_keeps_commas_in_one_target() {
        assert_eq!(split_targets("a,b", ""), vec!["a,b"]);
        assert_eq!(split_targets("a, b", ","), vec!["a", "b"]);
        assert!(split_targets("  ", ",").is_empty());
    }

    #[test]
    fn folder_prefix_expands_under_folder() {
        let mut opts = options();
        opts.folder = PathBuf::from("/mail");
        assert_eq!(expand_target("=sent", &opts), PathBuf::from("/mail/sent"));
        assert_eq!(expand_target("+sent", &opts), PathBuf::from("/mail/sent"));
        assert_eq!(expand_target("/abs/box", &opts), PathBuf::from("/abs/box"));
    }

    #[test]
    fn multi_target_failures_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good");
        let bad = dir.path().join("no-such-dir").join("x").join("box");
        let mut opts = options();
        opts.fcc_delimiter = ",".to_string();
        let fcc = format!("{},{}", bad.display(), good.display());

        let mut prompter = BatchPrompter;
        // batch, after-send: the bad target is reported, the good one
        // still gets its record.
        write_fcc(RAW, "me@example.com", &fcc, &opts, &mut prompter, true, false).unwrap();
        let store = MboxStore::new(&good);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn alternate_choice_writes_to_new_path_only() {
        let dir = tempfile::tempdir().unwrap();
        let unwritable = dir.path().join("missing-parent").join("deep").join("box");
        let alternate = dir.path().join("alternate-box");

        let mut prompter = ScriptedPrompter::new()
            .answer_choice(Some(1))
            .answer_string(Some(&alternate.to_string_lossy()));
        let opts = options();
        write_fcc(
            RAW,
            "me@example.com",
            &unwritable.to_string_lossy(),
            &opts,
            &mut prompter,
            false,
            true,
        )
        .unwrap();
        assert_eq!(MboxStore::new(&alternate).count().unwrap(), 1);
        assert!(!unwritable.exists());
    }

    #[test]
    fn batch_before_send_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("gone").join("deeper").join("box");
        let mut prompter = BatchPrompter;
        let err = write_fcc(
            RAW,
            "me@example.com",
            &bad.to_string_lossy(),
            &options(),
            &mut prompter,
            true,
            true,
        );
        assert!(err.is_err());
    }
}
