// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::path::Path;
use std::process::Stdio;

use dashmap::DashMap;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailForgeResult;
use crate::modules::send::SendContext;
use crate::modules::settings::scope::OptionScope;
use crate::modules::utils::shell_quote;
use crate::raise_error;

/// Holds suspended send sessions while their editor child runs.
/// Ownership of the SCTX transfers here on suspend and returns to the
/// caller on reap; the reap channel is the wake-up signal the index
/// loop listens on.
pub struct BackgroundRegistry {
    sessions: DashMap<u32, SendContext>,
    events: UnboundedSender<u32>,
}

impl BackgroundRegistry {
    pub fn new() -> (Self, UnboundedReceiver<u32>) {
        let (events, receiver) = unbounded_channel();
        (
            BackgroundRegistry {
                sessions: DashMap::new(),
                events,
            },
            receiver,
        )
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Fork the editor detached and park the session. The SCTX's
    /// `cur` snapshot is dropped here: positions may be invalid by the
    /// time the session resumes, and the replied-flag phase works by
    /// message-id.
    pub async fn launch(
        &self,
        mut sctx: SendContext,
        editor: &str,
        draft: &Path,
    ) -> MailForgeResult<u32> {
        let command = format!("{} {}", editor, shell_quote(&draft.to_string_lossy()));
        debug!("Backgrounding editor: {}", command);
        let mut child = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|e| {
                raise_error!(
                    format!("Cannot background editor {:?}: {}", editor, e),
                    ErrorCode::EditorFailed
                )
            })?;
        let pid = child.id().ok_or_else(|| {
            raise_error!(
                "Backgrounded editor has no pid".into(),
                ErrorCode::EditorFailed
            )
        })?;

        sctx.local_scope = Some(OptionScope::capture(&sctx.options));
        sctx.cur = None;
        sctx.is_backgrounded = true;
        sctx.background_pid = Some(pid);
        self.sessions.insert(pid, sctx);

        let events = self.events.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!("Background editor {} exited with {:?}", pid, status),
                Err(e) => warn!("Reaping background editor {} failed: {}", pid, e),
            }
            let _ = events.send(pid);
        });
        Ok(pid)
    }

    /// Take a reaped session back. Returns None for an unknown pid
    /// (already reaped, or killed before registration completed).
    pub fn reap(&self, pid: u32) -> Option<SendContext> {
        let (_, mut sctx) = self.sessions.remove(&pid)?;
        sctx.is_backgrounded = false;
        sctx.background_pid = None;
        Some(sctx)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::modules::send::{editor::file_mtime, SendContext};
    use crate::modules::settings::cli::Settings;
    use crate::modules::settings::scope::SessionOptions;
    use std::fs;

    fn sctx() -> SendContext {
        let mut options = SessionOptions::from_settings(&Settings::new_for_test());
        options.tmpdir = std::env::temp_dir();
        SendContext::new(0, options).unwrap()
    }

    #[tokio::test]
    async fn background_edit_suspends_and_resumes() {
        let (registry, mut events) = BackgroundRegistry::new();
        let mut session = sctx();
        session.write_draft_text("before\n").unwrap();
        let draft = session.tempfile.clone();
        let before = file_mtime(&draft);
        session.cur_message_id = Some("<orig@example.com>".to_string());

        let pid = registry
            .launch(
                session,
                "sh -c 'sleep 0.05; echo edited >> \"$0\"'",
                &draft,
            )
            .await
            .unwrap();
        assert_eq!(registry.len(), 1);

        let reaped_pid = events.recv().await.unwrap();
        assert_eq!(reaped_pid, pid);
        let resumed = registry.reap(pid).unwrap();
        assert!(registry.is_empty());
        assert!(!resumed.is_backgrounded);
        // The snapshot was dropped; resolution is by message-id.
        assert!(resumed.cur.is_none());
        assert_eq!(
            resumed.cur_message_id.as_deref(),
            Some("<orig@example.com>")
        );
        assert!(resumed.local_scope.is_some());

        let text = fs::read_to_string(&draft).unwrap();
        assert!(text.contains("edited"));
        assert!(file_mtime(&draft) >= before);
    }

    #[tokio::test]
    async fn unknown_pid_reap_is_none() {
        let (registry, _events) = BackgroundRegistry::new();
        assert!(registry.reap(4242).is_none());
    }
}
