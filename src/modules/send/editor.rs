// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::path::Path;

use tracing::debug;

use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailForgeResult;
use crate::modules::utils::shell_quote;
use crate::raise_error;

/// The file's mtime in epoch milliseconds; 0 for a missing file. The
/// pipeline compares stamps around editor runs to detect an untouched
/// draft.
pub fn file_mtime(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Run the editor on the draft in the foreground through the shell,
/// inheriting the terminal, and wait for it.
pub async fn edit_foreground(editor: &str, path: &Path) -> MailForgeResult<()> {
    let command = format!("{} {}", editor, shell_quote(&path.to_string_lossy()));
    debug!("Starting editor: {}", command);
    let status = tokio::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(&command)
        .status()
        .await
        .map_err(|e| {
            raise_error!(
                format!("Cannot start editor {:?}: {}", editor, e),
                ErrorCode::EditorFailed
            )
        })?;
    if !status.success() {
        return Err(raise_error!(
            format!(
                "Editor {:?} exited with {}",
                editor,
                status.code().unwrap_or(-1)
            ),
            ErrorCode::EditorFailed
        ));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn editor_modification_is_visible_in_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("draft.eml");
        fs::write(&path, b"before\n").unwrap();
        let before = file_mtime(&path);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        edit_foreground("sh -c 'echo after >>' ", &path).await.unwrap_err();
        // A failing editor leaves the draft untouched.
        assert_eq!(file_mtime(&path), before);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        edit_foreground("touch", &path).await.unwrap();
        assert!(file_mtime(&path) >= before);
    }
}
