// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailForgeResult;
use crate::modules::utils::shell_quote;
use crate::raise_error;

/// Which command field of a mailcap entry is wanted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MailcapField {
    View,
    Edit,
    Compose,
    Print,
}

impl MailcapField {
    fn key(&self) -> Option<&'static str> {
        match self {
            MailcapField::View => None,
            MailcapField::Edit => Some("edit"),
            MailcapField::Compose => Some("compose"),
            MailcapField::Print => Some("print"),
        }
    }
}

/// One parsed mailcap entry for a content-type.
#[derive(Clone, Debug, Default)]
pub struct MailcapEntry {
    pub command: String,
    pub testcommand: Option<String>,
    pub nametemplate: Option<String>,
    pub needsterminal: bool,
    pub copiousoutput: bool,
}

impl MailcapEntry {
    /// Substitute `%s` with the (quoted) filename and `%t` with the
    /// content-type, yielding a shell-ready command line.
    pub fn expand_command(&self, filename: &str, content_type: &str) -> String {
        expand_percent(&self.command, filename, content_type)
    }

    /// Apply the nametemplate (`%s` placeholder) to pick the filename
    /// the handler expects, e.g. `%s.html`.
    pub fn template_filename(&self, basename: &str) -> Option<String> {
        self.nametemplate
            .as_ref()
            .map(|t| t.replace("%s", basename))
    }
}

fn expand_percent(command: &str, filename: &str, content_type: &str) -> String {
    let mut out = String::with_capacity(command.len() + filename.len());
    let mut chars = command.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => out.push_str(&shell_quote(filename)),
            Some('t') => out.push_str(&shell_quote(content_type)),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

/// The standard search path, overridable through settings.
pub fn default_search_path() -> Vec<PathBuf> {
    let mut path = Vec::new();
    if let Ok(home) = std::env::var("HOME") {
        path.push(PathBuf::from(home).join(".mailcap"));
    }
    path.push(PathBuf::from("/etc/mailcap"));
    path.push(PathBuf::from("/usr/share/etc/mailcap"));
    path.push(PathBuf::from("/usr/local/etc/mailcap"));
    path
}

pub fn search_path(configured: &str) -> Vec<PathBuf> {
    if configured.is_empty() {
        default_search_path()
    } else {
        configured.split(':').map(PathBuf::from).collect()
    }
}

/// Look a content-type up across the search path, returning the first
/// entry that provides the requested field. `video/mpeg` matches both
/// a literal `video/mpeg` entry and a `video/*` wildcard.
pub fn lookup(
    path: &[PathBuf],
    content_type: &str,
    field: MailcapField,
) -> MailForgeResult<MailcapEntry> {
    for file in path {
        if !file.exists() {
            continue;
        }
        match parse_file(file, content_type, field) {
            Ok(Some(entry)) => return Ok(entry),
            Ok(None) => continue,
            Err(e) => debug!("Skipping mailcap file {:?}: {}", file, e),
        }
    }
    Err(raise_error!(
        format!(
            "No mailcap {:?} entry for {}",
            field, content_type
        ),
        ErrorCode::MailcapEntryMissing
    ))
}

fn parse_file(
    file: &Path,
    content_type: &str,
    field: MailcapField,
) -> MailForgeResult<Option<MailcapEntry>> {
    let data = fs::read_to_string(file).map_err(|e| {
        raise_error!(
            format!("Cannot read {:?}: {}", file, e),
            ErrorCode::FileOpenFailed
        )
    })?;
    for logical in logical_lines(&data) {
        let line = logical.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(entry) = parse_entry(line, content_type, field)? {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}

/// Join backslash-continued lines.
fn logical_lines(data: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for line in data.lines() {
        if let Some(stripped) = line.strip_suffix('\\') {
            current.push_str(stripped);
        } else {
            current.push_str(line);
            out.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn type_matches(pattern: &str, content_type: &str) -> bool {
    let pattern = pattern.trim().to_ascii_lowercase();
    let content_type = content_type.to_ascii_lowercase();
    if pattern == content_type {
        return true;
    }
    if let Some(major) = pattern.strip_suffix("/*") {
        return content_type
            .split_once('/')
            .is_some_and(|(m, _)| m == major);
    }
    // A bare major type matches every subtype.
    !pattern.contains('/') && content_type.split_once('/').is_some_and(|(m, _)| m == pattern)
}

fn parse_entry(
    line: &str,
    content_type: &str,
    field: MailcapField,
) -> MailForgeResult<Option<MailcapEntry>> {
    let fields = split_semicolons(line);
    let mut iter = fields.iter();
    let Some(type_field) = iter.next() else {
        return Ok(None);
    };
    if !type_matches(type_field, content_type) {
        return Ok(None);
    }
    let view_command = iter.next().cloned().unwrap_or_default();

    let mut entry = MailcapEntry {
        command: view_command.trim().to_string(),
        ..Default::default()
    };
    let mut field_command = None;
    for option in iter {
        let option = option.trim();
        match option.split_once('=') {
            Some((key, value)) => {
                let key = key.trim().to_ascii_lowercase();
                let value = value.trim();
                if Some(key.as_str()) == field.key() {
                    field_command = Some(value.to_string());
                } else if key == "test" {
                    entry.testcommand = Some(value.to_string());
                } else if key == "nametemplate" {
                    entry.nametemplate = Some(value.to_string());
                }
            }
            None => match option.to_ascii_lowercase().as_str() {
                "needsterminal" => entry.needsterminal = true,
                "copiousoutput" => entry.copiousoutput = true,
                _ => {}
            },
        }
    }
    match field {
        MailcapField::View => {
            if entry.command.is_empty() {
                return Ok(None);
            }
        }
        _ => match field_command {
            Some(command) => entry.command = command,
            None => return Ok(None),
        },
    }
    Ok(Some(entry))
}

/// Split on `;` honoring `\;` escapes.
fn split_semicolons(line: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    if escaped != ';' {
                        current.push('\\');
                    }
                    current.push(escaped);
                }
            }
            ';' => out.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    out.push(current);
    out
}

/// Run the entry's test clause; an entry without one always applies.
pub async fn test_passes(entry: &MailcapEntry, filename: &str, content_type: &str) -> bool {
    let Some(test) = &entry.testcommand else {
        return true;
    };
    let command = expand_percent(test, filename, content_type);
    match tokio::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(&command)
        .status()
        .await
    {
        Ok(status) => status.success(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn mailcap_file(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn finds_edit_command_with_wildcard() {
        let f = mailcap_file(
            "text/html; lynx %s; edit=emacs %s; nametemplate=%s.html\n\
             image/*; display %s\n",
        );
        let path = vec![f.path().to_path_buf()];
        let entry = lookup(&path, "text/html", MailcapField::Edit).unwrap();
        assert_eq!(entry.command, "emacs %s");
        assert_eq!(
            entry.template_filename("draft"),
            Some("draft.html".to_string())
        );

        let image = lookup(&path, "image/png", MailcapField::View).unwrap();
        assert_eq!(image.command, "display %s");
    }

    #[test]
    fn missing_field_is_an_unavailable_error() {
        let f = mailcap_file("text/html; lynx %s\n");
        let path = vec![f.path().to_path_buf()];
        let err = lookup(&path, "text/html", MailcapField::Compose).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MailcapEntryMissing);
    }

    #[test]
    fn command_expansion_quotes_filename() {
        let entry = MailcapEntry {
            command: "cat %s".to_string(),
            ..Default::default()
        };
        assert_eq!(
            entry.expand_command("/tmp/a b.txt", "text/plain"),
            "cat '/tmp/a b.txt'"
        );
    }

    #[test]
    fn continuation_lines_join() {
        let f = mailcap_file("text/plain; \\\n  cat %s; needsterminal\n");
        let path = vec![f.path().to_path_buf()];
        let entry = lookup(&path, "text/plain", MailcapField::View).unwrap();
        assert!(entry.needsterminal);
        assert_eq!(entry.command, "cat %s");
    }
}
