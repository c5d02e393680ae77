// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use serde::{Deserialize, Serialize};

/// Error codes partitioned by failure family. The thousands digit
/// selects the family; the pipeline keys its recovery policy off
/// `ErrorCode::kind`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ErrorCode {
    // Malformed input (10000–10999)
    InvalidParameter = 10000,
    InvalidAddress = 10010,
    InvalidIdn = 10020,
    InvalidHeader = 10030,
    InvalidMessageId = 10040,
    BadBoundary = 10050,
    BadSignedStructure = 10060,
    MessageParseFailed = 10070,
    MailcapParseFailed = 10080,
    TemplateSyntax = 10090,

    // User cancellation (20000–20999)
    UserAborted = 20000,
    NoRecipients = 20010,
    EmptySubjectAbort = 20020,
    UnmodifiedAbort = 20030,
    MissingAttachmentAbort = 20040,

    // Key resolution (30000–30999)
    RecipientKeyMissing = 30000,
    KeyNotTrusted = 30010,
    KeySelectionDeclined = 30020,

    // Missing capability (40000–40999)
    CryptoBackendUnavailable = 40000,
    CommandNotConfigured = 40010,
    MailcapEntryMissing = 40020,

    // Filesystem (50000–50999)
    FileOpenFailed = 50000,
    FileRenameFailed = 50010,
    FileUnlinkFailed = 50020,
    TempFileFailed = 50030,
    MailboxOpenFailed = 50040,

    // Subprocess (60000–60999)
    EditorFailed = 60000,
    CryptoCommandFailed = 60010,
    SendmailFailed = 60020,
    SmtpCommandFailed = 60030,
    SmtpConnectionFailed = 60040,
    FilterFailed = 60050,

    // Retryable (70000–70999)
    FccWriteFailed = 70000,
    PostponeWriteFailed = 70010,

    // Invariant violations (80000–80999)
    InternalError = 80000,
    BodyTreeCorrupt = 80010,
}

/// The §-level failure family an individual code belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    InputInvalid,
    UserAborted,
    RecipientUnresolved,
    Unavailable,
    Filesystem,
    Subprocess,
    Transient,
    Fatal,
}

impl ErrorCode {
    pub fn kind(&self) -> ErrorKind {
        match (*self as u32) / 10000 {
            1 => ErrorKind::InputInvalid,
            2 => ErrorKind::UserAborted,
            3 => ErrorKind::RecipientUnresolved,
            4 => ErrorKind::Unavailable,
            5 => ErrorKind::Filesystem,
            6 => ErrorKind::Subprocess,
            7 => ErrorKind::Transient,
            _ => ErrorKind::Fatal,
        }
    }

    /// Retry is meaningful only for the transient family.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kinds_partition_by_range() {
        assert_eq!(ErrorCode::InvalidIdn.kind(), ErrorKind::InputInvalid);
        assert_eq!(ErrorCode::UserAborted.kind(), ErrorKind::UserAborted);
        assert_eq!(
            ErrorCode::RecipientKeyMissing.kind(),
            ErrorKind::RecipientUnresolved
        );
        assert_eq!(
            ErrorCode::CryptoBackendUnavailable.kind(),
            ErrorKind::Unavailable
        );
        assert_eq!(ErrorCode::FileOpenFailed.kind(), ErrorKind::Filesystem);
        assert_eq!(ErrorCode::SendmailFailed.kind(), ErrorKind::Subprocess);
        assert!(ErrorCode::FccWriteFailed.is_transient());
        assert_eq!(ErrorCode::BodyTreeCorrupt.kind(), ErrorKind::Fatal);
    }
}
