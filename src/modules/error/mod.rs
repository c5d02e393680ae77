// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use code::{ErrorCode, ErrorKind};
use snafu::{Location, Snafu};

pub mod code;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MailForgeError {
    #[snafu(display("{message}"))]
    Generic {
        message: String,
        #[snafu(implicit)]
        location: Location,
        code: ErrorCode,
    },
}

pub type MailForgeResult<T, E = MailForgeError> = std::result::Result<T, E>;

impl MailForgeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            MailForgeError::Generic { code, .. } => *code,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.code().kind()
    }

    /// The process exit status for this failure: 2 for a user abort,
    /// 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::UserAborted => 2,
            _ => 1,
        }
    }

    /// One-line form shown at the prompt; the full subprocess stderr
    /// stays available through the message itself.
    pub fn oneline(&self) -> String {
        match self {
            MailForgeError::Generic { message, .. } => {
                match message.split_once('\n') {
                    Some((first, _)) => first.to_string(),
                    None => message.clone(),
                }
            }
        }
    }
}

impl From<std::io::Error> for MailForgeError {
    fn from(e: std::io::Error) -> Self {
        crate::raise_error!(format!("I/O error: {}", e), ErrorCode::FileOpenFailed)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::raise_error;

    #[test]
    fn exit_codes_follow_kind() {
        let aborted = raise_error!("cancelled".into(), ErrorCode::UserAborted);
        assert_eq!(aborted.exit_code(), 2);
        let failed = raise_error!("smtp down".into(), ErrorCode::SmtpConnectionFailed);
        assert_eq!(failed.exit_code(), 1);
    }

    #[test]
    fn oneline_truncates_stderr_dump() {
        let e = raise_error!(
            "sendmail exited with 1\nlong stderr line\nmore".into(),
            ErrorCode::SendmailFailed
        );
        assert_eq!(e.oneline(), "sendmail exited with 1");
    }
}
