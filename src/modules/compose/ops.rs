// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::io::{BufRead, Write};

use crate::modules::compose::{ComposeOp, OpSource};

const HELP: &str = "\
compose commands:
  t  edit To          c  edit Cc         b  edit Bcc
  F  edit From        r  edit Reply-To   s  edit Subject
  f  edit Fcc         e  edit message    E  edit with headers
  a  attach file      M  attach message  K  attach key
  d N  delete attachment N     - N / + N  move attachment up/down
  T N  edit type      C N  edit encoding        D N  toggle disposition
  U N  toggle unlink  R N  rename display name  N N  rename file
  8 N  re-scan encoding
  S  toggle sign      x  toggle encrypt  i  toggle inline armor
  1  use PGP          2  use S/MIME      o  toggle autocrypt
  k  sign-as key      0  clear security
  y  send             P  postpone        q  abort     Z  background
  ?  this help";

/// Terminal command reader: one single-key command (plus an attachment
/// number where needed) per line. EOF aborts the session.
pub struct StdOpSource;

impl StdOpSource {
    fn read_line(&self) -> Option<String> {
        eprint!("compose> ");
        let _ = std::io::stderr().flush();
        let mut line = String::new();
        match std::io::stdin().lock().read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => Some(line.trim().to_string()),
            Err(_) => None,
        }
    }

    fn parse(line: &str) -> Option<ComposeOp> {
        let mut parts = line.split_whitespace();
        let key = parts.next()?;
        let index = parts
            .next()
            .and_then(|n| n.parse::<usize>().ok())
            .map(|n| n.saturating_sub(1))
            .unwrap_or(0);
        let op = match key {
            "t" => ComposeOp::EditTo,
            "c" => ComposeOp::EditCc,
            "b" => ComposeOp::EditBcc,
            "F" => ComposeOp::EditFrom,
            "r" => ComposeOp::EditReplyTo,
            "s" => ComposeOp::EditSubject,
            "f" => ComposeOp::EditFcc,
            "e" => ComposeOp::EditMessage,
            "E" => ComposeOp::EditHeaders,
            "a" => ComposeOp::AttachFile,
            "M" => ComposeOp::AttachMessage,
            "K" => ComposeOp::AttachKey,
            "d" => ComposeOp::Detach(index),
            "-" => ComposeOp::MoveUp(index),
            "+" => ComposeOp::MoveDown(index),
            "T" => ComposeOp::EditType(index),
            "C" => ComposeOp::EditEncoding(index),
            "D" => ComposeOp::ToggleDisposition(index),
            "U" => ComposeOp::ToggleUnlink(index),
            "8" => ComposeOp::UpdateEncoding(index),
            "R" => ComposeOp::RenameAttachment(index),
            "N" => ComposeOp::RenameFile(index),
            "S" => ComposeOp::ToggleSign,
            "x" => ComposeOp::ToggleEncrypt,
            "i" => ComposeOp::ToggleInline,
            "1" => ComposeOp::UsePgp,
            "2" => ComposeOp::UseSmime,
            "o" => ComposeOp::ToggleAutocrypt,
            "k" => ComposeOp::SignAs,
            "0" => ComposeOp::ClearSecurity,
            "y" => ComposeOp::Send,
            "P" => ComposeOp::Postpone,
            "q" => ComposeOp::Abort,
            "Z" => ComposeOp::Background,
            _ => return None,
        };
        Some(op)
    }
}

impl OpSource for StdOpSource {
    fn next_op(&mut self) -> ComposeOp {
        loop {
            let Some(line) = self.read_line() else {
                return ComposeOp::Abort;
            };
            if line.is_empty() {
                continue;
            }
            if line == "?" {
                eprintln!("{}", HELP);
                continue;
            }
            match Self::parse(&line) {
                Some(op) => return op,
                None => eprintln!("Unknown command {:?} ('?' for help)", line),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn keys_map_to_ops() {
        assert_eq!(StdOpSource::parse("y"), Some(ComposeOp::Send));
        assert_eq!(StdOpSource::parse("d 3"), Some(ComposeOp::Detach(2)));
        assert_eq!(StdOpSource::parse("+ 1"), Some(ComposeOp::MoveDown(0)));
        assert_eq!(StdOpSource::parse("zz"), None);
    }
}
