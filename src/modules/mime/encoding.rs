// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::fs;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailForgeResult;
use crate::modules::mime::body::{BodyArena, BodyId, MajorType, TransferEncoding};
use crate::raise_error;

const MIME_LINE_MAX: usize = 76;
// RFC 5322 hard limit minus CRLF.
const WIRE_LINE_MAX: usize = 998;

/// What a scan of the raw content found. Drives the choice of the
/// minimal RFC 2045 transfer encoding.
#[derive(Clone, Debug, Default)]
pub struct ContentInfo {
    pub hibin: usize,
    pub lobin: usize,
    pub nulbin: usize,
    pub crlf: usize,
    pub linemax: usize,
    pub space_at_eol: bool,
    pub dot_at_bol: bool,
    pub from_at_bol: bool,
}

impl ContentInfo {
    pub fn is_binary(&self) -> bool {
        self.nulbin > 0 || self.lobin > 0
    }
}

pub fn scan_bytes(data: &[u8]) -> ContentInfo {
    let mut info = ContentInfo::default();
    let mut line_len = 0usize;
    let mut at_bol = true;
    let mut prev: u8 = 0;

    for &byte in data {
        match byte {
            b'\n' => {
                if prev == b'\r' {
                    info.crlf += 1;
                }
                if prev == b' ' || prev == b'\t' {
                    info.space_at_eol = true;
                }
                info.linemax = info.linemax.max(line_len);
                line_len = 0;
                at_bol = true;
                prev = byte;
                continue;
            }
            0 => info.nulbin += 1,
            b'\r' => {}
            b if b < 0x20 && b != b'\t' => info.lobin += 1,
            b if b >= 0x80 => info.hibin += 1,
            _ => {}
        }
        if at_bol {
            if byte == b'.' {
                info.dot_at_bol = true;
            }
            at_bol = false;
        }
        line_len += 1;
        prev = byte;
    }
    if prev == b' ' || prev == b'\t' {
        info.space_at_eol = true;
    }
    info.linemax = info.linemax.max(line_len);
    info.from_at_bol = starts_from_line(data);
    info
}

fn starts_from_line(data: &[u8]) -> bool {
    data.split(|&b| b == b'\n')
        .any(|line| line.starts_with(b"From "))
}

pub fn scan_file(path: &Path) -> MailForgeResult<ContentInfo> {
    let data = fs::read(path).map_err(|e| {
        raise_error!(
            format!("Cannot read {:?}: {}", path, e),
            ErrorCode::FileOpenFailed
        )
    })?;
    Ok(scan_bytes(&data))
}

/// The minimal encoding that makes the content 7bit-safe on the wire.
pub fn choose_encoding(info: &ContentInfo, major: &MajorType) -> TransferEncoding {
    match major {
        MajorType::Text | MajorType::Message => {
            if info.is_binary() {
                // Control bytes in nominal text: quoted-printable keeps
                // it inspectable.
                TransferEncoding::QuotedPrintable
            } else if info.hibin > 0
                || info.linemax > WIRE_LINE_MAX
                || info.space_at_eol
                || info.from_at_bol
            {
                TransferEncoding::QuotedPrintable
            } else {
                TransferEncoding::SevenBit
            }
        }
        _ => {
            if info.hibin > 0 || info.is_binary() || info.linemax > WIRE_LINE_MAX {
                TransferEncoding::Base64
            } else {
                TransferEncoding::SevenBit
            }
        }
    }
}

/// Re-scan a node's content and pick its minimal transfer encoding.
/// Text parts also get their charset parameter refreshed unless the
/// node opted out of conversion.
pub fn update_encoding(arena: &mut BodyArena, id: BodyId) -> MailForgeResult<()> {
    let Some(path) = arena[id].content.file_path().map(|p| p.to_path_buf()) else {
        return Ok(());
    };
    let info = scan_file(&path)?;
    let encoding = choose_encoding(&info, &arena[id].major);
    let node = &mut arena[id];
    node.encoding = encoding;
    if node.major == MajorType::Text && !node.noconv {
        let charset = if info.hibin > 0 { "utf-8" } else { "us-ascii" };
        node.params.set("charset", charset);
    }
    Ok(())
}

/// Force a message/rfc822 subtree to 7bit by re-encoding any nested
/// 8bit or binary leaves.
pub fn message_to_7bit(arena: &mut BodyArena, id: BodyId) -> MailForgeResult<()> {
    for part in arena.subtree(id) {
        let needs = matches!(
            arena[part].encoding,
            TransferEncoding::EightBit | TransferEncoding::Binary
        );
        if !needs {
            continue;
        }
        let encoding = if arena[part].major == MajorType::Text {
            TransferEncoding::QuotedPrintable
        } else {
            TransferEncoding::Base64
        };
        arena[part].encoding = encoding;
    }
    arena[id].encoding = TransferEncoding::SevenBit;
    Ok(())
}

/// Quoted-printable per RFC 2045 §6.7: soft breaks at 76 columns,
/// trailing whitespace encoded, leading dots and `From ` protected for
/// mbox safety.
pub fn quoted_printable_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() + data.len() / 8);
    for raw_line in split_lines(data) {
        let mut col = 0usize;
        let len = raw_line.len();
        for (i, &byte) in raw_line.iter().enumerate() {
            let at_eol = i + 1 == len;
            let literal = matches!(byte, 0x21..=0x7e if byte != b'=')
                || (matches!(byte, b' ' | b'\t') && !at_eol);
            let must_escape = !literal
                || (i == 0 && byte == b'.')
                || (i == 0 && raw_line.starts_with(b"From "));
            let needed = if must_escape { 3 } else { 1 };
            if col + needed > MIME_LINE_MAX - 1 {
                out.push_str("=\n");
                col = 0;
            }
            if must_escape {
                out.push_str(&format!("={:02X}", byte));
                col += 3;
            } else {
                out.push(byte as char);
                col += 1;
            }
        }
        out.push('\n');
    }
    out
}

/// Base64 wrapped at 76 columns.
pub fn base64_encode_wrapped(data: &[u8]) -> String {
    let encoded = STANDARD.encode(data);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / MIME_LINE_MAX + 1);
    for chunk in encoded.as_bytes().chunks(MIME_LINE_MAX) {
        out.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        out.push('\n');
    }
    out
}

/// Encode a leaf's raw content for the wire under its chosen encoding.
pub fn encode_for_wire(data: &[u8], encoding: TransferEncoding) -> Vec<u8> {
    match encoding {
        TransferEncoding::QuotedPrintable => quoted_printable_encode(data).into_bytes(),
        TransferEncoding::Base64 => base64_encode_wrapped(data).into_bytes(),
        _ => data.to_vec(),
    }
}

fn split_lines(data: &[u8]) -> Vec<&[u8]> {
    let mut lines: Vec<&[u8]> = data.split(|&b| b == b'\n').collect();
    // A trailing newline yields one phantom empty line.
    if data.ends_with(b"\n") {
        lines.pop();
    }
    lines
        .into_iter()
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ascii_text_stays_7bit() {
        let info = scan_bytes(b"hello world\nsecond line\n");
        assert_eq!(
            choose_encoding(&info, &MajorType::Text),
            TransferEncoding::SevenBit
        );
    }

    #[test]
    fn eight_bit_text_goes_quoted_printable() {
        let info = scan_bytes("héllo\n".as_bytes());
        assert!(info.hibin > 0);
        assert_eq!(
            choose_encoding(&info, &MajorType::Text),
            TransferEncoding::QuotedPrintable
        );
    }

    #[test]
    fn binary_application_data_goes_base64() {
        let info = scan_bytes(&[0u8, 1, 2, 255, 10]);
        assert_eq!(
            choose_encoding(&info, &MajorType::Application),
            TransferEncoding::Base64
        );
    }

    #[test]
    fn trailing_space_forces_qp() {
        let info = scan_bytes(b"line with trailing space \nplain\n");
        assert!(info.space_at_eol);
        assert_eq!(
            choose_encoding(&info, &MajorType::Text),
            TransferEncoding::QuotedPrintable
        );
    }

    #[test]
    fn qp_escapes_equals_and_high_bytes() {
        let encoded = quoted_printable_encode("a=b é\n".as_bytes());
        assert_eq!(encoded, "a=3Db =C3=A9\n");
    }

    #[test]
    fn qp_protects_leading_dot_and_from() {
        let encoded = quoted_printable_encode(b".hidden\nFrom here\n");
        assert!(encoded.starts_with("=2Ehidden\n"));
        assert!(encoded.contains("=46rom here\n"));
    }

    #[test]
    fn qp_soft_breaks_long_lines() {
        let long = "x".repeat(200);
        let encoded = quoted_printable_encode(long.as_bytes());
        for line in encoded.lines() {
            assert!(line.len() <= MIME_LINE_MAX);
        }
        let decoded: String = encoded.replace("=\n", "").trim_end().to_string();
        assert_eq!(decoded, long);
    }

    #[test]
    fn base64_wraps_at_76() {
        let data = vec![0xAAu8; 300];
        let encoded = base64_encode_wrapped(&data);
        for line in encoded.lines() {
            assert!(line.len() <= MIME_LINE_MAX);
        }
    }
}
