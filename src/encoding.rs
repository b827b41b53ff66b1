//! Byte-order-mark based encoding detection for text members.
//!
//! Only a leading BOM is inspected. Anything without one is treated as
//! UTF-8, which EPUB requires of its XHTML, NCX and OPF documents.

use encoding_rs::{UTF_8, UTF_16BE, UTF_16LE};

/// UTF-8 BOM: EF BB BF
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
/// UTF-16 LE BOM: FF FE
const UTF16_LE_BOM: &[u8] = &[0xFF, 0xFE];
/// UTF-16 BE BOM: FE FF
const UTF16_BE_BOM: &[u8] = &[0xFE, 0xFF];

/// Encoding of a text member, as declared by its BOM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Utf16Le,
    Utf16Be,
}

impl TextEncoding {
    pub fn is_utf16(self) -> bool {
        matches!(self, TextEncoding::Utf16Le | TextEncoding::Utf16Be)
    }

    fn bom_len(self) -> usize {
        match self {
            TextEncoding::Utf8 => UTF8_BOM.len(),
            TextEncoding::Utf16Le | TextEncoding::Utf16Be => 2,
        }
    }
}

impl std::fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TextEncoding::Utf8 => write!(f, "UTF-8"),
            TextEncoding::Utf16Le => write!(f, "UTF-16LE"),
            TextEncoding::Utf16Be => write!(f, "UTF-16BE"),
        }
    }
}

/// Detect the encoding of a buffer from its byte-order mark.
///
/// `FE FF` decodes as genuine big-endian UTF-16. Buffers without a
/// recognised BOM, including empty ones, are UTF-8.
pub fn detect(bytes: &[u8]) -> TextEncoding {
    if bytes.starts_with(UTF8_BOM) {
        TextEncoding::Utf8
    } else if bytes.starts_with(UTF16_LE_BOM) {
        TextEncoding::Utf16Le
    } else if bytes.starts_with(UTF16_BE_BOM) {
        TextEncoding::Utf16Be
    } else {
        TextEncoding::Utf8
    }
}

/// Text decoded from a member, remembering how it was stored.
#[derive(Debug, Clone)]
pub struct DecodedText {
    pub text: String,
    pub encoding: TextEncoding,
    pub had_bom: bool,
}

/// Decode `bytes` as `encoding`, dropping a matching BOM.
///
/// Malformed sequences become U+FFFD rather than failing the conversion.
pub fn decode(bytes: &[u8], encoding: TextEncoding) -> DecodedText {
    let had_bom = match encoding {
        TextEncoding::Utf8 => bytes.starts_with(UTF8_BOM),
        TextEncoding::Utf16Le => bytes.starts_with(UTF16_LE_BOM),
        TextEncoding::Utf16Be => bytes.starts_with(UTF16_BE_BOM),
    };
    let body = if had_bom {
        &bytes[encoding.bom_len()..]
    } else {
        bytes
    };

    let (text, had_errors) = match encoding {
        TextEncoding::Utf8 => UTF_8.decode_without_bom_handling(body),
        TextEncoding::Utf16Le => UTF_16LE.decode_without_bom_handling(body),
        TextEncoding::Utf16Be => UTF_16BE.decode_without_bom_handling(body),
    };
    if had_errors {
        tracing::debug!(%encoding, "malformed sequences replaced while decoding");
    }

    DecodedText {
        text: text.into_owned(),
        encoding,
        had_bom,
    }
}

impl DecodedText {
    /// Encode `text` (this member's content after conversion) as UTF-8.
    ///
    /// A UTF-8 BOM is written only when the source had a BOM. For UTF-16
    /// sources the XML declaration is updated to name UTF-8.
    pub fn reencode(&self, text: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(text.len() + UTF8_BOM.len());
        if self.had_bom {
            out.extend_from_slice(UTF8_BOM);
        }
        if self.encoding.is_utf16() {
            out.extend_from_slice(rewrite_declared_encoding(text).as_bytes());
        } else {
            out.extend_from_slice(text.as_bytes());
        }
        out
    }
}

/// Replace a UTF-16 `encoding` pseudo-attribute in a leading XML declaration
/// with `UTF-8`. Text without such a declaration is returned unchanged.
fn rewrite_declared_encoding(text: &str) -> std::borrow::Cow<'_, str> {
    use std::borrow::Cow;

    if !text.starts_with("<?xml") {
        return Cow::Borrowed(text);
    }
    let Some(decl_end) = text.find("?>") else {
        return Cow::Borrowed(text);
    };
    let decl = &text[..decl_end];
    let Some(attr) = decl.find("encoding") else {
        return Cow::Borrowed(text);
    };

    let after = &decl[attr + "encoding".len()..];
    let Some(eq) = after.find('=') else {
        return Cow::Borrowed(text);
    };
    if !after[..eq].trim().is_empty() {
        return Cow::Borrowed(text);
    }
    let value_part = after[eq + 1..].trim_start();
    let Some(quote) = value_part.chars().next().filter(|c| *c == '"' || *c == '\'') else {
        return Cow::Borrowed(text);
    };
    let Some(close) = value_part[1..].find(quote) else {
        return Cow::Borrowed(text);
    };
    let value = &value_part[1..1 + close];
    if !value.to_ascii_lowercase().starts_with("utf-16") {
        return Cow::Borrowed(text);
    }

    // Byte offset of the value inside `text`.
    let value_start = decl.len() - value_part.len() + 1;
    let value_end = value_start + value.len();
    let mut rewritten = String::with_capacity(text.len());
    rewritten.push_str(&text[..value_start]);
    rewritten.push_str("UTF-8");
    rewritten.push_str(&text[value_end..]);
    Cow::Owned(rewritten)
}
