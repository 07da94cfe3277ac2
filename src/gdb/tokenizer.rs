//! Tokenizer for GDB-printed text
//!
//! GDB prints values in an ad hoc C-like syntax: braces for aggregates,
//! quoted strings with C escapes, char literals, template arguments in angle
//! brackets, array indices and function-pointer casts. The tokenizer splits a
//! fragment of that text into delimiters (`=`, `,`, `{`, `}`) and string-ish
//! tokens, treating everything inside an open quote, char literal or bracket
//! region as opaque.

use crate::gdb::error::ParseError;

/// Token kinds produced by [`next_token`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    OpenBrace,
    CloseBrace,
    Equal,
    Comma,
    /// Quoted string or bare run of text
    String,
}

/// A token as a byte span into the scanned text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub start: usize,
    pub end: usize,
    pub kind: TokenKind,
}

impl Token {
    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        &source[self.start..self.end]
    }

    pub fn is_quoted(&self, source: &str) -> bool {
        source.as_bytes().get(self.start) == Some(&b'"')
    }
}

/// Scan the next token starting at `pos`.
///
/// Returns the token together with the offset at which scanning should resume,
/// or `Ok(None)` once only whitespace remains. The only failure is a quoted
/// string that never closes.
pub fn next_token(text: &str, pos: usize) -> Result<Option<(Token, usize)>, ParseError> {
    let bytes = text.as_bytes();
    let start = skip_whitespace(bytes, pos);
    let Some(&first) = bytes.get(start) else {
        return Ok(None);
    };

    let single = |kind| {
        Ok(Some((
            Token {
                start,
                end: start + 1,
                kind,
            },
            start + 1,
        )))
    };

    match first {
        b'=' => single(TokenKind::Equal),
        b',' => single(TokenKind::Comma),
        b'{' => single(TokenKind::OpenBrace),
        b'}' => single(TokenKind::CloseBrace),
        b'"' => {
            let mut end = scan_quoted(text, start)?;
            // GDB marks truncated strings with a trailing "..."
            while bytes.get(end) == Some(&b'.') {
                end += 1;
            }
            Ok(Some((
                Token {
                    start,
                    end,
                    kind: TokenKind::String,
                },
                end,
            )))
        }
        _ => {
            let next = scan_bare(text, start)?;
            let mut end = next;
            while end > start && bytes[end - 1].is_ascii_whitespace() {
                end -= 1;
            }
            Ok(Some((
                Token {
                    start,
                    end,
                    kind: TokenKind::String,
                },
                next,
            )))
        }
    }
}

/// Offset just past the closing quote of the string opening at `pos`.
pub fn scan_quoted(text: &str, pos: usize) -> Result<usize, ParseError> {
    let bytes = text.as_bytes();
    let mut i = pos + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Ok(i + 1),
            _ => i += 1,
        }
    }
    Err(ParseError::UnterminatedString(pos))
}

/// Offset of the `}` or `]` matching the opener at `open`.
///
/// Braces and brackets share one depth counter; quoted strings are skipped.
pub fn find_matching(text: &str, open: usize) -> Result<usize, ParseError> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut i = open;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                i = scan_quoted(text, i)?;
                continue;
            }
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Ok(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    Err(ParseError::UnbalancedBracket {
        open: char::from(bytes.get(open).copied().unwrap_or(b'{')),
        start: open,
    })
}

/// Decode the C escapes GDB uses inside quoted strings.
///
/// Octal escapes are decoded as raw bytes, so multi-byte UTF-8 sequences that
/// GDB printed as `\303\251` come back as the original characters.
pub fn unescape(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if b != b'\\' || i + 1 >= bytes.len() {
            out.push(b);
            i += 1;
            continue;
        }

        let next = bytes[i + 1];
        i += 2;
        match next {
            b'n' => out.push(b'\n'),
            b't' => out.push(b'\t'),
            b'r' => out.push(b'\r'),
            b'"' => out.push(b'"'),
            b'\\' => out.push(b'\\'),
            b'\'' => out.push(b'\''),
            b'0'..=b'7' => {
                let mut value = u32::from(next - b'0');
                let mut digits = 1;
                while digits < 3 && i < bytes.len() && (b'0'..=b'7').contains(&bytes[i]) {
                    value = value * 8 + u32::from(bytes[i] - b'0');
                    i += 1;
                    digits += 1;
                }
                out.push((value & 0xff) as u8);
            }
            other => {
                out.push(b'\\');
                out.push(other);
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn skip_whitespace(bytes: &[u8], pos: usize) -> usize {
    let mut i = pos.min(bytes.len());
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

/// End of a bare token: the next delimiter outside every open region.
fn scan_bare(text: &str, start: usize) -> Result<usize, ParseError> {
    let bytes = text.as_bytes();
    let mut angle = 0usize;
    let mut square = 0usize;
    let mut paren = 0usize;
    let mut i = start;

    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                i += 2;
                continue;
            }
            b'"' => {
                i = scan_quoted(text, i)?;
                continue;
            }
            b'\'' => {
                i = scan_char_literal(bytes, i);
                continue;
            }
            b'<' => angle += 1,
            b'>' => angle = angle.saturating_sub(1),
            b'[' => square += 1,
            b']' => square = square.saturating_sub(1),
            b'(' => paren += 1,
            b')' => paren = paren.saturating_sub(1),
            b',' | b'=' | b'{' | b'}' if angle == 0 && square == 0 && paren == 0 => break,
            _ => {}
        }
        i += 1;
    }

    Ok(i.min(bytes.len()))
}

/// An unclosed char literal runs to the end of the fragment.
fn scan_char_literal(bytes: &[u8], pos: usize) -> usize {
    let mut i = pos + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'\'' => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}
