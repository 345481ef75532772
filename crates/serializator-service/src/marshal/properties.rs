//! The `.properties` text encoding of a [`Properties`] mapping.
//!
//! Each entry is written as one `key=value` line, sorted by key. Characters that would be
//! ambiguous are escaped with a backslash, non-printable characters are written as `\uXXXX`.
//! Parsing accepts `#` and `!` comment lines, blank lines and either `=` or `:` as separator.
//! Line continuations are not supported.

use std::fmt::Write;

use super::Properties;
use crate::caching::{CacheEntry, CacheError};

/// Renders `properties` as text, one sorted entry per line.
pub fn to_string(properties: &Properties) -> String {
    let mut out = String::new();
    for (key, value) in properties {
        escape_into(&mut out, key, true);
        out.push('=');
        escape_into(&mut out, value, false);
        out.push('\n');
    }
    out
}

/// Parses properties text.
///
/// Later entries override earlier ones with the same key.
pub fn parse(bytes: &[u8]) -> CacheEntry<Properties> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| CacheError::Malformed(format!("invalid utf-8: {e}")))?;

    let mut properties = Properties::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let (key, value) =
            parse_line(line).map_err(|e| CacheError::Malformed(format!("line {}: {e}", idx + 1)))?;
        properties.insert(key, value);
    }
    Ok(properties)
}

fn escape_into(out: &mut String, s: &str, is_key: bool) {
    for (idx, c) in s.chars().enumerate() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\x0c' => out.push_str("\\f"),
            '=' | ':' | '#' | '!' => {
                out.push('\\');
                out.push(c);
            }
            // Leading spaces would be trimmed on parse, inner spaces of keys would not survive
            // other readers of the format either.
            ' ' if idx == 0 || is_key => out.push_str("\\ "),
            c if c.is_control() => {
                let mut buf = [0u16; 2];
                for unit in c.encode_utf16(&mut buf) {
                    let _ = write!(out, "\\u{unit:04X}");
                }
            }
            c => out.push(c),
        }
    }
}

/// Splits a logical line at its first unescaped separator and unescapes both halves.
fn parse_line(line: &str) -> Result<(String, String), String> {
    let mut chars = line.chars().peekable();
    let mut key = String::new();
    // Length of the key without unescaped trailing whitespace.
    let mut key_len = 0;
    let mut found_separator = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                unescape_one(&mut chars, &mut key)?;
                key_len = key.len();
            }
            '=' | ':' => {
                found_separator = true;
                break;
            }
            c => {
                key.push(c);
                if !c.is_whitespace() {
                    key_len = key.len();
                }
            }
        }
    }

    if !found_separator {
        return Err(format!("missing separator in `{line}`"));
    }
    key.truncate(key_len);

    while chars.next_if(|c| c.is_whitespace()).is_some() {}

    let mut value = String::new();
    while let Some(c) = chars.next() {
        match c {
            '\\' => unescape_one(&mut chars, &mut value)?,
            c => value.push(c),
        }
    }

    Ok((key, value))
}

fn unescape_one(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    out: &mut String,
) -> Result<(), String> {
    let Some(c) = chars.next() else {
        return Err("unterminated escape at end of line".into());
    };
    match c {
        'n' => out.push('\n'),
        'r' => out.push('\r'),
        't' => out.push('\t'),
        'f' => out.push('\x0c'),
        'u' => {
            let unit = read_hex4(chars)?;
            let c = if (0xD800..0xDC00).contains(&unit) {
                let low = match (chars.next(), chars.next()) {
                    (Some('\\'), Some('u')) => read_hex4(chars)?,
                    _ => return Err("unpaired surrogate in unicode escape".into()),
                };
                char::decode_utf16([unit, low])
                    .next()
                    .and_then(Result::ok)
                    .ok_or("invalid surrogate pair in unicode escape")?
            } else {
                char::from_u32(u32::from(unit)).ok_or("invalid unicode escape")?
            };
            out.push(c);
        }
        // Everything else, including `\\`, `\=`, `\:`, `\#`, `\!` and `\ `, stands for itself.
        c => out.push(c),
    }
    Ok(())
}

fn read_hex4(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Result<u16, String> {
    let digits: String = chars.by_ref().take(4).collect();
    if digits.len() != 4 {
        return Err(format!("truncated unicode escape `\\u{digits}`"));
    }
    u16::from_str_radix(&digits, 16).map_err(|_| format!("invalid unicode escape `\\u{digits}`"))
}
