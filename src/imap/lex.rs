//-
// Copyright (c) 2024, The Ironpost Developers
//
// This file is part of Ironpost.
//
// Ironpost is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either  version 3 of the License, or  (at your option)
// any later version.
//
// Ironpost is distributed in  the hope that it will be  useful, but WITHOUT
// ANY WARRANTY; without even  the implied warranty of  MERCHANTABILITY or
// FITNESS FOR A  PARTICULAR PURPOSE. See the GNU  General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Ironpost. If not, see <http://www.gnu.org/licenses/>.

//! Utilities for writing values under IMAP's lexical rules.
//!
//! Strings go out as quoted strings when they are short and contain no
//! characters that would need repair; everything else (controls, quotes,
//! 8-bit data, anything long) goes out as a literal, which can carry
//! arbitrary bytes.

/// Appends an IMAP quoted string or literal for `data`.
pub fn append_string(out: &mut Vec<u8>, data: &[u8]) {
    if quotable(data) {
        out.push(b'"');
        for &b in data {
            if b == b'"' || b == b'\\' {
                out.push(b'\\');
            }
            out.push(b);
        }
        out.push(b'"');
    } else {
        out.extend_from_slice(format!("{{{}}}\r\n", data.len()).as_bytes());
        out.extend_from_slice(data);
    }
}

/// Appends an nstring: `NIL`, or `append_string`.
pub fn append_nstring(out: &mut Vec<u8>, data: Option<&[u8]>) {
    match data {
        Some(data) => append_string(out, data),
        None => out.extend_from_slice(b"NIL"),
    }
}

fn quotable(data: &[u8]) -> bool {
    data.len() < 100
        && data
            .iter()
            .all(|&b| (b' '..=b'~').contains(&b))
}

/// Convenience for the common case of building into a `String`-shaped
/// response that is known to stay ASCII.
pub fn quoted(data: &str) -> String {
    let mut out = Vec::new();
    append_string(&mut out, data.as_bytes());
    String::from_utf8_lossy(&out).into_owned()
}

pub fn nstring(data: Option<&str>) -> String {
    match data {
        Some(data) => quoted(data),
        None => "NIL".to_owned(),
    }
}

/// Matches an IMAP list-style wildcard pattern: `*` matches anything,
/// `%` matches anything except `/`.
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    fn rec(pattern: &[u8], value: &[u8]) -> bool {
        match pattern.split_first() {
            None => value.is_empty(),
            Some((b'*', rest)) => (0..=value.len())
                .any(|skip| rec(rest, &value[skip..])),
            Some((b'%', rest)) => (0..=value.len())
                .take_while(|&skip| {
                    skip == 0 || value[skip - 1] != b'/'
                })
                .any(|skip| rec(rest, &value[skip..])),
            Some((&ch, rest)) => value
                .split_first()
                .map_or(false, |(&v, vrest)| {
                    ch.eq_ignore_ascii_case(&v) && rec(rest, vrest)
                }),
        }
    }
    rec(pattern.as_bytes(), value.as_bytes())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn quoting_decisions() {
        assert_eq!("\"hi\"", quoted("hi"));
        assert_eq!("\"a\\\"b\"", quoted("a\"b"));
        assert_eq!("NIL", nstring(None));

        let mut out = Vec::new();
        append_string(&mut out, b"line\r\nbreak");
        assert_eq!(b"{11}\r\nline\r\nbreak".to_vec(), out);
    }

    #[test]
    fn wildcards() {
        assert!(wildcard_match("/comment", "/comment"));
        assert!(wildcard_match("/COMMENT", "/comment"));
        assert!(wildcard_match("*", "/anything/at/all"));
        assert!(wildcard_match("/priv/*", "/priv/sub/deep"));
        assert!(wildcard_match("/%", "/flat"));
        assert!(!wildcard_match("/%", "/two/levels"));
        assert!(!wildcard_match("/comment", "/commentary"));
    }
}
