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

//! A cursor-style parser for IMAP command lines.
//!
//! The connection layer assembles one complete command into a byte buffer
//! (literal continuations included, with their CRLF markers left in
//! place), and the command parsers walk it with this cursor. The first
//! error sticks: every later accessor becomes a no-op returning a default,
//! so parse code can run straight through and check `ok()` once.

use std::fmt;

pub struct ImapParser<'a> {
    input: &'a [u8],
    pos: usize,
    error: Option<String>,
}

impl<'a> ImapParser<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        ImapParser {
            input,
            pos: 0,
            error: None,
        }
    }

    pub fn ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn error(&mut self, message: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(message.into());
        }
    }

    pub fn take_error(&mut self) -> Option<String> {
        self.error.take()
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    /// The next byte, or 0 at end of input.
    pub fn next_char(&self) -> u8 {
        self.input.get(self.pos).copied().unwrap_or(0)
    }

    pub fn step(&mut self) {
        self.pos += 1;
    }

    /// Everything from the cursor onward, for error messages.
    pub fn following(&self) -> String {
        String::from_utf8_lossy(&self.input[self.pos.min(self.input.len())..])
            .chars()
            .take(20)
            .collect()
    }

    /// If the input continues with `s` (ASCII case-insensitive), consume it
    /// and return true.
    pub fn present(&mut self, s: &str) -> bool {
        if !self.ok() {
            return false;
        }

        let end = self.pos + s.len();
        if end <= self.input.len()
            && self.input[self.pos..end].eq_ignore_ascii_case(s.as_bytes())
        {
            self.pos = end;
            true
        } else {
            false
        }
    }

    pub fn require(&mut self, s: &str) {
        if !self.present(s) {
            self.error(format!("expected {:?}, saw: {}", s, self.following()));
        }
    }

    pub fn space(&mut self) {
        self.require(" ");
    }

    pub fn end(&mut self) {
        if self.ok() && !self.at_end() {
            self.error(format!("trailing garbage: {}", self.following()));
        }
    }

    pub fn number(&mut self) -> u32 {
        self.number64().try_into().unwrap_or_else(|_| {
            self.error("number out of range");
            0
        })
    }

    pub fn nz_number(&mut self) -> u32 {
        let n = self.number();
        if self.ok() && 0 == n {
            self.error("expected nonzero number");
        }
        n
    }

    pub fn number64(&mut self) -> u64 {
        if !self.ok() {
            return 0;
        }

        let start = self.pos;
        while self.next_char().is_ascii_digit() {
            self.step();
        }

        if start == self.pos {
            self.error(format!("expected number, saw: {}", self.following()));
            return 0;
        }

        match std::str::from_utf8(&self.input[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
        {
            Some(n) => n,
            None => {
                self.error("number out of range");
                0
            },
        }
    }

    /// A run of letters, digits and dots, as used by FETCH attribute names.
    pub fn dot_letters(&mut self) -> String {
        let start = self.pos;
        while matches!(self.next_char(), b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.') {
            self.step();
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    /// The raw text of a sequence-set: digits, `*`, `:` and `,`.
    pub fn sequence_set(&mut self) -> String {
        let start = self.pos;
        while matches!(self.next_char(), b'0'..=b'9' | b'*' | b':' | b',') {
            self.step();
        }
        if start == self.pos {
            self.error(format!(
                "expected sequence set, saw: {}",
                self.following()
            ));
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    pub fn tag(&mut self) -> String {
        let start = self.pos;
        while is_tag_char(self.next_char()) {
            self.step();
        }
        if start == self.pos {
            self.error("expected command tag");
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    pub fn atom(&mut self) -> String {
        let start = self.pos;
        while is_atom_char(self.next_char()) {
            self.step();
        }
        if start == self.pos {
            self.error(format!("expected atom, saw: {}", self.following()));
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    /// A flag name: an atom with an optional leading backslash.
    pub fn flag(&mut self) -> String {
        if self.present("\\") {
            format!("\\{}", self.atom())
        } else {
            self.atom()
        }
    }

    /// An astring: atom, quoted string, or literal.
    pub fn astring(&mut self) -> String {
        match self.next_char() {
            b'"' => self.quoted(),
            b'{' => self.literal(),
            _ => self.atom(),
        }
    }

    /// A string: quoted string or literal only (RFC 3501 `string`).
    pub fn string(&mut self) -> String {
        match self.next_char() {
            b'"' => self.quoted(),
            b'{' => self.literal(),
            _ => {
                self.error(format!(
                    "expected string, saw: {}",
                    self.following()
                ));
                String::new()
            },
        }
    }

    /// An nstring used in parse position: NIL, quoted, or literal.
    pub fn nstring(&mut self) -> Option<String> {
        if self.present("NIL") {
            None
        } else {
            Some(self.string())
        }
    }

    fn quoted(&mut self) -> String {
        self.require("\"");
        let mut out = String::new();
        loop {
            match self.next_char() {
                0 => {
                    self.error("unterminated quoted string");
                    break;
                },
                b'"' => {
                    self.step();
                    break;
                },
                b'\\' => {
                    self.step();
                    let escaped = self.next_char();
                    if escaped == b'"' || escaped == b'\\' {
                        out.push(escaped as char);
                        self.step();
                    } else {
                        self.error("bad quoted-string escape");
                        break;
                    }
                },
                b'\r' | b'\n' => {
                    self.error("newline in quoted string");
                    break;
                },
                c => {
                    out.push(c as char);
                    self.step();
                },
            }
        }
        out
    }

    /// A literal: `{N}` CRLF followed by N raw bytes, all already present
    /// in the buffer.
    fn literal(&mut self) -> String {
        String::from_utf8_lossy(&self.literal_bytes()).into_owned()
    }

    pub fn literal_bytes(&mut self) -> Vec<u8> {
        self.require("{");
        let length = self.number() as usize;
        // LITERAL+ markers survive in the buffer.
        self.present("+");
        self.require("}");
        self.require("\r\n");
        if !self.ok() {
            return Vec::new();
        }

        if self.pos + length > self.input.len() {
            self.error("literal extends past end of command");
            return Vec::new();
        }

        let out = self.input[self.pos..self.pos + length].to_vec();
        self.pos += length;
        out
    }
}

impl<'a> fmt::Debug for ImapParser<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ImapParser(pos {}, next: {})",
            self.pos,
            self.following()
        )
    }
}

fn is_atom_char(ch: u8) -> bool {
    match ch {
        0..=b' ' => false,
        127..=255 => false,
        b'(' | b')' | b'{' | b'*' | b'%' | b'\\' | b'"' | b']' => false,
        _ => true,
    }
}

fn is_tag_char(ch: u8) -> bool {
    // A tag is an astring-ish atom that additionally forbids '+'.
    ch != b'+' && is_atom_char(ch)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn basic_walk() {
        let mut p = ImapParser::new(b"A1 LOGIN joe \"s3cr!t\"");
        assert_eq!("A1", p.tag());
        p.space();
        assert!(p.present("login"));
        p.space();
        assert_eq!("joe", p.astring());
        p.space();
        assert_eq!("s3cr!t", p.astring());
        p.end();
        assert!(p.ok());
    }

    #[test]
    fn quoted_escapes() {
        let mut p = ImapParser::new(br#""a\"b\\c""#);
        assert_eq!("a\"b\\c", p.astring());
        assert!(p.ok());
    }

    #[test]
    fn literals_inline() {
        let mut p = ImapParser::new(b"{5}\r\nhel\"o rest");
        assert_eq!("hel\"o", p.astring());
        p.space();
        assert_eq!("rest", p.atom());
        assert!(p.ok());
    }

    #[test]
    fn short_literal_is_an_error() {
        let mut p = ImapParser::new(b"{10}\r\nabc");
        p.astring();
        assert!(!p.ok());
    }

    #[test]
    fn first_error_sticks() {
        let mut p = ImapParser::new(b"abc");
        p.require("xyz");
        assert!(!p.ok());
        p.error("second");
        assert!(p.take_error().unwrap().starts_with("expected"));
    }

    #[test]
    fn numbers() {
        let mut p = ImapParser::new(b"42 0 18446744073709551615");
        assert_eq!(42, p.number());
        p.space();
        assert_eq!(0, p.number());
        p.space();
        assert_eq!(u64::MAX, p.number64());
        assert!(p.ok());

        let mut p = ImapParser::new(b"0");
        p.nz_number();
        assert!(!p.ok());
    }

    #[test]
    fn sequence_sets_and_flags() {
        let mut p = ImapParser::new(b"1:5,9,*");
        assert_eq!("1:5,9,*", p.sequence_set());
        assert!(p.ok());

        let mut p = ImapParser::new(b"\\Seen custom");
        assert_eq!("\\Seen", p.flag());
        p.space();
        assert_eq!("custom", p.flag());
        assert!(p.ok());
    }
}
