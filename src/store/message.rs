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

//! The in-memory view of one message, populated lazily by the `Fetcher`.
//!
//! Messages arrive in the database pre-parsed (header fields, address
//! lists, body parts), so this module never looks at RFC 5322 syntax; it
//! only mirrors rows.

use chrono::prelude::*;

/// One parsed address from an address-valued header field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Address {
    pub name: Option<String>,
    pub localpart: String,
    pub domain: String,
}

/// One occurrence of an address within a header field.
#[derive(Clone, Debug)]
pub struct AddressField {
    pub part: String,
    pub field: String,
    pub position: u32,
    pub address: Address,
}

/// One non-address header field, top-level or per-part.
#[derive(Clone, Debug)]
pub struct HeaderField {
    pub part: String,
    pub position: u32,
    pub field: String,
    pub value: String,
}

/// Metadata (and, once the Body category has been fetched, content) of one
/// body part. Part `""` is the entire raw message.
#[derive(Clone, Debug, Default)]
pub struct BodyPart {
    pub part: String,
    pub bytes: u32,
    pub lines: u32,
    pub content_type: Option<String>,
    pub content_subtype: Option<String>,
    /// Content-Type parameters, stored as `name=value` lines.
    pub parameters: Vec<(String, String)>,
    pub cte: Option<String>,
    pub content_id: Option<String>,
    pub description: Option<String>,
    pub md5: Option<String>,
    pub disposition: Option<String>,
    pub language: Option<String>,
    pub location: Option<String>,
    /// Decoded content. `None` until the Body category has been fetched.
    pub text: Option<Vec<u8>>,
}

impl BodyPart {
    pub fn is_multipart(&self) -> bool {
        self.content_type
            .as_deref()
            .map_or(false, |t| t.eq_ignore_ascii_case("multipart"))
    }

    pub fn is_message_rfc822(&self) -> bool {
        self.content_type
            .as_deref()
            .map_or(false, |t| t.eq_ignore_ascii_case("message"))
            && self
                .content_subtype
                .as_deref()
                .map_or(false, |t| t.eq_ignore_ascii_case("rfc822"))
    }
}

#[derive(Clone, Debug)]
pub struct Annotation {
    pub name: String,
    /// `None` is a shared annotation; otherwise the owning user id.
    pub owner: Option<i64>,
    pub value: String,
}

#[derive(Clone, Debug, Default)]
pub struct FlagsView {
    pub seen: bool,
    pub deleted: bool,
    /// Names of the flags held in the join table, i.e. everything other
    /// than `\Seen` and `\Deleted`.
    pub keywords: Vec<String>,
}

/// The lazily-populated view of one message within a mailbox.
///
/// Each `Option` group corresponds to one `Fetcher` category; the `has_*`
/// predicates report which categories have been satisfied so the FETCH
/// handler only requests what is missing.
#[derive(Clone, Debug, Default)]
pub struct Message {
    pub uid: u32,

    // Trivia
    pub modseq: Option<i64>,
    pub internal_date: Option<DateTime<FixedOffset>>,
    pub rfc822_size: Option<u32>,

    pub flags: Option<FlagsView>,
    pub addresses: Option<Vec<AddressField>>,
    pub headers: Option<Vec<HeaderField>>,
    pub parts: Option<Vec<BodyPart>>,
    pub annotations: Option<Vec<Annotation>>,
}

impl Message {
    pub fn new(uid: u32) -> Self {
        Message {
            uid,
            ..Message::default()
        }
    }

    pub fn has_trivia(&self) -> bool {
        self.modseq.is_some()
    }

    pub fn has_flags(&self) -> bool {
        self.flags.is_some()
    }

    pub fn has_addresses(&self) -> bool {
        self.addresses.is_some()
    }

    pub fn has_headers(&self) -> bool {
        self.headers.is_some()
    }

    pub fn has_part_numbers(&self) -> bool {
        self.parts.is_some()
    }

    pub fn has_bodies(&self) -> bool {
        self.parts
            .as_ref()
            .map_or(false, |parts| {
                parts.iter().all(|p| p.text.is_some())
            })
    }

    pub fn has_annotations(&self) -> bool {
        self.annotations.is_some()
    }

    /// The body part with the given IMAP part number, if any.
    pub fn part(&self, number: &str) -> Option<&BodyPart> {
        self.parts
            .as_ref()
            .and_then(|parts| parts.iter().find(|p| p.part == number))
    }

    /// The raw RFC 822 form of the whole message (body part `""`).
    pub fn rfc822(&self) -> Option<&[u8]> {
        self.part("").and_then(|p| p.text.as_deref())
    }

    /// The raw body of the whole message: everything after the blank line
    /// that terminates the top-level header.
    pub fn rfc822_body(&self) -> Option<&[u8]> {
        let raw = self.rfc822()?;
        Some(match find_header_end(raw) {
            Some(ix) => &raw[ix..],
            None => b"",
        })
    }

    /// Addresses of `field` at the top level, in stored order.
    pub fn address_list(&self, field: &str) -> Vec<&Address> {
        let mut hits: Vec<&AddressField> = self
            .addresses
            .iter()
            .flatten()
            .filter(|a| a.part.is_empty() && a.field.eq_ignore_ascii_case(field))
            .collect();
        hits.sort_by_key(|a| a.position);
        hits.into_iter().map(|a| &a.address).collect()
    }

    /// The value of the first top-level header field named `field`.
    pub fn header_value(&self, field: &str) -> Option<&str> {
        self.headers
            .iter()
            .flatten()
            .filter(|h| h.part.is_empty() && h.field.eq_ignore_ascii_case(field))
            .min_by_key(|h| h.position)
            .map(|h| h.value.as_str())
    }
}

/// Index of the first body byte, i.e. one past the header/body blank line.
fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|ix| ix + 4)
        .or_else(|| raw.windows(2).position(|w| w == b"\n\n").map(|ix| ix + 2))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rfc822_body_splits_at_blank_line() {
        let mut msg = Message::new(1);
        msg.parts = Some(vec![BodyPart {
            part: String::new(),
            text: Some(b"Subject: x\r\n\r\nhello\r\n".to_vec()),
            ..BodyPart::default()
        }]);
        assert_eq!(b"hello\r\n", msg.rfc822_body().unwrap());
    }

    #[test]
    fn headerless_message_has_empty_body() {
        let mut msg = Message::new(1);
        msg.parts = Some(vec![BodyPart {
            part: String::new(),
            text: Some(b"no blank line here".to_vec()),
            ..BodyPart::default()
        }]);
        assert_eq!(b"", msg.rfc822_body().unwrap());
    }
}
