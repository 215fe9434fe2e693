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

use std::fmt;

use rusqlite::OptionalExtension as _;

use crate::db::{from_single, Db};
use crate::support::error::Error;

bitflags::bitflags! {
    /// The RFC 2086 access rights, plus RFC 5257's `n`.
    ///
    /// Stored rights strings use the single-character encoding. The RFC 4314
    /// letters are accepted on parse and folded into their 2086 equivalents
    /// (`t`, `e`, `x` fold into `d`; `k` folds into `c`); rendering always
    /// emits the canonical 2086 form.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Rights: u32 {
        const LOOKUP = 1 << 0;
        const READ = 1 << 1;
        const KEEP_SEEN = 1 << 2;
        const WRITE = 1 << 3;
        const INSERT = 1 << 4;
        const POST = 1 << 5;
        const CREATE = 1 << 6;
        const DELETE_MESSAGES = 1 << 7;
        const ADMIN = 1 << 8;
        const WRITE_SHARED_ANNOTATION = 1 << 9;
    }
}

impl Rights {
    /// Every right, as granted to a mailbox's owner.
    pub fn all_rights() -> Self {
        Self::all()
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        let mut rights = Rights::empty();
        for ch in s.chars() {
            rights |= match ch {
                'l' => Rights::LOOKUP,
                'r' => Rights::READ,
                's' => Rights::KEEP_SEEN,
                'w' => Rights::WRITE,
                'i' => Rights::INSERT,
                'p' => Rights::POST,
                'c' | 'k' => Rights::CREATE,
                'd' | 't' | 'e' | 'x' => Rights::DELETE_MESSAGES,
                'a' => Rights::ADMIN,
                'n' => Rights::WRITE_SHARED_ANNOTATION,
                _ => return Err(Error::UnsafeName),
            };
        }
        Ok(rights)
    }
}

impl fmt::Display for Rights {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        static ORDER: &[(Rights, char)] = &[
            (Rights::LOOKUP, 'l'),
            (Rights::READ, 'r'),
            (Rights::KEEP_SEEN, 's'),
            (Rights::WRITE, 'w'),
            (Rights::INSERT, 'i'),
            (Rights::POST, 'p'),
            (Rights::CREATE, 'c'),
            (Rights::DELETE_MESSAGES, 'd'),
            (Rights::ADMIN, 'a'),
            (Rights::WRITE_SHARED_ANNOTATION, 'n'),
        ];

        for &(right, ch) in ORDER {
            if self.contains(right) {
                write!(f, "{}", ch)?;
            }
        }
        Ok(())
    }
}

/// The resolved rights of one user on one mailbox.
///
/// Resolved once, at SELECT time, so command execution never has to wait on
/// a permissions check.
#[derive(Clone, Copy, Debug)]
pub struct Permissions {
    rights: Rights,
}

impl Permissions {
    /// Loads the rights `user` holds on `mailbox`.
    ///
    /// The owner of a mailbox implicitly holds every right unless an
    /// explicit row overrides that; other users get the union of their own
    /// row and the `anyone` row.
    pub fn load(
        db: &Db,
        mailbox: i64,
        user_id: i64,
        login: &str,
    ) -> Result<Self, Error> {
        let owner = db
            .cxn()
            .query_row(
                "SELECT `owner` FROM `mailboxes` WHERE `id` = ?",
                (mailbox,),
                from_single::<Option<i64>>,
            )
            .optional()?
            .ok_or(Error::NxMailbox)?;

        let explicit = |identifier: &str| -> Result<Option<Rights>, Error> {
            db.cxn()
                .query_row(
                    "SELECT `rights` FROM `permissions` \
                     WHERE `mailbox` = ? AND `identifier` = ?",
                    (mailbox, identifier),
                    from_single::<String>,
                )
                .optional()?
                .map(|s| Rights::parse(&s))
                .transpose()
        };

        let rights = if let Some(rights) = explicit(login)? {
            rights
        } else if Some(user_id) == owner {
            Rights::all_rights()
        } else {
            explicit("anyone")?.unwrap_or_else(Rights::empty)
        };

        Ok(Permissions { rights })
    }

    #[cfg(test)]
    pub fn of(rights: Rights) -> Self {
        Permissions { rights }
    }

    pub fn allows(&self, right: Rights) -> bool {
        self.rights.contains(right)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_and_render() {
        let rights = Rights::parse("lrswipcda").unwrap();
        assert_eq!("lrswipcda", &rights.to_string());
        assert!(rights.contains(Rights::KEEP_SEEN));
        assert!(!rights.contains(Rights::WRITE_SHARED_ANNOTATION));
    }

    #[test]
    fn rfc4314_aliases_fold() {
        assert_eq!(
            Rights::parse("te").unwrap(),
            Rights::DELETE_MESSAGES
        );
        assert_eq!(Rights::parse("k").unwrap(), Rights::CREATE);
        assert_eq!("d", &Rights::parse("x").unwrap().to_string());
    }

    #[test]
    fn unknown_right_rejected() {
        assert!(Rights::parse("lrq").is_err());
    }
}
