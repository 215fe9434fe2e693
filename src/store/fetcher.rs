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

//! Batched loading of message attributes.
//!
//! A `Fetcher` is constructed for one mailbox and one set of messages; each
//! `fetch()` call loads one category of data for every message in the batch
//! with a single query, which is what keeps `FETCH 1:*` from issuing a
//! query per message.

use std::collections::BTreeMap;

use chrono::prelude::*;

use super::message::*;
use super::message_set::MessageSet;
use crate::db::{from_row, Db};
use crate::support::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Category {
    Addresses,
    OtherHeader,
    Body,
    PartNumbers,
    Flags,
    Trivia,
    Annotations,
}

pub struct Fetcher {
    mailbox: i64,
    set: MessageSet,
}

impl Fetcher {
    pub fn new(mailbox: i64, set: MessageSet) -> Self {
        Fetcher { mailbox, set }
    }

    /// Load `category` for every message in the batch.
    ///
    /// Messages named by the set but absent from `messages` are skipped;
    /// rows for unknown UIDs are ignored.
    pub fn fetch(
        &self,
        db: &Db,
        category: Category,
        messages: &mut BTreeMap<u32, Message>,
    ) -> Result<(), Error> {
        if self.set.is_empty() {
            return Ok(());
        }

        match category {
            Category::Trivia => self.fetch_trivia(db, messages),
            Category::Flags => self.fetch_flags(db, messages),
            Category::Addresses => self.fetch_addresses(db, messages),
            Category::OtherHeader => self.fetch_headers(db, messages),
            Category::PartNumbers => self.fetch_parts(db, messages, false),
            Category::Body => self.fetch_parts(db, messages, true),
            Category::Annotations => self.fetch_annotations(db, messages),
        }
    }

    fn fetch_trivia(
        &self,
        db: &Db,
        messages: &mut BTreeMap<u32, Message>,
    ) -> Result<(), Error> {
        let mut stmt = db.cxn().prepare(&format!(
            "SELECT `uid`, `modseq`, `internaldate`, `rfc822size` \
             FROM `mailbox_messages` \
             WHERE `mailbox` = ? AND {}",
            self.set.where_sql()
        ))?;
        let rows = stmt
            .query_map((self.mailbox,), from_row::<(u32, i64, String, u32)>)?;

        for row in rows {
            let (uid, modseq, internaldate, size) = row?;
            if let Some(message) = messages.get_mut(&uid) {
                message.modseq = Some(modseq);
                message.internal_date = DateTime::parse_from_rfc3339(
                    &internaldate,
                )
                .ok();
                message.rfc822_size = Some(size);
            }
        }

        Ok(())
    }

    fn fetch_flags(
        &self,
        db: &Db,
        messages: &mut BTreeMap<u32, Message>,
    ) -> Result<(), Error> {
        let mut stmt = db.cxn().prepare(&format!(
            "SELECT `uid`, `seen`, `deleted` FROM `mailbox_messages` \
             WHERE `mailbox` = ? AND {}",
            self.set.where_sql()
        ))?;
        let rows =
            stmt.query_map((self.mailbox,), from_row::<(u32, bool, bool)>)?;
        for row in rows {
            let (uid, seen, deleted) = row?;
            if let Some(message) = messages.get_mut(&uid) {
                message.flags = Some(FlagsView {
                    seen,
                    deleted,
                    keywords: Vec::new(),
                });
            }
        }

        let mut stmt = db.cxn().prepare(&format!(
            "SELECT `f`.`uid`, `n`.`name` \
             FROM `flags` `f` JOIN `flag_names` `n` ON `n`.`id` = `f`.`flag` \
             WHERE `f`.`mailbox` = ? AND {} \
             ORDER BY `f`.`uid`, `n`.`id`",
            // where_sql names a bare `uid` column; qualify it for the join.
            self.set.where_sql().replace("`uid`", "`f`.`uid`")
        ))?;
        let rows = stmt.query_map((self.mailbox,), from_row::<(u32, String)>)?;
        for row in rows {
            let (uid, name) = row?;
            if let Some(flags) =
                messages.get_mut(&uid).and_then(|m| m.flags.as_mut())
            {
                flags.keywords.push(name);
            }
        }

        Ok(())
    }

    fn fetch_addresses(
        &self,
        db: &Db,
        messages: &mut BTreeMap<u32, Message>,
    ) -> Result<(), Error> {
        for message in messages.values_mut() {
            if self.set.contains(message.uid) {
                message.addresses.get_or_insert_with(Vec::new);
            }
        }

        let mut stmt = db.cxn().prepare(&format!(
            "SELECT `uid`, `part`, `field`, `position`, \
                    `name`, `localpart`, `domain` \
             FROM `address_fields` \
             WHERE `mailbox` = ? AND {} \
             ORDER BY `uid`, `part`, `field`, `position`",
            self.set.where_sql()
        ))?;
        let rows = stmt.query_map(
            (self.mailbox,),
            from_row::<(u32, String, String, u32, Option<String>, String, String)>,
        )?;

        for row in rows {
            let (uid, part, field, position, name, localpart, domain) = row?;
            if let Some(addresses) =
                messages.get_mut(&uid).and_then(|m| m.addresses.as_mut())
            {
                addresses.push(AddressField {
                    part,
                    field,
                    position,
                    address: Address {
                        name,
                        localpart,
                        domain,
                    },
                });
            }
        }

        Ok(())
    }

    fn fetch_headers(
        &self,
        db: &Db,
        messages: &mut BTreeMap<u32, Message>,
    ) -> Result<(), Error> {
        for message in messages.values_mut() {
            if self.set.contains(message.uid) {
                message.headers.get_or_insert_with(Vec::new);
            }
        }

        let mut stmt = db.cxn().prepare(&format!(
            "SELECT `uid`, `part`, `position`, `field`, `value` \
             FROM `header_fields` \
             WHERE `mailbox` = ? AND {} \
             ORDER BY `uid`, `part`, `position`",
            self.set.where_sql()
        ))?;
        let rows = stmt.query_map(
            (self.mailbox,),
            from_row::<(u32, String, u32, String, String)>,
        )?;

        for row in rows {
            let (uid, part, position, field, value) = row?;
            if let Some(headers) =
                messages.get_mut(&uid).and_then(|m| m.headers.as_mut())
            {
                headers.push(HeaderField {
                    part,
                    position,
                    field,
                    value,
                });
            }
        }

        Ok(())
    }

    fn fetch_parts(
        &self,
        db: &Db,
        messages: &mut BTreeMap<u32, Message>,
        with_content: bool,
    ) -> Result<(), Error> {
        for message in messages.values_mut() {
            if self.set.contains(message.uid) {
                message.parts.get_or_insert_with(Vec::new);
            }
        }

        let content_column = if with_content { "`text`" } else { "NULL" };
        let mut stmt = db.cxn().prepare(&format!(
            "SELECT `uid`, `part`, `bytes`, `lines`, \
                    `content_type`, `content_subtype`, `parameters`, `cte`, \
                    `content_id`, `description`, `md5`, `disposition`, \
                    `language`, `location`, {} \
             FROM `bodyparts` \
             WHERE `mailbox` = ? AND {} \
             ORDER BY `uid`, `part`",
            content_column,
            self.set.where_sql()
        ))?;

        let rows = stmt.query_map((self.mailbox,), |row| {
            let uid: u32 = row.get(0)?;
            let body_part = BodyPart {
                part: row.get(1)?,
                bytes: row.get(2)?,
                lines: row.get(3)?,
                content_type: row.get(4)?,
                content_subtype: row.get(5)?,
                parameters: parse_parameters(
                    row.get::<_, Option<String>>(6)?.as_deref(),
                ),
                cte: row.get(7)?,
                content_id: row.get(8)?,
                description: row.get(9)?,
                md5: row.get(10)?,
                disposition: row.get(11)?,
                language: row.get(12)?,
                location: row.get(13)?,
                text: row.get(14)?,
            };
            Ok((uid, body_part))
        })?;

        for row in rows {
            let (uid, body_part) = row?;
            let Some(parts) =
                messages.get_mut(&uid).and_then(|m| m.parts.as_mut())
            else {
                continue;
            };

            // Re-fetching with content must replace the metadata-only entry
            // from an earlier PartNumbers pass.
            if let Some(existing) =
                parts.iter_mut().find(|p| p.part == body_part.part)
            {
                if body_part.text.is_some() {
                    *existing = body_part;
                }
            } else {
                parts.push(body_part);
            }
        }

        Ok(())
    }

    fn fetch_annotations(
        &self,
        db: &Db,
        messages: &mut BTreeMap<u32, Message>,
    ) -> Result<(), Error> {
        for message in messages.values_mut() {
            if self.set.contains(message.uid) {
                message.annotations.get_or_insert_with(Vec::new);
            }
        }

        let mut stmt = db.cxn().prepare(&format!(
            "SELECT `uid`, `name`, `owner`, `value` FROM `annotations` \
             WHERE `mailbox` = ? AND {} \
             ORDER BY `uid`, `name`",
            self.set.where_sql()
        ))?;
        let rows = stmt.query_map(
            (self.mailbox,),
            from_row::<(u32, String, Option<i64>, String)>,
        )?;

        for row in rows {
            let (uid, name, owner, value) = row?;
            if let Some(annotations) =
                messages.get_mut(&uid).and_then(|m| m.annotations.as_mut())
            {
                annotations.push(Annotation { name, owner, value });
            }
        }

        Ok(())
    }
}

/// Content-Type parameters are stored as `name=value` lines.
fn parse_parameters(raw: Option<&str>) -> Vec<(String, String)> {
    raw.map(|raw| {
        raw.lines()
            .filter_map(|line| {
                line.split_once('=')
                    .map(|(n, v)| (n.to_owned(), v.to_owned()))
            })
            .collect()
    })
    .unwrap_or_default()
}
