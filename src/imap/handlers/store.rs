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

//! STORE and UID STORE: message flags (RFC 3501 section 6.4.6) and
//! annotations (RFC 5257), with the `UNCHANGEDSINCE` guard of RFC 4551.
//!
//! All writes for one STORE happen in a single transaction. The modseq is
//! read under the write lock, applied to exactly the rows whose state
//! actually changes, and consumed only if at least one row was touched.
//! Two STOREs may carry the same group and execute together; the database
//! write lock decides their order.

use std::collections::HashMap;

use super::super::command::{Command, ConnCtx, Outcome};
use super::super::parser::ImapParser;
use super::{fetch, not_accessible};
use crate::db::from_single;
use crate::store::message_set::MessageSet;
use crate::store::rights::Rights;
use crate::store::session_init;
use crate::support::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOp {
    AddFlags,
    ReplaceFlags,
    RemoveFlags,
    ReplaceAnnotations,
}

#[derive(Clone, Debug)]
pub struct StoreAnnotation {
    pub entry: String,
    pub shared: bool,
    pub value: String,
}

pub struct StoreCmd {
    pub uid: bool,
    pub specified: MessageSet,
    pub op: StoreOp,
    pub flags: Vec<String>,
    pub annotations: Vec<StoreAnnotation>,
    pub silent: bool,
    pub unchanged_since: Option<i64>,
}

pub(super) fn parse(
    ctx: &mut ConnCtx,
    p: &mut ImapParser<'_>,
    uid: bool,
) -> Result<StoreCmd, Outcome> {
    let session = ctx
        .session
        .clone()
        .ok_or_else(|| Outcome::bad("STORE not allowed now"))?;

    p.space();
    let raw_set = p.sequence_set();
    p.space();
    if !p.ok() {
        return Err(Outcome::bad(p.take_error().unwrap()));
    }

    let specified = fetch::resolve_set(&session, &raw_set, uid)?;

    let mut cmd = StoreCmd {
        uid,
        specified,
        op: StoreOp::ReplaceFlags,
        flags: Vec::new(),
        annotations: Vec::new(),
        silent: false,
        unchanged_since: None,
    };

    if p.present("(") {
        loop {
            let modifier = p.atom().to_ascii_lowercase();
            if "unchangedsince" == modifier {
                p.space();
                if cmd.unchanged_since.is_some() {
                    return Err(Outcome::bad(
                        "unchangedsince specified twice",
                    ));
                }
                cmd.unchanged_since = Some(p.number64() as i64);
                ctx.condstore = true;
            } else if p.ok() {
                return Err(Outcome::bad(format!(
                    "Unknown store modifier: {}",
                    modifier
                )));
            }
            if !p.present(" ") {
                break;
            }
        }
        p.require(")");
        p.space();
    }

    if p.present("ANNOTATION (") {
        // No FETCH updates are echoed for annotation stores.
        cmd.silent = true;
        cmd.op = StoreOp::ReplaceAnnotations;
        loop {
            parse_annotation_entry(p, &mut cmd)?;
            if !p.present(" ") {
                break;
            }
        }
        p.require(")");
    } else {
        if p.present("-") {
            cmd.op = StoreOp::RemoveFlags;
        } else if p.present("+") {
            cmd.op = StoreOp::AddFlags;
        }
        p.require("flags");
        cmd.silent = p.present(".silent");
        p.space();

        if p.present("()") {
            // Nothing to do; FLAGS () still clears everything.
        } else if p.present("(") {
            cmd.flags.push(p.flag());
            while p.present(" ") {
                cmd.flags.push(p.flag());
            }
            p.require(")");
        } else {
            cmd.flags.push(p.flag());
            while p.present(" ") {
                cmd.flags.push(p.flag());
            }
        }

        let mut deduped: Vec<String> = Vec::new();
        for flag in cmd.flags.drain(..) {
            if !deduped.iter().any(|f| f.eq_ignore_ascii_case(&flag)) {
                deduped.push(flag);
            }
        }
        cmd.flags = deduped;
    }
    p.end();

    match p.take_error() {
        Some(message) => Err(Outcome::bad(message)),
        None => Ok(cmd),
    }
}

fn parse_annotation_entry(
    p: &mut ImapParser<'_>,
    cmd: &mut StoreCmd,
) -> Result<(), Outcome> {
    let entry = p.astring();
    if entry.starts_with("/flags/") {
        return Err(Outcome::bad(
            "Cannot set top-level flags using STORE ANNOTATION",
        ));
    }
    if entry.contains("//") {
        return Err(Outcome::bad(
            "Annotation entry names cannot contain //",
        ));
    }
    if entry.ends_with('/') {
        return Err(Outcome::bad(
            "Annotation entry names cannot end with /",
        ));
    }

    p.space();
    p.require("(");
    loop {
        let attrib = p.astring();
        let (shared, base) = if let Some(base) = attrib.strip_suffix(".shared")
        {
            (true, base)
        } else if let Some(base) = attrib.strip_suffix(".priv") {
            (false, base)
        } else {
            return Err(Outcome::bad(
                "Must store either .priv or .shared attributes",
            ));
        };
        if "value" != base {
            return Err(Outcome::bad(format!(
                "Unknown attribute: {}",
                base
            )));
        }

        p.space();
        let value = p.string();

        if let Some(existing) = cmd
            .annotations
            .iter_mut()
            .find(|a| a.entry == entry && a.shared == shared)
        {
            existing.value = value;
        } else {
            cmd.annotations.push(StoreAnnotation {
                entry: entry.clone(),
                shared,
                value,
            });
        }

        if !p.present(" ") {
            break;
        }
    }
    p.require(")");
    Ok(())
}

pub(super) fn execute(
    ctx: &mut ConnCtx,
    cmd: &mut Command,
    store: &mut StoreCmd,
) -> Result<(), Error> {
    let session = ctx.session()?.clone();
    // Lock order is view before session, so never hold the session lock
    // while taking the view's.
    let (mailbox, read_only) = {
        let session = session.lock().unwrap();
        (session.mailbox().clone(), session.read_only())
    };
    let (mailbox_id, mailbox_name) = {
        let view = mailbox.lock().unwrap();
        (view.id, view.name.clone())
    };

    if read_only {
        cmd.finish(
            Outcome::no("Mailbox is read-only").with_code("READ-ONLY"),
        );
        return Ok(());
    }

    // Permission gates, computed once from what the request touches.
    let mut touches_seen = false;
    let mut touches_deleted = false;
    let mut touches_other = false;
    for flag in &store.flags {
        if flag.eq_ignore_ascii_case("\\seen") {
            touches_seen = true;
        } else if flag.eq_ignore_ascii_case("\\deleted") {
            touches_deleted = true;
        } else {
            touches_other = true;
        }
    }

    let denied = {
        let session = session.lock().unwrap();
        if StoreOp::ReplaceAnnotations == store.op {
            let has_priv = store.annotations.iter().any(|a| !a.shared);
            let has_shared = store.annotations.iter().any(|a| a.shared);
            (has_priv && !session.allows(Rights::READ))
                || (has_shared
                    && !session.allows(Rights::WRITE_SHARED_ANNOTATION))
        } else {
            (touches_seen && !session.allows(Rights::KEEP_SEEN))
                || (touches_deleted
                    && !session.allows(Rights::DELETE_MESSAGES))
                || ((touches_other || store.flags.is_empty())
                    && !session.allows(Rights::WRITE))
        }
    };
    if denied {
        cmd.finish(not_accessible(&mailbox_name));
        return Ok(());
    }

    let expunged = {
        let session = session.lock().unwrap();
        let expunged =
            session.expunged().intersection(&store.specified);
        store.specified.remove_set(&expunged);
        store.specified =
            store.specified.intersection(session.messages());
        expunged
    };

    // Flag names must exist before the write transaction references them.
    let mut flag_ids: Vec<(String, i64)> = Vec::new();
    for flag in &store.flags {
        if flag.eq_ignore_ascii_case("\\seen")
            || flag.eq_ignore_ascii_case("\\deleted")
        {
            continue;
        }
        let id = ctx.db.intern_flag(flag)?;
        flag_ids.push((flag.clone(), id));
    }

    let user_id = ctx.user.as_ref().map(|&(id, _)| id).unwrap_or(0);
    let tx = ctx.db.write_tx()?;
    let modseq: i64 = tx.query_row(
        "SELECT `nextmodseq` FROM `mailboxes` WHERE `id` = ?",
        (mailbox_id,),
        from_single,
    )?;

    // The subset of the target that still satisfies UNCHANGEDSINCE.
    let mut s = MessageSet::new();
    {
        let mut sql = format!(
            "SELECT `uid` FROM `mailbox_messages` \
             WHERE `mailbox` = ?1 AND {}",
            store.specified.where_sql()
        );
        if store.unchanged_since.is_some() {
            sql.push_str(" AND `modseq` <= ?2");
        }
        sql.push_str(" ORDER BY `uid`");

        let mut stmt = tx.prepare(&sql)?;
        let rows: Vec<u32> = if let Some(unchanged_since) =
            store.unchanged_since
        {
            stmt.query_map(
                (mailbox_id, unchanged_since),
                from_single,
            )?
            .collect::<Result<_, _>>()?
        } else {
            stmt.query_map((mailbox_id,), from_single)?
                .collect::<Result<_, _>>()?
        };
        for uid in rows {
            s.add(uid);
        }
    }

    // Which of the requested non-system flags each message already has,
    // so the final write only changes rows that need changing.
    let mut present: HashMap<i64, MessageSet> = flag_ids
        .iter()
        .map(|&(_, id)| (id, MessageSet::new()))
        .collect();
    if !flag_ids.is_empty() {
        let ids: Vec<String> =
            flag_ids.iter().map(|&(_, id)| id.to_string()).collect();
        let mut stmt = tx.prepare(&format!(
            "SELECT `uid`, `flag` FROM `flags` \
             WHERE `mailbox` = ? AND {} AND `flag` IN ({})",
            store.specified.where_sql(),
            ids.join(", ")
        ))?;
        let rows = stmt.query_map((mailbox_id,), |row| {
            Ok((row.get::<_, u32>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (uid, flag) = row?;
            if let Some(set) = present.get_mut(&flag) {
                set.add(uid);
            }
        }
    }

    let mut outcome_code = None;
    if store.unchanged_since.is_some() {
        let mut modified = store.specified.clone();
        modified.remove_set(&s);
        if !modified.is_empty() {
            outcome_code = Some(format!("MODIFIED {}", modified.set()));
        }
    }

    let finish_with = |cmd: &mut Command,
                       expunged: &MessageSet,
                       code: Option<String>,
                       silent: bool| {
        if !silent && !expunged.is_empty() {
            cmd.finish(Outcome::no("Cannot store on expunged messages"));
        } else {
            let mut outcome = Outcome::ok("STORE completed");
            if let Some(code) = code {
                outcome = outcome.with_code(code);
            }
            cmd.finish(outcome);
        }
    };

    if s.is_empty() {
        tx.commit().map_err(|_| Error::TxFailed)?;
        finish_with(cmd, &expunged, outcome_code, store.silent);
        return Ok(());
    }

    let mut change_seen = false;
    let mut new_seen = false;
    let mut change_deleted = false;
    let mut new_deleted = false;
    let mut changed_uids = MessageSet::new();
    let mut work = false;

    match store.op {
        StoreOp::AddFlags | StoreOp::ReplaceFlags => {
            if StoreOp::ReplaceFlags == store.op {
                // Remove everything not listed.
                change_seen = true;
                new_seen = touches_seen;
                change_deleted = true;
                new_deleted = touches_deleted;

                let keep: Vec<String> = flag_ids
                    .iter()
                    .map(|&(_, id)| id.to_string())
                    .collect();
                let flag_filter = if keep.is_empty() {
                    String::new()
                } else {
                    format!(" AND `flag` NOT IN ({})", keep.join(", "))
                };
                let removed = tx.execute(
                    &format!(
                        "DELETE FROM `flags` \
                         WHERE `mailbox` = ? AND {}{}",
                        s.where_sql(),
                        flag_filter
                    ),
                    (mailbox_id,),
                )?;
                if removed > 0 {
                    work = true;
                    changed_uids.add_set(&s);
                }
            } else {
                if touches_seen {
                    change_seen = true;
                    new_seen = true;
                }
                if touches_deleted {
                    change_deleted = true;
                    new_deleted = true;
                }
            }

            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO `flags` \
                 (`mailbox`, `uid`, `flag`) VALUES (?, ?, ?)",
            )?;
            for &(_, id) in &flag_ids {
                let mut to_add = s.clone();
                if let Some(already) = present.get(&id) {
                    to_add.remove_set(already);
                }
                if to_add.is_empty() {
                    continue;
                }
                work = true;
                changed_uids.add_set(&to_add);
                for uid in to_add.items() {
                    stmt.execute((mailbox_id, uid, id))?;
                }
            }
        },
        StoreOp::RemoveFlags => {
            if touches_seen {
                change_seen = true;
                new_seen = false;
            }
            if touches_deleted {
                change_deleted = true;
                new_deleted = false;
            }

            let mut unchanged = store.specified.clone();
            let mut doomed_ids: Vec<String> = Vec::new();
            for &(_, id) in &flag_ids {
                if let Some(has) = present.get(&id) {
                    if !has.is_empty() {
                        doomed_ids.push(id.to_string());
                        unchanged = unchanged.intersection(has);
                    }
                }
            }
            let mut changed = store.specified.clone();
            changed.remove_set(&unchanged);
            changed_uids.add_set(&changed);

            if !doomed_ids.is_empty() {
                work = true;
                tx.execute(
                    &format!(
                        "DELETE FROM `flags` \
                         WHERE `mailbox` = ? AND {} AND `flag` IN ({})",
                        s.where_sql(),
                        doomed_ids.join(", ")
                    ),
                    (mailbox_id,),
                )?;
            }
        },
        StoreOp::ReplaceAnnotations => {
            work = true;
            replace_annotations(&tx, mailbox_id, user_id, &s, store)?;
        },
    }

    if !work && !change_seen && !change_deleted {
        // No actual work to be done.
        tx.commit().map_err(|_| Error::TxFailed)?;
        finish_with(cmd, &expunged, outcome_code, store.silent);
        return Ok(());
    }

    // One UPDATE stamps the new modseq on exactly the rows that changed:
    // rows whose join-table flags changed, plus rows whose seen/deleted
    // column does not already hold the target value.
    let mut sql = "UPDATE `mailbox_messages` SET `modseq` = ?1".to_owned();
    if change_seen {
        sql.push_str(if new_seen { ", `seen` = 1" } else { ", `seen` = 0" });
    }
    if change_deleted {
        sql.push_str(if new_deleted {
            ", `deleted` = 1"
        } else {
            ", `deleted` = 0"
        });
    }
    sql.push_str(&format!(
        " WHERE `mailbox` = ?2 AND {}",
        s.where_sql()
    ));

    let mut extra: Vec<String> = Vec::new();
    let mut check_seen_deleted = true;
    if changed_uids.is_empty() {
        // Only seen/deleted are changing.
    } else if s.difference(&changed_uids).is_empty() {
        // Another flag changed on every targeted message, so every row
        // gets the new modseq regardless of seen/deleted state.
        check_seen_deleted = false;
    } else {
        extra.push(
            changed_uids.where_sql(),
        );
    }
    if check_seen_deleted {
        if change_seen {
            extra.push(
                if new_seen { "NOT `seen`" } else { "`seen`" }.to_owned(),
            );
        }
        if change_deleted {
            extra.push(
                if new_deleted {
                    "NOT `deleted`"
                } else {
                    "`deleted`"
                }
                .to_owned(),
            );
        }
    }
    if 1 == extra.len() {
        sql.push_str(" AND ");
        sql.push_str(&extra[0]);
    } else if extra.len() > 1 {
        sql.push_str(" AND (");
        sql.push_str(&extra.join(" OR "));
        sql.push(')');
    }

    let rows = tx.execute(&sql, (modseq, mailbox_id))?;
    if 0 == rows {
        // No mailbox_messages row was touched, so no modseq is consumed.
        tx.commit().map_err(|_| Error::TxFailed)?;
        finish_with(cmd, &expunged, outcome_code, store.silent);
        return Ok(());
    }

    tx.execute(
        "UPDATE `mailboxes` SET `nextmodseq` = ? WHERE `id` = ?",
        (modseq + 1, mailbox_id),
    )?;
    tx.commit().map_err(|_| Error::TxFailed)?;

    mailbox.lock().unwrap().note_nextmodseq(modseq + 1);
    ctx.bus.send_nextmodseq(&mailbox_name, modseq + 1);
    if store.silent {
        session.lock().unwrap().set_ignored_modseq(modseq);
    }
    session_init::refresh(&mut ctx.db, &mailbox)?;

    // RFC 4551: .SILENT plus UNCHANGEDSINCE still reports the new MODSEQ
    // of every updated message.
    if store.silent && store.unchanged_since.is_some() {
        let session = session.lock().unwrap();
        for uid in s.items() {
            let msn = session.msn(uid);
            if msn != 0 {
                cmd.respond_str(format!(
                    "* {} FETCH (UID {} MODSEQ ({}))",
                    msn, uid, modseq
                ));
            }
        }
    }

    finish_with(cmd, &expunged, outcome_code, store.silent);
    Ok(())
}

/// Applies annotation replacements: an empty value deletes the row, any
/// other value updates in place and inserts where missing.
fn replace_annotations(
    tx: &rusqlite::Transaction<'_>,
    mailbox_id: i64,
    user_id: i64,
    s: &MessageSet,
    store: &StoreCmd,
) -> Result<(), Error> {
    let predicate = s.where_sql();
    for annotation in &store.annotations {
        let owner: Option<i64> =
            if annotation.shared { None } else { Some(user_id) };
        let owner_clause = if annotation.shared {
            "`owner` IS NULL"
        } else {
            "`owner` = ?4"
        };

        if annotation.value.is_empty() {
            let sql = format!(
                "DELETE FROM `annotations` \
                 WHERE `mailbox` = ?1 AND {} AND `name` = ?2 AND {}",
                predicate, owner_clause
            );
            if annotation.shared {
                tx.execute(&sql, (mailbox_id, &annotation.entry))?;
            } else {
                tx.execute(
                    &sql,
                    rusqlite::params![
                        mailbox_id,
                        &annotation.entry,
                        Option::<i64>::None,
                        user_id
                    ],
                )?;
            }
            continue;
        }

        let update = format!(
            "UPDATE `annotations` SET `value` = ?3 \
             WHERE `mailbox` = ?1 AND {} AND `name` = ?2 AND {}",
            predicate, owner_clause
        );
        let insert = format!(
            "INSERT INTO `annotations` \
             (`mailbox`, `uid`, `name`, `value`, `owner`) \
             SELECT ?1, `uid`, ?2, ?3, ?5 FROM `mailbox_messages` \
             WHERE `mailbox` = ?1 AND {} AND `uid` NOT IN \
               (SELECT `uid` FROM `annotations` \
                WHERE `mailbox` = ?1 AND `name` = ?2 AND {})",
            predicate, owner_clause
        );

        if annotation.shared {
            tx.execute(
                &update,
                (mailbox_id, &annotation.entry, &annotation.value),
            )?;
            tx.execute(
                &insert,
                rusqlite::params![
                    mailbox_id,
                    &annotation.entry,
                    &annotation.value,
                    Option::<i64>::None,
                    owner
                ],
            )?;
        } else {
            tx.execute(
                &update,
                rusqlite::params![
                    mailbox_id,
                    &annotation.entry,
                    &annotation.value,
                    user_id
                ],
            )?;
            tx.execute(
                &insert,
                rusqlite::params![
                    mailbox_id,
                    &annotation.entry,
                    &annotation.value,
                    user_id,
                    owner
                ],
            )?;
        }
    }

    Ok(())
}
