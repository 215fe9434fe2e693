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

//! SELECT, EXAMINE, CLOSE and EXPUNGE.

use std::sync::{Arc, Mutex};

use log::info;
use rusqlite::OptionalExtension as _;

use super::super::command::{Command, ConnCtx, ConnState, Outcome};
use super::not_accessible;
use crate::db::from_single;
use crate::store::mailbox::MailboxView;
use crate::store::message_set::MessageSet;
use crate::store::rights::{Permissions, Rights};
use crate::store::session::Session;
use crate::store::session_init;
use crate::support::error::Error;

pub struct SelectCmd {
    pub mailbox: String,
    pub read_only: bool,
}

#[derive(Default)]
pub struct ExpungeCmd;

static SYSTEM_FLAGS: &[&str] =
    &["\\Answered", "\\Flagged", "\\Deleted", "\\Seen", "\\Draft"];

pub(super) fn execute(
    ctx: &mut ConnCtx,
    cmd: &mut Command,
    select: &mut SelectCmd,
) -> Result<(), Error> {
    // A failed or repeated SELECT always deselects first.
    ctx.session = None;
    if ConnState::Selected == ctx.state {
        ctx.state = ConnState::Authenticated;
    }

    let view = match ctx.registry.open(&ctx.db, &select.mailbox) {
        Ok(view) => view,
        Err(Error::NxMailbox) => {
            cmd.finish(Outcome::no("No such mailbox"));
            return Ok(());
        },
        Err(e) => return Err(e),
    };

    let (user_id, login) =
        ctx.user.clone().ok_or(Error::PermissionDenied)?;
    let mailbox_id = view.lock().unwrap().id;
    let permissions =
        Permissions::load(&ctx.db, mailbox_id, user_id, &login)?;
    if !permissions.allows(Rights::READ) {
        cmd.finish(not_accessible(&select.mailbox));
        return Ok(());
    }

    // EXAMINE is read-only by request; SELECT degrades to read-only when
    // the user cannot change anything anyway.
    let read_only = select.read_only
        || !(permissions.allows(Rights::KEEP_SEEN)
            || permissions.allows(Rights::WRITE)
            || permissions.allows(Rights::DELETE_MESSAGES));

    let session = Session::create(Arc::clone(&view), read_only, permissions);
    session_init::refresh(&mut ctx.db, &view)?;

    let flags = flag_list(ctx)?;
    cmd.respond_str(format!("* FLAGS ({})", flags.join(" ")));

    // The initial refresh left the new view pending; composing it now
    // yields the EXISTS and RECENT lines.
    {
        let mut session = session.lock().unwrap();
        session.emit_updates();
        for line in session.take_updates() {
            cmd.respond_str(line);
        }
        // A brand-new session has no flag changes to report.
        session.take_pending_fetch();
    }

    if let Some(unseen) = first_unseen_msn(ctx, &session)? {
        cmd.respond_str(format!(
            "* OK [UNSEEN {}] Message {} is first unseen",
            unseen, unseen
        ));
    }

    if read_only {
        cmd.respond_str("* OK [PERMANENTFLAGS ()] No permanent flags");
    } else {
        cmd.respond_str(format!(
            "* OK [PERMANENTFLAGS ({} \\*)] Flags permitted",
            flags.join(" ")
        ));
    }

    let (uidvalidity, uidnext, nextmodseq) = {
        let view = view.lock().unwrap();
        (view.uidvalidity(), view.uidnext(), view.nextmodseq())
    };
    cmd.respond_str(format!(
        "* OK [UIDVALIDITY {}] UIDs valid",
        uidvalidity
    ));
    cmd.respond_str(format!("* OK [UIDNEXT {}] Predicted next UID", uidnext));
    cmd.respond_str(format!(
        "* OK [HIGHESTMODSEQ {}] Highest mod-sequence",
        (nextmodseq - 1).max(1)
    ));

    info!(
        "{} selected {} ({})",
        ctx.log_prefix,
        select.mailbox,
        if read_only { "read-only" } else { "read-write" }
    );

    ctx.session = Some(session);
    ctx.state = ConnState::Selected;
    cmd.finish(
        Outcome::ok(format!("{} completed", cmd.name)).with_code(
            if read_only { "READ-ONLY" } else { "READ-WRITE" },
        ),
    );
    Ok(())
}

/// System flags plus every keyword known to the database.
fn flag_list(ctx: &ConnCtx) -> Result<Vec<String>, Error> {
    let mut flags: Vec<String> =
        SYSTEM_FLAGS.iter().map(|&f| f.to_owned()).collect();
    for (_, name) in ctx.db.all_flag_names()? {
        if !flags.iter().any(|f| f.eq_ignore_ascii_case(&name)) {
            flags.push(name);
        }
    }
    Ok(flags)
}

fn first_unseen_msn(
    ctx: &ConnCtx,
    session: &Arc<Mutex<Session>>,
) -> Result<Option<u32>, Error> {
    let session = session.lock().unwrap();
    if session.messages().is_empty() {
        return Ok(None);
    }

    let uid = ctx
        .db
        .cxn()
        .query_row(
            &format!(
                "SELECT MIN(`uid`) FROM `mailbox_messages` \
                 WHERE `mailbox` = ? AND NOT `seen` AND {}",
                session.messages().where_sql()
            ),
            (session.mailbox_id(),),
            from_single::<Option<u32>>,
        )
        .optional()?
        .flatten();

    Ok(uid.map(|uid| session.msn(uid)).filter(|&msn| msn != 0))
}

pub(super) fn close(
    ctx: &mut ConnCtx,
    cmd: &mut Command,
) -> Result<(), Error> {
    if let Some(session) = ctx.session.take() {
        let (read_only, may_expunge, mailbox) = {
            let session = session.lock().unwrap();
            (
                session.read_only(),
                session.allows(Rights::DELETE_MESSAGES),
                session.mailbox().clone(),
            )
        };

        // CLOSE expunges implicitly, with no untagged EXPUNGE responses.
        // The session is gone before the refresh runs, so nothing is
        // queued for this client; peers hear about it normally.
        drop(session);
        if !read_only && may_expunge {
            expunge_deleted(ctx, &mailbox)?;
        }
    }

    ctx.state = ConnState::Authenticated;
    cmd.finish(Outcome::ok("CLOSE completed"));
    Ok(())
}

pub(super) fn expunge(
    ctx: &mut ConnCtx,
    cmd: &mut Command,
    _expunge: &mut ExpungeCmd,
) -> Result<(), Error> {
    let session = ctx.session()?.clone();
    let (read_only, may_expunge, mailbox) = {
        let session = session.lock().unwrap();
        (
            session.read_only(),
            session.allows(Rights::DELETE_MESSAGES),
            session.mailbox().clone(),
        )
    };
    let name = mailbox.lock().unwrap().name.clone();

    if read_only {
        cmd.finish(Outcome::no("Mailbox is read-only"));
        return Ok(());
    }
    if !may_expunge {
        cmd.finish(not_accessible(&name));
        return Ok(());
    }

    let expunged = expunge_deleted(ctx, &mailbox)?;
    info!("{} expunged {} message(s)", ctx.log_prefix, expunged.count());

    // The untagged EXPUNGE responses arrive via the session update flush,
    // ahead of this tagged line.
    cmd.finish(Outcome::ok("EXPUNGE completed"));
    Ok(())
}

/// Removes every `\Deleted` message from the mailbox, writing tombstones
/// and consuming one modseq, then lets all sessions know.
///
/// Returns the set of expunged UIDs.
pub(crate) fn expunge_deleted(
    ctx: &mut ConnCtx,
    mailbox: &Arc<Mutex<MailboxView>>,
) -> Result<MessageSet, Error> {
    let (mailbox_id, mailbox_name) = {
        let view = mailbox.lock().unwrap();
        (view.id, view.name.clone())
    };

    let tx = ctx.db.write_tx()?;
    let modseq: i64 = tx.query_row(
        "SELECT `nextmodseq` FROM `mailboxes` WHERE `id` = ?",
        (mailbox_id,),
        from_single,
    )?;

    let mut doomed = MessageSet::new();
    {
        let mut stmt = tx.prepare(
            "SELECT `uid` FROM `mailbox_messages` \
             WHERE `mailbox` = ? AND `deleted`",
        )?;
        for row in stmt.query_map((mailbox_id,), from_single::<u32>)? {
            doomed.add(row?);
        }
    }

    if doomed.is_empty() {
        drop(tx);
        return Ok(doomed);
    }

    let predicate = doomed.where_sql();
    for table in ["mailbox_messages", "flags", "annotations",
                  "header_fields", "address_fields", "bodyparts"]
    {
        tx.execute(
            &format!(
                "DELETE FROM `{}` WHERE `mailbox` = ? AND {}",
                table, predicate
            ),
            (mailbox_id,),
        )?;
    }

    {
        let mut stmt = tx.prepare(
            "INSERT INTO `deleted_messages` (`mailbox`, `uid`, `modseq`) \
             VALUES (?, ?, ?)",
        )?;
        for uid in doomed.items() {
            stmt.execute((mailbox_id, uid, modseq))?;
        }
    }

    tx.execute(
        "UPDATE `mailboxes` SET `nextmodseq` = ? WHERE `id` = ?",
        (modseq + 1, mailbox_id),
    )?;
    tx.commit().map_err(|_| Error::TxFailed)?;

    mailbox.lock().unwrap().note_nextmodseq(modseq + 1);
    ctx.bus.send_nextmodseq(&mailbox_name, modseq + 1);
    session_init::refresh(&mut ctx.db, mailbox)?;

    Ok(doomed)
}
