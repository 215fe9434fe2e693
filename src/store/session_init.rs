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

//! The SessionInitialiser performs the database work needed to initialise
//! or update the `Session`s attached to one mailbox.
//!
//! It runs whenever a modifying transaction commits (`refresh`) and when a
//! session is first created. One initialiser runs per mailbox at a time;
//! refreshes requested while one is running coalesce into a single rerun.
//!
//! The pass is a state machine stepped to completion on the caller's
//! thread. All query results are buffered before any session is touched,
//! so a failed pass leaves every session exactly as it found it. Session
//! cursors advance only after the untagged responses have been queued,
//! which is what guarantees a client is never told the mailbox moved past
//! a modseq before seeing the message that carried it.

use std::sync::{Arc, Mutex};

use log::{debug, error};

use super::mailbox::MailboxView;
use super::message_set::MessageSet;
use super::session::Session;
use crate::db::{from_row, from_single, Db};
use crate::support::error::Error;

/// Brings all sessions of `mailbox` forward, coalescing with any refresh
/// already in flight.
///
/// Called after every committed modifying transaction on the mailbox, and
/// after a new session is created.
pub fn refresh(
    db: &mut Db,
    mailbox: &Arc<Mutex<MailboxView>>,
) -> Result<(), Error> {
    if !mailbox.lock().unwrap().begin_refresh() {
        return Ok(());
    }

    loop {
        let result = SessionInitialiser::new(Arc::clone(mailbox)).run(db);
        if let Err(e) = result {
            error!(
                "Session refresh for mailbox {} failed: {}",
                mailbox.lock().unwrap().name,
                e
            );
            // Sessions were left untouched; the next trigger retries.
            mailbox.lock().unwrap().abort_refresh();
            return Err(e);
        }

        if !mailbox.lock().unwrap().end_refresh() {
            return Ok(());
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    NoTransaction,
    WaitingForLock,
    HaveUidnext,
    ReceivingChanges,
    Updated,
    QueriesDone,
}

struct SessionInitialiser {
    mailbox: Arc<Mutex<MailboxView>>,
    sessions: Vec<Arc<Mutex<Session>>>,
    state: State,

    old_uidnext: u32,
    new_uidnext: u32,
    old_modseq: i64,
    new_modseq: i64,

    change_recent: bool,
    first_recent: Option<u32>,
    /// Index into `sessions` of the session that gets the new `\Recent`
    /// range, and the range itself, applied once all queries succeeded.
    recent_assignment: Option<(usize, u32, u32)>,

    message_rows: Vec<(u32, i64)>,
    expunged: MessageSet,
}

impl SessionInitialiser {
    fn new(mailbox: Arc<Mutex<MailboxView>>) -> Self {
        SessionInitialiser {
            mailbox,
            sessions: Vec::new(),
            state: State::NoTransaction,
            old_uidnext: 0,
            new_uidnext: 0,
            old_modseq: 0,
            new_modseq: 0,
            change_recent: false,
            first_recent: None,
            recent_assignment: None,
            message_rows: Vec::new(),
            expunged: MessageSet::new(),
        }
    }

    fn run(mut self, db: &mut Db) -> Result<(), Error> {
        self.mailbox.lock().unwrap().reload(db)?;

        self.find_sessions();
        if self.sessions.is_empty() {
            return Ok(());
        }

        let tx = db.write_tx()?;
        while State::QueriesDone != self.state {
            match self.state {
                State::NoTransaction => {
                    self.grab_lock();
                    self.state = State::WaitingForLock;
                },
                State::WaitingForLock => {
                    self.find_recent(&tx)?;
                    self.state = State::HaveUidnext;
                },
                State::HaveUidnext => {
                    self.assign_recent(&tx)?;
                    self.state = State::ReceivingChanges;
                },
                State::ReceivingChanges => {
                    self.find_mailbox_changes(&tx)?;
                    self.state = State::Updated;
                },
                State::Updated => {
                    self.record_mailbox_changes();
                    self.record_expunges();
                    self.state = State::QueriesDone;
                },
                State::QueriesDone => unreachable!(),
            }
        }

        self.advance_cursors();
        tx.commit().map_err(|_| Error::TxFailed)?;
        Ok(())
    }

    /// Finds all sessions that may be updated by this pass and computes
    /// the cursor window.
    fn find_sessions(&mut self) {
        let mut view = self.mailbox.lock().unwrap();
        self.new_uidnext = view.uidnext();
        self.new_modseq = view.nextmodseq();
        self.old_uidnext = self.new_uidnext;
        self.old_modseq = self.new_modseq;

        self.sessions = view.live_sessions();
        drop(view);

        for session in &self.sessions {
            let session = session.lock().unwrap();
            self.old_uidnext = self.old_uidnext.min(session.uidnext());
            self.old_modseq = self.old_modseq.min(session.nextmodseq());
        }

        // If no session is behind the mailbox, there is nothing to do.
        if self.new_uidnext <= self.old_uidnext
            && self.new_modseq <= self.old_modseq
        {
            self.sessions.clear();
        }
    }

    /// Decides whether `\Recent` must be reassigned.
    ///
    /// There is no actual lock: RFC 3501 only says `\Recent` SHOULD go to
    /// one session, so we update "safely" (never losing data) and accept
    /// that two processes racing here may both hand out `\Recent`.
    fn grab_lock(&mut self) {
        self.change_recent = false;
        let mut highest_recent = 0u32;
        for session in &self.sessions {
            let session = session.lock().unwrap();
            if !session.read_only() {
                self.change_recent = true;
            }
            highest_recent =
                highest_recent.max(session.recent().largest().unwrap_or(0));
        }

        if highest_recent + 1 == self.new_uidnext {
            self.change_recent = false;
        }

        debug!(
            "Updating {} session(s) on {} for modseq [{},{}>, UID [{},{}>",
            self.sessions.len(),
            self.mailbox.lock().unwrap().name,
            self.old_modseq,
            self.new_modseq,
            self.old_uidnext,
            self.new_uidnext
        );

        self.first_recent = if highest_recent + 1 < self.new_uidnext {
            // Sentinel meaning "fetch from the database".
            Some(0)
        } else {
            None
        };
    }

    /// Fetches `first_recent` from the database when `grab_lock` decided
    /// it is needed.
    fn find_recent(
        &mut self,
        tx: &rusqlite::Transaction<'_>,
    ) -> Result<(), Error> {
        if self.first_recent.is_none() {
            return Ok(());
        }

        let first_recent = tx.query_row(
            "SELECT `first_recent` FROM `mailboxes` WHERE `id` = ?",
            (self.mailbox.lock().unwrap().id,),
            from_single::<u32>,
        )?;
        self.first_recent = Some(first_recent);
        Ok(())
    }

    /// Assigns `[first_recent, new_uidnext)` as `\Recent` to the first
    /// writable session (falling back to the first session), and persists
    /// the advance when a writable session exists.
    fn assign_recent(
        &mut self,
        tx: &rusqlite::Transaction<'_>,
    ) -> Result<(), Error> {
        let first_recent = match self.first_recent {
            Some(v) => v,
            None => return Ok(()),
        };

        if first_recent >= self.new_uidnext {
            return Ok(());
        }

        let assignee = self
            .sessions
            .iter()
            .position(|s| !s.lock().unwrap().read_only())
            .unwrap_or(0);
        self.recent_assignment =
            Some((assignee, first_recent.max(1), self.new_uidnext - 1));

        if self.change_recent {
            tx.execute(
                "UPDATE `mailboxes` SET `first_recent` = ?2 \
                 WHERE `id` = ?1 AND `first_recent` < ?2",
                (self.mailbox.lock().unwrap().id, self.new_uidnext),
            )?;
        }

        Ok(())
    }

    /// Queries for new and changed messages, and for newly expunged
    /// messages, buffering the results.
    fn find_mailbox_changes(
        &mut self,
        tx: &rusqlite::Transaction<'_>,
    ) -> Result<(), Error> {
        let mailbox_id = self.mailbox.lock().unwrap().id;
        let initialising = self.old_uidnext <= 1;

        let mut sql = "SELECT `uid`, `modseq` FROM `mailbox_messages` \
                       WHERE `mailbox` = ?1 AND `uid` < ?2"
            .to_owned();
        if !initialising {
            sql.push_str(" AND (`uid` >= ?3 OR `modseq` >= ?4)");
        }

        let mut stmt = tx.prepare(&sql)?;
        self.message_rows = if initialising {
            stmt.query_map(
                (mailbox_id, self.new_uidnext),
                from_row::<(u32, i64)>,
            )?
            .collect::<Result<Vec<_>, _>>()?
        } else {
            stmt.query_map(
                (
                    mailbox_id,
                    self.new_uidnext,
                    self.old_uidnext,
                    self.old_modseq,
                ),
                from_row::<(u32, i64)>,
            )?
            .collect::<Result<Vec<_>, _>>()?
        };

        if initialising {
            return Ok(());
        }

        let mut stmt = tx.prepare(
            "SELECT `uid` FROM `deleted_messages` \
             WHERE `mailbox` = ?1 AND `modseq` >= ?2",
        )?;
        for row in
            stmt.query_map((mailbox_id, self.old_modseq), from_single::<u32>)?
        {
            self.expunged.add(row?);
        }

        Ok(())
    }

    /// Adds each new or changed UID to every session that has not seen it.
    fn record_mailbox_changes(&mut self) {
        if let Some((assignee, lo, hi)) = self.recent_assignment {
            let mut session = self.sessions[assignee].lock().unwrap();
            for uid in lo..=hi {
                session.add_recent(uid);
            }
        }

        for &(uid, modseq) in &self.message_rows {
            for session in &self.sessions {
                let mut session = session.lock().unwrap();
                if uid >= session.uidnext()
                    || modseq >= session.nextmodseq()
                {
                    session.add_unannounced(uid);
                }
            }
        }
    }

    /// Records expunges found in the database but new to us in every
    /// attached session.
    fn record_expunges(&mut self) {
        if self.expunged.is_empty() {
            return;
        }

        for session in &self.sessions {
            session.lock().unwrap().expunge(&self.expunged);
        }
    }

    /// Advances each session's cursors, after everything has been queued
    /// on it.
    ///
    /// The sessions' untagged responses are composed later, by each
    /// owning connection at its next safe flush point; the recorded
    /// expunges and additions stay pending (and visible to FETCH and
    /// STORE) until then.
    fn advance_cursors(&mut self) {
        for session in &self.sessions {
            let mut session = session.lock().unwrap();
            if session.nextmodseq() < self.new_modseq {
                session.set_nextmodseq(self.new_modseq);
            }
            if session.uidnext() < self.new_uidnext {
                session.set_uidnext(self.new_uidnext);
            }
        }

        self.sessions.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::rights::{Permissions, Rights};

    struct Fixture {
        db: Db,
        mailbox: Arc<Mutex<MailboxView>>,
    }

    impl Fixture {
        fn new() -> Self {
            let db = Db::in_memory().unwrap();
            db.cxn()
                .execute(
                    "INSERT INTO `mailboxes` \
                     (`name`, `uidnext`, `nextmodseq`, `first_recent`) \
                     VALUES ('INBOX', 1, 1, 1)",
                    (),
                )
                .unwrap();
            let registry = crate::store::mailbox::MailboxRegistry::new();
            let mailbox = registry.open(&db, "INBOX").unwrap();
            Fixture { db, mailbox }
        }

        /// Simulates delivery of a message with the given UID, stamping
        /// it with the mailbox's current modseq the way the delivery
        /// path does.
        fn deliver(&mut self, uid: u32) {
            let modseq: i64 = self
                .db
                .cxn()
                .query_row(
                    "SELECT `nextmodseq` FROM `mailboxes` WHERE `id` = 1",
                    (),
                    from_single,
                )
                .unwrap();
            self.db
                .cxn()
                .execute(
                    "INSERT INTO `mailbox_messages` \
                     (`mailbox`, `uid`, `modseq`, `internaldate`, \
                      `rfc822size`) \
                     VALUES (1, ?, ?, '2020-01-01T00:00:00+00:00', 42)",
                    (uid, modseq),
                )
                .unwrap();
            self.db
                .cxn()
                .execute(
                    "UPDATE `mailboxes` SET `uidnext` = ?, \
                     `nextmodseq` = ?",
                    (uid + 1, modseq + 1),
                )
                .unwrap();
        }

        fn bump_modseq(&mut self, uid: u32) -> i64 {
            let modseq: i64 = self
                .db
                .cxn()
                .query_row(
                    "SELECT `nextmodseq` FROM `mailboxes` WHERE `id` = 1",
                    (),
                    from_single,
                )
                .unwrap();
            self.db
                .cxn()
                .execute(
                    "UPDATE `mailbox_messages` SET `modseq` = ? \
                     WHERE `mailbox` = 1 AND `uid` = ?",
                    (modseq, uid),
                )
                .unwrap();
            self.db
                .cxn()
                .execute(
                    "UPDATE `mailboxes` SET `nextmodseq` = ?",
                    (modseq + 1,),
                )
                .unwrap();
            modseq
        }

        fn expunge(&mut self, uid: u32) {
            let modseq: i64 = self
                .db
                .cxn()
                .query_row(
                    "SELECT `nextmodseq` FROM `mailboxes` WHERE `id` = 1",
                    (),
                    from_single,
                )
                .unwrap();
            self.db
                .cxn()
                .execute(
                    "DELETE FROM `mailbox_messages` \
                     WHERE `mailbox` = 1 AND `uid` = ?",
                    (uid,),
                )
                .unwrap();
            self.db
                .cxn()
                .execute(
                    "INSERT INTO `deleted_messages` \
                     (`mailbox`, `uid`, `modseq`) VALUES (1, ?, ?)",
                    (uid, modseq),
                )
                .unwrap();
            self.db
                .cxn()
                .execute(
                    "UPDATE `mailboxes` SET `nextmodseq` = ?",
                    (modseq + 1,),
                )
                .unwrap();
        }

        fn session(&self, read_only: bool) -> Arc<Mutex<Session>> {
            Session::create(
                Arc::clone(&self.mailbox),
                read_only,
                Permissions::of(Rights::all_rights()),
            )
        }
    }

    #[test]
    fn initialises_fresh_session() {
        let mut fixture = Fixture::new();
        fixture.deliver(1);
        fixture.deliver(2);

        let session = fixture.session(false);
        refresh(&mut fixture.db, &fixture.mailbox).unwrap();

        let mut session = session.lock().unwrap();
        session.emit_updates();
        assert_eq!(2, session.count());
        assert_eq!("1:2", session.messages().set());
        assert_eq!("1:2", session.recent().set());
        assert_eq!(3, session.uidnext());
        assert_eq!(vec!["* 2 EXISTS", "* 2 RECENT"], session.take_updates());

        // first_recent advanced in the database.
        let first_recent: u32 = fixture
            .db
            .cxn()
            .query_row(
                "SELECT `first_recent` FROM `mailboxes` WHERE `id` = 1",
                (),
                from_single,
            )
            .unwrap();
        assert_eq!(3, first_recent);
    }

    #[test]
    fn idempotent_when_nothing_changed() {
        let mut fixture = Fixture::new();
        fixture.deliver(1);
        let session = fixture.session(false);
        refresh(&mut fixture.db, &fixture.mailbox).unwrap();
        {
            let mut session = session.lock().unwrap();
            session.emit_updates();
            session.take_updates();
        }

        refresh(&mut fixture.db, &fixture.mailbox).unwrap();
        let mut session = session.lock().unwrap();
        session.emit_updates();
        assert!(session.take_updates().is_empty());
        assert!(session.take_pending_fetch().is_empty());
    }

    #[test]
    fn recent_goes_to_first_writable_session() {
        let mut fixture = Fixture::new();
        fixture.deliver(1);

        let observer = fixture.session(true);
        let writer = fixture.session(false);
        refresh(&mut fixture.db, &fixture.mailbox).unwrap();
        observer.lock().unwrap().emit_updates();
        writer.lock().unwrap().emit_updates();

        assert!(observer.lock().unwrap().recent().is_empty());
        assert_eq!("1", writer.lock().unwrap().recent().set());
    }

    #[test]
    fn delivery_reaches_idle_peer_session() {
        let mut fixture = Fixture::new();
        fixture.deliver(1);
        let session = fixture.session(false);
        refresh(&mut fixture.db, &fixture.mailbox).unwrap();
        {
            let mut session = session.lock().unwrap();
            session.emit_updates();
            session.take_updates();
        }

        fixture.deliver(2);
        refresh(&mut fixture.db, &fixture.mailbox).unwrap();

        let mut session = session.lock().unwrap();
        session.emit_updates();
        assert_eq!(
            vec!["* 2 EXISTS", "* 2 RECENT"],
            session.take_updates()
        );
        assert_eq!(3, session.uidnext());
    }

    #[test]
    fn flag_change_routes_to_pending_fetch() {
        let mut fixture = Fixture::new();
        fixture.deliver(1);
        let session = fixture.session(false);
        refresh(&mut fixture.db, &fixture.mailbox).unwrap();
        {
            let mut session = session.lock().unwrap();
            session.emit_updates();
            session.take_updates();
        }

        fixture.bump_modseq(1);
        refresh(&mut fixture.db, &fixture.mailbox).unwrap();

        let mut session = session.lock().unwrap();
        session.emit_updates();
        assert_eq!("1", session.take_pending_fetch().set());
        let mailbox = fixture.mailbox.lock().unwrap();
        assert!(session.initialised(
            mailbox.uidnext(),
            mailbox.nextmodseq()
        ));
    }

    #[test]
    fn expunge_reaches_every_session() {
        let mut fixture = Fixture::new();
        fixture.deliver(1);
        fixture.deliver(2);
        let a = fixture.session(false);
        let b = fixture.session(true);
        refresh(&mut fixture.db, &fixture.mailbox).unwrap();
        for session in [&a, &b] {
            let mut session = session.lock().unwrap();
            session.emit_updates();
            session.take_updates();
        }

        fixture.expunge(1);
        refresh(&mut fixture.db, &fixture.mailbox).unwrap();

        for session in [&a, &b] {
            let mut session = session.lock().unwrap();
            // The pending expunge is visible until the owning connection
            // composes its announcements.
            assert_eq!("1", session.expunged().set());
            session.emit_updates();
            // The EXPUNGE itself tells the client the count shrank, so no
            // EXISTS follows.
            assert_eq!(vec!["* 1 EXPUNGE"], session.take_updates());
            assert_eq!("2", session.messages().set());
        }
    }

    #[test]
    fn cursor_invariants_hold() {
        let mut fixture = Fixture::new();
        fixture.deliver(1);
        fixture.deliver(2);
        let a = fixture.session(false);
        let b = fixture.session(true);
        refresh(&mut fixture.db, &fixture.mailbox).unwrap();
        fixture.bump_modseq(2);
        refresh(&mut fixture.db, &fixture.mailbox).unwrap();

        let mailbox = fixture.mailbox.lock().unwrap();
        for session in [&a, &b] {
            let session = session.lock().unwrap();
            assert!(session.uidnext() <= mailbox.uidnext());
            assert!(session.nextmodseq() <= mailbox.nextmodseq());
        }
    }
}
