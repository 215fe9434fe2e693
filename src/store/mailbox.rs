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

//! The process-wide shared view of each opened mailbox.
//!
//! One `MailboxView` exists per mailbox per process, shared by every
//! connection that has the mailbox selected. It mirrors the mailbox's
//! database row (`uidnext`, `nextmodseq`, ...) and holds weak handles to
//! the live sessions so a `SessionInitialiser` can bring them forward.
//!
//! Lock order: a `MailboxView` lock is always taken before any `Session`
//! lock, never the other way around.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::db::{from_row, Db};
use crate::store::session::Session;
use crate::support::error::Error;

pub struct MailboxView {
    pub id: i64,
    pub name: String,
    uidnext: u32,
    nextmodseq: i64,
    uidvalidity: u32,
    sessions: Vec<Weak<Mutex<Session>>>,
    initialiser_running: bool,
    refresh_again: bool,
}

impl MailboxView {
    pub fn uidnext(&self) -> u32 {
        self.uidnext
    }

    pub fn nextmodseq(&self) -> i64 {
        self.nextmodseq
    }

    pub fn uidvalidity(&self) -> u32 {
        self.uidvalidity
    }

    /// Fold in a `uidnext` observed from the database. Never moves backwards.
    pub fn note_uidnext(&mut self, uidnext: u32) {
        if uidnext > self.uidnext {
            self.uidnext = uidnext;
        }
    }

    /// Fold in a `nextmodseq` observed from the database.
    pub fn note_nextmodseq(&mut self, nextmodseq: i64) {
        if nextmodseq > self.nextmodseq {
            self.nextmodseq = nextmodseq;
        }
    }

    /// Re-read the mailbox row so changes committed by other processes
    /// become visible before a refresh runs.
    pub fn reload(&mut self, db: &Db) -> Result<(), Error> {
        let (uidnext, nextmodseq, uidvalidity) = db.cxn().query_row(
            "SELECT `uidnext`, `nextmodseq`, `uidvalidity` \
             FROM `mailboxes` WHERE `id` = ?",
            (self.id,),
            from_row::<(u32, i64, u32)>,
        )?;
        self.note_uidnext(uidnext);
        self.note_nextmodseq(nextmodseq);
        self.uidvalidity = uidvalidity;
        Ok(())
    }

    pub fn attach_session(&mut self, session: Weak<Mutex<Session>>) {
        self.sessions.push(session);
    }

    /// Upgrade all live session handles, purging the dead ones.
    ///
    /// The returned order is attachment order, oldest first.
    pub fn live_sessions(&mut self) -> Vec<Arc<Mutex<Session>>> {
        let mut live = Vec::with_capacity(self.sessions.len());
        self.sessions.retain(|weak| match weak.upgrade() {
            Some(session) => {
                live.push(session);
                true
            },
            None => false,
        });
        live
    }

    /// The most recently attached live session, used to seed a new
    /// session's snapshot.
    pub fn newest_session(&mut self) -> Option<Arc<Mutex<Session>>> {
        self.live_sessions().pop()
    }

    /// Try to claim the right to run a `SessionInitialiser`.
    ///
    /// Returns false if one is already running, in which case the running
    /// initialiser is flagged to run again when it completes.
    pub fn begin_refresh(&mut self) -> bool {
        if self.initialiser_running {
            self.refresh_again = true;
            false
        } else {
            self.initialiser_running = true;
            true
        }
    }

    /// Clears all refresh state after a failed pass so the next trigger
    /// can start over.
    pub fn abort_refresh(&mut self) {
        self.initialiser_running = false;
        self.refresh_again = false;
    }

    /// Complete a refresh; returns true if another pass was requested while
    /// this one ran.
    pub fn end_refresh(&mut self) -> bool {
        let again = self.refresh_again;
        self.refresh_again = false;
        if !again {
            self.initialiser_running = false;
        }
        again
    }
}

/// The registry of shared mailbox views, owned by the server and handed to
/// every connection as an `Arc`.
#[derive(Default)]
pub struct MailboxRegistry {
    mailboxes: Mutex<HashMap<i64, Arc<Mutex<MailboxView>>>>,
}

impl MailboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `name` in the database and return the shared view, creating
    /// it if this is the first time the mailbox is opened in this process.
    pub fn open(
        &self,
        db: &Db,
        name: &str,
    ) -> Result<Arc<Mutex<MailboxView>>, Error> {
        let (id, uidnext, nextmodseq, uidvalidity) = db
            .cxn()
            .query_row(
                "SELECT `id`, `uidnext`, `nextmodseq`, `uidvalidity` \
                 FROM `mailboxes` WHERE `name` = ?",
                (name,),
                from_row::<(i64, u32, i64, u32)>,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Error::NxMailbox,
                e => Error::Sql(e),
            })?;

        let mut mailboxes = self.mailboxes.lock().unwrap();
        let entry = mailboxes
            .entry(id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(MailboxView {
                    id,
                    name: name.to_owned(),
                    uidnext,
                    nextmodseq,
                    uidvalidity,
                    sessions: Vec::new(),
                    initialiser_running: false,
                    refresh_again: false,
                }))
            })
            .clone();
        drop(mailboxes);

        {
            let mut view = entry.lock().unwrap();
            view.note_uidnext(uidnext);
            view.note_nextmodseq(nextmodseq);
        }

        Ok(entry)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_db() -> Db {
        let db = Db::in_memory().unwrap();
        db.cxn()
            .execute(
                "INSERT INTO `mailboxes` (`name`, `uidnext`, `nextmodseq`) \
                 VALUES ('INBOX', 5, 9)",
                (),
            )
            .unwrap();
        db
    }

    #[test]
    fn open_is_shared_and_folds_forward() {
        let db = test_db();
        let registry = MailboxRegistry::new();

        let a = registry.open(&db, "INBOX").unwrap();
        assert_eq!(5, a.lock().unwrap().uidnext());

        db.cxn()
            .execute("UPDATE `mailboxes` SET `uidnext` = 7", ())
            .unwrap();
        let b = registry.open(&db, "INBOX").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(7, a.lock().unwrap().uidnext());
    }

    #[test]
    fn open_unknown_mailbox_fails() {
        let db = test_db();
        let registry = MailboxRegistry::new();
        assert!(matches!(
            registry.open(&db, "Nonsense"),
            Err(Error::NxMailbox)
        ));
    }

    #[test]
    fn refresh_claims_coalesce() {
        let db = test_db();
        let registry = MailboxRegistry::new();
        let view = registry.open(&db, "INBOX").unwrap();
        let mut view = view.lock().unwrap();

        assert!(view.begin_refresh());
        assert!(!view.begin_refresh());
        assert!(!view.begin_refresh());
        // The running initialiser is told to go again exactly once.
        assert!(view.end_refresh());
        assert!(!view.end_refresh());
        assert!(view.begin_refresh());
    }
}
