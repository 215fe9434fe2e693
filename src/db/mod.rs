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

//! The database access layer.
//!
//! Every connection and background task owns its own `Db`. All state shared
//! between connections and between processes lives behind this; writers are
//! serialised by `BEGIN IMMEDIATE` transactions, which is how the modseq
//! allocation in STORE and the `\Seen` setter stay strictly monotonic.

use std::path::Path;
use std::time::Duration;

use chrono::prelude::*;
use log::info;
use rusqlite::OptionalExtension as _;

use crate::support::error::Error;

static MIGRATION_V1: &str = include_str!("schema.v1.sql");

pub struct Db {
    cxn: rusqlite::Connection,
}

impl Db {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let cxn = rusqlite::Connection::open(path)?;
        Self::init(cxn)
    }

    /// An in-memory database, used by tests.
    ///
    /// Note that each call produces an independent database; tests that need
    /// two connections to shared state must use a file in a temp directory.
    pub fn in_memory() -> Result<Self, Error> {
        Self::init(rusqlite::Connection::open_in_memory()?)
    }

    fn init(cxn: rusqlite::Connection) -> Result<Self, Error> {
        cxn.execute_batch("PRAGMA foreign_keys = ON")?;
        cxn.busy_timeout(Duration::from_secs(10))?;

        let mut this = Self { cxn };
        this.migrate()?;
        Ok(this)
    }

    fn migrate(&mut self) -> Result<(), Error> {
        let txn = self.cxn.transaction_with_behavior(
            rusqlite::TransactionBehavior::Exclusive,
        )?;
        txn.execute(
            "CREATE TABLE IF NOT EXISTS `migration` (\
               `version` INTEGER NOT NULL PRIMARY KEY, \
               `applied_at` TEXT NOT NULL\
             ) STRICT",
            (),
        )?;

        let current_version = txn
            .query_row(
                "SELECT MAX(`version`) FROM `migration`",
                (),
                from_single::<Option<u32>>,
            )?
            .unwrap_or(0);

        if current_version < 1 {
            info!("Applying V1 migration");
            txn.execute_batch(MIGRATION_V1)?;
            txn.execute(
                "INSERT INTO `migration` (`version`, `applied_at`) \
                 VALUES (1, ?)",
                (Utc::now().to_rfc3339(),),
            )?;
        }

        txn.commit()?;
        Ok(())
    }

    /// Start a write transaction.
    ///
    /// `IMMEDIATE` behaviour takes the database write lock up front, so two
    /// concurrent writers queue on `busy_timeout` instead of deadlocking at
    /// commit. Reading `nextmodseq` inside such a transaction is therefore
    /// equivalent to `SELECT ... FOR UPDATE` on the mailbox row.
    pub fn write_tx(&mut self) -> Result<rusqlite::Transaction<'_>, Error> {
        Ok(self.cxn.transaction_with_behavior(
            rusqlite::TransactionBehavior::Immediate,
        )?)
    }

    pub fn cxn(&self) -> &rusqlite::Connection {
        &self.cxn
    }

    /// Intern `name` into `flag_names`, returning its id.
    pub fn intern_flag(&mut self, name: &str) -> Result<i64, Error> {
        if let Some(id) = self.flag_id(name)? {
            return Ok(id);
        }

        self.cxn.execute(
            "INSERT OR IGNORE INTO `flag_names` (`name`) VALUES (?)",
            (name,),
        )?;
        Ok(self.flag_id(name)?.expect("flag vanished after insert"))
    }

    /// Look up the id of `name`, without creating it.
    ///
    /// Flag names are matched ASCII-case-insensitively, as clients disagree
    /// about the capitalisation of the system flags.
    pub fn flag_id(&self, name: &str) -> Result<Option<i64>, Error> {
        Ok(self
            .cxn
            .query_row(
                "SELECT `id` FROM `flag_names` \
                 WHERE `name` = ? COLLATE NOCASE",
                (name,),
                from_single,
            )
            .optional()?)
    }

    /// All flag names known to the database, in id order.
    pub fn all_flag_names(&self) -> Result<Vec<(i64, String)>, Error> {
        self.cxn
            .prepare("SELECT `id`, `name` FROM `flag_names` ORDER BY `id`")?
            .query_map((), from_row)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn user_by_login(
        &self,
        login: &str,
    ) -> Result<Option<(i64, String)>, Error> {
        Ok(self
            .cxn
            .query_row(
                "SELECT `id`, `secret` FROM `users` WHERE `login` = ?",
                (login,),
                from_row,
            )
            .optional()?)
    }
}

pub fn from_single<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<T> {
    row.get(0)
}

pub fn from_row<T: FromRow>(row: &rusqlite::Row<'_>) -> rusqlite::Result<T> {
    T::from_row(row)
}

pub trait FromRow: Sized {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self>;
}

macro_rules! tuple_from_row {
    ($($t:ident $ix:tt),*) => {
        impl<$($t: rusqlite::types::FromSql,)*> FromRow for ($($t,)*) {
            fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
                Ok(($(row.get($ix)?,)*))
            }
        }
    }
}

tuple_from_row!(A 0);
tuple_from_row!(A 0, B 1);
tuple_from_row!(A 0, B 1, C 2);
tuple_from_row!(A 0, B 1, C 2, D 3);
tuple_from_row!(A 0, B 1, C 2, D 3, E 4);
tuple_from_row!(A 0, B 1, C 2, D 3, E 4, F 5);
tuple_from_row!(A 0, B 1, C 2, D 3, E 4, F 5, G 6);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn migration_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ironpost.sqlite");
        {
            let _db = Db::open(&path).unwrap();
        }
        let db = Db::open(&path).unwrap();
        let version = db
            .cxn()
            .query_row(
                "SELECT MAX(`version`) FROM `migration`",
                (),
                from_single::<u32>,
            )
            .unwrap();
        assert_eq!(1, version);
    }

    #[test]
    fn flag_interning() {
        let mut db = Db::in_memory().unwrap();
        let flagged = db.intern_flag("\\Flagged").unwrap();
        assert_eq!(Some(flagged), db.flag_id("\\flagged").unwrap());
        assert_eq!(flagged, db.intern_flag("\\FLAGGED").unwrap());
        assert_ne!(flagged, db.intern_flag("$Junk").unwrap());
    }
}
