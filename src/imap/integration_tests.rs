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

//! End-to-end tests driving the real dispatcher, with several connections
//! sharing one database file and one mailbox registry the way separate
//! client connections do in production.

use std::path::PathBuf;
use std::sync::Arc;

use super::command::{ConnCtx, ConnState, Dispatcher};
use super::handlers;
use crate::cluster::Bus;
use crate::db::{from_row, from_single, Db};
use crate::store::mailbox::MailboxRegistry;
use crate::support::log_prefix::LogPrefix;

struct Fixture {
    _dir: tempfile::TempDir,
    path: PathBuf,
    registry: Arc<MailboxRegistry>,
    bus: Arc<Bus>,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("mail.sqlite");
        let db = Db::open(&path).unwrap();
        db.cxn()
            .execute(
                "INSERT INTO `users` (`login`, `secret`) \
                 VALUES ('azure', 'xyzzy')",
                (),
            )
            .unwrap();
        db.cxn()
            .execute(
                "INSERT INTO `mailboxes` (`name`, `owner`) \
                 VALUES ('INBOX', 1)",
                (),
            )
            .unwrap();

        Fixture {
            _dir: dir,
            path,
            registry: Arc::new(MailboxRegistry::new()),
            bus: Arc::new(Bus::capture()),
        }
    }

    fn db(&self) -> Db {
        Db::open(&self.path).unwrap()
    }

    fn set_mailbox(&self, uidnext: u32, nextmodseq: i64, first_recent: u32) {
        self.db()
            .cxn()
            .execute(
                "UPDATE `mailboxes` SET `uidnext` = ?, `nextmodseq` = ?, \
                 `first_recent` = ? WHERE `id` = 1",
                (uidnext, nextmodseq, first_recent),
            )
            .unwrap();
    }

    /// Injects a pre-parsed single-part message the way the delivery path
    /// would.
    fn deliver(&self, uid: u32, seen: bool, modseq: i64) {
        let db = self.db();
        let subject = "Hi";
        let body = b"hello\r\n";
        let raw = format!(
            "Subject: {}\r\nFrom: a@b\r\n\
             Date: Wed, 1 Jan 2020 00:00:00 +0000\r\n\r\nhello\r\n",
            subject
        );

        db.cxn()
            .execute(
                "INSERT INTO `mailbox_messages` \
                 (`mailbox`, `uid`, `modseq`, `seen`, `deleted`, \
                  `internaldate`, `rfc822size`) \
                 VALUES (1, ?, ?, ?, 0, '2020-01-01T00:00:00+00:00', 42)",
                (uid, modseq, seen),
            )
            .unwrap();
        for (position, (field, value)) in [
            ("Subject", subject),
            ("Date", "Wed, 1 Jan 2020 00:00:00 +0000"),
        ]
        .into_iter()
        .enumerate()
        {
            db.cxn()
                .execute(
                    "INSERT INTO `header_fields` \
                     (`mailbox`, `uid`, `part`, `position`, `field`, \
                      `value`) VALUES (1, ?, '', ?, ?, ?)",
                    (uid, position as u32 + 1, field, value),
                )
                .unwrap();
        }
        db.cxn()
            .execute(
                "INSERT INTO `address_fields` \
                 (`mailbox`, `uid`, `part`, `field`, `position`, `name`, \
                  `localpart`, `domain`) \
                 VALUES (1, ?, '', 'From', 1, NULL, 'a', 'b')",
                (uid,),
            )
            .unwrap();
        db.cxn()
            .execute(
                "INSERT INTO `bodyparts` \
                 (`mailbox`, `uid`, `part`, `bytes`, `lines`, \
                  `content_type`, `content_subtype`, `cte`, `text`) \
                 VALUES (1, ?, '', ?, 1, 'text', 'plain', '7bit', ?)",
                (uid, body.len(), raw.as_bytes()),
            )
            .unwrap();
        db.cxn()
            .execute(
                "INSERT INTO `bodyparts` \
                 (`mailbox`, `uid`, `part`, `bytes`, `lines`, \
                  `content_type`, `content_subtype`, `cte`, `text`) \
                 VALUES (1, ?, '1', ?, 1, 'text', 'plain', '7bit', ?)",
                (uid, body.len(), &body[..]),
            )
            .unwrap();

        db.cxn()
            .execute(
                "UPDATE `mailboxes` SET `uidnext` = MAX(`uidnext`, ?) \
                 WHERE `id` = 1",
                (uid + 1,),
            )
            .unwrap();
    }

    fn connect(&self) -> Conn {
        Conn {
            ctx: ConnCtx::new(
                self.db(),
                Arc::clone(&self.registry),
                Arc::clone(&self.bus),
                LogPrefix::new("test".to_owned()),
            ),
            dispatcher: Dispatcher::new(),
            out: Vec::new(),
        }
    }
}

struct Conn {
    ctx: ConnCtx,
    dispatcher: Dispatcher,
    out: Vec<u8>,
}

impl Conn {
    /// Feeds one command line and runs the dispatcher until everything is
    /// written, returning the response lines produced.
    fn cmd(&mut self, line: &str) -> Vec<String> {
        let start = self.out.len();
        let cmd = handlers::parse_command(&mut self.ctx, line.as_bytes());
        self.dispatcher.enqueue(cmd);

        let mut guard = 0;
        while !self.dispatcher.idle() {
            self.dispatcher
                .tick(&mut self.ctx, &mut self.out)
                .unwrap();
            guard += 1;
            assert!(guard < 10_000, "dispatcher failed to drain");
            if ConnState::Logout == self.ctx.state {
                break;
            }
        }

        String::from_utf8_lossy(&self.out[start..])
            .lines()
            .map(str::to_owned)
            .collect()
    }

    fn login_and_select(&mut self) {
        let lines = self.cmd("L1 LOGIN azure xyzzy");
        assert_eq!("L1 OK LOGIN completed", lines.last().unwrap());
        let lines = self.cmd("S1 SELECT INBOX");
        assert!(
            lines.last().unwrap().starts_with("S1 OK ["),
            "SELECT failed: {:?}",
            lines
        );
    }
}

fn mailbox_nextmodseq(fixture: &Fixture) -> i64 {
    fixture
        .db()
        .cxn()
        .query_row(
            "SELECT `nextmodseq` FROM `mailboxes` WHERE `id` = 1",
            (),
            from_single,
        )
        .unwrap()
}

#[test]
fn select_reports_mailbox_state() {
    let fixture = Fixture::new();
    fixture.deliver(1, true, 1);
    fixture.deliver(2, false, 2);
    fixture.set_mailbox(3, 3, 1);

    let mut conn = fixture.connect();
    conn.cmd("L1 LOGIN azure xyzzy");
    let lines = conn.cmd("S1 SELECT INBOX");

    assert!(lines.iter().any(|l| l.starts_with("* FLAGS (")));
    assert!(lines.contains(&"* 2 EXISTS".to_owned()));
    assert!(lines.contains(&"* 2 RECENT".to_owned()));
    assert!(lines
        .iter()
        .any(|l| l.starts_with("* OK [UNSEEN 2]")));
    assert!(lines
        .iter()
        .any(|l| l.starts_with("* OK [UIDVALIDITY 1]")));
    assert!(lines.iter().any(|l| l.starts_with("* OK [UIDNEXT 3]")));
    assert_eq!(
        "S1 OK [READ-WRITE] SELECT completed",
        lines.last().unwrap()
    );
}

#[test]
fn login_is_gated_and_checked() {
    let fixture = Fixture::new();
    let mut conn = fixture.connect();

    let lines = conn.cmd("A1 SELECT INBOX");
    assert_eq!("A1 BAD SELECT not allowed now", lines.last().unwrap());

    let lines = conn.cmd("A2 LOGIN azure wrong");
    assert_eq!("A2 NO Login failed", lines.last().unwrap());

    let lines = conn.cmd("A3 LOGIN azure xyzzy");
    assert_eq!("A3 OK LOGIN completed", lines.last().unwrap());
}

// FETCH with the ALL macro returns the attributes in macro order.
#[test]
fn fetch_macro_all() {
    let fixture = Fixture::new();
    fixture.deliver(7, true, 1);
    fixture.set_mailbox(8, 2, 8);

    let mut conn = fixture.connect();
    conn.login_and_select();

    let lines = conn.cmd("A1 UID FETCH 7 ALL");
    assert_eq!("A1 OK FETCH completed", lines.last().unwrap());
    let fetch = &lines[0];
    assert!(
        fetch.starts_with(
            "* 1 FETCH (UID 7 FLAGS (\\Seen) \
             INTERNALDATE \"01-Jan-2020 00:00:00 +0000\" \
             RFC822.SIZE 42 ENVELOPE ("
        ),
        "unexpected response: {}",
        fetch
    );
    assert!(fetch.contains("\"Hi\""));
    assert!(fetch.contains("((NIL NIL \"a\" \"b\"))"));
}

// A silent flag store changes the database but echoes nothing.
#[test]
fn store_silent_add_flag() {
    let fixture = Fixture::new();
    for uid in 1..=3 {
        fixture.deliver(uid, false, uid as i64);
    }
    fixture.set_mailbox(4, 5, 4);

    let mut conn = fixture.connect();
    conn.login_and_select();

    let lines = conn.cmd("A1 STORE 3 +FLAGS.SILENT (\\Flagged)");
    assert_eq!(vec!["A1 OK STORE completed".to_owned()], lines);

    let db = fixture.db();
    assert_eq!(6, mailbox_nextmodseq(&fixture));
    let (modseq, flagged): (i64, bool) = db
        .cxn()
        .query_row(
            "SELECT `modseq`, EXISTS(\
               SELECT 1 FROM `flags` `f` \
               JOIN `flag_names` `n` ON `n`.`id` = `f`.`flag` \
               WHERE `f`.`mailbox` = 1 AND `f`.`uid` = 3 \
               AND `n`.`name` = '\\Flagged') \
             FROM `mailbox_messages` WHERE `mailbox` = 1 AND `uid` = 3",
            (),
            from_row,
        )
        .unwrap();
    assert_eq!(5, modseq);
    assert!(flagged);

    // Only the one targeted row consumed the modseq; the others keep
    // their delivery modseqs.
    let others: i64 = db
        .cxn()
        .query_row(
            "SELECT MAX(`modseq`) FROM `mailbox_messages` \
             WHERE `mailbox` = 1 AND `uid` < 3",
            (),
            from_single,
        )
        .unwrap();
    assert_eq!(2, others);
}

// UNCHANGEDSINCE splits the set into stored and MODIFIED parts.
#[test]
fn store_unchangedsince_reports_modified() {
    let fixture = Fixture::new();
    fixture.deliver(1, false, 3);
    fixture.deliver(2, false, 8);
    fixture.set_mailbox(3, 10, 3);

    let mut conn = fixture.connect();
    conn.login_and_select();

    let lines = conn.cmd("A1 STORE 1:2 (UNCHANGEDSINCE 5) +FLAGS (\\Seen)");
    assert_eq!(
        "A1 OK [MODIFIED 2] STORE completed",
        lines.last().unwrap()
    );
    // The loud store reports the flags it set, with MODSEQ since the
    // client used CONDSTORE.
    assert!(
        lines
            .iter()
            .any(|l| l.starts_with("* 1 FETCH (UID 1 FLAGS (\\Seen)")
                && l.contains("MODSEQ (10)")),
        "missing flag update: {:?}",
        lines
    );

    let db = fixture.db();
    let rows: Vec<(u32, bool, i64)> = db
        .cxn()
        .prepare(
            "SELECT `uid`, `seen`, `modseq` FROM `mailbox_messages` \
             WHERE `mailbox` = 1 ORDER BY `uid`",
        )
        .unwrap()
        .query_map((), from_row)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(vec![(1, true, 10), (2, false, 8)], rows);
    assert_eq!(11, mailbox_nextmodseq(&fixture));
}

// Storing \Seen where it is already set consumes no modseq.
#[test]
fn redundant_store_consumes_no_modseq() {
    let fixture = Fixture::new();
    fixture.deliver(1, true, 1);
    fixture.set_mailbox(2, 5, 2);

    let mut conn = fixture.connect();
    conn.login_and_select();

    let lines = conn.cmd("A1 STORE 1 +FLAGS (\\Seen)");
    assert_eq!("A1 OK STORE completed", lines.last().unwrap());
    assert_eq!(5, mailbox_nextmodseq(&fixture));
}

// A FETCH naming a UID that was expunged by another connection, before
// this connection heard about it, gets a tagged NO (RFC 2180 4.1.2).
#[test]
fn fetch_of_pending_expunged_uid() {
    let fixture = Fixture::new();
    for uid in 1..=5 {
        fixture.deliver(uid, true, 1);
    }
    fixture.set_mailbox(6, 2, 6);

    let mut conn_a = fixture.connect();
    conn_a.login_and_select();

    let mut conn_b = fixture.connect();
    conn_b.login_and_select();
    conn_b.cmd("B1 STORE 5 +FLAGS.SILENT (\\Deleted)");
    let lines = conn_b.cmd("B2 EXPUNGE");
    assert!(lines.contains(&"* 5 EXPUNGE".to_owned()));

    // A has not yet been told; the expunge is pending in its session.
    let lines = conn_a.cmd("A1 UID FETCH 5 FLAGS");
    assert!(
        !lines.iter().any(|l| l.contains("FETCH (")),
        "expunged message must not be fetched: {:?}",
        lines
    );
    assert_eq!(
        "A1 NO UID(s) 5 has/have been expunged",
        lines.last().unwrap()
    );
    // The pending expunge was announced along the way.
    assert!(lines.contains(&"* 5 EXPUNGE".to_owned()));
}

// A new delivery reaches an idle peer session on its next command.
#[test]
fn delivery_is_announced_to_peer() {
    let fixture = Fixture::new();

    let mut conn = fixture.connect();
    conn.login_and_select();

    fixture.deliver(10, false, 7);
    fixture
        .db()
        .cxn()
        .execute("UPDATE `mailboxes` SET `nextmodseq` = 8", ())
        .unwrap();

    let lines = conn.cmd("A1 NOOP");
    assert_eq!(
        vec![
            "* 1 EXISTS".to_owned(),
            "* 1 RECENT".to_owned(),
            "A1 OK NOOP completed".to_owned(),
        ],
        lines
    );

    // The new message is addressable immediately afterwards.
    let lines = conn.cmd("A2 FETCH 1 (UID FLAGS)");
    assert!(lines[0].starts_with("* 1 FETCH (UID 10 FLAGS (\\Recent"));
}

// Annotations round-trip through STORE and FETCH.
#[test]
fn annotation_store_and_fetch() {
    let fixture = Fixture::new();
    fixture.deliver(1, true, 1);
    fixture.set_mailbox(2, 2, 2);

    let mut conn = fixture.connect();
    conn.login_and_select();

    let lines =
        conn.cmd("A1 STORE 1 ANNOTATION (/comment (value.priv \"hello\"))");
    assert_eq!("A1 OK STORE completed", lines.last().unwrap());

    let row: (String, String, Option<i64>) = fixture
        .db()
        .cxn()
        .query_row(
            "SELECT `name`, `value`, `owner` FROM `annotations` \
             WHERE `mailbox` = 1 AND `uid` = 1",
            (),
            from_row,
        )
        .unwrap();
    assert_eq!(("/comment".to_owned(), "hello".to_owned(), Some(1)), row);

    let lines = conn.cmd("A2 FETCH 1 ANNOTATION (/comment value.priv)");
    assert!(
        lines.contains(
            &"* 1 FETCH (ANNOTATION (/comment (value.priv \"hello\")))"
                .to_owned()
        ),
        "unexpected: {:?}",
        lines
    );
    assert_eq!("A2 OK FETCH completed", lines.last().unwrap());

    // Clearing the value removes the row.
    conn.cmd("A3 STORE 1 ANNOTATION (/comment (value.priv \"\"))");
    let count: i64 = fixture
        .db()
        .cxn()
        .query_row("SELECT COUNT(*) FROM `annotations`", (), from_single)
        .unwrap();
    assert_eq!(0, count);
}

// Body sections and the implicit \Seen store.
#[test]
fn fetch_body_sets_seen() {
    let fixture = Fixture::new();
    fixture.deliver(1, false, 1);
    fixture.set_mailbox(2, 3, 2);

    let mut conn = fixture.connect();
    conn.login_and_select();

    let lines = conn.cmd("A1 FETCH 1 BODY[TEXT]");
    assert!(
        lines[0].starts_with("* 1 FETCH (BODY[TEXT] {7}"),
        "unexpected: {:?}",
        lines
    );
    assert_eq!("A1 OK FETCH completed", lines.last().unwrap());

    let seen: bool = fixture
        .db()
        .cxn()
        .query_row(
            "SELECT `seen` FROM `mailbox_messages` \
             WHERE `mailbox` = 1 AND `uid` = 1",
            (),
            from_single,
        )
        .unwrap();
    assert!(seen);
    // The implicit store consumed one modseq.
    assert_eq!(4, mailbox_nextmodseq(&fixture));

    // A peeked fetch must not touch \Seen again, nor consume a modseq.
    conn.cmd("A2 STORE 1 -FLAGS.SILENT (\\Seen)");
    let before = mailbox_nextmodseq(&fixture);
    conn.cmd("A3 FETCH 1 BODY.PEEK[TEXT]");
    assert_eq!(before, mailbox_nextmodseq(&fixture));
}

// The whole server loop over in-memory buffers, literals included.
#[test]
fn full_session_over_buffers() {
    let fixture = Fixture::new();
    fixture.deliver(1, true, 1);
    fixture.set_mailbox(2, 2, 2);

    let input: &[u8] = b"L1 LOGIN {5+}\r\nazure xyzzy\r\n\
                         S1 SELECT INBOX\r\n\
                         F1 UID FETCH 1 (FLAGS)\r\n\
                         Q1 LOGOUT\r\n";
    let mut output = Vec::new();

    let ctx = ConnCtx::new(
        fixture.db(),
        Arc::clone(&fixture.registry),
        Arc::clone(&fixture.bus),
        LogPrefix::new("test".to_owned()),
    );
    super::server::run_connection(
        std::io::BufReader::new(input),
        &mut output,
        ctx,
        std::time::Duration::ZERO,
    )
    .unwrap();

    let output = String::from_utf8_lossy(&output);
    let lines: Vec<&str> = output.lines().collect();
    assert!(lines[0].starts_with("* OK [CAPABILITY IMAP4rev1"));
    assert!(lines.contains(&"L1 OK LOGIN completed"));
    assert!(lines.contains(&"S1 OK [READ-WRITE] SELECT completed"));
    assert!(lines
        .iter()
        .any(|l| l.starts_with("* 1 FETCH (UID 1 FLAGS")));
    assert!(lines.contains(&"* BYE Have a nice day"));
    assert!(lines.contains(&"Q1 OK LOGOUT completed"));
}
