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

//! One client's view of one mailbox, created by SELECT/EXAMINE.
//!
//! A `Session` holds everything the client believes about the mailbox: the
//! message sequence numbering (`msns`), which messages it has been told are
//! `\Recent`, which expunges and additions it has not been told about yet,
//! and the `uidnext`/`nextmodseq` cursors recording how far forward it has
//! been brought.
//!
//! The session is owned by its connection (through an `Arc` whose only
//! strong references live on that connection); the shared `MailboxView`
//! keeps a `Weak` so the `SessionInitialiser` can find it. See the lock
//! order note in `mailbox.rs`.

use std::sync::{Arc, Mutex};

use super::mailbox::MailboxView;
use super::message_set::MessageSet;
use super::rights::{Permissions, Rights};

pub struct Session {
    mailbox: Arc<Mutex<MailboxView>>,
    mailbox_id: i64,
    read_only: bool,
    permissions: Permissions,

    uidnext: u32,
    nextmodseq: i64,
    msns: MessageSet,
    recent: MessageSet,
    expunges: MessageSet,
    unannounced: MessageSet,

    /// The modseq allocated by this session's own silent STORE, so the
    /// follow-up update pass does not announce the client's change back
    /// to it.
    ignored_modseq: Option<i64>,

    /// Untagged lines queued by `emit_updates`, drained by the connection
    /// at its next safe flush point.
    updates: Vec<String>,
    /// UIDs whose flags changed and should be reported with unsolicited
    /// FETCH responses.
    pending_fetch: MessageSet,
    /// UIDs the client FETCHed after they were expunged but before the
    /// expunge was announced. A repeat offence escalates to BYE
    /// (RFC 2180 §4.1.2 with a loop breaker).
    expunged_fetched: MessageSet,

    announced_exists: Option<u32>,
    announced_recent: Option<u32>,
}

impl Session {
    /// Creates a session for the given mailbox and registers it with the
    /// shared view.
    ///
    /// If another live session exists, the newest one's snapshot is copied
    /// (pending additions included, pending expunges excluded) so the new
    /// session starts from a consistent numbering. The caller is expected
    /// to run a refresh afterwards to bring the session fully forward.
    pub fn create(
        mailbox: Arc<Mutex<MailboxView>>,
        read_only: bool,
        permissions: Permissions,
    ) -> Arc<Mutex<Session>> {
        let mailbox_id = mailbox.lock().unwrap().id;
        let mut session = Session {
            mailbox: Arc::clone(&mailbox),
            mailbox_id,
            read_only,
            permissions,
            uidnext: 1,
            nextmodseq: 1,
            msns: MessageSet::new(),
            recent: MessageSet::new(),
            expunges: MessageSet::new(),
            unannounced: MessageSet::new(),
            ignored_modseq: None,
            updates: Vec::new(),
            pending_fetch: MessageSet::new(),
            expunged_fetched: MessageSet::new(),
            announced_exists: None,
            announced_recent: None,
        };

        let mut view = mailbox.lock().unwrap();
        if let Some(peer) = view.newest_session() {
            let peer = peer.lock().unwrap();
            session.uidnext = peer.uidnext;
            session.nextmodseq = peer.nextmodseq;
            session.msns.add_set(&peer.msns);
            session.msns.add_set(&peer.unannounced);
            session.msns.remove_set(&peer.expunges);
        }

        let session = Arc::new(Mutex::new(session));
        view.attach_session(Arc::downgrade(&session));
        session
    }

    pub fn mailbox(&self) -> &Arc<Mutex<MailboxView>> {
        &self.mailbox
    }

    pub fn mailbox_id(&self) -> i64 {
        self.mailbox_id
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn allows(&self, right: Rights) -> bool {
        self.permissions.allows(right)
    }

    /// True once this session has caught up with the given mailbox cursors.
    pub fn initialised(
        &self,
        mailbox_uidnext: u32,
        mailbox_nextmodseq: i64,
    ) -> bool {
        self.nextmodseq >= mailbox_nextmodseq
            && self.uidnext >= mailbox_uidnext
    }

    pub fn uidnext(&self) -> u32 {
        self.uidnext
    }

    pub fn nextmodseq(&self) -> i64 {
        self.nextmodseq
    }

    /// Used only by the SessionInitialiser.
    pub fn set_uidnext(&mut self, uidnext: u32) {
        self.uidnext = uidnext;
    }

    /// Used only by the SessionInitialiser.
    pub fn set_nextmodseq(&mut self, nextmodseq: i64) {
        self.nextmodseq = nextmodseq;
    }

    /// The UID of the message with sequence number `msn`, or 0.
    pub fn uid(&self, msn: u32) -> u32 {
        self.msns.value(msn)
    }

    /// The sequence number of the message with UID `uid`, or 0.
    pub fn msn(&self, uid: u32) -> u32 {
        self.msns.index(uid)
    }

    /// The number of messages visible in this session.
    pub fn count(&self) -> u32 {
        self.msns.count()
    }

    /// The UID of the highest-numbered message, or `uidnext - 1` if the
    /// mailbox is empty, or 1 if `uidnext` is 1.
    pub fn largest_uid(&self) -> u32 {
        if self.uidnext == 1 {
            1
        } else if let Some(largest) = self.msns.largest() {
            largest
        } else {
            self.uidnext - 1
        }
    }

    /// All messages marked `\Recent` in this session.
    pub fn recent(&self) -> MessageSet {
        self.recent.intersection(&self.msns)
    }

    pub fn is_recent(&self, uid: u32) -> bool {
        self.recent.contains(uid)
    }

    pub fn add_recent(&mut self, uid: u32) {
        self.recent.add(uid);
    }

    /// Everything the client believes exists. May include messages that
    /// are pending expunge announcement.
    pub fn messages(&self) -> &MessageSet {
        &self.msns
    }

    /// UIDs expunged in the database but not yet announced.
    pub fn expunged(&self) -> &MessageSet {
        &self.expunges
    }

    /// Records that `uids` have been expunged and the client should be told
    /// at the earliest safe moment.
    pub fn expunge(&mut self, uids: &MessageSet) {
        self.expunges.add_set(uids);
    }

    /// Records that the client has been told `uid` no longer exists.
    pub fn clear_expunged(&mut self, uid: u32) {
        self.msns.remove(uid);
        self.expunges.remove(uid);
        self.unannounced.remove(uid);
        self.expunged_fetched.remove(uid);
    }

    pub fn unannounced(&self) -> &MessageSet {
        &self.unannounced
    }

    pub fn add_unannounced(&mut self, uid: u32) {
        self.unannounced.add(uid);
    }

    pub fn add_unannounced_set(&mut self, uids: &MessageSet) {
        self.unannounced.add_set(uids);
    }

    /// Moves all pending additions into the visible numbering.
    pub fn clear_unannounced(&mut self) {
        let pending = std::mem::take(&mut self.unannounced);
        self.msns.add_set(&pending);
    }

    pub fn set_ignored_modseq(&mut self, modseq: i64) {
        self.ignored_modseq = Some(modseq);
    }

    pub fn ignored_modseq(&self) -> Option<i64> {
        self.ignored_modseq
    }

    /// Records an attempt to FETCH pending-expunged UIDs; returns true if
    /// any of them had already been reported once, i.e. the client is
    /// looping and the connection should be killed.
    pub fn record_expunged_fetch(&mut self, uids: &MessageSet) -> bool {
        let repeat = !self.expunged_fetched.intersection(uids).is_empty();
        self.expunged_fetched.add_set(uids);
        repeat
    }

    /// Composes the untagged responses describing everything recorded
    /// since the last call: EXPUNGE (highest sequence number first), then
    /// EXISTS/RECENT, with flag changes routed into `pending_fetch`.
    ///
    /// Only the owning connection calls this, at a point where it is safe
    /// to renumber; until then, recorded expunges stay visible in the
    /// sequence numbering and pending FETCH/STORE targets.
    pub fn emit_updates(&mut self) {
        let expunged: Vec<u32> = self.expunges.items().collect();
        for &uid in expunged.iter().rev() {
            let msn = self.msns.index(uid);
            if msn != 0 {
                self.updates.push(format!("* {} EXPUNGE", msn));
                // The client's idea of the mailbox size shrinks with each
                // EXPUNGE, so the next EXISTS comparison must account for
                // it even if the count ends up back where it started.
                self.announced_exists =
                    self.announced_exists.map(|n| n.saturating_sub(1));
            }
            self.clear_expunged(uid);
        }

        // Flag changes to already-visible messages get FETCH responses;
        // genuinely new messages are covered by EXISTS.
        let changed = self.unannounced.intersection(&self.msns);
        self.pending_fetch.add_set(&changed);
        self.clear_unannounced();

        let exists = self.msns.count();
        if self.announced_exists != Some(exists) {
            self.updates.push(format!("* {} EXISTS", exists));
            self.announced_exists = Some(exists);
        }

        let recent = self.recent().count();
        if self.announced_recent != Some(recent) {
            self.updates.push(format!("* {} RECENT", recent));
            self.announced_recent = Some(recent);
        }
    }

    /// Takes the queued untagged lines.
    pub fn take_updates(&mut self) -> Vec<String> {
        std::mem::take(&mut self.updates)
    }

    /// Takes the UIDs that want unsolicited FETCH flag responses.
    pub fn take_pending_fetch(&mut self) -> MessageSet {
        std::mem::take(&mut self.pending_fetch)
    }

    /// Marks the current counts as already known to the client, used by
    /// SELECT which reports EXISTS/RECENT itself.
    pub fn note_announced(&mut self) {
        self.announced_exists = Some(self.msns.count());
        self.announced_recent = Some(self.recent().count());
    }
}
