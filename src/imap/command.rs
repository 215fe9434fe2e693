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

//! The per-connection command queue.
//!
//! Each parsed command carries a group number. Commands in the same group
//! may execute while their predecessors are still unfinished; a command
//! whose group differs from an earlier live command must wait until that
//! command has finished. Whatever order the work completes in, tagged
//! responses always go out in command-arrival order, preceded by any
//! untagged responses the commands and the session accumulated.

use std::io::Write;
use std::sync::{Arc, Mutex};

use log::{debug, info};

use crate::cluster::Bus;
use crate::db::Db;
use crate::store::mailbox::MailboxRegistry;
use crate::store::session::Session;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

use super::handlers;
use super::handlers::fetch::FetchCmd;
use super::handlers::select::{ExpungeCmd, SelectCmd};
use super::handlers::store::StoreCmd;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    NotAuthenticated,
    Authenticated,
    Selected,
    Logout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandState {
    Unparsed,
    Executing,
    Finished,
    Retired,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cond {
    Ok,
    No,
    Bad,
    Bye,
}

/// The tagged result of one command.
#[derive(Clone, Debug)]
pub struct Outcome {
    pub cond: Cond,
    pub code: Option<String>,
    pub text: String,
}

impl Outcome {
    pub fn ok(text: impl Into<String>) -> Self {
        Outcome {
            cond: Cond::Ok,
            code: None,
            text: text.into(),
        }
    }

    pub fn no(text: impl Into<String>) -> Self {
        Outcome {
            cond: Cond::No,
            code: None,
            text: text.into(),
        }
    }

    pub fn bad(text: impl Into<String>) -> Self {
        Outcome {
            cond: Cond::Bad,
            code: None,
            text: text.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Everything a command can touch while executing.
pub struct ConnCtx {
    pub db: Db,
    pub registry: Arc<MailboxRegistry>,
    pub bus: Arc<Bus>,
    pub log_prefix: LogPrefix,
    pub state: ConnState,
    pub user: Option<(i64, String)>,
    pub session: Option<Arc<Mutex<Session>>>,
    /// Set once the client has used any CONDSTORE-aware construct; from
    /// then on unsolicited FETCH updates carry MODSEQ.
    pub condstore: bool,
}

impl ConnCtx {
    pub fn new(
        db: Db,
        registry: Arc<MailboxRegistry>,
        bus: Arc<Bus>,
        log_prefix: LogPrefix,
    ) -> Self {
        ConnCtx {
            db,
            registry,
            bus,
            log_prefix,
            state: ConnState::NotAuthenticated,
            user: None,
            session: None,
            condstore: false,
        }
    }

    pub fn session(&self) -> Result<&Arc<Mutex<Session>>, Error> {
        self.session.as_ref().ok_or(Error::NoSessionActive)
    }
}

pub enum CmdKind {
    Capability,
    Noop,
    Logout,
    Login { user: String, pass: String },
    Select(SelectCmd),
    Close,
    Expunge(ExpungeCmd),
    Fetch(FetchCmd),
    Store(StoreCmd),
    /// Parse or state-gate failure; the outcome is already recorded.
    Invalid,
}

impl CmdKind {
    pub fn group(&self) -> u8 {
        match *self {
            CmdKind::Fetch(ref f) if f.uid => 1,
            CmdKind::Fetch(_) => 2,
            CmdKind::Store(_) => 3,
            _ => 0,
        }
    }

    pub fn allowed_states(&self) -> &'static [ConnState] {
        use ConnState::*;
        match *self {
            CmdKind::Capability | CmdKind::Noop | CmdKind::Logout => {
                &[NotAuthenticated, Authenticated, Selected, Logout]
            },
            CmdKind::Login { .. } => &[NotAuthenticated],
            CmdKind::Select(_) => &[Authenticated, Selected],
            CmdKind::Close
            | CmdKind::Expunge(_)
            | CmdKind::Fetch(_)
            | CmdKind::Store(_) => &[Selected],
            CmdKind::Invalid => {
                &[NotAuthenticated, Authenticated, Selected, Logout]
            },
        }
    }
}

pub struct Command {
    pub tag: String,
    pub name: String,
    pub group: u8,
    pub state: CommandState,
    pub outcome: Option<Outcome>,
    /// Untagged lines this command wants sent before its tagged response.
    pub untagged: std::collections::VecDeque<Vec<u8>>,
    /// When set, the flush emits at most the command's current response
    /// rate per tick instead of draining everything (FETCH trickling).
    pub rate_limited: bool,
    pub response_rate: u32,
    pub kind: CmdKind,
}

impl Command {
    pub fn new(tag: String, name: String, kind: CmdKind) -> Self {
        Command {
            tag,
            name,
            group: kind.group(),
            state: CommandState::Unparsed,
            outcome: None,
            untagged: std::collections::VecDeque::new(),
            rate_limited: false,
            response_rate: 1,
            kind,
        }
    }

    pub fn invalid(tag: String, name: String, outcome: Outcome) -> Self {
        let mut cmd = Command::new(tag, name, CmdKind::Invalid);
        cmd.outcome = Some(outcome);
        cmd.state = CommandState::Finished;
        cmd
    }

    /// Buffers one untagged response line (without trailing CRLF).
    pub fn respond(&mut self, line: Vec<u8>) {
        self.untagged.push_back(line);
    }

    pub fn respond_str(&mut self, line: impl Into<String>) {
        self.untagged.push_back(line.into().into_bytes());
    }

    pub fn finish(&mut self, outcome: Outcome) {
        self.outcome = Some(outcome);
        self.state = CommandState::Finished;
    }
}

pub struct Dispatcher {
    queue: Vec<Command>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher { queue: Vec::new() }
    }

    pub fn enqueue(&mut self, cmd: Command) {
        self.queue.push(cmd);
    }

    /// True when every queued command has been fully written out.
    pub fn idle(&self) -> bool {
        self.queue.is_empty()
    }

    /// Runs one dispatcher tick: starts every eligible command, then
    /// flushes output. Returns whether anything was written.
    pub fn tick(
        &mut self,
        ctx: &mut ConnCtx,
        out: &mut dyn Write,
    ) -> Result<bool, Error> {
        self.execute_eligible(ctx);
        self.flush(ctx, out)
    }

    fn execute_eligible(&mut self, ctx: &mut ConnCtx) {
        for ix in 0..self.queue.len() {
            if self.queue[ix].state != CommandState::Unparsed {
                continue;
            }

            // A command must wait for every earlier command of a different
            // group to finish.
            let group = self.queue[ix].group;
            let blocked = self.queue[..ix].iter().any(|earlier| {
                earlier.group != group
                    && earlier.outcome.is_none()
            });
            if blocked {
                continue;
            }

            let cmd = &mut self.queue[ix];
            if !cmd.kind.allowed_states().contains(&ctx.state) {
                info!(
                    "{} {} not allowed in {:?} state",
                    ctx.log_prefix, cmd.name, ctx.state
                );
                cmd.finish(Outcome::bad(format!(
                    "{} not allowed now",
                    cmd.name
                )));
                continue;
            }

            cmd.state = CommandState::Executing;
            debug!("{} executing {} {}", ctx.log_prefix, cmd.tag, cmd.name);
            if let Err(e) = handlers::execute(ctx, cmd) {
                info!(
                    "{} {} failed: {}",
                    ctx.log_prefix, cmd.name, e
                );
                cmd.finish(error_outcome(e));
            }
        }
    }

    /// Emits pending output: each command's buffered untagged responses
    /// (rate-limited where the command asked for it), then, at a quiescent
    /// point, the session's own updates, then tagged responses in arrival
    /// order.
    fn flush(
        &mut self,
        ctx: &mut ConnCtx,
        out: &mut dyn Write,
    ) -> Result<bool, Error> {
        let mut wrote = false;

        for cmd in &mut self.queue {
            let budget = if cmd.rate_limited {
                adapt_rate(cmd)
            } else {
                u32::MAX
            };

            let mut emitted = 0;
            while emitted < budget {
                match cmd.untagged.pop_front() {
                    Some(line) => {
                        write_line(out, &line)?;
                        wrote = true;
                        emitted += 1;
                    },
                    None => break,
                }
            }
        }

        // Session updates renumber messages, so they only go out once no
        // live command still has output in flight; that same point is what
        // puts them ahead of the tagged response of whichever command
        // triggered the refresh.
        let quiescent = self
            .queue
            .iter()
            .all(|cmd| cmd.outcome.is_some() && cmd.untagged.is_empty());
        if quiescent {
            if let Some(session) = ctx.session.clone() {
                for line in handlers::session_update_lines(ctx, &session)? {
                    write_line(out, &line)?;
                    wrote = true;
                }
            }
        }

        for cmd in &mut self.queue {
            if cmd.outcome.is_none() || !cmd.untagged.is_empty() {
                // Tagged responses keep arrival order.
                break;
            }

            let outcome = cmd.outcome.as_ref().unwrap();
            write_line(out, &tagged_line(&cmd.tag, outcome))?;
            wrote = true;
            cmd.state = CommandState::Retired;
            if Cond::Bye == outcome.cond {
                ctx.state = ConnState::Logout;
            }
        }

        self.queue.retain(|cmd| cmd.state != CommandState::Retired);
        out.flush()?;
        Ok(wrote)
    }
}

/// The trickle policy: the rate rises with the backlog so a huge FETCH
/// completes in bounded time, and resets once the backlog clears.
fn adapt_rate(cmd: &mut Command) -> u32 {
    let backlog = cmd.untagged.len() as u32;
    let rate = backlog / 30;
    if rate > cmd.response_rate {
        cmd.response_rate = rate;
    } else if rate < 2 && cmd.response_rate > 1 {
        cmd.response_rate = 1;
    }
    cmd.response_rate.max(1)
}

fn tagged_line(tag: &str, outcome: &Outcome) -> Vec<u8> {
    let cond = match outcome.cond {
        Cond::Ok => "OK",
        Cond::No => "NO",
        Cond::Bad => "BAD",
        Cond::Bye => "BYE",
    };
    let mut line = String::new();
    // RFC 3501 has no tagged BYE; the connection closes right after.
    if Cond::Bye == outcome.cond {
        line.push('*');
    } else {
        line.push_str(tag);
    }
    line.push(' ');
    line.push_str(cond);
    if let Some(ref code) = outcome.code {
        line.push_str(" [");
        line.push_str(code);
        line.push(']');
    }
    if !outcome.text.is_empty() {
        line.push(' ');
        line.push_str(&outcome.text);
    }
    line.into_bytes()
}

fn write_line(out: &mut dyn Write, line: &[u8]) -> Result<(), Error> {
    out.write_all(line)?;
    out.write_all(b"\r\n")?;
    Ok(())
}

/// Maps internal errors onto the protocol-level outcomes of the error
/// design: parse problems were already handled as BAD, so everything
/// arriving here is a NO of some kind.
fn error_outcome(e: Error) -> Outcome {
    match e {
        Error::NxMailbox => Outcome::no("No such mailbox"),
        Error::PermissionDenied => Outcome::no("Mailbox is not accessible"),
        Error::MailboxReadOnly => {
            Outcome::no("Mailbox is read-only").with_code("READ-ONLY")
        },
        Error::ExpungedMessage => Outcome::no("Message has been expunged"),
        Error::NxMessage => Outcome::no("No such message"),
        Error::NoSessionActive => Outcome::bad("No mailbox is selected"),
        Error::Signalled => Outcome::no("Dependent object destroyed"),
        Error::Sql(_) | Error::TxFailed => {
            Outcome::no("Database error. Rolling transaction back")
        },
        e => Outcome::no(format!("Internal error: {}", e)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tagged_lines_render() {
        assert_eq!(
            b"A1 OK done".to_vec(),
            tagged_line("A1", &Outcome::ok("done"))
        );
        assert_eq!(
            b"A2 OK [MODIFIED 2] STORE completed".to_vec(),
            tagged_line(
                "A2",
                &Outcome::ok("STORE completed").with_code("MODIFIED 2")
            )
        );
        assert_eq!(
            b"* BYE bye".to_vec(),
            tagged_line(
                "A3",
                &Outcome {
                    cond: Cond::Bye,
                    code: None,
                    text: "bye".to_owned()
                }
            )
        );
    }

    #[test]
    fn rate_adapts_to_backlog() {
        let mut cmd =
            Command::new("A1".to_owned(), "FETCH".to_owned(), CmdKind::Noop);
        cmd.rate_limited = true;
        for _ in 0..90 {
            cmd.respond_str("* 1 FETCH (UID 1)");
        }
        assert_eq!(3, adapt_rate(&mut cmd));
        cmd.untagged.drain(..60);
        assert_eq!(1, adapt_rate(&mut cmd));
    }
}
