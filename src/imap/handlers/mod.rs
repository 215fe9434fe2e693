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

pub mod fetch;
pub mod select;
pub mod store;

use std::sync::{Arc, Mutex};

use log::info;

use super::command::{
    CmdKind, Command, ConnCtx, ConnState, Cond, Outcome,
};
use super::parser::ImapParser;
use crate::store::session::Session;
use crate::store::session_init;
use crate::support::error::Error;

pub static CAPABILITIES: &[&str] =
    &["IMAP4rev1", "LITERAL+", "CONDSTORE", "ANNOTATE"];

/// Parses one complete command line into a `Command`.
///
/// Parse errors produce a command that is already `Finished` with a tagged
/// `BAD`, so they flow through the ordinary response path.
pub fn parse_command(ctx: &mut ConnCtx, line: &[u8]) -> Command {
    let mut p = ImapParser::new(line);
    let tag = p.tag();
    p.space();
    if !p.ok() {
        return Command::invalid(
            "*".to_owned(),
            String::new(),
            Outcome::bad("Unparsable command tag"),
        );
    }

    let mut name = p.atom().to_ascii_uppercase();
    if p.ok() && "UID" == name {
        p.space();
        name = format!("UID {}", p.atom().to_ascii_uppercase());
    }
    if !p.ok() {
        return Command::invalid(
            tag,
            name,
            Outcome::bad("Expected command name"),
        );
    }

    let kind = match name.as_str() {
        "CAPABILITY" => {
            p.end();
            Ok(CmdKind::Capability)
        },
        "NOOP" | "CHECK" => {
            p.end();
            Ok(CmdKind::Noop)
        },
        "LOGOUT" => {
            p.end();
            Ok(CmdKind::Logout)
        },
        "LOGIN" => {
            p.space();
            let user = p.astring();
            p.space();
            let pass = p.astring();
            p.end();
            Ok(CmdKind::Login { user, pass })
        },
        "SELECT" | "EXAMINE" => {
            p.space();
            let mailbox = p.astring();
            p.end();
            Ok(CmdKind::Select(select::SelectCmd {
                mailbox,
                read_only: "EXAMINE" == name,
            }))
        },
        "CLOSE" => {
            p.end();
            Ok(CmdKind::Close)
        },
        "EXPUNGE" => {
            p.end();
            Ok(CmdKind::Expunge(select::ExpungeCmd::default()))
        },
        "FETCH" | "UID FETCH" => {
            fetch::parse(ctx, &mut p, "UID FETCH" == name)
                .map(CmdKind::Fetch)
        },
        "STORE" | "UID STORE" => {
            store::parse(ctx, &mut p, "UID STORE" == name)
                .map(CmdKind::Store)
        },
        _ => Err(Outcome::bad(format!("Unknown command: {}", name))),
    };

    match kind {
        Ok(kind) => {
            if let Some(message) = p.take_error() {
                Command::invalid(tag, name, Outcome::bad(message))
            } else {
                Command::new(tag, name, kind)
            }
        },
        Err(outcome) => Command::invalid(tag, name, outcome),
    }
}

/// Runs one command to completion (or, for FETCH, far enough that the
/// remaining work is draining buffered responses).
pub fn execute(ctx: &mut ConnCtx, cmd: &mut Command) -> Result<(), Error> {
    let mut kind = std::mem::replace(&mut cmd.kind, CmdKind::Invalid);
    let result = match kind {
        CmdKind::Capability => capability(ctx, cmd),
        CmdKind::Noop => noop(ctx, cmd),
        CmdKind::Logout => logout(ctx, cmd),
        CmdKind::Login { ref user, ref pass } => login(ctx, cmd, user, pass),
        CmdKind::Select(ref mut select) => {
            select::execute(ctx, cmd, select)
        },
        CmdKind::Close => select::close(ctx, cmd),
        CmdKind::Expunge(ref mut expunge) => {
            select::expunge(ctx, cmd, expunge)
        },
        CmdKind::Fetch(ref mut fetch) => fetch::execute(ctx, cmd, fetch),
        CmdKind::Store(ref mut store) => store::execute(ctx, cmd, store),
        CmdKind::Invalid => Ok(()),
    };
    cmd.kind = kind;
    result
}

fn capability(_ctx: &mut ConnCtx, cmd: &mut Command) -> Result<(), Error> {
    cmd.respond_str(format!("* CAPABILITY {}", CAPABILITIES.join(" ")));
    cmd.finish(Outcome::ok("CAPABILITY completed"));
    Ok(())
}

fn noop(ctx: &mut ConnCtx, cmd: &mut Command) -> Result<(), Error> {
    if let Some(session) = ctx.session.clone() {
        let mailbox = session.lock().unwrap().mailbox().clone();
        session_init::refresh(&mut ctx.db, &mailbox)?;
    }
    cmd.finish(Outcome::ok(format!("{} completed", cmd.name)));
    Ok(())
}

fn logout(ctx: &mut ConnCtx, cmd: &mut Command) -> Result<(), Error> {
    ctx.session = None;
    ctx.state = ConnState::Logout;
    cmd.respond_str("* BYE Have a nice day");
    cmd.finish(Outcome::ok("LOGOUT completed"));
    Ok(())
}

fn login(
    ctx: &mut ConnCtx,
    cmd: &mut Command,
    user: &str,
    pass: &str,
) -> Result<(), Error> {
    match ctx.db.user_by_login(user)? {
        Some((id, secret)) if constant_time_eq(&secret, pass) => {
            info!("{} logged in as {}", ctx.log_prefix, user);
            ctx.log_prefix.set_user(user.to_owned());
            ctx.user = Some((id, user.to_owned()));
            ctx.state = ConnState::Authenticated;
            cmd.finish(Outcome::ok("LOGIN completed"));
        },
        _ => {
            info!("{} failed login for {}", ctx.log_prefix, user);
            cmd.finish(Outcome::no("Login failed"));
        },
    }
    Ok(())
}

/// Timing-safe string comparison for the login secret.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    0 == a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y))
}

/// Drains the session's queued untagged updates (EXPUNGE/EXISTS/RECENT)
/// and renders unsolicited FETCH responses for any flag changes, in that
/// order.
pub fn session_update_lines(
    ctx: &mut ConnCtx,
    session: &Arc<Mutex<Session>>,
) -> Result<Vec<Vec<u8>>, Error> {
    let (updates, pending, ignored) = {
        let mut session = session.lock().unwrap();
        session.emit_updates();
        (
            session.take_updates(),
            session.take_pending_fetch(),
            session.ignored_modseq(),
        )
    };

    let mut lines: Vec<Vec<u8>> = updates
        .into_iter()
        .map(String::into_bytes)
        .collect();

    if !pending.is_empty() {
        lines.extend(fetch::flag_update_lines(
            ctx, session, &pending, ignored,
        )?);
    }

    Ok(lines)
}

/// The cond used when a required right is missing.
pub fn not_accessible(mailbox_name: &str) -> Outcome {
    Outcome {
        cond: Cond::No,
        code: None,
        text: format!("{} is not accessible", mailbox_name),
    }
}
