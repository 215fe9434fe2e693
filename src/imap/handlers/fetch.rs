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

//! FETCH and UID FETCH (RFC 3501 section 6.4.5, RFC 3516, RFC 4551,
//! RFC 5257).
//!
//! Execution resolves the target set against the session, filters it by
//! `CHANGEDSINCE`, performs the implicit `\Seen` store for non-PEEK body
//! sections, removes pending-expunged UIDs (reported with a tagged NO per
//! RFC 2180 section 4.1.2), loads the missing attribute categories in
//! batches, and buffers one response per message. The buffered responses
//! drain through the dispatcher's rate-limited flush so a slow client
//! sees steady progress on a large FETCH.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use log::warn;

use super::super::command::{Command, ConnCtx, Cond, Outcome};
use super::super::lex;
use super::super::parser::ImapParser;
use crate::db::from_single;
use crate::store::fetcher::{Category, Fetcher};
use crate::store::message::{Address, Message};
use crate::store::message_set::MessageSet;
use crate::store::session::Session;
use crate::support::error::Error;

#[derive(Clone, Debug, Default)]
pub struct Section {
    /// One of `""`, `rfc822`, `rfc822.header`, `rfc822.text`, `header`,
    /// `header.fields`, `header.fields.not`, `mime`, `text`, `size`.
    pub id: String,
    /// Dotted part number, empty for the top level.
    pub part: String,
    pub fields: Vec<String>,
    pub binary: bool,
    pub partial: Option<(u32, u32)>,
}

#[derive(Clone, Debug)]
pub enum FetchItem {
    Uid,
    Flags,
    InternalDate,
    Rfc822Size,
    Envelope,
    Body,
    BodyStructure,
    Modseq,
    Annotation {
        entries: Vec<String>,
        attribs: Vec<String>,
    },
    Section(Section),
}

pub struct FetchCmd {
    pub uid: bool,
    pub set: MessageSet,
    pub items: Vec<FetchItem>,
    pub peek: bool,
    pub changed_since: Option<i64>,
}

/// Parses the FETCH arguments, resolving sequence numbers against the
/// current session immediately.
pub(super) fn parse(
    ctx: &mut ConnCtx,
    p: &mut ImapParser<'_>,
    uid: bool,
) -> Result<FetchCmd, Outcome> {
    let session = ctx
        .session
        .clone()
        .ok_or_else(|| Outcome::bad("FETCH not allowed now"))?;

    p.space();
    let raw_set = p.sequence_set();
    p.space();
    if !p.ok() {
        return Err(Outcome::bad(p.take_error().unwrap()));
    }

    let set = resolve_set(&session, &raw_set, uid)?;

    let mut cmd = FetchCmd {
        uid,
        set,
        items: Vec::new(),
        peek: true,
        changed_since: None,
    };

    if p.present("(") {
        parse_attribute(p, &mut cmd, false);
        while p.present(" ") {
            parse_attribute(p, &mut cmd, false);
        }
        p.require(")");
    } else {
        parse_attribute(p, &mut cmd, true);
    }

    // RFC 4466 fetch-modifiers; only CHANGEDSINCE (RFC 4551) is known.
    if p.present(" (") {
        loop {
            let name = p.atom().to_ascii_lowercase();
            if "changedsince" == name {
                p.space();
                cmd.changed_since = Some(p.number64() as i64);
                if !cmd.items.iter().any(|i| matches!(i, FetchItem::Modseq)) {
                    cmd.items.push(FetchItem::Modseq);
                }
                ctx.condstore = true;
            } else if p.ok() {
                return Err(Outcome::bad(format!(
                    "Unknown fetch modifier: {}",
                    name
                )));
            }
            if !p.present(" ") {
                break;
            }
        }
        p.require(")");
    }
    p.end();

    if cmd.items.iter().any(|i| matches!(i, FetchItem::Modseq)) {
        ctx.condstore = true;
    }

    match p.take_error() {
        Some(message) => Err(Outcome::bad(message)),
        None => Ok(cmd),
    }
}

pub(super) fn resolve_set(
    session: &Arc<Mutex<Session>>,
    raw: &str,
    uid: bool,
) -> Result<MessageSet, Outcome> {
    let session = session.lock().unwrap();
    if uid {
        MessageSet::parse(raw, session.largest_uid())
            .ok_or_else(|| Outcome::bad("Unparsable sequence set"))
    } else {
        let seqnums = MessageSet::parse(raw, session.count().max(1))
            .ok_or_else(|| Outcome::bad("Unparsable sequence set"))?;
        let mut uids = MessageSet::new();
        for msn in seqnums.items() {
            match session.uid(msn) {
                0 => {
                    return Err(Outcome::bad(
                        "Message sequence number out of range",
                    ))
                },
                uid => uids.add(uid),
            }
        }
        Ok(uids)
    }
}

fn parse_attribute(
    p: &mut ImapParser<'_>,
    cmd: &mut FetchCmd,
    also_macro: bool,
) {
    let keyword = p.dot_letters().to_ascii_lowercase();
    match keyword.as_str() {
        "all" if also_macro => {
            cmd.items.extend([
                FetchItem::Flags,
                FetchItem::InternalDate,
                FetchItem::Rfc822Size,
                FetchItem::Envelope,
            ]);
        },
        "full" if also_macro => {
            cmd.items.extend([
                FetchItem::Flags,
                FetchItem::InternalDate,
                FetchItem::Rfc822Size,
                FetchItem::Envelope,
                FetchItem::Body,
            ]);
        },
        "fast" if also_macro => {
            cmd.items.extend([
                FetchItem::Flags,
                FetchItem::InternalDate,
                FetchItem::Rfc822Size,
            ]);
        },
        "envelope" => cmd.items.push(FetchItem::Envelope),
        "flags" => cmd.items.push(FetchItem::Flags),
        "internaldate" => cmd.items.push(FetchItem::InternalDate),
        "rfc822.size" => cmd.items.push(FetchItem::Rfc822Size),
        "uid" => cmd.items.push(FetchItem::Uid),
        "modseq" => cmd.items.push(FetchItem::Modseq),
        "bodystructure" => cmd.items.push(FetchItem::BodyStructure),
        "rfc822" => {
            cmd.peek = false;
            cmd.items.push(FetchItem::Section(Section {
                id: "rfc822".to_owned(),
                ..Section::default()
            }));
        },
        "rfc822.header" => {
            cmd.items.push(FetchItem::Section(Section {
                id: "rfc822.header".to_owned(),
                ..Section::default()
            }));
        },
        "rfc822.text" => {
            cmd.peek = false;
            cmd.items.push(FetchItem::Section(Section {
                id: "rfc822.text".to_owned(),
                ..Section::default()
            }));
        },
        "body" => {
            if p.next_char() == b'[' {
                p.step();
                cmd.peek = false;
                parse_body(p, cmd, false);
            } else {
                cmd.items.push(FetchItem::Body);
            }
        },
        "body.peek" if p.next_char() == b'[' => {
            p.step();
            parse_body(p, cmd, false);
        },
        "binary" if p.next_char() == b'[' => {
            cmd.peek = false;
            p.step();
            parse_body(p, cmd, true);
        },
        "binary.peek" if p.next_char() == b'[' => {
            p.step();
            parse_body(p, cmd, true);
        },
        "binary.size" if p.next_char() == b'[' => {
            p.step();
            parse_body(p, cmd, true);
            if let Some(FetchItem::Section(ref mut s)) = cmd.items.last_mut()
            {
                s.id = "size".to_owned();
                if s.partial.is_some() {
                    p.error(
                        "Fetching partial BINARY.SIZE is not meaningful",
                    );
                }
            }
        },
        "annotation" => {
            p.require(" ");
            parse_annotation(p, cmd);
        },
        _ => {
            p.error(format!(
                "expected fetch attribute, saw word: {}",
                keyword
            ));
        },
    }
}

/// Parses a section-spec, leaving the cursor past the closing `]` and any
/// partial range.
fn parse_body(p: &mut ImapParser<'_>, cmd: &mut FetchCmd, binary: bool) {
    let mut section = Section {
        binary,
        ..Section::default()
    };

    // section-part: nz-number *("." nz-number)
    let mut dot = false;
    if p.next_char().is_ascii_digit() {
        let mut part = p.nz_number().to_string();
        while p.next_char() == b'.' {
            p.step();
            if p.next_char().is_ascii_digit() {
                part.push('.');
                part.push_str(&p.nz_number().to_string());
            } else {
                dot = true;
                break;
            }
        }
        section.part = part;
    }

    let item = p.dot_letters().to_ascii_lowercase();
    if binary && !item.is_empty() {
        p.error(format!(
            "BINARY with section-text is not legal, saw: {}",
            item
        ));
    } else if item.is_empty() || "text" == item {
        section.id = item;
    } else if "header" == item {
        section.id = item;
    } else if "header.fields" == item || "header.fields.not" == item {
        p.require(" (");
        section.fields.push(p.astring());
        while p.present(" ") {
            section.fields.push(p.astring());
        }
        p.require(")");
        section.id = item;
    } else if "mime" == item {
        if section.part.is_empty() {
            p.error("MIME requires a section-part");
        }
        section.id = item;
    } else if dot {
        p.error(format!(
            "expected text, header, header.fields etc, not: {}",
            item
        ));
    } else {
        section.id = item;
    }

    p.require("]");

    if p.next_char() == b'<' {
        p.step();
        let offset = p.number();
        p.require(".");
        let length = p.nz_number();
        p.require(">");
        section.partial = Some((offset, length));
    }

    cmd.items.push(FetchItem::Section(section));
}

/// Parses `ANNOTATION (entries attribs)` (RFC 5257).
fn parse_annotation(p: &mut ImapParser<'_>, cmd: &mut FetchCmd) {
    fn list(p: &mut ImapParser<'_>) -> Vec<String> {
        let mut out = Vec::new();
        if p.present("(") {
            out.push(p.astring());
            while p.present(" ") {
                out.push(p.astring());
            }
            p.require(")");
        } else {
            out.push(p.astring());
        }
        out
    }

    p.require("(");
    let entries = list(p);
    p.require(" ");
    let raw_attribs = list(p);
    p.require(")");

    static LEGAL: &[&str] = &[
        "value",
        "value.priv",
        "value.shared",
        "size",
        "size.priv",
        "size.shared",
    ];

    let mut attribs: Vec<String> = Vec::new();
    let mut record = |a: String| {
        if !attribs.iter().any(|x| *x == a) {
            attribs.push(a);
        }
    };
    for attrib in raw_attribs {
        if !LEGAL.contains(&attrib.as_str()) {
            p.error(format!("Unknown annotation attribute: {}", attrib));
            return;
        }
        if attrib.ends_with(".priv") || attrib.ends_with(".shared") {
            record(attrib);
        } else {
            record(format!("{}.priv", attrib));
            record(format!("{}.shared", attrib));
        }
    }

    cmd.items.push(FetchItem::Annotation { entries, attribs });
}

pub(super) fn execute(
    ctx: &mut ConnCtx,
    cmd: &mut Command,
    fetch: &mut FetchCmd,
) -> Result<(), Error> {
    let session = ctx.session()?.clone();
    let (mailbox_id, read_only) = {
        let session = session.lock().unwrap();
        (session.mailbox_id(), session.read_only())
    };

    if let Some(changed_since) = fetch.changed_since {
        let predicate = fetch.set.where_sql();
        let sql = format!(
            "SELECT `uid` FROM `mailbox_messages` \
             WHERE `mailbox` = ?1 AND `modseq` <= ?2 AND {} \
             UNION \
             SELECT `uid` FROM `deleted_messages` \
             WHERE `mailbox` = ?1 AND `modseq` <= ?2 AND {}",
            predicate, predicate
        );
        let mut stmt = ctx.db.cxn().prepare(&sql)?;
        let unchanged = stmt
            .query_map((mailbox_id, changed_since), from_single::<u32>)?
            .collect::<Result<Vec<_>, _>>()?;
        for uid in unchanged {
            fetch.set.remove(uid);
        }
    }

    if !fetch.peek && !read_only {
        if let Err(e) = set_seen(ctx, &session, &fetch.set) {
            // Best-effort; the FETCH itself still proceeds.
            warn!("{} Implicit \\Seen store failed: {}", ctx.log_prefix, e);
        }
    }

    let expunged = {
        let session = session.lock().unwrap();
        session.expunged().intersection(&fetch.set)
    };
    fetch.set.remove_set(&expunged);

    {
        let session = session.lock().unwrap();
        fetch.set = fetch.set.intersection(session.messages());
    }

    let mut messages: BTreeMap<u32, Message> = fetch
        .set
        .items()
        .map(|uid| (uid, Message::new(uid)))
        .collect();

    if !messages.is_empty() {
        let fetcher = Fetcher::new(mailbox_id, fetch.set.clone());
        for category in needed_categories(&fetch.items) {
            fetcher.fetch(&ctx.db, category, &mut messages)?;
        }
    }

    let user_id = ctx.user.as_ref().map(|&(id, _)| id).unwrap_or(0);
    {
        let session = session.lock().unwrap();
        for (&uid, message) in &messages {
            let msn = session.msn(uid);
            if 0 == msn {
                continue;
            }
            cmd.respond(render_response(
                fetch, message, uid, msn, &session, user_id,
            ));
        }
    }
    cmd.rate_limited = true;

    if expunged.is_empty() {
        cmd.finish(Outcome::ok("FETCH completed"));
    } else {
        let looping =
            session.lock().unwrap().record_expunged_fetch(&expunged);
        if looping {
            cmd.finish(Outcome {
                cond: Cond::Bye,
                code: None,
                text: "Too many references to expunged messages".to_owned(),
            });
        } else {
            cmd.finish(Outcome::no(format!(
                "UID(s) {} has/have been expunged",
                expunged.set()
            )));
        }
    }
    Ok(())
}

/// The implicit `\Seen` store for a FETCH of a body section without
/// `.PEEK`, run in its own transaction before any data is assembled.
///
/// Messages that already carry `\Seen` are dropped from the working set;
/// if nothing is left the transaction rolls back without consuming a
/// modseq.
fn set_seen(
    ctx: &mut ConnCtx,
    session: &Arc<Mutex<Session>>,
    set: &MessageSet,
) -> Result<(), Error> {
    if set.is_empty() {
        return Ok(());
    }

    let mailbox = session.lock().unwrap().mailbox().clone();
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

    let mut working = set.clone();
    {
        let mut stmt = tx.prepare(
            "SELECT `uid` FROM `mailbox_messages` \
             WHERE `mailbox` = ? AND `seen` \
             AND `uid` >= ? AND `uid` <= ?",
        )?;
        let rows = stmt.query_map(
            (
                mailbox_id,
                set.smallest().unwrap_or(1),
                set.largest().unwrap_or(1),
            ),
            from_single::<u32>,
        )?;
        for row in rows {
            working.remove(row?);
        }
    }

    if working.is_empty() {
        drop(tx);
        return Ok(());
    }

    let updated = tx.execute(
        &format!(
            "UPDATE `mailbox_messages` SET `modseq` = ?, `seen` = 1 \
             WHERE `mailbox` = ? AND {}",
            working.where_sql()
        ),
        (modseq, mailbox_id),
    )?;
    if 0 == updated {
        drop(tx);
        return Ok(());
    }

    tx.execute(
        "UPDATE `mailboxes` SET `nextmodseq` = ? WHERE `id` = ?",
        (modseq + 1, mailbox_id),
    )?;
    tx.commit().map_err(|_| Error::TxFailed)?;

    mailbox.lock().unwrap().note_nextmodseq(modseq + 1);
    ctx.bus.send_nextmodseq(&mailbox_name, modseq + 1);
    Ok(())
}

fn needed_categories(items: &[FetchItem]) -> Vec<Category> {
    let mut categories = Vec::new();
    let mut need = |c: Category, v: &mut Vec<Category>| {
        if !v.contains(&c) {
            v.push(c);
        }
    };

    for item in items {
        match *item {
            FetchItem::Uid => (),
            FetchItem::Flags => need(Category::Flags, &mut categories),
            FetchItem::InternalDate
            | FetchItem::Rfc822Size
            | FetchItem::Modseq => need(Category::Trivia, &mut categories),
            FetchItem::Envelope => {
                need(Category::Addresses, &mut categories);
                need(Category::OtherHeader, &mut categories);
            },
            FetchItem::Body | FetchItem::BodyStructure => {
                need(Category::PartNumbers, &mut categories);
                need(Category::Addresses, &mut categories);
                need(Category::OtherHeader, &mut categories);
            },
            FetchItem::Annotation { .. } => {
                need(Category::Annotations, &mut categories)
            },
            FetchItem::Section(ref section) => match section.id.as_str() {
                "rfc822.header" | "header" | "header.fields"
                | "header.fields.not" => {
                    need(Category::OtherHeader, &mut categories)
                },
                "mime" => need(Category::PartNumbers, &mut categories),
                "size" => {
                    need(Category::Body, &mut categories);
                    need(Category::PartNumbers, &mut categories);
                    need(Category::Trivia, &mut categories);
                },
                _ => {
                    need(Category::Body, &mut categories);
                    need(Category::PartNumbers, &mut categories);
                    need(Category::OtherHeader, &mut categories);
                },
            },
        }
    }

    categories
}

fn render_response(
    fetch: &FetchCmd,
    message: &Message,
    uid: u32,
    msn: u32,
    session: &Session,
    user_id: i64,
) -> Vec<u8> {
    let mut payload: Vec<Vec<u8>> = Vec::new();

    // UID FETCH always reports the UID, whether or not it was asked for.
    if fetch.uid && !fetch.items.iter().any(|i| matches!(i, FetchItem::Uid))
    {
        payload.push(format!("UID {}", uid).into_bytes());
    }

    for item in &fetch.items {
        match *item {
            FetchItem::Uid => {
                payload.push(format!("UID {}", uid).into_bytes())
            },
            FetchItem::Flags => payload.push(
                format!("FLAGS ({})", flag_list(message, uid, session))
                    .into_bytes(),
            ),
            FetchItem::InternalDate => payload.push(
                format!("INTERNALDATE \"{}\"", internal_date(message))
                    .into_bytes(),
            ),
            FetchItem::Rfc822Size => payload.push(
                format!(
                    "RFC822.SIZE {}",
                    message.rfc822_size.unwrap_or(0)
                )
                .into_bytes(),
            ),
            FetchItem::Envelope => payload.push(
                format!("ENVELOPE {}", envelope(message, ""))
                    .into_bytes(),
            ),
            FetchItem::Body => payload.push(
                format!("BODY {}", body_structure(message, "", false))
                    .into_bytes(),
            ),
            FetchItem::BodyStructure => payload.push(
                format!(
                    "BODYSTRUCTURE {}",
                    body_structure(message, "", true)
                )
                .into_bytes(),
            ),
            FetchItem::Modseq => payload.push(
                format!("MODSEQ ({})", message.modseq.unwrap_or(1))
                    .into_bytes(),
            ),
            FetchItem::Annotation {
                ref entries,
                ref attribs,
            } => payload.push(
                format!(
                    "ANNOTATION {}",
                    annotation(message, user_id, entries, attribs)
                )
                .into_bytes(),
            ),
            FetchItem::Section(ref section) => {
                payload.push(section_response(section, message))
            },
        }
    }

    let mut out = format!("* {} FETCH (", msn).into_bytes();
    for (ix, part) in payload.iter().enumerate() {
        if ix > 0 {
            out.push(b' ');
        }
        out.extend_from_slice(part);
    }
    out.push(b')');
    out
}

/// All flags set on `message`, with `\Recent` per session.
fn flag_list(message: &Message, uid: u32, session: &Session) -> String {
    let mut flags: Vec<String> = Vec::new();
    if session.is_recent(uid) {
        flags.push("\\Recent".to_owned());
    }
    if let Some(ref view) = message.flags {
        if view.seen {
            flags.push("\\Seen".to_owned());
        }
        if view.deleted {
            flags.push("\\Deleted".to_owned());
        }
        flags.extend(view.keywords.iter().cloned());
    }
    flags.join(" ")
}

fn internal_date(message: &Message) -> String {
    message
        .internal_date
        .map(|d| d.format("%d-%b-%Y %H:%M:%S %z").to_string())
        .unwrap_or_else(|| "01-Jan-1970 00:00:00 +0000".to_owned())
}

fn address_list(addresses: &[&Address]) -> String {
    if addresses.is_empty() {
        return "NIL".to_owned();
    }

    let mut out = String::from("(");
    for address in addresses {
        out.push('(');
        out.push_str(&lex::nstring(address.name.as_deref()));
        out.push_str(" NIL ");
        out.push_str(&lex::quoted(&address.localpart));
        out.push(' ');
        if address.domain.is_empty() {
            // RFC 3501 page 77: a null host is sent as a space.
            out.push_str("\" \"");
        } else {
            out.push_str(&lex::quoted(&address.domain));
        }
        out.push(')');
    }
    out.push(')');
    out
}

/// The IMAP envelope of the message rooted at `part` (the whole message
/// for `""`, an embedded message/rfc822 otherwise).
fn envelope(message: &Message, part: &str) -> String {
    let header = |field: &str| -> Option<&str> {
        message
            .headers
            .iter()
            .flatten()
            .filter(|h| h.part == part && h.field.eq_ignore_ascii_case(field))
            .min_by_key(|h| h.position)
            .map(|h| h.value.as_str())
    };
    let addresses = |field: &str| -> Vec<&Address> {
        let mut hits: Vec<_> = message
            .addresses
            .iter()
            .flatten()
            .filter(|a| {
                a.part == part && a.field.eq_ignore_ascii_case(field)
            })
            .collect();
        hits.sort_by_key(|a| a.position);
        hits.into_iter().map(|a| &a.address).collect()
    };

    let from = addresses("From");
    let sender = addresses("Sender");
    let reply_to = addresses("Reply-To");

    let mut out = String::from("(");
    out.push_str(&lex::nstring(header("Date")));
    out.push(' ');
    out.push_str(&lex::nstring(header("Subject")));
    out.push(' ');
    out.push_str(&address_list(&from));
    out.push(' ');
    out.push_str(&address_list(if sender.is_empty() {
        &from
    } else {
        &sender
    }));
    out.push(' ');
    out.push_str(&address_list(if reply_to.is_empty() {
        &from
    } else {
        &reply_to
    }));
    out.push(' ');
    out.push_str(&address_list(&addresses("To")));
    out.push(' ');
    out.push_str(&address_list(&addresses("Cc")));
    out.push(' ');
    out.push_str(&address_list(&addresses("Bcc")));
    out.push(' ');
    out.push_str(&lex::nstring(header("In-Reply-To")));
    out.push(' ');
    out.push_str(&lex::nstring(header("Message-Id")));
    out.push(')');
    out
}

fn parameter_string(parameters: &[(String, String)]) -> String {
    if parameters.is_empty() {
        return "NIL".to_owned();
    }

    let rendered: Vec<String> = parameters
        .iter()
        .flat_map(|(name, value)| {
            [lex::quoted(name), lex::quoted(value)]
        })
        .collect();
    format!("({})", rendered.join(" "))
}

fn disposition_string(disposition: Option<&str>) -> String {
    match disposition {
        Some(d) => format!("({} NIL)", lex::quoted(d)),
        None => "NIL".to_owned(),
    }
}

/// Child part numbers of `prefix`, in order.
fn child_parts(message: &Message, prefix: &str) -> Vec<String> {
    let mut children = Vec::new();
    for n in 1u32.. {
        let child = if prefix.is_empty() {
            n.to_string()
        } else {
            format!("{}.{}", prefix, n)
        };
        if message.part(&child).is_none() {
            break;
        }
        children.push(child);
    }
    children
}

/// The BODY (`extended` false) or BODYSTRUCTURE (`extended` true)
/// production for the part tree rooted at `prefix`.
fn body_structure(
    message: &Message,
    prefix: &str,
    extended: bool,
) -> String {
    let node = match message.part(prefix) {
        Some(node) => node,
        None => return "NIL".to_owned(),
    };

    if node.is_multipart() {
        let mut out = String::from("(");
        for child in child_parts(message, prefix) {
            out.push_str(&body_structure(message, &child, extended));
        }
        out.push(' ');
        out.push_str(&lex::quoted(
            node.content_subtype.as_deref().unwrap_or("mixed"),
        ));
        if extended {
            out.push(' ');
            out.push_str(&parameter_string(&node.parameters));
            out.push(' ');
            out.push_str(&disposition_string(node.disposition.as_deref()));
            out.push(' ');
            out.push_str(&lex::nstring(node.language.as_deref()));
            out.push(' ');
            out.push_str(&lex::nstring(node.location.as_deref()));
        }
        out.push(')');
        return out;
    }

    // Single part. body-fields = params id description encoding size
    let mut fields: Vec<String> = Vec::new();
    let content_type = node.content_type.as_deref().unwrap_or("text");
    let content_subtype = node.content_subtype.as_deref().unwrap_or("plain");
    fields.push(lex::quoted(content_type));
    fields.push(lex::quoted(content_subtype));
    fields.push(parameter_string(&node.parameters));
    fields.push(lex::nstring(node.content_id.as_deref()));
    fields.push(lex::nstring(node.description.as_deref()));
    fields.push(lex::quoted(
        &node.cte.as_deref().unwrap_or("7bit").to_ascii_uppercase(),
    ));
    fields.push(node.bytes.to_string());

    if node.is_message_rfc822() {
        // body-type-msg: envelope and nested structure before the line
        // count.
        fields.push(envelope(message, prefix));
        fields.push(embedded_structure(message, prefix, extended));
        fields.push(node.lines.to_string());
    } else if content_type.eq_ignore_ascii_case("text") {
        fields.push(node.lines.to_string());
    }

    if extended {
        fields.push(lex::nstring(node.md5.as_deref()));
        fields.push(disposition_string(node.disposition.as_deref()));
        fields.push(lex::nstring(node.language.as_deref()));
        fields.push(lex::nstring(node.location.as_deref()));
    }

    format!("({})", fields.join(" "))
}

/// The structure of the message embedded in a message/rfc822 part.
fn embedded_structure(
    message: &Message,
    prefix: &str,
    extended: bool,
) -> String {
    let children = child_parts(message, prefix);
    match children.len() {
        0 => "(\"text\" \"plain\" NIL NIL NIL \"7BIT\" 0 0)".to_owned(),
        1 => body_structure(message, &children[0], extended),
        _ => {
            let mut out = String::from("(");
            for child in &children {
                out.push_str(&body_structure(message, child, extended));
            }
            out.push_str(" \"mixed\")");
            out
        },
    }
}

/// Renders one section item (`BODY[...]`, `RFC822.*`, `BINARY...`) as
/// `label data`.
fn section_response(section: &Section, message: &Message) -> Vec<u8> {
    let (label, data) = section_data(section, message);

    let mut out = label.into_bytes();
    out.push(b' ');
    if "size" == section.id {
        // BINARY.SIZE carries a bare number.
        out.extend_from_slice(
            data.map(|d| d.len().to_string())
                .unwrap_or_else(|| "0".to_owned())
                .as_bytes(),
        );
    } else {
        lex::append_nstring(&mut out, data.as_deref());
    }
    out
}

/// The text of the portion of `message` described by `section`, with the
/// response label it is reported under.
fn section_data(
    section: &Section,
    message: &Message,
) -> (String, Option<Vec<u8>>) {
    let (mut label, mut data): (String, Option<Vec<u8>>) =
        match section.id.as_str() {
            "rfc822" => (
                "RFC822".to_owned(),
                message.rfc822().map(<[u8]>::to_vec),
            ),
            "rfc822.header" => (
                "RFC822.HEADER".to_owned(),
                Some(header_lines(message, "", &[], false)),
            ),
            "rfc822.text" => (
                "RFC822.TEXT".to_owned(),
                message.rfc822_body().map(<[u8]>::to_vec),
            ),
            "header" | "header.fields" | "header.fields.not" => {
                let fields = "header" != section.id;
                let exclude = section.id.ends_with(".not");
                let data = header_lines(
                    message,
                    &section.part,
                    if fields { &section.fields } else { &[] },
                    exclude,
                );

                let mut item = section.id.to_ascii_uppercase();
                if !section.part.is_empty() {
                    item = format!("{}.{}", section.part, item);
                }
                let mut label = format!("BODY[{}", item);
                if fields {
                    label.push_str(&format!(
                        " ({})",
                        section.fields.join(" ")
                    ));
                }
                label.push(']');
                (label, Some(data))
            },
            "mime" => (
                format!("BODY[{}.MIME]", section.part),
                Some(mime_header(message, &section.part)),
            ),
            "text" => {
                let data = if section.part.is_empty() {
                    message.rfc822_body().map(<[u8]>::to_vec)
                } else {
                    // The TEXT of a message/rfc822 part is the embedded
                    // message's body.
                    message
                        .part(&section.part)
                        .and_then(|p| p.text.as_deref())
                        .map(body_after_header)
                };
                let item = if section.part.is_empty() {
                    "TEXT".to_owned()
                } else {
                    format!("{}.TEXT", section.part)
                };
                (format!("BODY[{}]", item), data)
            },
            // "" and "size"
            _ => {
                let item = if section.binary { "BINARY" } else { "BODY" };
                let data = if section.part.is_empty() {
                    message.rfc822().map(<[u8]>::to_vec)
                } else {
                    message.part(&section.part).and_then(|part| {
                        let decoded = part.text.clone()?;
                        if section.binary || "size" == section.id {
                            Some(decoded)
                        } else {
                            Some(encode_cte(
                                &decoded,
                                part.cte.as_deref().unwrap_or("7bit"),
                            ))
                        }
                    })
                };

                let item = if "size" == section.id {
                    "BINARY.SIZE".to_owned()
                } else {
                    item.to_owned()
                };
                (format!("{}[{}]", item, section.part), data)
            },
        };

    if let Some((offset, length)) = section.partial {
        label.push_str(&format!("<{}>", offset));
        data = data.map(|d| {
            let start = (offset as usize).min(d.len());
            let end = (offset as usize + length as usize).min(d.len());
            d[start..end].to_vec()
        });
    }

    (label, data)
}

fn body_after_header(raw: &[u8]) -> Vec<u8> {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|ix| ix + 4)
        .or_else(|| {
            raw.windows(2).position(|w| w == b"\n\n").map(|ix| ix + 2)
        });
    match split {
        Some(ix) => raw[ix..].to_vec(),
        None => Vec::new(),
    }
}

/// Renders header lines for `part`, filtered by `fields` (all fields when
/// empty; the complement when `exclude`), terminated by a blank line.
fn header_lines(
    message: &Message,
    part: &str,
    fields: &[String],
    exclude: bool,
) -> Vec<u8> {
    let mut rows: Vec<_> = message
        .headers
        .iter()
        .flatten()
        .filter(|h| h.part == part)
        .collect();
    rows.sort_by_key(|h| h.position);

    let mut out = Vec::new();
    for row in rows {
        let listed = fields
            .iter()
            .any(|f| f.eq_ignore_ascii_case(&row.field));
        let include = if fields.is_empty() {
            true
        } else if exclude {
            !listed
        } else {
            listed
        };
        if include {
            out.extend_from_slice(row.field.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(row.value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Reconstructs the MIME header of a part from its stored metadata.
fn mime_header(message: &Message, part: &str) -> Vec<u8> {
    let mut out = Vec::new();
    if let Some(part) = message.part(part) {
        if let (Some(ref t), Some(ref s)) =
            (&part.content_type, &part.content_subtype)
        {
            let mut line = format!("Content-Type: {}/{}", t, s);
            for (name, value) in &part.parameters {
                line.push_str(&format!("; {}={}", name, value));
            }
            out.extend_from_slice(line.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if let Some(ref cte) = part.cte {
            out.extend_from_slice(
                format!("Content-Transfer-Encoding: {}\r\n", cte)
                    .as_bytes(),
            );
        }
        if let Some(ref id) = part.content_id {
            out.extend_from_slice(
                format!("Content-Id: {}\r\n", id).as_bytes(),
            );
        }
        if let Some(ref description) = part.description {
            out.extend_from_slice(
                format!("Content-Description: {}\r\n", description)
                    .as_bytes(),
            );
        }
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Re-encodes decoded part content to its declared transfer encoding for
/// a non-BINARY BODY section.
fn encode_cte(decoded: &[u8], cte: &str) -> Vec<u8> {
    match cte.to_ascii_lowercase().as_str() {
        "base64" => {
            let encoded =
                base64::engine::general_purpose::STANDARD.encode(decoded);
            let mut out = Vec::with_capacity(encoded.len() + encoded.len() / 76 * 2);
            for chunk in encoded.as_bytes().chunks(76) {
                out.extend_from_slice(chunk);
                out.extend_from_slice(b"\r\n");
            }
            out
        },
        "quoted-printable" => qp_encode(decoded),
        _ => decoded.to_vec(),
    }
}

fn qp_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 4);
    let mut column = 0;
    for &b in data {
        let literal = matches!(b, b'\t' | b' ' | 33..=60 | 62..=126);
        let width = if literal { 1 } else { 3 };
        if column + width > 72 {
            out.extend_from_slice(b"=\r\n");
            column = 0;
        }
        if literal {
            out.push(b);
        } else if b == b'\n' {
            // Preserve line structure rather than encoding the newline.
            out.extend_from_slice(b"\r\n");
            column = 0;
            continue;
        } else {
            out.extend_from_slice(
                format!("={:02X}", b).as_bytes(),
            );
        }
        column += width;
    }
    out
}

/// The ANNOTATION fetch response: each matching entry with the requested
/// attributes (RFC 5257).
fn annotation(
    message: &Message,
    user_id: i64,
    entry_specs: &[String],
    attribs: &[String],
) -> String {
    let annotations: Vec<_> = message
        .annotations
        .iter()
        .flatten()
        .filter(|a| a.owner.is_none() || a.owner == Some(user_id))
        .filter(|a| {
            entry_specs
                .iter()
                .any(|spec| lex::wildcard_match(spec, &a.name))
        })
        .collect();

    let mut entry_names: Vec<&str> = Vec::new();
    for annotation in &annotations {
        if !entry_names.contains(&annotation.name.as_str()) {
            entry_names.push(&annotation.name);
        }
    }

    let mut out = String::from("(");
    for (ix, entry) in entry_names.iter().enumerate() {
        if ix > 0 {
            out.push(' ');
        }
        out.push_str(entry);

        let mut rendered: Vec<String> = Vec::new();
        for attrib in attribs {
            let private = attrib.ends_with(".priv");
            let value = annotations
                .iter()
                .find(|a| {
                    a.name == *entry
                        && if private {
                            a.owner.is_some()
                        } else {
                            a.owner.is_none()
                        }
                })
                .map(|a| a.value.as_str());

            let rendered_value = if attrib.starts_with("size") {
                lex::quoted(
                    &value.map(|v| v.len()).unwrap_or(0).to_string(),
                )
            } else {
                lex::nstring(value)
            };
            rendered.push(format!("{} {}", attrib, rendered_value));
        }

        if !rendered.is_empty() {
            out.push_str(&format!(" ({})", rendered.join(" ")));
        }
    }
    out.push(')');
    out
}

/// Unsolicited FETCH responses for flag changes discovered by a refresh,
/// used when flushing session updates.
pub(crate) fn flag_update_lines(
    ctx: &mut ConnCtx,
    session: &Arc<Mutex<Session>>,
    uids: &MessageSet,
    ignored_modseq: Option<i64>,
) -> Result<Vec<Vec<u8>>, Error> {
    let (mailbox_id, visible) = {
        let session = session.lock().unwrap();
        (
            session.mailbox_id(),
            uids.intersection(session.messages()),
        )
    };
    if visible.is_empty() {
        return Ok(Vec::new());
    }

    let mut messages: BTreeMap<u32, Message> = visible
        .items()
        .map(|uid| (uid, Message::new(uid)))
        .collect();
    let fetcher = Fetcher::new(mailbox_id, visible.clone());
    fetcher.fetch(&ctx.db, Category::Flags, &mut messages)?;
    fetcher.fetch(&ctx.db, Category::Trivia, &mut messages)?;

    let session = session.lock().unwrap();
    let mut lines = Vec::new();
    for (&uid, message) in &messages {
        let msn = session.msn(uid);
        if 0 == msn {
            continue;
        }
        if ignored_modseq.is_some() && message.modseq == ignored_modseq {
            // The client made this change itself with a silent STORE.
            continue;
        }

        let mut line = format!(
            "* {} FETCH (UID {} FLAGS ({})",
            msn,
            uid,
            flag_list(message, uid, &session)
        );
        if ctx.condstore {
            line.push_str(&format!(
                " MODSEQ ({})",
                message.modseq.unwrap_or(1)
            ));
        }
        line.push(')');
        lines.push(line.into_bytes());
    }

    Ok(lines)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::message::{
        AddressField, Annotation, BodyPart, FlagsView, HeaderField,
    };

    fn parse_str(input: &str, uid: bool) -> FetchCmd {
        // Build enough context for parsing without a live session by
        // exercising the attribute parser directly.
        let mut cmd = FetchCmd {
            uid,
            set: MessageSet::just(1),
            items: Vec::new(),
            peek: true,
            changed_since: None,
        };
        let mut p = ImapParser::new(input.as_bytes());
        if p.present("(") {
            parse_attribute(&mut p, &mut cmd, false);
            while p.present(" ") {
                parse_attribute(&mut p, &mut cmd, false);
            }
            p.require(")");
        } else {
            parse_attribute(&mut p, &mut cmd, true);
        }
        assert!(p.ok(), "{:?}", p.take_error());
        cmd
    }

    #[test]
    fn macro_expansion_order() {
        let cmd = parse_str("ALL", true);
        assert!(matches!(
            cmd.items[..],
            [
                FetchItem::Flags,
                FetchItem::InternalDate,
                FetchItem::Rfc822Size,
                FetchItem::Envelope
            ]
        ));
        assert!(cmd.peek);

        let cmd = parse_str("FAST", true);
        assert_eq!(3, cmd.items.len());

        let cmd = parse_str("FULL", true);
        assert!(matches!(cmd.items.last(), Some(FetchItem::Body)));
    }

    #[test]
    fn body_section_parsing() {
        let cmd = parse_str("BODY.PEEK[HEADER.FIELDS (From Subject)]", true);
        assert!(cmd.peek);
        match cmd.items[0] {
            FetchItem::Section(ref s) => {
                assert_eq!("header.fields", s.id);
                assert_eq!(vec!["From", "Subject"], s.fields);
                assert!(!s.binary);
            },
            ref other => panic!("unexpected item: {:?}", other),
        }

        let cmd = parse_str("BODY[1.2.TEXT]<10.20>", true);
        assert!(!cmd.peek);
        match cmd.items[0] {
            FetchItem::Section(ref s) => {
                assert_eq!("text", s.id);
                assert_eq!("1.2", s.part);
                assert_eq!(Some((10, 20)), s.partial);
            },
            ref other => panic!("unexpected item: {:?}", other),
        }

        let cmd = parse_str("BINARY.SIZE[2]", true);
        match cmd.items[0] {
            FetchItem::Section(ref s) => {
                assert_eq!("size", s.id);
                assert_eq!("2", s.part);
                assert!(s.binary);
            },
            ref other => panic!("unexpected item: {:?}", other),
        }
    }

    fn sample_message() -> Message {
        let mut message = Message::new(7);
        message.modseq = Some(4);
        message.rfc822_size = Some(42);
        message.internal_date = Some(
            chrono::DateTime::parse_from_rfc3339("2020-01-01T00:00:00+00:00")
                .unwrap(),
        );
        message.flags = Some(FlagsView {
            seen: true,
            deleted: false,
            keywords: Vec::new(),
        });
        message.headers = Some(vec![
            HeaderField {
                part: String::new(),
                position: 1,
                field: "Subject".to_owned(),
                value: "Hi".to_owned(),
            },
            HeaderField {
                part: String::new(),
                position: 2,
                field: "Date".to_owned(),
                value: "Wed, 1 Jan 2020 00:00:00 +0000".to_owned(),
            },
        ]);
        message.addresses = Some(vec![AddressField {
            part: String::new(),
            field: "From".to_owned(),
            position: 1,
            address: Address {
                name: None,
                localpart: "a".to_owned(),
                domain: "b".to_owned(),
            },
        }]);
        message.parts = Some(vec![
            BodyPart {
                part: String::new(),
                bytes: 7,
                lines: 1,
                content_type: Some("text".to_owned()),
                content_subtype: Some("plain".to_owned()),
                cte: Some("7bit".to_owned()),
                text: Some(
                    b"Subject: Hi\r\n\r\nhello\r\n".to_vec(),
                ),
                ..BodyPart::default()
            },
            BodyPart {
                part: "1".to_owned(),
                bytes: 7,
                lines: 1,
                content_type: Some("text".to_owned()),
                content_subtype: Some("plain".to_owned()),
                cte: Some("7bit".to_owned()),
                text: Some(b"hello\r\n".to_vec()),
                ..BodyPart::default()
            },
        ]);
        message.annotations = Some(vec![Annotation {
            name: "/comment".to_owned(),
            owner: Some(42),
            value: "hello".to_owned(),
        }]);
        message
    }

    #[test]
    fn envelope_fills_defaults_from_from() {
        let message = sample_message();
        assert_eq!(
            "(\"Wed, 1 Jan 2020 00:00:00 +0000\" \"Hi\" \
             ((NIL NIL \"a\" \"b\")) ((NIL NIL \"a\" \"b\")) \
             ((NIL NIL \"a\" \"b\")) NIL NIL NIL NIL NIL)",
            envelope(&message, "")
        );
    }

    #[test]
    fn single_part_structure() {
        let message = sample_message();
        assert_eq!(
            "(\"text\" \"plain\" NIL NIL NIL \"7BIT\" 7 1)",
            body_structure(&message, "1", false)
        );
        assert_eq!(
            "(\"text\" \"plain\" NIL NIL NIL \"7BIT\" 7 1 NIL NIL NIL NIL)",
            body_structure(&message, "1", true)
        );
    }

    #[test]
    fn section_rendering() {
        let message = sample_message();

        let (label, data) = section_data(
            &Section {
                id: "rfc822.text".to_owned(),
                ..Section::default()
            },
            &message,
        );
        assert_eq!("RFC822.TEXT", label);
        assert_eq!(b"hello\r\n".to_vec(), data.unwrap());

        let (label, data) = section_data(
            &Section {
                id: String::new(),
                part: "1".to_owned(),
                partial: Some((1, 3)),
                ..Section::default()
            },
            &message,
        );
        assert_eq!("BODY[1]<1>", label);
        assert_eq!(b"ell".to_vec(), data.unwrap());

        let (label, data) = section_data(
            &Section {
                id: "header.fields".to_owned(),
                fields: vec!["Subject".to_owned()],
                ..Section::default()
            },
            &message,
        );
        assert_eq!("BODY[HEADER.FIELDS (Subject)]", label);
        assert_eq!(b"Subject: Hi\r\n\r\n".to_vec(), data.unwrap());
    }

    #[test]
    fn annotation_rendering() {
        let message = sample_message();
        assert_eq!(
            "(/comment (value.priv \"hello\"))",
            annotation(
                &message,
                42,
                &["/comment".to_owned()],
                &["value.priv".to_owned()]
            )
        );
        // Another user sees no private annotation.
        assert_eq!(
            "()",
            annotation(
                &message,
                7,
                &["/comment".to_owned()],
                &["value.priv".to_owned()]
            )
        );
    }

    #[test]
    fn cte_reencoding() {
        assert_eq!(b"plain".to_vec(), encode_cte(b"plain", "7bit"));
        let encoded = encode_cte(b"hello world", "base64");
        assert_eq!(b"aGVsbG8gd29ybGQ=\r\n".to_vec(), encoded);
        let qp = encode_cte(&[0xFF, b'a'], "quoted-printable");
        assert_eq!(b"=FFa".to_vec(), qp);
    }
}
