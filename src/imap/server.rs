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

//! The IMAP listener and per-connection loop.
//!
//! One OS thread serves one connection: it assembles command lines
//! (following literal continuations), feeds them to the dispatcher, and
//! drains the dispatcher's output, sleeping one trickle interval between
//! ticks while a FETCH is still releasing rate-limited responses.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use log::{error, info};
use regex::bytes::Regex;

use super::command::{ConnCtx, ConnState, Dispatcher};
use super::handlers::{self, CAPABILITIES};
use crate::cluster::Bus;
use crate::db::Db;
use crate::store::mailbox::MailboxRegistry;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::SystemConfig;

const MAX_CMDLINE: usize = 65536;
const IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

lazy_static! {
    static ref LITERAL_AT_EOL: Regex =
        Regex::new(r"\{([0-9]+)(\+?)\}$").unwrap();
}

pub struct Server {
    config: Arc<SystemConfig>,
    registry: Arc<MailboxRegistry>,
    bus: Arc<Bus>,
}

impl Server {
    pub fn new(config: Arc<SystemConfig>) -> Self {
        let bus = match config.cluster_peer {
            Some(ref peer) => Arc::new(Bus::connect(peer)),
            None => Arc::new(Bus::null()),
        };
        Server {
            config,
            registry: Arc::new(MailboxRegistry::new()),
            bus,
        }
    }

    /// Accepts connections forever.
    pub fn run(&self) -> Result<(), Error> {
        let listener = TcpListener::bind(&self.config.listen)?;
        info!("Listening for IMAP on {}", self.config.listen);

        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Accept failed: {}", e);
                    continue;
                },
            };

            let config = Arc::clone(&self.config);
            let registry = Arc::clone(&self.registry);
            let bus = Arc::clone(&self.bus);
            std::thread::spawn(move || {
                let peer = stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| "?".to_owned());
                let log_prefix = LogPrefix::new(peer);
                if let Err(e) =
                    serve(stream, config, registry, bus, log_prefix.clone())
                {
                    info!("{} connection ended: {}", log_prefix, e);
                }
            });
        }

        Ok(())
    }
}

fn serve(
    stream: TcpStream,
    config: Arc<SystemConfig>,
    registry: Arc<MailboxRegistry>,
    bus: Arc<Bus>,
    log_prefix: LogPrefix,
) -> Result<(), Error> {
    stream.set_read_timeout(Some(IDLE_TIMEOUT))?;
    let write = stream.try_clone()?;
    let db = Db::open(&config.database)?;
    let ctx = ConnCtx::new(db, registry, bus, log_prefix);

    let trickle = Duration::from_millis(config.trickle_interval_ms);
    run_connection(BufReader::new(stream), write, ctx, trickle)
}

/// Drives one connection from greeting to logout.
///
/// Factored away from the socket so the tests can run a whole session
/// over in-memory buffers.
pub fn run_connection<R: Read, W: Write>(
    mut read: BufReader<R>,
    mut write: W,
    mut ctx: ConnCtx,
    trickle: Duration,
) -> Result<(), Error> {
    write.write_all(
        format!(
            "* OK [CAPABILITY {}] Ironpost ready\r\n",
            CAPABILITIES.join(" ")
        )
        .as_bytes(),
    )?;
    write.flush()?;

    let mut dispatcher = Dispatcher::new();
    let mut cmdline = Vec::<u8>::new();

    while ConnState::Logout != ctx.state {
        cmdline.clear();
        match read_command(&mut read, &mut write, &mut cmdline) {
            Ok(true) => (),
            Ok(false) => continue, // over-long command was swallowed
            Err(Error::Io(ref e))
                if io::ErrorKind::WouldBlock == e.kind()
                    || io::ErrorKind::TimedOut == e.kind() =>
            {
                let _ = write.write_all(
                    b"* BYE Autologout; idle for too long\r\n",
                );
                let _ = write.flush();
                return Ok(());
            },
            Err(Error::Io(ref e))
                if io::ErrorKind::UnexpectedEof == e.kind() =>
            {
                // Client went away without LOGOUT.
                return Ok(());
            },
            Err(e) => return Err(e),
        }

        let cmd = handlers::parse_command(&mut ctx, &cmdline);
        dispatcher.enqueue(cmd);
        dispatcher.tick(&mut ctx, &mut write)?;

        // If the client pipelined more commands they are already in the
        // read buffer; parse them before draining so same-group commands
        // can overlap.
        if !read.buffer().is_empty() {
            continue;
        }

        while !dispatcher.idle() && ConnState::Logout != ctx.state {
            if !trickle.is_zero() {
                std::thread::sleep(trickle);
            }
            dispatcher.tick(&mut ctx, &mut write)?;
        }
    }

    Ok(())
}

/// Reads one complete command into `cmdline`, following literal
/// continuations. Returns false if the command exceeded the line limit
/// and was swallowed (with a BAD already sent).
fn read_command<R: Read, W: Write>(
    read: &mut BufReader<R>,
    write: &mut W,
    cmdline: &mut Vec<u8>,
) -> Result<bool, Error> {
    loop {
        let nread = buffer_next_line(read, cmdline)?;

        if cmdline.len() > MAX_CMDLINE {
            write.write_all(b"* BAD Command line too long\r\n")?;
            write.flush()?;
            return Ok(false);
        }

        let tail = &cmdline[cmdline.len() - nread..];
        let literal = LITERAL_AT_EOL.captures(tail).and_then(|c| {
            let length = std::str::from_utf8(&c[1])
                .ok()
                .and_then(|s| s.parse::<u32>().ok())?;
            Some((length, !c[2].is_empty()))
        });

        let (length, literal_plus) = match literal {
            Some(l) => l,
            None => return Ok(true),
        };

        if length as usize + cmdline.len() > MAX_CMDLINE {
            write.write_all(b"* BAD Literal too long\r\n")?;
            write.flush()?;
            // There is no hope of resynchronising cheaply; drain what
            // the client promised to send and give up on the command.
            io::copy(
                &mut read.by_ref().take(length as u64),
                &mut io::sink(),
            )?;
            return Ok(false);
        }

        if !literal_plus {
            write.write_all(b"+ go\r\n")?;
            write.flush()?;
        }

        // The parser wants the literal marker's CRLF and the raw bytes
        // inline.
        cmdline.extend_from_slice(b"\r\n");
        let start = cmdline.len();
        cmdline.resize(start + length as usize, 0);
        read.read_exact(&mut cmdline[start..])?;
    }
}

/// Reads the next line into `cmdline`, accepting both DOS and bare-LF
/// endings, which are stripped. Returns the number of bytes appended.
fn buffer_next_line<R: Read>(
    read: &mut BufReader<R>,
    cmdline: &mut Vec<u8>,
) -> Result<usize, Error> {
    let mut nread = read
        .by_ref()
        .take(MAX_CMDLINE as u64 + 2)
        .read_until(b'\n', cmdline)?;

    if 0 == nread {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "EOF before reading full line",
        )));
    }

    if cmdline.ends_with(b"\n") {
        cmdline.pop();
        nread -= 1;
        if cmdline.ends_with(b"\r") {
            cmdline.pop();
            nread -= 1;
        }
    }

    Ok(nread)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn literal_detection() {
        assert!(LITERAL_AT_EOL.captures(b"A1 LOGIN {3}").is_some());
        let c = LITERAL_AT_EOL.captures(b"A1 LOGIN {3+}").unwrap();
        assert_eq!(b"3", &c[1]);
        assert!(!c[2].is_empty());
        assert!(LITERAL_AT_EOL.captures(b"A1 LOGIN joe").is_none());
    }

    #[test]
    fn line_reader_strips_endings() {
        let mut read = BufReader::new(&b"A1 NOOP\r\nA2 NOOP\n"[..]);
        let mut line = Vec::new();
        buffer_next_line(&mut read, &mut line).unwrap();
        assert_eq!(b"A1 NOOP".to_vec(), line);
        line.clear();
        buffer_next_line(&mut read, &mut line).unwrap();
        assert_eq!(b"A2 NOOP".to_vec(), line);
        line.clear();
        assert!(buffer_next_line(&mut read, &mut line).is_err());
    }

    #[test]
    fn command_reader_inlines_literals() {
        let mut read =
            BufReader::new(&b"A1 LOGIN {3+}\r\njoe secret\r\n"[..]);
        let mut write = Vec::new();
        let mut cmdline = Vec::new();
        assert!(
            read_command(&mut read, &mut write, &mut cmdline).unwrap()
        );
        assert_eq!(b"A1 LOGIN {3+}\r\njoe secret".to_vec(), cmdline);
        // LITERAL+ needs no continuation.
        assert!(write.is_empty());
    }
}
