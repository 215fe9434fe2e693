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

//! One-line notifications to peer server processes.
//!
//! After any committed modseq bump, the writing process broadcasts
//! `mailbox <name> nextmodseq=<n>` so peers serving the same database can
//! refresh their sessions promptly instead of waiting for the next client
//! command. Delivery is best-effort; peers re-read authoritative state
//! from the database on refresh, so a lost line costs latency, not
//! correctness.

use std::io::Write;
use std::net::TcpStream;
use std::sync::Mutex;

use log::warn;

enum Sink {
    Null,
    Peer(Mutex<Option<TcpStream>>, String),
    #[cfg(test)]
    Capture(Mutex<Vec<String>>),
}

pub struct Bus {
    sink: Sink,
}

impl Bus {
    /// A bus with no configured peer; `send` is a no-op.
    pub fn null() -> Self {
        Bus { sink: Sink::Null }
    }

    /// A bus that writes each line to `addr`, reconnecting lazily after
    /// failures.
    pub fn connect(addr: &str) -> Self {
        Bus {
            sink: Sink::Peer(Mutex::new(None), addr.to_owned()),
        }
    }

    /// A bus that records every line, for tests.
    #[cfg(test)]
    pub fn capture() -> Self {
        Bus {
            sink: Sink::Capture(Mutex::new(Vec::new())),
        }
    }

    #[cfg(test)]
    pub fn captured(&self) -> Vec<String> {
        match self.sink {
            Sink::Capture(ref lines) => lines.lock().unwrap().clone(),
            _ => Vec::new(),
        }
    }

    pub fn send(&self, line: &str) {
        match self.sink {
            Sink::Null => (),
            Sink::Peer(ref stream, ref addr) => {
                let mut stream = stream.lock().unwrap();
                if stream.is_none() {
                    match TcpStream::connect(addr) {
                        Ok(s) => *stream = Some(s),
                        Err(e) => {
                            warn!("Cluster peer {} unreachable: {}", addr, e);
                            return;
                        },
                    }
                }

                let failed = stream
                    .as_mut()
                    .map(|s| {
                        s.write_all(line.as_bytes())
                            .and_then(|_| s.write_all(b"\r\n"))
                            .is_err()
                    })
                    .unwrap_or(false);
                if failed {
                    // Drop the connection; the next send reconnects.
                    warn!("Lost cluster peer connection to {}", addr);
                    *stream = None;
                }
            },
            #[cfg(test)]
            Sink::Capture(ref lines) => {
                lines.lock().unwrap().push(line.to_owned());
            },
        }
    }

    /// The standard notification for a modseq advance.
    pub fn send_nextmodseq(&self, mailbox_name: &str, nextmodseq: i64) {
        self.send(&format!(
            "mailbox \"{}\" nextmodseq={}",
            mailbox_name, nextmodseq
        ));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn capture_records_lines() {
        let bus = Bus::capture();
        bus.send_nextmodseq("INBOX", 6);
        assert_eq!(
            vec!["mailbox \"INBOX\" nextmodseq=6".to_owned()],
            bus.captured()
        );
    }

    #[test]
    fn null_bus_is_silent() {
        Bus::null().send("mailbox \"INBOX\" nextmodseq=1");
    }
}
