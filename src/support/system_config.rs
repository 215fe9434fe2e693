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

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The system-wide configuration for Ironpost.
///
/// This is stored in a TOML file, typically `/usr/local/etc/ironpost.toml`
/// or `/etc/ironpost.toml`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SystemConfig {
    /// The address the IMAP listener binds, e.g. `"0.0.0.0:143"`.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// The path to the SQLite database holding all mail state.
    pub database: PathBuf,

    /// If set, one-line state change notifications are sent to this
    /// `host:port` so peer processes sharing the database can refresh
    /// their sessions promptly.
    #[serde(default)]
    pub cluster_peer: Option<String>,

    /// Milliseconds between FETCH response trickle ticks.
    ///
    /// Long-running FETCHes release their buffered responses in adaptive
    /// batches at this interval so impatient clients see progress.
    #[serde(default = "default_trickle")]
    pub trickle_interval_ms: u64,
}

fn default_listen() -> String {
    "0.0.0.0:143".to_owned()
}

fn default_trickle() -> u64 {
    1000
}
