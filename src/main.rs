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

mod cluster;
mod db;
mod imap;
mod store;
mod support;

use std::path::PathBuf;
use std::sync::Arc;

use log::error;
use structopt::StructOpt;

use crate::support::error::Error;
use crate::support::system_config::SystemConfig;

#[derive(StructOpt)]
#[structopt(name = "ironpost", about = "SQLite-backed IMAP server")]
struct Options {
    /// Path to the configuration file.
    #[structopt(short, long, default_value = "/etc/ironpost.toml")]
    config: PathBuf,

    #[structopt(subcommand)]
    command: Subcommand,
}

#[derive(StructOpt)]
enum Subcommand {
    /// Run the IMAP server.
    Serve,
    /// Initialise the database, creating a user and their INBOX.
    Init {
        login: String,
        password: String,
    },
}

fn main() {
    init_simple_log();

    let options = Options::from_args();
    let config = match load_config(&options.config) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("Cannot load {}: {}", options.config.display(), e);
            std::process::exit(78); // EX_CONFIG
        },
    };

    let result = match options.command {
        Subcommand::Serve => imap::server::Server::new(config).run(),
        Subcommand::Init { login, password } => {
            init_account(&config, &login, &password)
        },
    };

    if let Err(e) = result {
        error!("Fatal: {}", e);
        std::process::exit(1);
    }
}

fn load_config(path: &std::path::Path) -> Result<SystemConfig, Error> {
    let raw = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&raw)?)
}

fn init_account(
    config: &SystemConfig,
    login: &str,
    password: &str,
) -> Result<(), Error> {
    let db = db::Db::open(&config.database)?;
    db.cxn().execute(
        "INSERT INTO `users` (`login`, `secret`) VALUES (?, ?)",
        (login, password),
    )?;
    let user_id = db.cxn().last_insert_rowid();
    db.cxn().execute(
        "INSERT INTO `mailboxes` (`name`, `owner`) VALUES ('INBOX', ?)",
        (user_id,),
    )?;
    println!("Created user {} with an empty INBOX", login);
    Ok(())
}

fn init_simple_log() {
    let stderr = log4rs::append::console::ConsoleAppender::builder()
        .target(log4rs::append::console::Target::Stderr)
        .encoder(Box::new(log4rs::encode::pattern::PatternEncoder::new(
            "{d(%H:%M:%S%.3f)} [{l}][{t}] {m}{n}",
        )))
        .build();
    let log_config = log4rs::config::Config::builder()
        .appender(
            log4rs::config::Appender::builder()
                .build("stderr", Box::new(stderr)),
        )
        .build(
            log4rs::config::Root::builder()
                .appender("stderr")
                .build(log::LevelFilter::Info),
        )
        .unwrap();
    let _ = log4rs::init_config(log_config);
}
