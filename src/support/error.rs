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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("No such mailbox")]
    NxMailbox,
    #[error("Non-existent message")]
    NxMessage,
    #[error("No such user")]
    NxUser,
    #[error("Message expunged")]
    ExpungedMessage,
    #[error("Mailbox read-only")]
    MailboxReadOnly,
    #[error("Mailbox is not accessible")]
    PermissionDenied,
    #[error("Unsupported/unknown flag")]
    NxFlag,
    #[error("Unsafe mailbox or entry name")]
    UnsafeName,
    #[error("No mailbox is selected")]
    NoSessionActive,
    #[error("Dependent object was destroyed")]
    Signalled,
    #[error("Database transaction failed")]
    TxFailed,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}
