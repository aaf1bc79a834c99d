//-
// Copyright (c) 2024, 2025, The Mailsink Authors
//
// This file is part of Mailsink.
//
// Mailsink is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published by  the Free
// Software Foundation, either version 3 of  the License, or (at your option)
// any later version.
//
// Mailsink is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY  WARRANTY; without  even the  implied warranty  of MERCHANTABILITY  or
// FITNESS FOR  A PARTICULAR  PURPOSE. See the  GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Mailsink. If not, see <http://www.gnu.org/licenses/>.

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Server already started")]
    AlreadyStarted,
    #[error("No free port available")]
    NoFreePort,
    #[error("Maximum message size exceeded")]
    SizeExceeded,
    #[error("Connection timed out")]
    Timeout,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Ssl(#[from] openssl::error::ErrorStack),
}

impl Error {
    /// Whether this is the sort of failure a disconnecting peer produces.
    ///
    /// Such failures tear the connection down silently and are only logged
    /// at debug level.
    pub fn is_disconnect(&self) -> bool {
        match *self {
            Error::Io(ref e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
            ),
            Error::Timeout => true,
            _ => false,
        }
    }
}

/// Errors raised by a delivery sink.
///
/// The session turns the error's `Display` text into the 554 reply, so any
/// error type works here.
pub type DeliveryError = Box<dyn std::error::Error + Send + Sync>;
