//-
// Copyright (c) 2024, The Mailsink Authors
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

//! The reply codes this server emits and the reply rendering rules.
//!
//! The module is designed to be wildcard-imported through the `rc`
//! submodule so the enum values read like the bare codes they are.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum ReplyCode {
    ServiceReady = 220,
    ServiceClosing = 221,
    AuthSucceeded = 235,
    Ok = 250,
    ServerChallenge = 334,
    StartMailInput = 354,
    TlsNotAvailable = 454,
    CommandUnknown = 500,
    ParametersInvalid = 501,
    NotSupported = 502,
    BadSequence = 503,
    StartTlsRequired = 530,
    AuthFailed = 535,
    Forbidden = 550,
    SizeExceeded = 552,
    TransactionFailed = 554,
}

pub mod rc {
    pub use super::ReplyCode::*;
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", *self as u16)
    }
}

/// A single reply: one status code and one or more message lines.
///
/// Rendering follows RFC 5321 continuation syntax: every line but the last
/// is `CODE-text\r\n`, the last is `CODE text\r\n`. An empty message line
/// renders as just the code and the separator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    code: ReplyCode,
    messages: Vec<String>,
}

impl Reply {
    pub fn new(code: ReplyCode, message: impl Into<String>) -> Self {
        Self {
            code,
            messages: vec![message.into()],
        }
    }

    /// A multi-line reply. Empty elements are dropped, mirroring the EHLO
    /// advertisement where absent extensions contribute empty strings.
    pub fn multi(
        code: ReplyCode,
        messages: impl IntoIterator<Item = String>,
    ) -> Self {
        let messages: Vec<String> = messages
            .into_iter()
            .filter(|m| !m.is_empty())
            .collect();
        debug_assert!(!messages.is_empty());

        Self { code, messages }
    }

    pub fn code(&self) -> ReplyCode {
        self.code
    }

    /// The exact bytes put on the wire, as text.
    pub fn to_wire(&self) -> String {
        use std::fmt::Write as _;

        let mut s = String::with_capacity(32);
        for (ix, message) in self.messages.iter().enumerate() {
            let last = ix + 1 == self.messages.len();
            let _ = write!(
                s,
                "{}{}{}\r\n",
                self.code,
                if last { ' ' } else { '-' },
                message,
            );
        }

        s
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn single_line_reply() {
        assert_eq!("250 OK\r\n", Reply::new(rc::Ok, "OK").to_wire());
        assert_eq!(
            "554 Transaction failed\r\n",
            Reply::new(rc::TransactionFailed, "Transaction failed").to_wire(),
        );
    }

    #[test]
    fn multi_line_reply_uses_dash_on_all_but_last() {
        let reply = Reply::multi(
            rc::Ok,
            vec![
                "localhost greets you".to_owned(),
                "8BITMIME".to_owned(),
                "SIZE ".to_owned(),
            ],
        );
        assert_eq!(
            "250-localhost greets you\r\n250-8BITMIME\r\n250 SIZE \r\n",
            reply.to_wire(),
        );
    }

    #[test]
    fn multi_line_reply_drops_empty_elements() {
        let reply = Reply::multi(
            rc::Ok,
            vec![
                "localhost greets you".to_owned(),
                String::new(),
                "SIZE 1024".to_owned(),
            ],
        );
        assert_eq!(
            "250-localhost greets you\r\n250 SIZE 1024\r\n",
            reply.to_wire(),
        );
    }

    #[test]
    fn empty_message_renders_code_and_separator() {
        assert_eq!("334 \r\n", Reply::new(rc::ServerChallenge, "").to_wire());
    }
}
