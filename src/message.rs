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

use std::sync::Arc;

use crate::smtp::transcript::Exchange;
use crate::support::error::DeliveryError;

/// A message received over SMTP, frozen at the end of its DATA phase.
///
/// The envelope fields are what the client said in MAIL FROM / RCPT TO,
/// which is distinct from the `From:`/`To:` headers inside the content; in
/// particular BCC recipients show up here and nowhere in the headers.
#[derive(Clone, Debug)]
pub struct SmtpMessage {
    secure: bool,
    source_from: String,
    source_recipients: Vec<String>,
    raw_mime_content: Vec<u8>,
    exchanges: Vec<Exchange>,
}

impl SmtpMessage {
    pub(crate) fn new(
        secure: bool,
        source_from: String,
        source_recipients: Vec<String>,
        raw_mime_content: Vec<u8>,
        exchanges: Vec<Exchange>,
    ) -> Self {
        Self {
            secure,
            source_from,
            source_recipients,
            raw_mime_content,
            exchanges,
        }
    }

    /// Whether the message was received over TLS.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// The envelope sender: the bare address from `MAIL FROM:<...>`.
    pub fn source_from(&self) -> &str {
        &self.source_from
    }

    /// The envelope recipients: the bare addresses from each
    /// `RCPT TO:<...>`, BCC recipients included.
    pub fn source_recipients(&self) -> &[String] {
        &self.source_recipients
    }

    /// The raw RFC 5322 bytes as received, with dot-unstuffing applied and
    /// the terminating `.` line removed.
    pub fn raw_mime_content(&self) -> &[u8] {
        &self.raw_mime_content
    }

    /// The SMTP conversation that produced this message, as recorded up to
    /// and including the DATA terminator and its acknowledgement.
    pub fn smtp_exchanges(&self) -> &[Exchange] {
        &self.exchanges
    }

    /// A structured view of the content (headers, body, attachments),
    /// courtesy of `mail-parser`. The server itself never interprets the
    /// MIME structure.
    pub fn parsed(&self) -> Option<mail_parser::Message<'_>> {
        mail_parser::MessageParser::default()
            .parse(self.raw_mime_content.as_slice())
    }
}

/// The sink a completed message is handed to.
///
/// Implementations run synchronously on the connection task, so they should
/// store the message and return quickly. Returning an error rejects the
/// message: the client gets a 554 reply carrying the error's text and the
/// message is not considered delivered.
pub trait MessageHandler: Send + Sync {
    fn deliver(&self, message: Arc<SmtpMessage>) -> Result<(), DeliveryError>;
}

/// Callbacks for server lifecycle events.
///
/// Listeners are invoked synchronously on whichever task generated the
/// event (the connection task for `notify_message`, the caller of
/// `start`/`close` otherwise), so they must be fast and thread-safe. A
/// panicking listener is logged and does not affect other listeners or the
/// session.
pub trait SmtpServerListener: Send + Sync {
    fn notify_start(&self) {}

    fn notify_close(&self) {}

    fn notify_message(&self, _message: &Arc<SmtpMessage>) {}
}
