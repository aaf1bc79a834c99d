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

use std::net::SocketAddr;
use std::pin::Pin;

use tokio::io::AsyncRead;

/// The read half of a session as the firewall sees it.
pub type SessionInput = Pin<Box<dyn AsyncRead + Send>>;

/// Admission decisions for incoming connections and mail.
///
/// A negative decision at MAIL FROM, RCPT TO or message-complete time
/// latches the session's forbidden state: the client gets 550 for
/// everything except a final QUIT. A negative decision at accept time
/// closes the socket before any greeting.
///
/// All methods default to allowing everything, so implementors override
/// only the checks they care about.
pub trait SmtpFirewall: Send + Sync {
    /// Invoked when a connection is accepted, before the greeting.
    fn accept(&self, _peer: SocketAddr) -> bool {
        true
    }

    /// Invoked with the envelope sender after MAIL FROM.
    fn allowed_from(&self, _from: &str) -> bool {
        true
    }

    /// Invoked with each envelope recipient after RCPT TO.
    fn allowed_recipient(&self, _recipient: &str) -> bool {
        true
    }

    /// Invoked with the decoded message bytes after the DATA terminator.
    fn allowed_message(&self, _message: &[u8]) -> bool {
        true
    }

    /// Optionally wraps the session's input stream for byte-level
    /// inspection. Applied to the cleartext stream of each session leg,
    /// including the one re-driven after STARTTLS.
    fn wrap_input(&self, input: SessionInput) -> SessionInput {
        input
    }
}

/// The default firewall: everything is allowed.
pub struct AllowAllFirewall;

impl SmtpFirewall for AllowAllFirewall {}
