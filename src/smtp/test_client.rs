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

//! A minimal blocking SMTP client for exercising the server end to end.
//!
//! Replies are decoded, not pattern-matched: the client follows `NNN-`
//! continuations to the final `NNN ` line and hands tests a [`ReplyText`]
//! with the numeric code and every text line, so assertions talk about
//! codes and extensions instead of wire prefixes.

use std::io::{self, Read, Write};
use std::net::TcpStream;

use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};

use crate::server::SmtpServer;

pub trait Wire: Read + Write + std::fmt::Debug {}
impl<T: Read + Write + std::fmt::Debug> Wire for T {}

/// One decoded server reply: the status code of its final line plus the
/// text of every line, continuation lines included, terminators stripped.
#[derive(Debug)]
pub struct ReplyText {
    pub code: u16,
    pub lines: Vec<String>,
}

impl ReplyText {
    /// The text of the first line.
    pub fn text(&self) -> &str {
        &self.lines[0]
    }

    /// Whether an EHLO reply advertises the given extension line.
    pub fn advertises(&self, extension: &str) -> bool {
        self.lines.iter().any(|line| line == extension)
    }
}

pub struct TestClient {
    name: &'static str,
    wire: Box<dyn Wire>,
}

impl TestClient {
    /// Opens a connection to the given (started) server.
    pub fn connect(server: &SmtpServer, name: &'static str) -> Self {
        let stream =
            TcpStream::connect(("127.0.0.1", server.port().unwrap()))
                .unwrap();
        Self {
            name,
            wire: Box::new(stream),
        }
    }

    /// Consumes the 220 banner and returns its text.
    pub fn banner(&mut self) -> String {
        let banner = self.reply();
        assert_eq!(220, banner.code, "unexpected banner: {:?}", banner);
        banner.lines.into_iter().next().unwrap()
    }

    /// Banner plus EHLO. Returns the EHLO reply: the greeting line first,
    /// the advertised extensions after it.
    pub fn handshake(&mut self, origin: &str) -> ReplyText {
        self.banner();
        self.expect(250, &format!("EHLO {}", origin))
    }

    /// Writes raw bytes without awaiting a reply.
    pub fn push(&mut self, raw: &str) {
        println!("[{}] C: {:?}", self.name, raw);
        self.wire.write_all(raw.as_bytes()).unwrap();
        self.wire.flush().unwrap();
    }

    /// Sends one command line and decodes the reply it provokes.
    pub fn send(&mut self, command: &str) -> ReplyText {
        self.push(&format!("{}\r\n", command));
        self.reply()
    }

    /// Sends one command line and asserts the reply code.
    pub fn expect(&mut self, code: u16, command: &str) -> ReplyText {
        let reply = self.send(command);
        assert_eq!(
            code, reply.code,
            "{:?} was answered with {:?}",
            command, reply,
        );
        reply
    }

    /// Runs one DATA phase: the 354 go-ahead, the payload written
    /// verbatim, the terminating dot. Returns the acknowledgement (or
    /// refusal) of the whole message.
    pub fn submit(&mut self, payload: &str) -> ReplyText {
        self.expect(354, "DATA");
        self.push(payload);
        self.push(".\r\n");
        self.reply()
    }

    /// Decodes one reply, following dash continuations to the final line.
    pub fn reply(&mut self) -> ReplyText {
        let mut lines = Vec::new();
        loop {
            let raw = self.line();
            let code = raw
                .get(..3)
                .and_then(|digits| digits.parse::<u16>().ok())
                .unwrap_or_else(|| {
                    panic!("[{}] unparseable reply line {:?}", self.name, raw)
                });

            let (last, text) = match raw[3..].chars().next() {
                Some('-') => (false, &raw[4..]),
                Some(' ') => (true, &raw[4..]),
                None => (true, ""),
                Some(other) => panic!(
                    "[{}] bad separator {:?} in reply line {:?}",
                    self.name, other, raw,
                ),
            };
            lines.push(text.to_owned());

            if last {
                return ReplyText { code, lines };
            }
        }
    }

    /// Reads one line off the wire, without its terminator.
    fn line(&mut self) -> String {
        let mut raw = Vec::new();
        let mut byte = [0u8];
        loop {
            assert_eq!(
                1,
                self.wire.read(&mut byte).unwrap(),
                "[{}] connection closed inside a reply",
                self.name,
            );
            if b'\n' == byte[0] {
                break;
            }
            raw.push(byte[0]);
        }
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }

        let line: String = raw.iter().map(|&b| b as char).collect();
        println!("[{}] S: {:?}", self.name, line);
        line
    }

    /// Negotiates TLS over the open connection. Certificate checks are
    /// off, since the server presents the self-signed test certificate.
    pub fn negotiate_tls(&mut self) {
        let mut connector = SslConnector::builder(SslMethod::tls()).unwrap();
        connector.set_verify(SslVerifyMode::NONE);

        let plain = std::mem::replace(&mut self.wire, Box::new(io::empty()));
        self.wire = Box::new(
            connector.build().connect("localhost", plain).unwrap(),
        );
        println!("[{}] TLS negotiated", self.name);
    }

    /// Authenticates with AUTH PLAIN, asserting the 235.
    pub fn log_in(&mut self, user: &str, password: &str) {
        let payload = base64::encode(format!("\0{}\0{}", user, password));
        self.expect(235, &format!("AUTH PLAIN {}", payload));
    }

    /// Asserts that the server has dropped the connection.
    pub fn assert_closed(&mut self) {
        let mut sink = [0u8; 32];
        loop {
            match self.wire.read(&mut sink) {
                Ok(0) | Err(_) => return,
                Ok(_) => (),
            }
        }
    }
}
