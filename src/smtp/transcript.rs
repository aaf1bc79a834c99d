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

/// One exchange of the SMTP conversation: the raw lines received since the
/// previous reply, paired with the full reply text they triggered.
///
/// Received bytes are projected to text through ISO-8859-1 (a 1:1
/// byte-to-char mapping), so the wire conversation round-trips losslessly
/// regardless of the encoding the client actually used.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Exchange {
    received_lines: Vec<String>,
    reply: String,
}

impl Exchange {
    /// The raw lines read from the client since the previous reply, without
    /// their line terminators.
    pub fn received_lines(&self) -> &[String] {
        &self.received_lines
    }

    /// The reply text as written to the wire, including line terminators.
    pub fn reply(&self) -> &str {
        &self.reply
    }
}

/// Accumulates the exchanges of one connection.
#[derive(Default)]
pub struct Transcript {
    exchanges: Vec<Exchange>,
    pending: Vec<String>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one raw received line.
    pub fn record_line(&mut self, raw: &[u8]) {
        self.pending.push(to_latin1(raw));
    }

    /// Records an emitted reply, closing the current exchange.
    pub fn record_reply(&mut self, reply: &str) {
        self.exchanges.push(Exchange {
            received_lines: std::mem::take(&mut self.pending),
            reply: reply.to_owned(),
        });
    }

    /// The transcript as it will stand once `reply` has been emitted for
    /// the currently pending lines. Used to attach a complete transcript to
    /// a delivered message before the acknowledgement is actually written.
    pub fn snapshot_with(&self, reply: &str) -> Vec<Exchange> {
        let mut exchanges = self.exchanges.clone();
        exchanges.push(Exchange {
            received_lines: self.pending.clone(),
            reply: reply.to_owned(),
        });
        exchanges
    }
}

pub fn to_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}
