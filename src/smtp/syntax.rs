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

use lazy_static::lazy_static;
use regex::Regex;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// EHLO origin-host (may be empty)
    Ehlo(String),
    /// HELO origin-host (may be empty)
    Helo(String),
    /// MAIL FROM:<return-path>; the parameter keeps the angle brackets.
    MailFrom(String),
    /// RCPT TO:<forward-path>; the parameter keeps the angle brackets.
    Recipient(String),
    /// DATA
    Data,
    /// RSET
    Reset,
    /// QUIT
    Quit,
    /// NOOP
    Noop,
    /// EXPN ignored...
    Expand,
    /// VRFY ignored...
    Verify,
    /// HELP ignored...
    Help,
    /// STARTTLS
    StartTls,
    /// AUTH mechanism [initial-response]; the parameter is the raw
    /// remainder after the verb.
    Auth(String),
    /// Anything whose verb is not in the set above.
    Unknown,
}

lazy_static! {
    static ref RX_MAIL: Regex =
        Regex::new("^(?i)MAIL\\s+FROM:(<[^>]*>)").unwrap();
    static ref RX_RCPT: Regex =
        Regex::new("^(?i)RCPT\\s+TO:(<[^>]*>)").unwrap();
}

impl Command {
    /// Classifies one raw line, with the line terminator already removed.
    ///
    /// Returns `None` for an empty line, which the session takes as the
    /// end of the command stream. Raw bytes are projected through
    /// ISO-8859-1 so classification never fails on encoding.
    pub fn parse(line: &[u8]) -> Option<Command> {
        let text: String = line.iter().map(|&b| b as char).collect();
        let text = text.trim_end();
        if text.is_empty() {
            return None;
        }

        Some(Self::classify(text))
    }

    fn classify(line: &str) -> Command {
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim_start()),
            None => (line, ""),
        };

        if verb.eq_ignore_ascii_case("EHLO") {
            Command::Ehlo(rest.to_owned())
        } else if verb.eq_ignore_ascii_case("HELO") {
            Command::Helo(rest.to_owned())
        } else if verb.eq_ignore_ascii_case("MAIL") {
            match RX_MAIL.captures(line) {
                Some(cap) => {
                    Command::MailFrom(cap.get(1).unwrap().as_str().to_owned())
                },
                None => Command::Unknown,
            }
        } else if verb.eq_ignore_ascii_case("RCPT") {
            match RX_RCPT.captures(line) {
                Some(cap) => {
                    Command::Recipient(cap.get(1).unwrap().as_str().to_owned())
                },
                None => Command::Unknown,
            }
        } else if verb.eq_ignore_ascii_case("AUTH") {
            Command::Auth(rest.to_owned())
        } else if verb.eq_ignore_ascii_case("DATA") {
            Command::Data
        } else if verb.eq_ignore_ascii_case("RSET") {
            Command::Reset
        } else if verb.eq_ignore_ascii_case("QUIT") {
            Command::Quit
        } else if verb.eq_ignore_ascii_case("NOOP") {
            Command::Noop
        } else if verb.eq_ignore_ascii_case("EXPN") {
            Command::Expand
        } else if verb.eq_ignore_ascii_case("VRFY") {
            Command::Verify
        } else if verb.eq_ignore_ascii_case("HELP") {
            Command::Help
        } else if verb.eq_ignore_ascii_case("STARTTLS") {
            Command::StartTls
        } else {
            Command::Unknown
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(s: &str) -> Option<Command> {
        Command::parse(s.as_bytes())
    }

    #[test]
    fn command_parsing() {
        assert_eq!(
            Some(Command::Ehlo("foo.example.com".to_owned())),
            parse("EHLO foo.example.com"),
        );
        assert_eq!(
            Some(Command::Ehlo("foo.example.com".to_owned())),
            parse("ehlo foo.example.com"),
        );
        assert_eq!(Some(Command::Ehlo(String::new())), parse("EHLO"));
        assert_eq!(
            Some(Command::Helo("foo.example.com".to_owned())),
            parse("HELO foo.example.com"),
        );

        assert_eq!(
            Some(Command::MailFrom("<foo@bar.com>".to_owned())),
            parse("MAIL FROM:<foo@bar.com>"),
        );
        assert_eq!(
            Some(Command::MailFrom("<foo@bar.com>".to_owned())),
            parse("mail from:<foo@bar.com>"),
        );
        assert_eq!(Some(Command::MailFrom("<>".to_owned())), parse("MAIL FROM:<>"));
        // Extension parameters after the path are tolerated and ignored.
        assert_eq!(
            Some(Command::MailFrom("<foo@bar.com>".to_owned())),
            parse("MAIL FROM:<foo@bar.com> SIZE=42"),
        );
        assert_eq!(Some(Command::Unknown), parse("MAIL"));
        assert_eq!(Some(Command::Unknown), parse("MAIL TO:<foo@bar.com>"));
        assert_eq!(Some(Command::Unknown), parse("MAIL FROM:foo@bar.com"));

        assert_eq!(
            Some(Command::Recipient("<userc@d.bar.org>".to_owned())),
            parse("RCPT TO:<userc@d.bar.org>"),
        );
        assert_eq!(
            Some(Command::Recipient("<userc@d.bar.org>".to_owned())),
            parse("rcpt to:<userc@d.bar.org>"),
        );
        assert_eq!(Some(Command::Unknown), parse("RCPT FROM:<userc@d.bar.org>"));
        assert_eq!(Some(Command::Unknown), parse("RCPT"));

        assert_eq!(Some(Command::Data), parse("DATA"));
        assert_eq!(Some(Command::Data), parse("data"));
        assert_eq!(Some(Command::Reset), parse("RSET"));
        assert_eq!(Some(Command::Quit), parse("QUIT"));
        assert_eq!(Some(Command::Noop), parse("NOOP"));
        assert_eq!(Some(Command::Expand), parse("EXPN Smith"));
        assert_eq!(Some(Command::Verify), parse("VRFY <foo@bar.com>"));
        assert_eq!(Some(Command::Help), parse("HELP me"));
        assert_eq!(Some(Command::StartTls), parse("STARTTLS"));

        assert_eq!(
            Some(Command::Auth("PLAIN AGF6dXJlAGh1bnRlcjI=".to_owned())),
            parse("AUTH PLAIN AGF6dXJlAGh1bnRlcjI="),
        );
        assert_eq!(
            Some(Command::Auth("CRAM-MD5".to_owned())),
            parse("auth CRAM-MD5"),
        );
        assert_eq!(Some(Command::Auth(String::new())), parse("AUTH"));

        assert_eq!(Some(Command::Unknown), parse("DATABASE"));
        assert_eq!(Some(Command::Unknown), parse("GET / HTTP/1.0"));
    }

    #[test]
    fn trailing_whitespace_is_trimmed() {
        assert_eq!(Some(Command::Quit), parse("QUIT   "));
        assert_eq!(
            Some(Command::Ehlo("client.example".to_owned())),
            parse("EHLO client.example  "),
        );
    }

    #[test]
    fn empty_line_signals_end_of_commands() {
        assert_eq!(None, parse(""));
        assert_eq!(None, parse("   "));
    }

    #[test]
    fn non_ascii_bytes_do_not_break_classification() {
        assert_eq!(
            Some(Command::Ehlo("h\u{fc}llo".to_owned())),
            Command::parse(b"EHLO h\xfcllo"),
        );
    }
}
