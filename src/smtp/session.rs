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

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;

use super::auth::{self, AuthOutcome, CramChallenge};
use super::codes::*;
use super::reader::LineReader;
use super::syntax::Command;
use super::transcript::{self, Transcript};
use crate::server::ServerCore;
use crate::support::async_io::SessionIo;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

/// Commands may be at most this long (terminator excluded); RFC 5321
/// requires servers to accept 512 octets and clients to send no more than
/// 1000 including the CRLF.
const MAX_COMMAND_LINE: usize = 1000;

/// Runs all SMTP conversation legs of one accepted connection.
///
/// A STARTTLS upgrade ends the current leg; the next leg runs on the
/// upgraded stream without re-emitting the banner, which is the sole
/// difference from a fresh connection.
pub(crate) async fn serve_connection(
    core: Arc<ServerCore>,
    socket: tokio::net::TcpStream,
    peer: SocketAddr,
) {
    let log_prefix = LogPrefix::new(format!("smtp:{}", peer));

    match drive_connection(&core, socket, &log_prefix).await {
        Ok(()) => info!("{} Normal client disconnect", log_prefix),
        Err(e) if e.is_disconnect() => {
            debug!("{} Abnormal client disconnect: {}", log_prefix, e);
        },
        Err(e) => warn!("{} Connection failed: {}", log_prefix, e),
    }
}

async fn drive_connection(
    core: &Arc<ServerCore>,
    socket: tokio::net::TcpStream,
    log_prefix: &LogPrefix,
) -> Result<(), Error> {
    let io = SessionIo::new(socket.into_std()?)?;
    core.tracker.register(io.socket());
    info!("{} Connection established", log_prefix);

    let mut secure = false;
    loop {
        let mut session =
            Session::new(core, io.clone(), log_prefix.clone(), secure);
        match session.run().await? {
            Outcome::Closed => return Ok(()),

            Outcome::StartTls => {
                let Some(ref acceptor) = core.config.tls else {
                    return Ok(());
                };

                info!("{} Start TLS handshake", log_prefix);
                match io.ssl_accept(acceptor).await {
                    Ok(()) => {
                        info!("{} TLS handshake completed", log_prefix);
                        secure = io.is_ssl();
                    },

                    Err(e) => {
                        warn!("{} TLS handshake failed: {}", log_prefix, e);
                        let refusal =
                            Reply::new(rc::TlsNotAvailable, "TLS handshake failed");
                        let mut io = io.clone();
                        let _ = io.write_all(refusal.to_wire().as_bytes()).await;
                        return Ok(());
                    },
                }
            },
        }
    }
}

/// How one conversation leg ended.
enum Outcome {
    /// The connection is done (QUIT, EOF, or a terminal refusal).
    Closed,
    /// A 220 "Ready to start TLS" has been sent; the caller performs the
    /// handshake and re-enters with a fresh session.
    StartTls,
}

/// What the dispatcher decided after one command.
enum Flow {
    Continue,
    Close,
    Upgrade,
}

/// Result of one attempt to read a line.
enum ReadLine {
    Line(Vec<u8>),
    Eof,
    /// The per-message byte ceiling was crossed.
    TooLarge,
}

/// The protocol position of one session leg.
///
/// The envelope travels inside the variants, so "is MAIL FROM set?" is
/// answered by the state itself, and the forbidden latch cannot be
/// bypassed.
enum State {
    /// Banner sent (or suppressed after STARTTLS); waiting for EHLO/HELO.
    Greeted,
    /// EHLO done, an auth provider is attached, no credentials accepted
    /// yet.
    Authenticating,
    /// Ready for a mail transaction.
    Authenticated,
    /// MAIL FROM accepted.
    HaveSender { from: String },
    /// At least one RCPT accepted.
    HaveRecipients {
        from: String,
        recipients: Vec<String>,
    },
    /// Latched by a firewall rejection or auth-attempt overflow; only QUIT
    /// gets a non-550 answer.
    Forbidden,
}

enum AuthFlow {
    None,
    AwaitingCram(CramChallenge),
}

struct Session<'a> {
    core: &'a Arc<ServerCore>,
    io: SessionIo,
    reader: LineReader<crate::smtp::firewall::SessionInput>,
    transcript: Transcript,
    log_prefix: LogPrefix,
    secure: bool,
    state: State,
    auth_flow: AuthFlow,
    auth_tries: u32,
}

impl<'a> Session<'a> {
    fn new(
        core: &'a Arc<ServerCore>,
        io: SessionIo,
        log_prefix: LogPrefix,
        secure: bool,
    ) -> Self {
        let input = core.config.firewall.wrap_input(Box::pin(io.clone()));
        let reader = LineReader::new(input, core.config.max_message_size);

        Self {
            core,
            io,
            reader,
            transcript: Transcript::new(),
            log_prefix,
            secure,
            state: State::Greeted,
            auth_flow: AuthFlow::None,
            auth_tries: 0,
        }
    }

    async fn run(&mut self) -> Result<Outcome, Error> {
        // The banner was already emitted on the plaintext leg if this
        // session follows a STARTTLS upgrade.
        if !self.secure {
            self.reply(Reply::new(
                rc::ServiceReady,
                format!(
                    "{} {} server ready",
                    self.core.config.local_hostname,
                    env!("CARGO_PKG_NAME"),
                ),
            ))
            .await?;
        }

        loop {
            if let AuthFlow::AwaitingCram(challenge) =
                std::mem::replace(&mut self.auth_flow, AuthFlow::None)
            {
                match self.read_line().await? {
                    ReadLine::Eof => return Ok(Outcome::Closed),
                    ReadLine::TooLarge => {
                        self.refuse_oversize().await?;
                        return Ok(Outcome::Closed);
                    },
                    ReadLine::Line(line) => {
                        self.finish_cram(&challenge, &line).await?;
                        continue;
                    },
                }
            }

            let line = match self.read_line().await? {
                ReadLine::Line(line) => line,
                ReadLine::Eof => return Ok(Outcome::Closed),
                ReadLine::TooLarge => {
                    self.refuse_oversize().await?;
                    return Ok(Outcome::Closed);
                },
            };

            if line.len() > MAX_COMMAND_LINE {
                warn!("{} Overlong command line", self.log_prefix);
                self.reply(Reply::new(rc::CommandUnknown, "Line too long"))
                    .await?;
                continue;
            }

            let Some(command) = Command::parse(&line) else {
                return Ok(Outcome::Closed);
            };

            match self.handle_command(command).await? {
                Flow::Continue => (),
                Flow::Close => return Ok(Outcome::Closed),
                Flow::Upgrade => return Ok(Outcome::StartTls),
            }
        }
    }

    async fn handle_command(
        &mut self,
        command: Command,
    ) -> Result<Flow, Error> {
        if let State::Forbidden = self.state {
            if let Command::Quit = command {
                self.reply(Reply::new(rc::ServiceClosing, "OK")).await?;
                return Ok(Flow::Close);
            }

            self.reply(Reply::new(
                rc::Forbidden,
                "Subsequent commands forbidden",
            ))
            .await?;
            return Ok(Flow::Continue);
        }

        // With TLS configured but not yet negotiated, nothing but
        // EHLO/STARTTLS/QUIT is acceptable.
        if self.core.config.tls.is_some()
            && !self.secure
            && !matches!(
                command,
                Command::Ehlo(_)
                    | Command::Helo(_)
                    | Command::StartTls
                    | Command::Quit
            )
        {
            self.reply(Reply::new(rc::StartTlsRequired, "STARTTLS required"))
                .await?;
            return Ok(Flow::Continue);
        }

        match command {
            Command::StartTls => {
                if self.secure {
                    return self.bad_sequence().await;
                }

                if self.core.config.tls.is_none() {
                    self.reply(Reply::new(
                        rc::TransactionFailed,
                        "TLS not supported",
                    ))
                    .await?;
                    return Ok(Flow::Close);
                }

                self.reply(Reply::new(rc::ServiceReady, "Ready to start TLS"))
                    .await?;
                Ok(Flow::Upgrade)
            },
            Command::Noop => {
                self.reply(Reply::new(rc::Ok, "OK")).await?;
                Ok(Flow::Continue)
            },

            Command::Verify | Command::Expand | Command::Help => {
                self.reply(Reply::new(rc::NotSupported, "Not supported"))
                    .await?;
                Ok(Flow::Continue)
            },

            Command::Unknown => {
                self.reply(Reply::new(rc::CommandUnknown, "Unknown command"))
                    .await?;
                Ok(Flow::Continue)
            },

            Command::Reset => {
                self.reset_transaction();
                self.reply(Reply::new(rc::Ok, "OK")).await?;
                Ok(Flow::Continue)
            },

            Command::Quit => {
                self.reply(Reply::new(rc::ServiceClosing, "OK")).await?;
                Ok(Flow::Close)
            },

            Command::Ehlo(origin) => self.cmd_helo(origin, true).await,
            Command::Helo(origin) => self.cmd_helo(origin, false).await,
            Command::Auth(parameter) => self.cmd_auth(parameter).await,
            Command::MailFrom(path) => self.cmd_mail_from(path).await,
            Command::Recipient(path) => self.cmd_recipient(path).await,
            Command::Data => self.cmd_data().await,
        }
    }

    async fn cmd_helo(
        &mut self,
        origin: String,
        extended: bool,
    ) -> Result<Flow, Error> {
        if !matches!(self.state, State::Greeted) {
            return self.bad_sequence().await;
        }

        let origin = origin.trim().to_owned();
        if !origin.is_empty() {
            self.log_prefix.set_helo(origin.clone());
        }
        info!(
            "{} SMTP {}",
            self.log_prefix,
            if extended { "EHLO" } else { "HELO" },
        );

        let config = &self.core.config;
        let greeting = format!(
            "{} greets {}",
            config.local_hostname,
            if origin.is_empty() { "you" } else { origin.as_str() },
        );

        if extended {
            let mut lines = vec![greeting, "8BITMIME".to_owned()];
            if config.auth.is_some() {
                lines.push("AUTH PLAIN CRAM-MD5".to_owned());
            }
            if config.tls.is_some() && !self.secure {
                lines.push("STARTTLS".to_owned());
                lines.push("REQUIRETLS".to_owned());
            }
            lines.push(match config.max_message_size {
                Some(size) => format!("SIZE {}", size),
                None => "SIZE".to_owned(),
            });

            self.reply(Reply::multi(rc::Ok, lines)).await?;
        } else {
            self.reply(Reply::new(rc::Ok, greeting)).await?;
        }

        self.state = if config.auth.is_some() {
            State::Authenticating
        } else {
            State::Authenticated
        };
        Ok(Flow::Continue)
    }

    async fn cmd_auth(&mut self, parameter: String) -> Result<Flow, Error> {
        let Some(auth) = self.core.config.auth.clone() else {
            // Without a provider the verb is not advertised and not
            // understood.
            self.reply(Reply::new(rc::CommandUnknown, "Unknown command"))
                .await?;
            return Ok(Flow::Continue);
        };

        if !matches!(self.state, State::Authenticating) {
            return self.bad_sequence().await;
        }

        self.auth_tries += 1;
        if self.auth_tries > auth.max_tries() {
            warn!("{} Too many authentication attempts", self.log_prefix);
            self.reply(Reply::new(
                rc::Forbidden,
                "Too many authentication attempts",
            ))
            .await?;
            self.state = State::Forbidden;
            return Ok(Flow::Continue);
        }

        let (mechanism, initial_response) =
            match parameter.split_once(char::is_whitespace) {
                Some((mechanism, rest)) => (mechanism, rest.trim()),
                None => (parameter.as_str(), ""),
            };

        if mechanism.eq_ignore_ascii_case("PLAIN") {
            if initial_response.is_empty() {
                return self.invalid_parameters().await;
            }

            match auth::authenticate_plain(&*auth, initial_response) {
                AuthOutcome::Succeeded => self.auth_succeeded().await?,
                AuthOutcome::Failed => self.auth_failed().await?,
                AuthOutcome::InvalidParameters => {
                    return self.invalid_parameters().await;
                },
            }
            Ok(Flow::Continue)
        } else if mechanism.eq_ignore_ascii_case("CRAM-MD5") {
            let challenge =
                CramChallenge::generate(&self.core.config.local_hostname);
            self.reply(Reply::new(rc::ServerChallenge, challenge.encoded()))
                .await?;
            self.auth_flow = AuthFlow::AwaitingCram(challenge);
            Ok(Flow::Continue)
        } else {
            self.invalid_parameters().await
        }
    }

    /// Handles the one response line of an outstanding CRAM-MD5 exchange.
    async fn finish_cram(
        &mut self,
        challenge: &CramChallenge,
        line: &[u8],
    ) -> Result<(), Error> {
        let Some(auth) = self.core.config.auth.clone() else {
            return Ok(());
        };

        let response = transcript::to_latin1(line);
        if challenge.verify(response.trim(), &*auth) {
            self.auth_succeeded().await
        } else {
            self.auth_failed().await
        }
    }

    async fn auth_succeeded(&mut self) -> Result<(), Error> {
        info!("{} Authentication succeeded", self.log_prefix);
        self.state = State::Authenticated;
        self.reply(Reply::new(rc::AuthSucceeded, "OK")).await
    }

    async fn auth_failed(&mut self) -> Result<(), Error> {
        warn!("{} Authentication failed", self.log_prefix);
        self.reply(Reply::new(rc::AuthFailed, "Authentication failed"))
            .await
    }

    async fn cmd_mail_from(&mut self, path: String) -> Result<Flow, Error> {
        if !matches!(self.state, State::Authenticated) {
            return self.bad_sequence().await;
        }

        let from = strip_brackets(&path).to_owned();
        if !self.core.config.firewall.allowed_from(&from) {
            warn!("{} Sender <{}> refused", self.log_prefix, from);
            self.reply(Reply::new(rc::Forbidden, "Mail-From forbidden"))
                .await?;
            self.state = State::Forbidden;
            return Ok(Flow::Continue);
        }

        info!("{} Start mail transaction from <{}>", self.log_prefix, from);
        self.state = State::HaveSender { from };
        self.reply(Reply::new(rc::Ok, "OK")).await?;
        Ok(Flow::Continue)
    }

    async fn cmd_recipient(&mut self, path: String) -> Result<Flow, Error> {
        if !matches!(
            self.state,
            State::HaveSender { .. } | State::HaveRecipients { .. }
        ) {
            return self.bad_sequence().await;
        }

        let recipient = strip_brackets(&path).to_owned();
        if !self.core.config.firewall.allowed_recipient(&recipient) {
            warn!("{} Recipient <{}> refused", self.log_prefix, recipient);
            self.reply(Reply::new(rc::Forbidden, "Recipient forbidden"))
                .await?;
            self.state = State::Forbidden;
            return Ok(Flow::Continue);
        }

        self.state = match std::mem::replace(&mut self.state, State::Greeted)
        {
            State::HaveSender { from } => State::HaveRecipients {
                from,
                recipients: vec![recipient],
            },
            State::HaveRecipients {
                from,
                mut recipients,
            } => {
                recipients.push(recipient);
                State::HaveRecipients { from, recipients }
            },
            other => other,
        };
        self.reply(Reply::new(rc::Ok, "OK")).await?;
        Ok(Flow::Continue)
    }

    async fn cmd_data(&mut self) -> Result<Flow, Error> {
        if !matches!(self.state, State::HaveRecipients { .. }) {
            return self.bad_sequence().await;
        }

        self.reply(Reply::new(
            rc::StartMailInput,
            "Start mail input; end with <CRLF>.<CRLF>",
        ))
        .await?;

        let mut content = Vec::<u8>::new();
        loop {
            let line = match self.read_line().await? {
                ReadLine::Line(line) => line,
                // The terminator never arrived; the message is discarded.
                ReadLine::Eof => return Ok(Flow::Close),
                ReadLine::TooLarge => {
                    self.refuse_oversize().await?;
                    return Ok(Flow::Close);
                },
            };

            if line == b"." {
                break;
            }

            // A client-stuffed leading dot covers a literal one.
            if line.starts_with(b".") {
                content.extend_from_slice(&line[1..]);
            } else {
                content.extend_from_slice(&line);
            }
            content.extend_from_slice(b"\r\n");
        }

        // The CRLF before the lone dot belongs to the terminator, not the
        // content.
        if content.ends_with(b"\r\n") {
            content.truncate(content.len() - 2);
        }

        if !self.core.config.firewall.allowed_message(&content) {
            warn!("{} Message refused by firewall", self.log_prefix);
            self.reply(Reply::new(rc::Forbidden, "Message forbidden"))
                .await?;
            self.state = State::Forbidden;
            return Ok(Flow::Continue);
        }

        let (from, recipients) =
            match std::mem::replace(&mut self.state, State::Authenticated) {
                State::HaveRecipients { from, recipients } => {
                    (from, recipients)
                },
                other => {
                    self.state = other;
                    return self.bad_sequence().await;
                },
            };

        let acknowledgement = Reply::new(rc::Ok, "OK");
        let message = crate::message::SmtpMessage::new(
            self.secure,
            from,
            recipients,
            content,
            self.transcript.snapshot_with(&acknowledgement.to_wire()),
        );

        match self.core.deliver(message) {
            Ok(()) => {
                info!("{} Message accepted", self.log_prefix);
                self.reader.reset_budget();
                self.reply(acknowledgement).await?;
            },

            Err(e) => {
                warn!("{} Delivery refused: {}", self.log_prefix, e);
                self.reader.reset_budget();
                self.reply(Reply::new(rc::TransactionFailed, e.to_string()))
                    .await?;
            },
        }

        Ok(Flow::Continue)
    }

    /// RSET and end-of-transaction cleanup: the envelope goes away, the
    /// authentication status stays.
    fn reset_transaction(&mut self) {
        self.reader.reset_budget();
        self.state =
            match std::mem::replace(&mut self.state, State::Greeted) {
                kept @ (State::Greeted
                | State::Authenticating
                | State::Forbidden) => kept,
                _ => State::Authenticated,
            };
    }

    async fn bad_sequence(&mut self) -> Result<Flow, Error> {
        self.reply(Reply::new(
            rc::BadSequence,
            "Bad sequence of command (wrong command)",
        ))
        .await?;
        Ok(Flow::Continue)
    }

    async fn invalid_parameters(&mut self) -> Result<Flow, Error> {
        self.reply(Reply::new(rc::ParametersInvalid, "Invalid parameters"))
            .await?;
        Ok(Flow::Continue)
    }

    /// The byte ceiling was crossed: 552, and the caller drops the
    /// connection.
    async fn refuse_oversize(&mut self) -> Result<(), Error> {
        warn!("{} Maximum message size exceeded", self.log_prefix);
        self.reply(Reply::new(
            rc::SizeExceeded,
            "Maximum message size exceeded",
        ))
        .await
    }

    /// Reads one line, records it in the transcript, and applies the
    /// configured read timeout.
    async fn read_line(&mut self) -> Result<ReadLine, Error> {
        let read = match self.core.config.socket_timeout {
            Some(timeout) => {
                match tokio::time::timeout(timeout, self.reader.next_line())
                    .await
                {
                    Ok(read) => read,
                    Err(_) => return Err(Error::Timeout),
                }
            },
            None => self.reader.next_line().await,
        };

        match read {
            Ok(Some(line)) => {
                self.transcript.record_line(&line);
                Ok(ReadLine::Line(line))
            },
            Ok(None) => Ok(ReadLine::Eof),
            Err(Error::SizeExceeded) => Ok(ReadLine::TooLarge),
            Err(e) => Err(e),
        }
    }

    /// Emits a reply, recording the exchange it closes. The stream is
    /// flushed before returning so pipelined clients observe replies
    /// promptly.
    async fn reply(&mut self, reply: Reply) -> Result<(), Error> {
        let wire = reply.to_wire();
        self.transcript.record_reply(&wire);
        self.io.write_all(wire.as_bytes()).await?;
        self.io.flush().await?;
        Ok(())
    }
}

/// `<addr>` → `addr`. The parser guarantees the brackets are present.
fn strip_brackets(path: &str) -> &str {
    path.strip_prefix('<')
        .and_then(|p| p.strip_suffix('>'))
        .unwrap_or(path)
}
