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

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task;

use openssl::ssl::{ErrorCode, HandshakeError, SslAcceptor, SslStream};
use tokio::io::{unix::AsyncFd, AsyncRead, AsyncWrite, Interest, ReadBuf};

use crate::support::error::Error;

/// The byte stream of one server connection.
///
/// This fulfils two roles:
/// - Supporting the switch from cleartext to TLS mid-stream (STARTTLS)
///   without giving up the socket.
/// - Adapting the non-blocking socket and the synchronous OpenSSL stream to
///   Tokio's `AsyncRead`/`AsyncWrite`.
///
/// Clones of `SessionIo` track the same underlying state, so a reader half
/// that has been wrapped by a firewall and the writer half both observe the
/// TLS upgrade at the same moment.
///
/// A connection is driven by exactly one task. In particular, no read or
/// write may be in flight while `ssl_accept` runs; the handshake owns the
/// socket until it resolves.
#[derive(Clone)]
pub struct SessionIo {
    // Field order is drop order: the TLS stream and the FD registration
    // must go before the socket itself closes the descriptor.
    mode: Arc<Mutex<Mode>>,
    fd: Arc<AsyncFd<RawFd>>,
    socket: Arc<TcpStream>,
}

enum Mode {
    Cleartext,
    Ssl(SslStream<SocketRw>),
}

impl SessionIo {
    /// Sets up a `SessionIo` over the given socket.
    ///
    /// The socket is put into non-blocking mode and owned by the returned
    /// value (and its clones); it is closed when the last clone is dropped.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(socket: TcpStream) -> Result<Self, Error> {
        socket.set_nonblocking(true)?;
        let fd = AsyncFd::with_interest(
            socket.as_raw_fd(),
            Interest::READABLE | Interest::WRITABLE,
        )?;

        Ok(Self {
            mode: Arc::new(Mutex::new(Mode::Cleartext)),
            fd: Arc::new(fd),
            socket: Arc::new(socket),
        })
    }

    /// The underlying socket, for registration with the socket tracker.
    pub fn socket(&self) -> &Arc<TcpStream> {
        &self.socket
    }

    pub fn is_ssl(&self) -> bool {
        matches!(*self.mode.lock().unwrap(), Mode::Ssl(_))
    }

    /// Performs the server side of the TLS handshake with the given
    /// acceptor and switches the stream into TLS mode.
    ///
    /// On failure the stream is left in cleartext mode, but handshake bytes
    /// may have been consumed; the connection is only good for closing.
    pub async fn ssl_accept(
        &self,
        acceptor: &SslAcceptor,
    ) -> Result<(), Error> {
        // OpenSSL tells us WANT_READ/WANT_WRITE only after running one pass
        // of the handshake, at which point Tokio may still consider the FD
        // ready. The guard from the previous round is therefore cleared
        // right before waiting, so the next wait blocks on a fresh edge.
        let mut result = acceptor.accept(SocketRw(Arc::clone(&self.socket)));
        let mut read_guard =
            None::<tokio::io::unix::AsyncFdReadyGuard<'_, RawFd>>;
        let mut write_guard =
            None::<tokio::io::unix::AsyncFdReadyGuard<'_, RawFd>>;

        loop {
            match result {
                Ok(stream) => {
                    *self.mode.lock().unwrap() = Mode::Ssl(stream);
                    return Ok(());
                },

                Err(HandshakeError::SetupFailure(e)) => return Err(e.into()),

                Err(HandshakeError::Failure(mhss)) => {
                    return Err(mhss_to_error(mhss))
                },

                Err(HandshakeError::WouldBlock(mhss)) => {
                    match mhss.error().code() {
                        ErrorCode::WANT_READ => {
                            if let Some(mut guard) = read_guard.take() {
                                guard.clear_ready();
                            }

                            read_guard = Some(self.fd.readable().await?);
                            result = mhss.handshake();
                        },

                        ErrorCode::WANT_WRITE => {
                            if let Some(mut guard) = write_guard.take() {
                                guard.clear_ready();
                            }

                            write_guard = Some(self.fd.writable().await?);
                            result = mhss.handshake();
                        },

                        _ => return Err(mhss_to_error(mhss)),
                    }
                },
            }
        }
    }

    /// Called when an error is returned from `ssl_read` or `ssl_write`.
    ///
    /// Handles `WANT_READ`/`WANT_WRITE` by arranging a readiness check for
    /// the FD and clearing its currently-set readiness. This must only be
    /// called immediately after `ssl_read`/`ssl_write`, with no await
    /// points in between, so that the `WANT_*` status still reflects the
    /// state of the socket.
    fn on_rw_ssl_error(
        &self,
        ctx: &mut task::Context<'_>,
        e: openssl::ssl::Error,
    ) -> task::Poll<io::Result<()>> {
        match e.code() {
            ErrorCode::WANT_READ => {
                futures::ready!(self.fd.poll_read_ready(ctx))?.clear_ready();
                // Poll again so Tokio actually watches for the next edge.
                futures::ready!(self.fd.poll_read_ready(ctx))?.retain_ready();
                // If we get here, the FD became ready again meanwhile.
                task::Poll::Ready(Ok(()))
            },

            ErrorCode::WANT_WRITE => {
                futures::ready!(self.fd.poll_write_ready(ctx))?.clear_ready();
                futures::ready!(self.fd.poll_write_ready(ctx))?.retain_ready();
                task::Poll::Ready(Ok(()))
            },

            // EOF is represented by the SYSCALL error code with no
            // associated IO error, which `into_io_error` doesn't translate.
            ErrorCode::SYSCALL => task::Poll::Ready(Err(e
                .into_io_error()
                .unwrap_or_else(|_| io::ErrorKind::UnexpectedEof.into()))),

            _ => task::Poll::Ready(Err(e
                .into_io_error()
                .unwrap_or_else(|e| io::Error::new(io::ErrorKind::Other, e)))),
        }
    }
}

impl AsyncRead for SessionIo {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        let mut mode = self.mode.lock().unwrap();
        match *mode {
            Mode::Cleartext => loop {
                let mut guard =
                    futures::ready!(self.fd.poll_read_ready(ctx))?;

                match guard
                    .try_io(|_| (&*self.socket).read(buf.initialize_unfilled()))
                {
                    Ok(Ok(n)) => {
                        buf.advance(n);
                        return task::Poll::Ready(Ok(()));
                    },

                    Ok(Err(e)) => return task::Poll::Ready(Err(e)),

                    Err(_would_block) => continue,
                }
            },

            Mode::Ssl(ref mut ssl) => loop {
                match ssl.ssl_read(buf.initialize_unfilled()) {
                    Ok(n) => {
                        buf.advance(n);
                        return task::Poll::Ready(Ok(()));
                    },

                    Err(e) => futures::ready!(self.on_rw_ssl_error(ctx, e))?,
                }
            },
        }
    }
}

impl AsyncWrite for SessionIo {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        let mut mode = self.mode.lock().unwrap();
        match *mode {
            Mode::Cleartext => loop {
                let mut guard =
                    futures::ready!(self.fd.poll_write_ready(ctx))?;

                if let Ok(result) =
                    guard.try_io(|_| (&*self.socket).write(buf))
                {
                    return task::Poll::Ready(result);
                }
            },

            Mode::Ssl(ref mut ssl) => loop {
                match ssl.ssl_write(buf) {
                    Ok(n) => return task::Poll::Ready(Ok(n)),
                    Err(e) => futures::ready!(self.on_rw_ssl_error(ctx, e))?,
                }
            },
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        // OpenSSL doesn't buffer writes itself and neither do we.
        task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        let mut mode = self.mode.lock().unwrap();
        let done = if let Mode::Ssl(ref mut ssl) = *mode {
            loop {
                match ssl.shutdown() {
                    Ok(openssl::ssl::ShutdownResult::Received) => break,
                    Ok(openssl::ssl::ShutdownResult::Sent) => {
                        return task::Poll::Pending;
                    },

                    Err(e) => futures::ready!(self.on_rw_ssl_error(ctx, e))?,
                }
            }

            true
        } else {
            false
        };

        if done {
            *mode = Mode::Cleartext;
        }

        task::Poll::Ready(Ok(()))
    }
}

/// Synchronous read/write over the shared socket, used as the transport
/// under the OpenSSL stream. The socket is non-blocking, so these return
/// `WouldBlock` which OpenSSL surfaces as `WANT_READ`/`WANT_WRITE`.
struct SocketRw(Arc<TcpStream>);

impl Read for SocketRw {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        (&*self.0).read(dst)
    }
}

impl Write for SocketRw {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        (&*self.0).write(src)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn mhss_to_error(mhss: openssl::ssl::MidHandshakeSslStream<SocketRw>) -> Error {
    let e = mhss.into_error();
    if let Some(es) = e.ssl_error() {
        Error::Ssl(es.clone())
    } else {
        match e.into_io_error() {
            Ok(io) => Error::Io(io),
            Err(e) if e.code() == ErrorCode::SYSCALL => {
                Error::Io(io::ErrorKind::UnexpectedEof.into())
            },
            Err(e) => Error::Io(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}
