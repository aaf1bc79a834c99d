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

use std::net::{Shutdown, TcpListener, TcpStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, error, info};
use openssl::ssl::SslAcceptor;
use tokio::sync::oneshot;
use tokio::task::JoinSet;

use crate::mailbox::{Mailbox, MessageReader};
use crate::message::{MessageHandler, SmtpMessage, SmtpServerListener};
use crate::smtp::auth::SmtpAuth;
use crate::smtp::firewall::{AllowAllFirewall, SmtpFirewall};
use crate::support::error::{DeliveryError, Error};

/// The well-known SMTP port, tried first during dynamic port discovery.
pub const DEFAULT_PORT: u16 = 25;

/// Everything a session needs to know about the server it belongs to.
pub(crate) struct ServerConfig {
    pub local_hostname: String,
    pub max_message_size: Option<u64>,
    pub socket_timeout: Option<Duration>,
    pub firewall: Arc<dyn SmtpFirewall>,
    pub auth: Option<Arc<dyn SmtpAuth>>,
    pub tls: Option<SslAcceptor>,
}

/// State shared between the server handle, the acceptor and the sessions.
pub(crate) struct ServerCore {
    pub(crate) config: ServerConfig,
    pub(crate) tracker: SocketTracker,
    handler: Arc<dyn MessageHandler>,
    mailbox: Arc<Mailbox>,
    listeners: Mutex<Vec<Arc<dyn SmtpServerListener>>>,
}

impl ServerCore {
    /// Hands a completed message to the sink, then to the listeners.
    ///
    /// A sink error propagates (the session turns it into 554) and
    /// suppresses the listener notifications; a panicking listener is
    /// contained.
    pub(crate) fn deliver(
        &self,
        message: SmtpMessage,
    ) -> Result<(), DeliveryError> {
        let message = Arc::new(message);
        self.handler.deliver(Arc::clone(&message))?;

        for listener in self.listeners.lock().unwrap().iter() {
            if catch_unwind(AssertUnwindSafe(|| {
                listener.notify_message(&message)
            }))
            .is_err()
            {
                error!("A server listener panicked in notify_message");
            }
        }

        Ok(())
    }

    fn notify_started(&self) {
        self.mailbox.open();
        for listener in self.listeners.lock().unwrap().iter() {
            if catch_unwind(AssertUnwindSafe(|| listener.notify_start()))
                .is_err()
            {
                error!("A server listener panicked in notify_start");
            }
        }
    }

    fn notify_closed(&self) {
        self.mailbox.close();
        for listener in self.listeners.lock().unwrap().iter() {
            if catch_unwind(AssertUnwindSafe(|| listener.notify_close()))
                .is_err()
            {
                error!("A server listener panicked in notify_close");
            }
        }
    }
}

/// Keeps track of the sockets of live sessions so that shutdown can close
/// them all, unblocking their read loops.
pub(crate) struct SocketTracker {
    sockets: Mutex<Vec<Weak<TcpStream>>>,
}

impl SocketTracker {
    fn new() -> Self {
        Self {
            sockets: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn register(&self, socket: &Arc<TcpStream>) {
        let mut sockets = self.sockets.lock().unwrap();
        sockets.retain(|weak| weak.strong_count() > 0);
        sockets.push(Arc::downgrade(socket));
    }

    fn close_all(&self) {
        for weak in self.sockets.lock().unwrap().drain(..) {
            if let Some(socket) = weak.upgrade() {
                let _ = socket.shutdown(Shutdown::Both);
            }
        }
    }
}

enum Executor {
    Owned(tokio::runtime::Runtime),
    Attached(tokio::runtime::Handle),
}

impl Executor {
    fn handle(&self) -> tokio::runtime::Handle {
        match *self {
            Executor::Owned(ref runtime) => runtime.handle().clone(),
            Executor::Attached(ref handle) => handle.clone(),
        }
    }
}

/// Configures and creates an [`SmtpServer`].
pub struct SmtpServerBuilder {
    port: Option<u16>,
    hostname: Option<String>,
    max_message_size: Option<u64>,
    socket_timeout: Option<Duration>,
    firewall: Option<Arc<dyn SmtpFirewall>>,
    auth: Option<Arc<dyn SmtpAuth>>,
    tls: Option<SslAcceptor>,
    handler: Option<Arc<dyn MessageHandler>>,
    executor: Option<tokio::runtime::Handle>,
}

impl SmtpServerBuilder {
    pub fn new() -> Self {
        Self {
            port: None,
            hostname: None,
            max_message_size: None,
            socket_timeout: None,
            firewall: None,
            auth: None,
            tls: None,
            handler: None,
            executor: None,
        }
    }

    /// The port to listen on. Without this (or with 0) a free port is
    /// discovered when the server starts.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = (port != 0).then_some(port);
        self
    }

    /// The host name the server announces. Defaults to `localhost`.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// The per-message byte ceiling. Crossing it gets the client a 552 and
    /// a closed connection.
    pub fn with_max_message_size(mut self, bytes: u64) -> Self {
        self.max_message_size = Some(bytes);
        self
    }

    /// How long a read from the peer may stall before the connection is
    /// dropped.
    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = Some(timeout);
        self
    }

    /// Installs an admission firewall.
    pub fn with_firewall(mut self, firewall: Arc<dyn SmtpFirewall>) -> Self {
        self.firewall = Some(firewall);
        self
    }

    /// Attaches a password oracle, enabling (and requiring)
    /// authentication.
    pub fn with_auth(mut self, auth: Arc<dyn SmtpAuth>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Attaches a TLS context, enabling (and requiring) STARTTLS.
    pub fn with_secure(mut self, acceptor: SslAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Replaces the default in-memory mailbox with a custom delivery sink.
    pub fn with_message_handler(
        mut self,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Runs the server on an existing Tokio runtime instead of an owned
    /// one.
    pub fn with_executor(mut self, handle: tokio::runtime::Handle) -> Self {
        self.executor = Some(handle);
        self
    }

    pub fn build(self) -> Result<SmtpServer, Error> {
        let executor = match self.executor {
            Some(handle) => Executor::Attached(handle),
            None => Executor::Owned(
                tokio::runtime::Builder::new_multi_thread()
                    .enable_io()
                    .enable_time()
                    .thread_name("mailsink-worker")
                    .build()?,
            ),
        };

        let mailbox = Arc::new(Mailbox::new());
        let handler = self
            .handler
            .unwrap_or_else(|| Arc::clone(&mailbox) as Arc<dyn MessageHandler>);

        let core = Arc::new(ServerCore {
            config: ServerConfig {
                local_hostname: self
                    .hostname
                    .unwrap_or_else(|| "localhost".to_owned()),
                max_message_size: self.max_message_size,
                socket_timeout: self.socket_timeout,
                firewall: self
                    .firewall
                    .unwrap_or_else(|| Arc::new(AllowAllFirewall)),
                auth: self.auth,
                tls: self.tls,
            },
            tracker: SocketTracker::new(),
            handler,
            mailbox,
            listeners: Mutex::new(Vec::new()),
        });

        Ok(SmtpServer {
            core,
            executor,
            configured_port: self.port,
            state: Mutex::new(LifecycleState {
                port: None,
                running: None,
            }),
        })
    }
}

impl Default for SmtpServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct Running {
    shutdown_tx: oneshot::Sender<()>,
    done_rx: oneshot::Receiver<()>,
}

struct LifecycleState {
    port: Option<u16>,
    running: Option<Running>,
}

/// An embeddable SMTP server for tests and development.
///
/// Received messages land in the built-in [`Mailbox`] (or a custom
/// [`MessageHandler`]); the embedding program inspects them through
/// [`SmtpServer::read_messages`] or [`SmtpServer::message_reader`].
pub struct SmtpServer {
    core: Arc<ServerCore>,
    executor: Executor,
    configured_port: Option<u16>,
    state: Mutex<LifecycleState>,
}

impl SmtpServer {
    pub fn builder() -> SmtpServerBuilder {
        SmtpServerBuilder::new()
    }

    /// Binds the listening socket and starts accepting connections.
    ///
    /// Fails if the server is already running or no port can be bound.
    pub fn start(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.running.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let (listener, port) = self.bind()?;
        listener.set_nonblocking(true)?;
        info!(
            "SMTP server listening on port {} as {}",
            port, self.core.config.local_hostname,
        );
        state.port = Some(port);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        self.executor.handle().spawn(accept_loop(
            Arc::clone(&self.core),
            listener,
            shutdown_rx,
            done_tx,
        ));
        state.running = Some(Running {
            shutdown_tx,
            done_rx,
        });
        drop(state);

        self.core.notify_started();
        Ok(())
    }

    fn bind(&self) -> Result<(TcpListener, u16), Error> {
        if let Some(port) = self.configured_port {
            return Ok((TcpListener::bind(("0.0.0.0", port))?, port));
        }

        if let Ok(listener) = TcpListener::bind(("0.0.0.0", DEFAULT_PORT)) {
            return Ok((listener, DEFAULT_PORT));
        }

        // Ports below 1024 are generally reserved for root, so scanning
        // from there maximises the chance of finding one that is free.
        for port in 1024..=u16::MAX {
            if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)) {
                return Ok((listener, port));
            }
        }

        Err(Error::NoFreePort)
    }

    /// Stops accepting connections, closes every live session socket,
    /// waits for the workers to drain and notifies the listeners.
    ///
    /// Closing an already-closed server does nothing. The server can be
    /// started again afterwards. Must not be called from within the
    /// server's own runtime (such as from a listener callback).
    pub fn close(&self) {
        let running = self.state.lock().unwrap().running.take();
        let Some(running) = running else {
            return;
        };

        let _ = running.shutdown_tx.send(());
        let _ = running.done_rx.blocking_recv();

        self.core.notify_closed();
        info!("SMTP server closed");
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running.is_some()
    }

    pub fn is_closed(&self) -> bool {
        !self.is_running()
    }

    /// The port the server listens on; `None` until a dynamic port has
    /// been discovered by `start`.
    pub fn port(&self) -> Option<u16> {
        self.configured_port
            .or_else(|| self.state.lock().unwrap().port)
    }

    pub fn local_hostname(&self) -> &str {
        &self.core.config.local_hostname
    }

    /// Registers a listener for server events.
    pub fn add_listener(&self, listener: Arc<dyn SmtpServerListener>) {
        self.core.listeners.lock().unwrap().push(listener);
    }

    /// Removes a previously registered listener. Returns whether it was
    /// registered.
    pub fn remove_listener(
        &self,
        listener: &Arc<dyn SmtpServerListener>,
    ) -> bool {
        let mut listeners = self.core.listeners.lock().unwrap();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Drains the newly received messages, waiting up to `delay` when the
    /// mailbox is empty.
    ///
    /// Only meaningful with the built-in mailbox; with a custom message
    /// handler nothing ever arrives here.
    pub fn read_messages(&self, delay: Duration) -> Vec<Arc<SmtpMessage>> {
        self.core.mailbox.read_messages(delay)
    }

    /// A blocking iterator over received messages; ends when the server is
    /// closed.
    pub fn message_reader(&self) -> MessageReader {
        self.core.mailbox.reader()
    }
}

impl Drop for SmtpServer {
    fn drop(&mut self) {
        self.close();
    }
}

async fn accept_loop(
    core: Arc<ServerCore>,
    listener: TcpListener,
    mut shutdown_rx: oneshot::Receiver<()>,
    done_tx: oneshot::Sender<()>,
) {
    let listener = match tokio::net::TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!("Unable to attach listening socket to runtime: {}", e);
            let _ = done_tx.send(());
            return;
        },
    };

    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,

            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    if !core.config.firewall.accept(peer) {
                        debug!("smtp:{} Refused by firewall", peer);
                        continue;
                    }

                    debug!("smtp:{} Accepted connection", peer);
                    sessions.spawn(crate::smtp::session::serve_connection(
                        Arc::clone(&core),
                        socket,
                        peer,
                    ));
                },

                // Transient accept failures (e.g. the peer resetting
                // before the handshake) don't stop the server.
                Err(e) => debug!("Accept failed: {}", e),
            },
        }
    }

    // Close the listening socket first so no new connections race the
    // shutdown, then unblock every session read loop.
    drop(listener);
    core.tracker.close_all();
    while sessions.join_next().await.is_some() {}

    let _ = done_tx.send(());
}
