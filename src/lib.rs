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

//! An embeddable SMTP server for tests and development.
//!
//! The server accepts client connections, runs the SMTP conversation
//! (including STARTTLS and AUTH when configured), and hands every received
//! message — raw bytes, envelope, and the full protocol transcript — to
//! the embedding program.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use mailsink::SmtpServer;
//!
//! let server = SmtpServer::builder().with_port(2525).build().unwrap();
//! server.start().unwrap();
//!
//! // ... exercise the code that sends mail ...
//!
//! for message in server.read_messages(Duration::from_millis(200)) {
//!     println!(
//!         "{} -> {:?}: {} bytes",
//!         message.source_from(),
//!         message.source_recipients(),
//!         message.raw_mime_content().len(),
//!     );
//! }
//! server.close();
//! ```

pub mod mailbox;
pub mod message;
pub mod server;
pub mod smtp;

mod support;

#[cfg(test)]
mod test_data;

pub use crate::mailbox::{Mailbox, MessageReader};
pub use crate::message::{MessageHandler, SmtpMessage, SmtpServerListener};
pub use crate::server::{SmtpServer, SmtpServerBuilder, DEFAULT_PORT};
pub use crate::smtp::auth::SmtpAuth;
pub use crate::smtp::firewall::{AllowAllFirewall, SmtpFirewall};
pub use crate::smtp::transcript::Exchange;
pub use crate::support::error::{DeliveryError, Error};

#[cfg(test)]
static INIT_TEST_LOG: std::sync::Once = std::sync::Once::new();

#[cfg(test)]
fn init_test_log() {
    INIT_TEST_LOG.call_once(|| {
        if !std::env::var("TEST_LOG").ok().map_or(false, |v| "1" == v) {
            return;
        }

        let stderr = log4rs::append::console::ConsoleAppender::builder()
            .target(log4rs::append::console::Target::Stderr)
            .encoder(Box::new(log4rs::encode::pattern::PatternEncoder::new(
                "{d(%H:%M:%S%.3f)} [{l}][{t}] {m}{n}",
            )))
            .build();
        let log_config = log4rs::config::Config::builder()
            .appender(
                log4rs::config::Appender::builder()
                    .build("stderr", Box::new(stderr)),
            )
            .build(
                log4rs::config::Root::builder()
                    .appender("stderr")
                    .build(log::LevelFilter::Trace),
            )
            .unwrap();
        let _ = log4rs::init_config(log_config);
    });
}
