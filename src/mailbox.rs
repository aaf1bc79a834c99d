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

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::message::{MessageHandler, SmtpMessage};
use crate::support::error::DeliveryError;

/// The default delivery sink: an in-memory FIFO of received messages.
///
/// Messages are totally ordered by the completion time of their DATA phase.
/// Test code drains it with [`Mailbox::read_messages`] or consumes it with
/// the blocking [`MessageReader`]; closing the server wakes every blocked
/// reader and makes it yield end-of-stream.
pub struct Mailbox {
    inner: Mutex<Inner>,
    available: Condvar,
}

struct Inner {
    messages: VecDeque<Arc<SmtpMessage>>,
    open: bool,
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                messages: VecDeque::new(),
                open: true,
            }),
            available: Condvar::new(),
        }
    }

    pub(crate) fn open(&self) {
        self.inner.lock().unwrap().open = true;
    }

    pub(crate) fn close(&self) {
        self.inner.lock().unwrap().open = false;
        self.available.notify_all();
    }

    /// Drains all messages received since the last drain.
    ///
    /// When the mailbox is empty and still open, waits up to `delay` for
    /// something to arrive before returning. Note that this competes with
    /// any [`MessageReader`] over the same queue.
    pub fn read_messages(&self, delay: Duration) -> Vec<Arc<SmtpMessage>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.messages.is_empty() && inner.open && !delay.is_zero() {
            let (guard, _) =
                self.available.wait_timeout(inner, delay).unwrap();
            inner = guard;
        }

        inner.messages.drain(..).collect()
    }

    /// A blocking iterator over incoming messages.
    pub fn reader(self: &Arc<Self>) -> MessageReader {
        MessageReader {
            mailbox: Arc::clone(self),
        }
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageHandler for Mailbox {
    fn deliver(&self, message: Arc<SmtpMessage>) -> Result<(), DeliveryError> {
        self.inner.lock().unwrap().messages.push_back(message);
        self.available.notify_all();
        Ok(())
    }
}

/// Blocks until the next message arrives; yields `None` once the server is
/// closed and the queue is drained.
pub struct MessageReader {
    mailbox: Arc<Mailbox>,
}

impl MessageReader {
    pub fn next_message(&mut self) -> Option<Arc<SmtpMessage>> {
        let mut inner = self.mailbox.inner.lock().unwrap();
        loop {
            if let Some(message) = inner.messages.pop_front() {
                return Some(message);
            }

            if !inner.open {
                return None;
            }

            inner = self.mailbox.available.wait(inner).unwrap();
        }
    }
}

impl Iterator for MessageReader {
    type Item = Arc<SmtpMessage>;

    fn next(&mut self) -> Option<Arc<SmtpMessage>> {
        self.next_message()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn message(n: u32) -> Arc<SmtpMessage> {
        Arc::new(SmtpMessage::new(
            false,
            format!("sender{}@example.org", n),
            vec!["rcpt@example.org".to_owned()],
            b"Subject: test\r\n\r\nbody".to_vec(),
            vec![],
        ))
    }

    #[test]
    fn messages_drain_in_fifo_order() {
        let mailbox = Mailbox::new();
        mailbox.deliver(message(1)).unwrap();
        mailbox.deliver(message(2)).unwrap();

        let drained = mailbox.read_messages(Duration::ZERO);
        assert_eq!(2, drained.len());
        assert_eq!("sender1@example.org", drained[0].source_from());
        assert_eq!("sender2@example.org", drained[1].source_from());
        assert!(mailbox.read_messages(Duration::ZERO).is_empty());
    }

    #[test]
    fn read_messages_waits_for_arrival() {
        let mailbox = Arc::new(Mailbox::new());

        let producer = {
            let mailbox = Arc::clone(&mailbox);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                mailbox.deliver(message(1)).unwrap();
            })
        };

        let drained = mailbox.read_messages(Duration::from_secs(5));
        assert_eq!(1, drained.len());
        producer.join().unwrap();
    }

    #[test]
    fn reader_blocks_until_message_or_close() {
        let mailbox = Arc::new(Mailbox::new());
        let mut reader = mailbox.reader();

        let producer = {
            let mailbox = Arc::clone(&mailbox);
            std::thread::spawn(move || {
                mailbox.deliver(message(1)).unwrap();
                std::thread::sleep(Duration::from_millis(50));
                mailbox.close();
            })
        };

        assert!(reader.next_message().is_some());
        assert!(reader.next_message().is_none());
        producer.join().unwrap();
    }

    #[test]
    fn close_wakes_all_blocked_readers() {
        let mailbox = Arc::new(Mailbox::new());

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let mut reader = mailbox.reader();
                std::thread::spawn(move || reader.next_message())
            })
            .collect();

        std::thread::sleep(Duration::from_millis(50));
        mailbox.close();

        for reader in readers {
            assert!(reader.join().unwrap().is_none());
        }
    }

    #[test]
    fn closed_mailbox_still_yields_queued_messages() {
        let mailbox = Arc::new(Mailbox::new());
        mailbox.deliver(message(1)).unwrap();
        mailbox.close();

        let mut reader = mailbox.reader();
        assert!(reader.next_message().is_some());
        assert!(reader.next_message().is_none());
    }
}
