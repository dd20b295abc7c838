/*
 * Copyright (C) 2026 Keyport Developers
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::connection::{Conn, Sock};
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::time::Duration;

pub struct Ready {
    pub key: usize,
    pub readable: bool,
    pub writable: bool,
}

/// Readiness poller. Every connection is registered read-interested for its
/// whole life; write interest is armed and dropped as the out-queues demand.
pub struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    pub fn new(capacity: usize) -> Result<Self, io::Error> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
        })
    }

    fn interest(conn: &Conn) -> Interest {
        // a connecting socket reports writable on completion
        if conn.want_write || conn.connecting {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    pub fn register(&self, conn: &mut Conn, key: usize) -> Result<(), io::Error> {
        let interest = Self::interest(conn);

        match &mut conn.sock {
            Sock::Detached => Ok(()),
            Sock::Stream(s) => self.poll.registry().register(s, Token(key), interest),
            Sock::Listener(l) => {
                self.poll
                    .registry()
                    .register(l, Token(key), Interest::READABLE)
            }
        }
    }

    /// Re-register with the connection's current interest set.
    pub fn update(&self, conn: &mut Conn, key: usize) -> Result<(), io::Error> {
        let interest = Self::interest(conn);

        match &mut conn.sock {
            Sock::Detached => Ok(()),
            Sock::Stream(s) => self.poll.registry().reregister(s, Token(key), interest),
            Sock::Listener(_) => Ok(()),
        }
    }

    pub fn deregister(&self, conn: &mut Conn) -> Result<(), io::Error> {
        match &mut conn.sock {
            Sock::Detached => Ok(()),
            Sock::Stream(s) => self.poll.registry().deregister(s),
            Sock::Listener(l) => self.poll.registry().deregister(l),
        }
    }

    /// Wait for readiness and collect the edges. Interrupted polls report
    /// as an empty batch so the caller can notice shutdown signals.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<Ready>, io::Error> {
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }

            return Err(e);
        }

        let mut out = Vec::with_capacity(self.events.iter().count());

        for event in self.events.iter() {
            out.push(Ready {
                key: event.token().0,
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable(),
            });
        }

        Ok(out)
    }
}
