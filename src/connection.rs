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

use crate::list;
use crate::message::Protocol;
use mio::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConnRole {
    Client,
    Server,
    Listener,
}

/// Which server-side queue a forwarded request currently sits on.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SendStage {
    /// On `imsg_q`, not yet written to the server.
    Pending,
    /// On `omsg_q`, written and awaiting its reply.
    Sent,
}

pub enum Sock {
    /// No socket attached; used by unit tests driving the pipeline by hand.
    Detached,
    Stream(TcpStream),
    Listener(TcpListener),
}

pub struct Conn {
    pub role: ConnRole,
    pub protocol: Protocol,
    pub sock: Sock,
    /// File descriptor for log lines; -1 when detached.
    pub sd: i32,
    /// Peer address string, resolved once at accept/connect time so the
    /// slow-log never formats addresses on the hot path.
    pub peer_addr: String,

    /// Owning pool index.
    pub pool: usize,
    /// Server index within the pool (server connections only).
    pub server: Option<usize>,

    /// Message currently being parsed from the wire.
    pub rmsg: Option<usize>,
    /// Message currently being written to the wire.
    pub smsg: Option<usize>,
    /// Bytes of `smsg` already written.
    pub smsg_off: usize,

    /// Server connections: requests accepted for this server but not yet
    /// written out.
    pub imsg_q: list::List,
    /// Outstanding messages: requests awaiting replies, in arrival order on
    /// client connections and in send order on server connections.
    pub omsg_q: list::List,

    pub eof: bool,
    pub done: bool,
    pub err: i32,

    /// Server connection with a nonblocking connect still in flight.
    pub connecting: bool,

    pub want_write: bool,
}

impl Conn {
    fn new(role: ConnRole, protocol: Protocol, sock: Sock, pool: usize, peer_addr: String) -> Self {
        let sd = match &sock {
            Sock::Detached => -1,
            Sock::Stream(s) => s.as_raw_fd(),
            Sock::Listener(l) => l.as_raw_fd(),
        };

        Self {
            role,
            protocol,
            sock,
            sd,
            peer_addr,
            pool,
            server: None,
            rmsg: None,
            smsg: None,
            smsg_off: 0,
            imsg_q: list::List::default(),
            omsg_q: list::List::default(),
            eof: false,
            done: false,
            err: 0,
            connecting: false,
            want_write: false,
        }
    }

    pub fn new_client(protocol: Protocol, sock: Sock, pool: usize, peer_addr: String) -> Self {
        Self::new(ConnRole::Client, protocol, sock, pool, peer_addr)
    }

    pub fn new_server(
        protocol: Protocol,
        sock: Sock,
        pool: usize,
        server: usize,
        peer_addr: String,
    ) -> Self {
        let mut c = Self::new(ConnRole::Server, protocol, sock, pool, peer_addr);
        c.server = Some(server);
        c
    }

    pub fn new_listener(protocol: Protocol, sock: Sock, pool: usize) -> Self {
        Self::new(ConnRole::Listener, protocol, sock, pool, String::new())
    }

    pub fn is_client(&self) -> bool {
        self.role == ConnRole::Client
    }

    pub fn is_server(&self) -> bool {
        self.role == ConnRole::Server
    }

    pub fn active(&self) -> bool {
        !self.done && self.err == 0
    }
}
