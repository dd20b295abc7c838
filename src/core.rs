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

//! Process-wide state and the event loop. Everything runs on one thread:
//! connections, messages and queue nodes live in slabs keyed by index,
//! and every flow is driven to completion between poll calls, so none of
//! this needs locking.

use crate::connection::{Conn, ConnRole, SendStage, Sock};
use crate::event::Poller;
use crate::list;
use crate::mbuf::{self, MbufPool};
use crate::memcache;
use crate::message::{MsgPool, ParseResult, Protocol};
use crate::request;
use crate::resp;
use crate::response;
use crate::server::ServerPool;
use crate::slowlog::{self, Slowlog};
use crate::stats::{ServerMetric, Stats};
use log::{debug, error, info};
use mio::net::{TcpListener, TcpStream};
use slab::Slab;
use socket2::{Domain, Protocol as SockProtocol, Socket, TcpKeepalive, Type};
use std::io;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const EVENTS_MAX: usize = 1024;
const KEEPALIVE_SECS: u64 = 60;

pub struct Context {
    pub conns: Slab<Conn>,
    pub msgs: MsgPool,
    pub mbufs: MbufPool,
    /// Nodes backing every connection's queues; a message references its
    /// nodes by key so queue neighbors are reachable from the message.
    pub qnodes: Slab<list::Node<usize>>,
    pub pools: Vec<ServerPool>,
    pub stats: Stats,
    pub slowlog: Slowlog,
    pub poller: Option<Poller>,
    frag_id: u64,
}

impl Context {
    pub fn new(
        pools: Vec<ServerPool>,
        mbuf_size: usize,
        max_mbufs: usize,
        max_msgs: usize,
    ) -> Self {
        let shape: Vec<usize> = pools.iter().map(|p| p.servers.len()).collect();

        Self {
            conns: Slab::new(),
            msgs: MsgPool::new(max_msgs),
            mbufs: MbufPool::new(mbuf_size, max_mbufs),
            qnodes: Slab::new(),
            pools,
            stats: Stats::new(&shape),
            slowlog: Slowlog::disabled(),
            poller: None,
            frag_id: 0,
        }
    }

    pub fn set_slowlog(&mut self, slowlog: Slowlog) {
        self.slowlog = slowlog;
    }

    pub fn next_frag_id(&mut self) -> u64 {
        self.frag_id += 1;
        self.frag_id
    }

    // ---- queue plumbing ----

    pub fn enqueue_outq(&mut self, ck: usize, mk: usize) {
        let node = self.qnodes.insert(list::Node::new(mk));

        self.conns[ck].omsg_q.push_back(&mut self.qnodes, node);

        match self.conns[ck].role {
            ConnRole::Client => self.msgs[mk].c_qnode = Some(node),
            _ => {
                let msg = &mut self.msgs[mk];
                msg.s_qnode = Some(node);
                msg.s_conn = Some(ck);
                msg.s_stage = Some(SendStage::Sent);
            }
        }
    }

    pub fn dequeue_outq(&mut self, ck: usize, mk: usize) {
        let node = match self.conns[ck].role {
            ConnRole::Client => self.msgs[mk].c_qnode.take(),
            _ => {
                let msg = &mut self.msgs[mk];
                msg.s_conn = None;
                msg.s_stage = None;
                msg.s_qnode.take()
            }
        };

        if let Some(node) = node {
            self.conns[ck].omsg_q.remove(&mut self.qnodes, node);
            self.qnodes.remove(node);
        }
    }

    pub fn enqueue_inq(&mut self, sck: usize, mk: usize) {
        let node = self.qnodes.insert(list::Node::new(mk));

        self.conns[sck].imsg_q.push_back(&mut self.qnodes, node);

        let msg = &mut self.msgs[mk];
        msg.s_qnode = Some(node);
        msg.s_conn = Some(sck);
        msg.s_stage = Some(SendStage::Pending);
    }

    pub fn dequeue_inq(&mut self, sck: usize, mk: usize) {
        let node = {
            let msg = &mut self.msgs[mk];
            msg.s_conn = None;
            msg.s_stage = None;
            msg.s_qnode.take()
        };

        if let Some(node) = node {
            self.conns[sck].imsg_q.remove(&mut self.qnodes, node);
            self.qnodes.remove(node);
        }
    }

    /// Message at the head of a connection's out-queue.
    pub fn outq_head(&self, ck: usize) -> Option<usize> {
        let node = self.conns[ck].omsg_q.front()?;
        Some(self.qnodes[node].value)
    }

    /// Successor of a request on its client out-queue, in arrival order.
    pub fn next_on_client_q(&self, mk: usize) -> Option<usize> {
        let node = self.msgs[mk].c_qnode?;
        let next = self.qnodes[node].next?;
        Some(self.qnodes[next].value)
    }

    /// Remove a request from whichever server queue currently holds it.
    pub fn detach_from_server(&mut self, mk: usize) {
        let (sck, stage) = {
            let msg = &self.msgs[mk];
            (msg.s_conn, msg.s_stage)
        };

        let sck = match sck {
            Some(s) => s,
            None => return,
        };

        match stage {
            Some(SendStage::Pending) => self.dequeue_inq(sck, mk),
            _ => self.dequeue_outq(sck, mk),
        }
    }

    pub fn release_msg(&mut self, mk: usize) {
        self.msgs.release(mk, &mut self.mbufs);
    }

    // ---- event-loop registrations ----

    fn update_interest(&mut self, ck: usize) -> Result<(), io::Error> {
        match &self.poller {
            Some(p) => {
                let conns = &mut self.conns;
                p.update(&mut conns[ck], ck)
            }
            None => Ok(()),
        }
    }

    pub fn arm_write(&mut self, ck: usize) -> Result<(), io::Error> {
        if self.conns[ck].want_write {
            return Ok(());
        }

        self.conns[ck].want_write = true;
        self.update_interest(ck)
    }

    pub fn disarm_write(&mut self, ck: usize) -> Result<(), io::Error> {
        if !self.conns[ck].want_write {
            return Ok(());
        }

        self.conns[ck].want_write = false;
        self.update_interest(ck)
    }

    // ---- wire driving ----

    fn sock_read(&mut self, ck: usize, mk: usize) -> Result<usize, io::Error> {
        let conns = &mut self.conns;
        let msgs = &mut self.msgs;
        let mbufs = &mut self.mbufs;

        let b = match msgs[mk].chain.tail_room(mbufs) {
            Ok(b) => b,
            Err(_) => return Err(io::Error::from(io::ErrorKind::OutOfMemory)),
        };

        match &mut conns[ck].sock {
            Sock::Stream(s) => {
                let n = s.read(b.room())?;
                b.last += n;
                Ok(n)
            }
            _ => Err(io::Error::from(io::ErrorKind::WouldBlock)),
        }
    }

    /// Parse as many complete messages as the read buffer holds, handing
    /// each to its role's recv_done.
    pub fn parse_ready(&mut self, ck: usize) {
        loop {
            if !self.conns[ck].active() {
                return;
            }

            let mk = match self.conns[ck].rmsg {
                Some(m) => m,
                None => return,
            };

            let role = self.conns[ck].role;
            let protocol = self.conns[ck].protocol;

            let result = {
                let msg = &mut self.msgs[mk];

                match (role, protocol) {
                    (ConnRole::Client, Protocol::Memcache) => memcache::parse_req(msg),
                    (ConnRole::Client, Protocol::Resp) => resp::parse_req(msg),
                    (ConnRole::Server, Protocol::Memcache) => memcache::parse_rsp(msg),
                    (ConnRole::Server, Protocol::Resp) => resp::parse_rsp(msg),
                    _ => return,
                }
            };

            match result {
                ParseResult::Incomplete => return,
                ParseResult::Error => {
                    self.parse_error(ck, mk);
                    return;
                }
                ParseResult::Complete { end } => {
                    let split = {
                        let msgs = &mut self.msgs;
                        let mbufs = &mut self.mbufs;
                        msgs[mk].chain.split_off(mbufs, end)
                    };

                    let trail = match split {
                        Ok(t) => Some(t),
                        Err(_) => {
                            self.conns[ck].err = libc::ENOMEM;
                            return;
                        }
                    };

                    self.msgs[mk].mlen = end as u32;

                    match role {
                        ConnRole::Client => request::recv_done(self, ck, mk, trail),
                        ConnRole::Server => response::recv_done(self, ck, mk, trail),
                        _ => return,
                    }
                }
            }
        }
    }

    fn parse_error(&mut self, ck: usize, mk: usize) {
        let role = self.conns[ck].role;

        self.conns[ck].rmsg = None;

        match role {
            ConnRole::Server => {
                error!(
                    "parse error on rsp {} from s {}",
                    self.msgs[mk].id, self.conns[ck].sd
                );

                self.release_msg(mk);

                // misframed bytes leave the stream unusable; closing
                // cascades SERVER_ERROR to everything outstanding
                self.conns[ck].err = libc::EINVAL;
                self.conns[ck].done = true;
            }
            _ => {
                error!(
                    "parse error on req {} from c {}",
                    self.msgs[mk].id, self.conns[ck].sd
                );

                // answer with an error reply, then wind down once the
                // queue drains; nothing further can be framed anyway
                {
                    let msg = &mut self.msgs[mk];
                    msg.done = true;
                    msg.error = true;
                    msg.err = libc::EINVAL;
                }

                self.enqueue_outq(ck, mk);
                self.conns[ck].eof = true;

                request::maybe_arm_owner(self, mk);
            }
        }
    }

    pub fn conn_recv(&mut self, ck: usize) {
        loop {
            if !self.conns[ck].active() {
                return;
            }

            let role = self.conns[ck].role;

            let mk = match role {
                ConnRole::Client => request::recv_next(self, ck, true),
                ConnRole::Server => response::recv_next(self, ck, true),
                _ => return,
            };

            let mk = match mk {
                Some(m) => m,
                None => return,
            };

            match self.sock_read(ck, mk) {
                Ok(0) => {
                    self.conns[ck].eof = true;
                    self.parse_ready(ck);

                    // let the role observe the eof against any partial
                    // parse state
                    match role {
                        ConnRole::Client => {
                            request::recv_next(self, ck, false);
                        }
                        ConnRole::Server => {
                            response::recv_next(self, ck, false);
                        }
                        _ => {}
                    }

                    return;
                }
                Ok(_) => {
                    self.parse_ready(ck);
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::OutOfMemory =>
                {
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.conns[ck].err = e.raw_os_error().unwrap_or(libc::EIO);
                    return;
                }
            }
        }
    }

    pub fn conn_send(&mut self, ck: usize) {
        loop {
            if !self.conns[ck].active() {
                return;
            }

            let role = self.conns[ck].role;

            let mk = match self.conns[ck].smsg {
                Some(m) => m,
                None => {
                    let next = match role {
                        ConnRole::Client => response::send_next(self, ck),
                        ConnRole::Server => request::send_next(self, ck),
                        _ => None,
                    };

                    match next {
                        Some(m) => m,
                        None => return,
                    }
                }
            };

            let mlen = self.msgs[mk].mlen as usize;
            let off = self.conns[ck].smsg_off;

            if off < mlen {
                let written = {
                    let conns = &mut self.conns;
                    let msgs = &self.msgs;

                    match &mut conns[ck].sock {
                        Sock::Stream(s) => mbuf::write_vectored_offset(s, &msgs[mk].chain, off),
                        _ => Ok(mlen - off),
                    }
                };

                match written {
                    Ok(0) => return,
                    Ok(n) => {
                        self.conns[ck].smsg_off += n;

                        if self.conns[ck].smsg_off < mlen {
                            continue;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        self.conns[ck].err = e.raw_os_error().unwrap_or(libc::EIO);
                        return;
                    }
                }
            }

            self.conns[ck].smsg = None;
            self.conns[ck].smsg_off = 0;

            match role {
                ConnRole::Client => response::send_done(self, ck, mk),
                ConnRole::Server => request::send_done(self, ck, mk),
                _ => {}
            }
        }
    }

    // ---- lifecycle ----

    fn teardown(&mut self, ck: usize) {
        if let Some(p) = &self.poller {
            let conns = &mut self.conns;
            let _ = p.deregister(&mut conns[ck]);
        }

        self.conns.remove(ck);
    }

    pub fn close_conn(&mut self, ck: usize) {
        if !self.conns.contains(ck) {
            return;
        }

        match self.conns[ck].role {
            ConnRole::Listener => self.teardown(ck),
            ConnRole::Client => self.close_client(ck),
            ConnRole::Server => self.close_server(ck),
        }
    }

    fn close_client(&mut self, ck: usize) {
        debug!("close c {} err {}", self.conns[ck].sd, self.conns[ck].err);

        if let Some(mk) = self.conns[ck].rmsg.take() {
            self.release_msg(mk);
        }

        self.conns[ck].smsg = None;
        self.conns[ck].smsg_off = 0;

        loop {
            let node = match self.conns[ck].omsg_q.front() {
                Some(n) => n,
                None => break,
            };

            let mk = self.qnodes[node].value;
            self.dequeue_outq(ck, mk);

            if self.msgs[mk].done {
                if let Some(rsp) = crate::message::unlink_peer(&mut self.msgs, mk) {
                    self.release_msg(rsp);
                }

                self.release_msg(mk);
            } else {
                // still outstanding on a server; its reply gets swallowed
                // when it eventually arrives
                let msg = &mut self.msgs[mk];
                msg.swallow = true;
                msg.owner = None;
            }
        }

        self.teardown(ck);
    }

    fn close_server(&mut self, ck: usize) {
        let err = if self.conns[ck].err != 0 {
            self.conns[ck].err
        } else {
            libc::EPIPE
        };

        error!(
            "close s {} {} err {}",
            self.conns[ck].sd, self.conns[ck].peer_addr, err
        );

        if let Some(mk) = self.conns[ck].rmsg.take() {
            response::put(self, mk);
        }

        self.conns[ck].smsg = None;
        self.conns[ck].smsg_off = 0;

        self.drain_server_queue(ck, true, err);
        self.drain_server_queue(ck, false, err);

        let pool = self.conns[ck].pool;

        if let Some(sidx) = self.conns[ck].server {
            let now = slowlog::now_ms();
            let retry = self.pools[pool].server_retry_timeout_ms;
            let limit = self.pools[pool].server_failure_limit;

            let server = &mut self.pools[pool].servers[sidx];

            // a replacement connection may already have been dialed
            if server.conn == Some(ck) {
                server.conn = None;
                server.authed = false;
            }

            server.mark_failed(now, retry, limit);

            self.stats.server_incr(pool, sidx, ServerMetric::Errors);
        }

        self.teardown(ck);
    }

    /// Error out (or discard, for swallowed probes) everything on one of
    /// a dying server connection's queues.
    fn drain_server_queue(&mut self, ck: usize, pending: bool, err: i32) {
        loop {
            let node = if pending {
                self.conns[ck].imsg_q.front()
            } else {
                self.conns[ck].omsg_q.front()
            };

            let node = match node {
                Some(n) => n,
                None => break,
            };

            let mk = self.qnodes[node].value;

            if pending {
                self.dequeue_inq(ck, mk);
            } else {
                self.dequeue_outq(ck, mk);
            }

            if self.msgs[mk].swallow {
                debug_assert!(self.msgs[mk].peer.is_none());
                debug_assert!(self.msgs[mk].c_qnode.is_none());

                self.release_msg(mk);
            } else {
                request::fail_request(self, mk, err);
            }
        }
    }

    // ---- sockets ----

    fn accept_ready(&mut self, lk: usize) {
        loop {
            let res = match &mut self.conns[lk].sock {
                Sock::Listener(l) => l.accept(),
                _ => return,
            };

            match res {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);

                    let pool = self.conns[lk].pool;
                    let protocol = self.conns[lk].protocol;

                    let conn =
                        Conn::new_client(protocol, Sock::Stream(stream), pool, peer.to_string());
                    let ck = self.conns.insert(conn);

                    debug!("accepted c {} from {}", self.conns[ck].sd, peer);

                    let reg = match &self.poller {
                        Some(p) => {
                            let conns = &mut self.conns;
                            p.register(&mut conns[ck], ck)
                        }
                        None => Ok(()),
                    };

                    if let Err(e) = reg {
                        error!("register client failed: {}", e);
                        self.conns.remove(ck);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("accept failed: {}", e);
                    return;
                }
            }
        }
    }

    fn finish_connect(&mut self, sck: usize) {
        let result = match &self.conns[sck].sock {
            Sock::Stream(s) => s.take_error(),
            _ => Ok(None),
        };

        match result {
            Ok(None) => {
                debug!("connected to s {} {}", self.conns[sck].sd, self.conns[sck].peer_addr);

                self.conns[sck].connecting = false;

                if let Err(e) = self.update_interest(sck) {
                    self.conns[sck].err = e.raw_os_error().unwrap_or(libc::EIO);
                }
            }
            Ok(Some(e)) | Err(e) => {
                error!("connect to {} failed: {}", self.conns[sck].peer_addr, e);

                self.conns[sck].err = e.raw_os_error().unwrap_or(libc::ECONNREFUSED);
            }
        }
    }

    /// Bind the pool listeners and stand up the poller; optionally dial
    /// every backend ahead of traffic.
    pub fn init_net(&mut self) -> Result<(), io::Error> {
        let poller = Poller::new(EVENTS_MAX)?;

        for pi in 0..self.pools.len() {
            let listen = self.pools[pi].listen;
            let protocol = self.pools[pi].protocol;

            let listener = TcpListener::bind(listen)?;

            let conn = Conn::new_listener(protocol, Sock::Listener(listener), pi);
            let lk = self.conns.insert(conn);

            {
                let conns = &mut self.conns;
                poller.register(&mut conns[lk], lk)?;
            }

            info!("pool {} listening on {}", self.pools[pi].name, listen);
        }

        self.poller = Some(poller);

        for pi in 0..self.pools.len() {
            if !self.pools[pi].preconnect {
                continue;
            }

            for si in 0..self.pools[pi].servers.len() {
                if let Err(e) = server_conn(self, pi, si) {
                    error!(
                        "preconnect to {} failed: {}",
                        self.pools[pi].servers[si].name, e
                    );
                }
            }
        }

        Ok(())
    }

    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), io::Error> {
        while !shutdown.load(Ordering::Relaxed) {
            let events = match self.poller.as_mut() {
                Some(p) => p.poll(Some(Duration::from_secs(1)))?,
                None => return Ok(()),
            };

            for ev in events {
                let ck = ev.key;

                if !self.conns.contains(ck) {
                    continue;
                }

                if self.conns[ck].role == ConnRole::Listener {
                    if ev.readable {
                        self.accept_ready(ck);
                    }

                    continue;
                }

                if ev.writable && self.conns[ck].connecting {
                    self.finish_connect(ck);
                }

                if ev.writable && self.conns[ck].active() {
                    self.conn_send(ck);
                }

                if ev.readable && self.conns[ck].active() {
                    self.conn_recv(ck);
                }

                if !self.conns[ck].active() {
                    self.close_conn(ck);
                }
            }
        }

        info!("shutting down");

        Ok(())
    }
}

/// Connection to a backend server, dialing one if none is live. The
/// handshake (AUTH for password-protected RESP pools, then a liveness
/// probe) is queued ahead of any request.
pub fn server_conn(ctx: &mut Context, pool: usize, sidx: usize) -> Result<usize, io::Error> {
    if let Some(sck) = ctx.pools[pool].servers[sidx].conn {
        if ctx.conns.contains(sck) && ctx.conns[sck].active() {
            return Ok(sck);
        }
    }

    let addr = ctx.pools[pool].servers[sidx].addr;
    let protocol = ctx.pools[pool].protocol;
    let name = ctx.pools[pool].servers[sidx].name.clone();

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(SockProtocol::TCP))?;
    socket.set_nonblocking(true)?;
    let _ = socket.set_nodelay(true);
    let _ = socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(Duration::from_secs(KEEPALIVE_SECS)));

    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e)
            if e.raw_os_error() == Some(libc::EINPROGRESS)
                || e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }

    let stream = TcpStream::from_std(socket.into());

    let mut conn = Conn::new_server(protocol, Sock::Stream(stream), pool, sidx, name);
    conn.connecting = true;

    let sck = ctx.conns.insert(conn);

    let reg = match &ctx.poller {
        Some(p) => {
            let conns = &mut ctx.conns;
            p.register(&mut conns[sck], sck)
        }
        None => Ok(()),
    };

    if let Err(e) = reg {
        ctx.conns.remove(sck);
        return Err(e);
    }

    ctx.pools[pool].servers[sidx].conn = Some(sck);

    if protocol == Protocol::Resp {
        if let Some(password) = ctx.pools[pool].auth.clone() {
            request::send_auth(ctx, sck, &password);
        }
    }

    request::send_probe(ctx, sck);

    Ok(sck)
}
