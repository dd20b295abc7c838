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

//! The server-to-client half of the proxy: reply ingestion on server
//! connections, pairing against the head of the out-queue, fragment
//! coalescing hand-off, slow-log and latency accounting, and in-order
//! transmission back to clients, with synthesized error replies for
//! requests that failed along the way.
//!
//! Pairing is strictly FIFO. The protocols are request-synchronous per
//! connection, so the first outstanding request always owns the next
//! complete reply; a reply with no outstanding request means the stream
//! is misaligned and the only safe recovery is tearing the server
//! connection down.

use crate::core::Context;
use crate::mbuf::{AllocError, Chain};
use crate::memcache;
use crate::message::{self, MsgKind, Protocol};
use crate::request;
use crate::resp;
use crate::slowlog;
use crate::stats::{PoolMetric, ServerMetric};
use log::{debug, error};

/// Release a reply message. Its peer link must already be cleared.
pub fn put(ctx: &mut Context, mk: usize) {
    debug_assert!(ctx.msgs[mk].is_response());
    debug_assert!(ctx.msgs[mk].peer.is_none());

    ctx.release_msg(mk);
}

/// Read target on a server connection, allocating one at the first byte
/// of a new reply. On EOF any half-parsed reply is discarded and the
/// connection is marked done; outstanding requests are errored out by the
/// close cascade.
pub fn recv_next(ctx: &mut Context, ck: usize, alloc: bool) -> Option<usize> {
    debug_assert!(ctx.conns[ck].is_server());

    if ctx.conns[ck].eof {
        if let Some(mk) = ctx.conns[ck].rmsg.take() {
            debug_assert!(ctx.msgs[mk].peer.is_none());

            error!(
                "eof s {} discarding incomplete rsp {} len {}",
                ctx.conns[ck].sd, ctx.msgs[mk].id, ctx.msgs[mk].mlen
            );

            put(ctx, mk);
        }

        // a server FIN is answered with an immediate close even with
        // requests outstanding; a server that half-closes is misbehaving
        // and nothing sane can arrive afterward
        ctx.conns[ck].done = true;

        error!("s {} is done", ctx.conns[ck].sd);

        return None;
    }

    if let Some(mk) = ctx.conns[ck].rmsg {
        debug_assert!(ctx.msgs[mk].is_response());
        return Some(mk);
    }

    if !alloc {
        return None;
    }

    let protocol = ctx.conns[ck].protocol;

    match ctx.msgs.alloc(MsgKind::Response, protocol, Some(ck)) {
        Ok(mk) => {
            ctx.conns[ck].rmsg = Some(mk);
            Some(mk)
        }
        // pool pressure is back-pressure, not an error; the bytes stay in
        // the kernel buffer until the next readable edge
        Err(_) => None,
    }
}

/// A reply has fully arrived on a server connection: install the
/// pipelined tail as the next read target, then filter and forward.
pub fn recv_done(ctx: &mut Context, ck: usize, mk: usize, trail: Option<Chain>) {
    debug_assert!(ctx.conns[ck].is_server());
    debug_assert!(ctx.conns[ck].rmsg == Some(mk));

    ctx.conns[ck].rmsg = None;

    if let Some(chain) = trail {
        if !chain.is_empty() {
            let protocol = ctx.conns[ck].protocol;

            match ctx.msgs.alloc(MsgKind::Response, protocol, Some(ck)) {
                Ok(nk) => {
                    ctx.msgs[nk].chain = chain;
                    ctx.conns[ck].rmsg = Some(nk);
                }
                Err(_) => {
                    // the tail bytes cannot be dropped without losing
                    // framing on this connection
                    let mut chain = chain;
                    chain.release(&mut ctx.mbufs);
                    put(ctx, mk);
                    ctx.conns[ck].err = libc::ENOMEM;
                    return;
                }
            }
        }
    }

    if filter(ctx, ck, mk) {
        return;
    }

    forward(ctx, ck, mk);
}

/// Decide whether a completed reply is deliverable. Empty, stray and
/// swallowed replies are consumed here; anything else pairs with the head
/// of the out-queue in `forward`.
fn filter(ctx: &mut Context, ck: usize, mk: usize) -> bool {
    debug_assert!(ctx.conns[ck].is_server());

    if ctx.msgs[mk].empty() {
        debug!(
            "filter empty rsp {} on s {}",
            ctx.msgs[mk].id, ctx.conns[ck].sd
        );

        put(ctx, mk);
        return true;
    }

    let pmsg = match ctx.outq_head(ck) {
        Some(p) => p,
        None => {
            error!(
                "filter stray rsp {} len {} on s {}",
                ctx.msgs[mk].id, ctx.msgs[mk].mlen, ctx.conns[ck].sd
            );

            put(ctx, mk);

            // memcached can emit an error before consuming the whole
            // request (item_size_max being the classic case), leaving the
            // stream misaligned. Realigning would risk pairing future
            // replies with the wrong requests, so the connection is torn
            // down, which errors out everything outstanding on it.
            ctx.conns[ck].err = libc::EINVAL;
            ctx.conns[ck].done = true;

            return true;
        }
    };

    debug_assert!(ctx.msgs[pmsg].is_request());
    debug_assert!(!ctx.msgs[pmsg].done && ctx.msgs[pmsg].peer.is_none());

    if ctx.msgs[pmsg].swallow {
        swallow_rsp(ctx, ck, pmsg, mk);

        ctx.dequeue_outq(ck, pmsg);
        ctx.msgs[pmsg].done = true;

        debug!(
            "swallow rsp {} len {} of req {} on s {}",
            ctx.msgs[mk].id, ctx.msgs[mk].mlen, ctx.msgs[pmsg].id, ctx.conns[ck].sd
        );

        put(ctx, mk);

        debug_assert!(ctx.msgs[pmsg].c_qnode.is_none());
        ctx.release_msg(pmsg);

        return true;
    }

    false
}

/// The swallow hook: probe replies need nothing beyond being consumed.
fn swallow_rsp(ctx: &mut Context, ck: usize, pmsg: usize, mk: usize) {
    debug!(
        "probe req {} answered with {:?} on s {}",
        ctx.msgs[pmsg].id, ctx.msgs[mk].mtype, ctx.conns[ck].sd
    );
}

fn forward_stats(ctx: &mut Context, pool: usize, sidx: usize, msgsize: u32) {
    ctx.stats.server_incr(pool, sidx, ServerMetric::Responses);
    ctx.stats
        .server_incr_by(pool, sidx, ServerMetric::ResponseBytes, msgsize as u64);
}

/// Pair a kept reply with the head of the server out-queue and push it
/// toward the owning client.
fn forward(ctx: &mut Context, ck: usize, mk: usize) {
    let msgsize = ctx.msgs[mk].mlen;

    let pool = ctx.conns[ck].pool;
    let sidx = match ctx.conns[ck].server {
        Some(s) => s,
        None => return,
    };

    // a reply is implicit proof the server is alive and heartbeating
    ctx.pools[pool].servers[sidx].mark_ok();

    let pmsg = match ctx.outq_head(ck) {
        Some(p) => p,
        None => return,
    };

    debug_assert!(ctx.msgs[pmsg].is_request() && !ctx.msgs[pmsg].done);
    debug_assert!(ctx.msgs[pmsg].peer.is_none());

    ctx.dequeue_outq(ck, pmsg);

    message::link_peer(&mut ctx.msgs, pmsg, mk);

    if let Some(hook) = ctx.msgs[pmsg].pre_rsp_forward {
        if !hook(ctx, ck, mk) {
            return;
        }
    }

    ctx.msgs[pmsg].done = true;

    if ctx.pools[pool].slowlog && ctx.msgs[pmsg].slowlog_stime > 0 {
        let now = slowlog::now_ms();

        if now < ctx.msgs[pmsg].slowlog_stime {
            debug!("clock went backwards, slowlog entry skipped");
        } else {
            ctx.msgs[pmsg].slowlog_etime = now;
            check_slowlog(ctx, pool, sidx, pmsg, mk);
        }
    }

    if ctx.msgs[pmsg].frag_id != 0 {
        match ctx.msgs[mk].protocol {
            Protocol::Memcache => memcache::pre_coalesce(ctx, mk),
            Protocol::Resp => resp::pre_coalesce(ctx, mk),
        }
    }

    request::maybe_arm_owner(ctx, pmsg);

    forward_stats(ctx, pool, sidx, msgsize);
}

/// Latency buckets plus the slow-log record for one forwarded reply.
fn check_slowlog(ctx: &mut Context, pool: usize, sidx: usize, pmsg: usize, mk: usize) {
    let cost_ms = ctx.msgs[pmsg].slowlog_etime - ctx.msgs[pmsg].slowlog_stime;

    let local_idc = ctx.pools[pool].servers[sidx].local_idc;
    ctx.stats.record_latency(pool, local_idc, cost_ms);

    if cost_ms < ctx.pools[pool].slowlog_slower_than {
        return;
    }

    let c_conn = ctx.msgs[pmsg].owner;
    let s_conn = ctx.msgs[mk].owner;

    let client_address = match c_conn {
        Some(c) if ctx.conns.contains(c) => ctx.conns[c].peer_addr.as_str(),
        _ => "-",
    };
    let server_address = match s_conn {
        Some(s) if ctx.conns.contains(s) => ctx.conns[s].peer_addr.as_str(),
        _ => "-",
    };

    static NO_KEY: &[u8] = b"";
    let key = match ctx.msgs[pmsg].keys.first() {
        Some(k) => k.as_slice(),
        None => NO_KEY,
    };

    let rec = slowlog::Record {
        request_msg_id: ctx.msgs[pmsg].id,
        client_address,
        server_address,
        cost_ms,
        fragment_id: ctx.msgs[pmsg].frag_id,
        request_type: ctx.msgs[pmsg].mtype.as_str(),
        request_len: ctx.msgs[pmsg].mlen,
        response_len: ctx.msgs[mk].mlen,
        key,
    };

    ctx.slowlog.record(&rec);
}

/// Synthesize the error reply for a failed request at the head of the
/// client out-queue. Sibling fragments are dequeued and released in the
/// same pass, and the first concrete error among them wins.
fn make_error(ctx: &mut Context, ck: usize, mk: usize) -> Result<usize, AllocError> {
    debug_assert!(ctx.conns[ck].is_client());
    debug_assert!(ctx.msgs[mk].is_request());

    let id = ctx.msgs[mk].frag_id;
    let mut err = ctx.msgs[mk].err;

    if id != 0 {
        let mut cur = ctx.next_on_client_q(mk);

        while let Some(cmsg) = cur {
            if ctx.msgs[cmsg].frag_id != id {
                break;
            }

            cur = ctx.next_on_client_q(cmsg);

            ctx.dequeue_outq(ck, cmsg);

            if err == 0 && ctx.msgs[cmsg].err != 0 {
                err = ctx.msgs[cmsg].err;
            }

            request::put(ctx, cmsg);
        }
    }

    if err == 0 {
        err = libc::EINVAL;
    }

    // drop the provisional reply, if one was attached
    if let Some(old) = message::unlink_peer(&mut ctx.msgs, mk) {
        put(ctx, old);
    }

    let protocol = ctx.msgs[mk].protocol;

    message::make_error_reply(&mut ctx.msgs, &mut ctx.mbufs, protocol, err)
}

/// Produce the next reply to write on a client connection, in request
/// arrival order, or none (dropping write interest when the head is not
/// ready). A fragmented parent is assembled exactly once on its way out.
pub fn send_next(ctx: &mut Context, ck: usize) -> Option<usize> {
    debug_assert!(ctx.conns[ck].is_client());

    let head = ctx.outq_head(ck);
    let head_ready = match head {
        Some(h) => request::req_done(ctx, ck, h),
        None => false,
    };

    if !head_ready {
        if head.is_none() && ctx.conns[ck].eof {
            ctx.conns[ck].done = true;
            debug!("c {} is done", ctx.conns[ck].sd);
        }

        if let Err(e) = ctx.disarm_write(ck) {
            ctx.conns[ck].err = e.raw_os_error().unwrap_or(libc::EIO);
        }

        return None;
    }

    let mut pmsg = match head {
        Some(h) => h,
        None => return None,
    };

    // mid-batch resume: the candidate is the successor of the request
    // whose reply is being sent
    if let Some(smsg) = ctx.conns[ck].smsg {
        let prev = match ctx.msgs[smsg].peer {
            Some(p) => p,
            None => return None,
        };

        debug_assert!(request::req_done(ctx, ck, prev));

        pmsg = match ctx.next_on_client_q(prev) {
            Some(n) if request::req_done(ctx, ck, n) => n,
            _ => {
                ctx.conns[ck].smsg = None;
                return None;
            }
        };
    }

    debug_assert!(!ctx.msgs[pmsg].swallow);

    let msg = if request::req_error(ctx, ck, pmsg) {
        let msg = match make_error(ctx, ck, pmsg) {
            Ok(m) => m,
            Err(_) => {
                ctx.conns[ck].err = libc::ENOMEM;
                return None;
            }
        };

        message::link_peer(&mut ctx.msgs, pmsg, msg);

        let pool = ctx.conns[ck].pool;
        ctx.stats.pool_incr(pool, PoolMetric::ForwardError);

        msg
    } else {
        if ctx.msgs[pmsg].nfrag > 0 && !ctx.msgs[pmsg].post_coalesced {
            let result = match ctx.msgs[pmsg].protocol {
                Protocol::Memcache => Ok(()),
                Protocol::Resp => resp::post_coalesce(ctx, pmsg),
            };

            if result.is_err() {
                ctx.conns[ck].err = libc::ENOMEM;
                return None;
            }

            ctx.msgs[pmsg].post_coalesced = true;
        }

        match ctx.msgs[pmsg].peer {
            Some(m) => m,
            None => return None,
        }
    };

    debug_assert!(ctx.msgs[msg].is_response());

    ctx.conns[ck].smsg = Some(msg);
    ctx.conns[ck].smsg_off = 0;

    debug!(
        "send next rsp {} on c {}",
        ctx.msgs[msg].id, ctx.conns[ck].sd
    );

    Some(msg)
}

/// A reply has been fully written: retire the pair. The caller has
/// already cleared `smsg`.
pub fn send_done(ctx: &mut Context, ck: usize, mk: usize) {
    debug_assert!(ctx.conns[ck].is_client());
    debug_assert!(ctx.conns[ck].smsg.is_none());

    debug!(
        "send done rsp {} on c {}",
        ctx.msgs[mk].id, ctx.conns[ck].sd
    );

    let pmsg = match ctx.msgs[mk].peer {
        Some(p) => p,
        None => {
            put(ctx, mk);
            return;
        }
    };

    debug_assert!(ctx.msgs[pmsg].is_request());
    debug_assert!(ctx.msgs[pmsg].peer == Some(mk));
    debug_assert!(ctx.msgs[pmsg].done && !ctx.msgs[pmsg].swallow);

    ctx.dequeue_outq(ck, pmsg);

    message::unlink_peer(&mut ctx.msgs, mk);

    ctx.release_msg(pmsg);
    put(ctx, mk);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Conn, Sock};
    use crate::hash;
    use crate::server::{Server, ServerPool};
    use std::cell::RefCell;
    use std::io::Write;
    use std::rc::Rc;

    fn test_ctx(protocol: Protocol, nservers: usize) -> Context {
        let servers = (0..nservers)
            .map(|i| {
                let name = format!("127.0.0.1:{}", 11211 + i);
                let addr = name.parse().unwrap();
                Server::new(name, addr, i == 0)
            })
            .collect();

        let pool = ServerPool {
            name: "test".into(),
            protocol,
            listen: "127.0.0.1:22121".parse().unwrap(),
            servers,
            slowlog: false,
            slowlog_slower_than: 100,
            server_retry_timeout_ms: 30_000,
            server_failure_limit: 2,
            auth: None,
            preconnect: false,
        };

        Context::new(vec![pool], 64, 4096, 256)
    }

    fn add_client(ctx: &mut Context) -> usize {
        let protocol = ctx.pools[0].protocol;
        ctx.conns.insert(Conn::new_client(
            protocol,
            Sock::Detached,
            0,
            "10.0.0.1:55000".into(),
        ))
    }

    fn add_server(ctx: &mut Context, sidx: usize) -> usize {
        let protocol = ctx.pools[0].protocol;
        let name = ctx.pools[0].servers[sidx].name.clone();
        let sck = ctx
            .conns
            .insert(Conn::new_server(protocol, Sock::Detached, 0, sidx, name));
        ctx.pools[0].servers[sidx].conn = Some(sck);
        sck
    }

    /// A key the shard selector maps to the wanted server.
    fn key_for_server(ctx: &Context, want: usize) -> Vec<u8> {
        for i in 0..10_000 {
            let k = format!("key{}", i).into_bytes();

            if ctx.pools[0].pick_server(hash::fnv1a_64(&k), 0) == want {
                return k;
            }
        }

        unreachable!("no key maps to server {}", want);
    }

    fn client_request(ctx: &mut Context, ck: usize, wire: &[u8]) {
        let mk = request::recv_next(ctx, ck, true).unwrap();

        {
            let msgs = &mut ctx.msgs;
            let mbufs = &mut ctx.mbufs;
            msgs[mk].chain.append(mbufs, wire).unwrap();
        }

        ctx.parse_ready(ck);
    }

    fn server_reply(ctx: &mut Context, sck: usize, wire: &[u8]) {
        let mk = recv_next(ctx, sck, true).unwrap();

        {
            let msgs = &mut ctx.msgs;
            let mbufs = &mut ctx.mbufs;
            msgs[mk].chain.append(mbufs, wire).unwrap();
        }

        ctx.parse_ready(sck);
    }

    /// Run the sender until it yields nothing, collecting the bytes a real
    /// socket would have carried.
    fn drain_client(ctx: &mut Context, ck: usize) -> Vec<u8> {
        let mut out = Vec::new();

        loop {
            let mk = match send_next(ctx, ck) {
                Some(m) => m,
                None => break,
            };

            let len = ctx.msgs[mk].mlen as usize;
            ctx.msgs[mk].chain.copy_to(0, len, &mut out);

            ctx.conns[ck].smsg = None;
            ctx.conns[ck].smsg_off = 0;

            send_done(ctx, ck, mk);
        }

        out
    }

    fn outq_msgs(ctx: &Context, ck: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cur = ctx.conns[ck].omsg_q.front();

        while let Some(n) = cur {
            out.push(ctx.qnodes[n].value);
            cur = ctx.qnodes[n].next;
        }

        out
    }

    fn assert_all_released(ctx: &Context) {
        assert!(ctx.msgs.is_empty(), "{} messages leaked", ctx.msgs.len());
        assert_eq!(ctx.mbufs.live(), 0, "buffer blocks leaked");
    }

    #[derive(Clone)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl SharedBuf {
        fn new() -> Self {
            Self(Rc::new(RefCell::new(Vec::new())))
        }

        fn contents(&self) -> String {
            String::from_utf8(self.0.borrow().clone()).unwrap()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> Result<usize, std::io::Error> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> Result<(), std::io::Error> {
            Ok(())
        }
    }

    #[test]
    fn get_roundtrip() {
        let mut ctx = test_ctx(Protocol::Memcache, 1);
        let ck = add_client(&mut ctx);
        let sck = add_server(&mut ctx, 0);

        client_request(&mut ctx, ck, b"get foo\r\n");

        assert_eq!(outq_msgs(&ctx, ck).len(), 1);
        ctx.conn_send(sck);
        assert!(ctx.conns[sck].imsg_q.is_empty());
        assert!(!ctx.conns[sck].omsg_q.is_empty());

        let wire = b"VALUE foo 0 3\r\nbar\r\nEND\r\n";
        server_reply(&mut ctx, sck, wire);

        assert_eq!(ctx.stats.server_get(0, 0, ServerMetric::Responses), 1);
        assert_eq!(
            ctx.stats.server_get(0, 0, ServerMetric::ResponseBytes),
            wire.len() as u64
        );
        assert!(ctx.conns[ck].want_write);

        let out = drain_client(&mut ctx, ck);
        assert_eq!(out, wire);

        assert!(outq_msgs(&ctx, ck).is_empty());
        assert!(!ctx.conns[ck].want_write);
        assert_all_released(&ctx);
    }

    #[test]
    fn replies_delivered_in_request_order() {
        let mut ctx = test_ctx(Protocol::Memcache, 1);
        let ck = add_client(&mut ctx);
        let sck = add_server(&mut ctx, 0);

        client_request(&mut ctx, ck, b"get foo\r\n");
        client_request(&mut ctx, ck, b"get foo\r\n");
        ctx.conn_send(sck);

        // both replies arrive in one read
        server_reply(&mut ctx, sck, b"END\r\nVALUE foo 0 1\r\nx\r\nEND\r\n");

        let out = drain_client(&mut ctx, ck);
        assert_eq!(out, b"END\r\nVALUE foo 0 1\r\nx\r\nEND\r\n");
        assert_all_released(&ctx);
    }

    #[test]
    fn fragmented_get_coalesces_in_key_order() {
        let mut ctx = test_ctx(Protocol::Memcache, 2);
        let ck = add_client(&mut ctx);
        let s0 = add_server(&mut ctx, 0);
        let s1 = add_server(&mut ctx, 1);

        let ka = key_for_server(&ctx, 0);
        let kb = key_for_server(&ctx, 1);

        let mut req = b"get ".to_vec();
        req.extend_from_slice(&ka);
        req.push(b' ');
        req.extend_from_slice(&kb);
        req.extend_from_slice(b"\r\n");

        client_request(&mut ctx, ck, &req);

        // parent plus one fragment per server
        assert_eq!(outq_msgs(&ctx, ck).len(), 3);
        assert_eq!(ctx.stats.pool_get(0, PoolMetric::FragCreated), 2);

        ctx.conn_send(s0);
        ctx.conn_send(s1);

        // second shard answers first
        let mut rb = b"VALUE ".to_vec();
        rb.extend_from_slice(&kb);
        rb.extend_from_slice(b" 0 1\r\nb\r\nEND\r\n");
        server_reply(&mut ctx, s1, &rb);

        assert!(!ctx.conns[ck].want_write);

        let mut ra = b"VALUE ".to_vec();
        ra.extend_from_slice(&ka);
        ra.extend_from_slice(b" 0 1\r\na\r\nEND\r\n");
        server_reply(&mut ctx, s0, &ra);

        assert!(ctx.conns[ck].want_write);

        let out = drain_client(&mut ctx, ck);

        let mut expect = Vec::new();
        expect.extend_from_slice(b"VALUE ");
        expect.extend_from_slice(&ka);
        expect.extend_from_slice(b" 0 1\r\na\r\n");
        expect.extend_from_slice(b"VALUE ");
        expect.extend_from_slice(&kb);
        expect.extend_from_slice(b" 0 1\r\nb\r\nEND\r\n");

        assert_eq!(out, expect);
        assert_all_released(&ctx);
    }

    #[test]
    fn fragmented_mget_restores_element_order() {
        let mut ctx = test_ctx(Protocol::Resp, 2);
        let ck = add_client(&mut ctx);
        let s0 = add_server(&mut ctx, 0);
        let s1 = add_server(&mut ctx, 1);

        let ka = key_for_server(&ctx, 0);
        let kb = key_for_server(&ctx, 1);

        let wire = {
            let keys: Vec<&[u8]> = vec![ka.as_slice(), kb.as_slice()];
            resp::multi_request(b"MGET", &keys)
        };

        client_request(&mut ctx, ck, &wire);
        ctx.conn_send(s0);
        ctx.conn_send(s1);

        // replies land in reverse shard order; elements still come back
        // in the client's key order
        server_reply(&mut ctx, s1, b"*1\r\n$1\r\nB\r\n");
        server_reply(&mut ctx, s0, b"*1\r\n$1\r\nA\r\n");

        let out = drain_client(&mut ctx, ck);
        assert_eq!(out, b"*2\r\n$1\r\nA\r\n$1\r\nB\r\n");
        assert_all_released(&ctx);
    }

    #[test]
    fn fragmented_del_sums_integers() {
        let mut ctx = test_ctx(Protocol::Resp, 2);
        let ck = add_client(&mut ctx);
        let s0 = add_server(&mut ctx, 0);
        let s1 = add_server(&mut ctx, 1);

        let ka = key_for_server(&ctx, 0);
        let kb = key_for_server(&ctx, 1);

        let wire = {
            let keys: Vec<&[u8]> = vec![ka.as_slice(), kb.as_slice()];
            resp::multi_request(b"DEL", &keys)
        };

        client_request(&mut ctx, ck, &wire);
        ctx.conn_send(s0);
        ctx.conn_send(s1);

        server_reply(&mut ctx, s0, b":1\r\n");
        server_reply(&mut ctx, s1, b":0\r\n");

        let out = drain_client(&mut ctx, ck);
        assert_eq!(out, b":1\r\n");
        assert_all_released(&ctx);
    }

    #[test]
    fn stray_reply_tears_down_server_conn() {
        let mut ctx = test_ctx(Protocol::Memcache, 1);
        let ck = add_client(&mut ctx);
        let sck = add_server(&mut ctx, 0);

        server_reply(&mut ctx, sck, b"SERVER_ERROR too big\r\n");

        assert_eq!(ctx.conns[sck].err, libc::EINVAL);
        assert!(ctx.conns[sck].done);

        // nothing was forwarded anywhere
        assert_eq!(ctx.stats.server_get(0, 0, ServerMetric::Responses), 0);
        assert!(drain_client(&mut ctx, ck).is_empty());
        assert_all_released(&ctx);
    }

    #[test]
    fn empty_reply_dropped_even_with_blocks() {
        let mut ctx = test_ctx(Protocol::Memcache, 1);
        let ck = add_client(&mut ctx);
        let sck = add_server(&mut ctx, 0);

        client_request(&mut ctx, ck, b"get foo\r\n");
        ctx.conn_send(sck);

        // a reply whose framing trimmed away the whole body: blocks on
        // the chain, zero content length
        let mk = recv_next(&mut ctx, sck, true).unwrap();
        {
            let msgs = &mut ctx.msgs;
            let mbufs = &mut ctx.mbufs;
            msgs[mk].chain.append(mbufs, b"xx").unwrap();
            msgs[mk].chain.blocks[0].last = 0;
        }

        recv_done(&mut ctx, sck, mk, None);

        // the out-queue is untouched and nothing reached the client
        assert_eq!(outq_msgs(&ctx, ck).len(), 1);
        assert!(ctx.conns[sck].active());
        assert!(!ctx.conns[ck].want_write);
    }

    #[test]
    fn slow_reply_hits_buckets_and_slowlog() {
        let mut ctx = test_ctx(Protocol::Memcache, 2);
        ctx.pools[0].slowlog = true;
        ctx.pools[0].slowlog_slower_than = 100;

        let buf = SharedBuf::new();
        ctx.set_slowlog(crate::slowlog::Slowlog::to_writer(Box::new(buf.clone())));

        let ck = add_client(&mut ctx);
        let _s0 = add_server(&mut ctx, 0);
        let s1 = add_server(&mut ctx, 1);

        // server 1 is cross-idc in the test topology
        let kb = key_for_server(&ctx, 1);

        let mut req = b"get ".to_vec();
        req.extend_from_slice(&kb);
        req.extend_from_slice(b"\r\n");
        client_request(&mut ctx, ck, &req);

        let pmsg = outq_msgs(&ctx, ck)[0];
        assert!(ctx.msgs[pmsg].slowlog_stime > 0);

        // backdate arrival so the reply costs ~250ms
        ctx.msgs[pmsg].slowlog_stime = crate::slowlog::now_ms() - 250;

        ctx.conn_send(s1);
        server_reply(&mut ctx, s1, b"END\r\n");

        assert_eq!(ctx.stats.pool_get(0, PoolMetric::XRequestGt10ms), 1);
        assert_eq!(ctx.stats.pool_get(0, PoolMetric::XRequestGt20ms), 1);
        assert_eq!(ctx.stats.pool_get(0, PoolMetric::XRequestGt50ms), 1);
        assert_eq!(ctx.stats.pool_get(0, PoolMetric::XRequestGt100ms), 1);
        assert_eq!(ctx.stats.pool_get(0, PoolMetric::XRequestGt200ms), 1);
        assert_eq!(ctx.stats.pool_get(0, PoolMetric::XRequestGt500ms), 0);
        assert_eq!(ctx.stats.pool_get(0, PoolMetric::LRequestGt10ms), 0);

        let line = buf.contents();
        assert!(line.contains("request_type=get"), "line: {}", line);
        assert!(line.contains("client_address=10.0.0.1:55000"));
        assert!(line.contains("server_address=127.0.0.1:11212"));
        assert!(line.contains("cost_time=2"));
        assert!(line.contains(&format!("key='{}'", String::from_utf8_lossy(&kb))));

        let etime = ctx.msgs[pmsg].slowlog_etime;
        assert!(etime >= ctx.msgs[pmsg].slowlog_stime);

        drain_client(&mut ctx, ck);
        assert_all_released(&ctx);
    }

    #[test]
    fn server_eof_mid_reply_errors_outstanding() {
        let mut ctx = test_ctx(Protocol::Memcache, 1);
        let ck = add_client(&mut ctx);
        let sck = add_server(&mut ctx, 0);

        client_request(&mut ctx, ck, b"get foo\r\n");
        client_request(&mut ctx, ck, b"get foo\r\n");
        ctx.conn_send(sck);

        // partial reply, then FIN
        let mk = recv_next(&mut ctx, sck, true).unwrap();
        {
            let msgs = &mut ctx.msgs;
            let mbufs = &mut ctx.mbufs;
            msgs[mk].chain.append(mbufs, b"VALUE foo 0 5\r\nba").unwrap();
        }
        ctx.parse_ready(sck);
        assert_eq!(ctx.conns[sck].rmsg, Some(mk));

        ctx.conns[sck].eof = true;
        assert!(recv_next(&mut ctx, sck, false).is_none());
        assert!(ctx.conns[sck].done);
        assert!(ctx.conns[sck].rmsg.is_none());

        ctx.close_conn(sck);

        let out = drain_client(&mut ctx, ck);
        let expect: &[u8] = b"SERVER_ERROR server closed connection\r\n";
        let mut both = expect.to_vec();
        both.extend_from_slice(expect);
        assert_eq!(out, both);

        assert_eq!(ctx.stats.pool_get(0, PoolMetric::ForwardError), 2);
        assert_eq!(ctx.pools[0].servers[0].failure_count, 1);
        assert_all_released(&ctx);
    }

    #[test]
    fn fragment_error_sweeps_group_in_one_pass() {
        let mut ctx = test_ctx(Protocol::Resp, 3);
        let ck = add_client(&mut ctx);
        let s0 = add_server(&mut ctx, 0);
        let _s1 = add_server(&mut ctx, 1);
        let s2 = add_server(&mut ctx, 2);

        let ka = key_for_server(&ctx, 0);
        let kb = key_for_server(&ctx, 1);
        let kc = key_for_server(&ctx, 2);

        let wire = {
            let keys: Vec<&[u8]> = vec![ka.as_slice(), kb.as_slice(), kc.as_slice()];
            resp::multi_request(b"MGET", &keys)
        };

        client_request(&mut ctx, ck, &wire);

        let q = outq_msgs(&ctx, ck);
        assert_eq!(q.len(), 4);
        let frag2 = q[2];

        ctx.conn_send(s0);
        ctx.conn_send(s2);

        server_reply(&mut ctx, s0, b"*1\r\n$1\r\nA\r\n");
        server_reply(&mut ctx, s2, b"*1\r\n$1\r\nC\r\n");

        // fragment 2 times out; the timer wheel reports it
        request::fail_request(&mut ctx, frag2, libc::ETIMEDOUT);

        assert!(ctx.conns[ck].want_write);

        let out = drain_client(&mut ctx, ck);
        assert_eq!(out, b"-ERR timed out\r\n");

        assert!(outq_msgs(&ctx, ck).is_empty());
        assert_eq!(ctx.stats.pool_get(0, PoolMetric::ForwardError), 1);
        assert_all_released(&ctx);
    }

    #[test]
    fn error_synthesis_happens_once() {
        let mut ctx = test_ctx(Protocol::Memcache, 1);
        let ck = add_client(&mut ctx);
        let _sck = add_server(&mut ctx, 0);

        client_request(&mut ctx, ck, b"get foo\r\n");

        let pmsg = outq_msgs(&ctx, ck)[0];
        request::fail_request(&mut ctx, pmsg, libc::ETIMEDOUT);

        let first = send_next(&mut ctx, ck);
        assert!(first.is_some());

        // a second call while the reply is still in flight must not
        // synthesize another one
        let second = send_next(&mut ctx, ck);
        assert!(second.is_none());
        assert_eq!(ctx.stats.pool_get(0, PoolMetric::ForwardError), 1);

        let mk = first.unwrap();
        ctx.conns[ck].smsg = None;
        send_done(&mut ctx, ck, mk);

        assert_all_released(&ctx);
    }

    #[test]
    fn probe_reply_is_swallowed() {
        let mut ctx = test_ctx(Protocol::Memcache, 1);
        let ck = add_client(&mut ctx);
        let sck = add_server(&mut ctx, 0);

        request::send_probe(&mut ctx, sck);
        ctx.conn_send(sck);

        server_reply(&mut ctx, sck, b"VERSION 1.6.21\r\n");

        assert!(ctx.conns[sck].active());
        assert_eq!(ctx.stats.server_get(0, 0, ServerMetric::Responses), 0);
        assert!(drain_client(&mut ctx, ck).is_empty());
        assert_all_released(&ctx);
    }

    #[test]
    fn auth_reply_vetoes_forward() {
        let mut ctx = test_ctx(Protocol::Resp, 1);
        ctx.pools[0].auth = Some("hunter2".into());

        let ck = add_client(&mut ctx);
        let sck = add_server(&mut ctx, 0);

        request::send_auth(&mut ctx, sck, "hunter2");
        ctx.conn_send(sck);

        assert!(!ctx.pools[0].servers[0].authed);

        server_reply(&mut ctx, sck, b"+OK\r\n");

        assert!(ctx.pools[0].servers[0].authed);
        assert_eq!(ctx.stats.server_get(0, 0, ServerMetric::Responses), 0);
        assert!(drain_client(&mut ctx, ck).is_empty());
        assert_all_released(&ctx);
    }

    #[test]
    fn pairing_is_symmetric_while_in_flight() {
        let mut ctx = test_ctx(Protocol::Memcache, 1);
        let ck = add_client(&mut ctx);
        let sck = add_server(&mut ctx, 0);

        client_request(&mut ctx, ck, b"get foo\r\n");
        ctx.conn_send(sck);
        server_reply(&mut ctx, sck, b"END\r\n");

        let pmsg = outq_msgs(&ctx, ck)[0];
        let rsp = ctx.msgs[pmsg].peer.unwrap();

        assert_eq!(ctx.msgs[rsp].peer, Some(pmsg));
        assert!(ctx.msgs[pmsg].done);
        assert!(ctx.msgs[rsp].is_response());

        drain_client(&mut ctx, ck);
        assert_all_released(&ctx);
    }

    #[test]
    fn half_closed_client_drains_then_finishes() {
        let mut ctx = test_ctx(Protocol::Memcache, 1);
        let ck = add_client(&mut ctx);
        let sck = add_server(&mut ctx, 0);

        client_request(&mut ctx, ck, b"get foo\r\n");
        ctx.conns[ck].eof = true;
        ctx.conn_send(sck);

        server_reply(&mut ctx, sck, b"END\r\n");

        let out = drain_client(&mut ctx, ck);
        assert_eq!(out, b"END\r\n");
        assert!(ctx.conns[ck].done);
        assert_all_released(&ctx);
    }
}
