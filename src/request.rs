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

//! Request intake and forwarding: parse targets on client connections,
//! multi-key fragmentation, shard routing, and the fragment-aware
//! done/error predicates the response sender relies on.

use crate::connection::ConnRole;
use crate::core::Context;
use crate::hash;
use crate::mbuf::Chain;
use crate::memcache;
use crate::message::{self, MsgKind, MsgType, Protocol};
use crate::resp;
use crate::slowlog;
use crate::stats::{PoolMetric, ServerMetric};
use log::{debug, error};

/// Read target on a client connection, allocating one at the first byte
/// of a new request.
pub fn recv_next(ctx: &mut Context, ck: usize, alloc: bool) -> Option<usize> {
    debug_assert!(ctx.conns[ck].is_client());

    if ctx.conns[ck].eof {
        if let Some(mk) = ctx.conns[ck].rmsg.take() {
            debug!(
                "eof c {} discarding incomplete req {} len {}",
                ctx.conns[ck].sd, ctx.msgs[mk].id, ctx.msgs[mk].mlen
            );

            ctx.release_msg(mk);
        }

        // unlike a server, a half-closed client gets its outstanding
        // replies flushed before the connection winds down
        if ctx.conns[ck].omsg_q.is_empty() {
            ctx.conns[ck].done = true;
        }

        return None;
    }

    if let Some(mk) = ctx.conns[ck].rmsg {
        return Some(mk);
    }

    if !alloc {
        return None;
    }

    let protocol = ctx.conns[ck].protocol;

    match ctx.msgs.alloc(MsgKind::Request, protocol, Some(ck)) {
        Ok(mk) => {
            ctx.conns[ck].rmsg = Some(mk);
            Some(mk)
        }
        // pool pressure; the next readable edge retries
        Err(_) => None,
    }
}

fn filter(ctx: &mut Context, ck: usize, mk: usize) -> bool {
    if ctx.msgs[mk].empty() {
        ctx.release_msg(mk);
        return true;
    }

    let mtype = ctx.msgs[mk].mtype;

    if mtype == MsgType::McQuit || mtype == MsgType::RespQuit {
        debug!("quit from c {}", ctx.conns[ck].sd);

        ctx.release_msg(mk);
        ctx.conns[ck].eof = true;

        if ctx.conns[ck].omsg_q.is_empty() {
            ctx.conns[ck].done = true;
        }

        return true;
    }

    false
}

fn fragmentable(mtype: MsgType) -> bool {
    matches!(
        mtype,
        MsgType::McGet | MsgType::McGets | MsgType::RespMget | MsgType::RespDel
    )
}

/// A request has fully arrived: install the pipelined tail, filter, then
/// fragment or forward.
pub fn recv_done(ctx: &mut Context, ck: usize, mk: usize, trail: Option<Chain>) {
    debug_assert!(ctx.conns[ck].rmsg == Some(mk));

    ctx.conns[ck].rmsg = None;

    if let Some(chain) = trail {
        if !chain.is_empty() {
            let protocol = ctx.conns[ck].protocol;

            match ctx.msgs.alloc(MsgKind::Request, protocol, Some(ck)) {
                Ok(nk) => {
                    ctx.msgs[nk].chain = chain;
                    ctx.conns[ck].rmsg = Some(nk);
                }
                Err(_) => {
                    // the pipelined bytes cannot be dropped without losing
                    // framing; give up on the connection
                    let mut chain = chain;
                    chain.release(&mut ctx.mbufs);
                    ctx.release_msg(mk);
                    ctx.conns[ck].err = libc::ENOMEM;
                    return;
                }
            }
        }
    }

    if filter(ctx, ck, mk) {
        return;
    }

    let pool = ctx.conns[ck].pool;

    if ctx.pools[pool].slowlog {
        ctx.msgs[mk].slowlog_stime = slowlog::now_ms();
    }

    if fragmentable(ctx.msgs[mk].mtype) && ctx.msgs[mk].keys.len() > 1 {
        fragment(ctx, ck, mk);
    } else {
        forward(ctx, ck, mk);
    }
}

/// Route a whole request (or a fragment already on the client out-queue)
/// to the server owning its first key.
pub fn forward(ctx: &mut Context, ck: usize, mk: usize) {
    ctx.enqueue_outq(ck, mk);
    forward_to_server(ctx, ck, mk);
}

fn forward_to_server(ctx: &mut Context, ck: usize, mk: usize) {
    let pool = ctx.conns[ck].pool;
    let now = slowlog::now_ms();

    let h = match ctx.msgs[mk].keys.first() {
        Some(key) => hash::fnv1a_64(key),
        // keyless commands (ping, version) go to the first shard
        None => 0,
    };

    let sidx = ctx.pools[pool].pick_server(h, now);

    let sck = match crate::core::server_conn(ctx, pool, sidx) {
        Ok(sck) => sck,
        Err(e) => {
            error!(
                "forward req {} to server {} failed: {}",
                ctx.msgs[mk].id, ctx.pools[pool].servers[sidx].name, e
            );

            let err = e.raw_os_error().unwrap_or(libc::EHOSTDOWN);
            fail_request(ctx, mk, err);
            return;
        }
    };

    ctx.enqueue_inq(sck, mk);

    if let Err(e) = ctx.arm_write(sck) {
        ctx.conns[sck].err = e.raw_os_error().unwrap_or(libc::EIO);
    }

    let mlen = ctx.msgs[mk].mlen as u64;
    ctx.stats.server_incr(pool, sidx, ServerMetric::Requests);
    ctx.stats
        .server_incr_by(pool, sidx, ServerMetric::RequestBytes, mlen);
}

/// Split a multi-key request into per-server fragments. The original
/// message becomes the fragment parent: it sits first on the client
/// out-queue, is done immediately, and carries an empty placeholder reply
/// that coalescing fills in (RESP) or leaves empty (memcached, where the
/// fragment replies themselves form the wire reply).
pub fn fragment(ctx: &mut Context, ck: usize, mk: usize) {
    let pool = ctx.conns[ck].pool;
    let now = slowlog::now_ms();
    let protocol = ctx.msgs[mk].protocol;
    let mtype = ctx.msgs[mk].mtype;

    // group keys by owning server, preserving first-appearance order
    let mut groups: Vec<(usize, Vec<u32>)> = Vec::new();

    for (i, key) in ctx.msgs[mk].keys.iter().enumerate() {
        let sidx = ctx.pools[pool].pick_server(hash::fnv1a_64(key), now);

        match groups.iter_mut().find(|(s, _)| *s == sidx) {
            Some((_, idxs)) => idxs.push(i as u32),
            None => groups.push((sidx, vec![i as u32])),
        }
    }

    if groups.len() == 1 {
        forward(ctx, ck, mk);
        return;
    }

    let frag_id = ctx.next_frag_id();
    let nkeys = ctx.msgs[mk].keys.len();
    let parent_id = ctx.msgs[mk].id;

    {
        let msg = &mut ctx.msgs[mk];
        msg.frag_id = frag_id;
        msg.nfrag = groups.len() as u32;
        msg.frag_elems = vec![None; nkeys];
    }

    ctx.enqueue_outq(ck, mk);

    // the parent is answered by its placeholder; only fragments travel
    let placeholder = match ctx.msgs.alloc(MsgKind::Response, protocol, None) {
        Ok(r) => r,
        Err(_) => {
            ctx.msgs[mk].nfrag = 0;
            fail_request(ctx, mk, libc::ENOMEM);
            return;
        }
    };

    ctx.msgs[placeholder].done = true;
    message::link_peer(&mut ctx.msgs, mk, placeholder);
    ctx.msgs[mk].done = true;

    let stime = ctx.msgs[mk].slowlog_stime;
    let ngroups = groups.len();
    let mut last_sub = None;

    for (sidx, idxs) in groups {
        let sub = match ctx.msgs.alloc(MsgKind::Request, protocol, Some(ck)) {
            Ok(s) => s,
            Err(_) => {
                error!("fragment alloc failed, {} keys dropped", idxs.len());
                break;
            }
        };

        let sub_keys: Vec<Vec<u8>> = idxs
            .iter()
            .map(|&i| ctx.msgs[mk].keys[i as usize].clone())
            .collect();

        let wire = {
            let refs: Vec<&[u8]> = sub_keys.iter().map(|k| k.as_slice()).collect();

            match mtype {
                MsgType::McGet | MsgType::McGets => memcache::retrieval_request(mtype, &refs),
                MsgType::RespDel => resp::multi_request(b"DEL", &refs),
                _ => resp::multi_request(b"MGET", &refs),
            }
        };

        {
            let msgs = &mut ctx.msgs;
            let mbufs = &mut ctx.mbufs;

            if msgs[sub].chain.append(mbufs, &wire).is_err() {
                msgs.release(sub, mbufs);
                error!("fragment alloc failed, {} keys dropped", idxs.len());
                break;
            }
        }

        {
            let msg = &mut ctx.msgs[sub];
            msg.mlen = wire.len() as u32;
            msg.mtype = mtype;
            msg.keys = sub_keys;
            msg.frag_id = frag_id;
            msg.frag_parent = Some(mk);
            msg.frag_parent_id = parent_id;
            msg.frag_key_idx = idxs;
            msg.slowlog_stime = stime;
        }

        ctx.enqueue_outq(ck, sub);
        ctx.stats.pool_incr(pool, PoolMetric::FragCreated);

        forward_to_server(ctx, ck, sub);
        last_sub = Some(sub);
    }

    if let Some(sub) = last_sub {
        ctx.msgs[sub].frag_last = true;
    }

    debug!(
        "fragmented req {} into {} sub-requests, frag id {}",
        parent_id, ngroups, frag_id
    );
}

/// True when the request (and, for a fragment group, every sibling on the
/// client out-queue) has its reply resolved. The scan result is memoized
/// on all members so later checks are O(1).
pub fn req_done(ctx: &mut Context, ck: usize, mk: usize) -> bool {
    debug_assert!(ctx.msgs[mk].owner == Some(ck) || ctx.msgs[mk].owner.is_none());

    if !ctx.msgs[mk].done {
        return false;
    }

    let id = ctx.msgs[mk].frag_id;

    if id == 0 || ctx.msgs[mk].fdone {
        return true;
    }

    let mut members = vec![mk];

    let start = match ctx.msgs[mk].c_qnode {
        Some(n) => n,
        None => return true,
    };

    let mut cur = ctx.qnodes[start].prev;
    while let Some(n) = cur {
        let m = ctx.qnodes[n].value;

        if ctx.msgs[m].frag_id != id {
            break;
        }

        if !ctx.msgs[m].done {
            return false;
        }

        members.push(m);
        cur = ctx.qnodes[n].prev;
    }

    let mut cur = ctx.qnodes[start].next;
    while let Some(n) = cur {
        let m = ctx.qnodes[n].value;

        if ctx.msgs[m].frag_id != id {
            break;
        }

        if !ctx.msgs[m].done {
            return false;
        }

        members.push(m);
        cur = ctx.qnodes[n].next;
    }

    for m in members {
        ctx.msgs[m].fdone = true;
    }

    true
}

/// True when the request or any sibling fragment failed. Memoized like
/// `req_done`; callers check `req_done` first.
pub fn req_error(ctx: &mut Context, ck: usize, mk: usize) -> bool {
    debug_assert!(ctx.msgs[mk].owner == Some(ck) || ctx.msgs[mk].owner.is_none());

    if ctx.msgs[mk].error {
        return true;
    }

    let id = ctx.msgs[mk].frag_id;

    if id == 0 {
        return false;
    }

    if ctx.msgs[mk].ferror {
        return true;
    }

    let start = match ctx.msgs[mk].c_qnode {
        Some(n) => n,
        None => return false,
    };

    let mut members = vec![mk];
    let mut found = false;

    let mut cur = ctx.qnodes[start].prev;
    while let Some(n) = cur {
        let m = ctx.qnodes[n].value;

        if ctx.msgs[m].frag_id != id {
            break;
        }

        found = found || ctx.msgs[m].error;
        members.push(m);
        cur = ctx.qnodes[n].prev;
    }

    let mut cur = ctx.qnodes[start].next;
    while let Some(n) = cur {
        let m = ctx.qnodes[n].value;

        if ctx.msgs[m].frag_id != id {
            break;
        }

        found = found || ctx.msgs[m].error;
        members.push(m);
        cur = ctx.qnodes[n].next;
    }

    if !found {
        return false;
    }

    for m in members {
        ctx.msgs[m].ferror = true;
    }

    true
}

/// Entry point for the timer wheel and the forwarding error paths: mark
/// the request failed, detach it from the server side, and wake its owner
/// if the failure made the head of the out-queue sendable.
pub fn fail_request(ctx: &mut Context, mk: usize, err: i32) {
    if !ctx.msgs.contains(mk) {
        return;
    }

    // a resolved request cannot fail; this also makes a racing second
    // failure report a no-op
    if ctx.msgs[mk].done {
        return;
    }

    {
        let msg = &mut ctx.msgs[mk];
        msg.error = true;
        msg.err = err;
        msg.done = true;
    }

    if let Some(sck) = ctx.msgs[mk].s_conn {
        // a request half-written to the server leaves the stream
        // unusable; the connection goes down with it
        if ctx.conns[sck].smsg == Some(mk) && ctx.conns[sck].smsg_off > 0 {
            ctx.conns[sck].err = err;
        }

        if ctx.conns[sck].smsg == Some(mk) {
            ctx.conns[sck].smsg = None;
            ctx.conns[sck].smsg_off = 0;
        }

        ctx.detach_from_server(mk);
    }

    maybe_arm_owner(ctx, mk);
}

/// Arm the owning client for write if its out-queue head just became
/// sendable.
pub fn maybe_arm_owner(ctx: &mut Context, mk: usize) {
    let ck = match ctx.msgs[mk].owner {
        Some(ck) => ck,
        None => return,
    };

    if !ctx.conns.contains(ck) || ctx.conns[ck].role != ConnRole::Client {
        return;
    }

    let head = match ctx.outq_head(ck) {
        Some(h) => h,
        None => return,
    };

    if req_done(ctx, ck, head) {
        if let Err(e) = ctx.arm_write(ck) {
            ctx.conns[ck].err = e.raw_os_error().unwrap_or(libc::EIO);
        }
    }
}

/// Release a request, unlinking and releasing any attached reply first.
/// The caller has already dequeued it from the client out-queue; the
/// server side is detached here if needed.
pub fn put(ctx: &mut Context, mk: usize) {
    debug_assert!(ctx.msgs[mk].is_request());

    ctx.detach_from_server(mk);

    if let Some(rsp) = message::unlink_peer(&mut ctx.msgs, mk) {
        ctx.release_msg(rsp);
    }

    ctx.release_msg(mk);
}

/// Next request to write on a server connection.
pub fn send_next(ctx: &mut Context, sck: usize) -> Option<usize> {
    debug_assert!(ctx.conns[sck].is_server());

    let head = ctx.conns[sck].imsg_q.front().map(|n| ctx.qnodes[n].value);

    match head {
        Some(mk) => {
            ctx.conns[sck].smsg = Some(mk);
            ctx.conns[sck].smsg_off = 0;
            Some(mk)
        }
        None => {
            if let Err(e) = ctx.disarm_write(sck) {
                ctx.conns[sck].err = e.raw_os_error().unwrap_or(libc::EIO);
            }

            None
        }
    }
}

/// The request bytes are on the wire: move it from the pending queue to
/// the outstanding queue, where the next reply will pair with it.
pub fn send_done(ctx: &mut Context, sck: usize, mk: usize) {
    debug_assert!(ctx.msgs[mk].s_conn == Some(sck));

    ctx.dequeue_inq(sck, mk);
    ctx.enqueue_outq(sck, mk);
}

/// Liveness probe, sent on a fresh server connection. The reply is
/// swallowed by the response filter.
pub fn send_probe(ctx: &mut Context, sck: usize) {
    let protocol = ctx.conns[sck].protocol;

    let (wire, mtype) = match protocol {
        Protocol::Memcache => (memcache::PROBE_REQUEST, memcache::PROBE_TYPE),
        Protocol::Resp => (resp::PROBE_REQUEST, resp::PROBE_TYPE),
    };

    let mk = match ctx.msgs.alloc(MsgKind::Request, protocol, None) {
        Ok(mk) => mk,
        Err(_) => {
            debug!("probe skipped on s {}, message pool full", ctx.conns[sck].sd);
            return;
        }
    };

    {
        let msgs = &mut ctx.msgs;
        let mbufs = &mut ctx.mbufs;

        if msgs[mk].chain.append(mbufs, wire).is_err() {
            msgs.release(mk, mbufs);
            return;
        }
    }

    {
        let msg = &mut ctx.msgs[mk];
        msg.mlen = wire.len() as u32;
        msg.mtype = mtype;
        msg.swallow = true;
    }

    ctx.enqueue_inq(sck, mk);

    if let Err(e) = ctx.arm_write(sck) {
        ctx.conns[sck].err = e.raw_os_error().unwrap_or(libc::EIO);
    }
}

/// Backend AUTH, sent ahead of anything else on a fresh RESP connection.
/// The reply never reaches a client: the forward hook inspects it and
/// releases the pair.
pub fn send_auth(ctx: &mut Context, sck: usize, password: &str) {
    let mk = match ctx.msgs.alloc(MsgKind::Request, Protocol::Resp, None) {
        Ok(mk) => mk,
        Err(_) => {
            // without auth the server will refuse everything; give up on
            // the connection and retry later
            ctx.conns[sck].err = libc::ENOMEM;
            return;
        }
    };

    let wire = resp::multi_request(b"AUTH", &[password.as_bytes()]);

    {
        let msgs = &mut ctx.msgs;
        let mbufs = &mut ctx.mbufs;

        if msgs[mk].chain.append(mbufs, &wire).is_err() {
            msgs.release(mk, mbufs);
            ctx.conns[sck].err = libc::ENOMEM;
            return;
        }
    }

    {
        let msg = &mut ctx.msgs[mk];
        msg.mlen = wire.len() as u32;
        msg.mtype = MsgType::RespAuth;
        msg.pre_rsp_forward = Some(resp::auth_rsp_hook);
    }

    ctx.enqueue_inq(sck, mk);

    if let Err(e) = ctx.arm_write(sck) {
        ctx.conns[sck].err = e.raw_os_error().unwrap_or(libc::EIO);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Conn, Sock};
    use crate::response;
    use crate::server::{Server, ServerPool};

    fn test_ctx(protocol: Protocol, nservers: usize) -> Context {
        let servers = (0..nservers)
            .map(|i| {
                let name = format!("127.0.0.1:{}", 11211 + i);
                let addr = name.parse().unwrap();
                Server::new(name, addr, true)
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

    fn client_request(ctx: &mut Context, ck: usize, wire: &[u8]) {
        let mk = recv_next(ctx, ck, true).unwrap();

        {
            let msgs = &mut ctx.msgs;
            let mbufs = &mut ctx.mbufs;
            msgs[mk].chain.append(mbufs, wire).unwrap();
        }

        ctx.parse_ready(ck);
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

    #[test]
    fn multikey_on_one_server_stays_whole() {
        let mut ctx = test_ctx(Protocol::Memcache, 1);
        let ck = add_client(&mut ctx);
        let sck = add_server(&mut ctx, 0);

        client_request(&mut ctx, ck, b"get a b c\r\n");

        let q = outq_msgs(&ctx, ck);
        assert_eq!(q.len(), 1);
        assert_eq!(ctx.msgs[q[0]].frag_id, 0);
        assert!(!ctx.conns[sck].imsg_q.is_empty());
    }

    #[test]
    fn quit_winds_down_the_connection() {
        let mut ctx = test_ctx(Protocol::Memcache, 1);
        let ck = add_client(&mut ctx);
        let _sck = add_server(&mut ctx, 0);

        client_request(&mut ctx, ck, b"quit\r\n");

        assert!(ctx.conns[ck].eof);
        assert!(ctx.conns[ck].done);
        assert!(ctx.msgs.is_empty());
    }

    #[test]
    fn quit_waits_for_outstanding_replies() {
        let mut ctx = test_ctx(Protocol::Memcache, 1);
        let ck = add_client(&mut ctx);
        let sck = add_server(&mut ctx, 0);

        client_request(&mut ctx, ck, b"get foo\r\nquit\r\n");

        assert!(ctx.conns[ck].eof);
        assert!(!ctx.conns[ck].done);

        ctx.conn_send(sck);

        let mk = response::recv_next(&mut ctx, sck, true).unwrap();
        {
            let msgs = &mut ctx.msgs;
            let mbufs = &mut ctx.mbufs;
            msgs[mk].chain.append(mbufs, b"END\r\n").unwrap();
        }
        ctx.parse_ready(sck);

        // reply drains, then the connection finishes
        while let Some(m) = response::send_next(&mut ctx, ck) {
            ctx.conns[ck].smsg = None;
            response::send_done(&mut ctx, ck, m);
        }

        assert!(ctx.conns[ck].done);
        assert!(ctx.msgs.is_empty());
        assert_eq!(ctx.mbufs.live(), 0);
    }

    #[test]
    fn done_scan_memoizes_on_all_members() {
        let mut ctx = test_ctx(Protocol::Memcache, 2);
        let ck = add_client(&mut ctx);
        let _s0 = add_server(&mut ctx, 0);
        let _s1 = add_server(&mut ctx, 1);

        let ka = {
            let mut k = None;
            for i in 0..10_000 {
                let c = format!("key{}", i).into_bytes();
                if ctx.pools[0].pick_server(crate::hash::fnv1a_64(&c), 0) == 0 {
                    k = Some(c);
                    break;
                }
            }
            k.unwrap()
        };
        let kb = {
            let mut k = None;
            for i in 0..10_000 {
                let c = format!("key{}", i).into_bytes();
                if ctx.pools[0].pick_server(crate::hash::fnv1a_64(&c), 0) == 1 {
                    k = Some(c);
                    break;
                }
            }
            k.unwrap()
        };

        let mut wire = b"get ".to_vec();
        wire.extend_from_slice(&ka);
        wire.push(b' ');
        wire.extend_from_slice(&kb);
        wire.extend_from_slice(b"\r\n");

        client_request(&mut ctx, ck, &wire);

        let q = outq_msgs(&ctx, ck);
        assert_eq!(q.len(), 3);
        let (parent, sub_a, sub_b) = (q[0], q[1], q[2]);

        // parent is done at fragmentation time, the group is not
        assert!(ctx.msgs[parent].done);
        assert!(!req_done(&mut ctx, ck, parent));

        ctx.msgs[sub_a].done = true;
        assert!(!req_done(&mut ctx, ck, parent));
        assert!(!ctx.msgs[parent].fdone);

        ctx.msgs[sub_b].done = true;
        assert!(req_done(&mut ctx, ck, parent));

        // the scan marked every member
        assert!(ctx.msgs[parent].fdone);
        assert!(ctx.msgs[sub_a].fdone);
        assert!(ctx.msgs[sub_b].fdone);

        // an error anywhere in the group surfaces through any member
        assert!(!req_error(&mut ctx, ck, parent));
        ctx.msgs[sub_b].error = true;
        assert!(req_error(&mut ctx, ck, sub_a));
        assert!(ctx.msgs[parent].ferror);
    }

    #[test]
    fn fail_detaches_a_pending_request() {
        let mut ctx = test_ctx(Protocol::Memcache, 1);
        let ck = add_client(&mut ctx);
        let sck = add_server(&mut ctx, 0);

        client_request(&mut ctx, ck, b"get foo\r\n");
        assert!(!ctx.conns[sck].imsg_q.is_empty());

        let mk = outq_msgs(&ctx, ck)[0];
        fail_request(&mut ctx, mk, libc::ETIMEDOUT);

        assert!(ctx.conns[sck].imsg_q.is_empty());
        assert!(ctx.msgs[mk].s_conn.is_none());
        assert!(ctx.msgs[mk].error && ctx.msgs[mk].done);
        assert!(ctx.conns[ck].want_write);

        // failing again is a no-op
        fail_request(&mut ctx, mk, libc::EPIPE);
        assert_eq!(ctx.msgs[mk].err, libc::ETIMEDOUT);
    }

    #[test]
    fn half_written_request_fails_the_server_conn() {
        let mut ctx = test_ctx(Protocol::Memcache, 1);
        let ck = add_client(&mut ctx);
        let sck = add_server(&mut ctx, 0);

        client_request(&mut ctx, ck, b"get foo\r\n");

        let mk = outq_msgs(&ctx, ck)[0];

        // simulate a partial write of the request bytes
        let smk = send_next(&mut ctx, sck).unwrap();
        assert_eq!(smk, mk);
        ctx.conns[sck].smsg_off = 3;

        fail_request(&mut ctx, mk, libc::ETIMEDOUT);

        assert_eq!(ctx.conns[sck].err, libc::ETIMEDOUT);
        assert!(ctx.conns[sck].smsg.is_none());
    }

    #[test]
    fn malformed_request_gets_an_error_reply() {
        let mut ctx = test_ctx(Protocol::Memcache, 1);
        let ck = add_client(&mut ctx);
        let _sck = add_server(&mut ctx, 0);

        client_request(&mut ctx, ck, b"bogus verb\r\n");

        assert!(ctx.conns[ck].eof);

        let q = outq_msgs(&ctx, ck);
        assert_eq!(q.len(), 1);
        assert!(ctx.msgs[q[0]].error && ctx.msgs[q[0]].done);
        assert_eq!(ctx.msgs[q[0]].err, libc::EINVAL);

        let mut out = Vec::new();
        while let Some(m) = response::send_next(&mut ctx, ck) {
            let len = ctx.msgs[m].mlen as usize;
            ctx.msgs[m].chain.copy_to(0, len, &mut out);
            ctx.conns[ck].smsg = None;
            response::send_done(&mut ctx, ck, m);
        }

        assert_eq!(out, b"SERVER_ERROR invalid argument\r\n");
        assert!(ctx.conns[ck].done);
        assert!(ctx.msgs.is_empty());
    }
}
