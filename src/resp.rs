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

//! RESP protocol: streaming reply framing, command parsing with key
//! extraction, and fragment coalescing.
//!
//! Unlike the memcached side, a fragmented `MGET` cannot be coalesced by
//! concatenation because array positions must match the client's key
//! order. Fragment replies are instead absorbed element by element into
//! the parent request, and the parent's placeholder reply is assembled in
//! one pass when the group becomes sendable. `DEL` coalesces to the sum
//! of the per-server integer replies.

use crate::core::Context;
use crate::mbuf::{AllocError, Scanner};
use crate::message::{self, Msg, MsgType, ParseResult};
use log::{debug, error};

pub const PROBE_REQUEST: &[u8] = b"*1\r\n$4\r\nPING\r\n";
pub const PROBE_TYPE: MsgType = MsgType::RespPing;

fn parse_i64(tok: &[u8]) -> Option<i64> {
    if tok.is_empty() || tok.len() > 20 {
        return None;
    }

    let (neg, digits) = match tok[0] {
        b'-' => (true, &tok[1..]),
        _ => (false, tok),
    };

    if digits.is_empty() {
        return None;
    }

    let mut v: i64 = 0;

    for &b in digits {
        if !b.is_ascii_digit() {
            return None;
        }

        v = v.checked_mul(10)?.checked_add((b - b'0') as i64)?;
    }

    Some(if neg { -v } else { v })
}

fn expect_crlf(s: &mut Scanner) -> Option<bool> {
    let a = s.next()?;
    let b = s.next()?;

    Some(a == b'\r' && b == b'\n')
}

/// Consume one complete element (scalar, bulk, or array with all its
/// nested elements) from the scanner.
fn scan_element(s: &mut Scanner, line: &mut Vec<u8>) -> ParseResult {
    let mut needed: u64 = 1;

    while needed > 0 {
        line.clear();

        if !s.next_line(line) {
            return ParseResult::Incomplete;
        }

        if line.is_empty() {
            return ParseResult::Error;
        }

        match line[0] {
            b'+' | b'-' | b':' => {}
            b'$' => {
                let n = match parse_i64(&line[1..]) {
                    Some(n) if n >= -1 => n,
                    _ => return ParseResult::Error,
                };

                if n >= 0 {
                    if !s.skip(n as usize) {
                        return ParseResult::Incomplete;
                    }

                    match expect_crlf(s) {
                        None => return ParseResult::Incomplete,
                        Some(false) => return ParseResult::Error,
                        Some(true) => {}
                    }
                }
            }
            b'*' => {
                let n = match parse_i64(&line[1..]) {
                    Some(n) if n >= -1 => n,
                    _ => return ParseResult::Error,
                };

                if n > 0 {
                    needed += n as u64;
                }
            }
            _ => return ParseResult::Error,
        }

        needed -= 1;
    }

    ParseResult::Complete { end: s.pos() }
}

pub fn parse_rsp(msg: &mut Msg) -> ParseResult {
    let mut s = msg.chain.scanner();
    let mut line = Vec::new();

    // remember the outer element's type marker
    let first = {
        let mut probe = msg.chain.scanner();
        match probe.next() {
            Some(b) => b,
            None => return ParseResult::Incomplete,
        }
    };

    let result = scan_element(&mut s, &mut line);

    if let ParseResult::Complete { .. } = result {
        msg.mtype = match first {
            b'+' => MsgType::RespStatus,
            b'-' => MsgType::RespError,
            b':' => MsgType::RespInteger,
            b'$' => MsgType::RespBulk,
            b'*' => MsgType::RespMulti,
            _ => return ParseResult::Error,
        };
    }

    result
}

/// Which argument positions of a command are keys.
fn command_keys(verb: &[u8], argc: usize) -> Option<(MsgType, std::ops::Range<usize>)> {
    let r = match verb {
        b"GET" => (MsgType::RespGet, 1..2, 2..3),
        b"SET" => (MsgType::RespSet, 1..2, 3..6),
        b"DEL" => (MsgType::RespDel, 1..argc, 2..usize::MAX),
        b"MGET" => (MsgType::RespMget, 1..argc, 2..usize::MAX),
        b"INCR" => (MsgType::RespIncr, 1..2, 2..3),
        b"DECR" => (MsgType::RespDecr, 1..2, 2..3),
        b"EXISTS" => (MsgType::RespExists, 1..2, 2..3),
        b"EXPIRE" => (MsgType::RespExpire, 1..2, 3..4),
        b"TTL" => (MsgType::RespTtl, 1..2, 2..3),
        b"TYPE" => (MsgType::RespType, 1..2, 2..3),
        b"PING" => (MsgType::RespPing, 0..0, 1..2),
        b"AUTH" => (MsgType::RespAuth, 0..0, 2..3),
        b"SELECT" => (MsgType::RespSelect, 0..0, 2..3),
        b"QUIT" => (MsgType::RespQuit, 0..0, 1..2),
        _ => return None,
    };

    let (mtype, keys, valid_argc) = r;

    if !valid_argc.contains(&argc) {
        return None;
    }

    Some((mtype, keys))
}

pub fn parse_req(msg: &mut Msg) -> ParseResult {
    let mut s = msg.chain.scanner();
    let mut line = Vec::new();

    if !s.next_line(&mut line) {
        return ParseResult::Incomplete;
    }

    // inline commands are not supported through the proxy
    if line.is_empty() || line[0] != b'*' {
        return ParseResult::Error;
    }

    let argc = match parse_i64(&line[1..]) {
        Some(n) if n >= 1 => n as usize,
        _ => return ParseResult::Error,
    };

    let mut verb = Vec::new();
    let mut keys: Vec<Vec<u8>> = Vec::new();
    let mut mtype = MsgType::Unknown;
    let mut key_range = 0..0;

    for i in 0..argc {
        line.clear();

        if !s.next_line(&mut line) {
            return ParseResult::Incomplete;
        }

        if line.is_empty() || line[0] != b'$' {
            return ParseResult::Error;
        }

        let n = match parse_i64(&line[1..]) {
            Some(n) if n >= 0 => n as usize,
            _ => return ParseResult::Error,
        };

        let collect = i == 0 || key_range.contains(&i);

        if collect {
            let mut arg = Vec::with_capacity(n);

            if !s.next_bytes(n, &mut arg) {
                return ParseResult::Incomplete;
            }

            if i == 0 {
                verb = arg.to_ascii_uppercase();

                match command_keys(&verb, argc) {
                    Some((t, r)) => {
                        mtype = t;
                        key_range = r;
                    }
                    None => return ParseResult::Error,
                }
            } else {
                if arg.is_empty() {
                    return ParseResult::Error;
                }

                keys.push(arg);
            }
        } else if !s.skip(n) {
            return ParseResult::Incomplete;
        }

        match expect_crlf(&mut s) {
            None => return ParseResult::Incomplete,
            Some(false) => return ParseResult::Error,
            Some(true) => {}
        }
    }

    msg.mtype = mtype;
    msg.keys = keys;

    ParseResult::Complete { end: s.pos() }
}

/// Wire bytes for a command made of a verb plus key arguments, used for
/// fragments and probes.
pub fn multi_request(verb: &[u8], keys: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);

    out.extend_from_slice(format!("*{}\r\n", 1 + keys.len()).as_bytes());
    out.extend_from_slice(format!("${}\r\n", verb.len()).as_bytes());
    out.extend_from_slice(verb);
    out.extend_from_slice(b"\r\n");

    for k in keys {
        out.extend_from_slice(format!("${}\r\n", k.len()).as_bytes());
        out.extend_from_slice(k);
        out.extend_from_slice(b"\r\n");
    }

    out
}

/// Raw bytes of each top-level element of an `MGET` reply array, or None
/// when the reply does not line up with the fragment's key count.
fn mget_elements(msg: &Msg, nkeys: usize) -> Option<Vec<Vec<u8>>> {
    let mut s = msg.chain.scanner();
    let mut line = Vec::new();

    if !s.next_line(&mut line) || line.first() != Some(&b'*') {
        return None;
    }

    let n = match parse_i64(&line[1..]) {
        Some(n) if n >= 0 => n as usize,
        _ => return None,
    };

    if n != nkeys {
        return None;
    }

    let mut elems = Vec::with_capacity(n);

    for _ in 0..n {
        let start = s.pos();

        if !matches!(scan_element(&mut s, &mut line), ParseResult::Complete { .. }) {
            return None;
        }

        let mut elem = Vec::new();
        msg.chain.copy_to(start, s.pos() - start, &mut elem);
        elems.push(elem);
    }

    Some(elems)
}

fn integer_value(msg: &Msg) -> Option<i64> {
    let mut s = msg.chain.scanner();
    let mut line = Vec::new();

    if !s.next_line(&mut line) || line.first() != Some(&b':') {
        return None;
    }

    parse_i64(&line[1..])
}

fn poison_group(ctx: &mut Context, req: usize) {
    let msgs = &mut ctx.msgs;
    msgs[req].error = true;
    msgs[req].err = libc::EINVAL;
}

/// Locate a fragment's parent, guarding against the parent having been
/// torn down with its client connection in the meantime.
fn frag_parent(ctx: &Context, req: usize) -> Option<usize> {
    let parent = ctx.msgs[req].frag_parent?;

    if !ctx.msgs.contains(parent) {
        return None;
    }

    if ctx.msgs[parent].id != ctx.msgs[req].frag_parent_id {
        return None;
    }

    Some(parent)
}

/// Absorb one fragment reply into the parent request. `MGET` element
/// payloads are filed under their original key indexes; `DEL` integers are
/// summed. The child reply is emptied so sending it emits nothing.
pub fn pre_coalesce(ctx: &mut Context, rsp: usize) {
    let req = ctx.msgs[rsp].peer.expect("coalescing an unpaired reply");
    let rsp_type = ctx.msgs[rsp].mtype;
    let req_type = ctx.msgs[req].mtype;

    let parent = match frag_parent(ctx, req) {
        Some(p) => p,
        None => {
            // owner went away; nothing to absorb into
            debug!("fragment parent of req {} already gone", ctx.msgs[req].id);
            return;
        }
    };

    match req_type {
        MsgType::RespMget => {
            let nkeys = ctx.msgs[req].frag_key_idx.len();

            let elems = if rsp_type == MsgType::RespMulti {
                mget_elements(&ctx.msgs[rsp], nkeys)
            } else {
                None
            };

            let elems = match elems {
                Some(elems) => elems,
                None => {
                    poison_group(ctx, req);
                    return;
                }
            };

            for (i, elem) in elems.into_iter().enumerate() {
                let idx = ctx.msgs[req].frag_key_idx[i] as usize;
                let parent_msg = &mut ctx.msgs[parent];

                if idx < parent_msg.frag_elems.len() {
                    parent_msg.frag_elems[idx] = Some(elem);
                }
            }
        }
        MsgType::RespDel => {
            let v = if rsp_type == MsgType::RespInteger {
                integer_value(&ctx.msgs[rsp])
            } else {
                None
            };

            match v {
                Some(v) => ctx.msgs[parent].frag_int += v,
                None => {
                    poison_group(ctx, req);
                    return;
                }
            }
        }
        _ => {
            debug!("no coalescing for fragment type {:?}", req_type);
            return;
        }
    }

    // payload absorbed; the child reply contributes no bytes of its own
    let msgs = &mut ctx.msgs;
    let mbufs = &mut ctx.mbufs;
    msgs[rsp].chain.truncate(mbufs, 0);
    msgs[rsp].mlen = 0;
}

/// Assemble the parent's placeholder reply once every fragment is done.
pub fn post_coalesce(ctx: &mut Context, parent: usize) -> Result<(), AllocError> {
    let rsp = ctx.msgs[parent].peer.expect("fragment parent lost its reply");
    let mtype = ctx.msgs[parent].mtype;

    let mut body = Vec::new();

    match mtype {
        MsgType::RespMget => {
            let parent_msg = &ctx.msgs[parent];

            body.extend_from_slice(format!("*{}\r\n", parent_msg.frag_elems.len()).as_bytes());

            for elem in &parent_msg.frag_elems {
                match elem {
                    Some(bytes) => body.extend_from_slice(bytes),
                    None => body.extend_from_slice(b"$-1\r\n"),
                }
            }
        }
        MsgType::RespDel => {
            body.extend_from_slice(format!(":{}\r\n", ctx.msgs[parent].frag_int).as_bytes());
        }
        _ => return Ok(()),
    }

    let msgs = &mut ctx.msgs;
    let mbufs = &mut ctx.mbufs;

    msgs[rsp].chain.append(mbufs, &body)?;
    msgs[rsp].mlen = body.len() as u32;
    msgs[rsp].mtype = match mtype {
        MsgType::RespDel => MsgType::RespInteger,
        _ => MsgType::RespMulti,
    };

    msgs[parent].post_coalesced = true;

    Ok(())
}

/// `pre_rsp_forward` hook for the backend AUTH probe: inspect the status,
/// record it on the server, and suppress delivery. The hook owns the pair
/// from here on.
pub fn auth_rsp_hook(ctx: &mut Context, s_conn: usize, rsp: usize) -> bool {
    let req = message::unlink_peer(&mut ctx.msgs, rsp).expect("auth reply lost its probe");

    let ok = ctx.msgs[rsp].mtype == MsgType::RespStatus;

    let pool = ctx.conns[s_conn].pool;
    let server = ctx.conns[s_conn].server;

    if let Some(server) = server {
        if ok {
            ctx.pools[pool].servers[server].authed = true;
        } else {
            error!(
                "auth rejected by server {}",
                ctx.pools[pool].servers[server].name
            );
        }
    }

    let msgs = &mut ctx.msgs;
    let mbufs = &mut ctx.mbufs;
    msgs.release(req, mbufs);
    msgs.release(rsp, mbufs);

    false
}
