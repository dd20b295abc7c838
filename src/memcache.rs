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

//! Memcached text protocol: streaming reply framing, request parsing with
//! key extraction, and fragment coalescing for multi-key retrievals.
//!
//! Coalescing works on the wire: every non-final fragment's reply has its
//! trailing `END\r\n` trimmed so the concatenation of the parent's empty
//! placeholder and the fragment replies forms one well-formed reply.

use crate::core::Context;
use crate::mbuf::Scanner;
use crate::message::{Msg, MsgType, ParseResult};

pub const MAX_KEY_LEN: usize = 250;

const END_MARK_LEN: usize = 5; // "END\r\n"

pub const PROBE_REQUEST: &[u8] = b"version\r\n";
pub const PROBE_TYPE: MsgType = MsgType::McVersion;

fn tokens(line: &[u8]) -> Vec<&[u8]> {
    line.split(|&b| b == b' ').filter(|t| !t.is_empty()).collect()
}

fn parse_usize(tok: &[u8]) -> Option<usize> {
    if tok.is_empty() || tok.len() > 19 {
        return None;
    }

    let mut v: usize = 0;

    for &b in tok {
        if !b.is_ascii_digit() {
            return None;
        }

        v = v.checked_mul(10)?.checked_add((b - b'0') as usize)?;
    }

    Some(v)
}

/// Consume the CRLF that terminates a data block. None means more bytes
/// are needed; false means the block did not end where it claimed to.
fn expect_crlf(s: &mut Scanner) -> Option<bool> {
    let a = s.next()?;
    let b = s.next()?;

    Some(a == b'\r' && b == b'\n')
}

pub fn parse_rsp(msg: &mut Msg) -> ParseResult {
    let mut s = msg.chain.scanner();
    let mut line = Vec::new();

    if !s.next_line(&mut line) {
        return ParseResult::Incomplete;
    }

    if line.is_empty() {
        return ParseResult::Error;
    }

    if line.starts_with(b"VALUE") {
        loop {
            let toks = tokens(&line);

            // VALUE <key> <flags> <bytes> [cas]
            if toks[0] != &b"VALUE"[..] || toks.len() < 4 || toks.len() > 5 {
                return ParseResult::Error;
            }

            let n = match parse_usize(toks[3]) {
                Some(n) => n,
                None => return ParseResult::Error,
            };

            if !s.skip(n) {
                return ParseResult::Incomplete;
            }

            match expect_crlf(&mut s) {
                None => return ParseResult::Incomplete,
                Some(false) => return ParseResult::Error,
                Some(true) => {}
            }

            line.clear();

            if !s.next_line(&mut line) {
                return ParseResult::Incomplete;
            }

            if line == b"END" {
                msg.mtype = MsgType::McEnd;
                return ParseResult::Complete { end: s.pos() };
            }
        }
    }

    if line.starts_with(b"STAT") {
        loop {
            line.clear();

            if !s.next_line(&mut line) {
                return ParseResult::Incomplete;
            }

            if line == b"END" {
                msg.mtype = MsgType::McStat;
                return ParseResult::Complete { end: s.pos() };
            }

            if !line.starts_with(b"STAT") {
                return ParseResult::Error;
            }
        }
    }

    let mtype = if line == b"END" {
        MsgType::McEnd
    } else if line == b"STORED" {
        MsgType::McStored
    } else if line == b"NOT_STORED" {
        MsgType::McNotStored
    } else if line == b"EXISTS" {
        MsgType::McExists
    } else if line == b"NOT_FOUND" {
        MsgType::McNotFound
    } else if line == b"DELETED" {
        MsgType::McDeleted
    } else if line == b"TOUCHED" {
        MsgType::McTouched
    } else if line == b"OK" {
        MsgType::McOk
    } else if line == b"ERROR" {
        MsgType::McError
    } else if line.starts_with(b"CLIENT_ERROR") {
        MsgType::McClientError
    } else if line.starts_with(b"SERVER_ERROR") {
        MsgType::McServerError
    } else if line.starts_with(b"VERSION") {
        MsgType::McVersionRsp
    } else if line.iter().all(|b| b.is_ascii_digit()) {
        MsgType::McNum
    } else {
        return ParseResult::Error;
    };

    msg.mtype = mtype;

    ParseResult::Complete { end: s.pos() }
}

fn valid_key(key: &[u8]) -> bool {
    !key.is_empty() && key.len() <= MAX_KEY_LEN
}

pub fn parse_req(msg: &mut Msg) -> ParseResult {
    let mut s = msg.chain.scanner();
    let mut line = Vec::new();

    if !s.next_line(&mut line) {
        return ParseResult::Incomplete;
    }

    let toks = tokens(&line);

    if toks.is_empty() {
        return ParseResult::Error;
    }

    // a request that suppresses its reply would desynchronize the FIFO
    // reply pairing; refuse it up front
    if toks[toks.len() - 1] == &b"noreply"[..] {
        return ParseResult::Error;
    }

    let verb = toks[0];

    let (mtype, nkeys, data) = match verb {
        b"get" | b"gets" => {
            if toks.len() < 2 {
                return ParseResult::Error;
            }

            let mtype = if verb == &b"get"[..] {
                MsgType::McGet
            } else {
                MsgType::McGets
            };

            (mtype, toks.len() - 1, None)
        }
        b"set" | b"add" | b"replace" | b"append" | b"prepend" => {
            // <verb> <key> <flags> <exptime> <bytes>
            if toks.len() != 5 {
                return ParseResult::Error;
            }

            let mtype = match verb {
                b"set" => MsgType::McSet,
                b"add" => MsgType::McAdd,
                b"replace" => MsgType::McReplace,
                b"append" => MsgType::McAppend,
                _ => MsgType::McPrepend,
            };

            let n = match parse_usize(toks[4]) {
                Some(n) => n,
                None => return ParseResult::Error,
            };

            (mtype, 1, Some(n))
        }
        b"cas" => {
            // cas <key> <flags> <exptime> <bytes> <casid>
            if toks.len() != 6 {
                return ParseResult::Error;
            }

            let n = match parse_usize(toks[4]) {
                Some(n) => n,
                None => return ParseResult::Error,
            };

            (MsgType::McCas, 1, Some(n))
        }
        b"delete" => {
            if toks.len() != 2 {
                return ParseResult::Error;
            }

            (MsgType::McDelete, 1, None)
        }
        b"incr" | b"decr" => {
            if toks.len() != 3 {
                return ParseResult::Error;
            }

            let mtype = if verb == &b"incr"[..] {
                MsgType::McIncr
            } else {
                MsgType::McDecr
            };

            (mtype, 1, None)
        }
        b"touch" => {
            if toks.len() != 3 {
                return ParseResult::Error;
            }

            (MsgType::McTouch, 1, None)
        }
        b"version" => {
            if toks.len() != 1 {
                return ParseResult::Error;
            }

            (MsgType::McVersion, 0, None)
        }
        b"quit" => {
            if toks.len() != 1 {
                return ParseResult::Error;
            }

            (MsgType::McQuit, 0, None)
        }
        _ => return ParseResult::Error,
    };

    if let Some(n) = data {
        if !s.skip(n) {
            return ParseResult::Incomplete;
        }

        match expect_crlf(&mut s) {
            None => return ParseResult::Incomplete,
            Some(false) => return ParseResult::Error,
            Some(true) => {}
        }
    }

    let mut keys = Vec::with_capacity(nkeys);

    for tok in toks.iter().skip(1).take(nkeys) {
        if !valid_key(tok) {
            return ParseResult::Error;
        }

        keys.push(tok.to_vec());
    }

    msg.mtype = mtype;
    msg.keys = keys;

    ParseResult::Complete { end: s.pos() }
}

/// Wire bytes for a retrieval fragment carrying a subset of the keys.
pub fn retrieval_request(mtype: MsgType, keys: &[&[u8]]) -> Vec<u8> {
    let verb: &[u8] = match mtype {
        MsgType::McGets => b"gets",
        _ => b"get",
    };

    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(verb);

    for k in keys {
        out.push(b' ');
        out.extend_from_slice(k);
    }

    out.extend_from_slice(b"\r\n");
    out
}

/// Absorb one fragment reply. The reply stays attached to its request and
/// is sent as-is in queue order; all that is needed is trimming the
/// non-final `END\r\n` so the concatenated stream stays well-formed.
pub fn pre_coalesce(ctx: &mut Context, rsp: usize) {
    let req = ctx.msgs[rsp].peer.expect("coalescing an unpaired reply");
    let mtype = ctx.msgs[rsp].mtype;

    if mtype != MsgType::McEnd {
        // an error reply poisons the whole fragment group
        let msgs = &mut ctx.msgs;
        msgs[req].error = true;
        msgs[req].err = libc::EINVAL;
        return;
    }

    if ctx.msgs[req].frag_last {
        return;
    }

    let len = ctx.msgs[rsp].mlen as usize;
    debug_assert!(len >= END_MARK_LEN);

    let msgs = &mut ctx.msgs;
    let mbufs = &mut ctx.mbufs;

    msgs[rsp].chain.truncate(mbufs, len - END_MARK_LEN);
    msgs[rsp].mlen = (len - END_MARK_LEN) as u32;
}
