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

use crate::connection::SendStage;
use crate::core::Context;
use crate::mbuf::{AllocError, Chain, MbufPool};
use slab::Slab;
use std::ops::{Index, IndexMut};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MsgKind {
    Request,
    Response,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Protocol {
    Memcache,
    Resp,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MsgType {
    Unknown,

    // memcached requests
    McGet,
    McGets,
    McSet,
    McAdd,
    McReplace,
    McAppend,
    McPrepend,
    McCas,
    McDelete,
    McIncr,
    McDecr,
    McTouch,
    McVersion,
    McQuit,

    // memcached responses
    McNum,
    McStored,
    McNotStored,
    McExists,
    McNotFound,
    McDeleted,
    McTouched,
    McOk,
    McEnd,
    McValue,
    McVersionRsp,
    McStat,
    McError,
    McClientError,
    McServerError,

    // resp requests
    RespGet,
    RespSet,
    RespDel,
    RespMget,
    RespIncr,
    RespDecr,
    RespExists,
    RespExpire,
    RespTtl,
    RespType,
    RespPing,
    RespAuth,
    RespSelect,
    RespQuit,

    // resp responses
    RespStatus,
    RespError,
    RespInteger,
    RespBulk,
    RespMulti,
}

impl MsgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::McGet => "get",
            Self::McGets => "gets",
            Self::McSet => "set",
            Self::McAdd => "add",
            Self::McReplace => "replace",
            Self::McAppend => "append",
            Self::McPrepend => "prepend",
            Self::McCas => "cas",
            Self::McDelete => "delete",
            Self::McIncr => "incr",
            Self::McDecr => "decr",
            Self::McTouch => "touch",
            Self::McVersion => "version",
            Self::McQuit => "quit",
            Self::McNum => "num",
            Self::McStored => "stored",
            Self::McNotStored => "not_stored",
            Self::McExists => "exists",
            Self::McNotFound => "not_found",
            Self::McDeleted => "deleted",
            Self::McTouched => "touched",
            Self::McOk => "ok",
            Self::McEnd => "end",
            Self::McValue => "value",
            Self::McVersionRsp => "version",
            Self::McStat => "stat",
            Self::McError => "error",
            Self::McClientError => "client_error",
            Self::McServerError => "server_error",
            Self::RespGet => "get",
            Self::RespSet => "set",
            Self::RespDel => "del",
            Self::RespMget => "mget",
            Self::RespIncr => "incr",
            Self::RespDecr => "decr",
            Self::RespExists => "exists",
            Self::RespExpire => "expire",
            Self::RespTtl => "ttl",
            Self::RespType => "type",
            Self::RespPing => "ping",
            Self::RespAuth => "auth",
            Self::RespSelect => "select",
            Self::RespQuit => "quit",
            Self::RespStatus => "status",
            Self::RespError => "error",
            Self::RespInteger => "integer",
            Self::RespBulk => "bulk",
            Self::RespMulti => "multibulk",
        }
    }
}

/// Invoked when a response has just been paired with its request. Returning
/// false suppresses the normal forward; the hook then owns the pair.
pub type RspForwardHook = fn(ctx: &mut Context, s_conn: usize, rsp: usize) -> bool;

/// Outcome of running a streaming parser over a message's buffer chain.
/// Parsers rescan from the chain start on every readable edge, so there is
/// no carried parse state to resynchronize.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ParseResult {
    Incomplete,
    /// A full message ends at chain offset `end`; bytes past it belong to
    /// the next pipelined message.
    Complete { end: usize },
    Error,
}

pub struct Msg {
    pub id: u64,
    pub kind: MsgKind,
    pub protocol: Protocol,
    /// Connection that allocated this message.
    pub owner: Option<usize>,
    /// Paired message of the opposite kind. Symmetric and exclusive; must
    /// be cleared before either side is released.
    pub peer: Option<usize>,

    pub chain: Chain,
    pub mlen: u32,
    pub mtype: MsgType,
    /// Key arguments, copied out of the chain at parse time.
    pub keys: Vec<Vec<u8>>,

    /// Queue node on the owning client connection's out-queue.
    pub c_qnode: Option<usize>,
    /// Queue node on a server connection's pending or outstanding queue.
    pub s_qnode: Option<usize>,
    /// Server connection currently holding this request, and which of its
    /// queues; cleared whenever the request leaves the server side.
    pub s_conn: Option<usize>,
    pub s_stage: Option<SendStage>,

    pub frag_id: u64,
    pub frag_parent: Option<usize>,
    /// Id the parent had when the fragment was created; guards against the
    /// parent's slab slot having been reused after a teardown.
    pub frag_parent_id: u64,
    pub frag_last: bool,
    /// Original key indexes carried by this fragment (fragments only).
    pub frag_key_idx: Vec<u32>,
    /// Parent only: total fragments in the group.
    pub nfrag: u32,
    /// Parent only: reply elements collected per original key index.
    pub frag_elems: Vec<Option<Vec<u8>>>,
    /// Parent only: running integer total for numeric coalescing.
    pub frag_int: i64,
    pub post_coalesced: bool,
    pub fdone: bool,
    pub ferror: bool,

    pub done: bool,
    pub swallow: bool,
    pub error: bool,
    pub err: i32,

    pub slowlog_stime: i64,
    pub slowlog_etime: i64,

    pub pre_rsp_forward: Option<RspForwardHook>,
}

impl Msg {
    pub fn is_request(&self) -> bool {
        self.kind == MsgKind::Request
    }

    pub fn is_response(&self) -> bool {
        self.kind == MsgKind::Response
    }

    pub fn empty(&self) -> bool {
        self.mlen == 0
    }
}

/// Slab-backed message pool. Allocation is capacity-bounded; release
/// requires the peer link and queue nodes to have been cleared already.
pub struct MsgPool {
    msgs: Slab<Msg>,
    next_id: u64,
    max_msgs: usize,
}

impl MsgPool {
    pub fn new(max_msgs: usize) -> Self {
        Self {
            msgs: Slab::new(),
            next_id: 1,
            max_msgs,
        }
    }

    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }

    pub fn contains(&self, key: usize) -> bool {
        self.msgs.contains(key)
    }

    pub fn alloc(
        &mut self,
        kind: MsgKind,
        protocol: Protocol,
        owner: Option<usize>,
    ) -> Result<usize, AllocError> {
        if self.msgs.len() >= self.max_msgs {
            return Err(AllocError);
        }

        let id = self.next_id;
        self.next_id += 1;

        Ok(self.msgs.insert(Msg {
            id,
            kind,
            protocol,
            owner,
            peer: None,
            chain: Chain::default(),
            mlen: 0,
            mtype: MsgType::Unknown,
            keys: Vec::new(),
            c_qnode: None,
            s_qnode: None,
            s_conn: None,
            s_stage: None,
            frag_id: 0,
            frag_parent: None,
            frag_parent_id: 0,
            frag_last: false,
            frag_key_idx: Vec::new(),
            nfrag: 0,
            frag_elems: Vec::new(),
            frag_int: 0,
            post_coalesced: false,
            fdone: false,
            ferror: false,
            done: false,
            swallow: false,
            error: false,
            err: 0,
            slowlog_stime: 0,
            slowlog_etime: 0,
            pre_rsp_forward: None,
        }))
    }

    pub fn release(&mut self, key: usize, mbufs: &mut MbufPool) {
        let msg = &mut self.msgs[key];

        assert!(msg.peer.is_none(), "releasing a message with a live peer");
        assert!(msg.c_qnode.is_none() && msg.s_qnode.is_none());

        msg.chain.release(mbufs);
        self.msgs.remove(key);
    }
}

impl Index<usize> for MsgPool {
    type Output = Msg;

    fn index(&self, key: usize) -> &Msg {
        &self.msgs[key]
    }
}

impl IndexMut<usize> for MsgPool {
    fn index_mut(&mut self, key: usize) -> &mut Msg {
        &mut self.msgs[key]
    }
}

pub fn link_peer(msgs: &mut MsgPool, a: usize, b: usize) {
    assert!(msgs[a].peer.is_none() && msgs[b].peer.is_none());

    msgs[a].peer = Some(b);
    msgs[b].peer = Some(a);
}

/// Clear the symmetric peer link, returning the other side's key.
pub fn unlink_peer(msgs: &mut MsgPool, a: usize) -> Option<usize> {
    let b = msgs[a].peer.take()?;
    msgs[b].peer = None;

    Some(b)
}

pub fn err_desc(err: i32) -> &'static str {
    match err {
        libc::ETIMEDOUT => "timed out",
        libc::ECONNREFUSED => "connection refused",
        libc::ECONNRESET => "connection reset",
        libc::EPIPE => "server closed connection",
        libc::EINVAL => "invalid argument",
        libc::ENOMEM => "out of memory",
        libc::EHOSTDOWN => "host is down",
        _ => "unknown error",
    }
}

/// Synthesize a reply whose body encodes `err` in the protocol's error
/// form. The caller peers it with the failed request.
pub fn make_error_reply(
    msgs: &mut MsgPool,
    mbufs: &mut MbufPool,
    protocol: Protocol,
    err: i32,
) -> Result<usize, AllocError> {
    let key = msgs.alloc(MsgKind::Response, protocol, None)?;

    let mut body = Vec::with_capacity(64);

    match protocol {
        Protocol::Memcache => {
            body.extend_from_slice(b"SERVER_ERROR ");
            body.extend_from_slice(err_desc(err).as_bytes());
            body.extend_from_slice(b"\r\n");
        }
        Protocol::Resp => {
            body.extend_from_slice(b"-ERR ");
            body.extend_from_slice(err_desc(err).as_bytes());
            body.extend_from_slice(b"\r\n");
        }
    }

    let msg = &mut msgs[key];

    if msg.chain.append(mbufs, &body).is_err() {
        msgs.release(key, mbufs);
        return Err(AllocError);
    }

    let msg = &mut msgs[key];
    msg.mlen = body.len() as u32;
    msg.mtype = match protocol {
        Protocol::Memcache => MsgType::McServerError,
        Protocol::Resp => MsgType::RespError,
    };
    msg.done = true;

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotone() {
        let mut mbufs = MbufPool::new(64, 16);
        let mut msgs = MsgPool::new(8);

        let a = msgs
            .alloc(MsgKind::Request, Protocol::Memcache, None)
            .unwrap();
        let b = msgs
            .alloc(MsgKind::Response, Protocol::Memcache, None)
            .unwrap();

        assert!(msgs[b].id > msgs[a].id);

        msgs.release(a, &mut mbufs);
        let c = msgs
            .alloc(MsgKind::Request, Protocol::Memcache, None)
            .unwrap();
        assert!(msgs[c].id > msgs[b].id);
    }

    #[test]
    fn pool_bounded() {
        let mut msgs = MsgPool::new(1);

        let _a = msgs
            .alloc(MsgKind::Request, Protocol::Resp, None)
            .unwrap();
        assert!(msgs.alloc(MsgKind::Request, Protocol::Resp, None).is_err());
    }

    #[test]
    fn peer_link_symmetric() {
        let mut mbufs = MbufPool::new(64, 16);
        let mut msgs = MsgPool::new(8);

        let req = msgs
            .alloc(MsgKind::Request, Protocol::Resp, None)
            .unwrap();
        let rsp = msgs
            .alloc(MsgKind::Response, Protocol::Resp, None)
            .unwrap();

        link_peer(&mut msgs, req, rsp);
        assert_eq!(msgs[req].peer, Some(rsp));
        assert_eq!(msgs[rsp].peer, Some(req));

        assert_eq!(unlink_peer(&mut msgs, rsp), Some(req));
        assert_eq!(msgs[req].peer, None);
        assert_eq!(msgs[rsp].peer, None);
        assert_eq!(unlink_peer(&mut msgs, rsp), None);

        msgs.release(req, &mut mbufs);
        msgs.release(rsp, &mut mbufs);
        assert!(msgs.is_empty());
    }

    #[test]
    #[should_panic]
    fn release_with_peer_panics() {
        let mut mbufs = MbufPool::new(64, 16);
        let mut msgs = MsgPool::new(8);

        let req = msgs
            .alloc(MsgKind::Request, Protocol::Resp, None)
            .unwrap();
        let rsp = msgs
            .alloc(MsgKind::Response, Protocol::Resp, None)
            .unwrap();

        link_peer(&mut msgs, req, rsp);
        msgs.release(rsp, &mut mbufs);
    }

    #[test]
    fn error_reply_forms() {
        let mut mbufs = MbufPool::new(64, 16);
        let mut msgs = MsgPool::new(8);

        let mc = make_error_reply(&mut msgs, &mut mbufs, Protocol::Memcache, libc::ETIMEDOUT)
            .unwrap();
        let mut out = Vec::new();
        let len = msgs[mc].mlen as usize;
        msgs[mc].chain.copy_to(0, len, &mut out);
        assert_eq!(&out, b"SERVER_ERROR timed out\r\n");
        assert!(msgs[mc].done);

        let rs = make_error_reply(&mut msgs, &mut mbufs, Protocol::Resp, libc::EPIPE).unwrap();
        let mut out = Vec::new();
        let len = msgs[rs].mlen as usize;
        msgs[rs].chain.copy_to(0, len, &mut out);
        assert_eq!(&out, b"-ERR server closed connection\r\n");

        msgs.release(mc, &mut mbufs);
        msgs.release(rs, &mut mbufs);
        assert_eq!(mbufs.live(), 0);
    }
}
