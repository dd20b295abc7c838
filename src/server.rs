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

use crate::message::Protocol;
use std::net::SocketAddr;

/// One backend cache server. Health state feeds selection: a server past
/// its failure limit is ejected until `retry_at_ms`.
pub struct Server {
    pub name: String,
    pub addr: SocketAddr,
    /// Same inter-data-center zone as the proxy; selects the latency
    /// histogram a reply is accounted under.
    pub local_idc: bool,

    /// Current connection to this server, if established.
    pub conn: Option<usize>,
    /// Backend auth handshake completed (RESP pools with a password).
    pub authed: bool,

    pub failure_count: u32,
    pub retry_at_ms: i64,
}

impl Server {
    pub fn new(name: String, addr: SocketAddr, local_idc: bool) -> Self {
        Self {
            name,
            addr,
            local_idc,
            conn: None,
            authed: false,
            failure_count: 0,
            retry_at_ms: 0,
        }
    }

    /// A reply is implicit liveness proof; reset heartbeat/backoff state.
    pub fn mark_ok(&mut self) {
        self.failure_count = 0;
        self.retry_at_ms = 0;
    }

    pub fn mark_failed(&mut self, now_ms: i64, retry_timeout_ms: i64, failure_limit: u32) {
        self.failure_count += 1;

        if self.failure_count >= failure_limit {
            self.retry_at_ms = now_ms + retry_timeout_ms;
        }
    }

    pub fn ejected(&self, now_ms: i64) -> bool {
        self.retry_at_ms > now_ms
    }
}

pub struct ServerPool {
    pub name: String,
    pub protocol: Protocol,
    pub listen: SocketAddr,
    pub servers: Vec<Server>,

    pub slowlog: bool,
    /// Millisecond threshold above which a request is written to the
    /// slow-log sink.
    pub slowlog_slower_than: i64,

    pub server_retry_timeout_ms: i64,
    pub server_failure_limit: u32,

    /// Password for backend AUTH (RESP pools only).
    pub auth: Option<String>,
    pub preconnect: bool,
}

impl ServerPool {
    /// Map a key hash to a live server. Ejected servers are skipped by
    /// probing forward from the hashed slot; with everything ejected the
    /// hashed slot is used anyway so the connect attempt reports the error.
    pub fn pick_server(&self, hash: u64, now_ms: i64) -> usize {
        let n = self.servers.len();
        assert!(n > 0);

        let base = (hash % n as u64) as usize;

        for i in 0..n {
            let idx = (base + i) % n;

            if !self.servers[idx].ejected(now_ms) {
                return idx;
            }
        }

        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(n: usize) -> ServerPool {
        let servers = (0..n)
            .map(|i| {
                let addr: SocketAddr = format!("127.0.0.1:{}", 11211 + i).parse().unwrap();
                Server::new(format!("s{}", i), addr, true)
            })
            .collect();

        ServerPool {
            name: "test".into(),
            protocol: Protocol::Memcache,
            listen: "127.0.0.1:22121".parse().unwrap(),
            servers,
            slowlog: false,
            slowlog_slower_than: 100,
            server_retry_timeout_ms: 30_000,
            server_failure_limit: 2,
            auth: None,
            preconnect: false,
        }
    }

    #[test]
    fn eject_and_recover() {
        let mut s = Server::new("s".into(), "127.0.0.1:11211".parse().unwrap(), true);

        s.mark_failed(1000, 30_000, 2);
        assert!(!s.ejected(1000));

        s.mark_failed(1000, 30_000, 2);
        assert!(s.ejected(1000));
        assert!(s.ejected(30_999));
        assert!(!s.ejected(31_001));

        s.mark_ok();
        assert!(!s.ejected(1000));
        assert_eq!(s.failure_count, 0);
    }

    #[test]
    fn pick_skips_ejected() {
        let mut pool = pool_of(3);
        let now = 1000;

        let idx = pool.pick_server(4, now);
        assert_eq!(idx, 1);

        pool.servers[1].mark_failed(now, 30_000, 1);
        assert!(pool.servers[1].ejected(now));

        let idx = pool.pick_server(4, now);
        assert_eq!(idx, 2);

        // all ejected: fall back to the hashed slot
        pool.servers[0].mark_failed(now, 30_000, 1);
        pool.servers[2].mark_failed(now, 30_000, 1);
        assert_eq!(pool.pick_server(4, now), 1);
    }
}
