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

use std::fmt::Write as _;

pub const MAX_TIMEOUT_MS: i64 = 600_000;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ServerMetric {
    Requests,
    RequestBytes,
    Responses,
    ResponseBytes,
    Errors,
}

const SERVER_METRIC_COUNT: usize = 5;

impl ServerMetric {
    fn idx(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Requests => "requests",
            Self::RequestBytes => "request_bytes",
            Self::Responses => "responses",
            Self::ResponseBytes => "response_bytes",
            Self::Errors => "errors",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PoolMetric {
    ForwardError,
    FragCreated,
    LRequestGt10ms,
    LRequestGt20ms,
    LRequestGt50ms,
    LRequestGt100ms,
    LRequestGt200ms,
    LRequestGt500ms,
    XRequestGt10ms,
    XRequestGt20ms,
    XRequestGt50ms,
    XRequestGt100ms,
    XRequestGt200ms,
    XRequestGt500ms,
}

const POOL_METRIC_COUNT: usize = 14;

impl PoolMetric {
    fn idx(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ForwardError => "forward_error",
            Self::FragCreated => "fragments",
            Self::LRequestGt10ms => "lrequest_gt_10ms",
            Self::LRequestGt20ms => "lrequest_gt_20ms",
            Self::LRequestGt50ms => "lrequest_gt_50ms",
            Self::LRequestGt100ms => "lrequest_gt_100ms",
            Self::LRequestGt200ms => "lrequest_gt_200ms",
            Self::LRequestGt500ms => "lrequest_gt_500ms",
            Self::XRequestGt10ms => "xrequest_gt_10ms",
            Self::XRequestGt20ms => "xrequest_gt_20ms",
            Self::XRequestGt50ms => "xrequest_gt_50ms",
            Self::XRequestGt100ms => "xrequest_gt_100ms",
            Self::XRequestGt200ms => "xrequest_gt_200ms",
            Self::XRequestGt500ms => "xrequest_gt_500ms",
        }
    }
}

/// Ascending bucket floors with their local and cross-IDC counters. The
/// latency accounting is cumulative: every bucket whose floor is at or
/// below the cost is incremented, so the loop stops at the first floor
/// above the cost.
const LATENCY_BUCKETS: [(i64, PoolMetric, PoolMetric); 6] = [
    (10, PoolMetric::LRequestGt10ms, PoolMetric::XRequestGt10ms),
    (20, PoolMetric::LRequestGt20ms, PoolMetric::XRequestGt20ms),
    (50, PoolMetric::LRequestGt50ms, PoolMetric::XRequestGt50ms),
    (100, PoolMetric::LRequestGt100ms, PoolMetric::XRequestGt100ms),
    (200, PoolMetric::LRequestGt200ms, PoolMetric::XRequestGt200ms),
    (500, PoolMetric::LRequestGt500ms, PoolMetric::XRequestGt500ms),
];

struct PoolEntry {
    counters: [u64; POOL_METRIC_COUNT],
    servers: Vec<[u64; SERVER_METRIC_COUNT]>,
}

/// In-process counter tables, one entry per pool, one row per server.
/// Single-threaded like everything else in the proxy core, so these are
/// plain integers.
pub struct Stats {
    pools: Vec<PoolEntry>,
}

impl Stats {
    /// `shape[p]` is the server count of pool `p`.
    pub fn new(shape: &[usize]) -> Self {
        let pools = shape
            .iter()
            .map(|&n| PoolEntry {
                counters: [0; POOL_METRIC_COUNT],
                servers: vec![[0; SERVER_METRIC_COUNT]; n],
            })
            .collect();

        Self { pools }
    }

    pub fn pool_incr(&mut self, pool: usize, m: PoolMetric) {
        self.pools[pool].counters[m.idx()] += 1;
    }

    pub fn pool_get(&self, pool: usize, m: PoolMetric) -> u64 {
        self.pools[pool].counters[m.idx()]
    }

    pub fn server_incr(&mut self, pool: usize, server: usize, m: ServerMetric) {
        self.server_incr_by(pool, server, m, 1);
    }

    pub fn server_incr_by(&mut self, pool: usize, server: usize, m: ServerMetric, v: u64) {
        self.pools[pool].servers[server][m.idx()] += v;
    }

    pub fn server_get(&self, pool: usize, server: usize, m: ServerMetric) -> u64 {
        self.pools[pool].servers[server][m.idx()]
    }

    /// Cumulative latency accounting for one forwarded reply. Costs above
    /// the ceiling are ignored outright.
    pub fn record_latency(&mut self, pool: usize, local_idc: bool, cost_ms: i64) {
        if cost_ms > MAX_TIMEOUT_MS {
            return;
        }

        for (floor, local, cross) in LATENCY_BUCKETS {
            if cost_ms < floor {
                break;
            }

            self.pool_incr(pool, if local_idc { local } else { cross });
        }
    }

    /// One-line-per-counter dump for shutdown logging.
    pub fn dump(&self) -> String {
        let mut out = String::new();

        for (p, entry) in self.pools.iter().enumerate() {
            for m in [
                PoolMetric::ForwardError,
                PoolMetric::FragCreated,
                PoolMetric::LRequestGt10ms,
                PoolMetric::LRequestGt20ms,
                PoolMetric::LRequestGt50ms,
                PoolMetric::LRequestGt100ms,
                PoolMetric::LRequestGt200ms,
                PoolMetric::LRequestGt500ms,
                PoolMetric::XRequestGt10ms,
                PoolMetric::XRequestGt20ms,
                PoolMetric::XRequestGt50ms,
                PoolMetric::XRequestGt100ms,
                PoolMetric::XRequestGt200ms,
                PoolMetric::XRequestGt500ms,
            ] {
                let v = entry.counters[m.idx()];
                if v > 0 {
                    let _ = writeln!(out, "pool {} {} {}", p, m.name(), v);
                }
            }

            for (s, row) in entry.servers.iter().enumerate() {
                for m in [
                    ServerMetric::Requests,
                    ServerMetric::RequestBytes,
                    ServerMetric::Responses,
                    ServerMetric::ResponseBytes,
                    ServerMetric::Errors,
                ] {
                    let v = row[m.idx()];
                    if v > 0 {
                        let _ = writeln!(out, "pool {} server {} {} {}", p, s, m.name(), v);
                    }
                }
            }
        }

        out
    }
}
