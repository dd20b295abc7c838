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
use crate::server::{Server, ServerPool};
use config::{Config, File};
use serde::Deserialize;
use std::error::Error;
use std::net::SocketAddr;
use std::path::Path;

fn default_mbuf_size() -> usize {
    16384
}

fn default_max_mbufs() -> usize {
    65536
}

fn default_max_messages() -> usize {
    65536
}

fn default_slowlog_slower_than() -> i64 {
    100
}

fn default_server_retry_timeout() -> i64 {
    30_000
}

fn default_server_failure_limit() -> u32 {
    2
}

fn default_local_idc() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub address: String,
    #[serde(default = "default_local_idc")]
    pub local_idc: bool,
}

#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    pub listen: String,
    /// "memcache" or "redis".
    pub protocol: String,
    pub servers: Vec<ServerConfig>,

    #[serde(default)]
    pub slowlog: bool,
    #[serde(default = "default_slowlog_slower_than")]
    pub slowlog_slower_than: i64,

    #[serde(default = "default_server_retry_timeout")]
    pub server_retry_timeout: i64,
    #[serde(default = "default_server_failure_limit")]
    pub server_failure_limit: u32,

    #[serde(default)]
    pub redis_auth: Option<String>,
    #[serde(default)]
    pub preconnect: bool,
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub pools: Vec<PoolConfig>,

    #[serde(default = "default_mbuf_size")]
    pub mbuf_size: usize,
    #[serde(default = "default_max_mbufs")]
    pub max_mbufs: usize,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,

    #[serde(default)]
    pub slowlog_file: Option<String>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, Box<dyn Error>> {
        let cfg = Config::builder()
            .add_source(File::from(path))
            .build()?
            .try_deserialize::<AppConfig>()?;

        cfg.validate()?;

        Ok(cfg)
    }

    fn validate(&self) -> Result<(), Box<dyn Error>> {
        if self.pools.is_empty() {
            return Err("no pools configured".into());
        }

        for p in &self.pools {
            if p.servers.is_empty() {
                return Err(format!("pool {} has no servers", p.name).into());
            }

            parse_protocol(&p.protocol)
                .ok_or_else(|| format!("pool {}: unknown protocol {}", p.name, p.protocol))?;

            p.listen
                .parse::<SocketAddr>()
                .map_err(|e| format!("pool {}: bad listen address: {}", p.name, e))?;

            for s in &p.servers {
                s.address
                    .parse::<SocketAddr>()
                    .map_err(|e| format!("pool {}: bad server address {}: {}", p.name, s.address, e))?;
            }

            if p.redis_auth.is_some() && parse_protocol(&p.protocol) != Some(Protocol::Resp) {
                return Err(format!("pool {}: redis_auth on a memcache pool", p.name).into());
            }
        }

        Ok(())
    }

    pub fn build_pools(&self) -> Vec<ServerPool> {
        self.pools
            .iter()
            .map(|p| {
                let protocol = parse_protocol(&p.protocol).unwrap();

                let servers = p
                    .servers
                    .iter()
                    .map(|s| {
                        Server::new(s.address.clone(), s.address.parse().unwrap(), s.local_idc)
                    })
                    .collect();

                ServerPool {
                    name: p.name.clone(),
                    protocol,
                    listen: p.listen.parse().unwrap(),
                    servers,
                    slowlog: p.slowlog,
                    slowlog_slower_than: p.slowlog_slower_than,
                    server_retry_timeout_ms: p.server_retry_timeout,
                    server_failure_limit: p.server_failure_limit,
                    auth: p.redis_auth.clone(),
                    preconnect: p.preconnect,
                }
            })
            .collect()
    }
}

fn parse_protocol(s: &str) -> Option<Protocol> {
    match s {
        "memcache" | "memcached" => Some(Protocol::Memcache),
        "redis" | "resp" => Some(Protocol::Resp),
        _ => None,
    }
}
