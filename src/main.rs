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

use clap::Parser;
use keyport::config::AppConfig;
use keyport::core::Context;
use keyport::slowlog::Slowlog;
use log::{error, info, LevelFilter};
use std::error::Error;
use std::fs::{File, OpenOptions};
use std::io::BufWriter;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "keyport",
    version = keyport::version(),
    about = "Sharding proxy for memcached and Redis protocol cache servers"
)]
struct Args {
    /// Config file path
    #[arg(short, long)]
    config: PathBuf,

    /// Log file. Log to stderr if not specified
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn run(args: &Args) -> Result<(), Box<dyn Error>> {
    let level = match args.log_level.as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        s => return Err(format!("invalid log level: {}", s).into()),
    };

    let log_file = match &args.log_file {
        Some(path) => Some(File::options().create(true).append(true).open(path)?),
        None => None,
    };

    keyport::log::init(log_file, level).map_err(|e| e.to_string())?;

    let cfg = AppConfig::load(&args.config)?;

    let mut ctx = Context::new(
        cfg.build_pools(),
        cfg.mbuf_size,
        cfg.max_mbufs,
        cfg.max_messages,
    );

    if let Some(path) = &cfg.slowlog_file {
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        ctx.set_slowlog(Slowlog::to_writer(Box::new(BufWriter::new(f))));
    }

    ctx.init_net()?;

    let shutdown = Arc::new(AtomicBool::new(false));

    for sig in [
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ] {
        signal_hook::flag::register(sig, Arc::clone(&shutdown))?;
    }

    info!("keyport {} starting", keyport::version());

    ctx.run(&shutdown)?;

    let dump = ctx.stats.dump();

    if !dump.is_empty() {
        info!("final counters:\n{}", dump);
    }

    Ok(())
}

fn main() {
    let args = Args::parse();

    if let Err(e) = run(&args) {
        error!("{}", e);
        eprintln!("error: {}", e);
        process::exit(1);
    }
}
