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

//! Process logger: one timestamped line per record, to stderr or a log
//! file. A proxy must outlive its own logging, so write failures (full
//! disk, poisoned lock) drop the line instead of panicking.

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, Write};
use std::sync::{Mutex, OnceLock};
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

pub struct Logger {
    file: Option<Mutex<File>>,
    /// Captured once at install time; discovering the local offset is
    /// only sound while the process is still single-threaded.
    offset: UtcOffset,
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

/// Install the process logger. Call before anything else starts logging
/// and before any thread is spawned; with no discoverable local offset,
/// timestamps fall back to UTC.
pub fn init(file: Option<File>, level: LevelFilter) -> Result<(), log::SetLoggerError> {
    let logger = LOGGER.get_or_init(|| Logger {
        file: file.map(Mutex::new),
        offset: UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC),
    });

    log::set_logger(logger)?;
    log::set_max_level(level);

    Ok(())
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::Error => "ERR",
        Level::Warn => "WARN",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

impl Logger {
    fn render(&self, record: &Record) -> String {
        let format = format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
        );

        let ts = OffsetDateTime::now_utc()
            .to_offset(self.offset)
            .format(&format)
            .unwrap_or_default();

        let mut line = String::with_capacity(128);

        // debug and trace lines carry the module they came from
        let _ = if record.level() <= Level::Info {
            writeln!(line, "[{}] {} {}", level_name(record.level()), ts, record.args())
        } else {
            writeln!(
                line,
                "[{}] {} [{}] {}",
                level_name(record.level()),
                ts,
                record.target(),
                record.args()
            )
        };

        line
    }
}

impl Log for Logger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        // filtering happens through log::set_max_level
        true
    }

    fn log(&self, record: &Record) {
        let line = self.render(record);

        let _ = match &self.file {
            Some(file) => match file.lock() {
                Ok(mut f) => f.write_all(line.as_bytes()),
                Err(_) => return,
            },
            None => io::stderr().write_all(line.as_bytes()),
        };
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            if let Ok(mut f) = file.lock() {
                let _ = f.flush();
            }
        }
    }
}
