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

use log::debug;
use std::io;
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(_) => 0,
    }
}

pub struct Record<'a> {
    pub request_msg_id: u64,
    pub client_address: &'a str,
    pub server_address: &'a str,
    pub cost_ms: i64,
    pub fragment_id: u64,
    pub request_type: &'a str,
    pub request_len: u32,
    pub response_len: u32,
    pub key: &'a [u8],
}

/// Slow-request sink. Records are formatted into a reused scratch buffer
/// and handed to the writer in one call; a sink that reports would-block
/// loses the record rather than stalling the response path.
pub struct Slowlog {
    sink: Option<Box<dyn Write>>,
    scratch: Vec<u8>,
}

impl Slowlog {
    pub fn disabled() -> Self {
        Self {
            sink: None,
            scratch: Vec::new(),
        }
    }

    pub fn to_writer(sink: Box<dyn Write>) -> Self {
        Self {
            sink: Some(sink),
            scratch: Vec::with_capacity(512),
        }
    }

    pub fn record(&mut self, rec: &Record) {
        let sink = match &mut self.sink {
            Some(sink) => sink,
            None => return,
        };

        // the key is reported up to its first NUL
        let key = match rec.key.iter().position(|&b| b == 0) {
            Some(n) => &rec.key[..n],
            None => rec.key,
        };

        self.scratch.clear();

        let _ = write!(
            self.scratch,
            "request_msg_id={}, client_address={}, server_address={}, \
             cost_time={}ms, fragment_id={}, request_type={}, \
             request_len {}, response_len {}, key='",
            rec.request_msg_id,
            rec.client_address,
            rec.server_address,
            rec.cost_ms,
            rec.fragment_id,
            rec.request_type,
            rec.request_len,
            rec.response_len,
        );
        self.scratch.extend_from_slice(key);
        self.scratch.extend_from_slice(b"'\n");

        match sink.write_all(&self.scratch) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!("slowlog sink full, record dropped");
            }
            Err(e) => {
                debug!("slowlog write failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> Result<(), io::Error> {
            Ok(())
        }
    }

    #[test]
    fn record_format() {
        let buf = SharedBuf(Rc::new(RefCell::new(Vec::new())));
        let mut sl = Slowlog::to_writer(Box::new(buf.clone()));

        sl.record(&Record {
            request_msg_id: 42,
            client_address: "10.0.0.1:55000",
            server_address: "10.0.0.2:11211",
            cost_ms: 250,
            fragment_id: 0,
            request_type: "get",
            request_len: 13,
            response_len: 23,
            key: b"foo",
        });

        let out = buf.0.borrow();
        let line = std::str::from_utf8(&out).unwrap();

        assert_eq!(
            line,
            "request_msg_id=42, client_address=10.0.0.1:55000, \
             server_address=10.0.0.2:11211, cost_time=250ms, fragment_id=0, \
             request_type=get, request_len 13, response_len 23, key='foo'\n"
        );
    }

    #[test]
    fn key_stops_at_nul() {
        let buf = SharedBuf(Rc::new(RefCell::new(Vec::new())));
        let mut sl = Slowlog::to_writer(Box::new(buf.clone()));

        sl.record(&Record {
            request_msg_id: 1,
            client_address: "a",
            server_address: "b",
            cost_ms: 1,
            fragment_id: 7,
            request_type: "mget",
            request_len: 1,
            response_len: 1,
            key: b"abc\0def",
        });

        let out = buf.0.borrow();
        let line = std::str::from_utf8(&out).unwrap();
        assert!(line.contains("key='abc'"));
        assert!(line.contains("fragment_id=7"));
    }

    #[test]
    fn disabled_sink_drops_records() {
        let mut sl = Slowlog::disabled();

        sl.record(&Record {
            request_msg_id: 1,
            client_address: "a",
            server_address: "b",
            cost_ms: 1,
            fragment_id: 0,
            request_type: "get",
            request_len: 1,
            response_len: 1,
            key: b"k",
        });
    }
}
