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

use criterion::{criterion_group, criterion_main, Criterion};
use keyport::list;
use keyport::mbuf::MbufPool;
use keyport::message::{MsgKind, MsgPool, Protocol};
use slab::Slab;

fn criterion_benchmark(c: &mut Criterion) {
    const NODE_COUNT: usize = 10000;

    {
        let mut nodes_slab = Some(Slab::with_capacity(NODE_COUNT));

        c.bench_function(&format!("out-queue push pop {NODE_COUNT}"), |b| {
            b.iter(|| {
                let mut nodes = nodes_slab.take().unwrap();
                let mut q = list::List::default();

                let mut next_value: u64 = 0;
                while nodes.len() < nodes.capacity() {
                    let n = nodes.insert(list::Node::new(next_value));
                    q.push_back(&mut nodes, n);
                    next_value += 1;
                }

                while let Some(n) = q.pop_front(&mut nodes) {
                    nodes.remove(n);
                }

                nodes_slab = Some(nodes);
            });
        });
    }

    {
        let mut pools = Some((MsgPool::new(NODE_COUNT), MbufPool::new(16384, NODE_COUNT)));

        c.bench_function(&format!("message alloc release {NODE_COUNT}"), |b| {
            b.iter(|| {
                let (mut msgs, mut mbufs) = pools.take().unwrap();
                let mut keys = Vec::with_capacity(NODE_COUNT);

                for _ in 0..NODE_COUNT {
                    keys.push(
                        msgs.alloc(MsgKind::Response, Protocol::Memcache, None)
                            .unwrap(),
                    );
                }

                for k in keys {
                    msgs.release(k, &mut mbufs);
                }

                pools = Some((msgs, mbufs));
            });
        });
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
