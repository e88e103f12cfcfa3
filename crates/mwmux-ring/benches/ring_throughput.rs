//! Ring round-trip throughput: produce a request, consume it on the back,
//! produce the response, consume it on the front. Single-threaded, so the
//! number is pure copy/index cost without scheduler noise.

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use mwmux_proto::config::GRANT_REF_COUNT;
use mwmux_proto::message::{Message, Opcode};
use mwmux_ring::notify::NullChannel;
use mwmux_ring::{BackRing, FrontRing, SharedRegion};
use std::sync::Arc;

fn bench_round_trip(c: &mut Criterion) {
    let region = Arc::new(SharedRegion::anon(GRANT_REF_COUNT).unwrap());
    let front = FrontRing::init(Arc::clone(&region), Arc::new(NullChannel)).unwrap();
    let back = BackRing::attach(Arc::clone(&region), Arc::new(NullChannel)).unwrap();

    let mut group = c.benchmark_group("ring");
    for payload in [0usize, 64, 1024] {
        group.throughput(Throughput::Elements(1));
        group.bench_function(format!("round_trip_{}b", payload), |b| {
            let mut id = 0u64;
            let body = vec![0u8; payload];
            b.iter(|| {
                id += 1;
                let mut msg = Message::request(Opcode::Send, body.clone()).unwrap();
                msg.header.id = id;
                front.produce_request(&msg).unwrap();
                let req = back.consume_request().unwrap().unwrap();
                let rsp = Message::response_to(&req.header, 0, vec![]).unwrap();
                back.produce_response(&rsp).unwrap();
                front.consume_response().unwrap().unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_round_trip);
criterion_main!(benches);
