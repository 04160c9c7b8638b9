//! Dispatch throughput: send, receive and complete on a single thread.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use sensor_bus::{Broadcast, Event, MessageBus, WorkerId};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

#[derive(Debug)]
struct Probe(u64);

impl Event for Probe {
    type Output = u64;
}

#[derive(Debug)]
struct Tick(u64);

impl Broadcast for Tick {}

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");

    let bus = MessageBus::new();
    let workers: Vec<_> = (0..4)
        .map(|i| {
            let worker = WorkerId::new(format!("worker-{i}"));
            bus.register(&worker);
            bus.subscribe_broadcast::<Tick>(&worker);
            worker
        })
        .collect();
    let handler = &workers[0];
    bus.subscribe_event::<Probe>(handler);

    group.bench_function("event_round_trip", |b| {
        let mut next = 0;
        b.iter(|| {
            let future = bus.send_event(Probe(next)).unwrap();
            let request = bus
                .try_message(handler)
                .unwrap()
                .unwrap()
                .into_event::<Probe>()
                .unwrap();
            bus.complete(request.token(), request.0);
            next += 1;
            black_box(future.get().unwrap());
        });
    });

    group.bench_function("broadcast_fan_out_4", |b| {
        b.iter(|| {
            black_box(bus.send_broadcast(Tick(1)));
            for worker in &workers {
                black_box(bus.try_message(worker).unwrap());
            }
        });
    });

    group.finish();
}
