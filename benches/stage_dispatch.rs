use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use ringstage::config::StageConfig;
use ringstage::coroutine::CoroContext;
use ringstage::message::Message;
use ringstage::reactor::{EventLoopFleet, ReactorHandle};
use ringstage::stage::{HandlerFactory, Stage};
use std::sync::Arc;

fn start_fleet() -> EventLoopFleet {
    EventLoopFleet::start(1, 64).expect("fleet starts")
}

fn bench_stage_dispatch(c: &mut Criterion) {
    let fleet = start_fleet();
    let reactors: Vec<ReactorHandle> = fleet.handles().to_vec();

    let config = StageConfig::builder("bench").worker_count(1).queue_size(1024).build().unwrap();
    let stage = Stage::new(config);
    stage.start(
        HandlerFactory::Shared(Arc::new(|message: Message, _ctx: &CoroContext| {
            std::hint::black_box(message.payload.len());
        })),
        &reactors,
    );

    let mut group = c.benchmark_group("stage/dispatch");
    group.throughput(Throughput::Elements(1));
    group.bench_function("send", |b| {
        b.iter(|| {
            let _ = stage.send(0, Message::one_way(&b"ping"[..]));
        });
    });
    group.finish();

    stage.stop();
    stage.wait();
    fleet.stop();
    let _ = fleet.wait();
}

criterion_group!(benches, bench_stage_dispatch);
criterion_main!(benches);
