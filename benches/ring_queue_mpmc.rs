use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use ringstage::queue::{MpmcQueue, RingQueue, WaitStrategy};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Copy, Clone)]
struct Event {}

fn bench_mpmc_push_pop(c: &mut Criterion) {
    let queue: Arc<MpmcQueue<Event>> = Arc::new(RingQueue::new(8192, WaitStrategy::Spin));
    let is_running = Arc::new(AtomicBool::new(true));

    for _ in 0..4 {
        let consumer_queue = queue.clone();
        let consumer_running = is_running.clone();
        std::thread::spawn(move || {
            while consumer_running.load(Ordering::Acquire) {
                if let Some(event) = consumer_queue.try_pop() {
                    std::hint::black_box(event);
                }
            }
        });
    }

    let event = Event {};

    let mut group = c.benchmark_group("mpmc/four_consumers");
    group.throughput(Throughput::Elements(1));
    group.bench_function("push", |b| {
        b.iter(|| {
            let mut item = event;
            while let Err(back) = queue.push(item) {
                item = back;
                std::hint::spin_loop();
            }
        });
    });
    group.finish();

    is_running.store(false, Ordering::Release);
}

criterion_group!(benches, bench_mpmc_push_pop);
criterion_main!(benches);
