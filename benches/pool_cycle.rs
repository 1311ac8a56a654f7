use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use frame_streamer::capture::{CameraDriver, TestPatternDriver};
use frame_streamer::format::{to_rgb888, FrameGeometry, PixelFormat};
use frame_streamer::handoff::FrameHandoff;
use frame_streamer::pool::BufferPool;
use std::time::Duration;

fn benchmark_dequeue_requeue(c: &mut Criterion) {
    let mut group = c.benchmark_group("dequeue_requeue");

    // Typical small-display and VGA frames
    for (width, height) in [(240u32, 240u32), (640, 480)].iter() {
        let geometry = FrameGeometry::new(*width, *height, PixelFormat::Bgr565).unwrap();
        let mut driver = TestPatternDriver::new(100_000);
        driver.set_format(&geometry).unwrap();
        let mut pool = BufferPool::preallocate(4, geometry.frame_size(), 64).unwrap();
        pool.prime(&mut driver).unwrap();
        driver.stream_start().unwrap();

        group.bench_with_input(
            BenchmarkId::new("resolution", format!("{}x{}", width, height)),
            &geometry,
            |b, _| {
                b.iter(|| {
                    let buffer = pool.dequeue(&mut driver, Duration::from_secs(1)).unwrap();
                    black_box(buffer.data()[0]);
                    pool.enqueue(&mut driver, buffer).unwrap();
                });
            },
        );
    }

    group.finish();
}

fn benchmark_publish_release(c: &mut Criterion) {
    let geometry = FrameGeometry::new(240, 240, PixelFormat::Bgr565).unwrap();
    let mut driver = TestPatternDriver::new(100_000);
    driver.set_format(&geometry).unwrap();
    let mut pool = BufferPool::preallocate(4, geometry.frame_size(), 64).unwrap();
    pool.prime(&mut driver).unwrap();
    driver.stream_start().unwrap();
    let handoff = FrameHandoff::new();

    c.bench_function("publish_take_release_240x240", |b| {
        b.iter(|| {
            pool.reclaim(&mut driver).unwrap();
            let buffer = pool.dequeue(&mut driver, Duration::from_secs(1)).unwrap();
            let lease = pool.hand_off(buffer).unwrap();
            handoff.publish(lease);
            let lease = handoff.take().unwrap();
            black_box(lease.len());
        });
    });
}

fn benchmark_rgb_conversion(c: &mut Criterion) {
    let geometry = FrameGeometry::new(240, 240, PixelFormat::Bgr565).unwrap();
    let frame = vec![0xA5u8; geometry.frame_size()];
    let mut rgb = vec![0u8; 240 * 240 * 3];

    c.bench_function("bgr565_to_rgb888_240x240", |b| {
        b.iter(|| to_rgb888(black_box(&geometry), black_box(&frame), &mut rgb).unwrap());
    });
}

criterion_group!(
    benches,
    benchmark_dequeue_requeue,
    benchmark_publish_release,
    benchmark_rgb_conversion
);
criterion_main!(benches);
