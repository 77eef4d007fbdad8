//! Planner insertion throughput: every insert replans the whole
//! unoptimized portion of the buffer, so a zig-zag path is the worst
//! case for the look-ahead passes.

use std::sync::{Arc, Mutex};

use criterion::{criterion_group, criterion_main, Criterion};

use cinder_common::position::SysPosition;
use cinder_common::settings::Settings;
use cinder_motion::planner::{planner_queue, LineData, Planner};
use cinder_motion::segment::{segment_ring, SegmentPrep, StepControl};

fn build_planner() -> Planner {
    let settings = Arc::new(Settings::default());
    let position = Arc::new(SysPosition::new());
    let (queue, plan_consumer) = planner_queue();
    let (seg_producer, _seg_consumer) = segment_ring();
    let control = Arc::new(StepControl::new());
    let prep = Arc::new(Mutex::new(SegmentPrep::new(
        plan_consumer,
        seg_producer,
        control,
        settings.clone(),
    )));
    Planner::new(queue, prep, settings, position)
}

fn bench_zigzag_insert(c: &mut Criterion) {
    c.bench_function("plan_100_zigzag_blocks", |b| {
        let data = LineData {
            feed_rate: 2400.0,
            ..LineData::default()
        };
        b.iter_batched(
            build_planner,
            |mut planner| {
                for i in 0..100 {
                    let x = (i + 1) as f32;
                    let y = if i % 2 == 0 { 1.0 } else { 0.0 };
                    planner.buffer_line(&[x, y, 0.0], &data);
                }
                planner
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_zigzag_insert);
criterion_main!(benches);
