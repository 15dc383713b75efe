//! Benchmarks for device classification
//!
//! Run with: cargo bench

use cambackend::backend::MockDeviceSpec;
use cambackend::classifier::DeviceClassifier;
use cambackend::types::InterfaceSnapshot;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

/// A host with `cameras` cameras of mixed families plus as many strays
fn crowded_host(cameras: usize) -> InterfaceSnapshot {
    let mut snapshot = InterfaceSnapshot::default();
    for i in 0..cameras {
        let location = format!("{}-{}", 1 + i / 8, 1 + i % 8);
        let serial = format!("SN{:06}", i);
        let spec = match i % 3 {
            0 => MockDeviceSpec::sr300(&serial, &location),
            1 => MockDeviceSpec::ds5(0x0B07, &serial, &location, true),
            _ => MockDeviceSpec::recovery(0x0ADB, &location),
        };
        let stray = MockDeviceSpec::unrelated_usb(0x046d, 0x0825, &format!("9-{}", i));
        for part in [spec, stray] {
            snapshot.video.extend(part.video);
            snapshot.usb.extend(part.usb);
            snapshot.hid.extend(part.hid);
        }
    }
    snapshot
}

fn bench_classify(c: &mut Criterion) {
    let mut group = c.benchmark_group("classify");
    let classifier = DeviceClassifier::default();

    for cameras in [1usize, 8, 64].iter() {
        let snapshot = crowded_host(*cameras);
        group.throughput(Throughput::Elements(snapshot.len() as u64));

        group.bench_with_input(
            BenchmarkId::new("mixed_families", cameras),
            &snapshot,
            |b, snapshot| {
                b.iter(|| black_box(classifier.classify(black_box(snapshot))));
            },
        );
    }

    group.finish();
}

fn bench_snapshot_difference(c: &mut Criterion) {
    let mut group = c.benchmark_group("hotplug_diff");

    for cameras in [8usize, 64].iter() {
        let before = crowded_host(*cameras);
        let after = crowded_host(cameras - 1);

        group.bench_with_input(
            BenchmarkId::new("one_removed", cameras),
            &(before, after),
            |b, (before, after)| {
                b.iter(|| black_box(before.difference(after)));
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_classify, bench_snapshot_difference);
criterion_main!(benches);
