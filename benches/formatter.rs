//! Benchmark suite for the detection payload formatters.
//!
//! Isolates formatter performance from async runtime overhead.

use bike_beacon_tracker::measurement::MeasurementTable;
use bike_beacon_tracker::output::json::{ExtendedFormatter, MinimalFormatter};
use bike_beacon_tracker::{BeaconDetectionEvent, Format, MacAddress, OutputFormatter, decode_frame};
use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::time::SystemTime;

const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

fn detection(name: Option<&str>) -> BeaconDetectionEvent {
    let mut record = vec![0x02, 0x01, 0x06, 0x1A, 0xFF, 0x4C, 0x00, 0x02, 0x15];
    record.extend_from_slice(&[
        0xE2, 0xC5, 0x6D, 0xB5, 0xDF, 0xFB, 0x48, 0xD2, 0xB0, 0x60, 0xD0, 0xF5, 0xA7, 0x10, 0x96,
        0xE0,
    ]);
    record.extend_from_slice(&[0x0D, 0x2A, 0x01, 0xA4, 0xC5]); // CO2 420, counter 42
    let frame = decode_frame(&record).expect("valid iBeacon record");

    BeaconDetectionEvent::new(
        TEST_MAC,
        -71,
        SystemTime::UNIX_EPOCH,
        name.map(str::to_string),
        frame,
        &MeasurementTable::default(),
    )
}

fn bench_formatters(c: &mut Criterion) {
    let mut group = c.benchmark_group("format_detection");
    group.throughput(Throughput::Elements(1));

    let event = detection(Some("EmisoraBLE"));

    group.bench_function("minimal", |b| {
        b.iter(|| black_box(MinimalFormatter.format(black_box(&event))))
    });

    let extended = ExtendedFormatter::new(Some("bike-3".to_string()));
    group.bench_function("extended", |b| {
        b.iter(|| black_box(extended.format(black_box(&event))))
    });

    let unnamed = detection(None);
    let anonymous = ExtendedFormatter::default();
    group.bench_function("extended_without_name", |b| {
        b.iter(|| black_box(anonymous.format(black_box(&unnamed))))
    });

    group.finish();
}

/// Dynamic dispatch as used by the run loop.
fn bench_boxed_formatter(c: &mut Criterion) {
    let mut group = c.benchmark_group("boxed_formatter");
    group.throughput(Throughput::Elements(1));

    let event = detection(Some("EmisoraBLE"));
    for format in [Format::Minimal, Format::Extended] {
        let formatter = format.formatter(Some("bike-3".to_string()));
        group.bench_function(format!("{format:?}").to_lowercase(), |b| {
            b.iter(|| black_box(formatter.format(black_box(&event))))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_formatters, bench_boxed_formatter);
criterion_main!(benches);
