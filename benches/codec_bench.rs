//! Throughput of the serial codecs and state machines.
//!
//! A reader in continuous mode sends a 19-byte line per tag and a balance
//! batch is a handful of short numeric lines, so these numbers only need to
//! stay far above 9600 baud. They mostly catch accidental quadratic
//! buffering.
//!
//! Run benchmarks with:
//! ```sh
//! cargo bench --bench codec_bench
//! ```

use bytes::BytesMut;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use tokio::time::Instant;
use tokio_util::codec::Decoder;
use weigh_core::{BalanceCommand, CalibrationState, DeviceConfig, ReaderCommand};
use weigh_protocol::{BalanceCodec, DeviceProtocol, ReaderCodec};

const TAG_LINE: &[u8] = b"Z5A2080A70C2C0001\r\n";

fn tag_stream(tags: usize) -> Vec<u8> {
    TAG_LINE.repeat(tags)
}

fn reading_stream(readings: usize) -> Vec<u8> {
    (0..readings)
        .flat_map(|i| format!("{}\r\n", 100_000 + i).into_bytes())
        .collect()
}

fn bench_reader_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("reader_decode");

    for tags in [10, 100, 1000] {
        let input = tag_stream(tags);
        group.throughput(Throughput::Bytes(input.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(tags), &input, |b, input| {
            b.iter(|| {
                let mut codec = ReaderCodec::new();
                let mut buffer = BytesMut::from(&input[..]);
                while let Some(unit) = codec.decode(&mut buffer).unwrap() {
                    black_box(unit);
                }
            });
        });
    }

    group.finish();
}

fn bench_balance_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("balance_decode");

    for readings in [10, 100, 1000] {
        let input = reading_stream(readings);
        group.throughput(Throughput::Elements(readings as u64));
        group.bench_with_input(BenchmarkId::from_parameter(readings), &input, |b, input| {
            b.iter(|| {
                let mut codec = BalanceCodec::default();
                let mut buffer = BytesMut::from(&input[..]);
                while let Some(unit) = codec.decode(&mut buffer).unwrap() {
                    black_box(unit);
                }
            });
        });
    }

    group.finish();
}

fn bench_reader_machine(c: &mut Criterion) {
    let mut group = c.benchmark_group("reader_machine");
    let config = DeviceConfig::reader("rfid-1", "/dev/null");
    let input = tag_stream(100);
    group.throughput(Throughput::Elements(100));

    group.bench_function("tags_100", |b| {
        b.iter(|| {
            let now = Instant::now();
            let mut machine = DeviceProtocol::for_config(&config, None);
            machine.issue(ReaderCommand::Start.into(), now).unwrap();
            let mut codec = DeviceProtocol::codec_for(&config);
            let mut buffer = BytesMut::from(&input[..]);
            while let Some(unit) = codec.decode(&mut buffer).unwrap() {
                black_box(machine.consume_frame(unit, now));
            }
        });
    });

    group.finish();
}

fn bench_balance_machine(c: &mut Criterion) {
    let mut group = c.benchmark_group("balance_machine");
    let config = DeviceConfig::balance("balance-1", "/dev/null")
        .with_calibration(CalibrationState::new(100_000, Some(0.01)));
    let input = reading_stream(100);
    group.throughput(Throughput::Elements(100));

    group.bench_function("readings_100", |b| {
        b.iter(|| {
            let now = Instant::now();
            let mut machine = DeviceProtocol::for_config(&config, None);
            machine.issue(BalanceCommand::Readings(100).into(), now).unwrap();
            let mut codec = DeviceProtocol::codec_for(&config);
            let mut buffer = BytesMut::from(&input[..]);
            while let Some(unit) = codec.decode(&mut buffer).unwrap() {
                black_box(machine.consume_frame(unit, now));
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_reader_decode,
    bench_balance_decode,
    bench_reader_machine,
    bench_balance_machine
);
criterion_main!(benches);
