//! Throughput benchmarks

use boardmon_core::core::framing::{parse_payload, DEFAULT_MAX_LINE_LEN};
use boardmon_core::core::pipeline::CaptureGroup;
use boardmon_core::{Direction, ExtractionRule, LineEnding, LineFramer, RawLine, Terminator, ValueSpec};
use bytes::Bytes;
use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::hint::black_box;
use uuid::Uuid;

fn telemetry(lines: usize) -> Vec<u8> {
    (0..lines)
        .flat_map(|i| format!("TEMP:{} HUM:{} heap={}\r\n", 20 + i % 10, 40 + i % 7, 100_000 + i).into_bytes())
        .collect()
}

fn framing_benchmark(c: &mut Criterion) {
    let data = telemetry(256);

    let mut group = c.benchmark_group("framing");
    group.throughput(Throughput::Bytes(data.len() as u64));

    for terminator in [Terminator::Auto, Terminator::CrLf] {
        group.bench_function(terminator.name(), |b| {
            b.iter(|| {
                let mut framer = LineFramer::new(terminator.clone(), DEFAULT_MAX_LINE_LEN);
                // Serial reads arrive in small chunks
                let lines: usize = black_box(&data).chunks(64).map(|chunk| framer.push(chunk).len()).sum();
                black_box(lines)
            })
        });
    }

    group.bench_function("hex_payload", |b| {
        b.iter(|| black_box(parse_payload(black_box("\\x DE AD BE EF 01 02 03 04"), LineEnding::None)))
    });

    group.finish();
}

fn extraction_benchmark(c: &mut Criterion) {
    let line = RawLine {
        session_id: Uuid::nil(),
        timestamp: chrono::Utc::now(),
        content: Bytes::from_static(b"TEMP:23 HUM:45 heap=101234"),
        direction: Direction::Inbound,
    };
    let json_line = RawLine {
        content: Bytes::from_static(br#"{"temp": 23.5, "hum": 45, "state": "ok"}"#),
        ..line.clone()
    };

    let number = ExtractionRule::number("temp", r"TEMP:(\d+)").unwrap();
    let miss = ExtractionRule::number("volts", r"VBAT:(\d+\.\d+)").unwrap();
    let key_value = ExtractionRule::number("", r"(\w+[:=]\d+(?: \w+[:=]\d+)*)")
        .unwrap()
        .with_value(ValueSpec::KeyValue {
            group: CaptureGroup::Index(1),
            pair_separator: ' ',
            kv_separator: ':',
        });
    let json = ExtractionRule::number("env", r"^\{.*\}$").unwrap().with_value(ValueSpec::Json {
        group: CaptureGroup::Index(0),
    });

    let mut group = c.benchmark_group("extraction");
    group.throughput(Throughput::Elements(1));

    group.bench_function("number", |b| b.iter(|| black_box(number.extract(black_box(&line)))));
    group.bench_function("no_match", |b| b.iter(|| black_box(miss.extract(black_box(&line)))));
    group.bench_function("key_value", |b| b.iter(|| black_box(key_value.extract(black_box(&line)))));
    group.bench_function("json", |b| b.iter(|| black_box(json.extract(black_box(&json_line)))));

    group.finish();
}

criterion_group!(benches, framing_benchmark, extraction_benchmark);
criterion_main!(benches);
