//! Criterion benchmarks for controller line parsing and cell mapping.
//!
//! Every line read from the controller goes through `Response::parse`, and
//! the status poller parses a status report several times per second.
//!
//! Run with: cargo bench --bench response_parsing

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use gantry_motion::hardware::Response;
use gantry_motion::{CoordinateFrame, CoordinateTransformer, PhysicalPosition};

fn response_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("response_parse");

    let lines = [
        ("ok", "ok"),
        ("error", "error:22"),
        ("alarm", "ALARM:1"),
        ("status", "<Idle|MPos:125.000,275.500,0.000|FS:0,0>"),
        (
            "status_full",
            "<Run|MPos:12.345,67.890,-1.000|Bf:15,128|FS:2000,0|WCO:0.000,0.000,0.000>",
        ),
        ("feedback", "[MSG:'$H'|'$X' to unlock]"),
        ("welcome", "Grbl 1.1h ['$' for help]"),
    ];

    for (name, line) in lines {
        group.bench_with_input(BenchmarkId::new("parse", name), line, |b, line| {
            b.iter(|| Response::parse(black_box(line)));
        });
    }

    group.finish();
}

fn cell_mapping(c: &mut Criterion) {
    let frame = CoordinateFrame::new(400.0, 400.0, 8, 8, PhysicalPosition::ORIGIN).unwrap();
    let transformer = CoordinateTransformer::new(frame);

    c.bench_function("cell_to_physical", |b| {
        b.iter(|| {
            let cell = transformer.parse_cell_id(black_box("e4")).unwrap();
            transformer.to_physical(cell)
        });
    });

    c.bench_function("physical_to_cell", |b| {
        b.iter(|| transformer.to_logical(black_box(PhysicalPosition::new(212.0, 163.0))));
    });
}

criterion_group!(benches, response_parse, cell_mapping);
criterion_main!(benches);
