//! Pipeline Benchmarks
//!
//! Pure stages only: canonicalization, result reshaping and canonical JSON
//! hashing. Query evaluation and template rendering are dominated by the
//! underlying engines and are not measured here.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use ggen_sync::codegen::canonicalize::{CanonicalRules, canonicalize};
use ggen_sync::codegen::hash;
use ggen_sync::sparql::{BindingValue, GroupSpec, Row, RowSet, reshape};

fn generated_source(lines: usize) -> Vec<u8> {
    let mut out = String::new();
    for i in 0..lines {
        out.push_str(&format!("    pub field_{i}: String,   \r\n"));
        if i % 10 == 0 {
            out.push_str("\r\n\r\n");
        }
    }
    out.into_bytes()
}

fn command_rows(commands: usize, args_per_command: usize) -> RowSet {
    let text = |value: String| BindingValue::String {
        value,
        language: None,
    };
    let mut rows = Vec::with_capacity(commands * args_per_command);
    for c in 0..commands {
        for a in 0..args_per_command {
            let mut row = Row::new();
            row.insert("command".into(), text(format!("command_{c:04}")));
            row.insert("arg".into(), text(format!("arg_{a:02}")));
            row.insert("type".into(), text("Path".to_string()));
            rows.push(row);
        }
    }
    RowSet {
        variables: vec!["command".into(), "arg".into(), "type".into()],
        rows,
    }
}

fn bench_canonicalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("canonicalize");
    let rules = CanonicalRules::default();
    for lines in [100, 1_000, 10_000] {
        let raw = generated_source(lines);
        group.bench_with_input(BenchmarkId::from_parameter(lines), &raw, |b, raw| {
            b.iter(|| canonicalize(black_box(raw), &rules))
        });
    }
    group.finish();
}

fn bench_reshape(c: &mut Criterion) {
    let mut group = c.benchmark_group("reshape");
    let spec = GroupSpec::new("command").with_children("args", &["arg", "type"]);
    for commands in [10, 100, 1_000] {
        let rows = command_rows(commands, 5);
        group.bench_with_input(BenchmarkId::new("grouped", commands), &rows, |b, rows| {
            b.iter(|| reshape(black_box(rows), Some(&spec), "bench.rq"))
        });
        group.bench_with_input(BenchmarkId::new("flat", commands), &rows, |b, rows| {
            b.iter(|| reshape(black_box(rows), None, "bench.rq"))
        });
    }
    group.finish();
}

fn bench_record_hash(c: &mut Criterion) {
    let spec = GroupSpec::new("command").with_children("args", &["arg", "type"]);
    let record = reshape(&command_rows(200, 5), Some(&spec), "bench.rq").unwrap_or_default();
    c.bench_function("hash_canonical_json/200_commands", |b| {
        b.iter(|| hash::hash_canonical_json(black_box(&record)))
    });
}

criterion_group!(benches, bench_canonicalize, bench_reshape, bench_record_hash);
criterion_main!(benches);
