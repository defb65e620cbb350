//! Benchmarks for period arithmetic and ledger scans.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use periodflow::download::ProgressLedger;
use periodflow::period::PeriodLabel;

fn period_benchmark(c: &mut Criterion) {
    c.bench_function("period_parse", |b| {
        b.iter(|| black_box("202509B").parse::<PeriodLabel>())
    });

    let start: PeriodLabel = "202001A".parse().unwrap();
    c.bench_function("period_advance", |b| {
        b.iter(|| black_box(start).advance(black_box(-137)))
    });
}

fn ledger_benchmark(c: &mut Criterion) {
    let start: PeriodLabel = "202401A".parse().unwrap();
    let periods = PeriodLabel::range(start, 24);
    let entities: Vec<String> = (0..500).map(|i| format!("store-{i}")).collect();

    let mut ledger = ProgressLedger::new();
    ledger.seed(entities.iter().map(String::as_str), &periods);

    c.bench_function("ledger_work_remaining", |b| {
        b.iter(|| black_box(&ledger).work_remaining(3).len())
    });
}

criterion_group!(benches, period_benchmark, ledger_benchmark);
criterion_main!(benches);
