//! Benchmarks for envelope validation.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

use conductor::contracts::{Envelope, ResultEnvelope, TaskEnvelope};
use conductor::testing::fixtures::task_envelope;

fn envelope_benchmark(c: &mut Criterion) {
    let task = task_envelope("p-bench", "build", "compiler");
    let task_json = task.to_json().unwrap_or_default();
    let result = ResultEnvelope::success(&task, "worker-1", json!({"binary": "app", "warnings": 3}));
    let result_text = serde_json::to_string(&result).unwrap_or_default();

    c.bench_function("task_validate", |b| b.iter(|| black_box(&task).validate()));

    c.bench_function("task_from_json", |b| {
        b.iter(|| TaskEnvelope::from_json(black_box(&task_json)))
    });

    c.bench_function("result_from_json_str", |b| {
        b.iter(|| ResultEnvelope::from_json_str(black_box(&result_text)))
    });
}

criterion_group!(benches, envelope_benchmark);
criterion_main!(benches);
