//! Memo key hashing benchmark
//!
//! Benchmarks `memo::memo_key` (§4.4): canonicalization plus the two
//! SHA256 digests computed on every memoizable work item before dispatch.

use std::collections::BTreeMap;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;

use argyll::memo::memo_key;
use argyll::model::step::{AttributeSpec, AttributeType, HttpConfig, Step, StepType, WorkConfig};

fn memoizable_step(input_count: usize) -> Step {
    let mut attributes = BTreeMap::new();
    for i in 0..input_count {
        attributes.insert(format!("in{i}"), AttributeSpec::required(AttributeType::String));
    }
    attributes.insert("out".to_string(), AttributeSpec::output(AttributeType::String));
    Step {
        id: "memoized".to_string(),
        name: "memoized".to_string(),
        step_type: StepType::Sync {
            http: HttpConfig {
                endpoint: "http://localhost/memoized".to_string(),
                timeout: std::time::Duration::from_secs(5),
            },
        },
        attributes,
        predicate: None,
        work_config: WorkConfig::default(),
        memoizable: true,
        labels: BTreeMap::new(),
    }
}

fn flat_inputs(count: usize) -> BTreeMap<String, serde_json::Value> {
    (0..count).map(|i| (format!("in{i}"), json!(format!("value-{i}")))).collect()
}

fn nested_inputs(count: usize) -> BTreeMap<String, serde_json::Value> {
    (0..count)
        .map(|i| {
            (
                format!("in{i}"),
                json!({
                    "id": i,
                    "tags": ["a", "b", "c"],
                    "nested": { "depth": i, "ratio": i as f64 / 3.0 },
                }),
            )
        })
        .collect()
}

fn bench_flat_inputs(c: &mut Criterion) {
    let mut group = c.benchmark_group("memo_hashing/flat_inputs");
    for count in [1, 8, 64] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("attrs", count), &count, |b, &count| {
            let step = memoizable_step(count);
            let inputs = flat_inputs(count);
            b.iter(|| memo_key(&step, &inputs));
        });
    }
    group.finish();
}

fn bench_nested_inputs(c: &mut Criterion) {
    let mut group = c.benchmark_group("memo_hashing/nested_inputs");
    for count in [1, 8, 64] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("attrs", count), &count, |b, &count| {
            let step = memoizable_step(count);
            let inputs = nested_inputs(count);
            b.iter(|| memo_key(&step, &inputs));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_flat_inputs, bench_nested_inputs);
criterion_main!(benches);
