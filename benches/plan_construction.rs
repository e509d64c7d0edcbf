//! Plan construction benchmark
//!
//! Benchmarks the reverse-closure walk (§4.3) over catalogs of varying
//! width and depth, the one-time cost paid at `start_flow`.

use std::collections::BTreeMap;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use argyll::model::step::{AttributeSpec, AttributeType, HttpConfig, Step, StepId, StepType, WorkConfig};
use argyll::planner;

/// A chain `step_0 -> step_1 -> ... -> step_{n-1}`, each producing the
/// next's sole required input, with `step_0` requiring nothing.
fn chain_catalog(depth: usize) -> (BTreeMap<StepId, Step>, Vec<StepId>) {
    let mut catalog = BTreeMap::new();
    for i in 0..depth {
        let mut attributes = BTreeMap::new();
        if i > 0 {
            attributes.insert(format!("v{}", i - 1), AttributeSpec::required(AttributeType::String));
        }
        attributes.insert(format!("v{i}"), AttributeSpec::output(AttributeType::String));
        let id = format!("step_{i}");
        catalog.insert(
            id.clone(),
            Step {
                id: id.clone(),
                name: id.clone(),
                step_type: StepType::Sync {
                    http: HttpConfig {
                        endpoint: format!("http://localhost/{id}"),
                        timeout: std::time::Duration::from_secs(5),
                    },
                },
                attributes,
                predicate: None,
                work_config: WorkConfig::default(),
                memoizable: false,
                labels: BTreeMap::new(),
            },
        );
    }
    (catalog, vec![format!("step_{}", depth - 1)])
}

/// A catalog where every step is independent, all declared as goals, to
/// stress the closure's per-goal DFS fan-out rather than chain depth.
fn wide_catalog(width: usize) -> (BTreeMap<StepId, Step>, Vec<StepId>) {
    let mut catalog = BTreeMap::new();
    let mut goals = Vec::new();
    for i in 0..width {
        let mut attributes = BTreeMap::new();
        attributes.insert(format!("out{i}"), AttributeSpec::output(AttributeType::String));
        let id = format!("leaf_{i}");
        catalog.insert(
            id.clone(),
            Step {
                id: id.clone(),
                name: id.clone(),
                step_type: StepType::Sync {
                    http: HttpConfig {
                        endpoint: format!("http://localhost/{id}"),
                        timeout: std::time::Duration::from_secs(5),
                    },
                },
                attributes,
                predicate: None,
                work_config: WorkConfig::default(),
                memoizable: false,
                labels: BTreeMap::new(),
            },
        );
        goals.push(id);
    }
    (catalog, goals)
}

fn bench_chain_depth(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_construction/chain_depth");
    for depth in [8, 64, 512] {
        group.throughput(Throughput::Elements(depth as u64));
        group.bench_with_input(BenchmarkId::new("depth", depth), &depth, |b, &depth| {
            let (catalog, goals) = chain_catalog(depth);
            let init = BTreeMap::new();
            b.iter(|| planner::plan(&goals, &init, &catalog).unwrap());
        });
    }
    group.finish();
}

fn bench_wide_goal_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_construction/wide_goal_set");
    for width in [8, 64, 512] {
        group.throughput(Throughput::Elements(width as u64));
        group.bench_with_input(BenchmarkId::new("width", width), &width, |b, &width| {
            let (catalog, goals) = wide_catalog(width);
            let init = BTreeMap::new();
            b.iter(|| planner::plan(&goals, &init, &catalog).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_chain_depth, bench_wide_goal_set);
criterion_main!(benches);
