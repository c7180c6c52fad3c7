//! Benchmarks for protected reads over the in-memory store

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use resilient_cache::{CacheSystem, CacheSystemBuilder, MemoryStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

fn setup_system() -> (Arc<CacheSystem>, Runtime) {
    let rt = Runtime::new().unwrap_or_else(|_| panic!("Failed to create runtime"));
    let system = rt.block_on(async {
        CacheSystemBuilder::new()
            .namespace("bench")
            .with_store(Arc::new(MemoryStore::new()))
            .build()
            .await
            .unwrap_or_else(|_| panic!("Failed to create cache system"))
    });
    (Arc::new(system), rt)
}

/// Benchmark the hit path: one entity read over and over
fn bench_hit_path(c: &mut Criterion) {
    let (system, rt) = setup_system();
    rt.block_on(async {
        let _: Option<serde_json::Value> = system
            .get_entity("product", 1, || async { Ok(Some(json!({"price": 1999}))) })
            .await
            .unwrap_or_else(|_| panic!("Failed to seed"));
    });

    c.bench_function("protected_get_hit", |b| {
        b.to_async(&rt).iter(|| async {
            let value: Option<serde_json::Value> = system
                .get_entity("product", 1, || async { Ok(Some(json!({"price": 1999}))) })
                .await
                .unwrap_or_else(|_| panic!("Failed to read"));
            black_box(value)
        });
    });
}

/// Benchmark the miss path: every read is a fresh key that goes through the loader
fn bench_miss_path(c: &mut Criterion) {
    let (system, rt) = setup_system();

    c.bench_function("protected_get_miss", |b| {
        b.to_async(&rt).iter(|| async {
            let id = rand::random::<u64>();
            let value: Option<serde_json::Value> = system
                .get_entity("product", id, || async move { Ok(Some(json!({ "id": id }))) })
                .await
                .unwrap_or_else(|_| panic!("Failed to load"));
            black_box(value)
        });
    });
}

/// Benchmark collapsing: concurrent callers on one cold key
fn bench_collapsed_misses(c: &mut Criterion) {
    let (system, rt) = setup_system();
    let mut group = c.benchmark_group("collapsed_misses");

    for callers in &[10usize, 100] {
        group.bench_with_input(BenchmarkId::from_parameter(callers), callers, |b, &callers| {
            b.iter(|| {
                rt.block_on(async {
                    let key = system
                        .keys()
                        .entity("product", rand::random::<u32>())
                        .unwrap_or_else(|_| panic!("Failed to build key"));
                    let mut handles = Vec::with_capacity(callers);
                    for _ in 0..callers {
                        let system = Arc::clone(&system);
                        let key = key.clone();
                        handles.push(tokio::spawn(async move {
                            system
                                .shield()
                                .protected_get(&key, || async {
                                    tokio::time::sleep(Duration::from_millis(5)).await;
                                    Ok(Some(json!({"computed": true})))
                                })
                                .await
                                .unwrap_or_else(|_| panic!("Failed to compute"))
                        }));
                    }
                    for handle in handles {
                        black_box(handle.await.unwrap_or_else(|_| panic!("Task failed")));
                    }
                });
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_hit_path, bench_miss_path, bench_collapsed_misses);
criterion_main!(benches);
