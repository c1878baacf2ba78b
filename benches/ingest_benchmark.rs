use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use typeahead::{Config, MemoryCache, MemoryStore, SuggestService};

fn bench_log_search(c: &mut Criterion) {
    let service = SuggestService::open(
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryCache::new()),
        Config::default(),
    )
    .unwrap();

    c.bench_function("log_search", |b| {
        let mut i = 0u64;
        b.iter(|| {
            service.log_search(black_box(&format!("query {}", i % 1000)), None, None);
            i += 1;
        });
    });
}

fn bench_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("flush");
    for events in [100usize, 500, 2_000] {
        group.bench_with_input(BenchmarkId::from_parameter(events), &events, |b, &events| {
            let service = SuggestService::open(
                Arc::new(MemoryStore::new()),
                Arc::new(MemoryCache::new()),
                Config::default(),
            )
            .unwrap();
            b.iter(|| {
                for i in 0..events {
                    service.log_search(&format!("query {}", i % 50), None, None);
                }
                service.flush_now().unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_log_search, bench_flush);
criterion_main!(benches);
