use criterion::{Criterion, black_box, criterion_group, criterion_main};
use rand::Rng;
use std::sync::Arc;
use typeahead::core::types::PhraseRecord;
use typeahead::{Config, Deadline, MemoryCache, MemoryStore, SuggestRequest, SuggestService};

/// Seeds a corpus of two-word phrases with zipf-ish counts.
fn seeded_service(phrases: usize) -> SuggestService {
    let words = [
        "weather", "recipe", "react", "rust", "python", "javascript", "news", "football",
        "crypto", "flight", "hotel", "pizza", "guitar", "camera", "laptop", "garden",
    ];
    let mut rng = rand::thread_rng();
    let store = MemoryStore::new();
    let now = chrono::Utc::now();
    store.seed((0..phrases).map(|i| {
        let a = words[rng.gen_range(0..words.len())];
        let b = words[rng.gen_range(0..words.len())];
        PhraseRecord::new(format!("{} {} {}", a, b, i), rng.gen_range(1..10_000), now)
    }));
    SuggestService::open(Arc::new(store), Arc::new(MemoryCache::new()), Config::default()).unwrap()
}

fn bench_suggest_uncached(c: &mut Criterion) {
    let service = seeded_service(50_000);
    c.bench_function("suggest_uncached_10k", |b| {
        b.iter(|| {
            // clearing the cache keeps every iteration on the index path
            service.clear_cache();
            let request = SuggestRequest::new("re", 10);
            black_box(service.suggest(&request, &Deadline::none()).unwrap())
        });
    });
}

fn bench_suggest_cached(c: &mut Criterion) {
    let service = seeded_service(50_000);
    let request = SuggestRequest::new("wea", 10);
    service.suggest(&request, &Deadline::none()).unwrap();
    c.bench_function("suggest_cached", |b| {
        b.iter(|| black_box(service.suggest(&request, &Deadline::none()).unwrap()));
    });
}

fn bench_suggest_fuzzy(c: &mut Criterion) {
    let service = seeded_service(50_000);
    c.bench_function("suggest_fuzzy", |b| {
        b.iter(|| {
            service.clear_cache();
            let request = SuggestRequest::new("wether", 10).with_fuzzy();
            black_box(service.suggest(&request, &Deadline::none()).unwrap())
        });
    });
}

criterion_group!(
    benches,
    bench_suggest_uncached,
    bench_suggest_cached,
    bench_suggest_fuzzy
);
criterion_main!(benches);
