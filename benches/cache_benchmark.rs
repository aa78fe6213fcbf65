use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use tiered_cache::{
    CacheConfig, EngineConfig, HashMapStore, HashMapStoreConfig, InvalidationRule, L2Topology,
    RuleEngine, RuleSet, TieredCache, TieredCacheBuilder,
};
use tokio::runtime::Runtime;

mod common;
use common::{BenchConfig, BenchOrder, FakeDatabase, KeyGenerator};

/// The tier combinations compared in every group.
#[derive(Clone, Copy)]
enum Setup {
    L1Only,
    L1InProcessL2,
    L1Redis,
}

impl Setup {
    fn name(self) -> &'static str {
        match self {
            Setup::L1Only => "l1",
            Setup::L1InProcessL2 => "l1_hashmap",
            Setup::L1Redis => "l1_redis",
        }
    }

    fn enabled(config: &BenchConfig) -> Vec<Setup> {
        let mut setups = vec![Setup::L1Only, Setup::L1InProcessL2];
        if config.redis_url.is_some() {
            setups.push(Setup::L1Redis);
        }
        setups
    }
}

async fn setup(kind: Setup, config: &BenchConfig) -> TieredCache<BenchOrder> {
    let mut cache_config = CacheConfig::default();
    cache_config.l1.memory_budget_bytes = 64 * 1024 * 1024;

    let builder = match kind {
        Setup::L1Only => TieredCacheBuilder::new(cache_config),
        Setup::L1InProcessL2 => TieredCacheBuilder::new(cache_config)
            .remote_store(Arc::new(HashMapStore::new(HashMapStoreConfig::default()))),
        Setup::L1Redis => {
            cache_config.l2.enabled = true;
            cache_config.l2.key_prefix = "bench".into();
            if let Some(url) = &config.redis_url {
                cache_config.l2.topology = L2Topology::Standalone { url: url.clone() };
            }
            TieredCacheBuilder::new(cache_config)
        }
    };

    builder.build().await.expect("cache config is valid")
}

async fn populate(cache: &TieredCache<BenchOrder>, db: &FakeDatabase, keys: &[String]) {
    for key in keys {
        let _ = cache.get_or_load(key, || db.load(key)).await;
    }
}

/// Benchmark 1: Hot Cache (all L1 hits)
fn bench_hot_cache(c: &mut Criterion, config: &BenchConfig) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("hot_cache");
    group.sample_size(config.sample_size);
    group.throughput(Throughput::Elements(config.num_keys as u64));

    let db = FakeDatabase::new(config.num_keys, 0);
    let keys = KeyGenerator::new(config.num_keys).sequential();

    for kind in Setup::enabled(config) {
        group.bench_function(kind.name(), |b| {
            let cache = rt.block_on(setup(kind, config));
            rt.block_on(populate(&cache, &db, &keys));

            b.to_async(&rt).iter(|| async {
                for key in &keys {
                    black_box(cache.get(key).await);
                }
            });
        });
    }

    group.finish();
}

/// Benchmark 2: Cold Cache (every read goes to the loader)
fn bench_cold_cache(c: &mut Criterion, config: &BenchConfig) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("cold_cache");
    group.sample_size(config.sample_size.min(20)); // Fewer samples due to origin latency

    let db = FakeDatabase::new(config.num_keys, config.db_latency_ms);
    let keys: Vec<String> = KeyGenerator::new(config.num_keys)
        .sequential()
        .into_iter()
        .take(100)
        .collect();
    group.throughput(Throughput::Elements(keys.len() as u64));

    for kind in Setup::enabled(config) {
        group.bench_function(kind.name(), |b| {
            b.to_async(&rt).iter(|| async {
                let cache = setup(kind, config).await;
                let loads = keys.iter().map(|key| cache.get_or_load(key, || db.load(key)));
                black_box(futures::future::join_all(loads).await);
                cache.clear().await.unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark 3: Skewed workload over a partially warm cache
fn bench_mixed_workload(c: &mut Criterion, config: &BenchConfig) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("mixed_workload");
    group.sample_size(config.sample_size.min(50));

    let db = FakeDatabase::new(config.num_keys, config.db_latency_ms);
    let generator = KeyGenerator::new(config.num_keys);
    let warm: Vec<String> = generator.sequential().into_iter().take(config.num_keys / 5).collect();
    let requests = generator.skewed(1_000);
    group.throughput(Throughput::Elements(requests.len() as u64));

    for kind in Setup::enabled(config) {
        group.bench_function(kind.name(), |b| {
            let cache = rt.block_on(setup(kind, config));
            rt.block_on(populate(&cache, &db, &warm));

            b.to_async(&rt).iter(|| async {
                for key in &requests {
                    black_box(cache.get_or_load(key, || db.load(key)).await.ok());
                }
            });
        });
    }

    group.finish();
}

/// Benchmark 4: Rule-driven invalidation with cascade
fn bench_invalidation(c: &mut Criterion, config: &BenchConfig) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("invalidation");
    group.sample_size(config.sample_size);

    let db = FakeDatabase::new(config.num_keys, 0);
    let keys = KeyGenerator::new(config.num_keys).sequential();

    for fanout in [1usize, 4, 16] {
        group.bench_with_input(BenchmarkId::new("cascade", fanout), &fanout, |b, &fanout| {
            let cache = rt.block_on(setup(Setup::L1InProcessL2, config));
            rt.block_on(populate(&cache, &db, &keys));

            let dependents: Vec<String> = (0..fanout).map(|i| format!("view{}", i)).collect();
            let mut rules = vec![InvalidationRule {
                dependencies: dependents.clone(),
                ..InvalidationRule::new("order", &["order:*", "order:user:*"])
            }];
            rules.extend(
                dependents
                    .iter()
                    .map(|entity| InvalidationRule::new(entity.as_str(), &[format!("{}:*", entity).as_str()])),
            );
            let engine = RuleEngine::new(
                RuleSet::new(rules).unwrap(),
                Arc::new(cache.clone()),
                EngineConfig::default(),
            );

            let mut next = 0usize;
            b.to_async(&rt).iter(|| {
                next = (next + 1) % keys.len();
                let id = next.to_string();
                let engine = engine.clone();
                async move { black_box(engine.manual_invalidate("order", Some(id.as_str()), None).await) }
            });
        });
    }

    group.finish();
}

fn run_benchmarks(c: &mut Criterion) {
    let config = BenchConfig::new();

    bench_hot_cache(c, &config);
    bench_cold_cache(c, &config);
    bench_mixed_workload(c, &config);
    bench_invalidation(c, &config);
}

criterion_group!(benches, run_benchmarks);
criterion_main!(benches);
